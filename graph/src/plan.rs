//! The pure compile pipeline.
//!
//! `plan` consumes pass declarations and produces an execution plan:
//! instantiation, setup capture, validation, dependency edges, topological
//! order, pass culling, physical-copy assignment, memory aliasing and
//! barrier synthesis. Nothing here touches a device; the realize step in
//! `exec` allocates what the plan calls for.

use std::collections::HashMap;

use kiln_core::{CompileError, FRAMES_IN_FLIGHT};

use crate::barrier::{BarrierPlan, CopyClass, QueueTransfer, ResourceState};
use crate::decl::{PassDecl, PassScope, PassSetup, QueueClass, ScopeIndex, SetupTable};
use crate::res::{FrameOffset, ResourceDesc, ResourceType, Usage};

/// Inputs that determine instantiation: how many camera and light instances
/// each scoped declaration expands to, and whether compute passes may run
/// on a dedicated queue.
#[derive(Clone, Copy, Debug, Default)]
pub struct CompileContext {
    /// Active cameras.
    pub camera_count: u32,
    /// Shadow-casting lights (slot count).
    pub light_count: u32,
    /// Allow scheduling compute passes on the async compute queue.
    pub async_compute: bool,
}

/// One scheduled pass instance.
#[derive(Debug)]
pub struct PlannedPass {
    /// Scope-qualified instance name.
    pub name: String,
    /// Index of the source declaration.
    pub decl_index: usize,
    /// Instantiation scope.
    pub scope: PassScope,
    /// Camera/light index within the scope.
    pub scope_index: u32,
    /// Declared queue class.
    pub queue: QueueClass,
    /// Queue the executor actually records on. A compute pass that
    /// consumes same-frame graphics output stays on the graphics queue.
    pub effective_queue: QueueClass,
    /// Barriers emitted before the pass.
    pub barriers: Vec<BarrierPlan>,
}

/// A planned logical resource.
#[derive(Debug)]
pub struct PlannedResource {
    /// Scope-qualified name.
    pub name: String,
    /// Kind.
    pub ty: ResourceType,
    /// Description; `None` for externals.
    pub desc: Option<ResourceDesc>,
    /// Owned outside the graph, bound per frame.
    pub external: bool,
    /// Subresource shape for external textures.
    pub external_info: crate::res::ExternalInfo,
    /// External that must end the frame in PRESENT_SRC.
    pub present: bool,
    /// Physical copies: FRAMES_IN_FLIGHT when any usage has a non-CURRENT
    /// offset, 1 otherwise.
    pub copies: u32,
    /// Physical slot (aliased allocation) for transients.
    pub slot: Option<u32>,
}

/// A physical allocation shared by one or more disjoint-lifetime transients.
#[derive(Debug)]
pub struct PhysicalSlot {
    /// Allocation description.
    pub desc: ResourceDesc,
    /// Copies to allocate.
    pub copies: u32,
    /// Logical resources sharing this slot.
    pub resources: Vec<u32>,
}

/// Compiled execution plan.
#[derive(Debug)]
pub struct Plan {
    /// Alive passes in topological order.
    pub passes: Vec<PlannedPass>,
    /// All logical resources.
    pub resources: Vec<PlannedResource>,
    /// Physical allocations.
    pub slots: Vec<PhysicalSlot>,
    /// Same-frame dependency edges between schedule positions.
    pub edges: Vec<(usize, usize)>,
    /// Queue-ownership transfers between passes on different queues.
    pub transfers: Vec<QueueTransfer>,
    /// Barriers emitted after a pass (present transitions).
    pub post_barriers: Vec<(usize, BarrierPlan)>,
    /// Whether any edge crosses the two queues (a semaphore is required).
    pub has_cross_queue_edge: bool,
}

impl Plan {
    /// Find a resource index by scope-qualified name.
    pub fn resource_index(&self, name: &str) -> Option<u32> {
        self.resources
            .iter()
            .position(|resource| resource.name == name)
            .map(|index| index as u32)
    }

    /// Find a pass's schedule position by instance name.
    pub fn pass_position(&self, name: &str) -> Option<usize> {
        self.passes.iter().position(|pass| pass.name == name)
    }
}

struct Instance {
    decl_index: usize,
    name: String,
    scope: ScopeIndex,
    queue: QueueClass,
}

/// Compile declarations into a `Plan`.
///
/// Fails fast on the first violated invariant: dangling reads, type or
/// queue mismatches, cycles, and impossible aliasing.
pub fn plan<T: ?Sized>(
    decls: &[PassDecl<T>],
    ctx: &CompileContext,
    aux: &mut T,
) -> Result<Plan, CompileError> {
    // 1. Instantiation: clone scoped declarations per camera / per light,
    //    dropping disabled declarations.
    let mut instances = Vec::new();
    for (decl_index, decl) in decls.iter().enumerate() {
        if !decl.enabled {
            continue;
        }
        let count = match decl.scope {
            PassScope::Global => 1,
            PassScope::PerCamera => ctx.camera_count,
            PassScope::PerLight => ctx.light_count,
        };
        for index in 0..count {
            let scope = ScopeIndex {
                scope: decl.scope,
                index,
            };
            instances.push(Instance {
                decl_index,
                name: scope.qualify(&decl.name),
                scope,
                queue: decl.queue,
            });
        }
    }
    log::trace!("graph: {} pass instances", instances.len());

    // 2. Setup capture.
    let mut table = SetupTable::default();
    for (position, instance) in instances.iter().enumerate() {
        let mut setup = PassSetup {
            table: &mut table,
            pass: position,
            pass_name: instance.name.clone(),
            scope: instance.scope,
            queue: instance.queue,
        };
        (decls[instance.decl_index].setup.clone())(&mut setup, aux);
    }
    if let Some(error) = table.errors.into_iter().next() {
        return Err(error);
    }

    // 3. Validation of reads + dependency edges. Edges exist only between
    //    same-frame-offset usages; a NEXT write and a CURRENT read touch
    //    different physical copies and stay unordered.
    let producers = &table.producers;
    let find_producer = |resource: u32, version: u32| {
        producers
            .iter()
            .find(|&&(res, ver, _, _)| res == resource && ver == version)
            .map(|&(_, _, offset, pass)| (offset, pass))
    };

    let mut edges: Vec<(usize, usize)> = Vec::new();
    for usage in &table.usages {
        let resource = &table.resources[usage.resource as usize];
        match find_producer(usage.resource, usage.version) {
            Some((producer_offset, producer_pass)) => {
                if producer_offset == usage.offset && producer_pass != usage.pass {
                    edges.push((producer_pass, usage.pass));
                }
            }
            None => {
                if !resource.external {
                    return Err(CompileError::DanglingRead {
                        pass: instances[usage.pass].name.clone(),
                        resource: resource.name.clone(),
                    });
                }
            }
        }
        if usage.write {
            // Anti-dependency: readers of the consumed version run first.
            for reader in table.usages.iter().filter(|other| {
                !other.write
                    && other.resource == usage.resource
                    && other.version == usage.version
                    && other.offset == usage.offset
                    && other.pass != usage.pass
            }) {
                edges.push((reader.pass, usage.pass));
            }
        }
    }
    edges.sort_unstable();
    edges.dedup();

    // 4. Topological order (Kahn). Ready passes are taken lowest-index
    //    first so the schedule is deterministic.
    let order = kahn_order(instances.len(), &edges).map_err(|unresolved| {
        CompileError::CyclicGraph {
            unresolved: unresolved
                .into_iter()
                .map(|position| instances[position].name.clone())
                .collect(),
        }
    })?;

    // 5. Pass culling. Roots: passes writing an external (the swapchain
    //    sink) and passes writing a non-CURRENT offset; those feed the
    //    next frame, which the edge set cannot see.
    let mut alive = vec![false; instances.len()];
    let mut stack = Vec::new();
    for usage in &table.usages {
        if usage.write {
            let resource = &table.resources[usage.resource as usize];
            if resource.external || usage.offset != FrameOffset::Current {
                if !alive[usage.pass] {
                    alive[usage.pass] = true;
                    stack.push(usage.pass);
                }
            }
        }
    }
    let mut reverse: HashMap<usize, Vec<usize>> = HashMap::new();
    for &(from, to) in &edges {
        reverse.entry(to).or_default().push(from);
    }
    while let Some(position) = stack.pop() {
        if let Some(parents) = reverse.get(&position) {
            for &parent in parents {
                if !alive[parent] {
                    alive[parent] = true;
                    stack.push(parent);
                }
            }
        }
    }
    let culled = alive.iter().filter(|&&keep| !keep).count();
    if culled > 0 {
        log::debug!("graph: culled {culled} pass instances with unconsumed outputs");
    }

    // Schedule = topological order filtered to alive passes.
    let schedule: Vec<usize> = order.into_iter().filter(|&p| alive[p]).collect();
    let position_of: HashMap<usize, usize> = schedule
        .iter()
        .enumerate()
        .map(|(slot, &instance)| (instance, slot))
        .collect();

    // 6. Physical copies. Usages of culled passes no longer count.
    let live_usages: Vec<&Usage> = table
        .usages
        .iter()
        .filter(|usage| alive[usage.pass])
        .collect();

    let mut resources: Vec<PlannedResource> = table
        .resources
        .iter()
        .map(|resource| PlannedResource {
            name: resource.name.clone(),
            ty: resource.ty,
            desc: resource.desc,
            external: resource.external,
            external_info: resource.external_info,
            present: resource.present,
            copies: 1,
            slot: None,
        })
        .collect();
    for usage in &live_usages {
        if usage.offset != FrameOffset::Current {
            resources[usage.resource as usize].copies = FRAMES_IN_FLIGHT as u32;
        }
    }

    // 7. Memory aliasing. Single-copy transients with identical
    //    descriptions and disjoint pass-lifetime ranges share a slot.
    //    Double-buffered resources live across frames and are never
    //    aliased; externals are not allocated at all.
    let mut lifetime: HashMap<u32, (usize, usize)> = HashMap::new();
    for usage in &live_usages {
        let position = position_of[&usage.pass];
        let entry = lifetime
            .entry(usage.resource)
            .or_insert((position, position));
        entry.0 = entry.0.min(position);
        entry.1 = entry.1.max(position);
    }

    let mut slots: Vec<PhysicalSlot> = Vec::new();
    let mut slot_free_at: Vec<usize> = Vec::new();
    let mut alias_order: Vec<u32> = resources
        .iter()
        .enumerate()
        .filter(|(index, resource)| {
            !resource.external && resource.desc.is_some() && lifetime.contains_key(&(*index as u32))
        })
        .map(|(index, _)| index as u32)
        .collect();
    alias_order.sort_by_key(|index| lifetime[index].0);

    for index in alias_order {
        let (first, last) = lifetime[&index];
        let desc = resources[index as usize].desc.expect("transient has desc");
        if degenerate(&desc) {
            return Err(CompileError::AliasingFailed {
                resource: resources[index as usize].name.clone(),
            });
        }
        let copies = resources[index as usize].copies;
        let mut slot = None;
        if copies == 1 {
            for (slot_index, candidate) in slots.iter().enumerate() {
                if candidate.copies == 1 && candidate.desc == desc && slot_free_at[slot_index] < first
                {
                    slot = Some(slot_index as u32);
                    break;
                }
            }
        }
        match slot {
            Some(slot) => {
                slots[slot as usize].resources.push(index);
                slot_free_at[slot as usize] = last;
                resources[index as usize].slot = Some(slot);
            }
            None => {
                let slot = slots.len() as u32;
                slots.push(PhysicalSlot {
                    desc,
                    copies,
                    resources: vec![index],
                });
                slot_free_at.push(last);
                resources[index as usize].slot = Some(slot);
            }
        }
    }

    // 8. Effective queues. A declared-compute pass runs on the async queue
    //    only when that is enabled and nothing it consumes was produced by
    //    a same-frame graphics pass (the pyramid build reads this frame's
    //    depth, so it stays on graphics).
    let mut effective: Vec<QueueClass> = Vec::with_capacity(schedule.len());
    for &instance in &schedule {
        let declared = instances[instance].queue;
        let queue = match declared {
            QueueClass::Graphics => QueueClass::Graphics,
            QueueClass::Compute => {
                if !ctx.async_compute {
                    QueueClass::Graphics
                } else {
                    let fed_by_graphics = edges.iter().any(|&(from, to)| {
                        to == instance && instances[from].queue == QueueClass::Graphics
                    });
                    if fed_by_graphics {
                        QueueClass::Graphics
                    } else {
                        QueueClass::Compute
                    }
                }
            }
        };
        effective.push(queue);
    }

    // Reindex edges onto schedule positions.
    let schedule_edges: Vec<(usize, usize)> = edges
        .iter()
        .filter_map(|&(from, to)| {
            match (position_of.get(&from), position_of.get(&to)) {
                (Some(&from), Some(&to)) => Some((from, to)),
                _ => None,
            }
        })
        .collect();

    let has_cross_queue_edge = schedule_edges
        .iter()
        .any(|&(from, to)| effective[from] != effective[to]);

    // 9. Barrier synthesis. Every physical copy of a resource carries a
    //    state chain; chains are walked in schedule order and wrap around
    //    to the previous frame for the first use, which becomes a
    //    memory-only temporal barrier (or a discard for transients whose
    //    contents do not survive the frame).
    let mut passes: Vec<PlannedPass> = schedule
        .iter()
        .zip(&effective)
        .map(|(&instance, &queue)| PlannedPass {
            name: instances[instance].name.clone(),
            decl_index: instances[instance].decl_index,
            scope: instances[instance].scope.scope,
            scope_index: instances[instance].scope.index,
            queue: instances[instance].queue,
            effective_queue: queue,
            barriers: Vec::new(),
        })
        .collect();
    let mut post_barriers: Vec<(usize, BarrierPlan)> = Vec::new();
    let mut transfers: Vec<QueueTransfer> = Vec::new();

    for (res_index, resource) in resources.iter().enumerate() {
        let res_index = res_index as u32;
        let is_image = resource.ty != ResourceType::Buffer;
        let preserved = resource.copies > 1 || (resource.external && !resource.present);

        // Chain per copy class: CURRENT usages touch this frame's copy,
        // PREV/NEXT usages the other (FRAMES_IN_FLIGHT = 2). One physical
        // copy alternates between the two chains on consecutive frames, so
        // each chain wraps around to the OTHER chain's final state.
        let chain_of = |copy: CopyClass| {
            let mut chain: Vec<(usize, Usage)> = live_usages
                .iter()
                .filter(|usage| {
                    usage.resource == res_index
                        && match copy {
                            CopyClass::Current => usage.offset == FrameOffset::Current,
                            CopyClass::Other => usage.offset != FrameOffset::Current,
                        }
                })
                .map(|usage| (position_of[&usage.pass], **usage))
                .collect();
            chain.sort_by_key(|&(position, _)| position);
            chain
        };
        let chains = [chain_of(CopyClass::Current), chain_of(CopyClass::Other)];
        let final_state = |chain: &[(usize, Usage)]| {
            chain
                .last()
                .map(|&(_, usage)| (usage.state, usage.write))
        };

        for (which, copy) in [CopyClass::Current, CopyClass::Other].into_iter().enumerate() {
            let chain = &chains[which];
            if chain.is_empty() {
                continue;
            }
            // The same copy carried the opposite chain one frame earlier.
            let wrap = final_state(&chains[1 - which]).or_else(|| final_state(chain));

            let mut previous: Option<(usize, ResourceState, bool)> = None;
            for &(position, usage) in chain {
                let dst = usage.state;
                match previous {
                    None => {
                        let (src, src_write, temporal, discard) = if preserved {
                            // Content written one frame ago survives; the
                            // fence already orders execution.
                            let (state, write) = wrap.expect("chain is non-empty");
                            (state, write, true, false)
                        } else {
                            (ResourceState::undefined(), false, false, true)
                        };
                        if src != dst || src_write || usage.write || !is_image {
                            passes[position].barriers.push(BarrierPlan {
                                resource: res_index,
                                copy,
                                src,
                                dst,
                                temporal,
                                discard: discard && is_image,
                            });
                        }
                    }
                    Some((prev_position, src, prev_write)) => {
                        let hazard = usage.write || prev_write;
                        if (src != dst || hazard) && prev_position != position {
                            passes[position].barriers.push(BarrierPlan {
                                resource: res_index,
                                copy,
                                src,
                                dst,
                                temporal: false,
                                discard: false,
                            });
                            // Cross-queue consumption needs an ownership
                            // transfer when the families differ.
                            if passes[prev_position].effective_queue
                                != passes[position].effective_queue
                            {
                                transfers.push(QueueTransfer {
                                    resource: res_index,
                                    copy,
                                    release_after: prev_position,
                                    acquire_before: position,
                                    src,
                                    dst,
                                });
                            }
                        }
                    }
                }
                // Merge same-pass multi-usage states conservatively.
                let merged = match previous {
                    Some((prev_position, prev_state, prev_write)) if prev_position == position => (
                        position,
                        ResourceState {
                            stage: prev_state.stage | dst.stage,
                            access: prev_state.access | dst.access,
                            layout: dst.layout,
                        },
                        prev_write || usage.write,
                    ),
                    _ => (position, dst, usage.write),
                };
                previous = Some(merged);
            }

            // Presentable externals leave their last pass in PRESENT_SRC.
            if resource.present {
                if let Some((position, src, _)) = previous {
                    post_barriers.push((
                        position,
                        BarrierPlan {
                            resource: res_index,
                            copy,
                            src,
                            dst: ResourceState {
                                stage: ash::vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                                access: ash::vk::AccessFlags::empty(),
                                layout: ash::vk::ImageLayout::PRESENT_SRC_KHR,
                            },
                            temporal: false,
                            discard: false,
                        },
                    ));
                }
            }
        }
    }

    log::debug!(
        "graph: compiled {} passes, {} resources, {} slots, {} edges",
        passes.len(),
        resources.len(),
        slots.len(),
        schedule_edges.len()
    );

    Ok(Plan {
        passes,
        resources,
        slots,
        edges: schedule_edges,
        transfers,
        post_barriers,
        has_cross_queue_edge,
    })
}

fn degenerate(desc: &ResourceDesc) -> bool {
    match desc {
        ResourceDesc::Texture2D(texture) | ResourceDesc::TextureCube(texture) => {
            texture.width == 0 || texture.height == 0
        }
        ResourceDesc::Buffer(buffer) => buffer.size == 0,
    }
}

fn kahn_order(count: usize, edges: &[(usize, usize)]) -> Result<Vec<usize>, Vec<usize>> {
    let mut incoming = vec![0usize; count];
    let mut outgoing: HashMap<usize, Vec<usize>> = HashMap::new();
    for &(from, to) in edges {
        incoming[to] += 1;
        outgoing.entry(from).or_default().push(to);
    }

    let mut ready: Vec<usize> = (0..count).filter(|&p| incoming[p] == 0).collect();
    let mut order = Vec::with_capacity(count);
    while !ready.is_empty() {
        // Lowest declaration order first: deterministic schedules.
        let (slot, &position) = ready
            .iter()
            .enumerate()
            .min_by_key(|&(_, &p)| p)
            .expect("ready set is non-empty");
        ready.swap_remove(slot);
        order.push(position);
        if let Some(children) = outgoing.get(&position) {
            for &child in children {
                incoming[child] -= 1;
                if incoming[child] == 0 {
                    ready.push(child);
                }
            }
        }
    }

    if order.len() == count {
        Ok(order)
    } else {
        let unresolved = (0..count).filter(|&p| incoming[p] > 0).collect();
        Err(unresolved)
    }
}
