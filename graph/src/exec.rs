//! Graph realization and per-frame execution.
//!
//! `Graph::compile` runs the pure planner, then allocates the transient
//! images and buffers the plan calls for. `Graph::execute` walks the
//! schedule once per frame: resolve the physical copy of every resource via
//! `(frame_index + offset) mod FRAMES_IN_FLIGHT`, emit the pre-computed
//! barriers, and invoke the pass callbacks. Only topology changes recompile
//! the graph; the frame index never does.

use std::fmt;
use std::sync::Arc;

use ash::vk;

use kiln_core::RenderError;
use kiln_resource::{Device, Image2D, ImageCube, RawBuffer};

use crate::barrier::{BarrierPlan, CopyClass, ResourceState};
use crate::decl::{PassDecl, PassScope, QueueClass, ScopeIndex};
use crate::plan::{plan, CompileContext, Plan};
use crate::res::{FrameOffset, ResourceDesc, ResourceType};

/// Concrete GPU objects bound to an external resource for the current
/// frame (the swapchain image changes every acquire).
#[derive(Clone, Copy, Debug)]
pub enum ExternalBinding {
    /// An externally owned image.
    Texture {
        /// Raw image, for barriers.
        image: vk::Image,
        /// View, for framebuffers and descriptors.
        view: vk::ImageView,
    },
    /// An externally owned buffer.
    Buffer {
        /// Raw buffer.
        buffer: vk::Buffer,
    },
}

enum PhysicalStorage {
    Texture2D(Vec<Image2D>),
    TextureCube(Vec<ImageCube>),
    Buffer(Vec<RawBuffer>),
}

impl fmt::Debug for PhysicalStorage {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhysicalStorage::Texture2D(copies) => write!(fmt, "Texture2D x{}", copies.len()),
            PhysicalStorage::TextureCube(copies) => write!(fmt, "TextureCube x{}", copies.len()),
            PhysicalStorage::Buffer(copies) => write!(fmt, "Buffer x{}", copies.len()),
        }
    }
}

/// Command buffers the executor records into.
#[derive(Clone, Copy, Debug)]
pub struct RecordedQueues {
    /// Graphics queue command buffer.
    pub graphics: vk::CommandBuffer,
    /// Async compute command buffer, when async compute is on.
    pub compute: Option<vk::CommandBuffer>,
}

type ExecuteFn<T> = dyn Fn(&PassResources<'_>, vk::CommandBuffer, &mut T);

/// The non-generic state shared between the executor and pass callbacks.
#[derive(Debug)]
struct GraphShared {
    plan: Plan,
    storage: Vec<PhysicalStorage>,
    /// Per resource, per physical copy.
    externals: Vec<Vec<Option<ExternalBinding>>>,
}

impl GraphShared {
    fn copy_index(&self, resource: u32, copy: CopyClass, frame: usize) -> usize {
        let copies = self
            .plan
            .resources
            .get(resource as usize)
            .map_or(1, |r| r.copies.max(1)) as usize;
        match copy {
            CopyClass::Current => frame % copies,
            CopyClass::Other => (frame + 1) % copies,
        }
    }

    fn resolve_offset(&self, resource: u32, offset: FrameOffset, frame: usize) -> usize {
        let copies = self
            .plan
            .resources
            .get(resource as usize)
            .map_or(1, |r| r.copies.max(1)) as usize;
        crate::res::physical_copy(frame, offset, copies)
    }

    fn storage_image(&self, resource: u32, copy: usize) -> Option<(vk::Image, vk::ImageView)> {
        let planned = self.plan.resources.get(resource as usize)?;
        if planned.external {
            let copies = self.externals.get(resource as usize)?;
            return match copies.get(copy % copies.len().max(1))?.as_ref()? {
                ExternalBinding::Texture { image, view } => Some((*image, *view)),
                ExternalBinding::Buffer { .. } => None,
            };
        }
        match &self.storage[planned.slot? as usize] {
            PhysicalStorage::Texture2D(copies) => {
                let image = &copies[copy % copies.len()];
                Some((image.raw(), image.view()))
            }
            PhysicalStorage::TextureCube(copies) => {
                let image = &copies[copy % copies.len()];
                Some((image.raw(), image.cube_view()))
            }
            PhysicalStorage::Buffer(_) => None,
        }
    }

    fn storage_buffer(&self, resource: u32, copy: usize) -> Option<vk::Buffer> {
        let planned = self.plan.resources.get(resource as usize)?;
        if planned.external {
            let copies = self.externals.get(resource as usize)?;
            return match copies.get(copy % copies.len().max(1))?.as_ref()? {
                ExternalBinding::Buffer { buffer } => Some(*buffer),
                ExternalBinding::Texture { .. } => None,
            };
        }
        match &self.storage[planned.slot? as usize] {
            PhysicalStorage::Buffer(copies) => Some(copies[copy % copies.len()].raw()),
            _ => None,
        }
    }

    fn emit_barrier(
        &self,
        device: &Device,
        cmd: vk::CommandBuffer,
        barrier: &BarrierPlan,
        frame: usize,
    ) {
        let copy = self.copy_index(barrier.resource, barrier.copy, frame);
        // Temporal producers finished under the previous frame's fence; no
        // execution dependency, only availability and the layout change.
        let (src_stage, src_access, old_layout) = if barrier.temporal {
            (
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::AccessFlags::empty(),
                barrier.src.layout,
            )
        } else if barrier.discard {
            (
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::AccessFlags::empty(),
                vk::ImageLayout::UNDEFINED,
            )
        } else {
            (barrier.src.stage, barrier.src.access, barrier.src.layout)
        };

        let planned = &self.plan.resources[barrier.resource as usize];
        if planned.ty == ResourceType::Buffer {
            let Some(buffer) = self.storage_buffer(barrier.resource, copy) else {
                return;
            };
            let raw = vk::BufferMemoryBarrier::builder()
                .src_access_mask(src_access)
                .dst_access_mask(barrier.dst.access)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .buffer(buffer)
                .offset(0)
                .size(vk::WHOLE_SIZE)
                .build();
            unsafe {
                device.raw().cmd_pipeline_barrier(
                    cmd,
                    src_stage,
                    barrier.dst.stage,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[raw],
                    &[],
                );
            }
        } else {
            let Some((image, _)) = self.storage_image(barrier.resource, copy) else {
                return;
            };
            let (aspect, levels, layers) = subresource_of(planned);
            let raw = vk::ImageMemoryBarrier::builder()
                .src_access_mask(src_access)
                .dst_access_mask(barrier.dst.access)
                .old_layout(old_layout)
                .new_layout(barrier.dst.layout)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: aspect,
                    base_mip_level: 0,
                    level_count: levels,
                    base_array_layer: 0,
                    layer_count: layers,
                })
                .build();
            unsafe {
                device.raw().cmd_pipeline_barrier(
                    cmd,
                    src_stage,
                    barrier.dst.stage,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[raw],
                );
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_transfer(
        &self,
        device: &Device,
        cmd: vk::CommandBuffer,
        resource: u32,
        copy: CopyClass,
        src: ResourceState,
        dst: ResourceState,
        families: (u32, u32),
        frame: usize,
    ) {
        let copy = self.copy_index(resource, copy, frame);
        let planned = &self.plan.resources[resource as usize];
        if planned.ty == ResourceType::Buffer {
            if let Some(buffer) = self.storage_buffer(resource, copy) {
                let raw = vk::BufferMemoryBarrier::builder()
                    .src_access_mask(src.access)
                    .dst_access_mask(dst.access)
                    .src_queue_family_index(families.0)
                    .dst_queue_family_index(families.1)
                    .buffer(buffer)
                    .offset(0)
                    .size(vk::WHOLE_SIZE)
                    .build();
                unsafe {
                    device.raw().cmd_pipeline_barrier(
                        cmd,
                        src.stage,
                        dst.stage,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[raw],
                        &[],
                    );
                }
            }
        } else if let Some((image, _)) = self.storage_image(resource, copy) {
            let (aspect, levels, layers) = subresource_of(planned);
            let raw = vk::ImageMemoryBarrier::builder()
                .src_access_mask(src.access)
                .dst_access_mask(dst.access)
                .old_layout(src.layout)
                .new_layout(dst.layout)
                .src_queue_family_index(families.0)
                .dst_queue_family_index(families.1)
                .image(image)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: aspect,
                    base_mip_level: 0,
                    level_count: levels,
                    base_array_layer: 0,
                    layer_count: layers,
                })
                .build();
            unsafe {
                device.raw().cmd_pipeline_barrier(
                    cmd,
                    src.stage,
                    dst.stage,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[raw],
                );
            }
        }
    }
}

/// A compiled, realized frame graph over aux data `T`.
pub struct Graph<T: ?Sized> {
    shared: GraphShared,
    executes: Vec<Arc<ExecuteFn<T>>>,
}

impl<T: ?Sized> fmt::Debug for Graph<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Graph")
            .field("passes", &self.shared.plan.passes.len())
            .field("slots", &self.shared.storage.len())
            .finish()
    }
}

impl<T: ?Sized> Graph<T> {
    /// Plan and realize a graph.
    pub fn compile(
        decls: &[PassDecl<T>],
        ctx: &CompileContext,
        device: &Device,
        aux: &mut T,
    ) -> Result<Self, RenderError> {
        let plan = plan(decls, ctx, aux)?;

        let mut storage = Vec::with_capacity(plan.slots.len());
        for slot in &plan.slots {
            storage.push(realize_slot(device, &slot.desc, slot.copies)?);
        }

        let executes = plan
            .passes
            .iter()
            .map(|pass| decls[pass.decl_index].execute.clone())
            .collect();

        let externals = plan
            .resources
            .iter()
            .map(|resource| vec![None; resource.copies.max(1) as usize])
            .collect();

        Ok(Graph {
            shared: GraphShared {
                plan,
                storage,
                externals,
            },
            executes,
        })
    }

    /// The compiled plan.
    pub fn plan(&self) -> &Plan {
        &self.shared.plan
    }

    /// Bind the concrete image of an external texture. Single-copy
    /// externals (the swapchain image) use copy 0 and are rebound every
    /// frame; double-buffered externals bind each copy once.
    pub fn bind_external_texture(
        &mut self,
        name: &str,
        copy: usize,
        image: vk::Image,
        view: vk::ImageView,
    ) {
        if let Some(index) = self.shared.plan.resource_index(name) {
            let slots = &mut self.shared.externals[index as usize];
            let slot = copy % slots.len().max(1);
            slots[slot] = Some(ExternalBinding::Texture { image, view });
        } else {
            log::warn!("bind_external_texture: unknown resource `{name}`");
        }
    }

    /// Bind the concrete buffer of an external buffer resource.
    pub fn bind_external_buffer(&mut self, name: &str, copy: usize, buffer: vk::Buffer) {
        if let Some(index) = self.shared.plan.resource_index(name) {
            let slots = &mut self.shared.externals[index as usize];
            let slot = copy % slots.len().max(1);
            slots[slot] = Some(ExternalBinding::Buffer { buffer });
        } else {
            log::warn!("bind_external_buffer: unknown resource `{name}`");
        }
    }

    /// View of a named texture's physical copy; for framebuffer building.
    pub fn texture_view(&self, name: &str, copy: usize) -> Option<vk::ImageView> {
        let index = self.shared.plan.resource_index(name)?;
        self.shared.storage_image(index, copy).map(|(_, view)| view)
    }

    /// Raw image of a named texture's physical copy.
    pub fn texture_image(&self, name: &str, copy: usize) -> Option<vk::Image> {
        let index = self.shared.plan.resource_index(name)?;
        self.shared
            .storage_image(index, copy)
            .map(|(image, _)| image)
    }

    /// Physical copy count of a named resource.
    pub fn resource_copies(&self, name: &str) -> u32 {
        self.shared
            .plan
            .resource_index(name)
            .and_then(|index| self.shared.plan.resources.get(index as usize))
            .map_or(0, |resource| resource.copies)
    }

    /// Record one frame.
    ///
    /// Pre-pass barriers were computed at compile time; only the physical
    /// copy selection depends on `frame_index`.
    pub fn execute(
        &self,
        device: &Device,
        frame_index: usize,
        queues: &RecordedQueues,
        aux: &mut T,
    ) {
        let shared = &self.shared;
        let split_families = device.has_dedicated_compute() && queues.compute.is_some();

        for (position, pass) in shared.plan.passes.iter().enumerate() {
            let cmd = match pass.effective_queue {
                QueueClass::Graphics => queues.graphics,
                QueueClass::Compute => queues.compute.unwrap_or(queues.graphics),
            };

            if split_families {
                for transfer in shared
                    .plan
                    .transfers
                    .iter()
                    .filter(|transfer| transfer.acquire_before == position)
                {
                    let families = if pass.effective_queue == QueueClass::Compute {
                        (device.graphics().family, device.compute().family)
                    } else {
                        (device.compute().family, device.graphics().family)
                    };
                    shared.emit_transfer(
                        device,
                        cmd,
                        transfer.resource,
                        transfer.copy,
                        ResourceState {
                            access: vk::AccessFlags::empty(),
                            ..transfer.src
                        },
                        transfer.dst,
                        families,
                        frame_index,
                    );
                }
            }

            for barrier in &pass.barriers {
                shared.emit_barrier(device, cmd, barrier, frame_index);
            }

            let resources = PassResources {
                shared,
                frame: frame_index,
                scope: ScopeIndex {
                    scope: pass.scope,
                    index: pass.scope_index,
                },
            };
            (self.executes[position])(&resources, cmd, aux);

            if split_families {
                for transfer in shared
                    .plan
                    .transfers
                    .iter()
                    .filter(|transfer| transfer.release_after == position)
                {
                    let families = if pass.effective_queue == QueueClass::Compute {
                        (device.compute().family, device.graphics().family)
                    } else {
                        (device.graphics().family, device.compute().family)
                    };
                    shared.emit_transfer(
                        device,
                        cmd,
                        transfer.resource,
                        transfer.copy,
                        transfer.src,
                        ResourceState {
                            access: vk::AccessFlags::empty(),
                            ..transfer.dst
                        },
                        families,
                        frame_index,
                    );
                }
            }

            for (post_position, barrier) in &shared.plan.post_barriers {
                if *post_position == position {
                    shared.emit_barrier(device, cmd, barrier, frame_index);
                }
            }
        }
    }

    /// Destroy the transient allocations.
    pub fn dispose(self, device: &Device) {
        for storage in self.shared.storage {
            match storage {
                PhysicalStorage::Texture2D(copies) => {
                    for image in copies {
                        image.dispose(device);
                    }
                }
                PhysicalStorage::TextureCube(copies) => {
                    for image in copies {
                        image.dispose(device);
                    }
                }
                PhysicalStorage::Buffer(copies) => {
                    for buffer in copies {
                        buffer.dispose(device);
                    }
                }
            }
        }
    }
}

fn subresource_of(resource: &crate::plan::PlannedResource) -> (vk::ImageAspectFlags, u32, u32) {
    match resource.desc {
        Some(ResourceDesc::Texture2D(texture)) => (texture.aspect, texture.mip_levels, 1),
        Some(ResourceDesc::TextureCube(texture)) => (texture.aspect, texture.mip_levels, 6),
        _ => {
            let info = resource.external_info;
            (info.aspect, info.mip_levels, info.layers)
        }
    }
}

fn realize_slot(
    device: &Device,
    desc: &ResourceDesc,
    copies: u32,
) -> Result<PhysicalStorage, RenderError> {
    match desc {
        ResourceDesc::Texture2D(texture) => {
            let mut images = Vec::with_capacity(copies as usize);
            for _ in 0..copies {
                images.push(Image2D::new(
                    device,
                    vk::Extent2D {
                        width: texture.width,
                        height: texture.height,
                    },
                    texture.format,
                    texture.mip_levels,
                    texture.usage,
                    texture.aspect,
                )?);
            }
            Ok(PhysicalStorage::Texture2D(images))
        }
        ResourceDesc::TextureCube(texture) => {
            let mut images = Vec::with_capacity(copies as usize);
            for _ in 0..copies {
                images.push(ImageCube::new(
                    device,
                    texture.width,
                    texture.format,
                    texture.mip_levels,
                    texture.usage,
                    texture.aspect,
                )?);
            }
            Ok(PhysicalStorage::TextureCube(images))
        }
        ResourceDesc::Buffer(buffer) => {
            let mut buffers = Vec::with_capacity(copies as usize);
            for _ in 0..copies {
                buffers.push(RawBuffer::new(
                    device,
                    buffer.size,
                    buffer.usage,
                    vk::MemoryPropertyFlags::DEVICE_LOCAL,
                    false,
                )?);
            }
            Ok(PhysicalStorage::Buffer(buffers))
        }
    }
}

/// Execute-time resource resolution for one pass. Names resolve the way
/// `find_texture` resolves them during setup: scope-qualified first, then
/// global.
pub struct PassResources<'a> {
    shared: &'a GraphShared,
    frame: usize,
    scope: ScopeIndex,
}

impl fmt::Debug for PassResources<'_> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("PassResources")
            .field("frame", &self.frame)
            .field("scope_index", &self.scope.index)
            .finish()
    }
}

impl<'a> PassResources<'a> {
    /// Executing frame index.
    pub fn frame(&self) -> usize {
        self.frame
    }

    /// Camera/light index of the pass instance.
    pub fn scope_index(&self) -> u32 {
        self.scope.index
    }

    fn lookup(&self, name: &str) -> Option<u32> {
        self.shared
            .plan
            .resource_index(&self.scope.qualify(name))
            .or_else(|| self.shared.plan.resource_index(name))
    }

    /// Resolve a texture to `(image, view)` for the given frame offset.
    pub fn image(&self, name: &str, offset: FrameOffset) -> Option<(vk::Image, vk::ImageView)> {
        let index = self.lookup(name)?;
        let copy = self.shared.resolve_offset(index, offset, self.frame);
        self.shared.storage_image(index, copy)
    }

    /// Resolve a texture of another scope instance (shadow maps from the
    /// lighting pass).
    pub fn image_in_scope(
        &self,
        name: &str,
        scope: PassScope,
        scope_index: u32,
        offset: FrameOffset,
    ) -> Option<(vk::Image, vk::ImageView)> {
        let qualifier = ScopeIndex {
            scope,
            index: scope_index,
        };
        let index = self.shared.plan.resource_index(&qualifier.qualify(name))?;
        let copy = self.shared.resolve_offset(index, offset, self.frame);
        self.shared.storage_image(index, copy)
    }

    /// Resolve a buffer for the given frame offset.
    pub fn buffer(&self, name: &str, offset: FrameOffset) -> Option<vk::Buffer> {
        let index = self.lookup(name)?;
        let copy = self.shared.resolve_offset(index, offset, self.frame);
        self.shared.storage_buffer(index, copy)
    }

    /// Extent of a declared texture.
    pub fn texture_extent(&self, name: &str) -> Option<(u32, u32)> {
        let index = self.lookup(name)?;
        match self.shared.plan.resources[index as usize].desc {
            Some(ResourceDesc::Texture2D(texture))
            | Some(ResourceDesc::TextureCube(texture)) => Some((texture.width, texture.height)),
            _ => None,
        }
    }
}
