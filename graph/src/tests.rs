//! Planner tests. Everything here is host-only: the pure compile pipeline
//! is exercised without a device.

use ash::vk;

use kiln_core::{CompileError, FRAMES_IN_FLIGHT};

use crate::barrier::CopyClass;
use crate::decl::{BufferUse, PassDecl, PassScope, QueueClass, TextureUse};
use crate::plan::{plan, CompileContext, Plan};
use crate::res::{BufferDesc, ExternalInfo, FrameOffset, TextureDesc};

type Decl = PassDecl<()>;

fn color_desc() -> TextureDesc {
    TextureDesc::color(
        64,
        64,
        vk::Format::R8G8B8A8_UNORM,
        vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
    )
}

fn noop_exec() -> impl Fn(&crate::exec::PassResources<'_>, vk::CommandBuffer, &mut ()) {
    |_, _, _| {}
}

fn ctx() -> CompileContext {
    CompileContext {
        camera_count: 1,
        light_count: 0,
        async_compute: false,
    }
}

fn plan_of(decls: &[Decl]) -> Result<Plan, CompileError> {
    plan(decls, &ctx(), &mut ())
}

/// Producer → consumer → sink, all global scope.
fn simple_chain() -> Vec<Decl> {
    vec![
        Decl::new(
            "gbuffer",
            PassScope::Global,
            QueueClass::Graphics,
            |setup, _| {
                let color = setup.create_texture("color", color_desc());
                setup.write_texture(color, FrameOffset::Current, TextureUse::ColorAttachment);
            },
            noop_exec(),
        ),
        Decl::new(
            "tonemap",
            PassScope::Global,
            QueueClass::Graphics,
            |setup, _| {
                let color = setup.find_texture("color").expect("color exists");
                setup.read_texture(color, FrameOffset::Current, TextureUse::SampledFragment);
                let swapchain = setup.register_external_texture("swapchain", true);
                setup.write_texture(swapchain, FrameOffset::Current, TextureUse::ColorAttachment);
            },
            noop_exec(),
        ),
    ]
}

#[test]
fn chain_is_topologically_ordered() {
    let plan = plan_of(&simple_chain()).unwrap();
    let gbuffer = plan.pass_position("gbuffer").unwrap();
    let tonemap = plan.pass_position("tonemap").unwrap();
    assert!(gbuffer < tonemap);
    // Every edge respects the schedule.
    for &(from, to) in &plan.edges {
        assert!(from < to, "edge {from} -> {to} violates the order");
    }
}

#[test]
fn present_external_gets_final_transition() {
    let plan = plan_of(&simple_chain()).unwrap();
    let tonemap = plan.pass_position("tonemap").unwrap();
    let (position, barrier) = &plan.post_barriers[0];
    assert_eq!(*position, tonemap);
    assert_eq!(barrier.dst.layout, vk::ImageLayout::PRESENT_SRC_KHR);
}

#[test]
fn dangling_read_is_reported() {
    let decls = vec![Decl::new(
        "lonely",
        PassScope::Global,
        QueueClass::Graphics,
        |setup, _| {
            // An id that no creation backs.
            let bogus = crate::res::ResourceId {
                index: 99,
                version: 0,
            };
            setup.read_texture(bogus, FrameOffset::Current, TextureUse::SampledFragment);
        },
        noop_exec(),
    )];
    match plan_of(&decls) {
        Err(CompileError::DanglingRead { pass, .. }) => assert_eq!(pass, "lonely"),
        other => panic!("expected DanglingRead, got {other:?}"),
    }
}

#[test]
fn reading_a_buffer_as_texture_is_a_type_mismatch() {
    let decls = vec![Decl::new(
        "confused",
        PassScope::Global,
        QueueClass::Graphics,
        |setup, _| {
            let buffer = setup.create_buffer(
                "draws",
                BufferDesc {
                    size: 256,
                    usage: vk::BufferUsageFlags::STORAGE_BUFFER,
                },
            );
            setup.read_texture(buffer, FrameOffset::Current, TextureUse::SampledFragment);
        },
        noop_exec(),
    )];
    assert!(matches!(
        plan_of(&decls),
        Err(CompileError::TypeMismatch { .. })
    ));
}

#[test]
fn compute_pass_cannot_write_attachments() {
    let decls = vec![Decl::new(
        "bad_cull",
        PassScope::Global,
        QueueClass::Compute,
        |setup, _| {
            let color = setup.create_texture("target", color_desc());
            setup.write_texture(color, FrameOffset::Current, TextureUse::ColorAttachment);
        },
        noop_exec(),
    )];
    assert!(matches!(
        plan_of(&decls),
        Err(CompileError::TypeMismatch { .. })
    ));
}

#[test]
fn anti_dependencies_can_cycle() {
    // `a` reads t@1 which `b` overwrites (so a must run before b), and `b`
    // reads u@1 which `a` overwrites (so b must run before a). No schedule
    // satisfies both write-after-read orderings.
    let decls = vec![
        Decl::new(
            "seed",
            PassScope::Global,
            QueueClass::Graphics,
            |setup, _| {
                let t = setup.create_texture("t", color_desc());
                let u = setup.create_texture("u", color_desc());
                setup.write_texture(t, FrameOffset::Current, TextureUse::ColorAttachment);
                setup.write_texture(u, FrameOffset::Current, TextureUse::ColorAttachment);
            },
            noop_exec(),
        ),
        Decl::new(
            "a",
            PassScope::Global,
            QueueClass::Graphics,
            |setup, _| {
                let t = crate::res::ResourceId {
                    index: 0,
                    version: 1,
                };
                let u = crate::res::ResourceId {
                    index: 1,
                    version: 1,
                };
                setup.read_texture(t, FrameOffset::Current, TextureUse::SampledFragment);
                setup.write_texture(u, FrameOffset::Current, TextureUse::ColorAttachment);
            },
            noop_exec(),
        ),
        Decl::new(
            "b",
            PassScope::Global,
            QueueClass::Graphics,
            |setup, _| {
                let t = crate::res::ResourceId {
                    index: 0,
                    version: 1,
                };
                let u = crate::res::ResourceId {
                    index: 1,
                    version: 1,
                };
                setup.read_texture(u, FrameOffset::Current, TextureUse::SampledFragment);
                setup.write_texture(t, FrameOffset::Current, TextureUse::ColorAttachment);
            },
            noop_exec(),
        ),
    ];
    assert!(matches!(
        plan_of(&decls),
        Err(CompileError::CyclicGraph { .. })
    ));
}

#[test]
fn unconsumed_passes_are_culled() {
    let mut decls = simple_chain();
    decls.push(Decl::new(
        "orphan",
        PassScope::Global,
        QueueClass::Graphics,
        |setup, _| {
            let scratch = setup.create_texture("scratch", color_desc());
            setup.write_texture(scratch, FrameOffset::Current, TextureUse::ColorAttachment);
        },
        noop_exec(),
    ));
    let plan = plan_of(&decls).unwrap();
    assert!(plan.pass_position("orphan").is_none());
    assert!(plan.pass_position("gbuffer").is_some());
    // The orphan's transient is not allocated either.
    assert!(plan
        .slots
        .iter()
        .all(|slot| !slot.resources.iter().any(|&r| {
            plan.resources[r as usize].name == "scratch"
        })));
}

/// Depth-pyramid shape: written at NEXT, read at CURRENT. No edge, no
/// cycle, two copies, temporal memory-only barrier.
fn pyramid_shape() -> Vec<Decl> {
    vec![
        Decl::new(
            "cull",
            PassScope::Global,
            QueueClass::Compute,
            |setup, _| {
                // The pyramid is owned by the visibility subsystem;
                // registration is find-or-create across passes.
                let pyramid = setup.register_external_texture_with(
                    "pyramid",
                    ExternalInfo {
                        aspect: vk::ImageAspectFlags::COLOR,
                        mip_levels: 6,
                        layers: 1,
                    },
                    false,
                );
                let draws = setup.create_buffer(
                    "draws",
                    BufferDesc {
                        size: 1 << 16,
                        usage: vk::BufferUsageFlags::STORAGE_BUFFER
                            | vk::BufferUsageFlags::INDIRECT_BUFFER,
                    },
                );
                // The pyramid lives in GENERAL across its mip chain.
                setup.read_texture(pyramid, FrameOffset::Current, TextureUse::StorageRead);
                setup.write_buffer(draws, FrameOffset::Current, BufferUse::StorageWrite);
            },
            noop_exec(),
        ),
        Decl::new(
            "geometry",
            PassScope::Global,
            QueueClass::Graphics,
            |setup, _| {
                let draws = setup.find_buffer("draws").unwrap();
                setup.read_buffer(draws, FrameOffset::Current, BufferUse::Indirect);
                let depth = setup.create_texture(
                    "depth",
                    TextureDesc::depth(
                        64,
                        64,
                        vk::Format::D32_SFLOAT,
                        vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
                            | vk::ImageUsageFlags::SAMPLED,
                    ),
                );
                setup.write_texture(depth, FrameOffset::Current, TextureUse::DepthAttachment);
                let swapchain = setup.register_external_texture("swapchain", true);
                setup.write_texture(swapchain, FrameOffset::Current, TextureUse::ColorAttachment);
            },
            noop_exec(),
        ),
        Decl::new(
            "pyramid_build",
            PassScope::Global,
            QueueClass::Compute,
            |setup, _| {
                let depth = setup.find_texture("depth").unwrap();
                setup.read_texture(depth, FrameOffset::Current, TextureUse::SampledCompute);
                let pyramid = setup.register_external_texture_with(
                    "pyramid",
                    ExternalInfo {
                        aspect: vk::ImageAspectFlags::COLOR,
                        mip_levels: 6,
                        layers: 1,
                    },
                    false,
                );
                setup.write_texture(pyramid, FrameOffset::Next, TextureUse::StorageWrite);
            },
            noop_exec(),
        ),
    ]
}

#[test]
fn temporal_write_creates_no_edge_and_no_cycle() {
    // The cull pass runs before the pyramid build in declaration order and
    // reads what the build wrote one frame earlier; a same-frame edge
    // would be a cycle through the geometry pass.
    let plan = plan_of(&pyramid_shape()).unwrap();
    let cull = plan.pass_position("cull").unwrap();
    let build = plan.pass_position("pyramid_build").unwrap();
    assert!(!plan
        .edges
        .iter()
        .any(|&(from, to)| (from == build && to == cull) || (from == cull && to == build)));
}

#[test]
fn temporal_resources_get_frames_in_flight_copies() {
    let plan = plan_of(&pyramid_shape()).unwrap();
    let pyramid = plan.resource_index("pyramid").unwrap();
    let depth = plan.resource_index("depth").unwrap();
    assert_eq!(
        plan.resources[pyramid as usize].copies,
        FRAMES_IN_FLIGHT as u32
    );
    assert_eq!(plan.resources[depth as usize].copies, 1);
}

#[test]
fn temporal_barriers_are_memory_only() {
    let plan = plan_of(&pyramid_shape()).unwrap();
    let pyramid = plan.resource_index("pyramid").unwrap();
    let cull = plan.pass_position("cull").unwrap();
    let read_barrier = plan.passes[cull]
        .barriers
        .iter()
        .find(|barrier| barrier.resource == pyramid)
        .expect("cull has a pyramid barrier");
    assert!(read_barrier.temporal);
    // CURRENT read of a NEXT-written resource touches the other copy's
    // counterpart: both offsets resolve away from the same-frame copy.
    assert_eq!(read_barrier.copy, CopyClass::Current);
}

#[test]
fn pyramid_build_stays_on_graphics_queue_under_async_compute() {
    // It consumes this frame's depth, produced by a graphics pass.
    let ctx = CompileContext {
        camera_count: 1,
        light_count: 0,
        async_compute: true,
    };
    let plan = plan(&pyramid_shape(), &ctx, &mut ()).unwrap();
    let build = plan.pass_position("pyramid_build").unwrap();
    let cull = plan.pass_position("cull").unwrap();
    assert_eq!(plan.passes[build].effective_queue, QueueClass::Graphics);
    // The cull pass has no same-frame graphics producer and may go async.
    assert_eq!(plan.passes[cull].effective_queue, QueueClass::Compute);
    assert!(plan.has_cross_queue_edge);
}

#[test]
fn per_camera_scope_instantiates_and_qualifies_names() {
    let decls = vec![
        Decl::new(
            "depth_prepass",
            PassScope::PerCamera,
            QueueClass::Graphics,
            |setup, _| {
                let depth = setup.create_texture(
                    "depth",
                    TextureDesc::depth(
                        64,
                        64,
                        vk::Format::D32_SFLOAT,
                        vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                    ),
                );
                setup.write_texture(depth, FrameOffset::Current, TextureUse::DepthAttachment);
            },
            noop_exec(),
        ),
        Decl::new(
            "present",
            PassScope::PerCamera,
            QueueClass::Graphics,
            |setup, _| {
                // Unqualified name resolves to this camera's depth.
                let depth = setup.find_texture("depth").unwrap();
                setup.read_texture(depth, FrameOffset::Current, TextureUse::SampledFragment);
                let out = setup.register_external_texture("swapchain", true);
                setup.write_texture(out, FrameOffset::Current, TextureUse::ColorAttachment);
            },
            noop_exec(),
        ),
    ];
    let ctx = CompileContext {
        camera_count: 2,
        light_count: 0,
        async_compute: false,
    };
    let plan = plan(&decls, &ctx, &mut ()).unwrap();
    assert!(plan.pass_position("depth_prepass_cam_0").is_some());
    assert!(plan.pass_position("depth_prepass_cam_1").is_some());
    assert!(plan.resource_index("depth_cam_0").is_some());
    assert!(plan.resource_index("depth_cam_1").is_some());
    // Camera 1's consumer depends on camera 1's producer, not camera 0's.
    let producer = plan.pass_position("depth_prepass_cam_1").unwrap();
    let consumer = plan.pass_position("present_cam_1").unwrap();
    assert!(plan.edges.contains(&(producer, consumer)));
    let foreign = plan.pass_position("depth_prepass_cam_0").unwrap();
    assert!(!plan.edges.contains(&(foreign, consumer)));
}

#[test]
fn disabled_declarations_are_dropped() {
    let mut decls = simple_chain();
    decls.push(
        Decl::new(
            "debug_overlay",
            PassScope::Global,
            QueueClass::Graphics,
            |setup, _| {
                let out = setup.register_external_texture("swapchain2", true);
                setup.write_texture(out, FrameOffset::Current, TextureUse::ColorAttachment);
            },
            noop_exec(),
        )
        .enabled(false),
    );
    let plan = plan_of(&decls).unwrap();
    assert!(plan.pass_position("debug_overlay").is_none());
}

#[test]
fn disjoint_lifetimes_share_an_allocation() {
    // ping lives over passes [0,1], mid over [1,2], scratch over [2,3].
    // ping and scratch share a description and never overlap; mid overlaps
    // both.
    let decls = vec![
        Decl::new(
            "draw_ping",
            PassScope::Global,
            QueueClass::Graphics,
            |setup, _| {
                let ping = setup.create_texture("ping", color_desc());
                setup.write_texture(ping, FrameOffset::Current, TextureUse::ColorAttachment);
            },
            noop_exec(),
        ),
        Decl::new(
            "consume_ping",
            PassScope::Global,
            QueueClass::Graphics,
            |setup, _| {
                let ping = setup.find_texture("ping").unwrap();
                setup.read_texture(ping, FrameOffset::Current, TextureUse::SampledFragment);
                let mid = setup.create_texture("mid", color_desc());
                setup.write_texture(mid, FrameOffset::Current, TextureUse::ColorAttachment);
            },
            noop_exec(),
        ),
        Decl::new(
            "draw_scratch",
            PassScope::Global,
            QueueClass::Graphics,
            |setup, _| {
                let mid = setup.find_texture("mid").unwrap();
                setup.read_texture(mid, FrameOffset::Current, TextureUse::SampledFragment);
                // Same description as ping, first used after ping died.
                let scratch = setup.create_texture("scratch", color_desc());
                setup.write_texture(scratch, FrameOffset::Current, TextureUse::ColorAttachment);
            },
            noop_exec(),
        ),
        Decl::new(
            "present",
            PassScope::Global,
            QueueClass::Graphics,
            |setup, _| {
                let scratch = setup.find_texture("scratch").unwrap();
                setup.read_texture(scratch, FrameOffset::Current, TextureUse::SampledFragment);
                let out = setup.register_external_texture("swapchain", true);
                setup.write_texture(out, FrameOffset::Current, TextureUse::ColorAttachment);
            },
            noop_exec(),
        ),
    ];
    let plan = plan_of(&decls).unwrap();
    let ping = plan.resource_index("ping").unwrap() as usize;
    let mid = plan.resource_index("mid").unwrap() as usize;
    let scratch = plan.resource_index("scratch").unwrap() as usize;
    // ping [0,1] and scratch [2,3] are disjoint with equal descs: shared.
    assert_eq!(plan.resources[ping].slot, plan.resources[scratch].slot);
    // mid [1,2] overlaps ping: distinct slot.
    assert_ne!(plan.resources[ping].slot, plan.resources[mid].slot);
}

#[test]
fn external_resources_are_never_aliased() {
    let plan = plan_of(&simple_chain()).unwrap();
    let swapchain = plan.resource_index("swapchain").unwrap() as usize;
    assert!(plan.resources[swapchain].slot.is_none());
    assert!(plan.resources[swapchain].external);
}

#[test]
fn same_frame_dependencies_get_execution_barriers() {
    let plan = plan_of(&simple_chain()).unwrap();
    let tonemap = plan.pass_position("tonemap").unwrap();
    let color = plan.resource_index("color").unwrap();
    let barrier = plan.passes[tonemap]
        .barriers
        .iter()
        .find(|barrier| barrier.resource == color)
        .expect("tonemap transitions color to sampled");
    assert!(!barrier.temporal);
    assert_eq!(
        barrier.src.layout,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
    );
    assert_eq!(
        barrier.dst.layout,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    );
}
