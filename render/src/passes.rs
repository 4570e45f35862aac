//! Pass registration: the declaration list handed to the frame graph and
//! the command recording each pass performs.
//!
//! Every pass reads its state from the shared [`PassCtx`] aux data; the
//! graph owns the schedule and the barriers, the closures only bind and
//! draw.

use ash::vk;

use kiln_core::{Features, FRAMES_IN_FLIGHT, MAX_SHADOW_MAPS};
use kiln_graph::{
    BufferUse, ExternalInfo, FrameOffset, PassDecl, PassScope, QueueClass, TextureDesc,
    TextureUse,
};
use kiln_resource::light_kind;

use crate::overlay::{DebugDraw, UiOverlay};
use crate::pipeline::{
    Pipelines, DEPTH_FORMAT, FINAL_COLOR_FORMAT, GBUFFER_ALBEDO_FORMAT, GBUFFER_EMISSIVE_FORMAT,
    GBUFFER_MR_FORMAT, GBUFFER_NORMAL_FORMAT, GBUFFER_POSITION_FORMAT,
};
use crate::pyramid::REDUCE_GROUP_SIZE;
use crate::scene::{Bucket, CameraPasses, FrameCounts};
use crate::shadow::{ShadowSlots, SHADOW_DRAW_CAPACITY};
use crate::visibility::{CameraCull, DRAW_CAPACITY, DRAW_COMMAND_STRIDE};
use crate::volumes::VolumeMeshes;

/// Names of the per-bucket external draw buffers.
pub(crate) fn bucket_names(bucket: Bucket) -> (&'static str, &'static str) {
    match bucket {
        Bucket::Opaque => ("draws_opaque", "count_opaque"),
        Bucket::Transparent => ("draws_transparent", "count_transparent"),
        Bucket::Sprite => ("draws_sprite", "count_sprite"),
        Bucket::Wireframe => ("draws_wireframe", "count_wireframe"),
        Bucket::RandomColor => ("draws_random", "count_random"),
        Bucket::LineStrip => ("draws_line_strip", "count_line_strip"),
    }
}

/// Long-lived descriptor sets the passes bind, refreshed each frame.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct SetBundle {
    pub camera: [vk::DescriptorSet; FRAMES_IN_FLIGHT],
    pub shadow_data: [vk::DescriptorSet; FRAMES_IN_FLIGHT],
    pub nodes: vk::DescriptorSet,
    pub meshes: vk::DescriptorSet,
    pub world: vk::DescriptorSet,
    pub materials: vk::DescriptorSet,
    pub bones: vk::DescriptorSet,
    pub skinning: vk::DescriptorSet,
    pub sprites: vk::DescriptorSet,
    pub lights: vk::DescriptorSet,
    pub textures: vk::DescriptorSet,
}

/// Per-camera frame state: cull outputs, framebuffers over the graph's
/// transients, and the bindless indices of the G-buffer views.
pub(crate) struct CameraFrame {
    pub extent: vk::Extent2D,
    pub enabled: CameraPasses,
    pub cull: CameraCull,
    pub fb_prepass: vk::Framebuffer,
    pub fb_gbuffer: vk::Framebuffer,
    pub fb_ambient: vk::Framebuffer,
    pub fb_forward: vk::Framebuffer,
    /// position, normal, albedo, metallic-roughness, emissive.
    pub gbuffer_indices: [u32; 5],
    pub final_color_index: u32,
}

impl std::fmt::Debug for CameraFrame {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("CameraFrame")
            .field("extent", &self.extent)
            .finish()
    }
}

/// Compacted per-light state mirrored from the light buffer.
#[derive(Clone, Copy, Debug)]
pub(crate) struct LightFrame {
    pub kind: u32,
    pub shadow_slot: u32,
    pub shadow_map_index: u32,
}

/// Environment settings for the ambient pass.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct EnvSettings {
    pub environment_index: u32,
    pub brdf_lut_index: u32,
    pub max_lod: f32,
    pub intensity: f32,
}

/// Tone-mapping settings for the post-process pass.
#[derive(Clone, Copy, Debug)]
pub(crate) struct TonemapSettings {
    pub mode: u32,
    pub exposure: f32,
}

impl Default for TonemapSettings {
    fn default() -> Self {
        TonemapSettings {
            mode: 1,
            exposure: 1.0,
        }
    }
}

/// The aux data every pass callback receives.
pub struct PassCtx {
    pub(crate) device: ash::Device,
    pub(crate) pipelines: Pipelines,
    pub(crate) volumes: VolumeMeshes,
    pub(crate) shadows: ShadowSlots,
    pub(crate) debug: DebugDraw,
    pub(crate) cameras: Vec<CameraFrame>,
    pub(crate) lights: Vec<LightFrame>,
    pub(crate) counts: FrameCounts,
    pub(crate) features: Features,
    pub(crate) sets: SetBundle,
    pub(crate) vertex_buffer: vk::Buffer,
    pub(crate) index_buffer: vk::Buffer,
    pub(crate) env: EnvSettings,
    pub(crate) tonemap: TonemapSettings,
    pub(crate) present_camera: u32,
    pub(crate) swapchain_image_index: u32,
    pub(crate) swapchain_extent: vk::Extent2D,
    pub(crate) post_framebuffers: Vec<vk::Framebuffer>,
    pub(crate) ui: Option<Box<dyn UiOverlay>>,
}

impl std::fmt::Debug for PassCtx {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("PassCtx")
            .field("cameras", &self.cameras.len())
            .field("lights", &self.lights.len())
            .finish()
    }
}

impl PassCtx {
    fn fif(frame: usize) -> usize {
        frame % FRAMES_IN_FLIGHT
    }

    fn set_viewport(&self, cmd: vk::CommandBuffer, extent: vk::Extent2D) {
        unsafe {
            self.device.cmd_set_viewport(
                cmd,
                0,
                &[vk::Viewport {
                    x: 0.0,
                    y: 0.0,
                    width: extent.width as f32,
                    height: extent.height as f32,
                    min_depth: 0.0,
                    max_depth: 1.0,
                }],
            );
            self.device.cmd_set_scissor(
                cmd,
                0,
                &[vk::Rect2D {
                    offset: vk::Offset2D::default(),
                    extent,
                }],
            );
        }
    }

    fn begin_pass(
        &self,
        cmd: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_values: &[vk::ClearValue],
    ) {
        unsafe {
            self.device.cmd_begin_render_pass(
                cmd,
                &vk::RenderPassBeginInfo::builder()
                    .render_pass(render_pass)
                    .framebuffer(framebuffer)
                    .render_area(vk::Rect2D {
                        offset: vk::Offset2D::default(),
                        extent,
                    })
                    .clear_values(clear_values),
                vk::SubpassContents::INLINE,
            );
        }
        self.set_viewport(cmd, extent);
    }

    fn bind_mesh_geometry(&self, cmd: vk::CommandBuffer) {
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer], &[0]);
            self.device.cmd_bind_index_buffer(
                cmd,
                self.index_buffer,
                0,
                vk::IndexType::UINT32,
            );
        }
    }

    /// Bind the seven draw-layout sets: camera, textures, nodes, world,
    /// materials, bones, skinning.
    fn bind_draw_sets(&self, cmd: vk::CommandBuffer, fif: usize) {
        let sets = [
            self.sets.camera[fif],
            self.sets.textures,
            self.sets.nodes,
            self.sets.world,
            self.sets.materials,
            self.sets.bones,
            self.sets.skinning,
        ];
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipelines.draw_layout,
                0,
                &sets,
                &[],
            );
        }
    }

    fn draw_bucket_indirect(
        &self,
        cmd: vk::CommandBuffer,
        camera: usize,
        bucket: Bucket,
        frame: usize,
    ) {
        let cull = &self.cameras[camera].cull;
        unsafe {
            self.device.cmd_draw_indexed_indirect_count(
                cmd,
                cull.commands(bucket, frame),
                0,
                cull.count(bucket, frame),
                0,
                DRAW_CAPACITY,
                DRAW_COMMAND_STRIDE,
            );
        }
    }
}

const DEPTH_CLEAR: vk::ClearValue = vk::ClearValue {
    depth_stencil: vk::ClearDepthStencilValue {
        depth: 1.0,
        stencil: 0,
    },
};

const COLOR_CLEAR: vk::ClearValue = vk::ClearValue {
    color: vk::ClearColorValue {
        float32: [0.0, 0.0, 0.0, 0.0],
    },
};

fn memory_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    src_stage: vk::PipelineStageFlags,
    src_access: vk::AccessFlags,
    dst_stage: vk::PipelineStageFlags,
    dst_access: vk::AccessFlags,
) {
    let barrier = vk::MemoryBarrier::builder()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .build();
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[barrier],
            &[],
            &[],
        );
    }
}

/// Build the full declaration list. Camera bit sets and feature toggles
/// gate per-instance behavior inside setup; an instance that declares
/// nothing is culled by the compiler.
pub(crate) fn build_decls() -> Vec<PassDecl<PassCtx>> {
    let mut decls = Vec::new();

    // (a) Per-light shadow cull (compute) and shadow draw (graphics).
    decls.push(PassDecl::new(
        "shadow_cull",
        PassScope::PerLight,
        QueueClass::Compute,
        |setup, _ctx: &mut PassCtx| {
            let draws = setup.register_external_buffer("shadow_draws");
            let count = setup.register_external_buffer("shadow_count");
            setup.write_buffer(draws, FrameOffset::Current, BufferUse::StorageWrite);
            setup.write_buffer(count, FrameOffset::Current, BufferUse::StorageWrite);
        },
        |res, cmd, ctx| {
            let slot = res.scope_index();
            let frame = res.frame();
            let fif = PassCtx::fif(frame);
            let Some(slot_data) = ctx.shadows.slot(slot) else {
                return;
            };
            let device = &ctx.device;
            unsafe {
                device.cmd_fill_buffer(
                    cmd,
                    slot_data.draw_counts[fif].raw(),
                    0,
                    vk::WHOLE_SIZE,
                    0,
                );
                memory_barrier(
                    device,
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::PipelineStageFlags::COMPUTE_SHADER,
                    vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
                );

                device.cmd_bind_pipeline(
                    cmd,
                    vk::PipelineBindPoint::COMPUTE,
                    ctx.pipelines.shadow_cull,
                );
                let sets = [
                    ctx.sets.shadow_data[fif],
                    ctx.sets.nodes,
                    ctx.sets.meshes,
                    ctx.sets.world,
                    slot_data.out_sets[fif],
                ];
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::COMPUTE,
                    ctx.pipelines.shadow_cull_layout,
                    0,
                    &sets,
                    &[],
                );

                // Point slots cull by radius, others by frustum.
                let mode: u32 = if slot_data.kind == light_kind::POINT { 1 } else { 0 };
                let radius = slot_data.data.far;
                let push = [
                    slot,
                    ctx.counts.node_span,
                    mode,
                    radius.to_bits(),
                ];
                device.cmd_push_constants(
                    cmd,
                    ctx.pipelines.shadow_cull_layout,
                    vk::ShaderStageFlags::COMPUTE,
                    0,
                    bytemuck::cast_slice(&push),
                );
                device.cmd_dispatch(cmd, ctx.counts.node_span.div_ceil(64), 1, 1);
            }
        },
    ));

    decls.push(PassDecl::new(
        "shadow_draw",
        PassScope::PerLight,
        QueueClass::Graphics,
        |setup, ctx: &mut PassCtx| {
            let slot = setup.scope_index();
            let draws = setup.find_buffer("shadow_draws").expect("shadow cull ran");
            let count = setup.find_buffer("shadow_count").expect("shadow cull ran");
            setup.read_buffer(draws, FrameOffset::Current, BufferUse::Indirect);
            setup.read_buffer(count, FrameOffset::Current, BufferUse::Indirect);
            let layers = if ctx
                .lights
                .iter()
                .find(|light| light.shadow_slot == slot)
                .map_or(false, |light| light.kind == light_kind::POINT)
            {
                6
            } else {
                1
            };
            let map = setup.register_external_texture_with(
                "shadow_map",
                ExternalInfo {
                    aspect: vk::ImageAspectFlags::DEPTH,
                    mip_levels: 1,
                    layers,
                },
                false,
            );
            setup.write_texture(map, FrameOffset::Current, TextureUse::DepthAttachment);
        },
        |res, cmd, ctx| {
            let slot = res.scope_index();
            let frame = res.frame();
            let fif = PassCtx::fif(frame);
            let Some((framebuffer, kind)) = ctx
                .shadows
                .framebuffer_cached(slot, frame)
                .zip(ctx.shadows.slot(slot).map(|slot| slot.kind))
            else {
                log::debug!("shadow slot {slot} has no framebuffer; skipped");
                return;
            };

            let extent = vk::Extent2D {
                width: kiln_core::SHADOW_MAP_SIZE,
                height: kiln_core::SHADOW_MAP_SIZE,
            };
            ctx.begin_pass(
                cmd,
                ctx.pipelines.rp_depth_only,
                framebuffer,
                extent,
                &[DEPTH_CLEAR],
            );

            let device = &ctx.device;
            unsafe {
                let (pipeline, mode) = if kind == light_kind::POINT {
                    (ctx.pipelines.shadow_cube, 1u32)
                } else {
                    (ctx.pipelines.shadow_2d, 0u32)
                };
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline);
                let sets = [
                    ctx.sets.shadow_data[fif],
                    ctx.sets.textures,
                    ctx.sets.nodes,
                    ctx.sets.world,
                    ctx.sets.materials,
                    ctx.sets.bones,
                    ctx.sets.skinning,
                ];
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    ctx.pipelines.shadow_layout,
                    0,
                    &sets,
                    &[],
                );
                ctx.bind_mesh_geometry(cmd);
                let push = [slot, mode];
                device.cmd_push_constants(
                    cmd,
                    ctx.pipelines.shadow_layout,
                    vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::GEOMETRY,
                    0,
                    bytemuck::cast_slice(&push),
                );
                if let Some(slot_data) = ctx.shadows.slot(slot) {
                    device.cmd_draw_indexed_indirect_count(
                        cmd,
                        slot_data.draw_commands[fif].raw(),
                        0,
                        slot_data.draw_counts[fif].raw(),
                        0,
                        SHADOW_DRAW_CAPACITY,
                        DRAW_COMMAND_STRIDE,
                    );
                }
                device.cmd_end_render_pass(cmd);
            }
        },
    ));

    // (b) Per-camera frustum + occlusion cull.
    decls.push(PassDecl::new(
        "cull",
        PassScope::PerCamera,
        QueueClass::Compute,
        |setup, ctx: &mut PassCtx| {
            let camera = setup.scope_index() as usize;
            if !ctx.cameras[camera].enabled.contains(CameraPasses::GEOMETRY) {
                return;
            }
            for bucket in Bucket::ALL {
                let (draws_name, count_name) = bucket_names(bucket);
                let draws = setup.register_external_buffer(draws_name);
                let count = setup.register_external_buffer(count_name);
                setup.write_buffer(draws, FrameOffset::Current, BufferUse::StorageWrite);
                setup.write_buffer(count, FrameOffset::Current, BufferUse::StorageWrite);
            }
            if ctx.features.occlusion_culling && ctx.features.depth_pyramid {
                let pyramid = setup.register_external_texture_with(
                    "pyramid",
                    ExternalInfo {
                        aspect: vk::ImageAspectFlags::COLOR,
                        mip_levels: ctx.cameras[camera].cull.pyramid.mips(),
                        layers: 1,
                    },
                    false,
                );
                // Previous frame's pyramid: written at NEXT one frame ago.
                setup.read_texture(pyramid, FrameOffset::Current, TextureUse::StorageRead);
            }
        },
        |res, cmd, ctx| {
            let camera = res.scope_index() as usize;
            let frame = res.frame();
            let fif = PassCtx::fif(frame);
            let cam = &ctx.cameras[camera];
            if !cam.enabled.contains(CameraPasses::GEOMETRY) {
                return;
            }
            let device = &ctx.device;
            unsafe {
                for bucket in Bucket::ALL {
                    device.cmd_fill_buffer(cmd, cam.cull.count(bucket, frame), 0, vk::WHOLE_SIZE, 0);
                }
                memory_barrier(
                    device,
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::PipelineStageFlags::COMPUTE_SHADER,
                    vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
                );

                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, ctx.pipelines.cull);
                let shared = [
                    ctx.sets.camera[fif],
                    ctx.sets.nodes,
                    ctx.sets.meshes,
                    ctx.sets.world,
                ];
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::COMPUTE,
                    ctx.pipelines.cull_layout,
                    0,
                    &shared,
                    &[],
                );
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::COMPUTE,
                    ctx.pipelines.cull_layout,
                    5,
                    &[ctx.sets.textures],
                    &[],
                );

                let occlusion_on = ctx.features.occlusion_culling
                    && ctx.features.depth_pyramid
                    && cam.cull.pyramid.readable(frame);
                let (pyramid_width, pyramid_height) = cam.cull.pyramid.extent();
                for bucket in Bucket::ALL {
                    device.cmd_bind_descriptor_sets(
                        cmd,
                        vk::PipelineBindPoint::COMPUTE,
                        ctx.pipelines.cull_layout,
                        4,
                        &[cam.cull.output_set(bucket, frame)],
                        &[],
                    );
                    let push = [
                        camera as u32,
                        ctx.counts.node_span,
                        bucket.include_mask().bits(),
                        bucket.exclude_mask().bits(),
                        u32::from(occlusion_on),
                        cam.cull.pyramid.bindless_index(frame),
                        (pyramid_width as f32).to_bits(),
                        (pyramid_height as f32).to_bits(),
                    ];
                    device.cmd_push_constants(
                        cmd,
                        ctx.pipelines.cull_layout,
                        vk::ShaderStageFlags::COMPUTE,
                        0,
                        bytemuck::cast_slice(&push),
                    );
                    device.cmd_dispatch(cmd, ctx.counts.node_span.div_ceil(64), 1, 1);
                }
            }
        },
    ));

    // (c) Depth prepass, geometry pass, depth pyramid build.
    decls.push(PassDecl::new(
        "depth_prepass",
        PassScope::PerCamera,
        QueueClass::Graphics,
        |setup, ctx: &mut PassCtx| {
            let camera = setup.scope_index() as usize;
            let cam = &ctx.cameras[camera];
            if !cam.enabled.contains(CameraPasses::GEOMETRY) {
                return;
            }
            let depth = setup.create_texture(
                "depth",
                TextureDesc::depth(
                    cam.extent.width,
                    cam.extent.height,
                    DEPTH_FORMAT,
                    vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
                ),
            );
            setup.write_texture(depth, FrameOffset::Current, TextureUse::DepthAttachment);
            let draws = setup.find_buffer("draws_opaque").expect("cull declared");
            let count = setup.find_buffer("count_opaque").expect("cull declared");
            setup.read_buffer(draws, FrameOffset::Current, BufferUse::Indirect);
            setup.read_buffer(count, FrameOffset::Current, BufferUse::Indirect);
        },
        |res, cmd, ctx| {
            let camera = res.scope_index() as usize;
            let frame = res.frame();
            let cam = &ctx.cameras[camera];
            if !cam.enabled.contains(CameraPasses::GEOMETRY) {
                return;
            }
            ctx.begin_pass(
                cmd,
                ctx.pipelines.rp_depth_only,
                cam.fb_prepass,
                cam.extent,
                &[DEPTH_CLEAR],
            );
            unsafe {
                ctx.device.cmd_bind_pipeline(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    ctx.pipelines.prepass,
                );
            }
            ctx.bind_draw_sets(cmd, PassCtx::fif(frame));
            ctx.bind_mesh_geometry(cmd);
            unsafe {
                let push = [camera as u32, 0u32];
                ctx.device.cmd_push_constants(
                    cmd,
                    ctx.pipelines.draw_layout,
                    vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                    0,
                    bytemuck::cast_slice(&push),
                );
            }
            ctx.draw_bucket_indirect(cmd, camera, Bucket::Opaque, frame);
            unsafe {
                ctx.device.cmd_end_render_pass(cmd);
            }
        },
    ));

    decls.push(PassDecl::new(
        "gbuffer",
        PassScope::PerCamera,
        QueueClass::Graphics,
        |setup, ctx: &mut PassCtx| {
            let camera = setup.scope_index() as usize;
            let cam = &ctx.cameras[camera];
            if !cam.enabled.contains(CameraPasses::GEOMETRY) {
                return;
            }
            let usage = vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED;
            let (width, height) = (cam.extent.width, cam.extent.height);
            for (name, format) in [
                ("gbuffer_position", GBUFFER_POSITION_FORMAT),
                ("gbuffer_normal", GBUFFER_NORMAL_FORMAT),
                ("gbuffer_albedo", GBUFFER_ALBEDO_FORMAT),
                ("gbuffer_mr", GBUFFER_MR_FORMAT),
                ("gbuffer_emissive", GBUFFER_EMISSIVE_FORMAT),
            ] {
                let texture =
                    setup.create_texture(name, TextureDesc::color(width, height, format, usage));
                setup.write_texture(texture, FrameOffset::Current, TextureUse::ColorAttachment);
            }
            let depth = setup.find_texture("depth").expect("prepass declared");
            setup.write_texture(depth, FrameOffset::Current, TextureUse::DepthAttachment);
            let draws = setup.find_buffer("draws_opaque").expect("cull declared");
            let count = setup.find_buffer("count_opaque").expect("cull declared");
            setup.read_buffer(draws, FrameOffset::Current, BufferUse::Indirect);
            setup.read_buffer(count, FrameOffset::Current, BufferUse::Indirect);
        },
        |res, cmd, ctx| {
            let camera = res.scope_index() as usize;
            let frame = res.frame();
            let cam = &ctx.cameras[camera];
            if !cam.enabled.contains(CameraPasses::GEOMETRY) {
                return;
            }
            let clears = [
                COLOR_CLEAR,
                COLOR_CLEAR,
                COLOR_CLEAR,
                COLOR_CLEAR,
                COLOR_CLEAR,
                DEPTH_CLEAR,
            ];
            ctx.begin_pass(
                cmd,
                ctx.pipelines.rp_gbuffer,
                cam.fb_gbuffer,
                cam.extent,
                &clears,
            );
            unsafe {
                ctx.device.cmd_bind_pipeline(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    ctx.pipelines.gbuffer,
                );
            }
            ctx.bind_draw_sets(cmd, PassCtx::fif(frame));
            ctx.bind_mesh_geometry(cmd);
            unsafe {
                let push = [camera as u32, 0u32];
                ctx.device.cmd_push_constants(
                    cmd,
                    ctx.pipelines.draw_layout,
                    vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                    0,
                    bytemuck::cast_slice(&push),
                );
            }
            ctx.draw_bucket_indirect(cmd, camera, Bucket::Opaque, frame);
            unsafe {
                ctx.device.cmd_end_render_pass(cmd);
            }
        },
    ));

    decls.push(PassDecl::new(
        "pyramid_build",
        PassScope::PerCamera,
        QueueClass::Compute,
        |setup, ctx: &mut PassCtx| {
            let camera = setup.scope_index() as usize;
            let cam = &ctx.cameras[camera];
            if !cam.enabled.contains(CameraPasses::GEOMETRY) || !ctx.features.depth_pyramid {
                return;
            }
            let depth = setup.find_texture("depth").expect("prepass declared");
            setup.read_texture(depth, FrameOffset::Current, TextureUse::SampledCompute);
            let pyramid = setup.register_external_texture_with(
                "pyramid",
                ExternalInfo {
                    aspect: vk::ImageAspectFlags::COLOR,
                    mip_levels: cam.cull.pyramid.mips(),
                    layers: 1,
                },
                false,
            );
            // Written at NEXT, read at CURRENT next frame: no graph cycle.
            setup.write_texture(pyramid, FrameOffset::Next, TextureUse::StorageWrite);
        },
        |res, cmd, ctx| {
            let camera = res.scope_index() as usize;
            let frame = res.frame();
            let cam = &ctx.cameras[camera];
            if !cam.enabled.contains(CameraPasses::GEOMETRY) || !ctx.features.depth_pyramid {
                return;
            }
            let device = &ctx.device;
            let copy = (frame + 1) % FRAMES_IN_FLIGHT;
            let (mut width, mut height) = cam.cull.pyramid.extent();
            unsafe {
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, ctx.pipelines.reduce);
                for mip in 0..cam.cull.pyramid.mips() {
                    device.cmd_bind_descriptor_sets(
                        cmd,
                        vk::PipelineBindPoint::COMPUTE,
                        ctx.pipelines.reduce_layout,
                        0,
                        &[cam.cull.pyramid.reduce_set(copy, mip)],
                        &[],
                    );
                    let push = [width, height];
                    device.cmd_push_constants(
                        cmd,
                        ctx.pipelines.reduce_layout,
                        vk::ShaderStageFlags::COMPUTE,
                        0,
                        bytemuck::cast_slice(&push),
                    );
                    device.cmd_dispatch(
                        cmd,
                        width.div_ceil(REDUCE_GROUP_SIZE),
                        height.div_ceil(REDUCE_GROUP_SIZE),
                        1,
                    );

                    // The next level samples this one; the chain stays in
                    // GENERAL throughout.
                    let barrier = vk::ImageMemoryBarrier::builder()
                        .src_access_mask(vk::AccessFlags::SHADER_WRITE)
                        .dst_access_mask(vk::AccessFlags::SHADER_READ)
                        .old_layout(vk::ImageLayout::GENERAL)
                        .new_layout(vk::ImageLayout::GENERAL)
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .image(cam.cull.pyramid.image(copy))
                        .subresource_range(vk::ImageSubresourceRange {
                            aspect_mask: vk::ImageAspectFlags::COLOR,
                            base_mip_level: mip,
                            level_count: 1,
                            base_array_layer: 0,
                            layer_count: 1,
                        })
                        .build();
                    device.cmd_pipeline_barrier(
                        cmd,
                        vk::PipelineStageFlags::COMPUTE_SHADER,
                        vk::PipelineStageFlags::COMPUTE_SHADER,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[],
                        &[barrier],
                    );

                    width = (width / 2).max(1);
                    height = (height / 2).max(1);
                }
            }
            ctx.cameras[camera].cull.pyramid.mark_written(frame);
        },
    ));

    // (d) Ambient/IBL then per-light volumes.
    decls.push(PassDecl::new(
        "ambient",
        PassScope::PerCamera,
        QueueClass::Graphics,
        |setup, ctx: &mut PassCtx| {
            let camera = setup.scope_index() as usize;
            let cam = &ctx.cameras[camera];
            if !cam.enabled.contains(CameraPasses::LIGHTING)
                || !cam.enabled.contains(CameraPasses::GEOMETRY)
            {
                return;
            }
            let final_color = setup.create_texture(
                "final_color",
                TextureDesc::color(
                    cam.extent.width,
                    cam.extent.height,
                    FINAL_COLOR_FORMAT,
                    vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
                ),
            );
            setup.write_texture(final_color, FrameOffset::Current, TextureUse::ColorAttachment);
            for name in [
                "gbuffer_position",
                "gbuffer_normal",
                "gbuffer_albedo",
                "gbuffer_mr",
                "gbuffer_emissive",
            ] {
                let texture = setup.find_texture(name).expect("gbuffer declared");
                setup.read_texture(texture, FrameOffset::Current, TextureUse::SampledFragment);
            }
        },
        |res, cmd, ctx| {
            let camera = res.scope_index() as usize;
            let frame = res.frame();
            let cam = &ctx.cameras[camera];
            if !cam.enabled.contains(CameraPasses::LIGHTING)
                || !cam.enabled.contains(CameraPasses::GEOMETRY)
            {
                return;
            }
            ctx.begin_pass(
                cmd,
                ctx.pipelines.rp_ambient,
                cam.fb_ambient,
                cam.extent,
                &[COLOR_CLEAR],
            );
            let device = &ctx.device;
            unsafe {
                device.cmd_bind_pipeline(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    ctx.pipelines.ambient,
                );
                let sets = [ctx.sets.camera[PassCtx::fif(frame)], ctx.sets.textures];
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    ctx.pipelines.ambient_layout,
                    0,
                    &sets,
                    &[],
                );
                let ibl = if ctx.features.ibl {
                    ctx.env
                } else {
                    EnvSettings::default()
                };
                let push = [
                    camera as u32,
                    cam.gbuffer_indices[0],
                    cam.gbuffer_indices[1],
                    cam.gbuffer_indices[2],
                    cam.gbuffer_indices[3],
                    cam.gbuffer_indices[4],
                    ibl.environment_index,
                    ibl.brdf_lut_index,
                    ibl.max_lod.to_bits(),
                    ibl.intensity.to_bits(),
                ];
                device.cmd_push_constants(
                    cmd,
                    ctx.pipelines.ambient_layout,
                    vk::ShaderStageFlags::FRAGMENT,
                    0,
                    bytemuck::cast_slice(&push),
                );
                device.cmd_draw(cmd, 3, 1, 0, 0);
                device.cmd_end_render_pass(cmd);
            }
        },
    ));

    decls.push(PassDecl::new(
        "lighting",
        PassScope::PerCamera,
        QueueClass::Graphics,
        |setup, ctx: &mut PassCtx| {
            let camera = setup.scope_index() as usize;
            let cam = &ctx.cameras[camera];
            if !cam.enabled.contains(CameraPasses::LIGHTING)
                || !cam.enabled.contains(CameraPasses::GEOMETRY)
            {
                return;
            }
            let final_color = setup.find_texture("final_color").expect("ambient declared");
            setup.write_texture(final_color, FrameOffset::Current, TextureUse::ColorAttachment);
            for name in [
                "gbuffer_position",
                "gbuffer_normal",
                "gbuffer_albedo",
                "gbuffer_mr",
            ] {
                let texture = setup.find_texture(name).expect("gbuffer declared");
                setup.read_texture(texture, FrameOffset::Current, TextureUse::SampledFragment);
            }
            let depth = setup.find_texture("depth").expect("prepass declared");
            setup.read_texture(depth, FrameOffset::Current, TextureUse::DepthReadOnly);
            // Every assigned shadow map, across scopes.
            for slot in 0..ctx.counts.shadow_slot_count.min(MAX_SHADOW_MAPS) {
                if let Some(map) =
                    setup.find_texture_in_scope("shadow_map", PassScope::PerLight, slot)
                {
                    setup.read_texture(map, FrameOffset::Current, TextureUse::DepthReadOnly);
                }
            }
        },
        |res, cmd, ctx| {
            let camera = res.scope_index() as usize;
            let frame = res.frame();
            let fif = PassCtx::fif(frame);
            let cam = &ctx.cameras[camera];
            if !cam.enabled.contains(CameraPasses::LIGHTING)
                || !cam.enabled.contains(CameraPasses::GEOMETRY)
            {
                return;
            }
            ctx.begin_pass(
                cmd,
                ctx.pipelines.rp_forward,
                cam.fb_forward,
                cam.extent,
                &[COLOR_CLEAR, DEPTH_CLEAR],
            );
            let device = &ctx.device;
            unsafe {
                let sets = [
                    ctx.sets.camera[fif],
                    ctx.sets.textures,
                    ctx.sets.lights,
                    ctx.sets.shadow_data[fif],
                ];
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    ctx.pipelines.lighting_layout,
                    0,
                    &sets,
                    &[],
                );
                device.cmd_bind_vertex_buffers(cmd, 0, &[ctx.volumes.vertex_buffer()], &[0]);
                device.cmd_bind_index_buffer(
                    cmd,
                    ctx.volumes.index_buffer(),
                    0,
                    vk::IndexType::UINT32,
                );

                for (light_index, light) in ctx.lights.iter().enumerate() {
                    let pipeline = match light.kind {
                        light_kind::POINT => ctx.pipelines.light_point,
                        light_kind::SPOT => ctx.pipelines.light_spot,
                        _ => ctx.pipelines.light_directional,
                    };
                    device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline);
                    let push = [
                        camera as u32,
                        light_index as u32,
                        cam.gbuffer_indices[0],
                        cam.gbuffer_indices[1],
                        cam.gbuffer_indices[2],
                        cam.gbuffer_indices[3],
                        light.shadow_map_index,
                    ];
                    device.cmd_push_constants(
                        cmd,
                        ctx.pipelines.lighting_layout,
                        vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                        0,
                        bytemuck::cast_slice(&push),
                    );
                    match light.kind {
                        light_kind::POINT => {
                            let range = ctx.volumes.sphere;
                            device.cmd_draw_indexed(
                                cmd,
                                range.index_count,
                                1,
                                range.first_index,
                                range.vertex_offset,
                                0,
                            );
                        }
                        light_kind::SPOT => {
                            let range = ctx.volumes.cone;
                            device.cmd_draw_indexed(
                                cmd,
                                range.index_count,
                                1,
                                range.first_index,
                                range.vertex_offset,
                                0,
                            );
                        }
                        _ => {
                            device.cmd_draw(cmd, 3, 1, 0, 0);
                        }
                    }
                }
                device.cmd_end_render_pass(cmd);
            }
        },
    ));

    // (e) Overlays: transparency, sprites, wireframe, random color, line
    // strips, debug lines.
    for (name, bucket) in [
        ("transparency", Bucket::Transparent),
        ("wireframe", Bucket::Wireframe),
        ("random_color", Bucket::RandomColor),
        ("line_strip", Bucket::LineStrip),
    ] {
        decls.push(PassDecl::new(
            name,
            PassScope::PerCamera,
            QueueClass::Graphics,
            move |setup, ctx: &mut PassCtx| {
                let camera = setup.scope_index() as usize;
                let cam = &ctx.cameras[camera];
                if !cam.enabled.contains(CameraPasses::OVERLAYS)
                    || !cam.enabled.contains(CameraPasses::GEOMETRY)
                    || !cam.enabled.contains(CameraPasses::LIGHTING)
                {
                    return;
                }
                let final_color = setup.find_texture("final_color").expect("ambient declared");
                setup.write_texture(final_color, FrameOffset::Current, TextureUse::ColorAttachment);
                let depth = setup.find_texture("depth").expect("prepass declared");
                setup.read_texture(depth, FrameOffset::Current, TextureUse::DepthReadOnly);
                let (draws_name, count_name) = bucket_names(bucket);
                let draws = setup.find_buffer(draws_name).expect("cull declared");
                let count = setup.find_buffer(count_name).expect("cull declared");
                setup.read_buffer(draws, FrameOffset::Current, BufferUse::Indirect);
                setup.read_buffer(count, FrameOffset::Current, BufferUse::Indirect);
            },
            move |res, cmd, ctx| {
                let camera = res.scope_index() as usize;
                let frame = res.frame();
                let cam = &ctx.cameras[camera];
                if !cam.enabled.contains(CameraPasses::OVERLAYS)
                    || !cam.enabled.contains(CameraPasses::GEOMETRY)
                    || !cam.enabled.contains(CameraPasses::LIGHTING)
                {
                    return;
                }
                let (pipeline, mode) = match bucket {
                    Bucket::Transparent => (ctx.pipelines.fwd_transparent, 0u32),
                    Bucket::Wireframe => (ctx.pipelines.fwd_wireframe, 1u32),
                    Bucket::RandomColor => (ctx.pipelines.fwd_random, 2u32),
                    _ => (ctx.pipelines.fwd_line_strip, 3u32),
                };
                ctx.begin_pass(
                    cmd,
                    ctx.pipelines.rp_forward,
                    cam.fb_forward,
                    cam.extent,
                    &[COLOR_CLEAR, DEPTH_CLEAR],
                );
                unsafe {
                    ctx.device
                        .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline);
                }
                ctx.bind_draw_sets(cmd, PassCtx::fif(frame));
                ctx.bind_mesh_geometry(cmd);
                unsafe {
                    let push = [camera as u32, mode];
                    ctx.device.cmd_push_constants(
                        cmd,
                        ctx.pipelines.draw_layout,
                        vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                        0,
                        bytemuck::cast_slice(&push),
                    );
                }
                ctx.draw_bucket_indirect(cmd, camera, bucket, frame);
                unsafe {
                    ctx.device.cmd_end_render_pass(cmd);
                }
            },
        ));
    }

    decls.push(PassDecl::new(
        "sprites",
        PassScope::PerCamera,
        QueueClass::Graphics,
        |setup, ctx: &mut PassCtx| {
            let camera = setup.scope_index() as usize;
            let cam = &ctx.cameras[camera];
            if !cam.enabled.contains(CameraPasses::OVERLAYS)
                || !cam.enabled.contains(CameraPasses::GEOMETRY)
                || !cam.enabled.contains(CameraPasses::LIGHTING)
            {
                return;
            }
            let final_color = setup.find_texture("final_color").expect("ambient declared");
            setup.write_texture(final_color, FrameOffset::Current, TextureUse::ColorAttachment);
            let depth = setup.find_texture("depth").expect("prepass declared");
            setup.read_texture(depth, FrameOffset::Current, TextureUse::DepthReadOnly);
            let (draws_name, count_name) = bucket_names(Bucket::Sprite);
            let draws = setup.find_buffer(draws_name).expect("cull declared");
            let count = setup.find_buffer(count_name).expect("cull declared");
            setup.read_buffer(draws, FrameOffset::Current, BufferUse::Indirect);
            setup.read_buffer(count, FrameOffset::Current, BufferUse::Indirect);
        },
        |res, cmd, ctx| {
            let camera = res.scope_index() as usize;
            let frame = res.frame();
            let fif = PassCtx::fif(frame);
            let cam = &ctx.cameras[camera];
            if !cam.enabled.contains(CameraPasses::OVERLAYS)
                || !cam.enabled.contains(CameraPasses::GEOMETRY)
                || !cam.enabled.contains(CameraPasses::LIGHTING)
            {
                return;
            }
            ctx.begin_pass(
                cmd,
                ctx.pipelines.rp_forward,
                cam.fb_forward,
                cam.extent,
                &[COLOR_CLEAR, DEPTH_CLEAR],
            );
            let device = &ctx.device;
            unsafe {
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, ctx.pipelines.sprite);
                let sets = [
                    ctx.sets.camera[fif],
                    ctx.sets.textures,
                    ctx.sets.nodes,
                    ctx.sets.sprites,
                ];
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    ctx.pipelines.sprite_layout,
                    0,
                    &sets,
                    &[],
                );
                ctx.bind_mesh_geometry(cmd);
                let push = [camera as u32, 0u32];
                device.cmd_push_constants(
                    cmd,
                    ctx.pipelines.sprite_layout,
                    vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                    0,
                    bytemuck::cast_slice(&push),
                );
            }
            ctx.draw_bucket_indirect(cmd, camera, Bucket::Sprite, frame);
            unsafe {
                ctx.device.cmd_end_render_pass(cmd);
            }
        },
    ));

    decls.push(PassDecl::new(
        "debug_lines",
        PassScope::PerCamera,
        QueueClass::Graphics,
        |setup, ctx: &mut PassCtx| {
            let camera = setup.scope_index() as usize;
            let cam = &ctx.cameras[camera];
            if !cam.enabled.contains(CameraPasses::DEBUG)
                || !cam.enabled.contains(CameraPasses::GEOMETRY)
                || !cam.enabled.contains(CameraPasses::LIGHTING)
            {
                return;
            }
            let final_color = setup.find_texture("final_color").expect("ambient declared");
            setup.write_texture(final_color, FrameOffset::Current, TextureUse::ColorAttachment);
            let depth = setup.find_texture("depth").expect("prepass declared");
            setup.read_texture(depth, FrameOffset::Current, TextureUse::DepthReadOnly);
        },
        |res, cmd, ctx| {
            let camera = res.scope_index() as usize;
            let frame = res.frame();
            let cam = &ctx.cameras[camera];
            if !cam.enabled.contains(CameraPasses::DEBUG)
                || !cam.enabled.contains(CameraPasses::GEOMETRY)
                || !cam.enabled.contains(CameraPasses::LIGHTING)
            {
                return;
            }
            let count = ctx.debug.count(frame);
            if count == 0 {
                return;
            }
            ctx.begin_pass(
                cmd,
                ctx.pipelines.rp_forward,
                cam.fb_forward,
                cam.extent,
                &[COLOR_CLEAR, DEPTH_CLEAR],
            );
            let device = &ctx.device;
            unsafe {
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, ctx.pipelines.debug);
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    ctx.pipelines.debug_layout,
                    0,
                    &[ctx.sets.camera[PassCtx::fif(frame)]],
                    &[],
                );
                device.cmd_bind_vertex_buffers(cmd, 0, &[ctx.debug.buffer(frame)], &[0]);
                let push = [camera as u32];
                device.cmd_push_constants(
                    cmd,
                    ctx.pipelines.debug_layout,
                    vk::ShaderStageFlags::VERTEX,
                    0,
                    bytemuck::cast_slice(&push),
                );
                device.cmd_draw(cmd, count, 1, 0, 0);
                device.cmd_end_render_pass(cmd);
            }
        },
    ));

    // (f) Post-process into the swapchain, then the UI overlay.
    decls.push(PassDecl::new(
        "postprocess",
        PassScope::Global,
        QueueClass::Graphics,
        |setup, ctx: &mut PassCtx| {
            if let Some(final_color) = setup.find_texture_in_scope(
                "final_color",
                PassScope::PerCamera,
                ctx.present_camera,
            ) {
                setup.read_texture(final_color, FrameOffset::Current, TextureUse::SampledFragment);
            }
            let swapchain = setup.register_external_texture("swapchain", true);
            setup.write_texture(swapchain, FrameOffset::Current, TextureUse::ColorAttachment);
        },
        |_res, cmd, ctx| {
            let framebuffer =
                ctx.post_framebuffers[ctx.swapchain_image_index as usize % ctx.post_framebuffers.len()];
            ctx.begin_pass(
                cmd,
                ctx.pipelines.rp_post,
                framebuffer,
                ctx.swapchain_extent,
                &[COLOR_CLEAR],
            );
            let device = &ctx.device;
            unsafe {
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, ctx.pipelines.post);
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    ctx.pipelines.post_layout,
                    0,
                    &[ctx.sets.textures],
                    &[],
                );
                let color_index = ctx
                    .cameras
                    .get(ctx.present_camera as usize)
                    .map_or(0, |camera| camera.final_color_index);
                let push = [
                    color_index,
                    ctx.tonemap.mode,
                    ctx.tonemap.exposure.to_bits(),
                ];
                device.cmd_push_constants(
                    cmd,
                    ctx.pipelines.post_layout,
                    vk::ShaderStageFlags::FRAGMENT,
                    0,
                    bytemuck::cast_slice(&push),
                );
                device.cmd_draw(cmd, 3, 1, 0, 0);
                device.cmd_end_render_pass(cmd);
            }
        },
    ));

    decls.push(
        PassDecl::new(
            "ui_overlay",
            PassScope::Global,
            QueueClass::Graphics,
            |setup, _ctx: &mut PassCtx| {
                let swapchain = setup.register_external_texture("swapchain", true);
                setup.write_texture(swapchain, FrameOffset::Current, TextureUse::ColorAttachment);
            },
            |_res, cmd, ctx| {
                let framebuffer = ctx.post_framebuffers
                    [ctx.swapchain_image_index as usize % ctx.post_framebuffers.len()];
                ctx.begin_pass(
                    cmd,
                    ctx.pipelines.rp_ui,
                    framebuffer,
                    ctx.swapchain_extent,
                    &[COLOR_CLEAR],
                );
                let device = ctx.device.clone();
                let extent = ctx.swapchain_extent;
                if let Some(ui) = ctx.ui.as_mut() {
                    ui.record(&device, cmd, extent);
                }
                unsafe {
                    ctx.device.cmd_end_render_pass(cmd);
                }
            },
        )
        .enabled(true),
    );

    decls
}
