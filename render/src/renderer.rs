//! Renderer orchestration: device and swapchain ownership, per-frame scene
//! sync, graph recompilation on topology changes, command recording and
//! submission.

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use kiln_core::{Handle, RenderConfig, RenderError, FRAMES_IN_FLIGHT, INVALID_SHADOW_INDEX};
use kiln_graph::{CompileContext, Graph, RecordedQueues};
use kiln_resource::{Device, Resources, Texture2D, TextureCube};
use kiln_wsi::{FramePacer, Target};

use crate::overlay::{DebugDraw, UiOverlay};
use crate::passes::{
    build_decls, bucket_names, CameraFrame, EnvSettings, LightFrame, PassCtx, SetBundle,
    TonemapSettings,
};
use crate::pipeline::Pipelines;
use crate::scene::{Bucket, Camera, CameraPasses, Scene};
use crate::shadow::ShadowSlots;
use crate::visibility::CameraCull;
use crate::volumes::VolumeMeshes;

struct FrameCommands {
    graphics_pools: Vec<vk::CommandPool>,
    graphics_buffers: Vec<vk::CommandBuffer>,
    compute_pools: Vec<vk::CommandPool>,
    compute_buffers: Vec<vk::CommandBuffer>,
}

impl FrameCommands {
    fn new(device: &Device, async_compute: bool) -> Result<Self, RenderError> {
        unsafe {
            let mut graphics_pools = Vec::with_capacity(FRAMES_IN_FLIGHT);
            let mut graphics_buffers = Vec::with_capacity(FRAMES_IN_FLIGHT);
            let mut compute_pools = Vec::new();
            let mut compute_buffers = Vec::new();
            for _ in 0..FRAMES_IN_FLIGHT {
                let pool = device
                    .raw()
                    .create_command_pool(
                        &vk::CommandPoolCreateInfo::builder()
                            .queue_family_index(device.graphics().family),
                        None,
                    )
                    .map_err(RenderError::from)?;
                let buffer = device
                    .raw()
                    .allocate_command_buffers(
                        &vk::CommandBufferAllocateInfo::builder()
                            .command_pool(pool)
                            .level(vk::CommandBufferLevel::PRIMARY)
                            .command_buffer_count(1),
                    )
                    .map_err(RenderError::from)?[0];
                graphics_pools.push(pool);
                graphics_buffers.push(buffer);
            }
            if async_compute && device.has_dedicated_compute() {
                for _ in 0..FRAMES_IN_FLIGHT {
                    let pool = device
                        .raw()
                        .create_command_pool(
                            &vk::CommandPoolCreateInfo::builder()
                                .queue_family_index(device.compute().family),
                            None,
                        )
                        .map_err(RenderError::from)?;
                    let buffer = device
                        .raw()
                        .allocate_command_buffers(
                            &vk::CommandBufferAllocateInfo::builder()
                                .command_pool(pool)
                                .level(vk::CommandBufferLevel::PRIMARY)
                                .command_buffer_count(1),
                        )
                        .map_err(RenderError::from)?[0];
                    compute_pools.push(pool);
                    compute_buffers.push(buffer);
                }
            }
            Ok(FrameCommands {
                graphics_pools,
                graphics_buffers,
                compute_pools,
                compute_buffers,
            })
        }
    }

    fn dispose(self, device: &Device) {
        unsafe {
            for pool in self.graphics_pools.into_iter().chain(self.compute_pools) {
                device.raw().destroy_command_pool(pool, None);
            }
        }
    }
}

/// The render core.
pub struct Renderer {
    device: Device,
    resources: Resources,
    target: Target,
    pacer: FramePacer,
    scene: Scene,
    graph: Option<Graph<PassCtx>>,
    ctx: PassCtx,
    commands: FrameCommands,
    config: RenderConfig,
    compiled_topology: Option<u64>,
    environment: Option<Handle<TextureCube>>,
    brdf_lut: Option<Handle<Texture2D>>,
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Renderer")
            .field("frame", &self.pacer.frame())
            .finish()
    }
}

impl Renderer {
    /// Bring up the device, swapchain, resource manager and pipelines.
    pub fn new(
        config: RenderConfig,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> Result<Self, RenderError> {
        let device = Device::new(display)?;
        let mut resources = Resources::new(&device)?;
        let target = Target::new(
            &device,
            display,
            window,
            vk::Extent2D {
                width: config.width,
                height: config.height,
            },
        )?;
        let pacer = FramePacer::new(&device)?;
        let pipelines = Pipelines::new(&device, &resources, target.format())?;
        let volumes = VolumeMeshes::new(&device)?;
        let shadows = ShadowSlots::new(&device)?;
        let debug = DebugDraw::new(&device)?;
        let commands = FrameCommands::new(&device, config.features.async_compute)?;

        let sets = SetBundle {
            camera: std::array::from_fn(|slot| resources.cameras.set(slot)),
            shadow_data: std::array::from_fn(|slot| resources.shadow_data.set(slot)),
            nodes: resources.nodes.set(),
            meshes: resources.mesh_data.set(),
            world: resources.world.set(),
            materials: resources.material_data.set(),
            bones: resources.bones.set(),
            skinning: resources.skinning_set(),
            sprites: resources.sprites.set(),
            lights: resources.lights.set(),
            textures: resources.tables.set(),
        };

        let ctx = PassCtx {
            device: device.raw().clone(),
            pipelines,
            volumes,
            shadows,
            debug,
            cameras: Vec::new(),
            lights: Vec::new(),
            counts: Default::default(),
            features: config.features,
            sets,
            vertex_buffer: resources.mesh_arena.vertex_buffer(),
            index_buffer: resources.mesh_arena.index_buffer(),
            env: EnvSettings::default(),
            tonemap: TonemapSettings::default(),
            present_camera: 0,
            swapchain_image_index: 0,
            swapchain_extent: target.extent(),
            post_framebuffers: Vec::new(),
            ui: None,
        };

        Ok(Renderer {
            device,
            resources,
            target,
            pacer,
            scene: Scene::new(),
            graph: None,
            ctx,
            commands,
            config,
            compiled_topology: None,
            environment: None,
            brdf_lut: None,
        })
    }

    /// The scene snapshot.
    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    /// Mutable scene access for the embedder's per-frame updates.
    pub fn scene_mut(&mut self) -> &mut Scene {
        &mut self.scene
    }

    /// The resource manager, for mesh/material/texture creation.
    pub fn resources(&mut self) -> (&Device, &mut Resources) {
        (&self.device, &mut self.resources)
    }

    /// Debug line queue.
    pub fn debug_draw(&mut self) -> &mut DebugDraw {
        &mut self.ctx.debug
    }

    /// Install the UI overlay collaborator.
    pub fn set_ui(&mut self, ui: Box<dyn UiOverlay>) {
        self.ctx.ui = Some(ui);
    }

    /// Install a pre-decoded environment cubemap (asset decoding is the
    /// embedder's job).
    pub fn set_environment(
        &mut self,
        size: u32,
        mip_levels: u32,
        format: vk::Format,
        texels: &[u8],
    ) -> Result<(), RenderError> {
        if let Some(old) = self.environment.take() {
            self.device.wait_idle();
            self.resources.free_texture_cube(&self.device, old)?;
        }
        let (handle, index) = self.resources.allocate_texture_cube(
            &self.device,
            size,
            format,
            vk::ImageUsageFlags::SAMPLED,
            mip_levels,
            Some(texels),
        )?;
        self.environment = Some(handle);
        self.ctx.env.environment_index = index;
        self.ctx.env.max_lod = (mip_levels.max(1) - 1) as f32;
        if self.ctx.env.intensity == 0.0 {
            self.ctx.env.intensity = 1.0;
        }
        Ok(())
    }

    /// Install a pre-decoded BRDF lookup table.
    pub fn set_brdf_lut(
        &mut self,
        extent: vk::Extent2D,
        format: vk::Format,
        texels: &[u8],
    ) -> Result<(), RenderError> {
        if let Some(old) = self.brdf_lut.take() {
            self.device.wait_idle();
            self.resources.free_texture_2d(&self.device, old)?;
        }
        let (handle, index) = self.resources.allocate_texture_2d(
            &self.device,
            extent,
            format,
            vk::ImageUsageFlags::SAMPLED,
            false,
            Some(texels),
        )?;
        self.brdf_lut = Some(handle);
        self.ctx.env.brdf_lut_index = index;
        Ok(())
    }

    /// Image-based-lighting intensity multiplier.
    pub fn set_ibl_intensity(&mut self, intensity: f32) {
        self.ctx.env.intensity = intensity;
    }

    /// Resize: wait idle, recreate the swapchain, update camera aspect
    /// ratios and mark the graph for recompilation.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), RenderError> {
        self.device.wait_idle();
        self.target
            .recreate(&self.device, vk::Extent2D { width, height })?;
        let extent = self.target.extent();
        self.ctx.swapchain_extent = extent;

        let handles: Vec<Handle<Camera>> = self.scene.active_cameras();
        for handle in handles {
            if let Some(camera) = self.scene.cameras.get_mut(handle) {
                if camera.enabled_passes.contains(CameraPasses::PRESENT) {
                    camera.extent = (extent.width, extent.height);
                    camera
                        .projection
                        .set_aspect(extent.width as f32 / extent.height.max(1) as f32);
                }
            }
        }
        self.scene.invalidate_topology();
        Ok(())
    }

    /// Render one frame. Recoverable swapchain conditions recreate the
    /// swapchain and skip the frame.
    pub fn render_frame(&mut self) -> Result<(), RenderError> {
        self.pacer.wait_current(&self.device)?;
        let frame = self.pacer.frame() as usize;
        let fif = frame % FRAMES_IN_FLIGHT;

        // CPU → GPU mirrors, shadow slot assignment.
        let counts = self.scene.sync_frame(
            &self.device,
            &mut self.resources,
            &mut self.ctx.shadows,
            fif,
        );
        self.ctx.counts = counts;
        self.ctx.debug.flush(frame);

        // Compacted per-light state for the lighting pass.
        self.ctx.lights.clear();
        for (_, light) in self.scene.lights.iter() {
            if self.ctx.lights.len() >= kiln_core::MAX_LIGHTS as usize {
                break;
            }
            let shadow_map_index = if light.shadow_index == INVALID_SHADOW_INDEX {
                0
            } else {
                self.ctx.shadows.texture_index(light.shadow_index, fif)
            };
            self.ctx.lights.push(LightFrame {
                kind: light.kind.gpu_kind(),
                shadow_slot: light.shadow_index,
                shadow_map_index,
            });
        }

        // Present camera: first active camera with the PRESENT bit.
        let active = self.scene.active_cameras();
        self.ctx.present_camera = active
            .iter()
            .position(|&handle| {
                self.scene
                    .cameras
                    .get(handle)
                    .map_or(false, |camera| {
                        camera.enabled_passes.contains(CameraPasses::PRESENT)
                    })
            })
            .unwrap_or(0) as u32;

        // Recompile on topology change only; the frame index never
        // triggers this.
        if self.compiled_topology != Some(self.scene.topology_version()) {
            self.rebuild()?;
        }

        // Shadow framebuffers for this frame's assigned slots.
        for slot in 0..self.ctx.shadows.active_slots() {
            self.ctx.shadows.framebuffer(
                &self.device,
                slot,
                frame,
                self.ctx.pipelines.rp_depth_only,
            )?;
        }

        self.bind_externals(frame, fif);

        // Acquire; out-of-date swapchains recreate and skip the frame.
        let (image_index, suboptimal) = match self.pacer.acquire(&self.target) {
            Ok(result) => result,
            Err(RenderError::SwapchainOutOfDate) => {
                let extent = self.target.extent();
                self.resize(extent.width, extent.height)?;
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        self.ctx.swapchain_image_index = image_index;
        if let Some(graph) = self.graph.as_mut() {
            graph.bind_external_texture(
                "swapchain",
                0,
                self.target.image(image_index),
                self.target.view(image_index),
            );
        }

        // Record.
        let graphics_cmd = self.commands.graphics_buffers[fif];
        let compute_cmd = self.commands.compute_buffers.get(fif).copied();
        unsafe {
            self.device
                .raw()
                .reset_command_pool(
                    self.commands.graphics_pools[fif],
                    vk::CommandPoolResetFlags::empty(),
                )
                .map_err(RenderError::from)?;
            self.device
                .raw()
                .begin_command_buffer(
                    graphics_cmd,
                    &vk::CommandBufferBeginInfo::builder()
                        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                )
                .map_err(RenderError::from)?;
            if let Some(compute_cmd) = compute_cmd {
                self.device
                    .raw()
                    .reset_command_pool(
                        self.commands.compute_pools[fif],
                        vk::CommandPoolResetFlags::empty(),
                    )
                    .map_err(RenderError::from)?;
                self.device
                    .raw()
                    .begin_command_buffer(
                        compute_cmd,
                        &vk::CommandBufferBeginInfo::builder()
                            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                    )
                    .map_err(RenderError::from)?;
            }
        }

        let use_async = compute_cmd.is_some()
            && self
                .graph
                .as_ref()
                .map_or(false, |graph| graph.plan().has_cross_queue_edge);
        let queues = RecordedQueues {
            graphics: graphics_cmd,
            compute: if use_async { compute_cmd } else { None },
        };
        if let Some(graph) = self.graph.as_ref() {
            graph.execute(&self.device, frame, &queues, &mut self.ctx);
        }

        unsafe {
            self.device
                .raw()
                .end_command_buffer(graphics_cmd)
                .map_err(RenderError::from)?;
            if let Some(compute_cmd) = compute_cmd {
                self.device
                    .raw()
                    .end_command_buffer(compute_cmd)
                    .map_err(RenderError::from)?;
            }
        }

        let result = self.pacer.submit_and_present(
            &self.device,
            &self.target,
            image_index,
            graphics_cmd,
            if use_async { compute_cmd } else { None },
        );
        match result {
            Ok(false) if !suboptimal => Ok(()),
            Ok(_) | Err(RenderError::SwapchainOutOfDate) => {
                let extent = self.target.extent();
                self.resize(extent.width, extent.height)
            }
            Err(err) => Err(err),
        }
    }

    /// Bind the per-frame external resources: bucket draw buffers, shadow
    /// buffers and maps, and the pyramid copies.
    fn bind_externals(&mut self, frame: usize, fif: usize) {
        let Some(graph) = self.graph.as_mut() else {
            return;
        };
        for (camera_index, camera) in self.ctx.cameras.iter().enumerate() {
            if !camera.enabled.contains(CameraPasses::GEOMETRY) {
                continue;
            }
            for bucket in Bucket::ALL {
                let (draws_name, count_name) = bucket_names(bucket);
                graph.bind_external_buffer(
                    &format!("{draws_name}_cam_{camera_index}"),
                    0,
                    camera.cull.commands(bucket, frame),
                );
                graph.bind_external_buffer(
                    &format!("{count_name}_cam_{camera_index}"),
                    0,
                    camera.cull.count(bucket, frame),
                );
            }
            if self.ctx.features.depth_pyramid {
                for copy in 0..FRAMES_IN_FLIGHT {
                    graph.bind_external_texture(
                        &format!("pyramid_cam_{camera_index}"),
                        copy,
                        camera.cull.pyramid.image(copy),
                        camera.cull.pyramid.view(copy),
                    );
                }
            }
        }
        for slot in 0..self.ctx.shadows.active_slots() {
            if let Some(slot_data) = self.ctx.shadows.slot(slot) {
                graph.bind_external_buffer(
                    &format!("shadow_draws_light_{slot}"),
                    0,
                    slot_data.draw_commands[fif].raw(),
                );
                graph.bind_external_buffer(
                    &format!("shadow_count_light_{slot}"),
                    0,
                    slot_data.draw_counts[fif].raw(),
                );
            }
            if let Some((image, view)) = self.ctx.shadows.render_target(slot, frame) {
                graph.bind_external_texture(&format!("shadow_map_light_{slot}"), 0, image, view);
            }
        }
    }

    /// Recompile the graph and rebuild everything derived from its
    /// transient resources: per-camera cull state, framebuffers, G-buffer
    /// bindless slots and pyramid reduction sets.
    fn rebuild(&mut self) -> Result<(), RenderError> {
        self.device.wait_idle();

        if let Some(old) = self.graph.take() {
            old.dispose(&self.device);
        }
        self.destroy_camera_frames();
        self.destroy_post_framebuffers();

        // Fresh per-camera state at current extents.
        let active = self.scene.active_cameras();
        for &handle in &active {
            let camera: &Camera = self
                .scene
                .cameras
                .get(handle)
                .expect("active camera is live");
            let cull = CameraCull::new(
                &self.device,
                &mut self.resources,
                self.ctx.pipelines.cull_output_layout,
                camera.extent.0.max(1),
                camera.extent.1.max(1),
            )?;
            self.ctx.cameras.push(CameraFrame {
                extent: vk::Extent2D {
                    width: camera.extent.0.max(1),
                    height: camera.extent.1.max(1),
                },
                enabled: camera.enabled_passes,
                cull,
                fb_prepass: vk::Framebuffer::null(),
                fb_gbuffer: vk::Framebuffer::null(),
                fb_ambient: vk::Framebuffer::null(),
                fb_forward: vk::Framebuffer::null(),
                gbuffer_indices: [0; 5],
                final_color_index: 0,
            });
        }

        let compile_ctx = CompileContext {
            camera_count: self.ctx.cameras.len() as u32,
            light_count: self.ctx.counts.shadow_slot_count,
            async_compute: self.config.features.async_compute
                && self.device.has_dedicated_compute(),
        };
        let decls = build_decls();
        let graph = Graph::compile(&decls, &compile_ctx, &self.device, &mut self.ctx)?;

        // Framebuffers and bindless views over the realized transients.
        for camera_index in 0..self.ctx.cameras.len() {
            self.build_camera_frame(&graph, camera_index)?;
        }

        for index in 0..self.target.image_count() {
            let attachments = [self.target.view(index as u32)];
            let framebuffer = unsafe {
                self.device
                    .raw()
                    .create_framebuffer(
                        &vk::FramebufferCreateInfo::builder()
                            .render_pass(self.ctx.pipelines.rp_post)
                            .attachments(&attachments)
                            .width(self.target.extent().width)
                            .height(self.target.extent().height)
                            .layers(1),
                        None,
                    )
                    .map_err(RenderError::from)?
            };
            self.ctx.post_framebuffers.push(framebuffer);
        }

        self.graph = Some(graph);
        self.compiled_topology = Some(self.scene.topology_version());
        log::debug!(
            "graph rebuilt: {} cameras, {} shadow slots",
            self.ctx.cameras.len(),
            self.ctx.counts.shadow_slot_count
        );
        Ok(())
    }

    fn build_camera_frame(
        &mut self,
        graph: &Graph<PassCtx>,
        camera_index: usize,
    ) -> Result<(), RenderError> {
        let frame = &mut self.ctx.cameras[camera_index];
        if !frame.enabled.contains(CameraPasses::GEOMETRY) {
            return Ok(());
        }
        let suffix = format!("_cam_{camera_index}");
        let view = |name: &str| graph.texture_view(&format!("{name}{suffix}"), 0);

        let depth = view("depth").ok_or(RenderError::InvalidHandle)?;
        let make_framebuffer = |device: &Device,
                                render_pass: vk::RenderPass,
                                attachments: &[vk::ImageView],
                                extent: vk::Extent2D|
         -> Result<vk::Framebuffer, RenderError> {
            unsafe {
                device
                    .raw()
                    .create_framebuffer(
                        &vk::FramebufferCreateInfo::builder()
                            .render_pass(render_pass)
                            .attachments(attachments)
                            .width(extent.width)
                            .height(extent.height)
                            .layers(1),
                        None,
                    )
                    .map_err(RenderError::from)
            }
        };

        frame.fb_prepass = make_framebuffer(
            &self.device,
            self.ctx.pipelines.rp_depth_only,
            &[depth],
            frame.extent,
        )?;

        let gbuffer_names = [
            "gbuffer_position",
            "gbuffer_normal",
            "gbuffer_albedo",
            "gbuffer_mr",
            "gbuffer_emissive",
        ];
        let mut gbuffer_views = Vec::with_capacity(6);
        for name in gbuffer_names {
            gbuffer_views.push(view(name).ok_or(RenderError::InvalidHandle)?);
        }
        gbuffer_views.push(depth);
        frame.fb_gbuffer = make_framebuffer(
            &self.device,
            self.ctx.pipelines.rp_gbuffer,
            &gbuffer_views,
            frame.extent,
        )?;

        // Shader access to the G-buffer goes through bindless indices.
        for (slot, name) in gbuffer_names.iter().enumerate() {
            let index = self.resources.tables.alloc_index()?;
            self.resources.tables.write_texture(
                &self.device,
                index,
                view(name).expect("gbuffer view exists"),
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
            frame.gbuffer_indices[slot] = index;
        }

        if frame.enabled.contains(CameraPasses::LIGHTING) {
            let final_color = view("final_color").ok_or(RenderError::InvalidHandle)?;
            frame.fb_ambient = make_framebuffer(
                &self.device,
                self.ctx.pipelines.rp_ambient,
                &[final_color],
                frame.extent,
            )?;
            frame.fb_forward = make_framebuffer(
                &self.device,
                self.ctx.pipelines.rp_forward,
                &[final_color, depth],
                frame.extent,
            )?;
            let index = self.resources.tables.alloc_index()?;
            self.resources.tables.write_texture(
                &self.device,
                index,
                final_color,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
            frame.final_color_index = index;
        }

        if self.config.features.depth_pyramid {
            frame.cull.pyramid.build_reduce_sets(
                &self.device,
                &mut self.resources,
                self.ctx.pipelines.reduce_set_layout,
                depth,
            )?;
        }
        Ok(())
    }

    fn destroy_camera_frames(&mut self) {
        for frame in self.ctx.cameras.drain(..) {
            unsafe {
                for framebuffer in [
                    frame.fb_prepass,
                    frame.fb_gbuffer,
                    frame.fb_ambient,
                    frame.fb_forward,
                ] {
                    if framebuffer != vk::Framebuffer::null() {
                        self.device.raw().destroy_framebuffer(framebuffer, None);
                    }
                }
            }
            for index in frame.gbuffer_indices {
                if index != 0 {
                    self.resources.tables.free_index(index);
                }
            }
            if frame.final_color_index != 0 {
                self.resources.tables.free_index(frame.final_color_index);
            }
            frame.cull.dispose(&self.device, &mut self.resources);
        }
    }

    fn destroy_post_framebuffers(&mut self) {
        unsafe {
            for framebuffer in self.ctx.post_framebuffers.drain(..) {
                self.device.raw().destroy_framebuffer(framebuffer, None);
            }
        }
    }

    /// Tear everything down in dependency order.
    pub fn dispose(mut self) {
        self.device.wait_idle();
        if let Some(graph) = self.graph.take() {
            graph.dispose(&self.device);
        }
        self.destroy_camera_frames();
        self.destroy_post_framebuffers();

        let PassCtx {
            pipelines,
            volumes,
            shadows,
            debug,
            ..
        } = self.ctx;
        shadows.dispose(&self.device, &mut self.resources);
        debug.dispose(&self.device);
        volumes.dispose(&self.device);
        pipelines.dispose(&self.device);

        self.commands.dispose(&self.device);
        self.pacer.dispose(&self.device);
        self.target.dispose(&self.device);
        self.resources.dispose(&self.device);
        self.device.dispose();
    }
}
