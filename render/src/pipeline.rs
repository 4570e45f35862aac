//! Shader compilation and pipeline construction.
//!
//! GLSL sources are embedded and compiled to SPIR-V with shaderc at
//! pipeline-build time; every stage gets the shared preamble with the
//! specialization-constant block so shader loops stay bounded by the same
//! limits the CPU uses.

use std::ffi::CStr;

use ash::vk;

use kiln_core::{RenderError, MAX_DEPTH_MIPS_LEVEL, MAX_LIGHTS, MAX_SHADOW_MAPS};
use kiln_resource::{create_layout, Device, Resources};

use crate::shadow::SHADOW_FORMAT;

/// G-buffer attachment formats, in attachment order.
pub const GBUFFER_POSITION_FORMAT: vk::Format = vk::Format::R32G32B32A32_SFLOAT;
/// Normal attachment format.
pub const GBUFFER_NORMAL_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;
/// Albedo attachment format.
pub const GBUFFER_ALBEDO_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;
/// Metallic-roughness attachment format.
pub const GBUFFER_MR_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;
/// Emissive attachment format.
pub const GBUFFER_EMISSIVE_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;
/// Scene depth format.
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;
/// Final color (pre-tonemap) format.
pub const FINAL_COLOR_FORMAT: vk::Format = vk::Format::B8G8R8A8_SRGB;

const PREAMBLE: &str = concat!(
    "#version 450\n",
    "#extension GL_EXT_nonuniform_qualifier : enable\n",
    include_str!("shaders/common.glsl"),
);

/// Wrapper over the shaderc compiler with the shared preamble applied.
pub struct ShaderCompiler {
    compiler: shaderc::Compiler,
}

impl std::fmt::Debug for ShaderCompiler {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("ShaderCompiler").finish()
    }
}

impl ShaderCompiler {
    /// Create the compiler.
    pub fn new() -> Result<Self, RenderError> {
        let compiler = shaderc::Compiler::new().ok_or_else(|| {
            RenderError::InitializationFailed("shaderc initialization failed".into())
        })?;
        Ok(ShaderCompiler { compiler })
    }

    /// Compile one stage and wrap it in a shader module.
    pub fn module(
        &mut self,
        device: &Device,
        source: &str,
        kind: shaderc::ShaderKind,
        name: &str,
    ) -> Result<vk::ShaderModule, RenderError> {
        let full = format!("{PREAMBLE}{source}");
        let artifact = self
            .compiler
            .compile_into_spirv(&full, kind, name, "main", None)
            .map_err(|err| {
                RenderError::InitializationFailed(format!("shader `{name}`: {err}"))
            })?;
        unsafe {
            device
                .raw()
                .create_shader_module(
                    &vk::ShaderModuleCreateInfo::builder().code(artifact.as_binary()),
                    None,
                )
                .map_err(RenderError::from)
        }
    }
}

/// Specialization data shared by all shaders.
struct SpecConstants {
    entries: [vk::SpecializationMapEntry; 3],
    data: [u32; 3],
}

impl SpecConstants {
    fn new() -> Self {
        SpecConstants {
            entries: [
                vk::SpecializationMapEntry {
                    constant_id: 0,
                    offset: 0,
                    size: 4,
                },
                vk::SpecializationMapEntry {
                    constant_id: 1,
                    offset: 4,
                    size: 4,
                },
                vk::SpecializationMapEntry {
                    constant_id: 2,
                    offset: 8,
                    size: 4,
                },
            ],
            data: [MAX_LIGHTS, MAX_SHADOW_MAPS, MAX_DEPTH_MIPS_LEVEL],
        }
    }

    fn info(&self) -> vk::SpecializationInfo {
        vk::SpecializationInfo::builder()
            .map_entries(&self.entries)
            .data(bytemuck::cast_slice(&self.data))
            .build()
    }
}

fn entry_point() -> &'static CStr {
    unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") }
}

/// Create a pipeline layout from set layouts and one push-constant range.
pub fn create_pipeline_layout(
    device: &Device,
    sets: &[vk::DescriptorSetLayout],
    push_size: u32,
    push_stages: vk::ShaderStageFlags,
) -> Result<vk::PipelineLayout, RenderError> {
    let ranges = [vk::PushConstantRange {
        stage_flags: push_stages,
        offset: 0,
        size: push_size,
    }];
    let mut info = vk::PipelineLayoutCreateInfo::builder().set_layouts(sets);
    if push_size > 0 {
        info = info.push_constant_ranges(&ranges);
    }
    unsafe {
        device
            .raw()
            .create_pipeline_layout(&info, None)
            .map_err(RenderError::from)
    }
}

fn create_compute_pipeline(
    device: &Device,
    module: vk::ShaderModule,
    layout: vk::PipelineLayout,
    spec: &SpecConstants,
) -> Result<vk::Pipeline, RenderError> {
    let spec_info = spec.info();
    let stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(module)
        .name(entry_point())
        .specialization_info(&spec_info)
        .build();
    let info = vk::ComputePipelineCreateInfo::builder()
        .stage(stage)
        .layout(layout)
        .build();
    let pipelines = unsafe {
        device
            .raw()
            .create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
            .map_err(|(_, err)| RenderError::from(err))?
    };
    Ok(pipelines[0])
}

/// Blend behavior of a color attachment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Blend {
    /// No blending.
    Opaque,
    /// Standard over blending.
    Alpha,
    /// ONE/ONE accumulation (light volumes).
    Additive,
}

fn blend_state(blend: Blend) -> vk::PipelineColorBlendAttachmentState {
    let mut state = vk::PipelineColorBlendAttachmentState {
        color_write_mask: vk::ColorComponentFlags::RGBA,
        ..Default::default()
    };
    match blend {
        Blend::Opaque => {}
        Blend::Alpha => {
            state.blend_enable = vk::TRUE;
            state.src_color_blend_factor = vk::BlendFactor::SRC_ALPHA;
            state.dst_color_blend_factor = vk::BlendFactor::ONE_MINUS_SRC_ALPHA;
            state.color_blend_op = vk::BlendOp::ADD;
            state.src_alpha_blend_factor = vk::BlendFactor::ONE;
            state.dst_alpha_blend_factor = vk::BlendFactor::ONE_MINUS_SRC_ALPHA;
            state.alpha_blend_op = vk::BlendOp::ADD;
        }
        Blend::Additive => {
            state.blend_enable = vk::TRUE;
            state.src_color_blend_factor = vk::BlendFactor::ONE;
            state.dst_color_blend_factor = vk::BlendFactor::ONE;
            state.color_blend_op = vk::BlendOp::ADD;
            state.src_alpha_blend_factor = vk::BlendFactor::ONE;
            state.dst_alpha_blend_factor = vk::BlendFactor::ONE;
            state.alpha_blend_op = vk::BlendOp::ADD;
        }
    }
    state
}

/// Vertex stream a graphics pipeline consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VertexInput {
    /// The global mesh vertex stream (position+u, normal+v, tangent).
    Mesh,
    /// Debug line vertices (position, color).
    DebugLines,
    /// No vertex buffer (fullscreen triangles).
    None,
}

/// Everything that varies between the renderer's graphics pipelines.
#[derive(Debug)]
pub struct GraphicsPipelineDesc {
    /// Vertex shader module.
    pub vertex: vk::ShaderModule,
    /// Optional geometry shader module.
    pub geometry: Option<vk::ShaderModule>,
    /// Optional fragment shader module (depth-only passes have none).
    pub fragment: Option<vk::ShaderModule>,
    /// Vertex stream.
    pub input: VertexInput,
    /// Primitive topology.
    pub topology: vk::PrimitiveTopology,
    /// Polygon mode (wireframe bucket uses LINE).
    pub polygon_mode: vk::PolygonMode,
    /// Face culling.
    pub cull_mode: vk::CullModeFlags,
    /// Depth test enable.
    pub depth_test: bool,
    /// Depth write enable.
    pub depth_write: bool,
    /// Depth compare op.
    pub depth_compare: vk::CompareOp,
    /// Whether the render pass has a depth attachment at all.
    pub has_depth: bool,
    /// Color blend per attachment; length = attachment count.
    pub blends: &'static [Blend],
    /// Target render pass.
    pub render_pass: vk::RenderPass,
    /// Pipeline layout.
    pub layout: vk::PipelineLayout,
}

impl GraphicsPipelineDesc {
    fn defaults(
        vertex: vk::ShaderModule,
        fragment: Option<vk::ShaderModule>,
        render_pass: vk::RenderPass,
        layout: vk::PipelineLayout,
    ) -> Self {
        GraphicsPipelineDesc {
            vertex,
            geometry: None,
            fragment,
            input: VertexInput::Mesh,
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            depth_test: true,
            depth_write: true,
            depth_compare: vk::CompareOp::LESS,
            has_depth: true,
            blends: &[Blend::Opaque],
            render_pass,
            layout,
        }
    }
}

/// Build one graphics pipeline with dynamic viewport/scissor.
pub fn create_graphics_pipeline(
    device: &Device,
    desc: &GraphicsPipelineDesc,
) -> Result<vk::Pipeline, RenderError> {
    let spec = SpecConstants::new();
    let spec_info = spec.info();

    let mut stages = vec![vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::VERTEX)
        .module(desc.vertex)
        .name(entry_point())
        .specialization_info(&spec_info)
        .build()];
    if let Some(geometry) = desc.geometry {
        stages.push(
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::GEOMETRY)
                .module(geometry)
                .name(entry_point())
                .specialization_info(&spec_info)
                .build(),
        );
    }
    if let Some(fragment) = desc.fragment {
        stages.push(
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fragment)
                .name(entry_point())
                .specialization_info(&spec_info)
                .build(),
        );
    }

    let (bindings, attributes): (
        Vec<vk::VertexInputBindingDescription>,
        Vec<vk::VertexInputAttributeDescription>,
    ) = match desc.input {
        VertexInput::Mesh => (
            vec![vk::VertexInputBindingDescription {
                binding: 0,
                stride: std::mem::size_of::<kiln_resource::GpuVertex>() as u32,
                input_rate: vk::VertexInputRate::VERTEX,
            }],
            vec![
                vk::VertexInputAttributeDescription {
                    location: 0,
                    binding: 0,
                    format: vk::Format::R32G32B32A32_SFLOAT,
                    offset: 0,
                },
                vk::VertexInputAttributeDescription {
                    location: 1,
                    binding: 0,
                    format: vk::Format::R32G32B32A32_SFLOAT,
                    offset: 16,
                },
                vk::VertexInputAttributeDescription {
                    location: 2,
                    binding: 0,
                    format: vk::Format::R32G32B32A32_SFLOAT,
                    offset: 32,
                },
            ],
        ),
        VertexInput::DebugLines => (
            vec![vk::VertexInputBindingDescription {
                binding: 0,
                stride: 28,
                input_rate: vk::VertexInputRate::VERTEX,
            }],
            vec![
                vk::VertexInputAttributeDescription {
                    location: 0,
                    binding: 0,
                    format: vk::Format::R32G32B32_SFLOAT,
                    offset: 0,
                },
                vk::VertexInputAttributeDescription {
                    location: 1,
                    binding: 0,
                    format: vk::Format::R32G32B32A32_SFLOAT,
                    offset: 12,
                },
            ],
        ),
        VertexInput::None => (Vec::new(), Vec::new()),
    };

    let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(desc.topology)
        .primitive_restart_enable(false);

    let viewport = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);

    let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
        .polygon_mode(desc.polygon_mode)
        .cull_mode(desc.cull_mode)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .line_width(1.0);

    let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(desc.depth_test)
        .depth_write_enable(desc.depth_write)
        .depth_compare_op(desc.depth_compare);

    let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> =
        desc.blends.iter().map(|&blend| blend_state(blend)).collect();
    let color_blend =
        vk::PipelineColorBlendStateCreateInfo::builder().attachments(&blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    let mut info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport)
        .rasterization_state(&rasterization)
        .multisample_state(&multisample)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic)
        .layout(desc.layout)
        .render_pass(desc.render_pass)
        .subpass(0);
    if desc.has_depth {
        info = info.depth_stencil_state(&depth_stencil);
    }

    let pipelines = unsafe {
        device
            .raw()
            .create_graphics_pipelines(vk::PipelineCache::null(), &[info.build()], None)
            .map_err(|(_, err)| RenderError::from(err))?
    };
    Ok(pipelines[0])
}

// ── Render passes ─────────────────────────────────────────────────────────

fn attachment(
    format: vk::Format,
    load_op: vk::AttachmentLoadOp,
    initial: vk::ImageLayout,
    final_layout: vk::ImageLayout,
) -> vk::AttachmentDescription {
    vk::AttachmentDescription {
        format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: initial,
        final_layout,
        ..Default::default()
    }
}

/// Depth-only render pass (prepass and shadow maps). The graph has moved
/// the attachment into DEPTH_STENCIL_ATTACHMENT_OPTIMAL before the pass;
/// later readers transition it themselves.
pub fn create_depth_only_pass(device: &Device) -> Result<vk::RenderPass, RenderError> {
    let attachments = [attachment(
        SHADOW_FORMAT,
        vk::AttachmentLoadOp::CLEAR,
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    )];
    let depth_ref = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };
    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .depth_stencil_attachment(&depth_ref)
        .build();
    unsafe {
        device
            .raw()
            .create_render_pass(
                &vk::RenderPassCreateInfo::builder()
                    .attachments(&attachments)
                    .subpasses(&[subpass]),
                None,
            )
            .map_err(RenderError::from)
    }
}

/// The five-color G-buffer pass; depth is loaded from the prepass.
pub fn create_gbuffer_pass(device: &Device) -> Result<vk::RenderPass, RenderError> {
    let color = |format| {
        attachment(
            format,
            vk::AttachmentLoadOp::CLEAR,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        )
    };
    let attachments = [
        color(GBUFFER_POSITION_FORMAT),
        color(GBUFFER_NORMAL_FORMAT),
        color(GBUFFER_ALBEDO_FORMAT),
        color(GBUFFER_MR_FORMAT),
        color(GBUFFER_EMISSIVE_FORMAT),
        attachment(
            DEPTH_FORMAT,
            vk::AttachmentLoadOp::LOAD,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ),
    ];
    let color_refs: Vec<vk::AttachmentReference> = (0..5)
        .map(|index| vk::AttachmentReference {
            attachment: index,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        })
        .collect();
    let depth_ref = vk::AttachmentReference {
        attachment: 5,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };
    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs)
        .depth_stencil_attachment(&depth_ref)
        .build();
    unsafe {
        device
            .raw()
            .create_render_pass(
                &vk::RenderPassCreateInfo::builder()
                    .attachments(&attachments)
                    .subpasses(&[subpass]),
                None,
            )
            .map_err(RenderError::from)
    }
}

/// Single-color pass over `final_color`: CLEAR for the ambient pass, LOAD
/// for everything stacked on top. With `with_depth`, the scene depth is
/// attached read-only for depth testing.
pub fn create_color_pass(
    device: &Device,
    format: vk::Format,
    clear: bool,
    with_depth: bool,
) -> Result<vk::RenderPass, RenderError> {
    let load_op = if clear {
        vk::AttachmentLoadOp::CLEAR
    } else {
        vk::AttachmentLoadOp::LOAD
    };
    let mut attachments = vec![attachment(
        format,
        load_op,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    )];
    if with_depth {
        attachments.push(attachment(
            DEPTH_FORMAT,
            vk::AttachmentLoadOp::LOAD,
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        ));
    }

    let color_refs = [vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    let depth_ref = vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
    };
    let mut subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs);
    if with_depth {
        subpass = subpass.depth_stencil_attachment(&depth_ref);
    }
    let subpass = subpass.build();
    unsafe {
        device
            .raw()
            .create_render_pass(
                &vk::RenderPassCreateInfo::builder()
                    .attachments(&attachments)
                    .subpasses(&[subpass]),
                None,
            )
            .map_err(RenderError::from)
    }
}

// ── The pipeline set ──────────────────────────────────────────────────────

/// Every long-lived pipeline, layout and render pass of the renderer.
pub struct Pipelines {
    /// Depth-only render pass (prepass + shadows).
    pub rp_depth_only: vk::RenderPass,
    /// G-buffer population pass.
    pub rp_gbuffer: vk::RenderPass,
    /// Ambient pass over final_color (CLEAR).
    pub rp_ambient: vk::RenderPass,
    /// Light volumes and overlays over final_color (LOAD + read-only depth).
    pub rp_forward: vk::RenderPass,
    /// Post-process into the swapchain image.
    pub rp_post: vk::RenderPass,
    /// UI overlay over the swapchain image.
    pub rp_ui: vk::RenderPass,

    /// Reduction set layout (input sampler + output image).
    pub reduce_set_layout: vk::DescriptorSetLayout,
    /// Cull output set layout (commands + count).
    pub cull_output_layout: vk::DescriptorSetLayout,

    /// Camera cull compute.
    pub cull_layout: vk::PipelineLayout,
    /// Camera cull pipeline.
    pub cull: vk::Pipeline,
    /// Shadow cull compute.
    pub shadow_cull_layout: vk::PipelineLayout,
    /// Shadow cull pipeline.
    pub shadow_cull: vk::Pipeline,
    /// Depth reduction compute.
    pub reduce_layout: vk::PipelineLayout,
    /// Depth reduction pipeline.
    pub reduce: vk::Pipeline,

    /// Shared layout of the mesh draw passes.
    pub draw_layout: vk::PipelineLayout,
    /// Depth prepass pipeline.
    pub prepass: vk::Pipeline,
    /// G-buffer pipeline.
    pub gbuffer: vk::Pipeline,
    /// Shadow draw layout.
    pub shadow_layout: vk::PipelineLayout,
    /// 2D shadow pipeline.
    pub shadow_2d: vk::Pipeline,
    /// Cube shadow pipeline (geometry-shader replication).
    pub shadow_cube: vk::Pipeline,

    /// Ambient/IBL layout.
    pub ambient_layout: vk::PipelineLayout,
    /// Ambient/IBL pipeline.
    pub ambient: vk::Pipeline,
    /// Light volume layout.
    pub lighting_layout: vk::PipelineLayout,
    /// Point-light volume pipeline.
    pub light_point: vk::Pipeline,
    /// Spot-light volume pipeline.
    pub light_spot: vk::Pipeline,
    /// Directional fullscreen pipeline.
    pub light_directional: vk::Pipeline,

    /// Transparent overlay pipeline.
    pub fwd_transparent: vk::Pipeline,
    /// Wireframe overlay pipeline.
    pub fwd_wireframe: vk::Pipeline,
    /// Random-color overlay pipeline.
    pub fwd_random: vk::Pipeline,
    /// Line-strip overlay pipeline.
    pub fwd_line_strip: vk::Pipeline,
    /// Sprite layout.
    pub sprite_layout: vk::PipelineLayout,
    /// Sprite pipeline.
    pub sprite: vk::Pipeline,
    /// Debug line layout.
    pub debug_layout: vk::PipelineLayout,
    /// Debug line pipeline.
    pub debug: vk::Pipeline,
    /// Post-process layout.
    pub post_layout: vk::PipelineLayout,
    /// Post-process pipeline.
    pub post: vk::Pipeline,

    modules: Vec<vk::ShaderModule>,
}

impl std::fmt::Debug for Pipelines {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Pipelines")
            .field("modules", &self.modules.len())
            .finish()
    }
}

impl Pipelines {
    /// Compile every shader and build every pipeline.
    pub fn new(
        device: &Device,
        resources: &Resources,
        swapchain_format: vk::Format,
    ) -> Result<Self, RenderError> {
        use shaderc::ShaderKind;

        let mut compiler = ShaderCompiler::new()?;
        let mut modules = Vec::new();
        let module = |compiler: &mut ShaderCompiler,
                          modules: &mut Vec<vk::ShaderModule>,
                          source: &str,
                          kind: ShaderKind,
                          name: &str|
         -> Result<vk::ShaderModule, RenderError> {
            let module = compiler.module(device, source, kind, name)?;
            modules.push(module);
            Ok(module)
        };

        let cull_comp = module(
            &mut compiler,
            &mut modules,
            include_str!("shaders/cull.comp"),
            ShaderKind::Compute,
            "cull.comp",
        )?;
        let shadow_cull_comp = module(
            &mut compiler,
            &mut modules,
            include_str!("shaders/shadow_cull.comp"),
            ShaderKind::Compute,
            "shadow_cull.comp",
        )?;
        let reduce_comp = module(
            &mut compiler,
            &mut modules,
            include_str!("shaders/depth_reduce.comp"),
            ShaderKind::Compute,
            "depth_reduce.comp",
        )?;
        let prepass_vert = module(
            &mut compiler,
            &mut modules,
            include_str!("shaders/prepass.vert"),
            ShaderKind::Vertex,
            "prepass.vert",
        )?;
        let gbuffer_vert = module(
            &mut compiler,
            &mut modules,
            include_str!("shaders/gbuffer.vert"),
            ShaderKind::Vertex,
            "gbuffer.vert",
        )?;
        let gbuffer_frag = module(
            &mut compiler,
            &mut modules,
            include_str!("shaders/gbuffer.frag"),
            ShaderKind::Fragment,
            "gbuffer.frag",
        )?;
        let shadow_vert = module(
            &mut compiler,
            &mut modules,
            include_str!("shaders/shadow.vert"),
            ShaderKind::Vertex,
            "shadow.vert",
        )?;
        let shadow_geom = module(
            &mut compiler,
            &mut modules,
            include_str!("shaders/shadow_point.geom"),
            ShaderKind::Geometry,
            "shadow_point.geom",
        )?;
        let fullscreen_vert = module(
            &mut compiler,
            &mut modules,
            include_str!("shaders/fullscreen.vert"),
            ShaderKind::Vertex,
            "fullscreen.vert",
        )?;
        let ambient_frag = module(
            &mut compiler,
            &mut modules,
            include_str!("shaders/ambient.frag"),
            ShaderKind::Fragment,
            "ambient.frag",
        )?;
        let volume_vert = module(
            &mut compiler,
            &mut modules,
            include_str!("shaders/light_volume.vert"),
            ShaderKind::Vertex,
            "light_volume.vert",
        )?;
        let volume_frag = module(
            &mut compiler,
            &mut modules,
            include_str!("shaders/light_volume.frag"),
            ShaderKind::Fragment,
            "light_volume.frag",
        )?;
        let forward_vert = module(
            &mut compiler,
            &mut modules,
            include_str!("shaders/forward.vert"),
            ShaderKind::Vertex,
            "forward.vert",
        )?;
        let forward_frag = module(
            &mut compiler,
            &mut modules,
            include_str!("shaders/forward.frag"),
            ShaderKind::Fragment,
            "forward.frag",
        )?;
        let sprite_vert = module(
            &mut compiler,
            &mut modules,
            include_str!("shaders/sprite.vert"),
            ShaderKind::Vertex,
            "sprite.vert",
        )?;
        let sprite_frag = module(
            &mut compiler,
            &mut modules,
            include_str!("shaders/sprite.frag"),
            ShaderKind::Fragment,
            "sprite.frag",
        )?;
        let debug_vert = module(
            &mut compiler,
            &mut modules,
            include_str!("shaders/debug.vert"),
            ShaderKind::Vertex,
            "debug.vert",
        )?;
        let debug_frag = module(
            &mut compiler,
            &mut modules,
            include_str!("shaders/debug.frag"),
            ShaderKind::Fragment,
            "debug.frag",
        )?;
        let tonemap_frag = module(
            &mut compiler,
            &mut modules,
            include_str!("shaders/tonemap.frag"),
            ShaderKind::Fragment,
            "tonemap.frag",
        )?;

        // Render passes.
        let rp_depth_only = create_depth_only_pass(device)?;
        let rp_gbuffer = create_gbuffer_pass(device)?;
        let rp_ambient = create_color_pass(device, FINAL_COLOR_FORMAT, true, false)?;
        let rp_forward = create_color_pass(device, FINAL_COLOR_FORMAT, false, true)?;
        let rp_post = create_color_pass(device, swapchain_format, false, false)?;
        let rp_ui = create_color_pass(device, swapchain_format, false, false)?;

        // Auxiliary set layouts.
        let reduce_set_layout = create_layout(
            device,
            &[
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(0)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
                    .build(),
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(1)
                    .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
                    .build(),
            ],
        )?;
        let cull_output_layout = create_layout(
            device,
            &[
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(0)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
                    .build(),
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(1)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
                    .build(),
            ],
        )?;

        let layouts = &resources.layouts;
        let textures = resources.tables.layout();

        // Compute layouts + pipelines.
        let spec = SpecConstants::new();
        let cull_layout = create_pipeline_layout(
            device,
            &[
                layouts.camera,
                layouts.nodes,
                layouts.meshes,
                layouts.world,
                cull_output_layout,
                textures,
            ],
            32,
            vk::ShaderStageFlags::COMPUTE,
        )?;
        let cull = create_compute_pipeline(device, cull_comp, cull_layout, &spec)?;

        let shadow_cull_layout = create_pipeline_layout(
            device,
            &[
                layouts.shadow_data,
                layouts.nodes,
                layouts.meshes,
                layouts.world,
                cull_output_layout,
            ],
            16,
            vk::ShaderStageFlags::COMPUTE,
        )?;
        let shadow_cull =
            create_compute_pipeline(device, shadow_cull_comp, shadow_cull_layout, &spec)?;

        let reduce_layout = create_pipeline_layout(
            device,
            &[reduce_set_layout],
            8,
            vk::ShaderStageFlags::COMPUTE,
        )?;
        let reduce = create_compute_pipeline(device, reduce_comp, reduce_layout, &spec)?;

        // Draw layouts.
        let draw_layout = create_pipeline_layout(
            device,
            &[
                layouts.camera,
                textures,
                layouts.nodes,
                layouts.world,
                layouts.materials,
                layouts.bones,
                layouts.skinning,
            ],
            8,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
        )?;
        let shadow_layout = create_pipeline_layout(
            device,
            &[
                layouts.shadow_data,
                textures,
                layouts.nodes,
                layouts.world,
                layouts.materials,
                layouts.bones,
                layouts.skinning,
            ],
            8,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::GEOMETRY,
        )?;
        let sprite_layout = create_pipeline_layout(
            device,
            &[layouts.camera, textures, layouts.nodes, layouts.sprites],
            8,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
        )?;
        let ambient_layout = create_pipeline_layout(
            device,
            &[layouts.camera, textures],
            40,
            vk::ShaderStageFlags::FRAGMENT,
        )?;
        let lighting_layout = create_pipeline_layout(
            device,
            &[layouts.camera, textures, layouts.lights, layouts.shadow_data],
            28,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
        )?;
        let debug_layout = create_pipeline_layout(
            device,
            &[layouts.camera],
            4,
            vk::ShaderStageFlags::VERTEX,
        )?;
        let post_layout = create_pipeline_layout(
            device,
            &[textures],
            12,
            vk::ShaderStageFlags::FRAGMENT,
        )?;

        // Graphics pipelines.
        let prepass = create_graphics_pipeline(
            device,
            &GraphicsPipelineDesc {
                blends: &[],
                ..GraphicsPipelineDesc::defaults(prepass_vert, None, rp_depth_only, draw_layout)
            },
        )?;
        let gbuffer = create_graphics_pipeline(
            device,
            &GraphicsPipelineDesc {
                depth_write: false,
                depth_compare: vk::CompareOp::LESS_OR_EQUAL,
                blends: &[
                    Blend::Opaque,
                    Blend::Opaque,
                    Blend::Opaque,
                    Blend::Opaque,
                    Blend::Opaque,
                ],
                ..GraphicsPipelineDesc::defaults(
                    gbuffer_vert,
                    Some(gbuffer_frag),
                    rp_gbuffer,
                    draw_layout,
                )
            },
        )?;
        let shadow_2d = create_graphics_pipeline(
            device,
            &GraphicsPipelineDesc {
                blends: &[],
                cull_mode: vk::CullModeFlags::FRONT,
                ..GraphicsPipelineDesc::defaults(shadow_vert, None, rp_depth_only, shadow_layout)
            },
        )?;
        let shadow_cube = create_graphics_pipeline(
            device,
            &GraphicsPipelineDesc {
                blends: &[],
                cull_mode: vk::CullModeFlags::FRONT,
                geometry: Some(shadow_geom),
                ..GraphicsPipelineDesc::defaults(shadow_vert, None, rp_depth_only, shadow_layout)
            },
        )?;
        let ambient = create_graphics_pipeline(
            device,
            &GraphicsPipelineDesc {
                input: VertexInput::None,
                cull_mode: vk::CullModeFlags::NONE,
                depth_test: false,
                depth_write: false,
                has_depth: false,
                ..GraphicsPipelineDesc::defaults(
                    fullscreen_vert,
                    Some(ambient_frag),
                    rp_ambient,
                    ambient_layout,
                )
            },
        )?;

        // Per-kind light volume state, straight from the lighting table:
        // point GREATER_OR_EQUAL + front culling, spot GREATER_OR_EQUAL +
        // back culling, directional ALWAYS + back culling. All additive.
        let light_point = create_graphics_pipeline(
            device,
            &GraphicsPipelineDesc {
                depth_write: false,
                depth_compare: vk::CompareOp::GREATER_OR_EQUAL,
                cull_mode: vk::CullModeFlags::FRONT,
                blends: &[Blend::Additive],
                ..GraphicsPipelineDesc::defaults(
                    volume_vert,
                    Some(volume_frag),
                    rp_forward,
                    lighting_layout,
                )
            },
        )?;
        let light_spot = create_graphics_pipeline(
            device,
            &GraphicsPipelineDesc {
                depth_write: false,
                depth_compare: vk::CompareOp::GREATER_OR_EQUAL,
                cull_mode: vk::CullModeFlags::BACK,
                blends: &[Blend::Additive],
                ..GraphicsPipelineDesc::defaults(
                    volume_vert,
                    Some(volume_frag),
                    rp_forward,
                    lighting_layout,
                )
            },
        )?;
        let light_directional = create_graphics_pipeline(
            device,
            &GraphicsPipelineDesc {
                input: VertexInput::None,
                depth_write: false,
                depth_compare: vk::CompareOp::ALWAYS,
                cull_mode: vk::CullModeFlags::BACK,
                blends: &[Blend::Additive],
                ..GraphicsPipelineDesc::defaults(
                    volume_vert,
                    Some(volume_frag),
                    rp_forward,
                    lighting_layout,
                )
            },
        )?;

        let fwd_transparent = create_graphics_pipeline(
            device,
            &GraphicsPipelineDesc {
                depth_write: false,
                depth_compare: vk::CompareOp::LESS_OR_EQUAL,
                blends: &[Blend::Alpha],
                ..GraphicsPipelineDesc::defaults(
                    forward_vert,
                    Some(forward_frag),
                    rp_forward,
                    draw_layout,
                )
            },
        )?;
        let fwd_wireframe = create_graphics_pipeline(
            device,
            &GraphicsPipelineDesc {
                polygon_mode: vk::PolygonMode::LINE,
                cull_mode: vk::CullModeFlags::NONE,
                depth_write: false,
                depth_compare: vk::CompareOp::LESS_OR_EQUAL,
                blends: &[Blend::Alpha],
                ..GraphicsPipelineDesc::defaults(
                    forward_vert,
                    Some(forward_frag),
                    rp_forward,
                    draw_layout,
                )
            },
        )?;
        let fwd_random = create_graphics_pipeline(
            device,
            &GraphicsPipelineDesc {
                depth_write: false,
                depth_compare: vk::CompareOp::LESS_OR_EQUAL,
                blends: &[Blend::Alpha],
                ..GraphicsPipelineDesc::defaults(
                    forward_vert,
                    Some(forward_frag),
                    rp_forward,
                    draw_layout,
                )
            },
        )?;
        let fwd_line_strip = create_graphics_pipeline(
            device,
            &GraphicsPipelineDesc {
                topology: vk::PrimitiveTopology::LINE_STRIP,
                cull_mode: vk::CullModeFlags::NONE,
                depth_write: false,
                depth_compare: vk::CompareOp::LESS_OR_EQUAL,
                blends: &[Blend::Alpha],
                ..GraphicsPipelineDesc::defaults(
                    forward_vert,
                    Some(forward_frag),
                    rp_forward,
                    draw_layout,
                )
            },
        )?;
        let sprite = create_graphics_pipeline(
            device,
            &GraphicsPipelineDesc {
                cull_mode: vk::CullModeFlags::NONE,
                depth_write: false,
                depth_compare: vk::CompareOp::LESS_OR_EQUAL,
                blends: &[Blend::Alpha],
                ..GraphicsPipelineDesc::defaults(
                    sprite_vert,
                    Some(sprite_frag),
                    rp_forward,
                    sprite_layout,
                )
            },
        )?;
        let debug = create_graphics_pipeline(
            device,
            &GraphicsPipelineDesc {
                input: VertexInput::DebugLines,
                topology: vk::PrimitiveTopology::LINE_LIST,
                cull_mode: vk::CullModeFlags::NONE,
                depth_write: false,
                depth_compare: vk::CompareOp::LESS_OR_EQUAL,
                blends: &[Blend::Alpha],
                ..GraphicsPipelineDesc::defaults(
                    debug_vert,
                    Some(debug_frag),
                    rp_forward,
                    debug_layout,
                )
            },
        )?;
        let post = create_graphics_pipeline(
            device,
            &GraphicsPipelineDesc {
                input: VertexInput::None,
                cull_mode: vk::CullModeFlags::NONE,
                depth_test: false,
                depth_write: false,
                has_depth: false,
                ..GraphicsPipelineDesc::defaults(
                    fullscreen_vert,
                    Some(tonemap_frag),
                    rp_post,
                    post_layout,
                )
            },
        )?;

        Ok(Pipelines {
            rp_depth_only,
            rp_gbuffer,
            rp_ambient,
            rp_forward,
            rp_post,
            rp_ui,
            reduce_set_layout,
            cull_output_layout,
            cull_layout,
            cull,
            shadow_cull_layout,
            shadow_cull,
            reduce_layout,
            reduce,
            draw_layout,
            prepass,
            gbuffer,
            shadow_layout,
            shadow_2d,
            shadow_cube,
            ambient_layout,
            ambient,
            lighting_layout,
            light_point,
            light_spot,
            light_directional,
            fwd_transparent,
            fwd_wireframe,
            fwd_random,
            fwd_line_strip,
            sprite_layout,
            sprite,
            debug_layout,
            debug,
            post_layout,
            post,
            modules,
        })
    }

    /// Destroy everything. The device must be idle.
    pub fn dispose(self, device: &Device) {
        unsafe {
            let raw = device.raw();
            for pipeline in [
                self.cull,
                self.shadow_cull,
                self.reduce,
                self.prepass,
                self.gbuffer,
                self.shadow_2d,
                self.shadow_cube,
                self.ambient,
                self.light_point,
                self.light_spot,
                self.light_directional,
                self.fwd_transparent,
                self.fwd_wireframe,
                self.fwd_random,
                self.fwd_line_strip,
                self.sprite,
                self.debug,
                self.post,
            ] {
                raw.destroy_pipeline(pipeline, None);
            }
            for layout in [
                self.cull_layout,
                self.shadow_cull_layout,
                self.reduce_layout,
                self.draw_layout,
                self.shadow_layout,
                self.sprite_layout,
                self.ambient_layout,
                self.lighting_layout,
                self.debug_layout,
                self.post_layout,
            ] {
                raw.destroy_pipeline_layout(layout, None);
            }
            for render_pass in [
                self.rp_depth_only,
                self.rp_gbuffer,
                self.rp_ambient,
                self.rp_forward,
                self.rp_post,
                self.rp_ui,
            ] {
                raw.destroy_render_pass(render_pass, None);
            }
            for layout in [self.reduce_set_layout, self.cull_output_layout] {
                raw.destroy_descriptor_set_layout(layout, None);
            }
            for module in self.modules {
                raw.destroy_shader_module(module, None);
            }
        }
    }
}
