//! Vulkan graphics pipeline state (§4.D): reflects the vertex/fragment pair,
//! builds a pipeline layout from the caller's binding sets plus the
//! reflected push-constant range, and bakes the fixed-function state against
//! the target render target's compatible render pass.

use crate::reflection::{self, ShaderFile};
use crate::{
    BindingSet, BlendOp, CullMode, FrontFace, PolygonMode, PrimitiveTopology, RenderState,
    RenderStateDescriptor, RenderTarget, ResourceId, RhiError, RhiResult, VertexFormat,
    VertexInputRate,
};
use ash::vk;
use std::ffi::CString;
use std::sync::Arc;

use super::super::render_target::VulkanRenderTarget;
use super::super::VulkanBackend;

pub struct VulkanGraphicsPipeline {
    pub(crate) device: Arc<ash::Device>,
    pub(crate) pipeline: vk::Pipeline,
    pub(crate) layout: vk::PipelineLayout,
    pub(crate) push_constant_stages: vk::ShaderStageFlags,
    pub(crate) push_constant_size: u32,
    pub(crate) named_uniforms: Vec<(String, u32, u32)>,
    id: ResourceId,
}

impl VulkanGraphicsPipeline {
    pub fn create(
        backend: &VulkanBackend,
        target: &dyn RenderTarget,
        desc: &RenderStateDescriptor,
        binding_sets: &[&dyn BindingSet],
    ) -> RhiResult<Self> {
        let render_pass = target
            .as_any()
            .downcast_ref::<VulkanRenderTarget>()
            .ok_or_else(|| RhiError::logic("create_render_state", "render target is not a Vulkan render target"))?
            .render_pass();

        let mut files = vec![ShaderFile {
            name: "vertex".into(),
            bytecode: desc.vertex_shader.source.clone(),
            stage: desc.vertex_shader.stage,
        }];
        if let Some(fs) = &desc.fragment_shader {
            files.push(ShaderFile { name: "fragment".into(), bytecode: fs.source.clone(), stage: fs.stage });
        }
        let mut reflected = reflection::reflect(&files)?;
        if !desc.named_uniforms.is_empty() {
            let members: Vec<(&str, u32, u32)> = desc.named_uniforms.iter().map(|(n, o, s)| (n.as_str(), *o, *s)).collect();
            reflection::merge_named_uniforms(&mut reflected, &members)?;
        }

        let device = backend.device.clone();

        let mut stage_modules = Vec::new();
        let mut entry_names: Vec<CString> = Vec::new();
        let vs_module = Self::create_shader_module(&device, &desc.vertex_shader.source)?;
        stage_modules.push((vs_module, vk::ShaderStageFlags::VERTEX));
        entry_names.push(CString::new(desc.vertex_shader.entry_point.as_str()).map_err(|e| RhiError::logic("create_render_state", e.to_string()))?);

        if let Some(ref fs) = desc.fragment_shader {
            let fs_module = Self::create_shader_module(&device, &fs.source)?;
            stage_modules.push((fs_module, vk::ShaderStageFlags::FRAGMENT));
            entry_names.push(CString::new(fs.entry_point.as_str()).map_err(|e| RhiError::logic("create_render_state", e.to_string()))?);
        }

        let stages: Vec<vk::PipelineShaderStageCreateInfo> = stage_modules
            .iter()
            .zip(entry_names.iter())
            .map(|((module, flags), name)| vk::PipelineShaderStageCreateInfo::default().stage(*flags).module(*module).name(name))
            .collect();

        let (binding_descriptions, attribute_descriptions) = Self::vertex_input_descriptions(&desc.vertex_input);
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&binding_descriptions)
            .vertex_attribute_descriptions(&attribute_descriptions);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(Self::topology_to_vk(desc.primitive_topology))
            .primitive_restart_enable(false);

        let viewport_state = vk::PipelineViewportStateCreateInfo::default().viewport_count(1).scissor_count(1);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(Self::polygon_mode_to_vk(desc.rasterization.polygon_mode))
            .line_width(1.0)
            .cull_mode(Self::cull_mode_to_vk(desc.rasterization.cull_mode))
            .front_face(Self::front_face_to_vk(desc.rasterization.front_face))
            .depth_bias_enable(desc.rasterization.depth_bias.is_some());

        let multisampling =
            vk::PipelineMultisampleStateCreateInfo::default().rasterization_samples(sample_count_to_vk(desc.sample_count));

        let color_blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = desc
            .color_blend
            .iter()
            .map(|slot| {
                slot.as_ref().map_or(
                    vk::PipelineColorBlendAttachmentState::default().blend_enable(false).color_write_mask(vk::ColorComponentFlags::RGBA),
                    |b| {
                        vk::PipelineColorBlendAttachmentState::default()
                            .blend_enable(true)
                            .src_color_blend_factor(Self::blend_factor_to_vk(b.color.src_factor))
                            .dst_color_blend_factor(Self::blend_factor_to_vk(b.color.dst_factor))
                            .color_blend_op(Self::blend_op_to_vk(b.color.operation))
                            .src_alpha_blend_factor(Self::blend_factor_to_vk(b.alpha.src_factor))
                            .dst_alpha_blend_factor(Self::blend_factor_to_vk(b.alpha.dst_factor))
                            .alpha_blend_op(Self::blend_op_to_vk(b.alpha.operation))
                            .color_write_mask(vk::ColorComponentFlags::RGBA)
                    },
                )
            })
            .collect();

        let color_blend = vk::PipelineColorBlendStateCreateInfo::default().logic_op_enable(false).attachments(&color_blend_attachments);

        let depth_stencil_create_info = desc.depth_stencil.as_ref().map_or(
            vk::PipelineDepthStencilStateCreateInfo::default().depth_test_enable(false).depth_write_enable(false).stencil_test_enable(false),
            |ds| {
                vk::PipelineDepthStencilStateCreateInfo::default()
                    .depth_test_enable(ds.depth_test_enabled)
                    .depth_write_enable(ds.depth_write_enabled)
                    .depth_compare_op(Self::compare_op_to_vk(ds.depth_compare))
                    .depth_bounds_test_enable(false)
                    .stencil_test_enable(ds.stencil_test_enabled)
            },
        );

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR, vk::DynamicState::DEPTH_BIAS];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let set_layouts: Vec<vk::DescriptorSetLayout> = binding_sets.iter().map(|s| Self::layout_of(*s)).collect::<RhiResult<_>>()?;
        let push_constant_ranges: Vec<vk::PushConstantRange> = reflected
            .push_constant_range
            .as_ref()
            .map(|pc| vec![vk::PushConstantRange::default().stage_flags(stages_to_vk(pc.stages)).offset(0).size(pc.size)])
            .unwrap_or_default();
        let layout_create_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts).push_constant_ranges(&push_constant_ranges);
        let layout = unsafe { device.create_pipeline_layout(&layout_create_info, None) }
            .map_err(|e| RhiError::FatalCreate(format!("pipeline layout: {e:?}")))?;

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisampling)
            .color_blend_state(&color_blend)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(0)
            .depth_stencil_state(&depth_stencil_create_info)
            .dynamic_state(&dynamic_state);

        let pipelines = unsafe { device.create_graphics_pipelines(backend.pipeline_cache, &[pipeline_info], None) }
            .map_err(|(_partial, res)| RhiError::FatalCreate(format!("create_graphics_pipelines: {res:?}")))?;
        let pipeline = pipelines[0];

        for (module, _) in stage_modules {
            unsafe { device.destroy_shader_module(module, None) };
        }

        let push_constant_stages = reflected.push_constant_range.as_ref().map_or(vk::ShaderStageFlags::empty(), |pc| stages_to_vk(pc.stages));
        let push_constant_size = reflected.push_constant_range.as_ref().map_or(0, |pc| pc.size);

        Ok(Self {
            device,
            pipeline,
            layout,
            push_constant_stages,
            push_constant_size,
            named_uniforms: reflected.named_uniforms.into_iter().map(|u| (u.name, u.offset, u.size)).collect(),
            id: backend.next_id(),
        })
    }

    fn layout_of(set: &dyn BindingSet) -> RhiResult<vk::DescriptorSetLayout> {
        set.as_any()
            .downcast_ref::<super::super::VulkanBindingSet>()
            .map(|s| s.raw_layout())
            .ok_or_else(|| RhiError::logic("create_render_state", "binding set is not a Vulkan binding set"))
    }

    fn create_shader_module(device: &ash::Device, source: &[u8]) -> RhiResult<vk::ShaderModule> {
        if source.len() % 4 != 0 {
            return Err(RhiError::logic("create_shader_module", "SPIR-V must be 4-byte aligned"));
        }
        let code_u32: Vec<u32> = source.chunks_exact(4).map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect();
        let create_info = vk::ShaderModuleCreateInfo::default().code(&code_u32);
        unsafe { device.create_shader_module(&create_info, None) }.map_err(|e| RhiError::FatalCreate(format!("shader module: {e:?}")))
    }

    fn vertex_input_descriptions(
        desc: &crate::VertexInputDescriptor,
    ) -> (Vec<vk::VertexInputBindingDescription>, Vec<vk::VertexInputAttributeDescription>) {
        let binding_descriptions: Vec<vk::VertexInputBindingDescription> = desc
            .bindings
            .iter()
            .map(|b| {
                vk::VertexInputBindingDescription::default().binding(b.binding).stride(b.stride).input_rate(match b.input_rate {
                    VertexInputRate::Vertex => vk::VertexInputRate::VERTEX,
                    VertexInputRate::Instance => vk::VertexInputRate::INSTANCE,
                })
            })
            .collect();

        let attribute_descriptions: Vec<vk::VertexInputAttributeDescription> = desc
            .attributes
            .iter()
            .map(|a| {
                vk::VertexInputAttributeDescription::default().location(a.location).binding(a.binding).format(Self::vertex_format_to_vk(a.format)).offset(a.offset)
            })
            .collect();

        (binding_descriptions, attribute_descriptions)
    }

    fn vertex_format_to_vk(f: VertexFormat) -> vk::Format {
        match f {
            VertexFormat::Float32 => vk::Format::R32_SFLOAT,
            VertexFormat::Float32x2 => vk::Format::R32G32_SFLOAT,
            VertexFormat::Float32x3 => vk::Format::R32G32B32_SFLOAT,
            VertexFormat::Float32x4 => vk::Format::R32G32B32A32_SFLOAT,
            VertexFormat::Uint32 => vk::Format::R32_UINT,
        }
    }

    fn topology_to_vk(t: PrimitiveTopology) -> vk::PrimitiveTopology {
        match t {
            PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
            PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
            PrimitiveTopology::LineList => vk::PrimitiveTopology::LINE_LIST,
            PrimitiveTopology::PointList => vk::PrimitiveTopology::POINT_LIST,
        }
    }

    fn polygon_mode_to_vk(p: PolygonMode) -> vk::PolygonMode {
        match p {
            PolygonMode::Fill => vk::PolygonMode::FILL,
            PolygonMode::Line => vk::PolygonMode::LINE,
            PolygonMode::Point => vk::PolygonMode::POINT,
        }
    }

    fn cull_mode_to_vk(c: CullMode) -> vk::CullModeFlags {
        match c {
            CullMode::None => vk::CullModeFlags::NONE,
            CullMode::Back => vk::CullModeFlags::BACK,
            CullMode::Front => vk::CullModeFlags::FRONT,
            CullMode::FrontAndBack => vk::CullModeFlags::FRONT_AND_BACK,
        }
    }

    fn front_face_to_vk(f: FrontFace) -> vk::FrontFace {
        match f {
            FrontFace::CounterClockwise => vk::FrontFace::COUNTER_CLOCKWISE,
            FrontFace::Clockwise => vk::FrontFace::CLOCKWISE,
        }
    }

    fn blend_factor_to_vk(f: crate::BlendFactor) -> vk::BlendFactor {
        match f {
            crate::BlendFactor::One => vk::BlendFactor::ONE,
            crate::BlendFactor::Zero => vk::BlendFactor::ZERO,
            crate::BlendFactor::SrcAlpha => vk::BlendFactor::SRC_ALPHA,
            crate::BlendFactor::OneMinusSrcAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            crate::BlendFactor::DstAlpha => vk::BlendFactor::DST_ALPHA,
            crate::BlendFactor::OneMinusDstAlpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
        }
    }

    fn blend_op_to_vk(o: BlendOp) -> vk::BlendOp {
        match o {
            BlendOp::Add => vk::BlendOp::ADD,
            BlendOp::Subtract => vk::BlendOp::SUBTRACT,
        }
    }

    fn compare_op_to_vk(o: crate::CompareOp) -> vk::CompareOp {
        match o {
            crate::CompareOp::Never => vk::CompareOp::NEVER,
            crate::CompareOp::Less => vk::CompareOp::LESS,
            crate::CompareOp::Equal => vk::CompareOp::EQUAL,
            crate::CompareOp::LessOrEqual => vk::CompareOp::LESS_OR_EQUAL,
            crate::CompareOp::Greater => vk::CompareOp::GREATER,
            crate::CompareOp::NotEqual => vk::CompareOp::NOT_EQUAL,
            crate::CompareOp::GreaterOrEqual => vk::CompareOp::GREATER_OR_EQUAL,
            crate::CompareOp::Always => vk::CompareOp::ALWAYS,
        }
    }

    pub fn raw(&self) -> vk::Pipeline {
        self.pipeline
    }
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }
    pub fn push_constant_info(&self) -> (vk::ShaderStageFlags, u32) {
        (self.push_constant_stages, self.push_constant_size)
    }
    pub fn named_uniform(&self, name: &str) -> Option<(u32, u32)> {
        self.named_uniforms.iter().find(|(n, ..)| n == name).map(|(_, o, s)| (*o, *s))
    }
    pub fn named_uniforms(&self) -> &[(String, u32, u32)] {
        &self.named_uniforms
    }
    pub fn id(&self) -> ResourceId {
        self.id
    }
}

pub(crate) fn sample_count_to_vk(count: u32) -> vk::SampleCountFlags {
    match count {
        1 => vk::SampleCountFlags::TYPE_1,
        2 => vk::SampleCountFlags::TYPE_2,
        4 => vk::SampleCountFlags::TYPE_4,
        8 => vk::SampleCountFlags::TYPE_8,
        _ => vk::SampleCountFlags::TYPE_1,
    }
}

pub(crate) fn stages_to_vk(stages: crate::ShaderStages) -> vk::ShaderStageFlags {
    super::super::binding_set::shader_stages_to_vk(stages)
}

impl Drop for VulkanGraphicsPipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

impl std::fmt::Debug for VulkanGraphicsPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanGraphicsPipeline").field("id", &self.id).finish()
    }
}

impl RenderState for VulkanGraphicsPipeline {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
