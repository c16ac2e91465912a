//! Vulkan compute pipeline state (§4.D).

use crate::reflection::{self, ShaderFile};
use crate::{BindingSet, ComputeState, ComputeStateDescriptor, ResourceId, RhiError, RhiResult};
use ash::vk;
use std::ffi::CString;
use std::sync::Arc;

use super::super::VulkanBackend;
use super::graphics::stages_to_vk;

pub struct VulkanComputePipeline {
    pub(crate) device: Arc<ash::Device>,
    pub(crate) pipeline: vk::Pipeline,
    pub(crate) layout: vk::PipelineLayout,
    pub(crate) push_constant_stages: vk::ShaderStageFlags,
    pub(crate) push_constant_size: u32,
    pub(crate) named_uniforms: Vec<(String, u32, u32)>,
    id: ResourceId,
}

impl VulkanComputePipeline {
    pub fn create(backend: &VulkanBackend, desc: &ComputeStateDescriptor, binding_sets: &[&dyn BindingSet]) -> RhiResult<Self> {
        let device = backend.device.clone();

        let files = [ShaderFile { name: "compute".into(), bytecode: desc.shader.source.clone(), stage: desc.shader.stage }];
        let mut reflected = reflection::reflect(&files)?;
        if !desc.named_uniforms.is_empty() {
            let members: Vec<(&str, u32, u32)> = desc.named_uniforms.iter().map(|(n, o, s)| (n.as_str(), *o, *s)).collect();
            reflection::merge_named_uniforms(&mut reflected, &members)?;
        }

        let code = &desc.shader.source;
        if code.len() % 4 != 0 {
            return Err(RhiError::logic("create_compute_state", "SPIR-V must be 4-byte aligned"));
        }
        let code_u32: Vec<u32> = code.chunks_exact(4).map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect();
        let shader_create_info = vk::ShaderModuleCreateInfo::default().code(&code_u32);
        let shader_module = unsafe { device.create_shader_module(&shader_create_info, None) }
            .map_err(|e| RhiError::FatalCreate(format!("shader module: {e:?}")))?;

        let set_layouts: Vec<vk::DescriptorSetLayout> = binding_sets
            .iter()
            .map(|s| {
                s.as_any()
                    .downcast_ref::<super::super::VulkanBindingSet>()
                    .map(|s| s.raw_layout())
                    .ok_or_else(|| RhiError::logic("create_compute_state", "binding set is not a Vulkan binding set"))
            })
            .collect::<RhiResult<_>>()?;
        let push_constant_ranges: Vec<vk::PushConstantRange> = reflected
            .push_constant_range
            .as_ref()
            .map(|pc| vec![vk::PushConstantRange::default().stage_flags(stages_to_vk(pc.stages)).offset(0).size(pc.size)])
            .unwrap_or_default();
        let layout_create_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts).push_constant_ranges(&push_constant_ranges);
        let layout = unsafe { device.create_pipeline_layout(&layout_create_info, None) }
            .map_err(|e| RhiError::FatalCreate(format!("pipeline layout: {e:?}")))?;

        let entry_name = CString::new(desc.shader.entry_point.as_str()).map_err(|e| RhiError::logic("create_compute_state", e.to_string()))?;
        let stage = vk::PipelineShaderStageCreateInfo::default().stage(vk::ShaderStageFlags::COMPUTE).module(shader_module).name(&entry_name);
        let create_info = vk::ComputePipelineCreateInfo::default().stage(stage).layout(layout);
        let pipelines = unsafe { device.create_compute_pipelines(backend.pipeline_cache, &[create_info], None) }
            .map_err(|(_partial, res)| RhiError::FatalCreate(format!("create_compute_pipelines: {res:?}")))?;
        let pipeline = pipelines[0];

        unsafe { device.destroy_shader_module(shader_module, None) };

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

impl Drop for VulkanComputePipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

impl std::fmt::Debug for VulkanComputePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanComputePipeline").field("id", &self.id).finish()
    }
}

impl ComputeState for VulkanComputePipeline {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
