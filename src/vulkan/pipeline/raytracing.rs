//! Vulkan ray-tracing pipeline state (§4.D): a raygen group, a list of hit
//! groups (closest-hit + optional any-hit + optional intersection), and a
//! list of miss groups, plus the shader binding table that indexes them.

use crate::reflection::{self, ShaderFile};
use crate::{BindingSet, RayTracingState, RayTracingStateDescriptor, ResourceId, RhiError, RhiResult};
use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;
use std::ffi::CString;
use std::sync::{Arc, Mutex};

use super::super::acceleration_structure::device_address;
use super::super::VulkanBackend;
use super::graphics::stages_to_vk;

pub struct VulkanRayTracingPipeline {
    device: Arc<ash::Device>,
    rt_loader: Arc<ash::khr::ray_tracing_pipeline::Device>,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    allocator: Arc<Mutex<gpu_allocator::vulkan::Allocator>>,
    sbt_buffer: vk::Buffer,
    sbt_allocation: Option<Allocation>,
    raygen_region: vk::StridedDeviceAddressRegionKHR,
    miss_region: vk::StridedDeviceAddressRegionKHR,
    hit_region: vk::StridedDeviceAddressRegionKHR,
    group_offsets: Vec<u64>,
    push_constant_stages: vk::ShaderStageFlags,
    push_constant_size: u32,
    named_uniforms: Vec<(String, u32, u32)>,
    id: ResourceId,
}

impl VulkanRayTracingPipeline {
    pub fn create(backend: &VulkanBackend, desc: &RayTracingStateDescriptor, binding_sets: &[&dyn BindingSet]) -> RhiResult<Self> {
        let device = backend.device.clone();
        let rt_loader = Arc::new(ash::khr::ray_tracing_pipeline::Device::new(&backend.instance, &backend.device));

        let mut files = vec![ShaderFile { name: "raygen".into(), bytecode: desc.raygen.source.clone(), stage: desc.raygen.stage }];
        for (i, hg) in desc.hit_groups.iter().enumerate() {
            files.push(ShaderFile { name: format!("closest_hit_{i}"), bytecode: hg.closest_hit.source.clone(), stage: hg.closest_hit.stage });
            if let Some(ah) = &hg.any_hit {
                files.push(ShaderFile { name: format!("any_hit_{i}"), bytecode: ah.source.clone(), stage: ah.stage });
            }
            if let Some(isect) = &hg.intersection {
                files.push(ShaderFile { name: format!("intersection_{i}"), bytecode: isect.source.clone(), stage: isect.stage });
            }
        }
        for (i, miss) in desc.miss_shaders.iter().enumerate() {
            files.push(ShaderFile { name: format!("miss_{i}"), bytecode: miss.source.clone(), stage: miss.stage });
        }
        let mut reflected = reflection::reflect(&files)?;
        if !desc.named_uniforms.is_empty() {
            let members: Vec<(&str, u32, u32)> = desc.named_uniforms.iter().map(|(n, o, s)| (n.as_str(), *o, *s)).collect();
            reflection::merge_named_uniforms(&mut reflected, &members)?;
        }

        // Build every shader module up front; `stages` indexes into `modules`
        // in the order groups reference them below.
        let mut modules: Vec<vk::ShaderModule> = Vec::new();
        let mut entry_names: Vec<CString> = Vec::new();
        let mut stages: Vec<vk::PipelineShaderStageCreateInfo> = Vec::new();

        let push_stage = |device: &ash::Device,
                               modules: &mut Vec<vk::ShaderModule>,
                               entry_names: &mut Vec<CString>,
                               source: &[u8],
                               entry_point: &str|
         -> RhiResult<u32> {
            let module = Self::create_shader_module(device, source)?;
            modules.push(module);
            entry_names.push(CString::new(entry_point).map_err(|e| RhiError::logic("create_ray_tracing_state", e.to_string()))?);
            Ok((modules.len() - 1) as u32)
        };

        let raygen_index = push_stage(&device, &mut modules, &mut entry_names, &desc.raygen.source, &desc.raygen.entry_point)?;

        struct HitIndices {
            closest_hit: u32,
            any_hit: Option<u32>,
            intersection: Option<u32>,
        }
        let mut hit_indices = Vec::with_capacity(desc.hit_groups.len());
        for hg in &desc.hit_groups {
            let closest_hit = push_stage(&device, &mut modules, &mut entry_names, &hg.closest_hit.source, &hg.closest_hit.entry_point)?;
            let any_hit = hg
                .any_hit
                .as_ref()
                .map(|s| push_stage(&device, &mut modules, &mut entry_names, &s.source, &s.entry_point))
                .transpose()?;
            let intersection = hg
                .intersection
                .as_ref()
                .map(|s| push_stage(&device, &mut modules, &mut entry_names, &s.source, &s.entry_point))
                .transpose()?;
            hit_indices.push(HitIndices { closest_hit, any_hit, intersection });
        }

        let mut miss_indices = Vec::with_capacity(desc.miss_shaders.len());
        for miss in &desc.miss_shaders {
            miss_indices.push(push_stage(&device, &mut modules, &mut entry_names, &miss.source, &miss.entry_point)?);
        }

        let stage_flags_in_order = Self::stage_flags_in_push_order(desc);
        for ((module, name), flags) in modules.iter().zip(entry_names.iter()).zip(stage_flags_in_order.iter()) {
            stages.push(vk::PipelineShaderStageCreateInfo::default().stage(*flags).module(*module).name(name));
        }

        let mut groups: Vec<vk::RayTracingShaderGroupCreateInfoKHR> = Vec::new();
        groups.push(
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(raygen_index)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR),
        );
        for h in &hit_indices {
            let ty = if h.intersection.is_some() {
                vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP
            } else {
                vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP
            };
            groups.push(
                vk::RayTracingShaderGroupCreateInfoKHR::default()
                    .ty(ty)
                    .general_shader(vk::SHADER_UNUSED_KHR)
                    .closest_hit_shader(h.closest_hit)
                    .any_hit_shader(h.any_hit.unwrap_or(vk::SHADER_UNUSED_KHR))
                    .intersection_shader(h.intersection.unwrap_or(vk::SHADER_UNUSED_KHR)),
            );
        }
        for &miss in &miss_indices {
            groups.push(
                vk::RayTracingShaderGroupCreateInfoKHR::default()
                    .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                    .general_shader(miss)
                    .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                    .any_hit_shader(vk::SHADER_UNUSED_KHR)
                    .intersection_shader(vk::SHADER_UNUSED_KHR),
            );
        }

        let set_layouts: Vec<vk::DescriptorSetLayout> = binding_sets
            .iter()
            .map(|s| {
                s.as_any()
                    .downcast_ref::<super::super::VulkanBindingSet>()
                    .map(|s| s.raw_layout())
                    .ok_or_else(|| RhiError::logic("create_ray_tracing_state", "binding set is not a Vulkan binding set"))
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

        let create_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(desc.max_recursion_depth)
            .layout(layout);
        let pipelines = unsafe {
            rt_loader.create_ray_tracing_pipelines(vk::DeferredOperationKHR::null(), backend.pipeline_cache, &[create_info], None)
        }
        .map_err(|(_partial, res)| RhiError::FatalCreate(format!("create_ray_tracing_pipelines: {res:?}")))?;
        let pipeline = pipelines[0];

        for module in &modules {
            unsafe { device.destroy_shader_module(*module, None) };
        }

        let (sbt_buffer, sbt_allocation, raygen_region, miss_region, hit_region, group_offsets) =
            Self::build_shader_binding_table(backend, &rt_loader, pipeline, 1, hit_indices.len() as u32, miss_indices.len() as u32)?;

        let push_constant_stages = reflected.push_constant_range.as_ref().map_or(vk::ShaderStageFlags::empty(), |pc| stages_to_vk(pc.stages));
        let push_constant_size = reflected.push_constant_range.as_ref().map_or(0, |pc| pc.size);

        Ok(Self {
            device,
            rt_loader,
            pipeline,
            layout,
            allocator: backend.allocator.clone(),
            sbt_buffer,
            sbt_allocation: Some(sbt_allocation),
            raygen_region,
            miss_region,
            hit_region,
            group_offsets,
            push_constant_stages,
            push_constant_size,
            named_uniforms: reflected.named_uniforms.into_iter().map(|u| (u.name, u.offset, u.size)).collect(),
            id: backend.next_id(),
        })
    }

    fn stage_flags_in_push_order(desc: &RayTracingStateDescriptor) -> Vec<vk::ShaderStageFlags> {
        let mut flags = vec![vk::ShaderStageFlags::RAYGEN_KHR];
        for hg in &desc.hit_groups {
            flags.push(vk::ShaderStageFlags::CLOSEST_HIT_KHR);
            if hg.any_hit.is_some() {
                flags.push(vk::ShaderStageFlags::ANY_HIT_KHR);
            }
            if hg.intersection.is_some() {
                flags.push(vk::ShaderStageFlags::INTERSECTION_KHR);
            }
        }
        for _ in &desc.miss_shaders {
            flags.push(vk::ShaderStageFlags::MISS_KHR);
        }
        flags
    }

    fn create_shader_module(device: &ash::Device, source: &[u8]) -> RhiResult<vk::ShaderModule> {
        if source.len() % 4 != 0 {
            return Err(RhiError::logic("create_shader_module", "SPIR-V must be 4-byte aligned"));
        }
        let code_u32: Vec<u32> = source.chunks_exact(4).map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect();
        let create_info = vk::ShaderModuleCreateInfo::default().code(&code_u32);
        unsafe { device.create_shader_module(&create_info, None) }.map_err(|e| RhiError::FatalCreate(format!("shader module: {e:?}")))
    }

    /// Lays the raygen/hit/miss handles out back to back, each group's
    /// offset aligned to `shaderGroupBaseAlignment` (P8), and returns the
    /// strided address regions the dispatch call needs.
    #[allow(clippy::type_complexity)]
    fn build_shader_binding_table(
        backend: &VulkanBackend,
        rt_loader: &ash::khr::ray_tracing_pipeline::Device,
        pipeline: vk::Pipeline,
        raygen_count: u32,
        hit_count: u32,
        miss_count: u32,
    ) -> RhiResult<(
        vk::Buffer,
        Allocation,
        vk::StridedDeviceAddressRegionKHR,
        vk::StridedDeviceAddressRegionKHR,
        vk::StridedDeviceAddressRegionKHR,
        Vec<u64>,
    )> {
        let mut rt_properties = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut properties2 = vk::PhysicalDeviceProperties2::default().push_next(&mut rt_properties);
        unsafe { backend.instance.get_physical_device_properties2(backend.physical_device, &mut properties2) };

        let handle_size = rt_properties.shader_group_handle_size as u64;
        let base_alignment = rt_properties.shader_group_base_alignment as u64;

        let total_groups = raygen_count + hit_count + miss_count;
        let handles_size = (handle_size * total_groups as u64) as usize;
        let handles = unsafe { rt_loader.get_ray_tracing_shader_group_handles(pipeline, 0, total_groups, handles_size) }
            .map_err(|e| RhiError::FatalCreate(format!("get_ray_tracing_shader_group_handles: {e:?}")))?;

        // §4.D point 4: every group's stride is the base alignment, so
        // `offset_of(group_k) = k * shaderGroupBaseAlignment` (P8) holds
        // across the whole table, not just within one region.
        let raygen_stride = base_alignment;
        let hit_stride = base_alignment;
        let miss_stride = base_alignment;

        let raygen_region_size = raygen_stride * raygen_count as u64;
        let hit_region_size = hit_stride * hit_count as u64;
        let miss_region_size = miss_stride * miss_count as u64;

        let raygen_offset = 0u64;
        let hit_offset = raygen_offset + raygen_region_size;
        let miss_offset = hit_offset + hit_region_size;
        let total_size = miss_offset + miss_region_size;

        let group_offsets: Vec<u64> = (0..total_groups as u64).map(|k| k * base_alignment).collect();

        // The SBT is written directly from the host after pipeline creation,
        // so it needs host-visible memory rather than the `GpuOnly`
        // allocations the acceleration-structure buffers use.
        let create_info = vk::BufferCreateInfo::default()
            .size(total_size.max(1))
            .usage(vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS);
        let buffer = unsafe { backend.device.create_buffer(&create_info, None) }
            .map_err(|e| RhiError::FatalCreate(format!("SBT buffer create_buffer: {e:?}")))?;
        let requirements = unsafe { backend.device.get_buffer_memory_requirements(buffer) };
        let mut allocation = backend
            .allocator
            .lock()
            .unwrap()
            .allocate(&gpu_allocator::vulkan::AllocationCreateDesc {
                name: "shader-binding-table",
                requirements,
                location: MemoryLocation::CpuToGpu,
                linear: true,
                allocation_scheme: gpu_allocator::vulkan::AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| RhiError::FatalCreate(format!("SBT buffer allocation: {e}")))?;
        unsafe {
            backend
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
                .map_err(|e| RhiError::FatalCreate(format!("SBT buffer bind_buffer_memory: {e:?}")))?;
        }

        Self::write_handles(&mut allocation, &handles, handle_size, raygen_offset, hit_offset, miss_offset, raygen_stride, hit_stride, miss_stride, raygen_count, hit_count, miss_count);

        let address = device_address(&backend.device, buffer);
        let raygen_region = vk::StridedDeviceAddressRegionKHR::default()
            .device_address(address + raygen_offset)
            .stride(raygen_stride)
            .size(raygen_region_size);
        let hit_region = vk::StridedDeviceAddressRegionKHR::default()
            .device_address(if hit_count > 0 { address + hit_offset } else { 0 })
            .stride(hit_stride)
            .size(hit_region_size);
        let miss_region = vk::StridedDeviceAddressRegionKHR::default()
            .device_address(if miss_count > 0 { address + miss_offset } else { 0 })
            .stride(miss_stride)
            .size(miss_region_size);

        Ok((buffer, allocation, raygen_region, miss_region, hit_region, group_offsets))
    }

    #[allow(clippy::too_many_arguments)]
    fn write_handles(
        allocation: &mut Allocation,
        handles: &[u8],
        handle_size: u64,
        raygen_offset: u64,
        hit_offset: u64,
        miss_offset: u64,
        raygen_stride: u64,
        hit_stride: u64,
        miss_stride: u64,
        raygen_count: u32,
        hit_count: u32,
        miss_count: u32,
    ) {
        let Some(ptr) = allocation.mapped_ptr() else { return };
        let base = ptr.as_ptr() as *mut u8;
        let handle_size = handle_size as usize;
        let mut src = 0usize;
        let mut write_group = |dst_offset: u64| {
            let slice = &handles[src..src + handle_size];
            unsafe { std::ptr::copy_nonoverlapping(slice.as_ptr(), base.add(dst_offset as usize), handle_size) };
            src += handle_size;
        };
        for i in 0..raygen_count as u64 {
            write_group(raygen_offset + i * raygen_stride);
        }
        for i in 0..hit_count as u64 {
            write_group(hit_offset + i * hit_stride);
        }
        for i in 0..miss_count as u64 {
            write_group(miss_offset + i * miss_stride);
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
    pub fn sbt_regions(&self) -> (vk::StridedDeviceAddressRegionKHR, vk::StridedDeviceAddressRegionKHR, vk::StridedDeviceAddressRegionKHR) {
        (self.raygen_region, self.miss_region, self.hit_region)
    }
    /// The KHR loader, kept alive for `cmd_trace_rays_khr` at record time.
    pub fn rt_loader(&self) -> &ash::khr::ray_tracing_pipeline::Device {
        &self.rt_loader
    }
    pub fn id(&self) -> ResourceId {
        self.id
    }
}

impl Drop for VulkanRayTracingPipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
            self.device.destroy_buffer(self.sbt_buffer, None);
        }
        if let Some(allocation) = self.sbt_allocation.take() {
            let _ = self.allocator.lock().unwrap().free(allocation);
        }
    }
}

impl std::fmt::Debug for VulkanRayTracingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanRayTracingPipeline").field("id", &self.id).finish()
    }
}

impl RayTracingState for VulkanRayTracingPipeline {
    fn sbt_group_offsets(&self) -> &[u64] {
        &self.group_offsets
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_flags_in_push_order_matches_group_layout() {
        let desc = RayTracingStateDescriptor {
            raygen: crate::ShaderStage { source: vec![0; 4], entry_point: "main".into(), stage: crate::ShaderStages::RAYGEN },
            hit_groups: vec![crate::HitGroupDescriptor {
                closest_hit: crate::ShaderStage { source: vec![0; 4], entry_point: "main".into(), stage: crate::ShaderStages::CLOSEST_HIT },
                any_hit: Some(crate::ShaderStage { source: vec![0; 4], entry_point: "main".into(), stage: crate::ShaderStages::ANY_HIT }),
                intersection: None,
            }],
            miss_shaders: vec![crate::ShaderStage { source: vec![0; 4], entry_point: "main".into(), stage: crate::ShaderStages::MISS }],
            max_recursion_depth: 1,
            named_uniforms: Vec::new(),
        };
        let flags = VulkanRayTracingPipeline::stage_flags_in_push_order(&desc);
        assert_eq!(
            flags,
            vec![
                vk::ShaderStageFlags::RAYGEN_KHR,
                vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                vk::ShaderStageFlags::ANY_HIT_KHR,
                vk::ShaderStageFlags::MISS_KHR,
            ]
        );
    }
}
