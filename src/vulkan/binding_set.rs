//! Vulkan BindingSet (§4.E): one dedicated descriptor pool and
//! descriptor-set-layout per set, written once at construction; sampled
//! texture arrays get update-after-bind so `update_textures` can patch them
//! mid-frame.

use super::texture::VulkanTexture;
use super::VulkanBackend;
use crate::{BindingResource, BindingSet, BindingShape, DescriptorKind, ResourceId, RhiError, RhiResult, Sampler, ShaderBindingEntry, ShaderStages, Texture};
use ash::vk;
use std::sync::Arc;

fn descriptor_kind_to_vk(kind: DescriptorKind) -> vk::DescriptorType {
    match kind {
        DescriptorKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        DescriptorKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        DescriptorKind::SampledTexture => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        DescriptorKind::StorageTexture => vk::DescriptorType::STORAGE_IMAGE,
        DescriptorKind::AccelerationStructure => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
    }
}

pub(crate) fn shader_stages_to_vk(stages: ShaderStages) -> vk::ShaderStageFlags {
    let mut flags = vk::ShaderStageFlags::empty();
    if stages.contains(ShaderStages::VERTEX) {
        flags |= vk::ShaderStageFlags::VERTEX;
    }
    if stages.contains(ShaderStages::FRAGMENT) {
        flags |= vk::ShaderStageFlags::FRAGMENT;
    }
    if stages.contains(ShaderStages::COMPUTE) {
        flags |= vk::ShaderStageFlags::COMPUTE;
    }
    if stages.contains(ShaderStages::RAYGEN) {
        flags |= vk::ShaderStageFlags::RAYGEN_KHR;
    }
    if stages.contains(ShaderStages::CLOSEST_HIT) {
        flags |= vk::ShaderStageFlags::CLOSEST_HIT_KHR;
    }
    if stages.contains(ShaderStages::ANY_HIT) {
        flags |= vk::ShaderStageFlags::ANY_HIT_KHR;
    }
    if stages.contains(ShaderStages::MISS) {
        flags |= vk::ShaderStageFlags::MISS_KHR;
    }
    if stages.contains(ShaderStages::INTERSECTION) {
        flags |= vk::ShaderStageFlags::INTERSECTION_KHR;
    }
    if stages.contains(ShaderStages::MESH) {
        flags |= vk::ShaderStageFlags::MESH_EXT;
    }
    if stages.contains(ShaderStages::TASK) {
        flags |= vk::ShaderStageFlags::TASK_EXT;
    }
    flags
}

fn texture_view(texture: &dyn Texture) -> RhiResult<vk::ImageView> {
    texture
        .as_any()
        .downcast_ref::<VulkanTexture>()
        .map(|t| t.view())
        .ok_or_else(|| RhiError::logic("binding_set", "texture is not a Vulkan texture"))
}

pub fn create_binding_set(backend: &VulkanBackend, entries: &[ShaderBindingEntry<'_>]) -> RhiResult<VulkanBindingSet> {
    let mut layout_bindings = Vec::with_capacity(entries.len());
    let mut binding_flags = Vec::with_capacity(entries.len());
    let mut pool_sizes: Vec<(vk::DescriptorType, u32)> = Vec::new();

    for entry in entries {
        let vk_ty = descriptor_kind_to_vk(entry.shape.kind);
        let count = entry.shape.array_count.max(1);
        layout_bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(entry.shape.binding_index)
                .descriptor_type(vk_ty)
                .descriptor_count(count)
                .stage_flags(shader_stages_to_vk(entry.shape.stages)),
        );
        let flags = if entry.shape.kind == DescriptorKind::SampledTexture {
            vk::DescriptorBindingFlags::UPDATE_AFTER_BIND | vk::DescriptorBindingFlags::PARTIALLY_BOUND
        } else {
            vk::DescriptorBindingFlags::empty()
        };
        binding_flags.push(flags);

        if let Some((_, n)) = pool_sizes.iter_mut().find(|(ty, _)| *ty == vk_ty) {
            *n += count;
        } else {
            pool_sizes.push((vk_ty, count));
        }
    }

    let mut flags_create_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);
    let layout_create_info = vk::DescriptorSetLayoutCreateInfo::default()
        .bindings(&layout_bindings)
        .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
        .push_next(&mut flags_create_info);

    let layout = unsafe { backend.device.create_descriptor_set_layout(&layout_create_info, None) }
        .map_err(|e| RhiError::FatalCreate(format!("create_descriptor_set_layout: {e:?}")))?;

    let vk_pool_sizes: Vec<vk::DescriptorPoolSize> =
        pool_sizes.iter().map(|(ty, count)| vk::DescriptorPoolSize::default().ty(*ty).descriptor_count((*count).max(1))).collect();

    let pool_create_info = vk::DescriptorPoolCreateInfo::default()
        .max_sets(1)
        .pool_sizes(&vk_pool_sizes)
        .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND);

    let pool = unsafe { backend.device.create_descriptor_pool(&pool_create_info, None) }.map_err(|e| {
        unsafe { backend.device.destroy_descriptor_set_layout(layout, None) };
        RhiError::FatalCreate(format!("create_descriptor_pool: {e:?}"))
    })?;

    let alloc_info = vk::DescriptorSetAllocateInfo::default().descriptor_pool(pool).set_layouts(std::slice::from_ref(&layout));
    let set = unsafe { backend.device.allocate_descriptor_sets(&alloc_info) }
        .map_err(|e| RhiError::FatalCreate(format!("allocate_descriptor_sets: {e:?}")))?[0];

    let mut owned_mip_views = Vec::new();
    write_descriptors(backend, set, entries, &mut owned_mip_views)?;

    Ok(VulkanBindingSet {
        device: backend.device.clone(),
        pool,
        layout,
        set,
        shapes: entries.iter().map(|e| e.shape).collect(),
        owned_mip_views,
        id: backend.next_id(),
    })
}

fn write_descriptors(
    backend: &VulkanBackend,
    set: vk::DescriptorSet,
    entries: &[ShaderBindingEntry<'_>],
    owned_mip_views: &mut Vec<vk::ImageView>,
) -> RhiResult<()> {
    for entry in entries {
        let count = entry.shape.array_count.max(1) as usize;
        match (&entry.resource, entry.shape.kind) {
            (BindingResource::Buffers(buffers), DescriptorKind::UniformBuffer | DescriptorKind::StorageBuffer) => {
                if buffers.is_empty() {
                    return Err(RhiError::logic("binding_set", "buffer binding requires at least one buffer"));
                }
                let vk_ty = descriptor_kind_to_vk(entry.shape.kind);
                let mut infos = Vec::with_capacity(count);
                for i in 0..count {
                    let buf = buffers.get(i).copied().unwrap_or(buffers[0]);
                    let vk_buf = buf
                        .as_any()
                        .downcast_ref::<super::buffer::VulkanBuffer>()
                        .ok_or_else(|| RhiError::logic("binding_set", "buffer is not a Vulkan buffer"))?;
                    infos.push(vk::DescriptorBufferInfo::default().buffer(vk_buf.raw()).offset(0).range(vk::WHOLE_SIZE));
                }
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(entry.shape.binding_index)
                    .dst_array_element(0)
                    .descriptor_type(vk_ty)
                    .buffer_info(&infos);
                unsafe { backend.device.update_descriptor_sets(&[write], &[]) };
            }
            (BindingResource::Textures(pairs), DescriptorKind::SampledTexture) => {
                if pairs.is_empty() {
                    return Err(RhiError::logic("binding_set", "sampled texture binding requires at least one texture"));
                }
                let mut infos = Vec::with_capacity(count);
                for i in 0..count {
                    let (tex, sampler) = pairs.get(i).copied().unwrap_or(pairs[0]);
                    let view = texture_view(tex)?;
                    let vk_sampler = sampler
                        .as_any()
                        .downcast_ref::<super::sampler::VulkanSampler>()
                        .ok_or_else(|| RhiError::logic("binding_set", "sampler is not a Vulkan sampler"))?;
                    infos.push(
                        vk::DescriptorImageInfo::default()
                            .image_view(view)
                            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                            .sampler(vk_sampler.raw()),
                    );
                }
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(entry.shape.binding_index)
                    .dst_array_element(0)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(&infos);
                unsafe { backend.device.update_descriptor_sets(&[write], &[]) };
            }
            (BindingResource::StorageTextures(textures), DescriptorKind::StorageTexture) => {
                if textures.is_empty() {
                    return Err(RhiError::logic("binding_set", "storage texture binding requires at least one texture"));
                }
                let mut infos = Vec::with_capacity(count);
                for i in 0..count {
                    let tex = textures.get(i).copied().unwrap_or(textures[0]);
                    let view = if let Some(base_mip) = entry.shape.mip_view_base {
                        let vt = tex
                            .as_any()
                            .downcast_ref::<VulkanTexture>()
                            .ok_or_else(|| RhiError::logic("binding_set", "texture is not a Vulkan texture"))?;
                        let mip_view = vt.create_mip_view(base_mip)?;
                        owned_mip_views.push(mip_view);
                        mip_view
                    } else {
                        texture_view(tex)?
                    };
                    infos.push(vk::DescriptorImageInfo::default().image_view(view).image_layout(vk::ImageLayout::GENERAL));
                }
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(entry.shape.binding_index)
                    .dst_array_element(0)
                    .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                    .image_info(&infos);
                unsafe { backend.device.update_descriptor_sets(&[write], &[]) };
            }
            (BindingResource::AccelerationStructures(structures), DescriptorKind::AccelerationStructure) => {
                if structures.is_empty() {
                    return Err(RhiError::logic("binding_set", "acceleration structure binding requires at least one TLAS"));
                }
                let tlas = structures[0]
                    .as_any()
                    .downcast_ref::<super::acceleration_structure::VulkanTlas>()
                    .ok_or_else(|| RhiError::logic("binding_set", "acceleration structure is not a Vulkan TLAS"))?;
                let handle = tlas.raw();
                let mut as_write = vk::WriteDescriptorSetAccelerationStructureKHR::default().acceleration_structures(std::slice::from_ref(&handle));
                let mut write = vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(entry.shape.binding_index)
                    .dst_array_element(0)
                    .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                    .descriptor_count(1)
                    .push_next(&mut as_write);
                write.descriptor_count = 1;
                unsafe { backend.device.update_descriptor_sets(&[write], &[]) };
            }
            _ => return Err(RhiError::logic("binding_set", "binding resource does not match its declared descriptor kind")),
        }
    }
    Ok(())
}

pub struct VulkanBindingSet {
    pub(crate) device: Arc<ash::Device>,
    pub(crate) pool: vk::DescriptorPool,
    pub(crate) layout: vk::DescriptorSetLayout,
    pub(crate) set: vk::DescriptorSet,
    shapes: Vec<BindingShape>,
    owned_mip_views: Vec<vk::ImageView>,
    id: ResourceId,
}

impl VulkanBindingSet {
    pub fn raw_set(&self) -> vk::DescriptorSet {
        self.set
    }
    pub fn raw_layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }
    pub fn id(&self) -> ResourceId {
        self.id
    }
}

impl Drop for VulkanBindingSet {
    fn drop(&mut self) {
        unsafe {
            for view in &self.owned_mip_views {
                self.device.destroy_image_view(*view, None);
            }
            // Descriptor sets allocated from a pool being destroyed need no
            // explicit free.
            self.device.destroy_descriptor_pool(self.pool, None);
            self.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

impl std::fmt::Debug for VulkanBindingSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanBindingSet").field("id", &self.id).finish()
    }
}

impl BindingSet for VulkanBindingSet {
    fn entries(&self) -> &[BindingShape] {
        &self.shapes
    }

    /// §4.E: rewrite a subset of a sampled-texture-array binding, relying on
    /// the update-after-bind guarantee established at construction.
    fn update_textures(&self, binding_index: u32, updates: &[(u32, &dyn Texture, &dyn Sampler)]) -> RhiResult<()> {
        let shape = self
            .shapes
            .iter()
            .find(|s| s.binding_index == binding_index)
            .ok_or_else(|| RhiError::logic("update_textures", "no such binding index"))?;
        if shape.kind != DescriptorKind::SampledTexture {
            return Err(RhiError::logic("update_textures", "binding is not a sampled-texture array"));
        }
        for (array_element, texture, sampler) in updates {
            let view = texture_view(*texture)?;
            let vk_sampler = sampler
                .as_any()
                .downcast_ref::<super::sampler::VulkanSampler>()
                .ok_or_else(|| RhiError::logic("update_textures", "sampler is not a Vulkan sampler"))?;
            let image_info = vk::DescriptorImageInfo::default()
                .image_view(view)
                .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .sampler(vk_sampler.raw());
            let write = vk::WriteDescriptorSet::default()
                .dst_set(self.set)
                .dst_binding(binding_index)
                .dst_array_element(*array_element)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(std::slice::from_ref(&image_info));
            unsafe { self.device.update_descriptor_sets(&[write], &[]) };
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_kind_mapping_matches_vulkan() {
        assert_eq!(descriptor_kind_to_vk(DescriptorKind::SampledTexture), vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert_eq!(descriptor_kind_to_vk(DescriptorKind::AccelerationStructure), vk::DescriptorType::ACCELERATION_STRUCTURE_KHR);
    }
}
