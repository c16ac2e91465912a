//! Vulkan Sampler: immutable filter/address-mode/anisotropy state (§3).

use super::VulkanBackend;
use crate::{AddressMode, FilterMode, ResourceId, RhiError, RhiResult, Sampler, SamplerDescriptor};
use ash::vk;
use std::sync::Arc;

fn filter_to_vk(f: FilterMode) -> vk::Filter {
    match f {
        FilterMode::Nearest => vk::Filter::NEAREST,
        FilterMode::Linear => vk::Filter::LINEAR,
    }
}

fn mipmap_mode_to_vk(f: FilterMode) -> vk::SamplerMipmapMode {
    match f {
        FilterMode::Nearest => vk::SamplerMipmapMode::NEAREST,
        FilterMode::Linear => vk::SamplerMipmapMode::LINEAR,
    }
}

fn address_mode_to_vk(a: AddressMode) -> vk::SamplerAddressMode {
    match a {
        AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
        AddressMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
        AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        AddressMode::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
    }
}

pub fn create_sampler(backend: &VulkanBackend, desc: &SamplerDescriptor) -> RhiResult<VulkanSampler> {
    let anisotropy = desc.anisotropy_clamp.map(|c| c.clamp(1.0, 16.0));
    let create_info = vk::SamplerCreateInfo::default()
        .mag_filter(filter_to_vk(desc.mag_filter))
        .min_filter(filter_to_vk(desc.min_filter))
        .mipmap_mode(mipmap_mode_to_vk(desc.mip_filter))
        .address_mode_u(address_mode_to_vk(desc.address_mode_u))
        .address_mode_v(address_mode_to_vk(desc.address_mode_v))
        .address_mode_w(address_mode_to_vk(desc.address_mode_w))
        .anisotropy_enable(anisotropy.is_some())
        .max_anisotropy(anisotropy.unwrap_or(1.0))
        .min_lod(0.0)
        .max_lod(vk::LOD_CLAMP_NONE)
        .unnormalized_coordinates(false);
    let sampler = unsafe { backend.device.create_sampler(&create_info, None) }
        .map_err(|e| RhiError::FatalCreate(format!("create_sampler: {e:?}")))?;
    Ok(VulkanSampler { device: backend.device.clone(), sampler, id: backend.next_id() })
}

pub struct VulkanSampler {
    pub(crate) device: Arc<ash::Device>,
    pub(crate) sampler: vk::Sampler,
    pub(crate) id: ResourceId,
}

impl VulkanSampler {
    pub fn raw(&self) -> vk::Sampler {
        self.sampler
    }
}

impl Drop for VulkanSampler {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_sampler(self.sampler, None);
        }
    }
}

impl std::fmt::Debug for VulkanSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanSampler").field("id", &self.id).finish()
    }
}

impl Sampler for VulkanSampler {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
