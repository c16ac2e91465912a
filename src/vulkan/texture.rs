//! Vulkan Texture: VkImage + gpu-allocator allocation + ImageView, with the
//! mutable current-layout field the command list's barrier layer mutates
//! (I1, §4.F).

use super::VulkanBackend;
use crate::{ImageLayout, ResourceId, RhiError, RhiResult, Texture, TextureDescriptor, TextureDimension, TextureFormat, TextureUsage};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

pub fn texture_format_to_vk(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::Rgba8UnormSrgb => vk::Format::R8G8B8A8_SRGB,
        TextureFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        TextureFormat::Bgra8UnormSrgb => vk::Format::B8G8R8A8_SRGB,
        TextureFormat::Bc7Unorm => vk::Format::BC7_UNORM_BLOCK,
        TextureFormat::R32Float => vk::Format::R32_SFLOAT,
        TextureFormat::R16Float => vk::Format::R16_SFLOAT,
        TextureFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        TextureFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        TextureFormat::D32Float => vk::Format::D32_SFLOAT,
        TextureFormat::D24UnormS8Uint => vk::Format::D24_UNORM_S8_UINT,
        TextureFormat::A2b10g10r10Unorm => vk::Format::A2B10G10R10_UNORM_PACK32,
    }
}

/// §4.B: usage bits derived from the declared usage tag plus mip
/// requirements (I4), clamped against format capability (I2/I3).
pub fn texture_usage_to_vk(usage: TextureUsage, format: TextureFormat, mip_count: u32, sample_count: u32) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::empty();
    if usage.contains(TextureUsage::COPY_SRC) {
        flags |= vk::ImageUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(TextureUsage::COPY_DST) {
        flags |= vk::ImageUsageFlags::TRANSFER_DST;
    }
    if usage.contains(TextureUsage::TEXTURE_BINDING) {
        flags |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(TextureUsage::STORAGE_BINDING) && format.storage_capable() && sample_count == 1 {
        flags |= vk::ImageUsageFlags::STORAGE;
    }
    if usage.contains(TextureUsage::RENDER_ATTACHMENT) {
        flags |= if format.is_depth() {
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
        } else {
            vk::ImageUsageFlags::COLOR_ATTACHMENT
        };
    }
    // I4: mip-count > 1 implies transfer-src/dst so mip generation via blit
    // is possible.
    if mip_count > 1 {
        flags |= vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
    }
    flags
}

pub fn texture_dimension_to_image_type(dim: TextureDimension) -> vk::ImageType {
    match dim {
        TextureDimension::D2 | TextureDimension::D2Array | TextureDimension::Cube => vk::ImageType::TYPE_2D,
        TextureDimension::D3 => vk::ImageType::TYPE_3D,
    }
}

pub fn texture_dimension_to_view_type(dim: TextureDimension) -> vk::ImageViewType {
    match dim {
        TextureDimension::D2 => vk::ImageViewType::TYPE_2D,
        TextureDimension::D2Array => vk::ImageViewType::TYPE_2D_ARRAY,
        TextureDimension::D3 => vk::ImageViewType::TYPE_3D,
        TextureDimension::Cube => vk::ImageViewType::CUBE,
    }
}

pub(crate) fn layout_to_code(layout: ImageLayout) -> u8 {
    match layout {
        ImageLayout::Undefined => 0,
        ImageLayout::General => 1,
        ImageLayout::ColorAttachment => 2,
        ImageLayout::DepthStencilAttachment => 3,
        ImageLayout::ShaderReadOnly => 4,
        ImageLayout::TransferSrc => 5,
        ImageLayout::TransferDst => 6,
        ImageLayout::Present => 7,
    }
}

pub(crate) fn code_to_layout(code: u8) -> ImageLayout {
    match code {
        1 => ImageLayout::General,
        2 => ImageLayout::ColorAttachment,
        3 => ImageLayout::DepthStencilAttachment,
        4 => ImageLayout::ShaderReadOnly,
        5 => ImageLayout::TransferSrc,
        6 => ImageLayout::TransferDst,
        7 => ImageLayout::Present,
        _ => ImageLayout::Undefined,
    }
}

pub fn create_texture(backend: &VulkanBackend, descriptor: &TextureDescriptor) -> RhiResult<VulkanTexture> {
    // I2/I3: reject storage usage on incompatible formats/sample counts up
    // front rather than silently dropping the bit downstream.
    if descriptor.usage.contains(TextureUsage::STORAGE_BINDING)
        && (!descriptor.format.storage_capable() || descriptor.sample_count != 1)
    {
        return Err(RhiError::logic(
            "create_texture",
            "storage binding requested on a compressed/sRGB or multisampled format",
        ));
    }

    let (width, height, depth_or_layers) = descriptor.size;
    let extent = vk::Extent3D { width: width.max(1), height: height.max(1), depth: depth_or_layers.max(1) };
    let vk_format = texture_format_to_vk(descriptor.format);
    let mip_levels = descriptor.mip_level_count.max(1);
    let usage_flags = texture_usage_to_vk(descriptor.usage, descriptor.format, mip_levels, descriptor.sample_count.max(1));
    let image_type = texture_dimension_to_image_type(descriptor.dimension);

    let (array_layers, flags) = match descriptor.dimension {
        TextureDimension::D2 => (1, vk::ImageCreateFlags::empty()),
        TextureDimension::D2Array => (depth_or_layers.max(1), vk::ImageCreateFlags::empty()),
        TextureDimension::D3 => (1, vk::ImageCreateFlags::empty()),
        TextureDimension::Cube => (6, vk::ImageCreateFlags::CUBE_COMPATIBLE),
    };

    let samples = match descriptor.sample_count.max(1) {
        1 => vk::SampleCountFlags::TYPE_1,
        2 => vk::SampleCountFlags::TYPE_2,
        4 => vk::SampleCountFlags::TYPE_4,
        8 => vk::SampleCountFlags::TYPE_8,
        _ => vk::SampleCountFlags::TYPE_1,
    };

    let create_info = vk::ImageCreateInfo::default()
        .image_type(image_type)
        .format(vk_format)
        .extent(extent)
        .mip_levels(mip_levels)
        .array_layers(array_layers)
        .samples(samples)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(usage_flags)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .flags(flags)
        .initial_layout(vk::ImageLayout::UNDEFINED);

    let image = unsafe { backend.device.create_image(&create_info, None) }
        .map_err(|e| RhiError::FatalCreate(format!("create_image: {e:?}")))?;

    let requirements = unsafe { backend.device.get_image_memory_requirements(image) };
    let allocation = backend
        .allocator
        .lock()
        .unwrap()
        .allocate(&AllocationCreateDesc {
            name: descriptor.debug_name.as_deref().unwrap_or("texture"),
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
        .map_err(|e| RhiError::FatalCreate(format!("texture allocation: {e}")))?;

    unsafe {
        backend
            .device
            .bind_image_memory(image, allocation.memory(), allocation.offset())
            .map_err(|e| RhiError::FatalCreate(format!("bind_image_memory: {e:?}")))?;
    }

    let view_type = texture_dimension_to_view_type(descriptor.dimension);
    let aspect_mask = if descriptor.format.is_depth() {
        let mut m = vk::ImageAspectFlags::DEPTH;
        if descriptor.format.has_stencil() {
            m |= vk::ImageAspectFlags::STENCIL;
        }
        m
    } else {
        vk::ImageAspectFlags::COLOR
    };

    let view_create_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(view_type)
        .format(vk_format)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(aspect_mask)
                .base_mip_level(0)
                .level_count(mip_levels)
                .base_array_layer(0)
                .layer_count(array_layers),
        );

    let view = unsafe { backend.device.create_image_view(&view_create_info, None) }
        .map_err(|e| RhiError::FatalCreate(format!("create_image_view: {e:?}")))?;

    Ok(VulkanTexture {
        device: backend.device.clone(),
        allocator: backend.allocator.clone(),
        image,
        allocation: Some(allocation),
        view,
        format: descriptor.format,
        size: descriptor.size,
        dimension: descriptor.dimension,
        mip_level_count: mip_levels,
        array_layers,
        aspect_mask,
        id: backend.next_id(),
        current_layout: AtomicU8::new(layout_to_code(ImageLayout::Undefined)),
    })
}

pub struct VulkanTexture {
    pub(crate) device: Arc<ash::Device>,
    pub(crate) allocator: Arc<std::sync::Mutex<gpu_allocator::vulkan::Allocator>>,
    pub(crate) image: vk::Image,
    pub(crate) allocation: Option<Allocation>,
    pub(crate) view: vk::ImageView,
    pub(crate) format: TextureFormat,
    pub(crate) size: (u32, u32, u32),
    pub(crate) dimension: TextureDimension,
    pub(crate) mip_level_count: u32,
    pub(crate) array_layers: u32,
    pub(crate) aspect_mask: vk::ImageAspectFlags,
    pub(crate) id: ResourceId,
    pub(crate) current_layout: AtomicU8,
}

impl VulkanTexture {
    pub fn image(&self) -> vk::Image {
        self.image
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn aspect_mask(&self) -> vk::ImageAspectFlags {
        self.aspect_mask
    }

    pub fn array_layers(&self) -> u32 {
        self.array_layers
    }

    /// Creates an additional view over a single mip level, owned by the
    /// caller (binding set or feature integration, §4.B).
    pub fn create_mip_view(&self, base_mip: u32) -> RhiResult<vk::ImageView> {
        let view_create_info = vk::ImageViewCreateInfo::default()
            .image(self.image)
            .view_type(texture_dimension_to_view_type(self.dimension))
            .format(texture_format_to_vk(self.format))
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(self.aspect_mask)
                    .base_mip_level(base_mip)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(self.array_layers),
            );
        unsafe { self.device.create_image_view(&view_create_info, None) }
            .map_err(|e| RhiError::FatalCreate(format!("create_mip_view: {e:?}")))
    }
}

impl Drop for VulkanTexture {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            let _ = self.allocator.lock().unwrap().free(allocation);
        }
        unsafe {
            self.device.destroy_image_view(self.view, None);
            self.device.destroy_image(self.image, None);
        }
    }
}

impl std::fmt::Debug for VulkanTexture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanTexture")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("format", &self.format)
            .field("dimension", &self.dimension)
            .finish()
    }
}

impl Texture for VulkanTexture {
    fn id(&self) -> ResourceId {
        self.id
    }
    fn format(&self) -> TextureFormat {
        self.format
    }
    fn size(&self) -> (u32, u32, u32) {
        self.size
    }
    fn dimension(&self) -> TextureDimension {
        self.dimension
    }
    fn mip_level_count(&self) -> u32 {
        self.mip_level_count
    }
    fn current_layout(&self) -> ImageLayout {
        code_to_layout(self.current_layout.load(Ordering::Acquire))
    }
    fn set_current_layout(&self, layout: ImageLayout) {
        self.current_layout.store(layout_to_code(layout), Ordering::Release);
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_count_implies_transfer_usages() {
        let flags = texture_usage_to_vk(TextureUsage::TEXTURE_BINDING, TextureFormat::Rgba8Unorm, 4, 1);
        assert!(flags.contains(vk::ImageUsageFlags::TRANSFER_SRC));
        assert!(flags.contains(vk::ImageUsageFlags::TRANSFER_DST));
    }

    #[test]
    fn single_mip_does_not_force_transfer_usages() {
        let flags = texture_usage_to_vk(TextureUsage::TEXTURE_BINDING, TextureFormat::Rgba8Unorm, 1, 1);
        assert!(!flags.contains(vk::ImageUsageFlags::TRANSFER_SRC));
    }

    #[test]
    fn layout_code_roundtrip() {
        for layout in [
            ImageLayout::Undefined,
            ImageLayout::General,
            ImageLayout::ColorAttachment,
            ImageLayout::DepthStencilAttachment,
            ImageLayout::ShaderReadOnly,
            ImageLayout::TransferSrc,
            ImageLayout::TransferDst,
            ImageLayout::Present,
        ] {
            assert_eq!(code_to_layout(layout_to_code(layout)), layout);
        }
    }
}
