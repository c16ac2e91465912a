//! Vulkan swapchain (§4.G "Swapchain"): surface/format/present-mode
//! selection, per-image views, acquire/present. Owned and driven by the
//! frame scheduler — it is not one of the public resource types in `lib.rs`.

use crate::{RhiError, RhiResult};
use ash::vk;
use std::sync::Arc;

use super::VulkanBackend;

/// HDR10 10-bit PQ first, then 8-bit sRGB, else whatever the surface offers.
fn pick_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    formats
        .iter()
        .find(|f| f.format == vk::Format::A2B10G10R10_UNORM_PACK32 && f.color_space == vk::ColorSpaceKHR::HDR10_ST2084_EXT)
        .or_else(|| formats.iter().find(|f| f.format == vk::Format::B8G8R8A8_SRGB && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR))
        .or_else(|| formats.first())
        .copied()
        .expect("vkGetPhysicalDeviceSurfaceFormatsKHR returns at least one format")
}

fn pick_present_mode(modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

fn pick_extent(caps: &vk::SurfaceCapabilitiesKHR) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: caps.current_extent.width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: caps.current_extent.height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

pub struct VulkanSwapchain {
    device: Arc<ash::Device>,
    surface_loader: ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    loader: ash::khr::swapchain::Device,
    swapchain: vk::SwapchainKHR,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
}

impl VulkanSwapchain {
    /// `surface`/`surface_loader` are built by the caller (via
    /// [`create_surface`] when the `window` feature is enabled, or by the
    /// embedding application's own windowing layer).
    pub fn new(backend: &VulkanBackend, surface_loader: ash::khr::surface::Instance, surface: vk::SurfaceKHR) -> RhiResult<Self> {
        let loader = ash::khr::swapchain::Device::new(&backend.instance, &backend.device);
        let mut swapchain = Self {
            device: backend.device.clone(),
            surface_loader,
            surface,
            loader,
            swapchain: vk::SwapchainKHR::null(),
            format: vk::SurfaceFormatKHR::default(),
            extent: vk::Extent2D::default(),
            images: Vec::new(),
            views: Vec::new(),
        };
        swapchain.create(backend, vk::SwapchainKHR::null())?;
        Ok(swapchain)
    }

    fn create(&mut self, backend: &VulkanBackend, old: vk::SwapchainKHR) -> RhiResult<()> {
        let caps = unsafe { self.surface_loader.get_physical_device_surface_capabilities(backend.physical_device, self.surface) }
            .map_err(|e| RhiError::FatalCreate(format!("surface capabilities: {e:?}")))?;
        let formats = unsafe { self.surface_loader.get_physical_device_surface_formats(backend.physical_device, self.surface) }
            .map_err(|e| RhiError::FatalCreate(format!("surface formats: {e:?}")))?;
        let present_modes = unsafe { self.surface_loader.get_physical_device_surface_present_modes(backend.physical_device, self.surface) }
            .map_err(|e| RhiError::FatalCreate(format!("surface present modes: {e:?}")))?;

        self.format = pick_format(&formats);
        let present_mode = pick_present_mode(&present_modes);
        self.extent = pick_extent(&caps);

        let mut image_count = caps.min_image_count + 1;
        if caps.max_image_count > 0 {
            image_count = image_count.min(caps.max_image_count);
        }

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(self.format.format)
            .image_color_space(self.format.color_space)
            .image_extent(self.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old);

        let new_swapchain = unsafe { self.loader.create_swapchain(&create_info, None) }
            .map_err(|e| RhiError::FatalCreate(format!("create_swapchain: {e:?}")))?;

        for view in self.views.drain(..) {
            unsafe { self.device.destroy_image_view(view, None) };
        }
        if old != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(old, None) };
        }

        let images = unsafe { self.loader.get_swapchain_images(new_swapchain) }
            .map_err(|e| RhiError::FatalCreate(format!("get_swapchain_images: {e:?}")))?;
        self.views = images
            .iter()
            .map(|&image| {
                let view_info = vk::ImageViewCreateInfo::default()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(self.format.format)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    });
                unsafe { self.device.create_image_view(&view_info, None) }.map_err(|e| RhiError::FatalCreate(format!("swapchain image view: {e:?}")))
            })
            .collect::<RhiResult<Vec<_>>>()?;
        self.images = images;

        self.swapchain = new_swapchain;
        backend.set_swapchain_extent(self.extent.width, self.extent.height);
        Ok(())
    }

    /// Rebuilds the swapchain in place, reusing the old one as
    /// `oldSwapchain`. Callers must `deviceWaitIdle` first (the scheduler
    /// does so as part of its recreate hand-off, §5).
    pub fn recreate(&mut self, backend: &VulkanBackend) -> RhiResult<()> {
        let old = self.swapchain;
        self.create(backend, old)
    }

    /// §4.G: when the window collapses to zero area there is nothing to
    /// acquire or present; the caller should yield to the windowing system.
    pub fn is_zero_area(&self) -> bool {
        self.extent.width == 0 || self.extent.height == 0
    }

    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> RhiResult<Option<u32>> {
        match unsafe { self.loader.acquire_next_image(self.swapchain, u64::MAX, semaphore, vk::Fence::null()) } {
            Ok((index, _suboptimal)) => Ok(Some(index)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(None),
            Err(e) => Err(RhiError::FatalCreate(format!("acquire_next_image: {e:?}"))),
        }
    }

    /// Returns `true` if presentation succeeded and the swapchain is still
    /// current; `false` on out-of-date/suboptimal (caller should recreate).
    pub fn present(&self, queue: vk::Queue, wait: vk::Semaphore, image_index: u32) -> RhiResult<bool> {
        let swapchains = [self.swapchain];
        let wait_semaphores = [wait];
        let indices = [image_index];
        let present_info = vk::PresentInfoKHR::default().wait_semaphores(&wait_semaphores).swapchains(&swapchains).image_indices(&indices);
        match unsafe { self.loader.queue_present(queue, &present_info) } {
            Ok(suboptimal) => Ok(!suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(false),
            Err(e) => Err(RhiError::FatalCreate(format!("queue_present: {e:?}"))),
        }
    }

    pub fn image_view(&self, index: u32) -> vk::ImageView {
        self.views[index as usize]
    }

    pub fn image(&self, index: u32) -> vk::Image {
        self.images[index as usize]
    }

    pub fn image_count(&self) -> u32 {
        self.views.len() as u32
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.format.format
    }
}

impl Drop for VulkanSwapchain {
    fn drop(&mut self) {
        unsafe {
            for view in self.views.drain(..) {
                self.device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.swapchain, None);
            self.surface_loader.destroy_surface(self.surface, None);
        }
    }
}

impl std::fmt::Debug for VulkanSwapchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanSwapchain").field("extent", &self.extent).field("images", &self.views.len()).finish()
    }
}

/// Builds a `VkSurfaceKHR` from a windowing-system handle pair. Only built
/// with the `window` feature; covers the desktop platforms the
/// `raw-window-handle` ecosystem most commonly targets (Win32, Xlib, Wayland).
#[cfg(feature = "window")]
pub fn create_surface(
    entry: &ash::Entry,
    instance: &ash::Instance,
    display_handle: raw_window_handle::RawDisplayHandle,
    window_handle: raw_window_handle::RawWindowHandle,
) -> RhiResult<vk::SurfaceKHR> {
    use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

    match (display_handle, window_handle) {
        (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
            let loader = ash::khr::win32_surface::Instance::new(entry, instance);
            let create_info = vk::Win32SurfaceCreateInfoKHR::default()
                .hinstance(handle.hinstance.map(|h| h.get()).unwrap_or_default() as isize)
                .hwnd(handle.hwnd.get() as isize);
            unsafe { loader.create_win32_surface(&create_info, None) }.map_err(|e| RhiError::FatalCreate(format!("create_win32_surface: {e:?}")))
        }
        (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(window)) => {
            let loader = ash::khr::xlib_surface::Instance::new(entry, instance);
            let create_info = vk::XlibSurfaceCreateInfoKHR::default()
                .dpy(display.display.map(|d| d.as_ptr()).unwrap_or(std::ptr::null_mut()) as *mut _)
                .window(window.window);
            unsafe { loader.create_xlib_surface(&create_info, None) }.map_err(|e| RhiError::FatalCreate(format!("create_xlib_surface: {e:?}")))
        }
        (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(surface)) => {
            let loader = ash::khr::wayland_surface::Instance::new(entry, instance);
            let create_info = vk::WaylandSurfaceCreateInfoKHR::default()
                .display(display.display.as_ptr())
                .surface(surface.surface.as_ptr());
            unsafe { loader.create_wayland_surface(&create_info, None) }.map_err(|e| RhiError::FatalCreate(format!("create_wayland_surface: {e:?}")))
        }
        _ => Err(RhiError::FatalCapability("unsupported windowing system for surface creation".into())),
    }
}
