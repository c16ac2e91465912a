//! Vulkan RenderTarget: a compatible render pass plus a framebuffer, cached
//! by the backend so repeated render targets of the same shape reuse the
//! same `VkRenderPass` (§3, §4.F).

use super::texture::{texture_format_to_vk, VulkanTexture};
use super::VulkanBackend;
use crate::{ColorAttachmentDescriptor, DepthStencilAttachmentDescriptor, LoadOp, RenderTarget, RenderTargetDescriptor, ResourceId, RhiError, RhiResult, StoreOp, Texture, TextureFormat};
use ash::vk;
use ash::vk::Handle;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderPassCacheKey {
    colors: [Option<(TextureFormat, LoadOpCode, StoreOpCode)>; 8],
    color_count: usize,
    depth: Option<(TextureFormat, LoadOpCode, StoreOpCode)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum LoadOpCode {
    Load,
    Clear,
    Discard,
}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum StoreOpCode {
    Store,
    Discard,
}

fn load_op_code(op: LoadOp) -> LoadOpCode {
    match op {
        LoadOp::Load => LoadOpCode::Load,
        LoadOp::Clear => LoadOpCode::Clear,
        LoadOp::Discard => LoadOpCode::Discard,
    }
}
fn store_op_code(op: StoreOp) -> StoreOpCode {
    match op {
        StoreOp::Store => StoreOpCode::Store,
        StoreOp::Discard => StoreOpCode::Discard,
    }
}

fn load_op_to_vk(op: LoadOp) -> vk::AttachmentLoadOp {
    match op {
        LoadOp::Load => vk::AttachmentLoadOp::LOAD,
        LoadOp::Clear => vk::AttachmentLoadOp::CLEAR,
        LoadOp::Discard => vk::AttachmentLoadOp::DONT_CARE,
    }
}
fn store_op_to_vk(op: StoreOp) -> vk::AttachmentStoreOp {
    match op {
        StoreOp::Store => vk::AttachmentStoreOp::STORE,
        StoreOp::Discard => vk::AttachmentStoreOp::DONT_CARE,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FramebufferCacheKey {
    render_pass: u64,
    views: Vec<u64>,
    width: u32,
    height: u32,
}

fn create_render_pass(
    device: &ash::Device,
    color_attachments: &[ColorAttachmentDescriptor<'_>],
    depth_stencil: Option<&DepthStencilAttachmentDescriptor<'_>>,
) -> RhiResult<vk::RenderPass> {
    let mut attachments = Vec::new();
    let mut color_refs = Vec::new();
    let mut resolve_refs = Vec::new();
    let mut has_resolve = false;

    for att in color_attachments {
        let idx = attachments.len() as u32;
        attachments.push(
            vk::AttachmentDescription::default()
                .format(texture_format_to_vk(att.format))
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(load_op_to_vk(att.load_op))
                .store_op(store_op_to_vk(att.store_op))
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
        );
        color_refs.push(vk::AttachmentReference::default().attachment(idx).layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL));
        if att.resolve_texture.is_some() {
            has_resolve = true;
        }
    }

    for att in color_attachments {
        if att.resolve_texture.is_some() {
            let idx = attachments.len() as u32;
            attachments.push(
                vk::AttachmentDescription::default()
                    .format(texture_format_to_vk(att.format))
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
            );
            resolve_refs.push(vk::AttachmentReference::default().attachment(idx).layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL));
        } else if has_resolve {
            resolve_refs.push(vk::AttachmentReference::default().attachment(vk::ATTACHMENT_UNUSED).layout(vk::ImageLayout::UNDEFINED));
        }
    }

    let mut depth_ref = None;
    if let Some(dep) = depth_stencil {
        let idx = attachments.len() as u32;
        attachments.push(
            vk::AttachmentDescription::default()
                .format(texture_format_to_vk(dep.format))
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(load_op_to_vk(dep.depth_load_op))
                .store_op(store_op_to_vk(dep.depth_store_op))
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
        );
        depth_ref = Some(vk::AttachmentReference::default().attachment(idx).layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL));
    }

    let mut subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs);
    if has_resolve {
        subpass = subpass.resolve_attachments(&resolve_refs);
    }
    if let Some(ref d) = depth_ref {
        subpass = subpass.depth_stencil_attachment(d);
    }

    let create_info = vk::RenderPassCreateInfo::default().attachments(&attachments).subpasses(std::slice::from_ref(&subpass));

    unsafe { device.create_render_pass(&create_info, None) }.map_err(|e| RhiError::FatalCreate(format!("create_render_pass: {e:?}")))
}

/// One attachment of a built render target, in the exact index order
/// `create_render_pass` assigned (colours, then resolves that exist, then
/// depth). `view: None` marks a swapchain placeholder slot: the command
/// list fills it in with the current frame's live image view at
/// begin-pass time (§3).
#[derive(Debug, Clone, Copy)]
pub(crate) struct AttachmentSlot {
    pub view: Option<vk::ImageView>,
    pub format: TextureFormat,
    pub is_depth: bool,
    pub load_op: LoadOp,
}

pub fn create_render_target(backend: &VulkanBackend, desc: &RenderTargetDescriptor<'_>) -> RhiResult<VulkanRenderTarget> {
    if desc.color_attachments.len() > 8 {
        return Err(RhiError::logic("create_render_target", "at most 8 colour attachments supported"));
    }

    let imageless = desc.color_attachments.iter().any(|a| a.texture.is_none())
        || desc.depth_stencil_attachment.as_ref().is_some_and(|d| d.texture.is_none());

    let mut key = RenderPassCacheKey { colors: [None; 8], color_count: desc.color_attachments.len(), depth: None };
    for (i, att) in desc.color_attachments.iter().enumerate() {
        key.colors[i] = Some((att.format, load_op_code(att.load_op), store_op_code(att.store_op)));
    }
    if let Some(d) = &desc.depth_stencil_attachment {
        key.depth = Some((d.format, load_op_code(d.depth_load_op), store_op_code(d.depth_store_op)));
    }

    let render_pass = {
        let mut cache = backend.render_pass_cache.lock().unwrap();
        if let Some(rp) = cache.get(&key) {
            *rp
        } else {
            let rp = create_render_pass(&backend.device, &desc.color_attachments, desc.depth_stencil_attachment.as_ref())?;
            cache.insert(key, rp);
            rp
        }
    };

    let mut extent = vk::Extent2D { width: 0, height: 0 };
    for att in &desc.color_attachments {
        if let Some(tex) = att.texture {
            if let Some(vt) = tex.as_any().downcast_ref::<VulkanTexture>() {
                let (w, h, _) = vt.size();
                extent = vk::Extent2D { width: w, height: h };
            }
        }
    }
    if let Some(d) = &desc.depth_stencil_attachment {
        if let Some(tex) = d.texture {
            if let Some(vt) = tex.as_any().downcast_ref::<VulkanTexture>() {
                let (w, h, _) = vt.size();
                extent = vk::Extent2D { width: w, height: h };
            }
        }
    }
    if extent.width == 0 {
        let (w, h) = *backend.swapchain_extent.lock().unwrap();
        extent = vk::Extent2D { width: w.max(1), height: h.max(1) };
    }

    // Same index order as `create_render_pass`: all colours, then only the
    // resolve attachments that exist, then depth.
    let mut slots = Vec::new();
    for att in &desc.color_attachments {
        let view = match att.texture {
            Some(tex) => Some(
                tex.as_any()
                    .downcast_ref::<VulkanTexture>()
                    .ok_or_else(|| RhiError::logic("create_render_target", "attachment is not a Vulkan texture"))?
                    .view(),
            ),
            None => None,
        };
        slots.push(AttachmentSlot { view, format: att.format, is_depth: false, load_op: att.load_op });
    }
    for att in &desc.color_attachments {
        if let Some(resolve) = att.resolve_texture {
            let view = resolve
                .as_any()
                .downcast_ref::<VulkanTexture>()
                .ok_or_else(|| RhiError::logic("create_render_target", "resolve attachment is not a Vulkan texture"))?
                .view();
            // Resolve attachments are fully overwritten by the resolve step; the render pass
            // itself hardcodes their load op to DONT_CARE (see `create_render_pass` above).
            slots.push(AttachmentSlot { view: Some(view), format: att.format, is_depth: false, load_op: LoadOp::Discard });
        }
    }
    if let Some(d) = &desc.depth_stencil_attachment {
        let view = match d.texture {
            Some(tex) => Some(
                tex.as_any()
                    .downcast_ref::<VulkanTexture>()
                    .ok_or_else(|| RhiError::logic("create_render_target", "depth attachment is not a Vulkan texture"))?
                    .view(),
            ),
            None => None,
        };
        slots.push(AttachmentSlot { view, format: d.format, is_depth: true, load_op: d.depth_load_op });
    }

    let framebuffer = if imageless {
        let attachment_infos: Vec<vk::FramebufferAttachmentImageInfo> = slots
            .iter()
            .map(|slot| {
                let usage = if slot.is_depth {
                    vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
                } else {
                    vk::ImageUsageFlags::COLOR_ATTACHMENT
                };
                let format = texture_format_to_vk(slot.format);
                vk::FramebufferAttachmentImageInfo::default()
                    .usage(usage)
                    .width(extent.width.max(1))
                    .height(extent.height.max(1))
                    .layer_count(1)
                    .view_formats(std::slice::from_ref(&format))
            })
            .collect();
        let mut attachments_info = vk::FramebufferAttachmentsCreateInfo::default().attachment_image_infos(&attachment_infos);
        let create_info = vk::FramebufferCreateInfo::default()
            .flags(vk::FramebufferCreateFlags::IMAGELESS)
            .render_pass(render_pass)
            .width(extent.width.max(1))
            .height(extent.height.max(1))
            .layers(1)
            .attachment_count(slots.len() as u32)
            .push_next(&mut attachments_info);
        Some(
            unsafe { backend.device.create_framebuffer(&create_info, None) }
                .map_err(|e| RhiError::FatalCreate(format!("create_framebuffer (imageless): {e:?}")))?,
        )
    } else {
        let views: Vec<vk::ImageView> = slots.iter().map(|s| s.view.expect("non-imageless target requires every slot resolved")).collect();

        let fb_key = FramebufferCacheKey {
            render_pass: render_pass.as_raw(),
            views: views.iter().map(|v| v.as_raw()).collect(),
            width: extent.width,
            height: extent.height,
        };

        let mut cache = backend.framebuffer_cache.lock().unwrap();
        let fb = if let Some(fb) = cache.get(&fb_key) {
            *fb
        } else {
            let create_info = vk::FramebufferCreateInfo::default()
                .render_pass(render_pass)
                .attachments(&views)
                .width(extent.width.max(1))
                .height(extent.height.max(1))
                .layers(1);
            let fb = unsafe { backend.device.create_framebuffer(&create_info, None) }
                .map_err(|e| RhiError::FatalCreate(format!("create_framebuffer: {e:?}")))?;
            cache.insert(fb_key, fb);
            fb
        };
        Some(fb)
    };

    Ok(VulkanRenderTarget {
        device: backend.device.clone(),
        render_pass,
        framebuffer,
        slots,
        extent,
        color_count: desc.color_attachments.len(),
        has_depth: desc.depth_stencil_attachment.is_some(),
        imageless,
        id: backend.next_id(),
    })
}

pub struct VulkanRenderTarget {
    pub(crate) device: Arc<ash::Device>,
    pub(crate) render_pass: vk::RenderPass,
    /// The imageless framebuffer is destroyed on drop (it is not cached —
    /// only its render pass is); a fixed-image target's framebuffer lives in
    /// the backend's cache instead.
    pub(crate) framebuffer: Option<vk::Framebuffer>,
    pub(crate) slots: Vec<AttachmentSlot>,
    pub(crate) extent: vk::Extent2D,
    color_count: usize,
    has_depth: bool,
    imageless: bool,
    id: ResourceId,
}

impl VulkanRenderTarget {
    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }
    pub fn framebuffer(&self) -> Option<vk::Framebuffer> {
        self.framebuffer
    }
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
    pub fn id(&self) -> ResourceId {
        self.id
    }
}

impl Drop for VulkanRenderTarget {
    fn drop(&mut self) {
        if self.imageless {
            if let Some(fb) = self.framebuffer {
                unsafe { self.device.destroy_framebuffer(fb, None) };
            }
        }
    }
}

// render_pass is owned by the backend's cache and destroyed with it, not on
// a per-target `Drop` (multiple targets may share one). A fixed-image
// target's framebuffer lives in the same cache; only the imageless
// framebuffer above is per-target.
impl std::fmt::Debug for VulkanRenderTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanRenderTarget").field("id", &self.id).field("imageless", &self.imageless).finish()
    }
}

impl RenderTarget for VulkanRenderTarget {
    fn color_attachment_count(&self) -> usize {
        self.color_count
    }
    fn has_depth_stencil(&self) -> bool {
        self.has_depth
    }
    fn is_imageless(&self) -> bool {
        self.imageless
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_store_op_mapping() {
        assert_eq!(load_op_to_vk(LoadOp::Clear), vk::AttachmentLoadOp::CLEAR);
        assert_eq!(store_op_to_vk(StoreOp::Discard), vk::AttachmentStoreOp::DONT_CARE);
    }
}
