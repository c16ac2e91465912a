//! Vulkan CommandList (§4.F): the stateful recorder wrapping one
//! `VkCommandBuffer`. Tracks the active pipeline's bind point/layout/push
//! constants, resolves `ResourceId`s for `execute_buffer_copy_operations`
//! against a per-recording registry populated from every other method that
//! receives a `&dyn Buffer`/`&dyn Texture`, and drives the automatic
//! sync2 barrier tables in `vulkan/mod.rs` for clear/copy/mipmap/write-barrier
//! operations.

use super::binding_set::VulkanBindingSet;
use super::buffer::VulkanBuffer;
use super::pipeline::{VulkanComputePipeline, VulkanGraphicsPipeline, VulkanRayTracingPipeline};
use super::render_target::VulkanRenderTarget;
use super::scheduler::AcquiredFrame;
use super::texture::VulkanTexture;
use super::acceleration_structure::{VulkanBlas, VulkanTlas};
use super::{image_barrier_stages_access, image_layout_to_vk, required_layout_for_binding, VulkanBackend};
use crate::{
    BindingSet, BottomLevelAccelerationStructure, Buffer, BufferCopyOp, BufferUsage, ClearColor, CommandList,
    ComputeState, DescriptorKind, ImageLayout, IndexFormat, LoadOp, RayTracingState, RenderState, RenderTarget,
    ResourceId, RhiError, RhiResult, Texture, TopLevelAccelerationStructure,
};
use ash::vk;
use std::collections::HashMap;
use std::ffi::CString;

fn index_format_to_vk(format: IndexFormat) -> vk::IndexType {
    match format {
        IndexFormat::Uint16 => vk::IndexType::UINT16,
        IndexFormat::Uint32 => vk::IndexType::UINT32,
    }
}

fn mip_extent(size: (u32, u32, u32), mip: u32) -> (u32, u32, u32) {
    ((size.0 >> mip).max(1), (size.1 >> mip).max(1), (size.2 >> mip).max(1))
}

#[derive(Clone, Copy)]
enum RegisteredResource {
    Buffer { buffer: vk::Buffer },
    Texture { image: vk::Image, aspect_mask: vk::ImageAspectFlags, array_layers: u32, size: (u32, u32, u32) },
}

struct ActivePipeline {
    bind_point: vk::PipelineBindPoint,
    layout: vk::PipelineLayout,
    push_constant_stages: vk::ShaderStageFlags,
    named_uniforms: Vec<(String, u32, u32)>,
}

struct RayTracingDispatch {
    rt_loader: ash::khr::ray_tracing_pipeline::Device,
    raygen: vk::StridedDeviceAddressRegionKHR,
    miss: vk::StridedDeviceAddressRegionKHR,
    hit: vk::StridedDeviceAddressRegionKHR,
}

/// One open recording of a primary or transient command buffer (§4.F).
/// Built either directly from a raw `vk::CommandBuffer` (transient/
/// out-of-band recordings) or via [`VulkanCommandList::for_frame`] which
/// also makes the current frame's live swapchain image view available to
/// `begin_rendering` for the imageless placeholder slot (§3, §4.G).
pub struct VulkanCommandList<'a> {
    backend: &'a VulkanBackend,
    command_buffer: vk::CommandBuffer,
    swapchain_image_view: Option<vk::ImageView>,
    registry: HashMap<ResourceId, RegisteredResource>,
    active: Option<ActivePipeline>,
    ray_tracing: Option<RayTracingDispatch>,
    render_pass_open: bool,
    bound_vertex_buffers: HashMap<u32, vk::Buffer>,
    bound_index_buffer: Option<vk::Buffer>,
}

impl<'a> VulkanCommandList<'a> {
    pub fn new(backend: &'a VulkanBackend, command_buffer: vk::CommandBuffer) -> Self {
        Self {
            backend,
            command_buffer,
            swapchain_image_view: None,
            registry: HashMap::new(),
            active: None,
            ray_tracing: None,
            render_pass_open: false,
            bound_vertex_buffers: HashMap::new(),
            bound_index_buffer: None,
        }
    }

    /// Wraps the scheduler's acquired frame so an imageless render target
    /// referencing the swapchain placeholder slot (`AttachmentSlot { view:
    /// None, .. }`) can be bound against the frame's live image view.
    pub fn for_frame(backend: &'a VulkanBackend, frame: &AcquiredFrame) -> Self {
        let mut list = Self::new(backend, frame.command_buffer);
        list.swapchain_image_view = Some(frame.image_view);
        list
    }

    fn device(&self) -> &ash::Device {
        &self.backend.device
    }

    fn downcast_texture<'t>(&self, texture: &'t dyn Texture) -> RhiResult<&'t VulkanTexture> {
        texture.as_any().downcast_ref::<VulkanTexture>().ok_or_else(|| RhiError::logic("command_list", "texture is not a Vulkan texture"))
    }

    fn downcast_buffer<'b>(&self, buffer: &'b dyn Buffer) -> RhiResult<&'b VulkanBuffer> {
        buffer.as_any().downcast_ref::<VulkanBuffer>().ok_or_else(|| RhiError::logic("command_list", "buffer is not a Vulkan buffer"))
    }

    fn register_buffer(&mut self, buffer: &dyn Buffer) {
        if let Ok(vb) = self.downcast_buffer(buffer) {
            self.registry.insert(buffer.id(), RegisteredResource::Buffer { buffer: vb.raw() });
        }
    }

    fn register_texture(&mut self, texture: &dyn Texture) {
        if let Ok(vt) = self.downcast_texture(texture) {
            self.registry.insert(
                texture.id(),
                RegisteredResource::Texture { image: vt.image(), aspect_mask: vt.aspect_mask(), array_layers: vt.array_layers(), size: texture.size() },
            );
        }
    }

    /// Direct per-subresource-range barrier, bypassing a texture's
    /// whole-image `current_layout` tracking. Used by `generate_mipmaps`,
    /// which needs every mip in a different transient layout at once.
    fn image_barrier_direct(
        &self,
        image: vk::Image,
        aspect_mask: vk::ImageAspectFlags,
        base_mip: u32,
        level_count: u32,
        layer_count: u32,
        old: ImageLayout,
        new: ImageLayout,
        is_depth: bool,
    ) {
        let (src_stage, src_access, dst_stage, dst_access) = image_barrier_stages_access(old, new, is_depth);
        let barrier = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(src_stage)
            .src_access_mask(src_access)
            .dst_stage_mask(dst_stage)
            .dst_access_mask(dst_access)
            .old_layout(image_layout_to_vk(old))
            .new_layout(image_layout_to_vk(new))
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange { aspect_mask, base_mip_level: base_mip, level_count, base_array_layer: 0, layer_count });
        let dep_info = vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));
        unsafe { self.device().cmd_pipeline_barrier2(self.command_buffer, &dep_info) };
    }

    /// Whole-image transition that also updates the texture's tracked
    /// `current_layout` (I1). No-op if already in `new_layout`.
    fn transition_texture(&self, texture: &dyn Texture, vt: &VulkanTexture, new_layout: ImageLayout) {
        let old = texture.current_layout();
        if old == new_layout {
            return;
        }
        let is_depth = texture.format().is_depth();
        self.image_barrier_direct(vt.image(), vt.aspect_mask(), 0, vk::REMAINING_MIP_LEVELS, vk::REMAINING_ARRAY_LAYERS, old, new_layout, is_depth);
        texture.set_current_layout(new_layout);
    }

    /// Closes a still-open render pass before a new pipeline state is set,
    /// warning since the caller should have called `end_rendering` itself.
    fn close_open_render_pass(&mut self) {
        if self.render_pass_open {
            log::warn!("a new pipeline state was set while a render pass was still open; ending it first");
            unsafe { self.device().cmd_end_render_pass(self.command_buffer) };
            self.render_pass_open = false;
        }
    }

    fn acceleration_structure_barrier(&self) {
        let barrier = vk::MemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR)
            .src_access_mask(vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR)
            .dst_stage_mask(vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR | vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR)
            .dst_access_mask(vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR | vk::AccessFlags2::SHADER_READ);
        let dep_info = vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&barrier));
        unsafe { self.device().cmd_pipeline_barrier2(self.command_buffer, &dep_info) };
    }
}

impl CommandList for VulkanCommandList<'_> {
    fn begin_rendering(&mut self, target: &dyn RenderTarget, state: &dyn RenderState, clear_colors: &[ClearColor], auto_viewport: bool) -> RhiResult<()> {
        let vt = target.as_any().downcast_ref::<VulkanRenderTarget>().ok_or_else(|| RhiError::logic("begin_rendering", "target is not a Vulkan render target"))?;
        let pipeline = state
            .as_any()
            .downcast_ref::<VulkanGraphicsPipeline>()
            .ok_or_else(|| RhiError::logic("begin_rendering", "state is not a Vulkan graphics pipeline"))?;

        self.close_open_render_pass();

        let color_count = target.color_attachment_count();
        let mut clear_values = Vec::with_capacity(vt.slots.len());
        for (i, slot) in vt.slots.iter().enumerate() {
            if slot.is_depth {
                clear_values.push(vk::ClearValue { depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 } });
            } else if i < color_count {
                if slot.load_op == LoadOp::Clear {
                    let c = clear_colors.get(i).copied().ok_or_else(|| {
                        RhiError::logic("begin_rendering", format!("colour attachment {i} has load op Clear but no clear value was provided"))
                    })?;
                    clear_values.push(vk::ClearValue { color: vk::ClearColorValue { float32: [c.r, c.g, c.b, c.a] } });
                } else {
                    clear_values.push(vk::ClearValue::default());
                }
            } else {
                clear_values.push(vk::ClearValue::default());
            }
        }

        let views: Vec<vk::ImageView> = vt
            .slots
            .iter()
            .map(|slot| match slot.view {
                Some(v) => Ok(v),
                None => self
                    .swapchain_image_view
                    .ok_or_else(|| RhiError::logic("begin_rendering", "render target references the swapchain placeholder but no live image view is available")),
            })
            .collect::<RhiResult<Vec<_>>>()?;

        let framebuffer = vt.framebuffer.ok_or_else(|| RhiError::logic("begin_rendering", "render target has no framebuffer"))?;
        let render_area = vk::Rect2D { offset: vk::Offset2D { x: 0, y: 0 }, extent: vt.extent };

        let mut attachment_begin_info = vk::RenderPassAttachmentBeginInfo::default().attachments(&views);
        let mut begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(vt.render_pass)
            .framebuffer(framebuffer)
            .render_area(render_area)
            .clear_values(&clear_values);
        if target.is_imageless() {
            begin_info = begin_info.push_next(&mut attachment_begin_info);
        }

        unsafe {
            self.device().cmd_begin_render_pass(self.command_buffer, &begin_info, vk::SubpassContents::INLINE);
            self.device().cmd_bind_pipeline(self.command_buffer, vk::PipelineBindPoint::GRAPHICS, pipeline.raw());
        }
        self.render_pass_open = true;
        let (push_constant_stages, _) = pipeline.push_constant_info();
        self.active = Some(ActivePipeline {
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            layout: pipeline.layout(),
            push_constant_stages,
            named_uniforms: pipeline.named_uniforms().to_vec(),
        });
        self.ray_tracing = None;

        if auto_viewport {
            self.set_viewport(0.0, 0.0, vt.extent.width as f32, vt.extent.height as f32);
        }
        Ok(())
    }

    fn end_rendering(&mut self) {
        unsafe { self.device().cmd_end_render_pass(self.command_buffer) };
        self.render_pass_open = false;
        self.active = None;
    }

    fn set_compute_state(&mut self, state: &dyn ComputeState) -> RhiResult<()> {
        let pipeline = state
            .as_any()
            .downcast_ref::<VulkanComputePipeline>()
            .ok_or_else(|| RhiError::logic("set_compute_state", "state is not a Vulkan compute pipeline"))?;
        self.close_open_render_pass();
        unsafe { self.device().cmd_bind_pipeline(self.command_buffer, vk::PipelineBindPoint::COMPUTE, pipeline.raw()) };
        let (push_constant_stages, _) = pipeline.push_constant_info();
        self.active = Some(ActivePipeline {
            bind_point: vk::PipelineBindPoint::COMPUTE,
            layout: pipeline.layout(),
            push_constant_stages,
            named_uniforms: pipeline.named_uniforms().to_vec(),
        });
        self.ray_tracing = None;
        Ok(())
    }

    fn set_ray_tracing_state(&mut self, state: &dyn RayTracingState) -> RhiResult<()> {
        let pipeline = state
            .as_any()
            .downcast_ref::<VulkanRayTracingPipeline>()
            .ok_or_else(|| RhiError::logic("set_ray_tracing_state", "state is not a Vulkan ray tracing pipeline"))?;
        self.close_open_render_pass();
        unsafe { self.device().cmd_bind_pipeline(self.command_buffer, vk::PipelineBindPoint::RAY_TRACING_KHR, pipeline.raw()) };
        let (push_constant_stages, _) = pipeline.push_constant_info();
        self.active = Some(ActivePipeline {
            bind_point: vk::PipelineBindPoint::RAY_TRACING_KHR,
            layout: pipeline.layout(),
            push_constant_stages,
            named_uniforms: pipeline.named_uniforms().to_vec(),
        });
        let (raygen, miss, hit) = pipeline.sbt_regions();
        self.ray_tracing = Some(RayTracingDispatch { rt_loader: pipeline.rt_loader().clone(), raygen, miss, hit });
        Ok(())
    }

    fn bind_set(&mut self, set: &dyn BindingSet, slot: u32) -> RhiResult<()> {
        let vset = set.as_any().downcast_ref::<VulkanBindingSet>().ok_or_else(|| RhiError::logic("bind_set", "set is not a Vulkan binding set"))?;
        let active = self.active.as_ref().ok_or_else(|| RhiError::logic("bind_set", "no pipeline state is bound"))?;
        let sets = [vset.raw_set()];
        unsafe { self.device().cmd_bind_descriptor_sets(self.command_buffer, active.bind_point, active.layout, slot, &sets, &[]) };
        Ok(())
    }

    fn set_named_uniform(&mut self, name: &str, bytes: &[u8]) -> RhiResult<()> {
        let active = self.active.as_ref().ok_or_else(|| RhiError::logic("set_named_uniform", "no pipeline state is bound"))?;
        let (offset, size) = active
            .named_uniforms
            .iter()
            .find(|(n, ..)| n == name)
            .map(|(_, o, s)| (*o, *s))
            .ok_or_else(|| RhiError::logic("set_named_uniform", format!("no named uniform '{name}' in the active pipeline")))?;
        if bytes.len() as u32 != size {
            return Err(RhiError::logic("set_named_uniform", format!("uniform '{name}' expects {size} bytes, got {}", bytes.len())));
        }
        unsafe { self.device().cmd_push_constants(self.command_buffer, active.layout, active.push_constant_stages, offset, bytes) };
        Ok(())
    }

    fn bind_vertex_buffer(&mut self, binding: u32, buffer: &dyn Buffer, offset: u64) {
        self.register_buffer(buffer);
        if let Ok(vb) = self.downcast_buffer(buffer) {
            self.bound_vertex_buffers.insert(binding, vb.raw());
            unsafe { self.device().cmd_bind_vertex_buffers(self.command_buffer, binding, &[vb.raw()], &[offset]) };
        }
    }

    fn bind_index_buffer(&mut self, buffer: &dyn Buffer, offset: u64, format: IndexFormat) {
        self.register_buffer(buffer);
        if let Ok(vb) = self.downcast_buffer(buffer) {
            self.bound_index_buffer = Some(vb.raw());
            unsafe { self.device().cmd_bind_index_buffer(self.command_buffer, vb.raw(), offset, index_format_to_vk(format)) };
        }
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32) -> RhiResult<()> {
        if self.active.is_none() {
            return Err(RhiError::logic("draw", "no pipeline state is bound"));
        }
        if self.bound_vertex_buffers.is_empty() {
            return Err(RhiError::logic("draw", "no bound vertex buffer"));
        }
        unsafe { self.device().cmd_draw(self.command_buffer, vertex_count, instance_count, 0, 0) };
        Ok(())
    }

    fn draw_indexed(&mut self, index_count: u32, instance_count: u32) -> RhiResult<()> {
        if self.active.is_none() {
            return Err(RhiError::logic("draw_indexed", "no pipeline state is bound"));
        }
        if self.bound_vertex_buffers.is_empty() {
            return Err(RhiError::logic("draw_indexed", "no bound vertex buffer"));
        }
        if self.bound_index_buffer.is_none() {
            return Err(RhiError::logic("draw_indexed", "no bound index buffer"));
        }
        unsafe { self.device().cmd_draw_indexed(self.command_buffer, index_count, instance_count, 0, 0, 0) };
        Ok(())
    }

    fn draw_indirect(&mut self, indirect: &dyn Buffer, count: &dyn Buffer) -> RhiResult<()> {
        if self.active.is_none() {
            return Err(RhiError::logic("draw_indirect", "no pipeline state is bound"));
        }
        if indirect.usage() != BufferUsage::Indirect {
            return Err(RhiError::logic("draw_indirect", "indirect buffer does not have the Indirect usage tag"));
        }
        if count.usage() != BufferUsage::Indirect {
            return Err(RhiError::logic("draw_indirect", "count buffer does not have the Indirect usage tag"));
        }
        self.register_buffer(indirect);
        self.register_buffer(count);
        let vindirect = self.downcast_buffer(indirect)?;
        let vcount = self.downcast_buffer(count)?;
        let stride = std::mem::size_of::<vk::DrawIndexedIndirectCommand>() as u32;
        let max_draw_count = (vindirect.size() / stride as u64).max(1) as u32;
        unsafe {
            self.device().cmd_draw_indexed_indirect_count(self.command_buffer, vindirect.raw(), 0, vcount.raw(), 0, max_draw_count, stride);
        }
        Ok(())
    }

    fn draw_mesh_tasks(&mut self, x: u32, y: u32, z: u32) -> RhiResult<()> {
        use crate::Backend;
        if !self.backend.has_active_capability(crate::config::OptionalCapability::MeshShading) {
            return Err(RhiError::FatalCapability("mesh shading is not active".into()));
        }
        let loader = ash::ext::mesh_shader::Device::new(&self.backend.instance, &self.backend.device);
        unsafe { loader.cmd_draw_mesh_tasks(self.command_buffer, x, y, z) };
        Ok(())
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) -> RhiResult<()> {
        if self.active.is_none() {
            return Err(RhiError::logic("dispatch", "no pipeline state is bound"));
        }
        unsafe { self.device().cmd_dispatch(self.command_buffer, x, y, z) };
        Ok(())
    }

    fn trace_rays(&mut self, width: u32, height: u32, depth: u32) -> RhiResult<()> {
        let rt = self.ray_tracing.as_ref().ok_or_else(|| RhiError::logic("trace_rays", "no ray tracing state is bound"))?;
        let callable = vk::StridedDeviceAddressRegionKHR::default();
        unsafe {
            rt.rt_loader.cmd_trace_rays(self.command_buffer, &rt.raygen, &rt.miss, &rt.hit, &callable, width, height, depth);
        }
        Ok(())
    }

    fn set_viewport(&mut self, x: f32, y: f32, width: f32, height: f32) {
        // Negative-height viewport so Y matches the rest of the pipeline's convention.
        let viewport = vk::Viewport { x, y: y + height, width, height: -height, min_depth: 0.0, max_depth: 1.0 };
        let scissor = vk::Rect2D { offset: vk::Offset2D { x: x as i32, y: y as i32 }, extent: vk::Extent2D { width: width as u32, height: height as u32 } };
        unsafe {
            self.device().cmd_set_viewport(self.command_buffer, 0, &[viewport]);
            self.device().cmd_set_scissor(self.command_buffer, 0, &[scissor]);
        }
    }

    fn set_depth_bias(&mut self, constant: f32, clamp: f32, slope: f32) {
        unsafe { self.device().cmd_set_depth_bias(self.command_buffer, constant, clamp, slope) };
    }

    fn clear_texture(&mut self, texture: &dyn Texture, color: ClearColor) {
        self.register_texture(texture);
        let Ok(vt) = self.downcast_texture(texture) else { return };
        self.transition_texture(texture, vt, ImageLayout::TransferDst);
        let range = vk::ImageSubresourceRange {
            aspect_mask: vt.aspect_mask(),
            base_mip_level: 0,
            level_count: vk::REMAINING_MIP_LEVELS,
            base_array_layer: 0,
            layer_count: vk::REMAINING_ARRAY_LAYERS,
        };
        unsafe {
            if texture.format().is_depth() {
                // depth textures clear using the red channel as depth, stencil 0.
                let value = vk::ClearDepthStencilValue { depth: color.r, stencil: 0 };
                self.device().cmd_clear_depth_stencil_image(self.command_buffer, vt.image(), vk::ImageLayout::TRANSFER_DST_OPTIMAL, &value, &[range]);
            } else {
                let value = vk::ClearColorValue { float32: [color.r, color.g, color.b, color.a] };
                self.device().cmd_clear_color_image(self.command_buffer, vt.image(), vk::ImageLayout::TRANSFER_DST_OPTIMAL, &value, &[range]);
            }
        }
    }

    fn copy_texture(&mut self, src: &dyn Texture, dst: &dyn Texture, src_mip: u32, dst_mip: u32) {
        self.register_texture(src);
        self.register_texture(dst);
        let (Ok(vsrc), Ok(vdst)) = (self.downcast_texture(src), self.downcast_texture(dst)) else { return };
        self.transition_texture(src, vsrc, ImageLayout::TransferSrc);
        self.transition_texture(dst, vdst, ImageLayout::TransferDst);

        let (sw, sh, sd) = mip_extent(src.size(), src_mip);
        let (dw, dh, dd) = mip_extent(dst.size(), dst_mip);
        let extent = vk::Extent3D { width: sw.min(dw), height: sh.min(dh), depth: sd.min(dd) };

        let region = vk::ImageCopy::default()
            .src_subresource(vk::ImageSubresourceLayers { aspect_mask: vsrc.aspect_mask(), mip_level: src_mip, base_array_layer: 0, layer_count: vsrc.array_layers() })
            .dst_subresource(vk::ImageSubresourceLayers { aspect_mask: vdst.aspect_mask(), mip_level: dst_mip, base_array_layer: 0, layer_count: vdst.array_layers() })
            .extent(extent);
        unsafe {
            self.device().cmd_copy_image(
                self.command_buffer,
                vsrc.image(),
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vdst.image(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
    }

    fn generate_mipmaps(&mut self, texture: &dyn Texture) {
        self.register_texture(texture);
        let Ok(vt) = self.downcast_texture(texture) else { return };
        let mip_count = texture.mip_level_count();
        let layers = vt.array_layers();
        let aspect = vt.aspect_mask();
        if mip_count <= 1 {
            texture.set_current_layout(ImageLayout::ShaderReadOnly);
            return;
        }

        let base_layout = texture.current_layout();
        self.image_barrier_direct(vt.image(), aspect, 0, 1, layers, base_layout, ImageLayout::TransferSrc, false);

        let (mut w, mut h, _) = texture.size();
        for level in 1..mip_count {
            self.image_barrier_direct(vt.image(), aspect, level, 1, layers, ImageLayout::Undefined, ImageLayout::TransferDst, false);
            let dst_w = (w / 2).max(1);
            let dst_h = (h / 2).max(1);
            let blit = vk::ImageBlit::default()
                .src_subresource(vk::ImageSubresourceLayers { aspect_mask: aspect, mip_level: level - 1, base_array_layer: 0, layer_count: layers })
                .src_offsets([vk::Offset3D::default(), vk::Offset3D { x: w as i32, y: h as i32, z: 1 }])
                .dst_subresource(vk::ImageSubresourceLayers { aspect_mask: aspect, mip_level: level, base_array_layer: 0, layer_count: layers })
                .dst_offsets([vk::Offset3D::default(), vk::Offset3D { x: dst_w as i32, y: dst_h as i32, z: 1 }]);
            unsafe {
                self.device().cmd_blit_image(
                    self.command_buffer,
                    vt.image(),
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    vt.image(),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[blit],
                    vk::Filter::LINEAR,
                );
            }
            self.image_barrier_direct(vt.image(), aspect, level - 1, 1, layers, ImageLayout::TransferSrc, ImageLayout::ShaderReadOnly, false);
            self.image_barrier_direct(vt.image(), aspect, level, 1, layers, ImageLayout::TransferDst, ImageLayout::TransferSrc, false);
            w = dst_w;
            h = dst_h;
        }
        self.image_barrier_direct(vt.image(), aspect, mip_count - 1, 1, layers, ImageLayout::TransferSrc, ImageLayout::ShaderReadOnly, false);
        texture.set_current_layout(ImageLayout::ShaderReadOnly);
    }

    fn execute_buffer_copy_operations(&mut self, ops: &[BufferCopyOp]) {
        for op in ops {
            match *op {
                BufferCopyOp::BufferToBuffer { src, dst, src_offset, dst_offset, size } => {
                    let (Some(RegisteredResource::Buffer { buffer: sb }), Some(RegisteredResource::Buffer { buffer: db })) =
                        (self.registry.get(&src).copied(), self.registry.get(&dst).copied())
                    else {
                        log::warn!("execute_buffer_copy_operations: unregistered buffer id in BufferToBuffer op");
                        continue;
                    };
                    let region = vk::BufferCopy::default().src_offset(src_offset).dst_offset(dst_offset).size(size);
                    unsafe { self.device().cmd_copy_buffer(self.command_buffer, sb, db, &[region]) };
                }
                BufferCopyOp::BufferToTexture { src, dst, dst_mip } => {
                    let Some(RegisteredResource::Buffer { buffer: sb }) = self.registry.get(&src).copied() else {
                        log::warn!("execute_buffer_copy_operations: unregistered buffer id in BufferToTexture op");
                        continue;
                    };
                    let Some(RegisteredResource::Texture { image, aspect_mask, array_layers, size }) = self.registry.get(&dst).copied() else {
                        log::warn!("execute_buffer_copy_operations: unregistered texture id in BufferToTexture op");
                        continue;
                    };
                    let (w, h, d) = mip_extent(size, dst_mip);
                    let region = vk::BufferImageCopy::default()
                        .buffer_offset(0)
                        .buffer_row_length(0)
                        .buffer_image_height(0)
                        .image_subresource(vk::ImageSubresourceLayers { aspect_mask, mip_level: dst_mip, base_array_layer: 0, layer_count: array_layers })
                        .image_extent(vk::Extent3D { width: w, height: h, depth: d });
                    unsafe {
                        self.device().cmd_copy_buffer_to_image(self.command_buffer, sb, image, vk::ImageLayout::TRANSFER_DST_OPTIMAL, &[region]);
                    }
                }
            }
        }
    }

    fn build_bottom_level_acceleration_structure(&mut self, blas: &dyn BottomLevelAccelerationStructure) {
        // Both `VulkanBlas` and `VulkanTlas` are always built synchronously
        // at creation time (acceleration_structure.rs); there is no deferred
        // build-info to re-record here, only the dependency on the prior
        // build completing before any ray tracing shader reads it.
        let _ = blas.as_any().downcast_ref::<VulkanBlas>();
        self.acceleration_structure_barrier();
    }

    fn build_top_level_acceleration_structure(&mut self, tlas: &dyn TopLevelAccelerationStructure) {
        let _ = tlas.as_any().downcast_ref::<VulkanTlas>();
        self.acceleration_structure_barrier();
    }

    fn buffer_write_barrier(&mut self, buffer: &dyn Buffer) {
        self.register_buffer(buffer);
        let Ok(vb) = self.downcast_buffer(buffer) else { return };
        let barrier = vk::BufferMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .dst_access_mask(vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(vb.raw())
            .offset(0)
            .size(vk::WHOLE_SIZE);
        let dep_info = vk::DependencyInfo::default().buffer_memory_barriers(std::slice::from_ref(&barrier));
        unsafe { self.device().cmd_pipeline_barrier2(self.command_buffer, &dep_info) };
    }

    fn texture_write_barrier(&mut self, texture: &dyn Texture) {
        self.register_texture(texture);
        let Ok(vt) = self.downcast_texture(texture) else { return };
        // A binding set bakes its descriptor's expected layout in at write
        // time (binding_set.rs); the common write-then-read handoff is
        // storage/render-target write followed by sampled read, so that is
        // the layout this barrier settles on.
        let (layout, _) = required_layout_for_binding(DescriptorKind::SampledTexture, texture.format().is_depth());
        self.transition_texture(texture, vt, layout);
    }

    fn debug_barrier(&mut self) {
        let barrier = vk::MemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .dst_access_mask(vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE);
        let dep_info = vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&barrier));
        unsafe { self.device().cmd_pipeline_barrier2(self.command_buffer, &dep_info) };
    }

    fn begin_debug_label(&mut self, name: &str) {
        let Ok(cname) = CString::new(name) else { return };
        let label = vk::DebugUtilsLabelEXT::default().label_name(&cname).color([0.0, 0.0, 0.0, 1.0]);
        unsafe { self.backend.debug_utils.cmd_begin_debug_utils_label(self.command_buffer, &label) };
    }

    fn end_debug_label(&mut self) {
        unsafe { self.backend.debug_utils.cmd_end_debug_utils_label(self.command_buffer) };
    }
}
