//! Frame scheduler (§4.G): the N=2 frame-context ring, the per-frame
//! acquire/record/submit/present algorithm, out-of-band `submitRenderPipeline`
//! submissions, and the single-time command helper used by resource builders
//! that need a one-off upload or build outside the main frame ring.

use crate::{CommandBuffer, Fence, RhiError, RhiResult, Semaphore};
use ash::vk;
use std::any::Any;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::swapchain::VulkanSwapchain;
use super::VulkanBackend;

// ---------------------------------------------------------------------
// Scheduler-facing primitive wrappers (§6 `Queue`/`Fence`/`Semaphore`/
// `CommandBuffer`), used by out-of-band callers such as external features.
// ---------------------------------------------------------------------

pub struct VulkanFence {
    device: Arc<ash::Device>,
    pub(crate) fence: vk::Fence,
}

impl VulkanFence {
    pub fn new(device: Arc<ash::Device>, signaled: bool) -> RhiResult<Self> {
        let flags = if signaled { vk::FenceCreateFlags::SIGNALED } else { vk::FenceCreateFlags::empty() };
        let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default().flags(flags), None) }
            .map_err(|e| RhiError::FatalCreate(format!("fence: {e:?}")))?;
        Ok(Self { device, fence })
    }

    pub fn raw(&self) -> vk::Fence {
        self.fence
    }
}

impl Drop for VulkanFence {
    fn drop(&mut self) {
        unsafe { self.device.destroy_fence(self.fence, None) };
    }
}

impl std::fmt::Debug for VulkanFence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanFence").finish_non_exhaustive()
    }
}

impl Fence for VulkanFence {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct VulkanSemaphore {
    device: Arc<ash::Device>,
    pub(crate) semaphore: vk::Semaphore,
}

impl VulkanSemaphore {
    pub fn new(device: Arc<ash::Device>) -> RhiResult<Self> {
        let semaphore = unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }
            .map_err(|e| RhiError::FatalCreate(format!("semaphore: {e:?}")))?;
        Ok(Self { device, semaphore })
    }

    pub fn raw(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for VulkanSemaphore {
    fn drop(&mut self) {
        unsafe { self.device.destroy_semaphore(self.semaphore, None) };
    }
}

impl std::fmt::Debug for VulkanSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanSemaphore").finish_non_exhaustive()
    }
}

impl Semaphore for VulkanSemaphore {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A non-owning handle: the buffer itself lives for as long as the command
/// pool it was allocated from (the scheduler's frame ring, or a caller's own
/// pool for out-of-band work).
pub struct VulkanCommandBuffer {
    pub(crate) buffer: vk::CommandBuffer,
}

impl VulkanCommandBuffer {
    pub fn new(buffer: vk::CommandBuffer) -> Self {
        Self { buffer }
    }

    pub fn raw(&self) -> vk::CommandBuffer {
        self.buffer
    }
}

impl std::fmt::Debug for VulkanCommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanCommandBuffer").finish_non_exhaustive()
    }
}

impl CommandBuffer for VulkanCommandBuffer {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------
// Single-time command helper
// ---------------------------------------------------------------------

/// Allocates a transient command buffer, records under `record`, submits and
/// blocks until idle, then frees the buffer. Used by resource builders
/// (acceleration structures, buffer uploads) that need one-off GPU work
/// outside the main frame ring. Per §4.G, calling this while a frame's
/// primary command buffer is being recorded stalls the pipeline; that case
/// is logged rather than rejected, since the helper has no way to refuse.
pub(crate) fn run_single_time(backend: &VulkanBackend, record: impl FnOnce(vk::CommandBuffer)) -> RhiResult<()> {
    if backend.recording_frame.load(Ordering::Acquire) {
        log::warn!("run_single_time invoked while a frame is being recorded; this forces a pipeline stall");
    }

    let alloc_info = vk::CommandBufferAllocateInfo::default()
        .command_pool(backend.transient_command_pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    let command_buffer = unsafe { backend.device.allocate_command_buffers(&alloc_info) }
        .map_err(|e| RhiError::FatalCreate(format!("allocate single-time command buffer: {e:?}")))?[0];

    unsafe {
        backend
            .device
            .begin_command_buffer(command_buffer, &vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT))
            .map_err(|e| RhiError::FatalCreate(format!("begin single-time command buffer: {e:?}")))?;
    }

    record(command_buffer);

    unsafe {
        backend
            .device
            .end_command_buffer(command_buffer)
            .map_err(|e| RhiError::FatalCreate(format!("end single-time command buffer: {e:?}")))?;
    }

    let command_buffers = [command_buffer];
    let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
    unsafe {
        backend
            .device
            .queue_submit(backend.graphics_queue, &[submit_info], vk::Fence::null())
            .map_err(|e| RhiError::FatalCreate(format!("single-time queue submit: {e:?}")))?;
        backend
            .device
            .queue_wait_idle(backend.graphics_queue)
            .map_err(|e| RhiError::FatalCreate(format!("single-time queue_wait_idle: {e:?}")))?;
        backend.device.free_command_buffers(backend.transient_command_pool, &command_buffers);
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Out-of-band submission (`submitRenderPipeline`)
// ---------------------------------------------------------------------

/// Owns the fence behind an out-of-band submission. `poll`/`wait` destroy the
/// fence (and free the command buffer) on completion; dropping this without
/// ever observing completion leaks both, matching the spec's stated contract.
pub struct VulkanSubmitStatus {
    device: Arc<ash::Device>,
    command_pool: vk::CommandPool,
    command_buffer: Option<vk::CommandBuffer>,
    fence: Option<vk::Fence>,
}

impl VulkanSubmitStatus {
    fn finish(&mut self) {
        if let Some(cb) = self.command_buffer.take() {
            unsafe { self.device.free_command_buffers(self.command_pool, &[cb]) };
        }
        if let Some(fence) = self.fence.take() {
            unsafe { self.device.destroy_fence(fence, None) };
        }
    }
}

impl std::fmt::Debug for VulkanSubmitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanSubmitStatus").field("pending", &self.fence.is_some()).finish()
    }
}

impl crate::SubmitStatus for VulkanSubmitStatus {
    fn poll(&mut self) -> bool {
        let Some(fence) = self.fence else { return true };
        let done = unsafe { self.device.get_fence_status(fence) }.unwrap_or(false);
        if done {
            self.finish();
        }
        done
    }

    fn wait(&mut self, timeout_nanos: u64) -> bool {
        let Some(fence) = self.fence else { return true };
        let done = unsafe { self.device.wait_for_fences(&[fence], true, timeout_nanos) }.is_ok();
        if done {
            self.finish();
        }
        done
    }
}

// ---------------------------------------------------------------------
// Frame ring
// ---------------------------------------------------------------------

struct FrameSlot {
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
    query_pool: vk::QueryPool,
    has_timestamps: bool,
    deferred: Vec<Box<dyn Any>>,
}

/// A frame's command buffer and the acquired swapchain image it will render
/// into, handed to the caller's command-list wrapper for recording (§4.G
/// step 5). `gpu_time_ns` is the previous use of this slot's elapsed GPU
/// time, read before this frame's work overwrites the query pool.
pub struct AcquiredFrame {
    pub command_buffer: vk::CommandBuffer,
    pub image_index: u32,
    pub image_view: vk::ImageView,
    pub extent: vk::Extent2D,
    pub gpu_time_ns: Option<u64>,
}

pub struct FrameScheduler {
    device: Arc<ash::Device>,
    queue: vk::Queue,
    swapchain: VulkanSwapchain,
    slots: Vec<FrameSlot>,
    frame_index: usize,
    frame_counter: u64,
    telemetry_interval: u32,
    timestamp_period_ns: f32,
}

impl FrameScheduler {
    pub fn new(backend: &VulkanBackend, swapchain: VulkanSwapchain) -> RhiResult<Self> {
        let frames_in_flight = backend.config.frames_in_flight.max(1) as usize;
        let device = backend.device.clone();

        let props = unsafe { backend.instance.get_physical_device_properties(backend.physical_device) };
        let timestamp_period_ns = props.limits.timestamp_period;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(backend.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(frames_in_flight as u32);
        let command_buffers = unsafe { device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| RhiError::FatalCreate(format!("allocate frame command buffers: {e:?}")))?;

        let mut slots = Vec::with_capacity(frames_in_flight);
        for command_buffer in command_buffers {
            let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED), None) }
                .map_err(|e| RhiError::FatalCreate(format!("frame fence: {e:?}")))?;
            let image_available = unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }
                .map_err(|e| RhiError::FatalCreate(format!("image-available semaphore: {e:?}")))?;
            let render_finished = unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }
                .map_err(|e| RhiError::FatalCreate(format!("render-finished semaphore: {e:?}")))?;
            let query_pool = unsafe {
                device.create_query_pool(&vk::QueryPoolCreateInfo::default().query_type(vk::QueryType::TIMESTAMP).query_count(2), None)
            }
            .map_err(|e| RhiError::FatalCreate(format!("timestamp query pool: {e:?}")))?;

            slots.push(FrameSlot {
                command_buffer,
                fence,
                image_available,
                render_finished,
                query_pool,
                has_timestamps: false,
                deferred: Vec::new(),
            });
        }

        Ok(Self {
            device,
            queue: backend.graphics_queue,
            swapchain,
            slots,
            frame_index: 0,
            frame_counter: 0,
            telemetry_interval: backend.config.telemetry_interval_frames.max(1),
            timestamp_period_ns,
        })
    }

    /// Queues a resource for destruction once this slot comes back around
    /// (one full ring cycle from now), per §5's fence-gated reuse guarantee.
    pub fn queue_deferred_delete(&mut self, resource: Box<dyn Any>) {
        self.slots[self.frame_index].deferred.push(resource);
    }

    pub fn swapchain(&self) -> &VulkanSwapchain {
        &self.swapchain
    }

    fn read_timestamps(&self, slot_idx: usize) -> Option<u64> {
        let slot = &self.slots[slot_idx];
        let mut data = [0u64; 2];
        unsafe { self.device.get_query_pool_results(slot.query_pool, 0, &mut data, vk::QueryResultFlags::TYPE_64) }.ok()?;
        let delta = data[1].wrapping_sub(data[0]);
        Some((delta as f64 * self.timestamp_period_ns as f64) as u64)
    }

    /// §4.G steps 1-5 (through the start of recording): wait the slot ready,
    /// drain its deferred deletes, acquire the next image, read last-frame
    /// timestamps, and open the primary command buffer with the acquire-time
    /// layout transition and the opening timestamp write already recorded.
    /// Returns `Ok(None)` when the caller must rebuild swapchain-dependent
    /// resources (recreate happened, or the window is currently zero-area)
    /// and should retry next tick.
    pub fn begin_frame(&mut self, backend: &VulkanBackend) -> RhiResult<Option<AcquiredFrame>> {
        if self.swapchain.is_zero_area() {
            return Ok(None);
        }

        let slot_idx = self.frame_index;
        let fence = self.slots[slot_idx].fence;
        match unsafe { self.device.wait_for_fences(&[fence], true, u64::MAX) } {
            Ok(()) => {}
            Err(vk::Result::ERROR_DEVICE_LOST) => return Err(RhiError::DeviceLost { dump_status: None }),
            Err(e) => return Err(RhiError::FatalCreate(format!("wait_for_fences: {e:?}"))),
        }

        self.slots[slot_idx].deferred.clear();
        let gpu_time_ns = if self.slots[slot_idx].has_timestamps { self.read_timestamps(slot_idx) } else { None };

        let image_available = self.slots[slot_idx].image_available;
        let image_index = match self.swapchain.acquire_next_image(image_available)? {
            Some(index) => index,
            None => {
                backend.wait_idle();
                self.swapchain.recreate(backend)?;
                return Ok(None);
            }
        };

        let command_buffer = self.slots[slot_idx].command_buffer;
        let query_pool = self.slots[slot_idx].query_pool;
        unsafe {
            self.device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
                .map_err(|e| RhiError::FatalCreate(format!("reset_command_buffer: {e:?}")))?;
            self.device
                .begin_command_buffer(command_buffer, &vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT))
                .map_err(|e| RhiError::FatalCreate(format!("begin_command_buffer: {e:?}")))?;
            self.device.cmd_reset_query_pool(command_buffer, query_pool, 0, 2);
            self.device.cmd_write_timestamp(command_buffer, vk::PipelineStageFlags::TOP_OF_PIPE, query_pool, 0);

            let acquire_barrier = vk::ImageMemoryBarrier::default()
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(self.swapchain.image(image_index))
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE);
            self.device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[acquire_barrier],
            );
        }
        backend.recording_frame.store(true, Ordering::Release);

        Ok(Some(AcquiredFrame {
            command_buffer,
            image_index,
            image_view: self.swapchain.image_view(image_index),
            extent: self.swapchain.extent(),
            gpu_time_ns,
        }))
    }

    /// §4.G steps 6-8: close the command buffer, submit, present, advance.
    /// Returns `false` when the swapchain was recreated and the caller
    /// should rebuild its swapchain-dependent resources before the next
    /// frame.
    pub fn end_frame(&mut self, backend: &VulkanBackend, frame: AcquiredFrame) -> RhiResult<bool> {
        let slot_idx = self.frame_index;
        let query_pool = self.slots[slot_idx].query_pool;
        unsafe {
            let present_barrier = vk::ImageMemoryBarrier::default()
                .old_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(self.swapchain.image(frame.image_index))
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
                .dst_access_mask(vk::AccessFlags::empty());
            self.device.cmd_pipeline_barrier(
                frame.command_buffer,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[present_barrier],
            );
            self.device.cmd_write_timestamp(frame.command_buffer, vk::PipelineStageFlags::BOTTOM_OF_PIPE, query_pool, 1);
            self.device
                .end_command_buffer(frame.command_buffer)
                .map_err(|e| RhiError::FatalCreate(format!("end_command_buffer: {e:?}")))?;
        }
        backend.recording_frame.store(false, Ordering::Release);
        self.slots[slot_idx].has_timestamps = true;

        let fence = self.slots[slot_idx].fence;
        unsafe { self.device.reset_fences(&[fence]) }.map_err(|e| RhiError::FatalCreate(format!("reset_fences: {e:?}")))?;

        let wait_semaphores = [self.slots[slot_idx].image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [self.slots[slot_idx].render_finished];
        let command_buffers = [frame.command_buffer];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);
        match unsafe { self.device.queue_submit(self.queue, &[submit_info], fence) } {
            Ok(()) => {}
            Err(vk::Result::ERROR_DEVICE_LOST) => return Err(RhiError::DeviceLost { dump_status: None }),
            Err(e) => return Err(RhiError::FatalCreate(format!("queue_submit: {e:?}"))),
        }

        let present_ok = self.swapchain.present(self.queue, self.slots[slot_idx].render_finished, frame.image_index)?;

        self.frame_counter += 1;
        if self.frame_counter % self.telemetry_interval as u64 == 0 {
            use crate::Backend;
            if let Some(stats) = backend.vram_stats() {
                log::info!("vram telemetry: {} heaps, {} bytes used", stats.heaps.len(), stats.total_used);
            }
        }

        self.frame_index = (self.frame_index + 1) % self.slots.len();

        if !present_ok {
            backend.wait_idle();
            self.swapchain.recreate(backend)?;
        }
        Ok(present_ok)
    }

    /// Out-of-band submission (§4.G `submitRenderPipeline`): records under
    /// `record` and submits to the graphics queue without touching the
    /// swapchain, returning a token the caller polls or waits on.
    pub fn submit_render_pipeline(&self, backend: &VulkanBackend, record: impl FnOnce(vk::CommandBuffer)) -> RhiResult<VulkanSubmitStatus> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(backend.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| RhiError::FatalCreate(format!("allocate out-of-band command buffer: {e:?}")))?[0];

        unsafe {
            self.device
                .begin_command_buffer(command_buffer, &vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT))
                .map_err(|e| RhiError::FatalCreate(format!("begin out-of-band command buffer: {e:?}")))?;
        }
        record(command_buffer);
        unsafe {
            self.device
                .end_command_buffer(command_buffer)
                .map_err(|e| RhiError::FatalCreate(format!("end out-of-band command buffer: {e:?}")))?;
        }

        let fence = unsafe { self.device.create_fence(&vk::FenceCreateInfo::default(), None) }
            .map_err(|e| RhiError::FatalCreate(format!("out-of-band fence: {e:?}")))?;
        let command_buffers = [command_buffer];
        let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
        unsafe { self.device.queue_submit(self.queue, &[submit_info], fence) }
            .map_err(|e| RhiError::FatalCreate(format!("out-of-band queue submit: {e:?}")))?;

        Ok(VulkanSubmitStatus {
            device: self.device.clone(),
            command_pool: backend.command_pool,
            command_buffer: Some(command_buffer),
            fence: Some(fence),
        })
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        unsafe {
            let fences: Vec<vk::Fence> = self.slots.iter().map(|s| s.fence).collect();
            let _ = self.device.wait_for_fences(&fences, true, u64::MAX);
            for slot in &self.slots {
                self.device.destroy_fence(slot.fence, None);
                self.device.destroy_semaphore(slot.image_available, None);
                self.device.destroy_semaphore(slot.render_finished, None);
                self.device.destroy_query_pool(slot.query_pool, None);
            }
        }
    }
}

impl std::fmt::Debug for FrameScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameScheduler").field("slots", &self.slots.len()).field("frame_counter", &self.frame_counter).finish()
    }
}
