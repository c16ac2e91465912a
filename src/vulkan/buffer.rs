//! Vulkan Buffer: allocated through `gpu-allocator` per the memory hint
//! (§4.B), deferred-destroyed by the scheduler's delete queue (§4.B/P2).

use super::VulkanBackend;
use crate::{Buffer, BufferDescriptor, BufferUsage, MemoryHint, ResourceId, RhiError, RhiResult};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

fn buffer_usage_to_vk(usage: BufferUsage, debug: bool) -> vk::BufferUsageFlags {
    // §4.B: indirect and vertex/index buffers are additionally usable as
    // storage buffers so shaders can index them.
    let mut flags = match usage {
        BufferUsage::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER,
        BufferUsage::Index => vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER,
        BufferUsage::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
        BufferUsage::Storage => vk::BufferUsageFlags::STORAGE_BUFFER,
        BufferUsage::Indirect => {
            vk::BufferUsageFlags::INDIRECT_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER
        }
        BufferUsage::UploadStaging => vk::BufferUsageFlags::TRANSFER_SRC,
        BufferUsage::Readback => vk::BufferUsageFlags::TRANSFER_DST,
    };
    if debug {
        flags |= vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
    }
    flags
}

fn memory_location(hint: MemoryHint, rebar_available: bool) -> MemoryLocation {
    match hint {
        MemoryHint::GpuOnly => MemoryLocation::GpuOnly,
        MemoryHint::CpuToGpu => MemoryLocation::CpuToGpu,
        MemoryHint::GpuToCpu => MemoryLocation::GpuToCpu,
        MemoryHint::DeviceLocalHostVisible => {
            if rebar_available {
                MemoryLocation::CpuToGpu
            } else {
                MemoryLocation::GpuOnly
            }
        }
    }
}

pub fn create_buffer(backend: &VulkanBackend, desc: &BufferDescriptor) -> RhiResult<VulkanBuffer> {
    let usage = buffer_usage_to_vk(desc.usage, cfg!(debug_assertions));
    let create_info = vk::BufferCreateInfo::default().size(desc.size).usage(usage);
    let buffer = unsafe { backend.device.create_buffer(&create_info, None) }
        .map_err(|e| RhiError::FatalCreate(format!("create_buffer: {e:?}")))?;

    let requirements = unsafe { backend.device.get_buffer_memory_requirements(buffer) };
    let location = memory_location(desc.memory_hint, backend.rebar_available);

    let allocation = backend
        .allocator
        .lock()
        .unwrap()
        .allocate(&AllocationCreateDesc {
            name: desc.debug_name.as_deref().unwrap_or("buffer"),
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
        .map_err(|e| RhiError::FatalCreate(format!("buffer allocation: {e}")))?;

    unsafe {
        backend
            .device
            .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
            .map_err(|e| RhiError::FatalCreate(format!("bind_buffer_memory: {e:?}")))?;
    }

    let host_visible = allocation.mapped_ptr().is_some();

    Ok(VulkanBuffer {
        device: backend.device.clone(),
        allocator: backend.allocator.clone(),
        buffer,
        allocation: Some(allocation),
        size: desc.size,
        usage: desc.usage,
        id: backend.next_id(),
        host_visible,
    })
}

pub struct VulkanBuffer {
    pub(crate) device: Arc<ash::Device>,
    pub(crate) allocator: Arc<std::sync::Mutex<gpu_allocator::vulkan::Allocator>>,
    pub(crate) buffer: vk::Buffer,
    pub(crate) allocation: Option<Allocation>,
    pub(crate) size: u64,
    pub(crate) usage: BufferUsage,
    pub(crate) id: ResourceId,
    pub(crate) host_visible: bool,
}

impl VulkanBuffer {
    pub fn raw(&self) -> vk::Buffer {
        self.buffer
    }

    /// L2: maps (if not persistently mapped) and copies `bytes` in.
    pub fn write_mapped(&mut self, bytes: &[u8]) -> RhiResult<()> {
        let allocation = self
            .allocation
            .as_ref()
            .ok_or_else(|| RhiError::logic("write_mapped", "buffer has no live allocation"))?;
        let ptr = allocation
            .mapped_ptr()
            .ok_or_else(|| RhiError::Recoverable("buffer is not host-visible".into()))?;
        if bytes.len() as u64 > self.size {
            return Err(RhiError::logic("write_mapped", "write exceeds buffer size"));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr() as *mut u8, bytes.len());
        }
        Ok(())
    }

    /// L2 read-back half of the round trip.
    pub fn read_mapped(&self, offset: u64, len: u64) -> RhiResult<Vec<u8>> {
        let allocation = self
            .allocation
            .as_ref()
            .ok_or_else(|| RhiError::logic("read_mapped", "buffer has no live allocation"))?;
        let ptr = allocation
            .mapped_ptr()
            .ok_or_else(|| RhiError::Recoverable("buffer is not host-visible".into()))?;
        let mut out = vec![0u8; len as usize];
        unsafe {
            std::ptr::copy_nonoverlapping((ptr.as_ptr() as *const u8).add(offset as usize), out.as_mut_ptr(), len as usize);
        }
        Ok(out)
    }
}

impl Drop for VulkanBuffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            let _ = self.allocator.lock().unwrap().free(allocation);
        }
        unsafe {
            self.device.destroy_buffer(self.buffer, None);
        }
    }
}

impl std::fmt::Debug for VulkanBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanBuffer").field("id", &self.id).field("size", &self.size).finish()
    }
}

impl Buffer for VulkanBuffer {
    fn id(&self) -> ResourceId {
        self.id
    }
    fn size(&self) -> u64 {
        self.size
    }
    fn usage(&self) -> BufferUsage {
        self.usage
    }
    fn host_visible(&self) -> bool {
        self.host_visible
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indirect_buffer_is_also_storage() {
        let flags = buffer_usage_to_vk(BufferUsage::Indirect, false);
        assert!(flags.contains(vk::BufferUsageFlags::INDIRECT_BUFFER));
        assert!(flags.contains(vk::BufferUsageFlags::STORAGE_BUFFER));
    }

    #[test]
    fn debug_mode_adds_transfer_bits() {
        let flags = buffer_usage_to_vk(BufferUsage::Uniform, true);
        assert!(flags.contains(vk::BufferUsageFlags::TRANSFER_SRC));
        assert!(flags.contains(vk::BufferUsageFlags::TRANSFER_DST));
    }
}
