//! Vulkan acceleration structures (§3, §4 "AccelerationStructure"): BLAS
//! built from triangle/AABB geometry, TLAS built from per-instance records
//! referencing BLAS device addresses. KHR ray tracing only — no NV fallback.

use super::buffer::VulkanBuffer;
use super::VulkanBackend;
use crate::{
    AccelerationStructure, BlasGeometry, BottomLevelAccelerationStructure, Buffer, ResourceId, RhiError, RhiResult,
    TopLevelAccelerationStructure, TriangleGeometry,
};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

pub(crate) fn device_address(device: &ash::Device, buffer: vk::Buffer) -> vk::DeviceAddress {
    let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
    unsafe { device.get_buffer_device_address(&info) }
}

struct ScratchBuffer {
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    device_address: vk::DeviceAddress,
}

pub(crate) fn create_device_local_buffer(
    backend: &VulkanBackend,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    name: &str,
) -> RhiResult<(vk::Buffer, Allocation)> {
    let create_info = vk::BufferCreateInfo::default()
        .size(size.max(1))
        .usage(usage | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS);
    let buffer = unsafe { backend.device.create_buffer(&create_info, None) }
        .map_err(|e| RhiError::FatalCreate(format!("AS buffer create_buffer: {e:?}")))?;
    let requirements = unsafe { backend.device.get_buffer_memory_requirements(buffer) };
    let allocation = backend
        .allocator
        .lock()
        .unwrap()
        .allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
        .map_err(|e| RhiError::FatalCreate(format!("AS buffer allocation: {e}")))?;
    unsafe {
        backend
            .device
            .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
            .map_err(|e| RhiError::FatalCreate(format!("AS buffer bind_buffer_memory: {e:?}")))?;
    }
    Ok((buffer, allocation))
}

fn create_scratch_buffer(backend: &VulkanBackend, size: vk::DeviceSize) -> RhiResult<ScratchBuffer> {
    let (buffer, allocation) = create_device_local_buffer(
        backend,
        size,
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        "acceleration-structure-scratch",
    )?;
    let device_address = device_address(&backend.device, buffer);
    Ok(ScratchBuffer { buffer, allocation: Some(allocation), device_address })
}

fn destroy_scratch_buffer(backend: &VulkanBackend, mut scratch: ScratchBuffer) {
    if let Some(allocation) = scratch.allocation.take() {
        let _ = backend.allocator.lock().unwrap().free(allocation);
    }
    unsafe { backend.device.destroy_buffer(scratch.buffer, None) };
}

fn triangles_geometry(backend: &VulkanBackend, tri: &TriangleGeometry<'_>) -> RhiResult<(vk::AccelerationStructureGeometryKHR<'static>, u32)> {
    let vertex_buffer = tri
        .vertex_buffer
        .as_any()
        .downcast_ref::<VulkanBuffer>()
        .ok_or_else(|| RhiError::logic("build_blas", "vertex buffer is not a Vulkan buffer"))?;
    let vertex_address = device_address(&backend.device, vertex_buffer.raw());

    let index_data = if let Some(index_buffer) = tri.index_buffer {
        let vk_buf = index_buffer
            .as_any()
            .downcast_ref::<VulkanBuffer>()
            .ok_or_else(|| RhiError::logic("build_blas", "index buffer is not a Vulkan buffer"))?;
        vk::DeviceOrHostAddressConstKHR { device_address: device_address(&backend.device, vk_buf.raw()) }
    } else {
        vk::DeviceOrHostAddressConstKHR { device_address: 0 }
    };

    let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
        .vertex_format(vk::Format::R32G32B32_SFLOAT)
        .vertex_data(vk::DeviceOrHostAddressConstKHR { device_address: vertex_address })
        .vertex_stride(tri.vertex_stride)
        .max_vertex(tri.vertex_count.saturating_sub(1))
        .index_type(if tri.index_buffer.is_some() { vk::IndexType::UINT32 } else { vk::IndexType::NONE_KHR })
        .index_data(index_data);

    let geometry = vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
        .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
        .flags(vk::GeometryFlagsKHR::OPAQUE);

    Ok((geometry, tri.triangle_count))
}

pub fn create_blas(backend: &VulkanBackend, geometry: &[BlasGeometry<'_>]) -> RhiResult<VulkanBlas> {
    if geometry.is_empty() {
        return Err(RhiError::logic("build_blas", "at least one geometry is required"));
    }

    let accel_loader = ash::khr::acceleration_structure::Device::new(&backend.instance, &backend.device);

    let mut geometries = Vec::with_capacity(geometry.len());
    let mut primitive_counts = Vec::with_capacity(geometry.len());

    for g in geometry {
        match g {
            BlasGeometry::Triangles(tri) => {
                let (geom, count) = triangles_geometry(backend, tri)?;
                geometries.push(geom);
                primitive_counts.push(count);
            }
            BlasGeometry::Aabbs { buffer, count } => {
                let vk_buf = buffer
                    .as_any()
                    .downcast_ref::<VulkanBuffer>()
                    .ok_or_else(|| RhiError::logic("build_blas", "AABB buffer is not a Vulkan buffer"))?;
                let address = device_address(&backend.device, vk_buf.raw());
                let aabbs = vk::AccelerationStructureGeometryAabbsDataKHR::default()
                    .data(vk::DeviceOrHostAddressConstKHR { device_address: address })
                    .stride(24);
                geometries.push(
                    vk::AccelerationStructureGeometryKHR::default()
                        .geometry_type(vk::GeometryTypeKHR::AABBS)
                        .geometry(vk::AccelerationStructureGeometryDataKHR { aabbs })
                        .flags(vk::GeometryFlagsKHR::OPAQUE),
                );
                primitive_counts.push(*count);
            }
        }
    }

    let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
        .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(&geometries);

    let size_info = unsafe {
        accel_loader.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &build_info,
            &primitive_counts,
        )
    };

    let (buffer, allocation) = create_device_local_buffer(
        backend,
        size_info.acceleration_structure_size,
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR,
        "blas-storage",
    )?;

    let create_info = vk::AccelerationStructureCreateInfoKHR::default()
        .buffer(buffer)
        .size(size_info.acceleration_structure_size)
        .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL);
    let handle = unsafe { accel_loader.create_acceleration_structure(&create_info, None) }
        .map_err(|e| RhiError::FatalCreate(format!("create_acceleration_structure (BLAS): {e:?}")))?;

    let scratch = create_scratch_buffer(backend, size_info.build_scratch_size)?;
    build_info = build_info.dst_acceleration_structure(handle).scratch_data(vk::DeviceOrHostAddressKHR { device_address: scratch.device_address });

    let range_infos: Vec<vk::AccelerationStructureBuildRangeInfoKHR> = primitive_counts
        .iter()
        .map(|&count| vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(count))
        .collect();

    super::scheduler::run_single_time(backend, |cmd| {
        unsafe {
            accel_loader.cmd_build_acceleration_structures(cmd, std::slice::from_ref(&build_info), &[&range_infos]);
        }
    })?;

    destroy_scratch_buffer(backend, scratch);

    let device_address_info = vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(handle);
    let blas_address = unsafe { accel_loader.get_acceleration_structure_device_address(&device_address_info) };

    Ok(VulkanBlas {
        device: backend.device.clone(),
        allocator: backend.allocator.clone(),
        accel_loader: Arc::new(accel_loader),
        handle,
        buffer,
        allocation: Some(allocation),
        device_address: blas_address,
        id: backend.next_id(),
    })
}

pub struct VulkanBlas {
    device: Arc<ash::Device>,
    allocator: Arc<std::sync::Mutex<gpu_allocator::vulkan::Allocator>>,
    accel_loader: Arc<ash::khr::acceleration_structure::Device>,
    handle: vk::AccelerationStructureKHR,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    device_address: vk::DeviceAddress,
    id: ResourceId,
}

impl VulkanBlas {
    pub fn raw(&self) -> vk::AccelerationStructureKHR {
        self.handle
    }
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }
}

impl Drop for VulkanBlas {
    fn drop(&mut self) {
        unsafe {
            self.accel_loader.destroy_acceleration_structure(self.handle, None);
            self.device.destroy_buffer(self.buffer, None);
        }
        if let Some(allocation) = self.allocation.take() {
            let _ = self.allocator.lock().unwrap().free(allocation);
        }
    }
}

impl std::fmt::Debug for VulkanBlas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanBlas").field("id", &self.id).finish()
    }
}

impl AccelerationStructure for VulkanBlas {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
impl BottomLevelAccelerationStructure for VulkanBlas {}

pub fn create_tlas(backend: &VulkanBackend, max_instances: u32, instances: &[crate::TlasInstance<'_>]) -> RhiResult<VulkanTlas> {
    let accel_loader = ash::khr::acceleration_structure::Device::new(&backend.instance, &backend.device);

    let mut instance_data = Vec::with_capacity(instances.len());
    for inst in instances {
        let blas = inst
            .blas
            .as_any()
            .downcast_ref::<VulkanBlas>()
            .ok_or_else(|| RhiError::logic("build_tlas", "instance BLAS is not a Vulkan BLAS"))?;
        let transform = vk::TransformMatrixKHR { matrix: inst.transform.map(|row| row) };
        instance_data.push(vk::AccelerationStructureInstanceKHR {
            transform,
            instance_custom_index_and_mask: vk::Packed24_8::new(0, inst.mask),
            instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                inst.shader_offset,
                vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
            ),
            acceleration_structure_reference: vk::AccelerationStructureReferenceKHR { device_handle: blas.device_address() },
        });
    }

    let instance_buffer_size = (max_instances.max(1) as u64) * std::mem::size_of::<vk::AccelerationStructureInstanceKHR>() as u64;
    let (instance_buffer, mut instance_allocation) = create_device_local_buffer(
        backend,
        instance_buffer_size,
        vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        "tlas-instances",
    )?;
    if let Some(ptr) = instance_allocation.mapped_ptr() {
        let bytes = unsafe {
            std::slice::from_raw_parts(
                instance_data.as_ptr() as *const u8,
                instance_data.len() * std::mem::size_of::<vk::AccelerationStructureInstanceKHR>(),
            )
        };
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr() as *mut u8, bytes.len()) };
    }
    let instance_buffer_address = device_address(&backend.device, instance_buffer);

    let instances_data = vk::AccelerationStructureGeometryInstancesDataKHR::default()
        .data(vk::DeviceOrHostAddressConstKHR { device_address: instance_buffer_address });
    let geometry = vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .geometry(vk::AccelerationStructureGeometryDataKHR { instances: instances_data });

    let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
        .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE | vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(std::slice::from_ref(&geometry));

    let size_info = unsafe {
        accel_loader.get_acceleration_structure_build_sizes(vk::AccelerationStructureBuildTypeKHR::DEVICE, &build_info, &[max_instances])
    };

    let (buffer, allocation) = create_device_local_buffer(
        backend,
        size_info.acceleration_structure_size,
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR,
        "tlas-storage",
    )?;

    let create_info = vk::AccelerationStructureCreateInfoKHR::default()
        .buffer(buffer)
        .size(size_info.acceleration_structure_size)
        .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL);
    let handle = unsafe { accel_loader.create_acceleration_structure(&create_info, None) }
        .map_err(|e| RhiError::FatalCreate(format!("create_acceleration_structure (TLAS): {e:?}")))?;

    let scratch = create_scratch_buffer(backend, size_info.build_scratch_size)?;
    build_info = build_info.dst_acceleration_structure(handle).scratch_data(vk::DeviceOrHostAddressKHR { device_address: scratch.device_address });

    let range_info = vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(instances.len() as u32);

    super::scheduler::run_single_time(backend, |cmd| {
        unsafe {
            accel_loader.cmd_build_acceleration_structures(cmd, std::slice::from_ref(&build_info), &[std::slice::from_ref(&range_info)]);
        }
    })?;

    destroy_scratch_buffer(backend, scratch);

    Ok(VulkanTlas {
        device: backend.device.clone(),
        allocator: backend.allocator.clone(),
        accel_loader: Arc::new(accel_loader),
        handle,
        buffer,
        allocation: Some(allocation),
        instance_buffer,
        instance_allocation: Some(instance_allocation),
        max_instances,
        id: backend.next_id(),
    })
}

pub struct VulkanTlas {
    device: Arc<ash::Device>,
    allocator: Arc<std::sync::Mutex<gpu_allocator::vulkan::Allocator>>,
    accel_loader: Arc<ash::khr::acceleration_structure::Device>,
    handle: vk::AccelerationStructureKHR,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    instance_buffer: vk::Buffer,
    instance_allocation: Option<Allocation>,
    max_instances: u32,
    id: ResourceId,
}

impl VulkanTlas {
    pub fn raw(&self) -> vk::AccelerationStructureKHR {
        self.handle
    }
    pub fn max_instances(&self) -> u32 {
        self.max_instances
    }
}

impl Drop for VulkanTlas {
    fn drop(&mut self) {
        unsafe {
            self.accel_loader.destroy_acceleration_structure(self.handle, None);
            self.device.destroy_buffer(self.buffer, None);
            self.device.destroy_buffer(self.instance_buffer, None);
        }
        let mut allocator = self.allocator.lock().unwrap();
        if let Some(allocation) = self.allocation.take() {
            let _ = allocator.free(allocation);
        }
        if let Some(allocation) = self.instance_allocation.take() {
            let _ = allocator.free(allocation);
        }
    }
}

impl std::fmt::Debug for VulkanTlas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanTlas").field("id", &self.id).field("max_instances", &self.max_instances).finish()
    }
}

impl AccelerationStructure for VulkanTlas {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
impl TopLevelAccelerationStructure for VulkanTlas {
    fn supports_rebuild(&self) -> bool {
        true
    }
}
