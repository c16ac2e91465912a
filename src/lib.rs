//! `rhi-core`: a Vulkan-backed rendering hardware interface.
//!
//! Owns GPU object lifetimes, derives image-layout/memory barriers
//! automatically from bound resources, paces a small ring of in-flight
//! frames, and exposes buffers / textures / samplers / binding sets /
//! pipeline states / acceleration structures to render-graph code built on
//! top of this crate.

pub mod capability;
pub mod config;
pub mod error;
pub mod halton;
pub mod integration;
pub mod reflection;

#[cfg(feature = "vulkan")]
pub mod vulkan;

pub use config::{BackendConfig, OptionalCapability};
pub use error::{RhiError, RhiResult};

use bitflags::bitflags;
use std::any::Any;
use std::fmt::Debug;

/// Opaque handle identifying a resource for logging/debugging purposes.
/// Not used for lookup — resources are owned directly by their creator.
pub type ResourceId = u64;

// ---------------------------------------------------------------------
// Buffers
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    Vertex,
    Index,
    Uniform,
    Storage,
    Indirect,
    UploadStaging,
    Readback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryHint {
    /// Device-local, not host visible.
    GpuOnly,
    /// Host-visible, mapped, written by CPU and read by GPU.
    CpuToGpu,
    /// Host-visible, mapped, written by GPU (readback) and read by CPU.
    GpuToCpu,
    /// Device-local *and* host-visible (ReBAR), when available; falls back
    /// to `CpuToGpu` staging semantics otherwise.
    DeviceLocalHostVisible,
}

#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    pub size: u64,
    pub usage: BufferUsage,
    pub memory_hint: MemoryHint,
    pub debug_name: Option<String>,
}

pub trait Buffer: Debug {
    fn id(&self) -> ResourceId;
    fn size(&self) -> u64;
    fn usage(&self) -> BufferUsage;
    fn host_visible(&self) -> bool;
    fn as_any(&self) -> &dyn Any;
}

// ---------------------------------------------------------------------
// Textures
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureDimension {
    D2,
    D2Array,
    D3,
    Cube,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    Bc7Unorm,
    R32Float,
    R16Float,
    Rgba16Float,
    Rgba32Float,
    D32Float,
    D24UnormS8Uint,
    A2b10g10r10Unorm,
}

impl TextureFormat {
    pub fn is_depth(self) -> bool {
        matches!(self, TextureFormat::D32Float | TextureFormat::D24UnormS8Uint)
    }

    pub fn has_stencil(self) -> bool {
        matches!(self, TextureFormat::D24UnormS8Uint)
    }

    pub fn is_compressed(self) -> bool {
        matches!(self, TextureFormat::Bc7Unorm)
    }

    pub fn is_srgb(self) -> bool {
        matches!(self, TextureFormat::Rgba8UnormSrgb | TextureFormat::Bgra8UnormSrgb)
    }

    /// I2: compressed or sRGB formats are never storage-capable.
    pub fn storage_capable(self) -> bool {
        !self.is_compressed() && !self.is_srgb()
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const COPY_SRC         = 1 << 0;
        const COPY_DST         = 1 << 1;
        const TEXTURE_BINDING  = 1 << 2;
        const STORAGE_BINDING  = 1 << 3;
        const RENDER_ATTACHMENT = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterMode {
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressMode {
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    ClampToBorder,
}

#[derive(Debug, Clone)]
pub struct TextureDescriptor {
    pub dimension: TextureDimension,
    /// (width, height, depth-or-array-layers)
    pub size: (u32, u32, u32),
    pub format: TextureFormat,
    pub mip_level_count: u32,
    pub sample_count: u32,
    pub usage: TextureUsage,
    pub min_filter: FilterMode,
    pub mag_filter: FilterMode,
    pub address_mode: AddressMode,
    pub debug_name: Option<String>,
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self {
            dimension: TextureDimension::D2,
            size: (1, 1, 1),
            format: TextureFormat::Rgba8Unorm,
            mip_level_count: 1,
            sample_count: 1,
            usage: TextureUsage::TEXTURE_BINDING,
            min_filter: FilterMode::Linear,
            mag_filter: FilterMode::Linear,
            address_mode: AddressMode::ClampToEdge,
            debug_name: None,
        }
    }
}

/// §4.F: the layout the command list tracks as "currently applied" to every
/// mip/layer of a texture (invariant I1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    Undefined,
    General,
    ColorAttachment,
    DepthStencilAttachment,
    ShaderReadOnly,
    TransferSrc,
    TransferDst,
    Present,
}

pub trait Texture: Debug {
    fn id(&self) -> ResourceId;
    fn format(&self) -> TextureFormat;
    fn size(&self) -> (u32, u32, u32);
    fn dimension(&self) -> TextureDimension;
    fn mip_level_count(&self) -> u32;
    /// Current API layout, per I1. Mutated only by the command list that
    /// references this texture (§5 single-threaded discipline).
    fn current_layout(&self) -> ImageLayout;
    fn set_current_layout(&self, layout: ImageLayout);
    /// True for the distinguished swapchain placeholder texture (§3).
    fn is_swapchain_placeholder(&self) -> bool {
        false
    }
    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug, Clone)]
pub struct SamplerDescriptor {
    pub min_filter: FilterMode,
    pub mag_filter: FilterMode,
    pub mip_filter: FilterMode,
    pub address_mode_u: AddressMode,
    pub address_mode_v: AddressMode,
    pub address_mode_w: AddressMode,
    pub anisotropy_clamp: Option<f32>,
}

pub trait Sampler: Debug {
    fn as_any(&self) -> &dyn Any;
}

// ---------------------------------------------------------------------
// Render targets
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadOp {
    Load,
    Clear,
    Discard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Store,
    Discard,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

/// A color attachment slot. `texture: None` marks the swapchain placeholder
/// (§3): the render target becomes imageless and the scheduler binds the
/// live image view at begin-pass time.
#[derive(Debug, Clone, Copy)]
pub struct ColorAttachmentDescriptor<'a> {
    pub texture: Option<&'a dyn Texture>,
    pub resolve_texture: Option<&'a dyn Texture>,
    pub format: TextureFormat,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
}

#[derive(Debug, Clone, Copy)]
pub struct DepthStencilAttachmentDescriptor<'a> {
    pub texture: Option<&'a dyn Texture>,
    pub format: TextureFormat,
    pub depth_load_op: LoadOp,
    pub depth_store_op: StoreOp,
}

#[derive(Debug, Clone, Default)]
pub struct RenderTargetDescriptor<'a> {
    pub color_attachments: Vec<ColorAttachmentDescriptor<'a>>,
    pub depth_stencil_attachment: Option<DepthStencilAttachmentDescriptor<'a>>,
}

pub trait RenderTarget: Debug {
    fn color_attachment_count(&self) -> usize;
    fn has_depth_stencil(&self) -> bool;
    /// §3: a render target holding the swapchain placeholder builds an
    /// imageless framebuffer; the scheduler supplies the live image view at
    /// begin-pass time.
    fn is_imageless(&self) -> bool;
    fn as_any(&self) -> &dyn Any;
}

// ---------------------------------------------------------------------
// Binding sets
// ---------------------------------------------------------------------

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u32 {
        const VERTEX       = 1 << 0;
        const FRAGMENT     = 1 << 1;
        const COMPUTE      = 1 << 2;
        const RAYGEN       = 1 << 3;
        const CLOSEST_HIT  = 1 << 4;
        const ANY_HIT      = 1 << 5;
        const MISS         = 1 << 6;
        const INTERSECTION = 1 << 7;
        const MESH         = 1 << 8;
        const TASK         = 1 << 9;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    UniformBuffer,
    StorageBuffer,
    SampledTexture,
    StorageTexture,
    AccelerationStructure,
}

/// The concrete resource(s) backing one binding entry. Arrays shorter than
/// the entry's declared `array_count` are padded by repeating the first
/// element (§4.E) — never left undefined.
#[derive(Debug, Clone, Copy)]
pub enum BindingResource<'a> {
    Buffers(&'a [&'a dyn Buffer]),
    /// Sampled-texture bindings pair each texture with the sampler used to
    /// read it (Vulkan combined-image-sampler descriptors).
    Textures(&'a [(&'a dyn Texture, &'a dyn Sampler)]),
    /// Storage-texture (mip-view) bindings; `mip_view_base` on the entry
    /// selects which mip each view targets.
    StorageTextures(&'a [&'a dyn Texture]),
    AccelerationStructures(&'a [&'a dyn TopLevelAccelerationStructure]),
}

/// The shape of one `BindingSet` entry, retained after construction for
/// introspection (pipeline-layout assembly, reflection cross-checks). Does
/// not borrow the backing resources — those are only needed transiently at
/// construction to write the descriptor set.
#[derive(Debug, Clone, Copy)]
pub struct BindingShape {
    pub binding_index: u32,
    pub kind: DescriptorKind,
    pub stages: ShaderStages,
    /// Declared array length; 1 for a non-array binding.
    pub array_count: u32,
    /// For a storage-texture mip-view binding: the base mip level.
    pub mip_view_base: Option<u32>,
}

/// One entry of a `BindingSet` passed at construction time (§3): the shape
/// plus the concrete resources backing it.
#[derive(Debug, Clone, Copy)]
pub struct ShaderBindingEntry<'a> {
    pub shape: BindingShape,
    pub resource: BindingResource<'a>,
}

pub trait BindingSet: Debug {
    fn entries(&self) -> &[BindingShape];
    /// §4.E: rewrite a subset of a sampled-texture-array binding in place.
    /// Asserts `binding_index` names a `SampledTexture` array entry.
    fn update_textures(&self, binding_index: u32, updates: &[(u32, &dyn Texture, &dyn Sampler)]) -> RhiResult<()>;
    fn as_any(&self) -> &dyn Any;
}

// ---------------------------------------------------------------------
// Pipeline fixed-function state
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexInputRate {
    Vertex,
    Instance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
    Uint32,
}

#[derive(Debug, Clone)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: VertexFormat,
    pub offset: u32,
}

#[derive(Debug, Clone)]
pub struct VertexBinding {
    pub binding: u32,
    pub stride: u32,
    pub input_rate: VertexInputRate,
}

#[derive(Debug, Clone, Default)]
pub struct VertexInputDescriptor {
    pub bindings: Vec<VertexBinding>,
    pub attributes: Vec<VertexAttribute>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    TriangleList,
    TriangleStrip,
    LineList,
    PointList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolygonMode {
    Fill,
    Line,
    Point,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CullMode {
    None,
    Front,
    Back,
    FrontAndBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrontFace {
    CounterClockwise,
    Clockwise,
}

#[derive(Debug, Clone, Copy)]
pub struct RasterizationState {
    pub polygon_mode: PolygonMode,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub depth_bias: Option<(f32, f32, f32)>,
}

impl Default for RasterizationState {
    fn default() -> Self {
        Self {
            polygon_mode: PolygonMode::Fill,
            cull_mode: CullMode::Back,
            front_face: FrontFace::CounterClockwise,
            depth_bias: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

#[derive(Debug, Clone, Copy)]
pub struct DepthStencilState {
    pub depth_test_enabled: bool,
    pub depth_write_enabled: bool,
    pub depth_compare: CompareOp,
    pub stencil_test_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendOp {
    Add,
    Subtract,
}

#[derive(Debug, Clone, Copy)]
pub struct BlendComponent {
    pub src_factor: BlendFactor,
    pub dst_factor: BlendFactor,
    pub operation: BlendOp,
}

#[derive(Debug, Clone, Copy)]
pub struct BlendState {
    pub color: BlendComponent,
    pub alpha: BlendComponent,
}

#[derive(Debug, Clone)]
pub struct ShaderStage {
    pub source: Vec<u8>,
    pub entry_point: String,
    pub stage: ShaderStages,
}

#[derive(Debug, Clone)]
pub struct RenderStateDescriptor {
    pub vertex_shader: ShaderStage,
    pub fragment_shader: Option<ShaderStage>,
    pub vertex_input: VertexInputDescriptor,
    pub primitive_topology: PrimitiveTopology,
    pub rasterization: RasterizationState,
    pub depth_stencil: Option<DepthStencilState>,
    pub color_blend: Vec<Option<BlendState>>,
    pub sample_count: u32,
    /// `(name, offset, size)` members of the single push-constant wrapper
    /// struct the reflected shaders share (§4.C); resolves `setNamedUniform`
    /// by name at record time.
    pub named_uniforms: Vec<(String, u32, u32)>,
}

#[derive(Debug, Clone)]
pub struct ComputeStateDescriptor {
    pub shader: ShaderStage,
    pub named_uniforms: Vec<(String, u32, u32)>,
}

#[derive(Debug, Clone)]
pub struct HitGroupDescriptor {
    pub closest_hit: ShaderStage,
    pub any_hit: Option<ShaderStage>,
    pub intersection: Option<ShaderStage>,
}

#[derive(Debug, Clone)]
pub struct RayTracingStateDescriptor {
    pub raygen: ShaderStage,
    pub hit_groups: Vec<HitGroupDescriptor>,
    pub miss_shaders: Vec<ShaderStage>,
    pub max_recursion_depth: u32,
    pub named_uniforms: Vec<(String, u32, u32)>,
}

pub trait RenderState: Debug {
    fn as_any(&self) -> &dyn Any;
}

pub trait ComputeState: Debug {
    fn as_any(&self) -> &dyn Any;
}

pub trait RayTracingState: Debug {
    /// §4.D/P8: the raw SBT offsets this state laid its groups out at,
    /// each a multiple of the device's shader-group base alignment.
    fn sbt_group_offsets(&self) -> &[u64];
    fn as_any(&self) -> &dyn Any;
}

// ---------------------------------------------------------------------
// Acceleration structures
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct TriangleGeometry<'a> {
    pub vertex_buffer: &'a dyn Buffer,
    pub vertex_stride: u64,
    pub vertex_count: u32,
    pub index_buffer: Option<&'a dyn Buffer>,
    pub triangle_count: u32,
}

#[derive(Debug, Clone, Copy)]
pub enum BlasGeometry<'a> {
    Triangles(TriangleGeometry<'a>),
    Aabbs { buffer: &'a dyn Buffer, count: u32 },
}

#[derive(Debug, Clone, Copy)]
pub struct TlasInstance<'a> {
    pub blas: &'a dyn BottomLevelAccelerationStructure,
    pub transform: [[f32; 4]; 3],
    pub shader_offset: u32,
    pub mask: u8,
}

pub trait AccelerationStructure: Debug {
    fn as_any(&self) -> &dyn Any;
}

pub trait BottomLevelAccelerationStructure: AccelerationStructure {}
pub trait TopLevelAccelerationStructure: AccelerationStructure {
    /// Rebuild flag for in-place TLAS update (§3).
    fn supports_rebuild(&self) -> bool;
}

// ---------------------------------------------------------------------
// Command list
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

/// The stateful recorder described in §4.F. Concrete implementations wrap a
/// primary or transient command buffer plus the active-pipeline/bound-buffer
/// tracking state.
pub trait CommandList {
    fn begin_rendering(
        &mut self,
        target: &dyn RenderTarget,
        state: &dyn RenderState,
        clear_colors: &[ClearColor],
        auto_viewport: bool,
    ) -> RhiResult<()>;
    fn end_rendering(&mut self);

    fn set_compute_state(&mut self, state: &dyn ComputeState) -> RhiResult<()>;
    fn set_ray_tracing_state(&mut self, state: &dyn RayTracingState) -> RhiResult<()>;

    fn bind_set(&mut self, set: &dyn BindingSet, slot: u32) -> RhiResult<()>;
    fn set_named_uniform(&mut self, name: &str, bytes: &[u8]) -> RhiResult<()>;

    fn bind_vertex_buffer(&mut self, binding: u32, buffer: &dyn Buffer, offset: u64);
    fn bind_index_buffer(&mut self, buffer: &dyn Buffer, offset: u64, format: IndexFormat);

    fn draw(&mut self, vertex_count: u32, instance_count: u32) -> RhiResult<()>;
    fn draw_indexed(&mut self, index_count: u32, instance_count: u32) -> RhiResult<()>;
    fn draw_indirect(&mut self, indirect: &dyn Buffer, count: &dyn Buffer) -> RhiResult<()>;
    fn draw_mesh_tasks(&mut self, x: u32, y: u32, z: u32) -> RhiResult<()>;

    fn dispatch(&mut self, x: u32, y: u32, z: u32) -> RhiResult<()>;
    fn trace_rays(&mut self, width: u32, height: u32, depth: u32) -> RhiResult<()>;

    fn set_viewport(&mut self, x: f32, y: f32, width: f32, height: f32);
    fn set_depth_bias(&mut self, constant: f32, clamp: f32, slope: f32);

    fn clear_texture(&mut self, texture: &dyn Texture, color: ClearColor);
    fn copy_texture(&mut self, src: &dyn Texture, dst: &dyn Texture, src_mip: u32, dst_mip: u32);
    fn generate_mipmaps(&mut self, texture: &dyn Texture);
    fn execute_buffer_copy_operations(&mut self, ops: &[BufferCopyOp]);

    fn build_bottom_level_acceleration_structure(&mut self, blas: &dyn BottomLevelAccelerationStructure);
    fn build_top_level_acceleration_structure(&mut self, tlas: &dyn TopLevelAccelerationStructure);

    fn buffer_write_barrier(&mut self, buffer: &dyn Buffer);
    fn texture_write_barrier(&mut self, texture: &dyn Texture);
    fn debug_barrier(&mut self);

    fn begin_debug_label(&mut self, name: &str);
    fn end_debug_label(&mut self);
}

#[derive(Debug, Clone)]
pub enum BufferCopyOp {
    BufferToBuffer { src: ResourceId, dst: ResourceId, src_offset: u64, dst_offset: u64, size: u64 },
    BufferToTexture { src: ResourceId, dst: ResourceId, dst_mip: u32 },
}

// ---------------------------------------------------------------------
// Scheduler-facing primitives
// ---------------------------------------------------------------------

pub trait Fence: Debug {
    fn as_any(&self) -> &dyn Any;
}

pub trait Semaphore: Debug {
    fn as_any(&self) -> &dyn Any;
}

pub trait CommandBuffer: Debug {
    fn as_any(&self) -> &dyn Any;
}

pub trait Queue: Debug {
    fn submit(
        &self,
        command_buffers: &[&dyn CommandBuffer],
        wait_semaphores: &[&dyn Semaphore],
        signal_semaphores: &[&dyn Semaphore],
        signal_fence: Option<&dyn Fence>,
    ) -> RhiResult<()>;
}

/// An opaque handle to an out-of-band submission (§4.G,
/// `submitRenderPipeline`). Owns the underlying fence; `poll`/`wait` destroy
/// it on completion. Dropping a `SubmitStatus` without ever polling it to
/// completion leaks the fence, matching the spec's stated contract.
pub trait SubmitStatus: Debug {
    fn poll(&mut self) -> bool;
    fn wait(&mut self, timeout_nanos: u64) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryHeapStats {
    pub used: u64,
    pub available: u64,
    pub device_local: bool,
    pub host_visible: bool,
    pub host_coherent: bool,
}

#[derive(Debug, Clone, Default)]
pub struct VramStats {
    pub heaps: Vec<MemoryHeapStats>,
    pub total_used: u64,
}

/// Public factory API (§6), implemented by the concrete backend.
pub trait Backend {
    fn create_buffer(&self, desc: &BufferDescriptor) -> RhiResult<Box<dyn Buffer>>;
    fn create_texture(&self, desc: &TextureDescriptor) -> RhiResult<Box<dyn Texture>>;
    fn create_sampler(&self, desc: &SamplerDescriptor) -> RhiResult<Box<dyn Sampler>>;
    fn create_render_target(&self, desc: &RenderTargetDescriptor) -> RhiResult<Box<dyn RenderTarget>>;
    fn create_binding_set(&self, entries: &[ShaderBindingEntry]) -> RhiResult<Box<dyn BindingSet>>;
    fn create_render_state(
        &self,
        target: &dyn RenderTarget,
        desc: &RenderStateDescriptor,
        binding_sets: &[&dyn BindingSet],
    ) -> RhiResult<Box<dyn RenderState>>;
    fn create_compute_state(
        &self,
        desc: &ComputeStateDescriptor,
        binding_sets: &[&dyn BindingSet],
    ) -> RhiResult<Box<dyn ComputeState>>;
    fn create_ray_tracing_state(
        &self,
        desc: &RayTracingStateDescriptor,
        binding_sets: &[&dyn BindingSet],
    ) -> RhiResult<Box<dyn RayTracingState>>;
    fn create_bottom_level_acceleration_structure(
        &self,
        geometry: &[BlasGeometry],
    ) -> RhiResult<Box<dyn BottomLevelAccelerationStructure>>;
    fn create_top_level_acceleration_structure(
        &self,
        max_instances: u32,
        instances: &[TlasInstance],
    ) -> RhiResult<Box<dyn TopLevelAccelerationStructure>>;

    fn has_active_capability(&self, kind: OptionalCapability) -> bool;
    fn vram_stats(&self) -> Option<VramStats>;
    fn complete_pending_operations(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texture_format_capability_flags() {
        assert!(!TextureFormat::Bc7Unorm.storage_capable());
        assert!(!TextureFormat::Rgba8UnormSrgb.storage_capable());
        assert!(TextureFormat::Rgba8Unorm.storage_capable());
        assert!(TextureFormat::D32Float.is_depth());
        assert!(TextureFormat::D24UnormS8Uint.has_stencil());
    }

    #[test]
    fn shader_stages_union() {
        let a = ShaderStages::VERTEX;
        let b = ShaderStages::FRAGMENT;
        assert!((a | b).contains(ShaderStages::VERTEX));
        assert!((a | b).contains(ShaderStages::FRAGMENT));
    }
}
