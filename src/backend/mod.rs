//! Native API seam.
//!
//! Everything above this module talks to the GPU through the [`Api`] family of traits.
//! A backend supplies the concrete native object types and implements [`RawDevice`],
//! [`RawQueue`] and [`RawCommandList`] for them.
//!
//! # Key Types
//!
//! - [`Api`]: Associates the native object types of one backend.
//! - [`RawDevice`]: Object creation, descriptor copies, fence queries.
//! - [`RawQueue`]: Submission, fence signals and GPU-side waits.
//! - [`RawCommandList`]: Command recording.
//!
//! The raw traits are deliberately thin. Pooling, fence bookkeeping, state tracking and
//! redundant-state elimination all live in the backend-independent layers, so a raw
//! call always maps to exactly one native call.
//!
//! # Backends
//!
//! - [`headless`]: Software device with a simulated GPU timeline. Always available.
//! - [`vulkan`]: `ash` + `vk-mem`. Enabled by the `vulkan` feature.
use std::{fmt::Debug, ptr::NonNull};

use glam::UVec3;

use crate::{Result, root_signature::RootSignatureDesc, tracking::Barrier};

pub mod headless;

#[cfg(feature = "vulkan")]
pub mod vulkan;

/// The set of native object types of one backend.
pub trait Api: Sized + Send + Sync + 'static {
    type Device: RawDevice<Self>;
    type Queue: RawQueue<Self>;
    type CommandAllocator: Send + Sync + Debug;
    type CommandList: RawCommandList<Self>;
    type Fence: Send + Sync + Debug;
    type DescriptorHeap: Send + Sync + Debug;
    /// A buffer or texture. Cloning must be cheap and must refer to the same resource.
    type Resource: Clone + Send + Sync + Debug;
    type RootSignature: Send + Sync + Debug;
    type PipelineState: Send + Sync + Debug;
}

/// Native device operations.
pub trait RawDevice<A: Api>: Send + Sync + Debug {
    fn create_queue(&self, kind: QueueKind) -> Result<A::Queue>;

    fn create_fence(&self, initial_value: u64) -> Result<A::Fence>;
    /// Value most recently reached by the GPU.
    fn completed_fence_value(&self, fence: &A::Fence) -> Result<u64>;
    /// Blocks the calling thread until `fence` reaches `value`.
    ///
    /// Each call must wait independently of any other concurrent call.
    fn wait_for_fence(&self, fence: &A::Fence, value: u64) -> Result<()>;

    fn create_command_allocator(&self, kind: QueueKind) -> Result<A::CommandAllocator>;
    /// # Safety
    /// No command list recorded from `allocator` may still be executing on the GPU.
    unsafe fn reset_command_allocator(&self, allocator: &mut A::CommandAllocator) -> Result<()>;
    /// Creates a command list that is open for recording on `allocator`.
    fn create_command_list(
        &self,
        kind: QueueKind,
        allocator: &A::CommandAllocator,
    ) -> Result<A::CommandList>;

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> Result<A::DescriptorHeap>;
    /// CPU and GPU handles of the first descriptor. The GPU handle is null for heaps
    /// that are not shader visible.
    fn descriptor_heap_start(
        &self,
        heap: &A::DescriptorHeap,
    ) -> (CpuDescriptorHandle, GpuDescriptorHandle);
    fn descriptor_increment_size(&self, ty: DescriptorHeapType) -> u32;
    /// # Safety
    /// Every handle must point into a live heap of type `ty`, and the total number of
    /// descriptors in `dst` and `src` must match.
    unsafe fn copy_descriptors(
        &self,
        dst: &[(CpuDescriptorHandle, u32)],
        src: &[(CpuDescriptorHandle, u32)],
        ty: DescriptorHeapType,
    );
    /// # Safety
    /// Both ranges must point into live heaps of type `ty`.
    unsafe fn copy_descriptors_simple(
        &self,
        count: u32,
        dst: CpuDescriptorHandle,
        src: CpuDescriptorHandle,
        ty: DescriptorHeapType,
    );

    fn create_buffer(&self, desc: &BufferDesc) -> Result<A::Resource>;
    fn create_texture(&self, desc: &TextureDesc) -> Result<A::Resource>;
    fn buffer_gpu_address(&self, buffer: &A::Resource) -> u64;
    /// Persistently maps an upload or readback buffer. The pointer remains valid for
    /// the lifetime of the resource.
    fn map_buffer(&self, buffer: &A::Resource) -> Result<NonNull<u8>>;

    /// # Safety
    /// `dest` must point into a live heap of the matching type.
    unsafe fn create_render_target_view(&self, resource: &A::Resource, dest: CpuDescriptorHandle);
    /// # Safety
    /// See [`RawDevice::create_render_target_view`].
    unsafe fn create_depth_stencil_view(&self, resource: &A::Resource, dest: CpuDescriptorHandle);
    /// `view` is `None` for the default view of a texture.
    ///
    /// # Safety
    /// See [`RawDevice::create_render_target_view`].
    unsafe fn create_shader_resource_view(
        &self,
        resource: &A::Resource,
        view: Option<&BufferViewDesc>,
        dest: CpuDescriptorHandle,
    );
    /// # Safety
    /// See [`RawDevice::create_render_target_view`].
    unsafe fn create_unordered_access_view(
        &self,
        resource: &A::Resource,
        view: Option<&BufferViewDesc>,
        dest: CpuDescriptorHandle,
    );
    /// # Safety
    /// See [`RawDevice::create_render_target_view`].
    unsafe fn create_constant_buffer_view(
        &self,
        buffer: &A::Resource,
        offset: u64,
        size: u32,
        dest: CpuDescriptorHandle,
    );
    /// # Safety
    /// See [`RawDevice::create_render_target_view`].
    unsafe fn create_sampler(&self, desc: &SamplerDesc, dest: CpuDescriptorHandle);

    fn create_root_signature(&self, desc: &RootSignatureDesc) -> Result<A::RootSignature>;
}

/// Native queue operations.
///
/// Calls on one queue must be externally synchronized. [`crate::queue::CommandQueue`]
/// holds its submission lock around every call.
pub trait RawQueue<A: Api>: Send + Sync + Debug {
    /// Executes `lists` in order, then signals `fence` to `signal_value`.
    ///
    /// # Safety
    /// Every list must be closed, and all resources they reference must outlive the
    /// execution.
    unsafe fn submit(
        &self,
        lists: &[&A::CommandList],
        fence: &A::Fence,
        signal_value: u64,
    ) -> Result<()>;
    /// # Safety
    /// `value` must be greater than any value previously signalled on `fence`.
    unsafe fn signal(&self, fence: &A::Fence, value: u64) -> Result<()>;
    /// Makes the GPU wait until `fence` reaches `value` before running later work.
    ///
    /// # Safety
    /// Some queue must eventually signal `value`, or this queue stalls forever.
    unsafe fn wait(&self, fence: &A::Fence, value: u64) -> Result<()>;
}

/// Native command recording.
///
/// # Safety
///
/// Every method records a native command that references the passed handles without
/// retaining them. Callers keep referenced objects alive until the list completes.
pub trait RawCommandList<A: Api>: Send + Debug {
    /// Reopens the list for recording on `allocator`.
    unsafe fn reset(&mut self, allocator: &A::CommandAllocator) -> Result<()>;
    unsafe fn close(&mut self) -> Result<()>;

    unsafe fn resource_barrier(&mut self, barriers: &[Barrier<A>]);
    unsafe fn set_descriptor_heaps(&mut self, heaps: &[&A::DescriptorHeap]);
    unsafe fn set_pipeline_state(&mut self, pipeline: &A::PipelineState);
    unsafe fn set_root_signature(&mut self, bind_point: BindPoint, signature: &A::RootSignature);
    unsafe fn set_root_descriptor_table(
        &mut self,
        bind_point: BindPoint,
        root_index: u32,
        base: GpuDescriptorHandle,
    );
    unsafe fn set_root_constants(
        &mut self,
        bind_point: BindPoint,
        root_index: u32,
        dest_offset: u32,
        values: &[u32],
    );
    unsafe fn set_root_view(
        &mut self,
        bind_point: BindPoint,
        root_index: u32,
        kind: RootViewKind,
        gpu_address: u64,
    );

    unsafe fn set_viewports(&mut self, viewports: &[Viewport]);
    unsafe fn set_scissor_rects(&mut self, rects: &[ScissorRect]);
    unsafe fn set_primitive_topology(&mut self, topology: PrimitiveTopology);
    unsafe fn set_render_targets(
        &mut self,
        rtvs: &[CpuDescriptorHandle],
        dsv: Option<CpuDescriptorHandle>,
    );
    unsafe fn set_vertex_buffers(&mut self, start_slot: u32, views: &[VertexBufferView]);
    unsafe fn set_index_buffer(&mut self, view: &IndexBufferView);

    unsafe fn draw_instanced(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    );
    unsafe fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    );
    unsafe fn dispatch(&mut self, group_count: UVec3);
    unsafe fn draw_indirect(&mut self, arguments: &A::Resource, offset: u64, indexed: bool);
    unsafe fn dispatch_indirect(&mut self, arguments: &A::Resource, offset: u64);

    unsafe fn clear_render_target_view(&mut self, rtv: CpuDescriptorHandle, color: [f32; 4]);
    unsafe fn clear_depth_stencil_view(
        &mut self,
        dsv: CpuDescriptorHandle,
        flags: ClearFlags,
        depth: f32,
        stencil: u8,
    );
    /// `gpu` must be a shader-visible copy of `cpu`.
    unsafe fn clear_unordered_access_view_float(
        &mut self,
        gpu: GpuDescriptorHandle,
        cpu: CpuDescriptorHandle,
        resource: &A::Resource,
        values: [f32; 4],
    );
    unsafe fn clear_unordered_access_view_uint(
        &mut self,
        gpu: GpuDescriptorHandle,
        cpu: CpuDescriptorHandle,
        resource: &A::Resource,
        values: [u32; 4],
    );

    unsafe fn copy_resource(&mut self, dst: &A::Resource, src: &A::Resource);
    unsafe fn copy_buffer_region(
        &mut self,
        dst: &A::Resource,
        dst_offset: u64,
        src: &A::Resource,
        src_offset: u64,
        size: u64,
    );
}

/// Hardware queue class. The discriminant is stored in the top byte of every fence
/// value signalled on a queue of this kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum QueueKind {
    Direct = 0,
    Compute = 2,
    Copy = 3,
}

impl QueueKind {
    pub const ALL: [QueueKind; 3] = [QueueKind::Direct, QueueKind::Compute, QueueKind::Copy];

    /// Dense index in `0..3`.
    pub fn index(self) -> usize {
        match self {
            QueueKind::Direct => 0,
            QueueKind::Compute => 1,
            QueueKind::Copy => 2,
        }
    }

    /// Initial fence value of queues of this kind. Signalled values start one above.
    pub fn fence_base(self) -> u64 {
        (self as u64) << 56
    }

    /// Recovers the queue kind from a fence value produced by [`QueueKind::fence_base`].
    pub fn from_fence_value(value: u64) -> Option<QueueKind> {
        match value >> 56 {
            0 => Some(QueueKind::Direct),
            2 => Some(QueueKind::Compute),
            3 => Some(QueueKind::Copy),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindPoint {
    Graphics,
    Compute,
}

/// Descriptor heap class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DescriptorHeapType {
    CbvSrvUav = 0,
    Sampler = 1,
    Rtv = 2,
    Dsv = 3,
}

impl DescriptorHeapType {
    pub const ALL: [DescriptorHeapType; 4] = [
        DescriptorHeapType::CbvSrvUav,
        DescriptorHeapType::Sampler,
        DescriptorHeapType::Rtv,
        DescriptorHeapType::Dsv,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Only view and sampler heaps may be bound for shader access.
    pub fn is_shader_visible_capable(self) -> bool {
        matches!(self, DescriptorHeapType::CbvSrvUav | DescriptorHeapType::Sampler)
    }
}

/// CPU-side address of a descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct CpuDescriptorHandle(pub usize);

impl CpuDescriptorHandle {
    pub const NULL: Self = Self(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Advances by `count` descriptors of `increment` bytes each.
    pub fn offset(self, count: u32, increment: u32) -> Self {
        Self(self.0 + count as usize * increment as usize)
    }
}

/// Shader-visible address of a descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct GpuDescriptorHandle(pub u64);

impl GpuDescriptorHandle {
    pub const NULL: Self = Self(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn offset(self, count: u32, increment: u32) -> Self {
        Self(self.0 + count as u64 * increment as u64)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorHeapDesc {
    pub ty: DescriptorHeapType,
    pub count: u32,
    pub shader_visible: bool,
}

/// Memory pool a resource lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HeapKind {
    /// Device-local, not CPU accessible.
    Default,
    /// CPU-writable, GPU-readable.
    Upload,
    /// GPU-writable, CPU-readable.
    Readback,
}

#[derive(Clone, Debug)]
pub struct BufferDesc {
    pub size: u64,
    pub heap: HeapKind,
    pub allow_unordered_access: bool,
    pub initial_state: crate::tracking::ResourceStates,
    pub name: Option<String>,
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const SHADER_RESOURCE = 1 << 0;
        const RENDER_TARGET = 1 << 1;
        const DEPTH_STENCIL = 1 << 2;
        const UNORDERED_ACCESS = 1 << 3;
    }
}

#[derive(Clone, Debug)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub array_layers: u16,
    pub mip_levels: u16,
    pub format: Format,
    pub usage: TextureUsage,
    pub initial_state: crate::tracking::ResourceStates,
    pub name: Option<String>,
}

/// Texel formats understood by every backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Format {
    R8G8B8A8Unorm,
    R8G8B8A8Srgb,
    B8G8R8A8Unorm,
    R16G16B16A16Float,
    R32G32B32A32Float,
    R32Float,
    R32Uint,
    D32Float,
    D24UnormS8Uint,
}

impl Format {
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            Format::R8G8B8A8Unorm
            | Format::R8G8B8A8Srgb
            | Format::B8G8R8A8Unorm
            | Format::R32Float
            | Format::R32Uint
            | Format::D32Float
            | Format::D24UnormS8Uint => 4,
            Format::R16G16B16A16Float => 8,
            Format::R32G32B32A32Float => 16,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(self, Format::D32Float | Format::D24UnormS8Uint)
    }

    pub fn has_stencil(self) -> bool {
        matches!(self, Format::D24UnormS8Uint)
    }
}

/// Element range of a buffer view. A `stride` of zero describes a raw (byte address)
/// view, in which case elements are 4 bytes wide.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferViewDesc {
    pub first_element: u64,
    pub num_elements: u32,
    pub stride: u32,
}

impl BufferViewDesc {
    pub fn element_size(&self) -> u32 {
        if self.stride == 0 { 4 } else { self.stride }
    }

    pub fn byte_range(&self) -> std::ops::Range<u64> {
        let size = self.element_size() as u64;
        let start = self.first_element * size;
        start..start + self.num_elements as u64 * size
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Filter {
    Point,
    #[default]
    Linear,
    Anisotropic,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum AddressMode {
    #[default]
    Wrap,
    Mirror,
    Clamp,
    Border,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplerDesc {
    pub filter: Filter,
    pub address_mode: AddressMode,
    pub max_anisotropy: u32,
    pub mip_lod_bias: f32,
    pub border_color: [f32; 4],
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            filter: Filter::Linear,
            address_mode: AddressMode::Wrap,
            max_anisotropy: 16,
            mip_lod_bias: 0.0,
            border_color: [0.0; 4],
        }
    }
}

/// Kind of a root descriptor bound directly by GPU address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RootViewKind {
    ConstantBuffer,
    ShaderResource,
    UnorderedAccess,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn from_size(size: glam::UVec2) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: size.x as f32,
            height: size.y as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScissorRect {
    pub min: glam::IVec2,
    pub max: glam::IVec2,
}

impl ScissorRect {
    pub fn from_size(size: glam::UVec2) -> Self {
        Self {
            min: glam::IVec2::ZERO,
            max: size.as_ivec2(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexBufferView {
    pub gpu_address: u64,
    pub size_in_bytes: u32,
    pub stride_in_bytes: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexFormat {
    U16,
    U32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexBufferView {
    pub gpu_address: u64,
    pub size_in_bytes: u32,
    pub format: IndexFormat,
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ClearFlags: u8 {
        const DEPTH = 1 << 0;
        const STENCIL = 1 << 1;
    }
}
