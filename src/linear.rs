//! Linear sub-allocation of transient GPU memory.
//!
//! Each command list owns two [`LinearAllocator`]s: one over CPU-writable upload pages
//! for constants and staging data, and one over GPU-exclusive pages for scratch data
//! written by shaders. Allocation bumps an offset inside the current page. When the page
//! is full it is retired and a fresh one is requested from the shared
//! [`LinearPagePool`] of the same kind.
//!
//! Pages return to their pool when the owning list is finished, tagged with the fence
//! value of that submission. A page is only handed out again once that value completes,
//! so data written for one list is never overwritten while the GPU still reads it.
//!
//! ```
//! # use std::sync::Arc;
//! # use scoria::{Device, backend::headless::{Headless, HeadlessDevice}, queue::CommandQueues};
//! use scoria::linear::{LinearAllocator, LinearAllocatorKind, LinearPagePool};
//! # let device = Device::<Headless>::new(HeadlessDevice::default());
//! # let queues = Arc::new(CommandQueues::new(device.clone()).unwrap());
//! let pool = Arc::new(LinearPagePool::new(device, queues, LinearAllocatorKind::CpuWritable, 4096));
//! let mut allocator = LinearAllocator::new(pool);
//!
//! let mut constants = allocator.allocate(64, 256).unwrap();
//! constants.write(&[1.0f32; 16]);
//! assert_eq!(constants.gpu_address() % 256, 0);
//! ```
use std::{
    fmt::Debug,
    sync::{Arc, Mutex},
};

use crate::{
    Device, HasDevice, Result,
    backend::{Api, BufferDesc, HeapKind, RawDevice},
    queue::CommandQueues,
    sync::FencedPool,
    tracking::{GpuResource, ResourceStates},
    utils::align_up,
};

/// Alignment used when callers do not ask for a specific one. Matches the constant
/// buffer placement alignment.
pub const DEFAULT_ALIGNMENT: u64 = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LinearAllocatorKind {
    /// Default heap, writable by shaders through unordered access.
    GpuExclusive,
    /// Upload heap, persistently mapped for CPU writes.
    CpuWritable,
}

impl LinearAllocatorKind {
    pub fn initial_state(self) -> ResourceStates {
        match self {
            LinearAllocatorKind::GpuExclusive => ResourceStates::UNORDERED_ACCESS,
            LinearAllocatorKind::CpuWritable => ResourceStates::GENERIC_READ,
        }
    }

    fn buffer_desc(self, size: u64) -> BufferDesc {
        match self {
            LinearAllocatorKind::GpuExclusive => BufferDesc {
                size,
                heap: HeapKind::Default,
                allow_unordered_access: true,
                initial_state: self.initial_state(),
                name: Some("LinearAllocator Page (GpuExclusive)".into()),
            },
            LinearAllocatorKind::CpuWritable => BufferDesc {
                size,
                heap: HeapKind::Upload,
                allow_unordered_access: false,
                initial_state: self.initial_state(),
                name: Some("LinearAllocator Page (CpuWritable)".into()),
            },
        }
    }
}

/// One buffer sub-allocated by a [`LinearAllocator`].
pub struct LinearAllocationPage<A: Api> {
    resource: GpuResource<A>,
    /// Null for GPU-exclusive pages.
    ptr: *mut u8,
    size: u64,
}
unsafe impl<A: Api> Send for LinearAllocationPage<A> {}
unsafe impl<A: Api> Sync for LinearAllocationPage<A> {}

impl<A: Api> Debug for LinearAllocationPage<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinearAllocationPage")
            .field("resource", &self.resource)
            .field("mapped", &!self.ptr.is_null())
            .field("size", &self.size)
            .finish()
    }
}

impl<A: Api> LinearAllocationPage<A> {
    pub fn resource(&self) -> &GpuResource<A> {
        &self.resource
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn gpu_address(&self) -> u64 {
        self.resource.gpu_address()
    }

    pub fn is_mapped(&self) -> bool {
        !self.ptr.is_null()
    }
}

/// Fence-gated pool of linear pages of one kind.
pub struct LinearPagePool<A: Api> {
    device: Device<A>,
    queues: Arc<CommandQueues<A>>,
    kind: LinearAllocatorKind,
    page_size: u64,
    pages: Mutex<FencedPool<LinearAllocationPage<A>>>,
}

impl<A: Api> Debug for LinearPagePool<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinearPagePool")
            .field("kind", &self.kind)
            .field("page_size", &self.page_size)
            .field("pages", &*self.pages.lock().unwrap())
            .finish()
    }
}

impl<A: Api> HasDevice<A> for LinearPagePool<A> {
    fn device(&self) -> &Device<A> {
        &self.device
    }
}

impl<A: Api> LinearPagePool<A> {
    pub fn new(
        device: Device<A>,
        queues: Arc<CommandQueues<A>>,
        kind: LinearAllocatorKind,
        page_size: u64,
    ) -> Self {
        Self {
            device,
            queues,
            kind,
            page_size,
            pages: Mutex::new(FencedPool::new()),
        }
    }

    pub fn kind(&self) -> LinearAllocatorKind {
        self.kind
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Takes a page whose last use has completed, or creates a new one.
    pub fn request_page(&self) -> Result<LinearAllocationPage<A>> {
        let mut pages = self.pages.lock().unwrap();
        if let Some(page) = pages.acquire(|fence| self.queues.is_fence_complete(fence)) {
            return Ok(page);
        }
        let page = self.create_new_page(self.page_size)?;
        pages.register_created();
        Ok(page)
    }

    /// Creates a page outside the pool accounting.
    pub fn create_new_page(&self, size: u64) -> Result<LinearAllocationPage<A>> {
        let raw = self.device.create_buffer(&self.kind.buffer_desc(size))?;
        let ptr = match self.kind {
            LinearAllocatorKind::CpuWritable => self.device.map_buffer(&raw)?.as_ptr(),
            LinearAllocatorKind::GpuExclusive => std::ptr::null_mut(),
        };
        let gpu_address = self.device.buffer_gpu_address(&raw);
        tracing::debug!(
            "Allocating new linear page with size = {} for {:?}",
            size,
            self.kind
        );
        Ok(LinearAllocationPage {
            resource: GpuResource::from_raw(raw, self.kind.initial_state(), gpu_address),
            ptr,
            size,
        })
    }

    /// Returns pages, to be reused once `fence` completes.
    pub fn discard_pages(&self, fence: u64, used: impl IntoIterator<Item = LinearAllocationPage<A>>) {
        let mut pages = self.pages.lock().unwrap();
        for page in used {
            pages.discard(fence, page);
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pages.lock().unwrap().created()
    }

    /// Drops every pooled page. The GPU must be idle.
    pub fn destroy_all(&self) -> usize {
        self.pages.lock().unwrap().clear()
    }
}

/// A sub-allocation from a [`LinearAllocator`].
///
/// Valid until the command list that allocated it has been submitted and its fence has
/// completed. Holding on to it past that point reads memory that may belong to another
/// list.
pub struct DynAlloc<A: Api> {
    buffer: A::Resource,
    offset: u64,
    size: u64,
    ptr: *mut u8,
    gpu_address: u64,
}
unsafe impl<A: Api> Send for DynAlloc<A> {}
unsafe impl<A: Api> Sync for DynAlloc<A> {}

impl<A: Api> Debug for DynAlloc<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynAlloc")
            .field("buffer", &self.buffer)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("gpu_address", &format_args!("{:#x}", self.gpu_address))
            .finish()
    }
}

impl<A: Api> DynAlloc<A> {
    /// The page buffer this allocation lives in.
    pub fn buffer(&self) -> &A::Resource {
        &self.buffer
    }

    /// Offset from the start of [`DynAlloc::buffer`].
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    /// CPU view of the allocation, or `None` for GPU-exclusive memory.
    pub fn as_slice(&self) -> Option<&[u8]> {
        if self.ptr.is_null() {
            None
        } else {
            unsafe { Some(std::slice::from_raw_parts(self.ptr, self.size as usize)) }
        }
    }

    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        if self.ptr.is_null() {
            None
        } else {
            unsafe { Some(std::slice::from_raw_parts_mut(self.ptr, self.size as usize)) }
        }
    }

    /// Copies `data` to the start of the allocation.
    ///
    /// # Panics
    /// If the allocation is not CPU writable or smaller than `data`.
    pub fn write<T: bytemuck::Pod>(&mut self, data: &[T]) {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let slice = self
            .as_mut_slice()
            .unwrap_or_else(|| panic!("GPU-exclusive allocations cannot be written by the CPU"));
        assert!(
            bytes.len() <= slice.len(),
            "writing {} bytes into an allocation of {}",
            bytes.len(),
            slice.len()
        );
        slice[..bytes.len()].copy_from_slice(bytes);
    }
}

/// Bump allocator over pages of one [`LinearPagePool`].
pub struct LinearAllocator<A: Api> {
    pool: Arc<LinearPagePool<A>>,
    current: Option<LinearAllocationPage<A>>,
    current_offset: u64,
    retired: Vec<LinearAllocationPage<A>>,
}

impl<A: Api> Debug for LinearAllocator<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinearAllocator")
            .field("kind", &self.pool.kind())
            .field("current_offset", &self.current_offset)
            .field("retired", &self.retired.len())
            .finish()
    }
}

impl<A: Api> LinearAllocator<A> {
    pub fn new(pool: Arc<LinearPagePool<A>>) -> Self {
        Self {
            pool,
            current: None,
            current_offset: 0,
            retired: Vec::new(),
        }
    }

    pub fn kind(&self) -> LinearAllocatorKind {
        self.pool.kind()
    }

    /// Pages used since the last cleanup, including the current one.
    pub fn pages_in_use(&self) -> usize {
        self.retired.len() + self.current.is_some() as usize
    }

    /// Allocates `size` bytes at an `alignment` boundary. The size is rounded up to the
    /// alignment.
    ///
    /// # Panics
    /// If `alignment` is not a power of two, or the aligned size exceeds the page size.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Result<DynAlloc<A>> {
        assert!(
            alignment.is_power_of_two(),
            "alignment {alignment} is not a power of two"
        );
        let aligned_size = align_up(size, alignment);
        let page_size = self.pool.page_size();
        assert!(
            aligned_size <= page_size,
            "allocation of {aligned_size} bytes exceeds the linear page size of {page_size}"
        );

        self.current_offset = align_up(self.current_offset, alignment);
        let page = match self.current.take() {
            Some(page) if self.current_offset + aligned_size <= page_size => page,
            full => {
                self.retired.extend(full);
                self.current_offset = 0;
                self.pool.request_page()?
            }
        };

        let offset = self.current_offset;
        self.current_offset += aligned_size;
        let alloc = DynAlloc {
            buffer: page.resource.raw().clone(),
            offset,
            size: aligned_size,
            ptr: if page.ptr.is_null() {
                page.ptr
            } else {
                unsafe { page.ptr.add(offset as usize) }
            },
            gpu_address: page.gpu_address() + offset,
        };
        self.current = Some(page);
        Ok(alloc)
    }

    /// Returns every page used since the last cleanup to the pool, tagged with `fence`.
    pub fn cleanup_used_pages(&mut self, fence: u64) {
        if let Some(page) = self.current.take() {
            self.retired.push(page);
        }
        self.current_offset = 0;
        self.pool.discard_pages(fence, self.retired.drain(..));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        QueueKind,
        headless::{ExecutionMode, Headless, HeadlessConfig, HeadlessDevice},
    };

    fn pool(
        kind: LinearAllocatorKind,
        page_size: u64,
    ) -> (HeadlessDevice, Arc<CommandQueues<Headless>>, Arc<LinearPagePool<Headless>>) {
        let raw = HeadlessDevice::new(HeadlessConfig {
            mode: ExecutionMode::Manual,
            ..Default::default()
        });
        let device = Device::<Headless>::new(raw.clone());
        let queues = Arc::new(CommandQueues::new(device.clone()).unwrap());
        let pool = Arc::new(LinearPagePool::new(device, queues.clone(), kind, page_size));
        (raw, queues, pool)
    }

    #[test]
    fn test_allocations_are_aligned_and_retire_full_pages() {
        let (_, _, pool) = pool(LinearAllocatorKind::CpuWritable, 1024);
        let mut allocator = LinearAllocator::new(pool.clone());
        let a = allocator.allocate(10, 256).unwrap();
        assert_eq!(a.size(), 256);
        let b = allocator.allocate(300, 256).unwrap();
        assert_eq!(b.offset(), 256);
        assert_eq!(b.gpu_address(), a.gpu_address() + 256);

        // 768 + 512 does not fit in 1024.
        let c = allocator.allocate(512, 256).unwrap();
        assert_eq!(c.offset(), 0);
        assert_eq!(allocator.pages_in_use(), 2);
        assert_eq!(pool.pool_size(), 2);
    }

    #[test]
    fn test_write_lands_in_page_memory() {
        let (_, _, pool) = pool(LinearAllocatorKind::CpuWritable, 4096);
        let mut allocator = LinearAllocator::new(pool);
        let _ = allocator.allocate(16, 256).unwrap();
        let mut alloc = allocator.allocate(16, 256).unwrap();
        alloc.write(&[7u32, 8, 9, 10]);
        let bytes = alloc.buffer().read_bytes(256..272);
        assert_eq!(bytes, bytemuck::cast_slice::<u32, u8>(&[7, 8, 9, 10]));
    }

    #[test]
    fn test_gpu_exclusive_pages_are_not_mapped() {
        let (_, _, pool) = pool(LinearAllocatorKind::GpuExclusive, 1 << 16);
        let mut allocator = LinearAllocator::new(pool);
        let mut alloc = allocator.allocate(64, 64).unwrap();
        assert!(alloc.as_mut_slice().is_none());
        assert_ne!(alloc.gpu_address(), 0);
    }

    #[test]
    #[should_panic(expected = "exceeds the linear page size")]
    fn test_oversized_allocation_panics() {
        let (_, _, pool) = pool(LinearAllocatorKind::CpuWritable, 1024);
        let _ = LinearAllocator::new(pool).allocate(1025, 1);
    }

    #[test]
    #[should_panic(expected = "not a power of two")]
    fn test_alignment_must_be_power_of_two() {
        let (_, _, pool) = pool(LinearAllocatorKind::CpuWritable, 1024);
        let _ = LinearAllocator::new(pool).allocate(16, 48);
    }

    #[test]
    fn test_pages_recycle_after_fence() {
        let (raw, queues, pool) = pool(LinearAllocatorKind::CpuWritable, 1024);
        let mut allocator = LinearAllocator::new(pool.clone());
        let first = allocator.allocate(1024, 256).unwrap().gpu_address();
        let fence = queues.get(QueueKind::Direct).increment_fence().unwrap();
        allocator.cleanup_used_pages(fence);
        assert_eq!(allocator.pages_in_use(), 0);

        // Still in flight: a second page is created.
        let second = allocator.allocate(1024, 256).unwrap().gpu_address();
        assert_ne!(first, second);

        raw.complete_all();
        let fence = queues.get(QueueKind::Direct).increment_fence().unwrap();
        allocator.cleanup_used_pages(fence);
        raw.complete_all();
        let third = allocator.allocate(16, 256).unwrap().gpu_address();
        assert!(third == first || third == second);
        assert_eq!(pool.pool_size(), 2);
    }
}
