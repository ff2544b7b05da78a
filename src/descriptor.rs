//! Descriptor heaps and persistent descriptor allocation.
//!
//! # Key Types
//!
//! - [`DescriptorAllocator`]: Bump allocator of CPU-only descriptors that live as long as
//!   the process. Resource views (RTVs, SRVs, samplers, ...) are created here and copied
//!   into shader-visible heaps when bound.
//! - [`ShaderVisibleHeap`]: A native heap that can be bound on a command list. Dynamic
//!   descriptor pages and user heaps are both built on it.
//! - [`DescriptorHeap`]: A user-managed shader-visible heap with range allocation, for
//!   bindless tables.
//! - [`DescriptorHandle`]: A CPU handle paired with its GPU handle.
//!
//! # Example
//!
//! ```
//! # use scoria::{Device, backend::{DescriptorHeapType, headless::{Headless, HeadlessDevice}}, descriptor::DescriptorHeap};
//! # let device = Device::<Headless>::new(HeadlessDevice::default());
//! let heap = DescriptorHeap::new(device, DescriptorHeapType::CbvSrvUav, 64).unwrap();
//! let textures = heap.alloc(8).unwrap();
//! assert!(heap.validate_handle(&textures));
//! assert_eq!(heap.offset_of(&textures), 0);
//! heap.free(&textures, 8);
//! ```
use std::{
    fmt::Debug,
    sync::{Arc, Mutex},
};

use smallvec::SmallVec;

use crate::{
    Device, HasDevice, Result,
    backend::{
        Api, CpuDescriptorHandle, DescriptorHeapDesc, DescriptorHeapType, GpuDescriptorHandle,
        RawCommandList, RawDevice,
    },
    utils::IdAlloc,
};

/// A CPU descriptor handle and, for shader-visible heaps, its GPU handle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DescriptorHandle {
    cpu: CpuDescriptorHandle,
    gpu: GpuDescriptorHandle,
}

impl DescriptorHandle {
    pub fn new(cpu: CpuDescriptorHandle, gpu: GpuDescriptorHandle) -> Self {
        Self { cpu, gpu }
    }

    pub fn cpu(&self) -> CpuDescriptorHandle {
        self.cpu
    }

    pub fn gpu(&self) -> GpuDescriptorHandle {
        self.gpu
    }

    pub fn is_null(&self) -> bool {
        self.cpu.is_null()
    }

    pub fn is_shader_visible(&self) -> bool {
        !self.gpu.is_null()
    }

    pub fn offset(&self, count: u32, increment: u32) -> Self {
        Self {
            cpu: self.cpu.offset(count, increment),
            gpu: if self.gpu.is_null() {
                self.gpu
            } else {
                self.gpu.offset(count, increment)
            },
        }
    }
}

/// A native shader-visible descriptor heap.
pub struct ShaderVisibleHeap<A: Api> {
    device: Device<A>,
    raw: A::DescriptorHeap,
    ty: DescriptorHeapType,
    capacity: u32,
    start: DescriptorHandle,
    increment: u32,
}

impl<A: Api> Debug for ShaderVisibleHeap<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderVisibleHeap")
            .field("raw", &self.raw)
            .field("ty", &self.ty)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl<A: Api> HasDevice<A> for ShaderVisibleHeap<A> {
    fn device(&self) -> &Device<A> {
        &self.device
    }
}

impl<A: Api> ShaderVisibleHeap<A> {
    pub fn new(device: Device<A>, ty: DescriptorHeapType, capacity: u32) -> Result<Self> {
        assert!(
            ty.is_shader_visible_capable(),
            "{ty:?} heaps cannot be shader visible"
        );
        let raw = device.create_descriptor_heap(&DescriptorHeapDesc {
            ty,
            count: capacity,
            shader_visible: true,
        })?;
        let (cpu, gpu) = device.descriptor_heap_start(&raw);
        let increment = device.descriptor_increment(ty);
        Ok(Self {
            device,
            raw,
            ty,
            capacity,
            start: DescriptorHandle::new(cpu, gpu),
            increment,
        })
    }

    pub fn raw(&self) -> &A::DescriptorHeap {
        &self.raw
    }

    pub fn ty(&self) -> DescriptorHeapType {
        self.ty
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn increment(&self) -> u32 {
        self.increment
    }

    pub fn start(&self) -> DescriptorHandle {
        self.start
    }

    pub fn handle_at(&self, offset: u32) -> DescriptorHandle {
        assert!(offset < self.capacity, "descriptor offset {offset} out of bounds");
        self.start.offset(offset, self.increment)
    }

    /// Returns `true` if `handle` points inside this heap.
    pub fn contains(&self, handle: &DescriptorHandle) -> bool {
        let start = self.start.gpu().0;
        let end = start + self.capacity as u64 * self.increment as u64;
        if !(start..end).contains(&handle.gpu().0) {
            return false;
        }
        handle.cpu().0.checked_sub(self.start.cpu().0) == Some((handle.gpu().0 - start) as usize)
    }

    /// Offset of `handle` in descriptors from the start of the heap.
    pub fn offset_of(&self, handle: &DescriptorHandle) -> u32 {
        ((handle.cpu().0 - self.start.cpu().0) / self.increment as usize) as u32
    }
}

/// Persistent bump allocator of CPU-only descriptors of one type.
///
/// Descriptors are carved from native heaps of a fixed size. A request that does not fit
/// in the rest of the current heap starts a new heap; the tail of the old one is never
/// used. Descriptors are never freed individually, only all at once through
/// [`DescriptorAllocator::destroy_all`].
pub struct DescriptorAllocator<A: Api> {
    device: Device<A>,
    ty: DescriptorHeapType,
    descriptors_per_heap: u32,
    heaps: Vec<A::DescriptorHeap>,
    current: CpuDescriptorHandle,
    remaining: u32,
}

impl<A: Api> Debug for DescriptorAllocator<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorAllocator")
            .field("ty", &self.ty)
            .field("heaps", &self.heaps.len())
            .field("remaining", &self.remaining)
            .finish()
    }
}

impl<A: Api> DescriptorAllocator<A> {
    pub fn new(device: Device<A>, ty: DescriptorHeapType, descriptors_per_heap: u32) -> Self {
        Self {
            device,
            ty,
            descriptors_per_heap,
            heaps: Vec::new(),
            current: CpuDescriptorHandle::NULL,
            remaining: 0,
        }
    }

    pub fn ty(&self) -> DescriptorHeapType {
        self.ty
    }

    pub fn heap_count(&self) -> usize {
        self.heaps.len()
    }

    /// Allocates `count` contiguous descriptors.
    ///
    /// # Panics
    /// If `count` exceeds the size of a single heap.
    pub fn allocate(&mut self, count: u32) -> Result<CpuDescriptorHandle> {
        assert!(
            count <= self.descriptors_per_heap,
            "cannot allocate {count} descriptors from heaps of {}",
            self.descriptors_per_heap
        );
        if self.current.is_null() || self.remaining < count {
            let heap = self.device.create_descriptor_heap(&DescriptorHeapDesc {
                ty: self.ty,
                count: self.descriptors_per_heap,
                shader_visible: false,
            })?;
            self.current = self.device.descriptor_heap_start(&heap).0;
            self.remaining = self.descriptors_per_heap;
            self.heaps.push(heap);
            tracing::debug!(
                "Allocating new {:?} descriptor heap with size = {}, heap count = {}",
                self.ty,
                self.descriptors_per_heap,
                self.heaps.len()
            );
        }
        let handle = self.current;
        self.current = self
            .current
            .offset(count, self.device.descriptor_increment(self.ty));
        self.remaining -= count;
        Ok(handle)
    }

    /// Releases every heap. All handles handed out so far become dangling.
    pub fn destroy_all(&mut self) -> usize {
        let count = self.heaps.len();
        self.heaps.clear();
        self.current = CpuDescriptorHandle::NULL;
        self.remaining = 0;
        count
    }
}

/// A user-managed shader-visible heap with range allocation.
pub struct DescriptorHeap<A: Api> {
    heap: Arc<ShaderVisibleHeap<A>>,
    ids: Mutex<IdAlloc>,
}

impl<A: Api> Debug for DescriptorHeap<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorHeap")
            .field("heap", &self.heap)
            .field("allocated", &self.ids.lock().unwrap().allocated())
            .finish()
    }
}

impl<A: Api> DescriptorHeap<A> {
    pub fn new(device: Device<A>, ty: DescriptorHeapType, capacity: u32) -> Result<Self> {
        let heap = ShaderVisibleHeap::new(device, ty, capacity)?;
        Ok(Self {
            heap: Arc::new(heap),
            ids: Mutex::new(IdAlloc::new(capacity)),
        })
    }

    /// The native heap, to be bound with
    /// [`CommandList::set_descriptor_heap`](crate::command::CommandList::set_descriptor_heap).
    pub fn heap(&self) -> &Arc<ShaderVisibleHeap<A>> {
        &self.heap
    }

    /// Allocates `count` contiguous descriptors, or `None` if no free range is large
    /// enough.
    pub fn alloc(&self, count: u32) -> Option<DescriptorHandle> {
        let offset = self.ids.lock().unwrap().alloc(count)?;
        Some(self.heap.handle_at(offset))
    }

    pub fn free(&self, handle: &DescriptorHandle, count: u32) {
        debug_assert!(self.validate_handle(handle));
        let offset = self.heap.offset_of(handle);
        self.ids.lock().unwrap().free(offset, count);
    }

    pub fn handle_at(&self, offset: u32) -> DescriptorHandle {
        self.heap.handle_at(offset)
    }

    pub fn offset_of(&self, handle: &DescriptorHandle) -> u32 {
        self.heap.offset_of(handle)
    }

    /// Returns `true` if `handle` points inside this heap.
    pub fn validate_handle(&self, handle: &DescriptorHandle) -> bool {
        self.heap.contains(handle)
    }

    pub fn allocated(&self) -> u32 {
        self.ids.lock().unwrap().allocated()
    }
}

/// The shader-visible heaps bound on a command list, one per shader-visible heap type.
///
/// Binding replaces the native heap set only when one of the heaps actually changed.
pub struct BoundHeaps<A: Api>([Option<Arc<ShaderVisibleHeap<A>>>; 2]);

impl<A: Api> Default for BoundHeaps<A> {
    fn default() -> Self {
        Self([None, None])
    }
}

impl<A: Api> Debug for BoundHeaps<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

impl<A: Api> BoundHeaps<A> {
    fn slot(ty: DescriptorHeapType) -> usize {
        assert!(
            ty.is_shader_visible_capable(),
            "{ty:?} heaps cannot be bound for shader access"
        );
        ty.index()
    }

    pub fn get(&self, ty: DescriptorHeapType) -> Option<&Arc<ShaderVisibleHeap<A>>> {
        self.0[Self::slot(ty)].as_ref()
    }

    /// Binds `heap` for its type. Returns `true` if a native call was made.
    pub fn set(&mut self, raw: &mut A::CommandList, heap: &Arc<ShaderVisibleHeap<A>>) -> bool {
        self.set_many(raw, std::slice::from_ref(heap))
    }

    pub fn set_many(&mut self, raw: &mut A::CommandList, heaps: &[Arc<ShaderVisibleHeap<A>>]) -> bool {
        let mut changed = false;
        for heap in heaps {
            let slot = &mut self.0[Self::slot(heap.ty())];
            if slot.as_ref().is_none_or(|bound| !Arc::ptr_eq(bound, heap)) {
                *slot = Some(heap.clone());
                changed = true;
            }
        }
        if changed {
            self.bind(raw);
        }
        changed
    }

    /// Re-applies the bound heaps, after the native list was reset.
    pub fn bind(&self, raw: &mut A::CommandList) {
        let heaps: SmallVec<[&A::DescriptorHeap; 2]> =
            self.0.iter().flatten().map(|heap| heap.raw()).collect();
        if !heaps.is_empty() {
            unsafe { raw.set_descriptor_heaps(&heaps) };
        }
    }

    pub fn clear(&mut self) {
        self.0 = [None, None];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{Headless, HeadlessDevice};

    fn device() -> (HeadlessDevice, Device<Headless>) {
        let raw = HeadlessDevice::default();
        (raw.clone(), Device::<Headless>::new(raw))
    }

    #[test]
    fn test_allocator_starts_new_heap_when_full() {
        let (raw, device) = device();
        let mut allocator = DescriptorAllocator::new(device, DescriptorHeapType::Rtv, 4);
        let a = allocator.allocate(3).unwrap();
        let b = allocator.allocate(1).unwrap();
        assert_eq!(b, a.offset(3, 1));
        assert_eq!(allocator.heap_count(), 1);

        let c = allocator.allocate(2).unwrap();
        assert_eq!(allocator.heap_count(), 2);
        assert_ne!(c.0 >> 32, a.0 >> 32);
        assert_eq!(raw.stats().descriptor_heaps_created, 2);

        assert_eq!(allocator.destroy_all(), 2);
        assert_eq!(allocator.heap_count(), 0);
    }

    #[test]
    #[should_panic(expected = "cannot allocate")]
    fn test_allocator_rejects_oversized_requests() {
        let (_, device) = device();
        let mut allocator = DescriptorAllocator::new(device, DescriptorHeapType::CbvSrvUav, 4);
        let _ = allocator.allocate(5);
    }

    #[test]
    fn test_user_heap_ranges() {
        let (_, device) = device();
        let heap = DescriptorHeap::new(device.clone(), DescriptorHeapType::CbvSrvUav, 16).unwrap();
        let a = heap.alloc(10).unwrap();
        let b = heap.alloc(6).unwrap();
        assert_eq!(heap.offset_of(&b), 10);
        assert!(b.is_shader_visible());
        assert_eq!(heap.alloc(1), None);

        heap.free(&a, 10);
        let c = heap.alloc(4).unwrap();
        assert_eq!(c, a);

        let other = DescriptorHeap::new(device, DescriptorHeapType::CbvSrvUav, 16).unwrap();
        assert!(!heap.validate_handle(&other.handle_at(0)));
    }
}
