//! Descriptor heaps on `VK_EXT_descriptor_buffer`.
//!
//! Descriptors are plain bytes obtained from `vkGetDescriptorEXT`, so a descriptor
//! handle is a host pointer and copying descriptors is a `memcpy`:
//!
//! - Shader-visible view and sampler heaps are persistently mapped descriptor buffers.
//!   Their GPU handle is the buffer device address.
//! - CPU-only view and sampler heaps live in host memory.
//! - Render target and depth stencil heaps hold [`TargetView`] slots. Writing one
//!   creates the image view; the slot owns it until it is overwritten or the heap is
//!   dropped.
//!
//! View heaps use mutable descriptors, so every view occupies the same stride
//! regardless of its kind.
use std::{
    fmt::Debug,
    ptr::NonNull,
    sync::{Arc, Mutex},
};

use ash::vk;
use vk_mem::Alloc;

use super::device::DeviceShared;
use crate::{
    Error, Result,
    backend::{CpuDescriptorHandle, DescriptorHeapDesc, DescriptorHeapType, GpuDescriptorHandle},
};

/// An image view bound as a render target or depth stencil target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct TargetView {
    pub view: vk::ImageView,
    pub image: vk::Image,
    pub format: vk::Format,
    pub aspect: vk::ImageAspectFlags,
    pub extent: vk::Extent2D,
}

pub(super) type TargetSlot = Mutex<Option<TargetView>>;

/// Reads the target view a render target or depth stencil handle points at.
///
/// # Safety
/// `handle` must point into a live render target or depth stencil heap.
pub(super) unsafe fn read_target(handle: CpuDescriptorHandle) -> Option<TargetView> {
    let slot = unsafe { &*(handle.0 as *const TargetSlot) };
    *slot.lock().unwrap()
}

/// Replaces the target view at `handle`, destroying the one it held.
///
/// # Safety
/// `handle` must point into a live render target or depth stencil heap.
pub(super) unsafe fn write_target(
    shared: &DeviceShared,
    handle: CpuDescriptorHandle,
    target: TargetView,
) {
    let slot = unsafe { &*(handle.0 as *const TargetSlot) };
    if let Some(previous) = slot.lock().unwrap().replace(target) {
        unsafe { shared.raw.destroy_image_view(previous.view, None) };
    }
}

enum HeapStorage {
    Host(Box<[u8]>),
    Buffer {
        buffer: vk::Buffer,
        allocation: vk_mem::Allocation,
        mapped: NonNull<u8>,
        address: u64,
    },
    Targets(Box<[TargetSlot]>),
}

pub struct VulkanDescriptorHeap {
    shared: Arc<DeviceShared>,
    ty: DescriptorHeapType,
    count: u32,
    storage: HeapStorage,
}

unsafe impl Send for VulkanDescriptorHeap {}
unsafe impl Sync for VulkanDescriptorHeap {}

impl Debug for VulkanDescriptorHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("VulkanDescriptorHeap");
        debug.field("ty", &self.ty).field("count", &self.count);
        if let HeapStorage::Buffer { buffer, .. } = &self.storage {
            debug.field("buffer", buffer);
        }
        debug.finish()
    }
}

impl VulkanDescriptorHeap {
    pub(super) fn new(shared: Arc<DeviceShared>, desc: &DescriptorHeapDesc) -> Result<Self> {
        let stride = shared.increment(desc.ty) as usize;
        let size = stride * desc.count as usize;
        let storage = match desc.ty {
            DescriptorHeapType::Rtv | DescriptorHeapType::Dsv => HeapStorage::Targets(
                (0..desc.count).map(|_| Mutex::new(None)).collect(),
            ),
            _ if !desc.shader_visible => HeapStorage::Host(vec![0; size].into_boxed_slice()),
            ty => {
                let (usage, capacity) = match ty {
                    DescriptorHeapType::Sampler => (
                        vk::BufferUsageFlags::SAMPLER_DESCRIPTOR_BUFFER_EXT,
                        shared.adapter.descriptor_sizes.sampler_heap_capacity,
                    ),
                    _ => (
                        vk::BufferUsageFlags::RESOURCE_DESCRIPTOR_BUFFER_EXT,
                        shared.adapter.descriptor_sizes.view_heap_capacity,
                    ),
                };
                if desc.count > capacity {
                    tracing::error!(count = desc.count, capacity, ?ty, "descriptor heap too large");
                    return Err(Error::Unsupported(
                        "shader-visible descriptor heap exceeds the bindable range",
                    ));
                }
                let buffer_info = vk::BufferCreateInfo::default()
                    .size(size as u64)
                    .usage(usage | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
                    .sharing_mode(vk::SharingMode::EXCLUSIVE);
                let allocation_info = vk_mem::AllocationCreateInfo {
                    usage: vk_mem::MemoryUsage::AutoPreferDevice,
                    flags: vk_mem::AllocationCreateFlags::MAPPED
                        | vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
                    ..Default::default()
                };
                let (buffer, mut allocation) = unsafe {
                    shared
                        .allocator
                        .create_buffer(&buffer_info, &allocation_info)?
                };
                let mapped = shared.allocator.get_allocation_info(&allocation).mapped_data;
                let Some(mapped) = NonNull::new(mapped as *mut u8) else {
                    unsafe { shared.allocator.destroy_buffer(buffer, &mut allocation) };
                    return Err(Error::Unsupported("descriptor buffer is not host visible"));
                };
                let address = unsafe {
                    shared
                        .raw
                        .get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(buffer))
                };
                HeapStorage::Buffer {
                    buffer,
                    allocation,
                    mapped,
                    address,
                }
            }
        };
        tracing::debug!(ty = ?desc.ty, count = desc.count, shader_visible = desc.shader_visible, "created descriptor heap");
        Ok(Self {
            shared,
            ty: desc.ty,
            count: desc.count,
            storage,
        })
    }

    pub(super) fn ty(&self) -> DescriptorHeapType {
        self.ty
    }

    pub(super) fn start(&self) -> (CpuDescriptorHandle, GpuDescriptorHandle) {
        match &self.storage {
            HeapStorage::Host(bytes) => (
                CpuDescriptorHandle(bytes.as_ptr() as usize),
                GpuDescriptorHandle::NULL,
            ),
            HeapStorage::Buffer {
                mapped, address, ..
            } => (
                CpuDescriptorHandle(mapped.as_ptr() as usize),
                GpuDescriptorHandle(*address),
            ),
            HeapStorage::Targets(slots) => (
                CpuDescriptorHandle(slots.as_ptr() as usize),
                GpuDescriptorHandle::NULL,
            ),
        }
    }

    /// Device address of a shader-visible heap.
    pub(super) fn address(&self) -> Option<u64> {
        match &self.storage {
            HeapStorage::Buffer { address, .. } => Some(*address),
            _ => None,
        }
    }
}

impl Drop for VulkanDescriptorHeap {
    fn drop(&mut self) {
        match &mut self.storage {
            HeapStorage::Host(_) => {}
            HeapStorage::Buffer {
                buffer, allocation, ..
            } => unsafe { self.shared.allocator.destroy_buffer(*buffer, allocation) },
            HeapStorage::Targets(slots) => {
                for slot in slots.iter_mut() {
                    if let Some(target) = slot.get_mut().unwrap().take() {
                        unsafe { self.shared.raw.destroy_image_view(target.view, None) };
                    }
                }
            }
        }
    }
}

/// Writes the descriptor described by `data` at `dest`, zeroing the rest of the slot.
///
/// # Safety
/// `dest` must point to `stride` writable bytes.
pub(super) unsafe fn write_descriptor(
    shared: &DeviceShared,
    ty: vk::DescriptorType,
    data: vk::DescriptorDataEXT<'_>,
    size: u32,
    stride: u32,
    dest: CpuDescriptorHandle,
) {
    let bytes = unsafe { std::slice::from_raw_parts_mut(dest.0 as *mut u8, stride as usize) };
    let (descriptor, padding) = bytes.split_at_mut(size.min(stride) as usize);
    let info = vk::DescriptorGetInfoEXT::default().ty(ty).data(data);
    unsafe { shared.descriptor_buffer.get_descriptor(&info, descriptor) };
    padding.fill(0);
}

/// Copies descriptors between ranges whose run lengths may differ.
///
/// # Safety
/// Every range must point into a live view or sampler heap, and both sides must cover
/// the same number of descriptors.
pub(super) unsafe fn copy_descriptors(
    stride: u32,
    dst: &[(CpuDescriptorHandle, u32)],
    src: &[(CpuDescriptorHandle, u32)],
) {
    let mut src_ranges = src.iter().copied();
    let mut current: Option<(CpuDescriptorHandle, u32)> = None;
    for &(dst_start, dst_count) in dst {
        let mut written = 0;
        while written < dst_count {
            let (src_start, src_count) = match current.take() {
                Some(range) if range.1 > 0 => range,
                _ => match src_ranges.next() {
                    Some(range) => range,
                    None => {
                        debug_assert!(false, "descriptor copy source is shorter than destination");
                        return;
                    }
                },
            };
            let run = src_count.min(dst_count - written);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src_start.0 as *const u8,
                    dst_start.offset(written, stride).0 as *mut u8,
                    run as usize * stride as usize,
                )
            };
            written += run;
            current = Some((src_start.offset(run, stride), src_count - run));
        }
    }
}
