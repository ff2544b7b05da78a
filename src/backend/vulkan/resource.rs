//! Buffers and textures allocated through `vk-mem`.
//!
//! Buffers are untyped: every buffer can be used as a vertex, index, indirect,
//! uniform, storage, or transfer buffer, and every buffer has a device address.
//! Command lists get back to the native buffer from a GPU address through the
//! device's address map, which is how vertex and index buffer views resolve.
use std::{
    fmt::Debug,
    ptr::NonNull,
    sync::{Arc, Mutex},
};

use ash::vk;
use vk_mem::Alloc;

use super::{conv, descriptor::TargetView, device::DeviceShared};
use crate::{
    Error, Result,
    backend::{BufferDesc, Format, HeapKind, TextureDesc},
};

pub(super) enum ResourceKind {
    Buffer {
        raw: vk::Buffer,
        size: u64,
        address: u64,
        mapped: Option<NonNull<u8>>,
    },
    Texture {
        raw: vk::Image,
        format: Format,
        extent: vk::Extent3D,
        mip_levels: u32,
        array_layers: u32,
    },
}

/// Which default image view to create.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum ViewKind {
    Sampled,
    Storage,
}

struct ResourceInner {
    shared: Arc<DeviceShared>,
    name: Option<String>,
    kind: ResourceKind,
    allocation: vk_mem::Allocation,
    views: Mutex<Vec<(ViewKind, vk::ImageView)>>,
}

unsafe impl Send for ResourceInner {}
unsafe impl Sync for ResourceInner {}

/// A buffer or texture. Clones share the native resource.
#[derive(Clone)]
pub struct VulkanResource(Arc<ResourceInner>);

impl Debug for VulkanResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("VulkanResource");
        debug.field("name", &self.0.name);
        match &self.0.kind {
            ResourceKind::Buffer { raw, size, .. } => debug.field("buffer", raw).field("size", size),
            ResourceKind::Texture { raw, format, .. } => {
                debug.field("image", raw).field("format", format)
            }
        };
        debug.finish()
    }
}

impl PartialEq for VulkanResource {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl VulkanResource {
    pub(super) fn create_buffer(shared: &Arc<DeviceShared>, desc: &BufferDesc) -> Result<Self> {
        let usage = vk::BufferUsageFlags::TRANSFER_SRC
            | vk::BufferUsageFlags::TRANSFER_DST
            | vk::BufferUsageFlags::UNIFORM_BUFFER
            | vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::VERTEX_BUFFER
            | vk::BufferUsageFlags::INDEX_BUFFER
            | vk::BufferUsageFlags::INDIRECT_BUFFER
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        let families = shared.queue_families();
        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size.max(1))
            .usage(usage)
            .sharing_mode(sharing_mode(families))
            .queue_family_indices(families);
        let allocation_info = match desc.heap {
            HeapKind::Default => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferDevice,
                ..Default::default()
            },
            HeapKind::Upload => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferDevice,
                flags: vk_mem::AllocationCreateFlags::MAPPED
                    | vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
                ..Default::default()
            },
            HeapKind::Readback => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferHost,
                flags: vk_mem::AllocationCreateFlags::MAPPED
                    | vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM,
                ..Default::default()
            },
        };
        let (raw, allocation) = unsafe {
            shared
                .allocator
                .create_buffer(&buffer_info, &allocation_info)?
        };
        let mapped = NonNull::new(shared.allocator.get_allocation_info(&allocation).mapped_data as *mut u8);
        let address = unsafe {
            shared
                .raw
                .get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(raw))
        };
        shared.register_buffer(address, raw, desc.size);
        if let Some(name) = &desc.name {
            shared.set_name(raw, name);
        }
        tracing::trace!(name = ?desc.name, size = desc.size, heap = ?desc.heap, "created buffer");
        Ok(Self(Arc::new(ResourceInner {
            shared: shared.clone(),
            name: desc.name.clone(),
            kind: ResourceKind::Buffer {
                raw,
                size: desc.size,
                address,
                mapped,
            },
            allocation,
            views: Mutex::new(Vec::new()),
        })))
    }

    /// Creates a texture and moves it into the layout of its initial state.
    pub(super) fn create_texture(shared: &Arc<DeviceShared>, desc: &TextureDesc) -> Result<Self> {
        let families = shared.queue_families();
        let extent = vk::Extent3D {
            width: desc.width,
            height: desc.height,
            depth: 1,
        };
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(conv::format(desc.format))
            .extent(extent)
            .mip_levels(desc.mip_levels.max(1) as u32)
            .array_layers(desc.array_layers.max(1) as u32)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(conv::image_usage(desc.usage))
            .sharing_mode(sharing_mode(families))
            .queue_family_indices(families)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let allocation_info = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            ..Default::default()
        };
        let (raw, allocation) = unsafe {
            shared
                .allocator
                .create_image(&image_info, &allocation_info)?
        };
        if let Some(name) = &desc.name {
            shared.set_name(raw, name);
        }
        let resource = Self(Arc::new(ResourceInner {
            shared: shared.clone(),
            name: desc.name.clone(),
            kind: ResourceKind::Texture {
                raw,
                format: desc.format,
                extent,
                mip_levels: image_info.mip_levels,
                array_layers: image_info.array_layers,
            },
            allocation,
            views: Mutex::new(Vec::new()),
        }));
        let layout = conv::state_scope(desc.initial_state).layout;
        shared.initialize_layout(raw, resource.subresource_range(), layout)?;
        tracing::trace!(name = ?desc.name, width = desc.width, height = desc.height, format = ?desc.format, "created texture");
        Ok(resource)
    }

    pub(super) fn kind(&self) -> &ResourceKind {
        &self.0.kind
    }

    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    pub fn raw_buffer(&self) -> Option<vk::Buffer> {
        match self.0.kind {
            ResourceKind::Buffer { raw, .. } => Some(raw),
            ResourceKind::Texture { .. } => None,
        }
    }

    pub fn raw_image(&self) -> Option<vk::Image> {
        match self.0.kind {
            ResourceKind::Texture { raw, .. } => Some(raw),
            ResourceKind::Buffer { .. } => None,
        }
    }

    pub(super) fn gpu_address(&self) -> u64 {
        match self.0.kind {
            ResourceKind::Buffer { address, .. } => address,
            ResourceKind::Texture { .. } => 0,
        }
    }

    pub(super) fn mapped(&self) -> Result<NonNull<u8>> {
        match self.0.kind {
            ResourceKind::Buffer {
                mapped: Some(mapped),
                ..
            } => Ok(mapped),
            _ => Err(Error::Unsupported("resource is not host visible")),
        }
    }

    /// The whole image, or an empty range for buffers.
    pub(super) fn subresource_range(&self) -> vk::ImageSubresourceRange {
        match self.0.kind {
            ResourceKind::Texture {
                format,
                mip_levels,
                array_layers,
                ..
            } => vk::ImageSubresourceRange {
                aspect_mask: conv::aspect(format),
                base_mip_level: 0,
                level_count: mip_levels,
                base_array_layer: 0,
                layer_count: array_layers,
            },
            ResourceKind::Buffer { .. } => vk::ImageSubresourceRange::default(),
        }
    }

    /// The default sampled or storage view over every subresource, created on first use.
    pub(super) fn image_view(&self, kind: ViewKind) -> Result<vk::ImageView> {
        let mut views = self.0.views.lock().unwrap();
        if let Some((_, view)) = views.iter().find(|(existing, _)| *existing == kind) {
            return Ok(*view);
        }
        let ResourceKind::Texture {
            raw,
            format,
            array_layers,
            ..
        } = self.0.kind
        else {
            return Err(Error::Unsupported("image view of a buffer"));
        };
        let mut range = self.subresource_range();
        if format.has_stencil() {
            // Sampled depth stencil views may only name one aspect.
            range.aspect_mask = vk::ImageAspectFlags::DEPTH;
        }
        let view_type = if array_layers > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        };
        let info = vk::ImageViewCreateInfo::default()
            .image(raw)
            .view_type(view_type)
            .format(conv::format(format))
            .subresource_range(range);
        let view = unsafe { self.0.shared.raw.create_image_view(&info, None)? };
        views.push((kind, view));
        Ok(view)
    }

    /// A new single-subresource view for rendering. The caller owns it.
    pub(super) fn target_view(&self) -> Result<TargetView> {
        let ResourceKind::Texture {
            raw,
            format,
            extent,
            ..
        } = self.0.kind
        else {
            return Err(Error::Unsupported("render target view of a buffer"));
        };
        let aspect = conv::aspect(format);
        let info = vk::ImageViewCreateInfo::default()
            .image(raw)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(conv::format(format))
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = unsafe { self.0.shared.raw.create_image_view(&info, None)? };
        Ok(TargetView {
            view,
            image: raw,
            format: conv::format(format),
            aspect,
            extent: vk::Extent2D {
                width: extent.width,
                height: extent.height,
            },
        })
    }
}

impl Drop for ResourceInner {
    fn drop(&mut self) {
        unsafe {
            for (_, view) in self.views.get_mut().unwrap().drain(..) {
                self.shared.raw.destroy_image_view(view, None);
            }
            match self.kind {
                ResourceKind::Buffer { raw, address, .. } => {
                    self.shared.unregister_buffer(address);
                    self.shared.allocator.destroy_buffer(raw, &mut self.allocation);
                }
                ResourceKind::Texture { raw, .. } => {
                    self.shared.allocator.destroy_image(raw, &mut self.allocation);
                }
            }
        }
    }
}

fn sharing_mode(families: &[u32]) -> vk::SharingMode {
    if families.len() > 1 {
        vk::SharingMode::CONCURRENT
    } else {
        vk::SharingMode::EXCLUSIVE
    }
}
