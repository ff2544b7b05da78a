//! Resource wrappers with tracked state and persistent views.
//!
//! Each wrapper owns a [`GpuResource`] and the CPU descriptors of the views it is
//! commonly bound through. Views live in the manager's
//! [`DescriptorAllocator`](crate::descriptor::DescriptorAllocator)s and stay valid until
//! [`CommandListManager::destroy_all_descriptor_allocators`].
//!
//! Command list methods that transition resources take any [`TrackedResource`], so a
//! wrapper and a bare [`GpuResource`] are used the same way.
use glam::UVec2;

use crate::{
    Result,
    backend::{
        Api, BufferDesc, BufferViewDesc, CpuDescriptorHandle, DescriptorHeapType, Format,
        HeapKind, IndexBufferView, IndexFormat, RawDevice, TextureDesc, TextureUsage,
        VertexBufferView,
    },
    manager::CommandListManager,
    tracking::{GpuResource, ResourceStates},
};

/// Anything that owns a [`GpuResource`].
pub trait TrackedResource<A: Api> {
    fn gpu_resource(&self) -> &GpuResource<A>;
    fn gpu_resource_mut(&mut self) -> &mut GpuResource<A>;
}

impl<A: Api> TrackedResource<A> for GpuResource<A> {
    fn gpu_resource(&self) -> &GpuResource<A> {
        self
    }
    fn gpu_resource_mut(&mut self) -> &mut GpuResource<A> {
        self
    }
}

macro_rules! tracked_resource {
    ($ty:ident) => {
        impl<A: Api> TrackedResource<A> for $ty<A> {
            fn gpu_resource(&self) -> &GpuResource<A> {
                &self.resource
            }
            fn gpu_resource_mut(&mut self) -> &mut GpuResource<A> {
                &mut self.resource
            }
        }
    };
}

/// A device-local buffer of fixed-size elements with structured SRV and UAV views.
#[derive(Debug)]
pub struct GpuBuffer<A: Api> {
    resource: GpuResource<A>,
    element_count: u32,
    element_size: u32,
    srv: CpuDescriptorHandle,
    uav: CpuDescriptorHandle,
}
tracked_resource!(GpuBuffer);

impl<A: Api> GpuBuffer<A> {
    /// Creates the buffer in `COMMON` state. With `initial_data`, the data is uploaded and
    /// the buffer is left in `GENERIC_READ`.
    pub fn new(
        manager: &CommandListManager<A>,
        name: &str,
        element_count: u32,
        element_size: u32,
        initial_data: Option<&[u8]>,
    ) -> Result<Self> {
        let device = manager.device();
        let size = element_count as u64 * element_size as u64;
        let raw = device.create_buffer(&BufferDesc {
            size,
            heap: HeapKind::Default,
            allow_unordered_access: true,
            initial_state: ResourceStates::COMMON,
            name: Some(name.to_owned()),
        })?;
        let gpu_address = device.buffer_gpu_address(&raw);

        let view = BufferViewDesc {
            first_element: 0,
            num_elements: element_count,
            stride: element_size,
        };
        let srv = manager.allocate_descriptor(DescriptorHeapType::CbvSrvUav, 1)?;
        let uav = manager.allocate_descriptor(DescriptorHeapType::CbvSrvUav, 1)?;
        unsafe {
            device.create_shader_resource_view(&raw, Some(&view), srv);
            device.create_unordered_access_view(&raw, Some(&view), uav);
        }

        let mut buffer = Self {
            resource: GpuResource::from_raw(raw, ResourceStates::COMMON, gpu_address),
            element_count,
            element_size,
            srv,
            uav,
        };
        if let Some(data) = initial_data {
            manager.initialize_buffer(&mut buffer, data, 0)?;
        }
        Ok(buffer)
    }

    pub fn size(&self) -> u64 {
        self.element_count as u64 * self.element_size as u64
    }

    pub fn element_count(&self) -> u32 {
        self.element_count
    }

    pub fn element_size(&self) -> u32 {
        self.element_size
    }

    pub fn gpu_address(&self) -> u64 {
        self.resource.gpu_address()
    }

    pub fn srv(&self) -> CpuDescriptorHandle {
        self.srv
    }

    pub fn uav(&self) -> CpuDescriptorHandle {
        self.uav
    }

    pub fn vertex_buffer_view(&self, offset: u64, size: u32, stride: u32) -> VertexBufferView {
        VertexBufferView {
            gpu_address: self.gpu_address() + offset,
            size_in_bytes: size,
            stride_in_bytes: stride,
        }
    }

    /// A vertex buffer view over the whole buffer, one vertex per element.
    pub fn vertex_buffer_view_all(&self) -> VertexBufferView {
        self.vertex_buffer_view(0, self.size() as u32, self.element_size)
    }

    pub fn index_buffer_view(&self, offset: u64, size: u32, format: IndexFormat) -> IndexBufferView {
        IndexBufferView {
            gpu_address: self.gpu_address() + offset,
            size_in_bytes: size,
            format,
        }
    }

    /// An index buffer view over the whole buffer. Elements must be 2 or 4 bytes.
    pub fn index_buffer_view_all(&self) -> IndexBufferView {
        let format = match self.element_size {
            2 => IndexFormat::U16,
            4 => IndexFormat::U32,
            other => panic!("{other}-byte elements cannot be used as indices"),
        };
        self.index_buffer_view(0, self.size() as u32, format)
    }

    /// Creates a constant buffer view over `size` bytes at `offset`.
    pub fn create_constant_buffer_view(
        &self,
        manager: &CommandListManager<A>,
        offset: u64,
        size: u32,
    ) -> Result<CpuDescriptorHandle> {
        let handle = manager.allocate_descriptor(DescriptorHeapType::CbvSrvUav, 1)?;
        unsafe {
            manager.device().create_constant_buffer_view(
                self.resource.raw(),
                offset,
                size.next_multiple_of(256),
                handle,
            );
        }
        Ok(handle)
    }
}

/// A 2D render target with RTV, SRV and optional UAV views.
#[derive(Debug)]
pub struct ColorBuffer<A: Api> {
    resource: GpuResource<A>,
    size: UVec2,
    format: Format,
    clear_color: [f32; 4],
    rtv: CpuDescriptorHandle,
    srv: CpuDescriptorHandle,
    uav: Option<CpuDescriptorHandle>,
}
tracked_resource!(ColorBuffer);

impl<A: Api> ColorBuffer<A> {
    /// Creates the texture in `COMMON` state, which is also the presentable state.
    pub fn new(
        manager: &CommandListManager<A>,
        name: &str,
        size: UVec2,
        format: Format,
        clear_color: [f32; 4],
        unordered_access: bool,
    ) -> Result<Self> {
        assert!(!format.is_depth(), "{format:?} is a depth format");
        let device = manager.device();
        let mut usage = TextureUsage::RENDER_TARGET | TextureUsage::SHADER_RESOURCE;
        usage.set(TextureUsage::UNORDERED_ACCESS, unordered_access);
        let raw = device.create_texture(&TextureDesc {
            width: size.x,
            height: size.y,
            array_layers: 1,
            mip_levels: 1,
            format,
            usage,
            initial_state: ResourceStates::COMMON,
            name: Some(name.to_owned()),
        })?;

        let rtv = manager.allocate_descriptor(DescriptorHeapType::Rtv, 1)?;
        let srv = manager.allocate_descriptor(DescriptorHeapType::CbvSrvUav, 1)?;
        let uav = if unordered_access {
            Some(manager.allocate_descriptor(DescriptorHeapType::CbvSrvUav, 1)?)
        } else {
            None
        };
        unsafe {
            device.create_render_target_view(&raw, rtv);
            device.create_shader_resource_view(&raw, None, srv);
            if let Some(uav) = uav {
                device.create_unordered_access_view(&raw, None, uav);
            }
        }
        Ok(Self {
            resource: GpuResource::from_raw(raw, ResourceStates::COMMON, 0),
            size,
            format,
            clear_color,
            rtv,
            srv,
            uav,
        })
    }

    pub fn size(&self) -> UVec2 {
        self.size
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn clear_color(&self) -> [f32; 4] {
        self.clear_color
    }

    pub fn set_clear_color(&mut self, color: [f32; 4]) {
        self.clear_color = color;
    }

    pub fn rtv(&self) -> CpuDescriptorHandle {
        self.rtv
    }

    pub fn srv(&self) -> CpuDescriptorHandle {
        self.srv
    }

    pub fn uav(&self) -> Option<CpuDescriptorHandle> {
        self.uav
    }
}

/// A depth(-stencil) target with its DSV.
#[derive(Debug)]
pub struct DepthBuffer<A: Api> {
    resource: GpuResource<A>,
    size: UVec2,
    format: Format,
    clear_depth: f32,
    clear_stencil: u8,
    dsv: CpuDescriptorHandle,
}
tracked_resource!(DepthBuffer);

impl<A: Api> DepthBuffer<A> {
    pub fn new(
        manager: &CommandListManager<A>,
        name: &str,
        size: UVec2,
        format: Format,
        clear_depth: f32,
        clear_stencil: u8,
    ) -> Result<Self> {
        assert!(format.is_depth(), "{format:?} is not a depth format");
        let device = manager.device();
        let raw = device.create_texture(&TextureDesc {
            width: size.x,
            height: size.y,
            array_layers: 1,
            mip_levels: 1,
            format,
            usage: TextureUsage::DEPTH_STENCIL,
            initial_state: ResourceStates::DEPTH_WRITE,
            name: Some(name.to_owned()),
        })?;
        let dsv = manager.allocate_descriptor(DescriptorHeapType::Dsv, 1)?;
        unsafe { device.create_depth_stencil_view(&raw, dsv) };
        Ok(Self {
            resource: GpuResource::from_raw(raw, ResourceStates::DEPTH_WRITE, 0),
            size,
            format,
            clear_depth,
            clear_stencil,
            dsv,
        })
    }

    pub fn size(&self) -> UVec2 {
        self.size
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn has_stencil(&self) -> bool {
        self.format.has_stencil()
    }

    pub fn clear_depth(&self) -> f32 {
        self.clear_depth
    }

    pub fn clear_stencil(&self) -> u8 {
        self.clear_stencil
    }

    pub fn dsv(&self) -> CpuDescriptorHandle {
        self.dsv
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Device,
        backend::headless::{Descriptor, Headless, HeadlessDevice},
        config::ManagerConfig,
    };

    fn manager() -> (HeadlessDevice, CommandListManager<Headless>) {
        let raw = HeadlessDevice::default();
        let manager =
            CommandListManager::new(Device::<Headless>::new(raw.clone()), ManagerConfig::default())
                .unwrap();
        (raw, manager)
    }

    #[test]
    fn test_buffer_views() {
        let (raw, manager) = manager();
        let buffer = GpuBuffer::new(&manager, "particles", 16, 32, None).unwrap();
        assert_eq!(buffer.size(), 512);
        assert_eq!(buffer.gpu_resource().usage_state(), ResourceStates::COMMON);
        assert!(matches!(
            raw.descriptor(buffer.uav()),
            Descriptor::UnorderedAccess { view: Some(BufferViewDesc { stride: 32, .. }), .. }
        ));
        let vbv = buffer.vertex_buffer_view_all();
        assert_eq!(vbv.stride_in_bytes, 32);
        assert_eq!(vbv.gpu_address, buffer.gpu_address());
    }

    #[test]
    fn test_buffer_initial_data_is_uploaded() {
        let (_, manager) = manager();
        let data: Vec<u8> = (0..64).collect();
        let buffer = GpuBuffer::new(&manager, "lut", 16, 4, Some(&data)).unwrap();
        assert_eq!(buffer.gpu_resource().usage_state(), ResourceStates::GENERIC_READ);
        assert_eq!(buffer.gpu_resource().raw().read_bytes(0..64), data);
    }

    #[test]
    fn test_color_buffer_starts_presentable() {
        let (raw, manager) = manager();
        let target = ColorBuffer::new(
            &manager,
            "scene",
            UVec2::new(64, 32),
            Format::R8G8B8A8Unorm,
            [0.0, 0.0, 0.0, 1.0],
            true,
        )
        .unwrap();
        assert_eq!(target.gpu_resource().usage_state(), ResourceStates::PRESENT);
        assert!(target.uav().is_some());
        assert_eq!(
            raw.descriptor(target.rtv()),
            Descriptor::RenderTarget {
                resource: target.gpu_resource().raw().id()
            }
        );
    }
}
