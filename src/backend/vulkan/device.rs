//! Logical device and the state every Vulkan object shares.
use std::{
    collections::{BTreeMap, HashMap},
    ffi::CString,
    fmt::Debug,
    mem::ManuallyDrop,
    ptr::NonNull,
    sync::{Arc, Mutex, RwLock},
};

use ash::vk;
use smallvec::SmallVec;

use super::{
    Vulkan,
    adapter::{Adapter, REQUIRED_EXTENSIONS},
    command::{VulkanCommandAllocator, VulkanCommandList},
    conv,
    descriptor::{self, TargetSlot, VulkanDescriptorHeap, write_descriptor, write_target},
    instance::{Instance, InstanceDesc},
    pipeline::VulkanRootSignature,
    resource::{ResourceKind, ViewKind, VulkanResource},
    sync::{QueueSlot, VulkanFence, VulkanQueue},
};
use crate::{
    Error, Result,
    backend::{
        BufferDesc, BufferViewDesc, CpuDescriptorHandle, DescriptorHeapDesc, DescriptorHeapType,
        GpuDescriptorHandle, QueueKind, RawDevice, SamplerDesc, TextureDesc,
    },
    root_signature::RootSignatureDesc,
};

/// Configuration for [`VulkanDevice::new`].
#[derive(Clone, Debug, Default)]
pub struct VulkanDeviceDesc {
    pub instance: InstanceDesc,
    /// Picks the first adapter whose name contains this string. The most capable
    /// adapter is used when `None`.
    pub adapter_name: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct SamplerKey {
    filter: vk::Filter,
    mipmap_mode: vk::SamplerMipmapMode,
    address_mode: vk::SamplerAddressMode,
    max_anisotropy: u32,
    mip_lod_bias: u32,
    border_color: vk::BorderColor,
}

/// A command buffer for one-off work done while creating resources.
struct SetupContext {
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
    semaphore: vk::Semaphore,
    value: u64,
}

pub(super) struct DeviceShared {
    pub raw: ash::Device,
    pub adapter: Adapter,
    pub allocator: ManuallyDrop<vk_mem::Allocator>,
    pub descriptor_buffer: ash::ext::descriptor_buffer::Device,
    debug_utils: Option<ash::ext::debug_utils::Device>,
    /// Distinct queue families in use, for concurrent sharing.
    queue_families: SmallVec<[u32; 3]>,
    queues: [QueueSlot; 3],
    pub view_set_layout: vk::DescriptorSetLayout,
    pub sampler_set_layout: vk::DescriptorSetLayout,
    increments: [u32; 4],
    /// Live buffers by device address, with their size.
    addresses: RwLock<BTreeMap<u64, (vk::Buffer, u64)>>,
    samplers: Mutex<HashMap<SamplerKey, vk::Sampler>>,
    setup: Mutex<SetupContext>,
    /// Field drops run after `Drop::drop` has destroyed the device.
    _instance: Instance,
}

impl DeviceShared {
    pub fn queue_slot(&self, kind: QueueKind) -> &QueueSlot {
        &self.queues[kind.index()]
    }

    pub fn queue_families(&self) -> &[u32] {
        &self.queue_families
    }

    pub fn increment(&self, ty: DescriptorHeapType) -> u32 {
        self.increments[ty.index()]
    }

    /// Labels `handle` in debugging tools. Does nothing without `VK_EXT_debug_utils`.
    pub fn set_name(&self, handle: impl vk::Handle, name: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };
        let info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(handle)
            .object_name(&name);
        if let Err(err) = unsafe { debug_utils.set_debug_utils_object_name(&info) } {
            tracing::warn!(%err, "failed to set object name");
        }
    }

    pub fn register_buffer(&self, address: u64, buffer: vk::Buffer, size: u64) {
        self.addresses
            .write()
            .unwrap()
            .insert(address, (buffer, size.max(1)));
    }

    pub fn unregister_buffer(&self, address: u64) {
        self.addresses.write().unwrap().remove(&address);
    }

    /// The buffer containing `address` and the offset of `address` within it.
    pub fn resolve_address(&self, address: u64) -> Option<(vk::Buffer, u64)> {
        let addresses = self.addresses.read().unwrap();
        let (&base, &(buffer, size)) = addresses.range(..=address).next_back()?;
        let offset = address - base;
        (offset < size).then_some((buffer, offset))
    }

    /// Moves a freshly created image out of the undefined layout, waiting for the GPU.
    pub fn initialize_layout(
        &self,
        image: vk::Image,
        range: vk::ImageSubresourceRange,
        layout: vk::ImageLayout,
    ) -> Result<()> {
        if layout == vk::ImageLayout::UNDEFINED {
            return Ok(());
        }
        let mut setup = self.setup.lock().unwrap();
        unsafe {
            self.raw
                .reset_command_pool(setup.pool, vk::CommandPoolResetFlags::empty())?;
            self.raw.begin_command_buffer(
                setup.buffer,
                &vk::CommandBufferBeginInfo::default()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?;
            let barrier = vk::ImageMemoryBarrier2::default()
                .src_stage_mask(vk::PipelineStageFlags2::NONE)
                .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                .dst_access_mask(vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(layout)
                .image(image)
                .subresource_range(range);
            self.raw.cmd_pipeline_barrier2(
                setup.buffer,
                &vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier)),
            );
            self.raw.end_command_buffer(setup.buffer)?;

            setup.value += 1;
            let command_buffer = vk::CommandBufferSubmitInfo {
                command_buffer: setup.buffer,
                ..Default::default()
            };
            let signal = vk::SemaphoreSubmitInfo {
                semaphore: setup.semaphore,
                value: setup.value,
                stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
                ..Default::default()
            };
            let submit = vk::SubmitInfo2::default()
                .command_buffer_infos(std::slice::from_ref(&command_buffer))
                .signal_semaphore_infos(std::slice::from_ref(&signal));
            {
                let queue = self.queue_slot(QueueKind::Direct).raw.lock().unwrap();
                self.raw
                    .queue_submit2(*queue, &[submit], vk::Fence::null())?;
            }
            self.raw.wait_semaphores(
                &vk::SemaphoreWaitInfo {
                    semaphore_count: 1,
                    p_semaphores: &setup.semaphore,
                    p_values: &setup.value,
                    ..Default::default()
                },
                u64::MAX,
            )?;
        }
        Ok(())
    }

    /// Samplers are deduplicated and live as long as the device.
    pub fn sampler(&self, desc: &SamplerDesc) -> Result<vk::Sampler> {
        let (filter, mipmap_mode) = conv::filter(desc.filter);
        let anisotropic =
            desc.filter == crate::backend::Filter::Anisotropic && self.adapter.sampler_anisotropy;
        let key = SamplerKey {
            filter,
            mipmap_mode,
            address_mode: conv::address_mode(desc.address_mode),
            max_anisotropy: if anisotropic {
                let limit = (self.adapter.limits.max_sampler_anisotropy as u32).max(1);
                desc.max_anisotropy.clamp(1, limit)
            } else {
                1
            },
            mip_lod_bias: desc.mip_lod_bias.to_bits(),
            border_color: conv::border_color(desc.border_color),
        };
        let mut samplers = self.samplers.lock().unwrap();
        if let Some(sampler) = samplers.get(&key) {
            return Ok(*sampler);
        }
        let info = vk::SamplerCreateInfo::default()
            .mag_filter(key.filter)
            .min_filter(key.filter)
            .mipmap_mode(key.mipmap_mode)
            .address_mode_u(key.address_mode)
            .address_mode_v(key.address_mode)
            .address_mode_w(key.address_mode)
            .mip_lod_bias(desc.mip_lod_bias)
            .anisotropy_enable(key.max_anisotropy > 1)
            .max_anisotropy(key.max_anisotropy as f32)
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE)
            .border_color(key.border_color);
        let sampler = unsafe { self.raw.create_sampler(&info, None)? };
        samplers.insert(key, sampler);
        tracing::debug!(?desc, total = samplers.len(), "created sampler");
        Ok(sampler)
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        unsafe {
            if let Err(err) = self.raw.device_wait_idle() {
                tracing::error!(%err, "device_wait_idle failed during teardown");
            }
            for (_, sampler) in self.samplers.get_mut().unwrap().drain() {
                self.raw.destroy_sampler(sampler, None);
            }
            self.raw
                .destroy_descriptor_set_layout(self.view_set_layout, None);
            self.raw
                .destroy_descriptor_set_layout(self.sampler_set_layout, None);
            let setup = self.setup.get_mut().unwrap();
            self.raw.destroy_command_pool(setup.pool, None);
            self.raw.destroy_semaphore(setup.semaphore, None);
            ManuallyDrop::drop(&mut self.allocator);
            self.raw.destroy_device(None);
        }
    }
}

/// A Vulkan logical device. Clones share the device.
#[derive(Clone)]
pub struct VulkanDevice(Arc<DeviceShared>);

impl Debug for VulkanDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanDevice")
            .field("adapter", &self.0.adapter.name)
            .field("queue_families", &self.0.queue_families)
            .finish_non_exhaustive()
    }
}

impl VulkanDevice {
    /// Creates an instance and a device on the best matching adapter.
    pub fn new(desc: &VulkanDeviceDesc) -> Result<Self> {
        let instance = Instance::new(&desc.instance)?;
        let adapter = Adapter::enumerate(&instance)?
            .into_iter()
            .find(|adapter| {
                desc.adapter_name
                    .as_deref()
                    .is_none_or(|name| adapter.name.contains(name))
            })
            .ok_or(Error::Unsupported("no adapter supports descriptor buffers and Vulkan 1.3"))?;
        tracing::info!(
            adapter = adapter.name,
            device_type = ?adapter.device_type,
            view_descriptor_size = adapter.descriptor_sizes.view,
            "selected adapter"
        );

        let mut families: [u32; 3] = [0; 3];
        for kind in QueueKind::ALL {
            families[kind.index()] = adapter
                .queue_family(kind)
                .ok_or(Error::Unsupported("adapter has no suitable queue family"))?;
        }
        let mut queue_families: SmallVec<[u32; 3]> = SmallVec::new();
        for family in families {
            if !queue_families.contains(&family) {
                queue_families.push(family);
            }
        }
        let priorities = [1.0f32];
        let queue_infos: SmallVec<[vk::DeviceQueueCreateInfo; 3]> = queue_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
            })
            .collect();

        let mut extensions: Vec<*const std::ffi::c_char> =
            REQUIRED_EXTENSIONS.iter().map(|name| name.as_ptr()).collect();
        if cfg!(target_os = "macos") {
            extensions.push(ash::khr::portability_subset::NAME.as_ptr());
        }
        let mut v12 = vk::PhysicalDeviceVulkan12Features::default()
            .timeline_semaphore(true)
            .buffer_device_address(true);
        let mut v13 = vk::PhysicalDeviceVulkan13Features::default()
            .synchronization2(true)
            .dynamic_rendering(true);
        let mut descriptor_buffer_features =
            vk::PhysicalDeviceDescriptorBufferFeaturesEXT::default().descriptor_buffer(true);
        let mut mutable_features =
            vk::PhysicalDeviceMutableDescriptorTypeFeaturesEXT::default()
                .mutable_descriptor_type(true);
        let features = vk::PhysicalDeviceFeatures {
            sampler_anisotropy: adapter.sampler_anisotropy.into(),
            ..Default::default()
        };
        let info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features)
            .push_next(&mut v12)
            .push_next(&mut v13)
            .push_next(&mut descriptor_buffer_features)
            .push_next(&mut mutable_features);
        let raw = unsafe { instance.raw.create_device(adapter.raw, &info, None)? };

        let mut allocator_info = vk_mem::AllocatorCreateInfo::new(&instance.raw, &raw, adapter.raw);
        allocator_info.vulkan_api_version = vk::API_VERSION_1_3;
        allocator_info.flags |= vk_mem::AllocatorCreateFlags::BUFFER_DEVICE_ADDRESS;
        let allocator = match unsafe { vk_mem::Allocator::new(allocator_info) } {
            Ok(allocator) => allocator,
            Err(err) => {
                unsafe { raw.destroy_device(None) };
                return Err(err.into());
            }
        };

        let queues = QueueKind::ALL.map(|kind| {
            let family = families[kind.index()];
            QueueSlot {
                family,
                index: 0,
                raw: Arc::new(Mutex::new(vk::Queue::null())),
            }
        });
        let mut shared = DeviceShared {
            descriptor_buffer: ash::ext::descriptor_buffer::Device::new(&instance.raw, &raw),
            debug_utils: instance
                .has_debug_utils()
                .then(|| ash::ext::debug_utils::Device::new(&instance.raw, &raw)),
            increments: [
                adapter.descriptor_sizes.view,
                adapter.descriptor_sizes.sampler,
                size_of::<TargetSlot>() as u32,
                size_of::<TargetSlot>() as u32,
            ],
            raw,
            adapter,
            allocator: ManuallyDrop::new(allocator),
            queue_families,
            queues,
            view_set_layout: vk::DescriptorSetLayout::null(),
            sampler_set_layout: vk::DescriptorSetLayout::null(),
            addresses: RwLock::new(BTreeMap::new()),
            samplers: Mutex::new(HashMap::new()),
            setup: Mutex::new(SetupContext {
                pool: vk::CommandPool::null(),
                buffer: vk::CommandBuffer::null(),
                semaphore: vk::Semaphore::null(),
                value: 0,
            }),
            _instance: instance,
        };
        // From here on, dropping `shared` cleans up whatever was created.
        shared.create_queues();
        shared.create_set_layouts()?;
        shared.create_setup_context()?;
        Ok(Self(Arc::new(shared)))
    }

    pub(super) fn shared(&self) -> &Arc<DeviceShared> {
        &self.0
    }

    pub fn adapter_name(&self) -> &str {
        &self.0.adapter.name
    }

    pub fn raw(&self) -> &ash::Device {
        &self.0.raw
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.0.raw.device_wait_idle()? };
        Ok(())
    }
}

impl DeviceShared {
    /// One queue per family. Kinds mapped to the same family share it.
    fn create_queues(&mut self) {
        let mut created: SmallVec<[QueueSlot; 3]> = SmallVec::new();
        for kind in QueueKind::ALL {
            let family = self.queues[kind.index()].family;
            let slot = match created.iter().find(|slot| slot.family == family) {
                Some(slot) => slot.clone(),
                None => {
                    let raw = unsafe { self.raw.get_device_queue(family, 0) };
                    let slot = QueueSlot {
                        family,
                        index: 0,
                        raw: Arc::new(Mutex::new(raw)),
                    };
                    created.push(slot.clone());
                    slot
                }
            };
            self.queues[kind.index()] = slot;
        }
    }

    fn create_set_layouts(&mut self) -> Result<()> {
        let view_types = [
            vk::DescriptorType::SAMPLED_IMAGE,
            vk::DescriptorType::STORAGE_IMAGE,
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::DescriptorType::STORAGE_BUFFER,
        ];
        let mutable_lists =
            [vk::MutableDescriptorTypeListEXT::default().descriptor_types(&view_types)];
        let mut mutable_info =
            vk::MutableDescriptorTypeCreateInfoEXT::default().mutable_descriptor_type_lists(&mutable_lists);
        let view_binding = vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::MUTABLE_EXT)
            .descriptor_count(self.adapter.descriptor_sizes.view_heap_capacity)
            .stage_flags(vk::ShaderStageFlags::ALL);
        let view_info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::DESCRIPTOR_BUFFER_EXT)
            .bindings(std::slice::from_ref(&view_binding))
            .push_next(&mut mutable_info);
        self.view_set_layout = unsafe { self.raw.create_descriptor_set_layout(&view_info, None)? };

        let sampler_binding = vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::SAMPLER)
            .descriptor_count(self.adapter.descriptor_sizes.sampler_heap_capacity)
            .stage_flags(vk::ShaderStageFlags::ALL);
        let sampler_info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::DESCRIPTOR_BUFFER_EXT)
            .bindings(std::slice::from_ref(&sampler_binding));
        self.sampler_set_layout =
            unsafe { self.raw.create_descriptor_set_layout(&sampler_info, None)? };
        Ok(())
    }

    fn create_setup_context(&mut self) -> Result<()> {
        let family = self.queue_slot(QueueKind::Direct).family;
        let setup = self.setup.get_mut().unwrap();
        unsafe {
            setup.pool = self.raw.create_command_pool(
                &vk::CommandPoolCreateInfo::default()
                    .flags(vk::CommandPoolCreateFlags::TRANSIENT)
                    .queue_family_index(family),
                None,
            )?;
            setup.buffer = self
                .raw
                .allocate_command_buffers(
                    &vk::CommandBufferAllocateInfo::default()
                        .command_pool(setup.pool)
                        .level(vk::CommandBufferLevel::PRIMARY)
                        .command_buffer_count(1),
                )?
                .pop()
                .ok_or(Error::OutOfMemory)?;
            let mut type_info = vk::SemaphoreTypeCreateInfo {
                semaphore_type: vk::SemaphoreType::TIMELINE,
                initial_value: 0,
                ..Default::default()
            };
            setup.semaphore = self.raw.create_semaphore(
                &vk::SemaphoreCreateInfo::default().push_next(&mut type_info),
                None,
            )?;
        }
        Ok(())
    }
}

impl VulkanDevice {
    unsafe fn write_buffer_view(
        &self,
        resource: &VulkanResource,
        ty: vk::DescriptorType,
        range: std::ops::Range<u64>,
        dest: CpuDescriptorHandle,
    ) {
        let sizes = &self.0.adapter.descriptor_sizes;
        let address = resource.gpu_address();
        let info = vk::DescriptorAddressInfoEXT::default()
            .address(address + range.start)
            .range(range.end - range.start)
            .format(vk::Format::UNDEFINED);
        let (data, size) = match ty {
            vk::DescriptorType::UNIFORM_BUFFER => (
                vk::DescriptorDataEXT {
                    p_uniform_buffer: &info,
                },
                sizes.uniform_buffer,
            ),
            _ => (
                vk::DescriptorDataEXT {
                    p_storage_buffer: &info,
                },
                sizes.storage_buffer,
            ),
        };
        unsafe { write_descriptor(&self.0, ty, data, size, sizes.view, dest) };
    }

    unsafe fn write_image_view(&self, resource: &VulkanResource, kind: ViewKind, dest: CpuDescriptorHandle) {
        let view = match resource.image_view(kind) {
            Ok(view) => view,
            Err(err) => {
                tracing::error!(%err, ?resource, ?kind, "failed to create image view");
                return;
            }
        };
        let sizes = &self.0.adapter.descriptor_sizes;
        let (layout, ty, size) = match kind {
            ViewKind::Sampled => (
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::DescriptorType::SAMPLED_IMAGE,
                sizes.sampled_image,
            ),
            ViewKind::Storage => (
                vk::ImageLayout::GENERAL,
                vk::DescriptorType::STORAGE_IMAGE,
                sizes.storage_image,
            ),
        };
        let info = vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: view,
            image_layout: layout,
        };
        let data = match kind {
            ViewKind::Sampled => vk::DescriptorDataEXT {
                p_sampled_image: &info,
            },
            ViewKind::Storage => vk::DescriptorDataEXT {
                p_storage_image: &info,
            },
        };
        unsafe { write_descriptor(&self.0, ty, data, size, sizes.view, dest) };
    }

    unsafe fn write_target_view(&self, resource: &VulkanResource, dest: CpuDescriptorHandle) {
        match resource.target_view() {
            Ok(target) => unsafe { write_target(&self.0, dest, target) },
            Err(err) => tracing::error!(%err, ?resource, "failed to create target view"),
        }
    }
}

impl RawDevice<Vulkan> for VulkanDevice {
    fn create_queue(&self, kind: QueueKind) -> Result<VulkanQueue> {
        Ok(VulkanQueue::new(self.0.clone(), kind))
    }

    fn create_fence(&self, initial_value: u64) -> Result<VulkanFence> {
        VulkanFence::new(self.0.clone(), initial_value)
    }

    fn completed_fence_value(&self, fence: &VulkanFence) -> Result<u64> {
        fence.completed_value()
    }

    fn wait_for_fence(&self, fence: &VulkanFence, value: u64) -> Result<()> {
        fence.wait(value)
    }

    fn create_command_allocator(&self, kind: QueueKind) -> Result<VulkanCommandAllocator> {
        VulkanCommandAllocator::new(self.0.clone(), kind)
    }

    unsafe fn reset_command_allocator(&self, allocator: &mut VulkanCommandAllocator) -> Result<()> {
        unsafe { allocator.reset() }
    }

    fn create_command_list(
        &self,
        kind: QueueKind,
        allocator: &VulkanCommandAllocator,
    ) -> Result<VulkanCommandList> {
        VulkanCommandList::new(self.0.clone(), kind, allocator)
    }

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> Result<VulkanDescriptorHeap> {
        VulkanDescriptorHeap::new(self.0.clone(), desc)
    }

    fn descriptor_heap_start(
        &self,
        heap: &VulkanDescriptorHeap,
    ) -> (CpuDescriptorHandle, GpuDescriptorHandle) {
        heap.start()
    }

    fn descriptor_increment_size(&self, ty: DescriptorHeapType) -> u32 {
        self.0.increment(ty)
    }

    unsafe fn copy_descriptors(
        &self,
        dst: &[(CpuDescriptorHandle, u32)],
        src: &[(CpuDescriptorHandle, u32)],
        ty: DescriptorHeapType,
    ) {
        match ty {
            DescriptorHeapType::CbvSrvUav | DescriptorHeapType::Sampler => unsafe {
                descriptor::copy_descriptors(self.0.increment(ty), dst, src)
            },
            DescriptorHeapType::Rtv | DescriptorHeapType::Dsv => {
                tracing::error!(?ty, "render target descriptors cannot be copied");
            }
        }
    }

    unsafe fn copy_descriptors_simple(
        &self,
        count: u32,
        dst: CpuDescriptorHandle,
        src: CpuDescriptorHandle,
        ty: DescriptorHeapType,
    ) {
        unsafe { self.copy_descriptors(&[(dst, count)], &[(src, count)], ty) };
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<VulkanResource> {
        VulkanResource::create_buffer(&self.0, desc)
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<VulkanResource> {
        VulkanResource::create_texture(&self.0, desc)
    }

    fn buffer_gpu_address(&self, buffer: &VulkanResource) -> u64 {
        buffer.gpu_address()
    }

    fn map_buffer(&self, buffer: &VulkanResource) -> Result<NonNull<u8>> {
        buffer.mapped()
    }

    unsafe fn create_render_target_view(&self, resource: &VulkanResource, dest: CpuDescriptorHandle) {
        unsafe { self.write_target_view(resource, dest) };
    }

    unsafe fn create_depth_stencil_view(&self, resource: &VulkanResource, dest: CpuDescriptorHandle) {
        unsafe { self.write_target_view(resource, dest) };
    }

    unsafe fn create_shader_resource_view(
        &self,
        resource: &VulkanResource,
        view: Option<&BufferViewDesc>,
        dest: CpuDescriptorHandle,
    ) {
        match resource.kind() {
            ResourceKind::Buffer { size, .. } => unsafe {
                let range = view.map_or(0..*size, BufferViewDesc::byte_range);
                self.write_buffer_view(resource, vk::DescriptorType::STORAGE_BUFFER, range, dest)
            },
            ResourceKind::Texture { .. } => unsafe {
                self.write_image_view(resource, ViewKind::Sampled, dest)
            },
        }
    }

    unsafe fn create_unordered_access_view(
        &self,
        resource: &VulkanResource,
        view: Option<&BufferViewDesc>,
        dest: CpuDescriptorHandle,
    ) {
        match resource.kind() {
            ResourceKind::Buffer { size, .. } => unsafe {
                let range = view.map_or(0..*size, BufferViewDesc::byte_range);
                self.write_buffer_view(resource, vk::DescriptorType::STORAGE_BUFFER, range, dest)
            },
            ResourceKind::Texture { .. } => unsafe {
                self.write_image_view(resource, ViewKind::Storage, dest)
            },
        }
    }

    unsafe fn create_constant_buffer_view(
        &self,
        buffer: &VulkanResource,
        offset: u64,
        size: u32,
        dest: CpuDescriptorHandle,
    ) {
        unsafe {
            self.write_buffer_view(
                buffer,
                vk::DescriptorType::UNIFORM_BUFFER,
                offset..offset + size as u64,
                dest,
            )
        };
    }

    unsafe fn create_sampler(&self, desc: &SamplerDesc, dest: CpuDescriptorHandle) {
        let sampler = match self.0.sampler(desc) {
            Ok(sampler) => sampler,
            Err(err) => {
                tracing::error!(%err, ?desc, "failed to create sampler");
                return;
            }
        };
        let size = self.0.adapter.descriptor_sizes.sampler;
        let data = vk::DescriptorDataEXT {
            p_sampler: &sampler,
        };
        unsafe { write_descriptor(&self.0, vk::DescriptorType::SAMPLER, data, size, size, dest) };
    }

    fn create_root_signature(&self, desc: &RootSignatureDesc) -> Result<VulkanRootSignature> {
        VulkanRootSignature::new(&self.0, desc)
    }
}
