//! Physical device selection.
//!
//! An adapter qualifies when it runs Vulkan 1.3 and supports descriptor buffers with
//! mutable descriptors, timeline semaphores, buffer device addresses,
//! synchronization2 and dynamic rendering. Everything else is optional.
use std::ffi::CStr;

use ash::vk;

use super::instance::Instance;
use crate::{Result, backend::QueueKind};

pub(super) const REQUIRED_EXTENSIONS: [&CStr; 2] = [
    ash::ext::descriptor_buffer::NAME,
    ash::ext::mutable_descriptor_type::NAME,
];

/// Upper bound on descriptors reachable through one bound view heap.
const MAX_VIEW_HEAP_DESCRIPTORS: u64 = 1_000_000;
/// Upper bound on samplers reachable through one bound sampler heap.
const MAX_SAMPLER_HEAP_DESCRIPTORS: u64 = 2048;

/// Descriptor sizes of the adapter, in bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct DescriptorSizes {
    pub sampler: u32,
    pub sampled_image: u32,
    pub storage_image: u32,
    pub uniform_buffer: u32,
    pub storage_buffer: u32,
    /// Stride of a mutable view descriptor: the largest of the view sizes.
    pub view: u32,
    pub view_heap_capacity: u32,
    pub sampler_heap_capacity: u32,
}

impl DescriptorSizes {
    fn new(properties: &vk::PhysicalDeviceDescriptorBufferPropertiesEXT<'_>) -> Self {
        let view = [
            properties.sampled_image_descriptor_size,
            properties.storage_image_descriptor_size,
            properties.uniform_buffer_descriptor_size,
            properties.storage_buffer_descriptor_size,
        ]
        .into_iter()
        .max()
        .unwrap_or_default() as u32;
        let sampler = properties.sampler_descriptor_size as u32;
        let view_heap_capacity = (properties.max_resource_descriptor_buffer_range
            / view.max(1) as u64)
            .min(MAX_VIEW_HEAP_DESCRIPTORS) as u32;
        let sampler_heap_capacity = (properties.max_sampler_descriptor_buffer_range
            / sampler.max(1) as u64)
            .min(MAX_SAMPLER_HEAP_DESCRIPTORS) as u32;
        Self {
            sampler,
            sampled_image: properties.sampled_image_descriptor_size as u32,
            storage_image: properties.storage_image_descriptor_size as u32,
            uniform_buffer: properties.uniform_buffer_descriptor_size as u32,
            storage_buffer: properties.storage_buffer_descriptor_size as u32,
            view,
            view_heap_capacity,
            sampler_heap_capacity,
        }
    }
}

pub(super) struct Adapter {
    pub raw: vk::PhysicalDevice,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub limits: vk::PhysicalDeviceLimits,
    pub descriptor_sizes: DescriptorSizes,
    pub queue_families: Vec<vk::QueueFamilyProperties>,
    pub sampler_anisotropy: bool,
}

impl Adapter {
    /// Every adapter that meets the requirements, most capable first.
    pub fn enumerate(instance: &Instance) -> Result<Vec<Adapter>> {
        let devices = unsafe { instance.raw.enumerate_physical_devices()? };
        let mut adapters = Vec::with_capacity(devices.len());
        for raw in devices {
            if let Some(adapter) = Adapter::query(instance, raw)? {
                adapters.push(adapter);
            }
        }
        adapters.sort_by_key(|adapter| match adapter.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 0,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
            _ => 3,
        });
        Ok(adapters)
    }

    fn query(instance: &Instance, raw: vk::PhysicalDevice) -> Result<Option<Adapter>> {
        let properties = unsafe { instance.raw.get_physical_device_properties(raw) };
        let name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        if properties.api_version < vk::API_VERSION_1_3 {
            tracing::debug!(adapter = name, "skipping adapter without Vulkan 1.3");
            return Ok(None);
        }

        let extensions = unsafe { instance.raw.enumerate_device_extension_properties(raw)? };
        for required in REQUIRED_EXTENSIONS {
            if !extensions
                .iter()
                .any(|ext| ext.extension_name_as_c_str().is_ok_and(|ext| ext == required))
            {
                tracing::debug!(adapter = name, extension = ?required, "skipping adapter");
                return Ok(None);
            }
        }

        let mut v12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut v13 = vk::PhysicalDeviceVulkan13Features::default();
        let mut descriptor_buffer = vk::PhysicalDeviceDescriptorBufferFeaturesEXT::default();
        let mut mutable = vk::PhysicalDeviceMutableDescriptorTypeFeaturesEXT::default();
        let mut features = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut v12)
            .push_next(&mut v13)
            .push_next(&mut descriptor_buffer)
            .push_next(&mut mutable);
        unsafe { instance.raw.get_physical_device_features2(raw, &mut features) };
        let sampler_anisotropy = features.features.sampler_anisotropy == vk::TRUE;
        let supported = v12.timeline_semaphore == vk::TRUE
            && v12.buffer_device_address == vk::TRUE
            && v13.synchronization2 == vk::TRUE
            && v13.dynamic_rendering == vk::TRUE
            && descriptor_buffer.descriptor_buffer == vk::TRUE
            && mutable.mutable_descriptor_type == vk::TRUE;
        if !supported {
            tracing::debug!(adapter = name, "skipping adapter with missing features");
            return Ok(None);
        }

        let mut descriptor_buffer = vk::PhysicalDeviceDescriptorBufferPropertiesEXT::default();
        let mut properties2 =
            vk::PhysicalDeviceProperties2::default().push_next(&mut descriptor_buffer);
        unsafe { instance.raw.get_physical_device_properties2(raw, &mut properties2) };
        let descriptor_sizes = DescriptorSizes::new(&descriptor_buffer);

        let queue_families =
            unsafe { instance.raw.get_physical_device_queue_family_properties(raw) };
        Ok(Some(Adapter {
            raw,
            name,
            device_type: properties.device_type,
            limits: properties.limits,
            descriptor_sizes,
            queue_families,
            sampler_anisotropy,
        }))
    }

    /// The least capable queue family able to run queues of `kind`.
    ///
    /// Graphics and compute families implicitly support transfer, so a device without
    /// a dedicated transfer family still gets a copy queue.
    pub fn queue_family(&self, kind: QueueKind) -> Option<u32> {
        queue_family(&self.queue_families, kind)
    }
}

pub(super) fn queue_family(families: &[vk::QueueFamilyProperties], kind: QueueKind) -> Option<u32> {
    let required = match kind {
        QueueKind::Direct => vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
        QueueKind::Compute => vk::QueueFlags::COMPUTE,
        QueueKind::Copy => vk::QueueFlags::TRANSFER,
    };
    families
        .iter()
        .enumerate()
        .filter(|(_, family)| {
            family.queue_count > 0
                && (family.queue_flags.contains(required)
                    || (kind == QueueKind::Copy
                        && family
                            .queue_flags
                            .intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)))
        })
        .min_by_key(|(_, family)| {
            (family.queue_flags & (vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER))
                .as_raw()
                .count_ones()
        })
        .map(|(index, _)| index as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_dedicated_families_are_preferred() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER | vk::QueueFlags::SPARSE_BINDING),
        ];
        assert_eq!(queue_family(&families, QueueKind::Direct), Some(0));
        assert_eq!(queue_family(&families, QueueKind::Compute), Some(1));
        assert_eq!(queue_family(&families, QueueKind::Copy), Some(2));
    }

    #[test]
    fn test_single_family_serves_every_kind() {
        let families = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)];
        for kind in QueueKind::ALL {
            assert_eq!(queue_family(&families, kind), Some(0));
        }
    }
}
