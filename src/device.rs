//! Shared device handle.
//!
//! [`Device`] is a reference-counted wrapper around a backend's [`RawDevice`]. Every
//! pool, queue and resource wrapper keeps a clone, so creating native objects never
//! needs a device to be threaded through call chains.
//!
//! ```
//! use scoria::{Device, backend::{DescriptorHeapType, headless::{Headless, HeadlessDevice}}};
//!
//! let device = Device::<Headless>::new(HeadlessDevice::new(Default::default()));
//! assert_eq!(device.descriptor_increment(DescriptorHeapType::CbvSrvUav), 1);
//! ```
use std::{fmt::Debug, ops::Deref, sync::Arc};

use crate::backend::{Api, DescriptorHeapType, RawDevice};

/// A trait for types created from a [`Device`].
pub trait HasDevice<A: Api> {
    fn device(&self) -> &Device<A>;
}

/// A backend device, reference-counted for cheap sharing.
pub struct Device<A: Api>(Arc<DeviceInner<A>>);

struct DeviceInner<A: Api> {
    raw: A::Device,
    descriptor_increments: [u32; 4],
}

impl<A: Api> Clone for Device<A> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<A: Api> PartialEq for Device<A> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl<A: Api> Eq for Device<A> {}

impl<A: Api> Debug for Device<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Device").field(&self.0.raw).finish()
    }
}

impl<A: Api> Device<A> {
    pub fn new(raw: A::Device) -> Self {
        let descriptor_increments = DescriptorHeapType::ALL.map(|ty| raw.descriptor_increment_size(ty));
        Self(Arc::new(DeviceInner {
            raw,
            descriptor_increments,
        }))
    }

    pub fn raw(&self) -> &A::Device {
        &self.0.raw
    }

    /// Distance in bytes between adjacent descriptors of type `ty`.
    pub fn descriptor_increment(&self, ty: DescriptorHeapType) -> u32 {
        self.0.descriptor_increments[ty.index()]
    }
}

impl<A: Api> Deref for Device<A> {
    type Target = A::Device;

    fn deref(&self) -> &Self::Target {
        &self.0.raw
    }
}

impl<A: Api> HasDevice<A> for Device<A> {
    fn device(&self) -> &Device<A> {
        self
    }
}
