//! # Scoria
//!
//! Pooled GPU command lists with fence-gated recycling of everything they use.
//!
//! Scoria sits between a renderer and an explicit graphics API. It hands out command
//! lists from per-queue pools, tracks resource states and batches the barriers between
//! them, stages descriptor tables into shader-visible pages, and sub-allocates
//! transient upload and scratch memory. Every native object a submission touched goes
//! back to its pool tagged with the submission's fence value, and is reused only once
//! that value has completed.
//!
//! ## Quick Start
//!
//! ```
//! use scoria::prelude::*;
//! use scoria::backend::headless::{Headless, HeadlessDevice};
//!
//! let device = Device::<Headless>::new(HeadlessDevice::default());
//! let manager = CommandListManager::new(device, ManagerConfig::default()).unwrap();
//!
//! let mut buffer = GpuBuffer::new(&manager, "particles", 1024, 16, None).unwrap();
//! let mut list = manager.begin_named(QueueKind::Compute, "simulate").unwrap();
//! list.compute().clear_uav(&mut buffer).unwrap();
//! list.transition_resource(&mut buffer, ResourceStates::NON_PIXEL_SHADER_RESOURCE, false);
//! let fence = list.close_and_execute(false).unwrap();
//!
//! manager.wait_for_fence(fence).unwrap();
//! ```
//!
//! ## Overview
//!
//! ### Queues and Fences
//!
//! There is one [`CommandQueue`](queue::CommandQueue) per [`QueueKind`](backend::QueueKind).
//! Each owns a monotonically increasing fence whose top byte names the queue kind, so a
//! bare `u64` fence value is enough to find the queue it belongs to:
//! [`CommandListManager::is_fence_complete`](manager::CommandListManager::is_fence_complete)
//! works for values from any queue.
//!
//! ### Command Lists
//!
//! [`CommandListManager::begin`](manager::CommandListManager::begin) checks out a
//! [`CommandList`](command::CommandList). Graphics and compute commands are recorded
//! through the [`graphics`](command::CommandList::graphics) and
//! [`compute`](command::CommandList::compute) views; barriers, copies and pipeline binds
//! are available on the list itself.
//! [`close_and_execute`](command::CommandList::close_and_execute) submits it and returns
//! the fence value.
//!
//! ### Resource States
//!
//! Resources carry their current [`ResourceStates`](tracking::ResourceStates). Asking for
//! a transition compares against it and emits nothing, a transition, a UAV barrier, or
//! the end of a split barrier, as appropriate. See [`tracking`].
//!
//! ### Descriptors
//!
//! Persistent views come from
//! [`CommandListManager::allocate_descriptor`](manager::CommandListManager::allocate_descriptor).
//! Staged descriptor tables are copied into shader-visible pages right before a draw or
//! dispatch; see [`dynamic_descriptor`]. Bindless tables live in a user-managed
//! [`DescriptorHeap`](descriptor::DescriptorHeap).
//!
//! ### Transient Memory
//!
//! Every list owns two [`LinearAllocator`](linear::LinearAllocator)s, one for CPU-written
//! upload data and one for GPU-only scratch memory. Allocations are valid until the
//! list's fence completes.
//!
//! ## Backends
//!
//! All of the above is generic over [`Api`](backend::Api). The
//! [`headless`](backend::headless) backend runs on any machine and is what the tests
//! use. Enable `vulkan` for the Vulkan backend.
//!
//! ## Feature Flags
//!
//! - `vulkan` - Vulkan backend on `ash` and `vk-mem`
//! - `serde` - `Serialize` / `Deserialize` for [`ManagerConfig`](config::ManagerConfig)
//!   and the plain-data descriptions

pub mod backend;
pub mod command;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod dynamic_descriptor;
mod error;
pub mod linear;
pub mod manager;
pub mod pipeline;
pub mod queue;
pub mod resource;
pub mod root_signature;
pub mod sync;
pub mod tracking;
pub mod utils;

pub use device::{Device, HasDevice};
pub use error::{Error, Result};

pub mod prelude {
    pub use crate::{
        Device, Error, HasDevice, Result,
        backend::{Api, BindPoint, DescriptorHeapType, Format, QueueKind},
        command::{CommandList, ComputeCommands, GraphicsCommands},
        config::ManagerConfig,
        descriptor::{DescriptorHandle, DescriptorHeap},
        linear::DynAlloc,
        manager::CommandListManager,
        pipeline::PipelineState,
        resource::{ColorBuffer, DepthBuffer, GpuBuffer, TrackedResource},
        root_signature::{RootParameter, RootSignature, RootSignatureDesc},
        tracking::{GpuResource, ResourceStates},
    };
}
