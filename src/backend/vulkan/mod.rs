//! Vulkan backend on `ash` and `vk-mem`.
//!
//! Requires Vulkan 1.3 with `VK_EXT_descriptor_buffer` and
//! `VK_EXT_mutable_descriptor_type`. The mapping onto the crate's object model:
//!
//! - Fences are timeline semaphores.
//! - Descriptor heaps are descriptor buffers. Render target and depth stencil heaps are
//!   host-side arrays of image views.
//! - Root signatures are pipeline layouts whose root parameters live in push constants.
//!   See [`pipeline`] for the layout.
//! - Resource states map to pipeline stages, accesses and image layouts. Split
//!   barriers perform the whole transition at their end half.
//!
//! ```no_run
//! use scoria::Device;
//! use scoria::backend::vulkan::{Vulkan, VulkanDevice, VulkanDeviceDesc};
//!
//! let raw = VulkanDevice::new(&VulkanDeviceDesc::default())?;
//! let device = Device::<Vulkan>::new(raw);
//! # Ok::<(), scoria::Error>(())
//! ```
mod adapter;
mod command;
mod conv;
mod descriptor;
mod device;
mod instance;
pub mod pipeline;
mod resource;
mod sync;

pub use command::{VulkanCommandAllocator, VulkanCommandList};
pub use descriptor::VulkanDescriptorHeap;
pub use device::{VulkanDevice, VulkanDeviceDesc};
pub use instance::InstanceDesc;
pub use pipeline::{
    ComputePipelineDesc, GraphicsPipelineDesc, ShaderStage, VertexAttribute, VertexBinding,
    VulkanPipelineState, VulkanRootSignature,
};
pub use resource::VulkanResource;
pub use sync::{VulkanFence, VulkanQueue};

use super::Api;

/// The Vulkan backend.
#[derive(Debug)]
pub enum Vulkan {}

impl Api for Vulkan {
    type Device = VulkanDevice;
    type Queue = VulkanQueue;
    type CommandAllocator = VulkanCommandAllocator;
    type CommandList = VulkanCommandList;
    type Fence = VulkanFence;
    type DescriptorHeap = VulkanDescriptorHeap;
    type Resource = VulkanResource;
    type RootSignature = VulkanRootSignature;
    type PipelineState = VulkanPipelineState;
}
