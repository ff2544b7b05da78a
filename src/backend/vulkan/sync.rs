//! Fences and queues.
//!
//! A fence is a timeline semaphore. The last value observed on the host is cached so
//! that completed-value queries for values already known to be reached skip the
//! driver entirely.
use std::{
    fmt::Debug,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use ash::vk;

use super::{Vulkan, command::VulkanCommandList, device::DeviceShared};
use crate::{
    Result,
    backend::{QueueKind, RawQueue},
};

pub struct VulkanFence {
    shared: Arc<DeviceShared>,
    raw: vk::Semaphore,
    completed: AtomicU64,
}

impl Debug for VulkanFence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("VulkanFence")
            .field(&self.raw)
            .field(&self.completed.load(Ordering::Relaxed))
            .finish()
    }
}

impl VulkanFence {
    pub(super) fn new(shared: Arc<DeviceShared>, initial_value: u64) -> Result<Self> {
        let raw = unsafe {
            let mut type_info = vk::SemaphoreTypeCreateInfo {
                semaphore_type: vk::SemaphoreType::TIMELINE,
                initial_value,
                ..Default::default()
            };
            let info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
            shared.raw.create_semaphore(&info, None)?
        };
        Ok(Self {
            shared,
            raw,
            completed: AtomicU64::new(initial_value),
        })
    }

    pub fn raw(&self) -> vk::Semaphore {
        self.raw
    }

    pub(super) fn completed_value(&self) -> Result<u64> {
        let value = unsafe { self.shared.raw.get_semaphore_counter_value(self.raw)? };
        let previous = self.completed.fetch_max(value, Ordering::Relaxed);
        debug_assert!(previous <= value, "timeline semaphore went backwards");
        Ok(value)
    }

    /// Blocks until the semaphore reaches `value`. Concurrent waits on different
    /// values do not wait for each other.
    pub(super) fn wait(&self, value: u64) -> Result<()> {
        if self.completed.load(Ordering::Relaxed) >= value {
            return Ok(());
        }
        unsafe {
            self.shared.raw.wait_semaphores(
                &vk::SemaphoreWaitInfo {
                    semaphore_count: 1,
                    p_semaphores: &self.raw,
                    p_values: &value,
                    ..Default::default()
                },
                u64::MAX,
            )?;
        }
        self.completed.fetch_max(value, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for VulkanFence {
    fn drop(&mut self) {
        unsafe { self.shared.raw.destroy_semaphore(self.raw, None) };
    }
}

/// A device queue. Queue kinds that share a native queue share its lock.
#[derive(Clone)]
pub(super) struct QueueSlot {
    pub family: u32,
    pub index: u32,
    pub raw: Arc<Mutex<vk::Queue>>,
}

/// A queue of one kind.
///
/// A semaphore wait only orders the batch it is submitted with, so GPU-side waits are
/// held back and attached to the next submission or signal on this queue.
pub struct VulkanQueue {
    shared: Arc<DeviceShared>,
    kind: QueueKind,
    slot: QueueSlot,
    pending_waits: Mutex<Vec<(vk::Semaphore, u64)>>,
}

impl Debug for VulkanQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanQueue")
            .field("kind", &self.kind)
            .field("family", &self.slot.family)
            .field("index", &self.slot.index)
            .finish()
    }
}

impl VulkanQueue {
    pub(super) fn new(shared: Arc<DeviceShared>, kind: QueueKind) -> Self {
        let slot = shared.queue_slot(kind).clone();
        Self {
            shared,
            kind,
            slot,
            pending_waits: Mutex::new(Vec::new()),
        }
    }

    pub fn family_index(&self) -> u32 {
        self.slot.family
    }

    /// Submits `command_buffers`, then signals `fence` to `value`, after every held
    /// back wait.
    unsafe fn submit2(
        &self,
        command_buffers: &[vk::CommandBufferSubmitInfo<'_>],
        fence: &VulkanFence,
        value: u64,
    ) -> Result<()> {
        let mut pending_waits = self.pending_waits.lock().unwrap();
        let waits: smallvec::SmallVec<[vk::SemaphoreSubmitInfo; 2]> = pending_waits
            .iter()
            .map(|&(semaphore, value)| vk::SemaphoreSubmitInfo {
                semaphore,
                value,
                stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
                ..Default::default()
            })
            .collect();
        let signal = vk::SemaphoreSubmitInfo {
            semaphore: fence.raw(),
            value,
            stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
            ..Default::default()
        };
        let submit = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&waits)
            .command_buffer_infos(command_buffers)
            .signal_semaphore_infos(std::slice::from_ref(&signal));
        let queue = self.slot.raw.lock().unwrap();
        unsafe {
            self.shared
                .raw
                .queue_submit2(*queue, &[submit], vk::Fence::null())?
        };
        pending_waits.clear();
        Ok(())
    }
}

impl RawQueue<Vulkan> for VulkanQueue {
    unsafe fn submit(
        &self,
        lists: &[&VulkanCommandList],
        fence: &VulkanFence,
        signal_value: u64,
    ) -> Result<()> {
        let command_buffers: smallvec::SmallVec<[vk::CommandBufferSubmitInfo; 4]> = lists
            .iter()
            .map(|list| vk::CommandBufferSubmitInfo {
                command_buffer: list.raw(),
                ..Default::default()
            })
            .collect();
        tracing::trace!(kind = ?self.kind, lists = lists.len(), signal_value, "submit");
        unsafe { self.submit2(&command_buffers, fence, signal_value) }
    }

    unsafe fn signal(&self, fence: &VulkanFence, value: u64) -> Result<()> {
        unsafe { self.submit2(&[], fence, value) }
    }

    unsafe fn wait(&self, fence: &VulkanFence, value: u64) -> Result<()> {
        let mut pending_waits = self.pending_waits.lock().unwrap();
        match pending_waits
            .iter_mut()
            .find(|(semaphore, _)| *semaphore == fence.raw())
        {
            Some((_, pending)) => *pending = (*pending).max(value),
            None => pending_waits.push((fence.raw(), value)),
        }
        Ok(())
    }
}
