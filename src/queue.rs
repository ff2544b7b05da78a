//! Command queues, their fences, and their command allocator pools.
//!
//! # Overview
//!
//! A [`CommandQueue`] owns one native queue and one fence. Every submission signals the
//! fence with the next value, so fence values are strictly increasing and follow
//! submission order even when several threads submit concurrently.
//!
//! The queue also owns the pool of command allocators for its queue kind. An allocator
//! goes back into the pool tagged with the fence value of the submission that used it,
//! and is only reset and handed out again once that value has completed.
//!
//! Fence values carry the queue kind in their top byte (see
//! [`QueueKind::fence_base`]), so a value alone identifies the queue that produced it.
use std::{fmt::Debug, sync::Mutex};

use crate::{
    Device, HasDevice, Result,
    backend::{Api, QueueKind, RawDevice, RawQueue},
    sync::{Fence, FencedPool},
};

/// A hardware queue with its fence and command allocator pool.
pub struct CommandQueue<A: Api> {
    device: Device<A>,
    kind: QueueKind,
    raw: A::Queue,
    fence: Fence<A>,
    /// Held across the native submit so values match submission order.
    next_fence_value: Mutex<u64>,
    allocator_pool: Mutex<FencedPool<A::CommandAllocator>>,
}

impl<A: Api> Debug for CommandQueue<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("kind", &self.kind)
            .field("raw", &self.raw)
            .field("fence", &self.fence)
            .finish_non_exhaustive()
    }
}

impl<A: Api> HasDevice<A> for CommandQueue<A> {
    fn device(&self) -> &Device<A> {
        &self.device
    }
}

impl<A: Api> CommandQueue<A> {
    pub fn new(device: Device<A>, kind: QueueKind) -> Result<Self> {
        let raw = device.create_queue(kind)?;
        let fence = Fence::new(device.clone(), kind.fence_base())?;
        Ok(Self {
            device,
            kind,
            raw,
            fence,
            next_fence_value: Mutex::new(kind.fence_base() | 1),
            allocator_pool: Mutex::new(FencedPool::new()),
        })
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn raw(&self) -> &A::Queue {
        &self.raw
    }

    pub fn fence(&self) -> &Fence<A> {
        &self.fence
    }

    /// The value the next submission will signal.
    pub fn next_fence_value(&self) -> u64 {
        *self.next_fence_value.lock().unwrap()
    }

    /// Cached completed value of this queue's fence.
    pub fn last_completed_fence(&self) -> u64 {
        self.fence.last_completed()
    }

    /// Submits a closed native command list and signals the fence.
    ///
    /// Returns the signalled value.
    ///
    /// # Safety
    /// `list` must be closed and everything it references must outlive its execution.
    pub unsafe fn execute_command_list(&self, list: &A::CommandList) -> Result<u64> {
        unsafe { self.execute_command_lists(&[list]) }
    }

    /// Submits several closed native command lists behind a single fence signal.
    ///
    /// # Safety
    /// See [`CommandQueue::execute_command_list`].
    pub unsafe fn execute_command_lists(&self, lists: &[&A::CommandList]) -> Result<u64> {
        let mut next = self.next_fence_value.lock().unwrap();
        unsafe {
            self.raw.submit(lists, self.fence.raw(), *next)?;
        }
        let value = *next;
        *next += 1;
        tracing::trace!(
            "Submitted {} command list(s) to {:?} queue, fence = {:#x}",
            lists.len(),
            self.kind,
            value
        );
        Ok(value)
    }

    /// Signals the fence without submitting work and returns the signalled value.
    pub fn increment_fence(&self) -> Result<u64> {
        let mut next = self.next_fence_value.lock().unwrap();
        unsafe {
            self.raw.signal(self.fence.raw(), *next)?;
        }
        let value = *next;
        *next += 1;
        Ok(value)
    }

    pub fn is_fence_complete(&self, value: u64) -> bool {
        debug_assert_eq!(
            QueueKind::from_fence_value(value),
            Some(self.kind),
            "fence value {value:#x} was not produced by a {:?} queue",
            self.kind
        );
        self.fence.is_complete(value)
    }

    /// Blocks the calling thread until `value` has completed.
    pub fn wait_for_fence(&self, value: u64) -> Result<()> {
        self.fence.wait(value)
    }

    /// Blocks until everything submitted so far has completed.
    pub fn wait_for_idle(&self) -> Result<()> {
        let value = self.increment_fence()?;
        self.wait_for_fence(value)
    }

    /// Makes this queue wait on the GPU until `producer` reaches `value`.
    pub fn stall_for_fence(&self, producer: &CommandQueue<A>, value: u64) -> Result<()> {
        let _guard = self.next_fence_value.lock().unwrap();
        unsafe { self.raw.wait(producer.fence.raw(), value) }
    }

    /// Makes this queue wait on the GPU for everything submitted to `producer` so far.
    pub fn stall_for_producer(&self, producer: &CommandQueue<A>) -> Result<()> {
        let value = producer.next_fence_value() - 1;
        self.stall_for_fence(producer, value)
    }

    /// Takes a command allocator whose last use has completed, or creates a new one.
    pub fn request_allocator(&self) -> Result<A::CommandAllocator> {
        let mut pool = self.allocator_pool.lock().unwrap();
        if let Some(mut allocator) = pool.acquire(|fence| self.fence.is_complete(fence)) {
            unsafe {
                self.device.reset_command_allocator(&mut allocator)?;
            }
            return Ok(allocator);
        }
        let allocator = self.device.create_command_allocator(self.kind)?;
        pool.register_created();
        tracing::debug!(
            "Allocating new command allocator for {:?} queue, pool size = {}",
            self.kind,
            pool.created()
        );
        Ok(allocator)
    }

    /// Returns an allocator, to be reused once `fence_value` completes.
    pub fn discard_allocator(&self, fence_value: u64, allocator: A::CommandAllocator) {
        self.allocator_pool
            .lock()
            .unwrap()
            .discard(fence_value, allocator);
    }

    /// Number of allocators created for this queue and not destroyed.
    pub fn allocator_pool_size(&self) -> usize {
        self.allocator_pool.lock().unwrap().created()
    }

    /// Drops all pooled allocators. The queue must be idle.
    pub fn destroy_allocators(&self) -> usize {
        self.allocator_pool.lock().unwrap().clear()
    }
}

/// One [`CommandQueue`] per [`QueueKind`], addressable by fence value.
pub struct CommandQueues<A: Api>([CommandQueue<A>; 3]);

impl<A: Api> Debug for CommandQueues<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

impl<A: Api> CommandQueues<A> {
    pub fn new(device: Device<A>) -> Result<Self> {
        Ok(Self([
            CommandQueue::new(device.clone(), QueueKind::Direct)?,
            CommandQueue::new(device.clone(), QueueKind::Compute)?,
            CommandQueue::new(device, QueueKind::Copy)?,
        ]))
    }

    pub fn get(&self, kind: QueueKind) -> &CommandQueue<A> {
        &self.0[kind.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandQueue<A>> {
        self.0.iter()
    }

    /// The queue whose fence produced `value`.
    ///
    /// # Panics
    /// If the top byte of `value` does not name a queue kind.
    pub fn owner_of(&self, value: u64) -> &CommandQueue<A> {
        match QueueKind::from_fence_value(value) {
            Some(kind) => self.get(kind),
            None => panic!("fence value {value:#x} does not carry a queue tag"),
        }
    }

    pub fn is_fence_complete(&self, value: u64) -> bool {
        self.owner_of(value).is_fence_complete(value)
    }

    pub fn wait_for_fence(&self, value: u64) -> Result<()> {
        self.owner_of(value).wait_for_fence(value)
    }

    /// Blocks until every queue has drained.
    pub fn idle(&self) -> Result<()> {
        for queue in self.iter() {
            queue.wait_for_idle()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, sync::Arc};

    use super::*;
    use crate::backend::headless::{ExecutionMode, Headless, HeadlessConfig, HeadlessDevice};

    fn queue(mode: ExecutionMode, kind: QueueKind) -> (HeadlessDevice, CommandQueue<Headless>) {
        let raw = HeadlessDevice::new(HeadlessConfig {
            mode,
            ..Default::default()
        });
        let device = Device::<Headless>::new(raw.clone());
        (raw, CommandQueue::new(device, kind).unwrap())
    }

    #[test]
    fn test_fence_values_start_above_tag() {
        let (_, queue) = queue(ExecutionMode::Immediate, QueueKind::Compute);
        let first = queue.increment_fence().unwrap();
        assert_eq!(first, QueueKind::Compute.fence_base() | 1);
        assert_eq!(queue.increment_fence().unwrap(), first + 1);
        assert!(queue.is_fence_complete(first));
    }

    #[test]
    fn test_fence_values_strictly_increase_across_threads() {
        let (_, queue) = queue(ExecutionMode::Threaded, QueueKind::Direct);
        let queue = Arc::new(queue);
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    (0..50)
                        .map(|_| queue.increment_fence().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut all = BTreeSet::new();
        for thread in threads {
            let values = thread.join().unwrap();
            assert!(values.windows(2).all(|w| w[0] < w[1]));
            all.extend(values);
        }
        assert_eq!(all.len(), 400);
        let last = *all.last().unwrap();
        queue.wait_for_fence(last).unwrap();
        assert!(queue.is_fence_complete(last));
    }

    #[test]
    fn test_allocator_reused_only_after_completion() {
        let (raw, queue) = queue(ExecutionMode::Manual, QueueKind::Direct);
        let allocator = queue.request_allocator().unwrap();
        let first_id = allocator.id();
        let fence = queue.increment_fence().unwrap();
        queue.discard_allocator(fence, allocator);

        // Fence still pending: a second allocator must be created.
        let second = queue.request_allocator().unwrap();
        assert_ne!(second.id(), first_id);
        assert_eq!(queue.allocator_pool_size(), 2);

        raw.complete_all();
        let third = queue.request_allocator().unwrap();
        assert_eq!(third.id(), first_id);
        assert_eq!(queue.allocator_pool_size(), 2);
    }

    #[test]
    fn test_concurrent_waiters_for_different_values() {
        let (raw, queue) = queue(ExecutionMode::Manual, QueueKind::Direct);
        let queue = Arc::new(queue);
        let a = queue.increment_fence().unwrap();
        let b = queue.increment_fence().unwrap();
        let waiters: Vec<_> = [b, a]
            .into_iter()
            .map(|value| {
                let queue = queue.clone();
                std::thread::spawn(move || queue.wait_for_fence(value))
            })
            .collect();
        raw.complete_all();
        for waiter in waiters {
            waiter.join().unwrap().unwrap();
        }
        assert!(queue.is_fence_complete(b));
    }

    #[test]
    fn test_queue_set_routes_by_tag() {
        let raw = HeadlessDevice::new(HeadlessConfig {
            mode: ExecutionMode::Manual,
            ..Default::default()
        });
        let queues = CommandQueues::new(Device::<Headless>::new(raw.clone())).unwrap();
        let copy = queues.get(QueueKind::Copy).increment_fence().unwrap();
        let direct = queues.get(QueueKind::Direct).increment_fence().unwrap();
        assert_eq!(queues.owner_of(copy).kind(), QueueKind::Copy);
        assert!(!queues.is_fence_complete(copy));
        queues.wait_for_fence(copy).unwrap();
        assert!(queues.is_fence_complete(copy));
        queues.idle().unwrap();
        assert!(queues.is_fence_complete(direct));
    }
}
