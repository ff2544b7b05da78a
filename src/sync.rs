//! CPU/GPU synchronization primitives.
//!
//! # Key Types
//!
//! - [`Fence`]: A native fence with a cached completed value for cheap polling.
//! - [`FencedPool`]: The recycling pattern shared by command allocators, shader-visible
//!   descriptor pages and linear allocation pages. Objects are handed back tagged with
//!   the fence value of the submission that last used them, and only come out again
//!   once that value has completed.
//!
//! # Fenced Recycling
//!
//! ```
//! use scoria::sync::FencedPool;
//!
//! let mut pool: FencedPool<&str> = FencedPool::new();
//! pool.discard(5, "page");
//!
//! // Fence only reached 4: nothing to hand out.
//! assert_eq!(pool.acquire(|fence| fence <= 4), None);
//! // Fence reached 5: the page comes back.
//! assert_eq!(pool.acquire(|fence| fence <= 5), Some("page"));
//! ```
use std::{
    collections::VecDeque,
    fmt::Debug,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::{
    Device, HasDevice, Result,
    backend::{Api, RawDevice},
};

/// A native fence with a cached "last completed" value.
///
/// The cache only moves forward. [`Fence::is_complete`] answers from the cache when it
/// can, and only queries the native fence when the cache is behind the requested value.
pub struct Fence<A: Api> {
    device: Device<A>,
    raw: A::Fence,
    last_completed: AtomicU64,
}

impl<A: Api> Debug for Fence<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Fence")
            .field(&self.raw)
            .field(&self.last_completed.load(Ordering::Relaxed))
            .finish()
    }
}

impl<A: Api> HasDevice<A> for Fence<A> {
    fn device(&self) -> &Device<A> {
        &self.device
    }
}

impl<A: Api> Fence<A> {
    pub fn new(device: Device<A>, initial_value: u64) -> Result<Self> {
        let raw = device.create_fence(initial_value)?;
        Ok(Self {
            device,
            raw,
            last_completed: AtomicU64::new(initial_value),
        })
    }

    pub fn raw(&self) -> &A::Fence {
        &self.raw
    }

    /// Cached completed value. Never queries the device.
    pub fn last_completed(&self) -> u64 {
        self.last_completed.load(Ordering::Acquire)
    }

    /// Queries the device and updates the cached value.
    pub fn completed_value(&self) -> Result<u64> {
        let value = self.device.completed_fence_value(&self.raw)?;
        let previous = self.last_completed.fetch_max(value, Ordering::AcqRel);
        Ok(previous.max(value))
    }

    /// Returns `true` once the fence has reached `value`.
    ///
    /// A failed native query is logged and treated as "not complete", so nothing is
    /// recycled on a device that stopped answering.
    pub fn is_complete(&self, value: u64) -> bool {
        if value <= self.last_completed() {
            return true;
        }
        match self.completed_value() {
            Ok(completed) => value <= completed,
            Err(err) => {
                tracing::error!("Failed to query fence {:?}: {}", self.raw, err);
                false
            }
        }
    }

    /// Blocks until the fence reaches `value`.
    ///
    /// Each call waits on its own; concurrent callers waiting for different values do
    /// not contend on a shared event.
    pub fn wait(&self, value: u64) -> Result<()> {
        if self.is_complete(value) {
            return Ok(());
        }
        self.device.wait_for_fence(&self.raw, value)?;
        self.last_completed.fetch_max(value, Ordering::AcqRel);
        Ok(())
    }
}

/// Objects pending reuse, gated on fence completion.
///
/// This type does not lock; owners wrap it in their own mutex so that each resource
/// class contends only with itself.
pub struct FencedPool<T> {
    pending: VecDeque<(u64, T)>,
    available: VecDeque<T>,
    created: usize,
}

impl<T> Default for FencedPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Debug for FencedPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FencedPool")
            .field("created", &self.created)
            .field("pending", &self.pending.len())
            .field("available", &self.available.len())
            .finish()
    }
}

impl<T> FencedPool<T> {
    pub const fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            available: VecDeque::new(),
            created: 0,
        }
    }

    /// Number of objects ever created for this pool and not destroyed since.
    pub fn created(&self) -> usize {
        self.created
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn available_len(&self) -> usize {
        self.available.len()
    }

    /// Moves every pending object whose fence has completed to the available queue.
    ///
    /// Objects from different queues may be interleaved, so the whole pending queue is
    /// scanned rather than only its front.
    pub fn reclaim(&mut self, mut is_complete: impl FnMut(u64) -> bool) {
        if self.pending.is_empty() {
            return;
        }
        let mut still_pending = VecDeque::with_capacity(self.pending.len());
        for (fence, item) in self.pending.drain(..) {
            if is_complete(fence) {
                self.available.push_back(item);
            } else {
                still_pending.push_back((fence, item));
            }
        }
        self.pending = still_pending;
    }

    /// Hands out an object whose fence has completed, if any.
    pub fn acquire(&mut self, is_complete: impl FnMut(u64) -> bool) -> Option<T> {
        self.reclaim(is_complete);
        self.available.pop_front()
    }

    /// Accounts for an object created outside the pool that will be discarded into it.
    pub fn register_created(&mut self) {
        self.created += 1;
    }

    /// Returns an object, to be reused once `fence` completes.
    pub fn discard(&mut self, fence: u64, item: T) {
        self.pending.push_back((fence, item));
    }

    /// Releases an object for good instead of recycling it.
    pub fn forget_one(&mut self) {
        self.created = self.created.saturating_sub(1);
    }

    /// Drops every pooled object. Objects currently checked out are not affected.
    pub fn clear(&mut self) -> usize {
        let dropped = self.pending.len() + self.available.len();
        self.pending.clear();
        self.available.clear();
        self.created = self.created.saturating_sub(dropped);
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_reclaims_out_of_order_fences() {
        let mut pool = FencedPool::new();
        pool.discard(10, 'a');
        pool.discard(3, 'b');
        assert_eq!(pool.acquire(|v| v <= 5), Some('b'));
        assert_eq!(pool.acquire(|v| v <= 5), None);
        assert_eq!(pool.pending_len(), 1);
        assert_eq!(pool.acquire(|v| v <= 10), Some('a'));
    }

    #[test]
    fn test_clear_keeps_checked_out_count() {
        let mut pool = FencedPool::new();
        for i in 0..3 {
            pool.register_created();
            pool.discard(i, i);
        }
        pool.register_created();
        assert_eq!(pool.clear(), 3);
        assert_eq!(pool.created(), 1);
    }

    proptest! {
        /// Nothing discarded with a fence above the completed value is handed out.
        #[test]
        fn never_reuses_before_completion(
            fences in prop::collection::vec(1u64..64, 1..48),
            completed in 0u64..64,
        ) {
            let mut pool = FencedPool::new();
            for (id, fence) in fences.iter().enumerate() {
                pool.discard(*fence, id);
            }
            let mut handed_out = Vec::new();
            while let Some(id) = pool.acquire(|v| v <= completed) {
                handed_out.push(id);
            }
            for id in &handed_out {
                prop_assert!(fences[*id] <= completed);
            }
            let expected = fences.iter().filter(|f| **f <= completed).count();
            prop_assert_eq!(handed_out.len(), expected);
        }
    }
}
