//! The command list manager.
//!
//! [`CommandListManager`] is the one service object of the crate. It owns the three
//! command queues and every pool a command list draws from:
//!
//! - a free list of recording contexts per queue kind;
//! - the command allocator pool of each queue;
//! - the shader-visible descriptor page pools (views and samplers);
//! - the linear page pools (GPU-exclusive and CPU-writable);
//! - one persistent [`DescriptorAllocator`] per descriptor heap type.
//!
//! Every pool has its own lock, so lists on different threads only contend when they
//! touch the same pool. The manager is a cheap clonable handle; each checked-out
//! [`CommandList`] keeps a clone to return its context on drop.
//!
//! ```
//! use scoria::prelude::*;
//! use scoria::backend::headless::{Headless, HeadlessDevice};
//!
//! let device = Device::<Headless>::new(HeadlessDevice::default());
//! let manager = CommandListManager::new(device, ManagerConfig::default()).unwrap();
//!
//! let list = manager.begin(QueueKind::Compute).unwrap();
//! let fence = list.close_and_execute(false).unwrap();
//! manager.wait_for_fence(fence).unwrap();
//! assert_eq!(manager.free_list_len(QueueKind::Compute), 1);
//!
//! manager.shutdown().unwrap();
//! ```
use std::{
    fmt::Debug,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use crate::{
    Device, Result,
    backend::{Api, CpuDescriptorHandle, DescriptorHeapType, QueueKind},
    command::{CommandContext, CommandList},
    config::ManagerConfig,
    descriptor::DescriptorAllocator,
    dynamic_descriptor::DescriptorPagePool,
    linear::{LinearAllocatorKind, LinearPagePool},
    queue::{CommandQueue, CommandQueues},
    resource::GpuBuffer,
    tracking::ResourceStates,
};

/// Hands out command lists and owns the pools they recycle through.
pub struct CommandListManager<A: Api>(Arc<ManagerInner<A>>);

pub(crate) struct ManagerInner<A: Api> {
    pub(crate) device: Device<A>,
    pub(crate) config: ManagerConfig,
    pub(crate) queues: Arc<CommandQueues<A>>,

    free_lists: [Mutex<Vec<Box<CommandContext<A>>>>; 3],
    contexts_created: [AtomicUsize; 3],
    next_list_id: AtomicU64,

    pub(crate) view_pages: Arc<DescriptorPagePool<A>>,
    pub(crate) sampler_pages: Arc<DescriptorPagePool<A>>,
    pub(crate) gpu_pages: Arc<LinearPagePool<A>>,
    pub(crate) cpu_pages: Arc<LinearPagePool<A>>,
    descriptor_allocators: [Mutex<DescriptorAllocator<A>>; 4],
}

impl<A: Api> Clone for CommandListManager<A> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<A: Api> Debug for CommandListManager<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandListManager")
            .field("device", &self.0.device)
            .field("config", &self.0.config)
            .field("queues", &self.0.queues)
            .finish_non_exhaustive()
    }
}

impl<A: Api> CommandListManager<A> {
    /// Creates the queues and empty pools.
    ///
    /// # Panics
    /// If `config` describes dynamic descriptor pages smaller than the staging cache,
    /// or linear pages too small for a single aligned allocation.
    pub fn new(device: Device<A>, config: ManagerConfig) -> Result<Self> {
        config.validate();
        let queues = Arc::new(CommandQueues::new(device.clone())?);
        let view_pages = Arc::new(DescriptorPagePool::new(
            device.clone(),
            queues.clone(),
            DescriptorHeapType::CbvSrvUav,
            config.descriptors_per_dynamic_heap,
        ));
        let sampler_pages = Arc::new(DescriptorPagePool::new(
            device.clone(),
            queues.clone(),
            DescriptorHeapType::Sampler,
            config.descriptors_per_dynamic_heap,
        ));
        let gpu_pages = Arc::new(LinearPagePool::new(
            device.clone(),
            queues.clone(),
            LinearAllocatorKind::GpuExclusive,
            config.gpu_linear_page_size,
        ));
        let cpu_pages = Arc::new(LinearPagePool::new(
            device.clone(),
            queues.clone(),
            LinearAllocatorKind::CpuWritable,
            config.cpu_linear_page_size,
        ));
        let descriptor_allocators = DescriptorHeapType::ALL.map(|ty| {
            Mutex::new(DescriptorAllocator::new(
                device.clone(),
                ty,
                config.descriptors_per_allocator_heap,
            ))
        });
        Ok(Self(Arc::new(ManagerInner {
            device,
            config,
            queues,
            free_lists: Default::default(),
            contexts_created: Default::default(),
            next_list_id: AtomicU64::new(0),
            view_pages,
            sampler_pages,
            gpu_pages,
            cpu_pages,
            descriptor_allocators,
        })))
    }

    pub fn device(&self) -> &Device<A> {
        &self.0.device
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.0.config
    }

    pub fn queues(&self) -> &Arc<CommandQueues<A>> {
        &self.0.queues
    }

    pub fn queue(&self, kind: QueueKind) -> &CommandQueue<A> {
        self.0.queues.get(kind)
    }

    /// Checks out a command list that is open for recording.
    pub fn begin(&self, kind: QueueKind) -> Result<CommandList<A>> {
        self.begin_named(kind, "")
    }

    /// [`begin`](Self::begin), naming the list for logs.
    pub fn begin_named(&self, kind: QueueKind, name: &str) -> Result<CommandList<A>> {
        let reused = self.0.free_lists[kind.index()].lock().unwrap().pop();
        let mut context = match reused {
            Some(mut context) => {
                if let Err(err) = context.reset(self.queue(kind)) {
                    self.release(context);
                    return Err(err);
                }
                context
            }
            None => {
                let id = self.0.next_list_id.fetch_add(1, Ordering::Relaxed);
                let context = Box::new(CommandContext::new(&self.0, kind, id)?);
                let created = self.0.contexts_created[kind.index()].fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(
                    "Allocating new command list for {:?} queue, pool size = {}",
                    kind,
                    created
                );
                context
            }
        };
        context.set_name(name);
        Ok(CommandList::new(self.clone(), context))
    }

    /// Returns a finished context to its free list.
    pub(crate) fn release(&self, context: Box<CommandContext<A>>) {
        debug_assert!(!context.is_recording());
        self.0.free_lists[context.kind().index()]
            .lock()
            .unwrap()
            .push(context);
    }

    /// Whether the work that signalled `fence` has completed, on whichever queue it
    /// was submitted to.
    pub fn is_fence_complete(&self, fence: u64) -> bool {
        self.0.queues.is_fence_complete(fence)
    }

    pub fn wait_for_fence(&self, fence: u64) -> Result<()> {
        self.0.queues.wait_for_fence(fence)
    }

    /// Blocks until every queue has drained.
    pub fn idle_gpu(&self) -> Result<()> {
        self.0.queues.idle()
    }

    /// Allocates `count` contiguous persistent CPU descriptors of type `ty`.
    pub fn allocate_descriptor(&self, ty: DescriptorHeapType, count: u32) -> Result<CpuDescriptorHandle> {
        self.0.descriptor_allocators[ty.index()]
            .lock()
            .unwrap()
            .allocate(count)
    }

    /// Uploads `data` into `buffer` at `offset` on the direct queue and waits for the
    /// copy. `buffer` ends up in `GENERIC_READ`.
    pub fn initialize_buffer(&self, buffer: &mut GpuBuffer<A>, data: &[u8], offset: u64) -> Result<()> {
        let mut list = self.begin_named(QueueKind::Direct, "initialize buffer")?;
        list.write_buffer(buffer, offset, data)?;
        list.transition_resource(buffer, ResourceStates::GENERIC_READ, true);
        list.close_and_execute(true)?;
        Ok(())
    }

    /// Contexts created for `kind` and not destroyed, checked out or not.
    pub fn command_list_pool_size(&self, kind: QueueKind) -> usize {
        self.0.contexts_created[kind.index()].load(Ordering::Relaxed)
    }

    /// Contexts of `kind` waiting in the free list.
    pub fn free_list_len(&self, kind: QueueKind) -> usize {
        self.0.free_lists[kind.index()].lock().unwrap().len()
    }

    pub fn allocator_pool_size(&self, kind: QueueKind) -> usize {
        self.queue(kind).allocator_pool_size()
    }

    /// Shader-visible pages created for `ty`, which must be `CbvSrvUav` or `Sampler`.
    pub fn descriptor_page_pool_size(&self, ty: DescriptorHeapType) -> usize {
        match ty {
            DescriptorHeapType::CbvSrvUav => self.0.view_pages.pool_size(),
            DescriptorHeapType::Sampler => self.0.sampler_pages.pool_size(),
            other => panic!("{other:?} has no shader-visible pages"),
        }
    }

    pub fn linear_page_pool_size(&self, kind: LinearAllocatorKind) -> usize {
        self.linear_pages(kind).pool_size()
    }

    fn linear_pages(&self, kind: LinearAllocatorKind) -> &LinearPagePool<A> {
        match kind {
            LinearAllocatorKind::GpuExclusive => &self.0.gpu_pages,
            LinearAllocatorKind::CpuWritable => &self.0.cpu_pages,
        }
    }

    /// Drops the pooled contexts and command allocators. The GPU must be idle.
    ///
    /// Lists that are checked out are unaffected and return to the free list as usual.
    pub fn destroy_all_command_lists(&self) -> usize {
        let mut destroyed = 0;
        for kind in QueueKind::ALL {
            let contexts = std::mem::take(&mut *self.0.free_lists[kind.index()].lock().unwrap());
            self.0.contexts_created[kind.index()].fetch_sub(contexts.len(), Ordering::Relaxed);
            destroyed += contexts.len();
            self.queue(kind).destroy_allocators();
        }
        destroyed
    }

    /// Drops every pooled shader-visible descriptor page. The GPU must be idle.
    pub fn destroy_all_dynamic_heaps(&self) -> usize {
        self.0.view_pages.destroy_all() + self.0.sampler_pages.destroy_all()
    }

    /// Releases every persistent descriptor. Handles from
    /// [`allocate_descriptor`](Self::allocate_descriptor) dangle afterwards.
    pub fn destroy_all_descriptor_allocators(&self) -> usize {
        self.0
            .descriptor_allocators
            .iter()
            .map(|allocator| allocator.lock().unwrap().destroy_all())
            .sum()
    }

    /// Drops every pooled linear page. The GPU must be idle.
    pub fn destroy_all_linear_pages(&self) -> usize {
        self.0.gpu_pages.destroy_all() + self.0.cpu_pages.destroy_all()
    }

    /// Waits for the GPU, then empties every pool.
    pub fn shutdown(&self) -> Result<()> {
        self.idle_gpu()?;
        let command_lists = self.destroy_all_command_lists();
        let descriptor_pages = self.destroy_all_dynamic_heaps();
        let descriptor_heaps = self.destroy_all_descriptor_allocators();
        let linear_pages = self.destroy_all_linear_pages();
        tracing::info!(
            "Command list manager shut down: released {} command lists, {} descriptor pages, {} descriptor heaps, {} linear pages",
            command_lists,
            descriptor_pages,
            descriptor_heaps,
            linear_pages
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{ExecutionMode, Headless, HeadlessConfig, HeadlessDevice};

    fn manager(mode: ExecutionMode) -> (HeadlessDevice, CommandListManager<Headless>) {
        let raw = HeadlessDevice::new(HeadlessConfig {
            mode,
            ..Default::default()
        });
        let manager =
            CommandListManager::new(Device::<Headless>::new(raw.clone()), ManagerConfig::default())
                .unwrap();
        (raw, manager)
    }

    #[test]
    fn test_contexts_are_reused_per_kind() {
        let (raw, manager) = manager(ExecutionMode::Immediate);
        let direct = manager.begin(QueueKind::Direct).unwrap();
        let compute = manager.begin(QueueKind::Compute).unwrap();
        let (direct_id, compute_id) = (direct.id(), compute.id());
        assert_ne!(direct_id, compute_id);
        direct.close_and_execute(false).unwrap();
        compute.close_and_execute(false).unwrap();

        let again = manager.begin_named(QueueKind::Direct, "again").unwrap();
        assert_eq!(again.id(), direct_id);
        assert_eq!(again.name(), "again");
        assert_eq!(manager.command_list_pool_size(QueueKind::Direct), 1);
        assert_eq!(raw.stats().command_lists_created, 2);
        again.close_and_execute(false).unwrap();
    }

    #[test]
    fn test_allocators_wait_for_their_fence() {
        let (raw, manager) = manager(ExecutionMode::Manual);
        let fence = manager
            .begin(QueueKind::Direct)
            .unwrap()
            .close_and_execute(false)
            .unwrap();
        assert!(!manager.is_fence_complete(fence));

        // The first allocator is still in flight.
        manager
            .begin(QueueKind::Direct)
            .unwrap()
            .close_and_execute(false)
            .unwrap();
        assert_eq!(manager.allocator_pool_size(QueueKind::Direct), 2);

        raw.complete_all();
        assert!(manager.is_fence_complete(fence));
        manager
            .begin(QueueKind::Direct)
            .unwrap()
            .close_and_execute(false)
            .unwrap();
        assert_eq!(manager.allocator_pool_size(QueueKind::Direct), 2);
        raw.complete_all();
    }

    #[test]
    fn test_initialize_buffer_uploads_and_waits() {
        let (_, manager) = manager(ExecutionMode::Threaded);
        let data = [7u8; 64];
        let buffer = GpuBuffer::new(&manager, "init", 16, 4, Some(&data)).unwrap();
        assert_eq!(
            crate::resource::TrackedResource::gpu_resource(&buffer).raw().read_bytes(0..64),
            data
        );
        assert_eq!(manager.linear_page_pool_size(LinearAllocatorKind::CpuWritable), 1);
    }

    #[test]
    fn test_shutdown_empties_pools() {
        let (_, manager) = manager(ExecutionMode::Threaded);
        let mut buffer = GpuBuffer::new(&manager, "scratch", 4, 4, None).unwrap();
        let mut list = manager.begin(QueueKind::Direct).unwrap();
        list.compute().clear_uav(&mut buffer).unwrap();
        list.close_and_execute(false).unwrap();
        let held = manager.begin(QueueKind::Copy).unwrap();

        manager.shutdown().unwrap();
        assert_eq!(manager.command_list_pool_size(QueueKind::Direct), 0);
        assert_eq!(manager.allocator_pool_size(QueueKind::Direct), 0);
        assert_eq!(manager.descriptor_page_pool_size(DescriptorHeapType::CbvSrvUav), 0);
        assert_eq!(manager.linear_page_pool_size(LinearAllocatorKind::CpuWritable), 0);

        // A list that was checked out during shutdown still comes back.
        assert_eq!(manager.command_list_pool_size(QueueKind::Copy), 1);
        held.close_and_execute(true).unwrap();
        assert_eq!(manager.free_list_len(QueueKind::Copy), 1);
    }

    #[test]
    fn test_descriptor_allocators_are_per_type() {
        let (raw, manager) = manager(ExecutionMode::Immediate);
        let rtv = manager.allocate_descriptor(DescriptorHeapType::Rtv, 2).unwrap();
        let dsv = manager.allocate_descriptor(DescriptorHeapType::Dsv, 1).unwrap();
        assert_ne!(rtv, dsv);
        assert_eq!(raw.stats().descriptor_heaps_created, 2);
        assert_eq!(manager.destroy_all_descriptor_allocators(), 2);
    }
}
