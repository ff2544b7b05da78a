//! # Command Recording
//!
//! A [`CommandList`] is an exclusively owned recording session checked out from a
//! [`CommandListManager`]. It batches resource barriers, skips redundant pipeline and
//! root signature binds, stages descriptor tables into shader-visible pages and
//! sub-allocates transient memory. Everything it used goes back to the manager's pools
//! when it is submitted, tagged with the fence value of that submission.
//!
//! ## Key Concepts
//!
//! - Context: The pooled recording state behind a [`CommandList`] handle: the native
//!   command list, its allocator, the barrier batch, the bound-state caches, two dynamic
//!   descriptor heaps and two linear allocators. Contexts are created on demand and
//!   recycled through a free list per queue kind.
//! - Barrier batch: Transitions are not recorded immediately. They accumulate in a
//!   batch of up to 16 barriers that reaches the native list in one call, either when
//!   the batch is full, when asked to, or right before a draw, dispatch, copy or clear.
//! - Capability views: [`CommandList::graphics`] and [`CommandList::compute`] borrow the
//!   same list and expose the commands of one bind point.
//!
//! ## Lifecycle
//!
//! ```text
//! begin ──► Recording ──close_and_execute──► back in the free list
//!              │  ▲
//!        finish│  │reset
//!              ▼  │
//!            Finished ──drop──► back in the free list
//! ```
//!
//! Dropping a list that is still recording discards it: nothing is submitted and a
//! warning is logged. Use [`CommandList::discard`] to do the same on purpose.
//!
//! ## Example Usage
//!
//! ```
//! # use scoria::prelude::*;
//! # use scoria::backend::headless::{Headless, HeadlessDevice};
//! # let device = Device::<Headless>::new(HeadlessDevice::default());
//! let manager = CommandListManager::new(device, ManagerConfig::default()).unwrap();
//! let mut target = ColorBuffer::new(
//!     &manager,
//!     "target",
//!     glam::UVec2::new(64, 64),
//!     Format::R8G8B8A8Unorm,
//!     [0.1, 0.2, 0.3, 1.0],
//!     false,
//! )
//! .unwrap();
//!
//! let mut list = manager.begin_named(QueueKind::Direct, "clear").unwrap();
//! list.transition_resource(&mut target, ResourceStates::RENDER_TARGET, false);
//! list.graphics().clear_color(&target);
//! list.transition_resource(&mut target, ResourceStates::PRESENT, false);
//! let fence = list.close_and_execute(true).unwrap();
//! assert!(manager.is_fence_complete(fence));
//! ```

mod compute;
mod copy;
mod graphics;

use std::{fmt::Debug, mem::ManuallyDrop, sync::Arc};

use smallvec::SmallVec;

pub use compute::ComputeCommands;
pub use graphics::GraphicsCommands;

use crate::{
    Result,
    backend::{
        Api, BindPoint, CpuDescriptorHandle, DescriptorHeapType, GpuDescriptorHandle, QueueKind,
        RawCommandList, RawDevice, RootViewKind,
    },
    descriptor::{BoundHeaps, ShaderVisibleHeap},
    dynamic_descriptor::DynamicDescriptorHeap,
    linear::LinearAllocator,
    manager::{CommandListManager, ManagerInner},
    pipeline::PipelineState,
    queue::CommandQueue,
    resource::TrackedResource,
    root_signature::RootSignature,
    tracking::{Barrier, ResourceStates},
};

/// Number of barriers batched before they are flushed to the native list.
pub const MAX_BATCHED_BARRIERS: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordingState {
    Recording,
    Finished,
}

/// The pooled state behind a [`CommandList`].
pub(crate) struct CommandContext<A: Api> {
    id: u64,
    kind: QueueKind,
    name: String,
    state: RecordingState,
    raw: A::CommandList,
    allocator: Option<A::CommandAllocator>,
    /// Fence of the last [`CommandList::flush`] of the current recording.
    last_submitted: Option<u64>,

    barriers: SmallVec<[Barrier<A>; MAX_BATCHED_BARRIERS]>,
    pipeline_state: Option<Arc<PipelineState<A>>>,
    graphics_root_signature: Option<Arc<RootSignature<A>>>,
    compute_root_signature: Option<Arc<RootSignature<A>>>,
    heaps: BoundHeaps<A>,

    view_heap: DynamicDescriptorHeap<A>,
    sampler_heap: DynamicDescriptorHeap<A>,
    gpu_linear: LinearAllocator<A>,
    cpu_linear: LinearAllocator<A>,
    /// Alignment of dynamic root view data.
    alignment: u64,
}

impl<A: Api> Debug for CommandContext<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandContext")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("raw", &self.raw)
            .field("barriers", &self.barriers.len())
            .finish_non_exhaustive()
    }
}

impl<A: Api> CommandContext<A> {
    /// Creates a context that is open for recording.
    pub(crate) fn new(inner: &ManagerInner<A>, kind: QueueKind, id: u64) -> Result<Self> {
        let queue = inner.queues.get(kind);
        let allocator = queue.request_allocator()?;
        let raw = inner.device.create_command_list(kind, &allocator)?;
        Ok(Self {
            id,
            kind,
            name: String::new(),
            state: RecordingState::Recording,
            raw,
            allocator: Some(allocator),
            last_submitted: None,
            barriers: SmallVec::new(),
            pipeline_state: None,
            graphics_root_signature: None,
            compute_root_signature: None,
            heaps: BoundHeaps::default(),
            view_heap: DynamicDescriptorHeap::new(inner.view_pages.clone()),
            sampler_heap: DynamicDescriptorHeap::new(inner.sampler_pages.clone()),
            gpu_linear: LinearAllocator::new(inner.gpu_pages.clone()),
            cpu_linear: LinearAllocator::new(inner.cpu_pages.clone()),
            alignment: inner.config.linear_allocation_alignment,
        })
    }

    pub(crate) fn kind(&self) -> QueueKind {
        self.kind
    }

    pub(crate) fn set_name(&mut self, name: &str) {
        self.name.clear();
        self.name.push_str(name);
    }

    pub(crate) fn is_recording(&self) -> bool {
        self.state == RecordingState::Recording
    }

    /// Reopens a finished context on a fresh allocator.
    pub(crate) fn reset(&mut self, queue: &CommandQueue<A>) -> Result<()> {
        assert_eq!(
            self.state,
            RecordingState::Finished,
            "command list {} reset while recording",
            self.id
        );
        debug_assert!(self.allocator.is_none());
        let allocator = queue.request_allocator()?;
        unsafe { self.raw.reset(&allocator)? };
        self.allocator = Some(allocator);
        self.last_submitted = None;
        self.pipeline_state = None;
        self.graphics_root_signature = None;
        self.compute_root_signature = None;
        self.barriers.clear();
        // Native lists do not keep heap bindings across a reset.
        self.heaps.bind(&mut self.raw);
        self.state = RecordingState::Recording;
        Ok(())
    }

    fn flush_resource_barriers(&mut self) {
        if !self.barriers.is_empty() {
            unsafe { self.raw.resource_barrier(&self.barriers) };
            self.barriers.clear();
        }
    }

    fn push_barrier(&mut self, barrier: Barrier<A>) {
        if self.barriers.len() == MAX_BATCHED_BARRIERS {
            self.flush_resource_barriers();
        }
        self.barriers.push(barrier);
    }

    fn after_barriers(&mut self, flush_immediate: bool) {
        if flush_immediate || self.barriers.len() == MAX_BATCHED_BARRIERS {
            self.flush_resource_barriers();
        }
    }

    fn debug_assert_queue_state(&self, state: ResourceStates) {
        if self.kind == QueueKind::Compute {
            debug_assert!(
                state.is_valid_on_compute_queue(),
                "{state:?} cannot be used on a compute queue"
            );
        }
    }

    /// Closes and submits, then hands everything this recording used back to the pools.
    fn finish(&mut self, queue: &CommandQueue<A>) -> Result<u64> {
        self.assert_recording();
        self.flush_resource_barriers();
        unsafe { self.raw.close()? };
        let fence = unsafe { queue.execute_command_list(&self.raw)? };
        self.release_resources(queue, fence);
        Ok(fence)
    }

    /// Closes without submitting. Nothing recorded since the last flush reaches the GPU.
    fn discard(&mut self, queue: &CommandQueue<A>) {
        self.barriers.clear();
        if let Err(err) = unsafe { self.raw.close() } {
            tracing::error!("Failed to close discarded command list {}: {}", self.id, err);
        }
        let fence = self
            .last_submitted
            .unwrap_or_else(|| queue.last_completed_fence());
        self.release_resources(queue, fence);
    }

    fn release_resources(&mut self, queue: &CommandQueue<A>, fence: u64) {
        if let Some(allocator) = self.allocator.take() {
            queue.discard_allocator(fence, allocator);
        }
        self.cpu_linear.cleanup_used_pages(fence);
        self.gpu_linear.cleanup_used_pages(fence);
        self.view_heap.cleanup_used_heaps(fence);
        self.sampler_heap.cleanup_used_heaps(fence);
        self.state = RecordingState::Finished;
    }

    /// Submits what was recorded so far and keeps recording on the same allocator.
    fn flush(&mut self, queue: &CommandQueue<A>, wait: bool) -> Result<u64> {
        self.assert_recording();
        self.flush_resource_barriers();
        unsafe { self.raw.close()? };
        let fence = unsafe { queue.execute_command_list(&self.raw)? };
        self.last_submitted = Some(fence);
        if wait {
            queue.wait_for_fence(fence)?;
        }
        let Some(allocator) = &self.allocator else {
            unreachable!("recording command list without an allocator");
        };
        unsafe { self.raw.reset(allocator)? };

        if let Some(signature) = &self.graphics_root_signature {
            unsafe { self.raw.set_root_signature(BindPoint::Graphics, signature.raw()) };
        }
        if let Some(signature) = &self.compute_root_signature {
            unsafe { self.raw.set_root_signature(BindPoint::Compute, signature.raw()) };
        }
        if let Some(pipeline) = &self.pipeline_state {
            unsafe { self.raw.set_pipeline_state(pipeline.raw()) };
        }
        self.heaps.bind(&mut self.raw);
        // Root tables were dropped with the native state.
        self.view_heap.unbind_all_valid();
        self.sampler_heap.unbind_all_valid();
        Ok(fence)
    }

    fn assert_recording(&self) {
        assert!(
            self.is_recording(),
            "command list {} is not recording",
            self.id
        );
    }

    fn set_pipeline_state(&mut self, pipeline: &Arc<PipelineState<A>>) {
        if self
            .pipeline_state
            .as_ref()
            .is_some_and(|bound| Arc::ptr_eq(bound, pipeline))
        {
            return;
        }
        unsafe { self.raw.set_pipeline_state(pipeline.raw()) };
        self.pipeline_state = Some(pipeline.clone());
    }

    fn set_root_signature(&mut self, bind_point: BindPoint, signature: &Arc<RootSignature<A>>) {
        let slot = match bind_point {
            BindPoint::Graphics => &mut self.graphics_root_signature,
            BindPoint::Compute => &mut self.compute_root_signature,
        };
        if slot.as_ref().is_some_and(|bound| Arc::ptr_eq(bound, signature)) {
            return;
        }
        *slot = Some(signature.clone());
        unsafe { self.raw.set_root_signature(bind_point, signature.raw()) };
        match bind_point {
            BindPoint::Graphics => {
                self.view_heap.parse_graphics_root_signature(signature);
                self.sampler_heap.parse_graphics_root_signature(signature);
            }
            BindPoint::Compute => {
                self.view_heap.parse_compute_root_signature(signature);
                self.sampler_heap.parse_compute_root_signature(signature);
            }
        }
    }

    fn dynamic_heap(&mut self, ty: DescriptorHeapType) -> &mut DynamicDescriptorHeap<A> {
        match ty {
            DescriptorHeapType::CbvSrvUav => &mut self.view_heap,
            DescriptorHeapType::Sampler => &mut self.sampler_heap,
            other => panic!("{other:?} descriptors cannot be staged for shaders"),
        }
    }

    /// Flushes barriers and commits the staged tables of `bind_point`. Runs before
    /// every draw and dispatch.
    fn prepare(&mut self, bind_point: BindPoint) -> Result<()> {
        self.flush_resource_barriers();
        match bind_point {
            BindPoint::Graphics => {
                self.view_heap
                    .commit_graphics_root_descriptor_tables(&mut self.raw, &mut self.heaps)?;
                self.sampler_heap
                    .commit_graphics_root_descriptor_tables(&mut self.raw, &mut self.heaps)?;
            }
            BindPoint::Compute => {
                self.view_heap
                    .commit_compute_root_descriptor_tables(&mut self.raw, &mut self.heaps)?;
                self.sampler_heap
                    .commit_compute_root_descriptor_tables(&mut self.raw, &mut self.heaps)?;
            }
        }
        Ok(())
    }

    fn set_constants(&mut self, bind_point: BindPoint, root_index: u32, dest_offset: u32, values: &[u32]) {
        unsafe {
            self.raw
                .set_root_constants(bind_point, root_index, dest_offset, values)
        };
    }

    fn set_root_view(&mut self, bind_point: BindPoint, root_index: u32, kind: RootViewKind, gpu_address: u64) {
        unsafe {
            self.raw
                .set_root_view(bind_point, root_index, kind, gpu_address)
        };
    }

    /// Copies `data` into upload memory and binds it as a root view.
    fn set_dynamic_view(
        &mut self,
        bind_point: BindPoint,
        root_index: u32,
        kind: RootViewKind,
        data: &[u8],
    ) -> Result<()> {
        let mut alloc = self
            .cpu_linear
            .allocate(data.len() as u64, self.alignment)?;
        alloc.write(data);
        self.set_root_view(bind_point, root_index, kind, alloc.gpu_address());
        Ok(())
    }

    fn set_descriptor_table(&mut self, bind_point: BindPoint, root_index: u32, base: GpuDescriptorHandle) {
        unsafe {
            self.raw
                .set_root_descriptor_table(bind_point, root_index, base)
        };
    }

    fn stage_descriptors(
        &mut self,
        ty: DescriptorHeapType,
        bind_point: BindPoint,
        root_index: u32,
        offset: u32,
        handles: &[CpuDescriptorHandle],
    ) {
        let heap = self.dynamic_heap(ty);
        match bind_point {
            BindPoint::Graphics => heap.set_graphics_descriptor_handles(root_index, offset, handles),
            BindPoint::Compute => heap.set_compute_descriptor_handles(root_index, offset, handles),
        }
    }

    /// Copies `cpu` into the current view page for a UAV clear.
    fn upload_direct(&mut self, cpu: CpuDescriptorHandle) -> Result<GpuDescriptorHandle> {
        self.view_heap
            .upload_direct(&mut self.raw, &mut self.heaps, cpu)
    }
}

/// Root signature and binding commands shared by both capability views.
macro_rules! bind_point_commands {
    ($view:ident, $bind_point:expr) => {
        impl<A: $crate::backend::Api> $view<'_, A> {
            /// Binds `signature` and lays out the dynamic descriptor caches for its
            /// tables. Skipped when `signature` is already bound.
            pub fn set_root_signature(
                &mut self,
                signature: &std::sync::Arc<$crate::root_signature::RootSignature<A>>,
            ) {
                self.context().set_root_signature($bind_point, signature);
            }

            pub fn set_constant(&mut self, root_index: u32, offset: u32, value: u32) {
                self.context()
                    .set_constants($bind_point, root_index, offset, &[value]);
            }

            /// Sets 32-bit root constants starting at offset zero.
            pub fn set_constants(&mut self, root_index: u32, values: &[u32]) {
                self.context()
                    .set_constants($bind_point, root_index, 0, values);
            }

            /// Binds a root constant buffer view by GPU address.
            pub fn set_constant_buffer(&mut self, root_index: u32, gpu_address: u64) {
                self.context().set_root_view(
                    $bind_point,
                    root_index,
                    $crate::backend::RootViewKind::ConstantBuffer,
                    gpu_address,
                );
            }

            /// Copies `data` into upload memory that stays valid until this list
            /// completes, and binds it as a root constant buffer.
            pub fn set_dynamic_constant_buffer_view(
                &mut self,
                root_index: u32,
                data: &[u8],
            ) -> $crate::Result<()> {
                self.context().set_dynamic_view(
                    $bind_point,
                    root_index,
                    $crate::backend::RootViewKind::ConstantBuffer,
                    data,
                )
            }

            /// [`set_dynamic_constant_buffer_view`](Self::set_dynamic_constant_buffer_view)
            /// for a plain-old-data value.
            pub fn set_dynamic_constants<T: bytemuck::Pod>(
                &mut self,
                root_index: u32,
                value: &T,
            ) -> $crate::Result<()> {
                self.set_dynamic_constant_buffer_view(root_index, bytemuck::bytes_of(value))
            }

            /// Binds `buffer` as a root shader resource view. It must already be in a
            /// shader resource state.
            pub fn set_buffer_srv(
                &mut self,
                root_index: u32,
                buffer: &$crate::resource::GpuBuffer<A>,
                offset: u64,
            ) {
                use $crate::resource::TrackedResource;
                debug_assert!(
                    buffer.gpu_resource().usage_state().intersects(
                        $crate::tracking::ResourceStates::PIXEL_SHADER_RESOURCE
                            | $crate::tracking::ResourceStates::NON_PIXEL_SHADER_RESOURCE
                    ),
                    "buffer bound as SRV in {:?}",
                    buffer.gpu_resource().usage_state()
                );
                self.context().set_root_view(
                    $bind_point,
                    root_index,
                    $crate::backend::RootViewKind::ShaderResource,
                    buffer.gpu_address() + offset,
                );
            }

            /// Binds `buffer` as a root unordered access view. It must already be in
            /// `UNORDERED_ACCESS`.
            pub fn set_buffer_uav(
                &mut self,
                root_index: u32,
                buffer: &$crate::resource::GpuBuffer<A>,
                offset: u64,
            ) {
                use $crate::resource::TrackedResource;
                debug_assert!(
                    buffer
                        .gpu_resource()
                        .usage_state()
                        .contains($crate::tracking::ResourceStates::UNORDERED_ACCESS),
                    "buffer bound as UAV in {:?}",
                    buffer.gpu_resource().usage_state()
                );
                self.context().set_root_view(
                    $bind_point,
                    root_index,
                    $crate::backend::RootViewKind::UnorderedAccess,
                    buffer.gpu_address() + offset,
                );
            }

            /// Copies `data` into upload memory and binds it as a root shader
            /// resource view.
            pub fn set_dynamic_srv(&mut self, root_index: u32, data: &[u8]) -> $crate::Result<()> {
                self.context().set_dynamic_view(
                    $bind_point,
                    root_index,
                    $crate::backend::RootViewKind::ShaderResource,
                    data,
                )
            }

            /// Binds a table that already lives in a shader-visible heap.
            pub fn set_descriptor_table(
                &mut self,
                root_index: u32,
                base: $crate::backend::GpuDescriptorHandle,
            ) {
                self.context()
                    .set_descriptor_table($bind_point, root_index, base);
            }

            pub fn set_dynamic_descriptor(
                &mut self,
                root_index: u32,
                offset: u32,
                handle: $crate::backend::CpuDescriptorHandle,
            ) {
                self.set_dynamic_descriptors(root_index, offset, &[handle]);
            }

            /// Stages CPU descriptors into a table. They are copied into a
            /// shader-visible page by the next draw or dispatch.
            pub fn set_dynamic_descriptors(
                &mut self,
                root_index: u32,
                offset: u32,
                handles: &[$crate::backend::CpuDescriptorHandle],
            ) {
                self.context().stage_descriptors(
                    $crate::backend::DescriptorHeapType::CbvSrvUav,
                    $bind_point,
                    root_index,
                    offset,
                    handles,
                );
            }

            pub fn set_dynamic_sampler(
                &mut self,
                root_index: u32,
                offset: u32,
                handle: $crate::backend::CpuDescriptorHandle,
            ) {
                self.set_dynamic_samplers(root_index, offset, &[handle]);
            }

            pub fn set_dynamic_samplers(
                &mut self,
                root_index: u32,
                offset: u32,
                handles: &[$crate::backend::CpuDescriptorHandle],
            ) {
                self.context().stage_descriptors(
                    $crate::backend::DescriptorHeapType::Sampler,
                    $bind_point,
                    root_index,
                    offset,
                    handles,
                );
            }
        }
    };
}
use bind_point_commands;

/// An exclusively owned recording session. See the [module docs](self).
///
/// `Send` but not `Sync`: a list may move to another thread, but is only ever recorded
/// from one thread at a time.
pub struct CommandList<A: Api> {
    manager: CommandListManager<A>,
    context: ManuallyDrop<Box<CommandContext<A>>>,
}

impl<A: Api> Debug for CommandList<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CommandList").field(&**self.context).finish()
    }
}

impl<A: Api> Drop for CommandList<A> {
    fn drop(&mut self) {
        let mut context = unsafe { ManuallyDrop::take(&mut self.context) };
        if context.is_recording() {
            tracing::warn!(
                "Command list {} ({:?}, {:?}) dropped while recording; discarding its commands",
                context.id,
                context.name,
                context.kind
            );
            context.discard(self.manager.queue(context.kind));
        }
        self.manager.release(context);
    }
}

impl<A: Api> CommandList<A> {
    pub(crate) fn new(manager: CommandListManager<A>, context: Box<CommandContext<A>>) -> Self {
        Self {
            manager,
            context: ManuallyDrop::new(context),
        }
    }

    /// Identifies the pooled context. Unique among lists that are checked out at the
    /// same time.
    pub fn id(&self) -> u64 {
        self.context.id
    }

    pub fn name(&self) -> &str {
        &self.context.name
    }

    pub fn kind(&self) -> QueueKind {
        self.context.kind
    }

    pub fn state(&self) -> RecordingState {
        self.context.state
    }

    pub fn manager(&self) -> &CommandListManager<A> {
        &self.manager
    }

    /// The native command list.
    pub fn raw(&self) -> &A::CommandList {
        &self.context.raw
    }

    /// Records native commands directly. Barriers are flushed first so that the
    /// recorded order is preserved.
    ///
    /// # Safety
    /// Commands that change state cached by this list (pipeline, root signatures,
    /// descriptor heaps) leave the caches out of date.
    pub unsafe fn raw_mut(&mut self) -> &mut A::CommandList {
        self.context.flush_resource_barriers();
        &mut self.context.raw
    }

    /// Number of barriers waiting to be flushed.
    pub fn pending_barriers(&self) -> usize {
        self.context.barriers.len()
    }

    fn recording(&mut self) -> &mut CommandContext<A> {
        self.context.assert_recording();
        &mut self.context
    }

    /// Records a transition of `resource` to `new_state`.
    ///
    /// An outstanding split transition is ended first. A resource that stays in
    /// `UNORDERED_ACCESS` gets a UAV barrier instead of a transition.
    pub fn transition_resource(
        &mut self,
        resource: &mut impl TrackedResource<A>,
        new_state: ResourceStates,
        flush_immediate: bool,
    ) {
        let context = self.recording();
        let resource = resource.gpu_resource_mut();
        context.debug_assert_queue_state(resource.usage_state());
        context.debug_assert_queue_state(new_state);
        for barrier in resource.transition(new_state) {
            context.push_barrier(barrier);
        }
        context.after_barriers(flush_immediate);
    }

    /// Records the begin half of a split transition. The transition completes with a
    /// later [`CommandList::transition_resource`] to the same state.
    pub fn begin_resource_transition(
        &mut self,
        resource: &mut impl TrackedResource<A>,
        new_state: ResourceStates,
        flush_immediate: bool,
    ) {
        let context = self.recording();
        let resource = resource.gpu_resource_mut();
        context.debug_assert_queue_state(new_state);
        for barrier in resource.begin_transition(new_state) {
            context.push_barrier(barrier);
        }
        context.after_barriers(flush_immediate);
    }

    pub fn insert_uav_barrier(&mut self, resource: &impl TrackedResource<A>, flush_immediate: bool) {
        let context = self.recording();
        context.push_barrier(Barrier::Uav {
            resource: Some(resource.gpu_resource().raw().clone()),
        });
        context.after_barriers(flush_immediate);
    }

    /// Orders every unordered-access write before every later unordered-access use.
    pub fn insert_global_uav_barrier(&mut self, flush_immediate: bool) {
        let context = self.recording();
        context.push_barrier(Barrier::Uav { resource: None });
        context.after_barriers(flush_immediate);
    }

    pub fn insert_alias_barrier(
        &mut self,
        before: Option<&dyn TrackedResource<A>>,
        after: Option<&dyn TrackedResource<A>>,
        flush_immediate: bool,
    ) {
        let context = self.recording();
        context.push_barrier(Barrier::Aliasing {
            before: before.map(|resource| resource.gpu_resource().raw().clone()),
            after: after.map(|resource| resource.gpu_resource().raw().clone()),
        });
        context.after_barriers(flush_immediate);
    }

    /// Records the batched barriers in one native call.
    pub fn flush_resource_barriers(&mut self) {
        self.recording().flush_resource_barriers();
    }

    /// Binds a shader-visible heap for `ty`.
    pub fn set_descriptor_heap(&mut self, ty: DescriptorHeapType, heap: &Arc<ShaderVisibleHeap<A>>) {
        assert_eq!(heap.ty(), ty, "binding a {:?} heap as {ty:?}", heap.ty());
        let context = self.recording();
        context.heaps.set(&mut context.raw, heap);
    }

    /// Binds several shader-visible heaps with at most one native call.
    pub fn set_descriptor_heaps(&mut self, heaps: &[Arc<ShaderVisibleHeap<A>>]) {
        let context = self.recording();
        context.heaps.set_many(&mut context.raw, heaps);
    }

    /// Binds `pipeline`, unless it is already bound.
    pub fn set_pipeline_state(&mut self, pipeline: &Arc<PipelineState<A>>) {
        self.recording().set_pipeline_state(pipeline);
    }

    /// Graphics commands. Only valid on direct lists.
    pub fn graphics(&mut self) -> GraphicsCommands<'_, A> {
        debug_assert_eq!(
            self.kind(),
            QueueKind::Direct,
            "graphics commands need a direct command list"
        );
        GraphicsCommands::new(self)
    }

    /// Compute commands. Valid on direct and compute lists.
    pub fn compute(&mut self) -> ComputeCommands<'_, A> {
        debug_assert_ne!(
            self.kind(),
            QueueKind::Copy,
            "compute commands need a direct or compute command list"
        );
        ComputeCommands::new(self)
    }

    /// Closes and submits the list, and returns everything it used to the pools tagged
    /// with the returned fence value. With `wait`, blocks until that value completes.
    ///
    /// The list is then finished: drop it, or [`reset`](CommandList::reset) it to record
    /// again.
    pub fn finish(&mut self, wait: bool) -> Result<u64> {
        let kind = self.context.kind;
        let fence = self.context.finish(self.manager.queue(kind))?;
        tracing::trace!(
            "Finished command list {} ({:?}), fence = {:#x}",
            self.context.id,
            self.context.name,
            fence
        );
        if wait {
            self.manager.wait_for_fence(fence)?;
        }
        Ok(fence)
    }

    /// [`finish`](CommandList::finish)es the list and returns it to the free list.
    pub fn close_and_execute(mut self, wait: bool) -> Result<u64> {
        self.finish(wait)
    }

    /// Starts a new recording on a finished list.
    pub fn reset(&mut self) -> Result<()> {
        let kind = self.context.kind;
        self.context.reset(self.manager.queue(kind))
    }

    /// Submits what has been recorded so far and keeps the list open. Bound pipeline,
    /// root signatures and descriptor heaps carry over.
    pub fn flush(&mut self, wait: bool) -> Result<u64> {
        let kind = self.context.kind;
        self.context.flush(self.manager.queue(kind), wait)
    }

    /// Throws the recording away without submitting it.
    ///
    /// Resource states changed by the discarded transitions are not rolled back.
    pub fn discard(mut self) {
        if self.context.is_recording() {
            let kind = self.context.kind;
            self.context.discard(self.manager.queue(kind));
        }
    }
}
