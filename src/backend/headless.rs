//! Software backend with a simulated GPU timeline.
//!
//! The headless device records commands into plain Rust values, executes copies and
//! buffer clears against host memory, and signals fences according to an
//! [`ExecutionMode`]:
//!
//! - [`ExecutionMode::Immediate`]: work completes during submission.
//! - [`ExecutionMode::Manual`]: work completes only when asked, through
//!   [`HeadlessDevice::step`], [`HeadlessDevice::complete_all`],
//!   [`HeadlessDevice::complete_until`], or a host wait on a fence.
//! - [`ExecutionMode::Threaded`]: each queue runs on its own worker thread, fed through
//!   a channel, so fences complete asynchronously.
//!
//! The device counts native calls ([`HeadlessStats`]) and can capture executed command
//! lists, which makes it the backend of choice for testing the layers above.
//!
//! It also checks that no command allocator is reset while a submission recorded from
//! it may still be executing.
use std::{
    collections::{HashMap, VecDeque},
    fmt::Debug,
    ptr::NonNull,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use event_listener::{Event, Listener};
use glam::UVec3;

use super::{
    Api, BindPoint, BufferDesc, BufferViewDesc, ClearFlags, CpuDescriptorHandle,
    DescriptorHeapDesc, DescriptorHeapType, GpuDescriptorHandle, HeapKind, IndexBufferView,
    PrimitiveTopology, QueueKind, RawCommandList, RawDevice, RawQueue, RootViewKind, SamplerDesc,
    ScissorRect, TextureDesc, VertexBufferView, Viewport,
};
use crate::{
    Error, Result,
    root_signature::RootSignatureDesc,
    tracking::{Barrier, ResourceStates, SplitBarrier},
};

/// The headless backend.
#[derive(Debug)]
pub enum Headless {}

impl Api for Headless {
    type Device = HeadlessDevice;
    type Queue = HeadlessQueue;
    type CommandAllocator = HeadlessCommandAllocator;
    type CommandList = HeadlessCommandList;
    type Fence = HeadlessFence;
    type DescriptorHeap = HeadlessDescriptorHeap;
    type Resource = HeadlessResource;
    type RootSignature = HeadlessRootSignature;
    type PipelineState = HeadlessPipelineState;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    #[default]
    Immediate,
    Manual,
    Threaded,
}

#[derive(Clone, Debug, Default)]
pub struct HeadlessConfig {
    pub mode: ExecutionMode,
    /// Keep every executed command list for [`HeadlessDevice::take_executed`].
    pub capture: bool,
    /// Simulated execution time of each submission in threaded mode.
    pub latency: Duration,
}

macro_rules! counters {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        #[derive(Default)]
        struct Counters {
            $($name: AtomicU64,)*
        }

        /// Native call counts since the device was created.
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
        pub struct HeadlessStats {
            $($(#[$meta])* pub $name: u64,)*
        }

        impl Counters {
            fn snapshot(&self) -> HeadlessStats {
                HeadlessStats {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    set_pipeline_state,
    set_root_signature,
    set_descriptor_heaps,
    set_descriptor_table,
    /// Calls to `resource_barrier`, each carrying a batch.
    barrier_calls,
    barriers,
    copy_descriptors_calls,
    descriptors_copied,
    draws,
    dispatches,
    clears,
    copies,
    submissions,
    executed_lists,
    command_lists_created,
    allocators_created,
    allocator_resets,
    descriptor_heaps_created,
    buffers_created,
    textures_created,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

/// The headless device. Cloning shares the device.
#[derive(Clone)]
pub struct HeadlessDevice(Arc<Shared>);

struct Shared {
    config: HeadlessConfig,
    next_id: AtomicU64,
    next_gpu_address: AtomicU64,
    heaps: RwLock<HashMap<u32, Arc<HeapStorage>>>,
    counters: Counters,
    captured: Mutex<Vec<ExecutedList>>,
    /// Allocator id to the fence signal that retires its latest submission.
    in_flight_allocators: Mutex<HashMap<u64, (HeadlessFence, u64)>>,
    timeline: Mutex<ManualTimeline>,
    /// Notified whenever manual work is submitted or executed.
    progress: Event,
}

impl Debug for HeadlessDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessDevice")
            .field("mode", &self.0.config.mode)
            .finish_non_exhaustive()
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new(HeadlessConfig::default())
    }
}

impl HeadlessDevice {
    pub fn new(config: HeadlessConfig) -> Self {
        Self(Arc::new(Shared {
            config,
            next_id: AtomicU64::new(1),
            next_gpu_address: AtomicU64::new(1 << 32),
            heaps: RwLock::new(HashMap::new()),
            counters: Counters::default(),
            captured: Mutex::new(Vec::new()),
            in_flight_allocators: Mutex::new(HashMap::new()),
            timeline: Mutex::new(ManualTimeline::default()),
            progress: Event::new(),
        }))
    }

    pub fn config(&self) -> &HeadlessConfig {
        &self.0.config
    }

    pub fn stats(&self) -> HeadlessStats {
        self.0.counters.snapshot()
    }

    /// Drains the command lists executed since the last call. Empty unless
    /// [`HeadlessConfig::capture`] is set.
    pub fn take_executed(&self) -> Vec<ExecutedList> {
        std::mem::take(&mut *self.0.captured.lock().unwrap())
    }

    /// Creates a pipeline state object. Pipeline contents are not simulated.
    pub fn create_pipeline_state(&self, bind_point: BindPoint, name: &str) -> HeadlessPipelineState {
        HeadlessPipelineState {
            id: self.0.next_id(),
            bind_point,
            name: name.to_owned(),
        }
    }

    /// Reads back the descriptor stored at `handle`.
    pub fn descriptor(&self, handle: CpuDescriptorHandle) -> Descriptor {
        let (heap, slot) = self.0.resolve(handle.0 as u64);
        heap.slots.lock().unwrap()[slot].clone()
    }

    /// Reads back the descriptor a shader would see at `handle`.
    pub fn descriptor_at_gpu(&self, handle: GpuDescriptorHandle) -> Descriptor {
        let (heap, slot) = self.0.resolve(handle.0);
        assert!(heap.shader_visible, "{handle:?} is not shader visible");
        heap.slots.lock().unwrap()[slot].clone()
    }

    /// Executes the oldest runnable manual submission. Returns `false` if nothing could
    /// run.
    pub fn step(&self) -> bool {
        let progressed = self.0.timeline.lock().unwrap().step(&self.0);
        if progressed {
            self.0.progress.notify(usize::MAX);
        }
        progressed
    }

    /// Executes manual submissions until nothing is runnable.
    pub fn complete_all(&self) {
        while self.step() {}
    }

    /// Executes manual submissions until `fence` reaches `value` or nothing is runnable.
    pub fn complete_until(&self, fence: &HeadlessFence, value: u64) {
        while fence.value() < value && self.step() {}
    }

    /// Number of manual submissions not yet executed.
    pub fn pending_ops(&self) -> usize {
        self.0.timeline.lock().unwrap().len()
    }
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn resolve(&self, handle: u64) -> (Arc<HeapStorage>, usize) {
        let heap_id = (handle >> 32) as u32;
        let slot = (handle & 0xFFFF_FFFF) as usize;
        let heaps = self.heaps.read().unwrap();
        let Some(heap) = heaps.get(&heap_id) else {
            panic!("descriptor handle {handle:#x} does not belong to a live heap");
        };
        assert!(
            slot < heap.capacity,
            "descriptor handle {handle:#x} is out of bounds for a heap of {}",
            heap.capacity
        );
        (heap.clone(), slot)
    }

    fn write_descriptor(&self, dest: CpuDescriptorHandle, ty: DescriptorHeapType, descriptor: Descriptor) {
        let (heap, slot) = self.resolve(dest.0 as u64);
        assert_eq!(heap.ty, ty, "descriptor written into a {:?} heap", heap.ty);
        heap.slots.lock().unwrap()[slot] = descriptor;
    }

    fn execute(&self, queue: QueueKind, list_id: u64, commands: &Arc<[Command]>) {
        for command in commands.iter() {
            match command {
                Command::CopyBufferRegion {
                    dst,
                    dst_offset,
                    src,
                    src_offset,
                    size,
                } => dst.copy_from(*dst_offset, src, *src_offset, *size),
                Command::CopyResource { dst, src } => {
                    let size = dst.0.size.min(src.0.size);
                    dst.copy_from(0, src, 0, size)
                }
                Command::ClearUavUint { resource, values } => resource.fill(values[0]),
                Command::ClearUavFloat { resource, values } => resource.fill(values[0].to_bits()),
                _ => {}
            }
        }
        bump(&self.counters.executed_lists, 1);
        if self.config.capture {
            self.captured.lock().unwrap().push(ExecutedList {
                queue,
                list_id,
                commands: commands.clone(),
            });
        }
    }

    fn run(&self, queue: QueueKind, op: GpuOp) {
        match op {
            GpuOp::Execute(lists) => {
                for (list_id, commands) in lists {
                    self.execute(queue, list_id, &commands);
                }
            }
            GpuOp::Signal(fence, value) => fence.signal(value),
            GpuOp::Wait(fence, value) => fence.wait_host(value),
        }
    }
}

/// A command list as executed by the device.
#[derive(Clone, Debug)]
pub struct ExecutedList {
    pub queue: QueueKind,
    pub list_id: u64,
    pub commands: Arc<[Command]>,
}

impl ExecutedList {
    /// All barriers in submission order.
    pub fn barriers(&self) -> impl Iterator<Item = &BarrierRecord> {
        self.commands.iter().flat_map(|command| match command {
            Command::Barrier(barriers) => barriers.as_slice(),
            _ => &[],
        })
    }
}

enum GpuOp {
    Execute(Vec<(u64, Arc<[Command]>)>),
    Signal(HeadlessFence, u64),
    Wait(HeadlessFence, u64),
}

impl GpuOp {
    fn is_ready(&self) -> bool {
        match self {
            GpuOp::Wait(fence, value) => fence.value() >= *value,
            _ => true,
        }
    }
}

#[derive(Default)]
struct ManualTimeline {
    next_seq: u64,
    queues: Vec<(u64, QueueKind, VecDeque<(u64, GpuOp)>)>,
}

impl ManualTimeline {
    fn push(&mut self, queue_id: u64, kind: QueueKind, op: GpuOp) {
        let seq = self.next_seq;
        self.next_seq += 1;
        match self.queues.iter_mut().find(|(id, ..)| *id == queue_id) {
            Some((_, _, ops)) => ops.push_back((seq, op)),
            None => self.queues.push((queue_id, kind, VecDeque::from([(seq, op)]))),
        }
    }

    fn len(&self) -> usize {
        self.queues.iter().map(|(_, _, ops)| ops.len()).sum()
    }

    fn step(&mut self, shared: &Shared) -> bool {
        let mut oldest: Option<(usize, u64)> = None;
        for (index, (_, _, ops)) in self.queues.iter().enumerate() {
            if let Some((seq, op)) = ops.front()
                && op.is_ready()
                && oldest.is_none_or(|(_, oldest_seq)| *seq < oldest_seq)
            {
                oldest = Some((index, *seq));
            }
        }
        let Some((index, _)) = oldest else {
            return false;
        };
        let (_, kind, ops) = &mut self.queues[index];
        let Some((_, op)) = ops.pop_front() else {
            return false;
        };
        shared.run(*kind, op);
        true
    }
}

impl RawDevice<Headless> for HeadlessDevice {
    fn create_queue(&self, kind: QueueKind) -> Result<HeadlessQueue> {
        let id = self.0.next_id();
        let worker = if self.0.config.mode == ExecutionMode::Threaded {
            let (sender, receiver) = crossbeam_channel::unbounded::<GpuOp>();
            let shared = self.0.clone();
            let latency = self.0.config.latency;
            let handle = std::thread::Builder::new()
                .name(format!("headless {kind:?} queue"))
                .spawn(move || {
                    while let Ok(op) = receiver.recv() {
                        if !latency.is_zero() && matches!(op, GpuOp::Execute(_)) {
                            std::thread::sleep(latency);
                        }
                        shared.run(kind, op);
                    }
                })
                .map_err(|_| Error::Native {
                    call: "spawn queue thread",
                    code: -1,
                })?;
            Some((sender, handle))
        } else {
            None
        };
        Ok(HeadlessQueue {
            id,
            kind,
            device: self.clone(),
            worker,
        })
    }

    fn create_fence(&self, initial_value: u64) -> Result<HeadlessFence> {
        Ok(HeadlessFence(Arc::new(FenceState {
            id: self.0.next_id(),
            value: AtomicU64::new(initial_value),
            event: Event::new(),
        })))
    }

    fn completed_fence_value(&self, fence: &HeadlessFence) -> Result<u64> {
        Ok(fence.value())
    }

    fn wait_for_fence(&self, fence: &HeadlessFence, value: u64) -> Result<()> {
        if self.0.config.mode != ExecutionMode::Manual {
            fence.wait_host(value);
            return Ok(());
        }
        // A host wait in manual mode drives the timeline forward.
        loop {
            if fence.value() >= value {
                return Ok(());
            }
            let listener = self.0.progress.listen();
            if self.step() {
                continue;
            }
            if fence.value() >= value {
                return Ok(());
            }
            listener.wait();
        }
    }

    fn create_command_allocator(&self, kind: QueueKind) -> Result<HeadlessCommandAllocator> {
        bump(&self.0.counters.allocators_created, 1);
        Ok(HeadlessCommandAllocator {
            id: self.0.next_id(),
            kind,
            resets: 0,
        })
    }

    unsafe fn reset_command_allocator(&self, allocator: &mut HeadlessCommandAllocator) -> Result<()> {
        if let Some((fence, value)) = self.0.in_flight_allocators.lock().unwrap().remove(&allocator.id) {
            assert!(
                fence.value() >= value,
                "command allocator {} reset before fence {value:#x} completed",
                allocator.id
            );
        }
        allocator.resets += 1;
        bump(&self.0.counters.allocator_resets, 1);
        Ok(())
    }

    fn create_command_list(
        &self,
        kind: QueueKind,
        allocator: &HeadlessCommandAllocator,
    ) -> Result<HeadlessCommandList> {
        assert_eq!(kind, allocator.kind, "allocator belongs to another queue kind");
        bump(&self.0.counters.command_lists_created, 1);
        Ok(HeadlessCommandList {
            id: self.0.next_id(),
            kind,
            device: self.clone(),
            allocator: allocator.id,
            recording: true,
            commands: Vec::new(),
            recorded: Arc::from([]),
        })
    }

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> Result<HeadlessDescriptorHeap> {
        assert!(
            !desc.shader_visible || desc.ty.is_shader_visible_capable(),
            "{:?} heaps cannot be shader visible",
            desc.ty
        );
        let id = self.0.next_id() as u32;
        let storage = Arc::new(HeapStorage {
            id,
            ty: desc.ty,
            shader_visible: desc.shader_visible,
            capacity: desc.count as usize,
            slots: Mutex::new(vec![Descriptor::Empty; desc.count as usize]),
        });
        self.0.heaps.write().unwrap().insert(id, storage.clone());
        bump(&self.0.counters.descriptor_heaps_created, 1);
        Ok(HeadlessDescriptorHeap {
            device: self.clone(),
            storage,
        })
    }

    fn descriptor_heap_start(
        &self,
        heap: &HeadlessDescriptorHeap,
    ) -> (CpuDescriptorHandle, GpuDescriptorHandle) {
        let base = (heap.storage.id as u64) << 32;
        let gpu = if heap.storage.shader_visible {
            GpuDescriptorHandle(base)
        } else {
            GpuDescriptorHandle::NULL
        };
        (CpuDescriptorHandle(base as usize), gpu)
    }

    fn descriptor_increment_size(&self, _ty: DescriptorHeapType) -> u32 {
        1
    }

    unsafe fn copy_descriptors(
        &self,
        dst: &[(CpuDescriptorHandle, u32)],
        src: &[(CpuDescriptorHandle, u32)],
        ty: DescriptorHeapType,
    ) {
        let expand = |ranges: &[(CpuDescriptorHandle, u32)]| -> Vec<CpuDescriptorHandle> {
            ranges
                .iter()
                .flat_map(|(start, count)| (0..*count).map(move |i| start.offset(i, 1)))
                .collect()
        };
        let dst = expand(dst);
        let src = expand(src);
        assert_eq!(dst.len(), src.len(), "descriptor copy ranges differ in size");
        for (dst, src) in dst.iter().zip(src.iter()) {
            let (heap, slot) = self.0.resolve(src.0 as u64);
            assert_eq!(heap.ty, ty);
            let descriptor = heap.slots.lock().unwrap()[slot].clone();
            self.0.write_descriptor(*dst, ty, descriptor);
        }
        bump(&self.0.counters.copy_descriptors_calls, 1);
        bump(&self.0.counters.descriptors_copied, dst.len() as u64);
    }

    unsafe fn copy_descriptors_simple(
        &self,
        count: u32,
        dst: CpuDescriptorHandle,
        src: CpuDescriptorHandle,
        ty: DescriptorHeapType,
    ) {
        unsafe { self.copy_descriptors(&[(dst, count)], &[(src, count)], ty) }
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<HeadlessResource> {
        let size = desc.size.max(1);
        let gpu_address = self
            .0
            .next_gpu_address
            .fetch_add(size.next_multiple_of(1 << 16), Ordering::Relaxed);
        bump(&self.0.counters.buffers_created, 1);
        Ok(HeadlessResource(Arc::new(ResourceData {
            id: self.0.next_id(),
            name: desc.name.clone(),
            size: desc.size,
            heap: desc.heap,
            texture: None,
            gpu_address,
            memory: HostMemory::zeroed(desc.size as usize),
        })))
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<HeadlessResource> {
        let size = desc.width as u64
            * desc.height as u64
            * desc.array_layers as u64
            * desc.format.bytes_per_texel() as u64;
        bump(&self.0.counters.textures_created, 1);
        Ok(HeadlessResource(Arc::new(ResourceData {
            id: self.0.next_id(),
            name: desc.name.clone(),
            size,
            heap: HeapKind::Default,
            texture: Some(desc.clone()),
            gpu_address: 0,
            memory: HostMemory::zeroed(0),
        })))
    }

    fn buffer_gpu_address(&self, buffer: &HeadlessResource) -> u64 {
        buffer.0.gpu_address
    }

    fn map_buffer(&self, buffer: &HeadlessResource) -> Result<NonNull<u8>> {
        if buffer.0.heap == HeapKind::Default || buffer.0.texture.is_some() {
            return Err(Error::Unsupported("mapping a resource outside an upload or readback heap"));
        }
        Ok(buffer.0.memory.ptr)
    }

    unsafe fn create_render_target_view(&self, resource: &HeadlessResource, dest: CpuDescriptorHandle) {
        self.0.write_descriptor(
            dest,
            DescriptorHeapType::Rtv,
            Descriptor::RenderTarget {
                resource: resource.id(),
            },
        );
    }

    unsafe fn create_depth_stencil_view(&self, resource: &HeadlessResource, dest: CpuDescriptorHandle) {
        self.0.write_descriptor(
            dest,
            DescriptorHeapType::Dsv,
            Descriptor::DepthStencil {
                resource: resource.id(),
            },
        );
    }

    unsafe fn create_shader_resource_view(
        &self,
        resource: &HeadlessResource,
        view: Option<&BufferViewDesc>,
        dest: CpuDescriptorHandle,
    ) {
        self.0.write_descriptor(
            dest,
            DescriptorHeapType::CbvSrvUav,
            Descriptor::ShaderResource {
                resource: resource.id(),
                view: view.copied(),
            },
        );
    }

    unsafe fn create_unordered_access_view(
        &self,
        resource: &HeadlessResource,
        view: Option<&BufferViewDesc>,
        dest: CpuDescriptorHandle,
    ) {
        self.0.write_descriptor(
            dest,
            DescriptorHeapType::CbvSrvUav,
            Descriptor::UnorderedAccess {
                resource: resource.id(),
                view: view.copied(),
            },
        );
    }

    unsafe fn create_constant_buffer_view(
        &self,
        buffer: &HeadlessResource,
        offset: u64,
        size: u32,
        dest: CpuDescriptorHandle,
    ) {
        self.0.write_descriptor(
            dest,
            DescriptorHeapType::CbvSrvUav,
            Descriptor::ConstantBuffer {
                resource: buffer.id(),
                offset,
                size,
            },
        );
    }

    unsafe fn create_sampler(&self, desc: &SamplerDesc, dest: CpuDescriptorHandle) {
        self.0
            .write_descriptor(dest, DescriptorHeapType::Sampler, Descriptor::Sampler(*desc));
    }

    fn create_root_signature(&self, desc: &RootSignatureDesc) -> Result<HeadlessRootSignature> {
        Ok(HeadlessRootSignature {
            id: self.0.next_id(),
            desc: desc.clone(),
        })
    }
}

/// A simulated hardware queue.
pub struct HeadlessQueue {
    id: u64,
    kind: QueueKind,
    device: HeadlessDevice,
    worker: Option<(crossbeam_channel::Sender<GpuOp>, JoinHandle<()>)>,
}

impl Debug for HeadlessQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessQueue")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl HeadlessQueue {
    fn enqueue(&self, op: GpuOp) {
        let shared = &self.device.0;
        match shared.config.mode {
            ExecutionMode::Immediate => {
                if !op.is_ready() {
                    tracing::warn!("Headless {:?} queue cannot stall in immediate mode", self.kind);
                    return;
                }
                shared.run(self.kind, op);
            }
            ExecutionMode::Manual => {
                shared.timeline.lock().unwrap().push(self.id, self.kind, op);
                shared.progress.notify(usize::MAX);
            }
            ExecutionMode::Threaded => {
                if let Some((sender, _)) = &self.worker {
                    // The worker only exits after the sender is dropped.
                    let _ = sender.send(op);
                }
            }
        }
    }
}

impl RawQueue<Headless> for HeadlessQueue {
    unsafe fn submit(
        &self,
        lists: &[&HeadlessCommandList],
        fence: &HeadlessFence,
        signal_value: u64,
    ) -> Result<()> {
        {
            let mut in_flight = self.device.0.in_flight_allocators.lock().unwrap();
            for list in lists {
                assert!(!list.recording, "command list {} submitted while open", list.id);
                assert_eq!(list.kind, self.kind, "command list submitted to the wrong queue kind");
                in_flight.insert(list.allocator, (fence.clone(), signal_value));
            }
        }
        bump(&self.device.0.counters.submissions, 1);
        let recorded = lists
            .iter()
            .map(|list| (list.id, list.recorded.clone()))
            .collect();
        self.enqueue(GpuOp::Execute(recorded));
        self.enqueue(GpuOp::Signal(fence.clone(), signal_value));
        Ok(())
    }

    unsafe fn signal(&self, fence: &HeadlessFence, value: u64) -> Result<()> {
        self.enqueue(GpuOp::Signal(fence.clone(), value));
        Ok(())
    }

    unsafe fn wait(&self, fence: &HeadlessFence, value: u64) -> Result<()> {
        self.enqueue(GpuOp::Wait(fence.clone(), value));
        Ok(())
    }
}

impl Drop for HeadlessQueue {
    fn drop(&mut self) {
        if let Some((sender, handle)) = self.worker.take() {
            drop(sender);
            let _ = handle.join();
        }
    }
}

/// A simulated fence. Cloning shares the fence.
#[derive(Clone)]
pub struct HeadlessFence(Arc<FenceState>);

struct FenceState {
    id: u64,
    value: AtomicU64,
    event: Event,
}

impl Debug for HeadlessFence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HeadlessFence(#{} = {:#x})", self.0.id, self.value())
    }
}

impl HeadlessFence {
    pub fn value(&self) -> u64 {
        self.0.value.load(Ordering::Acquire)
    }

    fn signal(&self, value: u64) {
        self.0.value.fetch_max(value, Ordering::AcqRel);
        self.0.event.notify(usize::MAX);
    }

    fn wait_host(&self, value: u64) {
        loop {
            if self.value() >= value {
                return;
            }
            let listener = self.0.event.listen();
            if self.value() >= value {
                return;
            }
            listener.wait();
        }
    }
}

#[derive(Debug)]
pub struct HeadlessCommandAllocator {
    id: u64,
    kind: QueueKind,
    resets: u64,
}

impl HeadlessCommandAllocator {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of times the allocator has been reset for reuse.
    pub fn resets(&self) -> u64 {
        self.resets
    }
}

/// A recorded native command.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Barrier(Vec<BarrierRecord>),
    SetDescriptorHeaps(Vec<u32>),
    SetPipelineState(u64),
    SetRootSignature(BindPoint, u64),
    SetDescriptorTable {
        bind_point: BindPoint,
        root_index: u32,
        base: GpuDescriptorHandle,
    },
    SetConstants {
        bind_point: BindPoint,
        root_index: u32,
        dest_offset: u32,
        values: Vec<u32>,
    },
    SetRootView {
        bind_point: BindPoint,
        root_index: u32,
        kind: RootViewKind,
        gpu_address: u64,
    },
    SetViewports(Vec<Viewport>),
    SetScissorRects(Vec<ScissorRect>),
    SetPrimitiveTopology(PrimitiveTopology),
    SetRenderTargets {
        rtvs: Vec<CpuDescriptorHandle>,
        dsv: Option<CpuDescriptorHandle>,
    },
    SetVertexBuffers {
        start_slot: u32,
        views: Vec<VertexBufferView>,
    },
    SetIndexBuffer(IndexBufferView),
    Draw {
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    },
    Dispatch(UVec3),
    DrawIndirect {
        arguments: u64,
        offset: u64,
        indexed: bool,
    },
    DispatchIndirect {
        arguments: u64,
        offset: u64,
    },
    ClearRenderTarget {
        rtv: CpuDescriptorHandle,
        color: [f32; 4],
    },
    ClearDepthStencil {
        dsv: CpuDescriptorHandle,
        flags: ClearFlags,
        depth: f32,
        stencil: u8,
    },
    ClearUavFloat {
        resource: HeadlessResource,
        values: [f32; 4],
    },
    ClearUavUint {
        resource: HeadlessResource,
        values: [u32; 4],
    },
    CopyResource {
        dst: HeadlessResource,
        src: HeadlessResource,
    },
    CopyBufferRegion {
        dst: HeadlessResource,
        dst_offset: u64,
        src: HeadlessResource,
        src_offset: u64,
        size: u64,
    },
}

/// A barrier as recorded, with resources identified by id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarrierRecord {
    Transition {
        resource: u64,
        before: ResourceStates,
        after: ResourceStates,
        split: SplitBarrier,
    },
    Uav {
        resource: Option<u64>,
    },
    Aliasing {
        before: Option<u64>,
        after: Option<u64>,
    },
}

impl From<&Barrier<Headless>> for BarrierRecord {
    fn from(barrier: &Barrier<Headless>) -> Self {
        match barrier {
            Barrier::Transition {
                resource,
                before,
                after,
                split,
            } => BarrierRecord::Transition {
                resource: resource.id(),
                before: *before,
                after: *after,
                split: *split,
            },
            Barrier::Uav { resource } => BarrierRecord::Uav {
                resource: resource.as_ref().map(HeadlessResource::id),
            },
            Barrier::Aliasing { before, after } => BarrierRecord::Aliasing {
                before: before.as_ref().map(HeadlessResource::id),
                after: after.as_ref().map(HeadlessResource::id),
            },
        }
    }
}

pub struct HeadlessCommandList {
    id: u64,
    kind: QueueKind,
    device: HeadlessDevice,
    allocator: u64,
    recording: bool,
    commands: Vec<Command>,
    recorded: Arc<[Command]>,
}

impl Debug for HeadlessCommandList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessCommandList")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("allocator", &self.allocator)
            .field("recording", &self.recording)
            .finish()
    }
}

impl HeadlessCommandList {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Commands recorded so far, or the closed recording.
    pub fn commands(&self) -> &[Command] {
        if self.recording {
            &self.commands
        } else {
            &self.recorded
        }
    }

    fn record(&mut self, command: Command) {
        assert!(self.recording, "command list {} is closed", self.id);
        self.commands.push(command);
    }

    fn counters(&self) -> &Counters {
        &self.device.0.counters
    }
}

impl RawCommandList<Headless> for HeadlessCommandList {
    unsafe fn reset(&mut self, allocator: &HeadlessCommandAllocator) -> Result<()> {
        assert!(!self.recording, "command list {} reset while open", self.id);
        assert_eq!(allocator.kind, self.kind);
        self.allocator = allocator.id;
        self.commands.clear();
        self.recording = true;
        Ok(())
    }

    unsafe fn close(&mut self) -> Result<()> {
        assert!(self.recording, "command list {} closed twice", self.id);
        self.recorded = Arc::from(std::mem::take(&mut self.commands));
        self.recording = false;
        Ok(())
    }

    unsafe fn resource_barrier(&mut self, barriers: &[Barrier<Headless>]) {
        bump(&self.counters().barrier_calls, 1);
        bump(&self.counters().barriers, barriers.len() as u64);
        self.record(Command::Barrier(barriers.iter().map(BarrierRecord::from).collect()));
    }

    unsafe fn set_descriptor_heaps(&mut self, heaps: &[&HeadlessDescriptorHeap]) {
        bump(&self.counters().set_descriptor_heaps, 1);
        self.record(Command::SetDescriptorHeaps(
            heaps.iter().map(|heap| heap.storage.id).collect(),
        ));
    }

    unsafe fn set_pipeline_state(&mut self, pipeline: &HeadlessPipelineState) {
        bump(&self.counters().set_pipeline_state, 1);
        self.record(Command::SetPipelineState(pipeline.id));
    }

    unsafe fn set_root_signature(&mut self, bind_point: BindPoint, signature: &HeadlessRootSignature) {
        bump(&self.counters().set_root_signature, 1);
        self.record(Command::SetRootSignature(bind_point, signature.id));
    }

    unsafe fn set_root_descriptor_table(
        &mut self,
        bind_point: BindPoint,
        root_index: u32,
        base: GpuDescriptorHandle,
    ) {
        bump(&self.counters().set_descriptor_table, 1);
        self.record(Command::SetDescriptorTable {
            bind_point,
            root_index,
            base,
        });
    }

    unsafe fn set_root_constants(
        &mut self,
        bind_point: BindPoint,
        root_index: u32,
        dest_offset: u32,
        values: &[u32],
    ) {
        self.record(Command::SetConstants {
            bind_point,
            root_index,
            dest_offset,
            values: values.to_vec(),
        });
    }

    unsafe fn set_root_view(
        &mut self,
        bind_point: BindPoint,
        root_index: u32,
        kind: RootViewKind,
        gpu_address: u64,
    ) {
        self.record(Command::SetRootView {
            bind_point,
            root_index,
            kind,
            gpu_address,
        });
    }

    unsafe fn set_viewports(&mut self, viewports: &[Viewport]) {
        self.record(Command::SetViewports(viewports.to_vec()));
    }

    unsafe fn set_scissor_rects(&mut self, rects: &[ScissorRect]) {
        self.record(Command::SetScissorRects(rects.to_vec()));
    }

    unsafe fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        self.record(Command::SetPrimitiveTopology(topology));
    }

    unsafe fn set_render_targets(
        &mut self,
        rtvs: &[CpuDescriptorHandle],
        dsv: Option<CpuDescriptorHandle>,
    ) {
        self.record(Command::SetRenderTargets {
            rtvs: rtvs.to_vec(),
            dsv,
        });
    }

    unsafe fn set_vertex_buffers(&mut self, start_slot: u32, views: &[VertexBufferView]) {
        self.record(Command::SetVertexBuffers {
            start_slot,
            views: views.to_vec(),
        });
    }

    unsafe fn set_index_buffer(&mut self, view: &IndexBufferView) {
        self.record(Command::SetIndexBuffer(*view));
    }

    unsafe fn draw_instanced(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    ) {
        bump(&self.counters().draws, 1);
        self.record(Command::Draw {
            vertex_count,
            instance_count,
            start_vertex,
            start_instance,
        });
    }

    unsafe fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    ) {
        bump(&self.counters().draws, 1);
        self.record(Command::DrawIndexed {
            index_count,
            instance_count,
            start_index,
            base_vertex,
            start_instance,
        });
    }

    unsafe fn dispatch(&mut self, group_count: UVec3) {
        bump(&self.counters().dispatches, 1);
        self.record(Command::Dispatch(group_count));
    }

    unsafe fn draw_indirect(&mut self, arguments: &HeadlessResource, offset: u64, indexed: bool) {
        bump(&self.counters().draws, 1);
        self.record(Command::DrawIndirect {
            arguments: arguments.id(),
            offset,
            indexed,
        });
    }

    unsafe fn dispatch_indirect(&mut self, arguments: &HeadlessResource, offset: u64) {
        bump(&self.counters().dispatches, 1);
        self.record(Command::DispatchIndirect {
            arguments: arguments.id(),
            offset,
        });
    }

    unsafe fn clear_render_target_view(&mut self, rtv: CpuDescriptorHandle, color: [f32; 4]) {
        bump(&self.counters().clears, 1);
        self.record(Command::ClearRenderTarget { rtv, color });
    }

    unsafe fn clear_depth_stencil_view(
        &mut self,
        dsv: CpuDescriptorHandle,
        flags: ClearFlags,
        depth: f32,
        stencil: u8,
    ) {
        bump(&self.counters().clears, 1);
        self.record(Command::ClearDepthStencil {
            dsv,
            flags,
            depth,
            stencil,
        });
    }

    unsafe fn clear_unordered_access_view_float(
        &mut self,
        gpu: GpuDescriptorHandle,
        _cpu: CpuDescriptorHandle,
        resource: &HeadlessResource,
        values: [f32; 4],
    ) {
        assert!(!gpu.is_null(), "UAV clears need a shader-visible descriptor");
        bump(&self.counters().clears, 1);
        self.record(Command::ClearUavFloat {
            resource: resource.clone(),
            values,
        });
    }

    unsafe fn clear_unordered_access_view_uint(
        &mut self,
        gpu: GpuDescriptorHandle,
        _cpu: CpuDescriptorHandle,
        resource: &HeadlessResource,
        values: [u32; 4],
    ) {
        assert!(!gpu.is_null(), "UAV clears need a shader-visible descriptor");
        bump(&self.counters().clears, 1);
        self.record(Command::ClearUavUint {
            resource: resource.clone(),
            values,
        });
    }

    unsafe fn copy_resource(&mut self, dst: &HeadlessResource, src: &HeadlessResource) {
        bump(&self.counters().copies, 1);
        self.record(Command::CopyResource {
            dst: dst.clone(),
            src: src.clone(),
        });
    }

    unsafe fn copy_buffer_region(
        &mut self,
        dst: &HeadlessResource,
        dst_offset: u64,
        src: &HeadlessResource,
        src_offset: u64,
        size: u64,
    ) {
        assert!(dst_offset + size <= dst.0.size, "copy overruns destination");
        assert!(src_offset + size <= src.0.size, "copy overruns source");
        bump(&self.counters().copies, 1);
        self.record(Command::CopyBufferRegion {
            dst: dst.clone(),
            dst_offset,
            src: src.clone(),
            src_offset,
            size,
        });
    }
}

/// Contents of a simulated descriptor slot.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Descriptor {
    #[default]
    Empty,
    RenderTarget {
        resource: u64,
    },
    DepthStencil {
        resource: u64,
    },
    ShaderResource {
        resource: u64,
        view: Option<BufferViewDesc>,
    },
    UnorderedAccess {
        resource: u64,
        view: Option<BufferViewDesc>,
    },
    ConstantBuffer {
        resource: u64,
        offset: u64,
        size: u32,
    },
    Sampler(SamplerDesc),
}

struct HeapStorage {
    id: u32,
    ty: DescriptorHeapType,
    shader_visible: bool,
    capacity: usize,
    slots: Mutex<Vec<Descriptor>>,
}

pub struct HeadlessDescriptorHeap {
    device: HeadlessDevice,
    storage: Arc<HeapStorage>,
}

impl Debug for HeadlessDescriptorHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessDescriptorHeap")
            .field("id", &self.storage.id)
            .field("ty", &self.storage.ty)
            .field("capacity", &self.storage.capacity)
            .field("shader_visible", &self.storage.shader_visible)
            .finish()
    }
}

impl HeadlessDescriptorHeap {
    pub fn id(&self) -> u32 {
        self.storage.id
    }
}

impl Drop for HeadlessDescriptorHeap {
    fn drop(&mut self) {
        self.device.0.heaps.write().unwrap().remove(&self.storage.id);
    }
}

struct HostMemory {
    ptr: NonNull<u8>,
    len: usize,
}

impl HostMemory {
    fn zeroed(len: usize) -> Self {
        let boxed: Box<[u8]> = vec![0u8; len].into_boxed_slice();
        let ptr = NonNull::from(Box::leak(boxed)).cast::<u8>();
        Self { ptr, len }
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.len,
            )));
        }
    }
}

struct ResourceData {
    id: u64,
    name: Option<String>,
    size: u64,
    heap: HeapKind,
    texture: Option<TextureDesc>,
    gpu_address: u64,
    memory: HostMemory,
}

// Host memory is only touched by the fence-ordered timeline or through mapped pointers
// whose synchronization is the caller's responsibility.
unsafe impl Send for ResourceData {}
unsafe impl Sync for ResourceData {}

/// A simulated buffer or texture. Buffers are backed by host memory.
#[derive(Clone)]
pub struct HeadlessResource(Arc<ResourceData>);

impl PartialEq for HeadlessResource {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Debug for HeadlessResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0.name {
            Some(name) => write!(f, "HeadlessResource(#{} {name:?})", self.0.id),
            None => write!(f, "HeadlessResource(#{})", self.0.id),
        }
    }
}

impl HeadlessResource {
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    pub fn size(&self) -> u64 {
        self.0.size
    }

    pub fn heap(&self) -> HeapKind {
        self.0.heap
    }

    pub fn texture_desc(&self) -> Option<&TextureDesc> {
        self.0.texture.as_ref()
    }

    /// Copies buffer contents out. Only meaningful once the writing work has completed.
    pub fn read_bytes(&self, range: std::ops::Range<u64>) -> Vec<u8> {
        assert!(range.end <= self.0.memory.len as u64, "read overruns {self:?}");
        let len = (range.end - range.start) as usize;
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.0.memory.ptr.as_ptr().add(range.start as usize),
                out.as_mut_ptr(),
                len,
            );
        }
        out
    }

    fn copy_from(&self, dst_offset: u64, src: &HeadlessResource, src_offset: u64, size: u64) {
        if self.0.texture.is_some() || src.0.texture.is_some() {
            return;
        }
        assert!(dst_offset + size <= self.0.memory.len as u64);
        assert!(src_offset + size <= src.0.memory.len as u64);
        unsafe {
            std::ptr::copy(
                src.0.memory.ptr.as_ptr().add(src_offset as usize),
                self.0.memory.ptr.as_ptr().add(dst_offset as usize),
                size as usize,
            );
        }
    }

    fn fill(&self, word: u32) {
        let bytes = word.to_ne_bytes();
        for offset in 0..self.0.memory.len {
            unsafe {
                *self.0.memory.ptr.as_ptr().add(offset) = bytes[offset % 4];
            }
        }
    }
}

#[derive(Debug)]
pub struct HeadlessRootSignature {
    id: u64,
    desc: RootSignatureDesc,
}

impl HeadlessRootSignature {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn desc(&self) -> &RootSignatureDesc {
        &self.desc
    }
}

#[derive(Debug)]
pub struct HeadlessPipelineState {
    id: u64,
    bind_point: BindPoint,
    name: String,
}

impl HeadlessPipelineState {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn bind_point(&self) -> BindPoint {
        self.bind_point
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload_buffer(device: &HeadlessDevice, size: u64) -> HeadlessResource {
        device
            .create_buffer(&BufferDesc {
                size,
                heap: HeapKind::Upload,
                allow_unordered_access: false,
                initial_state: ResourceStates::GENERIC_READ,
                name: None,
            })
            .unwrap()
    }

    fn record_copy(
        device: &HeadlessDevice,
        dst: &HeadlessResource,
        src: &HeadlessResource,
    ) -> HeadlessCommandList {
        let allocator = device.create_command_allocator(QueueKind::Copy).unwrap();
        let mut list = device.create_command_list(QueueKind::Copy, &allocator).unwrap();
        unsafe {
            list.copy_buffer_region(dst, 0, src, 4, 4);
            list.close().unwrap();
        }
        list
    }

    #[test]
    fn test_manual_mode_runs_copies_on_demand() {
        let device = HeadlessDevice::new(HeadlessConfig {
            mode: ExecutionMode::Manual,
            capture: true,
            ..Default::default()
        });
        let src = upload_buffer(&device, 8);
        let dst = upload_buffer(&device, 8);
        unsafe {
            device
                .map_buffer(&src)
                .unwrap()
                .as_ptr()
                .copy_from_nonoverlapping([1u8, 2, 3, 4, 5, 6, 7, 8].as_ptr(), 8);
        }
        let list = record_copy(&device, &dst, &src);
        let queue = device.create_queue(QueueKind::Copy).unwrap();
        let fence = device.create_fence(0).unwrap();
        unsafe { queue.submit(&[&list], &fence, 1).unwrap() };

        assert_eq!(fence.value(), 0);
        assert_eq!(dst.read_bytes(0..4), [0, 0, 0, 0]);
        device.complete_all();
        assert_eq!(fence.value(), 1);
        assert_eq!(dst.read_bytes(0..4), [5, 6, 7, 8]);
        assert_eq!(device.take_executed().len(), 1);
    }

    #[test]
    fn test_manual_cross_queue_wait_blocks_until_signalled() {
        let device = HeadlessDevice::new(HeadlessConfig {
            mode: ExecutionMode::Manual,
            ..Default::default()
        });
        let direct = device.create_queue(QueueKind::Direct).unwrap();
        let copy = device.create_queue(QueueKind::Copy).unwrap();
        let producer = device.create_fence(0).unwrap();
        let consumer = device.create_fence(0).unwrap();
        unsafe {
            direct.wait(&producer, 1).unwrap();
            direct.signal(&consumer, 1).unwrap();
        }
        assert!(!device.step());
        unsafe { copy.signal(&producer, 1).unwrap() };
        device.complete_all();
        assert_eq!(consumer.value(), 1);
    }

    #[test]
    fn test_threaded_mode_signals_asynchronously() {
        let device = HeadlessDevice::new(HeadlessConfig {
            mode: ExecutionMode::Threaded,
            latency: Duration::from_millis(1),
            ..Default::default()
        });
        let queue = device.create_queue(QueueKind::Direct).unwrap();
        let fence = device.create_fence(0).unwrap();
        let allocator = device.create_command_allocator(QueueKind::Direct).unwrap();
        let mut list = device.create_command_list(QueueKind::Direct, &allocator).unwrap();
        unsafe {
            list.close().unwrap();
            for value in 1..=4 {
                queue.submit(&[&list], &fence, value).unwrap();
            }
        }
        device.wait_for_fence(&fence, 4).unwrap();
        assert_eq!(fence.value(), 4);
        assert_eq!(device.stats().executed_lists, 4);
    }

    #[test]
    #[should_panic(expected = "reset before fence")]
    fn test_detects_allocator_reset_in_flight() {
        let device = HeadlessDevice::new(HeadlessConfig {
            mode: ExecutionMode::Manual,
            ..Default::default()
        });
        let queue = device.create_queue(QueueKind::Direct).unwrap();
        let fence = device.create_fence(0).unwrap();
        let mut allocator = device.create_command_allocator(QueueKind::Direct).unwrap();
        let mut list = device.create_command_list(QueueKind::Direct, &allocator).unwrap();
        unsafe {
            list.close().unwrap();
            queue.submit(&[&list], &fence, 1).unwrap();
            device.reset_command_allocator(&mut allocator).unwrap();
        }
    }

    #[test]
    fn test_descriptor_copies_move_contents() {
        let device = HeadlessDevice::default();
        let staging = device
            .create_descriptor_heap(&DescriptorHeapDesc {
                ty: DescriptorHeapType::CbvSrvUav,
                count: 4,
                shader_visible: false,
            })
            .unwrap();
        let visible = device
            .create_descriptor_heap(&DescriptorHeapDesc {
                ty: DescriptorHeapType::CbvSrvUav,
                count: 4,
                shader_visible: true,
            })
            .unwrap();
        let buffer = upload_buffer(&device, 256);
        let (src, _) = device.descriptor_heap_start(&staging);
        let (dst, gpu) = device.descriptor_heap_start(&visible);
        unsafe {
            device.create_constant_buffer_view(&buffer, 0, 256, src.offset(1, 1));
            device.copy_descriptors_simple(2, dst, src, DescriptorHeapType::CbvSrvUav);
        }
        assert_eq!(device.descriptor_at_gpu(gpu), Descriptor::Empty);
        assert_eq!(
            device.descriptor_at_gpu(gpu.offset(1, 1)),
            Descriptor::ConstantBuffer {
                resource: buffer.id(),
                offset: 0,
                size: 256
            }
        );
        assert_eq!(device.stats().descriptors_copied, 2);
    }
}
