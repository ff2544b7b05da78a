//! Per-list staging of descriptor tables into shader-visible heap pages.
//!
//! # Overview
//!
//! Applications create views in CPU-only heaps ([`DescriptorAllocator`]) and stage their
//! handles per root parameter. Before each draw or dispatch the command list commits the
//! staged tables: every stale table is copied into the current shader-visible page in
//! one batched descriptor copy, and bound with one `set_root_descriptor_table` per table.
//! Tables that did not change since the last commit are neither copied nor rebound.
//!
//! Only the descriptors up to the highest staged slot of a table are copied. Sparse
//! bindings at high slots cost proportionally more copy bandwidth.
//!
//! Pages come from a [`DescriptorPagePool`] shared by all command lists and go back to it
//! tagged with the fence value of the submission that used them.
//!
//! # Key Types
//!
//! - [`DescriptorHandleCache`]: Staged CPU handles and staleness bitmaps for one root
//!   signature.
//! - [`DynamicDescriptorHeap`]: Page management and commit logic for one heap type, with
//!   a graphics and a compute cache.
//! - [`DescriptorPagePool`]: Fence-gated pool of shader-visible pages.
//!
//! [`DescriptorAllocator`]: crate::descriptor::DescriptorAllocator
use std::{
    fmt::Debug,
    sync::{Arc, Mutex},
};

use smallvec::SmallVec;

use crate::{
    Device, HasDevice, Result,
    backend::{
        Api, BindPoint, CpuDescriptorHandle, DescriptorHeapType, GpuDescriptorHandle,
        RawCommandList, RawDevice,
    },
    descriptor::{BoundHeaps, DescriptorHandle, ShaderVisibleHeap},
    queue::CommandQueues,
    root_signature::{MAX_ROOT_PARAMETERS, RootSignature, TableLayout},
    sync::FencedPool,
    utils::set_bits,
};

/// Maximum number of descriptors staged across all tables of one root signature.
pub const MAX_CACHED_DESCRIPTORS: usize = 256;

/// Maximum number of source ranges passed to one native descriptor copy.
const MAX_DESCRIPTORS_PER_COPY: usize = 16;

type CopyRanges = SmallVec<[(CpuDescriptorHandle, u32); MAX_DESCRIPTORS_PER_COPY]>;

#[derive(Clone, Copy, Debug, Default)]
struct DescriptorTableCache {
    assigned_handles_bitmap: u64,
    table_start: usize,
    table_size: u32,
}

/// Staged descriptor handles for the tables of one root signature.
pub struct DescriptorHandleCache {
    handle_cache: [CpuDescriptorHandle; MAX_CACHED_DESCRIPTORS],
    root_descriptor_tables_bitmap: u32,
    stale_root_params_bitmap: u32,
    max_cached_descriptors: u32,
    root_descriptor_table: [DescriptorTableCache; MAX_ROOT_PARAMETERS],
}

impl Default for DescriptorHandleCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for DescriptorHandleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorHandleCache")
            .field(
                "root_descriptor_tables",
                &format_args!("{:#b}", self.root_descriptor_tables_bitmap),
            )
            .field("stale", &format_args!("{:#b}", self.stale_root_params_bitmap))
            .field("max_cached_descriptors", &self.max_cached_descriptors)
            .finish()
    }
}

impl DescriptorHandleCache {
    pub fn new() -> Self {
        Self {
            handle_cache: [CpuDescriptorHandle::NULL; MAX_CACHED_DESCRIPTORS],
            root_descriptor_tables_bitmap: 0,
            stale_root_params_bitmap: 0,
            max_cached_descriptors: 0,
            root_descriptor_table: [DescriptorTableCache::default(); MAX_ROOT_PARAMETERS],
        }
    }

    pub fn root_descriptor_tables_bitmap(&self) -> u32 {
        self.root_descriptor_tables_bitmap
    }

    pub fn stale_root_params_bitmap(&self) -> u32 {
        self.stale_root_params_bitmap
    }

    pub fn max_cached_descriptors(&self) -> u32 {
        self.max_cached_descriptors
    }

    pub fn assigned_handles_bitmap(&self, root_index: u32) -> u64 {
        self.root_descriptor_table[root_index as usize].assigned_handles_bitmap
    }

    pub fn clear_cache(&mut self) {
        self.root_descriptor_tables_bitmap = 0;
        self.stale_root_params_bitmap = 0;
        self.max_cached_descriptors = 0;
    }

    /// Lays out the cache for the `ty` tables of a newly bound root signature. Staged
    /// handles of the previous signature are forgotten.
    pub fn parse_root_signature(&mut self, ty: DescriptorHeapType, layout: &TableLayout) {
        self.stale_root_params_bitmap = 0;
        self.root_descriptor_tables_bitmap = layout.tables_of(ty);

        let mut current_offset = 0usize;
        for root_index in set_bits(self.root_descriptor_tables_bitmap as u64) {
            let table_size = layout.table_sizes[root_index as usize];
            assert!(table_size > 0, "descriptor table {root_index} is empty");
            self.root_descriptor_table[root_index as usize] = DescriptorTableCache {
                assigned_handles_bitmap: 0,
                table_start: current_offset,
                table_size,
            };
            current_offset += table_size as usize;
        }
        assert!(
            current_offset <= MAX_CACHED_DESCRIPTORS,
            "root signature requires {current_offset} {ty:?} descriptors, at most {MAX_CACHED_DESCRIPTORS} can be cached"
        );
        self.max_cached_descriptors = current_offset as u32;
    }

    /// Stages `handles` at `offset` in the table of `root_index` and marks the table stale.
    ///
    /// # Panics
    /// If `root_index` is not a table of the parsed signature, or the handles overrun it.
    pub fn stage_descriptor_handles(
        &mut self,
        root_index: u32,
        offset: u32,
        handles: &[CpuDescriptorHandle],
    ) {
        assert!(
            (root_index as usize) < MAX_ROOT_PARAMETERS
                && self.root_descriptor_tables_bitmap & (1 << root_index) != 0,
            "root parameter {root_index} is not a descriptor table of this heap type"
        );
        let table = &mut self.root_descriptor_table[root_index as usize];
        let count = handles.len() as u32;
        assert!(
            offset + count <= table.table_size,
            "staging {count} descriptors at offset {offset} overruns table {root_index} of size {}",
            table.table_size
        );
        if handles.is_empty() {
            return;
        }
        let start = table.table_start + offset as usize;
        self.handle_cache[start..start + handles.len()].copy_from_slice(handles);
        table.assigned_handles_bitmap |= (u64::MAX >> (64 - count)) << offset;
        self.stale_root_params_bitmap |= 1 << root_index;
    }

    /// Number of descriptors a commit of the stale tables copies.
    ///
    /// Each stale table contributes its highest assigned slot plus one.
    pub fn compute_staged_size(&self) -> u32 {
        set_bits(self.stale_root_params_bitmap as u64)
            .map(|root_index| self.staged_table_size(root_index))
            .sum()
    }

    fn staged_table_size(&self, root_index: u32) -> u32 {
        let assigned = self.root_descriptor_table[root_index as usize].assigned_handles_bitmap;
        assert!(
            assigned != 0,
            "root parameter {root_index} is stale but has no staged descriptors"
        );
        64 - assigned.leading_zeros()
    }

    /// Marks every table with staged handles stale, so the next commit rebinds it.
    pub fn unbind_all_valid(&mut self) {
        self.stale_root_params_bitmap = 0;
        for root_index in set_bits(self.root_descriptor_tables_bitmap as u64) {
            if self.root_descriptor_table[root_index as usize].assigned_handles_bitmap != 0 {
                self.stale_root_params_bitmap |= 1 << root_index;
            }
        }
    }

    /// Copies the stale tables to consecutive locations starting at `dest_start` and
    /// binds each of them. Clears the stale bitmap.
    fn copy_and_bind_stale_tables<A: Api>(
        &mut self,
        device: &Device<A>,
        ty: DescriptorHeapType,
        increment: u32,
        mut dest_start: DescriptorHandle,
        raw: &mut A::CommandList,
        bind_point: BindPoint,
    ) {
        let stale: SmallVec<[(u32, u32); MAX_ROOT_PARAMETERS]> =
            set_bits(self.stale_root_params_bitmap as u64)
                .map(|root_index| (root_index, self.staged_table_size(root_index)))
                .collect();
        self.stale_root_params_bitmap = 0;

        let mut dest_ranges = CopyRanges::new();
        let mut src_ranges = CopyRanges::new();
        let copy = |dest: &mut CopyRanges, src: &mut CopyRanges| {
            if !src.is_empty() {
                unsafe { device.copy_descriptors(dest, src, ty) };
                dest.clear();
                src.clear();
            }
        };

        for (root_index, table_size) in stale {
            unsafe { raw.set_root_descriptor_table(bind_point, root_index, dest_start.gpu()) };

            let table = &self.root_descriptor_table[root_index as usize];
            let mut src_index = table.table_start;
            let mut set_handles = table.assigned_handles_bitmap;
            let mut cur_dest = dest_start.cpu();
            dest_start = dest_start.offset(table_size, increment);

            while set_handles != 0 {
                let skip = set_handles.trailing_zeros();
                set_handles >>= skip;
                src_index += skip as usize;
                cur_dest = cur_dest.offset(skip, increment);

                let run = (!set_handles).trailing_zeros();
                set_handles = set_handles.checked_shr(run).unwrap_or(0);

                let mut remaining = run;
                while remaining > 0 {
                    if src_ranges.len() == MAX_DESCRIPTORS_PER_COPY {
                        copy(&mut dest_ranges, &mut src_ranges);
                    }
                    let take = remaining.min((MAX_DESCRIPTORS_PER_COPY - src_ranges.len()) as u32);
                    dest_ranges.push((cur_dest, take));
                    // Sources are not assumed to be contiguous.
                    src_ranges.extend(
                        self.handle_cache[src_index..src_index + take as usize]
                            .iter()
                            .map(|handle| (*handle, 1)),
                    );
                    src_index += take as usize;
                    cur_dest = cur_dest.offset(take, increment);
                    remaining -= take;
                }
            }
        }
        copy(&mut dest_ranges, &mut src_ranges);
    }
}

/// Fence-gated pool of shader-visible descriptor pages of one type.
pub struct DescriptorPagePool<A: Api> {
    device: Device<A>,
    queues: Arc<CommandQueues<A>>,
    ty: DescriptorHeapType,
    descriptors_per_page: u32,
    pages: Mutex<FencedPool<Arc<ShaderVisibleHeap<A>>>>,
}

impl<A: Api> Debug for DescriptorPagePool<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorPagePool")
            .field("ty", &self.ty)
            .field("descriptors_per_page", &self.descriptors_per_page)
            .field("pages", &*self.pages.lock().unwrap())
            .finish()
    }
}

impl<A: Api> HasDevice<A> for DescriptorPagePool<A> {
    fn device(&self) -> &Device<A> {
        &self.device
    }
}

impl<A: Api> DescriptorPagePool<A> {
    pub fn new(
        device: Device<A>,
        queues: Arc<CommandQueues<A>>,
        ty: DescriptorHeapType,
        descriptors_per_page: u32,
    ) -> Self {
        assert!(ty.is_shader_visible_capable());
        Self {
            device,
            queues,
            ty,
            descriptors_per_page,
            pages: Mutex::new(FencedPool::new()),
        }
    }

    pub fn ty(&self) -> DescriptorHeapType {
        self.ty
    }

    pub fn descriptors_per_page(&self) -> u32 {
        self.descriptors_per_page
    }

    /// Takes a page whose last use has completed, or creates a new one.
    pub fn request_page(&self) -> Result<Arc<ShaderVisibleHeap<A>>> {
        let mut pages = self.pages.lock().unwrap();
        if let Some(page) = pages.acquire(|fence| self.queues.is_fence_complete(fence)) {
            return Ok(page);
        }
        let page = ShaderVisibleHeap::new(self.device.clone(), self.ty, self.descriptors_per_page)?;
        pages.register_created();
        tracing::debug!(
            "Allocating new {:?} descriptor page with size = {}, pool size = {}",
            self.ty,
            self.descriptors_per_page,
            pages.created()
        );
        Ok(Arc::new(page))
    }

    /// Returns pages, to be reused once `fence` completes.
    pub fn discard_pages(&self, fence: u64, used: impl IntoIterator<Item = Arc<ShaderVisibleHeap<A>>>) {
        let mut pages = self.pages.lock().unwrap();
        for page in used {
            pages.discard(fence, page);
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pages.lock().unwrap().created()
    }

    /// Drops every pooled page. The GPU must be idle.
    pub fn destroy_all(&self) -> usize {
        self.pages.lock().unwrap().clear()
    }
}

/// Descriptor table staging and shader-visible page management for one heap type.
pub struct DynamicDescriptorHeap<A: Api> {
    pool: Arc<DescriptorPagePool<A>>,
    ty: DescriptorHeapType,
    increment: u32,
    current: Option<Arc<ShaderVisibleHeap<A>>>,
    current_offset: u32,
    retired: Vec<Arc<ShaderVisibleHeap<A>>>,
    graphics: DescriptorHandleCache,
    compute: DescriptorHandleCache,
}

impl<A: Api> Debug for DynamicDescriptorHeap<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicDescriptorHeap")
            .field("ty", &self.ty)
            .field("current_offset", &self.current_offset)
            .field("retired", &self.retired.len())
            .field("graphics", &self.graphics)
            .field("compute", &self.compute)
            .finish()
    }
}

impl<A: Api> DynamicDescriptorHeap<A> {
    pub fn new(pool: Arc<DescriptorPagePool<A>>) -> Self {
        let ty = pool.ty();
        let increment = pool.device().descriptor_increment(ty);
        Self {
            pool,
            ty,
            increment,
            current: None,
            current_offset: 0,
            retired: Vec::new(),
            graphics: DescriptorHandleCache::new(),
            compute: DescriptorHandleCache::new(),
        }
    }

    pub fn ty(&self) -> DescriptorHeapType {
        self.ty
    }

    pub fn graphics_cache(&self) -> &DescriptorHandleCache {
        &self.graphics
    }

    pub fn compute_cache(&self) -> &DescriptorHandleCache {
        &self.compute
    }

    /// Descriptors used from the current page.
    pub fn current_offset(&self) -> u32 {
        self.current_offset
    }

    /// Pages this list filled and retired since its last cleanup.
    pub fn retired_pages(&self) -> usize {
        self.retired.len()
    }

    pub fn parse_graphics_root_signature(&mut self, root_signature: &RootSignature<A>) {
        self.graphics.parse_root_signature(self.ty, root_signature.layout());
    }

    pub fn parse_compute_root_signature(&mut self, root_signature: &RootSignature<A>) {
        self.compute.parse_root_signature(self.ty, root_signature.layout());
    }

    pub fn set_graphics_descriptor_handles(
        &mut self,
        root_index: u32,
        offset: u32,
        handles: &[CpuDescriptorHandle],
    ) {
        self.graphics.stage_descriptor_handles(root_index, offset, handles);
    }

    pub fn set_compute_descriptor_handles(
        &mut self,
        root_index: u32,
        offset: u32,
        handles: &[CpuDescriptorHandle],
    ) {
        self.compute.stage_descriptor_handles(root_index, offset, handles);
    }

    fn has_space(&self, count: u32) -> bool {
        self.current.is_some() && self.current_offset + count <= self.pool.descriptors_per_page()
    }

    fn retire_current_heap(&mut self) {
        // Never retire an unused page.
        if self.current_offset == 0 {
            return;
        }
        if let Some(page) = self.current.take() {
            self.retired.push(page);
        }
        self.current_offset = 0;
    }

    fn heap(&mut self) -> Result<Arc<ShaderVisibleHeap<A>>> {
        if let Some(page) = &self.current {
            return Ok(page.clone());
        }
        debug_assert_eq!(self.current_offset, 0);
        let page = self.pool.request_page()?;
        self.current = Some(page.clone());
        Ok(page)
    }

    fn allocate(&mut self, page: &ShaderVisibleHeap<A>, count: u32) -> DescriptorHandle {
        let handle = page.start().offset(self.current_offset, self.increment);
        self.current_offset += count;
        handle
    }

    fn copy_and_bind_staged_tables(
        &mut self,
        bind_point: BindPoint,
        raw: &mut A::CommandList,
        heaps: &mut BoundHeaps<A>,
    ) -> Result<()> {
        let cache = match bind_point {
            BindPoint::Graphics => &self.graphics,
            BindPoint::Compute => &self.compute,
        };
        let mut needed = cache.compute_staged_size();
        if !self.has_space(needed) {
            self.retire_current_heap();
            self.unbind_all_valid();
            let cache = match bind_point {
                BindPoint::Graphics => &self.graphics,
                BindPoint::Compute => &self.compute,
            };
            needed = cache.compute_staged_size();
            assert!(
                needed <= self.pool.descriptors_per_page(),
                "{needed} staged descriptors do not fit in a page of {}",
                self.pool.descriptors_per_page()
            );
        }
        let page = self.heap()?;
        heaps.set(raw, &page);
        let dest_start = self.allocate(&page, needed);
        let device = self.pool.device().clone();
        let cache = match bind_point {
            BindPoint::Graphics => &mut self.graphics,
            BindPoint::Compute => &mut self.compute,
        };
        cache.copy_and_bind_stale_tables(&device, self.ty, self.increment, dest_start, raw, bind_point);
        Ok(())
    }

    /// Copies and binds the stale graphics tables. Does nothing when no table is stale.
    pub fn commit_graphics_root_descriptor_tables(
        &mut self,
        raw: &mut A::CommandList,
        heaps: &mut BoundHeaps<A>,
    ) -> Result<()> {
        if self.graphics.stale_root_params_bitmap != 0 {
            self.copy_and_bind_staged_tables(BindPoint::Graphics, raw, heaps)?;
        }
        Ok(())
    }

    /// Copies and binds the stale compute tables. Does nothing when no table is stale.
    pub fn commit_compute_root_descriptor_tables(
        &mut self,
        raw: &mut A::CommandList,
        heaps: &mut BoundHeaps<A>,
    ) -> Result<()> {
        if self.compute.stale_root_params_bitmap != 0 {
            self.copy_and_bind_staged_tables(BindPoint::Compute, raw, heaps)?;
        }
        Ok(())
    }

    /// Copies one descriptor straight into the current page, bypassing the cache.
    pub fn upload_direct(
        &mut self,
        raw: &mut A::CommandList,
        heaps: &mut BoundHeaps<A>,
        handle: CpuDescriptorHandle,
    ) -> Result<GpuDescriptorHandle> {
        if !self.has_space(1) {
            self.retire_current_heap();
            self.unbind_all_valid();
        }
        let page = self.heap()?;
        heaps.set(raw, &page);
        let dest = self.allocate(&page, 1);
        unsafe {
            self.pool
                .device()
                .copy_descriptors_simple(1, dest.cpu(), handle, self.ty);
        }
        Ok(dest.gpu())
    }

    /// Marks every table with staged handles stale on both bind points.
    pub fn unbind_all_valid(&mut self) {
        self.graphics.unbind_all_valid();
        self.compute.unbind_all_valid();
    }

    /// Returns the pages used by this list to the pool, tagged with `fence`.
    pub fn cleanup_used_heaps(&mut self, fence: u64) {
        self.retire_current_heap();
        self.pool.discard_pages(fence, self.retired.drain(..));
        self.graphics.clear_cache();
        self.compute.clear_cache();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::headless::{Command, Descriptor, ExecutionMode, Headless, HeadlessConfig, HeadlessDevice},
        backend::{BufferDesc, HeapKind},
        descriptor::DescriptorAllocator,
        root_signature::{DescriptorRangeKind, RootParameter, RootSignatureDesc, ShaderVisibility},
        tracking::ResourceStates,
    };

    fn layout(tables: &[u32]) -> TableLayout {
        RootSignatureDesc::new(
            tables
                .iter()
                .map(|size| RootParameter::table(DescriptorRangeKind::Srv, *size, ShaderVisibility::All))
                .collect(),
        )
        .table_layout()
    }

    fn handles(range: std::ops::Range<usize>) -> Vec<CpuDescriptorHandle> {
        range.map(|i| CpuDescriptorHandle(0x1000 + i)).collect()
    }

    #[test]
    fn test_staged_size_counts_up_to_highest_slot() {
        let mut cache = DescriptorHandleCache::new();
        cache.parse_root_signature(DescriptorHeapType::CbvSrvUav, &layout(&[8, 4, 16]));
        assert_eq!(cache.max_cached_descriptors(), 28);

        cache.stage_descriptor_handles(0, 5, &handles(0..1));
        cache.stage_descriptor_handles(2, 0, &handles(0..2));
        assert_eq!(cache.stale_root_params_bitmap(), 0b101);
        assert_eq!(cache.assigned_handles_bitmap(0), 1 << 5);
        assert_eq!(cache.compute_staged_size(), 6 + 2);
    }

    #[test]
    fn test_unbind_all_valid_restales_assigned_tables() {
        let mut cache = DescriptorHandleCache::new();
        cache.parse_root_signature(DescriptorHeapType::CbvSrvUav, &layout(&[2, 2, 2]));
        cache.stage_descriptor_handles(1, 0, &handles(0..2));
        cache.stale_root_params_bitmap = 0;
        cache.unbind_all_valid();
        assert_eq!(cache.stale_root_params_bitmap(), 0b010);
    }

    #[test]
    fn test_full_table_of_64() {
        let mut cache = DescriptorHandleCache::new();
        cache.parse_root_signature(DescriptorHeapType::CbvSrvUav, &layout(&[64]));
        cache.stage_descriptor_handles(0, 0, &handles(0..64));
        assert_eq!(cache.assigned_handles_bitmap(0), u64::MAX);
        assert_eq!(cache.compute_staged_size(), 64);
    }

    #[test]
    #[should_panic(expected = "overruns table")]
    fn test_stage_past_table_end_panics() {
        let mut cache = DescriptorHandleCache::new();
        cache.parse_root_signature(DescriptorHeapType::CbvSrvUav, &layout(&[4]));
        cache.stage_descriptor_handles(0, 3, &handles(0..2));
    }

    #[test]
    #[should_panic(expected = "is not a descriptor table")]
    fn test_stage_into_non_table_panics() {
        let mut cache = DescriptorHandleCache::new();
        cache.parse_root_signature(DescriptorHeapType::Sampler, &layout(&[4]));
        cache.stage_descriptor_handles(0, 0, &handles(0..1));
    }

    struct Fixture {
        raw: HeadlessDevice,
        device: Device<Headless>,
        heap: DynamicDescriptorHeap<Headless>,
        list: crate::backend::headless::HeadlessCommandList,
        bound: BoundHeaps<Headless>,
        views: Vec<CpuDescriptorHandle>,
        _cpu: DescriptorAllocator<Headless>,
    }

    fn fixture(descriptors_per_page: u32) -> Fixture {
        let raw = HeadlessDevice::new(HeadlessConfig {
            mode: ExecutionMode::Manual,
            ..Default::default()
        });
        let device = Device::<Headless>::new(raw.clone());
        let queues = Arc::new(CommandQueues::new(device.clone()).unwrap());
        let pool = Arc::new(DescriptorPagePool::new(
            device.clone(),
            queues,
            DescriptorHeapType::CbvSrvUav,
            descriptors_per_page,
        ));
        let allocator = device
            .create_command_allocator(crate::backend::QueueKind::Direct)
            .unwrap();
        let list = device
            .create_command_list(crate::backend::QueueKind::Direct, &allocator)
            .unwrap();

        let buffer = device
            .create_buffer(&BufferDesc {
                size: 4096,
                heap: HeapKind::Upload,
                allow_unordered_access: false,
                initial_state: ResourceStates::GENERIC_READ,
                name: None,
            })
            .unwrap();
        let mut cpu = DescriptorAllocator::new(device.clone(), DescriptorHeapType::CbvSrvUav, 64);
        let views = (0..32)
            .map(|i| {
                let handle = cpu.allocate(1).unwrap();
                unsafe { device.create_constant_buffer_view(&buffer, i * 256, 256, handle) };
                handle
            })
            .collect();
        Fixture {
            raw,
            heap: DynamicDescriptorHeap::new(pool),
            device,
            list,
            bound: BoundHeaps::default(),
            views,
            _cpu: cpu,
        }
    }

    fn signature(device: &Device<Headless>, tables: &[u32]) -> RootSignature<Headless> {
        RootSignature::new(
            device.clone(),
            RootSignatureDesc::new(
                tables
                    .iter()
                    .map(|size| RootParameter::table(DescriptorRangeKind::Srv, *size, ShaderVisibility::All))
                    .collect(),
            ),
        )
        .unwrap()
    }

    #[test]
    fn test_commit_copies_then_is_idempotent() {
        let mut f = fixture(64);
        let signature = signature(&f.device, &[4, 4]);
        f.heap.parse_graphics_root_signature(&signature);
        f.heap.set_graphics_descriptor_handles(0, 0, &f.views[0..2]);
        f.heap.set_graphics_descriptor_handles(1, 3, &f.views[5..6]);

        f.heap
            .commit_graphics_root_descriptor_tables(&mut f.list, &mut f.bound)
            .unwrap();
        assert_eq!(f.heap.graphics_cache().stale_root_params_bitmap(), 0);
        let copies = f.raw.stats().copy_descriptors_calls;
        assert_eq!(copies, 1);
        assert_eq!(f.raw.stats().descriptors_copied, 3);
        assert_eq!(f.heap.current_offset(), 2 + 4);

        let tables: Vec<_> = f
            .list
            .commands()
            .iter()
            .filter_map(|command| match command {
                Command::SetDescriptorTable { root_index, base, .. } => Some((*root_index, *base)),
                _ => None,
            })
            .collect();
        assert_eq!(tables.len(), 2);
        assert_eq!(
            f.raw.descriptor_at_gpu(tables[1].1.offset(3, 1)),
            f.raw.descriptor(f.views[5])
        );
        assert_eq!(f.raw.descriptor_at_gpu(tables[1].1), Descriptor::Empty);

        f.heap
            .commit_graphics_root_descriptor_tables(&mut f.list, &mut f.bound)
            .unwrap();
        assert_eq!(f.raw.stats().copy_descriptors_calls, copies);
        assert_eq!(f.raw.stats().set_descriptor_table, 2);
    }

    #[test]
    fn test_copies_are_split_into_batches_of_sixteen() {
        let mut f = fixture(64);
        let signature = signature(&f.device, &[20]);
        f.heap.parse_compute_root_signature(&signature);
        f.heap.set_compute_descriptor_handles(0, 0, &f.views[0..20]);
        f.heap
            .commit_compute_root_descriptor_tables(&mut f.list, &mut f.bound)
            .unwrap();
        assert_eq!(f.raw.stats().copy_descriptors_calls, 2);
        assert_eq!(f.raw.stats().descriptors_copied, 20);
    }

    #[test]
    fn test_full_page_retires_and_restales() {
        let mut f = fixture(8);
        let signature = signature(&f.device, &[3, 3]);
        f.heap.parse_graphics_root_signature(&signature);
        f.heap.set_graphics_descriptor_handles(0, 0, &f.views[0..3]);
        f.heap.set_graphics_descriptor_handles(1, 0, &f.views[3..6]);
        f.heap
            .commit_graphics_root_descriptor_tables(&mut f.list, &mut f.bound)
            .unwrap();
        assert_eq!(f.heap.current_offset(), 6);

        // Only table 1 changed, but it does not fit: both tables move to a new page.
        f.heap.set_graphics_descriptor_handles(1, 0, &f.views[6..9]);
        f.heap
            .commit_graphics_root_descriptor_tables(&mut f.list, &mut f.bound)
            .unwrap();
        assert_eq!(f.heap.retired_pages(), 1);
        assert_eq!(f.heap.current_offset(), 6);
        assert_eq!(f.raw.stats().set_descriptor_table, 4);
        assert_eq!(f.raw.stats().set_descriptor_heaps, 2);

        f.heap.cleanup_used_heaps(1);
        assert_eq!(f.heap.retired_pages(), 0);
        assert_eq!(f.heap.graphics_cache().root_descriptor_tables_bitmap(), 0);
    }

    #[test]
    fn test_upload_direct() {
        let mut f = fixture(4);
        let gpu = f
            .heap
            .upload_direct(&mut f.list, &mut f.bound, f.views[7])
            .unwrap();
        assert_eq!(f.raw.descriptor_at_gpu(gpu), f.raw.descriptor(f.views[7]));
        assert_eq!(f.heap.current_offset(), 1);
    }
}
