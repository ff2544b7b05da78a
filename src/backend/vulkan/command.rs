//! Command pools and command buffers.
//!
//! A [`VulkanCommandAllocator`] is a command pool plus the command buffers allocated
//! from it. Resetting the allocator resets the pool and makes every buffer available
//! to the next list recorded on it.
//!
//! Render targets are bound with dynamic rendering. Rendering begins lazily at the
//! first draw after the targets change and ends before anything that may not be
//! recorded inside it: barriers, dispatches, copies, clears and closing the list.
use std::{
    fmt::Debug,
    sync::{Arc, Mutex},
};

use ash::vk;
use glam::UVec3;
use smallvec::SmallVec;

use super::{
    Vulkan, conv,
    descriptor::{TargetView, VulkanDescriptorHeap, read_target},
    device::DeviceShared,
    pipeline::{RootSlot, VulkanPipelineState, VulkanRootSignature},
    resource::{ResourceKind, VulkanResource},
};
use crate::{
    Error, Result,
    backend::{
        BindPoint, ClearFlags, CpuDescriptorHandle, DescriptorHeapType, GpuDescriptorHandle,
        IndexBufferView, PrimitiveTopology, QueueKind, RawCommandList, RootViewKind, ScissorRect,
        VertexBufferView, Viewport,
    },
    tracking::{Barrier, SplitBarrier},
};

struct PoolBuffers {
    buffers: Vec<vk::CommandBuffer>,
    used: usize,
}

pub struct VulkanCommandAllocator {
    shared: Arc<DeviceShared>,
    pool: vk::CommandPool,
    buffers: Mutex<PoolBuffers>,
}

impl Debug for VulkanCommandAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let buffers = self.buffers.lock().unwrap();
        f.debug_struct("VulkanCommandAllocator")
            .field("pool", &self.pool)
            .field("buffers", &buffers.buffers.len())
            .field("used", &buffers.used)
            .finish()
    }
}

impl VulkanCommandAllocator {
    pub(super) fn new(shared: Arc<DeviceShared>, kind: QueueKind) -> Result<Self> {
        let info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(shared.queue_slot(kind).family);
        let pool = unsafe { shared.raw.create_command_pool(&info, None)? };
        Ok(Self {
            shared,
            pool,
            buffers: Mutex::new(PoolBuffers {
                buffers: Vec::new(),
                used: 0,
            }),
        })
    }

    /// # Safety
    /// No command buffer of this pool may be pending execution.
    pub(super) unsafe fn reset(&mut self) -> Result<()> {
        unsafe {
            self.shared
                .raw
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())?
        };
        self.buffers.get_mut().unwrap().used = 0;
        Ok(())
    }

    /// A command buffer in the initial state.
    fn acquire(&self) -> Result<vk::CommandBuffer> {
        let mut buffers = self.buffers.lock().unwrap();
        if let Some(buffer) = buffers.buffers.get(buffers.used).copied() {
            buffers.used += 1;
            return Ok(buffer);
        }
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffer = unsafe { self.shared.raw.allocate_command_buffers(&info)? }
            .pop()
            .ok_or(Error::OutOfMemory)?;
        buffers.buffers.push(buffer);
        buffers.used += 1;
        Ok(buffer)
    }
}

impl Drop for VulkanCommandAllocator {
    fn drop(&mut self) {
        unsafe { self.shared.raw.destroy_command_pool(self.pool, None) };
    }
}

#[derive(Clone, Copy, Debug)]
struct BoundHeap {
    address: u64,
    buffer_index: u32,
}

fn bind_point_index(bind_point: BindPoint) -> usize {
    match bind_point {
        BindPoint::Graphics => 0,
        BindPoint::Compute => 1,
    }
}

pub struct VulkanCommandList {
    shared: Arc<DeviceShared>,
    kind: QueueKind,
    raw: vk::CommandBuffer,
    signatures: [Option<VulkanRootSignature>; 2],
    /// Bound shader-visible heaps, indexed by heap type.
    heaps: [Option<BoundHeap>; 2],
    heap_offsets_dirty: [bool; 2],
    color_targets: SmallVec<[TargetView; 8]>,
    depth_target: Option<TargetView>,
    rendering: bool,
    /// Layouts this list has moved images into.
    image_layouts: SmallVec<[(vk::Image, vk::ImageLayout); 16]>,
}

impl Debug for VulkanCommandList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanCommandList")
            .field("kind", &self.kind)
            .field("raw", &self.raw)
            .field("rendering", &self.rendering)
            .finish_non_exhaustive()
    }
}

impl VulkanCommandList {
    pub(super) fn new(
        shared: Arc<DeviceShared>,
        kind: QueueKind,
        allocator: &VulkanCommandAllocator,
    ) -> Result<Self> {
        let mut list = Self {
            shared,
            kind,
            raw: vk::CommandBuffer::null(),
            signatures: [None, None],
            heaps: [None, None],
            heap_offsets_dirty: [false; 2],
            color_targets: SmallVec::new(),
            depth_target: None,
            rendering: false,
            image_layouts: SmallVec::new(),
        };
        list.begin(allocator)?;
        Ok(list)
    }

    pub fn raw(&self) -> vk::CommandBuffer {
        self.raw
    }

    fn begin(&mut self, allocator: &VulkanCommandAllocator) -> Result<()> {
        let raw = allocator.acquire()?;
        let info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.shared.raw.begin_command_buffer(raw, &info)? };
        self.raw = raw;
        self.signatures = [None, None];
        self.heaps = [None, None];
        self.heap_offsets_dirty = [false; 2];
        self.color_targets.clear();
        self.depth_target = None;
        self.rendering = false;
        self.image_layouts.clear();
        Ok(())
    }

    fn image_layout(&self, image: vk::Image, default: vk::ImageLayout) -> vk::ImageLayout {
        self.image_layouts
            .iter()
            .rev()
            .find(|(candidate, _)| *candidate == image)
            .map_or(default, |(_, layout)| *layout)
    }

    fn set_image_layout(&mut self, image: vk::Image, layout: vk::ImageLayout) {
        match self
            .image_layouts
            .iter_mut()
            .find(|(candidate, _)| *candidate == image)
        {
            Some((_, current)) => *current = layout,
            None => self.image_layouts.push((image, layout)),
        }
    }

    fn color_attachment(&self, target: &TargetView) -> vk::RenderingAttachmentInfo<'static> {
        vk::RenderingAttachmentInfo::default()
            .image_view(target.view)
            .image_layout(self.image_layout(target.image, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL))
            .load_op(vk::AttachmentLoadOp::LOAD)
            .store_op(vk::AttachmentStoreOp::STORE)
    }

    fn depth_attachment(&self, target: &TargetView) -> vk::RenderingAttachmentInfo<'static> {
        vk::RenderingAttachmentInfo::default()
            .image_view(target.view)
            .image_layout(self.image_layout(
                target.image,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ))
            .load_op(vk::AttachmentLoadOp::LOAD)
            .store_op(vk::AttachmentStoreOp::STORE)
    }

    /// Records `vkCmdBeginRendering` over `colors` and `depth`.
    unsafe fn render(
        &self,
        extent: vk::Extent2D,
        colors: &[vk::RenderingAttachmentInfo<'_>],
        depth: Option<(vk::RenderingAttachmentInfo<'_>, bool)>,
    ) {
        let mut info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            })
            .layer_count(1)
            .color_attachments(colors);
        if let Some((depth, _)) = &depth {
            info = info.depth_attachment(depth);
        }
        if let Some((stencil, true)) = &depth {
            info = info.stencil_attachment(stencil);
        }
        unsafe { self.shared.raw.cmd_begin_rendering(self.raw, &info) };
    }

    fn begin_rendering(&mut self) {
        if self.rendering {
            return;
        }
        let Some(extent) = self
            .color_targets
            .iter()
            .chain(self.depth_target.iter())
            .map(|target| target.extent)
            .reduce(|a, b| vk::Extent2D {
                width: a.width.min(b.width),
                height: a.height.min(b.height),
            })
        else {
            tracing::error!("draw without render targets");
            return;
        };
        let colors: SmallVec<[vk::RenderingAttachmentInfo; 8]> = self
            .color_targets
            .iter()
            .map(|target| self.color_attachment(target))
            .collect();
        let depth = self.depth_target.map(|target| {
            (
                self.depth_attachment(&target),
                target.aspect.contains(vk::ImageAspectFlags::STENCIL),
            )
        });
        unsafe { self.render(extent, &colors, depth) };
        self.rendering = true;
    }

    fn end_rendering(&mut self) {
        if self.rendering {
            unsafe { self.shared.raw.cmd_end_rendering(self.raw) };
            self.rendering = false;
        }
    }

    fn flush_heap_offsets(&mut self, bind_point: BindPoint) {
        let index = bind_point_index(bind_point);
        if !self.heap_offsets_dirty[index] {
            return;
        }
        let Some(signature) = &self.signatures[index] else {
            return;
        };
        for (set, heap) in self.heaps.iter().enumerate() {
            let Some(heap) = heap else {
                continue;
            };
            unsafe {
                self.shared.descriptor_buffer.cmd_set_descriptor_buffer_offsets(
                    self.raw,
                    conv::bind_point(bind_point),
                    signature.layout(),
                    set as u32,
                    &[heap.buffer_index],
                    &[0],
                )
            };
        }
        self.heap_offsets_dirty[index] = false;
    }

    fn root_slot(&self, bind_point: BindPoint, root_index: u32) -> Option<(RootSlot, vk::PipelineLayout)> {
        let signature = self.signatures[bind_point_index(bind_point)].as_ref()?;
        let slot = signature.0.slots.get(root_index as usize)?;
        Some((*slot, signature.layout()))
    }

    fn push_constants(&self, layout: vk::PipelineLayout, offset: u32, bytes: &[u8]) {
        unsafe {
            self.shared.raw.cmd_push_constants(
                self.raw,
                layout,
                vk::ShaderStageFlags::ALL,
                offset,
                bytes,
            )
        };
    }

    fn prepare_draw(&mut self) {
        self.flush_heap_offsets(BindPoint::Graphics);
        self.begin_rendering();
    }

    fn prepare_dispatch(&mut self) {
        self.end_rendering();
        self.flush_heap_offsets(BindPoint::Compute);
    }

    fn memory_barrier(&self, src: conv::StateScope, dst: conv::StateScope) {
        let barrier = vk::MemoryBarrier2::default()
            .src_stage_mask(src.stages)
            .src_access_mask(src.access)
            .dst_stage_mask(dst.stages)
            .dst_access_mask(dst.access);
        let dependency =
            vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&barrier));
        unsafe { self.shared.raw.cmd_pipeline_barrier2(self.raw, &dependency) };
    }

    /// Clears a buffer or image UAV with transfer commands, ordered against
    /// unordered-access work on both sides.
    fn clear_uav(&mut self, resource: &VulkanResource, word: u32, color: vk::ClearColorValue) {
        self.end_rendering();
        let uav = conv::uav_scope(self.kind);
        let clear = conv::StateScope {
            stages: vk::PipelineStageFlags2::ALL_TRANSFER,
            access: vk::AccessFlags2::TRANSFER_WRITE,
            layout: vk::ImageLayout::GENERAL,
        };
        self.memory_barrier(uav, clear);
        match resource.kind() {
            ResourceKind::Buffer { raw, .. } => unsafe {
                self.shared
                    .raw
                    .cmd_fill_buffer(self.raw, *raw, 0, vk::WHOLE_SIZE, word)
            },
            ResourceKind::Texture { raw, .. } => unsafe {
                self.shared.raw.cmd_clear_color_image(
                    self.raw,
                    *raw,
                    vk::ImageLayout::GENERAL,
                    &color,
                    &[resource.subresource_range()],
                )
            },
        }
        self.memory_barrier(clear, uav);
    }
}

impl RawCommandList<Vulkan> for VulkanCommandList {
    unsafe fn reset(&mut self, allocator: &VulkanCommandAllocator) -> Result<()> {
        self.begin(allocator)
    }

    unsafe fn close(&mut self) -> Result<()> {
        self.end_rendering();
        unsafe { self.shared.raw.end_command_buffer(self.raw)? };
        Ok(())
    }

    unsafe fn resource_barrier(&mut self, barriers: &[Barrier<Vulkan>]) {
        self.end_rendering();
        let mut memory: SmallVec<[vk::MemoryBarrier2; 2]> = SmallVec::new();
        let mut buffers: SmallVec<[vk::BufferMemoryBarrier2; 16]> = SmallVec::new();
        let mut images: SmallVec<[vk::ImageMemoryBarrier2; 16]> = SmallVec::new();
        for barrier in barriers {
            match barrier {
                // The whole transition happens at the end half.
                Barrier::Transition {
                    split: SplitBarrier::BeginOnly,
                    ..
                } => {}
                Barrier::Transition {
                    resource,
                    before,
                    after,
                    ..
                } => {
                    let src = conv::queue_scope(self.kind, conv::state_scope(*before));
                    let dst = conv::queue_scope(self.kind, conv::state_scope(*after));
                    match resource.kind() {
                        ResourceKind::Buffer { raw, .. } => buffers.push(
                            vk::BufferMemoryBarrier2::default()
                                .src_stage_mask(src.stages)
                                .src_access_mask(src.access)
                                .dst_stage_mask(dst.stages)
                                .dst_access_mask(dst.access)
                                .buffer(*raw)
                                .offset(0)
                                .size(vk::WHOLE_SIZE),
                        ),
                        ResourceKind::Texture { raw, .. } => {
                            images.push(
                                vk::ImageMemoryBarrier2::default()
                                    .src_stage_mask(src.stages)
                                    .src_access_mask(src.access)
                                    .dst_stage_mask(dst.stages)
                                    .dst_access_mask(dst.access)
                                    .old_layout(src.layout)
                                    .new_layout(dst.layout)
                                    .image(*raw)
                                    .subresource_range(resource.subresource_range()),
                            );
                            self.set_image_layout(*raw, dst.layout);
                        }
                    }
                }
                Barrier::Uav { .. } => {
                    let scope = conv::uav_scope(self.kind);
                    memory.push(
                        vk::MemoryBarrier2::default()
                            .src_stage_mask(scope.stages)
                            .src_access_mask(scope.access)
                            .dst_stage_mask(scope.stages)
                            .dst_access_mask(scope.access),
                    );
                }
                Barrier::Aliasing { .. } => memory.push(
                    vk::MemoryBarrier2::default()
                        .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                        .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
                        .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                        .dst_access_mask(
                            vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
                        ),
                ),
            }
        }
        if memory.is_empty() && buffers.is_empty() && images.is_empty() {
            return;
        }
        let dependency = vk::DependencyInfo::default()
            .memory_barriers(&memory)
            .buffer_memory_barriers(&buffers)
            .image_memory_barriers(&images);
        unsafe { self.shared.raw.cmd_pipeline_barrier2(self.raw, &dependency) };
    }

    unsafe fn set_descriptor_heaps(&mut self, heaps: &[&VulkanDescriptorHeap]) {
        let mut infos: SmallVec<[vk::DescriptorBufferBindingInfoEXT; 2]> = SmallVec::new();
        self.heaps = [None, None];
        for heap in heaps {
            let Some(address) = heap.address() else {
                tracing::error!(?heap, "binding a descriptor heap that is not shader visible");
                continue;
            };
            let usage = match heap.ty() {
                DescriptorHeapType::Sampler => vk::BufferUsageFlags::SAMPLER_DESCRIPTOR_BUFFER_EXT,
                _ => vk::BufferUsageFlags::RESOURCE_DESCRIPTOR_BUFFER_EXT,
            };
            self.heaps[heap.ty().index()] = Some(BoundHeap {
                address,
                buffer_index: infos.len() as u32,
            });
            infos.push(
                vk::DescriptorBufferBindingInfoEXT::default()
                    .address(address)
                    .usage(usage),
            );
        }
        unsafe {
            self.shared
                .descriptor_buffer
                .cmd_bind_descriptor_buffers(self.raw, &infos)
        };
        self.heap_offsets_dirty = [true; 2];
    }

    unsafe fn set_pipeline_state(&mut self, pipeline: &VulkanPipelineState) {
        unsafe {
            self.shared
                .raw
                .cmd_bind_pipeline(self.raw, pipeline.bind_point(), pipeline.raw())
        };
    }

    unsafe fn set_root_signature(&mut self, bind_point: BindPoint, signature: &VulkanRootSignature) {
        let index = bind_point_index(bind_point);
        self.signatures[index] = Some(signature.clone());
        self.heap_offsets_dirty[index] = true;
    }

    unsafe fn set_root_descriptor_table(
        &mut self,
        bind_point: BindPoint,
        root_index: u32,
        base: GpuDescriptorHandle,
    ) {
        let Some((RootSlot::Table { offset, heap }, layout)) = self.root_slot(bind_point, root_index)
        else {
            tracing::error!(root_index, "root parameter is not a descriptor table");
            return;
        };
        let Some(bound) = self.heaps[heap.index()] else {
            tracing::error!(root_index, ?heap, "descriptor table set without a bound heap");
            return;
        };
        let stride = self.shared.increment(heap) as u64;
        let first = ((base.0 - bound.address) / stride) as u32;
        self.push_constants(layout, offset, &first.to_ne_bytes());
    }

    unsafe fn set_root_constants(
        &mut self,
        bind_point: BindPoint,
        root_index: u32,
        dest_offset: u32,
        values: &[u32],
    ) {
        let Some((RootSlot::Constants { offset, count }, layout)) =
            self.root_slot(bind_point, root_index)
        else {
            tracing::error!(root_index, "root parameter is not a constant block");
            return;
        };
        debug_assert!(dest_offset + values.len() as u32 <= count);
        self.push_constants(layout, offset + dest_offset * 4, bytemuck::cast_slice(values));
    }

    unsafe fn set_root_view(
        &mut self,
        bind_point: BindPoint,
        root_index: u32,
        _kind: RootViewKind,
        gpu_address: u64,
    ) {
        let Some((RootSlot::View { offset }, layout)) = self.root_slot(bind_point, root_index)
        else {
            tracing::error!(root_index, "root parameter is not a root view");
            return;
        };
        self.push_constants(layout, offset, &gpu_address.to_ne_bytes());
    }

    unsafe fn set_viewports(&mut self, viewports: &[Viewport]) {
        // Negative heights keep y pointing down, as in the rest of the API.
        let viewports: SmallVec<[vk::Viewport; 8]> = viewports
            .iter()
            .map(|viewport| vk::Viewport {
                x: viewport.x,
                y: viewport.y + viewport.height,
                width: viewport.width,
                height: -viewport.height,
                min_depth: viewport.min_depth,
                max_depth: viewport.max_depth,
            })
            .collect();
        unsafe {
            self.shared
                .raw
                .cmd_set_viewport_with_count(self.raw, &viewports)
        };
    }

    unsafe fn set_scissor_rects(&mut self, rects: &[ScissorRect]) {
        let rects: SmallVec<[vk::Rect2D; 8]> = rects
            .iter()
            .map(|rect| vk::Rect2D {
                offset: vk::Offset2D {
                    x: rect.min.x,
                    y: rect.min.y,
                },
                extent: vk::Extent2D {
                    width: (rect.max.x - rect.min.x).max(0) as u32,
                    height: (rect.max.y - rect.min.y).max(0) as u32,
                },
            })
            .collect();
        unsafe { self.shared.raw.cmd_set_scissor_with_count(self.raw, &rects) };
    }

    unsafe fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        unsafe {
            self.shared
                .raw
                .cmd_set_primitive_topology(self.raw, conv::topology(topology))
        };
    }

    unsafe fn set_render_targets(
        &mut self,
        rtvs: &[CpuDescriptorHandle],
        dsv: Option<CpuDescriptorHandle>,
    ) {
        self.end_rendering();
        self.color_targets = rtvs
            .iter()
            .filter_map(|rtv| unsafe { read_target(*rtv) })
            .collect();
        self.depth_target = dsv.and_then(|dsv| unsafe { read_target(dsv) });
    }

    unsafe fn set_vertex_buffers(&mut self, start_slot: u32, views: &[VertexBufferView]) {
        let mut buffers: SmallVec<[vk::Buffer; 8]> = SmallVec::new();
        let mut offsets: SmallVec<[u64; 8]> = SmallVec::new();
        let mut sizes: SmallVec<[u64; 8]> = SmallVec::new();
        let mut strides: SmallVec<[u64; 8]> = SmallVec::new();
        for view in views {
            let Some((buffer, offset)) = self.shared.resolve_address(view.gpu_address) else {
                tracing::error!(address = view.gpu_address, "vertex buffer address is not in any buffer");
                return;
            };
            buffers.push(buffer);
            offsets.push(offset);
            sizes.push(view.size_in_bytes as u64);
            strides.push(view.stride_in_bytes as u64);
        }
        unsafe {
            self.shared.raw.cmd_bind_vertex_buffers2(
                self.raw,
                start_slot,
                &buffers,
                &offsets,
                Some(&sizes),
                Some(&strides),
            )
        };
    }

    unsafe fn set_index_buffer(&mut self, view: &IndexBufferView) {
        let Some((buffer, offset)) = self.shared.resolve_address(view.gpu_address) else {
            tracing::error!(address = view.gpu_address, "index buffer address is not in any buffer");
            return;
        };
        unsafe {
            self.shared.raw.cmd_bind_index_buffer(
                self.raw,
                buffer,
                offset,
                conv::index_type(view.format),
            )
        };
    }

    unsafe fn draw_instanced(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    ) {
        self.prepare_draw();
        unsafe {
            self.shared.raw.cmd_draw(
                self.raw,
                vertex_count,
                instance_count,
                start_vertex,
                start_instance,
            )
        };
    }

    unsafe fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    ) {
        self.prepare_draw();
        unsafe {
            self.shared.raw.cmd_draw_indexed(
                self.raw,
                index_count,
                instance_count,
                start_index,
                base_vertex,
                start_instance,
            )
        };
    }

    unsafe fn dispatch(&mut self, group_count: UVec3) {
        self.prepare_dispatch();
        unsafe {
            self.shared
                .raw
                .cmd_dispatch(self.raw, group_count.x, group_count.y, group_count.z)
        };
    }

    unsafe fn draw_indirect(&mut self, arguments: &VulkanResource, offset: u64, indexed: bool) {
        let Some(buffer) = arguments.raw_buffer() else {
            tracing::error!(?arguments, "indirect arguments must be a buffer");
            return;
        };
        self.prepare_draw();
        unsafe {
            if indexed {
                self.shared.raw.cmd_draw_indexed_indirect(
                    self.raw,
                    buffer,
                    offset,
                    1,
                    size_of::<vk::DrawIndexedIndirectCommand>() as u32,
                );
            } else {
                self.shared.raw.cmd_draw_indirect(
                    self.raw,
                    buffer,
                    offset,
                    1,
                    size_of::<vk::DrawIndirectCommand>() as u32,
                );
            }
        }
    }

    unsafe fn dispatch_indirect(&mut self, arguments: &VulkanResource, offset: u64) {
        let Some(buffer) = arguments.raw_buffer() else {
            tracing::error!(?arguments, "indirect arguments must be a buffer");
            return;
        };
        self.prepare_dispatch();
        unsafe { self.shared.raw.cmd_dispatch_indirect(self.raw, buffer, offset) };
    }

    unsafe fn clear_render_target_view(&mut self, rtv: CpuDescriptorHandle, color: [f32; 4]) {
        self.end_rendering();
        let Some(target) = (unsafe { read_target(rtv) }) else {
            tracing::error!(?rtv, "clearing an empty render target view");
            return;
        };
        let attachment = self
            .color_attachment(&target)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue { float32: color },
            });
        unsafe {
            self.render(target.extent, std::slice::from_ref(&attachment), None);
            self.shared.raw.cmd_end_rendering(self.raw);
        }
    }

    unsafe fn clear_depth_stencil_view(
        &mut self,
        dsv: CpuDescriptorHandle,
        flags: ClearFlags,
        depth: f32,
        stencil: u8,
    ) {
        self.end_rendering();
        let Some(target) = (unsafe { read_target(dsv) }) else {
            tracing::error!(?dsv, "clearing an empty depth stencil view");
            return;
        };
        let has_stencil = target.aspect.contains(vk::ImageAspectFlags::STENCIL);
        let load = |clear: bool| {
            if clear {
                vk::AttachmentLoadOp::CLEAR
            } else {
                vk::AttachmentLoadOp::LOAD
            }
        };
        let clear_value = vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth,
                stencil: stencil as u32,
            },
        };
        let attachment = self
            .depth_attachment(&target)
            .load_op(load(flags.contains(ClearFlags::DEPTH)))
            .clear_value(clear_value);
        if has_stencil && flags.contains(ClearFlags::STENCIL) != flags.contains(ClearFlags::DEPTH) {
            // Depth and stencil clear independently, so the stencil half needs its
            // own load op.
            let stencil_attachment = attachment.load_op(load(flags.contains(ClearFlags::STENCIL)));
            let mut info = vk::RenderingInfo::default()
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D::default(),
                    extent: target.extent,
                })
                .layer_count(1);
            info = info
                .depth_attachment(&attachment)
                .stencil_attachment(&stencil_attachment);
            unsafe {
                self.shared.raw.cmd_begin_rendering(self.raw, &info);
                self.shared.raw.cmd_end_rendering(self.raw);
            }
            return;
        }
        unsafe {
            self.render(target.extent, &[], Some((attachment, has_stencil)));
            self.shared.raw.cmd_end_rendering(self.raw);
        }
    }

    unsafe fn clear_unordered_access_view_float(
        &mut self,
        _gpu: GpuDescriptorHandle,
        _cpu: CpuDescriptorHandle,
        resource: &VulkanResource,
        values: [f32; 4],
    ) {
        self.clear_uav(
            resource,
            values[0].to_bits(),
            vk::ClearColorValue { float32: values },
        );
    }

    unsafe fn clear_unordered_access_view_uint(
        &mut self,
        _gpu: GpuDescriptorHandle,
        _cpu: CpuDescriptorHandle,
        resource: &VulkanResource,
        values: [u32; 4],
    ) {
        self.clear_uav(resource, values[0], vk::ClearColorValue { uint32: values });
    }

    unsafe fn copy_resource(&mut self, dst: &VulkanResource, src: &VulkanResource) {
        self.end_rendering();
        match (dst.kind(), src.kind()) {
            (
                ResourceKind::Buffer {
                    raw: dst_buffer,
                    size: dst_size,
                    ..
                },
                ResourceKind::Buffer {
                    raw: src_buffer,
                    size: src_size,
                    ..
                },
            ) => unsafe {
                self.shared.raw.cmd_copy_buffer(
                    self.raw,
                    *src_buffer,
                    *dst_buffer,
                    &[vk::BufferCopy {
                        src_offset: 0,
                        dst_offset: 0,
                        size: (*dst_size).min(*src_size),
                    }],
                )
            },
            (
                ResourceKind::Texture { raw: dst_image, .. },
                ResourceKind::Texture {
                    raw: src_image,
                    extent,
                    mip_levels,
                    ..
                },
            ) => {
                let range = src.subresource_range();
                let regions: SmallVec<[vk::ImageCopy; 16]> = (0..*mip_levels)
                    .map(|mip| {
                        let layers = vk::ImageSubresourceLayers {
                            aspect_mask: range.aspect_mask,
                            mip_level: mip,
                            base_array_layer: 0,
                            layer_count: range.layer_count,
                        };
                        vk::ImageCopy {
                            src_subresource: layers,
                            src_offset: vk::Offset3D::default(),
                            dst_subresource: layers,
                            dst_offset: vk::Offset3D::default(),
                            extent: vk::Extent3D {
                                width: (extent.width >> mip).max(1),
                                height: (extent.height >> mip).max(1),
                                depth: 1,
                            },
                        }
                    })
                    .collect();
                unsafe {
                    self.shared.raw.cmd_copy_image(
                        self.raw,
                        *src_image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        *dst_image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &regions,
                    )
                };
            }
            _ => tracing::error!(?dst, ?src, "copy between a buffer and a texture"),
        }
    }

    unsafe fn copy_buffer_region(
        &mut self,
        dst: &VulkanResource,
        dst_offset: u64,
        src: &VulkanResource,
        src_offset: u64,
        size: u64,
    ) {
        let (Some(dst_buffer), Some(src_buffer)) = (dst.raw_buffer(), src.raw_buffer()) else {
            tracing::error!(?dst, ?src, "buffer region copy on a texture");
            return;
        };
        self.end_rendering();
        unsafe {
            self.shared.raw.cmd_copy_buffer(
                self.raw,
                src_buffer,
                dst_buffer,
                &[vk::BufferCopy {
                    src_offset,
                    dst_offset,
                    size,
                }],
            )
        };
    }
}
