//! Graphics commands.
//!
//! [`GraphicsCommands`] borrows a direct [`CommandList`] and records on the graphics
//! bind point: input assembly, render targets, draws and clears. It derefs to the
//! list, so barriers and pipeline binds are available on the view as well.
//!
//! ```
//! # use scoria::prelude::*;
//! # use scoria::backend::headless::{Headless, HeadlessDevice};
//! # let device = Device::<Headless>::new(HeadlessDevice::default());
//! # let manager = CommandListManager::new(device, ManagerConfig::default()).unwrap();
//! let mut target = ColorBuffer::new(
//!     &manager,
//!     "scene",
//!     glam::UVec2::new(320, 240),
//!     Format::R16G16B16A16Float,
//!     [0.0; 4],
//!     false,
//! )
//! .unwrap();
//! let mut list = manager.begin(QueueKind::Direct).unwrap();
//! list.transition_resource(&mut target, ResourceStates::RENDER_TARGET, false);
//!
//! let mut gfx = list.graphics();
//! gfx.clear_color(&target);
//! gfx.set_render_target(target.rtv(), None);
//! gfx.set_viewport_and_scissor(0, 0, 320, 240);
//! gfx.set_dynamic_vb(0, 12, bytemuck::cast_slice(&[[0.0f32; 3]; 3])).unwrap();
//! gfx.draw(3).unwrap();
//! drop(gfx);
//!
//! list.close_and_execute(false).unwrap();
//! ```
use std::ops::{Deref, DerefMut};

use crate::{
    Result,
    backend::{
        Api, BindPoint, ClearFlags, CpuDescriptorHandle, IndexBufferView, IndexFormat,
        PrimitiveTopology, RawCommandList, ScissorRect, VertexBufferView, Viewport,
    },
    resource::{ColorBuffer, DepthBuffer, GpuBuffer, TrackedResource},
    tracking::ResourceStates,
};

use super::{CommandContext, CommandList, bind_point_commands};

/// Alignment of vertex and index data copied through upload memory.
const DYNAMIC_GEOMETRY_ALIGNMENT: u64 = 16;

/// Graphics view of a direct [`CommandList`].
///
/// # Deref
///
/// `GraphicsCommands` implements `Deref<Target = CommandList>`, so list methods like
/// [`transition_resource`](CommandList::transition_resource) can be called directly on
/// the view.
pub struct GraphicsCommands<'a, A: Api> {
    list: &'a mut CommandList<A>,
}

impl<A: Api> Deref for GraphicsCommands<'_, A> {
    type Target = CommandList<A>;

    fn deref(&self) -> &Self::Target {
        self.list
    }
}

impl<A: Api> DerefMut for GraphicsCommands<'_, A> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.list
    }
}

bind_point_commands!(GraphicsCommands, BindPoint::Graphics);

impl<'a, A: Api> GraphicsCommands<'a, A> {
    pub(super) fn new(list: &'a mut CommandList<A>) -> Self {
        Self { list }
    }

    fn context(&mut self) -> &mut CommandContext<A> {
        self.list.recording()
    }

    fn native(&mut self) -> &mut A::CommandList {
        &mut self.context().raw
    }

    pub fn set_index_buffer(&mut self, view: &IndexBufferView) {
        unsafe { self.native().set_index_buffer(view) };
    }

    pub fn set_vertex_buffer(&mut self, slot: u32, view: &VertexBufferView) {
        self.set_vertex_buffers(slot, std::slice::from_ref(view));
    }

    pub fn set_vertex_buffers(&mut self, start_slot: u32, views: &[VertexBufferView]) {
        unsafe { self.native().set_vertex_buffers(start_slot, views) };
    }

    /// Copies vertices into upload memory and binds them to `slot`.
    pub fn set_dynamic_vb(&mut self, slot: u32, stride: u32, data: &[u8]) -> Result<()> {
        let context = self.context();
        let mut alloc = context
            .cpu_linear
            .allocate(data.len() as u64, DYNAMIC_GEOMETRY_ALIGNMENT)?;
        alloc.write(data);
        let view = VertexBufferView {
            gpu_address: alloc.gpu_address(),
            size_in_bytes: data.len() as u32,
            stride_in_bytes: stride,
        };
        unsafe { context.raw.set_vertex_buffers(slot, &[view]) };
        Ok(())
    }

    /// Copies 16-bit indices into upload memory and binds them.
    pub fn set_dynamic_ib(&mut self, indices: &[u16]) -> Result<()> {
        let context = self.context();
        let bytes: &[u8] = bytemuck::cast_slice(indices);
        let mut alloc = context
            .cpu_linear
            .allocate(bytes.len() as u64, DYNAMIC_GEOMETRY_ALIGNMENT)?;
        alloc.write(bytes);
        let view = IndexBufferView {
            gpu_address: alloc.gpu_address(),
            size_in_bytes: bytes.len() as u32,
            format: IndexFormat::U16,
        };
        unsafe { context.raw.set_index_buffer(&view) };
        Ok(())
    }

    pub fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        unsafe { self.native().set_primitive_topology(topology) };
    }

    pub fn set_render_targets(&mut self, rtvs: &[CpuDescriptorHandle], dsv: Option<CpuDescriptorHandle>) {
        unsafe { self.native().set_render_targets(rtvs, dsv) };
    }

    pub fn set_render_target(&mut self, rtv: CpuDescriptorHandle, dsv: Option<CpuDescriptorHandle>) {
        self.set_render_targets(&[rtv], dsv);
    }

    pub fn set_viewport(&mut self, viewport: &Viewport) {
        unsafe { self.native().set_viewports(std::slice::from_ref(viewport)) };
    }

    pub fn set_scissor(&mut self, rect: &ScissorRect) {
        unsafe { self.native().set_scissor_rects(std::slice::from_ref(rect)) };
    }

    /// Sets a full-depth viewport and a matching scissor rectangle.
    pub fn set_viewport_and_scissor(&mut self, x: u32, y: u32, width: u32, height: u32) {
        self.set_viewport(&Viewport {
            x: x as f32,
            y: y as f32,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        });
        let min = glam::UVec2::new(x, y).as_ivec2();
        self.set_scissor(&ScissorRect {
            min,
            max: min + glam::UVec2::new(width, height).as_ivec2(),
        });
    }

    pub fn draw(&mut self, vertex_count: u32) -> Result<()> {
        self.draw_instanced(vertex_count, 1, 0, 0)
    }

    pub fn draw_indexed(&mut self, index_count: u32, start_index: u32, base_vertex: i32) -> Result<()> {
        self.draw_indexed_instanced(index_count, 1, start_index, base_vertex, 0)
    }

    pub fn draw_instanced(
        &mut self,
        vertex_count_per_instance: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    ) -> Result<()> {
        let context = self.context();
        context.prepare(BindPoint::Graphics)?;
        unsafe {
            context.raw.draw_instanced(
                vertex_count_per_instance,
                instance_count,
                start_vertex,
                start_instance,
            )
        };
        Ok(())
    }

    pub fn draw_indexed_instanced(
        &mut self,
        index_count_per_instance: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    ) -> Result<()> {
        let context = self.context();
        context.prepare(BindPoint::Graphics)?;
        unsafe {
            context.raw.draw_indexed_instanced(
                index_count_per_instance,
                instance_count,
                start_index,
                base_vertex,
                start_instance,
            )
        };
        Ok(())
    }

    /// Draws with arguments read from `arguments`. Transitions it to
    /// `INDIRECT_ARGUMENT`.
    pub fn draw_indirect(&mut self, arguments: &mut GpuBuffer<A>, offset: u64) -> Result<()> {
        self.indirect(arguments, offset, false)
    }

    pub fn draw_indexed_indirect(&mut self, arguments: &mut GpuBuffer<A>, offset: u64) -> Result<()> {
        self.indirect(arguments, offset, true)
    }

    fn indirect(&mut self, arguments: &mut GpuBuffer<A>, offset: u64, indexed: bool) -> Result<()> {
        self.list
            .transition_resource(arguments, ResourceStates::INDIRECT_ARGUMENT, false);
        let context = self.context();
        context.prepare(BindPoint::Graphics)?;
        unsafe {
            context
                .raw
                .draw_indirect(arguments.gpu_resource().raw(), offset, indexed)
        };
        Ok(())
    }

    /// Clears `target` to its clear color. It must be in `RENDER_TARGET` state.
    pub fn clear_color(&mut self, target: &ColorBuffer<A>) {
        self.clear_color_with(target, target.clear_color());
    }

    pub fn clear_color_with(&mut self, target: &ColorBuffer<A>, color: [f32; 4]) {
        debug_assert_eq!(
            target.gpu_resource().usage_state(),
            ResourceStates::RENDER_TARGET,
            "color buffer cleared outside of RENDER_TARGET"
        );
        let context = self.context();
        context.flush_resource_barriers();
        unsafe { context.raw.clear_render_target_view(target.rtv(), color) };
    }

    pub fn clear_depth(&mut self, target: &DepthBuffer<A>) {
        self.clear_depth_stencil(target, ClearFlags::DEPTH);
    }

    pub fn clear_stencil(&mut self, target: &DepthBuffer<A>) {
        self.clear_depth_stencil(target, ClearFlags::STENCIL);
    }

    pub fn clear_depth_and_stencil(&mut self, target: &DepthBuffer<A>) {
        self.clear_depth_stencil(target, ClearFlags::DEPTH | ClearFlags::STENCIL);
    }

    fn clear_depth_stencil(&mut self, target: &DepthBuffer<A>, flags: ClearFlags) {
        debug_assert_eq!(
            target.gpu_resource().usage_state(),
            ResourceStates::DEPTH_WRITE,
            "depth buffer cleared outside of DEPTH_WRITE"
        );
        debug_assert!(
            target.has_stencil() || !flags.contains(ClearFlags::STENCIL),
            "{:?} has no stencil",
            target.format()
        );
        let context = self.context();
        context.flush_resource_barriers();
        unsafe {
            context.raw.clear_depth_stencil_view(
                target.dsv(),
                flags,
                target.clear_depth(),
                target.clear_stencil(),
            )
        };
    }

    /// Zeroes `buffer` through its UAV. Transitions it to `UNORDERED_ACCESS`.
    pub fn clear_uav(&mut self, buffer: &mut GpuBuffer<A>) -> Result<()> {
        self.list.clear_buffer_uav(buffer)
    }

    /// Clears `target` to its clear color through its UAV. Transitions it to
    /// `UNORDERED_ACCESS`.
    ///
    /// # Panics
    /// If `target` was created without unordered access.
    pub fn clear_color_uav(&mut self, target: &mut ColorBuffer<A>) -> Result<()> {
        let Some(uav) = target.uav() else {
            panic!("color buffer has no UAV");
        };
        self.list
            .transition_resource(target, ResourceStates::UNORDERED_ACCESS, true);
        let context = self.context();
        let gpu = context.upload_direct(uav)?;
        unsafe {
            context.raw.clear_unordered_access_view_float(
                gpu,
                uav,
                target.gpu_resource().raw(),
                target.clear_color(),
            )
        };
        Ok(())
    }
}

impl<A: Api> CommandList<A> {
    /// Shared by the graphics and compute views.
    pub(super) fn clear_buffer_uav(&mut self, buffer: &mut GpuBuffer<A>) -> Result<()> {
        self.transition_resource(buffer, ResourceStates::UNORDERED_ACCESS, true);
        let context = self.recording();
        let gpu = context.upload_direct(buffer.uav())?;
        unsafe {
            context.raw.clear_unordered_access_view_uint(
                gpu,
                buffer.uav(),
                buffer.gpu_resource().raw(),
                [0; 4],
            )
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        Device,
        backend::{
            DescriptorHeapType, Format, QueueKind,
            headless::{Command, Descriptor, ExecutionMode, Headless, HeadlessConfig, HeadlessDevice},
        },
        config::ManagerConfig,
        manager::CommandListManager,
        pipeline::PipelineState,
        root_signature::{
            DescriptorRangeKind, RootParameter, RootSignature, RootSignatureDesc, ShaderVisibility,
        },
    };

    fn manager() -> (HeadlessDevice, CommandListManager<Headless>) {
        let raw = HeadlessDevice::new(HeadlessConfig {
            mode: ExecutionMode::Immediate,
            capture: true,
            ..Default::default()
        });
        let manager =
            CommandListManager::new(Device::<Headless>::new(raw.clone()), ManagerConfig::default())
                .unwrap();
        (raw, manager)
    }

    fn signature(manager: &CommandListManager<Headless>) -> Arc<RootSignature<Headless>> {
        Arc::new(
            RootSignature::new(
                manager.device().clone(),
                RootSignatureDesc::new(vec![
                    RootParameter::constants(4, 0, ShaderVisibility::All),
                    RootParameter::cbv(1, ShaderVisibility::All),
                    RootParameter::table(DescriptorRangeKind::Srv, 4, ShaderVisibility::Pixel),
                    RootParameter::table(DescriptorRangeKind::Sampler, 2, ShaderVisibility::Pixel),
                ]),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_draw_commits_staged_tables_once() {
        let (raw, manager) = manager();
        let signature = signature(&manager);
        let srvs: Vec<_> = (0..4)
            .map(|_| manager.allocate_descriptor(DescriptorHeapType::CbvSrvUav, 1).unwrap())
            .collect();
        let sampler = manager
            .allocate_descriptor(DescriptorHeapType::Sampler, 1)
            .unwrap();

        let mut list = manager.begin(QueueKind::Direct).unwrap();
        let mut gfx = list.graphics();
        gfx.set_root_signature(&signature);
        gfx.set_root_signature(&signature);
        gfx.set_dynamic_descriptors(2, 0, &srvs);
        gfx.set_dynamic_sampler(3, 1, sampler);
        gfx.draw(3).unwrap();
        gfx.draw(3).unwrap();
        drop(gfx);
        list.close_and_execute(false).unwrap();

        let stats = raw.stats();
        assert_eq!(stats.set_root_signature, 1);
        assert_eq!(stats.draws, 2);
        assert_eq!(stats.set_descriptor_table, 2);
        assert_eq!(stats.descriptors_copied, 5);
        assert_eq!(stats.set_descriptor_heaps, 2);
    }

    #[test]
    fn test_dynamic_constants_land_in_upload_memory() {
        let (raw, manager) = manager();
        let signature = signature(&manager);
        let mut list = manager.begin(QueueKind::Direct).unwrap();
        let mut gfx = list.graphics();
        gfx.set_root_signature(&signature);
        gfx.set_constants(0, &[1, 2, 3, 4]);
        gfx.set_dynamic_constants(1, &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        drop(gfx);
        list.close_and_execute(false).unwrap();

        let executed = raw.take_executed();
        let commands = &executed[0].commands;
        assert!(commands.contains(&Command::SetConstants {
            bind_point: BindPoint::Graphics,
            root_index: 0,
            dest_offset: 0,
            values: vec![1, 2, 3, 4],
        }));
        let gpu_address = commands
            .iter()
            .find_map(|command| match command {
                Command::SetRootView {
                    root_index: 1,
                    gpu_address,
                    ..
                } => Some(*gpu_address),
                _ => None,
            })
            .unwrap();
        assert_eq!(gpu_address % 256, 0);
    }

    #[test]
    fn test_clears_flush_pending_barriers_first() {
        let (raw, manager) = manager();
        let mut target = ColorBuffer::new(
            &manager,
            "target",
            glam::UVec2::new(8, 8),
            Format::R8G8B8A8Unorm,
            [1.0, 0.0, 0.0, 1.0],
            true,
        )
        .unwrap();
        let mut list = manager.begin(QueueKind::Direct).unwrap();
        list.transition_resource(&mut target, ResourceStates::RENDER_TARGET, false);
        let mut gfx = list.graphics();
        gfx.clear_color(&target);
        gfx.clear_color_uav(&mut target).unwrap();
        drop(gfx);
        list.close_and_execute(false).unwrap();

        let executed = raw.take_executed();
        let commands = &executed[0].commands;
        assert!(matches!(commands[0], Command::Barrier(_)));
        assert_eq!(
            commands[1],
            Command::ClearRenderTarget {
                rtv: target.rtv(),
                color: [1.0, 0.0, 0.0, 1.0],
            }
        );
        assert!(matches!(
            commands.last(),
            Some(Command::ClearUavFloat { values: [1.0, 0.0, 0.0, 1.0], .. })
        ));
        assert_eq!(target.gpu_resource().usage_state(), ResourceStates::UNORDERED_ACCESS);
        assert!(matches!(
            raw.descriptor(target.uav().unwrap()),
            Descriptor::UnorderedAccess { .. }
        ));
    }

    #[test]
    fn test_pipeline_binds_survive_views() {
        let (raw, manager) = manager();
        let signature = signature(&manager);
        let pso = Arc::new(PipelineState::headless(
            manager.device().clone(),
            signature.clone(),
            BindPoint::Graphics,
            "forward",
        ));
        let mut list = manager.begin(QueueKind::Direct).unwrap();
        for _ in 0..3 {
            let mut gfx = list.graphics();
            gfx.set_pipeline_state(&pso);
            gfx.set_root_signature(&signature);
            gfx.set_dynamic_ib(&[0, 1, 2]).unwrap();
            gfx.draw_indexed(3, 0, 0).unwrap();
        }
        list.close_and_execute(false).unwrap();
        assert_eq!(raw.stats().set_pipeline_state, 1);
        assert_eq!(raw.stats().set_root_signature, 1);
        assert_eq!(raw.stats().draws, 3);
    }
}
