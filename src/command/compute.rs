//! Compute commands.
//!
//! [`ComputeCommands`] borrows a direct or compute [`CommandList`] and records on the
//! compute bind point.
use std::ops::{Deref, DerefMut};

use glam::{UVec2, UVec3};

use crate::{
    Result,
    backend::{Api, BindPoint, RawCommandList},
    resource::{GpuBuffer, TrackedResource},
    tracking::ResourceStates,
};

use super::{CommandContext, CommandList, bind_point_commands};

/// Compute view of a direct or compute [`CommandList`].
///
/// # Deref
///
/// `ComputeCommands` implements `Deref<Target = CommandList>`, so list methods like
/// [`insert_uav_barrier`](CommandList::insert_uav_barrier) can be called directly on
/// the view.
pub struct ComputeCommands<'a, A: Api> {
    list: &'a mut CommandList<A>,
}

impl<A: Api> Deref for ComputeCommands<'_, A> {
    type Target = CommandList<A>;

    fn deref(&self) -> &Self::Target {
        self.list
    }
}

impl<A: Api> DerefMut for ComputeCommands<'_, A> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.list
    }
}

bind_point_commands!(ComputeCommands, BindPoint::Compute);

impl<'a, A: Api> ComputeCommands<'a, A> {
    pub(super) fn new(list: &'a mut CommandList<A>) -> Self {
        Self { list }
    }

    fn context(&mut self) -> &mut CommandContext<A> {
        self.list.recording()
    }

    /// Dispatches `group_count` thread groups.
    pub fn dispatch(&mut self, group_count: UVec3) -> Result<()> {
        let context = self.context();
        context.prepare(BindPoint::Compute)?;
        unsafe { context.raw.dispatch(group_count) };
        Ok(())
    }

    /// Dispatches enough groups of `group_size` threads to cover `thread_count`.
    pub fn dispatch_1d(&mut self, thread_count: u32, group_size: u32) -> Result<()> {
        self.dispatch(UVec3::new(thread_count.div_ceil(group_size), 1, 1))
    }

    pub fn dispatch_2d(&mut self, thread_count: UVec2, group_size: UVec2) -> Result<()> {
        self.dispatch_3d(thread_count.extend(1), group_size.extend(1))
    }

    pub fn dispatch_3d(&mut self, thread_count: UVec3, group_size: UVec3) -> Result<()> {
        self.dispatch(UVec3::new(
            thread_count.x.div_ceil(group_size.x),
            thread_count.y.div_ceil(group_size.y),
            thread_count.z.div_ceil(group_size.z),
        ))
    }

    /// Dispatches with group counts read from `arguments`. Transitions it to
    /// `INDIRECT_ARGUMENT`.
    pub fn dispatch_indirect(&mut self, arguments: &mut GpuBuffer<A>, offset: u64) -> Result<()> {
        self.list
            .transition_resource(arguments, ResourceStates::INDIRECT_ARGUMENT, false);
        let context = self.context();
        context.prepare(BindPoint::Compute)?;
        unsafe {
            context
                .raw
                .dispatch_indirect(arguments.gpu_resource().raw(), offset)
        };
        Ok(())
    }

    /// Zeroes `buffer` through its UAV. Transitions it to `UNORDERED_ACCESS`.
    pub fn clear_uav(&mut self, buffer: &mut GpuBuffer<A>) -> Result<()> {
        self.list.clear_buffer_uav(buffer)
    }
}
