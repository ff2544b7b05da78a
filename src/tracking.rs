//! Resource state tracking and transition barrier generation.
//!
//! Every GPU resource carries the state it was last transitioned into. Recording a use
//! in a different state requires a transition barrier; this module computes those
//! barriers and keeps the recorded state in step with them.
//!
//! # Overview
//!
//! - [`ResourceStates`] - The set of usage states, with the native bit values.
//! - [`ResourceState`] - The tracked state of one resource: its usage state plus the
//!   target of an in-flight split barrier, if any.
//! - [`GpuResource`] - A native resource paired with its [`ResourceState`].
//! - [`Barrier`] - A barrier ready to be batched on a command list.
//!
//! # Split Barriers
//!
//! A transition can be issued in two halves. The begin half lets the GPU start the
//! transition early; the end half, issued later, waits for it to complete. At most one
//! split transition may be outstanding per resource. Any later transition first
//! resolves the outstanding one:
//!
//! ```
//! use scoria::tracking::{ResourceState, ResourceStates, SplitBarrier, StateBarrier};
//!
//! let mut state = ResourceState::new(ResourceStates::RENDER_TARGET);
//! state.begin_transition(ResourceStates::PIXEL_SHADER_RESOURCE);
//! assert_eq!(state.usage(), ResourceStates::RENDER_TARGET);
//!
//! // Transitioning somewhere else ends the split barrier first.
//! let barriers = state.transition(ResourceStates::COPY_SOURCE);
//! assert_eq!(barriers.len(), 2);
//! assert!(matches!(barriers[0], StateBarrier::Transition { split: SplitBarrier::EndOnly, .. }));
//! assert_eq!(state.usage(), ResourceStates::COPY_SOURCE);
//! assert_eq!(state.transitioning(), None);
//! ```
use std::fmt::Debug;

use smallvec::SmallVec;

use crate::backend::Api;

bitflags::bitflags! {
    /// Usage states of a GPU resource.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct ResourceStates: u32 {
        const COMMON = 0;
        const VERTEX_AND_CONSTANT_BUFFER = 0x1;
        const INDEX_BUFFER = 0x2;
        const RENDER_TARGET = 0x4;
        const UNORDERED_ACCESS = 0x8;
        const DEPTH_WRITE = 0x10;
        const DEPTH_READ = 0x20;
        const NON_PIXEL_SHADER_RESOURCE = 0x40;
        const PIXEL_SHADER_RESOURCE = 0x80;
        const STREAM_OUT = 0x100;
        const INDIRECT_ARGUMENT = 0x200;
        const COPY_DEST = 0x400;
        const COPY_SOURCE = 0x800;
        const RESOLVE_DEST = 0x1000;
        const RESOLVE_SOURCE = 0x2000;
        const GENERIC_READ = Self::VERTEX_AND_CONSTANT_BUFFER.bits()
            | Self::INDEX_BUFFER.bits()
            | Self::NON_PIXEL_SHADER_RESOURCE.bits()
            | Self::PIXEL_SHADER_RESOURCE.bits()
            | Self::INDIRECT_ARGUMENT.bits()
            | Self::COPY_SOURCE.bits();
        const PRESENT = 0;
    }
}

impl ResourceStates {
    /// States a command list on a compute queue may transition into or out of.
    pub const VALID_COMPUTE_QUEUE_STATES: ResourceStates = ResourceStates::UNORDERED_ACCESS
        .union(ResourceStates::NON_PIXEL_SHADER_RESOURCE)
        .union(ResourceStates::COPY_DEST)
        .union(ResourceStates::COPY_SOURCE);

    /// States that allow GPU writes.
    pub const WRITE_STATES: ResourceStates = ResourceStates::RENDER_TARGET
        .union(ResourceStates::UNORDERED_ACCESS)
        .union(ResourceStates::DEPTH_WRITE)
        .union(ResourceStates::STREAM_OUT)
        .union(ResourceStates::COPY_DEST)
        .union(ResourceStates::RESOLVE_DEST);

    pub fn is_valid_on_compute_queue(self) -> bool {
        Self::VALID_COMPUTE_QUEUE_STATES.contains(self)
    }

    pub fn is_write(self) -> bool {
        self.intersects(Self::WRITE_STATES)
    }
}

/// Which half of a transition a barrier represents.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SplitBarrier {
    #[default]
    None,
    BeginOnly,
    EndOnly,
}

/// A barrier computed by [`ResourceState`], not yet bound to a native resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateBarrier {
    Transition {
        before: ResourceStates,
        after: ResourceStates,
        split: SplitBarrier,
    },
    /// Orders unordered-access writes against later unordered-access use.
    Uav,
}

pub type StateBarriers = SmallVec<[StateBarrier; 2]>;

/// Tracked state of one resource.
///
/// `transitioning` is `Some(target)` while a split barrier toward `target` has begun
/// but not ended. The usage state stays at the pre-transition state until the end half
/// is recorded.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ResourceState {
    usage: ResourceStates,
    transitioning: Option<ResourceStates>,
}

impl Debug for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("ResourceState");
        s.field("usage", &self.usage);
        if let Some(target) = self.transitioning {
            s.field("transitioning", &target);
        }
        s.finish()
    }
}

impl Default for ResourceState {
    fn default() -> Self {
        Self::new(ResourceStates::COMMON)
    }
}

impl ResourceState {
    pub fn new(usage: ResourceStates) -> Self {
        Self {
            usage,
            transitioning: None,
        }
    }

    pub fn usage(&self) -> ResourceStates {
        self.usage
    }

    pub fn transitioning(&self) -> Option<ResourceStates> {
        self.transitioning
    }

    /// Overwrites the tracked state without emitting barriers.
    ///
    /// Used when the state changed outside of tracked command lists, for example after
    /// a presentation engine released the resource.
    pub fn assume(&mut self, usage: ResourceStates) {
        self.usage = usage;
        self.transitioning = None;
    }

    fn resolve_pending(&mut self, barriers: &mut StateBarriers) {
        if let Some(target) = self.transitioning.take() {
            barriers.push(StateBarrier::Transition {
                before: self.usage,
                after: target,
                split: SplitBarrier::EndOnly,
            });
            self.usage = target;
        }
    }

    /// Records a full transition to `new_state`.
    ///
    /// An outstanding split barrier is ended first. Ending one that already targets
    /// `new_state` completes the transition with a single end-only barrier. A resource
    /// that stays in [`ResourceStates::UNORDERED_ACCESS`] gets a UAV barrier instead.
    pub fn transition(&mut self, new_state: ResourceStates) -> StateBarriers {
        let mut barriers = StateBarriers::new();
        if self.transitioning.is_some() {
            let finishes_here = self.transitioning == Some(new_state);
            self.resolve_pending(&mut barriers);
            if finishes_here {
                return barriers;
            }
        }
        if self.usage != new_state {
            barriers.push(StateBarrier::Transition {
                before: self.usage,
                after: new_state,
                split: SplitBarrier::None,
            });
            self.usage = new_state;
        } else if new_state == ResourceStates::UNORDERED_ACCESS {
            barriers.push(StateBarrier::Uav);
        }
        barriers
    }

    /// Records the begin half of a split transition to `new_state`.
    pub fn begin_transition(&mut self, new_state: ResourceStates) -> StateBarriers {
        let mut barriers = StateBarriers::new();
        self.resolve_pending(&mut barriers);
        if self.usage != new_state {
            barriers.push(StateBarrier::Transition {
                before: self.usage,
                after: new_state,
                split: SplitBarrier::BeginOnly,
            });
            self.transitioning = Some(new_state);
        }
        barriers
    }
}

/// A barrier on native resources of backend `A`.
pub enum Barrier<A: Api> {
    Transition {
        resource: A::Resource,
        before: ResourceStates,
        after: ResourceStates,
        split: SplitBarrier,
    },
    /// `None` orders all unordered-access writes.
    Uav { resource: Option<A::Resource> },
    Aliasing {
        before: Option<A::Resource>,
        after: Option<A::Resource>,
    },
}

impl<A: Api> Clone for Barrier<A> {
    fn clone(&self) -> Self {
        match self {
            Barrier::Transition {
                resource,
                before,
                after,
                split,
            } => Barrier::Transition {
                resource: resource.clone(),
                before: *before,
                after: *after,
                split: *split,
            },
            Barrier::Uav { resource } => Barrier::Uav {
                resource: resource.clone(),
            },
            Barrier::Aliasing { before, after } => Barrier::Aliasing {
                before: before.clone(),
                after: after.clone(),
            },
        }
    }
}

impl<A: Api> Debug for Barrier<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Barrier::Transition {
                resource,
                before,
                after,
                split,
            } => f
                .debug_struct("Transition")
                .field("resource", resource)
                .field("before", before)
                .field("after", after)
                .field("split", split)
                .finish(),
            Barrier::Uav { resource } => f.debug_struct("Uav").field("resource", resource).finish(),
            Barrier::Aliasing { before, after } => f
                .debug_struct("Aliasing")
                .field("before", before)
                .field("after", after)
                .finish(),
        }
    }
}

impl<A: Api> Barrier<A> {
    fn from_state(resource: &A::Resource, barrier: StateBarrier) -> Self {
        match barrier {
            StateBarrier::Transition {
                before,
                after,
                split,
            } => Barrier::Transition {
                resource: resource.clone(),
                before,
                after,
                split,
            },
            StateBarrier::Uav => Barrier::Uav {
                resource: Some(resource.clone()),
            },
        }
    }
}

/// A GPU-addressable allocation and its tracked state.
///
/// Higher level wrappers ([`GpuBuffer`](crate::resource::GpuBuffer),
/// [`ColorBuffer`](crate::resource::ColorBuffer), ...) own one of these. Transitions
/// take it by `&mut`, so a resource can only be transitioned by one command list at a
/// time.
pub struct GpuResource<A: Api> {
    raw: A::Resource,
    state: ResourceState,
    gpu_address: u64,
}

impl<A: Api> Debug for GpuResource<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuResource")
            .field("raw", &self.raw)
            .field("state", &self.state)
            .field("gpu_address", &format_args!("{:#x}", self.gpu_address))
            .finish()
    }
}

impl<A: Api> GpuResource<A> {
    /// Wraps a native resource currently in `usage_state`. `gpu_address` is zero for
    /// textures.
    pub fn from_raw(raw: A::Resource, usage_state: ResourceStates, gpu_address: u64) -> Self {
        Self {
            raw,
            state: ResourceState::new(usage_state),
            gpu_address,
        }
    }

    pub fn raw(&self) -> &A::Resource {
        &self.raw
    }

    pub fn usage_state(&self) -> ResourceStates {
        self.state.usage()
    }

    pub fn transitioning_state(&self) -> Option<ResourceStates> {
        self.state.transitioning()
    }

    pub fn state(&self) -> &ResourceState {
        &self.state
    }

    pub fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    /// See [`ResourceState::assume`].
    pub fn assume_state(&mut self, usage: ResourceStates) {
        self.state.assume(usage);
    }

    pub(crate) fn transition(
        &mut self,
        new_state: ResourceStates,
    ) -> impl Iterator<Item = Barrier<A>> + '_ {
        let barriers = self.state.transition(new_state);
        let raw = &self.raw;
        barriers
            .into_iter()
            .map(move |barrier| Barrier::from_state(raw, barrier))
    }

    pub(crate) fn begin_transition(
        &mut self,
        new_state: ResourceStates,
    ) -> impl Iterator<Item = Barrier<A>> + '_ {
        let barriers = self.state.begin_transition(new_state);
        let raw = &self.raw;
        barriers
            .into_iter()
            .map(move |barrier| Barrier::from_state(raw, barrier))
    }
}

/// Updates `resource` for a transition to `new_state` and returns the barriers to record.
pub fn transition_barriers<A: Api>(
    resource: &mut GpuResource<A>,
    new_state: ResourceStates,
) -> SmallVec<[Barrier<A>; 2]> {
    resource.transition(new_state).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn transition(
        before: ResourceStates,
        after: ResourceStates,
        split: SplitBarrier,
    ) -> StateBarrier {
        StateBarrier::Transition {
            before,
            after,
            split,
        }
    }

    #[test]
    fn test_same_state_is_free() {
        let mut state = ResourceState::new(ResourceStates::COPY_DEST);
        assert!(state.transition(ResourceStates::COPY_DEST).is_empty());
        assert_eq!(state.usage(), ResourceStates::COPY_DEST);
    }

    #[test]
    fn test_uav_to_uav_is_uav_barrier() {
        let mut state = ResourceState::new(ResourceStates::UNORDERED_ACCESS);
        let barriers = state.transition(ResourceStates::UNORDERED_ACCESS);
        assert_eq!(barriers.as_slice(), &[StateBarrier::Uav]);
    }

    #[test]
    fn test_present_render_target_present() {
        let mut state = ResourceState::new(ResourceStates::PRESENT);
        let barriers = state.transition(ResourceStates::RENDER_TARGET);
        assert_eq!(
            barriers.as_slice(),
            &[transition(
                ResourceStates::PRESENT,
                ResourceStates::RENDER_TARGET,
                SplitBarrier::None
            )]
        );
        state.transition(ResourceStates::PRESENT);
        assert_eq!(state.usage(), ResourceStates::PRESENT);
    }

    #[test]
    fn test_split_then_matching_end() {
        let mut state = ResourceState::new(ResourceStates::RENDER_TARGET);
        let begin = state.begin_transition(ResourceStates::PIXEL_SHADER_RESOURCE);
        assert_eq!(
            begin.as_slice(),
            &[transition(
                ResourceStates::RENDER_TARGET,
                ResourceStates::PIXEL_SHADER_RESOURCE,
                SplitBarrier::BeginOnly
            )]
        );
        assert_eq!(state.usage(), ResourceStates::RENDER_TARGET);
        assert_eq!(
            state.transitioning(),
            Some(ResourceStates::PIXEL_SHADER_RESOURCE)
        );

        let end = state.transition(ResourceStates::PIXEL_SHADER_RESOURCE);
        assert_eq!(
            end.as_slice(),
            &[transition(
                ResourceStates::RENDER_TARGET,
                ResourceStates::PIXEL_SHADER_RESOURCE,
                SplitBarrier::EndOnly
            )]
        );
        assert_eq!(state.usage(), ResourceStates::PIXEL_SHADER_RESOURCE);
        assert_eq!(state.transitioning(), None);
    }

    #[test]
    fn test_split_then_other_target_resolves_first() {
        let mut state = ResourceState::new(ResourceStates::RENDER_TARGET);
        state.begin_transition(ResourceStates::PIXEL_SHADER_RESOURCE);
        let barriers = state.transition(ResourceStates::COPY_SOURCE);
        assert_eq!(
            barriers.as_slice(),
            &[
                transition(
                    ResourceStates::RENDER_TARGET,
                    ResourceStates::PIXEL_SHADER_RESOURCE,
                    SplitBarrier::EndOnly
                ),
                transition(
                    ResourceStates::PIXEL_SHADER_RESOURCE,
                    ResourceStates::COPY_SOURCE,
                    SplitBarrier::None
                ),
            ]
        );
        assert_eq!(state.usage(), ResourceStates::COPY_SOURCE);
        assert_eq!(state.transitioning(), None);
    }

    #[test]
    fn test_split_back_to_current_state_still_resolves() {
        let mut state = ResourceState::new(ResourceStates::RENDER_TARGET);
        state.begin_transition(ResourceStates::PIXEL_SHADER_RESOURCE);
        let barriers = state.transition(ResourceStates::RENDER_TARGET);
        assert_eq!(barriers.len(), 2);
        assert_eq!(state.usage(), ResourceStates::RENDER_TARGET);
        assert_eq!(state.transitioning(), None);
    }

    #[test]
    fn test_second_begin_ends_the_first() {
        let mut state = ResourceState::new(ResourceStates::COMMON);
        state.begin_transition(ResourceStates::COPY_DEST);
        let barriers = state.begin_transition(ResourceStates::COPY_SOURCE);
        assert_eq!(
            barriers.as_slice(),
            &[
                transition(
                    ResourceStates::COMMON,
                    ResourceStates::COPY_DEST,
                    SplitBarrier::EndOnly
                ),
                transition(
                    ResourceStates::COPY_DEST,
                    ResourceStates::COPY_SOURCE,
                    SplitBarrier::BeginOnly
                ),
            ]
        );
        assert_eq!(state.usage(), ResourceStates::COPY_DEST);
        assert_eq!(state.transitioning(), Some(ResourceStates::COPY_SOURCE));
    }

    #[test]
    fn test_begin_to_current_state_is_noop() {
        let mut state = ResourceState::new(ResourceStates::COPY_DEST);
        assert!(state.begin_transition(ResourceStates::COPY_DEST).is_empty());
        assert_eq!(state.transitioning(), None);
    }

    #[test]
    fn test_compute_queue_states() {
        assert!(ResourceStates::UNORDERED_ACCESS.is_valid_on_compute_queue());
        assert!(ResourceStates::COMMON.is_valid_on_compute_queue());
        assert!(!ResourceStates::RENDER_TARGET.is_valid_on_compute_queue());
        assert!(!ResourceStates::GENERIC_READ.is_valid_on_compute_queue());
    }

    fn any_state() -> impl Strategy<Value = ResourceStates> {
        prop::sample::select(vec![
            ResourceStates::COMMON,
            ResourceStates::RENDER_TARGET,
            ResourceStates::UNORDERED_ACCESS,
            ResourceStates::PIXEL_SHADER_RESOURCE,
            ResourceStates::NON_PIXEL_SHADER_RESOURCE,
            ResourceStates::COPY_DEST,
            ResourceStates::COPY_SOURCE,
            ResourceStates::GENERIC_READ,
        ])
    }

    proptest! {
        /// Replaying the emitted barriers walks the state from the initial value to the
        /// last requested state without gaps.
        #[test]
        fn barriers_chain_to_last_requested_state(
            initial in any_state(),
            ops in prop::collection::vec((any::<bool>(), any_state()), 1..32),
        ) {
            let mut state = ResourceState::new(initial);
            let mut replayed = initial;
            for (split, target) in ops {
                let barriers = if split {
                    state.begin_transition(target)
                } else {
                    state.transition(target)
                };
                for barrier in barriers {
                    if let StateBarrier::Transition { before, after, split } = barrier {
                        prop_assert_eq!(before, replayed);
                        if split != SplitBarrier::BeginOnly {
                            replayed = after;
                        }
                    }
                }
                prop_assert_eq!(state.usage(), replayed);
                if !split {
                    prop_assert_eq!(state.usage(), target);
                    prop_assert_eq!(state.transitioning(), None);
                }
            }
        }
    }
}
