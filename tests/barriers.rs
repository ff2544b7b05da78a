//! Barrier batching, ordering and split transitions as seen by the device.
mod common;

use proptest::prelude::*;
use scoria::{
    backend::{
        QueueKind,
        headless::{BarrierRecord, Command, ExecutionMode},
    },
    command::MAX_BATCHED_BARRIERS,
    resource::{GpuBuffer, TrackedResource},
    tracking::{ResourceStates, SplitBarrier},
};

const STATES: [ResourceStates; 6] = [
    ResourceStates::COMMON,
    ResourceStates::COPY_DEST,
    ResourceStates::COPY_SOURCE,
    ResourceStates::UNORDERED_ACCESS,
    ResourceStates::NON_PIXEL_SHADER_RESOURCE,
    ResourceStates::GENERIC_READ,
];

fn id(buffer: &GpuBuffer<scoria::backend::headless::Headless>) -> u64 {
    buffer.gpu_resource().raw().id()
}

proptest! {
    /// Random transition sequences over a few buffers: the device sees exactly the
    /// barriers a per-resource state machine predicts, in request order, in batches of
    /// at most `MAX_BATCHED_BARRIERS`, and every buffer ends in its last requested state.
    #[test]
    fn barriers_are_recorded_in_request_order(
        requests in prop::collection::vec((0usize..3, 0usize..STATES.len(), any::<bool>()), 0..60),
    ) {
        let (raw, manager) = common::manager(ExecutionMode::Immediate, true);
        let mut buffers: Vec<_> = (0..3)
            .map(|i| GpuBuffer::new(&manager, &format!("buffer {i}"), 64, 4, None).unwrap())
            .collect();
        let mut model = [ResourceStates::COMMON; 3];
        let mut expected = Vec::new();

        let mut list = manager.begin(QueueKind::Direct).unwrap();
        for &(index, state, flush) in &requests {
            let state = STATES[state];
            if model[index] != state {
                expected.push(BarrierRecord::Transition {
                    resource: id(&buffers[index]),
                    before: model[index],
                    after: state,
                    split: SplitBarrier::None,
                });
                model[index] = state;
            } else if state == ResourceStates::UNORDERED_ACCESS {
                expected.push(BarrierRecord::Uav {
                    resource: Some(id(&buffers[index])),
                });
            }
            list.transition_resource(&mut buffers[index], state, flush);
            prop_assert!(list.pending_barriers() < MAX_BATCHED_BARRIERS);
        }
        list.close_and_execute(false).unwrap();

        let executed = raw.take_executed();
        prop_assert_eq!(executed.len(), 1);
        let recorded: Vec<_> = executed[0].barriers().copied().collect();
        prop_assert_eq!(recorded, expected);
        for command in executed[0].commands.iter() {
            if let Command::Barrier(batch) = command {
                prop_assert!(!batch.is_empty());
                prop_assert!(batch.len() <= MAX_BATCHED_BARRIERS);
            }
        }
        for (buffer, state) in buffers.iter().zip(model) {
            prop_assert_eq!(buffer.gpu_resource().usage_state(), state);
            prop_assert_eq!(buffer.gpu_resource().transitioning_state(), None);
        }
    }

    /// Random mixes of split and full transitions: every begin half is closed by exactly
    /// one matching end half before the resource transitions again.
    #[test]
    fn split_transitions_are_always_completed(
        requests in prop::collection::vec((0usize..STATES.len(), any::<bool>()), 1..40),
    ) {
        let (raw, manager) = common::manager(ExecutionMode::Immediate, true);
        let mut buffer = GpuBuffer::new(&manager, "split", 64, 4, None).unwrap();
        let mut list = manager.begin(QueueKind::Direct).unwrap();
        let mut last = None;
        for &(state, split) in &requests {
            let state = STATES[state];
            if split {
                list.begin_resource_transition(&mut buffer, state, false);
            } else {
                list.transition_resource(&mut buffer, state, false);
            }
            last = Some((state, split));
        }
        let Some((last_state, last_split)) = last else { unreachable!() };
        if last_split {
            // An open split leaves the usage state at the old state until it ends.
            let target = buffer.gpu_resource().transitioning_state();
            prop_assert!(target.is_none_or(|target| target == last_state));
            list.transition_resource(&mut buffer, last_state, false);
        }
        prop_assert_eq!(buffer.gpu_resource().usage_state(), last_state);
        prop_assert_eq!(buffer.gpu_resource().transitioning_state(), None);
        list.close_and_execute(false).unwrap();

        let executed = raw.take_executed();
        let mut open: Option<(ResourceStates, ResourceStates)> = None;
        let mut current = ResourceStates::COMMON;
        for barrier in executed[0].barriers() {
            match *barrier {
                BarrierRecord::Transition { before, after, split, .. } => {
                    prop_assert_eq!(before, current);
                    match split {
                        SplitBarrier::BeginOnly => {
                            prop_assert!(open.is_none());
                            open = Some((before, after));
                        }
                        SplitBarrier::EndOnly => {
                            prop_assert_eq!(open.take(), Some((before, after)));
                            current = after;
                        }
                        SplitBarrier::None => {
                            prop_assert!(open.is_none());
                            current = after;
                        }
                    }
                }
                BarrierRecord::Uav { .. } => {
                    prop_assert!(open.is_none());
                    prop_assert_eq!(current, ResourceStates::UNORDERED_ACCESS);
                }
                BarrierRecord::Aliasing { .. } => prop_assert!(false, "unexpected aliasing barrier"),
            }
        }
        prop_assert!(open.is_none());
        prop_assert_eq!(current, last_state);
    }
}

#[test]
fn split_barrier_emits_begin_and_end_halves() {
    let (raw, manager) = common::manager(ExecutionMode::Immediate, true);
    let mut buffer = GpuBuffer::new(&manager, "shadow", 64, 4, None).unwrap();
    let mut list = manager.begin(QueueKind::Direct).unwrap();
    list.transition_resource(&mut buffer, ResourceStates::UNORDERED_ACCESS, true);
    list.begin_resource_transition(&mut buffer, ResourceStates::PIXEL_SHADER_RESOURCE, true);
    assert_eq!(
        buffer.gpu_resource().usage_state(),
        ResourceStates::UNORDERED_ACCESS
    );
    list.transition_resource(&mut buffer, ResourceStates::PIXEL_SHADER_RESOURCE, true);
    assert_eq!(
        buffer.gpu_resource().usage_state(),
        ResourceStates::PIXEL_SHADER_RESOURCE
    );
    list.close_and_execute(false).unwrap();

    let executed = raw.take_executed();
    let splits: Vec<_> = executed[0]
        .barriers()
        .filter_map(|barrier| match barrier {
            BarrierRecord::Transition {
                before,
                after,
                split,
                ..
            } if *after == ResourceStates::PIXEL_SHADER_RESOURCE => Some((*before, *split)),
            _ => None,
        })
        .collect();
    assert_eq!(
        splits,
        [
            (ResourceStates::UNORDERED_ACCESS, SplitBarrier::BeginOnly),
            (ResourceStates::UNORDERED_ACCESS, SplitBarrier::EndOnly),
        ]
    );
    // Three separate flushes, each a single native call.
    assert_eq!(raw.stats().barrier_calls, 3);
}

#[test]
fn finish_flushes_pending_barriers() {
    let (raw, manager) = common::manager(ExecutionMode::Immediate, false);
    let mut buffers: Vec<_> = (0..4)
        .map(|i| GpuBuffer::new(&manager, &format!("b{i}"), 16, 4, None).unwrap())
        .collect();
    let mut list = manager.begin(QueueKind::Compute).unwrap();
    for buffer in &mut buffers {
        list.transition_resource(buffer, ResourceStates::UNORDERED_ACCESS, false);
    }
    assert_eq!(list.pending_barriers(), 4);
    assert_eq!(raw.stats().barrier_calls, 0);
    list.close_and_execute(false).unwrap();
    assert_eq!(raw.stats().barrier_calls, 1);
    assert_eq!(raw.stats().barriers, 4);
}
