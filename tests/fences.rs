//! Fence values and fence-gated recycling.
mod common;

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    thread,
};

use proptest::prelude::*;
use scoria::{
    backend::{
        BindPoint, DescriptorHeapType, QueueKind,
        headless::{Command, ExecutionMode},
    },
    dynamic_descriptor::DescriptorPagePool,
    linear::{LinearAllocatorKind, LinearPagePool},
    root_signature::{RootParameter, RootSignature, RootSignatureDesc, ShaderVisibility},
};

const KINDS: [QueueKind; 3] = [QueueKind::Direct, QueueKind::Compute, QueueKind::Copy];

#[test]
fn fence_values_follow_submission_order_across_threads() {
    const THREADS: u32 = 4;
    const LISTS: u32 = 40;

    let (raw, manager) = common::manager(ExecutionMode::Threaded, true);
    let signature = Arc::new(
        RootSignature::new(
            manager.device().clone(),
            RootSignatureDesc::new(vec![RootParameter::constants(1, 0, ShaderVisibility::All)]),
        )
        .unwrap(),
    );

    let fences: Vec<Vec<(u32, u64)>> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let manager = manager.clone();
                let signature = signature.clone();
                s.spawn(move || {
                    (0..LISTS)
                        .map(|i| {
                            let marker = t * 1000 + i;
                            let mut list = manager.begin(QueueKind::Direct).unwrap();
                            let mut compute = list.compute();
                            compute.set_root_signature(&signature);
                            compute.set_constant(0, 0, marker);
                            drop(compute);
                            (marker, list.close_and_execute(false).unwrap())
                        })
                        .collect()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    let next_before_idle = manager.queue(QueueKind::Direct).next_fence_value();
    manager.idle_gpu().unwrap();

    let mut fence_of = HashMap::new();
    for per_thread in &fences {
        for pair in per_thread.windows(2) {
            assert!(pair[0].1 < pair[1].1, "fence values went backwards on one thread");
        }
        for &(marker, fence) in per_thread {
            assert_eq!(QueueKind::from_fence_value(fence), Some(QueueKind::Direct));
            assert!(fence_of.insert(marker, fence).is_none());
        }
    }
    let unique: HashSet<u64> = fence_of.values().copied().collect();
    assert_eq!(unique.len(), (THREADS * LISTS) as usize);

    // The device executed the lists in the same order as their fence values.
    let executed_fences: Vec<u64> = raw
        .take_executed()
        .iter()
        .filter(|list| list.queue == QueueKind::Direct)
        .filter_map(|list| {
            list.commands.iter().find_map(|command| match command {
                Command::SetConstants {
                    bind_point: BindPoint::Compute,
                    values,
                    ..
                } => Some(fence_of[&values[0]]),
                _ => None,
            })
        })
        .collect();
    assert_eq!(executed_fences.len(), (THREADS * LISTS) as usize);
    assert!(executed_fences.windows(2).all(|pair| pair[0] < pair[1]));

    let max = unique.iter().copied().max().unwrap();
    assert!(manager.is_fence_complete(max));
    assert_eq!(next_before_idle, max + 1);
    // Idling signals one more value of its own.
    assert_eq!(manager.queue(QueueKind::Direct).next_fence_value(), max + 2);
    assert!(manager.is_fence_complete(max + 1));
}

#[test]
fn fence_values_identify_their_queue() {
    let (_, manager) = common::manager(ExecutionMode::Immediate, false);
    for kind in KINDS {
        let fence = manager.begin(kind).unwrap().close_and_execute(true).unwrap();
        assert_eq!(QueueKind::from_fence_value(fence), Some(kind));
        assert_eq!(manager.queues().owner_of(fence).kind(), kind);
        assert!(manager.is_fence_complete(fence));
    }
}

proptest! {
    #[test]
    fn fence_values_increase_per_queue(kinds in prop::collection::vec(0usize..3, 1..40)) {
        let (_, manager) = common::manager(ExecutionMode::Immediate, false);
        let mut last: [u64; 3] = [0; 3];
        for index in kinds {
            let kind = KINDS[index];
            let fence = manager.begin(kind).unwrap().close_and_execute(false).unwrap();
            prop_assert!(fence > last[kind.index()]);
            prop_assert_eq!(QueueKind::from_fence_value(fence), Some(kind));
            last[kind.index()] = fence;
        }
    }

    /// Allocators and pages discarded under the same fences, with the GPU stopped at an
    /// arbitrary point in between: only objects whose fence completed may come back.
    #[test]
    fn discarded_objects_wait_for_their_fence(count in 1usize..10, ceiling in 0usize..10) {
        let ceiling = ceiling.min(count);
        let (raw, manager) = common::manager(ExecutionMode::Manual, false);
        let device = manager.device().clone();
        let queue = manager.queue(QueueKind::Direct);
        let views = DescriptorPagePool::new(
            device.clone(),
            manager.queues().clone(),
            DescriptorHeapType::CbvSrvUav,
            64,
        );
        let uploads = LinearPagePool::new(
            device,
            manager.queues().clone(),
            LinearAllocatorKind::CpuWritable,
            4096,
        );

        let mut allocator_ids = Vec::new();
        let mut page_ids = Vec::new();
        let mut upload_addresses = Vec::new();
        let mut fences = Vec::new();
        for _ in 0..count {
            let allocator = queue.request_allocator().unwrap();
            let page = views.request_page().unwrap();
            let upload = uploads.request_page().unwrap();
            allocator_ids.push(allocator.id());
            page_ids.push(page.raw().id());
            upload_addresses.push(upload.gpu_address());

            let fence = queue.increment_fence().unwrap();
            queue.discard_allocator(fence, allocator);
            views.discard_pages(fence, [page]);
            uploads.discard_pages(fence, [upload]);
            fences.push(fence);
        }
        if ceiling > 0 {
            raw.complete_until(queue.fence().raw(), fences[ceiling - 1]);
        }
        prop_assert_eq!(raw.pending_ops(), count - ceiling);

        for _ in 0..count {
            let allocator = queue.request_allocator().unwrap();
            let page = views.request_page().unwrap();
            let upload = uploads.request_page().unwrap();
            prop_assert!(!allocator_ids[ceiling..].contains(&allocator.id()));
            prop_assert!(!page_ids[ceiling..].contains(&page.raw().id()));
            prop_assert!(!upload_addresses[ceiling..].contains(&upload.gpu_address()));
        }
        // Everything that could be reused was.
        prop_assert_eq!(queue.allocator_pool_size(), 2 * count - ceiling);
        prop_assert_eq!(views.pool_size(), 2 * count - ceiling);
        prop_assert_eq!(uploads.pool_size(), 2 * count - ceiling);
        raw.complete_all();
    }

    /// Whole command lists under a partially stepped GPU. The headless device panics if
    /// an allocator is reset before the submission that used it has completed.
    #[test]
    fn command_lists_recycle_under_partial_completion(
        ops in prop::collection::vec((0usize..3, 0usize..3), 1..30),
    ) {
        let (raw, manager) = common::manager(ExecutionMode::Manual, false);
        let signature = common::forward_signature(&manager);
        let srvs = common::srvs(&manager, 2);
        let mut fences = Vec::new();

        for (kind, steps) in ops {
            let kind = KINDS[kind];
            let mut list = manager.begin(kind).unwrap();
            let mut upload = list.reserve_upload_memory(64).unwrap();
            upload.write(&[kind.index() as u32; 16]);
            match kind {
                QueueKind::Direct => {
                    let mut graphics = list.graphics();
                    graphics.set_root_signature(&signature);
                    graphics.set_dynamic_descriptors(2, 0, &srvs);
                    graphics.set_dynamic_constants(1, &[1.0f32; 4]).unwrap();
                    graphics.draw(3).unwrap();
                }
                QueueKind::Compute => {
                    let mut compute = list.compute();
                    compute.set_root_signature(&signature);
                    compute.set_dynamic_descriptors(2, 0, &srvs);
                    compute.dispatch(glam::UVec3::ONE).unwrap();
                }
                QueueKind::Copy => {}
            }
            fences.push(list.close_and_execute(false).unwrap());
            for _ in 0..steps {
                raw.step();
            }
        }

        raw.complete_all();
        for fence in fences {
            prop_assert!(manager.is_fence_complete(fence));
        }
        for kind in KINDS {
            prop_assert_eq!(
                manager.free_list_len(kind),
                manager.command_list_pool_size(kind)
            );
        }
    }
}
