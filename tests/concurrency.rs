//! Many threads recording and submitting at once.
mod common;

use std::{
    collections::HashSet,
    sync::{Arc, Barrier, Mutex},
    thread,
    time::Duration,
};

use scoria::{
    Device,
    backend::{
        QueueKind,
        headless::{ExecutionMode, Headless, HeadlessConfig, HeadlessDevice},
    },
    config::ManagerConfig,
    manager::CommandListManager,
};

const THREADS: usize = 8;
const DRAWS: usize = 100;

#[test]
fn concurrent_recording_shares_pools_safely() {
    common::init_tracing();
    let raw = HeadlessDevice::new(HeadlessConfig {
        mode: ExecutionMode::Threaded,
        latency: Duration::from_micros(50),
        ..Default::default()
    });
    let manager =
        CommandListManager::new(Device::<Headless>::new(raw.clone()), ManagerConfig::default())
            .unwrap();
    let signature = common::forward_signature(&manager);
    let pipelines = [
        common::pipeline(&manager, &signature, "opaque"),
        common::pipeline(&manager, &signature, "transparent"),
    ];
    let srvs = common::srvs(&manager, 4);
    let checked_out = Mutex::new(HashSet::new());

    let fences: Vec<u64> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let manager = manager.clone();
                let signature = signature.clone();
                let pipelines = pipelines.clone();
                let srvs = &srvs;
                let checked_out = &checked_out;
                s.spawn(move || {
                    let mut list = manager
                        .begin_named(QueueKind::Direct, &format!("worker {t}"))
                        .unwrap();
                    assert!(
                        checked_out.lock().unwrap().insert(list.id()),
                        "list {} handed to two threads",
                        list.id()
                    );
                    let mut graphics = list.graphics();
                    graphics.set_root_signature(&signature);
                    for i in 0..DRAWS {
                        graphics.set_pipeline_state(&pipelines[(i / 2) % 2]);
                        graphics.set_constant(0, 0, i as u32);
                        graphics.set_dynamic_descriptor(2, (i % 4) as u32, srvs[i % 4]);
                        graphics.draw(3).unwrap();
                    }
                    drop(graphics);
                    checked_out.lock().unwrap().remove(&list.id());
                    list.close_and_execute(false).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let unique: HashSet<_> = fences.iter().copied().collect();
    assert_eq!(unique.len(), THREADS);
    manager.idle_gpu().unwrap();
    for fence in &fences {
        assert!(manager.is_fence_complete(*fence));
    }

    let stats = raw.stats();
    assert_eq!(stats.draws, (THREADS * DRAWS) as u64);
    // Consecutive draws share a pipeline, so half of the binds are skipped.
    assert_eq!(stats.set_pipeline_state, (THREADS * DRAWS / 2) as u64);
    assert!(stats.set_pipeline_state < (THREADS * DRAWS) as u64);
    assert_eq!(stats.set_root_signature, THREADS as u64);
    assert_eq!(stats.executed_lists, THREADS as u64);

    let lists = manager.command_list_pool_size(QueueKind::Direct);
    assert!((1..=THREADS).contains(&lists));
    assert_eq!(manager.free_list_len(QueueKind::Direct), lists);
    assert!(manager.allocator_pool_size(QueueKind::Direct) <= THREADS);
}

#[test]
fn lists_are_reused_across_threads_without_overlap() {
    const ROUNDS: usize = 50;
    const WORKERS: usize = 4;

    let (raw, manager) = common::manager(ExecutionMode::Threaded, false);
    let checked_out = Mutex::new(HashSet::new());
    let fences = Arc::new(Mutex::new(Vec::new()));
    let all_held = Barrier::new(WORKERS);

    thread::scope(|s| {
        for t in 0..WORKERS {
            let manager = manager.clone();
            let checked_out = &checked_out;
            let all_held = &all_held;
            let fences = fences.clone();
            s.spawn(move || {
                for round in 0..ROUNDS {
                    let kind = [QueueKind::Direct, QueueKind::Compute, QueueKind::Copy][(t + round) % 3];
                    let list = manager.begin(kind).unwrap();
                    assert!(
                        checked_out.lock().unwrap().insert(list.id()),
                        "list {} handed to two threads",
                        list.id()
                    );
                    // Every worker holds a list at once before any is returned.
                    all_held.wait();
                    assert_eq!(checked_out.lock().unwrap().len(), WORKERS);
                    all_held.wait();
                    checked_out.lock().unwrap().remove(&list.id());
                    let fence = list.close_and_execute(round % 10 == 0).unwrap();
                    fences.lock().unwrap().push(fence);
                }
            });
        }
    });

    manager.idle_gpu().unwrap();
    let fences = fences.lock().unwrap();
    assert_eq!(fences.len(), WORKERS * ROUNDS);
    assert_eq!(fences.iter().collect::<HashSet<_>>().len(), fences.len());
    assert!(fences.iter().all(|fence| manager.is_fence_complete(*fence)));
    assert_eq!(raw.stats().submissions, (WORKERS * ROUNDS) as u64);
    for kind in [QueueKind::Direct, QueueKind::Compute, QueueKind::Copy] {
        assert!(manager.command_list_pool_size(kind) <= WORKERS);
    }
}
