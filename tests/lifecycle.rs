//! Steady-state frame loops and the present / render / present round trip.
mod common;

use std::collections::VecDeque;
use std::time::Duration;

use glam::UVec2;
use scoria::{
    backend::{
        DescriptorHeapType, Format, QueueKind,
        headless::{BarrierRecord, Command, ExecutionMode, Headless, HeadlessConfig, HeadlessDevice},
    },
    config::ManagerConfig,
    linear::LinearAllocatorKind,
    manager::CommandListManager,
    resource::{ColorBuffer, GpuBuffer, TrackedResource},
    tracking::{ResourceStates, SplitBarrier},
    Device,
};

#[derive(Debug, PartialEq, Eq)]
struct PoolSizes {
    lists: [usize; 3],
    allocators: [usize; 3],
    view_pages: usize,
    sampler_pages: usize,
    upload_pages: usize,
    scratch_pages: usize,
}

fn pool_sizes(manager: &CommandListManager<Headless>) -> PoolSizes {
    let kinds = [QueueKind::Direct, QueueKind::Compute, QueueKind::Copy];
    PoolSizes {
        lists: kinds.map(|kind| manager.command_list_pool_size(kind)),
        allocators: kinds.map(|kind| manager.allocator_pool_size(kind)),
        view_pages: manager.descriptor_page_pool_size(DescriptorHeapType::CbvSrvUav),
        sampler_pages: manager.descriptor_page_pool_size(DescriptorHeapType::Sampler),
        upload_pages: manager.linear_page_pool_size(LinearAllocatorKind::CpuWritable),
        scratch_pages: manager.linear_page_pool_size(LinearAllocatorKind::GpuExclusive),
    }
}

/// One frame: an upload on the copy queue, a simulation pass on the compute queue and
/// a draw on the direct queue. Returns the fences of the three submissions.
fn frame(
    manager: &CommandListManager<Headless>,
    signature: &std::sync::Arc<scoria::root_signature::RootSignature<Headless>>,
    particles: &mut GpuBuffer<Headless>,
    srvs: &[scoria::backend::CpuDescriptorHandle],
    index: u32,
    wait: bool,
) -> [u64; 3] {
    let mut upload = manager.begin_named(QueueKind::Copy, "upload").unwrap();
    upload
        .write_buffer(particles, 0, bytemuck::cast_slice(&[index; 16]))
        .unwrap();
    let copy_fence = upload.close_and_execute(wait).unwrap();

    let mut simulate = manager.begin_named(QueueKind::Compute, "simulate").unwrap();
    let scratch = simulate.allocate_gpu_scratch(1024, 256).unwrap();
    let mut compute = simulate.compute();
    compute.set_root_signature(signature);
    compute.set_constant_buffer(1, scratch.gpu_address());
    compute.set_dynamic_descriptors(2, 0, srvs);
    compute.dispatch_1d(1024, 64).unwrap();
    drop(compute);
    let compute_fence = simulate.close_and_execute(wait).unwrap();

    let mut draw = manager.begin_named(QueueKind::Direct, "draw").unwrap();
    draw.transition_resource(particles, ResourceStates::NON_PIXEL_SHADER_RESOURCE, false);
    let mut graphics = draw.graphics();
    graphics.set_root_signature(signature);
    graphics.set_dynamic_constants(1, &[index as f32; 4]).unwrap();
    graphics.set_dynamic_descriptors(2, 0, srvs);
    graphics.set_viewport_and_scissor(0, 0, 64, 64);
    graphics.draw(6).unwrap();
    drop(graphics);
    draw.transition_resource(particles, ResourceStates::COMMON, false);
    let direct_fence = draw.close_and_execute(wait).unwrap();

    [copy_fence, compute_fence, direct_fence]
}

#[test]
fn pools_stop_growing_in_a_waiting_frame_loop() {
    let (_, manager) = common::manager(ExecutionMode::Immediate, false);
    let signature = common::forward_signature(&manager);
    let srvs = common::srvs(&manager, 4);
    let mut particles = GpuBuffer::new(&manager, "particles", 16, 4, None).unwrap();

    for i in 0..3 {
        frame(&manager, &signature, &mut particles, &srvs, i, true);
    }
    let warm = pool_sizes(&manager);
    assert_eq!(warm.lists, [1, 1, 1]);
    assert_eq!(warm.allocators, [1, 1, 1]);
    for i in 3..60 {
        frame(&manager, &signature, &mut particles, &srvs, i, true);
        assert_eq!(pool_sizes(&manager), warm, "pools grew in frame {i}");
    }
}

#[test]
fn pools_stay_bounded_with_frames_in_flight() {
    const FRAMES_IN_FLIGHT: usize = 2;

    common::init_tracing();
    let raw = HeadlessDevice::new(HeadlessConfig {
        mode: ExecutionMode::Threaded,
        latency: Duration::from_micros(200),
        ..Default::default()
    });
    let manager =
        CommandListManager::new(Device::<Headless>::new(raw), ManagerConfig::default()).unwrap();
    let signature = common::forward_signature(&manager);
    let srvs = common::srvs(&manager, 4);
    let mut particles = GpuBuffer::new(&manager, "particles", 16, 4, None).unwrap();

    let mut in_flight = VecDeque::new();
    for i in 0..60 {
        if in_flight.len() == FRAMES_IN_FLIGHT {
            let fences: [u64; 3] = in_flight.pop_front().unwrap();
            for fence in fences {
                manager.wait_for_fence(fence).unwrap();
            }
        }
        in_flight.push_back(frame(&manager, &signature, &mut particles, &srvs, i, false));

        let sizes = pool_sizes(&manager);
        // Lists return to their free list as soon as they are submitted.
        assert_eq!(sizes.lists, [1, 1, 1]);
        // The frame being recorded plus the frames still in flight. Uploads and view
        // pages are used by two lists per frame.
        let bound = FRAMES_IN_FLIGHT + 1;
        assert!(sizes.allocators.iter().all(|&size| size <= bound), "{sizes:?}");
        assert!(sizes.scratch_pages <= bound, "{sizes:?}");
        assert!(sizes.view_pages <= 2 * bound, "{sizes:?}");
        assert!(sizes.upload_pages <= 2 * bound, "{sizes:?}");
    }
    manager.idle_gpu().unwrap();
}

#[test]
fn present_render_target_present_round_trip() {
    let (raw, manager) = common::manager(ExecutionMode::Immediate, true);
    let mut back_buffer = ColorBuffer::new(
        &manager,
        "back buffer",
        UVec2::new(1280, 720),
        Format::R8G8B8A8Unorm,
        [0.1, 0.2, 0.3, 1.0],
        false,
    )
    .unwrap();
    assert_eq!(back_buffer.gpu_resource().usage_state(), ResourceStates::PRESENT);

    let mut list = manager.begin_named(QueueKind::Direct, "frame").unwrap();
    list.transition_resource(&mut back_buffer, ResourceStates::RENDER_TARGET, false);
    list.graphics().clear_color(&back_buffer);
    list.transition_resource(&mut back_buffer, ResourceStates::PRESENT, false);
    let fence = list.close_and_execute(true).unwrap();

    assert!(manager.is_fence_complete(fence));
    assert_eq!(back_buffer.gpu_resource().usage_state(), ResourceStates::PRESENT);

    let executed = raw.take_executed();
    assert_eq!(executed.len(), 1);
    let id = back_buffer.gpu_resource().raw().id();
    let transition = |before, after| {
        Command::Barrier(vec![BarrierRecord::Transition {
            resource: id,
            before,
            after,
            split: SplitBarrier::None,
        }])
    };
    let commands = &executed[0].commands;
    assert_eq!(commands.len(), 3);
    assert_eq!(
        commands[0],
        transition(ResourceStates::PRESENT, ResourceStates::RENDER_TARGET)
    );
    assert_eq!(
        commands[1],
        Command::ClearRenderTarget {
            rtv: back_buffer.rtv(),
            color: [0.1, 0.2, 0.3, 1.0],
        }
    );
    assert_eq!(
        commands[2],
        transition(ResourceStates::RENDER_TARGET, ResourceStates::PRESENT)
    );
}

#[test]
fn shutdown_empties_every_pool() {
    let (_, manager) = common::manager(ExecutionMode::Immediate, false);
    let signature = common::forward_signature(&manager);
    let srvs = common::srvs(&manager, 4);
    let mut particles = GpuBuffer::new(&manager, "particles", 16, 4, None).unwrap();
    frame(&manager, &signature, &mut particles, &srvs, 0, false);

    manager.shutdown().unwrap();
    assert_eq!(
        pool_sizes(&manager),
        PoolSizes {
            lists: [0; 3],
            allocators: [0; 3],
            view_pages: 0,
            sampler_pages: 0,
            upload_pages: 0,
            scratch_pages: 0,
        }
    );

    // The manager stays usable and refills its pools on demand.
    let fence = manager
        .begin(QueueKind::Direct)
        .unwrap()
        .close_and_execute(true)
        .unwrap();
    assert!(manager.is_fence_complete(fence));
    assert_eq!(manager.command_list_pool_size(QueueKind::Direct), 1);
}
