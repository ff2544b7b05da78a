//! Staged descriptor tables as the shader sees them.
mod common;

use scoria::{
    backend::{
        BindPoint, DescriptorHeapType, GpuDescriptorHandle, QueueKind, RawDevice, SamplerDesc,
        headless::{Command, ExecutionMode},
    },
    config::ManagerConfig,
    dynamic_descriptor::MAX_CACHED_DESCRIPTORS,
    resource::GpuBuffer,
};

#[test]
fn commit_without_new_staging_is_free() {
    let (raw, manager) = common::manager(ExecutionMode::Immediate, false);
    let signature = common::forward_signature(&manager);
    let pipeline = common::pipeline(&manager, &signature, "forward");
    let srvs = common::srvs(&manager, 3);

    let mut list = manager.begin(QueueKind::Direct).unwrap();
    list.set_pipeline_state(&pipeline);
    let mut graphics = list.graphics();
    graphics.set_root_signature(&signature);
    graphics.set_dynamic_descriptors(2, 0, &srvs);
    graphics.draw(3).unwrap();
    let after_first = raw.stats();
    graphics.draw(3).unwrap();
    graphics.draw_instanced(3, 2, 0, 0).unwrap();
    let after_repeat = raw.stats();

    assert_eq!(after_first.descriptors_copied, 3);
    assert_eq!(after_first.set_descriptor_table, 1);
    assert_eq!(after_repeat.descriptors_copied, after_first.descriptors_copied);
    assert_eq!(after_repeat.copy_descriptors_calls, after_first.copy_descriptors_calls);
    assert_eq!(after_repeat.set_descriptor_table, after_first.set_descriptor_table);
    assert_eq!(after_repeat.draws, 3);

    // Restaging a single slot copies the table again, up to its highest staged slot.
    graphics.set_dynamic_descriptor(2, 1, srvs[0]);
    graphics.draw(3).unwrap();
    assert_eq!(raw.stats().descriptors_copied, 6);
    assert_eq!(raw.stats().set_descriptor_table, 2);
    drop(graphics);
    list.close_and_execute(false).unwrap();
}

#[test]
fn shader_sees_staged_descriptors_across_page_rollover() {
    const DRAWS: usize = 80;
    const TABLE: usize = 8;

    let (raw, manager) = common::manager_with(
        ExecutionMode::Immediate,
        true,
        ManagerConfig {
            descriptors_per_dynamic_heap: MAX_CACHED_DESCRIPTORS as u32,
            ..Default::default()
        },
    );
    let signature = common::forward_signature(&manager);
    let buffers: Vec<_> = (0..DRAWS * TABLE)
        .map(|i| GpuBuffer::new(&manager, &format!("input {i}"), 4, 4, None).unwrap())
        .collect();
    let samplers = manager
        .allocate_descriptor(DescriptorHeapType::Sampler, 2)
        .unwrap();
    unsafe {
        manager.device().create_sampler(&SamplerDesc::default(), samplers);
        manager
            .device()
            .create_sampler(&SamplerDesc::default(), samplers.offset(1, 1));
    }

    let mut list = manager.begin(QueueKind::Direct).unwrap();
    let mut graphics = list.graphics();
    graphics.set_root_signature(&signature);
    graphics.set_dynamic_samplers(3, 0, &[samplers, samplers.offset(1, 1)]);
    for draw in buffers.chunks(TABLE) {
        let srvs: Vec<_> = draw.iter().map(GpuBuffer::srv).collect();
        graphics.set_dynamic_descriptors(2, 0, &srvs);
        graphics.draw(3).unwrap();
    }
    drop(graphics);
    list.close_and_execute(false).unwrap();

    // 256-descriptor pages hold 32 tables of eight.
    let pages = (DRAWS * TABLE).div_ceil(MAX_CACHED_DESCRIPTORS);
    assert_eq!(
        manager.descriptor_page_pool_size(DescriptorHeapType::CbvSrvUav),
        pages
    );
    assert_eq!(manager.descriptor_page_pool_size(DescriptorHeapType::Sampler), 1);

    let executed = raw.take_executed();
    let tables: Vec<GpuDescriptorHandle> = executed[0]
        .commands
        .iter()
        .filter_map(|command| match command {
            Command::SetDescriptorTable {
                bind_point: BindPoint::Graphics,
                root_index: 2,
                base,
            } => Some(*base),
            _ => None,
        })
        .collect();
    assert_eq!(tables.len(), DRAWS);
    let increment = manager.device().descriptor_increment(DescriptorHeapType::CbvSrvUav);
    for (base, draw) in tables.iter().zip(buffers.chunks(TABLE)) {
        for (slot, buffer) in draw.iter().enumerate() {
            assert_eq!(
                raw.descriptor_at_gpu(base.offset(slot as u32, increment)),
                raw.descriptor(buffer.srv()),
            );
        }
    }

    // Moving to a new page rebinds the heaps, keeping the sampler page bound.
    let heap_binds: Vec<_> = executed[0]
        .commands
        .iter()
        .filter_map(|command| match command {
            Command::SetDescriptorHeaps(heaps) => Some(heaps.len()),
            _ => None,
        })
        .collect();
    assert_eq!(heap_binds.len(), pages + 1);
    assert!(heap_binds[1..].iter().all(|&count| count == 2));
}

#[test]
fn pages_are_reused_after_the_list_completes() {
    let (_, manager) = common::manager(ExecutionMode::Immediate, false);
    let signature = common::forward_signature(&manager);
    let srvs = common::srvs(&manager, 8);

    for _ in 0..10 {
        let mut list = manager.begin(QueueKind::Compute).unwrap();
        let mut compute = list.compute();
        compute.set_root_signature(&signature);
        compute.set_dynamic_descriptors(2, 0, &srvs);
        compute.dispatch_1d(256, 64).unwrap();
        drop(compute);
        list.close_and_execute(true).unwrap();
    }
    assert_eq!(
        manager.descriptor_page_pool_size(DescriptorHeapType::CbvSrvUav),
        1
    );
}
