//! Records draws on several threads at once and submits them to the direct queue.
use std::sync::Arc;
use std::thread;

use scoria::backend::headless::{ExecutionMode, Headless, HeadlessConfig, HeadlessDevice};
use scoria::backend::{BindPoint, RawDevice, SamplerDesc};
use scoria::prelude::*;
use scoria::root_signature::{DescriptorRangeKind, ShaderVisibility};
use tracing_subscriber::EnvFilter;

const WORKERS: usize = 8;
const DRAWS_PER_WORKER: u32 = 500;

#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct ObjectConstants {
    model: [f32; 16],
    tint: [f32; 4],
}

fn main() -> scoria::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_names(true)
        .init();

    let raw = HeadlessDevice::new(HeadlessConfig {
        mode: ExecutionMode::Threaded,
        ..Default::default()
    });
    let manager = CommandListManager::new(Device::<Headless>::new(raw.clone()), ManagerConfig::default())?;

    let signature = Arc::new(RootSignature::new(
        manager.device().clone(),
        RootSignatureDesc::new(vec![
            RootParameter::cbv(0, ShaderVisibility::All),
            RootParameter::table(DescriptorRangeKind::Srv, 4, ShaderVisibility::Pixel),
            RootParameter::table(DescriptorRangeKind::Sampler, 1, ShaderVisibility::Pixel),
        ])
        .with_name("scene"),
    )?);
    let pipelines: Vec<_> = ["opaque", "masked", "transparent"]
        .into_iter()
        .map(|name| {
            Arc::new(PipelineState::headless(
                manager.device().clone(),
                signature.clone(),
                BindPoint::Graphics,
                name,
            ))
        })
        .collect();

    let textures = (0..4)
        .map(|i| GpuBuffer::new(&manager, &format!("material {i}"), 256, 16, Some(&[0x7f; 4096][..])))
        .collect::<scoria::Result<Vec<_>>>()?;
    let sampler = manager.allocate_descriptor(DescriptorHeapType::Sampler, 1)?;
    unsafe { manager.device().create_sampler(&SamplerDesc::default(), sampler) };

    let fences = thread::scope(|s| {
        let workers: Vec<_> = (0..WORKERS)
            .map(|worker| {
                let manager = manager.clone();
                let signature = &signature;
                let pipelines = &pipelines;
                let textures = &textures;
                thread::Builder::new()
                    .name(format!("worker {worker}"))
                    .spawn_scoped(s, move || -> scoria::Result<u64> {
                        let mut list = manager.begin_named(QueueKind::Direct, &format!("worker {worker}"))?;
                        let mut graphics = list.graphics();
                        graphics.set_root_signature(signature);
                        graphics.set_viewport_and_scissor(0, 0, 1920, 1080);
                        graphics.set_dynamic_sampler(2, 0, sampler);
                        for draw in 0..DRAWS_PER_WORKER {
                            // Sorted by material, so pipeline changes are rare.
                            let material = (draw * pipelines.len() as u32 / DRAWS_PER_WORKER) as usize;
                            graphics.set_pipeline_state(&pipelines[material]);
                            graphics.set_dynamic_constants(
                                0,
                                &ObjectConstants {
                                    model: glam::Mat4::from_translation(glam::Vec3::new(draw as f32, 0.0, 0.0))
                                        .to_cols_array(),
                                    tint: [worker as f32 / WORKERS as f32; 4],
                                },
                            )?;
                            graphics.set_dynamic_descriptor(1, 0, textures[draw as usize % textures.len()].srv());
                            graphics.draw_instanced(36, 1, 0, 0)?;
                        }
                        drop(graphics);
                        list.close_and_execute(false)
                    })
                    .map_err(|_| scoria::Error::Native {
                        call: "spawn worker",
                        code: -1,
                    })
            })
            .collect::<scoria::Result<Vec<_>>>()?;
        workers
            .into_iter()
            .map(|worker| worker.join().unwrap_or_else(|_| panic!("worker panicked")))
            .collect::<scoria::Result<Vec<u64>>>()
    })?;

    for fence in &fences {
        manager.wait_for_fence(*fence)?;
    }
    let stats = raw.stats();
    tracing::info!(
        "{} workers recorded {} draws with {} pipeline binds and {} descriptor copies ({} descriptors)",
        WORKERS,
        stats.draws,
        stats.set_pipeline_state,
        stats.copy_descriptors_calls,
        stats.descriptors_copied
    );
    tracing::info!(
        "Pool sizes: {} command lists, {} allocators, {} view pages",
        manager.command_list_pool_size(QueueKind::Direct),
        manager.allocator_pool_size(QueueKind::Direct),
        manager.descriptor_page_pool_size(DescriptorHeapType::CbvSrvUav)
    );
    manager.shutdown()
}
