#![allow(dead_code)]

use std::sync::Arc;

use scoria::{
    Device,
    backend::{
        BindPoint, DescriptorHeapType,
        headless::{ExecutionMode, Headless, HeadlessConfig, HeadlessDevice},
    },
    config::ManagerConfig,
    manager::CommandListManager,
    pipeline::PipelineState,
    root_signature::{
        DescriptorRangeKind, RootParameter, RootSignature, RootSignatureDesc, ShaderVisibility,
    },
};

/// Routes `tracing` output to the test harness, filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn manager(mode: ExecutionMode, capture: bool) -> (HeadlessDevice, CommandListManager<Headless>) {
    manager_with(mode, capture, ManagerConfig::default())
}

pub fn manager_with(
    mode: ExecutionMode,
    capture: bool,
    config: ManagerConfig,
) -> (HeadlessDevice, CommandListManager<Headless>) {
    init_tracing();
    let raw = HeadlessDevice::new(HeadlessConfig {
        mode,
        capture,
        ..Default::default()
    });
    let manager = CommandListManager::new(Device::<Headless>::new(raw.clone()), config).unwrap();
    (raw, manager)
}

/// Root constants at 0, a root CBV at 1, an SRV table of 8 at 2 and a sampler table of
/// 2 at 3.
pub fn forward_signature(manager: &CommandListManager<Headless>) -> Arc<RootSignature<Headless>> {
    Arc::new(
        RootSignature::new(
            manager.device().clone(),
            RootSignatureDesc::new(vec![
                RootParameter::constants(4, 0, ShaderVisibility::All),
                RootParameter::cbv(1, ShaderVisibility::All),
                RootParameter::table(DescriptorRangeKind::Srv, 8, ShaderVisibility::Pixel),
                RootParameter::table(DescriptorRangeKind::Sampler, 2, ShaderVisibility::Pixel),
            ])
            .with_name("forward"),
        )
        .unwrap(),
    )
}

pub fn pipeline(
    manager: &CommandListManager<Headless>,
    signature: &Arc<RootSignature<Headless>>,
    name: &str,
) -> Arc<PipelineState<Headless>> {
    Arc::new(PipelineState::headless(
        manager.device().clone(),
        signature.clone(),
        BindPoint::Graphics,
        name,
    ))
}

pub fn srvs(manager: &CommandListManager<Headless>, count: u32) -> Vec<scoria::backend::CpuDescriptorHandle> {
    let first = manager
        .allocate_descriptor(DescriptorHeapType::CbvSrvUav, count)
        .unwrap();
    (0..count).map(|i| first.offset(i, 1)).collect()
}
