//! Pipeline state objects.
//!
//! Pipeline compilation is backend specific and happens outside this crate. A compiled
//! native pipeline is wrapped with [`PipelineState::from_raw`] together with the root
//! signature it was compiled against.
//!
//! Command lists skip `set_pipeline_state` when the same `Arc<PipelineState>` is bound
//! twice in a row. Deduplicate pipelines upstream so that pointer equality implies
//! content equality.
use std::{fmt::Debug, sync::Arc};

use crate::{
    Device, HasDevice,
    backend::{
        Api, BindPoint,
        headless::{Headless, HeadlessDevice},
    },
    root_signature::RootSignature,
};

/// A compiled graphics or compute pipeline.
pub struct PipelineState<A: Api> {
    device: Device<A>,
    raw: A::PipelineState,
    root_signature: Arc<RootSignature<A>>,
    bind_point: BindPoint,
}

impl<A: Api> Debug for PipelineState<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineState")
            .field("raw", &self.raw)
            .field("bind_point", &self.bind_point)
            .finish_non_exhaustive()
    }
}

impl<A: Api> HasDevice<A> for PipelineState<A> {
    fn device(&self) -> &Device<A> {
        &self.device
    }
}

impl<A: Api> PipelineState<A> {
    /// Wraps a native pipeline compiled against `root_signature`.
    pub fn from_raw(
        device: Device<A>,
        raw: A::PipelineState,
        root_signature: Arc<RootSignature<A>>,
        bind_point: BindPoint,
    ) -> Self {
        Self {
            device,
            raw,
            root_signature,
            bind_point,
        }
    }

    pub fn raw(&self) -> &A::PipelineState {
        &self.raw
    }

    pub fn root_signature(&self) -> &Arc<RootSignature<A>> {
        &self.root_signature
    }

    pub fn bind_point(&self) -> BindPoint {
        self.bind_point
    }
}

impl PipelineState<Headless> {
    /// Creates a placeholder pipeline on a headless device.
    pub fn headless(
        device: Device<Headless>,
        root_signature: Arc<RootSignature<Headless>>,
        bind_point: BindPoint,
        name: &str,
    ) -> Self {
        let raw = HeadlessDevice::create_pipeline_state(device.raw(), bind_point, name);
        Self::from_raw(device, raw, root_signature, bind_point)
    }
}
