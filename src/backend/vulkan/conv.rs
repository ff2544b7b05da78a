//! Translation of backend-independent descriptions into Vulkan enums and masks.
use ash::vk;

use crate::{
    backend::{
        AddressMode, BindPoint, Filter, Format, IndexFormat, PrimitiveTopology, QueueKind,
        TextureUsage,
    },
    tracking::ResourceStates,
};

pub(super) fn format(format: Format) -> vk::Format {
    match format {
        Format::R8G8B8A8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::R8G8B8A8Srgb => vk::Format::R8G8B8A8_SRGB,
        Format::B8G8R8A8Unorm => vk::Format::B8G8R8A8_UNORM,
        Format::R16G16B16A16Float => vk::Format::R16G16B16A16_SFLOAT,
        Format::R32G32B32A32Float => vk::Format::R32G32B32A32_SFLOAT,
        Format::R32Float => vk::Format::R32_SFLOAT,
        Format::R32Uint => vk::Format::R32_UINT,
        Format::D32Float => vk::Format::D32_SFLOAT,
        Format::D24UnormS8Uint => vk::Format::D24_UNORM_S8_UINT,
    }
}

pub(super) fn aspect(format: Format) -> vk::ImageAspectFlags {
    if format.has_stencil() {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else if format.is_depth() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

pub(super) fn image_usage(usage: TextureUsage) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
    if usage.contains(TextureUsage::SHADER_RESOURCE) {
        flags |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(TextureUsage::RENDER_TARGET) {
        flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    if usage.contains(TextureUsage::DEPTH_STENCIL) {
        flags |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
    }
    if usage.contains(TextureUsage::UNORDERED_ACCESS) {
        flags |= vk::ImageUsageFlags::STORAGE;
    }
    flags
}

pub(super) fn bind_point(bind_point: BindPoint) -> vk::PipelineBindPoint {
    match bind_point {
        BindPoint::Graphics => vk::PipelineBindPoint::GRAPHICS,
        BindPoint::Compute => vk::PipelineBindPoint::COMPUTE,
    }
}

pub(super) fn topology(topology: PrimitiveTopology) -> vk::PrimitiveTopology {
    match topology {
        PrimitiveTopology::PointList => vk::PrimitiveTopology::POINT_LIST,
        PrimitiveTopology::LineList => vk::PrimitiveTopology::LINE_LIST,
        PrimitiveTopology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
        PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
    }
}

pub(super) fn index_type(format: IndexFormat) -> vk::IndexType {
    match format {
        IndexFormat::U16 => vk::IndexType::UINT16,
        IndexFormat::U32 => vk::IndexType::UINT32,
    }
}

pub(super) fn filter(filter: Filter) -> (vk::Filter, vk::SamplerMipmapMode) {
    match filter {
        Filter::Point => (vk::Filter::NEAREST, vk::SamplerMipmapMode::NEAREST),
        Filter::Linear | Filter::Anisotropic => (vk::Filter::LINEAR, vk::SamplerMipmapMode::LINEAR),
    }
}

pub(super) fn address_mode(mode: AddressMode) -> vk::SamplerAddressMode {
    match mode {
        AddressMode::Wrap => vk::SamplerAddressMode::REPEAT,
        AddressMode::Mirror => vk::SamplerAddressMode::MIRRORED_REPEAT,
        AddressMode::Clamp => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        AddressMode::Border => vk::SamplerAddressMode::CLAMP_TO_BORDER,
    }
}

/// Vulkan only has fixed border colors. Anything else snaps to the closest of them.
pub(super) fn border_color(color: [f32; 4]) -> vk::BorderColor {
    match color {
        [_, _, _, a] if a < 0.5 => vk::BorderColor::FLOAT_TRANSPARENT_BLACK,
        [r, g, b, _] if r + g + b >= 1.5 => vk::BorderColor::FLOAT_OPAQUE_WHITE,
        _ => vk::BorderColor::FLOAT_OPAQUE_BLACK,
    }
}

/// Synchronization scope of a set of resource states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct StateScope {
    pub stages: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    pub layout: vk::ImageLayout,
}

const SHADER_STAGES: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::from_raw(
    vk::PipelineStageFlags2::VERTEX_SHADER.as_raw()
        | vk::PipelineStageFlags2::FRAGMENT_SHADER.as_raw()
        | vk::PipelineStageFlags2::COMPUTE_SHADER.as_raw(),
);

const STATE_SCOPES: [(ResourceStates, StateScope); 13] = {
    use vk::{AccessFlags2 as A, ImageLayout as L, PipelineStageFlags2 as S};
    const fn scope(
        stages: vk::PipelineStageFlags2,
        access: vk::AccessFlags2,
        layout: vk::ImageLayout,
    ) -> StateScope {
        StateScope {
            stages,
            access,
            layout,
        }
    }
    const DEPTH_TESTS: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::from_raw(
        S::EARLY_FRAGMENT_TESTS.as_raw() | S::LATE_FRAGMENT_TESTS.as_raw(),
    );
    [
        (
            ResourceStates::VERTEX_AND_CONSTANT_BUFFER,
            scope(
                S::from_raw(S::VERTEX_ATTRIBUTE_INPUT.as_raw() | SHADER_STAGES.as_raw()),
                A::from_raw(A::VERTEX_ATTRIBUTE_READ.as_raw() | A::UNIFORM_READ.as_raw()),
                L::GENERAL,
            ),
        ),
        (
            ResourceStates::INDEX_BUFFER,
            scope(S::INDEX_INPUT, A::INDEX_READ, L::GENERAL),
        ),
        (
            ResourceStates::RENDER_TARGET,
            scope(
                S::COLOR_ATTACHMENT_OUTPUT,
                A::from_raw(
                    A::COLOR_ATTACHMENT_READ.as_raw() | A::COLOR_ATTACHMENT_WRITE.as_raw(),
                ),
                L::COLOR_ATTACHMENT_OPTIMAL,
            ),
        ),
        (
            ResourceStates::UNORDERED_ACCESS,
            scope(
                SHADER_STAGES,
                A::from_raw(A::SHADER_STORAGE_READ.as_raw() | A::SHADER_STORAGE_WRITE.as_raw()),
                L::GENERAL,
            ),
        ),
        (
            ResourceStates::DEPTH_WRITE,
            scope(
                DEPTH_TESTS,
                A::from_raw(
                    A::DEPTH_STENCIL_ATTACHMENT_READ.as_raw()
                        | A::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw(),
                ),
                L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ),
        ),
        (
            ResourceStates::DEPTH_READ,
            scope(
                DEPTH_TESTS,
                A::DEPTH_STENCIL_ATTACHMENT_READ,
                L::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            ),
        ),
        (
            ResourceStates::NON_PIXEL_SHADER_RESOURCE,
            scope(
                S::from_raw(S::VERTEX_SHADER.as_raw() | S::COMPUTE_SHADER.as_raw()),
                A::from_raw(A::SHADER_SAMPLED_READ.as_raw() | A::SHADER_STORAGE_READ.as_raw()),
                L::SHADER_READ_ONLY_OPTIMAL,
            ),
        ),
        (
            ResourceStates::PIXEL_SHADER_RESOURCE,
            scope(
                S::FRAGMENT_SHADER,
                A::from_raw(A::SHADER_SAMPLED_READ.as_raw() | A::SHADER_STORAGE_READ.as_raw()),
                L::SHADER_READ_ONLY_OPTIMAL,
            ),
        ),
        (
            ResourceStates::INDIRECT_ARGUMENT,
            scope(S::DRAW_INDIRECT, A::INDIRECT_COMMAND_READ, L::GENERAL),
        ),
        (
            ResourceStates::COPY_DEST,
            scope(S::COPY, A::TRANSFER_WRITE, L::TRANSFER_DST_OPTIMAL),
        ),
        (
            ResourceStates::COPY_SOURCE,
            scope(S::COPY, A::TRANSFER_READ, L::TRANSFER_SRC_OPTIMAL),
        ),
        (
            ResourceStates::RESOLVE_DEST,
            scope(S::RESOLVE, A::TRANSFER_WRITE, L::TRANSFER_DST_OPTIMAL),
        ),
        (
            ResourceStates::RESOLVE_SOURCE,
            scope(S::RESOLVE, A::TRANSFER_READ, L::TRANSFER_SRC_OPTIMAL),
        ),
    ]
};

const COMMON_SCOPE: StateScope = StateScope {
    stages: vk::PipelineStageFlags2::ALL_COMMANDS,
    access: vk::AccessFlags2::from_raw(
        vk::AccessFlags2::MEMORY_READ.as_raw() | vk::AccessFlags2::MEMORY_WRITE.as_raw(),
    ),
    layout: vk::ImageLayout::GENERAL,
};

fn single_state_scope(state: ResourceStates) -> StateScope {
    STATE_SCOPES
        .iter()
        .find(|(candidate, _)| *candidate == state)
        .map_or(COMMON_SCOPE, |(_, scope)| *scope)
}

/// Stages, accesses and image layout covering every state in `states`.
///
/// Combined read states that disagree on a layout use `READ_ONLY_OPTIMAL`; anything
/// else that disagrees falls back to `GENERAL`.
pub(super) fn state_scope(states: ResourceStates) -> StateScope {
    if states.is_empty() {
        return COMMON_SCOPE;
    }
    let mut scope: Option<StateScope> = None;
    let mut mixed_layouts = false;
    for state in states.iter() {
        let next = single_state_scope(state);
        scope = Some(match scope {
            None => next,
            Some(acc) => {
                mixed_layouts |= acc.layout != next.layout;
                StateScope {
                    stages: acc.stages | next.stages,
                    access: acc.access | next.access,
                    layout: acc.layout,
                }
            }
        });
    }
    let mut scope = scope.unwrap_or(COMMON_SCOPE);
    if mixed_layouts {
        scope.layout = if states.is_write() {
            vk::ImageLayout::GENERAL
        } else {
            vk::ImageLayout::READ_ONLY_OPTIMAL
        };
    }
    scope
}

/// Restricts `scope` to what a queue of `kind` can execute.
///
/// Stages the queue does not support widen to `ALL_COMMANDS`, which means every stage
/// the queue does support.
pub(super) fn queue_scope(kind: QueueKind, scope: StateScope) -> StateScope {
    use vk::PipelineStageFlags2 as S;
    let supported = match kind {
        QueueKind::Direct => return scope,
        QueueKind::Compute => {
            S::COMPUTE_SHADER | S::DRAW_INDIRECT | S::ALL_TRANSFER | S::COPY | S::CLEAR
        }
        QueueKind::Copy => S::ALL_TRANSFER | S::COPY,
    };
    if supported.contains(scope.stages) {
        return scope;
    }
    let access = if scope.access.intersects(
        vk::AccessFlags2::SHADER_STORAGE_WRITE
            | vk::AccessFlags2::TRANSFER_WRITE
            | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE
            | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE
            | vk::AccessFlags2::MEMORY_WRITE,
    ) {
        vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE
    } else {
        vk::AccessFlags2::MEMORY_READ
    };
    StateScope {
        stages: S::ALL_COMMANDS,
        access,
        layout: scope.layout,
    }
}

/// Scope of unordered-access work on a queue of `kind`.
pub(super) fn uav_scope(kind: QueueKind) -> StateScope {
    queue_scope(kind, single_state_scope(ResourceStates::UNORDERED_ACCESS))
}
