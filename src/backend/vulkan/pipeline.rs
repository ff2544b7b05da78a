//! Root signatures as pipeline layouts, and pipeline creation.
//!
//! Every pipeline layout has the same two descriptor sets: set 0 is the bound view
//! heap as one large array of mutable descriptors, set 1 the bound sampler heap.
//! Root parameters are push constants:
//!
//! | Root parameter     | Push constant                                  |
//! |--------------------|------------------------------------------------|
//! | 32-bit constants   | the constants, inline                          |
//! | Root view          | the 64-bit buffer device address               |
//! | Descriptor table   | 32-bit index of the table's first descriptor   |
//!
//! Shaders index the heap arrays with the table index plus the descriptor's offset in
//! the table.
use std::{ffi::CStr, fmt::Debug, sync::Arc};

use ash::vk;
use smallvec::SmallVec;

use super::{Vulkan, conv, device::DeviceShared};
use crate::{
    Device, Error, Result,
    backend::{BindPoint, DescriptorHeapType, Format, PrimitiveTopology},
    pipeline::PipelineState,
    root_signature::{MAX_ROOT_PARAMETERS, RootParameter, RootSignature, RootSignatureDesc},
};

/// Where a root parameter lives in the push constant block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum RootSlot {
    Constants { offset: u32, count: u32 },
    View { offset: u32 },
    Table { offset: u32, heap: DescriptorHeapType },
}

/// Lays out the push constant block of `desc`. Returns the slots and the block size.
pub(super) fn push_constant_layout(
    desc: &RootSignatureDesc,
    max_size: u32,
) -> Result<(SmallVec<[RootSlot; MAX_ROOT_PARAMETERS]>, u32)> {
    let mut offset = 0u32;
    let mut slots = SmallVec::new();
    for parameter in &desc.parameters {
        let slot = match parameter {
            RootParameter::Constants { count, .. } => {
                let slot = RootSlot::Constants {
                    offset,
                    count: *count,
                };
                offset += count * 4;
                slot
            }
            RootParameter::View { .. } => {
                offset = offset.next_multiple_of(8);
                let slot = RootSlot::View { offset };
                offset += 8;
                slot
            }
            RootParameter::DescriptorTable { .. } => {
                let heap = parameter
                    .table_heap_type()
                    .unwrap_or(DescriptorHeapType::CbvSrvUav);
                let slot = RootSlot::Table { offset, heap };
                offset += 4;
                slot
            }
        };
        slots.push(slot);
    }
    if offset > max_size {
        tracing::error!(size = offset, max_size, name = ?desc.name, "root signature too large");
        return Err(Error::Unsupported("root signature exceeds the push constant limit"));
    }
    Ok((slots, offset))
}

pub(super) struct RootSignatureInner {
    shared: Arc<DeviceShared>,
    pub layout: vk::PipelineLayout,
    pub slots: SmallVec<[RootSlot; MAX_ROOT_PARAMETERS]>,
    pub push_constant_size: u32,
}

impl Drop for RootSignatureInner {
    fn drop(&mut self) {
        unsafe { self.shared.raw.destroy_pipeline_layout(self.layout, None) };
    }
}

#[derive(Clone)]
pub struct VulkanRootSignature(pub(super) Arc<RootSignatureInner>);

impl Debug for VulkanRootSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanRootSignature")
            .field("layout", &self.0.layout)
            .field("push_constant_size", &self.0.push_constant_size)
            .finish()
    }
}

impl VulkanRootSignature {
    pub(super) fn new(shared: &Arc<DeviceShared>, desc: &RootSignatureDesc) -> Result<Self> {
        let (slots, push_constant_size) =
            push_constant_layout(desc, shared.adapter.limits.max_push_constants_size)?;
        let set_layouts = [shared.view_set_layout, shared.sampler_set_layout];
        let range = vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::ALL,
            offset: 0,
            size: push_constant_size,
        };
        let ranges: &[vk::PushConstantRange] = if push_constant_size > 0 {
            std::slice::from_ref(&range)
        } else {
            &[]
        };
        let info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(ranges);
        let layout = unsafe { shared.raw.create_pipeline_layout(&info, None)? };
        if let Some(name) = &desc.name {
            shared.set_name(layout, name);
        }
        Ok(Self(Arc::new(RootSignatureInner {
            shared: shared.clone(),
            layout,
            slots,
            push_constant_size,
        })))
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.0.layout
    }
}

pub struct VulkanPipelineState {
    shared: Arc<DeviceShared>,
    raw: vk::Pipeline,
    bind_point: vk::PipelineBindPoint,
}

impl Debug for VulkanPipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanPipelineState")
            .field("raw", &self.raw)
            .field("bind_point", &self.bind_point)
            .finish()
    }
}

impl VulkanPipelineState {
    pub fn raw(&self) -> vk::Pipeline {
        self.raw
    }

    pub(super) fn bind_point(&self) -> vk::PipelineBindPoint {
        self.bind_point
    }
}

impl Drop for VulkanPipelineState {
    fn drop(&mut self) {
        unsafe { self.shared.raw.destroy_pipeline(self.raw, None) };
    }
}

/// A SPIR-V module and its entry point.
#[derive(Clone, Copy, Debug)]
pub struct ShaderStage<'a> {
    pub code: &'a [u32],
    pub entry_point: &'a CStr,
}

#[derive(Clone, Copy, Debug)]
pub struct ComputePipelineDesc<'a> {
    pub shader: ShaderStage<'a>,
    pub name: Option<&'a str>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexBinding {
    pub binding: u32,
    pub per_instance: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: vk::Format,
    pub offset: u32,
}

/// Fixed-function state of a graphics pipeline. Viewports, scissors, the primitive
/// topology and vertex strides are dynamic and come from the command list.
#[derive(Clone, Copy, Debug)]
pub struct GraphicsPipelineDesc<'a> {
    pub vertex: ShaderStage<'a>,
    pub fragment: Option<ShaderStage<'a>>,
    pub vertex_bindings: &'a [VertexBinding],
    pub vertex_attributes: &'a [VertexAttribute],
    /// Any topology of the same class may be set on the command list.
    pub topology: PrimitiveTopology,
    pub color_formats: &'a [Format],
    pub depth_format: Option<Format>,
    pub depth_test: bool,
    pub depth_write: bool,
    pub cull_back_faces: bool,
    pub alpha_blend: bool,
    pub name: Option<&'a str>,
}

impl Default for GraphicsPipelineDesc<'_> {
    fn default() -> Self {
        Self {
            vertex: ShaderStage {
                code: &[],
                entry_point: c"main",
            },
            fragment: None,
            vertex_bindings: &[],
            vertex_attributes: &[],
            topology: PrimitiveTopology::TriangleList,
            color_formats: &[],
            depth_format: None,
            depth_test: false,
            depth_write: false,
            cull_back_faces: false,
            alpha_blend: false,
            name: None,
        }
    }
}

struct ShaderModules<'a> {
    shared: &'a DeviceShared,
    modules: SmallVec<[vk::ShaderModule; 2]>,
}

impl ShaderModules<'_> {
    fn create(&mut self, code: &[u32]) -> Result<vk::ShaderModule> {
        let info = vk::ShaderModuleCreateInfo::default().code(code);
        let module = unsafe { self.shared.raw.create_shader_module(&info, None)? };
        self.modules.push(module);
        Ok(module)
    }
}

impl Drop for ShaderModules<'_> {
    fn drop(&mut self) {
        for module in self.modules.drain(..) {
            unsafe { self.shared.raw.destroy_shader_module(module, None) };
        }
    }
}

impl VulkanPipelineState {
    pub(super) fn compute(
        shared: &Arc<DeviceShared>,
        signature: &VulkanRootSignature,
        desc: &ComputePipelineDesc<'_>,
    ) -> Result<Self> {
        let mut modules = ShaderModules {
            shared,
            modules: SmallVec::new(),
        };
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(modules.create(desc.shader.code)?)
            .name(desc.shader.entry_point);
        let info = vk::ComputePipelineCreateInfo::default()
            .flags(vk::PipelineCreateFlags::DESCRIPTOR_BUFFER_EXT)
            .stage(stage)
            .layout(signature.layout());
        let raw = unsafe {
            shared
                .raw
                .create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
                .map_err(|(_, err)| err)?
        }[0];
        if let Some(name) = desc.name {
            shared.set_name(raw, name);
        }
        Ok(Self {
            shared: shared.clone(),
            raw,
            bind_point: vk::PipelineBindPoint::COMPUTE,
        })
    }

    pub(super) fn graphics(
        shared: &Arc<DeviceShared>,
        signature: &VulkanRootSignature,
        desc: &GraphicsPipelineDesc<'_>,
    ) -> Result<Self> {
        let mut modules = ShaderModules {
            shared,
            modules: SmallVec::new(),
        };
        let mut stages: SmallVec<[vk::PipelineShaderStageCreateInfo; 2]> = SmallVec::new();
        stages.push(
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(modules.create(desc.vertex.code)?)
                .name(desc.vertex.entry_point),
        );
        if let Some(fragment) = &desc.fragment {
            stages.push(
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(vk::ShaderStageFlags::FRAGMENT)
                    .module(modules.create(fragment.code)?)
                    .name(fragment.entry_point),
            );
        }

        let bindings: SmallVec<[vk::VertexInputBindingDescription; 4]> = desc
            .vertex_bindings
            .iter()
            .map(|binding| vk::VertexInputBindingDescription {
                binding: binding.binding,
                stride: 0,
                input_rate: if binding.per_instance {
                    vk::VertexInputRate::INSTANCE
                } else {
                    vk::VertexInputRate::VERTEX
                },
            })
            .collect();
        let attributes: SmallVec<[vk::VertexInputAttributeDescription; 8]> = desc
            .vertex_attributes
            .iter()
            .map(|attribute| vk::VertexInputAttributeDescription {
                location: attribute.location,
                binding: attribute.binding,
                format: attribute.format,
                offset: attribute.offset,
            })
            .collect();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(conv::topology(desc.topology));
        let viewport = vk::PipelineViewportStateCreateInfo::default();
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(if desc.cull_back_faces {
                vk::CullModeFlags::BACK
            } else {
                vk::CullModeFlags::NONE
            })
            // Viewports are flipped, so clockwise stays front facing.
            .front_face(vk::FrontFace::CLOCKWISE)
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(desc.depth_test)
            .depth_write_enable(desc.depth_write)
            .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL);
        let blend_attachment = if desc.alpha_blend {
            vk::PipelineColorBlendAttachmentState {
                blend_enable: vk::TRUE,
                src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
                dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
                color_blend_op: vk::BlendOp::ADD,
                src_alpha_blend_factor: vk::BlendFactor::ONE,
                dst_alpha_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
                alpha_blend_op: vk::BlendOp::ADD,
                color_write_mask: vk::ColorComponentFlags::RGBA,
            }
        } else {
            vk::PipelineColorBlendAttachmentState {
                color_write_mask: vk::ColorComponentFlags::RGBA,
                ..Default::default()
            }
        };
        let blend_attachments: SmallVec<[vk::PipelineColorBlendAttachmentState; 8]> =
            desc.color_formats.iter().map(|_| blend_attachment).collect();
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);
        let dynamic_states = [
            vk::DynamicState::VIEWPORT_WITH_COUNT,
            vk::DynamicState::SCISSOR_WITH_COUNT,
            vk::DynamicState::PRIMITIVE_TOPOLOGY,
            vk::DynamicState::VERTEX_INPUT_BINDING_STRIDE,
        ];
        let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let color_formats: SmallVec<[vk::Format; 8]> =
            desc.color_formats.iter().map(|format| conv::format(*format)).collect();
        let depth_format = desc.depth_format.map_or(vk::Format::UNDEFINED, conv::format);
        let stencil_format = match desc.depth_format {
            Some(format) if format.has_stencil() => depth_format,
            _ => vk::Format::UNDEFINED,
        };
        let mut rendering = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&color_formats)
            .depth_attachment_format(depth_format)
            .stencil_attachment_format(stencil_format);

        let info = vk::GraphicsPipelineCreateInfo::default()
            .flags(vk::PipelineCreateFlags::DESCRIPTOR_BUFFER_EXT)
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(signature.layout())
            .push_next(&mut rendering);
        let raw = unsafe {
            shared
                .raw
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
                .map_err(|(_, err)| err)?
        }[0];
        if let Some(name) = desc.name {
            shared.set_name(raw, name);
        }
        Ok(Self {
            shared: shared.clone(),
            raw,
            bind_point: vk::PipelineBindPoint::GRAPHICS,
        })
    }
}

impl PipelineState<Vulkan> {
    /// Compiles a compute pipeline against `root_signature`.
    pub fn vulkan_compute(
        device: Device<Vulkan>,
        root_signature: Arc<RootSignature<Vulkan>>,
        desc: &ComputePipelineDesc<'_>,
    ) -> Result<Self> {
        let raw = VulkanPipelineState::compute(device.raw().shared(), root_signature.raw(), desc)?;
        Ok(Self::from_raw(device, raw, root_signature, BindPoint::Compute))
    }

    /// Compiles a graphics pipeline against `root_signature`.
    pub fn vulkan_graphics(
        device: Device<Vulkan>,
        root_signature: Arc<RootSignature<Vulkan>>,
        desc: &GraphicsPipelineDesc<'_>,
    ) -> Result<Self> {
        let raw = VulkanPipelineState::graphics(device.raw().shared(), root_signature.raw(), desc)?;
        Ok(Self::from_raw(device, raw, root_signature, BindPoint::Graphics))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::root_signature::{DescriptorRangeKind, ShaderVisibility};

    #[test]
    fn test_root_views_are_eight_byte_aligned() {
        let desc = RootSignatureDesc::new(vec![
            RootParameter::constants(3, 0, ShaderVisibility::All),
            RootParameter::cbv(1, ShaderVisibility::All),
            RootParameter::table(DescriptorRangeKind::Srv, 8, ShaderVisibility::Pixel),
            RootParameter::table(DescriptorRangeKind::Sampler, 2, ShaderVisibility::Pixel),
        ]);
        let (slots, size) = push_constant_layout(&desc, 128).unwrap();
        assert_eq!(
            slots.as_slice(),
            &[
                RootSlot::Constants { offset: 0, count: 3 },
                RootSlot::View { offset: 16 },
                RootSlot::Table {
                    offset: 24,
                    heap: DescriptorHeapType::CbvSrvUav
                },
                RootSlot::Table {
                    offset: 28,
                    heap: DescriptorHeapType::Sampler
                },
            ]
        );
        assert_eq!(size, 32);
    }

    #[test]
    fn test_oversized_signatures_are_rejected() {
        let desc = RootSignatureDesc::new(vec![RootParameter::constants(
            40,
            0,
            ShaderVisibility::All,
        )]);
        assert!(matches!(
            push_constant_layout(&desc, 128),
            Err(Error::Unsupported(_))
        ));
    }
}
