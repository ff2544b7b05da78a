//! Root signatures and their descriptor table layout.
//!
//! A root signature lists the root parameters a shader expects: inline constants, root
//! views bound by GPU address, and descriptor tables. [`RootSignature`] pairs the native
//! object with the two facts the dynamic descriptor heaps need when a signature is
//! bound:
//!
//! - which root parameters are view tables and which are sampler tables,
//! - how many descriptors each table holds.
//!
//! ```
//! use scoria::root_signature::{DescriptorRangeKind, RootParameter, RootSignatureDesc, ShaderVisibility};
//!
//! let desc = RootSignatureDesc::new(vec![
//!     RootParameter::constants(4, 0, ShaderVisibility::All),
//!     RootParameter::table(DescriptorRangeKind::Srv, 8, ShaderVisibility::Pixel),
//!     RootParameter::table(DescriptorRangeKind::Sampler, 2, ShaderVisibility::Pixel),
//! ]);
//! let layout = desc.table_layout();
//! assert_eq!(layout.view_tables, 0b010);
//! assert_eq!(layout.sampler_tables, 0b100);
//! assert_eq!(layout.table_sizes[1], 8);
//! ```
use std::fmt::Debug;

use crate::{
    Device, HasDevice, Result,
    backend::{Api, DescriptorHeapType, RawDevice, RootViewKind},
};

/// Maximum number of root parameters in a signature.
pub const MAX_ROOT_PARAMETERS: usize = 16;

/// Maximum number of descriptors in a single descriptor table.
pub const MAX_DESCRIPTORS_PER_TABLE: u32 = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ShaderVisibility {
    #[default]
    All,
    Vertex,
    Pixel,
    Compute,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DescriptorRangeKind {
    Srv,
    Uav,
    Cbv,
    Sampler,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DescriptorRange {
    pub kind: DescriptorRangeKind,
    pub count: u32,
    pub base_register: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RootParameter {
    /// A table of descriptors in a shader-visible heap. Sampler ranges may not be mixed
    /// with view ranges.
    DescriptorTable {
        ranges: Vec<DescriptorRange>,
        visibility: ShaderVisibility,
    },
    /// 32-bit constants stored inline in the root signature.
    Constants {
        count: u32,
        register: u32,
        visibility: ShaderVisibility,
    },
    /// A single buffer view bound by GPU address.
    View {
        kind: RootViewKind,
        register: u32,
        visibility: ShaderVisibility,
    },
}

impl RootParameter {
    /// A descriptor table with one range starting at register 0.
    pub fn table(kind: DescriptorRangeKind, count: u32, visibility: ShaderVisibility) -> Self {
        RootParameter::DescriptorTable {
            ranges: vec![DescriptorRange {
                kind,
                count,
                base_register: 0,
            }],
            visibility,
        }
    }

    pub fn constants(count: u32, register: u32, visibility: ShaderVisibility) -> Self {
        RootParameter::Constants {
            count,
            register,
            visibility,
        }
    }

    pub fn cbv(register: u32, visibility: ShaderVisibility) -> Self {
        RootParameter::View {
            kind: RootViewKind::ConstantBuffer,
            register,
            visibility,
        }
    }

    pub fn srv(register: u32, visibility: ShaderVisibility) -> Self {
        RootParameter::View {
            kind: RootViewKind::ShaderResource,
            register,
            visibility,
        }
    }

    pub fn uav(register: u32, visibility: ShaderVisibility) -> Self {
        RootParameter::View {
            kind: RootViewKind::UnorderedAccess,
            register,
            visibility,
        }
    }

    /// Heap type a table parameter draws from, or `None` for other parameters.
    pub fn table_heap_type(&self) -> Option<DescriptorHeapType> {
        let RootParameter::DescriptorTable { ranges, .. } = self else {
            return None;
        };
        let samplers = ranges
            .first()
            .is_some_and(|range| range.kind == DescriptorRangeKind::Sampler);
        assert!(
            ranges
                .iter()
                .all(|range| (range.kind == DescriptorRangeKind::Sampler) == samplers),
            "descriptor table mixes sampler and view ranges"
        );
        Some(if samplers {
            DescriptorHeapType::Sampler
        } else {
            DescriptorHeapType::CbvSrvUav
        })
    }

    /// Number of descriptors in a table parameter, zero for other parameters.
    pub fn table_size(&self) -> u32 {
        match self {
            RootParameter::DescriptorTable { ranges, .. } => {
                ranges.iter().map(|range| range.count).sum()
            }
            _ => 0,
        }
    }
}

/// Per-parameter table layout of a root signature.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TableLayout {
    /// Bit `i` is set when parameter `i` is a CBV/SRV/UAV table.
    pub view_tables: u32,
    /// Bit `i` is set when parameter `i` is a sampler table.
    pub sampler_tables: u32,
    pub table_sizes: [u32; MAX_ROOT_PARAMETERS],
}

impl TableLayout {
    pub fn tables_of(&self, ty: DescriptorHeapType) -> u32 {
        match ty {
            DescriptorHeapType::CbvSrvUav => self.view_tables,
            DescriptorHeapType::Sampler => self.sampler_tables,
            _ => 0,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RootSignatureDesc {
    pub parameters: Vec<RootParameter>,
    pub name: Option<String>,
}

impl RootSignatureDesc {
    pub fn new(parameters: Vec<RootParameter>) -> Self {
        Self {
            parameters,
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Computes the table bitmaps and sizes.
    ///
    /// # Panics
    /// If there are more than [`MAX_ROOT_PARAMETERS`] parameters, a table is empty or
    /// larger than [`MAX_DESCRIPTORS_PER_TABLE`], or a table mixes samplers and views.
    pub fn table_layout(&self) -> TableLayout {
        assert!(
            self.parameters.len() <= MAX_ROOT_PARAMETERS,
            "root signature has {} parameters, at most {MAX_ROOT_PARAMETERS} are supported",
            self.parameters.len()
        );
        let mut layout = TableLayout::default();
        for (index, parameter) in self.parameters.iter().enumerate() {
            let Some(ty) = parameter.table_heap_type() else {
                continue;
            };
            let size = parameter.table_size();
            assert!(size > 0, "descriptor table {index} is empty");
            assert!(
                size <= MAX_DESCRIPTORS_PER_TABLE,
                "descriptor table {index} holds {size} descriptors, at most {MAX_DESCRIPTORS_PER_TABLE} are supported"
            );
            match ty {
                DescriptorHeapType::Sampler => layout.sampler_tables |= 1 << index,
                _ => layout.view_tables |= 1 << index,
            }
            layout.table_sizes[index] = size;
        }
        layout
    }
}

/// A native root signature with its table layout.
///
/// Command lists compare root signatures by `Arc` identity, so share one
/// `Arc<RootSignature>` per distinct layout.
pub struct RootSignature<A: Api> {
    device: Device<A>,
    raw: A::RootSignature,
    desc: RootSignatureDesc,
    layout: TableLayout,
}

impl<A: Api> Debug for RootSignature<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootSignature")
            .field("name", &self.desc.name)
            .field("raw", &self.raw)
            .field("layout", &self.layout)
            .finish()
    }
}

impl<A: Api> HasDevice<A> for RootSignature<A> {
    fn device(&self) -> &Device<A> {
        &self.device
    }
}

impl<A: Api> RootSignature<A> {
    pub fn new(device: Device<A>, desc: RootSignatureDesc) -> Result<Self> {
        let layout = desc.table_layout();
        let raw = device.create_root_signature(&desc)?;
        Ok(Self {
            device,
            raw,
            desc,
            layout,
        })
    }

    pub fn raw(&self) -> &A::RootSignature {
        &self.raw
    }

    pub fn desc(&self) -> &RootSignatureDesc {
        &self.desc
    }

    pub fn num_parameters(&self) -> usize {
        self.desc.parameters.len()
    }

    pub fn layout(&self) -> &TableLayout {
        &self.layout
    }

    /// Bitmap of the table parameters drawing from heaps of type `ty`.
    pub fn descriptor_table_bitmap(&self, ty: DescriptorHeapType) -> u32 {
        self.layout.tables_of(ty)
    }

    pub fn table_size(&self, root_index: u32) -> u32 {
        self.layout.table_sizes[root_index as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_sizes_sum_ranges() {
        let desc = RootSignatureDesc::new(vec![
            RootParameter::cbv(0, ShaderVisibility::All),
            RootParameter::DescriptorTable {
                ranges: vec![
                    DescriptorRange {
                        kind: DescriptorRangeKind::Srv,
                        count: 3,
                        base_register: 0,
                    },
                    DescriptorRange {
                        kind: DescriptorRangeKind::Uav,
                        count: 2,
                        base_register: 0,
                    },
                ],
                visibility: ShaderVisibility::Compute,
            },
        ]);
        let layout = desc.table_layout();
        assert_eq!(layout.view_tables, 0b10);
        assert_eq!(layout.sampler_tables, 0);
        assert_eq!(layout.table_sizes[..2], [0, 5]);
    }

    #[test]
    #[should_panic(expected = "mixes sampler and view")]
    fn test_rejects_mixed_tables() {
        RootSignatureDesc::new(vec![RootParameter::DescriptorTable {
            ranges: vec![
                DescriptorRange {
                    kind: DescriptorRangeKind::Sampler,
                    count: 1,
                    base_register: 0,
                },
                DescriptorRange {
                    kind: DescriptorRangeKind::Srv,
                    count: 1,
                    base_register: 0,
                },
            ],
            visibility: ShaderVisibility::All,
        }])
        .table_layout();
    }

    #[test]
    #[should_panic(expected = "at most 16")]
    fn test_rejects_too_many_parameters() {
        RootSignatureDesc::new(vec![RootParameter::cbv(0, ShaderVisibility::All); 17]).table_layout();
    }
}
