//! Binding layouts (root signatures).
//!
//! A [`RootSignature`] describes what a pipeline expects at each root index:
//! a descriptor table, an inline constant buffer address, or inline 32-bit
//! constants. The dynamic descriptor stager only cares about the tables, so
//! the signature precomputes, per shader-visible heap kind, a bitmask of the
//! root indices that are tables plus the number of descriptors each one
//! spans.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::errors::{EmberError, Result};
use crate::hal::{DescriptorHeapKind, RootSignatureId};

/// Upper bound on root parameters; table masks are 32 bits wide.
pub const MAX_ROOT_PARAMETERS: usize = 32;

static NEXT_ROOT_SIGNATURE_ID: AtomicU64 = AtomicU64::new(1);

/// What a descriptor range binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorRangeKind {
    ShaderResource,
    UnorderedAccess,
    ConstantBuffer,
    Sampler,
}

impl DescriptorRangeKind {
    #[inline]
    #[must_use]
    pub fn heap_kind(self) -> DescriptorHeapKind {
        match self {
            Self::Sampler => DescriptorHeapKind::Sampler,
            _ => DescriptorHeapKind::CbvSrvUav,
        }
    }
}

/// A run of `count` consecutive registers inside a descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorRange {
    pub kind: DescriptorRangeKind,
    pub count: u32,
    pub base_register: u32,
}

impl DescriptorRange {
    #[must_use]
    pub fn new(kind: DescriptorRangeKind, count: u32, base_register: u32) -> Self {
        Self {
            kind,
            count,
            base_register,
        }
    }
}

/// One entry of a root signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootParameter {
    DescriptorTable {
        ranges: Vec<DescriptorRange>,
        visibility: wgpu::ShaderStages,
    },
    /// Root constant buffer view bound by GPU address.
    ConstantBufferView {
        register: u32,
        visibility: wgpu::ShaderStages,
    },
    /// Inline 32-bit constants.
    Constants {
        count: u32,
        register: u32,
        visibility: wgpu::ShaderStages,
    },
}

/// Immutable binding layout with precomputed descriptor-table metadata.
#[derive(Debug, Clone)]
pub struct RootSignature {
    id: RootSignatureId,
    parameters: Vec<RootParameter>,
    table_masks: [u32; 2],
    descriptor_counts: [u32; MAX_ROOT_PARAMETERS],
}

impl RootSignature {
    /// Validate `parameters` and compute the table masks.
    ///
    /// Fails when there are more than [`MAX_ROOT_PARAMETERS`] parameters, or a
    /// table is empty or mixes sampler and non-sampler ranges.
    pub fn new(parameters: Vec<RootParameter>) -> Result<Self> {
        if parameters.len() > MAX_ROOT_PARAMETERS {
            return Err(EmberError::InvalidRootSignature(format!(
                "{} root parameters (max {MAX_ROOT_PARAMETERS})",
                parameters.len()
            )));
        }

        let mut table_masks = [0u32; 2];
        let mut descriptor_counts = [0u32; MAX_ROOT_PARAMETERS];

        for (index, parameter) in parameters.iter().enumerate() {
            let RootParameter::DescriptorTable { ranges, .. } = parameter else {
                continue;
            };
            let Some(first) = ranges.first() else {
                return Err(EmberError::InvalidRootSignature(format!(
                    "descriptor table at root index {index} has no ranges"
                )));
            };

            let kind = first.kind.heap_kind();
            if ranges.iter().any(|r| r.kind.heap_kind() != kind) {
                return Err(EmberError::InvalidRootSignature(format!(
                    "descriptor table at root index {index} mixes sampler and non-sampler ranges"
                )));
            }

            table_masks[kind.index()] |= 1 << index;
            descriptor_counts[index] = ranges
                .iter()
                .try_fold(0u32, |total, r| total.checked_add(r.count))
                .ok_or_else(|| {
                    EmberError::InvalidRootSignature(format!(
                        "descriptor table at root index {index} spans more than u32::MAX descriptors"
                    ))
                })?;
        }

        Ok(Self {
            id: RootSignatureId(NEXT_ROOT_SIGNATURE_ID.fetch_add(1, Ordering::Relaxed)),
            parameters,
            table_masks,
            descriptor_counts,
        })
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> RootSignatureId {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn parameters(&self) -> &[RootParameter] {
        &self.parameters
    }

    /// Bit `i` is set when root index `i` is a descriptor table of `kind`.
    /// Always zero for RTV and DSV.
    #[must_use]
    pub fn descriptor_table_mask(&self, kind: DescriptorHeapKind) -> u32 {
        if kind.is_shader_visible() {
            self.table_masks[kind.index()]
        } else {
            0
        }
    }

    /// Descriptors spanned by the table at `root_index` (0 for non-tables).
    #[must_use]
    pub fn num_descriptors(&self, root_index: u32) -> u32 {
        self.descriptor_counts
            .get(root_index as usize)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(kind: DescriptorRangeKind, count: u32) -> RootParameter {
        RootParameter::DescriptorTable {
            ranges: vec![DescriptorRange::new(kind, count, 0)],
            visibility: wgpu::ShaderStages::FRAGMENT,
        }
    }

    #[test]
    fn test_masks_split_by_heap_kind() {
        let sig = RootSignature::new(vec![
            RootParameter::ConstantBufferView {
                register: 0,
                visibility: wgpu::ShaderStages::VERTEX,
            },
            table(DescriptorRangeKind::ShaderResource, 4),
            table(DescriptorRangeKind::Sampler, 2),
            RootParameter::DescriptorTable {
                ranges: vec![
                    DescriptorRange::new(DescriptorRangeKind::ConstantBuffer, 1, 1),
                    DescriptorRange::new(DescriptorRangeKind::UnorderedAccess, 3, 0),
                ],
                visibility: wgpu::ShaderStages::COMPUTE,
            },
        ])
        .unwrap();

        assert_eq!(sig.descriptor_table_mask(DescriptorHeapKind::CbvSrvUav), 0b1010);
        assert_eq!(sig.descriptor_table_mask(DescriptorHeapKind::Sampler), 0b0100);
        assert_eq!(sig.descriptor_table_mask(DescriptorHeapKind::Rtv), 0);
        assert_eq!(sig.num_descriptors(0), 0);
        assert_eq!(sig.num_descriptors(1), 4);
        assert_eq!(sig.num_descriptors(3), 4);
        assert_eq!(sig.num_descriptors(40), 0);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = RootSignature::new(vec![]).unwrap();
        let b = RootSignature::new(vec![]).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_mixed_table_is_rejected() {
        let err = RootSignature::new(vec![RootParameter::DescriptorTable {
            ranges: vec![
                DescriptorRange::new(DescriptorRangeKind::ShaderResource, 1, 0),
                DescriptorRange::new(DescriptorRangeKind::Sampler, 1, 0),
            ],
            visibility: wgpu::ShaderStages::FRAGMENT,
        }])
        .unwrap_err();
        assert!(matches!(err, EmberError::InvalidRootSignature(_)));
    }

    #[test]
    fn test_table_descriptor_count_overflow_is_rejected() {
        let err = RootSignature::new(vec![RootParameter::DescriptorTable {
            ranges: vec![
                DescriptorRange::new(DescriptorRangeKind::ShaderResource, u32::MAX, 0),
                DescriptorRange::new(DescriptorRangeKind::ShaderResource, 1, 1),
            ],
            visibility: wgpu::ShaderStages::FRAGMENT,
        }])
        .unwrap_err();
        assert!(matches!(err, EmberError::InvalidRootSignature(_)));
    }

    #[test]
    fn test_too_many_parameters() {
        let params = (0..33)
            .map(|i| RootParameter::Constants {
                count: 1,
                register: i,
                visibility: wgpu::ShaderStages::VERTEX,
            })
            .collect();
        assert!(RootSignature::new(params).is_err());
    }
}
