use crate::dynamic_descriptor::MAX_CACHED_DESCRIPTORS;

/// Sizes of the pooled objects owned by a [`CommandListManager`](crate::manager::CommandListManager).
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ManagerConfig {
    /// Descriptors per shader-visible page of the dynamic descriptor heaps.
    pub descriptors_per_dynamic_heap: u32,
    /// Descriptors per native heap of the persistent descriptor allocators.
    pub descriptors_per_allocator_heap: u32,
    /// Size in bytes of GPU-exclusive linear pages.
    pub gpu_linear_page_size: u64,
    /// Size in bytes of CPU-writable linear pages.
    pub cpu_linear_page_size: u64,
    /// Alignment of linear allocations made without an explicit alignment.
    pub linear_allocation_alignment: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            descriptors_per_dynamic_heap: 1024,
            descriptors_per_allocator_heap: 256,
            gpu_linear_page_size: 0x10000,
            cpu_linear_page_size: 0x200000,
            linear_allocation_alignment: crate::linear::DEFAULT_ALIGNMENT,
        }
    }
}

impl ManagerConfig {
    /// Asserts that the sizes are usable.
    pub(crate) fn validate(&self) {
        assert!(
            self.descriptors_per_dynamic_heap as usize >= MAX_CACHED_DESCRIPTORS,
            "dynamic descriptor pages hold {} descriptors, a commit may stage {MAX_CACHED_DESCRIPTORS}",
            self.descriptors_per_dynamic_heap
        );
        assert!(self.descriptors_per_allocator_heap > 0);
        assert!(self.linear_allocation_alignment.is_power_of_two());
        assert!(self.gpu_linear_page_size >= self.linear_allocation_alignment);
        assert!(self.cpu_linear_page_size >= self.linear_allocation_alignment);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        ManagerConfig::default().validate();
    }

    #[test]
    fn test_dynamic_heap_may_match_cache_size() {
        ManagerConfig {
            descriptors_per_dynamic_heap: MAX_CACHED_DESCRIPTORS as u32,
            ..Default::default()
        }
        .validate();
    }

    #[test]
    #[should_panic(expected = "a commit may stage")]
    fn test_rejects_dynamic_heap_smaller_than_cache() {
        ManagerConfig {
            descriptors_per_dynamic_heap: 128,
            ..Default::default()
        }
        .validate();
    }
}
