//! GPU Core Settings
//!
//! All tunables of the submission layer live in [`GpuSettings`]. The
//! defaults match a typical desktop renderer; override individual fields with
//! struct-update syntax.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use ember::{GpuContext, GpuSettings};
//!
//! let settings = GpuSettings {
//!     descriptors_per_page: 512,
//!     max_command_lists_per_queue: 4,
//!     ..Default::default()
//! };
//!
//! let context = GpuContext::new(device, settings);
//! ```

use std::time::Duration;

use crate::hal::DescriptorHeapKind;

/// Bytes in one upload page unless configured otherwise.
pub const DEFAULT_UPLOAD_PAGE_SIZE: u64 = 2 * 1024 * 1024;

/// Configuration for every pool owned by a [`GpuContext`](crate::GpuContext)
/// and the queues it creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuSettings {
    /// Capacity of a freshly created CPU descriptor page.
    ///
    /// A request larger than this creates a page sized to the request.
    pub descriptors_per_page: u32,

    /// Upper bound for any single descriptor page.
    ///
    /// Requests above this are a configuration error.
    pub max_descriptors_per_page: u32,

    /// Capacity of each GPU-visible CBV/SRV/UAV heap used by the dynamic
    /// descriptor stager of a command list.
    pub dynamic_descriptors_per_heap: u32,

    /// Capacity of each GPU-visible sampler heap used by the dynamic
    /// descriptor stager of a command list.
    pub dynamic_samplers_per_heap: u32,

    /// Size of one upload page in bytes.
    ///
    /// Dynamic uploads larger than this are rejected;
    /// [`CommandList::copy_buffer`](crate::CommandList::copy_buffer) stages
    /// them through a dedicated buffer instead.
    pub upload_page_size: u64,

    /// Maximum number of command lists a queue hands out to callers.
    ///
    /// Once reached, [`CommandQueue::get_command_list`](crate::CommandQueue::get_command_list)
    /// blocks until the reclamation worker returns one.
    pub max_command_lists_per_queue: usize,

    /// Sleep between polls of an exhausted command list pool.
    pub command_list_poll_interval: Duration,

    /// Drop pending barriers whose resolved before-state equals the
    /// after-state instead of recording them.
    ///
    /// Off by default: the redundant barrier is recorded but has no effect.
    pub elide_redundant_pending_barriers: bool,
}

impl Default for GpuSettings {
    fn default() -> Self {
        Self {
            descriptors_per_page: 256,
            max_descriptors_per_page: 1_000_000,
            dynamic_descriptors_per_heap: 1024,
            dynamic_samplers_per_heap: 1024,
            upload_page_size: DEFAULT_UPLOAD_PAGE_SIZE,
            max_command_lists_per_queue: 8,
            command_list_poll_interval: Duration::from_millis(1),
            elide_redundant_pending_barriers: false,
        }
    }
}

impl GpuSettings {
    /// Capacity of the GPU-visible heaps a dynamic stager of `kind` allocates.
    ///
    /// Only the shader-visible kinds have stagers; RTV and DSV return `0`.
    #[inline]
    #[must_use]
    pub fn dynamic_heap_capacity(&self, kind: DescriptorHeapKind) -> u32 {
        match kind {
            DescriptorHeapKind::CbvSrvUav => self.dynamic_descriptors_per_heap,
            DescriptorHeapKind::Sampler => self.dynamic_samplers_per_heap,
            DescriptorHeapKind::Rtv | DescriptorHeapKind::Dsv => 0,
        }
    }
}
