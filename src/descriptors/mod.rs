//! Descriptor management.
//!
//! - [`allocator`]: long-lived CPU descriptor blocks with deferred, frame-stamped frees
//! - [`layout`]: root signatures and their descriptor-table metadata
//! - [`dynamic`]: per-command-list staging into GPU-visible heaps

pub mod allocator;
pub mod dynamic;
pub mod layout;
mod page;

pub use allocator::{DescriptorAllocation, DescriptorAllocator};
pub use dynamic::{BoundDescriptorHeaps, DynamicDescriptorHeap};
pub use layout::{
    DescriptorRange, DescriptorRangeKind, MAX_ROOT_PARAMETERS, RootParameter, RootSignature,
};
