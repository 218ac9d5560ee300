//! Error Types
//!
//! This module defines the error types used throughout the GPU core.
//!
//! # Overview
//!
//! The main error type [`EmberError`] covers the failure modes that the core
//! cannot absorb by growing a pool or blocking:
//! - Native object creation failures (heaps, resources, command lists, fences)
//! - Requests larger than a page or heap can ever hold
//! - Invalid binding layouts
//! - A queue whose reclamation worker has already shut down
//!
//! Transient exhaustion (no free command list, no free descriptor block) is
//! never reported here; the pools grow or the caller blocks instead.
//!
//! Contract violations by the renderer layer (staging outside a declared
//! descriptor range, binding a null constant buffer) are not errors either:
//! they panic.
//!
//! # Usage
//!
//! ```rust,ignore
//! use ember::errors::{EmberError, Result};
//!
//! fn record(list: &mut CommandList) -> Result<()> {
//!     list.set_dynamic_vertex_buffer(0, &vertices)?;
//!     Ok(())
//! }
//! ```

use thiserror::Error;

use crate::hal::DescriptorHeapKind;

/// The main error type for the GPU core.
#[derive(Error, Debug)]
pub enum EmberError {
    // ========================================================================
    // Device Errors
    // ========================================================================
    /// The native device refused to create an object.
    #[error("Failed to create {object}: {reason}")]
    DeviceObjectCreation {
        /// What was being created ("descriptor heap", "fence", ...)
        object: &'static str,
        /// Backend-provided reason
        reason: String,
    },

    /// Closing or resetting a native command list failed.
    #[error("Command list error: {0}")]
    CommandList(String),

    // ========================================================================
    // Allocation Errors
    // ========================================================================
    /// A descriptor block request exceeds the configured per-heap maximum.
    #[error("Descriptor request too large for {kind:?} heap: requested {requested}, max {max}")]
    DescriptorRequestTooLarge {
        kind: DescriptorHeapKind,
        requested: u32,
        max: u32,
    },

    /// A single draw or dispatch needs more dynamic descriptors than one
    /// GPU-visible heap can hold.
    #[error("Dynamic {kind:?} descriptors exhausted: requested {requested}, heap capacity {capacity}")]
    DynamicDescriptorsExhausted {
        kind: DescriptorHeapKind,
        requested: u32,
        capacity: u32,
    },

    /// An upload request is larger than one upload page.
    #[error("Upload allocation too large: requested {requested} bytes, page size {page_size} bytes")]
    UploadTooLarge { requested: u64, page_size: u64 },

    // ========================================================================
    // Binding Errors
    // ========================================================================
    /// The binding layout cannot be expressed.
    #[error("Invalid root signature: {0}")]
    InvalidRootSignature(String),

    // ========================================================================
    // Queue Errors
    // ========================================================================
    /// The queue's reclamation worker is no longer running.
    #[error("Command queue has shut down")]
    QueueShutDown,
}

impl EmberError {
    pub(crate) fn creation(object: &'static str, reason: impl Into<String>) -> Self {
        EmberError::DeviceObjectCreation {
            object,
            reason: reason.into(),
        }
    }
}

/// Alias for `Result<T, EmberError>`.
pub type Result<T> = std::result::Result<T, EmberError>;
