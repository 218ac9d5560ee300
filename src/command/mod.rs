//! Command recording and submission.

pub mod list;
pub mod queue;

pub use list::{CONSTANT_BUFFER_ALIGNMENT, CommandList};
pub use queue::CommandQueue;
