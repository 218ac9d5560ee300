#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_arguments)]

pub mod buffer;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod errors;
pub mod hal;
pub mod settings;
pub mod state;
pub mod token;
pub mod upload;

pub use buffer::{GpuBuffer, IndexElement};
pub use command::{CommandList, CommandQueue};
pub use context::GpuContext;
pub use descriptors::{DescriptorAllocation, DescriptorAllocator, RootParameter, RootSignature};
pub use errors::{EmberError, Result};
pub use settings::GpuSettings;
pub use token::{CompletionToken, FrameClock, FrameNumber};
