pub mod catalog;
pub mod grounded;
pub mod runtime;

pub use catalog::{GroundingContext, ToolCatalog};
pub use grounded::{DescriptionPart, GroundedToolCall, COMPUTER_TOOL};
pub use runtime::{HttpToolRuntime, ToolOutput, ToolRuntime};
