pub mod config;
pub mod error;
pub mod event;
pub mod message;
pub mod property;
pub mod template;
pub mod traits;
pub mod types;

pub use error::{ErrorCategory, Result, StepwiseError};
pub use message::{Message, MessageList, MessageType, ToolRequest, ToolResult};
pub use property::{Property, PropertyKind};
