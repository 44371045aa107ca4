pub mod client;
pub mod function;
pub mod registry;
pub mod remote;
pub mod streaming;

pub use client::ClientTool;
pub use function::FunctionTool;
pub use registry::{execute_tool, validate_args, ToolRegistry};
pub use remote::{PreparedRequest, RemoteTool, RemoteToolConfig};
pub use streaming::{ChunkSender, StreamingTool};
