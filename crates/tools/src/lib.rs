pub mod registry;
pub mod traits;

pub use registry::ToolRegistry;
pub use traits::{
    canonical_name, OutputChunk, OutputSink, OutputStream, Tool, ToolContext, ToolDefinition,
    ToolError, ToolResult,
};
