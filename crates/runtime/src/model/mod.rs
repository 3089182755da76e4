//! Model-facing protocol types and the streaming backend trait.

pub mod errors;
pub mod types;

pub use errors::ModelError;
pub use types::{
    Backend, ChunkStream, Message, ModelRequest, Role, StreamChunk, ToolCall, ToolSpec,
    default_tool_schema,
};
