//! Chat turns: streaming model rounds interleaved with tool execution.

mod events;
mod orchestrator;

pub use events::{ChatEvent, ChatEventKind};
pub use orchestrator::{ChatRequest, Orchestrator, OrchestratorConfig};
