//! Rigging runtime: chat orchestration over MCP tool servers.
//!
//! # Overview
//!
//! - **Orchestrator**: runs a chat turn as a loop of streamed model rounds
//!   and tool executions, persisting every message and emitting
//!   [`ChatEvent`]s as it goes.
//! - **ConnectionManager**: owns each user's live tool-server connections,
//!   keeps the stored tool catalog in sync and routes tool calls.
//! - **Backend**: the streaming inference seam; [`OllamaBackend`] is the
//!   shipped provider.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use runtime::{ChatRequest, ConnectionManager, OllamaBackend, Orchestrator, OrchestratorConfig};
//! use storage::{SqliteStore, UserId};
//!
//! # async fn example() -> runtime::Result<()> {
//! let store = Arc::new(SqliteStore::in_memory()?);
//! let tools = Arc::new(ConnectionManager::new(Arc::clone(&store)));
//! let backend = OllamaBackend::builder().build();
//! let orchestrator = Arc::new(Orchestrator::new(backend, store, tools, OrchestratorConfig::default()));
//!
//! let mut events = orchestrator.stream_chat(ChatRequest::new(UserId::new(), "Hello!"));
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

mod chat;
mod error;
pub mod model;
pub mod providers;
pub mod tools;

#[cfg(test)]
mod testing;

pub use chat::{ChatEvent, ChatEventKind, ChatRequest, Orchestrator, OrchestratorConfig};
pub use error::{Error, Result};
pub use model::{Backend, ModelError};
pub use providers::{OllamaBackend, OllamaBackendBuilder};
pub use tools::{
    ConnectedServer, ConnectionManager, ConnectionResult, ConnectionStatus, LiveTool,
    QualifiedName, ToolOutcome,
};
