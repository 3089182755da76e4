//! LLM provider adapters.
//!
//! Each provider implements the streaming [`Backend`](crate::model::Backend)
//! trait for its specific API.

mod ollama;

pub use ollama::{DEFAULT_HOST, DEFAULT_MODEL, ModelInfo, OllamaBackend, OllamaBackendBuilder};
