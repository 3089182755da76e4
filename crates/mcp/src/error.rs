//! MCP error types.

use crate::protocol::JsonRpcError;
use thiserror::Error;

/// Errors from MCP transports, the client, and the server registry.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("client is not connected")]
    NotConnected,

    #[error("client is already connected")]
    AlreadyConnected,

    #[error("connection closed")]
    Closed,

    #[error("timeout waiting for response")]
    Timeout,

    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON-RPC error: {0}")]
    JsonRpc(#[from] JsonRpcError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("tool call failed: {0}")]
    ToolCallFailed(String),

    #[error("output too large: {size} bytes (max {max})")]
    OutputTooLarge { size: usize, max: usize },

    #[error("{0}")]
    Config(String),

    #[error("initialize handshake failed: {0}")]
    Initialize(String),

    #[error("mcp service error: {0}")]
    Service(String),
}

impl From<rmcp::service::ServiceError> for Error {
    fn from(error: rmcp::service::ServiceError) -> Self {
        match error {
            rmcp::service::ServiceError::McpError(data) => Error::JsonRpc(data.into()),
            rmcp::service::ServiceError::TransportClosed => Error::Closed,
            other => Error::Service(other.to_string()),
        }
    }
}

impl Error {
    /// Whether the error means the underlying channel is gone and the
    /// connection should not be used again.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Io(_) | Error::Closed | Error::NotConnected => true,
            Error::Http(e) => e.is_connect(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
