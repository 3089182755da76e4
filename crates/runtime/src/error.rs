use thiserror::Error;

use crate::model::ModelError;

/// Runtime errors.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The user has no live connection to the named server.
    #[error("server {server} is not connected")]
    NotConnected { server: String },

    #[error("tool {tool} not found on server {server}")]
    ToolNotFound { server: String, tool: String },

    /// The model kept requesting tools past the configured bound.
    #[error("stopped after {0} tool rounds without a final answer")]
    RoundLimit(usize),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Mcp(#[from] mcp::Error),

    #[error(transparent)]
    Storage(#[from] storage::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
