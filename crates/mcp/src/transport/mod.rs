//! Transports carrying MCP messages to a tool server.
//!
//! A [`Transport`] is chosen once from a [`TransportConfig`]; callers above
//! this module never branch on the transport kind again. Each variant is
//! handed to rmcp, which runs the JSON-RPC session over it.

mod event_stream;
mod sse;

use std::collections::HashMap;
use std::time::Duration;

use rmcp::ServiceExt;
use rmcp::service::{RoleClient, RunningService};
use rmcp::transport::{
    ConfigureCommandExt, StreamableHttpClientTransport, TokioChildProcess,
    streamable_http_client::StreamableHttpClientTransportConfig,
};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::{Error, Result};

pub use event_stream::{SseDecoder, SseEvent};
pub use sse::SseTransport;

/// A running rmcp client session.
pub type Service = RunningService<RoleClient, ()>;

/// Default timeout for a single request/response exchange.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum size of a single message (1MB).
/// Sized for large tool outputs (file reads, search results).
pub const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// The three supported ways of reaching a tool server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Stdio,
    Sse,
    StreamableHttp,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Stdio => "stdio",
            Self::Sse => "sse",
            Self::StreamableHttp => "streamable_http",
        };
        f.write_str(name)
    }
}

/// Transport-specific launch/connect parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Spawn a local process and talk over its stdin/stdout.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Long-lived event stream plus a POST endpoint announced by the server.
    Sse { url: String },
    /// One POST per message; replies as JSON or as an event stream.
    StreamableHttp {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Stdio { .. } => TransportKind::Stdio,
            Self::Sse { .. } => TransportKind::Sse,
            Self::StreamableHttp { .. } => TransportKind::StreamableHttp,
        }
    }
}

/// A channel to one tool server, opened but not yet initialized.
pub enum Transport {
    Stdio(TokioChildProcess),
    Sse(SseTransport),
    StreamableHttp(StreamableHttpClientTransportConfig),
}

impl Transport {
    /// Open the channel described by `config`.
    ///
    /// Spawns the subprocess or waits for the SSE endpoint; the streamable
    /// HTTP variant makes no request until it is served.
    pub async fn open(config: &TransportConfig) -> Result<Self> {
        let transport = match config {
            TransportConfig::Stdio { command, args, env } => {
                let child = TokioChildProcess::new(Command::new(command).configure(|cmd| {
                    cmd.args(args).envs(env).kill_on_drop(true);
                }))
                .map_err(|source| Error::Spawn {
                    command: command.clone(),
                    source,
                })?;
                Self::Stdio(child)
            }
            TransportConfig::Sse { url } => {
                let started = timeout(DEFAULT_TIMEOUT, SseTransport::connect(url))
                    .await
                    .map_err(|_| Error::Timeout)??;
                Self::Sse(started)
            }
            TransportConfig::StreamableHttp { url, headers } => {
                Self::StreamableHttp(streamable_http_config(url, headers))
            }
        };
        Ok(transport)
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Stdio(_) => TransportKind::Stdio,
            Self::Sse(_) => TransportKind::Sse,
            Self::StreamableHttp(_) => TransportKind::StreamableHttp,
        }
    }

    /// Session id known before the handshake; only SSE announces one.
    pub fn session_id(&self) -> Option<String> {
        match self {
            Self::Sse(t) => t.session_id().map(str::to_string),
            Self::Stdio(_) | Self::StreamableHttp(_) => None,
        }
    }

    /// Run the `initialize` handshake and hand back the live session.
    pub async fn serve(self) -> Result<Service> {
        let handshake = async move {
            match self {
                Self::Stdio(child) => ().serve(child).await.map_err(initialize_failed),
                Self::Sse(sse) => ().serve(sse.into_parts()).await.map_err(initialize_failed),
                Self::StreamableHttp(config) => ()
                    .serve(StreamableHttpClientTransport::from_config(config))
                    .await
                    .map_err(initialize_failed),
            }
        };
        timeout(DEFAULT_TIMEOUT, handshake)
            .await
            .map_err(|_| Error::Timeout)?
    }
}

fn initialize_failed(error: impl std::fmt::Display) -> Error {
    Error::Initialize(error.to_string())
}

/// rmcp config for a streamable HTTP endpoint.
///
/// rmcp sends the protocol version header itself and carries a bearer token
/// as `auth_header`; other headers are not forwarded.
fn streamable_http_config(
    url: &str,
    headers: &HashMap<String, String>,
) -> StreamableHttpClientTransportConfig {
    let mut config = StreamableHttpClientTransportConfig::with_uri(url);
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("authorization") {
            let token = value.strip_prefix("Bearer ").unwrap_or(value);
            config.auth_header = Some(token.to_string());
        } else if name.eq_ignore_ascii_case("mcp-protocol-version") {
            tracing::debug!(%url, version = %value, "protocol version is negotiated by the client");
        } else {
            tracing::warn!(%url, header = %name, "custom header not forwarded");
        }
    }
    config
}

/// Reject a message body above [`MAX_OUTPUT_SIZE`].
pub(crate) fn check_size(size: usize) -> Result<()> {
    if size > MAX_OUTPUT_SIZE {
        return Err(Error::OutputTooLarge {
            size,
            max: MAX_OUTPUT_SIZE,
        });
    }
    Ok(())
}
