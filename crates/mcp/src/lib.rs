//! MCP (Model Context Protocol) client library.
//!
//! This crate connects to tool servers over three transports (a local
//! subprocess, server-sent events, and streamable HTTP) behind one
//! [`McpClient`], and turns connection intents into [`ServerDescriptor`]s via
//! the [`registry`]. The protocol itself is run by rmcp.
//!
//! # Example
//!
//! ```no_run
//! use mcp::{ConnectOptions, McpClient, registry};
//!
//! # async fn example() -> mcp::Result<()> {
//! let options = ConnectOptions {
//!     server_paths: vec!["./servers/weather.py".into()],
//!     ..ConnectOptions::default()
//! };
//! let resolution = registry::resolve(&options);
//!
//! for descriptor in resolution.descriptors {
//!     let client = McpClient::new(descriptor);
//!     client.connect().await?;
//!
//!     for tool in client.list_tools().await? {
//!         println!("{}.{}", client.name(), tool.name);
//!     }
//!
//!     client.close().await;
//! }
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod protocol;
pub mod registry;
#[cfg(test)]
mod testing;
pub mod transport;

pub use client::McpClient;
pub use error::{Error, Result};
pub use protocol::{
    CallToolResult, InitializeResult, JsonRpcError, PROTOCOL_VERSION, ServerCapabilities,
    ServerInfo, Tool, ToolContent, ToolsCapability,
};
pub use registry::{ConnectOptions, Resolution, ServerDescriptor};
pub use transport::{DEFAULT_TIMEOUT, MAX_OUTPUT_SIZE, Transport, TransportConfig, TransportKind};
