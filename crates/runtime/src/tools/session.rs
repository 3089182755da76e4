//! The seams between the connection manager and the transport layer.

use mcp::{CallToolResult, McpClient, ServerDescriptor, Tool};
use serde_json::{Map, Value};
use std::future::Future;

/// A connected tool server, as the connection manager uses it.
pub trait ToolSession: Send + Sync + 'static {
    fn list_tools(&self) -> impl Future<Output = mcp::Result<Vec<Tool>>> + Send;

    /// Call a tool by its local (unprefixed) name.
    fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> impl Future<Output = mcp::Result<CallToolResult>> + Send;

    /// Best-effort close; never fails.
    fn close(&self) -> impl Future<Output = ()> + Send;

    fn session_id(&self) -> Option<String>;
}

/// Opens sessions for server descriptors.
pub trait Connector: Send + Sync + 'static {
    type Session: ToolSession;

    fn connect(
        &self,
        descriptor: &ServerDescriptor,
    ) -> impl Future<Output = mcp::Result<Self::Session>> + Send;
}

impl ToolSession for McpClient {
    async fn list_tools(&self) -> mcp::Result<Vec<Tool>> {
        McpClient::list_tools(self).await
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> mcp::Result<CallToolResult> {
        McpClient::call_tool(self, name, Some(arguments)).await
    }

    async fn close(&self) {
        McpClient::close(self).await
    }

    fn session_id(&self) -> Option<String> {
        McpClient::session_id(self)
    }
}

/// Connects real MCP servers over whichever transport the descriptor names.
#[derive(Debug, Clone, Copy, Default)]
pub struct McpConnector;

impl Connector for McpConnector {
    type Session = McpClient;

    async fn connect(&self, descriptor: &ServerDescriptor) -> mcp::Result<McpClient> {
        let client = McpClient::new(descriptor.clone());
        client.connect().await?;
        Ok(client)
    }
}
