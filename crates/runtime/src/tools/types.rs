//! Connection manager result and snapshot types.

use chrono::{DateTime, Utc};
use mcp::CallToolResult;
use serde::Serialize;
use serde_json::{Map, Value};

use super::name::QualifiedName;

/// A tool in a live connection's catalog.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveTool {
    /// Qualified name, `<server>.<tool>`.
    pub name: String,
    /// Name the server knows the tool by.
    pub local_name: String,
    pub description: String,
    pub enabled: bool,
    pub input_schema: Value,
}

impl LiveTool {
    pub(crate) fn discovered(server: &str, tool: mcp::Tool) -> Self {
        Self {
            name: QualifiedName::new(server, tool.name.as_str()).to_string(),
            description: tool
                .description
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| format!("Tool from {server}")),
            local_name: tool.name,
            enabled: true,
            input_schema: tool.input_schema,
        }
    }

    /// Stand-in entry for a server whose tool listing failed.
    pub(crate) fn placeholder(server: &str) -> Self {
        Self {
            name: QualifiedName::new(server, "example_tool").to_string(),
            local_name: "example_tool".to_string(),
            description: format!("Example tool from {server}"),
            enabled: true,
            input_schema: Value::Object(Map::new()),
        }
    }

    /// Whether `name` refers to this tool: the local name, the qualified
    /// name, or any dotted name ending in the local name.
    pub fn matches(&self, server: &str, name: &str) -> bool {
        self.local_name == name
            || self.name == QualifiedName::new(server, name).to_string()
            || self.name.ends_with(&format!(".{name}"))
    }
}

/// How one server fared in a connect call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerOutcome {
    pub server: String,
    /// Number of tools registered, zero on failure.
    pub tools: usize,
    pub error: Option<String>,
}

impl ServerOutcome {
    pub fn connected(&self) -> bool {
        self.error.is_none()
    }
}

/// Aggregate result of connecting a batch of servers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionResult {
    /// True when at least one server connected.
    pub success: bool,
    pub connected_servers: Vec<String>,
    pub errors: Vec<String>,
    pub outcomes: Vec<ServerOutcome>,
}

impl ConnectionResult {
    pub(crate) fn from_outcomes(outcomes: Vec<ServerOutcome>) -> Self {
        let connected_servers: Vec<String> = outcomes
            .iter()
            .filter(|o| o.connected())
            .map(|o| o.server.clone())
            .collect();
        let errors = outcomes.iter().filter_map(|o| o.error.clone()).collect();
        Self {
            success: !connected_servers.is_empty(),
            connected_servers,
            errors,
            outcomes,
        }
    }
}

/// Result of routing a tool call. Routing never raises.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Success(CallToolResult),
    Error(String),
}

impl ToolOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutcome::Success(_))
    }
}

/// Snapshot of a user's live connections.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub total_connected: usize,
    pub servers: Vec<String>,
    pub total_tools: usize,
}

/// A server the user has a session record for.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectedServer {
    pub name: String,
    pub session_id: String,
    pub connected_at: DateTime<Utc>,
    /// Tools in the live catalog; zero when the connection is not live.
    pub tool_count: usize,
    pub live: bool,
}
