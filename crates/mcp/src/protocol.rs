//! MCP result shapes exposed to callers.
//!
//! The rmcp client speaks the protocol; these types are what the rest of the
//! workspace sees. They are read from rmcp's models through their shared wire
//! format, so fields rmcp adds over time never leak into callers.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Protocol revision named in the header of streamable HTTP descriptors.
pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// JSON-RPC 2.0 error returned by a server.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = self.code;
        let message = &self.message;
        write!(f, "[{code}] {message}")
    }
}

impl std::error::Error for JsonRpcError {}

impl From<rmcp::model::ErrorData> for JsonRpcError {
    fn from(error: rmcp::model::ErrorData) -> Self {
        Self {
            code: error.code.0,
            message: error.message.into_owned(),
            data: error.data,
        }
    }
}

/// What the server reported about itself during `initialize`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    pub server_info: ServerInfo,
    #[serde(default)]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerCapabilities {
    #[serde(default)]
    pub tools: Option<ToolsCapability>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsCapability {
    #[serde(default)]
    pub list_changed: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// Tool definition returned by tools/list.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

/// Result of tools/call.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
    #[serde(default, deserialize_with = "null_as_false")]
    pub is_error: bool,
}

impl CallToolResult {
    /// A successful result holding a single text block.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            ..Self::default()
        }
    }

    /// All text blocks joined by newlines, or `None` if there are none.
    pub fn joined_text(&self) -> Option<String> {
        let texts: Vec<&str> = self.content.iter().filter_map(|c| c.as_text()).collect();
        if texts.is_empty() {
            None
        } else {
            Some(texts.join("\n"))
        }
    }
}

/// Content returned by a tool.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(
    tag = "type",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ToolContent {
    Text { text: String },
    Image { data: String, mime_type: String },
    Audio { data: String, mime_type: String },
    Resource { resource: Value },
    ResourceLink { uri: String, name: Option<String> },
    #[serde(other)]
    Unknown,
}

impl ToolContent {
    /// Get text content if this is a text content block.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ToolContent::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Re-read an rmcp model as one of the types above.
pub(crate) fn from_wire<T: Serialize, U: DeserializeOwned>(value: &T) -> Result<U> {
    Ok(serde_json::from_value(serde_json::to_value(value)?)?)
}

fn null_as_false<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<bool, D::Error> {
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserialize_tool() {
        let json = r#"{
            "name": "read_file",
            "description": "Read a file",
            "inputSchema": {"type": "object", "properties": {"path": {"type": "string"}}}
        }"#;
        let tool: Tool = serde_json::from_str(json).unwrap();
        assert_eq!(tool.name, "read_file");
        assert_eq!(tool.input_schema["type"], "object");
    }

    #[test]
    fn tool_without_schema() {
        let tool: Tool = serde_json::from_str(r#"{"name":"a"}"#).unwrap();
        assert_eq!(tool.input_schema, Value::Null);
        assert!(tool.description.is_none());
    }

    #[test]
    fn call_result_content_kinds() {
        let json = r#"{
            "content": [
                {"type": "text", "text": "one"},
                {"type": "image", "data": "AAAA", "mimeType": "image/png"},
                {"type": "text", "text": "two"},
                {"type": "hologram"}
            ],
            "isError": false
        }"#;
        let result: CallToolResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.content.len(), 4);
        assert_eq!(result.content[3], ToolContent::Unknown);
        assert_eq!(result.joined_text().as_deref(), Some("one\ntwo"));
    }

    #[test]
    fn call_result_null_error_flag() {
        let result: CallToolResult =
            serde_json::from_value(json!({"content": [], "isError": null})).unwrap();
        assert!(!result.is_error);
    }

    #[test]
    fn call_result_without_text() {
        let result = CallToolResult {
            structured_content: Some(json!({"sum": 4})),
            ..CallToolResult::default()
        };
        assert!(result.joined_text().is_none());
    }

    #[test]
    fn error_display() {
        let error = JsonRpcError {
            code: -32601,
            message: "no such method".into(),
            data: None,
        };
        assert_eq!(error.to_string(), "[-32601] no such method");
    }

    #[test]
    fn initialize_result_tolerates_sparse_fields() {
        let result: InitializeResult = serde_json::from_value(json!({
            "protocolVersion": "2025-06-18",
            "capabilities": {"tools": {"listChanged": null}},
            "serverInfo": {"name": "calc", "version": "1.0"}
        }))
        .unwrap();
        assert_eq!(result.server_info.name, "calc");
        assert!(result.capabilities.tools.is_some());
    }
}
