use super::errors::ModelError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::future::Future;
use tokio::sync::mpsc;

/// The role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl From<storage::Role> for Role {
    fn from(role: storage::Role) -> Self {
        match role {
            storage::Role::User => Role::User,
            storage::Role::Assistant => Role::Assistant,
            storage::Role::Tool => Role::Tool,
        }
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

/// A message as the model sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// For tool messages, which tool produced the content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_name: None,
        }
    }
}

/// Stored messages map one-to-one onto model messages, so a persisted
/// conversation replays into exactly the input the model saw.
impl From<&storage::Message> for Message {
    fn from(message: &storage::Message) -> Self {
        let role = Role::from(message.role);
        let tool_name = match role {
            Role::Tool => message.tool_results.first().map(|r| r.name.clone()),
            _ => None,
        };
        Self {
            role,
            content: message.content.clone(),
            tool_calls: message
                .tool_calls
                .iter()
                .map(|call| ToolCall {
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                })
                .collect(),
            tool_name,
        }
    }
}

/// A tool definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub schema: Value,
}

/// Schema offered for tools that did not advertise a usable one.
pub fn default_tool_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "query": {
                "type": "string",
                "description": "The query or input for the tool"
            },
            "parameters": {
                "type": "object",
                "description": "Additional parameters for the tool"
            }
        },
        "required": ["query"]
    })
}

/// Everything needed for a model request.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    /// Ask the provider to run its reasoning phase.
    pub think: bool,
}

/// One increment of a streamed completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamChunk {
    /// Newly generated text, if any.
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl StreamChunk {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_call(name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            content: None,
            tool_calls: vec![ToolCall {
                name: name.into(),
                arguments,
            }],
        }
    }
}

/// Receiving end of a streamed completion. The sender closing ends the stream.
pub type ChunkStream = mpsc::Receiver<Result<StreamChunk, ModelError>>;

/// Trait for streaming chat completion backends.
pub trait Backend: Send + Sync {
    fn stream(
        &self,
        request: ModelRequest,
    ) -> impl Future<Output = Result<ChunkStream, ModelError>> + Send;
}
