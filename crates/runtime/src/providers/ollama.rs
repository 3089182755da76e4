//! Ollama chat API backend (`POST /api/chat`, newline-delimited JSON stream).

use crate::model::{
    Backend, ChunkStream, Message, ModelError, ModelRequest, Role, StreamChunk, ToolCall, ToolSpec,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

pub const DEFAULT_HOST: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "llama3.2:latest";

const CHANNEL_CAPACITY: usize = 100;

// ─────────────────────────────────────────────────────────────────────────────
// API Wire Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool>,
    stream: bool,
    think: bool,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<ApiToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    function: ApiFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunctionCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Serialize)]
struct ApiTool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: ApiFunction,
}

#[derive(Debug, Serialize)]
struct ApiFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct ApiChunk {
    #[serde(default)]
    message: Option<ApiChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiChunkMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<ApiToolCall>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend Implementation
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for creating an Ollama backend.
#[derive(Debug, Clone)]
pub struct OllamaBackendBuilder {
    host: String,
}

impl OllamaBackendBuilder {
    pub fn new() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn build(self) -> OllamaBackend {
        OllamaBackend {
            client: reqwest::Client::new(),
            host: self.host.trim_end_matches('/').to_string(),
        }
    }
}

impl Default for OllamaBackendBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A model installed on the Ollama host.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    /// Size on disk in bytes.
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub modified_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiTags {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

/// Ollama API backend.
pub struct OllamaBackend {
    client: reqwest::Client,
    host: String,
}

impl OllamaBackend {
    pub fn builder() -> OllamaBackendBuilder {
        OllamaBackendBuilder::new()
    }

    /// Models installed on the host (`GET /api/tags`), sorted by name.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, ModelError> {
        let url = format!("{}/api/tags", self.host);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ModelError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Api(format!("{status}: {body}")));
        }

        let tags: ApiTags = response
            .json()
            .await
            .map_err(|e| ModelError::InvalidResponse(e.to_string()))?;
        let mut models = tags.models;
        models.sort_by(|a, b| a.name.cmp(&b.name));
        tracing::debug!(count = models.len(), "listed models");
        Ok(models)
    }

    fn role_to_api(role: Role) -> &'static str {
        match role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    fn message_to_api(msg: &Message) -> ApiMessage {
        ApiMessage {
            role: Self::role_to_api(msg.role),
            content: msg.content.clone(),
            tool_calls: msg
                .tool_calls
                .iter()
                .map(|call| ApiToolCall {
                    function: ApiFunctionCall {
                        name: call.name.clone(),
                        arguments: Value::Object(call.arguments.clone()),
                    },
                })
                .collect(),
            tool_name: msg.tool_name.clone(),
        }
    }

    fn tool_to_api(spec: &ToolSpec) -> ApiTool {
        ApiTool {
            tool_type: "function",
            function: ApiFunction {
                name: spec.name.clone(),
                description: spec.description.clone(),
                parameters: spec.schema.clone(),
            },
        }
    }

    fn request_to_api(request: ModelRequest) -> ApiRequest {
        ApiRequest {
            model: request.model,
            messages: request.messages.iter().map(Self::message_to_api).collect(),
            tools: request.tools.iter().map(Self::tool_to_api).collect(),
            stream: true,
            think: request.think,
        }
    }
}

impl std::fmt::Display for OllamaBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ollama({})", self.host)
    }
}

/// Incremental decoder for the newline-delimited response body.
#[derive(Debug, Default)]
struct ChatStreamDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl ChatStreamDecoder {
    /// Append bytes and decode every line completed by them.
    fn push(&mut self, bytes: &[u8]) -> Vec<Result<StreamChunk, ModelError>> {
        self.buffer.extend_from_slice(bytes);
        let mut items = Vec::new();
        while let Some(newline_pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            items.extend(self.line(&String::from_utf8_lossy(&line_bytes)));
        }
        items
    }

    /// Decode a final line without a trailing newline. A body that ends
    /// before the `done` chunk is reported as a stream error.
    fn finish(mut self) -> Vec<Result<StreamChunk, ModelError>> {
        let rest = std::mem::take(&mut self.buffer);
        let mut items: Vec<_> = self.line(&String::from_utf8_lossy(&rest)).into_iter().collect();
        if !self.done && !items.iter().any(Result::is_err) {
            items.push(Err(ModelError::Stream("stream ended before done".into())));
        }
        items
    }

    /// Decode one line of the response stream.
    ///
    /// Blank lines yield `None`. Tool-call arguments that are not a JSON object
    /// (some models send a JSON string) are parsed or wrapped as `{"value": ..}`.
    fn line(&mut self, line: &str) -> Option<Result<StreamChunk, ModelError>> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let chunk: ApiChunk = match serde_json::from_str(line) {
            Ok(chunk) => chunk,
            Err(e) => return Some(Err(ModelError::InvalidResponse(e.to_string()))),
        };
        if let Some(error) = chunk.error {
            return Some(Err(ModelError::Api(error)));
        }
        self.done |= chunk.done;
        let message = chunk.message?;
        let content = (!message.content.is_empty()).then_some(message.content);
        let tool_calls: Vec<ToolCall> = message
            .tool_calls
            .into_iter()
            .map(|call| ToolCall {
                name: call.function.name,
                arguments: arguments_to_map(call.function.arguments),
            })
            .collect();
        if content.is_none() && tool_calls.is_empty() && chunk.done {
            return None;
        }
        Some(Ok(StreamChunk {
            content,
            tool_calls,
        }))
    }
}

fn arguments_to_map(arguments: Value) -> Map<String, Value> {
    match arguments {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        Value::String(raw) => match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => map,
            _ => Map::from_iter([("value".to_string(), Value::String(raw))]),
        },
        other => Map::from_iter([("value".to_string(), other)]),
    }
}

impl Backend for OllamaBackend {
    async fn stream(&self, request: ModelRequest) -> Result<ChunkStream, ModelError> {
        let url = format!("{}/api/chat", self.host);
        let api_request = Self::request_to_api(request);

        tracing::debug!(model = %api_request.model, messages = api_request.messages.len(), "sending chat request");

        let response = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| ModelError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Api(format!("{status}: {body}")));
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut decoder = ChatStreamDecoder::default();

            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(Err(ModelError::Stream(e.to_string()))).await;
                        return;
                    }
                };
                for item in decoder.push(&bytes) {
                    let failed = item.is_err();
                    if tx.send(item).await.is_err() || failed {
                        return;
                    }
                }
            }

            for item in decoder.finish() {
                if tx.send(item).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }
}
