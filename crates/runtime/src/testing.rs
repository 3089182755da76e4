//! In-process stand-ins for tool servers and the model backend.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use mcp::{CallToolResult, ServerDescriptor, Tool};
use serde_json::{Map, Value, json};
use tokio::sync::{Notify, mpsc};

use crate::model::{Backend, ChunkStream, ModelError, ModelRequest, StreamChunk};
use crate::tools::{Connector, ToolSession};

/// Behaviour of one scripted server.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeServer {
    tools: Vec<Tool>,
    fail_connect: bool,
    fail_list: bool,
    gate: Option<Arc<Notify>>,
}

impl FakeServer {
    /// Offers `add` (sums `a` and `b`), `crash` (drops the transport) and
    /// `explode` (tool-level failure).
    pub(crate) fn calculator() -> Self {
        Self {
            tools: vec![
                tool("add", "Add two numbers"),
                tool("crash", "Exit the server"),
                tool("explode", "Always fails"),
            ],
            ..Self::default()
        }
    }

    /// Adds `park`, which answers only once `gate` is notified.
    pub(crate) fn parking(mut self, gate: Arc<Notify>) -> Self {
        self.tools.push(tool("park", "Wait for release"));
        self.gate = Some(gate);
        self
    }

    pub(crate) fn failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    pub(crate) fn failing_list(mut self) -> Self {
        self.fail_list = true;
        self
    }
}

fn tool(name: &str, description: &str) -> Tool {
    Tool {
        name: name.into(),
        description: Some(description.into()),
        input_schema: json!({
            "type": "object",
            "properties": {"a": {"type": "number"}, "b": {"type": "number"}}
        }),
    }
}

pub(crate) type CallLog = Arc<Mutex<Vec<(String, String)>>>;
pub(crate) type CloseLog = Arc<Mutex<Vec<String>>>;

#[derive(Default)]
pub(crate) struct FakeConnector {
    servers: HashMap<String, FakeServer>,
    calls: CallLog,
    closed: CloseLog,
}

impl FakeConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn server(mut self, name: &str, server: FakeServer) -> Self {
        self.servers.insert(name.to_string(), server);
        self
    }

    /// (server, local tool name) of every call that reached a session.
    pub(crate) fn calls(&self) -> CallLog {
        Arc::clone(&self.calls)
    }

    /// Names of sessions closed so far.
    pub(crate) fn closed(&self) -> CloseLog {
        Arc::clone(&self.closed)
    }
}

impl Connector for FakeConnector {
    type Session = FakeSession;

    async fn connect(&self, descriptor: &ServerDescriptor) -> mcp::Result<FakeSession> {
        let server = self
            .servers
            .get(&descriptor.name)
            .ok_or_else(|| mcp::Error::Config(format!("no server named {}", descriptor.name)))?;
        if server.fail_connect {
            return Err(mcp::Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }
        Ok(FakeSession {
            name: descriptor.name.clone(),
            server: server.clone(),
            calls: Arc::clone(&self.calls),
            closed: Arc::clone(&self.closed),
        })
    }
}

pub(crate) struct FakeSession {
    name: String,
    server: FakeServer,
    calls: CallLog,
    closed: CloseLog,
}

impl ToolSession for FakeSession {
    async fn list_tools(&self) -> mcp::Result<Vec<Tool>> {
        if self.server.fail_list {
            return Err(mcp::Error::Timeout);
        }
        Ok(self.server.tools.clone())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> mcp::Result<CallToolResult> {
        self.calls
            .lock()
            .unwrap()
            .push((self.name.clone(), name.to_string()));
        match name {
            "add" => {
                let operand = |key: &str| arguments.get(key).and_then(Value::as_i64).unwrap_or(0);
                Ok(CallToolResult::text((operand("a") + operand("b")).to_string()))
            }
            "park" => {
                if let Some(gate) = &self.server.gate {
                    gate.notified().await;
                }
                Ok(CallToolResult::text("released"))
            }
            "explode" => Err(mcp::Error::ToolCallFailed("kaboom".into())),
            "crash" => Err(mcp::Error::Closed),
            other => Err(mcp::Error::ToolCallFailed(format!("unknown tool {other}"))),
        }
    }

    async fn close(&self) {
        self.closed.lock().unwrap().push(self.name.clone());
    }

    fn session_id(&self) -> Option<String> {
        Some(format!("fake-{}", self.name))
    }
}

type Round = Vec<Result<StreamChunk, ModelError>>;

/// Replays scripted rounds, one per `stream` call, and records every request.
/// Once the script runs out each round answers with plain text.
pub(crate) struct FakeBackend {
    rounds: Mutex<VecDeque<Round>>,
    requests: Arc<Mutex<Vec<ModelRequest>>>,
}

impl FakeBackend {
    pub(crate) fn new(rounds: Vec<Round>) -> Self {
        Self {
            rounds: Mutex::new(rounds.into()),
            requests: Arc::default(),
        }
    }

    pub(crate) fn requests(&self) -> Arc<Mutex<Vec<ModelRequest>>> {
        Arc::clone(&self.requests)
    }
}

impl Backend for FakeBackend {
    async fn stream(&self, request: ModelRequest) -> Result<ChunkStream, ModelError> {
        self.requests.lock().unwrap().push(request);
        let round = self
            .rounds
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| vec![Ok(StreamChunk::text("ok"))]);
        let (tx, rx) = mpsc::channel(round.len().max(1));
        for chunk in round {
            let _ = tx.try_send(chunk);
        }
        Ok(rx)
    }
}
