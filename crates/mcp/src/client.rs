//! MCP client: handshake, tool discovery and tool calls over any transport.

use serde_json::{Map, Value};
use tokio::sync::{Mutex, OnceCell};
use tokio::time::timeout;

use rmcp::model::CallToolRequestParams;
use rmcp::service::{Peer, RoleClient};

use crate::error::{Error, Result};
use crate::protocol::{CallToolResult, InitializeResult, Tool, from_wire};
use crate::registry::ServerDescriptor;
use crate::transport::{DEFAULT_TIMEOUT, Service, Transport, TransportKind, check_size};

enum State {
    Idle,
    Connected(Service),
    Closed,
}

/// A client for exactly one tool server.
///
/// Constructing the client does no I/O; [`McpClient::connect`] opens the
/// transport and performs the `initialize` handshake.
pub struct McpClient {
    descriptor: ServerDescriptor,
    peer: OnceCell<Peer<RoleClient>>,
    server_info: OnceCell<InitializeResult>,
    session_id: OnceCell<Option<String>>,
    state: Mutex<State>,
}

impl McpClient {
    pub fn new(descriptor: ServerDescriptor) -> Self {
        Self {
            descriptor,
            peer: OnceCell::new(),
            server_info: OnceCell::new(),
            session_id: OnceCell::new(),
            state: Mutex::new(State::Idle),
        }
    }

    /// The server name this client was built for.
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn kind(&self) -> TransportKind {
        self.descriptor.transport.kind()
    }

    /// Open the transport and run the `initialize` handshake.
    pub async fn connect(&self) -> Result<&InitializeResult> {
        let mut state = self.state.lock().await;
        match *state {
            State::Connected(_) => return Err(Error::AlreadyConnected),
            State::Closed => return Err(Error::Closed),
            State::Idle => {}
        }

        let transport = match Transport::open(&self.descriptor.transport).await {
            Ok(transport) => transport,
            Err(e) => {
                *state = State::Closed;
                return Err(e);
            }
        };
        let session_id = transport.session_id();
        let service = match transport.serve().await {
            Ok(service) => service,
            Err(e) => {
                *state = State::Closed;
                return Err(e);
            }
        };

        let info = match service.peer_info().map(from_wire::<_, InitializeResult>) {
            Some(Ok(info)) => info,
            Some(Err(e)) => {
                *state = State::Closed;
                let _ = service.cancel().await;
                return Err(e);
            }
            None => {
                *state = State::Closed;
                let _ = service.cancel().await;
                return Err(Error::Initialize("server sent no initialize result".into()));
            }
        };
        tracing::info!(
            server = %self.descriptor.name,
            kind = %self.kind(),
            remote = %info.server_info.name,
            "connected"
        );

        let peer = service.peer().clone();
        self.peer.get_or_init(|| async { peer }).await;
        self.session_id.get_or_init(|| async { session_id }).await;
        *state = State::Connected(service);
        Ok(self.server_info.get_or_init(|| async { info }).await)
    }

    /// Server info from the handshake, once connected.
    pub fn server_info(&self) -> Option<&InitializeResult> {
        self.server_info.get()
    }

    /// List every tool the server advertises, following pagination cursors.
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        let peer = self.peer().await?;
        tracing::debug!(server = %self.descriptor.name, "tools/list");
        let tools = timeout(DEFAULT_TIMEOUT, peer.list_all_tools())
            .await
            .map_err(|_| Error::Timeout)??;
        tools.iter().map(|tool| from_wire(tool)).collect()
    }

    /// Call a tool by its unprefixed name.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<CallToolResult> {
        let peer = self.peer().await?;
        let params = CallToolRequestParams {
            name: name.to_string().into(),
            arguments,
            meta: None,
            task: None,
        };
        tracing::debug!(server = %self.descriptor.name, tool = name, "tools/call");
        let result = timeout(DEFAULT_TIMEOUT, peer.call_tool(params))
            .await
            .map_err(|_| Error::Timeout)??;

        check_size(serde_json::to_vec(&result)?.len())?;
        let result: CallToolResult = from_wire(&result)?;
        if result.is_error {
            let error_text = result.joined_text().unwrap_or_default();
            return Err(Error::ToolCallFailed(error_text));
        }
        Ok(result)
    }

    /// Close the connection. Errors are logged, never returned; repeated
    /// calls do nothing.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        let previous = std::mem::replace(&mut *state, State::Closed);
        if let State::Connected(service) = previous {
            match service.cancel().await {
                Ok(reason) => {
                    tracing::info!(server = %self.descriptor.name, ?reason, "disconnected");
                }
                Err(e) => {
                    tracing::warn!(server = %self.descriptor.name, error = %e, "error closing connection");
                }
            }
        }
    }

    /// Transport-level session id; only SSE servers announce one.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.get().cloned().flatten()
    }

    async fn peer(&self) -> Result<Peer<RoleClient>> {
        match *self.state.lock().await {
            State::Idle => return Err(Error::NotConnected),
            State::Closed => return Err(Error::Closed),
            State::Connected(_) => {}
        }
        self.peer.get().cloned().ok_or(Error::NotConnected)
    }
}
