//! Per-user pools of live tool-server connections.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use mcp::{CallToolResult, ConnectOptions, ServerDescriptor};
use serde_json::{Map, Value};
use storage::{ToolCatalogStore, ToolDescriptor, UserId};
use tokio::sync::RwLock;

use super::session::{Connector, McpConnector, ToolSession};
use super::types::{
    ConnectedServer, ConnectionResult, ConnectionStatus, LiveTool, ServerOutcome, ToolOutcome,
};
use crate::error::{Error, Result};

/// One open connection owned by the manager.
pub struct LiveConnection<T> {
    server_name: String,
    user_id: UserId,
    session_id: String,
    connected_at: DateTime<Utc>,
    // Calls share the read side; close takes the write side and clears it.
    handle: RwLock<Option<T>>,
    tools: RwLock<Vec<LiveTool>>,
}

impl<T: ToolSession> LiveConnection<T> {
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub async fn tools(&self) -> Vec<LiveTool> {
        self.tools.read().await.clone()
    }

    async fn find_tool(&self, name: &str) -> Option<LiveTool> {
        self.tools
            .read()
            .await
            .iter()
            .find(|t| t.matches(&self.server_name, name))
            .cloned()
    }

    async fn call(&self, local_name: &str, arguments: Map<String, Value>) -> mcp::Result<CallToolResult> {
        let handle = self.handle.read().await;
        let session = handle.as_ref().ok_or(mcp::Error::Closed)?;
        session.call_tool(local_name, arguments).await
    }

    async fn close(&self) {
        if let Some(session) = self.handle.write().await.take() {
            session.close().await;
        }
    }
}

type UserPool<T> = RwLock<HashMap<String, Arc<LiveConnection<T>>>>;

/// Owns every user's live connections and routes tool calls into them.
///
/// Connections are keyed by (user, server name); users never share one.
/// Discovered tools are written through to the catalog store so the
/// orchestrator can offer them to the model.
pub struct ConnectionManager<S, C: Connector = McpConnector> {
    store: Arc<S>,
    connector: C,
    pools: RwLock<HashMap<UserId, Arc<UserPool<C::Session>>>>,
}

impl<S: ToolCatalogStore> ConnectionManager<S, McpConnector> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_connector(store, McpConnector)
    }
}

impl<S: ToolCatalogStore, C: Connector> ConnectionManager<S, C> {
    pub fn with_connector(store: Arc<S>, connector: C) -> Self {
        Self {
            store,
            connector,
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Connect every descriptor for `user_id`, concurrently.
    ///
    /// One server failing does not affect the others; outcomes are reported
    /// in descriptor order.
    pub async fn connect(
        &self,
        user_id: UserId,
        descriptors: &[ServerDescriptor],
    ) -> ConnectionResult {
        let attempts = descriptors.iter().map(|d| self.connect_one(user_id, d));
        let outcomes = join_all(attempts).await;
        let result = ConnectionResult::from_outcomes(outcomes);
        tracing::info!(
            user = %user_id,
            connected = result.connected_servers.len(),
            failed = result.errors.len(),
            "connect finished"
        );
        result
    }

    /// Resolve connection intents, then connect the resulting servers.
    pub async fn connect_with_options(
        &self,
        user_id: UserId,
        options: &ConnectOptions,
    ) -> ConnectionResult {
        let resolution = mcp::registry::resolve(options);
        let mut result = self.connect(user_id, &resolution.descriptors).await;
        if !resolution.errors.is_empty() {
            let mut errors = resolution.errors;
            errors.append(&mut result.errors);
            result.errors = errors;
        }
        result
    }

    async fn connect_one(&self, user_id: UserId, descriptor: &ServerDescriptor) -> ServerOutcome {
        let server = descriptor.name.clone();
        match self.establish(user_id, descriptor).await {
            Ok(tools) => ServerOutcome {
                server,
                tools,
                error: None,
            },
            Err(e) => {
                tracing::warn!(user = %user_id, server = %server, error = %e, "connect failed");
                ServerOutcome {
                    error: Some(format!("Error connecting to {server}: {e}")),
                    server,
                    tools: 0,
                }
            }
        }
    }

    async fn establish(&self, user_id: UserId, descriptor: &ServerDescriptor) -> Result<usize> {
        let name = descriptor.name.as_str();
        let session = self.connector.connect(descriptor).await?;

        let mut tools: Vec<LiveTool> = match session.list_tools().await {
            Ok(tools) => tools
                .into_iter()
                .map(|tool| LiveTool::discovered(name, tool))
                .collect(),
            Err(e) => {
                tracing::warn!(server = name, error = %e, "tool discovery failed, registering placeholder");
                vec![LiveTool::placeholder(name)]
            }
        };

        let session_id = session
            .session_id()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let record = match self.persist(user_id, name, &session_id, &mut tools).await {
            Ok(record) => record,
            Err(e) => {
                session.close().await;
                return Err(e);
            }
        };

        let tool_count = tools.len();
        let connection = Arc::new(LiveConnection {
            server_name: name.to_string(),
            user_id,
            session_id,
            connected_at: record,
            handle: RwLock::new(Some(session)),
            tools: RwLock::new(tools),
        });

        // The outer map stays locked until the insert lands, so a concurrent
        // disconnect_all either drains this connection or never saw the pool.
        let previous = {
            let mut pools = self.pools.write().await;
            let pool = pools
                .entry(user_id)
                .or_insert_with(|| Arc::new(RwLock::new(HashMap::new())))
                .clone();
            let mut pool = pool.write().await;
            pool.insert(name.to_string(), connection)
        };
        if let Some(previous) = previous {
            tracing::debug!(server = name, "replacing existing connection");
            previous.close().await;
        }

        tracing::info!(user = %user_id, server = name, tools = tool_count, "server connected");
        Ok(tool_count)
    }

    /// Write the session record and catalog rows, adopting stored enabled flags.
    async fn persist(
        &self,
        user_id: UserId,
        server: &str,
        session_id: &str,
        tools: &mut [LiveTool],
    ) -> Result<DateTime<Utc>> {
        let record = self
            .store
            .upsert_server_session(user_id, server, session_id)
            .await?;
        for tool in tools.iter_mut() {
            let stored = self
                .store
                .upsert_tool(&ToolDescriptor {
                    user_id,
                    qualified_name: tool.name.clone(),
                    description: tool.description.clone(),
                    input_schema: schema_for_store(&tool.input_schema),
                    enabled: tool.enabled,
                })
                .await?;
            tool.enabled = stored.enabled;
        }
        Ok(record.connected_at)
    }

    /// Route a call to the user's connection for `server`.
    ///
    /// With no server, the first live connection (by name) that has an
    /// enabled tool called `tool_name` is used.
    pub async fn call_tool(
        &self,
        user_id: UserId,
        server: Option<&str>,
        tool_name: &str,
        arguments: Map<String, Value>,
    ) -> ToolOutcome {
        let (connection, tool) = match server {
            Some(server) => {
                let Some(connection) = self.connection(user_id, server).await else {
                    return ToolOutcome::Error(format!(
                        "Server {server} is not connected for user {user_id}"
                    ));
                };
                let tool = connection.find_tool(tool_name).await;
                match tool {
                    Some(tool) if tool.enabled => (connection, tool),
                    _ => {
                        return ToolOutcome::Error(format!(
                            "Tool {tool_name} not found or not enabled on server {server}"
                        ));
                    }
                }
            }
            None => match self.find_by_tool(user_id, tool_name).await {
                Some(found) => found,
                None => {
                    return ToolOutcome::Error(format!(
                        "Tool {tool_name} not found on any connected server"
                    ));
                }
            },
        };

        tracing::debug!(user = %user_id, tool = %tool.name, "calling tool");
        match connection.call(&tool.local_name, arguments).await {
            Ok(result) => ToolOutcome::Success(result),
            Err(e) => {
                tracing::error!(user = %user_id, tool = %tool.name, error = %e, "tool call failed");
                if e.is_disconnect() {
                    self.evict(&connection).await;
                }
                ToolOutcome::Error(e.to_string())
            }
        }
    }

    /// Close and forget one server. Returns whether a live connection existed.
    pub async fn disconnect(&self, user_id: UserId, server: &str) -> bool {
        let removed = match self.pool(user_id).await {
            Some(pool) => {
                let mut pool = pool.write().await;
                pool.remove(server)
            }
            None => None,
        };
        let existed = removed.is_some();
        if let Some(connection) = removed {
            connection.close().await;
            tracing::info!(user = %user_id, server, "server disconnected");
        }
        if let Err(e) = self.store.remove_server_session(user_id, server).await {
            tracing::warn!(user = %user_id, server, error = %e, "failed to remove session record");
        }
        existed
    }

    /// Close and forget every server of a user. Returns the names closed.
    pub async fn disconnect_all(&self, user_id: UserId) -> Vec<String> {
        let pool = self.pools.write().await.remove(&user_id);
        let connections: Vec<_> = match pool {
            Some(pool) => {
                let mut pool = pool.write().await;
                let drained: Vec<_> = pool.drain().map(|(_, c)| c).collect();
                drained
            }
            None => Vec::new(),
        };
        join_all(connections.iter().map(|c| c.close())).await;

        let mut names: Vec<String> = connections.iter().map(|c| c.server_name.clone()).collect();
        names.sort();

        match self.store.find_server_sessions(user_id).await {
            Ok(sessions) => {
                for session in sessions {
                    if let Err(e) = self
                        .store
                        .remove_server_session(user_id, &session.server_name)
                        .await
                    {
                        tracing::warn!(user = %user_id, server = %session.server_name, error = %e, "failed to remove session record");
                    }
                }
            }
            Err(e) => tracing::warn!(user = %user_id, error = %e, "failed to list session records"),
        }
        names
    }

    /// Enable or disable one tool in the live catalog and the store.
    pub async fn toggle_tool(
        &self,
        user_id: UserId,
        server: &str,
        tool_name: &str,
        enabled: bool,
    ) -> Result<()> {
        let connection =
            self.connection(user_id, server)
                .await
                .ok_or_else(|| Error::NotConnected {
                    server: server.to_string(),
                })?;

        let qualified = {
            let mut tools = connection.tools.write().await;
            let tool = tools
                .iter_mut()
                .find(|t| t.matches(server, tool_name))
                .ok_or_else(|| Error::ToolNotFound {
                    server: server.to_string(),
                    tool: tool_name.to_string(),
                })?;
            tool.enabled = enabled;
            tool.name.clone()
        };

        self.store
            .set_tool_enabled(user_id, &qualified, enabled)
            .await?;
        Ok(())
    }

    /// Live catalog of one server; empty when not connected.
    pub async fn get_tools(&self, user_id: UserId, server: &str) -> Vec<LiveTool> {
        match self.connection(user_id, server).await {
            Some(connection) => connection.tools().await,
            None => Vec::new(),
        }
    }

    pub async fn connection_status(&self, user_id: UserId) -> ConnectionStatus {
        let connections = self.connections(user_id).await;
        let mut total_tools = 0;
        for connection in &connections {
            total_tools += connection.tools.read().await.len();
        }
        ConnectionStatus {
            total_connected: connections.len(),
            servers: connections
                .iter()
                .map(|c| c.server_name.clone())
                .collect(),
            total_tools,
        }
    }

    /// Every server with a session record, annotated with live state.
    pub async fn connected_servers(&self, user_id: UserId) -> Result<Vec<ConnectedServer>> {
        let sessions = self.store.find_server_sessions(user_id).await?;
        let mut servers = Vec::with_capacity(sessions.len());
        for session in sessions {
            let live = self.connection(user_id, &session.server_name).await;
            let tool_count = match &live {
                Some(connection) => connection.tools.read().await.len(),
                None => 0,
            };
            servers.push(ConnectedServer {
                name: session.server_name,
                session_id: session.session_id,
                connected_at: session.connected_at,
                tool_count,
                live: live.is_some(),
            });
        }
        Ok(servers)
    }

    pub async fn is_connected(&self, user_id: UserId, server: &str) -> bool {
        self.connection(user_id, server).await.is_some()
    }

    /// A user's live connections, ordered by server name.
    pub async fn connections(&self, user_id: UserId) -> Vec<Arc<LiveConnection<C::Session>>> {
        let Some(pool) = self.pool(user_id).await else {
            return Vec::new();
        };
        let mut connections: Vec<_> = pool.read().await.values().cloned().collect();
        connections.sort_by(|a, b| a.server_name.cmp(&b.server_name));
        connections
    }

    pub async fn connection(
        &self,
        user_id: UserId,
        server: &str,
    ) -> Option<Arc<LiveConnection<C::Session>>> {
        let pool = self.pool(user_id).await?;
        let connection = pool.read().await.get(server).cloned();
        connection
    }

    // --- Internal methods ---

    async fn pool(&self, user_id: UserId) -> Option<Arc<UserPool<C::Session>>> {
        self.pools.read().await.get(&user_id).cloned()
    }

    async fn find_by_tool(
        &self,
        user_id: UserId,
        tool_name: &str,
    ) -> Option<(Arc<LiveConnection<C::Session>>, LiveTool)> {
        for connection in self.connections(user_id).await {
            let tool = connection
                .tools
                .read()
                .await
                .iter()
                .find(|t| t.enabled && t.local_name == tool_name)
                .cloned();
            if let Some(tool) = tool {
                return Some((connection, tool));
            }
        }
        None
    }

    /// Drop a connection whose transport has gone away. The session record
    /// stays; only an explicit disconnect removes it.
    async fn evict(&self, connection: &Arc<LiveConnection<C::Session>>) {
        let Some(pool) = self.pool(connection.user_id).await else {
            return;
        };
        {
            let mut pool = pool.write().await;
            let current = pool
                .get(&connection.server_name)
                .is_some_and(|c| Arc::ptr_eq(c, connection));
            if !current {
                return;
            }
            pool.remove(&connection.server_name);
        }
        tracing::warn!(user = %connection.user_id, server = %connection.server_name, "evicting dropped connection");
        connection.close().await;
    }
}

/// Empty or missing schemas are stored as absent.
fn schema_for_store(schema: &Value) -> Option<Value> {
    match schema {
        Value::Null => None,
        Value::Object(map) if map.is_empty() => None,
        other => Some(other.clone()),
    }
}
