//! The chat turn state machine.
//!
//! A turn streams one model round, runs whatever tools the model asked for,
//! feeds the results back and repeats until the model answers without tool
//! calls. Everything the model sees is persisted before the next round, so a
//! stored conversation replays into the same input.

use std::sync::Arc;

use serde_json::Value;
use storage::{
    Conversation, ConversationId, MessageStore, ToolCallRecord, ToolCatalogStore,
    ToolResultRecord, UserId,
};
use tokio::sync::mpsc;

use super::events::{ChatEvent, ChatEventKind};
use crate::error::{Error, Result};
use crate::model::{
    Backend, Message as ModelMessage, ModelRequest, ToolCall, ToolSpec, default_tool_schema,
};
use crate::providers::DEFAULT_MODEL;
use crate::tools::{ConnectionManager, Connector, McpConnector, QualifiedName, ToolOutcome};

const EVENT_BUFFER: usize = 100;

/// Characters of the first message used as a new conversation's title.
const TITLE_CHARS: usize = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Model used when a request does not name one.
    pub default_model: String,
    pub think: bool,
    /// Rounds with tool calls allowed before the turn is abandoned.
    pub max_tool_rounds: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_model: DEFAULT_MODEL.to_string(),
            think: false,
            max_tool_rounds: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub user_id: UserId,
    /// Continue this conversation; a new one is created when absent.
    pub conversation_id: Option<ConversationId>,
    pub message: String,
    pub model: Option<String>,
}

impl ChatRequest {
    pub fn new(user_id: UserId, message: impl Into<String>) -> Self {
        Self {
            user_id,
            conversation_id: None,
            message: message.into(),
            model: None,
        }
    }

    pub fn in_conversation(mut self, id: ConversationId) -> Self {
        self.conversation_id = Some(id);
        self
    }
}

/// Drives chat turns against a backend, a store and the user's tool servers.
pub struct Orchestrator<B, S, C: Connector = McpConnector> {
    backend: B,
    store: Arc<S>,
    tools: Arc<ConnectionManager<S, C>>,
    config: OrchestratorConfig,
}

impl<B, S, C> Orchestrator<B, S, C>
where
    B: Backend + 'static,
    S: MessageStore + ToolCatalogStore + 'static,
    C: Connector,
{
    pub fn new(
        backend: B,
        store: Arc<S>,
        tools: Arc<ConnectionManager<S, C>>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            backend,
            store,
            tools,
            config,
        }
    }

    pub fn tools(&self) -> &Arc<ConnectionManager<S, C>> {
        &self.tools
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run one turn in the background and return its event stream.
    ///
    /// The stream ends after a `done` event, or after a fatal `error` event.
    /// Dropping the receiver stops the turn once the current round's tool
    /// calls have finished and been persisted.
    pub fn stream_chat(self: &Arc<Self>, request: ChatRequest) -> mpsc::Receiver<ChatEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let sink = EventSink { tx };
            if let Err(e) = this.run(request, &sink).await {
                tracing::error!(error = %e, "chat turn failed");
                sink.emit(ChatEventKind::Error {
                    message: e.to_string(),
                    fatal: true,
                })
                .await;
            }
        });
        rx
    }

    async fn run(&self, request: ChatRequest, sink: &EventSink) -> Result<()> {
        let ChatRequest {
            user_id,
            conversation_id,
            message,
            model,
        } = request;

        let conversation = self
            .resolve_conversation(user_id, conversation_id, &message)
            .await?;
        let mut transcript: Vec<ModelMessage> = self
            .store
            .find_messages(conversation.id)
            .await?
            .iter()
            .map(ModelMessage::from)
            .collect();

        let user_message = storage::Message::user(conversation.id, message);
        self.store.append_message(&user_message).await?;
        transcript.push(ModelMessage::from(&user_message));

        let tools = self.tool_specs(user_id).await?;
        let model = model.unwrap_or_else(|| self.config.default_model.clone());
        tracing::debug!(conversation = %conversation.id, %model, tools = tools.len(), "starting turn");

        let mut rounds = 0;
        loop {
            let request = ModelRequest {
                model: model.clone(),
                messages: transcript.clone(),
                tools: tools.clone(),
                think: self.config.think,
            };
            let (text, calls) = self.stream_round(request, sink).await?;

            if calls.is_empty() {
                let reply = storage::Message::assistant(conversation.id, text);
                self.store.append_message(&reply).await?;
                sink.emit(ChatEventKind::Done {
                    conversation_id: conversation.id,
                })
                .await;
                return Ok(());
            }

            rounds += 1;
            if rounds > self.config.max_tool_rounds {
                return Err(Error::RoundLimit(self.config.max_tool_rounds));
            }

            let mut call_records = Vec::with_capacity(calls.len());
            let mut result_records = Vec::with_capacity(calls.len());
            for call in calls {
                let record = self.execute_tool(user_id, &call, sink).await;

                let tool_message = storage::Message::tool(conversation.id, record.clone());
                self.store.append_message(&tool_message).await?;
                transcript.push(ModelMessage::from(&tool_message));

                sink.emit(ChatEventKind::ToolResult {
                    name: record.name.clone(),
                    arguments: record.arguments.clone(),
                    content: record.result.clone(),
                    is_error: record.error.is_some(),
                })
                .await;

                call_records.push(ToolCallRecord {
                    name: call.name,
                    arguments: call.arguments,
                });
                result_records.push(record);
            }

            let assistant = storage::Message::assistant_with_tools(
                conversation.id,
                text,
                call_records,
                result_records,
            );
            self.store.append_message(&assistant).await?;
            transcript.push(ModelMessage::from(&assistant));

            if sink.is_closed() {
                tracing::debug!(conversation = %conversation.id, "receiver dropped, ending turn");
                return Ok(());
            }
        }
    }

    async fn resolve_conversation(
        &self,
        user_id: UserId,
        id: Option<ConversationId>,
        first_message: &str,
    ) -> Result<Conversation> {
        if let Some(id) = id {
            match self.store.find_conversation(id).await? {
                Some(conversation) if conversation.user_id == user_id => return Ok(conversation),
                Some(_) => {
                    tracing::warn!(conversation = %id, user = %user_id, "conversation belongs to another user, starting a new one");
                }
                None => tracing::debug!(conversation = %id, "conversation not found, starting a new one"),
            }
        }
        let title: String = first_message.chars().take(TITLE_CHARS).collect();
        Ok(self.store.create_conversation(user_id, &title).await?)
    }

    async fn tool_specs(&self, user_id: UserId) -> Result<Vec<ToolSpec>> {
        let tools = self.store.find_enabled_tools(user_id).await?;
        Ok(tools
            .into_iter()
            .map(|tool| ToolSpec {
                name: tool.qualified_name,
                description: tool.description,
                schema: match tool.input_schema {
                    Some(Value::Object(schema)) if !schema.is_empty() => Value::Object(schema),
                    _ => default_tool_schema(),
                },
            })
            .collect())
    }

    /// Stream one completion, re-emitting the accumulated text after every
    /// fragment. Tool calls are collected and returned once the stream ends.
    async fn stream_round(
        &self,
        request: ModelRequest,
        sink: &EventSink,
    ) -> Result<(String, Vec<ToolCall>)> {
        let mut stream = self.backend.stream(request).await?;
        let mut text = String::new();
        let mut calls = Vec::new();

        while let Some(chunk) = stream.recv().await {
            let chunk = chunk?;
            if let Some(content) = chunk.content.filter(|c| !c.is_empty()) {
                text.push_str(&content);
                sink.emit(ChatEventKind::Message {
                    content: text.clone(),
                })
                .await;
            }
            calls.extend(chunk.tool_calls);
        }
        Ok((text, calls))
    }

    async fn execute_tool(
        &self,
        user_id: UserId,
        call: &ToolCall,
        sink: &EventSink,
    ) -> ToolResultRecord {
        sink.emit(ChatEventKind::ToolCall {
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        })
        .await;

        let name = QualifiedName::parse(&call.name);
        if let Some(server) = &name.server
            && !self.tools.is_connected(user_id, server).await
        {
            let message = format!("[ERROR] Unknown server for tool: {}", call.name);
            tracing::warn!(user = %user_id, tool = %call.name, "tool names an unconnected server");
            sink.emit(ChatEventKind::Error {
                message: message.clone(),
                fatal: false,
            })
            .await;
            return ToolResultRecord {
                name: call.name.clone(),
                arguments: call.arguments.clone(),
                result: message.clone(),
                error: Some(message),
            };
        }

        let outcome = self
            .tools
            .call_tool(
                user_id,
                name.server.as_deref(),
                &name.local,
                call.arguments.clone(),
            )
            .await;

        let (result, error) = match outcome {
            ToolOutcome::Success(result) => {
                let text = result.joined_text().unwrap_or_else(|| {
                    serde_json::to_string(&result).unwrap_or_default()
                });
                (text, None)
            }
            ToolOutcome::Error(e) => (
                format!("[ERROR] Failed to call tool '{}': {e}", call.name),
                Some(e),
            ),
        };
        ToolResultRecord {
            name: call.name.clone(),
            arguments: call.arguments.clone(),
            result,
            error,
        }
    }
}

/// Sending side of a turn's event stream.
struct EventSink {
    tx: mpsc::Sender<ChatEvent>,
}

impl EventSink {
    /// Send unless the receiver is gone.
    async fn emit(&self, kind: ChatEventKind) {
        if self.tx.is_closed() {
            return;
        }
        if self.tx.send(ChatEvent::new(kind)).await.is_err() {
            tracing::debug!("event receiver dropped");
        }
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelError, Role, StreamChunk};
    use crate::testing::{FakeBackend, FakeConnector, FakeServer};
    use mcp::{ServerDescriptor, TransportConfig};
    use serde_json::{Map, json};
    use storage::SqliteStore;

    type TestOrchestrator = Orchestrator<FakeBackend, SqliteStore, FakeConnector>;

    async fn orchestrator(
        backend: FakeBackend,
        connector: FakeConnector,
        servers: &[&str],
        user: UserId,
    ) -> Arc<TestOrchestrator> {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let manager = Arc::new(ConnectionManager::with_connector(
            Arc::clone(&store),
            connector,
        ));
        let descriptors: Vec<_> = servers
            .iter()
            .map(|name| ServerDescriptor {
                name: name.to_string(),
                transport: TransportConfig::Sse {
                    url: format!("http://{name}.test/sse"),
                },
            })
            .collect();
        manager.connect(user, &descriptors).await;
        Arc::new(Orchestrator::new(
            backend,
            store,
            manager,
            OrchestratorConfig::default(),
        ))
    }

    async fn collect(mut rx: mpsc::Receiver<ChatEvent>) -> Vec<ChatEventKind> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event.kind);
        }
        events
    }

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn add_call() -> StreamChunk {
        StreamChunk::tool_call("calc.add", args(json!({"a": 2, "b": 2})))
    }

    #[tokio::test]
    async fn tool_round_then_answer() {
        let user = UserId::new();
        let backend = FakeBackend::new(vec![
            vec![Ok(add_call())],
            vec![Ok(StreamChunk::text("2+2 ")), Ok(StreamChunk::text("is 4"))],
        ]);
        let requests = backend.requests();
        let orchestrator = orchestrator(
            backend,
            FakeConnector::new().server("calc", FakeServer::calculator()),
            &["calc"],
            user,
        )
        .await;

        let events = collect(orchestrator.stream_chat(ChatRequest::new(user, "what is 2+2?"))).await;

        assert_eq!(events.len(), 5);
        assert_eq!(
            events[0],
            ChatEventKind::ToolCall {
                name: "calc.add".into(),
                arguments: args(json!({"a": 2, "b": 2})),
            }
        );
        assert_eq!(
            events[1],
            ChatEventKind::ToolResult {
                name: "calc.add".into(),
                arguments: args(json!({"a": 2, "b": 2})),
                content: "4".into(),
                is_error: false,
            }
        );
        assert_eq!(events[2], ChatEventKind::Message { content: "2+2 ".into() });
        assert_eq!(events[3], ChatEventKind::Message { content: "2+2 is 4".into() });
        let ChatEventKind::Done { conversation_id } = events[4] else {
            panic!("expected done, got {:?}", events[4]);
        };

        let conversation = orchestrator
            .store
            .find_conversation(conversation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conversation.title, "what is 2+2?");
        // A round without tool calls ends the turn.
        assert_eq!(requests.lock().unwrap().len(), 2);
        assert_eq!(conversation.user_id, user);
    }

    #[tokio::test]
    async fn persisted_transcript_replays_model_input() {
        let user = UserId::new();
        let backend = FakeBackend::new(vec![
            vec![Ok(StreamChunk::text("adding")), Ok(add_call())],
            vec![Ok(StreamChunk::text("4"))],
        ]);
        let requests = backend.requests();
        let orchestrator = orchestrator(
            backend,
            FakeConnector::new().server("calc", FakeServer::calculator()),
            &["calc"],
            user,
        )
        .await;

        let events = collect(orchestrator.stream_chat(ChatRequest::new(user, "add 2 and 2"))).await;
        let Some(ChatEventKind::Done { conversation_id }) = events.last().cloned() else {
            panic!("turn did not finish: {events:?}");
        };

        let stored = orchestrator
            .store
            .find_messages(conversation_id)
            .await
            .unwrap();
        let roles: Vec<_> = stored.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            [
                storage::Role::User,
                storage::Role::Tool,
                storage::Role::Assistant,
                storage::Role::Assistant
            ]
        );
        assert_eq!(stored[2].tool_calls.len(), 1);
        assert_eq!(stored[2].tool_results[0].result, "4");
        assert_eq!(stored[3].content, "4");

        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        let replayed: Vec<ModelMessage> = stored[..3].iter().map(ModelMessage::from).collect();
        assert_eq!(requests[1].messages, replayed);
        assert_eq!(requests[0].tools.len(), 3);
        assert_eq!(requests[0].model, DEFAULT_MODEL);
    }

    #[tokio::test]
    async fn continuing_a_conversation_sends_history() {
        let user = UserId::new();
        let backend = FakeBackend::new(vec![
            vec![Ok(StreamChunk::text("hello"))],
            vec![Ok(StreamChunk::text("again"))],
        ]);
        let requests = backend.requests();
        let orchestrator = orchestrator(backend, FakeConnector::new(), &[], user).await;

        let first = collect(orchestrator.stream_chat(ChatRequest::new(user, "hi"))).await;
        let Some(ChatEventKind::Done { conversation_id }) = first.last().cloned() else {
            panic!("turn did not finish: {first:?}");
        };

        let second = collect(
            orchestrator.stream_chat(ChatRequest::new(user, "hi again").in_conversation(conversation_id)),
        )
        .await;
        assert_eq!(
            second.last(),
            Some(&ChatEventKind::Done { conversation_id })
        );

        let requests = requests.lock().unwrap();
        let roles: Vec<_> = requests[1].messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, [Role::User, Role::Assistant, Role::User]);
        assert!(requests[1].tools.is_empty());
    }

    #[tokio::test]
    async fn foreign_conversation_starts_fresh() {
        let (owner, intruder) = (UserId::new(), UserId::new());
        let orchestrator = orchestrator(FakeBackend::new(Vec::new()), FakeConnector::new(), &[], owner).await;
        let theirs = orchestrator
            .store
            .create_conversation(owner, "private")
            .await
            .unwrap();

        let events = collect(
            orchestrator.stream_chat(ChatRequest::new(intruder, "peek").in_conversation(theirs.id)),
        )
        .await;
        let Some(ChatEventKind::Done { conversation_id }) = events.last().cloned() else {
            panic!("turn did not finish: {events:?}");
        };
        assert_ne!(conversation_id, theirs.id);
        assert_eq!(
            orchestrator.store.find_messages(theirs.id).await.unwrap().len(),
            0
        );
    }

    #[tokio::test]
    async fn unknown_server_is_reported_and_loop_continues() {
        let user = UserId::new();
        let backend = FakeBackend::new(vec![
            vec![Ok(StreamChunk::tool_call("weather.today", Map::new()))],
            vec![Ok(StreamChunk::text("no weather"))],
        ]);
        let orchestrator = orchestrator(backend, FakeConnector::new(), &[], user).await;

        let events = collect(orchestrator.stream_chat(ChatRequest::new(user, "weather?"))).await;

        let expected = "[ERROR] Unknown server for tool: weather.today".to_string();
        assert_eq!(
            events[1],
            ChatEventKind::Error {
                message: expected.clone(),
                fatal: false,
            }
        );
        assert!(matches!(
            &events[2],
            ChatEventKind::ToolResult { content, is_error: true, .. } if *content == expected
        ));
        assert!(matches!(events.last(), Some(ChatEventKind::Done { .. })));
    }

    #[tokio::test]
    async fn failed_tool_becomes_error_text() {
        let user = UserId::new();
        let backend = FakeBackend::new(vec![
            vec![Ok(StreamChunk::tool_call("calc.explode", Map::new()))],
            vec![Ok(StreamChunk::text("sorry"))],
        ]);
        let orchestrator = orchestrator(
            backend,
            FakeConnector::new().server("calc", FakeServer::calculator()),
            &["calc"],
            user,
        )
        .await;

        let events = collect(orchestrator.stream_chat(ChatRequest::new(user, "boom"))).await;
        let ChatEventKind::ToolResult {
            content, is_error, ..
        } = &events[1]
        else {
            panic!("expected tool result, got {:?}", events[1]);
        };
        assert!(is_error);
        assert!(content.starts_with("[ERROR] Failed to call tool 'calc.explode': "));
        assert!(content.contains("kaboom"));
        assert!(matches!(events.last(), Some(ChatEventKind::Done { .. })));
    }

    #[tokio::test]
    async fn round_limit_is_fatal() {
        let user = UserId::new();
        let rounds = (0..11).map(|_| vec![Ok(add_call())]).collect();
        let backend = FakeBackend::new(rounds);
        let requests = backend.requests();
        let orchestrator = orchestrator(
            backend,
            FakeConnector::new().server("calc", FakeServer::calculator()),
            &["calc"],
            user,
        )
        .await;

        let events = collect(orchestrator.stream_chat(ChatRequest::new(user, "loop"))).await;

        assert!(matches!(
            events.last(),
            Some(ChatEventKind::Error { fatal: true, .. })
        ));
        assert!(!events.iter().any(|e| matches!(e, ChatEventKind::Done { .. })));
        assert_eq!(requests.lock().unwrap().len(), 11);
        let results = events
            .iter()
            .filter(|e| matches!(e, ChatEventKind::ToolResult { .. }))
            .count();
        assert_eq!(results, 10);
    }

    #[tokio::test]
    async fn backend_failure_is_fatal() {
        let user = UserId::new();
        let backend = FakeBackend::new(vec![vec![
            Ok(StreamChunk::text("par")),
            Err(ModelError::Stream("connection reset".into())),
        ]]);
        let orchestrator = orchestrator(backend, FakeConnector::new(), &[], user).await;

        let events = collect(orchestrator.stream_chat(ChatRequest::new(user, "hi"))).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], ChatEventKind::Message { content: "par".into() });
        assert!(matches!(
            &events[1],
            ChatEventKind::Error { message, fatal: true } if message.contains("connection reset")
        ));
    }

    #[tokio::test]
    async fn dropped_receiver_finishes_round_then_stops() {
        let user = UserId::new();
        let backend = FakeBackend::new(vec![
            vec![Ok(add_call()), Ok(add_call())],
            vec![Ok(StreamChunk::text("never sent"))],
        ]);
        let requests = backend.requests();
        let connector = FakeConnector::new().server("calc", FakeServer::calculator());
        let calls = connector.calls();
        let orchestrator = orchestrator(backend, connector, &["calc"], user).await;

        let rx = orchestrator.stream_chat(ChatRequest::new(user, "add twice"));
        drop(rx);

        let mut stored = Vec::new();
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            let conversations = orchestrator.store.find_conversations(user).await.unwrap();
            if let Some(conversation) = conversations.first() {
                stored = orchestrator
                    .store
                    .find_messages(conversation.id)
                    .await
                    .unwrap();
                if stored.len() == 4 {
                    break;
                }
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(calls.lock().unwrap().len(), 2);
        assert_eq!(requests.lock().unwrap().len(), 1);
        assert_eq!(stored.len(), 4);
        assert_eq!(stored[3].tool_results.len(), 2);
    }

    #[tokio::test]
    async fn tools_without_schema_get_default() {
        let user = UserId::new();
        let backend = FakeBackend::new(Vec::new());
        let requests = backend.requests();
        let orchestrator = orchestrator(
            backend,
            FakeConnector::new().server("weather", FakeServer::calculator().failing_list()),
            &["weather"],
            user,
        )
        .await;

        collect(orchestrator.stream_chat(ChatRequest::new(user, "hi"))).await;

        let requests = requests.lock().unwrap();
        assert_eq!(requests[0].tools.len(), 1);
        assert_eq!(requests[0].tools[0].name, "weather.example_tool");
        assert_eq!(requests[0].tools[0].schema, default_tool_schema());
    }

    #[test]
    fn title_is_truncated_by_characters() {
        let message = "é".repeat(80);
        let title: String = message.chars().take(TITLE_CHARS).collect();
        assert_eq!(title.chars().count(), 50);
    }
}
