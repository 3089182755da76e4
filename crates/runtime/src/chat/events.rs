//! Events streamed to the caller while a turn runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use storage::ConversationId;

/// One timestamped event of a chat turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: ChatEventKind,
}

impl ChatEvent {
    pub fn new(kind: ChatEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Whether this event ends the turn.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            ChatEventKind::Done { .. } | ChatEventKind::Error { fatal: true, .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEventKind {
    /// Everything the model has said so far this round, not a delta.
    Message { content: String },
    ToolCall {
        name: String,
        arguments: Map<String, Value>,
    },
    ToolResult {
        name: String,
        arguments: Map<String, Value>,
        content: String,
        is_error: bool,
    },
    /// A fatal error ends the turn; others are reported and the turn goes on.
    Error {
        message: String,
        #[serde(default)]
        fatal: bool,
    },
    Done { conversation_id: ConversationId },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_with_type_tag() {
        let event = ChatEvent::new(ChatEventKind::Message {
            content: "Hel".into(),
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["content"], "Hel");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn tool_result_shape() {
        let mut arguments = Map::new();
        arguments.insert("a".into(), json!(2));
        let event = ChatEvent::new(ChatEventKind::ToolResult {
            name: "calc.add".into(),
            arguments,
            content: "4".into(),
            is_error: false,
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "tool_result");
        assert_eq!(value["arguments"]["a"], 2);

        let back: ChatEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn only_done_and_fatal_errors_are_terminal() {
        let done = ChatEvent::new(ChatEventKind::Done {
            conversation_id: ConversationId::new(),
        });
        let routing = ChatEvent::new(ChatEventKind::Error {
            message: "unknown server".into(),
            fatal: false,
        });
        let fatal = ChatEvent::new(ChatEventKind::Error {
            message: "stream failed".into(),
            fatal: true,
        });
        assert!(done.is_terminal());
        assert!(!routing.is_terminal());
        assert!(fatal.is_terminal());
    }
}
