//! Persisted entities: conversations, messages, tool catalog, server sessions.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{Error, Result};

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| Error::Invalid(format!("bad {} {s:?}: {e}", stringify!($name))))
            }
        }
    };
}

uuid_id!(
    /// Identifies the user owning conversations, tools and connections.
    UserId
);
uuid_id!(
    /// Identifies a conversation.
    ConversationId
);
uuid_id!(
    /// Identifies a single message.
    MessageId
);

/// Current time at the precision the store keeps (microseconds).
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            other => Err(Error::Invalid(format!("unknown role {other:?}"))),
        }
    }
}

/// A tool invocation the model asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

/// What a tool invocation produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultRecord {
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    /// Text handed back to the model.
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(default)]
    pub tool_results: Vec<ToolResultRecord>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    fn new(conversation_id: ConversationId, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            conversation_id,
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            created_at: now(),
        }
    }

    pub fn user(conversation_id: ConversationId, content: impl Into<String>) -> Self {
        Self::new(conversation_id, Role::User, content)
    }

    pub fn assistant(conversation_id: ConversationId, content: impl Into<String>) -> Self {
        Self::new(conversation_id, Role::Assistant, content)
    }

    /// An assistant turn that requested tools, with what they returned.
    pub fn assistant_with_tools(
        conversation_id: ConversationId,
        content: impl Into<String>,
        tool_calls: Vec<ToolCallRecord>,
        tool_results: Vec<ToolResultRecord>,
    ) -> Self {
        Self {
            tool_calls,
            tool_results,
            ..Self::new(conversation_id, Role::Assistant, content)
        }
    }

    /// A tool turn; its content is the result text.
    pub fn tool(conversation_id: ConversationId, result: ToolResultRecord) -> Self {
        Self {
            tool_results: vec![result.clone()],
            ..Self::new(conversation_id, Role::Tool, result.result)
        }
    }

    /// Check the invariants a stored message must satisfy.
    pub fn validate(&self) -> Result<()> {
        if self.role == Role::Tool && self.tool_results.is_empty() {
            return Err(Error::Invalid(format!(
                "tool message {} carries no tool result",
                self.id
            )));
        }
        Ok(())
    }
}

/// An ordered sequence of messages owned by one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub user_id: UserId,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// A tool known to belong to a user, keyed by (user, qualified name).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub user_id: UserId,
    pub qualified_name: String,
    pub description: String,
    pub input_schema: Option<Value>,
    pub enabled: bool,
}

/// Durable record that a user connected to a named server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSession {
    pub user_id: UserId,
    pub server_name: String,
    pub session_id: String,
    pub connected_at: DateTime<Utc>,
}
