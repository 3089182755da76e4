//! SQLite implementation of the store traits.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Deserialize;
use serde_rusqlite::from_rows;

use crate::model::now;
use crate::{
    Conversation, ConversationId, Error, Message, MessageId, MessageStore, Result, ServerSession,
    ToolCatalogStore, ToolDescriptor, UserId,
};

/// SQLite-backed store for conversations, messages and the tool catalog.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn().execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_user
                ON conversations(user_id, created_at);

            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                conversation_id TEXT NOT NULL
                    REFERENCES conversations(id) ON DELETE CASCADE,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                tool_calls TEXT,
                tool_results TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_id, created_at, seq);

            CREATE TABLE IF NOT EXISTS tools (
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                input_schema TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, name)
            );

            CREATE TABLE IF NOT EXISTS server_sessions (
                user_id TEXT NOT NULL,
                server_name TEXT NOT NULL,
                session_id TEXT NOT NULL,
                connected_at TEXT NOT NULL,
                PRIMARY KEY (user_id, server_name)
            );
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn query_messages(&self, sql: &str, key: &str) -> Result<Vec<Message>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let messages = from_rows::<MessageRow>(stmt.query([key])?)
            .map(|row| row.map_err(Error::from).and_then(Message::try_from))
            .collect::<Result<Vec<_>>>()?;
        Ok(messages)
    }

    fn query_tools(&self, sql: &str, user_id: UserId) -> Result<Vec<ToolDescriptor>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let tools = from_rows::<ToolRow>(stmt.query([user_id.to_string()])?)
            .map(|row| row.map_err(Error::from).and_then(ToolDescriptor::try_from))
            .collect::<Result<Vec<_>>>()?;
        Ok(tools)
    }

    fn query_sessions(&self, sql: &str, args: &[&str]) -> Result<Vec<ServerSession>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let sessions = from_rows::<SessionRow>(stmt.query(rusqlite::params_from_iter(args))?)
            .map(|row| row.map_err(Error::from).and_then(ServerSession::try_from))
            .collect::<Result<Vec<_>>>()?;
        Ok(sessions)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row Types
// ─────────────────────────────────────────────────────────────────────────────

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, role, content, tool_calls, tool_results, created_at";
const TOOL_COLUMNS: &str = "user_id, name, description, input_schema, enabled";
const SESSION_COLUMNS: &str = "user_id, server_name, session_id, connected_at";

#[derive(Deserialize)]
struct ConversationRow {
    id: String,
    user_id: String,
    title: String,
    created_at: String,
}

impl TryFrom<ConversationRow> for Conversation {
    type Error = Error;

    fn try_from(row: ConversationRow) -> Result<Self> {
        Ok(Self {
            id: row.id.parse()?,
            user_id: row.user_id.parse()?,
            title: row.title,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

#[derive(Deserialize)]
struct MessageRow {
    id: String,
    conversation_id: String,
    role: String,
    content: String,
    tool_calls: Option<String>,
    tool_results: Option<String>,
    created_at: String,
}

impl TryFrom<MessageRow> for Message {
    type Error = Error;

    fn try_from(row: MessageRow) -> Result<Self> {
        Ok(Self {
            id: row.id.parse()?,
            conversation_id: row.conversation_id.parse()?,
            role: row.role.parse()?,
            content: row.content,
            tool_calls: decode_list(row.tool_calls.as_deref())?,
            tool_results: decode_list(row.tool_results.as_deref())?,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

#[derive(Deserialize)]
struct ToolRow {
    user_id: String,
    name: String,
    description: String,
    input_schema: Option<String>,
    enabled: i64,
}

impl TryFrom<ToolRow> for ToolDescriptor {
    type Error = Error;

    fn try_from(row: ToolRow) -> Result<Self> {
        Ok(Self {
            user_id: row.user_id.parse()?,
            qualified_name: row.name,
            description: row.description,
            input_schema: row
                .input_schema
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            enabled: row.enabled != 0,
        })
    }
}

#[derive(Deserialize)]
struct SessionRow {
    user_id: String,
    server_name: String,
    session_id: String,
    connected_at: String,
}

impl TryFrom<SessionRow> for ServerSession {
    type Error = Error;

    fn try_from(row: SessionRow) -> Result<Self> {
        Ok(Self {
            user_id: row.user_id.parse()?,
            server_name: row.server_name,
            session_id: row.session_id,
            connected_at: parse_timestamp(&row.connected_at)?,
        })
    }
}

fn format_timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Invalid(format!("bad timestamp {s:?}: {e}")))
}

/// Empty lists are stored as NULL.
fn encode_list<T: serde::Serialize>(items: &[T]) -> Result<Option<String>> {
    if items.is_empty() {
        Ok(None)
    } else {
        Ok(Some(serde_json::to_string(items)?))
    }
}

fn decode_list<T: serde::de::DeserializeOwned>(raw: Option<&str>) -> Result<Vec<T>> {
    match raw {
        Some(json) => Ok(serde_json::from_str(json)?),
        None => Ok(Vec::new()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Store Implementations
// ─────────────────────────────────────────────────────────────────────────────

impl MessageStore for SqliteStore {
    async fn create_conversation(&self, user_id: UserId, title: &str) -> Result<Conversation> {
        let conversation = Conversation {
            id: ConversationId::new(),
            user_id,
            title: title.to_string(),
            created_at: now(),
        };
        self.conn().execute(
            "INSERT INTO conversations (id, user_id, title, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                conversation.id.to_string(),
                user_id.to_string(),
                conversation.title,
                format_timestamp(&conversation.created_at),
            ],
        )?;
        Ok(conversation)
    }

    async fn find_conversation(&self, id: ConversationId) -> Result<Option<Conversation>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT id, user_id, title, created_at FROM conversations WHERE id = ?1")?;
        let row = from_rows::<ConversationRow>(stmt.query([id.to_string()])?)
            .next()
            .transpose()?;
        row.map(Conversation::try_from).transpose()
    }

    async fn find_conversations(&self, user_id: UserId) -> Result<Vec<Conversation>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, title, created_at FROM conversations
             WHERE user_id = ?1 ORDER BY created_at DESC, rowid DESC",
        )?;
        let conversations = from_rows::<ConversationRow>(stmt.query([user_id.to_string()])?)
            .map(|row| row.map_err(Error::from).and_then(Conversation::try_from))
            .collect::<Result<Vec<_>>>()?;
        Ok(conversations)
    }

    async fn delete_conversation(&self, id: ConversationId) -> Result<()> {
        self.conn()
            .execute("DELETE FROM conversations WHERE id = ?1", [id.to_string()])?;
        Ok(())
    }

    async fn append_message(&self, message: &Message) -> Result<()> {
        message.validate()?;
        self.conn().execute(
            "INSERT INTO messages
                (id, conversation_id, role, content, tool_calls, tool_results, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.id.to_string(),
                message.conversation_id.to_string(),
                message.role.as_str(),
                message.content,
                encode_list(&message.tool_calls)?,
                encode_list(&message.tool_results)?,
                format_timestamp(&message.created_at),
            ],
        )?;
        Ok(())
    }

    async fn find_message(&self, id: MessageId) -> Result<Option<Message>> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
        Ok(self.query_messages(&sql, &id.to_string())?.into_iter().next())
    }

    async fn update_message(&self, message: &Message) -> Result<()> {
        message.validate()?;
        let changed = self.conn().execute(
            "UPDATE messages SET content = ?2, tool_calls = ?3, tool_results = ?4 WHERE id = ?1",
            params![
                message.id.to_string(),
                message.content,
                encode_list(&message.tool_calls)?,
                encode_list(&message.tool_results)?,
            ],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("message {}", message.id)));
        }
        Ok(())
    }

    async fn delete_message(&self, id: MessageId) -> Result<()> {
        self.conn()
            .execute("DELETE FROM messages WHERE id = ?1", [id.to_string()])?;
        Ok(())
    }

    async fn find_messages(&self, conversation_id: ConversationId) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ?1 ORDER BY created_at, seq"
        );
        self.query_messages(&sql, &conversation_id.to_string())
    }
}

impl ToolCatalogStore for SqliteStore {
    async fn upsert_tool(&self, tool: &ToolDescriptor) -> Result<ToolDescriptor> {
        let schema = tool
            .input_schema
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO tools (user_id, name, description, input_schema, enabled, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(user_id, name) DO UPDATE SET
                description = excluded.description,
                input_schema = excluded.input_schema,
                updated_at = excluded.updated_at",
            params![
                tool.user_id.to_string(),
                tool.qualified_name,
                tool.description,
                schema,
                tool.enabled,
                format_timestamp(&now()),
            ],
        )?;
        let enabled: bool = conn
            .query_row(
                "SELECT enabled FROM tools WHERE user_id = ?1 AND name = ?2",
                params![tool.user_id.to_string(), tool.qualified_name],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("tool {}", tool.qualified_name)))?;
        Ok(ToolDescriptor {
            enabled,
            ..tool.clone()
        })
    }

    async fn find_tools(&self, user_id: UserId) -> Result<Vec<ToolDescriptor>> {
        let sql = format!("SELECT {TOOL_COLUMNS} FROM tools WHERE user_id = ?1 ORDER BY name");
        self.query_tools(&sql, user_id)
    }

    async fn find_enabled_tools(&self, user_id: UserId) -> Result<Vec<ToolDescriptor>> {
        let sql = format!(
            "SELECT {TOOL_COLUMNS} FROM tools WHERE user_id = ?1 AND enabled = 1 ORDER BY name"
        );
        self.query_tools(&sql, user_id)
    }

    async fn set_tool_enabled(
        &self,
        user_id: UserId,
        qualified_name: &str,
        enabled: bool,
    ) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE tools SET enabled = ?3, updated_at = ?4 WHERE user_id = ?1 AND name = ?2",
            params![
                user_id.to_string(),
                qualified_name,
                enabled,
                format_timestamp(&now()),
            ],
        )?;
        Ok(changed > 0)
    }

    async fn upsert_server_session(
        &self,
        user_id: UserId,
        server_name: &str,
        session_id: &str,
    ) -> Result<ServerSession> {
        let session = ServerSession {
            user_id,
            server_name: server_name.to_string(),
            session_id: session_id.to_string(),
            connected_at: now(),
        };
        self.conn().execute(
            "INSERT INTO server_sessions (user_id, server_name, session_id, connected_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, server_name) DO UPDATE SET
                session_id = excluded.session_id,
                connected_at = excluded.connected_at",
            params![
                user_id.to_string(),
                server_name,
                session_id,
                format_timestamp(&session.connected_at),
            ],
        )?;
        Ok(session)
    }

    async fn find_server_session(
        &self,
        user_id: UserId,
        server_name: &str,
    ) -> Result<Option<ServerSession>> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM server_sessions WHERE user_id = ?1 AND server_name = ?2"
        );
        let user = user_id.to_string();
        Ok(self
            .query_sessions(&sql, &[user.as_str(), server_name])?
            .into_iter()
            .next())
    }

    async fn find_server_sessions(&self, user_id: UserId) -> Result<Vec<ServerSession>> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM server_sessions
             WHERE user_id = ?1 ORDER BY connected_at DESC, server_name"
        );
        let user = user_id.to_string();
        self.query_sessions(&sql, &[user.as_str()])
    }

    async fn remove_server_session(&self, user_id: UserId, server_name: &str) -> Result<()> {
        self.conn().execute(
            "DELETE FROM server_sessions WHERE user_id = ?1 AND server_name = ?2",
            params![user_id.to_string(), server_name],
        )?;
        Ok(())
    }
}
