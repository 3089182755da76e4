//! Persistence for conversations, messages and per-user tool catalogs.
//!
//! # Overview
//!
//! The runtime talks to storage only through two traits:
//!
//! - [`MessageStore`] - conversations and their ordered messages. Messages
//!   come back in creation order, which is what lets a conversation be
//!   replayed into a model request exactly as it was built live.
//! - [`ToolCatalogStore`] - the tools each user has discovered on their
//!   servers (with a user-controlled enabled flag) and a durable record of
//!   which servers a user has connected to.
//!
//! [`SqliteStore`] implements both over a single SQLite database.
//!
//! # Core Concepts
//!
//! ## Message
//!
//! A [`Message`] has a [`Role`] (`user`, `assistant` or `tool`), text
//! content, and optionally the tool calls an assistant turn requested and
//! the results they produced. A `tool` message always carries its result;
//! the store refuses one that does not.
//!
//! ## ToolDescriptor
//!
//! A [`ToolDescriptor`] is keyed by user and qualified name
//! (`server.tool`). Reconnecting refreshes its description and schema but
//! keeps whatever enabled flag the user chose.
//!
//! # Example
//!
//! ```no_run
//! use storage::{Message, MessageStore, SqliteStore, UserId};
//!
//! # async fn example() -> storage::Result<()> {
//! let store = SqliteStore::open("rigging.db")?;
//! let user = UserId::new();
//!
//! let conversation = store.create_conversation(user, "Weather").await?;
//! store.append_message(&Message::user(conversation.id, "Is it raining?")).await?;
//!
//! for message in store.find_messages(conversation.id).await? {
//!     println!("{}: {}", message.role.as_str(), message.content);
//! }
//! # Ok(())
//! # }
//! ```

mod error;
mod model;
mod sqlite;
mod store;

pub use error::{Error, Result};
pub use model::{
    Conversation, ConversationId, Message, MessageId, Role, ServerSession, ToolCallRecord,
    ToolDescriptor, ToolResultRecord, UserId, now,
};
pub use sqlite::SqliteStore;
pub use store::{MessageStore, ToolCatalogStore};
