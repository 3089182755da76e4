//! Store interfaces consumed by the runtime.

use std::future::Future;

use crate::{
    Conversation, ConversationId, Message, MessageId, Result, ServerSession, ToolDescriptor,
    UserId,
};

/// Conversations and their messages.
pub trait MessageStore: Send + Sync {
    fn create_conversation(
        &self,
        user_id: UserId,
        title: &str,
    ) -> impl Future<Output = Result<Conversation>> + Send;

    fn find_conversation(
        &self,
        id: ConversationId,
    ) -> impl Future<Output = Result<Option<Conversation>>> + Send;

    /// A user's conversations, newest first.
    fn find_conversations(
        &self,
        user_id: UserId,
    ) -> impl Future<Output = Result<Vec<Conversation>>> + Send;

    /// Delete a conversation and every message in it.
    fn delete_conversation(&self, id: ConversationId) -> impl Future<Output = Result<()>> + Send;

    fn append_message(&self, message: &Message) -> impl Future<Output = Result<()>> + Send;

    fn find_message(&self, id: MessageId) -> impl Future<Output = Result<Option<Message>>> + Send;

    /// Replace content, tool calls and tool results of an existing message.
    fn update_message(&self, message: &Message) -> impl Future<Output = Result<()>> + Send;

    fn delete_message(&self, id: MessageId) -> impl Future<Output = Result<()>> + Send;

    /// Messages of a conversation in creation order; ties keep insertion order.
    fn find_messages(
        &self,
        conversation_id: ConversationId,
    ) -> impl Future<Output = Result<Vec<Message>>> + Send;
}

/// Per-user tool catalog and server session records.
pub trait ToolCatalogStore: Send + Sync {
    /// Insert or refresh a descriptor. An existing row keeps its enabled
    /// flag; the stored row is returned.
    fn upsert_tool(
        &self,
        tool: &ToolDescriptor,
    ) -> impl Future<Output = Result<ToolDescriptor>> + Send;

    /// All of a user's tools, ordered by name.
    fn find_tools(&self, user_id: UserId)
    -> impl Future<Output = Result<Vec<ToolDescriptor>>> + Send;

    fn find_enabled_tools(
        &self,
        user_id: UserId,
    ) -> impl Future<Output = Result<Vec<ToolDescriptor>>> + Send;

    /// Returns `false` when no such tool exists.
    fn set_tool_enabled(
        &self,
        user_id: UserId,
        qualified_name: &str,
        enabled: bool,
    ) -> impl Future<Output = Result<bool>> + Send;

    fn upsert_server_session(
        &self,
        user_id: UserId,
        server_name: &str,
        session_id: &str,
    ) -> impl Future<Output = Result<ServerSession>> + Send;

    fn find_server_session(
        &self,
        user_id: UserId,
        server_name: &str,
    ) -> impl Future<Output = Result<Option<ServerSession>>> + Send;

    /// A user's server sessions, most recently connected first.
    fn find_server_sessions(
        &self,
        user_id: UserId,
    ) -> impl Future<Output = Result<Vec<ServerSession>>> + Send;

    /// Remove a session record. Absent records are not an error.
    fn remove_server_session(
        &self,
        user_id: UserId,
        server_name: &str,
    ) -> impl Future<Output = Result<()>> + Send;
}
