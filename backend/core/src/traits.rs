use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;

use crate::error::UpstreamError;
use crate::types::{
    Chat, ChatId, ChatSummary, ChatUpdate, ChatWithMessages, ConversationTurn, Message, MessageId,
    NewMessage, UserId,
};

/// Persistence collaborator for chats and messages.
///
/// Ownership checks take the requesting user so that a foreign chat looks
/// exactly like a missing one.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// True when `chat_id` exists and belongs to `user_id`.
    async fn verify_ownership(&self, chat_id: ChatId, user_id: UserId) -> Result<bool>;

    /// Full history of a chat, oldest first.
    async fn load_conversation(&self, chat_id: ChatId) -> Result<Vec<ConversationTurn>>;

    async fn create_message(&self, chat_id: ChatId, message: NewMessage) -> Result<Message>;

    /// Bump the chat's last-activity timestamp.
    async fn update_chat_activity(&self, chat_id: ChatId, at: DateTime<Utc>) -> Result<()>;

    async fn create_chat(&self, user_id: UserId, title: &str) -> Result<Chat>;

    /// Chats of a user, most recently active first. A `limit` of 0 means no limit.
    async fn list_chats(&self, user_id: UserId, limit: u32, offset: u32)
        -> Result<Vec<ChatSummary>>;

    async fn get_chat(&self, chat_id: ChatId, user_id: UserId) -> Result<Option<ChatWithMessages>>;

    async fn update_chat(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        update: ChatUpdate,
    ) -> Result<Option<Chat>>;

    /// Delete a chat and its messages. Returns false if nothing matched.
    async fn delete_chat(&self, chat_id: ChatId, user_id: UserId) -> Result<bool>;

    async fn list_messages(&self, chat_id: ChatId, limit: u32, offset: u32)
        -> Result<Vec<Message>>;

    async fn update_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        content: &str,
    ) -> Result<Option<Message>>;

    async fn delete_message(&self, chat_id: ChatId, message_id: MessageId) -> Result<bool>;
}

/// Incremental text deltas produced by an upstream provider, in order.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, UpstreamError>> + Send>>;

/// Request to open a streaming completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmStreamRequest {
    pub model: String,
    pub messages: Vec<ConversationTurn>,
}

/// Trait for streaming LLM providers.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name (e.g., "openrouter").
    fn name(&self) -> &str;

    /// Open a streaming completion. A non-success initial response is an
    /// error here; failures after that surface as `Err` items of the stream.
    async fn open_stream(&self, request: &LlmStreamRequest) -> Result<ChunkStream, UpstreamError>;
}
