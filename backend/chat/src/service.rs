//! Chat operations for authenticated users.
//!
//! State-changing operations that other sessions care about (new chat, new
//! message) are broadcast through the hub after they are stored. Everything
//! else only checks ownership.

use std::sync::Arc;

use serde::Deserialize;
use tracing::info;

use kapi_core::{
    Chat, ChatId, ChatStore, ChatSummary, ChatUpdate, ChatWithMessages, EventType, KapiError,
    LlmProvider, Message, MessageId, NewMessage, Role, UserId,
};
use kapi_hub::Hub;

use crate::streaming::{ReplyRequest, StreamSession, StreamingCoordinator};

const TITLE_MAX_CHARS: usize = 50;
const TITLE_KEEP_CHARS: usize = 47;
const TITLE_LIMIT: usize = 100;

/// First message of a brand-new chat.
#[derive(Debug, Clone, Deserialize)]
pub struct NewChatRequest {
    pub content: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub client_id: Option<String>,
}

/// Message appended to an existing chat.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateMessageRequest {
    pub content: String,
    pub role: Role,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub client_id: Option<String>,
}

/// Title derived from a chat's first message.
pub fn chat_title(content: &str) -> String {
    if content.chars().count() > TITLE_MAX_CHARS {
        let head: String = content.chars().take(TITLE_KEEP_CHARS).collect();
        format!("{head}...")
    } else {
        content.to_string()
    }
}

#[derive(Clone)]
pub struct ChatService {
    store: Arc<dyn ChatStore>,
    hub: Hub,
    streaming: StreamingCoordinator,
}

impl ChatService {
    pub fn new(store: Arc<dyn ChatStore>, provider: Arc<dyn LlmProvider>, hub: Hub) -> Self {
        let streaming = StreamingCoordinator::new(store.clone(), provider, hub.clone());
        Self {
            store,
            hub,
            streaming,
        }
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.streaming = self.streaming.with_default_model(model);
        self
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn streaming(&self) -> &StreamingCoordinator {
        &self.streaming
    }

    async fn ensure_owner(&self, chat_id: ChatId, user_id: UserId) -> Result<(), KapiError> {
        if self.store.verify_ownership(chat_id, user_id).await? {
            Ok(())
        } else {
            Err(KapiError::NotFoundOrDenied)
        }
    }

    /// Create a chat holding one user message and tell the user's other
    /// sessions about it.
    pub async fn create_chat_with_message(
        &self,
        user_id: UserId,
        request: NewChatRequest,
    ) -> Result<ChatWithMessages, KapiError> {
        require_content(&request.content)?;

        let mut chat = self
            .store
            .create_chat(user_id, &chat_title(&request.content))
            .await?;
        let message = self
            .store
            .create_message(
                chat.id,
                NewMessage {
                    role: Role::User,
                    content: request.content,
                    model: request.model,
                },
            )
            .await?;
        self.store
            .update_chat_activity(chat.id, message.created_at)
            .await?;
        chat.updated_at = message.created_at;

        let created = ChatWithMessages {
            summary: ChatSummary {
                chat,
                message_count: 1,
                last_message: Some(message.clone()),
            },
            messages: vec![message],
        };
        info!(chat_id = created.summary.chat.id, %user_id, "Chat created");

        self.hub.broadcast_to_user_except_by_client_id(
            user_id,
            EventType::ChatCreated,
            &created,
            request.client_id.as_deref(),
        );
        Ok(created)
    }

    /// Append a message and tell the user's other sessions about it.
    pub async fn create_message(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        request: &CreateMessageRequest,
    ) -> Result<Message, KapiError> {
        require_content(&request.content)?;
        self.ensure_owner(chat_id, user_id).await?;

        let message = self
            .store
            .create_message(
                chat_id,
                NewMessage {
                    role: request.role,
                    content: request.content.clone(),
                    model: request.model.clone(),
                },
            )
            .await?;
        self.store
            .update_chat_activity(chat_id, message.created_at)
            .await?;

        self.hub.broadcast_to_user_except_by_client_id(
            user_id,
            EventType::MessageCreated,
            &message,
            request.client_id.as_deref(),
        );
        Ok(message)
    }

    /// Start streaming an assistant reply for the chat's current history.
    pub async fn stream_reply(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        model: Option<String>,
        client_id: Option<String>,
    ) -> Result<StreamSession, KapiError> {
        self.streaming
            .start(ReplyRequest {
                chat_id,
                user_id,
                model,
                origin_client_id: client_id,
            })
            .await
    }

    pub async fn list_chats(
        &self,
        user_id: UserId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ChatSummary>, KapiError> {
        Ok(self.store.list_chats(user_id, limit, offset).await?)
    }

    pub async fn get_chat(&self, chat_id: ChatId, user_id: UserId) -> Result<ChatWithMessages, KapiError> {
        self.store
            .get_chat(chat_id, user_id)
            .await?
            .ok_or(KapiError::NotFoundOrDenied)
    }

    pub async fn update_chat(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        update: ChatUpdate,
    ) -> Result<Chat, KapiError> {
        if let Some(title) = &update.title {
            let len = title.chars().count();
            if len == 0 || len > TITLE_LIMIT {
                return Err(KapiError::invalid(format!(
                    "title must be between 1 and {TITLE_LIMIT} characters"
                )));
            }
        }
        self.store
            .update_chat(chat_id, user_id, update)
            .await?
            .ok_or(KapiError::NotFoundOrDenied)
    }

    pub async fn delete_chat(&self, chat_id: ChatId, user_id: UserId) -> Result<(), KapiError> {
        if self.store.delete_chat(chat_id, user_id).await? {
            info!(chat_id, %user_id, "Chat deleted");
            Ok(())
        } else {
            Err(KapiError::NotFoundOrDenied)
        }
    }

    pub async fn list_messages(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>, KapiError> {
        self.ensure_owner(chat_id, user_id).await?;
        Ok(self.store.list_messages(chat_id, limit, offset).await?)
    }

    pub async fn update_message(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        message_id: MessageId,
        content: &str,
    ) -> Result<Message, KapiError> {
        require_content(content)?;
        self.ensure_owner(chat_id, user_id).await?;
        self.store
            .update_message(chat_id, message_id, content)
            .await?
            .ok_or_else(|| KapiError::NotFound("message".into()))
    }

    pub async fn delete_message(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        message_id: MessageId,
    ) -> Result<(), KapiError> {
        self.ensure_owner(chat_id, user_id).await?;
        if self.store.delete_message(chat_id, message_id).await? {
            Ok(())
        } else {
            Err(KapiError::NotFound("message".into()))
        }
    }
}

fn require_content(content: &str) -> Result<(), KapiError> {
    if content.is_empty() {
        Err(KapiError::invalid("content must not be empty"))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kapi_hub::Connection;
    use kapi_llm::MockProvider;
    use kapi_store::SqliteChatStore;
    use serde_json::Value;
    use tokio::sync::mpsc;

    fn service() -> ChatService {
        let store = Arc::new(SqliteChatStore::in_memory().unwrap());
        let provider = Arc::new(MockProvider::new().with_chunks(["Hello", " there"]));
        ChatService::new(store, provider, Hub::spawn())
    }

    fn connect(svc: &ChatService, user: i64) -> (Arc<Connection>, mpsc::Receiver<Arc<str>>) {
        let (conn, rx) = Connection::new(UserId(user));
        svc.hub().register(conn.clone());
        (conn, rx)
    }

    async fn next_event(svc: &ChatService, rx: &mut mpsc::Receiver<Arc<str>>) -> Option<Value> {
        svc.hub().stats().await;
        rx.try_recv()
            .ok()
            .map(|frame| serde_json::from_str(&frame).unwrap())
    }

    fn user_message(content: &str, client_id: Option<&str>) -> CreateMessageRequest {
        CreateMessageRequest {
            content: content.into(),
            role: Role::User,
            model: String::new(),
            client_id: client_id.map(str::to_string),
        }
    }

    #[test]
    fn test_chat_title() {
        assert_eq!(chat_title("short"), "short");
        let exactly_fifty = "a".repeat(50);
        assert_eq!(chat_title(&exactly_fifty), exactly_fifty);

        let long = "b".repeat(51);
        let title = chat_title(&long);
        assert_eq!(title, format!("{}...", "b".repeat(47)));
        assert_eq!(title.chars().count(), 50);

        // Multi-byte characters are counted, not bytes.
        let emoji = "é".repeat(60);
        assert_eq!(chat_title(&emoji).chars().count(), 50);
    }

    #[tokio::test]
    async fn test_create_chat_broadcasts_to_other_sessions() {
        let svc = service();
        let (origin, mut origin_rx) = connect(&svc, 1);
        let (_other, mut other_rx) = connect(&svc, 1);
        let (_stranger, mut stranger_rx) = connect(&svc, 2);

        let created = svc
            .create_chat_with_message(
                UserId(1),
                NewChatRequest {
                    content: "What is Rust?".into(),
                    model: String::new(),
                    client_id: Some(origin.id().to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(created.summary.chat.title, "What is Rust?");
        assert_eq!(created.summary.message_count, 1);
        assert_eq!(created.messages.len(), 1);

        let event = next_event(&svc, &mut other_rx).await.unwrap();
        assert_eq!(event["type"], "chat_created");
        assert_eq!(event["data"]["id"], created.summary.chat.id);
        assert_eq!(event["data"]["messages"][0]["content"], "What is Rust?");
        assert!(next_event(&svc, &mut origin_rx).await.is_none());
        assert!(next_event(&svc, &mut stranger_rx).await.is_none());
    }

    #[tokio::test]
    async fn test_create_message_requires_ownership() {
        let svc = service();
        let created = svc
            .create_chat_with_message(
                UserId(1),
                NewChatRequest {
                    content: "hi".into(),
                    model: String::new(),
                    client_id: None,
                },
            )
            .await
            .unwrap();
        let chat_id = created.summary.chat.id;

        let err = svc
            .create_message(chat_id, UserId(2), &user_message("intrusion", None))
            .await
            .unwrap_err();
        assert!(matches!(err, KapiError::NotFoundOrDenied));

        let err = svc
            .create_message(chat_id, UserId(1), &user_message("", None))
            .await
            .unwrap_err();
        assert!(matches!(err, KapiError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_message_then_streamed_reply() {
        let svc = service();
        let (origin, mut origin_rx) = connect(&svc, 1);
        let (_other, mut other_rx) = connect(&svc, 1);

        let created = svc
            .create_chat_with_message(
                UserId(1),
                NewChatRequest {
                    content: "first".into(),
                    model: String::new(),
                    client_id: Some(origin.id().to_string()),
                },
            )
            .await
            .unwrap();
        let chat_id = created.summary.chat.id;
        next_event(&svc, &mut other_rx).await.unwrap();

        let request = user_message("second", Some(origin.id()));
        let stored = svc.create_message(chat_id, UserId(1), &request).await.unwrap();
        assert_eq!(stored.role, Role::User);
        let event = next_event(&svc, &mut other_rx).await.unwrap();
        assert_eq!(event["type"], "message_created");
        assert_eq!(event["data"]["content"], "second");

        let session = svc
            .stream_reply(chat_id, UserId(1), None, request.client_id.clone())
            .await
            .unwrap();
        let reply = session.task.await.unwrap().unwrap();
        assert_eq!(reply.content, "Hello there");

        let event = next_event(&svc, &mut other_rx).await.unwrap();
        assert_eq!(event["data"]["role"], "assistant");
        assert!(next_event(&svc, &mut origin_rx).await.is_none());

        let messages = svc.list_messages(chat_id, UserId(1), 0, 0).await.unwrap();
        let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["first", "second", "Hello there"]);
    }

    #[tokio::test]
    async fn test_read_update_delete_are_owner_only() {
        let svc = service();
        let created = svc
            .create_chat_with_message(
                UserId(1),
                NewChatRequest {
                    content: "mine".into(),
                    model: String::new(),
                    client_id: None,
                },
            )
            .await
            .unwrap();
        let chat_id = created.summary.chat.id;
        let message_id = created.messages[0].id;

        assert!(matches!(
            svc.get_chat(chat_id, UserId(2)).await,
            Err(KapiError::NotFoundOrDenied)
        ));
        assert!(matches!(
            svc.list_messages(chat_id, UserId(2), 0, 0).await,
            Err(KapiError::NotFoundOrDenied)
        ));
        assert!(matches!(
            svc.update_message(chat_id, UserId(2), message_id, "x").await,
            Err(KapiError::NotFoundOrDenied)
        ));
        assert!(matches!(
            svc.delete_chat(chat_id, UserId(2)).await,
            Err(KapiError::NotFoundOrDenied)
        ));

        let updated = svc
            .update_message(chat_id, UserId(1), message_id, "edited")
            .await
            .unwrap();
        assert_eq!(updated.content, "edited");
        assert!(matches!(
            svc.update_message(chat_id, UserId(1), message_id + 99, "x").await,
            Err(KapiError::NotFound(_))
        ));

        svc.delete_message(chat_id, UserId(1), message_id).await.unwrap();
        assert!(matches!(
            svc.delete_message(chat_id, UserId(1), message_id).await,
            Err(KapiError::NotFound(_))
        ));

        svc.delete_chat(chat_id, UserId(1)).await.unwrap();
        assert!(svc.list_chats(UserId(1), 0, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_chat_validates_title() {
        let svc = service();
        let created = svc
            .create_chat_with_message(
                UserId(1),
                NewChatRequest {
                    content: "t".into(),
                    model: String::new(),
                    client_id: None,
                },
            )
            .await
            .unwrap();
        let chat_id = created.summary.chat.id;

        let err = svc
            .update_chat(
                chat_id,
                UserId(1),
                ChatUpdate {
                    title: Some("x".repeat(101)),
                    is_active: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KapiError::InvalidInput(_)));

        let chat = svc
            .update_chat(
                chat_id,
                UserId(1),
                ChatUpdate {
                    title: Some("renamed".into()),
                    is_active: Some(false),
                },
            )
            .await
            .unwrap();
        assert_eq!(chat.title, "renamed");
        assert!(!chat.is_active);
    }

    #[test]
    fn test_create_message_request_rejects_unknown_role() {
        let ok: CreateMessageRequest =
            serde_json::from_str(r#"{"content":"hi","role":"assistant"}"#).unwrap();
        assert_eq!(ok.role, Role::Assistant);
        assert!(ok.client_id.is_none());
        assert!(serde_json::from_str::<CreateMessageRequest>(r#"{"content":"hi","role":"system"}"#).is_err());
    }
}
