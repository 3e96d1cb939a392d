pub mod service;
pub mod streaming;

pub use service::{chat_title, ChatService, CreateMessageRequest, NewChatRequest};
pub use streaming::{
    ReplyChunk, ReplyRequest, ReplyStream, StreamSession, StreamingCoordinator, DEFAULT_MODEL,
    UPSTREAM_IDLE_TIMEOUT,
};
