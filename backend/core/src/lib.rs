pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use error::{KapiError, UpstreamError};
pub use event::EventType;
pub use traits::{ChatStore, ChunkStream, LlmProvider, LlmStreamRequest};
pub use types::{
    Chat, ChatId, ChatSummary, ChatUpdate, ChatWithMessages, ConversationTurn, Message, MessageId,
    NewMessage, Role, UserId,
};
