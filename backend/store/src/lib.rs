//! Durable persistence for chats and messages.

pub mod sqlite_store;

pub use sqlite_store::SqliteChatStore;
