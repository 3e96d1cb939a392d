use serde::{Deserialize, Serialize};

/// Discriminator carried in the `type` field of every envelope pushed to a
/// live connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A new chat (with its first message) was created
    ChatCreated,
    /// A message was persisted in an existing chat
    MessageCreated,
    /// Handshake acknowledgement carrying the connection's own id
    ClientConnected,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ChatCreated => "chat_created",
            EventType::MessageCreated => "message_created",
            EventType::ClientConnected => "client_connected",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
