//! Wire envelopes exchanged over a live connection.
//!
//! Every frame is `{"type": ..., "data": ..., "client_id"?: ...}`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use kapi_core::EventType;

/// Inbound control type a client sends to learn its own connection id.
pub const CLIENT_CONNECT: &str = "client_connect";

#[derive(Debug, Serialize)]
pub struct OutboundEnvelope<'a, T: Serialize> {
    #[serde(rename = "type")]
    pub kind: EventType,
    pub data: &'a T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<&'a str>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub client_id: Option<String>,
}

/// Recognised inbound messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    ClientConnect,
    Unknown(String),
}

impl ControlMessage {
    pub fn decode(text: &str) -> serde_json::Result<Self> {
        let envelope: InboundEnvelope = serde_json::from_str(text)?;
        Ok(match envelope.kind.as_str() {
            CLIENT_CONNECT => Self::ClientConnect,
            _ => Self::Unknown(envelope.kind),
        })
    }
}

/// Serialize a broadcast envelope once so it can be shared by every recipient.
pub fn encode_event<T: Serialize>(kind: EventType, payload: &T) -> serde_json::Result<Arc<str>> {
    let envelope = OutboundEnvelope {
        kind,
        data: payload,
        client_id: None,
    };
    serde_json::to_string(&envelope).map(Arc::from)
}

#[derive(Serialize)]
struct ClientConnectedData<'a> {
    client_id: &'a str,
}

/// Handshake acknowledgement carrying the connection's own id.
pub fn client_connected_ack(conn_id: &str) -> serde_json::Result<Arc<str>> {
    let envelope = OutboundEnvelope {
        kind: EventType::ClientConnected,
        data: &ClientConnectedData { client_id: conn_id },
        client_id: Some(conn_id),
    };
    serde_json::to_string(&envelope).map(Arc::from)
}
