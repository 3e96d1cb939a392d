//! One live client session and its bounded outbound queue.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use kapi_core::UserId;

/// Outbound queue capacity per connection.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Connecting,
            1 => Self::Active,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("outbound queue is full")]
    Full,
    #[error("connection is closed")]
    Closed,
}

/// A registered transport session.
///
/// Many producers enqueue serialized frames; exactly one outbound pump owns the
/// receiving half. Closing drops the sender, so the pump sees the end of the
/// queue once it has drained what was already buffered.
#[derive(Debug)]
pub struct Connection {
    id: String,
    user_id: UserId,
    outbound: Mutex<Option<mpsc::Sender<Arc<str>>>>,
    state: AtomicU8,
}

impl Connection {
    pub fn new(user_id: UserId) -> (Arc<Self>, mpsc::Receiver<Arc<str>>) {
        Self::with_capacity(user_id, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(user_id: UserId, capacity: usize) -> (Arc<Self>, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn = Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            outbound: Mutex::new(Some(tx)),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
        });
        (conn, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move the state forward to `next`. Returns false if the connection was
    /// already at or past it.
    pub fn advance(&self, next: ConnectionState) -> bool {
        let previous = self.state.fetch_max(next as u8, Ordering::AcqRel);
        previous < next as u8
    }

    /// Queue a frame without waiting.
    pub fn try_enqueue(&self, frame: Arc<str>) -> Result<(), EnqueueError> {
        let guard = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = guard.as_ref() else {
            return Err(EnqueueError::Closed);
        };
        tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => EnqueueError::Full,
            TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Close the outbound queue. Returns true on the first call only.
    pub fn close(&self) -> bool {
        let sender = self
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.advance(ConnectionState::Closing);
        sender.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}
