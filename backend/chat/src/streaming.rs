//! Streaming reply coordinator.
//!
//! One session per request: the upstream deltas go straight to the requester
//! through a bounded channel while being accumulated. Once the upstream
//! finishes cleanly the full reply is stored and then broadcast to the
//! user's other live connections.
//!
//! The requester's channel is a best-effort side output. If the requester
//! goes away or stops reading, the channel is detached and the session keeps
//! consuming the upstream so the stored reply is complete.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use kapi_core::{
    ChatId, ChatStore, ConversationTurn, EventType, KapiError, LlmProvider, LlmStreamRequest,
    Message, NewMessage, Role, UpstreamError, UserId,
};
use kapi_hub::Hub;

pub const DEFAULT_MODEL: &str = "google/gemini-2.0-flash-lite-001";

/// Capacity of the requester's reply channel.
pub const DIRECT_BUFFER: usize = 100;

/// Longest silence tolerated from the upstream, both before the stream opens
/// and between deltas.
pub const UPSTREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a terminal error marker may wait for room in the reply channel.
const ERROR_SEND_WAIT: Duration = Duration::from_secs(1);

const OVERFLOW_MESSAGE: &str = "reply stream fell behind, output truncated";

#[derive(Debug, Clone)]
pub struct ReplyRequest {
    pub chat_id: ChatId,
    pub user_id: UserId,
    /// Falls back to the coordinator's default when `None` or empty.
    pub model: Option<String>,
    /// Connection id of the requester's own socket, excluded from the broadcast.
    pub origin_client_id: Option<String>,
}

/// One item of the requester's reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyChunk {
    Text(String),
    /// Terminal failure. Nothing follows it.
    Error(String),
}

/// Receiving end of a session's direct output.
pub struct ReplyStream {
    rx: mpsc::Receiver<ReplyChunk>,
    overflowed: Arc<AtomicBool>,
    ended: bool,
}

impl ReplyStream {
    pub async fn next(&mut self) -> Option<ReplyChunk> {
        if self.ended {
            return None;
        }
        match self.rx.recv().await {
            Some(chunk) => Some(chunk),
            None => {
                self.ended = true;
                self.overflowed
                    .load(Ordering::Acquire)
                    .then(|| ReplyChunk::Error(OVERFLOW_MESSAGE.to_string()))
            }
        }
    }

    /// Plain-text body: deltas verbatim, an error as `"\n\nError: <message>"`.
    pub fn into_text_stream(self) -> impl Stream<Item = String> + Send + 'static {
        futures::stream::unfold(self, |mut reply| async move {
            let chunk = reply.next().await?;
            let text = match chunk {
                ReplyChunk::Text(text) => text,
                ReplyChunk::Error(message) => format!("\n\nError: {message}"),
            };
            Some((text, reply))
        })
    }
}

/// A running session.
pub struct StreamSession {
    pub reply: ReplyStream,
    /// Resolves to the stored assistant message once the upstream completes.
    pub task: JoinHandle<Result<Message, KapiError>>,
}

#[derive(Clone)]
pub struct StreamingCoordinator {
    store: Arc<dyn ChatStore>,
    provider: Arc<dyn LlmProvider>,
    hub: Hub,
    default_model: String,
    buffer: usize,
    idle_timeout: Duration,
}

impl StreamingCoordinator {
    pub fn new(store: Arc<dyn ChatStore>, provider: Arc<dyn LlmProvider>, hub: Hub) -> Self {
        Self {
            store,
            provider,
            hub,
            default_model: DEFAULT_MODEL.to_string(),
            buffer: DIRECT_BUFFER,
            idle_timeout: UPSTREAM_IDLE_TIMEOUT,
        }
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Check ownership, load the history and start streaming.
    ///
    /// Errors returned here happen before anything is streamed. Later
    /// failures reach the requester as a [`ReplyChunk::Error`] and resolve the
    /// session task with `Err`.
    pub async fn start(&self, request: ReplyRequest) -> Result<StreamSession, KapiError> {
        let ReplyRequest {
            chat_id,
            user_id,
            model,
            origin_client_id,
        } = request;

        if !self.store.verify_ownership(chat_id, user_id).await? {
            return Err(KapiError::NotFoundOrDenied);
        }
        let history = self.store.load_conversation(chat_id).await?;
        let model = model
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.default_model.clone());

        let (tx, rx) = mpsc::channel(self.buffer);
        let overflowed = Arc::new(AtomicBool::new(false));
        let sink = DirectSink {
            tx: Some(tx),
            overflowed: Arc::clone(&overflowed),
            chat_id,
        };

        info!(
            chat_id,
            %user_id,
            provider = self.provider.name(),
            model = %model,
            turns = history.len(),
            "Starting reply stream"
        );
        let session = Session {
            coordinator: self.clone(),
            chat_id,
            user_id,
            model,
            origin_client_id,
        };
        let task = tokio::spawn(session.run(history, sink));

        Ok(StreamSession {
            reply: ReplyStream {
                rx,
                overflowed,
                ended: false,
            },
            task,
        })
    }
}

struct Session {
    coordinator: StreamingCoordinator,
    chat_id: ChatId,
    user_id: UserId,
    model: String,
    origin_client_id: Option<String>,
}

impl Session {
    async fn run(self, history: Vec<ConversationTurn>, mut sink: DirectSink) -> Result<Message, KapiError> {
        let chat_id = self.chat_id;
        let store = &self.coordinator.store;
        let request = LlmStreamRequest {
            model: self.model.clone(),
            messages: history,
        };

        let idle = self.coordinator.idle_timeout;
        let opened = tokio::time::timeout(idle, self.coordinator.provider.open_stream(&request))
            .await
            .unwrap_or_else(|_| Err(idle_error(idle)));
        let mut upstream = match opened {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(chat_id, error = %e, "Upstream refused stream");
                sink.fail(&e).await;
                return Err(e.into());
            }
        };

        let mut reply = String::new();
        loop {
            let item = match tokio::time::timeout(idle, upstream.next()).await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(_) => Err(idle_error(idle)),
            };
            match item {
                Ok(delta) => {
                    reply.push_str(&delta);
                    sink.forward(delta);
                }
                Err(e) => {
                    warn!(chat_id, error = %e, bytes = reply.len(), "Upstream stream failed");
                    sink.fail(&e).await;
                    return Err(e.into());
                }
            }
        }
        drop(upstream);

        let message = match store
            .create_message(
                chat_id,
                NewMessage {
                    role: Role::Assistant,
                    content: reply,
                    model: self.model.clone(),
                },
            )
            .await
        {
            Ok(message) => message,
            Err(e) => {
                warn!(chat_id, error = %e, "Failed to store assistant reply");
                sink.fail(&e).await;
                return Err(KapiError::Storage(e));
            }
        };
        if let Err(e) = store.update_chat_activity(chat_id, message.created_at).await {
            warn!(chat_id, error = %e, "Failed to bump chat activity");
        }

        // End the requester's stream before anyone else hears about the reply.
        drop(sink);

        self.coordinator.hub.broadcast_to_user_except_by_client_id(
            self.user_id,
            EventType::MessageCreated,
            &message,
            self.origin_client_id.as_deref(),
        );
        info!(chat_id, message_id = message.id, "Reply stored and broadcast");
        Ok(message)
    }
}

fn idle_error(idle: Duration) -> UpstreamError {
    UpstreamError::Transport(format!("no data from upstream for {idle:?}"))
}

/// Requester side output. Never blocks the upstream read.
struct DirectSink {
    tx: Option<mpsc::Sender<ReplyChunk>>,
    overflowed: Arc<AtomicBool>,
    chat_id: ChatId,
}

impl DirectSink {
    fn forward(&mut self, text: String) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(ReplyChunk::Text(text)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(chat_id = self.chat_id, "Requester is not keeping up, detaching reply stream");
                self.overflowed.store(true, Ordering::Release);
                self.tx = None;
            }
            Err(TrySendError::Closed(_)) => {
                debug!(chat_id = self.chat_id, "Requester went away, continuing without it");
                self.tx = None;
            }
        }
    }

    async fn fail(&mut self, error: &impl Display) {
        if let Some(tx) = self.tx.take() {
            let _ = tx
                .send_timeout(ReplyChunk::Error(error.to_string()), ERROR_SEND_WAIT)
                .await;
        }
    }
}
