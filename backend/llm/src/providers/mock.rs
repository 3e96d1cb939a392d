use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use kapi_core::{ChunkStream, LlmProvider, LlmStreamRequest, UpstreamError};

/// A scripted provider that replays canned deltas.
#[derive(Default)]
pub struct MockProvider {
    chunks: Vec<String>,
    fail_after: Option<(usize, String)>,
    stall_after: Option<usize>,
    reject: Option<(u16, String)>,
    delay: Option<Duration>,
    last_request: Mutex<Option<LlmStreamRequest>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunks<I, S>(mut self, chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.chunks = chunks.into_iter().map(Into::into).collect();
        self
    }

    /// Emit the first `count` chunks, then a transport error.
    pub fn failing_after(mut self, count: usize, message: impl Into<String>) -> Self {
        self.fail_after = Some((count, message.into()));
        self
    }

    /// Emit the first `count` chunks, then go silent without ending.
    pub fn stalling_after(mut self, count: usize) -> Self {
        self.stall_after = Some(count);
        self
    }

    /// Refuse to open the stream with a non-success status.
    pub fn rejecting(mut self, status: u16, body: impl Into<String>) -> Self {
        self.reject = Some((status, body.into()));
        self
    }

    /// Sleep before every chunk.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// The most recent request passed to `open_stream`.
    pub fn last_request(&self) -> Option<LlmStreamRequest> {
        self.last_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn open_stream(&self, request: &LlmStreamRequest) -> Result<ChunkStream, UpstreamError> {
        *self
            .last_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(request.clone());

        if let Some((status, body)) = &self.reject {
            return Err(UpstreamError::Status {
                status: *status,
                body: body.clone(),
            });
        }

        let emitted = match (&self.fail_after, self.stall_after) {
            (Some((count, _)), _) => *count,
            (None, Some(count)) => count,
            (None, None) => self.chunks.len(),
        };
        let mut items: Vec<Result<String, UpstreamError>> =
            self.chunks.iter().take(emitted).cloned().map(Ok).collect();
        if let Some((_, message)) = &self.fail_after {
            items.push(Err(UpstreamError::Transport(message.clone())));
        }

        let delay = self.delay;
        let stream = futures::stream::iter(items).then(move |item| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            item
        });
        if self.stall_after.is_some() {
            return Ok(Box::pin(stream.chain(futures::stream::pending())));
        }
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> LlmStreamRequest {
        LlmStreamRequest {
            model: "mock-model".into(),
            messages: vec![],
        }
    }

    #[tokio::test]
    async fn test_replays_chunks() {
        let provider = MockProvider::new().with_chunks(["a", "b"]);
        let Ok(stream) = provider.open_stream(&request()).await else {
            panic!("stream should open");
        };
        let out: Vec<_> = stream.collect().await;
        assert_eq!(out, vec![Ok("a".to_string()), Ok("b".to_string())]);
        assert_eq!(provider.last_request().unwrap().model, "mock-model");
    }

    #[tokio::test]
    async fn test_failing_after() {
        let provider = MockProvider::new()
            .with_chunks(["a", "b", "c"])
            .failing_after(1, "boom");
        let Ok(stream) = provider.open_stream(&request()).await else {
            panic!("stream should open");
        };
        let out: Vec<_> = stream.collect().await;
        assert_eq!(
            out,
            vec![Ok("a".to_string()), Err(UpstreamError::Transport("boom".into()))]
        );
    }

    #[tokio::test]
    async fn test_stalling_after() {
        let provider = MockProvider::new()
            .with_chunks(["a", "b"])
            .stalling_after(1);
        let Ok(mut stream) = provider.open_stream(&request()).await else {
            panic!("stream should open");
        };
        assert_eq!(stream.next().await, Some(Ok("a".to_string())));
        let silent = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(silent.is_err());
    }

    #[tokio::test]
    async fn test_rejecting() {
        let provider = MockProvider::new().rejecting(401, "bad key");
        assert!(matches!(
            provider.open_stream(&request()).await,
            Err(UpstreamError::Status { status: 401, .. })
        ));
    }
}
