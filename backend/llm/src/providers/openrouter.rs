use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn};

use kapi_core::{ChunkStream, ConversationTurn, LlmProvider, LlmStreamRequest, UpstreamError};
use kapi_logging::redact_sensitive_data;

use crate::sse::delta_stream;

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// OpenRouter.ai streaming chat-completions provider.
pub struct OpenRouterProvider {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    referer: String,
    title: String,
}

impl OpenRouterProvider {
    /// A provider without a key fails every request with
    /// [`UpstreamError::NotConfigured`] instead of refusing to start.
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .build()
                .unwrap_or_else(|e| {
                    warn!(error = %e, "Falling back to default HTTP client");
                    Client::new()
                }),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            base_url: DEFAULT_BASE_URL.to_string(),
            referer: "http://localhost:8080".to_string(),
            title: "Kapi".to_string(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Values for the `HTTP-Referer` and `X-Title` attribution headers.
    pub fn with_app_identity(mut self, referer: impl Into<String>, title: impl Into<String>) -> Self {
        self.referer = referer.into();
        self.title = title.into();
        self
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ConversationTurn],
    stream: bool,
}

#[async_trait]
impl LlmProvider for OpenRouterProvider {
    fn name(&self) -> &str {
        "openrouter"
    }

    async fn open_stream(&self, request: &LlmStreamRequest) -> Result<ChunkStream, UpstreamError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| UpstreamError::NotConfigured("OPENROUTER_API_KEY is not set".into()))?;

        let body = ChatRequest {
            model: &request.model,
            messages: &request.messages,
            stream: true,
        };

        debug!(
            model = %request.model,
            turns = request.messages.len(),
            "Opening OpenRouter stream"
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {api_key}"))
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", &self.title)
            .json(&body)
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(redact_sensitive_data(&e.to_string())))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let error_body = redact_sensitive_data(&error_body);
            warn!(status = status.as_u16(), body = %error_body, "OpenRouter rejected stream");
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body: error_body,
            });
        }

        Ok(delta_stream(response.bytes_stream()))
    }
}
