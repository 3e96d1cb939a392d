use thiserror::Error;

/// Top-level error type for chat operations.
#[derive(Debug, Error)]
pub enum KapiError {
    /// The chat does not exist or is owned by someone else. The two cases are
    /// deliberately indistinguishable to the caller.
    #[error("chat not found or access denied")]
    NotFoundOrDenied,

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Failures of the upstream LLM producer.
///
/// The `Display` output is what the requesting client sees appended to its
/// partial reply, so it stays short and free of credentials.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("upstream provider is not configured: {0}")]
    NotConfigured(String),

    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("upstream transport failure: {0}")]
    Transport(String),

    #[error("upstream stream decode failure: {0}")]
    Decode(String),
}

impl KapiError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }
}
