//! Log Redaction Layer
//!
//! Scrubs API keys, bearer tokens, and token query parameters from strings prior to logging.

use regex::Regex;
use std::sync::LazyLock;

static API_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(sk-[a-zA-Z0-9\-_]{16,})|(Bearer\s+[a-zA-Z0-9\-\._~+/]+=*)")
        .expect("static regex")
});
static TOKEN_PARAM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([?&]token=)[^&\s]+").expect("static regex"));

/// Redacts sensitive patterns in a string.
pub fn redact_sensitive_data(input: &str) -> String {
    let redacted = API_KEY_RE.replace_all(input, "[REDACTED_TOKEN]");
    TOKEN_PARAM_RE
        .replace_all(&redacted, "${1}[REDACTED_TOKEN]")
        .into_owned()
}
