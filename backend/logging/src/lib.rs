//! Structured logging for the Kapi backend.
//!
//! Console output (plain or JSON), optional daily-rotated NDJSON files, and
//! secret redaction for anything that may carry credentials.

pub mod logger;
pub mod redact;

pub use logger::{LoggerGuard, init_logger};
pub use redact::redact_sensitive_data;
