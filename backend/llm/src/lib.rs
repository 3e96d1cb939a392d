pub mod providers;
pub mod sse;

pub use providers::mock::MockProvider;
pub use providers::openrouter::OpenRouterProvider;
pub use sse::{delta_stream, parse_line, SseLine};
