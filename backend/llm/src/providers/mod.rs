pub mod mock;
pub mod openrouter;
