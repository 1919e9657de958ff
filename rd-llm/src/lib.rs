//! Text-completion client for the ResDesk support agent.
//!
//! Pure HTTP client: one `LlmClient` over OpenAI and Anthropic chat APIs, a
//! `ChatBackend` seam for callers that need to swap the backend, and the
//! bounded retry policy applied to every completion turn.

mod anthropic;
mod client;
mod error;
mod openai;
mod retry;
mod types;

pub use client::{ChatBackend, LlmClient, Provider};
pub use error::{LlmError, Result};
pub use retry::{RetryPolicy, chat_with_retry};
pub use types::{ChatMessage, ChatResponse, Role, Usage};
