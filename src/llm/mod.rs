//! Chat-model adapter.
//!
//! The orchestration kernel only ever sees [`ChatModel`]: a request goes in,
//! a finite stream of typed chunks comes out, then the stream closes. The
//! production implementation lives in [`ark`]; tests script their own.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::config::ThinkingMode;

pub mod ark;

pub use ark::ArkClient;

/// Error type for model calls.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("model provider not configured: {0}")]
    NotConfigured(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("provider returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("stream decode error: {0}")]
    Decode(String),

    #[error("request timed out")]
    Timeout,

    #[error("call aborted: {0}")]
    Aborted(String),
}

impl LlmError {
    /// Whether a retry has any chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) | Self::Timeout => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::NotConfigured(_) | Self::Decode(_) | Self::Aborted(_) => false,
        }
    }
}

/// Result type for model calls.
pub type LlmResult<T> = Result<T, LlmError>;

/// One typed increment of a streaming model response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// Report text increment.
    OutputDelta(String),
    /// Thinking/reasoning text increment.
    ThinkingDelta(String),
    /// The provider-side web-search tool started.
    SearchStarted,
    /// The web-search tool finished; `sources` are the result URLs.
    SearchCompleted { sources: Vec<String> },
}

/// A finite sequence of chunks, then close.
pub type ChunkStream = Pin<Box<dyn Stream<Item = LlmResult<StreamChunk>> + Send>>;

/// One model invocation.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub use_websearch: bool,
    pub websearch_limit: u32,
    pub thinking_mode: ThinkingMode,
}

impl ChatRequest {
    pub fn new(model: &str, system_prompt: &str, user_prompt: &str) -> Self {
        Self {
            model: model.to_string(),
            system_prompt: system_prompt.to_string(),
            user_prompt: user_prompt.to_string(),
            use_websearch: false,
            websearch_limit: 0,
            thinking_mode: ThinkingMode::Disabled,
        }
    }

    pub fn with_websearch(mut self, enabled: bool, limit: u32) -> Self {
        self.use_websearch = enabled;
        self.websearch_limit = limit;
        self
    }

    pub fn with_thinking(mut self, mode: ThinkingMode) -> Self {
        self.thinking_mode = mode;
        self
    }
}

/// An opaque streaming chat-completion endpoint.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Start a streaming completion. The returned stream yields a finite
    /// sequence of chunks and then closes; an `Err` item terminates it.
    async fn stream_chat(&self, request: ChatRequest) -> LlmResult<ChunkStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(LlmError::Http("connection reset".into()).is_transient());
        assert!(LlmError::Timeout.is_transient());
        assert!(LlmError::Status {
            status: 429,
            message: "slow down".into()
        }
        .is_transient());
        assert!(LlmError::Status {
            status: 503,
            message: "overloaded".into()
        }
        .is_transient());
        assert!(!LlmError::Status {
            status: 401,
            message: "bad key".into()
        }
        .is_transient());
        assert!(!LlmError::NotConfigured("no key".into()).is_transient());
        assert!(!LlmError::Aborted("cancelled".into()).is_transient());
    }

    #[test]
    fn test_request_builder() {
        let request = ChatRequest::new("model-a", "sys", "user")
            .with_websearch(true, 15)
            .with_thinking(crate::config::ThinkingMode::Enabled);
        assert!(request.use_websearch);
        assert_eq!(request.websearch_limit, 15);
        assert_eq!(request.thinking_mode, crate::config::ThinkingMode::Enabled);
    }
}
