//! Model backends that stream generated text.
//!
//! A backend turns a [`GenerateRequest`] into a lazy, finite stream of
//! [`GenerationChunk`]s. The final chunk has `done = true` and may carry an
//! opaque [`ContinuationToken`] for the next request in the conversation.
//! Dropping the stream aborts the underlying request.

pub mod ollama;

pub use ollama::OllamaClient;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

/// Opaque conversation state returned by the backend.
///
/// Never inspected locally; handed back verbatim on the next request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContinuationToken(serde_json::Value);

impl ContinuationToken {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}

/// A single generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub continuation: Option<ContinuationToken>,
}

impl GenerateRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            system_prompt: None,
            continuation: None,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: Option<String>) -> Self {
        self.system_prompt = system_prompt;
        self
    }

    pub fn with_continuation(mut self, continuation: Option<ContinuationToken>) -> Self {
        self.continuation = continuation;
        self
    }
}

/// One increment of generated text.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationChunk {
    /// Newly generated text; may be empty
    pub delta: String,
    /// True on the last chunk of the stream
    pub done: bool,
    /// Present only when `done` is true
    pub continuation: Option<ContinuationToken>,
}

impl GenerationChunk {
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            delta: text.into(),
            done: false,
            continuation: None,
        }
    }

    pub fn done(continuation: Option<ContinuationToken>) -> Self {
        Self {
            delta: String::new(),
            done: true,
            continuation,
        }
    }
}

/// Backend failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// The backend could not be reached at all
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The stream broke after it started
    #[error("stream error: {0}")]
    Stream(String),

    #[error("invalid backend response: {0}")]
    Decode(String),

    /// No delta arrived within the allowed window
    #[error("no output from backend for {0:?}")]
    Timeout(Duration),
}

/// Lazily produced generation output.
pub type GenerationStream =
    Pin<Box<dyn Stream<Item = Result<GenerationChunk, BackendError>> + Send>>;

/// A text generation backend.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Start a streaming generation.
    ///
    /// Errors returned here mean nothing was generated.
    async fn generate(&self, request: GenerateRequest) -> Result<GenerationStream, BackendError>;

    /// Names of the models the backend can serve.
    async fn list_models(&self) -> Result<Vec<String>, BackendError>;

    /// Whether the backend answers at all.
    async fn check_connection(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_continuation_token_is_transparent() {
        let token = ContinuationToken::new(serde_json::json!([1, 2, 3]));
        assert_eq!(serde_json::to_string(&token).unwrap(), "[1,2,3]");
        assert_eq!(token.as_value(), &serde_json::json!([1, 2, 3]));
    }

    #[test]
    fn test_request_builder() {
        let token = ContinuationToken::new(serde_json::json!([7]));
        let request = GenerateRequest::new("llama3", "hi")
            .with_system_prompt(Some("be brief".into()))
            .with_continuation(Some(token.clone()));
        assert_eq!(request.model, "llama3");
        assert_eq!(request.system_prompt.as_deref(), Some("be brief"));
        assert_eq!(request.continuation, Some(token));
    }

    #[test]
    fn test_done_chunk_has_no_delta() {
        let chunk = GenerationChunk::done(None);
        assert!(chunk.done);
        assert!(chunk.delta.is_empty());
        assert!(!GenerationChunk::delta("x").done);
    }
}
