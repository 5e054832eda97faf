//! Language-model generation
//!
//! Providers are a flat capability set behind [`LlmProvider`], held in a
//! priority-ordered list by the [`LlmOrchestrator`], which owns fallback,
//! health tracking and the streaming state machine.

mod anthropic;
mod events;
mod gemini;
mod http;
mod openai;
mod orchestrator;
mod sse;

pub use anthropic::AnthropicProvider;
pub use events::{SinkError, StreamEvent, StreamSink, StreamState};
pub use gemini::GeminiProvider;
pub use http::HttpSettings;
pub use openai::OpenAiProvider;
pub use orchestrator::{GenerationError, GenerationOutcome, LlmOrchestrator, ProviderStatus};
pub use sse::{delta_stream, SseAction, SseEvent, SseParser};

use crate::types::Usage;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;
use thiserror::Error;

/// Per-provider failure, triggers fallback to the next provider
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Protocol(String),

    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    /// Map a non-success HTTP status to a failure kind
    pub fn from_status(status: u16, body: &str) -> Self {
        let message: String = body.chars().take(200).collect();
        match status {
            401 | 403 => ProviderError::Auth(message),
            429 => ProviderError::RateLimited(message),
            _ => ProviderError::Http { status, message },
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout(Duration::ZERO)
        } else if err.is_decode() {
            ProviderError::Protocol(err.to_string())
        } else {
            ProviderError::Transport(err.to_string())
        }
    }
}

/// Prompt plus sampling settings sent to a provider
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Complete blocking generation
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub usage: Option<Usage>,
}

/// Incremental text deltas from a streaming generation
pub type DeltaStream = BoxStream<'static, Result<String, ProviderError>>;

/// Generation provider capability set
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Name used for preference matching and reporting
    fn name(&self) -> &str;

    fn model_name(&self) -> &str;

    /// Cheap availability probe; an `Err` skips the provider for this query
    async fn healthcheck(&self) -> Result<(), ProviderError>;

    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, ProviderError>;

    /// Open a delta stream; dropping the stream cancels the generation
    async fn generate_stream(&self, request: &GenerationRequest)
        -> Result<DeltaStream, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(ProviderError::from_status(401, ""), ProviderError::Auth(_)));
        assert!(matches!(ProviderError::from_status(403, ""), ProviderError::Auth(_)));
        assert!(matches!(
            ProviderError::from_status(429, "slow down"),
            ProviderError::RateLimited(_)
        ));
        assert_eq!(
            ProviderError::from_status(500, "boom"),
            ProviderError::Http {
                status: 500,
                message: "boom".to_string()
            }
        );
    }
}
