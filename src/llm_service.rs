//! Chat-completion providers behind one contract.
//!
//! `LlmClient` implementations are thin HTTP clients. `LlmService` adds the
//! explicit per-call timeout and retry bound, and the degrade-to-text policy
//! for streams.

pub mod groq;
pub mod ollama;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::types::ChatTurn;

pub use groq::GroqClient;
pub use ollama::OllamaClient;

pub const GENERATION_APOLOGY: &str =
    "I apologize, but I'm experiencing technical difficulties. Please try again.";

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("OpenAI-compatible API error: {0}")]
    OpenAI(#[from] async_openai::error::OpenAIError),

    #[error("Provider returned {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("Unexpected response shape: {0}")]
    MalformedResponse(String),

    #[error("Provider returned an empty completion")]
    EmptyResponse,

    #[error("Misconfigured provider: {0}")]
    Misconfigured(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

impl LlmError {
    fn is_retryable(&self) -> bool {
        !matches!(self, LlmError::Misconfigured(_))
    }
}

/// Lazy, finite sequence of text fragments.
pub type TextStream = BoxStream<'static, Result<String, LlmError>>;

#[async_trait]
pub trait LlmClient: Send + Sync {
    fn name(&self) -> &'static str;

    fn model(&self) -> &str;

    async fn generate(&self, messages: &[ChatTurn]) -> Result<String, LlmError>;

    async fn generate_stream(&self, messages: &[ChatTurn]) -> Result<TextStream, LlmError>;
}

#[derive(Clone)]
pub struct LlmService {
    client: Arc<dyn LlmClient>,
    timeout: Duration,
    retries: u32,
}

impl LlmService {
    pub fn new(client: Arc<dyn LlmClient>, timeout: Duration, retries: u32) -> Self {
        Self {
            client,
            timeout,
            retries,
        }
    }

    pub fn provider(&self) -> &'static str {
        self.client.name()
    }

    pub fn model(&self) -> &str {
        self.client.model()
    }

    /// One attempt plus up to `retries` more, each bounded by the timeout.
    /// Whitespace-only completions count as malformed.
    pub async fn generate(&self, messages: &[ChatTurn]) -> Result<String, LlmError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.timeout, self.client.generate(messages)).await {
                Ok(Ok(text)) if text.trim().is_empty() => Err(LlmError::EmptyResponse),
                Ok(result) => result,
                Err(_) => Err(LlmError::Timeout(self.timeout)),
            };

            match result {
                Ok(text) => {
                    info!(
                        "{} ({}) generated {} chars on attempt {}",
                        self.client.name(),
                        self.client.model(),
                        text.len(),
                        attempt
                    );
                    return Ok(text);
                }
                Err(e) if e.is_retryable() && attempt <= self.retries => {
                    warn!("{} attempt {} failed, retrying: {}", self.client.name(), attempt, e);
                }
                Err(e) => {
                    error!("{} generation failed after {} attempt(s): {}", self.client.name(), attempt, e);
                    return Err(e);
                }
            }
        }
    }

    /// Streams fragments from the provider. Opening the stream is bounded by
    /// the timeout; any failure ends the stream with the apology text instead
    /// of an error.
    pub async fn generate_stream(&self, messages: &[ChatTurn]) -> BoxStream<'static, String> {
        let opened = tokio::time::timeout(self.timeout, self.client.generate_stream(messages)).await;
        let stream = match opened {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                error!("{} stream failed to open: {}", self.client.name(), e);
                return futures::stream::once(async { GENERATION_APOLOGY.to_string() }).boxed();
            }
            Err(_) => {
                error!("{} stream timed out after {:?}", self.client.name(), self.timeout);
                return futures::stream::once(async { GENERATION_APOLOGY.to_string() }).boxed();
            }
        };

        let provider = self.client.name();
        stream
            .scan(false, move |failed, item| {
                let next = if *failed {
                    None
                } else {
                    match item {
                        Ok(text) => Some(text),
                        Err(e) => {
                            error!("{} stream failed mid-response: {}", provider, e);
                            *failed = true;
                            Some(GENERATION_APOLOGY.to_string())
                        }
                    }
                };
                futures::future::ready(next)
            })
            .boxed()
    }
}
