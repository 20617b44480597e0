//! Provider implementations behind the uniform [`ChatProvider`] trait.
//!
//! Each backend registers under a stable name string. API keys are read by
//! the provider constructors themselves (the engine core reads no
//! environment variables).

mod anthropic;
mod gemini;
mod ollama;
mod openai;

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;

use crate::config::LlmConfig;
use crate::error::{LlmError, Result};
use crate::{ChatRequest, ChatResponse};
use async_trait::async_trait;
use std::sync::Arc;

/// Uniform call interface over LLM backends.
///
/// Implementations perform one provider round-trip per `complete` call:
/// the agent loop, retries and schema enforcement live in the facade, not
/// here. Implementations are free to stream internally; callers always see
/// a completed response.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Stable provider name (matches the registry key)
    fn name(&self) -> &str;

    /// Perform a single completion round-trip
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse>;
}

impl std::fmt::Debug for dyn ChatProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatProvider").field("name", &self.name()).finish()
    }
}

/// Names accepted by [`create_provider`]
pub fn provider_names() -> &'static [&'static str] {
    &["openai", "anthropic", "google", "ollama"]
}

/// Construct a provider from configuration by its stable name
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn ChatProvider>> {
    match config.provider.to_lowercase().as_str() {
        "openai" => Ok(Arc::new(OpenAiProvider::from_env(config)?)),
        "anthropic" => Ok(Arc::new(AnthropicProvider::from_env(config)?)),
        "google" => Ok(Arc::new(GeminiProvider::from_env(config)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        other => Err(LlmError::UnknownProvider {
            name: other.to_string(),
            available: provider_names().join(", "),
        }),
    }
}

/// Shared helper: read an API key from the environment
pub(crate) fn api_key_from_env(var: &str) -> Result<String> {
    std::env::var(var).map_err(|_| LlmError::ApiKeyNotFound(var.to_string()))
}

/// Shared helper: an HTTP client honoring the configured timeout
pub(crate) fn http_client(config: &LlmConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(config.timeout())
        .build()
        .map_err(LlmError::Http)
}
