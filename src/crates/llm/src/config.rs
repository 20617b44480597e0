//! Provider configuration and per-node override merging.

use crate::retry::RetryPolicy;
use crate::LlmParams;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

/// Configuration for an LLM backend.
///
/// This is the shape of the `config.llm` block in workflow documents and of
/// per-node `llm` overrides (all fields optional in the override; see
/// [`LlmOverride`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider name: openai, anthropic, google or ollama
    pub provider: String,

    /// Model name/identifier
    pub model: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,

    /// Base URL override (Ollama host, Azure-style endpoints, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_seconds: u64,

    /// Maximum retries for transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl LlmConfig {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            temperature: None,
            max_tokens: None,
            top_p: None,
            api_base: None,
            timeout_seconds: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = Some(api_base.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_seconds = timeout.as_secs();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Retry policy derived from `max_retries`
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries)
    }

    /// Apply a per-node override, field-wise. Node values win.
    pub fn merged_with(&self, over: &LlmOverride) -> LlmConfig {
        LlmConfig {
            provider: over.provider.clone().unwrap_or_else(|| self.provider.clone()),
            model: over.model.clone().unwrap_or_else(|| self.model.clone()),
            temperature: over.temperature.or(self.temperature),
            max_tokens: over.max_tokens.or(self.max_tokens),
            top_p: over.top_p.or(self.top_p),
            api_base: over.api_base.clone().or_else(|| self.api_base.clone()),
            timeout_seconds: over.timeout_seconds.unwrap_or(self.timeout_seconds),
            max_retries: over.max_retries.unwrap_or(self.max_retries),
        }
    }

    /// Sampling parameters for a single call
    pub fn params(&self) -> LlmParams {
        LlmParams {
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            top_p: self.top_p,
            extras: serde_json::Map::new(),
        }
    }
}

/// Per-node LLM override: every field optional, merged over the global
/// config field-wise.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmOverride {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
    pub api_base: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub max_retries: Option<u32>,
}
