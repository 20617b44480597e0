//! LLM provider facade for agentflow.
//!
//! This crate provides a uniform call interface over multiple LLM backends
//! with structured-output and tool-binding support. Workflow nodes never
//! talk to a provider SDK directly; they go through [`LlmClient`], which
//! layers retries, the tool-using agent loop, structured-output enforcement
//! and cost accounting on top of the [`ChatProvider`] trait.
//!
//! # Providers
//!
//! - **openai** — OpenAI chat completions (JSON mode, tool calling)
//! - **anthropic** — Anthropic messages API
//! - **google** — Google Gemini `generateContent`
//! - **ollama** — local Ollama server; reports zero cost
//!
//! Providers register by a stable name string; see
//! [`providers::create_provider`].
//!
//! # Example
//!
//! ```rust,ignore
//! use llm::{LlmClient, LlmParams, Message};
//! use llm::providers::create_provider;
//! use llm::config::LlmConfig;
//!
//! let config = LlmConfig::new("ollama", "llama3");
//! let provider = create_provider(&config)?;
//! let client = LlmClient::new(provider, config.retry_policy());
//!
//! let call = client
//!     .call_structured(
//!         vec![Message::user("Summarize: the quick brown fox")],
//!         serde_json::json!({"type": "object", "properties": {"result": {"type": "string"}}}),
//!         vec![],
//!         &LlmParams::for_model("llama3"),
//!         |raw| Ok(raw.clone()),
//!     )
//!     .await?;
//! println!("{} tokens, ${:.4}", call.usage.total(), call.cost);
//! ```

pub mod config;
pub mod error;
pub mod facade;
pub mod pricing;
pub mod providers;
pub mod retry;
pub mod testing;

pub use config::LlmConfig;
pub use error::{LlmError, Result};
pub use facade::{LlmClient, StructuredCall};
pub use providers::{create_provider, provider_names, ChatProvider};
pub use retry::RetryPolicy;

use serde::{Deserialize, Serialize};

/// Role of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single chat message exchanged with a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,

    /// Text content; empty for pure tool-call messages
    #[serde(default)]
    pub content: String,

    /// Tool calls requested by the assistant
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// For `Role::Tool` messages: the call this result answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Assistant message carrying tool calls
    pub fn tool_request(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            tool_calls,
            tool_call_id: None,
        }
    }

    /// Tool result message answering `call_id`
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
}

/// Declaration of a tool offered to the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Token usage reported by a provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Accumulate another usage record into this one
    pub fn add(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Per-call sampling and limit parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmParams {
    pub model: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,

    /// Provider-specific extras forwarded verbatim
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extras: serde_json::Map<String, serde_json::Value>,
}

impl LlmParams {
    pub fn for_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: None,
            max_tokens: None,
            top_p: None,
            extras: serde_json::Map::new(),
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_top_p(mut self, top_p: f64) -> Self {
        self.top_p = Some(top_p);
        self
    }
}

/// A request to a chat provider
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<Message>,

    /// JSON schema the final answer must conform to
    pub output_schema: Option<serde_json::Value>,

    /// Tools the model may call
    pub tools: Vec<ToolSpec>,

    pub params: LlmParams,
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>, params: LlmParams) -> Self {
        Self {
            messages,
            output_schema: None,
            tools: Vec::new(),
            params,
        }
    }

    pub fn with_output_schema(mut self, schema: serde_json::Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }
}

/// A completed provider response
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Final text content (may be empty when tool calls are present)
    pub content: String,

    /// Structured output when the provider enforced it natively
    pub structured: Option<serde_json::Value>,

    /// Tool calls requested by the model
    pub tool_calls: Vec<ToolCall>,

    pub usage: Usage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        assert_eq!(Message::system("s").role, Role::System);
        assert_eq!(Message::user("u").role, Role::User);
        assert_eq!(Message::assistant("a").role, Role::Assistant);

        let result = Message::tool_result("call-1", "ok");
        assert_eq!(result.role, Role::Tool);
        assert_eq!(result.tool_call_id.as_deref(), Some("call-1"));
    }

    #[test]
    fn test_usage_accumulation() {
        let mut usage = Usage::new(10, 5);
        usage.add(Usage::new(3, 2));
        assert_eq!(usage.input_tokens, 13);
        assert_eq!(usage.output_tokens, 7);
        assert_eq!(usage.total(), 20);
    }

    #[test]
    fn test_params_builder() {
        let params = LlmParams::for_model("gpt-4o")
            .with_temperature(0.2)
            .with_max_tokens(1024)
            .with_top_p(0.9);

        assert_eq!(params.model, "gpt-4o");
        assert_eq!(params.temperature, Some(0.2));
        assert_eq!(params.max_tokens, Some(1024));
        assert_eq!(params.top_p, Some(0.9));
    }
}
