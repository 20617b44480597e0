//! Anthropic messages-API backend.
//!
//! Structured output is enforced through a forced tool call carrying the
//! output schema; regular tool binding maps onto the native `tools` array.

use super::{api_key_from_env, http_client, ChatProvider};
use crate::error::{LlmError, Result};
use crate::{ChatRequest, ChatResponse, Role, ToolCall, Usage};
use async_trait::async_trait;
use serde_json::{json, Value};

const DEFAULT_API_BASE: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const OUTPUT_TOOL: &str = "emit_output";

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
}

impl AnthropicProvider {
    /// Build a provider reading `ANTHROPIC_API_KEY` from the environment
    pub fn from_env(config: &crate::LlmConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config)?,
            api_key: api_key_from_env("ANTHROPIC_API_KEY")?,
            api_base: config
                .api_base
                .clone()
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
        })
    }

    fn build_body(&self, request: &ChatRequest) -> Value {
        // System messages ride in the top-level `system` field
        let system: Vec<&str> = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();

        let messages: Vec<Value> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| match m.role {
                Role::Assistant if !m.tool_calls.is_empty() => json!({
                    "role": "assistant",
                    "content": m.tool_calls.iter().map(|call| json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.args,
                    })).collect::<Vec<_>>(),
                }),
                Role::Tool => json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": m.tool_call_id,
                        "content": m.content,
                    }],
                }),
                Role::Assistant => json!({"role": "assistant", "content": m.content}),
                _ => json!({"role": "user", "content": m.content}),
            })
            .collect();

        let mut body = json!({
            "model": request.params.model,
            "max_tokens": request.params.max_tokens.unwrap_or(4096),
            "messages": messages,
        });
        if !system.is_empty() {
            body["system"] = json!(system.join("\n\n"));
        }
        if let Some(temperature) = request.params.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(top_p) = request.params.top_p {
            body["top_p"] = json!(top_p);
        }

        let mut tools: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.parameters,
                })
            })
            .collect();

        if let Some(schema) = &request.output_schema {
            tools.push(json!({
                "name": OUTPUT_TOOL,
                "description": "Emit the final structured answer",
                "input_schema": schema,
            }));
            // Only force the output tool when no real tools compete for it
            if request.tools.is_empty() {
                body["tool_choice"] = json!({"type": "tool", "name": OUTPUT_TOOL});
            }
        }
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
        }

        body
    }

    fn parse_response(raw: Value) -> Result<ChatResponse> {
        let blocks = raw["content"]
            .as_array()
            .ok_or_else(|| LlmError::InvalidResponse("missing content blocks".to_string()))?;

        let mut content = String::new();
        let mut structured = None;
        let mut tool_calls = Vec::new();

        for block in blocks {
            match block["type"].as_str() {
                Some("text") => content.push_str(block["text"].as_str().unwrap_or_default()),
                Some("tool_use") => {
                    let name = block["name"].as_str().unwrap_or_default().to_string();
                    if name == OUTPUT_TOOL {
                        structured = Some(block["input"].clone());
                    } else {
                        tool_calls.push(ToolCall {
                            id: block["id"].as_str().unwrap_or_default().to_string(),
                            name,
                            args: block["input"].clone(),
                        });
                    }
                }
                _ => {}
            }
        }

        let usage = Usage::new(
            raw["usage"]["input_tokens"].as_u64().unwrap_or(0),
            raw["usage"]["output_tokens"].as_u64().unwrap_or(0),
        );

        Ok(ChatResponse {
            content,
            structured,
            tool_calls,
            usage,
        })
    }
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/v1/messages", self.api_base);
        tracing::debug!(model = %request.params.model, "Calling Anthropic messages API");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&self.build_body(&request))
            .send()
            .await?;

        let status = response.status().as_u16();
        if status >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status, body));
        }

        Self::parse_response(response.json().await?)
    }
}
