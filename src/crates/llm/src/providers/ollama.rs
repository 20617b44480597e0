//! Local Ollama backend (`/api/chat`).
//!
//! No API key; structured output uses Ollama's `format` parameter. Runs
//! report zero cost.

use super::{http_client, ChatProvider};
use crate::error::{LlmError, Result};
use crate::{ChatRequest, ChatResponse, Role, ToolCall, Usage};
use async_trait::async_trait;
use serde_json::{json, Value};

const DEFAULT_API_BASE: &str = "http://localhost:11434";

pub struct OllamaProvider {
    client: reqwest::Client,
    api_base: String,
}

impl OllamaProvider {
    pub fn new(config: &crate::LlmConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config)?,
            api_base: config
                .api_base
                .clone()
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
        })
    }

    fn build_body(&self, request: &ChatRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|message| {
                let role = match message.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::Tool => "tool",
                };
                let mut encoded = json!({"role": role, "content": message.content});
                if !message.tool_calls.is_empty() {
                    encoded["tool_calls"] = Value::Array(
                        message
                            .tool_calls
                            .iter()
                            .map(|call| {
                                json!({"function": {"name": call.name, "arguments": call.args}})
                            })
                            .collect(),
                    );
                }
                encoded
            })
            .collect();

        let mut body = json!({
            "model": request.params.model,
            "messages": messages,
            "stream": false,
        });

        let mut options = serde_json::Map::new();
        if let Some(temperature) = request.params.temperature {
            options.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(max_tokens) = request.params.max_tokens {
            options.insert("num_predict".to_string(), json!(max_tokens));
        }
        if let Some(top_p) = request.params.top_p {
            options.insert("top_p".to_string(), json!(top_p));
        }
        if !options.is_empty() {
            body["options"] = Value::Object(options);
        }

        if let Some(schema) = &request.output_schema {
            body["format"] = schema.clone();
        }

        if !request.tools.is_empty() {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": tool.name,
                                "description": tool.description,
                                "parameters": tool.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }

        body
    }

    fn parse_response(raw: Value) -> Result<ChatResponse> {
        let message = raw
            .get("message")
            .ok_or_else(|| LlmError::InvalidResponse("missing message".to_string()))?;

        let content = message["content"].as_str().unwrap_or_default().to_string();

        let tool_calls = message["tool_calls"]
            .as_array()
            .map(|calls| {
                calls
                    .iter()
                    .enumerate()
                    .map(|(index, call)| ToolCall {
                        id: format!("call-{index}"),
                        name: call["function"]["name"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string(),
                        args: call["function"]["arguments"].clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let usage = Usage::new(
            raw["prompt_eval_count"].as_u64().unwrap_or(0),
            raw["eval_count"].as_u64().unwrap_or(0),
        );

        let structured = serde_json::from_str(&content).ok();

        Ok(ChatResponse {
            content,
            structured,
            tool_calls,
            usage,
        })
    }
}

#[async_trait]
impl ChatProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/api/chat", self.api_base);
        tracing::debug!(model = %request.params.model, "Calling Ollama chat");

        let response = self
            .client
            .post(&url)
            .json(&self.build_body(&request))
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    LlmError::ServiceUnavailable(format!(
                        "Ollama not reachable at {}: {e}",
                        self.api_base
                    ))
                } else {
                    LlmError::Http(e)
                }
            })?;

        let status = response.status().as_u16();
        if status >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status, body));
        }

        Self::parse_response(response.json().await?)
    }
}
