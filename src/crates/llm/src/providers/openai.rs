//! OpenAI chat-completions backend.
//!
//! Structured output goes through `response_format: {type: "json_schema"}`;
//! tool binding through the standard `tools` array.

use super::{api_key_from_env, http_client, ChatProvider};
use crate::error::{LlmError, Result};
use crate::{ChatRequest, ChatResponse, Message, Role, ToolCall, Usage};
use async_trait::async_trait;
use serde_json::{json, Value};

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
}

impl OpenAiProvider {
    /// Build a provider reading `OPENAI_API_KEY` from the environment
    pub fn from_env(config: &crate::LlmConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config)?,
            api_key: api_key_from_env("OPENAI_API_KEY")?,
            api_base: config
                .api_base
                .clone()
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
        })
    }

    fn encode_message(message: &Message) -> Value {
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
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": {
                                "name": call.name,
                                "arguments": call.args.to_string(),
                            }
                        })
                    })
                    .collect(),
            );
        }
        if let Some(id) = &message.tool_call_id {
            encoded["tool_call_id"] = json!(id);
        }
        encoded
    }

    fn build_body(&self, request: &ChatRequest) -> Value {
        let mut body = json!({
            "model": request.params.model,
            "messages": request.messages.iter().map(Self::encode_message).collect::<Vec<_>>(),
        });

        if let Some(temperature) = request.params.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = request.params.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(top_p) = request.params.top_p {
            body["top_p"] = json!(top_p);
        }
        for (key, value) in &request.params.extras {
            body[key] = value.clone();
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

        if let Some(schema) = &request.output_schema {
            body["response_format"] = json!({
                "type": "json_schema",
                "json_schema": {
                    "name": "node_output",
                    "schema": schema,
                    "strict": true,
                }
            });
        }

        body
    }

    fn parse_response(raw: Value) -> Result<ChatResponse> {
        let choice = raw["choices"]
            .get(0)
            .ok_or_else(|| LlmError::InvalidResponse("no choices in response".to_string()))?;
        let message = &choice["message"];

        let content = message["content"].as_str().unwrap_or_default().to_string();

        let tool_calls = message["tool_calls"]
            .as_array()
            .map(|calls| {
                calls
                    .iter()
                    .filter_map(|call| {
                        let function = &call["function"];
                        let args: Value = function["arguments"]
                            .as_str()
                            .and_then(|s| serde_json::from_str(s).ok())
                            .unwrap_or(Value::Null);
                        Some(ToolCall {
                            id: call["id"].as_str()?.to_string(),
                            name: function["name"].as_str()?.to_string(),
                            args,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let usage = Usage::new(
            raw["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            raw["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        );

        // JSON mode delivers the structured payload as the content string
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
impl ChatProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.api_base);
        tracing::debug!(model = %request.params.model, "Calling OpenAI chat completions");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LlmParams, ToolSpec};

    fn provider() -> OpenAiProvider {
        OpenAiProvider {
            client: reqwest::Client::new(),
            api_key: "test-key".to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }

    #[test]
    fn test_body_includes_tools_and_schema() {
        let request = ChatRequest::new(
            vec![Message::user("hi")],
            LlmParams::for_model("gpt-4o").with_temperature(0.1),
        )
        .with_tools(vec![ToolSpec {
            name: "search".to_string(),
            description: "Web search".to_string(),
            parameters: json!({"type": "object"}),
        }])
        .with_output_schema(json!({"type": "object"}));

        let body = provider().build_body(&request);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["temperature"], 0.1);
        assert_eq!(body["tools"][0]["function"]["name"], "search");
        assert_eq!(body["response_format"]["type"], "json_schema");
    }

    #[test]
    fn test_parse_response_with_tool_calls() {
        let raw = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call-1",
                        "function": {"name": "search", "arguments": "{\"q\": \"rust\"}"}
                    }]
                }
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3}
        });

        let parsed = OpenAiProvider::parse_response(raw).unwrap();
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].name, "search");
        assert_eq!(parsed.tool_calls[0].args["q"], "rust");
        assert_eq!(parsed.usage.input_tokens, 12);
    }

    #[test]
    fn test_parse_response_structured_content() {
        let raw = json!({
            "choices": [{"message": {"content": "{\"result\": \"ok\"}"}}],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1}
        });

        let parsed = OpenAiProvider::parse_response(raw).unwrap();
        assert_eq!(parsed.structured.unwrap()["result"], "ok");
    }

    #[test]
    fn test_parse_response_requires_choices() {
        let raw = json!({"choices": []});
        assert!(OpenAiProvider::parse_response(raw).is_err());
    }
}
