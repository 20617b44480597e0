//! Google Gemini `generateContent` backend.
//!
//! Structured output uses `responseMimeType: application/json` with a
//! response schema; tool binding maps onto `functionDeclarations`.

use super::{api_key_from_env, http_client, ChatProvider};
use crate::error::{LlmError, Result};
use crate::{ChatRequest, ChatResponse, Role, ToolCall, Usage};
use async_trait::async_trait;
use serde_json::{json, Value};

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
}

impl GeminiProvider {
    /// Build a provider reading `GOOGLE_API_KEY` from the environment
    pub fn from_env(config: &crate::LlmConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config)?,
            api_key: api_key_from_env("GOOGLE_API_KEY")?,
            api_base: config
                .api_base
                .clone()
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
        })
    }

    fn build_body(&self, request: &ChatRequest) -> Value {
        let mut system_parts = Vec::new();
        let mut contents = Vec::new();

        for message in &request.messages {
            match message.role {
                Role::System => system_parts.push(json!({"text": message.content})),
                Role::Assistant if !message.tool_calls.is_empty() => contents.push(json!({
                    "role": "model",
                    "parts": message.tool_calls.iter().map(|call| json!({
                        "functionCall": {"name": call.name, "args": call.args}
                    })).collect::<Vec<_>>(),
                })),
                Role::Assistant => contents.push(json!({
                    "role": "model",
                    "parts": [{"text": message.content}],
                })),
                Role::Tool => contents.push(json!({
                    "role": "user",
                    "parts": [{
                        "functionResponse": {
                            // Gemini correlates tool results by function name
                            "name": message.tool_call_id,
                            "response": {"content": message.content},
                        }
                    }],
                })),
                Role::User => contents.push(json!({
                    "role": "user",
                    "parts": [{"text": message.content}],
                })),
            }
        }

        let mut body = json!({"contents": contents});
        if !system_parts.is_empty() {
            body["systemInstruction"] = json!({"parts": system_parts});
        }

        let mut generation = serde_json::Map::new();
        if let Some(temperature) = request.params.temperature {
            generation.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(max_tokens) = request.params.max_tokens {
            generation.insert("maxOutputTokens".to_string(), json!(max_tokens));
        }
        if let Some(top_p) = request.params.top_p {
            generation.insert("topP".to_string(), json!(top_p));
        }
        if let Some(schema) = &request.output_schema {
            // Native JSON mode is mutually exclusive with tool calling;
            // when tools are bound the facade falls back to JSON parsing.
            if request.tools.is_empty() {
                generation.insert("responseMimeType".to_string(), json!("application/json"));
                generation.insert("responseSchema".to_string(), schema.clone());
            }
        }
        if !generation.is_empty() {
            body["generationConfig"] = Value::Object(generation);
        }

        if !request.tools.is_empty() {
            body["tools"] = json!([{
                "functionDeclarations": request.tools.iter().map(|tool| json!({
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters,
                })).collect::<Vec<_>>(),
            }]);
        }

        body
    }

    fn parse_response(raw: Value) -> Result<ChatResponse> {
        let candidate = raw["candidates"]
            .get(0)
            .ok_or_else(|| LlmError::InvalidResponse("no candidates in response".to_string()))?;

        let mut content = String::new();
        let mut tool_calls = Vec::new();

        if let Some(parts) = candidate["content"]["parts"].as_array() {
            for (index, part) in parts.iter().enumerate() {
                if let Some(text) = part["text"].as_str() {
                    content.push_str(text);
                }
                if let Some(call) = part.get("functionCall") {
                    tool_calls.push(ToolCall {
                        id: format!("call-{index}"),
                        name: call["name"].as_str().unwrap_or_default().to_string(),
                        args: call["args"].clone(),
                    });
                }
            }
        }

        let usage = Usage::new(
            raw["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0),
            raw["usageMetadata"]["candidatesTokenCount"]
                .as_u64()
                .unwrap_or(0),
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
impl ChatProvider for GeminiProvider {
    fn name(&self) -> &str {
        "google"
    }

    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.api_base, request.params.model, self.api_key
        );
        tracing::debug!(model = %request.params.model, "Calling Gemini generateContent");

        let response = self
            .client
            .post(&url)
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
    use crate::{LlmParams, Message};

    fn provider() -> GeminiProvider {
        GeminiProvider {
            client: reqwest::Client::new(),
            api_key: "test-key".to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }

    #[test]
    fn test_schema_sets_json_mime() {
        let request = ChatRequest::new(
            vec![Message::user("hi")],
            LlmParams::for_model("gemini-1.5-flash"),
        )
        .with_output_schema(json!({"type": "object"}));

        let body = provider().build_body(&request);
        assert_eq!(
            body["generationConfig"]["responseMimeType"],
            "application/json"
        );
    }

    #[test]
    fn test_parse_function_call() {
        let raw = json!({
            "candidates": [{
                "content": {"parts": [
                    {"functionCall": {"name": "search", "args": {"q": "rust"}}}
                ]}
            }],
            "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2}
        });

        let parsed = GeminiProvider::parse_response(raw).unwrap();
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].name, "search");
        assert_eq!(parsed.usage.input_tokens, 4);
    }

    #[test]
    fn test_parse_json_content() {
        let raw = json!({
            "candidates": [{"content": {"parts": [{"text": "{\"result\": 1}"}]}}],
            "usageMetadata": {}
        });

        let parsed = GeminiProvider::parse_response(raw).unwrap();
        assert_eq!(parsed.structured.unwrap()["result"], 1);
    }
}
