//! The provider facade: retries, the tool-using agent loop and
//! structured-output enforcement on top of a [`ChatProvider`].
//!
//! Callers hand over the conversation, the output schema, the bound tools
//! and a validator for the final payload; the facade drives the provider
//! until it has a validated structured answer or a terminal error.

use crate::error::{LlmError, Result};
use crate::providers::ChatProvider;
use crate::retry::RetryPolicy;
use crate::{pricing, ChatRequest, ChatResponse, LlmParams, Message, ToolSpec, Usage};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tooling::Tool;
use tracing::{debug, warn};

const DEFAULT_TOOL_CALL_LIMIT: usize = 8;

const STRICT_HINT: &str =
    "Your previous answer did not match the required schema. Be strict: \
     respond with only a JSON object matching the schema, no prose.";

/// Result of a structured facade call
#[derive(Debug, Clone)]
pub struct StructuredCall {
    /// The validated output value
    pub output: Value,

    /// Token usage accumulated across retries and tool rounds
    pub usage: Usage,

    /// USD cost derived from usage and the price table
    pub cost: f64,

    /// Number of tool rounds the agent loop ran
    pub tool_rounds: usize,
}

/// Uniform LLM client over any [`ChatProvider`]
pub struct LlmClient {
    provider: Arc<dyn ChatProvider>,
    retry: RetryPolicy,
    tool_call_limit: usize,
}

impl LlmClient {
    pub fn new(provider: Arc<dyn ChatProvider>, retry: RetryPolicy) -> Self {
        Self {
            provider,
            retry,
            tool_call_limit: DEFAULT_TOOL_CALL_LIMIT,
        }
    }

    pub fn with_tool_call_limit(mut self, limit: usize) -> Self {
        self.tool_call_limit = limit;
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// One provider round-trip with bounded retries on transient errors
    async fn complete_with_retry(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let mut attempts: u32 = 0;
        loop {
            match self.provider.complete(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(error) if error.is_retryable() => {
                    attempts += 1;
                    if !self.retry.should_retry(attempts) {
                        return Err(error);
                    }
                    let delay = self.retry.delay(attempts - 1);
                    warn!(
                        provider = %self.provider.name(),
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient provider error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Call the provider until it yields a validated structured answer.
    ///
    /// When `tools` is non-empty, runs the agent loop: execute requested
    /// tool calls, feed results back, repeat until a final response or the
    /// tool-call limit. The final payload goes through `validate`; a single
    /// strict re-prompt is attempted on validation failure before the call
    /// fails with [`LlmError::SchemaViolation`].
    pub async fn call_structured<V>(
        &self,
        messages: Vec<Message>,
        output_schema: Value,
        tools: Vec<Arc<dyn Tool>>,
        params: &LlmParams,
        validate: V,
    ) -> Result<StructuredCall>
    where
        V: Fn(&Value) -> std::result::Result<Value, String>,
    {
        let tool_specs: Vec<ToolSpec> = tools
            .iter()
            .map(|tool| ToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.input_schema(),
            })
            .collect();
        let tools_by_name: HashMap<&str, &Arc<dyn Tool>> =
            tools.iter().map(|tool| (tool.name(), tool)).collect();

        let mut conversation = messages;
        let mut usage = Usage::default();
        let mut tool_rounds = 0usize;
        let mut strict_retry_used = false;

        loop {
            let request = ChatRequest::new(conversation.clone(), params.clone())
                .with_output_schema(output_schema.clone())
                .with_tools(tool_specs.clone());

            let response = self.complete_with_retry(&request).await?;
            usage.add(response.usage);

            if !response.tool_calls.is_empty() {
                tool_rounds += 1;
                if tool_rounds > self.tool_call_limit {
                    return Err(LlmError::ToolLoopLimit {
                        limit: self.tool_call_limit,
                    });
                }

                conversation.push(Message::tool_request(response.tool_calls.clone()));
                for call in &response.tool_calls {
                    let tool = tools_by_name.get(call.name.as_str()).ok_or_else(|| {
                        LlmError::InvalidResponse(format!(
                            "model called unbound tool '{}'",
                            call.name
                        ))
                    })?;
                    debug!(tool = %call.name, "Executing tool call");
                    let result = tool.invoke(call.args.clone()).await?;
                    conversation.push(Message::tool_result(&call.id, result.to_string()));
                }
                continue;
            }

            // Final response: native structured output first, then a
            // best-effort JSON parse of the text.
            let raw = response
                .structured
                .clone()
                .or_else(|| extract_json(&response.content));

            let outcome = match &raw {
                Some(value) => validate(value),
                None => Err("response was not valid JSON".to_string()),
            };

            match outcome {
                Ok(output) => {
                    let cost =
                        pricing::cost_for(self.provider.name(), &params.model, &usage);
                    return Ok(StructuredCall {
                        output,
                        usage,
                        cost,
                        tool_rounds,
                    });
                }
                Err(reason) if !strict_retry_used => {
                    strict_retry_used = true;
                    debug!(reason = %reason, "Schema mismatch, re-prompting strictly");
                    conversation.push(Message::assistant(response.content.clone()));
                    conversation.push(Message::user(format!("{STRICT_HINT} ({reason})")));
                }
                Err(reason) => return Err(LlmError::SchemaViolation(reason)),
            }
        }
    }
}

/// Best-effort extraction of a JSON object from free-form model text
fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    // Strip markdown code fences
    let without_fence = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim);
    if let Some(inner) = without_fence {
        if let Ok(value) = serde_json::from_str(inner) {
            return Some(value);
        }
    }

    // Last resort: widest braces span
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}
