//! Scripted provider for tests.
//!
//! Returns a queued sequence of responses and errors so engine behavior
//! (retries, agent loops, schema enforcement, workflow scenarios) can be
//! exercised without the network.

use crate::error::{LlmError, Result};
use crate::providers::ChatProvider;
use crate::{ChatRequest, ChatResponse, ToolCall, Usage};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One scripted provider turn
pub enum ScriptedStep {
    Respond(ChatResponse),
    Fail(LlmError),
}

impl ScriptedStep {
    /// A final structured response
    pub fn structured(value: Value, usage: Usage) -> Self {
        ScriptedStep::Respond(ChatResponse {
            content: value.to_string(),
            structured: Some(value),
            tool_calls: Vec::new(),
            usage,
        })
    }

    /// A plain-text response (no native structured payload)
    pub fn text(content: impl Into<String>, usage: Usage) -> Self {
        ScriptedStep::Respond(ChatResponse {
            content: content.into(),
            structured: None,
            tool_calls: Vec::new(),
            usage,
        })
    }

    /// A response requesting tool calls
    pub fn tool_calls(calls: Vec<ToolCall>, usage: Usage) -> Self {
        ScriptedStep::Respond(ChatResponse {
            content: String::new(),
            structured: None,
            tool_calls: calls,
            usage,
        })
    }

    /// A provider error
    pub fn error(error: LlmError) -> Self {
        ScriptedStep::Fail(error)
    }
}

/// Provider that replays a queued script
pub struct ScriptedProvider {
    steps: Mutex<VecDeque<ScriptedStep>>,
    requests: Mutex<Vec<ChatRequest>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Total number of `complete` calls observed
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The most recent request, if any
    pub fn last_request(&self) -> Option<ChatRequest> {
        self.requests.lock().last().cloned()
    }

    /// All requests observed so far
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request);

        match self.steps.lock().pop_front() {
            Some(ScriptedStep::Respond(response)) => Ok(response),
            Some(ScriptedStep::Fail(error)) => Err(error),
            None => Err(LlmError::InvalidResponse(
                "scripted provider ran out of steps".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LlmParams, Message};
    use serde_json::json;

    #[tokio::test]
    async fn test_script_replays_in_order() {
        let provider = ScriptedProvider::new(vec![
            ScriptedStep::structured(json!({"n": 1}), Usage::new(1, 1)),
            ScriptedStep::error(LlmError::Timeout("slow".into())),
        ]);

        let request = ChatRequest::new(
            vec![Message::user("x")],
            LlmParams::for_model("test-model"),
        );

        let first = provider.complete(request.clone()).await.unwrap();
        assert_eq!(first.structured.unwrap()["n"], 1);

        let second = provider.complete(request.clone()).await.unwrap_err();
        assert!(matches!(second, LlmError::Timeout(_)));

        // Exhausted scripts error rather than hang
        assert!(provider.complete(request).await.is_err());
        assert_eq!(provider.calls(), 3);
    }
}
