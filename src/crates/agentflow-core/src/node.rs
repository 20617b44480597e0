//! Per-node execution pipeline.
//!
//! A node run resolves its declared inputs against state, renders the
//! prompt, merges LLM parameters, loads its tools and calls the provider
//! facade with the node's output schema. The result is a [`Delta`] keyed
//! exactly by the node's outputs; the input state is never mutated.
//!
//! Failures carry the node id and the pipeline phase they occurred in.

use crate::config::NodeConfig;
use crate::output::OutputModel;
use crate::state::{Delta, WorkflowState};
use crate::template;
use llm::{LlmClient, LlmError, LlmParams, Message, Usage};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tooling::{Tool, ToolRegistry};
use tracing::debug;

/// Where in the node pipeline a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePhase {
    InputMapping,
    Prompt,
    Provider,
    Tool,
    OutputValidation,
}

impl fmt::Display for NodePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodePhase::InputMapping => "input_mapping",
            NodePhase::Prompt => "prompt",
            NodePhase::Provider => "provider",
            NodePhase::Tool => "tool",
            NodePhase::OutputValidation => "output_validation",
        };
        write!(f, "{name}")
    }
}

/// A node execution failure
#[derive(Debug, Error)]
#[error("node '{node_id}' failed during {phase}: {cause}")]
pub struct NodeError {
    pub node_id: String,
    pub phase: NodePhase,
    pub cause: String,
}

/// The outcome of one successful node execution
#[derive(Debug, Clone)]
pub struct NodeRun {
    pub delta: Delta,
    pub usage: Usage,
    pub cost: f64,
    pub duration_ms: u64,
    pub tool_rounds: usize,
}

/// A node bound to its config, output model, client and tools
pub struct NodeExecutor {
    config: NodeConfig,
    output_model: OutputModel,
    client: Arc<LlmClient>,
    params: LlmParams,
    registry: Arc<ToolRegistry>,
}

impl NodeExecutor {
    pub fn new(
        config: NodeConfig,
        output_model: OutputModel,
        client: Arc<LlmClient>,
        params: LlmParams,
        registry: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            config,
            output_model,
            client,
            params,
            registry,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    fn fail(&self, phase: NodePhase, cause: impl fmt::Display) -> NodeError {
        NodeError {
            node_id: self.config.id.clone(),
            phase,
            cause: cause.to_string(),
        }
    }

    /// Run the node against a state snapshot
    pub async fn execute(&self, state: &WorkflowState) -> Result<NodeRun, NodeError> {
        let started = Instant::now();

        // 1. Resolve declared inputs against state only
        let mut inputs = Map::new();
        for (name, input_template) in &self.config.inputs {
            let rendered = template::render(input_template, state.values())
                .map_err(|e| self.fail(NodePhase::InputMapping, e))?;
            inputs.insert(name.clone(), Value::String(rendered));
        }

        // 2. Render prompts against state ∪ inputs; inputs shadow state
        let mut prompt_vars = state.values().clone();
        for (name, value) in &inputs {
            prompt_vars.insert(name.clone(), value.clone());
        }

        let prompt = template::render(&self.config.prompt, &prompt_vars)
            .map_err(|e| self.fail(NodePhase::Prompt, e))?;

        let mut messages = Vec::new();
        if let Some(system_template) = &self.config.system_prompt {
            let system = template::render(system_template, &prompt_vars)
                .map_err(|e| self.fail(NodePhase::Prompt, e))?;
            messages.push(Message::system(system));
        }
        messages.push(Message::user(prompt));

        // 3. Load tools (lazy in the registry; cached after first use)
        let mut tools: Vec<Arc<dyn Tool>> = Vec::with_capacity(self.config.tools.len());
        for name in &self.config.tools {
            let tool = self
                .registry
                .get(name)
                .map_err(|e| self.fail(NodePhase::Tool, e))?;
            tools.push(tool);
        }

        // 4. Call the facade; it owns retries, the agent loop and the
        //    single strict re-prompt on schema mismatch
        let schema = self.output_model.json_schema();
        let model = self.output_model.clone();
        let call = self
            .client
            .call_structured(messages, schema, tools, &self.params, move |raw| {
                model
                    .parse(raw)
                    .map(Value::Object)
                    .map_err(|e| e.to_string())
            })
            .await
            .map_err(|e| {
                let phase = match &e {
                    LlmError::SchemaViolation(_) => NodePhase::OutputValidation,
                    LlmError::Tool(_) | LlmError::ToolLoopLimit { .. } => NodePhase::Tool,
                    _ => NodePhase::Provider,
                };
                self.fail(phase, e)
            })?;

        if self.config.log_raw_response {
            debug!(node = %self.config.id, output = %call.output, "Raw structured output");
        }

        let delta = match call.output {
            Value::Object(entries) => entries,
            other => {
                return Err(self.fail(
                    NodePhase::OutputValidation,
                    format!("validator produced a non-object delta: {other}"),
                ))
            }
        };

        Ok(NodeRun {
            delta,
            usage: call.usage,
            cost: call.cost,
            duration_ms: started.elapsed().as_millis() as u64,
            tool_rounds: call.tool_rounds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkflowConfig;
    use crate::state::StateSchema;
    use llm::testing::{ScriptedProvider, ScriptedStep};
    use llm::RetryPolicy;
    use serde_json::json;

    fn workflow() -> WorkflowConfig {
        WorkflowConfig::from_yaml(
            r#"
schema_version: "1.0"
flow:
  name: test
state:
  fields:
    topic:
      type: str
    article:
      type: str
      default: ""
nodes:
  - id: write
    prompt: "Write about {topic} in {style}"
    inputs:
      style: "a {topic}-friendly tone"
    outputs: [article]
edges:
  - from: __start__
    to: write
  - from: write
    to: __end__
"#,
        )
        .unwrap()
    }

    fn executor(provider: Arc<ScriptedProvider>) -> NodeExecutor {
        let config = workflow();
        let node = config.nodes[0].clone();
        let model = OutputModel::for_node(&node).unwrap();
        let client = Arc::new(LlmClient::new(
            provider,
            RetryPolicy::new(0).with_jitter(false),
        ));
        NodeExecutor::new(
            node,
            model,
            client,
            LlmParams::for_model("test-model"),
            Arc::new(ToolRegistry::new()),
        )
    }

    fn state() -> WorkflowState {
        let config = workflow();
        let schema = Arc::new(StateSchema::from_config(&config).unwrap());
        let mut inputs = Map::new();
        inputs.insert("topic".to_string(), json!("dogs"));
        schema.make_state(inputs).unwrap()
    }

    #[tokio::test]
    async fn test_execute_produces_delta() {
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedStep::structured(
            json!({"article": "A1"}),
            Usage::new(10, 5),
        )]));
        let executor = executor(Arc::clone(&provider));

        let state = state();
        let run = executor.execute(&state).await.unwrap();

        assert_eq!(run.delta["article"], "A1");
        assert_eq!(run.usage.total(), 15);

        // Prompt was rendered with inputs shadowing nothing here, but the
        // declared input itself resolved against state
        let request = provider.last_request().unwrap();
        let user = &request.messages[0];
        assert_eq!(user.content, "Write about dogs in a dogs-friendly tone");
    }

    #[tokio::test]
    async fn test_input_shadows_state_field() {
        let mut config = workflow();
        config.nodes[0].inputs =
            [("topic".to_string(), "cats".to_string())].into_iter().collect();
        let node = config.nodes[0].clone();
        let model = OutputModel::for_node(&node).unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedStep::structured(
            json!({"article": "A1"}),
            Usage::default(),
        )]));
        let executor = NodeExecutor::new(
            node,
            model,
            Arc::new(LlmClient::new(
                Arc::clone(&provider) as Arc<dyn llm::ChatProvider>,
                RetryPolicy::new(0).with_jitter(false),
            )),
            LlmParams::for_model("test-model"),
            Arc::new(ToolRegistry::new()),
        );

        executor.execute(&state()).await.unwrap();

        let request = provider.last_request().unwrap();
        // The declared input 'topic' wins over the state field 'topic'
        assert!(request.messages[0].content.starts_with("Write about cats"));
    }

    #[tokio::test]
    async fn test_missing_input_variable_is_input_mapping_phase() {
        let mut config = workflow();
        config.nodes[0].inputs =
            [("style".to_string(), "{missing_field}".to_string())]
                .into_iter()
                .collect();
        let node = config.nodes[0].clone();
        let model = OutputModel::for_node(&node).unwrap();
        let executor = NodeExecutor::new(
            node,
            model,
            Arc::new(LlmClient::new(
                Arc::new(ScriptedProvider::new(vec![])) as Arc<dyn llm::ChatProvider>,
                RetryPolicy::new(0).with_jitter(false),
            )),
            LlmParams::for_model("test-model"),
            Arc::new(ToolRegistry::new()),
        );

        let err = executor.execute(&state()).await.unwrap_err();
        assert_eq!(err.phase, NodePhase::InputMapping);
        assert!(err.cause.contains("missing_field"));
    }

    #[tokio::test]
    async fn test_provider_error_is_provider_phase() {
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedStep::error(
            LlmError::Authentication("bad key".into()),
        )]));
        let executor = executor(provider);

        let err = executor.execute(&state()).await.unwrap_err();
        assert_eq!(err.phase, NodePhase::Provider);
    }

    #[tokio::test]
    async fn test_schema_violation_is_output_validation_phase() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptedStep::text("not json", Usage::default()),
            ScriptedStep::text("still not json", Usage::default()),
        ]));
        let executor = executor(provider);

        let err = executor.execute(&state()).await.unwrap_err();
        assert_eq!(err.phase, NodePhase::OutputValidation);
    }

    #[tokio::test]
    async fn test_state_not_mutated_by_execution() {
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedStep::structured(
            json!({"article": "A1"}),
            Usage::default(),
        )]));
        let executor = executor(provider);

        let state = state();
        let before = state.values().clone();
        executor.execute(&state).await.unwrap();
        assert_eq!(state.values(), &before);
    }
}
