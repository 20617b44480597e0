//! End-to-end run orchestration.
//!
//! [`Runner::run`] wires the pieces together: validate the config, build
//! the graph, persist an [`Execution`] record, invoke the workflow under
//! the run deadline, persist per-node [`ExecutionState`] rows through the
//! boundary hook, and finalize status, totals and the trace.
//!
//! Persistence failures are retried within a small budget, then logged
//! and ignored — the in-memory result is still returned to the caller.

use crate::events::{SpanMetrics, WorkflowTracer};
use agentflow_core::{
    build_workflow, validate, CancelToken, ConfigLoadError, ConfigValidationError,
    GraphBuildError, NodeBoundary, RunHooks, StateError, Workflow, WorkflowConfig,
    WorkflowError,
};
use agentflow_storage::{
    Execution, ExecutionState, ExecutionStatus, RunTotals, Storage, StorageError,
};
use async_trait::async_trait;
use llm::{config::LlmConfig, create_provider, LlmClient, LlmError};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tooling::ToolRegistry;
use tracing::{error, info, warn};

const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_BACKOFF: Duration = Duration::from_millis(50);

/// Errors that prevent a run from starting (nothing was executed)
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Load(#[from] ConfigLoadError),

    #[error(transparent)]
    Validation(#[from] ConfigValidationError),

    #[error(transparent)]
    Build(#[from] GraphBuildError),

    #[error("state initialization: {0}")]
    StateInit(#[from] StateError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Terminal status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
}

/// What a finished run returns to the caller
#[derive(Debug, Clone)]
pub struct RunReport {
    pub execution_id: String,
    pub status: RunStatus,
    /// Full snapshot on success; the last successfully applied delta on
    /// failure; None when cancelled before any node completed
    pub final_state: Option<Value>,
    pub totals: RunTotals,
    pub error: Option<String>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}

/// Options for one run
#[derive(Default)]
pub struct RunOptions {
    /// Associate the execution with a deployment
    pub deployment_id: Option<String>,

    /// Override the run deadline from the config
    pub timeout: Option<Duration>,
}

/// The runtime orchestrator
pub struct Runner {
    registry: Arc<ToolRegistry>,
    storage: Storage,
    tracer: Arc<dyn WorkflowTracer>,
}

impl Runner {
    pub fn new(storage: Storage, tracer: Arc<dyn WorkflowTracer>) -> Self {
        Self {
            registry: Arc::new(ToolRegistry::with_builtins()),
            storage,
            tracer,
        }
    }

    /// Substitute a custom tool registry (must happen before `run`)
    pub fn with_registry(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Validate and build without executing (the CLI's `validate` path)
    pub fn compile(&self, config: &WorkflowConfig) -> Result<Workflow, RunnerError> {
        validate(config, &self.registry)?;
        let workflow = build_workflow(config, Arc::clone(&self.registry), &default_client_factory)?;
        Ok(workflow)
    }

    /// Run a workflow with real providers
    pub async fn run(
        &self,
        config: &WorkflowConfig,
        inputs: Map<String, Value>,
        options: RunOptions,
    ) -> Result<RunReport, RunnerError> {
        self.run_with_clients(config, inputs, options, &default_client_factory)
            .await
    }

    /// Run with an injected client factory (tests use scripted providers)
    pub async fn run_with_clients(
        &self,
        config: &WorkflowConfig,
        inputs: Map<String, Value>,
        options: RunOptions,
        make_client: &agentflow_core::graph::ClientFactory<'_>,
    ) -> Result<RunReport, RunnerError> {
        validate(config, &self.registry)?;
        let workflow = build_workflow(config, Arc::clone(&self.registry), make_client)?;
        let initial = workflow.initial_state(inputs)?;

        let mut execution = Execution::queued(&config.flow.name, config.flow.version.clone());
        if let Some(deployment_id) = &options.deployment_id {
            execution = execution.with_deployment(deployment_id.clone());
        }
        let execution_id = execution.id.clone();

        persist(PERSIST_ATTEMPTS, "create execution", || {
            let execution = execution.clone();
            async move { self.storage.executions.create(&execution).await }
        })
        .await;
        persist(PERSIST_ATTEMPTS, "mark execution running", || {
            let id = execution_id.clone();
            async move {
                self.storage
                    .executions
                    .update_status(&id, ExecutionStatus::Running)
                    .await
            }
        })
        .await;
        execution.status = ExecutionStatus::Running;

        let workflow_span = self.tracer.start_workflow(&execution);
        let hooks = RunnerHooks {
            execution_id: execution_id.clone(),
            storage: self.storage.clone(),
            tracer: Arc::clone(&self.tracer),
            workflow_span,
            totals: Mutex::new(RunTotals::default()),
            last_delta: Mutex::new(None),
        };

        let cancel = CancelToken::new();
        let deadline = options
            .timeout
            .unwrap_or_else(|| Duration::from_secs(workflow.execution().timeout_seconds));

        let outcome = tokio::time::timeout(
            deadline,
            workflow.invoke(initial, &hooks, &cancel),
        )
        .await;

        let totals = *hooks.totals.lock();
        let last_delta = hooks.last_delta.lock().clone();

        let (status, final_state, run_error) = match outcome {
            Ok(Ok(final_state)) => {
                (RunStatus::Succeeded, Some(final_state.snapshot()), None)
            }
            Ok(Err(WorkflowError::Cancelled)) => {
                (RunStatus::Cancelled, last_delta, Some("run cancelled".to_string()))
            }
            Ok(Err(workflow_error)) => {
                (RunStatus::Failed, last_delta, Some(workflow_error.to_string()))
            }
            Err(_elapsed) => {
                // Deadline hit: ask in-flight work to stop and record the
                // run as cancelled.
                cancel.cancel();
                (
                    RunStatus::Cancelled,
                    last_delta,
                    Some(format!("deadline of {deadline:?} exceeded")),
                )
            }
        };

        let storage_status = match status {
            RunStatus::Succeeded => ExecutionStatus::Succeeded,
            RunStatus::Failed => ExecutionStatus::Failed,
            RunStatus::Cancelled => ExecutionStatus::Cancelled,
        };
        persist(PERSIST_ATTEMPTS, "finish execution", || {
            let id = execution_id.clone();
            let final_state = final_state.clone();
            let error = run_error.clone();
            async move {
                self.storage
                    .executions
                    .finish(
                        &id,
                        storage_status,
                        &totals,
                        final_state.as_ref(),
                        error.as_deref(),
                    )
                    .await
            }
        })
        .await;

        self.tracer.end_span(
            workflow_span,
            storage_status.as_str(),
            &SpanMetrics {
                duration_ms: 0,
                usage: llm::Usage::new(totals.input_tokens, totals.output_tokens),
                cost: totals.cost,
            },
        );
        self.tracer.log_cost_summary(&execution_id, &totals);

        match status {
            RunStatus::Succeeded => info!(execution = %execution_id, "Run succeeded"),
            RunStatus::Failed => {
                error!(execution = %execution_id, error = ?run_error, "Run failed")
            }
            RunStatus::Cancelled => {
                warn!(execution = %execution_id, error = ?run_error, "Run cancelled")
            }
        }

        Ok(RunReport {
            execution_id,
            status,
            final_state,
            totals,
            error: run_error,
        })
    }
}

/// Default client factory: resolve the provider by name and wrap it with
/// the config's retry budget.
fn default_client_factory(config: &LlmConfig) -> Result<Arc<LlmClient>, LlmError> {
    let provider = create_provider(config)?;
    Ok(Arc::new(LlmClient::new(provider, config.retry_policy())))
}

/// Boundary hook: accumulate totals, persist one row and emit one span per
/// node boundary.
struct RunnerHooks {
    execution_id: String,
    storage: Storage,
    tracer: Arc<dyn WorkflowTracer>,
    workflow_span: crate::events::SpanHandle,
    totals: Mutex<RunTotals>,
    last_delta: Mutex<Option<Value>>,
}

#[async_trait]
impl RunHooks for RunnerHooks {
    async fn on_node_complete(&self, boundary: &NodeBoundary) {
        {
            let mut totals = self.totals.lock();
            totals.input_tokens += boundary.usage.input_tokens;
            totals.output_tokens += boundary.usage.output_tokens;
            totals.cost += boundary.cost;
        }
        if boundary.succeeded {
            *self.last_delta.lock() = boundary.delta.clone();
        }

        let span = self
            .tracer
            .start_node(&self.workflow_span, &boundary.node_id, boundary.branch_index);
        self.tracer.end_span(
            span,
            if boundary.succeeded { "succeeded" } else { "failed" },
            &SpanMetrics {
                duration_ms: boundary.duration_ms,
                usage: boundary.usage,
                cost: boundary.cost,
            },
        );

        let mut record = ExecutionState::new(&self.execution_id, &boundary.node_id);
        record.iteration = boundary.iteration;
        record.branch_index = boundary.branch_index;
        record.duration_ms = boundary.duration_ms;
        record.input_tokens = boundary.usage.input_tokens;
        record.output_tokens = boundary.usage.output_tokens;
        record.cost = boundary.cost;
        record.status = if boundary.succeeded {
            "succeeded".to_string()
        } else {
            "failed".to_string()
        };
        record.output_snapshot = boundary.delta.clone();
        record.error = boundary.error.clone();

        persist(PERSIST_ATTEMPTS, "append execution state", || {
            let record = record.clone();
            async move { self.storage.states.append(&record).await }
        })
        .await;
    }
}

/// Retry a persistence write within a small budget; failures are logged
/// and swallowed so the run keeps its in-memory result.
async fn persist<F, Fut>(attempts: u32, what: &str, mut op: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), StorageError>>,
{
    for attempt in 1..=attempts {
        match op().await {
            Ok(()) => return,
            Err(storage_error) if attempt < attempts => {
                warn!(
                    what,
                    attempt,
                    error = %storage_error,
                    "Persistence write failed, retrying"
                );
                tokio::time::sleep(PERSIST_BACKOFF).await;
            }
            Err(storage_error) => {
                error!(
                    what,
                    error = %storage_error,
                    "Persistence write failed; continuing in memory"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopTracer;
    use llm::testing::{ScriptedProvider, ScriptedStep};
    use llm::{RetryPolicy, Usage};
    use serde_json::json;

    const LINEAR: &str = r#"
schema_version: "1.0"
flow:
  name: linear
state:
  fields:
    topic:
      type: str
    article:
      type: str
      default: ""
nodes:
  - id: write
    prompt: "Write about {topic}"
    outputs: [article]
edges:
  - from: __start__
    to: write
  - from: write
    to: __end__
"#;

    fn runner() -> Runner {
        Runner::new(Storage::in_memory(), Arc::new(NoopTracer))
    }

    fn factory(
        provider: Arc<ScriptedProvider>,
    ) -> impl Fn(&LlmConfig) -> Result<Arc<LlmClient>, LlmError> {
        move |_config| {
            Ok(Arc::new(LlmClient::new(
                Arc::clone(&provider) as Arc<dyn llm::ChatProvider>,
                RetryPolicy::new(3)
                    .with_jitter(false)
                    .with_initial_interval(0.0),
            )))
        }
    }

    fn inputs(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_successful_run_persists_everything() {
        let runner = runner();
        let config = WorkflowConfig::from_yaml(LINEAR).unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedStep::structured(
            json!({"article": "A1"}),
            Usage::new(10, 5),
        )]));

        let report = runner
            .run_with_clients(
                &config,
                inputs(&[("topic", json!("dogs"))]),
                RunOptions::default(),
                &factory(provider),
            )
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(report.final_state.as_ref().unwrap()["article"], "A1");
        assert_eq!(report.totals.total_tokens(), 15);

        let execution = runner
            .storage
            .executions
            .get(&report.execution_id)
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Succeeded);
        assert_eq!(execution.totals.total_tokens(), 15);

        let states = runner
            .storage
            .states
            .list_for_execution(&report.execution_id)
            .await
            .unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].node_id, "write");
    }

    #[tokio::test]
    async fn test_failed_run_reports_partial_state() {
        let runner = runner();
        let yaml = LINEAR.replace(
            "  - from: write\n    to: __end__",
            "  - from: write\n    to: second\n  - from: second\n    to: __end__",
        );
        let yaml = yaml.replace(
            "nodes:",
            "nodes:\n  - id: second\n    prompt: \"Extend {article}\"\n    outputs: [article]",
        );
        let config = WorkflowConfig::from_yaml(&yaml).unwrap();

        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptedStep::structured(json!({"article": "A1"}), Usage::new(1, 1)),
            ScriptedStep::error(LlmError::Authentication("no key".into())),
        ]));

        let report = runner
            .run_with_clients(
                &config,
                inputs(&[("topic", json!("dogs"))]),
                RunOptions::default(),
                &factory(provider),
            )
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Failed);
        // Partial state is the last successfully applied delta
        assert_eq!(report.final_state.unwrap()["article"], "A1");
        let error = report.error.unwrap();
        assert!(error.contains("second"));
        assert!(error.contains("provider"));

        let execution = runner
            .storage
            .executions
            .get(&report.execution_id)
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_validation_failure_runs_nothing() {
        let runner = runner();
        let yaml = LINEAR.replace("to: write", "to: writee");
        let config = WorkflowConfig::from_yaml(&yaml).unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![]));

        let err = runner
            .run_with_clients(
                &config,
                inputs(&[("topic", json!("dogs"))]),
                RunOptions::default(),
                &factory(Arc::clone(&provider)),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RunnerError::Validation(_)));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_deadline_cancels_run() {
        let runner = runner();
        let config = WorkflowConfig::from_yaml(LINEAR).unwrap();

        // A provider that never answers within the deadline
        struct SlowProvider;
        #[async_trait]
        impl llm::ChatProvider for SlowProvider {
            fn name(&self) -> &str {
                "scripted"
            }
            async fn complete(
                &self,
                _request: llm::ChatRequest,
            ) -> llm::Result<llm::ChatResponse> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                unreachable!()
            }
        }

        let report = runner
            .run_with_clients(
                &config,
                inputs(&[("topic", json!("dogs"))]),
                RunOptions {
                    timeout: Some(Duration::from_millis(50)),
                    ..Default::default()
                },
                &|_config| {
                    Ok(Arc::new(LlmClient::new(
                        Arc::new(SlowProvider) as Arc<dyn llm::ChatProvider>,
                        RetryPolicy::new(0),
                    )))
                },
            )
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Cancelled);
        let execution = runner
            .storage
            .executions
            .get(&report.execution_id)
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_missing_required_input() {
        let runner = runner();
        let config = WorkflowConfig::from_yaml(LINEAR).unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![]));

        let err = runner
            .run_with_clients(
                &config,
                Map::new(),
                RunOptions::default(),
                &factory(provider),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::StateInit(_)));
    }
}
