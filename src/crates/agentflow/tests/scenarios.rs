//! End-to-end workflow scenarios: linear flows, conditional routing,
//! loops, parallel fan-out, provider retries and validation failures,
//! exercised through the full runner with in-memory storage and scripted
//! providers.

use agentflow::{
    NoopTracer, RunOptions, RunStatus, Runner, RunnerError, SpanHandle, SpanMetrics,
    WorkflowTracer,
};
use agentflow_core::{IssueKind, WorkflowConfig};
use agentflow_storage::{Execution, ExecutionStatus, RunTotals, Storage};
use async_trait::async_trait;
use llm::testing::{ScriptedProvider, ScriptedStep};
use llm::{ChatProvider, ChatRequest, ChatResponse, LlmClient, LlmConfig, LlmError, RetryPolicy, Usage};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::sync::Arc;

fn runner() -> Runner {
    Runner::new(Storage::in_memory(), Arc::new(NoopTracer))
}

fn scripted_factory(
    provider: Arc<ScriptedProvider>,
) -> impl Fn(&LlmConfig) -> Result<Arc<LlmClient>, LlmError> {
    move |_config| {
        Ok(Arc::new(LlmClient::new(
            Arc::clone(&provider) as Arc<dyn ChatProvider>,
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

const LINEAR_TWO_NODE: &str = r#"
schema_version: "1.0"
flow:
  name: article
state:
  fields:
    topic:
      type: str
    article:
      type: str
      default: ""
    summary:
      type: str
      default: ""
nodes:
  - id: write
    prompt: "Write about {topic}"
    outputs: [article]
  - id: summarize
    prompt: "Summarize: {article}"
    outputs: [summary]
edges:
  - from: __start__
    to: write
  - from: write
    to: summarize
  - from: summarize
    to: __end__
"#;

// S1: linear two-node success with full persistence
#[tokio::test]
async fn linear_two_node_success() {
    let runner = runner();
    let config = WorkflowConfig::from_yaml(LINEAR_TWO_NODE).unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedStep::structured(json!({"article": "A1"}), Usage::new(10, 5)),
        ScriptedStep::structured(json!({"summary": "S1"}), Usage::new(8, 4)),
    ]));

    let report = runner
        .run_with_clients(
            &config,
            inputs(&[("topic", json!("dogs"))]),
            RunOptions::default(),
            &scripted_factory(provider),
        )
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
    let state = report.final_state.unwrap();
    assert_eq!(state["topic"], "dogs");
    assert_eq!(state["article"], "A1");
    assert_eq!(state["summary"], "S1");

    // One execution row marked succeeded, two execution-state rows
    let execution = runner
        .storage()
        .executions
        .get(&report.execution_id)
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Succeeded);

    let states = runner
        .storage()
        .states
        .list_for_execution(&report.execution_id)
        .await
        .unwrap();
    assert_eq!(states.len(), 2);
    assert_eq!(states[0].node_id, "write");
    assert_eq!(states[1].node_id, "summarize");
    assert!(states.iter().all(|s| s.status == "succeeded"));
}

const JUDGED: &str = r#"
schema_version: "1.0"
flow:
  name: judged
state:
  fields:
    draft:
      type: str
    score:
      type: float
      default: 0.0
    outcome:
      type: str
      default: ""
nodes:
  - id: judge
    prompt: "Score this: {draft}"
    outputs: [score]
    output_schema: float
  - id: approve
    prompt: "Approve {draft}"
    outputs: [outcome]
  - id: retry
    prompt: "Rework {draft}"
    outputs: [outcome]
edges:
  - from: __start__
    to: judge
  - from: judge
    routes:
      - condition: "state.score > 0.8"
        to: approve
    default: retry
  - from: approve
    to: __end__
  - from: retry
    to: __end__
"#;

// S2: conditional routing, both branches
#[tokio::test]
async fn conditional_routing_takes_matching_route() {
    let runner = runner();
    let config = WorkflowConfig::from_yaml(JUDGED).unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedStep::structured(json!({"score": 0.9}), Usage::new(1, 1)),
        ScriptedStep::structured(json!({"outcome": "approved"}), Usage::new(1, 1)),
    ]));

    let report = runner
        .run_with_clients(
            &config,
            inputs(&[("draft", json!("d1"))]),
            RunOptions::default(),
            &scripted_factory(provider),
        )
        .await
        .unwrap();

    assert_eq!(report.final_state.unwrap()["outcome"], "approved");

    let states = runner
        .storage()
        .states
        .list_for_execution(&report.execution_id)
        .await
        .unwrap();
    let visited: Vec<&str> = states.iter().map(|s| s.node_id.as_str()).collect();
    assert_eq!(visited, vec!["judge", "approve"]);
}

#[tokio::test]
async fn conditional_routing_falls_back_to_default() {
    let runner = runner();
    let config = WorkflowConfig::from_yaml(JUDGED).unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedStep::structured(json!({"score": 0.5}), Usage::new(1, 1)),
        ScriptedStep::structured(json!({"outcome": "reworked"}), Usage::new(1, 1)),
    ]));

    let report = runner
        .run_with_clients(
            &config,
            inputs(&[("draft", json!("d2"))]),
            RunOptions::default(),
            &scripted_factory(provider),
        )
        .await
        .unwrap();

    assert_eq!(report.final_state.unwrap()["outcome"], "reworked");
}

// S3: loop capped at max_iterations
#[tokio::test]
async fn loop_exits_at_max_iterations() {
    let yaml = r#"
schema_version: "1.0"
flow:
  name: retrying
state:
  fields:
    task:
      type: str
    result:
      type: str
      default: ""
nodes:
  - id: attempt
    prompt: "Attempt {task}"
    outputs: [result]
edges:
  - from: __start__
    to: attempt
  - from: attempt
    to: attempt
    loop:
      condition: "state.result == \"fail\""
      max_iterations: 3
  - from: attempt
    to: __end__
"#;
    let runner = runner();
    let config = WorkflowConfig::from_yaml(yaml).unwrap();
    let provider = Arc::new(ScriptedProvider::new(
        (0..10)
            .map(|_| ScriptedStep::structured(json!({"result": "fail"}), Usage::new(1, 1)))
            .collect(),
    ));

    let report = runner
        .run_with_clients(
            &config,
            inputs(&[("task", json!("t"))]),
            RunOptions::default(),
            &scripted_factory(Arc::clone(&provider)),
        )
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(provider.calls(), 3);

    let states = runner
        .storage()
        .states
        .list_for_execution(&report.execution_id)
        .await
        .unwrap();
    assert_eq!(states.len(), 3);
    assert_eq!(
        states.iter().map(|s| s.iteration).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
}

/// Tracer that counts node spans (used to assert one span per branch)
#[derive(Default)]
struct CountingTracer {
    branch_spans: Mutex<Vec<Option<u32>>>,
}

impl WorkflowTracer for CountingTracer {
    fn start_workflow(&self, _execution: &Execution) -> SpanHandle {
        SpanHandle::default()
    }

    fn start_node(
        &self,
        _parent: &SpanHandle,
        _node_id: &str,
        branch_index: Option<u32>,
    ) -> SpanHandle {
        self.branch_spans.lock().push(branch_index);
        SpanHandle::default()
    }

    fn end_span(&self, _handle: SpanHandle, _status: &str, _metrics: &SpanMetrics) {}

    fn log_cost_summary(&self, _execution_id: &str, _totals: &RunTotals) {}
}

const FANOUT: &str = r#"
schema_version: "1.0"
flow:
  name: fanout
state:
  fields:
    urls:
      type: list[str]
    url:
      type: str
      default: ""
    pages:
      type: list[str]
      reducer: append
      required: false
    plan:
      type: str
      default: ""
    report:
      type: str
      default: ""
nodes:
  - id: plan
    prompt: "Plan fetching {urls}"
    outputs: [plan]
  - id: fetch
    prompt: "Fetch {url}"
    outputs: [pages]
  - id: report
    prompt: "Report on {pages}"
    outputs: [report]
edges:
  - from: __start__
    to: plan
  - from: plan
    to: fetch
    parallel:
      items: state.urls
      collect: state.pages
      each: state.url
  - from: fetch
    to: report
  - from: report
    to: __end__
"#;

/// Answers fetch prompts from their own text so each branch's result is a
/// function of its input, not of scheduling order.
struct EchoProvider;

#[async_trait]
impl ChatProvider for EchoProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ChatRequest) -> llm::Result<ChatResponse> {
        let prompt = &request.messages.last().unwrap().content;
        let value = if let Some(url) = prompt.strip_prefix("Fetch ") {
            // Stagger completions in reverse input order
            let delay = match url {
                "a" => 30,
                "b" => 20,
                _ => 5,
            };
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            json!({"pages": format!("P_{url}")})
        } else if prompt.starts_with("Plan") {
            json!({"plan": "ok"})
        } else {
            json!({"report": "done"})
        };
        Ok(ChatResponse {
            content: value.to_string(),
            structured: Some(value),
            tool_calls: vec![],
            usage: Usage::new(2, 2),
        })
    }
}

// S4: parallel fan-out collects in input order regardless of completion
#[tokio::test]
async fn parallel_fanout_collects_in_branch_order() {
    let tracer = Arc::new(CountingTracer::default());
    let runner = Runner::new(Storage::in_memory(), Arc::clone(&tracer) as Arc<dyn WorkflowTracer>);
    let config = WorkflowConfig::from_yaml(FANOUT).unwrap();

    let report = runner
        .run_with_clients(
            &config,
            inputs(&[("urls", json!(["a", "b", "c"]))]),
            RunOptions::default(),
            &|_config| {
                Ok(Arc::new(LlmClient::new(
                    Arc::new(EchoProvider) as Arc<dyn ChatProvider>,
                    RetryPolicy::new(0).with_jitter(false),
                )))
            },
        )
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
    let state = report.final_state.unwrap();
    // "a" finished last, but collection is ordered by branch index
    assert_eq!(state["pages"], json!(["P_a", "P_b", "P_c"]));

    // Exactly three branch spans
    let branch_spans: Vec<u32> = tracer
        .branch_spans
        .lock()
        .iter()
        .filter_map(|b| *b)
        .collect();
    assert_eq!(branch_spans.len(), 3);

    // One execution-state row per branch, tagged with its index
    let states = runner
        .storage()
        .states
        .list_for_execution(&report.execution_id)
        .await
        .unwrap();
    let mut branch_rows: Vec<u32> = states.iter().filter_map(|s| s.branch_index).collect();
    branch_rows.sort_unstable();
    assert_eq!(branch_rows, vec![0, 1, 2]);
}

#[tokio::test]
async fn parallel_fanout_empty_items() {
    let runner = runner();
    let config = WorkflowConfig::from_yaml(FANOUT).unwrap();

    let report = runner
        .run_with_clients(
            &config,
            inputs(&[("urls", json!([]))]),
            RunOptions::default(),
            &|_config| {
                Ok(Arc::new(LlmClient::new(
                    Arc::new(EchoProvider) as Arc<dyn ChatProvider>,
                    RetryPolicy::new(0).with_jitter(false),
                )))
            },
        )
        .await
        .unwrap();

    let state = report.final_state.unwrap();
    assert_eq!(state["pages"], json!([]));
    assert_eq!(state["report"], "done");
}

/// Branch provider that fails on one url
struct FlakyBranchProvider;

#[async_trait]
impl ChatProvider for FlakyBranchProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ChatRequest) -> llm::Result<ChatResponse> {
        let prompt = &request.messages.last().unwrap().content;
        if prompt == "Fetch b" {
            return Err(LlmError::InvalidRequest("bad url".to_string()));
        }
        let value = if let Some(url) = prompt.strip_prefix("Fetch ") {
            json!({"pages": format!("P_{url}")})
        } else if prompt.starts_with("Plan") {
            json!({"plan": "ok"})
        } else {
            json!({"report": "done"})
        };
        Ok(ChatResponse {
            content: value.to_string(),
            structured: Some(value),
            tool_calls: vec![],
            usage: Usage::new(1, 1),
        })
    }
}

#[tokio::test]
async fn parallel_fail_fast_propagates_first_error() {
    let runner = runner();
    let config = WorkflowConfig::from_yaml(FANOUT).unwrap();

    let report = runner
        .run_with_clients(
            &config,
            inputs(&[("urls", json!(["a", "b", "c"]))]),
            RunOptions::default(),
            &|_config| {
                Ok(Arc::new(LlmClient::new(
                    Arc::new(FlakyBranchProvider) as Arc<dyn ChatProvider>,
                    RetryPolicy::new(0).with_jitter(false),
                )))
            },
        )
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert!(report.error.unwrap().contains("fetch"));
}

#[tokio::test]
async fn parallel_collect_errors_records_placeholders() {
    let yaml = format!(
        "{FANOUT}config:\n  execution:\n    parallel_failure_policy: collect_errors\n"
    );
    let runner = runner();
    let config = WorkflowConfig::from_yaml(&yaml).unwrap();

    let report = runner
        .run_with_clients(
            &config,
            inputs(&[("urls", json!(["a", "b", "c"]))]),
            RunOptions::default(),
            &|_config| {
                Ok(Arc::new(LlmClient::new(
                    Arc::new(FlakyBranchProvider) as Arc<dyn ChatProvider>,
                    RetryPolicy::new(0).with_jitter(false),
                )))
            },
        )
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
    let state = report.final_state.unwrap();
    let pages = state["pages"].as_array().unwrap();
    assert_eq!(pages.len(), 3);
    assert_eq!(pages[0], "P_a");
    assert_eq!(pages[1]["index"], 1);
    assert!(pages[1]["error"].as_str().unwrap().contains("bad url"));
    assert_eq!(pages[2], "P_c");
}

// S5: transient provider failures retried inside one node execution
#[tokio::test]
async fn provider_retry_then_success() {
    let runner = runner();
    let yaml = r#"
schema_version: "1.0"
flow:
  name: flaky
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
    let config = WorkflowConfig::from_yaml(yaml).unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedStep::error(LlmError::ServiceUnavailable("503".into())),
        ScriptedStep::error(LlmError::ServiceUnavailable("503".into())),
        ScriptedStep::structured(json!({"article": "A1"}), Usage::new(10, 5)),
    ]));

    let report = runner
        .run_with_clients(
            &config,
            inputs(&[("topic", json!("dogs"))]),
            RunOptions::default(),
            &scripted_factory(Arc::clone(&provider)),
        )
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
    // Two retries then success, all within a single node execution
    assert_eq!(provider.calls(), 3);

    let states = runner
        .storage()
        .states
        .list_for_execution(&report.execution_id)
        .await
        .unwrap();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].status, "succeeded");
}

// S6: validation catches a typo'd node reference before any execution
#[tokio::test]
async fn validation_catches_node_typo() {
    let runner = runner();
    let yaml = LINEAR_TWO_NODE.replace(
        "  - from: write\n    to: summarize",
        "  - from: write\n    to: summarizee",
    );
    let config = WorkflowConfig::from_yaml(&yaml).unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![]));

    let err = runner
        .run_with_clients(
            &config,
            inputs(&[("topic", json!("dogs"))]),
            RunOptions::default(),
            &scripted_factory(Arc::clone(&provider)),
        )
        .await
        .unwrap_err();

    let RunnerError::Validation(validation) = err else {
        panic!("expected a validation error");
    };
    let issue = validation
        .issues
        .iter()
        .find(|i| i.kind == IssueKind::UnknownNode)
        .unwrap();
    assert_eq!(issue.path, "edges[1].to");
    assert!(issue.message.contains("unknown node 'summarizee'"));
    assert_eq!(issue.suggestion.as_deref(), Some("summarize"));

    // No execution was attempted
    assert_eq!(provider.calls(), 0);
}
