//! Graph assembly and execution.
//!
//! [`build_workflow`] turns a validated config into an executable
//! [`Workflow`]: each node becomes a [`NodeExecutor`] bound to its merged
//! LLM config and tools, and each edge becomes a transition — direct,
//! conditional (compiled route predicates), loop (hidden iteration counter
//! with a cap) or parallel (bounded fan-out with index-ordered fan-in).
//!
//! Build is pure: the returned workflow can be invoked repeatedly with
//! different initial states.

use crate::cancel::CancelToken;
use crate::config::{
    EdgeConfig, ExecutionConfig, ParallelFailurePolicy, WorkflowConfig,
};
use crate::expr::Expr;
use crate::node::{NodeError, NodeExecutor, NodePhase, NodeRun};
use crate::output::{OutputError, OutputModel};
use crate::state::{Delta, StateError, StateSchema, WorkflowState};
use async_trait::async_trait;
use futures::StreamExt;
use llm::{config::LlmConfig, LlmClient, LlmError, Usage};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tooling::ToolRegistry;
use tracing::{debug, info};

/// Sentinel id marking where execution begins
pub const START: &str = "__start__";

/// Sentinel id marking successful completion
pub const END: &str = "__end__";

/// Hidden state field carrying a parallel branch's index
pub const BRANCH_INDEX: &str = "__branch_index";

/// Errors from graph assembly
#[derive(Debug, Error)]
pub enum GraphBuildError {
    #[error("no edge leaves {START}")]
    MissingStartEdge,

    #[error("state schema: {0}")]
    State(#[from] StateError),

    #[error("output model: {0}")]
    Output(#[from] OutputError),

    #[error("LLM client for node '{node}': {source}")]
    Client {
        node: String,
        #[source]
        source: LlmError,
    },

    #[error("condition on edge from '{from}': {reason}")]
    Condition { from: String, reason: String },

    #[error("edge references unknown node '{0}'")]
    UnknownNode(String),
}

/// Errors from executing a workflow
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Node(#[from] NodeError),

    #[error("state update failed: {0}")]
    State(#[from] StateError),

    #[error("routing after node '{node}' failed: {cause}")]
    Routing { node: String, cause: String },

    #[error("run cancelled")]
    Cancelled,

    #[error("internal graph error: {0}")]
    Internal(String),
}

/// A compiled conditional route
pub struct CompiledRoute {
    pub raw: String,
    pub condition: Expr,
    pub to: String,
}

enum Transition {
    Next(String),
    Routes {
        routes: Vec<CompiledRoute>,
        default: String,
    },
}

struct LoopSpec {
    to: String,
    condition: Expr,
    max_iterations: u32,
    counter: String,
}

struct ParallelSpec {
    to: String,
    items: String,
    collect: String,
    each: String,
}

struct NodeSlot {
    executor: NodeExecutor,
    transition: Option<Transition>,
    loop_exit: Option<LoopSpec>,
    parallel: Option<ParallelSpec>,
    /// Set when this node is a loop target: the counter incremented on entry
    loop_counter: Option<String>,
}

/// What happened at one node boundary (persisted and traced by the runner)
#[derive(Debug, Clone)]
pub struct NodeBoundary {
    pub node_id: String,
    /// Loop iteration (1-based inside loops, 0 elsewhere)
    pub iteration: u32,
    /// Branch index for parallel branches
    pub branch_index: Option<u32>,
    pub duration_ms: u64,
    pub usage: Usage,
    pub cost: f64,
    pub succeeded: bool,
    pub delta: Option<Value>,
    pub error: Option<String>,
}

/// Hook invoked at every node boundary
#[async_trait]
pub trait RunHooks: Send + Sync {
    async fn on_node_complete(&self, _boundary: &NodeBoundary) {}
}

/// Hooks that do nothing
pub struct NoopHooks;

#[async_trait]
impl RunHooks for NoopHooks {}

/// Factory producing the LLM client for a node's merged config
pub type ClientFactory<'a> = dyn Fn(&LlmConfig) -> Result<Arc<LlmClient>, LlmError> + 'a;

/// An executable workflow graph
pub struct Workflow {
    name: String,
    entry: String,
    nodes: HashMap<String, NodeSlot>,
    schema: Arc<StateSchema>,
    execution: ExecutionConfig,
    /// Kept for rendering
    edges: Vec<EdgeConfig>,
}

/// Assemble an executable workflow from a validated config.
///
/// `make_client` receives each node's merged LLM config and returns the
/// client the node will call; injecting it keeps build pure and lets tests
/// substitute scripted providers.
pub fn build_workflow(
    config: &WorkflowConfig,
    registry: Arc<ToolRegistry>,
    make_client: &ClientFactory<'_>,
) -> Result<Workflow, GraphBuildError> {
    let mut schema = StateSchema::from_config(config)?;

    // Hidden engine fields: loop counters and the branch index
    for edge in &config.edges {
        match edge {
            EdgeConfig::Loop(edge) => schema.add_hidden_counter(loop_counter_name(&edge.to)),
            EdgeConfig::Parallel(_) => schema.add_hidden_counter(BRANCH_INDEX),
            _ => {}
        }
    }
    let schema = Arc::new(schema);

    // The execution block owns the retry budget; per-node overrides can
    // still raise or lower it.
    let mut default_llm = config.default_llm();
    default_llm.max_retries = config.config.execution.max_retries;

    let mut nodes = HashMap::new();
    for node in &config.nodes {
        let output_model = OutputModel::for_node(node)?;
        let merged = match &node.llm {
            Some(over) => default_llm.merged_with(over),
            None => default_llm.clone(),
        };
        let client = make_client(&merged).map_err(|e| GraphBuildError::Client {
            node: node.id.clone(),
            source: e,
        })?;
        nodes.insert(
            node.id.clone(),
            NodeSlot {
                executor: NodeExecutor::new(
                    node.clone(),
                    output_model,
                    client,
                    merged.params(),
                    Arc::clone(&registry),
                ),
                transition: None,
                loop_exit: None,
                parallel: None,
                loop_counter: None,
            },
        );
    }

    let mut entry: Option<String> = None;
    for edge in &config.edges {
        match edge {
            EdgeConfig::Linear(edge) => {
                if edge.from == START {
                    entry = Some(edge.to.clone());
                    continue;
                }
                slot_mut(&mut nodes, &edge.from)?.transition =
                    Some(Transition::Next(edge.to.clone()));
            }
            EdgeConfig::Conditional(edge) => {
                let mut routes = Vec::new();
                for route in &edge.routes {
                    let condition =
                        Expr::parse(&route.condition).map_err(|e| GraphBuildError::Condition {
                            from: edge.from.clone(),
                            reason: e.to_string(),
                        })?;
                    routes.push(CompiledRoute {
                        raw: route.condition.clone(),
                        condition,
                        to: route.to.clone(),
                    });
                }
                slot_mut(&mut nodes, &edge.from)?.transition = Some(Transition::Routes {
                    routes,
                    default: edge.default.clone(),
                });
            }
            EdgeConfig::Loop(edge) => {
                let condition =
                    Expr::parse(&edge.spec.condition).map_err(|e| GraphBuildError::Condition {
                        from: edge.from.clone(),
                        reason: e.to_string(),
                    })?;
                let counter = loop_counter_name(&edge.to);
                slot_mut(&mut nodes, &edge.from)?.loop_exit = Some(LoopSpec {
                    to: edge.to.clone(),
                    condition,
                    max_iterations: edge.spec.max_iterations,
                    counter: counter.clone(),
                });
                slot_mut(&mut nodes, &edge.to)?.loop_counter = Some(counter);
            }
            EdgeConfig::Parallel(edge) => {
                slot_mut(&mut nodes, &edge.from)?.parallel = Some(ParallelSpec {
                    to: edge.to.clone(),
                    items: edge.parallel.items_field().to_string(),
                    collect: edge.parallel.collect_field().to_string(),
                    each: edge.parallel.each_field().to_string(),
                });
            }
        }
    }

    Ok(Workflow {
        name: config.flow.name.clone(),
        entry: entry.ok_or(GraphBuildError::MissingStartEdge)?,
        nodes,
        schema,
        execution: config.config.execution.clone(),
        edges: config.edges.clone(),
    })
}

fn slot_mut<'a>(
    nodes: &'a mut HashMap<String, NodeSlot>,
    id: &str,
) -> Result<&'a mut NodeSlot, GraphBuildError> {
    nodes
        .get_mut(id)
        .ok_or_else(|| GraphBuildError::UnknownNode(id.to_string()))
}

fn loop_counter_name(target: &str) -> String {
    format!("__iter_{target}")
}

impl Workflow {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Arc<StateSchema> {
        &self.schema
    }

    pub fn execution(&self) -> &ExecutionConfig {
        &self.execution
    }

    /// Construct the initial state from run inputs
    pub fn initial_state(
        &self,
        inputs: serde_json::Map<String, Value>,
    ) -> Result<WorkflowState, StateError> {
        self.schema.make_state(inputs)
    }

    /// Execute the graph to completion
    pub async fn invoke(
        &self,
        initial: WorkflowState,
        hooks: &dyn RunHooks,
        cancel: &CancelToken,
    ) -> Result<WorkflowState, WorkflowError> {
        let mut state = initial;
        let mut current = self.entry.clone();

        while current != END {
            if cancel.is_cancelled() {
                return Err(WorkflowError::Cancelled);
            }

            let slot = self
                .nodes
                .get(&current)
                .ok_or_else(|| WorkflowError::Internal(format!("no node '{current}'")))?;

            // Entering a loop target bumps its hidden counter
            let iteration = match &slot.loop_counter {
                Some(counter) => {
                    let next = state
                        .get(counter)
                        .and_then(Value::as_i64)
                        .unwrap_or(0)
                        + 1;
                    let mut delta = Delta::new();
                    delta.insert(counter.clone(), json!(next));
                    state = state.apply(&delta)?;
                    next as u32
                }
                None => 0,
            };

            debug!(node = %current, iteration, "Executing node");
            match slot.executor.execute(&state).await {
                Ok(run) => {
                    state = state.apply(&run.delta)?;
                    hooks
                        .on_node_complete(&NodeBoundary {
                            node_id: current.clone(),
                            iteration,
                            branch_index: None,
                            duration_ms: run.duration_ms,
                            usage: run.usage,
                            cost: run.cost,
                            succeeded: true,
                            delta: Some(Value::Object(run.delta.clone())),
                            error: None,
                        })
                        .await;
                }
                Err(error) => {
                    hooks
                        .on_node_complete(&NodeBoundary {
                            node_id: current.clone(),
                            iteration,
                            branch_index: None,
                            duration_ms: 0,
                            usage: Usage::default(),
                            cost: 0.0,
                            succeeded: false,
                            delta: None,
                            error: Some(error.to_string()),
                        })
                        .await;
                    return Err(WorkflowError::Node(error));
                }
            }

            // Parallel fan-out: run branches of `to`, then continue at the
            // branch node's own transition
            if let Some(parallel) = &slot.parallel {
                state = self.run_parallel(parallel, state, hooks, cancel).await?;
                current = self.route(&parallel.to, &state)?;
                continue;
            }

            // Loop re-entry check
            if let Some(loop_exit) = &slot.loop_exit {
                let counter = state
                    .get(&loop_exit.counter)
                    .and_then(Value::as_i64)
                    .unwrap_or(0) as u32;
                let continue_loop =
                    loop_exit
                        .condition
                        .eval(state.values())
                        .map_err(|e| WorkflowError::Routing {
                            node: current.clone(),
                            cause: e.to_string(),
                        })?;
                if continue_loop && counter < loop_exit.max_iterations {
                    debug!(node = %loop_exit.to, counter, "Loop re-entry");
                    current = loop_exit.to.clone();
                    continue;
                }
                if continue_loop {
                    info!(
                        node = %loop_exit.to,
                        max_iterations = loop_exit.max_iterations,
                        "Loop cap reached, exiting loop"
                    );
                }
            }

            current = self.route(&current, &state)?;
        }

        Ok(state)
    }

    /// Resolve a node's outgoing transition against the current state.
    /// Routes are evaluated in declared order; first match wins.
    fn route(&self, node_id: &str, state: &WorkflowState) -> Result<String, WorkflowError> {
        let slot = self
            .nodes
            .get(node_id)
            .ok_or_else(|| WorkflowError::Internal(format!("no node '{node_id}'")))?;

        match &slot.transition {
            Some(Transition::Next(to)) => Ok(to.clone()),
            Some(Transition::Routes { routes, default }) => {
                for route in routes {
                    let matched =
                        route
                            .condition
                            .eval(state.values())
                            .map_err(|e| WorkflowError::Routing {
                                node: node_id.to_string(),
                                cause: format!("condition '{}': {e}", route.raw),
                            })?;
                    if matched {
                        debug!(node = %node_id, condition = %route.raw, to = %route.to, "Route matched");
                        return Ok(route.to.clone());
                    }
                }
                Ok(default.clone())
            }
            None => Ok(END.to_string()),
        }
    }

    /// Fan out over the items list, run branches concurrently and fold the
    /// contributions back into `collect` in branch-index order.
    async fn run_parallel(
        &self,
        spec: &ParallelSpec,
        state: WorkflowState,
        hooks: &dyn RunHooks,
        cancel: &CancelToken,
    ) -> Result<WorkflowState, WorkflowError> {
        let items: Vec<Value> = match state.get(&spec.items) {
            Some(Value::Array(items)) => items.clone(),
            Some(other) => {
                return Err(WorkflowError::Routing {
                    node: spec.to.clone(),
                    cause: format!("items field '{}' is not a list: {other}", spec.items),
                })
            }
            None => {
                return Err(WorkflowError::Routing {
                    node: spec.to.clone(),
                    cause: format!("items field '{}' is unset", spec.items),
                })
            }
        };

        // Zero branches: the collect field keeps its (empty) list and
        // fan-in resolves immediately.
        if items.is_empty() {
            debug!(node = %spec.to, "Parallel fan-out over empty list");
            return Ok(state);
        }

        let slot = self
            .nodes
            .get(&spec.to)
            .ok_or_else(|| WorkflowError::Internal(format!("no node '{}'", spec.to)))?;

        // Branch states snapshot the fan-out state; branches never share
        // mutable state.
        let mut branch_states = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let mut delta = Delta::new();
            delta.insert(spec.each.clone(), item.clone());
            delta.insert(BRANCH_INDEX.to_string(), json!(index));
            branch_states.push(state.apply(&delta)?);
        }

        let concurrency = self
            .execution
            .parallel_max_concurrency
            .max(1)
            .min(items.len());
        let fail_fast = matches!(
            self.execution.parallel_failure_policy,
            ParallelFailurePolicy::FailFast
        );
        info!(
            node = %spec.to,
            branches = items.len(),
            concurrency,
            "Parallel fan-out"
        );

        let mut stream = futures::stream::iter(branch_states.into_iter().enumerate().map(
            |(index, branch_state)| {
                let cancel = cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        return (
                            index,
                            Err(NodeError {
                                node_id: slot.executor.id().to_string(),
                                phase: NodePhase::Provider,
                                cause: "run cancelled".to_string(),
                            }),
                        );
                    }
                    (index, slot.executor.execute(&branch_state).await)
                }
            },
        ))
        .buffer_unordered(concurrency);

        let mut outcomes: Vec<Option<Result<NodeRun, NodeError>>> =
            (0..items.len()).map(|_| None).collect();
        let mut first_error: Option<NodeError> = None;

        while let Some((index, result)) = stream.next().await {
            let boundary = match &result {
                Ok(run) => NodeBoundary {
                    node_id: spec.to.clone(),
                    iteration: 0,
                    branch_index: Some(index as u32),
                    duration_ms: run.duration_ms,
                    usage: run.usage,
                    cost: run.cost,
                    succeeded: true,
                    delta: Some(Value::Object(run.delta.clone())),
                    error: None,
                },
                Err(error) => NodeBoundary {
                    node_id: spec.to.clone(),
                    iteration: 0,
                    branch_index: Some(index as u32),
                    duration_ms: 0,
                    usage: Usage::default(),
                    cost: 0.0,
                    succeeded: false,
                    delta: None,
                    error: Some(error.to_string()),
                },
            };
            hooks.on_node_complete(&boundary).await;

            match result {
                Ok(run) => outcomes[index] = Some(Ok(run)),
                Err(error) if fail_fast => {
                    first_error = Some(error);
                    break;
                }
                Err(error) => outcomes[index] = Some(Err(error)),
            }
        }
        // Dropping the stream cancels in-flight branches and never starts
        // the queued ones.
        drop(stream);
        if let Some(error) = first_error {
            return Err(WorkflowError::Node(error));
        }

        if cancel.is_cancelled() {
            return Err(WorkflowError::Cancelled);
        }

        // Fold contributions in branch-index order; the collect reducer is
        // stable regardless of completion order.
        let mut next = state;
        for (index, outcome) in outcomes.into_iter().enumerate() {
            let contribution = match outcome {
                Some(Ok(run)) => branch_contribution(&run.delta, &spec.collect).ok_or_else(
                    || {
                        WorkflowError::Internal(format!(
                            "branch {index} produced no contribution for '{}'",
                            spec.collect
                        ))
                    },
                )?,
                Some(Err(error)) => json!({"index": index, "error": error.to_string()}),
                None => json!({"index": index, "error": "branch did not run"}),
            };
            next = next.apply_collect(&spec.collect, contribution)?;
        }

        Ok(next)
    }

    /// Mermaid flowchart rendering of the graph
    pub fn to_mermaid(&self) -> String {
        let mut lines = vec!["flowchart TD".to_string()];
        lines.push(format!("    {START}([start])"));
        lines.push(format!("    {END}([end])"));
        for edge in &self.edges {
            match edge {
                EdgeConfig::Linear(edge) => {
                    lines.push(format!("    {} --> {}", edge.from, edge.to));
                }
                EdgeConfig::Conditional(edge) => {
                    for route in &edge.routes {
                        lines.push(format!(
                            "    {} -->|{}| {}",
                            edge.from,
                            route.condition.replace('|', "/"),
                            route.to
                        ));
                    }
                    lines.push(format!("    {} -->|default| {}", edge.from, edge.default));
                }
                EdgeConfig::Loop(edge) => {
                    lines.push(format!(
                        "    {} -.->|loop while {} (max {})| {}",
                        edge.from,
                        edge.spec.condition.replace('|', "/"),
                        edge.spec.max_iterations,
                        edge.to
                    ));
                }
                EdgeConfig::Parallel(edge) => {
                    lines.push(format!(
                        "    {} ==>|fan out {} as {}| {}",
                        edge.from,
                        edge.parallel.items,
                        edge.parallel.each,
                        edge.to
                    ));
                }
            }
        }
        lines.join("\n")
    }
}

/// What a successful branch contributes to the collect field
fn branch_contribution(delta: &Delta, collect: &str) -> Option<Value> {
    if let Some(value) = delta.get(collect) {
        return Some(value.clone());
    }
    if delta.len() == 1 {
        return delta.values().next().cloned();
    }
    None
}
