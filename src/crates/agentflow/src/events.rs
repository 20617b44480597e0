//! Observability: workflow and node spans, cost summaries.
//!
//! Spans are identified by opaque handles; the sink owns the span records
//! (no parent pointers cross the API). The default sink writes structured
//! `tracing` events; sink failures are never fatal — the engine fails
//! open and drops telemetry rather than stalling a run.

use agentflow_storage::{Execution, RunTotals};
use llm::Usage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Opaque span identifier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SpanHandle(u64);

/// Metrics attached when a span ends
#[derive(Debug, Clone, Copy, Default)]
pub struct SpanMetrics {
    pub duration_ms: u64,
    pub usage: Usage,
    pub cost: f64,
}

/// Span/metric/cost emission seam.
///
/// Implementations must be cheap and must not fail the caller: dropping a
/// span is always preferable to stalling execution.
pub trait WorkflowTracer: Send + Sync {
    /// Open the root span for a run
    fn start_workflow(&self, execution: &Execution) -> SpanHandle;

    /// Open a child span for one node boundary
    fn start_node(&self, parent: &SpanHandle, node_id: &str, branch_index: Option<u32>)
        -> SpanHandle;

    /// Close a span with its outcome
    fn end_span(&self, handle: SpanHandle, status: &str, metrics: &SpanMetrics);

    /// Emit the run's aggregate cost line
    fn log_cost_summary(&self, execution_id: &str, totals: &RunTotals);
}

/// Tracer that drops everything
pub struct NoopTracer;

impl WorkflowTracer for NoopTracer {
    fn start_workflow(&self, _execution: &Execution) -> SpanHandle {
        SpanHandle(0)
    }

    fn start_node(
        &self,
        _parent: &SpanHandle,
        _node_id: &str,
        _branch_index: Option<u32>,
    ) -> SpanHandle {
        SpanHandle(0)
    }

    fn end_span(&self, _handle: SpanHandle, _status: &str, _metrics: &SpanMetrics) {}

    fn log_cost_summary(&self, _execution_id: &str, _totals: &RunTotals) {}
}

struct SpanRecord {
    name: String,
    parent: Option<SpanHandle>,
    started: Instant,
}

/// Default sink: structured tracing events, spans held in an arena keyed
/// by handle.
#[derive(Default)]
pub struct TracingSink {
    spans: Mutex<HashMap<SpanHandle, SpanRecord>>,
    next_id: Mutex<u64>,
}

impl TracingSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_handle(&self) -> SpanHandle {
        let mut next = self.next_id.lock();
        *next += 1;
        SpanHandle(*next)
    }

    /// Number of spans currently open (tests)
    pub fn open_spans(&self) -> usize {
        self.spans.lock().len()
    }
}

impl WorkflowTracer for TracingSink {
    fn start_workflow(&self, execution: &Execution) -> SpanHandle {
        let handle = self.next_handle();
        info!(
            execution = %execution.id,
            workflow = %execution.workflow_name,
            "Workflow started"
        );
        self.spans.lock().insert(
            handle,
            SpanRecord {
                name: format!("workflow:{}", execution.workflow_name),
                parent: None,
                started: Instant::now(),
            },
        );
        handle
    }

    fn start_node(
        &self,
        parent: &SpanHandle,
        node_id: &str,
        branch_index: Option<u32>,
    ) -> SpanHandle {
        let handle = self.next_handle();
        debug!(node = %node_id, branch = ?branch_index, "Node span started");
        self.spans.lock().insert(
            handle,
            SpanRecord {
                name: match branch_index {
                    Some(index) => format!("node:{node_id}[{index}]"),
                    None => format!("node:{node_id}"),
                },
                parent: Some(*parent),
                started: Instant::now(),
            },
        );
        handle
    }

    fn end_span(&self, handle: SpanHandle, status: &str, metrics: &SpanMetrics) {
        let Some(record) = self.spans.lock().remove(&handle) else {
            warn!(?handle, "end_span on unknown handle; dropping");
            return;
        };
        info!(
            span = %record.name,
            parent = ?record.parent,
            status = %status,
            duration_ms = metrics.duration_ms,
            wall_ms = record.started.elapsed().as_millis() as u64,
            tokens_in = metrics.usage.input_tokens,
            tokens_out = metrics.usage.output_tokens,
            cost = metrics.cost,
            "Span ended"
        );
    }

    fn log_cost_summary(&self, execution_id: &str, totals: &RunTotals) {
        info!(
            execution = %execution_id,
            input_tokens = totals.input_tokens,
            output_tokens = totals.output_tokens,
            cost_usd = totals.cost,
            "Run cost summary"
        );
    }
}
