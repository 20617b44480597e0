//! Persisted records: executions, per-node execution states, deployments.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Lifecycle status of an execution.
///
/// Legal transitions: `Queued → Running → (Succeeded | Failed | Cancelled)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<ExecutionStatus> {
        match s {
            "queued" => Some(ExecutionStatus::Queued),
            "running" => Some(ExecutionStatus::Running),
            "succeeded" => Some(ExecutionStatus::Succeeded),
            "failed" => Some(ExecutionStatus::Failed),
            "cancelled" => Some(ExecutionStatus::Cancelled),
            _ => None,
        }
    }

    /// Whether this status may move to `next`
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        matches!(
            (self, next),
            (ExecutionStatus::Queued, ExecutionStatus::Running)
                | (ExecutionStatus::Running, ExecutionStatus::Succeeded)
                | (ExecutionStatus::Running, ExecutionStatus::Failed)
                | (ExecutionStatus::Running, ExecutionStatus::Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Aggregate usage/cost totals for a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

impl RunTotals {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// One workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub workflow_name: String,
    pub workflow_version: Option<String>,
    pub status: ExecutionStatus,
    /// Unix seconds
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub totals: RunTotals,
    pub error: Option<String>,
    pub final_state: Option<Value>,
    pub deployment_id: Option<String>,
}

impl Execution {
    /// A new execution in the queued state
    pub fn queued(workflow_name: impl Into<String>, workflow_version: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_name: workflow_name.into(),
            workflow_version,
            status: ExecutionStatus::Queued,
            started_at: chrono::Utc::now().timestamp(),
            ended_at: None,
            totals: RunTotals::default(),
            error: None,
            final_state: None,
            deployment_id: None,
        }
    }

    /// A new execution already in the running state (tests and embedders
    /// that skip the queue)
    pub fn started(workflow_name: impl Into<String>, workflow_version: Option<String>) -> Self {
        Self {
            status: ExecutionStatus::Running,
            ..Self::queued(workflow_name, workflow_version)
        }
    }

    pub fn with_deployment(mut self, deployment_id: impl Into<String>) -> Self {
        self.deployment_id = Some(deployment_id.into());
        self
    }
}

/// One node boundary within a run (one row per loop iteration and per
/// parallel branch)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub id: String,
    pub execution_id: String,
    pub node_id: String,
    pub iteration: u32,
    pub branch_index: Option<u32>,
    pub duration_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    /// "succeeded" or "failed"
    pub status: String,
    pub output_snapshot: Option<Value>,
    pub error: Option<String>,
    /// Unix seconds
    pub created_at: i64,
}

impl ExecutionState {
    pub fn new(execution_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            execution_id: execution_id.into(),
            node_id: node_id.into(),
            iteration: 0,
            branch_index: None,
            duration_ms: 0,
            input_tokens: 0,
            output_tokens: 0,
            cost: 0.0,
            status: "succeeded".to_string(),
            output_snapshot: None,
            error: None,
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// A deployment record. Owned by the deployment subsystem; the runtime
/// only reads these to associate executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub name: String,
    pub workflow_name: String,
    pub metadata: Value,
    pub last_heartbeat: Option<i64>,
    pub ttl: Option<i64>,
}
