//! Repository traits. Implementations must be thread-safe; each operation
//! is a short transaction with no cross-call snapshot guarantees.

use crate::error::Result;
use crate::models::{Deployment, Execution, ExecutionState, ExecutionStatus, RunTotals};
use async_trait::async_trait;
use serde_json::Value;

/// Workflow run records
#[async_trait]
pub trait ExecutionRepo: Send + Sync {
    /// Insert a new execution row
    async fn create(&self, execution: &Execution) -> Result<()>;

    /// Move an execution to a new status. Enforces the legal transition
    /// order.
    async fn update_status(&self, id: &str, status: ExecutionStatus) -> Result<()>;

    /// Terminal update: status, totals, final state and optional error in
    /// one write.
    async fn finish(
        &self,
        id: &str,
        status: ExecutionStatus,
        totals: &RunTotals,
        final_state: Option<&Value>,
        error: Option<&str>,
    ) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Execution>;

    /// Recent executions of a workflow, newest first
    async fn list_by_workflow(
        &self,
        workflow_name: &str,
        limit: u32,
        since: Option<i64>,
    ) -> Result<Vec<Execution>>;
}

/// Per-node boundary records
#[async_trait]
pub trait ExecutionStateRepo: Send + Sync {
    /// Append one node-boundary row
    async fn append(&self, record: &ExecutionState) -> Result<()>;

    /// All rows for one execution, oldest first
    async fn list_for_execution(&self, execution_id: &str) -> Result<Vec<ExecutionState>>;
}

/// Deployment records (read-only from the runtime's perspective)
#[async_trait]
pub trait DeploymentRepo: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Deployment>>;

    async fn list(&self) -> Result<Vec<Deployment>>;
}
