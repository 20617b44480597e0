//! In-memory repositories for tests and the `memory` storage backend.

use crate::error::{Result, StorageError};
use crate::models::{Deployment, Execution, ExecutionState, ExecutionStatus, RunTotals};
use crate::traits::{DeploymentRepo, ExecutionRepo, ExecutionStateRepo};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared in-memory store backing all three repositories.
///
/// Executions carry an insertion sequence: timestamps are second-resolution,
/// so the sequence is what keeps "newest first" exact within a second.
#[derive(Default)]
pub struct MemoryStore {
    executions: Mutex<HashMap<String, (u64, Execution)>>,
    next_seq: AtomicU64,
    states: Mutex<Vec<ExecutionState>>,
    deployments: Mutex<HashMap<String, Deployment>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seed a deployment (tests and the deployment subsystem use this)
    pub fn insert_deployment(&self, deployment: Deployment) {
        self.deployments
            .lock()
            .insert(deployment.id.clone(), deployment);
    }
}

#[async_trait]
impl ExecutionRepo for Arc<MemoryStore> {
    async fn create(&self, execution: &Execution) -> Result<()> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.executions
            .lock()
            .insert(execution.id.clone(), (seq, execution.clone()));
        Ok(())
    }

    async fn update_status(&self, id: &str, status: ExecutionStatus) -> Result<()> {
        let mut executions = self.executions.lock();
        let (_, execution) = executions
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("execution {id}")))?;
        if !execution.status.can_transition_to(status) {
            return Err(StorageError::IllegalTransition {
                id: id.to_string(),
                from: execution.status.to_string(),
                to: status.to_string(),
            });
        }
        execution.status = status;
        Ok(())
    }

    async fn finish(
        &self,
        id: &str,
        status: ExecutionStatus,
        totals: &RunTotals,
        final_state: Option<&Value>,
        error: Option<&str>,
    ) -> Result<()> {
        let mut executions = self.executions.lock();
        let (_, execution) = executions
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("execution {id}")))?;
        if !execution.status.can_transition_to(status) {
            return Err(StorageError::IllegalTransition {
                id: id.to_string(),
                from: execution.status.to_string(),
                to: status.to_string(),
            });
        }
        execution.status = status;
        execution.ended_at = Some(Utc::now().timestamp());
        execution.totals = *totals;
        execution.final_state = final_state.cloned();
        execution.error = error.map(str::to_string);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Execution> {
        self.executions
            .lock()
            .get(id)
            .map(|(_, execution)| execution.clone())
            .ok_or_else(|| StorageError::NotFound(format!("execution {id}")))
    }

    async fn list_by_workflow(
        &self,
        workflow_name: &str,
        limit: u32,
        since: Option<i64>,
    ) -> Result<Vec<Execution>> {
        let mut matching: Vec<(u64, Execution)> = self
            .executions
            .lock()
            .values()
            .filter(|(_, e)| e.workflow_name == workflow_name)
            .filter(|(_, e)| since.map_or(true, |s| e.started_at >= s))
            .cloned()
            .collect();
        matching.sort_by_key(|(seq, e)| std::cmp::Reverse((e.started_at, *seq)));
        matching.truncate(limit as usize);
        Ok(matching.into_iter().map(|(_, e)| e).collect())
    }
}

#[async_trait]
impl ExecutionStateRepo for Arc<MemoryStore> {
    async fn append(&self, record: &ExecutionState) -> Result<()> {
        self.states.lock().push(record.clone());
        Ok(())
    }

    async fn list_for_execution(&self, execution_id: &str) -> Result<Vec<ExecutionState>> {
        Ok(self
            .states
            .lock()
            .iter()
            .filter(|s| s.execution_id == execution_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DeploymentRepo for Arc<MemoryStore> {
    async fn get(&self, id: &str) -> Result<Option<Deployment>> {
        Ok(self.deployments.lock().get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<Deployment>> {
        let mut deployments: Vec<Deployment> =
            self.deployments.lock().values().cloned().collect();
        deployments.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(deployments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_execution_lifecycle() {
        let store = MemoryStore::new();
        let execution = Execution::started("wf", None);
        store.create(&execution).await.unwrap();

        store
            .finish(
                &execution.id,
                ExecutionStatus::Succeeded,
                &RunTotals {
                    input_tokens: 5,
                    output_tokens: 5,
                    cost: 0.0,
                },
                None,
                None,
            )
            .await
            .unwrap();

        let loaded = ExecutionRepo::get(&store, &execution.id).await.unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Succeeded);
        assert_eq!(loaded.totals.total_tokens(), 10);
    }

    #[tokio::test]
    async fn test_memory_rejects_illegal_transition() {
        let store = MemoryStore::new();
        let execution = Execution::started("wf", None);
        store.create(&execution).await.unwrap();
        store
            .update_status(&execution.id, ExecutionStatus::Cancelled)
            .await
            .unwrap();

        let err = store
            .update_status(&execution.id, ExecutionStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn test_memory_list_newest_first_within_one_second() {
        let store = MemoryStore::new();
        let mut created_ids = Vec::new();
        for _ in 0..3 {
            let execution = Execution::started("wf", None);
            created_ids.push(execution.id.clone());
            store.create(&execution).await.unwrap();
        }

        let listed = store.list_by_workflow("wf", 10, None).await.unwrap();
        let listed_ids: Vec<&str> = listed.iter().map(|e| e.id.as_str()).collect();
        created_ids.reverse();
        assert_eq!(listed_ids, created_ids);
    }

    #[tokio::test]
    async fn test_memory_states_filtered_by_execution() {
        let store = MemoryStore::new();
        store
            .append(&ExecutionState::new("e1", "a"))
            .await
            .unwrap();
        store
            .append(&ExecutionState::new("e2", "b"))
            .await
            .unwrap();
        store
            .append(&ExecutionState::new("e1", "c"))
            .await
            .unwrap();

        let listed = store.list_for_execution("e1").await.unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[tokio::test]
    async fn test_memory_deployments() {
        let store = MemoryStore::new();
        store.insert_deployment(Deployment {
            id: "d1".to_string(),
            name: "prod".to_string(),
            workflow_name: "wf".to_string(),
            metadata: serde_json::json!({}),
            last_heartbeat: None,
            ttl: None,
        });

        assert!(DeploymentRepo::get(&store, "d1").await.unwrap().is_some());
        assert!(DeploymentRepo::get(&store, "missing").await.unwrap().is_none());
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
