//! Execution and deployment persistence for agentflow.
//!
//! Two repositories carry a run's records — [`ExecutionRepo`] (one row per
//! run) and [`ExecutionStateRepo`] (one row per node boundary, including
//! per-branch and per-iteration rows) — plus a read-only [`DeploymentRepo`]
//! the runtime uses to associate runs with deployments.
//!
//! The default backend is a single-file embedded SQLite store ([`sqlite`]);
//! an in-memory backend ([`memory`]) backs tests and the `memory` storage
//! config. Backends are substituted through [`Storage::open`] without any
//! caller changes.

pub mod error;
pub mod memory;
pub mod models;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StorageError};
pub use memory::MemoryStore;
pub use models::{Deployment, Execution, ExecutionState, ExecutionStatus, RunTotals};
pub use sqlite::{Database, SqliteDeploymentRepo, SqliteExecutionRepo, SqliteExecutionStateRepo};
pub use traits::{DeploymentRepo, ExecutionRepo, ExecutionStateRepo};

use agentflow_core::StorageConfig;
use std::sync::Arc;

/// Repository handles constructed from a storage config
#[derive(Clone)]
pub struct Storage {
    pub executions: Arc<dyn ExecutionRepo>,
    pub states: Arc<dyn ExecutionStateRepo>,
    pub deployments: Arc<dyn DeploymentRepo>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

impl Storage {
    /// Open the backend named by the config.
    ///
    /// - `sqlite`: `url` (e.g. `sqlite::memory:`) or `path` (default
    ///   `agentflow.db`)
    /// - `memory`: process-local store
    pub async fn open(config: &StorageConfig) -> Result<Storage> {
        match config.backend.as_str() {
            "sqlite" => {
                let db = match (&config.url, &config.path) {
                    (Some(url), _) => Database::connect(url).await?,
                    (None, Some(path)) => Database::open(path).await?,
                    (None, None) => Database::open("agentflow.db").await?,
                };
                Ok(Storage {
                    executions: Arc::new(SqliteExecutionRepo::new(db.clone())),
                    states: Arc::new(SqliteExecutionStateRepo::new(db.clone())),
                    deployments: Arc::new(SqliteDeploymentRepo::new(db)),
                })
            }
            "memory" => Ok(Storage::in_memory()),
            other => Err(StorageError::UnknownBackend {
                name: other.to_string(),
            }),
        }
    }

    /// A process-local in-memory storage
    pub fn in_memory() -> Storage {
        let store = MemoryStore::new();
        Storage {
            executions: Arc::new(Arc::clone(&store)),
            states: Arc::new(Arc::clone(&store)),
            deployments: Arc::new(store),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_sqlite_in_memory() {
        let config = StorageConfig {
            backend: "sqlite".to_string(),
            url: Some("sqlite::memory:".to_string()),
            path: None,
        };
        let storage = Storage::open(&config).await.unwrap();

        let execution = Execution::started("wf", None);
        storage.executions.create(&execution).await.unwrap();
        assert_eq!(
            storage.executions.get(&execution.id).await.unwrap().status,
            ExecutionStatus::Running
        );
    }

    #[tokio::test]
    async fn test_open_memory_backend() {
        let config = StorageConfig {
            backend: "memory".to_string(),
            url: None,
            path: None,
        };
        let storage = Storage::open(&config).await.unwrap();
        let execution = Execution::started("wf", None);
        storage.executions.create(&execution).await.unwrap();
        assert!(storage.executions.get(&execution.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_backend_rejected() {
        let config = StorageConfig {
            backend: "postgres9000".to_string(),
            url: None,
            path: None,
        };
        assert!(matches!(
            Storage::open(&config).await.unwrap_err(),
            StorageError::UnknownBackend { .. }
        ));
    }
}
