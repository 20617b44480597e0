//! SQLite-backed repositories (the default single-file embedded store).

use crate::error::{Result, StorageError};
use crate::models::{Deployment, Execution, ExecutionState, ExecutionStatus, RunTotals};
use crate::traits::{DeploymentRepo, ExecutionRepo, ExecutionStateRepo};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// SQLite connection wrapper with embedded migrations
#[derive(Clone, Debug)]
pub struct Database {
    pool: Arc<SqlitePool>,
}

impl Database {
    /// Open (creating if needed) a database file and run migrations
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageError::Database(format!("failed to create database directory: {e}"))
                })?;
            }
        }

        let url = format!(
            "sqlite:{}?mode=rwc",
            path.to_str()
                .ok_or_else(|| StorageError::Database("invalid database path".to_string()))?
        );
        debug!(url = %url, "Connecting to database");
        Self::connect(&url).await
    }

    /// Open from a sqlite URL (e.g. `sqlite::memory:`)
    pub async fn connect(url: &str) -> Result<Self> {
        // Every pooled connection to :memory: would get its own database,
        // so in-memory stores are pinned to a single connection.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| StorageError::Database(format!("failed to connect: {e}")))?;

        let db = Self {
            pool: Arc::new(pool),
        };
        db.run_migrations().await?;
        info!(url = %url, "Database ready");
        Ok(db)
    }

    /// In-memory database for tests
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(self.pool.as_ref())
            .await
            .map_err(|e| StorageError::Database(format!("migration failed: {e}")))?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Executions table access
#[derive(Clone)]
pub struct SqliteExecutionRepo {
    db: Database,
}

impl SqliteExecutionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn row_to_execution(row: &sqlx::sqlite::SqliteRow) -> Result<Execution> {
        let status_str: String = row.get("status");
        let status = ExecutionStatus::parse(&status_str)
            .ok_or_else(|| StorageError::Database(format!("bad status '{status_str}'")))?;
        let final_state: Option<String> = row.get("final_state");

        Ok(Execution {
            id: row.get("id"),
            workflow_name: row.get("workflow_name"),
            workflow_version: row.get("workflow_version"),
            status,
            started_at: row.get("started_at"),
            ended_at: row.get("ended_at"),
            totals: RunTotals {
                input_tokens: row.get::<i64, _>("total_input_tokens") as u64,
                output_tokens: row.get::<i64, _>("total_output_tokens") as u64,
                cost: row.get("total_cost"),
            },
            error: row.get("error"),
            final_state: final_state
                .map(|s| serde_json::from_str(&s))
                .transpose()?,
            deployment_id: row.get("deployment_id"),
        })
    }
}

#[async_trait]
impl ExecutionRepo for SqliteExecutionRepo {
    async fn create(&self, execution: &Execution) -> Result<()> {
        sqlx::query(
            "INSERT INTO executions (id, workflow_name, workflow_version, status, started_at,
                                     total_input_tokens, total_output_tokens, total_cost,
                                     deployment_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&execution.id)
        .bind(&execution.workflow_name)
        .bind(&execution.workflow_version)
        .bind(execution.status.as_str())
        .bind(execution.started_at)
        .bind(execution.totals.input_tokens as i64)
        .bind(execution.totals.output_tokens as i64)
        .bind(execution.totals.cost)
        .bind(&execution.deployment_id)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn update_status(&self, id: &str, status: ExecutionStatus) -> Result<()> {
        let current = self.get(id).await?;
        if !current.status.can_transition_to(status) {
            return Err(StorageError::IllegalTransition {
                id: id.to_string(),
                from: current.status.to_string(),
                to: status.to_string(),
            });
        }

        sqlx::query("UPDATE executions SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(self.db.pool())
            .await?;
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
        let current = self.get(id).await?;
        if !current.status.can_transition_to(status) {
            return Err(StorageError::IllegalTransition {
                id: id.to_string(),
                from: current.status.to_string(),
                to: status.to_string(),
            });
        }

        let final_state_json = final_state.map(|v| v.to_string());
        sqlx::query(
            "UPDATE executions
             SET status = ?, ended_at = ?, total_input_tokens = ?, total_output_tokens = ?,
                 total_cost = ?, final_state = ?, error = ?
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(Utc::now().timestamp())
        .bind(totals.input_tokens as i64)
        .bind(totals.output_tokens as i64)
        .bind(totals.cost)
        .bind(final_state_json)
        .bind(error)
        .bind(id)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Execution> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("execution {id}")))?;
        Self::row_to_execution(&row)
    }

    async fn list_by_workflow(
        &self,
        workflow_name: &str,
        limit: u32,
        since: Option<i64>,
    ) -> Result<Vec<Execution>> {
        // started_at is second-resolution; rowid breaks ties in insertion
        // order so "newest first" holds within a second too.
        let rows = sqlx::query(
            "SELECT * FROM executions
             WHERE workflow_name = ? AND started_at >= ?
             ORDER BY started_at DESC, rowid DESC
             LIMIT ?",
        )
        .bind(workflow_name)
        .bind(since.unwrap_or(0))
        .bind(limit as i64)
        .fetch_all(self.db.pool())
        .await?;

        rows.iter().map(Self::row_to_execution).collect()
    }
}

/// Execution-states table access
#[derive(Clone)]
pub struct SqliteExecutionStateRepo {
    db: Database,
}

impl SqliteExecutionStateRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn row_to_state(row: &sqlx::sqlite::SqliteRow) -> Result<ExecutionState> {
        let snapshot: Option<String> = row.get("output_snapshot");
        Ok(ExecutionState {
            id: row.get("id"),
            execution_id: row.get("execution_id"),
            node_id: row.get("node_id"),
            iteration: row.get::<i64, _>("iteration") as u32,
            branch_index: row
                .get::<Option<i64>, _>("branch_index")
                .map(|i| i as u32),
            duration_ms: row.get::<i64, _>("duration_ms") as u64,
            input_tokens: row.get::<i64, _>("input_tokens") as u64,
            output_tokens: row.get::<i64, _>("output_tokens") as u64,
            cost: row.get("cost"),
            status: row.get("status"),
            output_snapshot: snapshot.map(|s| serde_json::from_str(&s)).transpose()?,
            error: row.get("error"),
            created_at: row.get("created_at"),
        })
    }
}

#[async_trait]
impl ExecutionStateRepo for SqliteExecutionStateRepo {
    async fn append(&self, record: &ExecutionState) -> Result<()> {
        sqlx::query(
            "INSERT INTO execution_states (id, execution_id, node_id, iteration, branch_index,
                                           duration_ms, input_tokens, output_tokens, cost,
                                           status, output_snapshot, error, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.execution_id)
        .bind(&record.node_id)
        .bind(record.iteration as i64)
        .bind(record.branch_index.map(|i| i as i64))
        .bind(record.duration_ms as i64)
        .bind(record.input_tokens as i64)
        .bind(record.output_tokens as i64)
        .bind(record.cost)
        .bind(&record.status)
        .bind(record.output_snapshot.as_ref().map(|v| v.to_string()))
        .bind(&record.error)
        .bind(record.created_at)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn list_for_execution(&self, execution_id: &str) -> Result<Vec<ExecutionState>> {
        // created_at is second-resolution, so rows within one second would
        // otherwise sort by random uuid; the implicit rowid is monotonic
        // per insertion and keeps "oldest first" exact.
        let rows = sqlx::query(
            "SELECT * FROM execution_states WHERE execution_id = ? ORDER BY rowid",
        )
        .bind(execution_id)
        .fetch_all(self.db.pool())
        .await?;

        rows.iter().map(Self::row_to_state).collect()
    }
}

/// Deployments table access (reads only)
#[derive(Clone)]
pub struct SqliteDeploymentRepo {
    db: Database,
}

impl SqliteDeploymentRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn row_to_deployment(row: &sqlx::sqlite::SqliteRow) -> Result<Deployment> {
        let metadata: String = row.get("metadata");
        Ok(Deployment {
            id: row.get("id"),
            name: row.get("name"),
            workflow_name: row.get("workflow_name"),
            metadata: serde_json::from_str(&metadata)?,
            last_heartbeat: row.get("last_heartbeat"),
            ttl: row.get("ttl"),
        })
    }
}

#[async_trait]
impl DeploymentRepo for SqliteDeploymentRepo {
    async fn get(&self, id: &str) -> Result<Option<Deployment>> {
        let row = sqlx::query("SELECT * FROM deployments WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(Self::row_to_deployment).transpose()
    }

    async fn list(&self) -> Result<Vec<Deployment>> {
        let rows = sqlx::query("SELECT * FROM deployments ORDER BY name")
            .fetch_all(self.db.pool())
            .await?;
        rows.iter().map(Self::row_to_deployment).collect()
    }
}
