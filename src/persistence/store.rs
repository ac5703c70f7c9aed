//! SQLite-based persistence store
//!
//! Documents are stored as JSON next to the columns the queries filter on.
//! The `version` column backs the optimistic concurrency checks.

use crate::core::{BarrierInstance, Interrupt, NodeExecution, RunRecord};
use crate::persistence::{BarrierStore, InterruptStore, NodeExecutionStore, RunStore, StoreError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use uuid::Uuid;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS nodes (
        id TEXT PRIMARY KEY,
        plan_execution_id TEXT NOT NULL,
        parent_id TEXT,
        status TEXT NOT NULL,
        version INTEGER NOT NULL,
        document TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_nodes_run ON nodes(plan_execution_id)",
    "CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes(parent_id)",
    r#"
    CREATE TABLE IF NOT EXISTS barriers (
        plan_execution_id TEXT NOT NULL,
        identifier TEXT NOT NULL,
        state TEXT NOT NULL,
        version INTEGER NOT NULL,
        document TEXT NOT NULL,
        PRIMARY KEY (plan_execution_id, identifier)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS interrupts (
        id TEXT PRIMARY KEY,
        plan_execution_id TEXT NOT NULL,
        created_at TEXT NOT NULL,
        version INTEGER NOT NULL,
        document TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_interrupts_run ON interrupts(plan_execution_id)",
    r#"
    CREATE TABLE IF NOT EXISTS runs (
        id TEXT PRIMARY KEY,
        plan_id TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at TEXT NOT NULL,
        version INTEGER NOT NULL,
        document TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs(started_at)",
];

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// SQLite store for every engine document
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a database file
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Create store with default path
    pub async fn with_default_path() -> Result<Self> {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        let db_dir = data_dir.join("pipeline-engine");
        std::fs::create_dir_all(&db_dir)
            .with_context(|| format!("Failed to create {}", db_dir.display()))?;

        Self::new(db_dir.join("executions.db")).await
    }

    /// Private in-memory database, gone when the store is dropped
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to initialize schema")?;
        }
        Ok(())
    }

    fn timestamp(dt: DateTime<Utc>) -> String {
        dt.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    fn decode<T: DeserializeOwned>(row: &sqlx::sqlite::SqliteRow) -> Result<T, StoreError> {
        let document: String = row.try_get("document")?;
        Ok(serde_json::from_str(&document)?)
    }

    fn decode_all<T: DeserializeOwned>(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<T>, StoreError> {
        rows.iter().map(Self::decode).collect()
    }

    /// Turn a zero-row update into the right error
    async fn missed_update(
        &self,
        kind: &'static str,
        table: &str,
        key_sql: &str,
        keys: &[String],
        expected: u64,
    ) -> StoreError {
        let sql = format!("SELECT version FROM {} WHERE {}", table, key_sql);
        let mut query = sqlx::query(&sql);
        for key in keys {
            query = query.bind(key);
        }
        let id = keys.join("/");
        match query.fetch_optional(&self.pool).await {
            Ok(Some(row)) => match row.try_get::<i64, _>("version") {
                Ok(actual) => StoreError::VersionConflict {
                    kind,
                    id,
                    expected,
                    actual: actual as u64,
                },
                Err(e) => e.into(),
            },
            Ok(None) => StoreError::NotFound { kind, id },
            Err(e) => e.into(),
        }
    }
}

#[async_trait]
impl NodeExecutionStore for SqliteStore {
    async fn insert_node(&self, node: &NodeExecution) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO nodes (id, plan_execution_id, parent_id, status, version, document)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(node.id.to_string())
        .bind(node.plan_execution_id.to_string())
        .bind(node.parent_id.map(|p| p.to_string()))
        .bind(node.status.as_str())
        .bind(node.version as i64)
        .bind(serde_json::to_string(node)?)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_node(&self, id: Uuid) -> Result<Option<NodeExecution>, StoreError> {
        let row = sqlx::query("SELECT document FROM nodes WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::decode).transpose()
    }

    async fn update_node(&self, node: &NodeExecution) -> Result<NodeExecution, StoreError> {
        let mut next = node.clone();
        next.version = node.version + 1;
        next.last_updated_at = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE nodes SET status = ?1, version = ?2, document = ?3
            WHERE id = ?4 AND version = ?5
            "#,
        )
        .bind(next.status.as_str())
        .bind(next.version as i64)
        .bind(serde_json::to_string(&next)?)
        .bind(node.id.to_string())
        .bind(node.version as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self
                .missed_update("node execution", "nodes", "id = ?1", &[node.id.to_string()], node.version)
                .await);
        }
        Ok(next)
    }

    async fn list_nodes(&self, plan_execution_id: Uuid) -> Result<Vec<NodeExecution>, StoreError> {
        let rows = sqlx::query("SELECT document FROM nodes WHERE plan_execution_id = ?1 ORDER BY rowid")
            .bind(plan_execution_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        Self::decode_all(&rows)
    }

    async fn list_children(&self, parent_id: Uuid) -> Result<Vec<NodeExecution>, StoreError> {
        let rows = sqlx::query("SELECT document FROM nodes WHERE parent_id = ?1 ORDER BY rowid")
            .bind(parent_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        Self::decode_all(&rows)
    }
}

#[async_trait]
impl BarrierStore for SqliteStore {
    async fn insert_barrier(&self, barrier: &BarrierInstance) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO barriers (plan_execution_id, identifier, state, version, document)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(barrier.plan_execution_id.to_string())
        .bind(&barrier.identifier)
        .bind(format!("{:?}", barrier.state))
        .bind(barrier.version as i64)
        .bind(serde_json::to_string(barrier)?)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_barrier(
        &self,
        plan_execution_id: Uuid,
        identifier: &str,
    ) -> Result<Option<BarrierInstance>, StoreError> {
        let row = sqlx::query(
            "SELECT document FROM barriers WHERE plan_execution_id = ?1 AND identifier = ?2",
        )
        .bind(plan_execution_id.to_string())
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::decode).transpose()
    }

    async fn update_barrier(&self, barrier: &BarrierInstance) -> Result<BarrierInstance, StoreError> {
        let mut next = barrier.clone();
        next.version = barrier.version + 1;

        let result = sqlx::query(
            r#"
            UPDATE barriers SET state = ?1, version = ?2, document = ?3
            WHERE plan_execution_id = ?4 AND identifier = ?5 AND version = ?6
            "#,
        )
        .bind(format!("{:?}", next.state))
        .bind(next.version as i64)
        .bind(serde_json::to_string(&next)?)
        .bind(barrier.plan_execution_id.to_string())
        .bind(&barrier.identifier)
        .bind(barrier.version as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let keys = [barrier.plan_execution_id.to_string(), barrier.identifier.clone()];
            return Err(self
                .missed_update(
                    "barrier",
                    "barriers",
                    "plan_execution_id = ?1 AND identifier = ?2",
                    &keys,
                    barrier.version,
                )
                .await);
        }
        Ok(next)
    }

    async fn list_barriers(&self, plan_execution_id: Uuid) -> Result<Vec<BarrierInstance>, StoreError> {
        let rows = sqlx::query(
            "SELECT document FROM barriers WHERE plan_execution_id = ?1 ORDER BY identifier",
        )
        .bind(plan_execution_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        Self::decode_all(&rows)
    }
}

#[async_trait]
impl InterruptStore for SqliteStore {
    async fn insert_interrupt(&self, interrupt: &Interrupt) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO interrupts (id, plan_execution_id, created_at, version, document)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(interrupt.id.to_string())
        .bind(interrupt.plan_execution_id.to_string())
        .bind(Self::timestamp(interrupt.created_at))
        .bind(interrupt.version as i64)
        .bind(serde_json::to_string(interrupt)?)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_interrupt(&self, id: Uuid) -> Result<Option<Interrupt>, StoreError> {
        let row = sqlx::query("SELECT document FROM interrupts WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::decode).transpose()
    }

    async fn update_interrupt(&self, interrupt: &Interrupt) -> Result<Interrupt, StoreError> {
        let mut next = interrupt.clone();
        next.version = interrupt.version + 1;

        let result = sqlx::query(
            "UPDATE interrupts SET version = ?1, document = ?2 WHERE id = ?3 AND version = ?4",
        )
        .bind(next.version as i64)
        .bind(serde_json::to_string(&next)?)
        .bind(interrupt.id.to_string())
        .bind(interrupt.version as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self
                .missed_update(
                    "interrupt",
                    "interrupts",
                    "id = ?1",
                    &[interrupt.id.to_string()],
                    interrupt.version,
                )
                .await);
        }
        Ok(next)
    }

    async fn list_interrupts(&self, plan_execution_id: Uuid) -> Result<Vec<Interrupt>, StoreError> {
        let rows = sqlx::query(
            "SELECT document FROM interrupts WHERE plan_execution_id = ?1 ORDER BY created_at",
        )
        .bind(plan_execution_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        Self::decode_all(&rows)
    }
}

#[async_trait]
impl RunStore for SqliteStore {
    async fn insert_run(&self, run: &RunRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO runs (id, plan_id, status, started_at, version, document)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(run.plan_execution_id.to_string())
        .bind(&run.plan.id)
        .bind(run.status.as_str())
        .bind(Self::timestamp(run.started_at))
        .bind(run.version as i64)
        .bind(serde_json::to_string(run)?)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_run(&self, plan_execution_id: Uuid) -> Result<Option<RunRecord>, StoreError> {
        let row = sqlx::query("SELECT document FROM runs WHERE id = ?1")
            .bind(plan_execution_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::decode).transpose()
    }

    async fn update_run(&self, run: &RunRecord) -> Result<RunRecord, StoreError> {
        let mut next = run.clone();
        next.version = run.version + 1;

        let result = sqlx::query(
            r#"
            UPDATE runs SET status = ?1, version = ?2, document = ?3
            WHERE id = ?4 AND version = ?5
            "#,
        )
        .bind(next.status.as_str())
        .bind(next.version as i64)
        .bind(serde_json::to_string(&next)?)
        .bind(run.plan_execution_id.to_string())
        .bind(run.version as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self
                .missed_update(
                    "run",
                    "runs",
                    "id = ?1",
                    &[run.plan_execution_id.to_string()],
                    run.version,
                )
                .await);
        }
        Ok(next)
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>, StoreError> {
        let rows = sqlx::query("SELECT document FROM runs ORDER BY started_at DESC LIMIT ?1")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        Self::decode_all(&rows)
    }
}
