//! 异步 SQLite 存储（sqlx）
//!
//! 每张表保留用于过滤 / CAS 的列，其余字段以 JSON 存在 data 列。
//! 需要启用 `async-sqlite` feature。

use std::path::Path;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::approval::{ApprovalStatus, PendingApproval};
use crate::core::{Execution, ExecutionStatus, Step};
use crate::memory::{MemoryEntry, MemoryTier};
use crate::store::{
    ApprovalResolution, ApprovalStore, ExecutionFilter, ExecutionStore, MemoryStore, StoreError, UsageStore,
};
use crate::usage::UsageRecord;

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String, StoreError> {
    Ok(serde_json::to_string(value)?)
}

fn from_json<T: DeserializeOwned>(data: &str) -> Result<T, StoreError> {
    Ok(serde_json::from_str(data)?)
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// 打开（不存在则创建）数据库文件并建表
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new().max_connections(5).connect(&db_url).await?;
        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), StoreError> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                data TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status)",
            "CREATE INDEX IF NOT EXISTS idx_executions_agent ON executions(agent_id)",
            "CREATE TABLE IF NOT EXISTS steps (
                execution_id TEXT NOT NULL,
                idx INTEGER NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (execution_id, idx)
            )",
            "CREATE TABLE IF NOT EXISTS approvals (
                id TEXT PRIMARY KEY,
                execution_id TEXT NOT NULL,
                status TEXT NOT NULL,
                requested_at TEXT NOT NULL,
                data TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_approvals_execution ON approvals(execution_id)",
            "CREATE TABLE IF NOT EXISTS memories (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                tier TEXT NOT NULL,
                created_at TEXT NOT NULL,
                data TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_memories_agent ON memories(agent_id, tier)",
            "CREATE TABLE IF NOT EXISTS usage_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                execution_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                data TEXT NOT NULL
            )",
        ];
        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn row_to_execution(row: &sqlx::sqlite::SqliteRow) -> Result<Execution, StoreError> {
        let data: String = row.get("data");
        let cancel_requested: i64 = row.get("cancel_requested");
        let mut exec: Execution = from_json(&data)?;
        exec.cancel_requested |= cancel_requested != 0;
        Ok(exec)
    }
}

#[async_trait]
impl ExecutionStore for SqliteStore {
    async fn create_execution(&self, exec: &Execution) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO executions (id, agent_id, status, created_at, cancel_requested, data)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&exec.id)
        .bind(&exec.agent_id)
        .bind(exec.status.as_str())
        .bind(exec.created_at.to_rfc3339())
        .bind(exec.cancel_requested as i64)
        .bind(to_json(exec)?)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(exec.id.clone()));
        }
        Ok(())
    }

    async fn get_execution(&self, id: &str) -> Result<Option<Execution>, StoreError> {
        let row = sqlx::query("SELECT cancel_requested, data FROM executions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_execution).transpose()
    }

    async fn update_execution(&self, exec: &Execution) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE executions SET status = ?, cancel_requested = MAX(cancel_requested, ?), data = ? WHERE id = ?",
        )
        .bind(exec.status.as_str())
        .bind(exec.cancel_requested as i64)
        .bind(to_json(exec)?)
        .bind(&exec.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(exec.id.clone()));
        }
        Ok(())
    }

    async fn compare_and_update(&self, expected: ExecutionStatus, exec: &Execution) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE executions SET status = ?, cancel_requested = MAX(cancel_requested, ?), data = ?
             WHERE id = ? AND status = ?",
        )
        .bind(exec.status.as_str())
        .bind(exec.cancel_requested as i64)
        .bind(to_json(exec)?)
        .bind(&exec.id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_execution(&exec.id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(exec.id.clone())),
        }
    }

    async fn request_cancel(&self, id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE executions SET cancel_requested = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>, StoreError> {
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let rows = sqlx::query(
            "SELECT cancel_requested, data FROM executions
             WHERE (?1 IS NULL OR agent_id = ?1) AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at ASC, id ASC LIMIT ?3",
        )
        .bind(filter.agent_id.as_deref())
        .bind(filter.status.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_execution).collect()
    }

    async fn append_step(&self, step: &Step) -> Result<(), StoreError> {
        let result = sqlx::query("INSERT OR IGNORE INTO steps (execution_id, idx, data) VALUES (?, ?, ?)")
            .bind(&step.execution_id)
            .bind(i64::from(step.index))
            .bind(to_json(step)?)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::DuplicateStep {
                execution_id: step.execution_id.clone(),
                index: step.index,
            });
        }
        Ok(())
    }

    async fn list_steps(&self, execution_id: &str) -> Result<Vec<Step>, StoreError> {
        let rows = sqlx::query("SELECT data FROM steps WHERE execution_id = ? ORDER BY idx ASC")
            .bind(execution_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|row| from_json(&row.get::<String, _>("data"))).collect()
    }
}

#[async_trait]
impl ApprovalStore for SqliteStore {
    async fn create_approval(&self, approval: &PendingApproval) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO approvals (id, execution_id, status, requested_at, data) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&approval.id)
        .bind(&approval.execution_id)
        .bind(approval.status.as_str())
        .bind(approval.requested_at.to_rfc3339())
        .bind(to_json(approval)?)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(approval.id.clone()));
        }
        Ok(())
    }

    async fn get_approval(&self, id: &str) -> Result<Option<PendingApproval>, StoreError> {
        let row = sqlx::query("SELECT data FROM approvals WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| from_json(&r.get::<String, _>("data"))).transpose()
    }

    async fn resolve_approval(
        &self,
        id: &str,
        resolution: &ApprovalResolution,
    ) -> Result<Option<PendingApproval>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT data FROM approvals WHERE id = ? AND status = 'pending'")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let mut approval: PendingApproval = from_json(&row.get::<String, _>("data"))?;
        approval.status = resolution.status;
        approval.resolver = Some(resolution.resolver.clone());
        approval.notes = resolution.notes.clone();
        approval.resolved_at = Some(resolution.resolved_at);

        let result = sqlx::query("UPDATE approvals SET status = ?, data = ? WHERE id = ? AND status = 'pending'")
            .bind(approval.status.as_str())
            .bind(to_json(&approval)?)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }
        tx.commit().await?;
        Ok(Some(approval))
    }

    async fn list_approvals(&self, status: Option<ApprovalStatus>) -> Result<Vec<PendingApproval>, StoreError> {
        let rows = sqlx::query(
            "SELECT data FROM approvals WHERE (?1 IS NULL OR status = ?1) ORDER BY requested_at ASC",
        )
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|row| from_json(&row.get::<String, _>("data"))).collect()
    }

    async fn approvals_for_execution(&self, execution_id: &str) -> Result<Vec<PendingApproval>, StoreError> {
        let rows = sqlx::query("SELECT data FROM approvals WHERE execution_id = ? ORDER BY requested_at ASC")
            .bind(execution_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|row| from_json(&row.get::<String, _>("data"))).collect()
    }
}

#[async_trait]
impl MemoryStore for SqliteStore {
    async fn insert_memory(&self, entry: &MemoryEntry) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO memories (id, agent_id, tier, created_at, data) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&entry.id)
        .bind(&entry.agent_id)
        .bind(entry.tier.as_str())
        .bind(entry.created_at.to_rfc3339())
        .bind(to_json(entry)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_memories(&self, agent_id: &str, tier: MemoryTier) -> Result<Vec<MemoryEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT data FROM memories WHERE agent_id = ? AND tier = ? ORDER BY created_at ASC",
        )
        .bind(agent_id)
        .bind(tier.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|row| from_json(&row.get::<String, _>("data"))).collect()
    }
}

#[async_trait]
impl UsageStore for SqliteStore {
    async fn record_usage(&self, record: &UsageRecord) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO usage_records (execution_id, agent_id, data) VALUES (?, ?, ?)")
            .bind(&record.execution_id)
            .bind(&record.agent_id)
            .bind(to_json(record)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_usage(&self, agent_id: &str) -> Result<Vec<UsageRecord>, StoreError> {
        let rows = sqlx::query("SELECT data FROM usage_records WHERE agent_id = ? ORDER BY id ASC")
            .bind(agent_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|row| from_json(&row.get::<String, _>("data"))).collect()
    }
}
