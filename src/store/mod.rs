//! 持久化边界
//!
//! Execution / Step / PendingApproval / MemoryEntry / UsageRecord 的异步存取接口。
//! 所有状态迁移都通过 compare-and-set 完成，保证挂起 / 恢复 / 取消并发时只有一方生效。
//!
//! - InMemoryStore：进程内实现（测试与单机）
//! - SqliteStore：sqlx 异步 SQLite 实现（feature `async-sqlite`）

pub mod memory;
#[cfg(feature = "async-sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::approval::{ApprovalStatus, PendingApproval};
use crate::core::{Execution, ExecutionStatus, Step};
use crate::memory::{MemoryEntry, MemoryTier};
use crate::usage::UsageRecord;

pub use memory::InMemoryStore;
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("record already exists: {0}")]
    AlreadyExists(String),

    #[error("step {index} already recorded for execution {execution_id}")]
    DuplicateStep { execution_id: String, index: u32 },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Execution 查询条件
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub agent_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub limit: Option<usize>,
}

impl ExecutionFilter {
    pub fn by_status(status: ExecutionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn by_agent(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: Some(agent_id.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, exec: &Execution) -> bool {
        self.agent_id.as_ref().map_or(true, |a| a == &exec.agent_id)
            && self.status.map_or(true, |s| s == exec.status)
    }
}

/// 审批决议
#[derive(Debug, Clone)]
pub struct ApprovalResolution {
    pub status: ApprovalStatus,
    pub resolver: String,
    pub notes: Option<String>,
    pub resolved_at: DateTime<Utc>,
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn create_execution(&self, exec: &Execution) -> Result<(), StoreError>;

    async fn get_execution(&self, id: &str) -> Result<Option<Execution>, StoreError>;

    /// 按 ID 更新；cancel_requested 一旦置位不会被覆盖为 false
    async fn update_execution(&self, exec: &Execution) -> Result<(), StoreError>;

    /// 仅当存储中的状态为 expected 时写入 exec，返回是否写入
    async fn compare_and_update(&self, expected: ExecutionStatus, exec: &Execution) -> Result<bool, StoreError>;

    /// 置位取消请求标记（不改变状态）
    async fn request_cancel(&self, id: &str) -> Result<(), StoreError>;

    /// 按创建时间升序
    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>, StoreError>;

    /// 追加 Step；同一 (execution, index) 第二次写入返回 DuplicateStep
    async fn append_step(&self, step: &Step) -> Result<(), StoreError>;

    /// 按 index 升序
    async fn list_steps(&self, execution_id: &str) -> Result<Vec<Step>, StoreError>;
}

#[async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn create_approval(&self, approval: &PendingApproval) -> Result<(), StoreError>;

    async fn get_approval(&self, id: &str) -> Result<Option<PendingApproval>, StoreError>;

    /// 从 pending 迁移到决议状态；已决议时返回 None
    async fn resolve_approval(
        &self,
        id: &str,
        resolution: &ApprovalResolution,
    ) -> Result<Option<PendingApproval>, StoreError>;

    /// 按请求时间升序；status 为 None 时返回全部
    async fn list_approvals(&self, status: Option<ApprovalStatus>) -> Result<Vec<PendingApproval>, StoreError>;

    async fn approvals_for_execution(&self, execution_id: &str) -> Result<Vec<PendingApproval>, StoreError>;
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// 幂等写入：ID 已存在时不覆盖，返回 false
    async fn insert_memory(&self, entry: &MemoryEntry) -> Result<bool, StoreError>;

    async fn list_memories(&self, agent_id: &str, tier: MemoryTier) -> Result<Vec<MemoryEntry>, StoreError>;
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn record_usage(&self, record: &UsageRecord) -> Result<(), StoreError>;

    async fn list_usage(&self, agent_id: &str) -> Result<Vec<UsageRecord>, StoreError>;
}

/// 引擎使用的完整存储接口
pub trait Store: ExecutionStore + ApprovalStore + MemoryStore + UsageStore {}

impl<T> Store for T where T: ExecutionStore + ApprovalStore + MemoryStore + UsageStore {}
