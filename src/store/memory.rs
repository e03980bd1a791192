//! 进程内存储（测试与单机部署）
//!
//! 每类记录一把 tokio RwLock；CAS 在同一把写锁内完成读-比较-写。

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::approval::{ApprovalStatus, PendingApproval};
use crate::core::{Execution, ExecutionStatus, Step};
use crate::memory::{MemoryEntry, MemoryTier};
use crate::store::{
    ApprovalResolution, ApprovalStore, ExecutionFilter, ExecutionStore, MemoryStore, StoreError, UsageStore,
};
use crate::usage::UsageRecord;

#[derive(Default)]
pub struct InMemoryStore {
    executions: RwLock<HashMap<String, Execution>>,
    steps: RwLock<HashMap<String, BTreeMap<u32, Step>>>,
    approvals: RwLock<HashMap<String, PendingApproval>>,
    memories: RwLock<HashMap<String, MemoryEntry>>,
    usage: RwLock<Vec<UsageRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn merge_sticky(incoming: &Execution, existing: &Execution) -> Execution {
    let mut next = incoming.clone();
    next.cancel_requested |= existing.cancel_requested;
    next
}

#[async_trait]
impl ExecutionStore for InMemoryStore {
    async fn create_execution(&self, exec: &Execution) -> Result<(), StoreError> {
        let mut executions = self.executions.write().await;
        if executions.contains_key(&exec.id) {
            return Err(StoreError::AlreadyExists(exec.id.clone()));
        }
        executions.insert(exec.id.clone(), exec.clone());
        Ok(())
    }

    async fn get_execution(&self, id: &str) -> Result<Option<Execution>, StoreError> {
        Ok(self.executions.read().await.get(id).cloned())
    }

    async fn update_execution(&self, exec: &Execution) -> Result<(), StoreError> {
        let mut executions = self.executions.write().await;
        let existing = executions
            .get(&exec.id)
            .ok_or_else(|| StoreError::NotFound(exec.id.clone()))?;
        let next = merge_sticky(exec, existing);
        executions.insert(exec.id.clone(), next);
        Ok(())
    }

    async fn compare_and_update(&self, expected: ExecutionStatus, exec: &Execution) -> Result<bool, StoreError> {
        let mut executions = self.executions.write().await;
        let existing = executions
            .get(&exec.id)
            .ok_or_else(|| StoreError::NotFound(exec.id.clone()))?;
        if existing.status != expected {
            return Ok(false);
        }
        let next = merge_sticky(exec, existing);
        executions.insert(exec.id.clone(), next);
        Ok(true)
    }

    async fn request_cancel(&self, id: &str) -> Result<(), StoreError> {
        let mut executions = self.executions.write().await;
        let exec = executions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        exec.cancel_requested = true;
        Ok(())
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>, StoreError> {
        let executions = self.executions.read().await;
        let mut out: Vec<Execution> = executions.values().filter(|e| filter.matches(e)).cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn append_step(&self, step: &Step) -> Result<(), StoreError> {
        let mut steps = self.steps.write().await;
        let log = steps.entry(step.execution_id.clone()).or_default();
        if log.contains_key(&step.index) {
            return Err(StoreError::DuplicateStep {
                execution_id: step.execution_id.clone(),
                index: step.index,
            });
        }
        log.insert(step.index, step.clone());
        Ok(())
    }

    async fn list_steps(&self, execution_id: &str) -> Result<Vec<Step>, StoreError> {
        Ok(self
            .steps
            .read()
            .await
            .get(execution_id)
            .map(|log| log.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl ApprovalStore for InMemoryStore {
    async fn create_approval(&self, approval: &PendingApproval) -> Result<(), StoreError> {
        let mut approvals = self.approvals.write().await;
        if approvals.contains_key(&approval.id) {
            return Err(StoreError::AlreadyExists(approval.id.clone()));
        }
        approvals.insert(approval.id.clone(), approval.clone());
        Ok(())
    }

    async fn get_approval(&self, id: &str) -> Result<Option<PendingApproval>, StoreError> {
        Ok(self.approvals.read().await.get(id).cloned())
    }

    async fn resolve_approval(
        &self,
        id: &str,
        resolution: &ApprovalResolution,
    ) -> Result<Option<PendingApproval>, StoreError> {
        let mut approvals = self.approvals.write().await;
        let Some(approval) = approvals.get_mut(id) else {
            return Ok(None);
        };
        if approval.status != ApprovalStatus::Pending {
            return Ok(None);
        }
        approval.status = resolution.status;
        approval.resolver = Some(resolution.resolver.clone());
        approval.notes = resolution.notes.clone();
        approval.resolved_at = Some(resolution.resolved_at);
        Ok(Some(approval.clone()))
    }

    async fn list_approvals(&self, status: Option<ApprovalStatus>) -> Result<Vec<PendingApproval>, StoreError> {
        let approvals = self.approvals.read().await;
        let mut out: Vec<PendingApproval> = approvals
            .values()
            .filter(|a| status.map_or(true, |s| s == a.status))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        Ok(out)
    }

    async fn approvals_for_execution(&self, execution_id: &str) -> Result<Vec<PendingApproval>, StoreError> {
        let approvals = self.approvals.read().await;
        let mut out: Vec<PendingApproval> = approvals
            .values()
            .filter(|a| a.execution_id == execution_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        Ok(out)
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn insert_memory(&self, entry: &MemoryEntry) -> Result<bool, StoreError> {
        let mut memories = self.memories.write().await;
        if memories.contains_key(&entry.id) {
            return Ok(false);
        }
        memories.insert(entry.id.clone(), entry.clone());
        Ok(true)
    }

    async fn list_memories(&self, agent_id: &str, tier: MemoryTier) -> Result<Vec<MemoryEntry>, StoreError> {
        let memories = self.memories.read().await;
        let mut out: Vec<MemoryEntry> = memories
            .values()
            .filter(|m| m.agent_id == agent_id && m.tier == tier)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }
}

#[async_trait]
impl UsageStore for InMemoryStore {
    async fn record_usage(&self, record: &UsageRecord) -> Result<(), StoreError> {
        self.usage.write().await.push(record.clone());
        Ok(())
    }

    async fn list_usage(&self, agent_id: &str) -> Result<Vec<UsageRecord>, StoreError> {
        Ok(self
            .usage
            .read()
            .await
            .iter()
            .filter(|r| r.agent_id == agent_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{StepAction, TokenUsage, TriggerSource};
    use std::sync::Arc;

    fn exec() -> Execution {
        Execution::new("agent", serde_json::json!("hi"), TriggerSource::Manual)
    }

    #[tokio::test]
    async fn test_cas_only_one_winner() {
        let store = Arc::new(InMemoryStore::new());
        let e = exec();
        store.create_execution(&e).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let mut next = e.clone();
            handles.push(tokio::spawn(async move {
                next.transition(ExecutionStatus::Running).unwrap();
                store.compare_and_update(ExecutionStatus::Queued, &next).await.unwrap()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_duplicate_step_rejected() {
        let store = InMemoryStore::new();
        let step = Step::new(
            "exec_1",
            0,
            "raw",
            StepAction::FinalAnswer { answer: "x".into() },
            None,
            TokenUsage::default(),
        );
        store.append_step(&step).await.unwrap();
        assert!(matches!(
            store.append_step(&step).await,
            Err(StoreError::DuplicateStep { index: 0, .. })
        ));
        assert_eq!(store.list_steps("exec_1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_flag_is_sticky() {
        let store = InMemoryStore::new();
        let e = exec();
        store.create_execution(&e).await.unwrap();
        store.request_cancel(&e.id).await.unwrap();
        store.update_execution(&e).await.unwrap();
        assert!(store.get_execution(&e.id).await.unwrap().unwrap().cancel_requested);
    }

    #[tokio::test]
    async fn test_list_filter() {
        let store = InMemoryStore::new();
        let a = exec();
        let mut b = Execution::new("other", serde_json::json!("x"), TriggerSource::Manual);
        b.transition(ExecutionStatus::Running).unwrap();
        store.create_execution(&a).await.unwrap();
        store.create_execution(&b).await.unwrap();
        let queued = store
            .list_executions(&ExecutionFilter::by_status(ExecutionStatus::Queued))
            .await
            .unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, a.id);
        let by_agent = store.list_executions(&ExecutionFilter::by_agent("other")).await.unwrap();
        assert_eq!(by_agent[0].id, b.id);
    }
}
