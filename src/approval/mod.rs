//! 审批闸门：拦截高风险工具调用，持久化待审批记录并挂起 Execution
//!
//! 挂起不占用 worker：request_approval 写入 PendingApproval、在 Execution 上记录被拦截的调用并迁移到
//! awaiting_approval 后，worker 直接退出。resolve 以 CAS 决议审批，并把 Execution 从 awaiting_approval
//! 放回 queued，由编排器启动新的 worker 从存储中恢复。未决议的审批是合法的稳定状态。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{
    AgentError, ApprovalId, Execution, ExecutionId, ExecutionStatus, SuspendedCall, TokenUsage, ToolCall,
};
use crate::store::{ApprovalResolution, Store};
use crate::tools::RiskAssessment;

/// 系统自动决议（如取消 Execution）时的 resolver
pub const SYSTEM_RESOLVER: &str = "system";

pub fn new_approval_id() -> ApprovalId {
    format!("appr_{}", uuid::Uuid::new_v4())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ApprovalStatus::Pending),
            "approved" => Some(ApprovalStatus::Approved),
            "denied" => Some(ApprovalStatus::Denied),
            _ => None,
        }
    }
}

/// 人工决议
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    Deny,
}

/// 待审批的工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub id: ApprovalId,
    pub execution_id: ExecutionId,
    pub agent_id: String,
    pub tool_call: ToolCall,
    pub risk: RiskAssessment,
    pub requested_at: DateTime<Utc>,
    pub status: ApprovalStatus,
    pub resolver: Option<String>,
    pub notes: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl PendingApproval {
    pub fn is_resolved(&self) -> bool {
        self.status != ApprovalStatus::Pending
    }
}

/// 决议结果
#[derive(Debug, Clone)]
pub struct Resolved {
    pub approval: PendingApproval,
    /// Execution 已放回 queued，需要启动新 worker
    pub requeued: bool,
}

/// 审批闸门
pub struct ApprovalGate {
    store: Arc<dyn Store>,
}

impl ApprovalGate {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// 持久化待审批记录并挂起 Execution（running → awaiting_approval）
    pub async fn request_approval(
        &self,
        execution: &mut Execution,
        step_index: u32,
        call: ToolCall,
        raw_response: String,
        tokens: TokenUsage,
        risk: RiskAssessment,
    ) -> Result<PendingApproval, AgentError> {
        let approval = PendingApproval {
            id: new_approval_id(),
            execution_id: execution.id.clone(),
            agent_id: execution.agent_id.clone(),
            tool_call: call.clone(),
            risk: risk.clone(),
            requested_at: Utc::now(),
            status: ApprovalStatus::Pending,
            resolver: None,
            notes: None,
            resolved_at: None,
        };
        self.store.create_approval(&approval).await?;

        let mut next = execution.clone();
        next.suspended = Some(SuspendedCall {
            approval_id: approval.id.clone(),
            step_index,
            call,
            raw_response,
            tokens,
            risk,
        });
        next.transition(ExecutionStatus::AwaitingApproval)?;

        if !self.store.compare_and_update(ExecutionStatus::Running, &next).await? {
            // Execution 已被并发取消，撤销刚创建的审批
            self.deny_as_system(&approval.id, "execution no longer running").await?;
            return Err(AgentError::InvalidTransition {
                from: ExecutionStatus::Running,
                to: ExecutionStatus::AwaitingApproval,
            });
        }
        *execution = next;

        tracing::info!(
            execution_id = %execution.id,
            approval_id = %approval.id,
            tool = %approval.tool_call.name,
            "execution suspended awaiting approval"
        );
        Ok(approval)
    }

    /// 决议审批；只有第一次决议生效，之后返回 AlreadyResolved
    pub async fn resolve(
        &self,
        approval_id: &str,
        decision: ApprovalDecision,
        resolver: &str,
        notes: Option<String>,
    ) -> Result<Resolved, AgentError> {
        let resolution = ApprovalResolution {
            status: match decision {
                ApprovalDecision::Approve => ApprovalStatus::Approved,
                ApprovalDecision::Deny => ApprovalStatus::Denied,
            },
            resolver: resolver.to_string(),
            notes,
            resolved_at: Utc::now(),
        };

        let approval = match self.store.resolve_approval(approval_id, &resolution).await? {
            Some(approval) => approval,
            None => {
                return match self.store.get_approval(approval_id).await? {
                    Some(_) => Err(AgentError::AlreadyResolved(approval_id.to_string())),
                    None => Err(AgentError::NotFound(format!("approval {approval_id}"))),
                }
            }
        };

        let requeued = self.requeue(&approval.execution_id).await?;
        tracing::info!(
            approval_id = %approval.id,
            execution_id = %approval.execution_id,
            status = approval.status.as_str(),
            resolver = %resolver,
            requeued,
            "approval resolved"
        );
        Ok(Resolved { approval, requeued })
    }

    /// 系统拒绝（取消时使用），不放回队列
    pub async fn deny_as_system(&self, approval_id: &str, notes: &str) -> Result<bool, AgentError> {
        let resolution = ApprovalResolution {
            status: ApprovalStatus::Denied,
            resolver: SYSTEM_RESOLVER.to_string(),
            notes: Some(notes.to_string()),
            resolved_at: Utc::now(),
        };
        Ok(self.store.resolve_approval(approval_id, &resolution).await?.is_some())
    }

    /// awaiting_approval → queued
    async fn requeue(&self, execution_id: &str) -> Result<bool, AgentError> {
        let Some(exec) = self.store.get_execution(execution_id).await? else {
            return Err(AgentError::NotFound(format!("execution {execution_id}")));
        };
        if exec.status != ExecutionStatus::AwaitingApproval {
            return Ok(false);
        }
        let mut next = exec;
        next.transition(ExecutionStatus::Queued)?;
        Ok(self
            .store
            .compare_and_update(ExecutionStatus::AwaitingApproval, &next)
            .await?)
    }

    pub async fn list(&self, status: Option<ApprovalStatus>) -> Result<Vec<PendingApproval>, AgentError> {
        Ok(self.store.list_approvals(status).await?)
    }

    pub async fn get(&self, approval_id: &str) -> Result<PendingApproval, AgentError> {
        self.store
            .get_approval(approval_id)
            .await?
            .ok_or_else(|| AgentError::NotFound(format!("approval {approval_id}")))
    }

    /// 等待时间超过 max_age 的待审批记录
    pub async fn stale(&self, max_age: Duration) -> Result<Vec<PendingApproval>, AgentError> {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let now = Utc::now();
        Ok(self
            .store
            .list_approvals(Some(ApprovalStatus::Pending))
            .await?
            .into_iter()
            .filter(|a| now.signed_duration_since(a.requested_at) > max_age)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TriggerSource;
    use crate::store::{ExecutionStore, InMemoryStore};
    use crate::tools::{RiskLevel, ToolCategory};
    use serde_json::json;

    fn risk() -> RiskAssessment {
        RiskAssessment {
            level: RiskLevel::High,
            category: ToolCategory::External,
            reasons: vec!["external tool".into()],
        }
    }

    async fn running_execution(store: &Arc<InMemoryStore>) -> Execution {
        let mut exec = Execution::new("agent", json!("refund"), TriggerSource::Manual);
        store.create_execution(&exec).await.unwrap();
        let queued = exec.clone();
        exec.transition(ExecutionStatus::Running).unwrap();
        assert!(store.compare_and_update(queued.status, &exec).await.unwrap());
        exec
    }

    fn call() -> ToolCall {
        ToolCall {
            name: "refund".into(),
            arguments: json!({"amount": 500}),
        }
    }

    #[tokio::test]
    async fn test_request_suspends_execution() {
        let store = Arc::new(InMemoryStore::new());
        let gate = ApprovalGate::new(store.clone());
        let mut exec = running_execution(&store).await;

        let approval = gate
            .request_approval(&mut exec, 0, call(), "{}".into(), TokenUsage::default(), risk())
            .await
            .unwrap();
        let stored = store.get_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::AwaitingApproval);
        assert_eq!(stored.suspended.unwrap().approval_id, approval.id);
        assert_eq!(gate.list(Some(ApprovalStatus::Pending)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_once() {
        let store = Arc::new(InMemoryStore::new());
        let gate = ApprovalGate::new(store.clone());
        let mut exec = running_execution(&store).await;
        let approval = gate
            .request_approval(&mut exec, 0, call(), "{}".into(), TokenUsage::default(), risk())
            .await
            .unwrap();

        let first = gate
            .resolve(&approval.id, ApprovalDecision::Approve, "alice", None)
            .await
            .unwrap();
        assert!(first.requeued);
        assert_eq!(first.approval.status, ApprovalStatus::Approved);
        let stored = store.get_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Queued);

        let second = gate
            .resolve(&approval.id, ApprovalDecision::Deny, "bob", Some("no".into()))
            .await;
        assert!(matches!(second, Err(AgentError::AlreadyResolved(_))));
        assert!(matches!(
            gate.resolve("appr_missing", ApprovalDecision::Approve, "x", None).await,
            Err(AgentError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_lists_old_pending() {
        let store = Arc::new(InMemoryStore::new());
        let gate = ApprovalGate::new(store.clone());
        let mut exec = running_execution(&store).await;
        gate.request_approval(&mut exec, 0, call(), "{}".into(), TokenUsage::default(), risk())
            .await
            .unwrap();
        assert!(gate.stale(Duration::from_secs(3600)).await.unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(gate.stale(Duration::from_millis(5)).await.unwrap().len(), 1);
    }
}
