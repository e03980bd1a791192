//! 状态定义：Execution / Step / Observation
//!
//! Execution 是一次 Agent 运行的完整状态，所有字段可序列化并由 Store 持久化；
//! 恢复（审批后继续、进程重启）时由 Execution + Step 历史重建，不依赖内存中的协程。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{AgentError, FailureReason};
use crate::tools::RiskAssessment;

pub type AgentId = String;
pub type ExecutionId = String;
pub type ApprovalId = String;

/// 生成新的 Execution ID
pub fn new_execution_id() -> ExecutionId {
    format!("exec_{}", uuid::Uuid::new_v4())
}

/// Execution 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Running,
    AwaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Running => "running",
            ExecutionStatus::AwaitingApproval => "awaiting_approval",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => ExecutionStatus::Queued,
            "running" => ExecutionStatus::Running,
            "awaiting_approval" => ExecutionStatus::AwaitingApproval,
            "completed" => ExecutionStatus::Completed,
            "failed" => ExecutionStatus::Failed,
            "cancelled" => ExecutionStatus::Cancelled,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// 合法的状态迁移。
    /// Running -> Running 用于崩溃恢复时重新认领孤儿 Execution。
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Running)
                | (Running, AwaitingApproval)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (AwaitingApproval, Queued)
                | (AwaitingApproval, Cancelled)
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution 的触发来源
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerSource {
    Manual,
    Event { event_type: String },
    Schedule { expression: String },
    Webhook,
}

/// 模型请求的工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Token 使用统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// 被审批拦截、挂起中的工具调用；审批决议后由新的 worker 读取并继续
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspendedCall {
    pub approval_id: ApprovalId,
    /// 该调用最终写入的 Step 序号
    pub step_index: u32,
    pub call: ToolCall,
    pub raw_response: String,
    pub tokens: TokenUsage,
    pub risk: RiskAssessment,
}

/// 早期 Step 的一次性摘要（每个 Execution 至多生成一次）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSummary {
    /// 摘要覆盖的 Step 数量（序号 < through 的 Step）
    pub through: u32,
    /// 摘要文本；摘要调用失败时为 None（不再重试）
    pub text: Option<String>,
}

/// 一次 Agent 运行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub agent_id: AgentId,
    pub status: ExecutionStatus,
    pub trigger: TriggerSource,
    pub input: serde_json::Value,
    pub output: Option<String>,
    pub failure: Option<FailureReason>,
    pub failure_detail: Option<String>,
    pub step_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub usage: TokenUsage,
    pub cost_usd: f64,
    /// 软超额策略下超出配额的 token 与费用
    pub overage_tokens: u64,
    pub overage_cost_usd: f64,
    /// 实际运行时长（不含等待审批的时间）
    pub active_elapsed_ms: u64,
    pub suspended: Option<SuspendedCall>,
    pub context_summary: Option<ContextSummary>,
    pub cancel_requested: bool,
}

impl Execution {
    pub fn new(agent_id: impl Into<AgentId>, input: serde_json::Value, trigger: TriggerSource) -> Self {
        Self {
            id: new_execution_id(),
            agent_id: agent_id.into(),
            status: ExecutionStatus::Queued,
            trigger,
            input,
            output: None,
            failure: None,
            failure_detail: None,
            step_count: 0,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            usage: TokenUsage::default(),
            cost_usd: 0.0,
            overage_tokens: 0,
            overage_cost_usd: 0.0,
            active_elapsed_ms: 0,
            suspended: None,
            context_summary: None,
            cancel_requested: false,
        }
    }

    /// 输入的文本形式：字符串原样返回，其它 JSON 序列化
    pub fn input_text(&self) -> String {
        match &self.input {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// 校验并迁移状态
    pub fn transition(&mut self, next: ExecutionStatus) -> Result<(), AgentError> {
        if !self.status.can_transition_to(next) {
            return Err(AgentError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        if next == ExecutionStatus::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
            self.suspended = None;
        }
        self.status = next;
        Ok(())
    }

    /// 成功结束：必须有非空输出
    pub fn complete(&mut self, output: impl Into<String>) -> Result<(), AgentError> {
        self.transition(ExecutionStatus::Completed)?;
        self.output = Some(output.into());
        Ok(())
    }

    /// 失败结束：必须有失败原因
    pub fn fail(&mut self, reason: FailureReason, detail: impl Into<String>) -> Result<(), AgentError> {
        self.transition(ExecutionStatus::Failed)?;
        self.failure = Some(reason);
        self.failure_detail = Some(detail.into());
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), AgentError> {
        self.transition(ExecutionStatus::Cancelled)
    }

    /// 总耗时（毫秒）：实际运行时长
    pub fn duration_ms(&self) -> u64 {
        self.active_elapsed_ms
    }
}

/// Step 的动作：最终回答、工具调用或无法解析的输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    FinalAnswer { answer: String },
    ToolCall(ToolCall),
    Invalid { reason: String },
}

impl StepAction {
    pub fn kind(&self) -> &'static str {
        match self {
            StepAction::FinalAnswer { .. } => "final_answer",
            StepAction::ToolCall(_) => "tool_call",
            StepAction::Invalid { .. } => "invalid",
        }
    }
}

/// Observation 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationKind {
    Success,
    ValidationError,
    ToolError,
    Timeout,
    /// 工具不在允许列表 / 未注册
    Rejected,
    /// 审批被拒绝
    Denied,
}

/// 工具执行结果（或错误），下一轮作为上下文提供给模型
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub kind: ObservationKind,
    pub content: String,
}

impl Observation {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            kind: ObservationKind::Success,
            content: content.into(),
        }
    }

    pub fn error(kind: ObservationKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
        }
    }

    pub fn denied(notes: &str) -> Self {
        Self {
            kind: ObservationKind::Denied,
            content: format!("tool call denied: {}", notes),
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind != ObservationKind::Success
    }

    /// 可在循环内恢复的错误转为 Observation；致命错误返回 None
    pub fn from_error(err: &AgentError) -> Option<Self> {
        let (kind, content) = match err {
            AgentError::Validation(msg) => (ObservationKind::ValidationError, msg.clone()),
            AgentError::UnparseableOutput(msg) => (ObservationKind::ValidationError, msg.clone()),
            AgentError::ToolExecution(msg) => (ObservationKind::ToolError, msg.clone()),
            _ => return None,
        };
        Some(Self::error(kind, content))
    }
}

/// 单个 reason/act/observe 单元；写入后不可修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub execution_id: ExecutionId,
    pub index: u32,
    pub raw_response: String,
    pub action: StepAction,
    pub observation: Option<Observation>,
    pub tokens: TokenUsage,
    pub created_at: DateTime<Utc>,
}

impl Step {
    pub fn new(
        execution_id: impl Into<ExecutionId>,
        index: u32,
        raw_response: impl Into<String>,
        action: StepAction,
        observation: Option<Observation>,
        tokens: TokenUsage,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            index,
            raw_response: raw_response.into(),
            action,
            observation,
            tokens,
            created_at: Utc::now(),
        }
    }
}

/// Execution 及其 Step 日志
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub execution: Execution,
    pub steps: Vec<Step>,
}

impl ExecutionResult {
    pub fn status(&self) -> ExecutionStatus {
        self.execution.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use ExecutionStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(AwaitingApproval));
        assert!(AwaitingApproval.can_transition_to(Queued));
        assert!(!AwaitingApproval.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Cancelled));
    }

    #[test]
    fn test_complete_requires_running() {
        let mut exec = Execution::new("a", serde_json::json!("hi"), TriggerSource::Manual);
        assert!(exec.complete("done").is_err());
        exec.transition(ExecutionStatus::Running).unwrap();
        exec.complete("done").unwrap();
        assert_eq!(exec.output.as_deref(), Some("done"));
        assert!(exec.failure.is_none());
        assert!(exec.ended_at.is_some());
    }

    #[test]
    fn test_fail_records_reason() {
        let mut exec = Execution::new("a", serde_json::json!({"q": 1}), TriggerSource::Manual);
        exec.transition(ExecutionStatus::Running).unwrap();
        exec.fail(FailureReason::Timeout, "too slow").unwrap();
        assert_eq!(exec.failure, Some(FailureReason::Timeout));
        assert!(exec.output.is_none());
        assert_eq!(exec.input_text(), r#"{"q":1}"#);
    }

    #[test]
    fn test_denied_observation_format() {
        let obs = Observation::denied("not authorized");
        assert_eq!(obs.content, "tool call denied: not authorized");
        assert!(obs.is_error());
    }

    #[test]
    fn test_status_round_trip_str() {
        for s in ["queued", "running", "awaiting_approval", "completed", "failed", "cancelled"] {
            assert_eq!(ExecutionStatus::parse(s).unwrap().as_str(), s);
        }
        assert!(ExecutionStatus::parse("paused").is_none());
    }

    #[test]
    fn test_recoverable_errors_become_observations() {
        let obs = Observation::from_error(&AgentError::ToolExecution("disk full".into())).unwrap();
        assert_eq!(obs.kind, ObservationKind::ToolError);
        assert_eq!(obs.content, "disk full");

        let obs = Observation::from_error(&AgentError::Validation("missing field".into())).unwrap();
        assert_eq!(obs.kind, ObservationKind::ValidationError);

        assert!(Observation::from_error(&AgentError::QuotaExceeded("ops".into())).is_none());
    }
}
