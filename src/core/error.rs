//! 引擎错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 AgentError 决定 RetryAfter / RetryWithPrompt / Fail。
//! FatalProvider、重试耗尽的 RetryableProvider、QuotaExceeded、Persistence 会直接终止 Execution（见 `is_fatal`），
//! 其余错误都转为 Observation 回灌给模型。

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::ExecutionStatus;
use crate::llm::LlmError;
use crate::store::StoreError;

/// 引擎运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 工具参数不符合 schema（本地恢复，作为 Observation 回灌）
    #[error("Validation error: {0}")]
    Validation(String),

    /// 工具执行失败或超时（本地恢复，计入步数）
    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    /// 模型网关瞬时错误（限流、过载、网络），网关重试耗尽后才会返回
    #[error("Retryable provider error: {0}")]
    RetryableProvider(LlmError),

    /// 模型网关不可恢复错误（凭证无效、请求格式错误）
    #[error("Fatal provider error: {0}")]
    FatalProvider(LlmError),

    #[error("Quota exceeded for agent {0}")]
    QuotaExceeded(String),

    /// 模型输出无法解析为最终回答或工具调用
    #[error("Unparseable model output: {0}")]
    UnparseableOutput(String),

    #[error("Persistence failure: {0}")]
    Persistence(#[from] StoreError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("Approval {0} already resolved")]
    AlreadyResolved(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl AgentError {
    /// 是否为 Execution 级致命错误（立即失败，不进入下一轮）
    ///
    /// RetryableProvider 只在网关重试耗尽后才会到达这里，因此同样视为致命。
    pub fn is_fatal(&self) -> bool {
        self.failure_reason().is_some()
    }

    /// 致命错误对应的失败原因；非致命错误返回 None
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            AgentError::RetryableProvider(_) => Some(FailureReason::ProviderUnavailable),
            AgentError::FatalProvider(_) => Some(FailureReason::ProviderError),
            AgentError::QuotaExceeded(_) => Some(FailureReason::QuotaExceeded),
            AgentError::Persistence(_) => Some(FailureReason::PersistenceError),
            _ => None,
        }
    }
}

/// Execution 失败原因（对外可见，计费 UI 需要区分 quota_exceeded）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    StepBudgetExceeded,
    Timeout,
    QuotaExceeded,
    /// 模型重试耗尽仍不可达
    ProviderUnavailable,
    /// 凭证无效、请求格式错误等
    ProviderError,
    PersistenceError,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::StepBudgetExceeded => "step_budget_exceeded",
            FailureReason::Timeout => "timeout",
            FailureReason::QuotaExceeded => "quota_exceeded",
            FailureReason::ProviderUnavailable => "provider_unavailable",
            FailureReason::ProviderError => "provider_error",
            FailureReason::PersistenceError => "persistence_error",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 等待一段时间后重试同一请求（限流、过载、网络）
    RetryAfter(Duration),
    /// 将纠正提示注入下一次请求，让模型重新输出（如 JSON 格式错误）
    RetryWithPrompt(String),
    /// 终止当前 Execution
    Fail(FailureReason),
}
