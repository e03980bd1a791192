//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 RecoveryAction，供模型网关决定是退避重试、带纠正提示重问还是终止 Execution。

use std::time::Duration;

use crate::core::{AgentError, FailureReason, RecoveryAction};

/// 默认重试次数与退避参数
pub const MAX_RETRIES: u32 = 3;
pub const BASE_RETRY_DELAY_MS: u64 = 500;
pub const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// 语义化错误恢复：将错误映射为可执行动作（退避重试 / 重问 / 终止）
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new(
            MAX_RETRIES,
            Duration::from_millis(BASE_RETRY_DELAY_MS),
            Duration::from_millis(MAX_RETRY_DELAY_MS),
        )
    }
}

impl RecoveryEngine {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// 指数退避：base * 2^attempt，封顶 max_delay
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// attempt 为已经失败的重试次数（首次调用失败时为 0）
    pub fn handle(&self, err: &AgentError, attempt: u32) -> RecoveryAction {
        match err {
            AgentError::RetryableProvider(llm_err) => {
                if attempt >= self.max_retries {
                    return RecoveryAction::Fail(FailureReason::ProviderUnavailable);
                }
                let delay = self.backoff(attempt);
                // 限流时尊重提供方给出的等待时间
                let delay = llm_err.retry_after().map_or(delay, |hint| hint.max(delay));
                RecoveryAction::RetryAfter(delay)
            }
            AgentError::FatalProvider(_) => RecoveryAction::Fail(FailureReason::ProviderError),
            AgentError::QuotaExceeded(_) => RecoveryAction::Fail(FailureReason::QuotaExceeded),
            AgentError::Persistence(_) => RecoveryAction::Fail(FailureReason::PersistenceError),
            AgentError::UnparseableOutput(raw) => RecoveryAction::RetryWithPrompt(format!(
                "Your previous reply could not be parsed ({raw}). \
                Reply with exactly one JSON object and nothing else: \
                either {{\"tool\": \"<tool name>\", \"args\": {{...}}}} to call a tool, \
                or {{\"final_answer\": \"<answer>\"}} when you are done."
            )),
            other => RecoveryAction::RetryWithPrompt(format!("The previous action failed: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;

    #[test]
    fn test_recovery_unparseable_output() {
        let engine = RecoveryEngine::default();
        let err = AgentError::UnparseableOutput("invalid json".to_string());
        match engine.handle(&err, 0) {
            RecoveryAction::RetryWithPrompt(msg) => {
                assert!(msg.contains("JSON"));
                assert!(msg.contains("final_answer"));
            }
            other => panic!("Expected RetryWithPrompt, got {:?}", other),
        }
    }

    #[test]
    fn test_recovery_backoff_grows_and_caps() {
        let engine = RecoveryEngine::new(10, Duration::from_millis(100), Duration::from_millis(1000));
        assert_eq!(engine.backoff(0), Duration::from_millis(100));
        assert_eq!(engine.backoff(1), Duration::from_millis(200));
        assert_eq!(engine.backoff(3), Duration::from_millis(800));
        assert_eq!(engine.backoff(8), Duration::from_millis(1000));
    }

    #[test]
    fn test_recovery_retryable_until_exhausted() {
        let engine = RecoveryEngine::new(2, Duration::from_millis(10), Duration::from_secs(1));
        let err = AgentError::RetryableProvider(LlmError::Overloaded("busy".into()));
        assert!(matches!(engine.handle(&err, 0), RecoveryAction::RetryAfter(_)));
        assert!(matches!(engine.handle(&err, 1), RecoveryAction::RetryAfter(_)));
        assert_eq!(
            engine.handle(&err, 2),
            RecoveryAction::Fail(FailureReason::ProviderUnavailable)
        );
    }

    #[test]
    fn test_recovery_rate_limit_hint() {
        let engine = RecoveryEngine::new(3, Duration::from_millis(10), Duration::from_secs(1));
        let err = AgentError::RetryableProvider(LlmError::RateLimited { retry_after_ms: 700 });
        assert_eq!(
            engine.handle(&err, 0),
            RecoveryAction::RetryAfter(Duration::from_millis(700))
        );
    }

    #[test]
    fn test_recovery_fatal_errors() {
        let engine = RecoveryEngine::default();
        let err = AgentError::FatalProvider(LlmError::InvalidCredentials("bad key".into()));
        assert_eq!(engine.handle(&err, 0), RecoveryAction::Fail(FailureReason::ProviderError));
        let err = AgentError::QuotaExceeded("a".into());
        assert_eq!(engine.handle(&err, 0), RecoveryAction::Fail(FailureReason::QuotaExceeded));
    }
}
