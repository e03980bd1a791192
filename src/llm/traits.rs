//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock）实现 LlmClient：complete（非流式）、complete_stream（流式 Token）。
//! 错误统一为 LlmError，并区分可重试（限流、过载、超时、网络）与不可恢复（凭证、请求格式）。

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, Stream};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{TokenUsage, ToolCall};
use crate::memory::Message;

/// 模型提供方错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("rate limited (retry after {retry_after_ms} ms)")]
    RateLimited { retry_after_ms: u64 },

    #[error("provider overloaded: {0}")]
    Overloaded(String),

    #[error("model call timed out after {0} ms")]
    Timeout(u64),

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error("provider error: {0}")]
    Provider(String),
}

impl LlmError {
    /// 限流、过载、超时、网络错误可重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited { .. }
                | LlmError::Overloaded(_)
                | LlmError::Timeout(_)
                | LlmError::Network(_)
        )
    }

    /// 提供方建议的等待时间（仅限流）
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited { retry_after_ms } => Some(Duration::from_millis(*retry_after_ms)),
            _ => None,
        }
    }

    /// 按错误文本归类（各 SDK 的错误类型差异大，统一用消息内容判断）
    pub fn from_provider_message(msg: &str) -> Self {
        let lower = msg.to_lowercase();
        if lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests") {
            LlmError::RateLimited { retry_after_ms: 0 }
        } else if lower.contains("529")
            || lower.contains("503")
            || lower.contains("overloaded")
            || lower.contains("unavailable")
        {
            LlmError::Overloaded(msg.to_string())
        } else if lower.contains("401")
            || lower.contains("403")
            || lower.contains("api key")
            || lower.contains("unauthorized")
            || lower.contains("authentication")
        {
            LlmError::InvalidCredentials(msg.to_string())
        } else if lower.contains("400") || lower.contains("invalid_request") || lower.contains("bad request") {
            LlmError::BadRequest(msg.to_string())
        } else if lower.contains("timed out") || lower.contains("timeout") {
            LlmError::Timeout(0)
        } else if lower.contains("connection")
            || lower.contains("dns")
            || lower.contains("reset by peer")
            || lower.contains("broken pipe")
        {
            LlmError::Network(msg.to_string())
        } else {
            LlmError::Provider(msg.to_string())
        }
    }
}

/// 单次模型调用参数（来自 AgentConfig.model）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> u32 {
    1024
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            model: "mock".to_string(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// 提供方的原始输出：文本 + 可选的结构化 Tool Call + token 用量
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LlmOutput {
    pub content: String,
    pub tool_call: Option<ToolCall>,
    pub usage: TokenUsage,
}

impl LlmOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }
}

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// LLM 客户端 trait：非流式完成与流式完成（返回 Token 流）
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 提供方名称（日志用）
    fn name(&self) -> &str;

    /// 非流式完成
    async fn complete(&self, messages: &[Message], params: &ModelParams) -> Result<LlmOutput, LlmError>;

    /// 流式完成，返回 Token 流；默认把非流式结果作为单个分片返回
    async fn complete_stream(
        &self,
        messages: &[Message],
        params: &ModelParams,
    ) -> Result<TokenStream, LlmError> {
        let output = self.complete(messages, params).await?;
        Ok(Box::pin(stream::iter(vec![Ok(output.content)])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_provider_messages() {
        assert!(matches!(
            LlmError::from_provider_message("HTTP 429 Too Many Requests"),
            LlmError::RateLimited { .. }
        ));
        assert!(matches!(
            LlmError::from_provider_message("server overloaded"),
            LlmError::Overloaded(_)
        ));
        assert!(matches!(
            LlmError::from_provider_message("401 Unauthorized: invalid api key"),
            LlmError::InvalidCredentials(_)
        ));
        assert!(matches!(
            LlmError::from_provider_message("400 invalid_request_error"),
            LlmError::BadRequest(_)
        ));
        assert!(matches!(
            LlmError::from_provider_message("connection refused"),
            LlmError::Network(_)
        ));
    }

    #[test]
    fn test_retryable_split() {
        assert!(LlmError::Timeout(100).is_retryable());
        assert!(LlmError::Network("x".into()).is_retryable());
        assert!(!LlmError::InvalidCredentials("x".into()).is_retryable());
        assert!(!LlmError::BadRequest("x".into()).is_retryable());
        assert!(!LlmError::Provider("x".into()).is_retryable());
    }

    #[test]
    fn test_retry_after() {
        let err = LlmError::RateLimited { retry_after_ms: 1500 };
        assert_eq!(err.retry_after(), Some(Duration::from_millis(1500)));
        assert_eq!(LlmError::Overloaded("x".into()).retry_after(), None);
    }
}
