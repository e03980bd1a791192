//! 模型网关：统一的请求/响应接口
//!
//! 每次提供方调用前向 UsageMeter 预留配额，成功后按实际用量结算，失败则归还；
//! 可重试错误（限流、过载、超时、网络）按 RecoveryEngine 的退避策略有限重试，不可恢复错误直接返回。
//! 无法解析的输出在网关内部用纠正提示重新询问（不消耗 Step），次数用尽后返回 Invalid 动作。

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::core::{AgentError, RecoveryAction, RecoveryEngine, StepAction, TokenUsage};
use crate::llm::parser::{parse_model_output, ModelResponse};
use crate::llm::{LlmClient, LlmError, LlmOutput, ModelParams};
use crate::memory::{Message, Summarizer, SummaryOutput, TokenEstimator};
use crate::usage::{UsageCharge, UsageMeter};

/// 默认的解析失败重问次数
pub const DEFAULT_MAX_PARSE_RETRIES: u32 = 2;

const SUMMARY_PROMPT: &str = "Summarize the following agent steps in a few sentences. \
Keep tool names, key results and errors. Reply with plain text only.";

/// 单次网关调用的上下文
#[derive(Debug, Clone)]
pub struct CallContext<'a> {
    pub agent_id: &'a str,
    pub execution_id: &'a str,
    pub params: &'a ModelParams,
    /// 单次提供方调用超时
    pub timeout: Duration,
}

/// 归一化后的模型响应
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub action: StepAction,
    /// 最后一次（被采纳的）原始输出
    pub raw_response: String,
    /// 本次 complete 内所有尝试的累计用量
    pub charge: UsageCharge,
}

pub struct ModelGateway {
    client: Arc<dyn LlmClient>,
    meter: Arc<UsageMeter>,
    recovery: RecoveryEngine,
    max_parse_retries: u32,
    /// 单次调用超时上限，Agent 配置更长时按此截断
    max_call_timeout: Option<Duration>,
}

impl ModelGateway {
    pub fn new(client: Arc<dyn LlmClient>, meter: Arc<UsageMeter>) -> Self {
        Self {
            client,
            meter,
            recovery: RecoveryEngine::default(),
            max_parse_retries: DEFAULT_MAX_PARSE_RETRIES,
            max_call_timeout: None,
        }
    }

    pub fn with_recovery(mut self, recovery: RecoveryEngine) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn with_max_parse_retries(mut self, retries: u32) -> Self {
        self.max_parse_retries = retries;
        self
    }

    pub fn with_max_call_timeout(mut self, limit: Duration) -> Self {
        self.max_call_timeout = Some(limit);
        self
    }

    pub fn provider(&self) -> &str {
        self.client.name()
    }

    pub fn meter(&self) -> &Arc<UsageMeter> {
        &self.meter
    }

    /// 请求模型并归一化为最终回答 / 工具调用
    pub async fn complete(&self, ctx: &CallContext<'_>, messages: Vec<Message>) -> Result<GatewayResponse, AgentError> {
        let mut conversation = messages;
        let mut charge = UsageCharge::default();
        let mut attempt = 0;

        loop {
            let (output, call_charge) = self.call_with_retry(ctx, &conversation).await?;
            charge.add(call_charge);
            let raw = raw_text(&output);

            match parse_model_output(&output) {
                Ok(ModelResponse::FinalAnswer(answer)) => {
                    return Ok(GatewayResponse {
                        action: StepAction::FinalAnswer { answer },
                        raw_response: raw,
                        charge,
                    })
                }
                Ok(ModelResponse::ToolCall(call)) => {
                    return Ok(GatewayResponse {
                        action: StepAction::ToolCall(call),
                        raw_response: raw,
                        charge,
                    })
                }
                Err(reason) if attempt >= self.max_parse_retries => {
                    tracing::warn!(
                        execution_id = %ctx.execution_id,
                        attempts = attempt + 1,
                        reason = %reason,
                        "model output still unparseable, giving up"
                    );
                    return Ok(GatewayResponse {
                        action: StepAction::Invalid { reason },
                        raw_response: raw,
                        charge,
                    });
                }
                Err(reason) => {
                    tracing::debug!(execution_id = %ctx.execution_id, attempt, reason = %reason, "re-asking after unparseable output");
                    let err = AgentError::UnparseableOutput(reason);
                    let prompt = match self.recovery.handle(&err, attempt) {
                        RecoveryAction::RetryWithPrompt(prompt) => prompt,
                        _ => err.to_string(),
                    };
                    conversation.push(Message::assistant(raw));
                    conversation.push(Message::user(prompt));
                    attempt += 1;
                }
            }
        }
    }

    /// 纯文本调用（摘要等），不做协议解析
    pub async fn complete_text(
        &self,
        ctx: &CallContext<'_>,
        messages: &[Message],
    ) -> Result<(String, UsageCharge), AgentError> {
        let (output, charge) = self.call_with_retry(ctx, messages).await?;
        Ok((output.content, charge))
    }

    /// 预留配额 → 超时保护下调用 → 结算；可重试错误按退避重试
    async fn call_with_retry(
        &self,
        ctx: &CallContext<'_>,
        messages: &[Message],
    ) -> Result<(LlmOutput, UsageCharge), AgentError> {
        let prompt_estimate = TokenEstimator::estimate_messages(messages) as u64;
        let max_completion = ctx.params.max_tokens as u64;
        let timeout = match self.max_call_timeout {
            Some(limit) => ctx.timeout.min(limit),
            None => ctx.timeout,
        };
        let mut attempt = 0;

        loop {
            let reservation = self.meter.reserve_call(ctx.agent_id, prompt_estimate, max_completion)?;
            let started = Instant::now();
            let result = match tokio::time::timeout(timeout, self.client.complete(messages, ctx.params)).await {
                Ok(result) => result,
                Err(_) => Err(LlmError::Timeout(timeout.as_millis() as u64)),
            };

            match result {
                Ok(mut output) => {
                    // 不返回用量的提供方按估算计费
                    if output.usage.total() == 0 {
                        output.usage =
                            TokenUsage::new(prompt_estimate, TokenEstimator::estimate(&output.content) as u64);
                    }
                    let charge = self.meter.commit(reservation, output.usage);
                    tracing::debug!(
                        execution_id = %ctx.execution_id,
                        provider = self.client.name(),
                        model = %ctx.params.model,
                        prompt_tokens = output.usage.prompt_tokens,
                        completion_tokens = output.usage.completion_tokens,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "model call completed"
                    );
                    return Ok((output, charge));
                }
                Err(e) => {
                    self.meter.release(reservation);
                    let err = if e.is_retryable() {
                        AgentError::RetryableProvider(e)
                    } else {
                        AgentError::FatalProvider(e)
                    };
                    match self.recovery.handle(&err, attempt) {
                        RecoveryAction::RetryAfter(delay) => {
                            tracing::warn!(
                                execution_id = %ctx.execution_id,
                                attempt = attempt + 1,
                                delay_ms = delay.as_millis() as u64,
                                error = %err,
                                "retrying model call"
                            );
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        _ => {
                            tracing::error!(execution_id = %ctx.execution_id, error = %err, "model call failed");
                            return Err(err);
                        }
                    }
                }
            }
        }
    }
}

/// 结构化工具调用没有文本时，按文本协议重建原始输出，保证历史可读
fn raw_text(output: &LlmOutput) -> String {
    match &output.tool_call {
        Some(call) if output.content.trim().is_empty() => {
            serde_json::json!({ "tool": call.name, "args": call.arguments }).to_string()
        }
        _ => output.content.clone(),
    }
}

/// 以网关实现的早期 Step 摘要器
pub struct GatewaySummarizer<'a> {
    gateway: &'a ModelGateway,
    ctx: CallContext<'a>,
}

impl<'a> GatewaySummarizer<'a> {
    pub fn new(gateway: &'a ModelGateway, ctx: CallContext<'a>) -> Self {
        Self { gateway, ctx }
    }
}

#[async_trait]
impl Summarizer for GatewaySummarizer<'_> {
    async fn summarize(&self, transcript: &str) -> Result<SummaryOutput, AgentError> {
        let messages = [Message::system(SUMMARY_PROMPT), Message::user(transcript)];
        let (text, charge) = self.gateway.complete_text(&self.ctx, &messages).await?;
        Ok(SummaryOutput {
            text: text.trim().to_string(),
            charge,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ToolCall;
    use crate::llm::ScriptedLlmClient;
    use crate::usage::{Pricing, QuotaConfig, QuotaPolicy};
    use serde_json::json;

    fn fast_recovery() -> RecoveryEngine {
        RecoveryEngine::new(3, Duration::from_millis(1), Duration::from_millis(5))
    }

    fn ctx(params: &ModelParams) -> CallContext<'_> {
        CallContext {
            agent_id: "agent",
            execution_id: "exec",
            params,
            timeout: Duration::from_secs(5),
        }
    }

    fn gateway(client: Arc<ScriptedLlmClient>) -> ModelGateway {
        ModelGateway::new(client, Arc::new(UsageMeter::new(Pricing::default()))).with_recovery(fast_recovery())
    }

    #[tokio::test]
    async fn test_parses_tool_call() {
        let client = Arc::new(ScriptedLlmClient::new().reply(r#"{"tool": "echo", "args": {"text": "hi"}}"#));
        let params = ModelParams::default();
        let resp = gateway(client).complete(&ctx(&params), vec![Message::user("x")]).await.unwrap();
        assert_eq!(
            resp.action,
            StepAction::ToolCall(ToolCall {
                name: "echo".into(),
                arguments: json!({"text": "hi"})
            })
        );
        assert_eq!(resp.charge.usage.total(), 15);
    }

    #[tokio::test]
    async fn test_reasks_unparseable_output() {
        let client = Arc::new(
            ScriptedLlmClient::new()
                .reply("{\"tool\": ")
                .reply("{\"unexpected\": 1}")
                .reply(r#"{"final_answer": "done"}"#),
        );
        let params = ModelParams::default();
        let resp = gateway(client.clone())
            .complete(&ctx(&params), vec![Message::user("x")])
            .await
            .unwrap();
        assert_eq!(resp.action, StepAction::FinalAnswer { answer: "done".into() });
        assert_eq!(client.call_count(), 3);
        // 三次尝试的用量全部累计
        assert_eq!(resp.charge.usage.total(), 45);
        let last = client.calls().pop().unwrap();
        assert!(last.last().unwrap().content.contains("JSON"));
    }

    #[tokio::test]
    async fn test_gives_up_with_invalid_action() {
        let client = Arc::new(ScriptedLlmClient::new().then_always("{broken"));
        let params = ModelParams::default();
        let resp = gateway(client.clone())
            .with_max_parse_retries(1)
            .complete(&ctx(&params), vec![Message::user("x")])
            .await
            .unwrap();
        assert!(matches!(resp.action, StepAction::Invalid { .. }));
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let client = Arc::new(
            ScriptedLlmClient::new()
                .fail(LlmError::RateLimited { retry_after_ms: 0 })
                .fail(LlmError::Network("reset".into()))
                .reply(r#"{"final_answer": "ok"}"#),
        );
        let params = ModelParams::default();
        let resp = gateway(client.clone()).complete(&ctx(&params), vec![Message::user("x")]).await.unwrap();
        assert_eq!(resp.action, StepAction::FinalAnswer { answer: "ok".into() });
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_is_provider_unavailable() {
        let client = Arc::new(
            (0..5).fold(ScriptedLlmClient::new(), |c, _| c.fail(LlmError::Overloaded("busy".into()))),
        );
        let params = ModelParams::default();
        let err = gateway(client.clone())
            .complete(&ctx(&params), vec![Message::user("x")])
            .await
            .unwrap_err();
        assert_eq!(err.failure_reason(), Some(crate::core::FailureReason::ProviderUnavailable));
        assert_eq!(client.call_count(), 4);
    }

    #[tokio::test]
    async fn test_fatal_error_not_retried() {
        let client = Arc::new(ScriptedLlmClient::new().fail(LlmError::InvalidCredentials("bad key".into())));
        let params = ModelParams::default();
        let err = gateway(client.clone())
            .complete(&ctx(&params), vec![Message::user("x")])
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::FatalProvider(_)));
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn test_call_timeout_is_retryable() {
        let client = Arc::new(
            ScriptedLlmClient::new()
                .then_always(r#"{"final_answer": "late"}"#)
                .with_delay(Duration::from_millis(200)),
        );
        let params = ModelParams::default();
        let mut call = ctx(&params);
        call.timeout = Duration::from_millis(20);
        let err = gateway(client.clone()).complete(&call, vec![Message::user("x")]).await.unwrap_err();
        assert!(matches!(err, AgentError::RetryableProvider(LlmError::Timeout(20))));
    }

    #[tokio::test]
    async fn test_hard_quota_blocks_call() {
        let client = Arc::new(ScriptedLlmClient::new().then_always(r#"{"final_answer": "x"}"#));
        let meter = Arc::new(UsageMeter::new(Pricing::default()));
        meter.configure(
            "agent",
            &QuotaConfig {
                limit_tokens: 3,
                policy: QuotaPolicy::HardStop,
            },
        );
        let gw = ModelGateway::new(client.clone(), meter);
        let params = ModelParams::default();
        let err = gw.complete(&ctx(&params), vec![Message::user("x")]).await.unwrap_err();
        assert!(matches!(err, AgentError::QuotaExceeded(_)));
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn test_small_remaining_quota_still_allows_call() {
        let client = Arc::new(ScriptedLlmClient::new().then_always(r#"{"final_answer": "x"}"#));
        let meter = Arc::new(UsageMeter::new(Pricing::default()));
        meter.configure(
            "agent",
            &QuotaConfig {
                limit_tokens: 100,
                policy: QuotaPolicy::HardStop,
            },
        );
        let gw = ModelGateway::new(client.clone(), meter.clone());
        // 补全上限远大于剩余额度
        let params = ModelParams {
            max_tokens: 2048,
            ..ModelParams::default()
        };
        let resp = gw.complete(&ctx(&params), vec![Message::user("x")]).await.unwrap();
        assert_eq!(resp.action, StepAction::FinalAnswer { answer: "x".into() });
        assert_eq!(client.call_count(), 1);
        assert_eq!(meter.counter("agent").unwrap().used(), 15);
    }
}
