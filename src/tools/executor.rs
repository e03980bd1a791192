//! 工具分发器
//!
//! invoke(tool_name, args, ctx)：查找 → 参数校验 → 风险分级（达到阈值返回 ApprovalRequired）→
//! 在独立任务中带超时执行。超时、返回错误、panic 都转为错误 Observation，不会中断 ReAct 循环；
//! 每次实际执行输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::core::{AgentError, Observation, ObservationKind};
use crate::tools::{DefaultRiskClassifier, RiskAssessment, RiskClassifier, RiskPolicy, ToolRegistry};

/// 调用时的执行上下文
#[derive(Debug, Clone, Copy)]
pub struct DispatchContext<'a> {
    pub execution_id: &'a str,
    pub agent_id: &'a str,
    pub step: u32,
    pub risk_policy: &'a RiskPolicy,
    /// 已获人工批准：跳过风险检查
    pub approved: bool,
}

/// 分发结果
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Observation(Observation),
    ApprovalRequired(RiskAssessment),
}

/// 工具分发器：对每次调用施加校验、风险检查与超时
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    classifier: Arc<dyn RiskClassifier>,
    default_timeout: Duration,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, default_timeout: Duration) -> Self {
        Self {
            registry,
            classifier: Arc::new(DefaultRiskClassifier),
            default_timeout,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn RiskClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    /// 对已注册工具做风险评估
    pub fn assess(&self, name: &str, args: &Value, policy: &RiskPolicy) -> Option<RiskAssessment> {
        let tool = self.registry.get(name)?;
        Some(self.classifier.classify(tool.as_ref(), args, policy))
    }

    pub async fn invoke(&self, name: &str, args: Value, ctx: DispatchContext<'_>) -> DispatchOutcome {
        let Some(tool) = self.registry.get(name) else {
            return DispatchOutcome::Observation(Observation::error(
                ObservationKind::Rejected,
                format!("unknown tool: {name}"),
            ));
        };

        if let Err(e) = tool.validate(&args) {
            tracing::debug!(execution_id = %ctx.execution_id, tool = %name, error = %e, "tool arguments rejected");
            return DispatchOutcome::Observation(absorb(AgentError::Validation(format!(
                "invalid arguments for {name}: {e}"
            ))));
        }

        if !ctx.approved {
            let assessment = self.classifier.classify(tool.as_ref(), &args, ctx.risk_policy);
            if ctx.risk_policy.requires_approval(name, &assessment) {
                tracing::info!(
                    execution_id = %ctx.execution_id,
                    tool = %name,
                    level = ?assessment.level,
                    "tool call requires approval"
                );
                return DispatchOutcome::ApprovalRequired(assessment);
            }
        }

        let start = Instant::now();
        let args_preview = args_preview(&args);
        let limit = tool.timeout().unwrap_or(self.default_timeout);
        let mut handle = tokio::spawn(async move { tool.execute(args).await });

        let (observation, outcome) = match timeout(limit, &mut handle).await {
            Ok(Ok(Ok(content))) => (Observation::success(content), "ok"),
            Ok(Ok(Err(e))) => (absorb(AgentError::ToolExecution(e)), "error"),
            Ok(Err(join_err)) => {
                let detail = if join_err.is_panic() { "tool panicked" } else { "tool task aborted" };
                (absorb(AgentError::ToolExecution(detail.to_string())), "panic")
            }
            Err(_) => {
                handle.abort();
                (
                    Observation::error(
                        ObservationKind::Timeout,
                        format!("tool {name} timed out after {} ms", limit.as_millis()),
                    ),
                    "timeout",
                )
            }
        };

        let audit = serde_json::json!({
            "event": "tool_audit",
            "execution_id": ctx.execution_id,
            "agent_id": ctx.agent_id,
            "step": ctx.step,
            "tool": name,
            "approved": ctx.approved,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        DispatchOutcome::Observation(observation)
    }
}

fn absorb(err: AgentError) -> Observation {
    Observation::from_error(&err).unwrap_or_else(|| Observation::error(ObservationKind::ToolError, err.to_string()))
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{EchoTool, Tool, ToolCategory};
    use async_trait::async_trait;
    use serde_json::json;

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "sleeps"
        }
        fn timeout(&self) -> Option<Duration> {
            Some(Duration::from_millis(20))
        }
        async fn execute(&self, _args: Value) -> Result<String, String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".into())
        }
    }

    struct PanicTool;

    #[async_trait]
    impl Tool for PanicTool {
        fn name(&self) -> &str {
            "boom"
        }
        fn description(&self) -> &str {
            "panics"
        }
        async fn execute(&self, _args: Value) -> Result<String, String> {
            panic!("kaboom");
        }
    }

    struct Payment;

    #[async_trait]
    impl Tool for Payment {
        fn name(&self) -> &str {
            "pay"
        }
        fn description(&self) -> &str {
            "sends money"
        }
        fn category(&self) -> ToolCategory {
            ToolCategory::External
        }
        async fn execute(&self, _args: Value) -> Result<String, String> {
            Ok("paid".into())
        }
    }

    fn dispatcher() -> ToolDispatcher {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(SlowTool);
        registry.register(PanicTool);
        registry.register(Payment);
        ToolDispatcher::new(Arc::new(registry), Duration::from_secs(1))
    }

    fn ctx(policy: &RiskPolicy, approved: bool) -> DispatchContext<'_> {
        DispatchContext {
            execution_id: "exec_test",
            agent_id: "agent",
            step: 0,
            risk_policy: policy,
            approved,
        }
    }

    fn observation(outcome: DispatchOutcome) -> Observation {
        match outcome {
            DispatchOutcome::Observation(o) => o,
            other => panic!("expected observation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_success_and_validation() {
        let d = dispatcher();
        let policy = RiskPolicy::default();
        let ok = observation(d.invoke("echo", json!({"text": "hi"}), ctx(&policy, false)).await);
        assert_eq!(ok, Observation::success("hi"));
        let bad = observation(d.invoke("echo", json!({"text": 5}), ctx(&policy, false)).await);
        assert_eq!(bad.kind, ObservationKind::ValidationError);
    }

    #[tokio::test]
    async fn test_unknown_tool_rejected() {
        let d = dispatcher();
        let policy = RiskPolicy::default();
        let obs = observation(d.invoke("nope", json!({}), ctx(&policy, false)).await);
        assert_eq!(obs.kind, ObservationKind::Rejected);
    }

    #[tokio::test]
    async fn test_timeout_and_panic_become_observations() {
        let d = dispatcher();
        let policy = RiskPolicy::default();
        let slow = observation(d.invoke("slow", json!({}), ctx(&policy, false)).await);
        assert_eq!(slow.kind, ObservationKind::Timeout);
        let boom = observation(d.invoke("boom", json!({}), ctx(&policy, false)).await);
        assert_eq!(boom.kind, ObservationKind::ToolError);
        assert!(boom.content.contains("panicked"));
    }

    #[tokio::test]
    async fn test_high_risk_requires_approval_unless_approved() {
        let d = dispatcher();
        let policy = RiskPolicy::default();
        let outcome = d.invoke("pay", json!({}), ctx(&policy, false)).await;
        assert!(matches!(outcome, DispatchOutcome::ApprovalRequired(_)));
        let approved = observation(d.invoke("pay", json!({}), ctx(&policy, true)).await);
        assert_eq!(approved.content, "paid");
    }
}
