//! ReAct 主循环（Step Controller）
//!
//! 组装上下文 -> 调用模型网关 -> 最终回答则结束；工具调用先查允许列表，再交给分发器执行，
//! Observation 写回 Step 日志后进入下一轮。每轮开始前依次检查：取消、步数上限、活跃时长上限。
//! 需要审批的调用持久化后 worker 直接退出；决议后由新 worker 调用 drive 从存储恢复并继续。
//! 可选 progress：向 Web 等前端推送 StepUpdate / ToolCall / Observation / Finished。

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::AgentConfig;
use crate::approval::{ApprovalGate, ApprovalStatus};
use crate::core::{
    AgentError, Execution, ExecutionResult, ExecutionStatus, FailureReason, Observation, ObservationKind,
    Step, StepAction, SuspendedCall, TriggerSource,
};
use crate::events::{EventSink, ExecutionEvent};
use crate::llm::{CallContext, GatewaySummarizer, ModelGateway};
use crate::memory::MemoryManager;
use crate::react::{ProgressEvent, ReactEvent};
use crate::store::Store;
use crate::tools::{DispatchContext, DispatchOutcome, ToolDispatcher};
use crate::usage::{UsageCharge, UsageRecord};

/// Observation 预览最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;

/// 循环退出方式
enum LoopExit {
    /// 已设置终态，待持久化
    Terminal,
    /// 已挂起等待审批（已持久化）
    Suspended,
    /// 状态被并发修改，放弃本 worker
    Lost,
}

/// 单个 worker 持有的运行时状态
struct Run {
    exec: Execution,
    steps: Vec<Step>,
    started: Instant,
    base_elapsed_ms: u64,
}

impl Run {
    /// 只累计本 worker 的运行时间，等待审批的时间不计入
    fn tick(&mut self) {
        self.exec.active_elapsed_ms = self.base_elapsed_ms + self.started.elapsed().as_millis() as u64;
    }

    fn charge(&mut self, charge: UsageCharge) {
        self.exec.usage.add(charge.usage);
        self.exec.cost_usd += charge.cost_usd;
        self.exec.overage_tokens += charge.overage_tokens;
        self.exec.overage_cost_usd += charge.overage_cost_usd;
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() > OBSERVATION_PREVIEW_CHARS {
        format!("{}...", text.chars().take(OBSERVATION_PREVIEW_CHARS).collect::<String>())
    } else {
        text.to_string()
    }
}

pub struct StepController {
    store: Arc<dyn Store>,
    gateway: Arc<ModelGateway>,
    dispatcher: Arc<ToolDispatcher>,
    memory: Arc<MemoryManager>,
    approvals: Arc<ApprovalGate>,
    events: Option<Arc<dyn EventSink>>,
    progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl StepController {
    pub fn new(store: Arc<dyn Store>, gateway: Arc<ModelGateway>, dispatcher: Arc<ToolDispatcher>) -> Self {
        Self {
            memory: Arc::new(MemoryManager::new(store.clone())),
            approvals: Arc::new(ApprovalGate::new(store.clone())),
            store,
            gateway,
            dispatcher,
            events: None,
            progress: None,
        }
    }

    pub fn with_memory(mut self, memory: Arc<MemoryManager>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_events(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    pub fn with_progress(mut self, tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        self.progress = Some(tx);
        self
    }

    pub fn approvals(&self) -> &Arc<ApprovalGate> {
        &self.approvals
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    fn emit(&self, execution_id: &str, event: ReactEvent) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(ProgressEvent {
                execution_id: execution_id.to_string(),
                event,
            });
        }
    }

    /// 创建新的 Execution 并在当前任务内驱动到终态或挂起
    pub async fn run(&self, agent: &AgentConfig, input: Value) -> Result<ExecutionResult, AgentError> {
        let execution = Execution::new(&agent.id, input, TriggerSource::Manual);
        self.store.create_execution(&execution).await?;
        self.drive(agent, &execution.id, &CancellationToken::new()).await
    }

    /// 认领并驱动已存在的 Execution（新建、审批后恢复或崩溃后恢复）
    ///
    /// queued 通过 CAS 认领，只有一个 worker 能成功；其余状态直接返回当前快照。
    pub async fn drive(
        &self,
        agent: &AgentConfig,
        execution_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, AgentError> {
        let Some(mut exec) = self.store.get_execution(execution_id).await? else {
            return Err(AgentError::NotFound(format!("execution {execution_id}")));
        };

        match exec.status {
            ExecutionStatus::Queued => {
                let mut claimed = exec.clone();
                claimed.transition(ExecutionStatus::Running)?;
                if !self.store.compare_and_update(ExecutionStatus::Queued, &claimed).await? {
                    tracing::debug!(execution_id, "execution already claimed");
                    return self.snapshot(execution_id).await;
                }
                exec = claimed;
            }
            ExecutionStatus::Running => {
                tracing::warn!(execution_id, "resuming orphaned running execution");
            }
            _ => return self.snapshot(execution_id).await,
        }

        let steps = self.store.list_steps(execution_id).await?;
        // Step 已写入但 Execution 未更新（进程中断）时以 Step 日志为准
        if let Some(last) = steps.last() {
            exec.step_count = exec.step_count.max(last.index + 1);
        }

        tracing::info!(
            execution_id,
            agent_id = %agent.id,
            step_count = exec.step_count,
            resumed = exec.suspended.is_some(),
            "execution started"
        );

        let mut run = Run {
            base_elapsed_ms: exec.active_elapsed_ms,
            exec,
            steps,
            started: Instant::now(),
        };

        let outcome = self.step_loop(agent, &mut run, cancel).await;
        match outcome {
            Ok(LoopExit::Terminal) => self.finalize(agent, &mut run).await?,
            Ok(LoopExit::Suspended) => {}
            Ok(LoopExit::Lost) => return self.snapshot(execution_id).await,
            Err(AgentError::InvalidTransition { from, to }) => {
                tracing::warn!(execution_id, %from, %to, "execution changed concurrently, worker exiting");
                return self.snapshot(execution_id).await;
            }
            Err(e) if e.is_fatal() => {
                let reason = e.failure_reason().unwrap_or(FailureReason::ProviderError);
                tracing::error!(execution_id, reason = %reason, error = %e, "execution failed");
                run.exec.fail(reason, e.to_string())?;
                self.finalize(agent, &mut run).await?;
            }
            Err(e) => return Err(e),
        }

        Ok(ExecutionResult {
            execution: run.exec,
            steps: run.steps,
        })
    }

    async fn snapshot(&self, execution_id: &str) -> Result<ExecutionResult, AgentError> {
        let execution = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| AgentError::NotFound(format!("execution {execution_id}")))?;
        let steps = self.store.list_steps(execution_id).await?;
        Ok(ExecutionResult { execution, steps })
    }

    async fn cancel_requested(&self, execution_id: &str) -> Result<bool, AgentError> {
        Ok(self
            .store
            .get_execution(execution_id)
            .await?
            .map(|e| e.cancel_requested)
            .unwrap_or(false))
    }

    async fn step_loop(
        &self,
        agent: &AgentConfig,
        run: &mut Run,
        cancel: &CancellationToken,
    ) -> Result<LoopExit, AgentError> {
        if let Some(suspended) = run.exec.suspended.clone() {
            if let Some(exit) = self.resume_suspended(agent, run, suspended).await? {
                return Ok(exit);
            }
        }

        let execution_id = run.exec.id.clone();
        let params = agent.model.params();
        let tool_schema = self.dispatcher.registry().schema_json_for(&agent.allowed_tools);
        let timeout_ms = agent.limits.execution_timeout().as_millis() as u64;
        let max_steps = agent.limits.max_steps;

        loop {
            run.tick();
            if cancel.is_cancelled() || self.cancel_requested(&execution_id).await? {
                tracing::info!(execution_id = %execution_id, step_count = run.exec.step_count, "execution cancelled");
                run.exec.cancel()?;
                return Ok(LoopExit::Terminal);
            }
            if run.exec.step_count >= max_steps {
                run.exec.fail(
                    FailureReason::StepBudgetExceeded,
                    format!("reached max_steps ({max_steps}) without a final answer"),
                )?;
                return Ok(LoopExit::Terminal);
            }
            if run.exec.active_elapsed_ms >= timeout_ms {
                run.exec.fail(
                    FailureReason::Timeout,
                    format!("active time exceeded {} s", agent.limits.execution_timeout_secs),
                )?;
                return Ok(LoopExit::Terminal);
            }

            let index = run.exec.step_count;
            self.emit(&execution_id, ReactEvent::StepUpdate { step: index + 1, max_steps });

            let ctx = CallContext {
                agent_id: &agent.id,
                execution_id: &execution_id,
                params: &params,
                timeout: agent.limits.model_call_timeout(),
            };
            let summarizer = GatewaySummarizer::new(&self.gateway, ctx.clone());
            let window = self
                .memory
                .assemble_context(agent, &run.exec, &run.steps, &tool_schema, Some(&summarizer))
                .await?;
            if let Some(summary) = window.summary_update {
                run.exec.context_summary = Some(summary);
                run.charge(window.summary_charge);
            }

            self.emit(&execution_id, ReactEvent::Thinking);
            let response = self.gateway.complete(&ctx, window.messages).await?;
            run.charge(response.charge);
            let tokens = response.charge.usage;
            self.emit(
                &execution_id,
                ReactEvent::TokenUsage {
                    prompt_tokens: tokens.prompt_tokens,
                    completion_tokens: tokens.completion_tokens,
                    cumulative_total: run.exec.usage.total(),
                    cumulative_cost_usd: run.exec.cost_usd,
                },
            );

            match response.action {
                StepAction::FinalAnswer { answer } => {
                    let step = Step::new(
                        &execution_id,
                        index,
                        response.raw_response,
                        StepAction::FinalAnswer { answer: answer.clone() },
                        None,
                        tokens,
                    );
                    if !self.record_step(run, step).await? {
                        return Ok(LoopExit::Lost);
                    }
                    run.exec.complete(answer)?;
                    return Ok(LoopExit::Terminal);
                }
                StepAction::Invalid { reason } => {
                    let observation = Observation::error(
                        ObservationKind::ValidationError,
                        format!("could not parse model output: {reason}"),
                    );
                    let step = Step::new(
                        &execution_id,
                        index,
                        response.raw_response,
                        StepAction::Invalid { reason },
                        Some(observation),
                        tokens,
                    );
                    if !self.record_step(run, step).await? {
                        return Ok(LoopExit::Lost);
                    }
                }
                StepAction::ToolCall(call) => {
                    self.emit(
                        &execution_id,
                        ReactEvent::ToolCall {
                            tool: call.name.clone(),
                            args: call.arguments.clone(),
                        },
                    );

                    let observation = if !agent.allows_tool(&call.name) || !self.dispatcher.is_registered(&call.name) {
                        tracing::warn!(execution_id = %execution_id, step = index, tool = %call.name, "tool call rejected");
                        let allowed = if agent.allowed_tools.is_empty() {
                            "none".to_string()
                        } else {
                            agent.allowed_tools.join(", ")
                        };
                        Observation::error(
                            ObservationKind::Rejected,
                            format!("tool '{}' is not available to this agent (allowed: {allowed})", call.name),
                        )
                    } else {
                        let dispatch = DispatchContext {
                            execution_id: &execution_id,
                            agent_id: &agent.id,
                            step: index,
                            risk_policy: &agent.risk,
                            approved: false,
                        };
                        match self.dispatcher.invoke(&call.name, call.arguments.clone(), dispatch).await {
                            DispatchOutcome::Observation(observation) => observation,
                            DispatchOutcome::ApprovalRequired(risk) => {
                                run.tick();
                                let approval = self
                                    .approvals
                                    .request_approval(&mut run.exec, index, call, response.raw_response, tokens, risk)
                                    .await?;
                                self.emit(
                                    &execution_id,
                                    ReactEvent::ApprovalRequested {
                                        approval_id: approval.id,
                                        tool: approval.tool_call.name,
                                    },
                                );
                                return Ok(LoopExit::Suspended);
                            }
                        }
                    };

                    let step = Step::new(
                        &execution_id,
                        index,
                        response.raw_response,
                        StepAction::ToolCall(call),
                        Some(observation),
                        tokens,
                    );
                    if !self.record_step(run, step).await? {
                        return Ok(LoopExit::Lost);
                    }
                }
            }
        }
    }

    /// 恢复被审批挂起的调用：批准则跳过风险检查执行一次，拒绝则以拒绝说明作为 Observation
    async fn resume_suspended(
        &self,
        agent: &AgentConfig,
        run: &mut Run,
        suspended: SuspendedCall,
    ) -> Result<Option<LoopExit>, AgentError> {
        // 该 Step 已落盘（上次恢复在更新 Execution 前中断）
        if run.steps.iter().any(|s| s.index == suspended.step_index) {
            run.exec.suspended = None;
            return Ok(None);
        }

        let approval = self.approvals.get(&suspended.approval_id).await?;
        let observation = match approval.status {
            ApprovalStatus::Approved => {
                let dispatch = DispatchContext {
                    execution_id: &run.exec.id,
                    agent_id: &agent.id,
                    step: suspended.step_index,
                    risk_policy: &agent.risk,
                    approved: true,
                };
                match self
                    .dispatcher
                    .invoke(&suspended.call.name, suspended.call.arguments.clone(), dispatch)
                    .await
                {
                    DispatchOutcome::Observation(observation) => observation,
                    DispatchOutcome::ApprovalRequired(_) => {
                        Observation::error(ObservationKind::ToolError, "approved call was gated again")
                    }
                }
            }
            ApprovalStatus::Denied => Observation::denied(approval.notes.as_deref().unwrap_or("no reason given")),
            ApprovalStatus::Pending => {
                tracing::warn!(
                    execution_id = %run.exec.id,
                    approval_id = %approval.id,
                    "approval still pending, suspending again"
                );
                let mut next = run.exec.clone();
                next.transition(ExecutionStatus::AwaitingApproval)?;
                if !self.store.compare_and_update(ExecutionStatus::Running, &next).await? {
                    return Ok(Some(LoopExit::Lost));
                }
                run.exec = next;
                return Ok(Some(LoopExit::Suspended));
            }
        };

        tracing::info!(
            execution_id = %run.exec.id,
            approval_id = %approval.id,
            decision = approval.status.as_str(),
            tool = %suspended.call.name,
            "resuming suspended tool call"
        );
        let step = Step::new(
            run.exec.id.clone(),
            suspended.step_index,
            suspended.raw_response,
            StepAction::ToolCall(suspended.call),
            Some(observation),
            suspended.tokens,
        );
        run.exec.suspended = None;
        if !self.record_step(run, step).await? {
            return Ok(Some(LoopExit::Lost));
        }
        Ok(None)
    }

    /// 追加 Step 并持久化 Execution；返回 false 表示 Execution 已不在 running
    async fn record_step(&self, run: &mut Run, step: Step) -> Result<bool, AgentError> {
        self.memory.write_back(&step).await?;
        if let (StepAction::ToolCall(call), Some(observation)) = (&step.action, &step.observation) {
            self.emit(
                &step.execution_id,
                ReactEvent::Observation {
                    tool: call.name.clone(),
                    kind: format!("{:?}", observation.kind),
                    preview: preview(&observation.content),
                },
            );
        }
        tracing::debug!(
            execution_id = %step.execution_id,
            step = step.index,
            action = step.action.kind(),
            "step recorded"
        );
        run.exec.step_count = step.index + 1;
        run.steps.push(step);
        run.tick();
        Ok(self
            .store
            .compare_and_update(ExecutionStatus::Running, &run.exec)
            .await?)
    }

    /// 持久化终态，写入记忆与用量记录并发出生命周期事件
    async fn finalize(&self, agent: &AgentConfig, run: &mut Run) -> Result<(), AgentError> {
        run.tick();
        if !self
            .store
            .compare_and_update(ExecutionStatus::Running, &run.exec)
            .await?
        {
            tracing::warn!(execution_id = %run.exec.id, "execution changed concurrently, terminal state not written");
            return Ok(());
        }
        let exec = &run.exec;

        if exec.status == ExecutionStatus::Completed {
            if let Err(e) = self.memory.on_completed(agent, exec, &run.steps).await {
                tracing::warn!(execution_id = %exec.id, error = %e, "memory write-back failed");
            }
        }
        if let Err(e) = self.store.record_usage(&UsageRecord::from_execution(exec)).await {
            tracing::warn!(execution_id = %exec.id, error = %e, "usage record not written");
        }

        tracing::info!(
            execution_id = %exec.id,
            agent_id = %exec.agent_id,
            status = %exec.status,
            steps = exec.step_count,
            total_tokens = exec.usage.total(),
            cost_usd = exec.cost_usd,
            active_ms = exec.active_elapsed_ms,
            "execution finished"
        );
        self.emit(
            &exec.id,
            ReactEvent::Finished {
                status: exec.status.to_string(),
            },
        );
        if let (Some(events), Some(event)) = (&self.events, ExecutionEvent::from_execution(exec)) {
            events.publish(&event).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;
    use crate::store::{ExecutionStore, InMemoryStore, UsageStore};
    use crate::tools::{EchoTool, ToolRegistry};
    use crate::usage::{Pricing, UsageMeter};
    use serde_json::json;
    use std::time::Duration;

    fn controller(client: ScriptedLlmClient) -> (StepController, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let gateway = Arc::new(ModelGateway::new(
            Arc::new(client),
            Arc::new(UsageMeter::new(Pricing::default())),
        ));
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let dispatcher = Arc::new(ToolDispatcher::new(Arc::new(registry), Duration::from_secs(5)));
        (StepController::new(store.clone(), gateway, dispatcher), store)
    }

    fn agent() -> AgentConfig {
        AgentConfig::new("helper", "You help.").with_tools(["echo"])
    }

    #[tokio::test]
    async fn test_tool_then_final_answer() {
        let client = ScriptedLlmClient::new()
            .reply(r#"{"tool": "echo", "args": {"text": "ping"}}"#)
            .reply(r#"{"final_answer": "pong"}"#);
        let (controller, store) = controller(client);
        let result = controller.run(&agent(), json!("say ping")).await.unwrap();

        assert_eq!(result.status(), ExecutionStatus::Completed);
        assert_eq!(result.execution.output.as_deref(), Some("pong"));
        assert_eq!(result.execution.step_count, 2);
        assert_eq!(result.steps[0].observation.as_ref().unwrap().content, "ping");
        assert_eq!(result.execution.usage.total(), 30);

        let stored = store.get_execution(&result.execution.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);
        assert_eq!(store.list_usage("helper").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_disallowed_tool_is_rejected_not_executed() {
        let client = ScriptedLlmClient::new()
            .reply(r#"{"tool": "shell", "args": {"cmd": "rm -rf /"}}"#)
            .reply(r#"{"final_answer": "ok"}"#);
        let (controller, _) = controller(client);
        let result = controller.run(&agent(), json!("x")).await.unwrap();
        let obs = result.steps[0].observation.as_ref().unwrap();
        assert_eq!(obs.kind, ObservationKind::Rejected);
        assert!(obs.content.contains("shell"));
        assert_eq!(result.status(), ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_step_budget() {
        let client = ScriptedLlmClient::new().then_always(r#"{"tool": "echo", "args": {"text": "again"}}"#);
        let (controller, _) = controller(client);
        let result = controller.run(&agent().with_max_steps(2), json!("loop")).await.unwrap();
        assert_eq!(result.status(), ExecutionStatus::Failed);
        assert_eq!(result.execution.failure, Some(FailureReason::StepBudgetExceeded));
        assert_eq!(result.steps.len(), 2);
        assert!(result.execution.output.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_before_first_step() {
        let client = ScriptedLlmClient::new().then_always(r#"{"final_answer": "x"}"#);
        let (controller, store) = controller(client);
        let exec = Execution::new("helper", json!("x"), TriggerSource::Manual);
        store.create_execution(&exec).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = controller.drive(&agent(), &exec.id, &cancel).await.unwrap();
        assert_eq!(result.status(), ExecutionStatus::Cancelled);
        assert!(result.steps.is_empty());
    }

    #[tokio::test]
    async fn test_progress_events() {
        let client = ScriptedLlmClient::new().reply(r#"{"final_answer": "done"}"#);
        let (controller, _) = controller(client);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let controller = controller.with_progress(tx);
        controller.run(&agent(), json!("x")).await.unwrap();
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev.event);
        }
        assert_eq!(events.first(), Some(&ReactEvent::StepUpdate { step: 1, max_steps: 10 }));
        assert_eq!(
            events.last(),
            Some(&ReactEvent::Finished {
                status: "completed".into()
            })
        );
    }
}
