//! 主控：执行引擎门面
//!
//! 持有 Agent 注册表、存储、Step Controller、worker 池与取消登记。对外提供 Execution API
//! （execute / execution / cancel）与 Approval API（approvals / approve / deny），以及启动恢复。
//! 每个 Execution 一个 tokio 任务，先取得 worker 许可再驱动；审批决议后重新派发新的 worker。

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentConfig, AgentRegistry};
use crate::approval::{ApprovalDecision, ApprovalGate, ApprovalStatus, PendingApproval};
use crate::config::AppConfig;
use crate::core::{
    AgentError, Execution, ExecutionId, ExecutionResult, ExecutionStatus, ExecutionSupervisor, TaskScheduler,
    TriggerSource,
};
use crate::events::{BroadcastEventBus, EventSink, ExecutionEvent};
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::memory::MemoryManager;
use crate::react::StepController;
use crate::store::{ExecutionFilter, Store};
use crate::usage::{UsageMeter, UsageRecord};

/// 取消时 CAS 冲突的最大重试次数
const CANCEL_ATTEMPTS: usize = 4;

/// 根据配置创建 LLM 客户端：provider 为 mock 或没有 API Key 时使用 Mock
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    if provider == "mock" {
        tracing::info!("Using Mock LLM");
        return Arc::new(MockLlmClient);
    }
    let key_var = cfg.llm.api_key_var();
    let Ok(api_key) = std::env::var(&key_var) else {
        tracing::warn!(provider = %provider, key_var = %key_var, "no API key set, using Mock LLM");
        return Arc::new(MockLlmClient);
    };
    match (provider.as_str(), cfg.llm.base_url.as_deref()) {
        ("deepseek", None) => {
            tracing::info!("Using DeepSeek LLM");
            Arc::new(OpenAiClient::deepseek(Some(&api_key)))
        }
        (_, base) => {
            tracing::info!(provider = %provider, base_url = ?base, "Using OpenAI-compatible LLM");
            Arc::new(OpenAiClient::new(base, Some(&api_key)))
        }
    }
}

pub(crate) struct EngineInner {
    pub agents: AgentRegistry,
    pub store: Arc<dyn Store>,
    pub controller: StepController,
    pub approvals: Arc<ApprovalGate>,
    pub memory: Arc<MemoryManager>,
    pub meter: Arc<UsageMeter>,
    pub scheduler: TaskScheduler,
    pub supervisor: ExecutionSupervisor,
    pub bus: BroadcastEventBus,
    pub events: Arc<dyn EventSink>,
    pub shutdown: CancellationToken,
    pub stale_approval_age: Duration,
}

/// 执行引擎（可廉价克隆，所有克隆共享同一状态）
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub(crate) fn from_parts(inner: EngineInner) -> Self {
        Self { inner: Arc::new(inner) }
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.inner.agents
    }

    pub fn agent(&self, agent_id: &str) -> Result<Arc<AgentConfig>, AgentError> {
        self.inner
            .agents
            .get(agent_id)
            .ok_or_else(|| AgentError::NotFound(format!("agent {agent_id}")))
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn meter(&self) -> &Arc<UsageMeter> {
        &self.inner.meter
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.inner.memory
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.inner.scheduler
    }

    /// 订阅终态事件
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.inner.bus.subscribe()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// 手动触发：创建 Execution 并派发 worker，返回 Execution id
    pub async fn execute(&self, agent_id: &str, input: Value) -> Result<ExecutionId, AgentError> {
        self.submit(agent_id, input, TriggerSource::Manual).await
    }

    /// 以指定触发来源创建 Execution
    pub async fn submit(&self, agent_id: &str, input: Value, trigger: TriggerSource) -> Result<ExecutionId, AgentError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(AgentError::Config("engine is shutting down".into()));
        }
        let agent = self.agent(agent_id)?;
        let execution = Execution::new(&agent.id, input, trigger);
        self.inner.store.create_execution(&execution).await?;
        tracing::info!(
            execution_id = %execution.id,
            agent_id = %agent.id,
            trigger = ?execution.trigger,
            "execution queued"
        );
        self.spawn_worker(agent, execution.id.clone());
        Ok(execution.id)
    }

    /// 派发 worker：等待许可后认领并驱动
    fn spawn_worker(&self, agent: Arc<AgentConfig>, execution_id: ExecutionId) {
        let engine = self.clone();
        tokio::spawn(async move {
            let permit = match engine.inner.scheduler.acquire_worker().await {
                Ok(permit) => permit,
                Err(e) => {
                    tracing::warn!(execution_id = %execution_id, error = %e, "worker not started");
                    return;
                }
            };
            // 关闭期间不再认领，保持 queued 由下次启动恢复
            if engine.inner.shutdown.is_cancelled() {
                return;
            }
            let token = engine.inner.supervisor.register(&execution_id);
            let result = engine.inner.controller.drive(&agent, &execution_id, &token).await;
            engine.inner.supervisor.finish(&execution_id);
            drop(permit);

            match result {
                Ok(result) => tracing::debug!(
                    execution_id = %execution_id,
                    status = %result.status(),
                    "worker exited"
                ),
                Err(e) => tracing::error!(execution_id = %execution_id, error = %e, "worker failed"),
            }
        });
    }

    /// Execution 及其 Step 日志
    pub async fn execution(&self, execution_id: &str) -> Result<ExecutionResult, AgentError> {
        let execution = self
            .inner
            .store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| AgentError::NotFound(format!("execution {execution_id}")))?;
        let steps = self.inner.store.list_steps(execution_id).await?;
        Ok(ExecutionResult { execution, steps })
    }

    pub async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>, AgentError> {
        Ok(self.inner.store.list_executions(filter).await?)
    }

    /// 取消 Execution；终态时原样返回
    ///
    /// queued / awaiting_approval 直接 CAS 到 cancelled（后者先以 system 身份拒绝待审批记录）；
    /// running 只设置取消标记并通知本进程的 worker，由 worker 在下一轮开始前转为 cancelled。
    pub async fn cancel(&self, execution_id: &str) -> Result<Execution, AgentError> {
        for _ in 0..CANCEL_ATTEMPTS {
            let execution = self.execution(execution_id).await?.execution;
            let expected = execution.status;
            match expected {
                status if status.is_terminal() => return Ok(execution),
                ExecutionStatus::Running => {
                    self.inner.store.request_cancel(execution_id).await?;
                    let signalled = self.inner.supervisor.cancel(execution_id);
                    tracing::info!(execution_id, signalled, "cancel requested");
                    return Ok(self.execution(execution_id).await?.execution);
                }
                ExecutionStatus::AwaitingApproval => {
                    for approval in self.inner.store.approvals_for_execution(execution_id).await? {
                        if !approval.is_resolved() {
                            self.inner
                                .approvals
                                .deny_as_system(&approval.id, "execution cancelled")
                                .await?;
                        }
                    }
                }
                _ => {}
            }

            let mut next = execution;
            next.cancel()?;
            if self.inner.store.compare_and_update(expected, &next).await? {
                tracing::info!(execution_id, from = %expected, "execution cancelled");
                self.finish_external(&next).await;
                return Ok(next);
            }
        }
        Err(AgentError::Config(format!(
            "execution {execution_id} kept changing state while cancelling"
        )))
    }

    /// worker 之外到达终态时补写用量记录并发出事件
    async fn finish_external(&self, execution: &Execution) {
        if let Err(e) = self
            .inner
            .store
            .record_usage(&UsageRecord::from_execution(execution))
            .await
        {
            tracing::warn!(execution_id = %execution.id, error = %e, "usage record not written");
        }
        if let Some(event) = ExecutionEvent::from_execution(execution) {
            self.inner.events.publish(&event).await;
        }
    }

    pub async fn approvals(&self, status: Option<ApprovalStatus>) -> Result<Vec<PendingApproval>, AgentError> {
        self.inner.approvals.list(status).await
    }

    pub async fn approval(&self, approval_id: &str) -> Result<PendingApproval, AgentError> {
        self.inner.approvals.get(approval_id).await
    }

    /// 批准：被拦截的调用将跳过风险检查执行一次
    pub async fn approve(
        &self,
        approval_id: &str,
        resolver: &str,
        notes: Option<String>,
    ) -> Result<PendingApproval, AgentError> {
        self.resolve(approval_id, ApprovalDecision::Approve, resolver, notes).await
    }

    /// 拒绝：模型下一轮看到 `tool call denied: <reason>`
    pub async fn deny(&self, approval_id: &str, resolver: &str, reason: &str) -> Result<PendingApproval, AgentError> {
        self.resolve(approval_id, ApprovalDecision::Deny, resolver, Some(reason.to_string()))
            .await
    }

    async fn resolve(
        &self,
        approval_id: &str,
        decision: ApprovalDecision,
        resolver: &str,
        notes: Option<String>,
    ) -> Result<PendingApproval, AgentError> {
        let resolved = self.inner.approvals.resolve(approval_id, decision, resolver, notes).await?;
        if resolved.requeued {
            let agent = self.agent(&resolved.approval.agent_id)?;
            self.spawn_worker(agent, resolved.approval.execution_id.clone());
        }
        Ok(resolved.approval)
    }

    /// 等待超过阈值仍未决议的审批
    pub async fn stale_approvals(&self) -> Result<Vec<PendingApproval>, AgentError> {
        self.inner.approvals.stale(self.inner.stale_approval_age).await
    }

    /// 周期性记录 stale 审批，直到 cancel
    pub fn spawn_stale_watcher(&self, interval: Duration, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => match engine.stale_approvals().await {
                        Ok(stale) => {
                            for approval in stale {
                                tracing::warn!(
                                    approval_id = %approval.id,
                                    execution_id = %approval.execution_id,
                                    tool = %approval.tool_call.name,
                                    requested_at = %approval.requested_at,
                                    "approval pending for too long"
                                );
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "stale approval scan failed"),
                    }
                }
            }
        })
    }

    /// 启动恢复：重新派发 queued 与遗留的 running Execution，返回派发数量
    pub async fn recover(&self) -> Result<usize, AgentError> {
        let mut pending = self
            .inner
            .store
            .list_executions(&ExecutionFilter::by_status(ExecutionStatus::Queued))
            .await?;
        pending.extend(
            self.inner
                .store
                .list_executions(&ExecutionFilter::by_status(ExecutionStatus::Running))
                .await?,
        );

        let mut dispatched = 0;
        for execution in pending {
            if self.inner.supervisor.is_running(&execution.id) {
                continue;
            }
            match self.agent(&execution.agent_id) {
                Ok(agent) => {
                    self.spawn_worker(agent, execution.id);
                    dispatched += 1;
                }
                Err(_) => tracing::warn!(
                    execution_id = %execution.id,
                    agent_id = %execution.agent_id,
                    "agent no longer registered, execution left as is"
                ),
            }
        }
        tracing::info!(dispatched, "recovered executions");
        Ok(dispatched)
    }

    /// 轮询直到 Execution 到达终态或等待审批；超时返回当前快照
    pub async fn wait_until_settled(&self, execution_id: &str, timeout: Duration) -> Result<Execution, AgentError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let execution = self.execution(execution_id).await?.execution;
            let settled = execution.status.is_terminal() || execution.status == ExecutionStatus::AwaitingApproval;
            if settled || tokio::time::Instant::now() >= deadline {
                return Ok(execution);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn reset_quota(&self, agent_id: &str) {
        self.inner.meter.reset(agent_id);
    }
}
