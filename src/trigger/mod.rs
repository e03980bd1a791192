//! 触发适配层：把入站事件、手动调用、webhook 与定时任务转换为 Execution
//!
//! 入站事件 `{event_type, payload, agent_bindings}` 与每个候选 Agent 的事件模式（glob）匹配，
//! 每个命中的 Agent 创建一个 Execution。`agent_bindings` 为空时候选为全部已注册 Agent。

pub mod schedule;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::agent::AgentConfig;
use crate::core::{AgentError, Engine, ExecutionId, TriggerSource};

pub use schedule::{CronTriggers, ScheduleError};

/// 入站事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
    /// 限定候选 Agent；为空表示全部
    #[serde(default)]
    pub agent_bindings: Vec<String>,
}

impl InboundEvent {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            agent_bindings: Vec::new(),
        }
    }

    pub fn bound_to<I, S>(mut self, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.agent_bindings = agents.into_iter().map(Into::into).collect();
        self
    }

    /// 交给 Agent 的输入
    fn as_input(&self) -> Value {
        json!({
            "event_type": self.event_type,
            "payload": self.payload,
        })
    }
}

/// 触发适配器
#[derive(Clone)]
pub struct TriggerAdapter {
    engine: Engine,
}

impl TriggerAdapter {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// 事件命中的 Agent（按 id 排序）
    pub fn matching_agents(&self, event: &InboundEvent) -> Vec<Arc<AgentConfig>> {
        let candidates = if event.agent_bindings.is_empty() {
            self.engine.agents().all()
        } else {
            event
                .agent_bindings
                .iter()
                .filter_map(|id| {
                    let agent = self.engine.agents().get(id);
                    if agent.is_none() {
                        tracing::warn!(agent_id = %id, event_type = %event.event_type, "event bound to unknown agent");
                    }
                    agent
                })
                .collect()
        };
        let mut matched: Vec<_> = candidates
            .into_iter()
            .filter(|agent| agent.triggers.matches_event(&event.event_type))
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        matched.dedup_by(|a, b| a.id == b.id);
        matched
    }

    /// 为每个命中的 Agent 创建一个 Execution
    pub async fn dispatch_event(&self, event: &InboundEvent) -> Result<Vec<ExecutionId>, AgentError> {
        let agents = self.matching_agents(event);
        if agents.is_empty() {
            tracing::debug!(event_type = %event.event_type, "no agent matched event");
            return Ok(Vec::new());
        }

        let mut ids = Vec::with_capacity(agents.len());
        for agent in agents {
            let id = self
                .engine
                .submit(
                    &agent.id,
                    event.as_input(),
                    TriggerSource::Event {
                        event_type: event.event_type.clone(),
                    },
                )
                .await?;
            ids.push(id);
        }
        tracing::info!(event_type = %event.event_type, executions = ids.len(), "event dispatched");
        Ok(ids)
    }

    /// 手动触发；Agent 关闭了 manual 时拒绝
    pub async fn manual(&self, agent_id: &str, input: Value) -> Result<ExecutionId, AgentError> {
        let agent = self.engine.agent(agent_id)?;
        if !agent.triggers.manual {
            return Err(AgentError::Validation(format!(
                "agent {agent_id} does not accept manual triggers"
            )));
        }
        self.engine.submit(agent_id, input, TriggerSource::Manual).await
    }

    /// webhook 触发；需要 Agent 显式开启
    pub async fn webhook(&self, agent_id: &str, payload: Value) -> Result<ExecutionId, AgentError> {
        let agent = self.engine.agent(agent_id)?;
        if !agent.triggers.webhook {
            return Err(AgentError::Validation(format!(
                "agent {agent_id} does not accept webhook triggers"
            )));
        }
        self.engine.submit(agent_id, payload, TriggerSource::Webhook).await
    }
}
