//! Execution 生命周期事件
//!
//! Execution 到达终态时发出 `agent.execution.completed|failed|cancelled`。
//! 进程内用 broadcast 通道分发（HTTP / 日志订阅），可选 WebhookEventSink 把事件 POST 到外部地址。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::core::{Execution, ExecutionStatus, FailureReason};

pub const TOPIC_COMPLETED: &str = "agent.execution.completed";
pub const TOPIC_FAILED: &str = "agent.execution.failed";
pub const TOPIC_CANCELLED: &str = "agent.execution.cancelled";

/// 终态事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    pub topic: String,
    pub execution_id: String,
    pub agent_id: String,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_detail: Option<String>,
    pub emitted_at: DateTime<Utc>,
}

impl ExecutionEvent {
    /// 非终态返回 None
    pub fn from_execution(execution: &Execution) -> Option<Self> {
        let topic = match execution.status {
            ExecutionStatus::Completed => TOPIC_COMPLETED,
            ExecutionStatus::Failed => TOPIC_FAILED,
            ExecutionStatus::Cancelled => TOPIC_CANCELLED,
            _ => return None,
        };
        Some(Self {
            topic: topic.to_string(),
            execution_id: execution.id.clone(),
            agent_id: execution.agent_id.clone(),
            status: execution.status,
            output: execution.output.clone(),
            failure_reason: execution.failure,
            failure_detail: execution.failure_detail.clone(),
            emitted_at: Utc::now(),
        })
    }
}

/// 事件出口
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &ExecutionEvent);
}

/// 进程内广播总线；没有订阅者时事件被丢弃
#[derive(Clone)]
pub struct BroadcastEventBus {
    tx: broadcast::Sender<ExecutionEvent>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventSink for BroadcastEventBus {
    async fn publish(&self, event: &ExecutionEvent) {
        let _ = self.tx.send(event.clone());
    }
}

/// 把事件以 JSON POST 到固定地址；失败只记录日志
pub struct WebhookEventSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookEventSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl EventSink for WebhookEventSink {
    async fn publish(&self, event: &ExecutionEvent) {
        match self.client.post(&self.url).json(event).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => tracing::warn!(
                url = %self.url,
                status = resp.status().as_u16(),
                execution_id = %event.execution_id,
                "event webhook rejected"
            ),
            Err(e) => tracing::warn!(url = %self.url, error = %e, "event webhook failed"),
        }
    }
}

/// 依次发送到多个出口
#[derive(Default)]
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl EventSink for FanoutEventSink {
    async fn publish(&self, event: &ExecutionEvent) {
        tracing::info!(
            topic = %event.topic,
            execution_id = %event.execution_id,
            agent_id = %event.agent_id,
            "execution event"
        );
        for sink in &self.sinks {
            sink.publish(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TriggerSource;
    use serde_json::json;

    #[test]
    fn test_event_only_for_terminal() {
        let mut exec = Execution::new("a", json!("x"), TriggerSource::Manual);
        assert!(ExecutionEvent::from_execution(&exec).is_none());
        exec.transition(ExecutionStatus::Running).unwrap();
        exec.fail(FailureReason::Timeout, "too slow").unwrap();
        let event = ExecutionEvent::from_execution(&exec).unwrap();
        assert_eq!(event.topic, TOPIC_FAILED);
        assert_eq!(event.failure_reason, Some(FailureReason::Timeout));
    }

    #[test]
    fn test_payload_shape() {
        let mut exec = Execution::new("a", json!("x"), TriggerSource::Manual);
        exec.transition(ExecutionStatus::Running).unwrap();
        exec.complete("done").unwrap();
        let value = serde_json::to_value(ExecutionEvent::from_execution(&exec).unwrap()).unwrap();
        assert_eq!(value["topic"], TOPIC_COMPLETED);
        assert_eq!(value["executionId"], json!(exec.id));
        assert_eq!(value["agentId"], "a");
        assert_eq!(value["status"], "completed");
        assert_eq!(value["output"], "done");
        assert!(value.get("failureReason").is_none());
    }

    #[tokio::test]
    async fn test_broadcast_delivers() {
        let bus = BroadcastEventBus::new(4);
        let mut rx = bus.subscribe();
        let mut exec = Execution::new("a", json!("x"), TriggerSource::Manual);
        exec.cancel().unwrap();
        bus.publish(&ExecutionEvent::from_execution(&exec).unwrap()).await;
        assert_eq!(rx.recv().await.unwrap().topic, TOPIC_CANCELLED);
    }
}
