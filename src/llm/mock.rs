//! Mock LLM 客户端（用于测试，无需 API）
//!
//! - MockLlmClient：首轮把用户输入回显为 echo Tool Call，看到 Observation 后给出最终回答，便于本地跑通 ReAct 流程
//! - ScriptedLlmClient：按脚本依次返回预设响应或错误，并记录每次收到的消息，供场景测试断言

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::TokenUsage;
use crate::llm::{LlmClient, LlmError, LlmOutput, ModelParams};
use crate::memory::{Message, Role};

/// Mock 客户端：回显用户最后一条消息
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, messages: &[Message], _params: &ModelParams) -> Result<LlmOutput, LlmError> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        let content = if last_user.starts_with("Observation") {
            serde_json::json!({ "final_answer": last_user }).to_string()
        } else {
            serde_json::json!({
                "tool": "echo",
                "args": { "text": format!("Echo from Mock: {}", last_user) }
            })
            .to_string()
        };
        Ok(LlmOutput {
            content,
            tool_call: None,
            usage: TokenUsage::new(estimate(messages), 16),
        })
    }
}

fn estimate(messages: &[Message]) -> u64 {
    messages.iter().map(|m| m.content.len() as u64 / 4 + 1).sum()
}

/// 脚本化客户端：依次弹出预设结果；脚本耗尽后返回 fallback（若有）
pub struct ScriptedLlmClient {
    script: Mutex<VecDeque<Result<LlmOutput, LlmError>>>,
    fallback: Option<LlmOutput>,
    delay: Option<Duration>,
    calls: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlmClient {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: None,
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// 追加一条文本响应（固定 10/5 token 用量）
    pub fn reply(self, content: impl Into<String>) -> Self {
        self.push(Ok(LlmOutput {
            content: content.into(),
            tool_call: None,
            usage: TokenUsage::new(10, 5),
        }))
    }

    pub fn fail(self, err: LlmError) -> Self {
        self.push(Err(err))
    }

    pub fn push(self, item: Result<LlmOutput, LlmError>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(item);
        }
        self
    }

    /// 脚本耗尽后一直返回该文本
    pub fn then_always(mut self, content: impl Into<String>) -> Self {
        self.fallback = Some(LlmOutput {
            content: content.into(),
            tool_call: None,
            usage: TokenUsage::new(10, 5),
        });
        self
    }

    /// 每次调用前等待（用于超时测试）
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// 每次调用收到的完整消息列表
    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl Default for ScriptedLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, messages: &[Message], _params: &ModelParams) -> Result<LlmOutput, LlmError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(messages.to_vec());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match next {
            Some(item) => item,
            None => self
                .fallback
                .clone()
                .ok_or_else(|| LlmError::Provider("script exhausted".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_mock_echo_then_answer() {
        let client = MockLlmClient;
        let params = ModelParams::default();
        let first = client.complete(&[Message::user("hello")], &params).await.unwrap();
        assert!(first.content.contains("\"echo\""));
        let second = client
            .complete(&[Message::user("Observation from echo: hello")], &params)
            .await
            .unwrap();
        assert!(second.content.contains("final_answer"));
    }

    #[tokio::test]
    async fn test_scripted_order_and_fallback() {
        let client = ScriptedLlmClient::new()
            .reply("one")
            .fail(LlmError::Overloaded("busy".into()))
            .then_always("done");
        let params = ModelParams::default();
        assert_eq!(client.complete(&[], &params).await.unwrap().content, "one");
        assert!(client.complete(&[], &params).await.is_err());
        assert_eq!(client.complete(&[], &params).await.unwrap().content, "done");
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test]
    async fn test_default_stream_single_chunk() {
        let client = ScriptedLlmClient::new().reply("streamed");
        let mut stream = client
            .complete_stream(&[Message::user("x")], &ModelParams::default())
            .await
            .unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "streamed");
        assert!(stream.next().await.is_none());
    }
}
