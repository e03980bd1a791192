//! 记忆管理器：组装上下文窗口并在每个 Step 后回写
//!
//! 上下文 = system（指令 + 协议、工具 schema、早期 Step 摘要、相关长期事实、近期情景摘要）
//!        + user（任务输入）+ 当前 Execution 的 Step 历史（从新到旧装入预算）。
//! 历史溢出时最多调用一次摘要（结果持久化在 Execution 上，恢复时不会重复摘要）；之后的溢出直接丢弃并加省略标记。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::agent::AgentConfig;
use crate::core::{AgentError, ContextSummary, Execution, Step};
use crate::memory::episodic::{promotable_facts, summarize_execution};
use crate::memory::short_term::{fit_history, step_line};
use crate::memory::{
    KeywordRecencyRanker, MemoryEntry, MemoryTier, Message, PromptSegment, RelevanceRanker, TokenBudget,
    TokenEstimator,
};
use crate::store::Store;
use crate::tools::{final_answer_schema_json, tool_call_schema_json};
use crate::usage::UsageCharge;

/// 记忆策略（AgentConfig.memory）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryPolicy {
    #[serde(default = "default_true")]
    pub short_term: bool,
    #[serde(default = "default_true")]
    pub long_term: bool,
    #[serde(default = "default_true")]
    pub episodic: bool,
    /// 提示词总预算；缺省为 context_window - max_tokens
    #[serde(default)]
    pub token_budget: Option<usize>,
    #[serde(default = "default_long_term_limit")]
    pub long_term_limit: usize,
    #[serde(default = "default_episodic_limit")]
    pub episodic_limit: usize,
    #[serde(default)]
    pub retention_days: Option<u32>,
    /// 是否把最终回答提升为长期事实
    #[serde(default)]
    pub promote_final_answer: bool,
    /// 历史溢出时是否摘要（每个 Execution 至多一次）
    #[serde(default = "default_true")]
    pub summarize_overflow: bool,
}

fn default_true() -> bool {
    true
}

fn default_long_term_limit() -> usize {
    5
}

fn default_episodic_limit() -> usize {
    3
}

impl Default for MemoryPolicy {
    fn default() -> Self {
        Self {
            short_term: true,
            long_term: true,
            episodic: true,
            token_budget: None,
            long_term_limit: default_long_term_limit(),
            episodic_limit: default_episodic_limit(),
            retention_days: None,
            promote_final_answer: false,
            summarize_overflow: true,
        }
    }
}

/// 摘要结果
#[derive(Debug, Clone)]
pub struct SummaryOutput {
    pub text: String,
    pub charge: UsageCharge,
}

/// 早期 Step 的摘要器（由模型网关实现）
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, transcript: &str) -> Result<SummaryOutput, AgentError>;
}

/// 组装好的上下文
#[derive(Debug, Clone, Default)]
pub struct ContextWindow {
    pub messages: Vec<Message>,
    pub estimated_tokens: usize,
    /// 本次新生成的摘要（需持久化到 Execution）
    pub summary_update: Option<ContextSummary>,
    pub summary_charge: UsageCharge,
    pub omitted_steps: usize,
}

const PROTOCOL: &str = "Work step by step. Each reply must be exactly one JSON object and nothing else.";

/// 记忆管理器
pub struct MemoryManager {
    store: Arc<dyn Store>,
    ranker: Arc<dyn RelevanceRanker>,
}

impl MemoryManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            ranker: Arc::new(KeywordRecencyRanker::default()),
        }
    }

    pub fn with_ranker(mut self, ranker: Arc<dyn RelevanceRanker>) -> Self {
        self.ranker = ranker;
        self
    }

    fn instructions(agent: &AgentConfig) -> String {
        format!(
            "{}\n\n{}\nTo call a tool reply with an object matching: {}\nWhen finished reply with an object matching: {}",
            agent.instructions.trim(),
            PROTOCOL,
            tool_call_schema_json(),
            final_answer_schema_json()
        )
    }

    async fn relevant_facts(&self, agent: &AgentConfig, query: &str) -> Result<String, AgentError> {
        if !agent.memory.long_term || agent.memory.long_term_limit == 0 {
            return Ok(String::new());
        }
        let entries = self.store.list_memories(&agent.id, MemoryTier::LongTerm).await?;
        let ranked = self.ranker.rank(query, entries, agent.memory.long_term_limit, Utc::now());
        Ok(ranked.iter().map(|e| format!("- {}", e.content)).collect::<Vec<_>>().join("\n"))
    }

    async fn recent_episodes(&self, agent: &AgentConfig, current: &str) -> Result<String, AgentError> {
        if !agent.memory.episodic || agent.memory.episodic_limit == 0 {
            return Ok(String::new());
        }
        let now = Utc::now();
        let mut entries: Vec<MemoryEntry> = self
            .store
            .list_memories(&agent.id, MemoryTier::Episodic)
            .await?
            .into_iter()
            .filter(|e| !e.is_expired(now) && e.source_execution.as_deref() != Some(current))
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries.truncate(agent.memory.episodic_limit);
        entries.reverse();
        Ok(entries.iter().map(|e| format!("- {}", e.content)).collect::<Vec<_>>().join("\n"))
    }

    /// 组装上下文窗口
    pub async fn assemble_context(
        &self,
        agent: &AgentConfig,
        execution: &Execution,
        steps: &[Step],
        tool_schema: &str,
        summarizer: Option<&dyn Summarizer>,
    ) -> Result<ContextWindow, AgentError> {
        let total = agent
            .memory
            .token_budget
            .unwrap_or_else(|| agent.model.context_window.saturating_sub(agent.model.max_tokens as usize));
        let input = execution.input_text();

        let mut query = input.clone();
        if let Some(obs) = steps.last().and_then(|s| s.observation.as_ref()) {
            query.push('\n');
            query.push_str(&obs.content);
        }
        let facts = self.relevant_facts(agent, &query).await?;
        let episodes = self.recent_episodes(agent, &execution.id).await?;
        let task = Message::user(format!("Task input:\n{}", input));
        let task_tokens = TokenEstimator::estimate_messages(std::slice::from_ref(&task));

        // 短期记忆关闭时只保留最近一个 Step
        let history: &[Step] = if agent.memory.short_term {
            steps
        } else {
            &steps[steps.len().saturating_sub(1)..]
        };

        let mut summary = execution.context_summary.clone();
        let mut window = ContextWindow::default();

        for pass in 0..2 {
            let segments = vec![
                (PromptSegment::Instructions, Self::instructions(agent)),
                (PromptSegment::ToolSchema, tool_schema.to_string()),
                (
                    PromptSegment::StepSummary,
                    summary.as_ref().and_then(|s| s.text.clone()).unwrap_or_default(),
                ),
                (PromptSegment::LongTermFacts, facts.clone()),
                (PromptSegment::Episodic, episodes.clone()),
            ];
            let budget = TokenBudget::new(total).with_history_reserve(total / 2);
            let (allocated, system_tokens) = budget.allocate(&segments);
            let history_budget = total.saturating_sub(system_tokens + task_tokens);
            let skip_below = summary.as_ref().map(|s| s.through).unwrap_or(0);
            let fitted = fit_history(history, skip_below, history_budget);

            let can_summarize = pass == 0
                && summary.is_none()
                && agent.memory.summarize_overflow
                && !fitted.overflow.is_empty();
            if let (true, Some(summarizer)) = (can_summarize, summarizer) {
                let through = fitted.overflow.last().map(|i| i + 1).unwrap_or(0);
                let transcript = history
                    .iter()
                    .filter(|s| s.index < through)
                    .map(step_line)
                    .collect::<Vec<_>>()
                    .join("\n");
                let text = match summarizer.summarize(&transcript).await {
                    Ok(out) => {
                        window.summary_charge = out.charge;
                        Some(out.text)
                    }
                    Err(e) => {
                        tracing::warn!(execution_id = %execution.id, error = %e, "step summary failed, dropping overflow");
                        None
                    }
                };
                let created = ContextSummary { through, text };
                window.summary_update = Some(created.clone());
                summary = Some(created);
                continue;
            }

            let system = allocated
                .iter()
                .map(|(seg, content)| match seg {
                    PromptSegment::Instructions => content.clone(),
                    other => format!("## {}\n{}", other.title(), content),
                })
                .collect::<Vec<_>>()
                .join("\n\n");

            // 摘要失败时被跳过的 Step 也算作省略
            let unsummarized = match &summary {
                Some(ContextSummary { through, text: None }) => {
                    history.iter().filter(|s| s.index < *through).count()
                }
                _ => 0,
            };
            let omitted = fitted.overflow.len() + unsummarized;

            let mut messages = vec![Message::system(system), task.clone()];
            if omitted > 0 {
                messages.push(Message::user(format!("[{} earlier steps omitted]", omitted)));
            }
            messages.extend(fitted.messages);

            window.estimated_tokens = TokenEstimator::estimate_messages(&messages);
            window.messages = messages;
            window.omitted_steps = omitted;
            break;
        }

        Ok(window)
    }

    /// 回写一个 Step（短期记忆即 Step 日志）
    pub async fn write_back(&self, step: &Step) -> Result<(), AgentError> {
        self.store.append_step(step).await?;
        Ok(())
    }

    /// 写入一条长期事实；已存在时返回 false
    pub async fn remember(
        &self,
        agent_id: &str,
        content: &str,
        source: Option<String>,
        retention_days: Option<u32>,
    ) -> Result<bool, AgentError> {
        let entry = MemoryEntry::long_term(agent_id, content.trim(), source, retention_days);
        Ok(self.store.insert_memory(&entry).await?)
    }

    /// Execution 完成后：写入情景摘要并按策略提升事实，返回新写入的长期事实数
    pub async fn on_completed(
        &self,
        agent: &AgentConfig,
        execution: &Execution,
        steps: &[Step],
    ) -> Result<usize, AgentError> {
        if agent.memory.episodic {
            let summary = summarize_execution(execution, steps);
            let entry = MemoryEntry::episodic(&agent.id, summary, execution.id.clone(), agent.memory.retention_days);
            self.store.insert_memory(&entry).await?;
        }
        let mut promoted = 0;
        if agent.memory.long_term {
            for fact in promotable_facts(execution, agent.memory.promote_final_answer) {
                if self
                    .remember(&agent.id, &fact, Some(execution.id.clone()), agent.memory.retention_days)
                    .await?
                {
                    promoted += 1;
                }
            }
        }
        tracing::debug!(execution_id = %execution.id, promoted, "memory write-back complete");
        Ok(promoted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ExecutionStatus, Observation, StepAction, TokenUsage, ToolCall, TriggerSource};
    use crate::store::{InMemoryStore, MemoryStore};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn agent() -> AgentConfig {
        let mut agent = AgentConfig::new("support", "You are a support agent.");
        agent.model.context_window = 100_000;
        agent
    }

    fn step(index: u32, text: &str) -> Step {
        Step::new(
            "exec",
            index,
            format!(r#"{{"tool": "echo", "args": {{"text": "{text}"}}}}"#),
            StepAction::ToolCall(ToolCall {
                name: "echo".into(),
                arguments: json!({"text": text}),
            }),
            Some(Observation::success(text)),
            TokenUsage::default(),
        )
    }

    struct CountingSummarizer(AtomicUsize);

    #[async_trait]
    impl Summarizer for CountingSummarizer {
        async fn summarize(&self, transcript: &str) -> Result<SummaryOutput, AgentError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(SummaryOutput {
                text: format!("summary of {} lines", transcript.lines().count()),
                charge: UsageCharge::default(),
            })
        }
    }

    #[tokio::test]
    async fn test_context_includes_facts_and_history() {
        let store = Arc::new(InMemoryStore::new());
        let manager = MemoryManager::new(store.clone());
        let agent = agent();
        manager.remember("support", "refund needs an order id", None, None).await.unwrap();
        manager.remember("support", "weather is sunny", None, None).await.unwrap();

        let exec = Execution::new("support", json!("please refund my order"), TriggerSource::Manual);
        let steps = vec![step(0, "hello")];
        let window = manager.assemble_context(&agent, &exec, &steps, "[]", None).await.unwrap();

        let system = &window.messages[0].content;
        assert!(system.starts_with("You are a support agent."));
        assert!(system.contains("refund needs an order id"));
        assert!(!system.contains("weather"));
        assert_eq!(window.messages[1].content, "Task input:\nplease refund my order");
        assert_eq!(window.messages.last().unwrap().content, "Observation from echo: hello");
        assert_eq!(window.omitted_steps, 0);
    }

    #[tokio::test]
    async fn test_overflow_summarized_once_then_dropped() {
        let store = Arc::new(InMemoryStore::new());
        let manager = MemoryManager::new(store);
        let mut agent = agent();
        agent.memory.token_budget = Some(1200);
        let mut exec = Execution::new("support", json!("task"), TriggerSource::Manual);
        let steps: Vec<Step> = (0..40).map(|i| step(i, &"lorem ipsum ".repeat(10))).collect();
        let summarizer = CountingSummarizer(AtomicUsize::new(0));

        let first = manager
            .assemble_context(&agent, &exec, &steps, "[]", Some(&summarizer))
            .await
            .unwrap();
        assert_eq!(summarizer.0.load(Ordering::SeqCst), 1);
        let summary = first.summary_update.clone().unwrap();
        assert!(summary.through > 0);
        assert!(first.messages[0].content.contains("summary of"));

        exec.context_summary = Some(summary);
        let more: Vec<Step> = (0..60).map(|i| step(i, &"lorem ipsum ".repeat(10))).collect();
        let second = manager
            .assemble_context(&agent, &exec, &more, "[]", Some(&summarizer))
            .await
            .unwrap();
        assert_eq!(summarizer.0.load(Ordering::SeqCst), 1);
        assert!(second.summary_update.is_none());
        assert!(second.omitted_steps > 0);
        assert!(second.messages.iter().any(|m| m.content.contains("earlier steps omitted")));
    }

    #[tokio::test]
    async fn test_on_completed_writes_episode_and_facts() {
        let store = Arc::new(InMemoryStore::new());
        let manager = MemoryManager::new(store.clone());
        let agent = agent();
        let mut exec = Execution::new("support", json!("Remember: customer is VIP"), TriggerSource::Manual);
        exec.transition(ExecutionStatus::Running).unwrap();
        exec.complete("done").unwrap();

        let promoted = manager.on_completed(&agent, &exec, &[]).await.unwrap();
        assert_eq!(promoted, 1);
        // 重复回写是幂等的
        assert_eq!(manager.on_completed(&agent, &exec, &[]).await.unwrap(), 0);
        assert_eq!(store.list_memories("support", MemoryTier::Episodic).await.unwrap().len(), 1);
        assert_eq!(store.list_memories("support", MemoryTier::LongTerm).await.unwrap().len(), 1);
    }
}
