//! 长期记忆：按 Agent 累积的事实，跨 Execution 检索
//!
//! 条目 ID 由 (agent_id, 规范化内容) 派生（UUID v5），重复写入同一事实是幂等的，并发写入不会产生重复。
//! 检索通过可插拔的 RelevanceRanker；默认实现为关键词重叠（jieba 分词）× 时间半衰期。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{AgentId, ExecutionId};
use crate::memory::tokenizer::{normalize, overlap_score, tokenize_to_set};

/// 记忆层级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    ShortTerm,
    LongTerm,
    Episodic,
}

impl MemoryTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryTier::ShortTerm => "short_term",
            MemoryTier::LongTerm => "long_term",
            MemoryTier::Episodic => "episodic",
        }
    }
}

/// 单条记忆
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub agent_id: AgentId,
    pub tier: MemoryTier,
    pub content: String,
    /// 写入时的权重（检索时与相关度相乘）
    pub score: f32,
    pub source_execution: Option<ExecutionId>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// 固定命名空间，保证同一 (agent, content) 总是得到同一 ID
const MEMORY_NAMESPACE: uuid::Uuid = uuid::Uuid::from_u128(0x6869_7665_2d6d_656d_6f72_792d_6e73_0001);

/// 由 agent 与规范化内容派生条目 ID
pub fn entry_id(agent_id: &str, tier: MemoryTier, content: &str) -> String {
    let key = format!("{}\n{}\n{}", agent_id, tier.as_str(), normalize(content));
    uuid::Uuid::new_v5(&MEMORY_NAMESPACE, key.as_bytes()).to_string()
}

impl MemoryEntry {
    pub fn long_term(
        agent_id: &str,
        content: impl Into<String>,
        source_execution: Option<ExecutionId>,
        retention_days: Option<u32>,
    ) -> Self {
        Self::new(agent_id, MemoryTier::LongTerm, content.into(), source_execution, retention_days)
    }

    pub fn episodic(
        agent_id: &str,
        content: impl Into<String>,
        source_execution: ExecutionId,
        retention_days: Option<u32>,
    ) -> Self {
        let mut entry = Self::new(
            agent_id,
            MemoryTier::Episodic,
            content.into(),
            Some(source_execution.clone()),
            retention_days,
        );
        // 每个 Execution 只有一条情景摘要
        let key = format!("{}\nepisodic\n{}", agent_id, source_execution);
        entry.id = uuid::Uuid::new_v5(&MEMORY_NAMESPACE, key.as_bytes()).to_string();
        entry
    }

    fn new(
        agent_id: &str,
        tier: MemoryTier,
        content: String,
        source_execution: Option<ExecutionId>,
        retention_days: Option<u32>,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            id: entry_id(agent_id, tier, &content),
            agent_id: agent_id.to_string(),
            tier,
            content,
            score: 1.0,
            source_execution,
            created_at,
            expires_at: retention_days.map(|d| created_at + chrono::Duration::days(i64::from(d))),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// 可插拔的相关度排序
pub trait RelevanceRanker: Send + Sync {
    /// 返回最相关的 k 条；分数相同时越新越靠前
    fn rank(&self, query: &str, entries: Vec<MemoryEntry>, k: usize, now: DateTime<Utc>) -> Vec<MemoryEntry>;
}

/// 默认排序：关键词重叠 × 时间半衰期 × 条目权重
#[derive(Debug, Clone)]
pub struct KeywordRecencyRanker {
    pub half_life_days: f64,
}

impl Default for KeywordRecencyRanker {
    fn default() -> Self {
        Self { half_life_days: 30.0 }
    }
}

impl KeywordRecencyRanker {
    fn recency_weight(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let age_days = (now - created_at).num_seconds().max(0) as f64 / 86_400.0;
        if self.half_life_days <= 0.0 {
            return 1.0;
        }
        0.5f64.powf(age_days / self.half_life_days)
    }
}

impl RelevanceRanker for KeywordRecencyRanker {
    fn rank(&self, query: &str, entries: Vec<MemoryEntry>, k: usize, now: DateTime<Utc>) -> Vec<MemoryEntry> {
        let query_tokens = tokenize_to_set(query);
        if query_tokens.is_empty() || k == 0 {
            return Vec::new();
        }
        let mut scored: Vec<(f64, MemoryEntry)> = entries
            .into_iter()
            .filter(|e| !e.is_expired(now))
            .filter_map(|e| {
                let overlap = overlap_score(&query_tokens, &tokenize_to_set(&e.content));
                (overlap > 0).then(|| {
                    let score = overlap as f64 * self.recency_weight(e.created_at, now) * f64::from(e.score);
                    (score, e)
                })
            })
            .collect();
        scored.sort_by(|(sa, a), (sb, b)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        scored.into_iter().take(k).map(|(_, e)| e).collect()
    }
}
