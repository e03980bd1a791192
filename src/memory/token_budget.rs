//! Token 预算控制
//!
//! 上下文窗口 = 系统段（指令、工具 schema、摘要、长期事实、情景摘要）+ 当前 Execution 的 Step 历史。
//! 系统段按优先级竞争预算，低优先级段先被截断；剩余预算留给 Step 历史。

use std::collections::HashMap;

use crate::memory::Message;

/// Token 估算器（简单的字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 估算文本的 token 数量
    /// 英文约 4 字符/token，中文约 1.5 字符/token
    pub fn estimate(text: &str) -> usize {
        let mut ascii_chars = 0;
        let mut non_ascii_chars = 0;

        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }

        let tokens = ascii_chars / 4 + (non_ascii_chars as f64 / 1.5).ceil() as usize;
        tokens.max(1)
    }

    /// 估算消息列表（每条消息额外计 4 token 的角色开销）
    pub fn estimate_messages(messages: &[Message]) -> usize {
        messages.iter().map(|m| Self::estimate(&m.content) + 4).sum()
    }
}

/// 提示词段类型（按优先级排序）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptSegment {
    /// Agent 指令（最高优先级，从不截断）
    Instructions,
    /// 工具 schema
    ToolSchema,
    /// 早期 Step 的摘要
    StepSummary,
    /// 长期记忆检索结果
    LongTermFacts,
    /// 近期 Execution 的情景摘要
    Episodic,
}

impl PromptSegment {
    /// 获取优先级（数字越小优先级越高）
    pub fn priority(&self) -> u8 {
        match self {
            PromptSegment::Instructions => 0,
            PromptSegment::ToolSchema => 1,
            PromptSegment::StepSummary => 2,
            PromptSegment::LongTermFacts => 3,
            PromptSegment::Episodic => 4,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            PromptSegment::Instructions => "Instructions",
            PromptSegment::ToolSchema => "Available tools",
            PromptSegment::StepSummary => "Summary of earlier steps",
            PromptSegment::LongTermFacts => "Relevant facts",
            PromptSegment::Episodic => "Recent executions",
        }
    }
}

/// Token 预算管理器
#[derive(Debug, Clone)]
pub struct TokenBudget {
    /// 总 token 预算（上下文窗口减去输出预留）
    total_budget: usize,
    /// 各段落的最大 token 数
    segment_limits: HashMap<PromptSegment, usize>,
    /// Step 历史至少保留的 token 数
    history_reserve: usize,
}

impl TokenBudget {
    pub fn new(total_budget: usize) -> Self {
        Self {
            total_budget,
            segment_limits: HashMap::new(),
            history_reserve: total_budget / 2,
        }
    }

    pub fn with_segment_limit(mut self, segment: PromptSegment, limit: usize) -> Self {
        self.segment_limits.insert(segment, limit);
        self
    }

    pub fn with_history_reserve(mut self, reserve: usize) -> Self {
        self.history_reserve = reserve.min(self.total_budget);
        self
    }

    /// 系统段可用预算（总预算减去历史预留）
    pub fn system_budget(&self) -> usize {
        self.total_budget.saturating_sub(self.history_reserve)
    }

    pub fn total_budget(&self) -> usize {
        self.total_budget
    }

    /// 按优先级分配 token，返回截断后的段落与已用 token 数
    pub fn allocate(&self, segments: &[(PromptSegment, String)]) -> (Vec<(PromptSegment, String)>, usize) {
        let mut result = Vec::new();
        let mut remaining = self.system_budget();
        let mut used = 0;

        let mut sorted: Vec<_> = segments.to_vec();
        sorted.sort_by_key(|(seg, _)| seg.priority());

        for (segment, content) in sorted {
            if content.is_empty() {
                continue;
            }
            let estimated = TokenEstimator::estimate(&content);

            // 指令不截断，即使超出系统段预算
            if segment == PromptSegment::Instructions {
                used += estimated;
                remaining = remaining.saturating_sub(estimated);
                result.push((segment, content));
                continue;
            }

            let limit = self.segment_limits.get(&segment).copied().unwrap_or(remaining);
            let allowed = remaining.min(limit);

            if estimated <= allowed {
                used += estimated;
                remaining -= estimated;
                result.push((segment, content));
            } else if allowed > 8 {
                let truncated = Self::truncate_to_tokens(&content, allowed);
                let tokens = TokenEstimator::estimate(&truncated);
                used += tokens;
                remaining = remaining.saturating_sub(tokens);
                result.push((segment, truncated));
            }
        }

        (result, used)
    }

    /// 将文本截断到指定 token 数（保留开头）
    pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
        let estimated = TokenEstimator::estimate(text);
        if estimated <= max_tokens {
            return text.to_string();
        }

        let ratio = max_tokens as f64 / estimated as f64;
        // 留 10% 余量给截断标记
        let target_chars = (text.chars().count() as f64 * ratio * 0.9) as usize;
        let truncated: String = text.chars().take(target_chars).collect();

        format!("{}...\n[truncated due to token budget]", truncated.trim_end())
    }
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self::new(8000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_estimator_english() {
        let text = "Hello, world! This is a test.";
        let tokens = TokenEstimator::estimate(text);
        assert!(tokens > 0);
        assert!(tokens < text.len());
    }

    #[test]
    fn test_token_estimator_chinese() {
        assert_eq!(TokenEstimator::estimate("你好世界"), 3);
    }

    #[test]
    fn test_allocation_truncates_low_priority_first() {
        let budget = TokenBudget::new(200).with_history_reserve(100);
        let segments = vec![
            (PromptSegment::Episodic, "episode ".repeat(100)),
            (PromptSegment::Instructions, "Be helpful.".to_string()),
            (PromptSegment::LongTermFacts, "fact ".repeat(20)),
        ];
        let (allocated, used) = budget.allocate(&segments);
        assert_eq!(allocated[0].0, PromptSegment::Instructions);
        assert_eq!(allocated[1].1, "fact ".repeat(20));
        let episodic = &allocated[2].1;
        assert!(episodic.contains("[truncated due to token budget]"));
        assert!(used <= 100 + 10);
    }

    #[test]
    fn test_instructions_never_truncated() {
        let budget = TokenBudget::new(40).with_history_reserve(30);
        let long = "rule ".repeat(100);
        let (allocated, _) = budget.allocate(&[(PromptSegment::Instructions, long.clone())]);
        assert_eq!(allocated[0].1, long);
    }

    #[test]
    fn test_segment_priority() {
        assert!(PromptSegment::Instructions.priority() < PromptSegment::Episodic.priority());
        assert!(PromptSegment::StepSummary.priority() < PromptSegment::LongTermFacts.priority());
    }
}
