//! 记忆层：短期（当前 Execution 的 Step 日志）、长期（按 Agent 的事实）、情景（已完成 Execution 的摘要）
//!
//! MemoryManager 负责按 token 预算组装上下文并在每个 Step 后回写。

pub mod conversation;
pub mod episodic;
pub mod long_term;
pub mod manager;
pub mod short_term;
pub mod token_budget;
pub mod tokenizer;

pub use conversation::{Message, Role};
pub use long_term::{entry_id, KeywordRecencyRanker, MemoryEntry, MemoryTier, RelevanceRanker};
pub use manager::{ContextWindow, MemoryManager, MemoryPolicy, Summarizer, SummaryOutput};
pub use token_budget::{PromptSegment, TokenBudget, TokenEstimator};
