//! 短期记忆：当前 Execution 的 Step 日志
//!
//! 每个 Step 渲染为 assistant（模型原始输出）+ user（Observation）两条消息；
//! 按从新到旧装入预算，装不下的最旧部分交给摘要或省略。

use crate::core::{ObservationKind, Step, StepAction};
use crate::memory::{Message, TokenEstimator};

/// Observation 类型的展示名
fn kind_label(kind: ObservationKind) -> &'static str {
    match kind {
        ObservationKind::Success => "success",
        ObservationKind::ValidationError => "validation_error",
        ObservationKind::ToolError => "tool_error",
        ObservationKind::Timeout => "timeout",
        ObservationKind::Rejected => "rejected",
        ObservationKind::Denied => "denied",
    }
}

/// 单个 Step 的消息形式
pub fn step_messages(step: &Step) -> Vec<Message> {
    let mut messages = vec![Message::assistant(step.raw_response.clone())];
    let Some(obs) = &step.observation else {
        return messages;
    };
    let line = match &step.action {
        StepAction::ToolCall(call) if obs.kind == ObservationKind::Success => {
            format!("Observation from {}: {}", call.name, obs.content)
        }
        StepAction::ToolCall(call) => {
            format!("Observation from {} [{}]: {}", call.name, kind_label(obs.kind), obs.content)
        }
        _ => format!("Observation [{}]: {}", kind_label(obs.kind), obs.content),
    };
    messages.push(Message::user(line));
    messages
}

/// 单个 Step 的一行文本（用于摘要输入）
pub fn step_line(step: &Step) -> String {
    let action = match &step.action {
        StepAction::FinalAnswer { answer } => format!("final answer: {answer}"),
        StepAction::ToolCall(call) => format!("called {} with {}", call.name, call.arguments),
        StepAction::Invalid { reason } => format!("invalid output ({reason})"),
    };
    match &step.observation {
        Some(obs) => format!("#{} {} -> [{}] {}", step.index, action, kind_label(obs.kind), obs.content),
        None => format!("#{} {}", step.index, action),
    }
}

/// 装入预算后的历史
#[derive(Debug, Clone, Default)]
pub struct HistoryWindow {
    /// 按时间顺序
    pub messages: Vec<Message>,
    /// 因预算被排除的 Step 序号（按时间顺序）
    pub overflow: Vec<u32>,
    pub tokens: usize,
}

/// 从最新的 Step 开始装入，直到预算用完；序号小于 skip_below 的 Step 已由摘要覆盖
pub fn fit_history(steps: &[Step], skip_below: u32, budget: usize) -> HistoryWindow {
    let candidates: Vec<&Step> = steps.iter().filter(|s| s.index >= skip_below).collect();
    let mut kept: Vec<Vec<Message>> = Vec::new();
    let mut tokens = 0;
    let mut cut = 0;

    for (pos, step) in candidates.iter().enumerate().rev() {
        let msgs = step_messages(step);
        let cost = TokenEstimator::estimate_messages(&msgs);
        if tokens + cost > budget {
            cut = pos + 1;
            break;
        }
        tokens += cost;
        kept.push(msgs);
    }

    kept.reverse();
    HistoryWindow {
        messages: kept.into_iter().flatten().collect(),
        overflow: candidates[..cut].iter().map(|s| s.index).collect(),
        tokens,
    }
}
