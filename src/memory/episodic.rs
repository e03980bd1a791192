//! 情景记忆与事实提取
//!
//! Execution 完成后生成一条确定性的压缩摘要（不调用模型），并按策略把事实提升到长期记忆：
//! 最终回答本身，以及输入 / 回答中显式的「Remember: xxx」或「记住：xxx」语句。

use crate::core::{Execution, Step, StepAction};

const PREVIEW_CHARS: usize = 200;

const REMEMBER_PREFIXES: &[&str] = &["remember:", "记住：", "记住:"];

fn preview(text: &str) -> String {
    let text = text.trim();
    if text.chars().count() > PREVIEW_CHARS {
        format!("{}...", text.chars().take(PREVIEW_CHARS).collect::<String>())
    } else {
        text.to_string()
    }
}

/// 一条 Execution 的压缩摘要
pub fn summarize_execution(execution: &Execution, steps: &[Step]) -> String {
    let mut tools: Vec<&str> = steps
        .iter()
        .filter_map(|s| match &s.action {
            StepAction::ToolCall(call) => Some(call.name.as_str()),
            _ => None,
        })
        .collect();
    tools.sort_unstable();
    tools.dedup();

    let tools = if tools.is_empty() {
        "none".to_string()
    } else {
        tools.join(", ")
    };
    let outcome = match (&execution.output, execution.failure) {
        (Some(output), _) => format!("answered: {}", preview(output)),
        (None, Some(reason)) => format!("failed: {}", reason),
        (None, None) => execution.status.to_string(),
    };
    format!(
        "[{}] input: {} | steps: {} | tools: {} | {}",
        execution.created_at.format("%Y-%m-%d %H:%M"),
        preview(&execution.input_text()),
        execution.step_count,
        tools,
        outcome
    )
}

/// 提取显式「记住」语句（不区分英文大小写，每行一条）
pub fn explicit_facts(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            let lower = trimmed.to_lowercase();
            REMEMBER_PREFIXES
                .iter()
                .find(|prefix| lower.starts_with(*prefix))
                .and_then(|prefix| trimmed.get(prefix.len()..))
                .map(|rest| rest.trim().to_string())
        })
        .filter(|fact| !fact.is_empty())
        .collect()
}

/// 按策略收集待提升的事实（去重，保持顺序）
pub fn promotable_facts(execution: &Execution, promote_final_answer: bool) -> Vec<String> {
    let mut facts = explicit_facts(&execution.input_text());
    if let Some(output) = &execution.output {
        facts.extend(explicit_facts(output));
        if promote_final_answer && !output.trim().is_empty() {
            facts.push(output.trim().to_string());
        }
    }
    let mut seen = std::collections::HashSet::new();
    facts.retain(|f| seen.insert(crate::memory::tokenizer::normalize(f)));
    facts
}
