//! ReAct 过程事件：用于流式/SSE 展示步数、工具调用、观察与结果

use serde::Serialize;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReactEvent {
    /// 进入第几步
    StepUpdate { step: u32, max_steps: u32 },
    /// 正在调用模型
    Thinking,
    /// 调用工具
    ToolCall {
        tool: String,
        args: serde_json::Value,
    },
    /// 工具返回（预览，避免过长）
    Observation {
        tool: String,
        kind: String,
        preview: String,
    },
    /// 工具调用被挂起等待审批
    ApprovalRequested { approval_id: String, tool: String },
    /// 本次模型调用的 token 用量与累计
    TokenUsage {
        prompt_tokens: u64,
        completion_tokens: u64,
        cumulative_total: u64,
        cumulative_cost_usd: f64,
    },
    /// 到达终态
    Finished { status: String },
}

/// 带 Execution 标识的过程事件
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub execution_id: String,
    #[serde(flatten)]
    pub event: ReactEvent,
}
