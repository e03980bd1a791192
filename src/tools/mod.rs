//! 工具层：注册表、参数 schema、风险分级、分发器与内置工具（echo、current_time、http_request）

pub mod clock;
pub mod echo;
pub mod executor;
pub mod http;
pub mod registry;
pub mod risk;
pub mod schema;

use std::time::Duration;

pub use clock::CurrentTimeTool;
pub use echo::EchoTool;
pub use executor::{DispatchContext, DispatchOutcome, ToolDispatcher};
pub use http::HttpRequestTool;
pub use registry::{Tool, ToolRegistry, Typed, TypedTool};
pub use risk::{
    DefaultRiskClassifier, RiskAssessment, RiskClassifier, RiskLevel, RiskPolicy, ToolCategory,
};
pub use schema::{final_answer_schema_json, tool_call_schema_json, validate_args};

use crate::config::ToolsSection;

/// 按配置构建内置工具注册表
pub fn builtin_registry(cfg: &ToolsSection) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    registry.register_typed(CurrentTimeTool);
    registry.register(HttpRequestTool::new(
        cfg.http.allowed_domains.clone(),
        cfg.http.timeout_secs,
        cfg.http.max_result_chars,
    ));
    registry
}

/// 全局默认工具超时
pub fn default_timeout(cfg: &ToolsSection) -> Duration {
    Duration::from_secs(cfg.tool_timeout_secs.max(1))
}
