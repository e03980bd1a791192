//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / 参数 schema / 类别 / execute），由 ToolRegistry 按名注册与查找；
//! 参数结构固定的工具可实现 TypedTool，参数 schema 由 schemars 派生，反序列化即校验。
//! 注册表构建完成后只读，通过 Arc 在所有 worker 间共享。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::tools::{schema, RiskLevel, ToolCategory};

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（用于 JSON 中的 "tool" 字段）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认任意对象
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 固有风险类别，默认只读
    fn category(&self) -> ToolCategory {
        ToolCategory::Read
    }

    /// 按参数内容修正风险等级（如 HTTP 方法、收件人是否外部）
    fn refine_risk(&self, _args: &Value) -> Option<RiskLevel> {
        None
    }

    /// 单工具超时，None 时使用全局默认
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// 执行前的参数校验，默认按 parameters_schema 做类型 / 形状检查
    fn validate(&self, args: &Value) -> Result<(), String> {
        schema::validate_args(&self.parameters_schema(), args)
    }

    /// 执行工具
    async fn execute(&self, args: Value) -> Result<String, String>;
}

/// 强类型工具：参数为 schemars 派生 schema 的结构体
#[async_trait]
pub trait TypedTool: Send + Sync + 'static {
    type Args: DeserializeOwned + JsonSchema + Send;

    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn category(&self) -> ToolCategory {
        ToolCategory::Read
    }

    fn refine_risk(&self, _args: &Self::Args) -> Option<RiskLevel> {
        None
    }

    async fn call(&self, args: Self::Args) -> Result<String, String>;
}

/// TypedTool → Tool 适配器
pub struct Typed<T>(pub T);

fn parse_typed<A: DeserializeOwned>(args: &Value) -> Result<A, String> {
    serde_json::from_value(args.clone()).map_err(|e| format!("invalid arguments: {e}"))
}

#[async_trait]
impl<T: TypedTool> Tool for Typed<T> {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn description(&self) -> &str {
        self.0.description()
    }

    fn parameters_schema(&self) -> Value {
        let schema = schemars::schema_for!(T::Args);
        serde_json::to_value(&schema).unwrap_or(Value::Null)
    }

    fn category(&self) -> ToolCategory {
        self.0.category()
    }

    fn refine_risk(&self, args: &Value) -> Option<RiskLevel> {
        parse_typed::<T::Args>(args)
            .ok()
            .and_then(|typed| self.0.refine_risk(&typed))
    }

    fn validate(&self, args: &Value) -> Result<(), String> {
        parse_typed::<T::Args>(args).map(|_| ())
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let typed = parse_typed::<T::Args>(&args)?;
        self.0.call(typed).await
    }
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_typed(&mut self, tool: impl TypedTool) {
        self.register(Typed(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "tool re-registered, previous handler replaced");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 生成指定工具的 schema JSON（供 system prompt 的 Available tools 段），按名称排序
    pub fn schema_json_for(&self, allowed: &[String]) -> String {
        let mut names: Vec<&String> = allowed.iter().filter(|n| self.tools.contains_key(*n)).collect();
        names.sort();
        names.dedup();
        let tools: Vec<Value> = names
            .into_iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| {
                serde_json::json!({
                    "name": tool.name(),
                    "description": tool.description(),
                    "parameters": tool.parameters_schema()
                })
            })
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::EchoTool;
    use schemars::JsonSchema;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize, JsonSchema)]
    struct RefundArgs {
        order_id: String,
        amount: f64,
    }

    struct RefundTool;

    #[async_trait]
    impl TypedTool for RefundTool {
        type Args = RefundArgs;

        fn name(&self) -> &str {
            "refund"
        }

        fn description(&self) -> &str {
            "Refund an order"
        }

        fn category(&self) -> ToolCategory {
            ToolCategory::External
        }

        async fn call(&self, args: RefundArgs) -> Result<String, String> {
            Ok(format!("refunded {} for {}", args.amount, args.order_id))
        }
    }

    #[tokio::test]
    async fn test_typed_tool_validation_and_execution() {
        let tool = Typed(RefundTool);
        assert!(tool.validate(&json!({"order_id": "o1", "amount": 3.5})).is_ok());
        assert!(tool.validate(&json!({"order_id": "o1"})).is_err());
        assert!(tool.validate(&json!({"order_id": 1, "amount": 2})).is_err());
        assert_eq!(
            tool.execute(json!({"order_id": "o1", "amount": 3.5})).await.unwrap(),
            "refunded 3.5 for o1"
        );
        let schema = tool.parameters_schema();
        assert!(schema.to_string().contains("order_id"));
    }

    #[test]
    fn test_registry_schema_only_allowed() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register_typed(RefundTool);
        let json = registry.schema_json_for(&["echo".to_string(), "missing".to_string()]);
        assert!(json.contains("echo"));
        assert!(!json.contains("refund"));
        assert_eq!(registry.tool_names(), vec!["echo".to_string(), "refund".to_string()]);
    }
}
