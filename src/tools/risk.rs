//! 工具风险分级
//!
//! 风险 = 工具固有类别（read / write / external）+ 参数内容修正（工具自定义、金额阈值）。
//! 风险达到阈值（per-tool > per-category > default）的调用需要人工审批。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::Tool;

/// 工具类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    /// 只读，无副作用
    Read,
    /// 修改内部状态
    Write,
    /// 对外部系统产生副作用（发送、支付、调用第三方）
    External,
}

impl ToolCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCategory::Read => "read",
            ToolCategory::Write => "write",
            ToolCategory::External => "external",
        }
    }

    pub fn base_level(&self) -> RiskLevel {
        match self {
            ToolCategory::Read => RiskLevel::Low,
            ToolCategory::Write => RiskLevel::Medium,
            ToolCategory::External => RiskLevel::High,
        }
    }
}

/// 风险等级（可比较）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// 一次工具调用的风险评估结果（随 PendingApproval 持久化）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub category: ToolCategory,
    pub reasons: Vec<String>,
}

/// 风险策略（AgentConfig.risk）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskPolicy {
    #[serde(default = "default_threshold")]
    pub default_threshold: RiskLevel,
    /// 按工具名覆盖阈值
    #[serde(default)]
    pub per_tool: HashMap<String, RiskLevel>,
    /// 按类别（read / write / external）覆盖阈值
    #[serde(default)]
    pub per_category: HashMap<String, RiskLevel>,
    /// 参数中金额超过该值时风险至少为 High
    #[serde(default)]
    pub amount_threshold: Option<f64>,
}

fn default_threshold() -> RiskLevel {
    RiskLevel::High
}

impl Default for RiskPolicy {
    fn default() -> Self {
        Self {
            default_threshold: default_threshold(),
            per_tool: HashMap::new(),
            per_category: HashMap::new(),
            amount_threshold: None,
        }
    }
}

impl RiskPolicy {
    pub fn threshold_for(&self, tool: &str, category: ToolCategory) -> RiskLevel {
        self.per_tool
            .get(tool)
            .or_else(|| self.per_category.get(category.as_str()))
            .copied()
            .unwrap_or(self.default_threshold)
    }

    pub fn requires_approval(&self, tool: &str, assessment: &RiskAssessment) -> bool {
        assessment.level >= self.threshold_for(tool, assessment.category)
    }
}

/// 可插拔的风险分类器
pub trait RiskClassifier: Send + Sync {
    fn classify(&self, tool: &dyn Tool, args: &Value, policy: &RiskPolicy) -> RiskAssessment;
}

/// 金额类参数名
const AMOUNT_KEYS: &[&str] = &["amount", "total", "price", "value", "refund_amount"];

/// 默认分类器：类别基线 → 工具自定义修正 → 金额阈值
#[derive(Debug, Default, Clone)]
pub struct DefaultRiskClassifier;

impl RiskClassifier for DefaultRiskClassifier {
    fn classify(&self, tool: &dyn Tool, args: &Value, policy: &RiskPolicy) -> RiskAssessment {
        let category = tool.category();
        let mut level = category.base_level();
        let mut reasons = vec![format!("{} tool", category.as_str())];

        if let Some(refined) = tool.refine_risk(args) {
            if refined != level {
                reasons.push(format!("arguments refine risk to {:?}", refined));
            }
            level = refined;
        }

        if let Some(threshold) = policy.amount_threshold {
            if let Some(amount) = max_amount(args) {
                if amount > threshold && level < RiskLevel::High {
                    level = RiskLevel::High;
                    reasons.push(format!("amount {} exceeds {}", amount, threshold));
                }
            }
        }

        RiskAssessment {
            level,
            category,
            reasons,
        }
    }
}

/// 递归查找金额类字段的最大值（数字或数字字符串）
fn max_amount(value: &Value) -> Option<f64> {
    match value {
        Value::Object(map) => map
            .iter()
            .filter_map(|(k, v)| {
                let direct = if AMOUNT_KEYS.contains(&k.to_lowercase().as_str()) {
                    match v {
                        Value::Number(n) => n.as_f64(),
                        Value::String(s) => s.trim().parse::<f64>().ok(),
                        _ => None,
                    }
                } else {
                    None
                };
                let nested = max_amount(v);
                match (direct, nested) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                }
            })
            .reduce(f64::max),
        Value::Array(items) => items.iter().filter_map(max_amount).reduce(f64::max),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct Refund;

    #[async_trait]
    impl Tool for Refund {
        fn name(&self) -> &str {
            "refund"
        }
        fn description(&self) -> &str {
            "refund an order"
        }
        fn category(&self) -> ToolCategory {
            ToolCategory::Write
        }
        async fn execute(&self, _args: Value) -> Result<String, String> {
            Ok("refunded".into())
        }
    }

    #[test]
    fn test_category_baseline() {
        let assessment = DefaultRiskClassifier.classify(&Refund, &json!({}), &RiskPolicy::default());
        assert_eq!(assessment.level, RiskLevel::Medium);
        assert!(!RiskPolicy::default().requires_approval("refund", &assessment));
    }

    #[test]
    fn test_amount_threshold_raises_risk() {
        let policy = RiskPolicy {
            amount_threshold: Some(100.0),
            ..Default::default()
        };
        let small = DefaultRiskClassifier.classify(&Refund, &json!({"amount": 20}), &policy);
        assert_eq!(small.level, RiskLevel::Medium);
        let large = DefaultRiskClassifier.classify(
            &Refund,
            &json!({"order": {"items": [{"price": "250.5"}]}}),
            &policy,
        );
        assert_eq!(large.level, RiskLevel::High);
        assert!(policy.requires_approval("refund", &large));
    }

    #[test]
    fn test_threshold_precedence() {
        let mut policy = RiskPolicy::default();
        policy.per_category.insert("write".into(), RiskLevel::Medium);
        assert_eq!(policy.threshold_for("refund", ToolCategory::Write), RiskLevel::Medium);
        policy.per_tool.insert("refund".into(), RiskLevel::Critical);
        assert_eq!(policy.threshold_for("refund", ToolCategory::Write), RiskLevel::Critical);
        assert_eq!(policy.threshold_for("other", ToolCategory::Read), RiskLevel::High);
    }
}
