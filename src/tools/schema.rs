//! 工具调用 JSON Schema：生成与参数校验
//!
//! - tool_call_schema_json：schemars 生成「合法 tool call / final answer」的结构，拼入 system prompt，减少格式错误
//! - validate_args：按工具声明的参数 schema 做类型 / 形状校验（type、required、properties、enum、items）

use std::collections::HashMap;

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 工具调用请求格式：与解析器的 `{"tool": "...", "args": {...}}` 一致（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    /// 工具名，必须是 Available tools 中列出的名称
    pub tool: String,
    /// 工具参数，须符合该工具的 parameters schema
    pub args: HashMap<String, serde_json::Value>,
}

/// 最终回答格式
#[allow(dead_code)]
#[derive(JsonSchema)]
struct FinalAnswerFormat {
    pub final_answer: String,
}

/// 返回工具调用的 JSON Schema 字符串，可拼入 system prompt
pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ToolCallFormat);
    serde_json::to_string(&schema).unwrap_or_default()
}

pub fn final_answer_schema_json() -> String {
    let schema = schema_for!(FinalAnswerFormat);
    serde_json::to_string(&schema).unwrap_or_default()
}

/// 按 schema 校验参数；返回第一处不匹配的描述
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), String> {
    validate_at("args", schema, args)
}

fn validate_at(path: &str, schema: &Value, value: &Value) -> Result<(), String> {
    let Some(schema) = schema.as_object() else {
        return Ok(());
    };

    if let Some(expected) = schema.get("type") {
        let ok = match expected {
            Value::String(t) => type_matches(t, value),
            // ["string", "null"] 形式
            Value::Array(types) => types
                .iter()
                .filter_map(Value::as_str)
                .any(|t| type_matches(t, value)),
            _ => true,
        };
        if !ok {
            return Err(format!(
                "{path}: expected {}, got {}",
                expected,
                type_name(value)
            ));
        }
    }

    if let Some(Value::Array(allowed)) = schema.get("enum") {
        if !allowed.contains(value) {
            return Err(format!("{path}: value {} is not one of {}", value, Value::Array(allowed.clone())));
        }
    }

    if let Value::Object(obj) = value {
        if let Some(Value::Array(required)) = schema.get("required") {
            for key in required.iter().filter_map(Value::as_str) {
                if !obj.contains_key(key) {
                    return Err(format!("{path}: missing required field '{key}'"));
                }
            }
        }
        if let Some(Value::Object(props)) = schema.get("properties") {
            for (key, prop_schema) in props {
                if let Some(v) = obj.get(key) {
                    // null 视为未提供（可选字段）
                    if v.is_null() && !is_required(schema, key) {
                        continue;
                    }
                    validate_at(&format!("{path}.{key}"), prop_schema, v)?;
                }
            }
        }
    }

    if let (Value::Array(items), Some(item_schema)) = (value, schema.get("items")) {
        for (i, item) in items.iter().enumerate() {
            validate_at(&format!("{path}[{i}]"), item_schema, item)?;
        }
    }

    Ok(())
}

fn is_required(schema: &serde_json::Map<String, Value>, key: &str) -> bool {
    schema
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().any(|k| k.as_str() == Some(key)))
        .unwrap_or(false)
}

fn type_matches(t: &str, value: &Value) -> bool {
    match t {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "order_id": {"type": "string"},
                "amount": {"type": "number"},
                "mode": {"type": "string", "enum": ["full", "partial"]},
                "tags": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["order_id"]
        })
    }

    #[test]
    fn test_valid_args() {
        assert!(validate_args(&schema(), &json!({"order_id": "o-1", "amount": 12.5, "mode": "full"})).is_ok());
    }

    #[test]
    fn test_missing_required() {
        let err = validate_args(&schema(), &json!({"amount": 1})).unwrap_err();
        assert!(err.contains("order_id"));
    }

    #[test]
    fn test_wrong_types() {
        assert!(validate_args(&schema(), &json!("not an object")).is_err());
        let err = validate_args(&schema(), &json!({"order_id": 5})).unwrap_err();
        assert!(err.contains("args.order_id"));
        let err = validate_args(&schema(), &json!({"order_id": "x", "tags": ["a", 1]})).unwrap_err();
        assert!(err.contains("tags[1]"));
        assert!(validate_args(&schema(), &json!({"order_id": "x", "mode": "half"})).is_err());
    }

    #[test]
    fn test_schema_json_mentions_fields() {
        assert!(tool_call_schema_json().contains("\"tool\""));
        assert!(final_answer_schema_json().contains("final_answer"));
    }
}
