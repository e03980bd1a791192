//! 模型输出解析：结构化 Tool Call 与纯文本 JSON 回退
//!
//! 约定的文本协议：
//! - 工具调用：`{"tool": "名称", "args": {...}}`（也接受 `name` / `arguments`）
//! - 最终回答：`{"final_answer": "..."}`，或不含 JSON 的纯文本
//!
//! 空输出、只有残缺 JSON 或缺少 tool / final_answer 字段的 JSON 视为无法解析，由网关重新询问；
//! 正文里引用的 JSON 片段或普通花括号不影响纯文本回答。

use serde_json::Value;

use crate::core::ToolCall;
use crate::llm::LlmOutput;

/// 解析后的模型响应
#[derive(Debug, Clone, PartialEq)]
pub enum ModelResponse {
    FinalAnswer(String),
    ToolCall(ToolCall),
}

/// 解析模型输出；结构化 tool_call 优先，其次解析文本
pub fn parse_model_output(output: &LlmOutput) -> Result<ModelResponse, String> {
    if let Some(call) = &output.tool_call {
        if call.name.trim().is_empty() {
            return Err("structured tool call has an empty name".to_string());
        }
        return Ok(ModelResponse::ToolCall(call.clone()));
    }
    parse_text(&output.content)
}

/// 从文本中提取 JSON（```json 块或首尾花括号），无 JSON 则视为最终回答
///
/// 花括号外还有正文时，取出的片段若不是协议 JSON（解析失败或缺少 tool / final_answer），
/// 整段文本按纯文本最终回答处理；整段输出只有 JSON 时才算无法解析。
pub fn parse_text(text: &str) -> Result<ModelResponse, String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("empty response".to_string());
    }

    let (json_str, has_prose) = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        let (block, after) = match rest.find("```") {
            Some(end) => (rest[..end].trim(), rest[end + 3..].trim()),
            None => (rest.trim(), ""),
        };
        (block, !trimmed[..start].trim().is_empty() || !after.is_empty())
    } else if let Some(start) = trimmed.find('{') {
        match trimmed.rfind('}') {
            Some(end) if end > start => (
                &trimmed[start..=end],
                start > 0 || end + 1 < trimmed.len(),
            ),
            _ if start == 0 => return Err(format!("unterminated JSON object: {}", preview(trimmed))),
            _ => return Ok(ModelResponse::FinalAnswer(trimmed.to_string())),
        }
    } else {
        return Ok(ModelResponse::FinalAnswer(trimmed.to_string()));
    };

    let parsed = serde_json::from_str::<Value>(json_str)
        .map_err(|e| format!("{}: {}", e, preview(json_str)))
        .and_then(|value| interpret(&value));
    match parsed {
        Ok(response) => Ok(response),
        Err(_) if has_prose && !mentions_protocol(json_str) => {
            Ok(ModelResponse::FinalAnswer(trimmed.to_string()))
        }
        Err(e) => Err(e),
    }
}

/// 片段是否在尝试协议格式（残缺的工具调用 / 最终回答仍应重问）
fn mentions_protocol(json_str: &str) -> bool {
    ["\"tool\"", "\"final_answer\""]
        .iter()
        .any(|key| json_str.contains(key))
}

fn interpret(value: &Value) -> Result<ModelResponse, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| "expected a JSON object".to_string())?;

    if let Some(answer) = obj.get("final_answer").or_else(|| obj.get("answer")) {
        let answer = match answer {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if answer.trim().is_empty() {
            return Err("final_answer is empty".to_string());
        }
        return Ok(ModelResponse::FinalAnswer(answer));
    }

    let name = obj
        .get("tool")
        .or_else(|| obj.get("name"))
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if name.is_empty() {
        return Err("JSON has neither \"tool\" nor \"final_answer\"".to_string());
    }
    let arguments = obj
        .get("args")
        .or_else(|| obj.get("arguments"))
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));

    Ok(ModelResponse::ToolCall(ToolCall {
        name: name.to_string(),
        arguments,
    }))
}

fn preview(s: &str) -> String {
    s.chars().take(120).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_tool_call_json() {
        let out = parse_text(r#"{"tool": "echo", "args": {"text": "hi"}}"#).unwrap();
        assert_eq!(
            out,
            ModelResponse::ToolCall(ToolCall {
                name: "echo".into(),
                arguments: json!({"text": "hi"})
            })
        );
    }

    #[test]
    fn test_parse_fenced_block() {
        let text = "I will look it up.\n```json\n{\"name\": \"current_time\", \"arguments\": {}}\n```";
        match parse_text(text).unwrap() {
            ModelResponse::ToolCall(call) => assert_eq!(call.name, "current_time"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_final_answer() {
        assert_eq!(
            parse_text(r#"{"final_answer": "42"}"#).unwrap(),
            ModelResponse::FinalAnswer("42".into())
        );
        assert_eq!(
            parse_text("The answer is 42.").unwrap(),
            ModelResponse::FinalAnswer("The answer is 42.".into())
        );
    }

    #[test]
    fn test_unparseable() {
        assert!(parse_text("").is_err());
        assert!(parse_text("   ").is_err());
        assert!(parse_text(r#"{"tool": "echo", "args": "#).is_err());
        assert!(parse_text(r#"{"thought": "hmm"}"#).is_err());
        assert!(parse_text(r#"{"final_answer": ""}"#).is_err());
    }

    #[test]
    fn test_prose_with_braces_is_final_answer() {
        let placeholder = "Use the placeholder {name} in your email template.";
        assert_eq!(
            parse_text(placeholder).unwrap(),
            ModelResponse::FinalAnswer(placeholder.into())
        );

        let config = r#"Here is the config you asked for: {"retries": 3}"#;
        assert_eq!(parse_text(config).unwrap(), ModelResponse::FinalAnswer(config.into()));

        let fenced = "Sample payload:\n```json\n{\"id\": 7}\n```";
        assert_eq!(parse_text(fenced).unwrap(), ModelResponse::FinalAnswer(fenced.into()));

        let open_brace = "Wrap the block in { and close it later.";
        assert_eq!(
            parse_text(open_brace).unwrap(),
            ModelResponse::FinalAnswer(open_brace.into())
        );
    }

    #[test]
    fn test_broken_protocol_json_inside_prose_is_unparseable() {
        assert!(parse_text(r#"Calling it now: {"tool": "echo", "args": {"text": }"#).is_err());
        assert!(parse_text(r#"{"retries": 3}"#).is_err());
    }

    #[test]
    fn test_structured_call_wins() {
        let output = LlmOutput {
            content: "ignored".into(),
            tool_call: Some(ToolCall {
                name: "echo".into(),
                arguments: json!({}),
            }),
            ..Default::default()
        };
        assert!(matches!(parse_model_output(&output).unwrap(), ModelResponse::ToolCall(_)));
    }
}
