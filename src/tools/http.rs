//! http_request 工具：域名白名单、超时、结果大小限制
//!
//! 仅允许配置中的域名；GET 视为只读，其它方法对外部系统产生副作用（默认需要审批）。
//! 响应超过 max_result_chars 时截断并追加 ...[truncated]。

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;

use crate::tools::{RiskLevel, Tool, ToolCategory};

const USER_AGENT: &str = concat!("hive/", env!("CARGO_PKG_VERSION"));

/// 从 URL 中提取 host（去掉端口与路径）
fn extract_domain(url: &str) -> Option<String> {
    let url = url.trim();
    let rest = url.strip_prefix("https://").or_else(|| url.strip_prefix("http://"))?;
    let host = rest.split(['/', '?', '#']).next()?;
    let host = host.rsplit('@').next()?;
    let host = host.split(':').next()?;
    (!host.is_empty()).then(|| host.to_lowercase())
}

fn parse_method(args: &Value) -> Result<Method, String> {
    let raw = args.get("method").and_then(Value::as_str).unwrap_or("GET");
    match raw.to_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "PATCH" => Ok(Method::PATCH),
        "DELETE" => Ok(Method::DELETE),
        other => Err(format!("unsupported method: {other}")),
    }
}

pub struct HttpRequestTool {
    client: Client,
    allowed_domains: HashSet<String>,
    max_result_chars: usize,
    timeout: Duration,
}

impl HttpRequestTool {
    pub fn new(allowed_domains: Vec<String>, timeout_secs: u64, max_result_chars: usize) -> Self {
        let timeout = Duration::from_secs(timeout_secs.max(1));
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            allowed_domains: allowed_domains.into_iter().map(|s| s.to_lowercase()).collect(),
            max_result_chars,
            timeout,
        }
    }

    fn check_allowed(&self, url: &str) -> Result<(), String> {
        let domain = extract_domain(url).ok_or_else(|| "invalid or missing url".to_string())?;
        if self.allowed_domains.contains(&domain) {
            Ok(())
        } else {
            Err(format!("domain not in allowlist: {domain}"))
        }
    }

    fn truncate(&self, body: String) -> String {
        if body.chars().count() > self.max_result_chars {
            body.chars().take(self.max_result_chars).collect::<String>() + "\n...[truncated]"
        } else {
            body
        }
    }
}

#[async_trait]
impl Tool for HttpRequestTool {
    fn name(&self) -> &str {
        "http_request"
    }

    fn description(&self) -> &str {
        "Send an HTTP request to an allow-listed domain. Args: {\"url\": \"https://...\", \"method\": \"GET\", \"body\": {...}}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": { "type": "string" },
                "method": { "type": "string", "enum": ["GET", "POST", "PUT", "PATCH", "DELETE", "get", "post", "put", "patch", "delete"] },
                "body": { "type": ["object", "array", "string", "null"] }
            },
            "required": ["url"]
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::External
    }

    fn refine_risk(&self, args: &Value) -> Option<RiskLevel> {
        match parse_method(args) {
            Ok(Method::GET) => Some(RiskLevel::Low),
            Ok(Method::DELETE) => Some(RiskLevel::Critical),
            _ => None,
        }
    }

    fn timeout(&self) -> Option<Duration> {
        // 留出 1 秒给连接建立之外的开销
        Some(self.timeout + Duration::from_secs(1))
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let url = args.get("url").and_then(Value::as_str).unwrap_or("").trim();
        self.check_allowed(url)?;
        let method = parse_method(&args)?;
        tracing::info!(url = %url, method = %method, "http_request tool");

        let mut request = self.client.request(method, url);
        match args.get("body") {
            Some(Value::String(s)) => request = request.body(s.clone()),
            Some(Value::Null) | None => {}
            Some(body) => request = request.json(body),
        }

        let resp = request.send().await.map_err(|e| format!("request failed: {e}"))?;
        let status = resp.status();
        let body = resp.text().await.map_err(|e| format!("read body: {e}"))?;
        let body = body.strip_prefix('\u{FEFF}').map(str::to_string).unwrap_or(body);
        if !status.is_success() {
            return Err(format!("HTTP {}: {}", status, self.truncate(body)));
        }
        Ok(self.truncate(body))
    }
}
