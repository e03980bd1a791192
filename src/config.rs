//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__LLM__PROVIDER=openai`）。
//! 所有字段都有默认值，空文件也能启动（Mock 模型 + 内存存储）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::RecoveryEngine;
use crate::usage::Pricing;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub engine: EngineSection,
    pub tools: ToolsSection,
    pub memory: MemorySection,
    pub usage: UsageSection,
    pub store: StoreSection,
    pub events: EventsSection,
    pub server: ServerSection,
}

/// [app] 段：名称与 Agent 定义目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// Agent 定义目录（每个 *.toml 一个 [agent]）
    pub agents_dir: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "hive".to_string(),
            agents_dir: PathBuf::from("config/agents"),
        }
    }
}

/// [llm] 段：后端选择、超时与重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock；未配置 API Key 时回退到 mock
    pub provider: String,
    pub base_url: Option<String>,
    /// 读取 API Key 的环境变量名；缺省按 provider 取 DEEPSEEK_API_KEY / OPENAI_API_KEY
    pub api_key_env: Option<String>,
    pub timeouts: LlmTimeoutsSection,
    pub retry: LlmRetrySection,
    /// 输出无法解析时网关内部重问次数
    pub max_parse_retries: u32,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "deepseek".to_string(),
            base_url: None,
            api_key_env: None,
            timeouts: LlmTimeoutsSection::default(),
            retry: LlmRetrySection::default(),
            max_parse_retries: crate::llm::DEFAULT_MAX_PARSE_RETRIES,
        }
    }
}

impl LlmSection {
    pub fn api_key_var(&self) -> String {
        self.api_key_env.clone().unwrap_or_else(|| match self.provider.as_str() {
            "openai" => "OPENAI_API_KEY".to_string(),
            _ => "DEEPSEEK_API_KEY".to_string(),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 单次模型调用超时上限（秒），Agent 的 model_call_timeout_secs 超过时被截断
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { request: 60 }
    }
}

/// [llm.retry] 段：可重试错误的指数退避
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmRetrySection {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for LlmRetrySection {
    fn default() -> Self {
        Self {
            max_retries: crate::core::recovery::MAX_RETRIES,
            base_delay_ms: crate::core::recovery::BASE_RETRY_DELAY_MS,
            max_delay_ms: crate::core::recovery::MAX_RETRY_DELAY_MS,
        }
    }
}

impl LlmRetrySection {
    pub fn recovery_engine(&self) -> RecoveryEngine {
        RecoveryEngine::new(
            self.max_retries,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

/// [engine] 段：并发与运维参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// 同时运行的 Execution 上限（worker 信号量）
    pub max_concurrent_executions: usize,
    /// 待审批超过该时长（秒）记为 stale
    pub stale_approval_secs: u64,
    pub stale_check_interval_secs: u64,
    /// 启动时重新入队 queued / running 的 Execution
    pub recover_on_start: bool,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_concurrent_executions: 8,
            stale_approval_secs: 3600,
            stale_check_interval_secs: 300,
            recover_on_start: true,
        }
    }
}

/// [tools] 段：工具超时与 http_request 白名单
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒），工具可自行覆盖
    pub tool_timeout_secs: u64,
    pub http: HttpSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
            http: HttpSection::default(),
        }
    }
}

/// [tools.http] 段：请求超时、最大字符数、允许的域名
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    pub timeout_secs: u64,
    pub max_result_chars: usize,
    pub allowed_domains: Vec<String>,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            timeout_secs: 15,
            max_result_chars: 8000,
            allowed_domains: vec![
                "api.github.com".into(),
                "raw.githubusercontent.com".into(),
                "docs.rs".into(),
                "crates.io".into(),
                "en.wikipedia.org".into(),
                "zh.wikipedia.org".into(),
            ],
        }
    }
}

/// [memory] 段：长期记忆排序
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    /// 时间衰减半衰期（天）
    pub half_life_days: f64,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self { half_life_days: 30.0 }
    }
}

/// [usage] 段：单价与配额同步
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UsageSection {
    pub pricing: Pricing,
    /// 配额对账间隔（秒）
    pub reconcile_interval_secs: u64,
    /// 权威配额地址：GET {url}/{agent_id}，未设置则只用本地计数
    pub quota_source_url: Option<String>,
}

impl Default for UsageSection {
    fn default() -> Self {
        Self {
            pricing: Pricing::default(),
            reconcile_interval_secs: 60,
            quota_source_url: None,
        }
    }
}

/// [store] 段：memory / sqlite
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub backend: String,
    pub sqlite_path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            sqlite_path: PathBuf::from("data/hive.db"),
        }
    }
}

/// [events] 段：生命周期事件
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventsSection {
    pub broadcast_capacity: usize,
    /// 可选：把事件 POST 到该地址
    pub webhook_url: Option<String>,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            webhook_url: None,
        }
    }
}

/// [server] 段：HTTP API 监听地址
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl ServerSection {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
