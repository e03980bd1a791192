//! Agent 定义与注册表
//!
//! 每个 Agent 是 config/agents/ 下的一个 TOML 文件（顶层 `[agent]` 表）：模型与参数、系统指令、
//! 允许的工具、记忆策略、风险策略、步数与超时限制、触发器绑定、可选 token 配额。
//! 引擎只读取配置；执行开始时取一份 Arc 快照，之后的修改不影响进行中的 Execution。

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::llm::ModelParams;
use crate::memory::MemoryPolicy;
use crate::tools::RiskPolicy;
use crate::usage::QuotaConfig;

/// 模型选择与参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// 上下文窗口（token）
    #[serde(default = "default_context_window")]
    pub context_window: usize,
}

fn default_model() -> String {
    crate::llm::DEEPSEEK_CHAT.to_string()
}

fn default_temperature() -> f32 {
    ModelParams::default().temperature
}

fn default_max_tokens() -> u32 {
    ModelParams::default().max_tokens
}

fn default_context_window() -> usize {
    32_000
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            context_window: default_context_window(),
        }
    }
}

impl ModelConfig {
    pub fn params(&self) -> ModelParams {
        ModelParams {
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

/// 步数与超时限制
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentLimits {
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    /// 整个 Execution 的活跃时长上限（不含等待审批）
    #[serde(default = "default_execution_timeout_secs")]
    pub execution_timeout_secs: u64,
    #[serde(default = "default_model_call_timeout_secs")]
    pub model_call_timeout_secs: u64,
}

fn default_max_steps() -> u32 {
    10
}

fn default_execution_timeout_secs() -> u64 {
    300
}

fn default_model_call_timeout_secs() -> u64 {
    60
}

impl Default for AgentLimits {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            execution_timeout_secs: default_execution_timeout_secs(),
            model_call_timeout_secs: default_model_call_timeout_secs(),
        }
    }
}

impl AgentLimits {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn model_call_timeout(&self) -> Duration {
        Duration::from_secs(self.model_call_timeout_secs.max(1))
    }
}

/// 触发器绑定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerBindings {
    /// 事件类型模式（glob，如 `order.*`）
    #[serde(default)]
    pub events: Vec<String>,
    /// cron 表达式（tokio-cron-scheduler 语法，含秒）
    #[serde(default)]
    pub schedule: Option<String>,
    /// 定时触发时的输入
    #[serde(default)]
    pub schedule_input: Option<serde_json::Value>,
    #[serde(default = "default_true")]
    pub manual: bool,
    #[serde(default)]
    pub webhook: bool,
}

fn default_true() -> bool {
    true
}

impl Default for TriggerBindings {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            schedule: None,
            schedule_input: None,
            manual: true,
            webhook: false,
        }
    }
}

impl TriggerBindings {
    /// 事件类型是否命中任一模式；非法模式按字面量比较
    pub fn matches_event(&self, event_type: &str) -> bool {
        self.events.iter().any(|pattern| match glob::Pattern::new(pattern) {
            Ok(p) => p.matches(event_type),
            Err(_) => pattern == event_type,
        })
    }
}

/// Agent 配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default, alias = "system_instructions")]
    pub instructions: String,
    /// 允许调用的工具（空表示不允许任何工具）
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub memory: MemoryPolicy,
    #[serde(default)]
    pub risk: RiskPolicy,
    #[serde(default)]
    pub limits: AgentLimits,
    #[serde(default)]
    pub triggers: TriggerBindings,
    #[serde(default)]
    pub quota: Option<QuotaConfig>,
}

#[derive(Deserialize)]
struct AgentFile {
    agent: AgentConfig,
}

impl AgentConfig {
    pub fn new(id: impl Into<String>, instructions: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            model: ModelConfig::default(),
            instructions: instructions.into(),
            allowed_tools: Vec::new(),
            memory: MemoryPolicy::default(),
            risk: RiskPolicy::default(),
            limits: AgentLimits::default(),
            triggers: TriggerBindings::default(),
            quota: None,
        }
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.limits.max_steps = max_steps;
        self
    }

    pub fn allows_tool(&self, name: &str) -> bool {
        self.allowed_tools.iter().any(|t| t == name)
    }

    /// 解析 `[agent]` 表
    pub fn from_toml_str(content: &str) -> Result<Self, AgentError> {
        let file: AgentFile = toml::from_str(content).map_err(|e| AgentError::Config(e.to_string()))?;
        let mut agent = file.agent;
        if agent.name.is_empty() {
            agent.name = agent.id.clone();
        }
        agent.validate()?;
        Ok(agent)
    }

    pub fn load(path: &Path) -> Result<Self, AgentError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content).map_err(|e| AgentError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.id.trim().is_empty() {
            return Err(AgentError::Config("agent id must not be empty".into()));
        }
        if self.limits.max_steps == 0 {
            return Err(AgentError::Config(format!("agent {}: max_steps must be at least 1", self.id)));
        }
        if self.memory.token_budget.is_none() && self.model.context_window <= self.model.max_tokens as usize {
            return Err(AgentError::Config(format!(
                "agent {}: context_window must exceed max_tokens",
                self.id
            )));
        }
        for pattern in &self.triggers.events {
            glob::Pattern::new(pattern)
                .map_err(|e| AgentError::Config(format!("agent {}: bad event pattern {pattern}: {e}", self.id)))?;
        }
        Ok(())
    }
}

/// Agent 注册表（只读快照）
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<AgentConfig>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, agent: AgentConfig) {
        self.agents.insert(agent.id.clone(), Arc::new(agent));
    }

    pub fn get(&self, id: &str) -> Option<Arc<AgentConfig>> {
        self.agents.get(id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<AgentConfig>> {
        let mut agents: Vec<_> = self.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// 加载目录下所有 *.toml；单个文件解析失败只记录警告
    pub fn load_dir(dir: &Path) -> Result<Self, AgentError> {
        let pattern = dir.join("*.toml");
        let pattern = pattern.to_string_lossy();
        let paths = glob::glob(&pattern).map_err(|e| AgentError::Config(e.to_string()))?;

        let mut registry = Self::new();
        for path in paths.flatten() {
            match AgentConfig::load(&path) {
                Ok(agent) => {
                    if registry.agents.contains_key(&agent.id) {
                        tracing::warn!(agent_id = %agent.id, path = %path.display(), "duplicate agent id, keeping first");
                        continue;
                    }
                    tracing::info!(agent_id = %agent.id, path = %path.display(), "agent loaded");
                    registry.insert(agent);
                }
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping invalid agent file"),
            }
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::RiskLevel;
    use crate::usage::QuotaPolicy;

    const SUPPORT: &str = r#"
[agent]
id = "support"
name = "Support"
system_instructions = "You answer customer questions."
allowed_tools = ["echo", "http_request"]

[agent.model]
model = "deepseek-chat"
max_tokens = 512
context_window = 8000

[agent.limits]
max_steps = 5

[agent.risk]
default_threshold = "medium"
amount_threshold = 100.0

[agent.risk.per_tool]
echo = "critical"

[agent.triggers]
events = ["order.*", "ticket.created"]
schedule = "0 0 9 * * *"

[agent.quota]
limit_tokens = 50000
policy = { kind = "soft_overage", multiplier = 1.5 }
"#;

    #[test]
    fn test_parse_agent_file() {
        let agent = AgentConfig::from_toml_str(SUPPORT).unwrap();
        assert_eq!(agent.id, "support");
        assert_eq!(agent.instructions, "You answer customer questions.");
        assert!(agent.allows_tool("echo"));
        assert!(!agent.allows_tool("shell"));
        assert_eq!(agent.model.params().max_tokens, 512);
        assert_eq!(agent.limits.max_steps, 5);
        assert_eq!(agent.limits.execution_timeout_secs, 300);
        assert_eq!(agent.risk.default_threshold, RiskLevel::Medium);
        assert_eq!(agent.risk.per_tool.get("echo"), Some(&RiskLevel::Critical));
        let quota = agent.quota.unwrap();
        assert_eq!(quota.policy, QuotaPolicy::SoftOverage { multiplier: 1.5 });
        assert!(agent.memory.long_term);
    }

    #[test]
    fn test_event_patterns() {
        let agent = AgentConfig::from_toml_str(SUPPORT).unwrap();
        assert!(agent.triggers.matches_event("order.created"));
        assert!(agent.triggers.matches_event("ticket.created"));
        assert!(!agent.triggers.matches_event("ticket.closed"));
    }

    #[test]
    fn test_rejects_invalid() {
        assert!(AgentConfig::from_toml_str("[agent]\nid = \"\"").is_err());
        assert!(AgentConfig::from_toml_str("[agent]\nid = \"a\"\n[agent.limits]\nmax_steps = 0").is_err());
        assert!(AgentConfig::from_toml_str("not toml [").is_err());
    }

    #[test]
    fn test_load_dir_skips_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("support.toml"), SUPPORT).unwrap();
        std::fs::write(dir.path().join("broken.toml"), "[agent]\nname = \"no id\"").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let registry = AgentRegistry::load_dir(dir.path()).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get("support").is_some());
    }
}
