//! 引擎构建器：统一的引擎初始化逻辑
//!
//! 守护进程、HTTP 服务与测试共用同一套装配：配置 → 存储 → LLM → 工具 → 记忆 → 事件 → Engine。
//! 未显式提供的组件按配置创建（存储默认进程内，LLM 按 provider 选择，工具为内置注册表）。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::agent::{AgentConfig, AgentRegistry};
use crate::config::{AppConfig, StoreSection};
use crate::core::orchestrator::{create_llm_from_config, EngineInner};
use crate::core::{AgentError, Engine, ExecutionSupervisor, RecoveryEngine, TaskScheduler};
use crate::events::{BroadcastEventBus, EventSink, FanoutEventSink, WebhookEventSink};
use crate::llm::{LlmClient, ModelGateway};
use crate::memory::{KeywordRecencyRanker, MemoryManager, RelevanceRanker};
use crate::react::StepController;
use crate::store::{InMemoryStore, Store};
use crate::tools::{builtin_registry, default_timeout, RiskClassifier, Tool, ToolDispatcher, ToolRegistry};
use crate::usage::UsageMeter;

/// 按配置打开存储后端
pub async fn open_store(cfg: &StoreSection) -> Result<Arc<dyn Store>, AgentError> {
    match cfg.backend.as_str() {
        "memory" => Ok(Arc::new(InMemoryStore::new())),
        #[cfg(feature = "async-sqlite")]
        "sqlite" => {
            if let Some(parent) = cfg.sqlite_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| AgentError::Config(format!("cannot create {}: {e}", parent.display())))?;
                }
            }
            let store = crate::store::SqliteStore::open(&cfg.sqlite_path).await?;
            tracing::info!(path = %cfg.sqlite_path.display(), "sqlite store opened");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "async-sqlite"))]
        "sqlite" => Err(AgentError::Config(
            "sqlite backend requires the async-sqlite feature".into(),
        )),
        other => Err(AgentError::Config(format!("unknown store backend: {other}"))),
    }
}

/// 引擎构建器
pub struct EngineBuilder {
    config: AppConfig,
    agents: AgentRegistry,
    store: Option<Arc<dyn Store>>,
    llm: Option<Arc<dyn LlmClient>>,
    registry: Option<ToolRegistry>,
    classifier: Option<Arc<dyn RiskClassifier>>,
    ranker: Option<Arc<dyn RelevanceRanker>>,
    recovery: Option<RecoveryEngine>,
    sinks: Vec<Arc<dyn EventSink>>,
    shutdown: CancellationToken,
}

impl EngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            agents: AgentRegistry::new(),
            store: None,
            llm: None,
            registry: None,
            classifier: None,
            ranker: None,
            recovery: None,
            sinks: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_agents(mut self, agents: AgentRegistry) -> Self {
        self.agents = agents;
        self
    }

    pub fn with_agent(mut self, agent: AgentConfig) -> Self {
        self.agents.insert(agent);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// 替换整个工具注册表
    pub fn with_tools(mut self, registry: ToolRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// 在内置工具之外追加一个工具
    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.registry
            .get_or_insert_with(|| builtin_registry(&self.config.tools))
            .register(tool);
        self
    }

    pub fn with_risk_classifier(mut self, classifier: Arc<dyn RiskClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_ranker(mut self, ranker: Arc<dyn RelevanceRanker>) -> Self {
        self.ranker = Some(ranker);
        self
    }

    /// 覆盖模型调用的重试参数（测试中用于缩短退避）
    pub fn with_recovery(mut self, recovery: RecoveryEngine) -> Self {
        self.recovery = Some(recovery);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// 关闭令牌取消后引擎拒绝新的触发，排队中的 Execution 不再被认领
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn build(self) -> Engine {
        let cfg = self.config;
        let store = self.store.unwrap_or_else(|| Arc::new(InMemoryStore::new()));
        let llm = self.llm.unwrap_or_else(|| create_llm_from_config(&cfg));

        let meter = Arc::new(UsageMeter::new(cfg.usage.pricing));
        for agent in self.agents.all() {
            if let Some(quota) = &agent.quota {
                meter.configure(&agent.id, quota);
            }
        }

        let recovery = self.recovery.unwrap_or_else(|| cfg.llm.retry.recovery_engine());
        let gateway = Arc::new(
            ModelGateway::new(llm, meter.clone())
                .with_recovery(recovery)
                .with_max_parse_retries(cfg.llm.max_parse_retries)
                .with_max_call_timeout(Duration::from_secs(cfg.llm.timeouts.request.max(1))),
        );

        let registry = self.registry.unwrap_or_else(|| builtin_registry(&cfg.tools));
        tracing::debug!(tools = ?registry.tool_names(), "tool registry ready");
        let mut dispatcher = ToolDispatcher::new(Arc::new(registry), default_timeout(&cfg.tools));
        if let Some(classifier) = self.classifier {
            dispatcher = dispatcher.with_classifier(classifier);
        }

        let ranker = self.ranker.unwrap_or_else(|| {
            Arc::new(KeywordRecencyRanker {
                half_life_days: cfg.memory.half_life_days,
            })
        });
        let memory = Arc::new(MemoryManager::new(store.clone()).with_ranker(ranker));

        let bus = BroadcastEventBus::new(cfg.events.broadcast_capacity);
        let mut fanout = FanoutEventSink::new().with(Arc::new(bus.clone()));
        if let Some(url) = &cfg.events.webhook_url {
            fanout = fanout.with(Arc::new(WebhookEventSink::new(url.clone())));
        }
        for sink in self.sinks {
            fanout = fanout.with(sink);
        }
        let events: Arc<dyn EventSink> = Arc::new(fanout);

        let controller = StepController::new(store.clone(), gateway, Arc::new(dispatcher))
            .with_memory(memory.clone())
            .with_events(events.clone());
        let approvals = controller.approvals().clone();

        tracing::info!(
            agents = self.agents.len(),
            workers = cfg.engine.max_concurrent_executions,
            "engine built"
        );

        Engine::from_parts(EngineInner {
            agents: self.agents,
            store,
            controller,
            approvals,
            memory,
            meter,
            scheduler: TaskScheduler::new(cfg.engine.max_concurrent_executions),
            supervisor: ExecutionSupervisor::new(CancellationToken::new()),
            bus,
            events,
            shutdown: self.shutdown,
            stale_approval_age: Duration::from_secs(cfg.engine.stale_approval_secs),
        })
    }
}
