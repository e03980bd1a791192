//! 守护进程装配：配置 → Agent → 存储 → 引擎 → 恢复 → 定时触发 → 后台任务 → 优雅关闭
//!
//! `hive` 与 `hive-web` 两个二进制共用。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::agent::AgentRegistry;
use crate::config::{load_config, AppConfig};
use crate::core::{open_store, Engine, EngineBuilder, ShutdownCoordinator, ShutdownManager, WorkerDrain};
use crate::trigger::CronTriggers;
use crate::usage::{spawn_reconciler, HttpQuotaSource};

/// 关闭时等待 worker 的上限
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Daemon {
    config: AppConfig,
    engine: Engine,
    shutdown: Arc<ShutdownManager>,
    cron: CronTriggers,
    background: Vec<tokio::task::JoinHandle<()>>,
}

impl Daemon {
    /// 装配并启动全部组件，安装 Ctrl+C / SIGTERM 处理
    pub async fn start(config_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let config = load_config(config_path).context("Failed to load config")?;

        let agents = AgentRegistry::load_dir(&config.app.agents_dir)
            .with_context(|| format!("Failed to load agents from {}", config.app.agents_dir.display()))?;
        if agents.is_empty() {
            tracing::warn!(dir = %config.app.agents_dir.display(), "no agents defined");
        }

        let store = open_store(&config.store).await.context("Failed to open store")?;

        let shutdown = Arc::new(ShutdownManager::new());
        shutdown.install_signal_handlers();

        let engine = EngineBuilder::new(config.clone())
            .with_agents(agents)
            .with_store(store)
            .with_shutdown_token(shutdown.token())
            .build();

        if config.engine.recover_on_start {
            engine.recover().await.context("Failed to recover executions")?;
        }

        let mut cron = CronTriggers::new(engine.clone());
        cron.start().await.context("Failed to start cron triggers")?;

        let mut background = vec![engine.spawn_stale_watcher(
            Duration::from_secs(config.engine.stale_check_interval_secs.max(1)),
            shutdown.token(),
        )];
        if let Some(url) = &config.usage.quota_source_url {
            background.push(spawn_reconciler(
                engine.meter().clone(),
                Arc::new(HttpQuotaSource::new(url.clone())),
                Duration::from_secs(config.usage.reconcile_interval_secs.max(1)),
                shutdown.token(),
            ));
            tracing::info!(url = %url, "quota reconciler started");
        }

        tracing::info!(
            name = %config.app.name,
            agents = engine.agents().len(),
            store = %config.store.backend,
            cron_jobs = cron.job_count(),
            "daemon started"
        );

        Ok(Self {
            config,
            engine,
            shutdown,
            cron,
            background,
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn shutdown_manager(&self) -> Arc<ShutdownManager> {
        Arc::clone(&self.shutdown)
    }

    /// 阻塞到关闭信号，然后停止定时触发、等待 worker 退出
    pub async fn run_until_shutdown(mut self) {
        self.shutdown.wait_for_shutdown().await;
        tracing::info!("shutting down");

        self.cron.shutdown().await;

        let mut coordinator = ShutdownCoordinator::new(DRAIN_TIMEOUT);
        coordinator.register(WorkerDrain::new(self.engine.scheduler().clone()));
        coordinator.run_cleanup().await;

        for handle in self.background {
            let _ = handle.await;
        }
        tracing::info!("daemon stopped");
    }
}
