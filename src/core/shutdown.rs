//! 优雅关闭
//!
//! Ctrl+C / SIGTERM 触发关闭令牌：引擎停止接收新触发、不再认领排队中的 Execution，
//! 然后在超时内等待 worker 池清空。超时仍在运行的 Execution 保持 running，下次启动时由恢复流程接管。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::core::TaskScheduler;

/// 关闭原因
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    FatalError(String),
}

/// 关闭信号
#[derive(Clone)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 关闭令牌：交给引擎与各后台任务
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        let _ = self.reason_tx.send(reason);
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 安装 Ctrl+C 与 SIGTERM 处理
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("received Ctrl+C, shutting down");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("received SIGTERM, shutting down");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

/// 等待运行中的 worker 退出，然后关闭 worker 池
pub struct WorkerDrain {
    scheduler: TaskScheduler,
}

impl WorkerDrain {
    pub fn new(scheduler: TaskScheduler) -> Self {
        Self { scheduler }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for WorkerDrain {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.scheduler.drain().await;
        self.scheduler.close();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "worker-drain"
    }
}

/// 按注册顺序执行清理，每个任务单独限时
pub struct ShutdownCoordinator {
    tasks: Vec<Arc<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            tasks: Vec::new(),
            timeout,
        }
    }

    pub fn register(&mut self, task: impl ShutdownCleanup + 'static) {
        self.tasks.push(Arc::new(task));
    }

    pub async fn run_cleanup(&self) {
        for task in &self.tasks {
            match tokio::time::timeout(self.timeout, task.cleanup()).await {
                Ok(Ok(())) => tracing::info!(task = task.name(), "cleanup done"),
                Ok(Err(e)) => tracing::warn!(task = task.name(), error = %e, "cleanup failed"),
                Err(_) => tracing::warn!(
                    task = task.name(),
                    timeout_secs = self.timeout.as_secs(),
                    "cleanup timed out"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_shutdown_cancels_token() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!manager.is_shutdown());
        manager.shutdown(ShutdownReason::UserInitiated);
        assert!(token.is_cancelled());
    }

    struct Flag(Arc<AtomicBool>);

    #[async_trait::async_trait]
    impl ShutdownCleanup for Flag {
        async fn cleanup(&self) -> anyhow::Result<()> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "flag"
        }
    }

    #[tokio::test]
    async fn test_coordinator_runs_tasks() {
        let called = Arc::new(AtomicBool::new(false));
        let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        coordinator.register(WorkerDrain::new(TaskScheduler::new(2)));
        coordinator.register(Flag(called.clone()));
        coordinator.run_cleanup().await;
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_drain_waits_for_worker() {
        let scheduler = TaskScheduler::new(1);
        let permit = scheduler.acquire_worker().await.unwrap();
        let drain = WorkerDrain::new(scheduler.clone());
        let handle = tokio::spawn(async move { drain.cleanup().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        drop(permit);
        handle.await.unwrap().unwrap();
    }
}
