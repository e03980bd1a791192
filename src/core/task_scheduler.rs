//! 任务调度：Execution worker 池
//!
//! 每个 Execution 一个 tokio 任务，运行前先从 Semaphore 取得许可，限制同时运行的 Execution 数量。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::core::AgentError;

/// worker 池
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    workers: Arc<Semaphore>,
    max_workers: usize,
}

impl TaskScheduler {
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            workers: Arc::new(Semaphore::new(max_workers)),
            max_workers,
        }
    }

    /// 等待一个 worker 许可
    pub async fn acquire_worker(&self) -> Result<OwnedSemaphorePermit, AgentError> {
        self.workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AgentError::Config("worker pool closed".into()))
    }

    pub fn available(&self) -> usize {
        self.workers.available_permits()
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// 等待所有 worker 退出（取走全部许可后立即归还）
    pub async fn drain(&self) {
        if let Ok(all) = self.workers.acquire_many(self.max_workers as u32).await {
            drop(all);
        }
    }

    /// 关闭后不再发放许可
    pub fn close(&self) {
        self.workers.close();
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_permits_bound_concurrency() {
        let scheduler = TaskScheduler::new(2);
        let a = scheduler.acquire_worker().await.unwrap();
        let _b = scheduler.acquire_worker().await.unwrap();
        assert_eq!(scheduler.available(), 0);
        drop(a);
        assert_eq!(scheduler.available(), 1);
    }

    #[tokio::test]
    async fn test_closed_pool_errors() {
        let scheduler = TaskScheduler::new(1);
        scheduler.close();
        assert!(scheduler.acquire_worker().await.is_err());
    }
}
