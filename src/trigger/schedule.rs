//! 定时触发：为声明了 `schedule` 的 Agent 注册 cron 任务（tokio-cron-scheduler，6 段含秒）

use serde_json::Value;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::core::{Engine, TriggerSource};

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("scheduler init failed: {0}")]
    Init(String),
    #[error("invalid schedule for agent {0}: {1}")]
    InvalidSchedule(String, String),
    #[error("job add failed for agent {0}: {1}")]
    JobAdd(String, String),
    #[error("scheduler start failed: {0}")]
    Start(String),
}

/// 全部 cron 触发任务
pub struct CronTriggers {
    engine: Engine,
    scheduler: Option<JobScheduler>,
    jobs: usize,
}

impl CronTriggers {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            scheduler: None,
            jobs: 0,
        }
    }

    /// 已注册的任务数
    pub fn job_count(&self) -> usize {
        self.jobs
    }

    /// 注册并启动所有定时任务；没有任何 Agent 声明 schedule 时不启动调度器
    pub async fn start(&mut self) -> Result<usize, ScheduleError> {
        let scheduled: Vec<_> = self
            .engine
            .agents()
            .all()
            .into_iter()
            .filter_map(|agent| agent.triggers.schedule.clone().map(|expr| (agent, expr)))
            .collect();
        if scheduled.is_empty() {
            return Ok(0);
        }

        let scheduler = JobScheduler::new().await.map_err(|e| ScheduleError::Init(e.to_string()))?;
        for (agent, expression) in scheduled {
            let input = agent
                .triggers
                .schedule_input
                .clone()
                .unwrap_or_else(|| Value::String(format!("scheduled run ({expression})")));
            let job = build_job(self.engine.clone(), agent.id.clone(), expression.clone(), input)?;
            scheduler
                .add(job)
                .await
                .map_err(|e| ScheduleError::JobAdd(agent.id.clone(), e.to_string()))?;
            self.jobs += 1;
            tracing::info!(agent_id = %agent.id, schedule = %expression, "cron trigger scheduled");
        }

        scheduler.start().await.map_err(|e| ScheduleError::Start(e.to_string()))?;
        self.scheduler = Some(scheduler);
        Ok(self.jobs)
    }

    pub async fn shutdown(&mut self) {
        if let Some(mut scheduler) = self.scheduler.take() {
            if let Err(e) = scheduler.shutdown().await {
                tracing::error!(error = %e, "error shutting down cron scheduler");
            }
        }
    }
}

fn build_job(engine: Engine, agent_id: String, expression: String, input: Value) -> Result<Job, ScheduleError> {
    let schedule = expression.clone();
    let owner = agent_id.clone();
    Job::new_async(schedule.as_str(), move |_uuid, _lock| {
        let engine = engine.clone();
        let agent_id = agent_id.clone();
        let expression = expression.clone();
        let input = input.clone();
        Box::pin(async move {
            match engine
                .submit(&agent_id, input, TriggerSource::Schedule { expression })
                .await
            {
                Ok(execution_id) => tracing::info!(agent_id = %agent_id, execution_id = %execution_id, "cron trigger fired"),
                Err(e) => tracing::warn!(agent_id = %agent_id, error = %e, "cron trigger failed"),
            }
        })
    })
    .map_err(|e| ScheduleError::InvalidSchedule(owner, format!("{schedule}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentConfig;
    use crate::config::AppConfig;
    use crate::core::EngineBuilder;
    use crate::llm::ScriptedLlmClient;
    use std::sync::Arc;

    fn engine(schedule: Option<&str>) -> Engine {
        let mut agent = AgentConfig::new("reporter", "Write the daily report.");
        agent.triggers.schedule = schedule.map(str::to_string);
        EngineBuilder::new(AppConfig::default())
            .with_llm(Arc::new(ScriptedLlmClient::new().then_always(r#"{"final_answer": "ok"}"#)))
            .with_agent(agent)
            .with_agent(AgentConfig::new("idle", "Nothing scheduled."))
            .build()
    }

    #[tokio::test]
    async fn test_no_schedules_no_scheduler() {
        let mut triggers = CronTriggers::new(engine(None));
        assert_eq!(triggers.start().await.unwrap(), 0);
        triggers.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_expression_rejected() {
        let mut triggers = CronTriggers::new(engine(Some("every tuesday")));
        let err = triggers.start().await.unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidSchedule(_, _)));
    }

    #[tokio::test]
    async fn test_valid_expression_scheduled() {
        let mut triggers = CronTriggers::new(engine(Some("0 0 3 * * *")));
        assert_eq!(triggers.start().await.unwrap(), 1);
        assert_eq!(triggers.job_count(), 1);
        triggers.shutdown().await;
    }
}
