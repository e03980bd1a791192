//! 用量计量：token / 费用统计与配额控制
//!
//! 每个 Agent 一个 QuotaCounter（原子 CAS），每次模型调用前 reserve 预估 token，调用结束后 commit 实际用量。
//! 配额数值缓存在本地，由 reconciler 任务从 QuotaSource 异步刷新，计量本身从不等待远端。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, AgentId, Execution, ExecutionId, TokenUsage};

/// 超额策略
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuotaPolicy {
    /// 超出配额即拒绝后续模型调用
    ///
    /// 按预留量检查：提示词 + 补全上限（补全部分不超过剩余额度）。剩余额度容不下提示词时拒绝。
    HardStop,
    /// 允许超出，记录超额并按倍率计费
    SoftOverage {
        #[serde(default = "default_overage_multiplier")]
        multiplier: f64,
    },
}

fn default_overage_multiplier() -> f64 {
    1.5
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        QuotaPolicy::HardStop
    }
}

/// Agent 的 token 配额
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub limit_tokens: u64,
    #[serde(default)]
    pub policy: QuotaPolicy,
}

/// 每千 token 单价（USD）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    #[serde(default)]
    pub prompt_per_1k: f64,
    #[serde(default)]
    pub completion_per_1k: f64,
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            prompt_per_1k: 0.0005,
            completion_per_1k: 0.0015,
        }
    }
}

impl Pricing {
    pub fn cost(&self, usage: TokenUsage) -> f64 {
        usage.prompt_tokens as f64 / 1000.0 * self.prompt_per_1k
            + usage.completion_tokens as f64 / 1000.0 * self.completion_per_1k
    }
}

/// 单个 Agent 的配额计数器
#[derive(Debug)]
pub struct QuotaCounter {
    limit: AtomicU64,
    used: AtomicU64,
    policy: QuotaPolicy,
}

impl QuotaCounter {
    pub fn new(config: &QuotaConfig) -> Self {
        Self {
            limit: AtomicU64::new(config.limit_tokens),
            used: AtomicU64::new(0),
            policy: config.policy,
        }
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> u64 {
        self.limit.load(Ordering::Acquire)
    }

    pub fn remaining(&self) -> u64 {
        self.limit().saturating_sub(self.used())
    }

    /// CAS 预留；硬停止策略下超出配额返回 false
    fn try_reserve(&self, tokens: u64) -> bool {
        let limit = self.limit();
        match self.policy {
            QuotaPolicy::HardStop => self
                .used
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                    let next = used.checked_add(tokens)?;
                    (next <= limit).then_some(next)
                })
                .is_ok(),
            QuotaPolicy::SoftOverage { .. } => {
                self.used.fetch_add(tokens, Ordering::AcqRel);
                true
            }
        }
    }

    /// 为一次模型调用预留；硬停止策略下补全部分截断到剩余额度，返回实际预留量
    fn try_reserve_call(&self, prompt: u64, max_completion: u64) -> Option<u64> {
        match self.policy {
            QuotaPolicy::HardStop => {
                let limit = self.limit();
                let mut reserved = 0;
                self.used
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                        let free = limit.saturating_sub(used);
                        if prompt >= free {
                            return None;
                        }
                        reserved = prompt + max_completion.min(free - prompt);
                        Some(used + reserved)
                    })
                    .ok()
                    .map(|_| reserved)
            }
            QuotaPolicy::SoftOverage { .. } => {
                let tokens = prompt.saturating_add(max_completion);
                self.try_reserve(tokens).then_some(tokens)
            }
        }
    }

    /// 以实际用量替换预留量
    fn settle(&self, reserved: u64, actual: u64) {
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(reserved).saturating_add(actual))
            });
    }
}

/// reserve 的凭据，commit / release 时归还
#[derive(Debug)]
#[must_use]
pub struct Reservation {
    counter: Option<Arc<QuotaCounter>>,
    estimated: u64,
}

impl Reservation {
    pub fn estimated(&self) -> u64 {
        self.estimated
    }
}

/// 单次调用的计费结果
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageCharge {
    pub usage: TokenUsage,
    pub cost_usd: f64,
    pub overage_tokens: u64,
    pub overage_cost_usd: f64,
}

impl UsageCharge {
    pub fn add(&mut self, other: UsageCharge) {
        self.usage.add(other.usage);
        self.cost_usd += other.cost_usd;
        self.overage_tokens += other.overage_tokens;
        self.overage_cost_usd += other.overage_cost_usd;
    }
}

/// 每个 Execution 一条用量记录（终态时写入 Store）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub execution_id: ExecutionId,
    pub agent_id: AgentId,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
    pub overage_tokens: u64,
    pub overage_cost_usd: f64,
    pub recorded_at: DateTime<Utc>,
}

impl UsageRecord {
    pub fn from_execution(execution: &Execution) -> Self {
        Self {
            execution_id: execution.id.clone(),
            agent_id: execution.agent_id.clone(),
            prompt_tokens: execution.usage.prompt_tokens,
            completion_tokens: execution.usage.completion_tokens,
            cost_usd: execution.cost_usd,
            overage_tokens: execution.overage_tokens,
            overage_cost_usd: execution.overage_cost_usd,
            recorded_at: Utc::now(),
        }
    }
}

/// 用量计量器：按 Agent 维护配额计数器
pub struct UsageMeter {
    counters: RwLock<HashMap<AgentId, Arc<QuotaCounter>>>,
    pricing: Pricing,
}

impl UsageMeter {
    pub fn new(pricing: Pricing) -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            pricing,
        }
    }

    pub fn pricing(&self) -> Pricing {
        self.pricing
    }

    /// 设置（或替换）Agent 配额，计数清零
    pub fn configure(&self, agent_id: &str, quota: &QuotaConfig) {
        if let Ok(mut counters) = self.counters.write() {
            counters.insert(agent_id.to_string(), Arc::new(QuotaCounter::new(quota)));
        }
    }

    /// 仅在尚未配置时设置配额（保留已用量）
    pub fn configure_if_absent(&self, agent_id: &str, quota: &QuotaConfig) {
        if let Ok(mut counters) = self.counters.write() {
            counters
                .entry(agent_id.to_string())
                .or_insert_with(|| Arc::new(QuotaCounter::new(quota)));
        }
    }

    pub fn counter(&self, agent_id: &str) -> Option<Arc<QuotaCounter>> {
        self.counters.read().ok().and_then(|c| c.get(agent_id).cloned())
    }

    /// 模型调用前预留；无配额的 Agent 不受限
    pub fn reserve(&self, agent_id: &str, estimated_tokens: u64) -> Result<Reservation, AgentError> {
        let counter = self.counter(agent_id);
        if let Some(counter) = &counter {
            if !counter.try_reserve(estimated_tokens) {
                tracing::warn!(
                    agent_id = %agent_id,
                    estimated_tokens,
                    used = counter.used(),
                    limit = counter.limit(),
                    "quota reservation denied"
                );
                return Err(AgentError::QuotaExceeded(agent_id.to_string()));
            }
        }
        Ok(Reservation {
            counter,
            estimated: estimated_tokens,
        })
    }

    /// 模型调用前按提示词估算与补全上限预留
    pub fn reserve_call(
        &self,
        agent_id: &str,
        prompt_tokens: u64,
        max_completion_tokens: u64,
    ) -> Result<Reservation, AgentError> {
        let Some(counter) = self.counter(agent_id) else {
            return Ok(Reservation {
                counter: None,
                estimated: prompt_tokens.saturating_add(max_completion_tokens),
            });
        };
        match counter.try_reserve_call(prompt_tokens, max_completion_tokens) {
            Some(estimated) => Ok(Reservation {
                counter: Some(counter),
                estimated,
            }),
            None => {
                tracing::warn!(
                    agent_id = %agent_id,
                    prompt_tokens,
                    used = counter.used(),
                    limit = counter.limit(),
                    "quota reservation denied"
                );
                Err(AgentError::QuotaExceeded(agent_id.to_string()))
            }
        }
    }

    /// 调用成功后提交实际用量，返回费用
    pub fn commit(&self, reservation: Reservation, actual: TokenUsage) -> UsageCharge {
        let cost_usd = self.pricing.cost(actual);
        let mut charge = UsageCharge {
            usage: actual,
            cost_usd,
            ..Default::default()
        };
        if let Some(counter) = reservation.counter {
            let before = counter.used().saturating_sub(reservation.estimated);
            counter.settle(reservation.estimated, actual.total());
            if let QuotaPolicy::SoftOverage { multiplier } = counter.policy {
                let limit = counter.limit();
                let after = before + actual.total();
                let overage = after.saturating_sub(limit.max(before)).min(actual.total());
                if overage > 0 {
                    let ratio = overage as f64 / actual.total().max(1) as f64;
                    charge.overage_tokens = overage;
                    charge.overage_cost_usd = cost_usd * ratio * multiplier;
                    tracing::info!(overage, "soft quota overage recorded");
                }
            }
        }
        charge
    }

    /// 调用失败时归还预留量
    pub fn release(&self, reservation: Reservation) {
        if let Some(counter) = reservation.counter {
            counter.settle(reservation.estimated, 0);
        }
    }

    /// 重置 Agent 已用量
    pub fn reset(&self, agent_id: &str) {
        if let Some(counter) = self.counter(agent_id) {
            counter.used.store(0, Ordering::Release);
        }
    }

    /// 用远端快照覆盖本地缓存
    pub fn apply_snapshot(&self, agent_id: &str, snapshot: QuotaSnapshot) {
        if let Some(counter) = self.counter(agent_id) {
            counter.limit.store(snapshot.limit_tokens, Ordering::Release);
            if let Some(used) = snapshot.used_tokens {
                counter.used.store(used, Ordering::Release);
            }
        }
    }

    fn agent_ids(&self) -> Vec<AgentId> {
        self.counters
            .read()
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// 远端配额数值
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuotaSnapshot {
    pub limit_tokens: u64,
    /// None 表示沿用本地计数
    pub used_tokens: Option<u64>,
}

/// 权威配额来源（计费系统等）
#[async_trait]
pub trait QuotaSource: Send + Sync {
    async fn fetch(&self, agent_id: &str) -> Result<Option<QuotaSnapshot>, String>;
}

/// 通过 HTTP 获取配额：`GET {base_url}/{agent_id}` 返回 `{"limit_tokens": .., "used_tokens": ..}`，404 表示未配置
pub struct HttpQuotaSource {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct QuotaPayload {
    limit_tokens: u64,
    #[serde(default)]
    used_tokens: Option<u64>,
}

impl HttpQuotaSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl QuotaSource for HttpQuotaSource {
    async fn fetch(&self, agent_id: &str) -> Result<Option<QuotaSnapshot>, String> {
        let url = format!("{}/{}", self.base_url, agent_id);
        let resp = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(format!("quota source returned {}", resp.status()));
        }
        let payload: QuotaPayload = resp.json().await.map_err(|e| e.to_string())?;
        Ok(Some(QuotaSnapshot {
            limit_tokens: payload.limit_tokens,
            used_tokens: payload.used_tokens,
        }))
    }
}

/// 周期性从 QuotaSource 刷新本地配额缓存，直到 cancel
pub fn spawn_reconciler(
    meter: Arc<UsageMeter>,
    source: Arc<dyn QuotaSource>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    for agent_id in meter.agent_ids() {
                        match source.fetch(&agent_id).await {
                            Ok(Some(snapshot)) => meter.apply_snapshot(&agent_id, snapshot),
                            Ok(None) => {}
                            Err(e) => tracing::warn!(agent_id = %agent_id, error = %e, "quota refresh failed"),
                        }
                    }
                }
            }
        }
        tracing::debug!("quota reconciler stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hard(limit: u64) -> QuotaConfig {
        QuotaConfig {
            limit_tokens: limit,
            policy: QuotaPolicy::HardStop,
        }
    }

    #[test]
    fn test_unconfigured_agent_unlimited() {
        let meter = UsageMeter::new(Pricing::default());
        let r = meter.reserve("free", 1_000_000).unwrap();
        let charge = meter.commit(r, TokenUsage::new(1000, 1000));
        assert!(charge.cost_usd > 0.0);
    }

    #[test]
    fn test_hard_stop_denies_after_limit() {
        let meter = UsageMeter::new(Pricing::default());
        meter.configure("a", &hard(100));
        let r = meter.reserve("a", 50).unwrap();
        meter.commit(r, TokenUsage::new(60, 40));
        assert_eq!(meter.counter("a").unwrap().used(), 100);
        assert!(matches!(meter.reserve("a", 1), Err(AgentError::QuotaExceeded(_))));
        meter.reset("a");
        assert!(meter.reserve("a", 1).is_ok());
    }

    #[test]
    fn test_release_returns_reservation() {
        let meter = UsageMeter::new(Pricing::default());
        meter.configure("a", &hard(100));
        let r = meter.reserve("a", 80).unwrap();
        assert!(meter.reserve("a", 30).is_err());
        meter.release(r);
        assert_eq!(meter.counter("a").unwrap().used(), 0);
    }

    #[test]
    fn test_call_reservation_caps_completion_to_remaining() {
        let meter = UsageMeter::new(Pricing::default());
        meter.configure("a", &hard(500));
        let r = meter.reserve("a", 300).unwrap();
        meter.commit(r, TokenUsage::new(200, 100));

        // 剩余 200，补全上限 2048 被截断
        let r = meter.reserve_call("a", 50, 2048).unwrap();
        assert_eq!(r.estimated(), 200);
        assert_eq!(meter.counter("a").unwrap().used(), 500);
        let charge = meter.commit(r, TokenUsage::new(50, 20));
        assert_eq!(charge.usage.total(), 70);
        assert_eq!(meter.counter("a").unwrap().used(), 370);

        // 剩余额度容不下提示词
        assert!(matches!(meter.reserve_call("a", 130, 16), Err(AgentError::QuotaExceeded(_))));
        assert_eq!(meter.counter("a").unwrap().used(), 370);
    }

    #[test]
    fn test_soft_overage_flags_and_multiplies() {
        let meter = UsageMeter::new(Pricing {
            prompt_per_1k: 1.0,
            completion_per_1k: 1.0,
        });
        meter.configure(
            "a",
            &QuotaConfig {
                limit_tokens: 100,
                policy: QuotaPolicy::SoftOverage { multiplier: 2.0 },
            },
        );
        let r = meter.reserve("a", 10).unwrap();
        let first = meter.commit(r, TokenUsage::new(80, 0));
        assert_eq!(first.overage_tokens, 0);
        let r = meter.reserve("a", 10).unwrap();
        let second = meter.commit(r, TokenUsage::new(50, 0));
        assert_eq!(second.overage_tokens, 30);
        assert!((second.overage_cost_usd - 0.05 * 0.6 * 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_concurrent_reservations_never_exceed_limit() {
        let meter = Arc::new(UsageMeter::new(Pricing::default()));
        meter.configure("a", &hard(1000));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let meter = meter.clone();
                std::thread::spawn(move || {
                    let mut granted = 0u64;
                    for _ in 0..100 {
                        if let Ok(r) = meter.reserve("a", 7) {
                            granted += r.estimated();
                            meter.commit(r, TokenUsage::new(7, 0));
                        }
                    }
                    granted
                })
            })
            .collect();
        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert!(total <= 1000);
        assert_eq!(meter.counter("a").unwrap().used(), total);
    }

    struct FixedSource;

    #[async_trait]
    impl QuotaSource for FixedSource {
        async fn fetch(&self, _agent_id: &str) -> Result<Option<QuotaSnapshot>, String> {
            Ok(Some(QuotaSnapshot {
                limit_tokens: 5000,
                used_tokens: Some(10),
            }))
        }
    }

    #[tokio::test]
    async fn test_reconciler_refreshes_cache() {
        let meter = Arc::new(UsageMeter::new(Pricing::default()));
        meter.configure("a", &hard(100));
        let cancel = CancellationToken::new();
        let handle = spawn_reconciler(meter.clone(), Arc::new(FixedSource), Duration::from_millis(10), cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();
        let counter = meter.counter("a").unwrap();
        assert_eq!(counter.limit(), 5000);
        assert_eq!(counter.used(), 10);
    }
}
