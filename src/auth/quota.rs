//! # 配额管理
//!
//! 按固定周期累计 token 用量。请求前只检查是否已耗尽，用量在上游响应解析之后才记账。

use std::sync::Arc;
use std::time::Duration;

use crate::cache::CounterStore;
use crate::error::{GatewayError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::store::{QuotaConfig, Usage};
use crate::utils::SharedClock;
use crate::{ldebug, lwarn};

/// 配额管理器
pub struct QuotaManager {
    store: Arc<dyn CounterStore>,
    clock: SharedClock,
}

impl QuotaManager {
    #[must_use]
    pub fn new(store: Arc<dyn CounterStore>, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    /// 当前周期的计数 key 与周期剩余时间
    fn period(&self, key_id: &str, config: QuotaConfig) -> (String, Duration) {
        let period_ms = config.period_seconds.max(1) * 1000;
        let now = self.clock.now_millis();
        let index = now / period_ms;
        let remaining = period_ms - now % period_ms;
        (
            format!("quota:{key_id}:{index}"),
            Duration::from_millis(remaining),
        )
    }

    /// 当前周期已用 token 数
    pub async fn used(&self, key_id: &str, config: QuotaConfig) -> Result<u64> {
        let (key, _) = self.period(key_id, config);
        self.store.get_counter(&key).await
    }

    /// 预算已用完则拒绝
    pub async fn check(
        &self,
        request_id: &str,
        key_id: &str,
        config: Option<QuotaConfig>,
    ) -> Result<()> {
        let Some(config) = config else {
            return Ok(());
        };
        let used = self.used(key_id, config).await?;
        if used >= config.token_budget {
            lwarn!(
                request_id,
                LogStage::RateLimit,
                LogComponent::Quota,
                "quota_exhausted",
                "token 配额已耗尽",
                key_id = key_id,
                used = used,
                budget = config.token_budget
            );
            return Err(GatewayError::quota_exceeded(
                "You exceeded your current quota for this period",
            ));
        }
        Ok(())
    }

    /// 按上游报告的用量记账
    pub async fn record_usage(
        &self,
        request_id: &str,
        key_id: &str,
        config: Option<QuotaConfig>,
        usage: Usage,
    ) -> Result<()> {
        let Some(config) = config else {
            return Ok(());
        };
        if usage.total_tokens == 0 {
            return Ok(());
        }
        let (key, ttl) = self.period(key_id, config);
        let used = self.store.incr_by(&key, usage.total_tokens, ttl).await?;
        ldebug!(
            request_id,
            LogStage::Response,
            LogComponent::Quota,
            "record_usage",
            "配额用量已记录",
            key_id = key_id,
            tokens = usage.total_tokens,
            used = used
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCounterStore;
    use crate::utils::ManualClock;

    const BUDGET: Option<QuotaConfig> = Some(QuotaConfig {
        token_budget: 100,
        period_seconds: 3600,
    });

    fn usage(total: u64) -> Usage {
        Usage {
            prompt_tokens: total / 2,
            completion_tokens: total - total / 2,
            total_tokens: total,
        }
    }

    #[tokio::test]
    async fn usage_accumulates_until_budget_exhausted() {
        let clock = ManualClock::new(0);
        let quota = QuotaManager::new(Arc::new(MemoryCounterStore::new(clock.clone())), clock.clone());
        quota.check("r", "k", BUDGET).await.unwrap();
        quota.record_usage("r", "k", BUDGET, usage(60)).await.unwrap();
        quota.check("r", "k", BUDGET).await.unwrap();
        quota.record_usage("r", "k", BUDGET, usage(40)).await.unwrap();

        let err = quota.check("r", "k", BUDGET).await.unwrap_err();
        let (status, error_type, _) = err.to_http_response_parts();
        assert_eq!(status.as_u16(), 429);
        assert_eq!(error_type, "insufficient_quota");

        // 下一个周期重新计数
        clock.advance_secs(3600);
        quota.check("r", "k", BUDGET).await.unwrap();
        assert_eq!(quota.used("k", BUDGET.unwrap()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn no_quota_config_is_unlimited() {
        let clock = ManualClock::new(0);
        let quota = QuotaManager::new(Arc::new(MemoryCounterStore::new(clock.clone())), clock);
        quota.record_usage("r", "k", None, usage(1_000)).await.unwrap();
        quota.check("r", "k", None).await.unwrap();
    }
}
