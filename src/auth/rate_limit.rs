//! # 滑动窗口限流与封禁
//!
//! 每个 (标识, 动作) 一个时间戳有序集合，判定前先清理窗口外记录。
//! 封禁与窗口计数相互独立，被封禁的标识无论计数如何都会被拒绝。

use std::sync::Arc;
use std::time::Duration;

use crate::cache::CounterStore;
use crate::config::RateLimitSettings;
use crate::error::{GatewayError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::store::RateLimitConfig;
use crate::utils::SharedClock;
use crate::{ldebug, lwarn};

/// 限流判定通过后的窗口状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub limit: u64,
    pub remaining: u64,
    pub reset_after_ms: u64,
}

/// 限流器
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    clock: SharedClock,
    settings: RateLimitSettings,
}

fn window_key(identifier: &str, action: &str) -> String {
    format!("{identifier}:{action}")
}

fn violation_key(identifier: &str) -> String {
    format!("violations:{identifier}")
}

fn ceil_secs(ms: u64) -> u64 {
    ms.div_ceil(1000).max(1)
}

impl RateLimiter {
    #[must_use]
    pub fn new(store: Arc<dyn CounterStore>, clock: SharedClock, settings: RateLimitSettings) -> Self {
        Self {
            store,
            clock,
            settings,
        }
    }

    /// key 自身的配置优先，否则用全局默认；请求数为 0 表示不限
    fn effective(&self, config: Option<RateLimitConfig>) -> Option<RateLimitConfig> {
        let config = config.unwrap_or(RateLimitConfig {
            requests: self.settings.default_requests,
            window_seconds: self.settings.default_window_seconds,
        });
        (config.requests > 0 && config.window_seconds > 0).then_some(config)
    }

    /// 检查并记录一次请求；超限返回 429，携带重试秒数
    pub async fn check(
        &self,
        request_id: &str,
        identifier: &str,
        action: &str,
        config: Option<RateLimitConfig>,
    ) -> Result<Option<RateLimitStatus>> {
        if !self.settings.enabled {
            return Ok(None);
        }
        if let Some(remaining) = self.ban_remaining(identifier).await? {
            lwarn!(
                request_id,
                LogStage::RateLimit,
                LogComponent::RateLimiter,
                "banned",
                "标识处于封禁期",
                identifier = identifier
            );
            let millis = u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX);
            return Err(GatewayError::rate_limited(
                "this API key is temporarily blocked",
                ceil_secs(millis),
            ));
        }
        let Some(config) = self.effective(config) else {
            return Ok(None);
        };

        let now = self.clock.now_millis();
        let window_ms = config.window_seconds * 1000;
        let limit = u64::from(config.requests);
        let outcome = self
            .store
            .window_acquire(&window_key(identifier, action), now, window_ms, limit)
            .await?;
        let reset_after_ms = outcome.reset_after_ms(now, window_ms);

        if !outcome.allowed {
            lwarn!(
                request_id,
                LogStage::RateLimit,
                LogComponent::RateLimiter,
                "limit_exceeded",
                "超出速率限制",
                identifier = identifier,
                action = action,
                limit = limit,
                window_seconds = config.window_seconds
            );
            self.note_violation(request_id, identifier, window_ms).await;
            return Err(GatewayError::rate_limited(
                format!(
                    "Rate limit reached: {limit} requests per {}s",
                    config.window_seconds
                ),
                ceil_secs(reset_after_ms),
            ));
        }

        ldebug!(
            request_id,
            LogStage::RateLimit,
            LogComponent::RateLimiter,
            "admitted",
            "请求通过限流",
            identifier = identifier,
            count = outcome.count,
            limit = limit
        );
        Ok(Some(RateLimitStatus {
            limit,
            remaining: limit.saturating_sub(outcome.count),
            reset_after_ms,
        }))
    }

    /// 连续超限达到阈值后自动封禁，失败只记日志
    async fn note_violation(&self, request_id: &str, identifier: &str, window_ms: u64) {
        let threshold = u64::from(self.settings.ban_after_violations);
        if threshold == 0 {
            return;
        }
        let key = violation_key(identifier);
        let result = async {
            let count = self
                .store
                .incr_by(&key, 1, Duration::from_millis(window_ms))
                .await?;
            if count >= threshold {
                self.ban(identifier, Duration::from_secs(self.settings.ban_seconds))
                    .await?;
                self.store.reset_counter(&key).await?;
                lwarn!(
                    request_id,
                    LogStage::RateLimit,
                    LogComponent::RateLimiter,
                    "auto_ban",
                    "多次超限，标识已被封禁",
                    identifier = identifier,
                    violations = count
                );
            }
            Ok::<_, GatewayError>(())
        }
        .await;
        if let Err(e) = result {
            lwarn!(
                request_id,
                LogStage::RateLimit,
                LogComponent::Cache,
                "violation_count",
                "记录限流违规失败",
                error = e.to_string()
            );
        }
    }

    /// 封禁标识一段时间
    pub async fn ban(&self, identifier: &str, duration: Duration) -> Result<()> {
        self.store.set_ban(identifier, duration).await
    }

    pub async fn unban(&self, identifier: &str) -> Result<()> {
        self.store.clear_ban(identifier).await
    }

    pub async fn is_banned(&self, identifier: &str) -> Result<bool> {
        Ok(self.ban_remaining(identifier).await?.is_some())
    }

    async fn ban_remaining(&self, identifier: &str) -> Result<Option<Duration>> {
        self.store.ban_remaining(identifier).await
    }
}
