//! # 熔断器
//!
//! 每个上游一个状态机：CLOSED → OPEN → HALF_OPEN → CLOSED。
//! 状态与计数在同一把锁内更新，`can_execute`/`record_*` 对同一上游的并发调用是原子的。
//!
//! `can_execute` 放行时返回 [`Permit`]，结束时把它交回 `record_*`/`release`。
//! 半开期只认本轮试探请求的结果；CLOSED 时放行、跨越熔断才结束的旧请求不会占用或归还试探名额。

use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::CircuitBreakerConfig;
use crate::logging::{LogComponent, LogStage};
use crate::utils::SharedClock;
use crate::{linfo, lwarn};

/// 熔断状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure_ms: Option<u64>,
    opened_at_ms: Option<u64>,
    half_open_in_flight: u32,
    /// 每次进入 HALF_OPEN 加一，用来识别本轮试探请求
    half_open_epoch: u64,
}

/// 执行凭据
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    trial_epoch: Option<u64>,
}

impl Permit {
    /// 是否为半开期的试探请求
    #[must_use]
    pub const fn is_trial(self) -> bool {
        self.trial_epoch.is_some()
    }

    const fn normal() -> Self {
        Self { trial_epoch: None }
    }

    const fn trial(epoch: u64) -> Self {
        Self {
            trial_epoch: Some(epoch),
        }
    }
}

impl BreakerInner {
    const fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure_ms: None,
            opened_at_ms: None,
            half_open_in_flight: 0,
            half_open_epoch: 0,
        }
    }

    /// 凭据是否属于当前这一轮半开试探
    fn holds_trial(&self, permit: Permit) -> bool {
        self.state == CircuitState::HalfOpen && permit.trial_epoch == Some(self.half_open_epoch)
    }
}

/// 状态快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub half_open_in_flight: u32,
    pub last_failure_ms: Option<u64>,
    pub opened_at_ms: Option<u64>,
}

/// 单个上游的熔断器
#[derive(Debug)]
pub struct CircuitBreaker {
    upstream_id: String,
    config: CircuitBreakerConfig,
    clock: SharedClock,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(upstream_id: &str, config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            upstream_id: upstream_id.to_string(),
            config,
            clock,
            inner: Mutex::new(BreakerInner::closed()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_timeout_elapsed(&self, inner: &BreakerInner, now: u64) -> bool {
        inner
            .opened_at_ms
            .is_some_and(|opened| now.saturating_sub(opened) >= self.config.timeout_seconds * 1000)
    }

    fn trip(&self, inner: &mut BreakerInner, now: u64) {
        inner.state = CircuitState::Open;
        inner.opened_at_ms = Some(now);
        inner.consecutive_successes = 0;
        inner.half_open_in_flight = 0;
        lwarn!(
            "system",
            LogStage::Scheduling,
            LogComponent::CircuitBreaker,
            "circuit_opened",
            "熔断器打开",
            upstream_id = self.upstream_id,
            consecutive_failures = inner.consecutive_failures
        );
    }

    /// 调用上游之前判断是否放行；OPEN 超时后转为 HALF_OPEN 并占用一个试探名额
    pub fn can_execute(&self) -> Option<Permit> {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Some(Permit::normal()),
            CircuitState::Open => {
                if !self.open_timeout_elapsed(&inner, now) {
                    return None;
                }
                inner.state = CircuitState::HalfOpen;
                inner.consecutive_successes = 0;
                inner.half_open_in_flight = 1;
                inner.half_open_epoch += 1;
                linfo!(
                    "system",
                    LogStage::Scheduling,
                    LogComponent::CircuitBreaker,
                    "circuit_half_open",
                    "熔断器进入半开状态",
                    upstream_id = self.upstream_id
                );
                Some(Permit::trial(inner.half_open_epoch))
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max_requests {
                    inner.half_open_in_flight += 1;
                    Some(Permit::trial(inner.half_open_epoch))
                } else {
                    None
                }
            }
        }
    }

    /// 半开期只计入本轮试探请求的成功
    pub fn record_success(&self, permit: Permit) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen if inner.holds_trial(permit) => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    let last_failure_ms = inner.last_failure_ms;
                    let half_open_epoch = inner.half_open_epoch;
                    *inner = BreakerInner {
                        last_failure_ms,
                        half_open_epoch,
                        ..BreakerInner::closed()
                    };
                    linfo!(
                        "system",
                        LogStage::Scheduling,
                        LogComponent::CircuitBreaker,
                        "circuit_closed",
                        "熔断器恢复关闭",
                        upstream_id = self.upstream_id
                    );
                }
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    /// 半开期只有本轮试探请求的失败会重新打开熔断器
    pub fn record_failure(&self, permit: Permit) {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.last_failure_ms = Some(now);
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.trip(&mut inner, now);
                }
            }
            CircuitState::HalfOpen if inner.holds_trial(permit) => {
                inner.last_failure_ms = Some(now);
                inner.consecutive_failures += 1;
                self.trip(&mut inner, now);
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    /// 既不算成功也不算失败的结束（调用方断开、调用方错误），只归还本轮的半开名额
    pub fn release(&self, permit: Permit) {
        let mut inner = self.lock();
        if inner.holds_trial(permit) {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    /// 对外可见状态：OPEN 且已过冷却期视为 HALF_OPEN，不修改内部状态
    pub fn state(&self) -> CircuitState {
        let now = self.clock.now_millis();
        let inner = self.lock();
        if inner.state == CircuitState::Open && self.open_timeout_elapsed(&inner, now) {
            CircuitState::HalfOpen
        } else {
            inner.state
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state();
        let inner = self.lock();
        BreakerSnapshot {
            state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            half_open_in_flight: inner.half_open_in_flight,
            last_failure_ms: inner.last_failure_ms,
            opened_at_ms: inner.opened_at_ms,
        }
    }

    #[must_use]
    pub fn upstream_id(&self) -> &str {
        &self.upstream_id
    }
}

/// 熔断器注册表，首次引用某个上游时惰性创建
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    clock: SharedClock,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            breakers: DashMap::new(),
        }
    }

    pub fn get_or_create(&self, upstream_id: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(upstream_id) {
            return existing.clone();
        }
        self.breakers
            .entry(upstream_id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    upstream_id,
                    self.config,
                    self.clock.clone(),
                ))
            })
            .clone()
    }

    /// 未创建过的上游视为 CLOSED
    pub fn state_of(&self, upstream_id: &str) -> CircuitState {
        self.breakers
            .get(upstream_id)
            .map_or(CircuitState::Closed, |b| b.state())
    }

    pub fn snapshot(&self) -> Vec<(String, BreakerSnapshot)> {
        let mut all: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}
