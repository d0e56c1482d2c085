//! 单进程内存计数存储
//!
//! 每 [`SWEEP_EVERY`] 次写入顺带清理一次已过期的窗口、封禁和计数，键的数量不随历史请求无限增长。

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::counter::{CounterStore, WindowOutcome};
use crate::error::{GatewayError, Result};
use crate::ldebug;
use crate::logging::{LogComponent, LogStage};
use crate::utils::SharedClock;

/// 两次清理之间的写入次数
pub const SWEEP_EVERY: u64 = 256;

/// 单个滑动窗口：时间戳队列和窗口长度
#[derive(Debug, Default)]
struct Window {
    entries: VecDeque<u64>,
    window_ms: u64,
}

impl Window {
    fn prune(&mut self, now_ms: u64) {
        while self.entries.front().is_some_and(|ts| ts + self.window_ms <= now_ms) {
            self.entries.pop_front();
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    value: u64,
    expires_at_ms: u64,
}

/// 内存计数存储
#[derive(Debug)]
pub struct MemoryCounterStore {
    clock: SharedClock,
    windows: DashMap<String, Arc<Mutex<Window>>>,
    bans: DashMap<String, u64>,
    counters: DashMap<String, Counter>,
    writes: AtomicU64,
}

impl MemoryCounterStore {
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            windows: DashMap::new(),
            bans: DashMap::new(),
            counters: DashMap::new(),
            writes: AtomicU64::new(0),
        }
    }

    /// 删除过期的窗口、封禁和计数，返回删除的键数
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.tracked_keys();
        // 正被其他请求持有的窗口跳过，下一轮再判断
        self.windows.retain(|_, window| {
            window.try_lock().map_or(true, |mut w| {
                w.prune(now);
                !w.entries.is_empty()
            })
        });
        self.bans.retain(|_, until| *until > now);
        self.counters.retain(|_, c| c.expires_at_ms > now);
        let removed = before.saturating_sub(self.tracked_keys());
        if removed > 0 {
            ldebug!(
                "system",
                LogStage::Cache,
                LogComponent::Cache,
                "memory_sweep",
                "清理过期计数键",
                removed = removed
            );
        }
        removed
    }

    /// 当前保存的键总数
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.windows.len() + self.bans.len() + self.counters.len()
    }

    fn note_write(&self) {
        if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.purge_expired();
        }
    }

    fn ttl_millis(ttl: Duration) -> u64 {
        u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn window_acquire(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        limit: u64,
    ) -> Result<WindowOutcome> {
        let window = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Window::default())))
            .clone();
        let outcome = {
            let mut window = window
                .lock()
                .map_err(|_| GatewayError::cache("rate limit window lock poisoned"))?;
            window.window_ms = window_ms;
            window.prune(now_ms);
            let allowed = (window.entries.len() as u64) < limit;
            if allowed {
                window.entries.push_back(now_ms);
            }
            WindowOutcome {
                allowed,
                count: window.entries.len() as u64,
                oldest_ms: window.entries.front().copied(),
            }
        };
        self.note_write();
        Ok(outcome)
    }

    async fn set_ban(&self, key: &str, ttl: Duration) -> Result<()> {
        let until = self.clock.now_millis() + Self::ttl_millis(ttl);
        self.bans.insert(key.to_string(), until);
        self.note_write();
        Ok(())
    }

    async fn ban_remaining(&self, key: &str) -> Result<Option<Duration>> {
        let now = self.clock.now_millis();
        let remaining = self
            .bans
            .get(key)
            .map(|until| *until)
            .filter(|until| *until > now)
            .map(|until| Duration::from_millis(until - now));
        if remaining.is_none() {
            self.bans.remove(key);
        }
        Ok(remaining)
    }

    async fn clear_ban(&self, key: &str) -> Result<()> {
        self.bans.remove(key);
        Ok(())
    }

    async fn incr_by(&self, key: &str, delta: u64, ttl: Duration) -> Result<u64> {
        let now = self.clock.now_millis();
        let value = {
            let mut entry = self.counters.entry(key.to_string()).or_insert(Counter {
                value: 0,
                expires_at_ms: now + Self::ttl_millis(ttl),
            });
            if entry.expires_at_ms <= now {
                *entry = Counter {
                    value: 0,
                    expires_at_ms: now + Self::ttl_millis(ttl),
                };
            }
            entry.value = entry.value.saturating_add(delta);
            entry.value
        };
        self.note_write();
        Ok(value)
    }

    async fn get_counter(&self, key: &str) -> Result<u64> {
        let now = self.clock.now_millis();
        Ok(self
            .counters
            .get(key)
            .filter(|c| c.expires_at_ms > now)
            .map_or(0, |c| c.value))
    }

    async fn reset_counter(&self, key: &str) -> Result<()> {
        self.counters.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{Clock, ManualClock};

    #[tokio::test]
    async fn window_admits_up_to_limit() {
        let clock = ManualClock::new(1_000_000);
        let store = MemoryCounterStore::new(clock.clone());
        for _ in 0..3 {
            assert!(store.window_acquire("k", clock.now_millis(), 1_000, 3).await.unwrap().allowed);
        }
        let rejected = store.window_acquire("k", clock.now_millis(), 1_000, 3).await.unwrap();
        assert!(!rejected.allowed);
        assert_eq!(rejected.count, 3);
        clock.advance_millis(1_000);
        assert!(store.window_acquire("k", clock.now_millis(), 1_000, 3).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn concurrent_acquires_never_exceed_limit() {
        let clock = ManualClock::new(5_000);
        let store = Arc::new(MemoryCounterStore::new(clock));
        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.window_acquire("shared", 5_000, 60_000, 10).await.unwrap().allowed
            }));
        }
        let mut admitted = 0;
        for h in handles {
            if h.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }

    #[tokio::test]
    async fn ban_expires() {
        let clock = ManualClock::new(0);
        let store = MemoryCounterStore::new(clock.clone());
        store.set_ban("b", Duration::from_secs(10)).await.unwrap();
        assert_eq!(store.ban_remaining("b").await.unwrap(), Some(Duration::from_secs(10)));
        clock.advance_secs(10);
        assert_eq!(store.ban_remaining("b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn counter_resets_after_ttl() {
        let clock = ManualClock::new(0);
        let store = MemoryCounterStore::new(clock.clone());
        assert_eq!(store.incr_by("q", 5, Duration::from_secs(1)).await.unwrap(), 5);
        assert_eq!(store.incr_by("q", 7, Duration::from_secs(1)).await.unwrap(), 12);
        clock.advance_secs(1);
        assert_eq!(store.get_counter("q").await.unwrap(), 0);
        assert_eq!(store.incr_by("q", 1, Duration::from_secs(1)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn purge_drops_idle_windows_and_expired_counters() {
        let clock = ManualClock::new(0);
        let store = MemoryCounterStore::new(clock.clone());
        for i in 0..10 {
            store.window_acquire(&format!("rl:{i}"), 0, 1_000, 5).await.unwrap();
            store
                .incr_by(&format!("quota:k:{i}"), 1, Duration::from_secs(60))
                .await
                .unwrap();
        }
        store.set_ban("ban:k", Duration::from_secs(5)).await.unwrap();
        assert_eq!(store.purge_expired(), 0);
        assert_eq!(store.tracked_keys(), 21);

        clock.advance_secs(5);
        assert_eq!(store.purge_expired(), 11);
        assert_eq!(store.tracked_keys(), 10);

        clock.advance_secs(60);
        assert_eq!(store.purge_expired(), 10);
        assert_eq!(store.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn writes_trigger_sweep_without_explicit_purge() {
        let clock = ManualClock::new(0);
        let store = MemoryCounterStore::new(clock.clone());
        for period in 0..SWEEP_EVERY {
            store
                .incr_by(&format!("quota:k:{period}"), 1, Duration::from_secs(1))
                .await
                .unwrap();
        }
        clock.advance_secs(2);
        for _ in 0..SWEEP_EVERY {
            store.window_acquire("rl:live", clock.now_millis(), 60_000, u64::MAX).await.unwrap();
        }
        assert_eq!(store.tracked_keys(), 1);
    }
}
