//! 共享计数存储接口

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// 滑动窗口判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    pub allowed: bool,
    /// 判定后窗口内的请求数
    pub count: u64,
    /// 窗口内最早一条记录的时间戳
    pub oldest_ms: Option<u64>,
}

impl WindowOutcome {
    /// 距离最早记录滑出窗口的毫秒数
    #[must_use]
    pub fn reset_after_ms(&self, now_ms: u64, window_ms: u64) -> u64 {
        self.oldest_ms
            .map_or(window_ms, |oldest| (oldest + window_ms).saturating_sub(now_ms))
    }
}

/// 限流、封禁与配额共用的原子计数存储
///
/// 每个方法对同一个 key 都是原子的，并发请求之间不会出现先查后写的竞争。
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// 清理窗口外记录、计数，未超限时记录本次请求
    async fn window_acquire(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        limit: u64,
    ) -> Result<WindowOutcome>;

    async fn set_ban(&self, key: &str, ttl: Duration) -> Result<()>;

    /// 封禁剩余时间，未封禁返回 None
    async fn ban_remaining(&self, key: &str) -> Result<Option<Duration>>;

    async fn clear_ban(&self, key: &str) -> Result<()>;

    /// 自增并在首次创建时设置过期时间，返回自增后的值
    async fn incr_by(&self, key: &str, delta: u64, ttl: Duration) -> Result<u64>;

    async fn get_counter(&self, key: &str) -> Result<u64>;

    async fn reset_counter(&self, key: &str) -> Result<()>;
}
