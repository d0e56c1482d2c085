//! # 计数存储模块
//!
//! 限流窗口、封禁标记和配额计数的共享存储，支持内存与 Redis 两种后端。

mod counter;
mod memory;
mod redis_store;

pub use counter::{CounterStore, WindowOutcome};
pub use memory::MemoryCounterStore;
pub use redis_store::RedisCounterStore;

use std::sync::Arc;

use crate::config::{CacheConfig, CacheType};
use crate::bail;
use crate::error::Result;
use crate::utils::SharedClock;

/// 按配置构建计数存储
pub async fn build_counter_store(
    config: &CacheConfig,
    clock: SharedClock,
) -> Result<Arc<dyn CounterStore>> {
    match config.cache_type {
        CacheType::Memory => Ok(Arc::new(MemoryCounterStore::new(clock))),
        CacheType::Redis => {
            let Some(redis) = config.redis.as_ref() else {
                bail!(Config, "cache.redis is required for redis cache");
            };
            Ok(Arc::new(RedisCounterStore::connect(redis).await?))
        }
    }
}
