//! # Redis 计数存储
//!
//! 滑动窗口用 Lua 脚本在服务端原子执行，跨实例共享限流状态。

use async_trait::async_trait;
use redis::{AsyncCommands, Client, Script, aio::ConnectionManager};
use std::time::Duration;

use super::counter::{CounterStore, WindowOutcome};
use crate::config::RedisConfig;
use crate::error::{GatewayError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::linfo;

const WINDOW_SCRIPT: &str = r"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local member = ARGV[4]
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
local allowed = 0
if count < limit then
  redis.call('ZADD', key, now, member)
  count = count + 1
  allowed = 1
end
redis.call('PEXPIRE', key, window)
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local oldest_ts = -1
if oldest[2] then
  oldest_ts = tonumber(oldest[2])
end
return {allowed, count, oldest_ts}
";

/// Redis 计数存储
pub struct RedisCounterStore {
    connection: ConnectionManager,
    key_prefix: String,
    window_script: Script,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        linfo!(
            "system",
            LogStage::Cache,
            LogComponent::Cache,
            "connect_to_redis",
            "正在连接 Redis"
        );
        let client = Client::open(config.url.as_str())
            .map_err(|e| GatewayError::cache_with_source("创建 Redis 客户端失败", e))?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| GatewayError::cache_with_source("建立 Redis 连接失败", e))?;
        linfo!(
            "system",
            LogStage::Cache,
            LogComponent::Cache,
            "redis_connected",
            "Redis 连接建立成功"
        );
        Ok(Self {
            connection,
            key_prefix: config.key_prefix.clone(),
            window_script: Script::new(WINDOW_SCRIPT),
        })
    }

    fn key(&self, kind: &str, key: &str) -> String {
        format!("{}:{kind}:{key}", self.key_prefix)
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn window_acquire(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        limit: u64,
    ) -> Result<WindowOutcome> {
        let mut conn = self.connection.clone();
        let member = format!("{now_ms}-{}", uuid::Uuid::new_v4().simple());
        let (allowed, count, oldest): (i64, u64, i64) = self
            .window_script
            .key(self.key("rl", key))
            .arg(now_ms)
            .arg(window_ms)
            .arg(limit)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;
        Ok(WindowOutcome {
            allowed: allowed == 1,
            count,
            oldest_ms: u64::try_from(oldest).ok(),
        })
    }

    async fn set_ban(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        let () = conn
            .set_ex(self.key("ban", key), 1, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn ban_remaining(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.connection.clone();
        let ttl: i64 = conn.pttl(self.key("ban", key)).await?;
        Ok(u64::try_from(ttl)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis))
    }

    async fn clear_ban(&self, key: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: i64 = conn.del(self.key("ban", key)).await?;
        Ok(())
    }

    async fn incr_by(&self, key: &str, delta: u64, ttl: Duration) -> Result<u64> {
        let mut conn = self.connection.clone();
        let full_key = self.key("cnt", key);
        let current: u64 = conn.incr(&full_key, delta).await?;
        // 首次创建时设置过期
        if current == delta {
            let ttl = i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX);
            let _: bool = conn.expire(&full_key, ttl).await?;
        }
        Ok(current)
    }

    async fn get_counter(&self, key: &str) -> Result<u64> {
        let mut conn = self.connection.clone();
        let value: Option<u64> = conn.get(self.key("cnt", key)).await?;
        Ok(value.unwrap_or(0))
    }

    async fn reset_counter(&self, key: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: i64 = conn.del(self.key("cnt", key)).await?;
        Ok(())
    }
}
