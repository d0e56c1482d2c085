//! # API key 认证服务
//!
//! 按前缀查找 key 记录，bcrypt 校验完整 token，再检查启用状态与过期时间。
//! key 记录放在短 TTL 缓存中，吊销与禁用在 TTL 内生效。

use chrono::{DateTime, Utc};
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

use super::api_key::{ParsedApiKey, parse_bearer};
use super::types::AuthContext;
use crate::config::{AuthConfig, MAX_KEY_CACHE_TTL_SECONDS};
use crate::error::{AuthError, GatewayError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::store::{ApiKeyStore, KeyRecord};
use crate::utils::SharedClock;
use crate::{ldebug, lwarn};

const KEY_CACHE_CAPACITY: u64 = 10_000;

/// 认证服务
pub struct AuthService {
    store: Arc<dyn ApiKeyStore>,
    cache: Cache<String, Arc<KeyRecord>>,
    clock: SharedClock,
    touch_last_used: bool,
}

impl AuthService {
    #[must_use]
    pub fn new(store: Arc<dyn ApiKeyStore>, config: &AuthConfig, clock: SharedClock) -> Self {
        let ttl = config.key_cache_ttl_seconds.min(MAX_KEY_CACHE_TTL_SECONDS);
        Self {
            store,
            cache: Cache::builder()
                .max_capacity(KEY_CACHE_CAPACITY)
                .time_to_live(Duration::from_secs(ttl))
                .build(),
            clock,
            touch_last_used: config.touch_last_used,
        }
    }

    /// 认证 `Authorization` 头
    pub async fn authenticate(
        &self,
        request_id: &str,
        authorization: Option<&str>,
    ) -> Result<AuthContext> {
        let parsed = parse_bearer(authorization)?;
        let record = self
            .lookup(&parsed.prefix)
            .await?
            .ok_or(AuthError::ApiKeyInvalid)?;

        if !verify_token(&parsed, &record).await? {
            lwarn!(
                request_id,
                LogStage::Authentication,
                LogComponent::Auth,
                "hash_mismatch",
                "API key 哈希不匹配",
                key_prefix = parsed.prefix
            );
            return Err(AuthError::ApiKeyInvalid.into());
        }
        if !record.enabled {
            return Err(AuthError::ApiKeyDisabled.into());
        }
        if let Some(expires_at) = record.expires_at {
            if expires_at <= self.now() {
                return Err(AuthError::ApiKeyExpired.into());
            }
        }

        if self.touch_last_used {
            self.spawn_touch(request_id, &record.id);
        }

        let auth = AuthContext::from_record(&record);
        ldebug!(
            request_id,
            LogStage::Authentication,
            LogComponent::Auth,
            "authenticated",
            "API key 认证通过",
            key = auth.key_display,
            tenant_id = auth.tenant_id
        );
        Ok(auth)
    }

    /// 仅缓存存在的记录，未知前缀每次回源
    async fn lookup(&self, prefix: &str) -> Result<Option<Arc<KeyRecord>>> {
        if let Some(record) = self.cache.get(prefix).await {
            return Ok(Some(record));
        }
        let Some(record) = self.store.find_by_prefix(prefix).await? else {
            return Ok(None);
        };
        let record = Arc::new(record);
        self.cache.insert(prefix.to_string(), record.clone()).await;
        Ok(Some(record))
    }

    /// 让下一次认证回源读取
    pub async fn invalidate(&self, prefix: &str) {
        self.cache.invalidate(prefix).await;
    }

    fn now(&self) -> DateTime<Utc> {
        let millis = i64::try_from(self.clock.now_millis()).unwrap_or(i64::MAX);
        DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
    }

    fn spawn_touch(&self, request_id: &str, key_id: &str) {
        let store = self.store.clone();
        let key_id = key_id.to_string();
        let request_id = request_id.to_string();
        let at = self.now();
        tokio::spawn(async move {
            if let Err(e) = store.touch_last_used(&key_id, at).await {
                lwarn!(
                    request_id,
                    LogStage::Authentication,
                    LogComponent::Store,
                    "touch_last_used",
                    "更新 key 最近使用时间失败",
                    key_id = key_id,
                    error = e.to_string()
                );
            }
        });
    }
}

/// bcrypt 是 CPU 密集操作，放到阻塞线程池
async fn verify_token(parsed: &ParsedApiKey, record: &KeyRecord) -> Result<bool> {
    let token = parsed.token.clone();
    let hash = record.key_hash.clone();
    let verified = tokio::task::spawn_blocking(move || bcrypt::verify(token, &hash))
        .await
        .map_err(|e| GatewayError::internal_with_source("bcrypt task failed", e))?;
    // 损坏的哈希按不匹配处理
    Ok(verified.unwrap_or(false))
}
