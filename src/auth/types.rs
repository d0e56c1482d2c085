//! # 认证结果类型

use serde::Serialize;

use crate::store::{KeyRecord, QuotaConfig, RateLimitConfig};

/// 一次请求的调用方身份，由 key 记录构建，之后只读
#[derive(Debug, Clone, Serialize)]
pub struct AuthContext {
    pub api_key_id: String,
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub allowed_models: Vec<String>,
    pub allowed_endpoints: Vec<String>,
    pub rate_limit: Option<RateLimitConfig>,
    pub quota: Option<QuotaConfig>,
    pub log_payloads: bool,
    /// 可安全展示的 key 前缀，如 `sk-abc123-****`
    pub key_display: String,
}

impl AuthContext {
    #[must_use]
    pub fn from_record(record: &KeyRecord) -> Self {
        Self {
            api_key_id: record.id.clone(),
            tenant_id: record.tenant_id.clone(),
            user_id: record.user_id.clone(),
            allowed_models: record.allowed_models.clone(),
            allowed_endpoints: record.allowed_endpoints.clone(),
            rate_limit: record.rate_limit,
            quota: record.quota,
            log_payloads: record.log_payloads,
            key_display: format!("sk-{}-****", record.prefix),
        }
    }
}
