//! 数据面依赖的外部协作者接口

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::types::{Endpoint, KeyRecord, RequestLogRecord, RouteRecord, UpstreamConfig};
use crate::error::Result;
use std::sync::Arc;

/// 路由与上游查询
#[async_trait]
pub trait RouteStore: Send + Sync {
    /// 租户下覆盖该端点、且虚拟模型模式匹配的路由
    async fn routes_for(
        &self,
        tenant_id: &str,
        endpoint: Endpoint,
        virtual_model: &str,
    ) -> Result<Vec<RouteRecord>>;

    async fn upstream(&self, upstream_id: &str) -> Result<Option<Arc<UpstreamConfig>>>;

    /// 租户可见的虚拟模型（精确名称，不含通配模式）
    async fn virtual_models(&self, tenant_id: &str) -> Result<Vec<String>>;
}

/// API key 记录查询
#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    async fn find_by_prefix(&self, prefix: &str) -> Result<Option<KeyRecord>>;

    async fn touch_last_used(&self, key_id: &str, at: DateTime<Utc>) -> Result<()>;
}

/// 凭证解密
#[async_trait]
pub trait SecretResolver: Send + Sync {
    async fn resolve(&self, reference: &str) -> Result<String>;
}

/// 请求日志接收端
#[async_trait]
pub trait RequestLogSink: Send + Sync {
    async fn emit(&self, record: RequestLogRecord) -> Result<()>;
}
