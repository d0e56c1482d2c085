//! 基于配置文件的静态数据源

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

use super::traits::{ApiKeyStore, RouteStore};
use super::types::{Endpoint, KeyRecord, RouteRecord, UpstreamConfig};
use crate::error::Result;

/// 内存中的路由表与 key 表
#[derive(Debug, Default)]
pub struct StaticStore {
    keys: HashMap<String, KeyRecord>,
    upstreams: HashMap<String, Arc<UpstreamConfig>>,
    routes: Vec<RouteRecord>,
    last_used: DashMap<String, DateTime<Utc>>,
}

impl StaticStore {
    #[must_use]
    pub fn new(
        keys: Vec<KeyRecord>,
        upstreams: Vec<UpstreamConfig>,
        routes: Vec<RouteRecord>,
    ) -> Self {
        Self {
            keys: keys.into_iter().map(|k| (k.prefix.clone(), k)).collect(),
            upstreams: upstreams
                .into_iter()
                .map(|u| (u.id.clone(), Arc::new(u)))
                .collect(),
            routes,
            last_used: DashMap::new(),
        }
    }

    #[must_use]
    pub fn from_config(config: &crate::config::AppConfig) -> Self {
        Self::new(
            config.keys.clone(),
            config.upstreams.clone(),
            config.routes.clone(),
        )
    }

    #[must_use]
    pub fn last_used(&self, key_id: &str) -> Option<DateTime<Utc>> {
        self.last_used.get(key_id).map(|v| *v)
    }
}

/// 虚拟模型模式匹配：精确，或 `prefix*`
#[must_use]
pub fn model_pattern_matches(pattern: &str, model: &str) -> bool {
    pattern
        .strip_suffix('*')
        .map_or(pattern == model, |prefix| model.starts_with(prefix))
}

#[async_trait]
impl RouteStore for StaticStore {
    async fn routes_for(
        &self,
        tenant_id: &str,
        endpoint: Endpoint,
        virtual_model: &str,
    ) -> Result<Vec<RouteRecord>> {
        Ok(self
            .routes
            .iter()
            .filter(|r| r.tenant_id == tenant_id)
            .filter(|r| r.endpoints.is_empty() || r.endpoints.contains(&endpoint))
            .filter(|r| model_pattern_matches(&r.virtual_model, virtual_model))
            .cloned()
            .collect())
    }

    async fn upstream(&self, upstream_id: &str) -> Result<Option<Arc<UpstreamConfig>>> {
        Ok(self.upstreams.get(upstream_id).cloned())
    }

    async fn virtual_models(&self, tenant_id: &str) -> Result<Vec<String>> {
        let mut models: Vec<String> = self
            .routes
            .iter()
            .filter(|r| r.tenant_id == tenant_id && !r.virtual_model.ends_with('*'))
            .map(|r| r.virtual_model.clone())
            .collect();
        models.sort();
        models.dedup();
        Ok(models)
    }
}

#[async_trait]
impl ApiKeyStore for StaticStore {
    async fn find_by_prefix(&self, prefix: &str) -> Result<Option<KeyRecord>> {
        Ok(self.keys.get(prefix).cloned())
    }

    async fn touch_last_used(&self, key_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.last_used.insert(key_id.to_string(), at);
        Ok(())
    }
}
