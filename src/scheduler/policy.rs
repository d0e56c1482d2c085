//! # 路由策略匹配

use std::sync::Arc;

use super::circuit_breaker::CircuitBreakerRegistry;
use super::types::WeightedUpstream;
use crate::error::{GatewayError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::store::{Endpoint, RouteRecord, RouteStore};
use crate::{ldebug, lwarn};

/// 路由匹配优先级：精确名称优先，其次更长的前缀，最后看 priority
fn rank(route: &RouteRecord) -> (bool, usize, i32) {
    let exact = !route.virtual_model.ends_with('*');
    (exact, route.virtual_model.len(), route.priority)
}

/// 按 (租户, 端点, 虚拟模型) 查找候选上游
pub struct PolicyMatcher {
    routes: Arc<dyn RouteStore>,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl PolicyMatcher {
    pub fn new(routes: Arc<dyn RouteStore>, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self { routes, breakers }
    }

    /// 返回最佳匹配层级内所有路由的目标，顺序与配置一致
    pub async fn match_candidates(
        &self,
        request_id: &str,
        tenant_id: &str,
        endpoint: Endpoint,
        virtual_model: &str,
    ) -> Result<Vec<WeightedUpstream>> {
        let routes = self
            .routes
            .routes_for(tenant_id, endpoint, virtual_model)
            .await?;
        let Some(best) = routes.iter().map(rank).max() else {
            return Err(GatewayError::no_route(format!(
                "The model '{virtual_model}' does not exist or is not available for {endpoint}"
            )));
        };

        let mut candidates = Vec::new();
        for route in routes.iter().filter(|r| rank(r) == best) {
            for target in &route.targets {
                let Some(upstream) = self.routes.upstream(&target.upstream_id).await? else {
                    lwarn!(
                        request_id,
                        LogStage::Routing,
                        LogComponent::Router,
                        "upstream_missing",
                        "路由引用了不存在的上游",
                        upstream_id = target.upstream_id
                    );
                    continue;
                };
                let upstream_model = route
                    .model_override
                    .clone()
                    .or_else(|| target.model.clone())
                    .unwrap_or_else(|| virtual_model.to_string());
                candidates.push(WeightedUpstream {
                    circuit_state: self.breakers.state_of(&upstream.id),
                    upstream,
                    weight: target.weight,
                    upstream_model,
                    model_override: route.model_override.clone(),
                    timeout_ms: route.timeout_ms,
                });
            }
        }

        if candidates.is_empty() {
            return Err(GatewayError::no_route(format!(
                "No upstream configured for model '{virtual_model}'"
            )));
        }

        ldebug!(
            request_id,
            LogStage::Routing,
            LogComponent::Router,
            "policy_matched",
            "路由匹配完成",
            tenant_id = tenant_id,
            virtual_model = virtual_model,
            candidates = candidates.iter().map(|c| c.id().to_string()).collect::<Vec<_>>()
        );
        Ok(candidates)
    }
}
