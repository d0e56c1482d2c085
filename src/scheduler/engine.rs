//! # 路由引擎
//!
//! 策略匹配 → 上游选择 → 熔断检查 → 凭证解析。凭证只为最终选中的上游解密一次。

use std::sync::Arc;
use std::time::Duration;

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry, Permit};
use super::policy::PolicyMatcher;
use super::selector::UpstreamSelector;
use super::types::WeightedUpstream;
use crate::error::{GatewayError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::proxy::context::{ResolvedAuth, RouteContext, Secret};
use crate::store::{Endpoint, SecretResolver, UpstreamAuth};
use crate::{ldebug, lerror, linfo};

/// 路由输入
#[derive(Debug, Clone)]
pub struct RouteRequest<'a> {
    pub request_id: &'a str,
    pub trace_id: &'a str,
    pub tenant_id: &'a str,
    pub api_key_id: &'a str,
    pub endpoint: Endpoint,
    pub virtual_model: &'a str,
    pub stream: bool,
}

/// 路由结果：上下文和已占用执行名额的熔断器
#[derive(Debug)]
pub struct RoutedRequest {
    pub context: RouteContext,
    pub breaker: Arc<CircuitBreaker>,
    pub permit: Permit,
}

/// 路由引擎
pub struct RoutingEngine {
    matcher: PolicyMatcher,
    selector: UpstreamSelector,
    breakers: Arc<CircuitBreakerRegistry>,
    secrets: Arc<dyn SecretResolver>,
    default_timeout: Duration,
}

impl RoutingEngine {
    pub fn new(
        matcher: PolicyMatcher,
        selector: UpstreamSelector,
        breakers: Arc<CircuitBreakerRegistry>,
        secrets: Arc<dyn SecretResolver>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            matcher,
            selector,
            breakers,
            secrets,
            default_timeout,
        }
    }

    #[must_use]
    pub const fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// 选出上游并返回带凭证的路由上下文
    pub async fn route(&self, request: RouteRequest<'_>) -> Result<RoutedRequest> {
        let mut candidates = self
            .matcher
            .match_candidates(
                request.request_id,
                request.tenant_id,
                request.endpoint,
                request.virtual_model,
            )
            .await?;

        // 快照之后熔断状态可能已变化，can_execute 拒绝时剔除该候选重新选择
        let (chosen, breaker, permit) = loop {
            let index = self.selector.select(request.request_id, &candidates)?;
            let breaker = self.breakers.get_or_create(candidates[index].id());
            if let Some(permit) = breaker.can_execute() {
                break (candidates.swap_remove(index), breaker, permit);
            }
            ldebug!(
                request.request_id,
                LogStage::Scheduling,
                LogComponent::CircuitBreaker,
                "candidate_rejected",
                "熔断器拒绝候选上游，重新选择",
                upstream_id = candidates[index].id()
            );
            candidates.remove(index);
            if candidates.is_empty() {
                return Err(GatewayError::no_healthy_upstream(
                    "All upstreams for this model are currently unavailable",
                ));
            }
        };

        let auth = match self.resolve_auth(request.request_id, &chosen).await {
            Ok(auth) => auth,
            Err(err) => {
                breaker.release(permit);
                return Err(err);
            }
        };

        let timeout_ms = chosen
            .timeout_ms
            .or(chosen.upstream.timeout_ms)
            .map_or(self.default_timeout, Duration::from_millis);

        linfo!(
            request.request_id,
            LogStage::Routing,
            LogComponent::Router,
            "route_selected",
            "路由完成",
            tenant_id = request.tenant_id,
            virtual_model = request.virtual_model,
            upstream_id = chosen.id(),
            upstream_model = chosen.upstream_model,
            auth_type = auth.kind()
        );

        let upstream = chosen.upstream;
        Ok(RoutedRequest {
            context: RouteContext {
                request_id: request.request_id.to_string(),
                trace_id: request.trace_id.to_string(),
                tenant_id: request.tenant_id.to_string(),
                api_key_id: request.api_key_id.to_string(),
                endpoint: request.endpoint,
                virtual_model: request.virtual_model.to_string(),
                stream: request.stream,
                upstream_id: upstream.id.clone(),
                upstream_model: chosen.upstream_model,
                base_url: upstream.base_url.clone(),
                adapter: upstream.adapter.clone(),
                auth,
                headers: upstream.headers.clone(),
                model_override: chosen.model_override,
                timeout: timeout_ms,
                extras: upstream.extras.clone(),
            },
            breaker,
            permit,
        })
    }

    async fn resolve_auth(&self, request_id: &str, chosen: &WeightedUpstream) -> Result<ResolvedAuth> {
        Ok(match &chosen.upstream.auth {
            UpstreamAuth::None => ResolvedAuth::None,
            UpstreamAuth::Bearer { credential } => {
                ResolvedAuth::Bearer(self.decrypt(request_id, chosen, credential).await?)
            }
            UpstreamAuth::Header { name, credential } => ResolvedAuth::Header {
                name: name.clone(),
                value: self.decrypt(request_id, chosen, credential).await?,
            },
        })
    }

    async fn decrypt(
        &self,
        request_id: &str,
        chosen: &WeightedUpstream,
        reference: &str,
    ) -> Result<Secret> {
        self.secrets
            .resolve(reference)
            .await
            .map(Secret::new)
            .map_err(|err| {
                lerror!(
                    request_id,
                    LogStage::Routing,
                    LogComponent::Crypto,
                    "credential_resolve_failed",
                    "上游凭证解析失败",
                    upstream_id = chosen.id(),
                    error = err.to_string()
                );
                err
            })
    }
}
