//! # 数据面服务构建器
//!
//! 按配置组装各组件；测试可以替换时钟、DNS 解析、数据源、计数存储与日志 sink。

use std::sync::Arc;
use std::time::Duration;

use super::service::GatewayService;
use super::upstream::UpstreamClient;
use crate::auth::{AuthService, QuotaManager, RateLimiter};
use crate::cache::{CounterStore, build_counter_store};
use crate::config::{AppConfig, ConfigCrypto};
use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::providers::AdapterRegistry;
use crate::scheduler::{CircuitBreakerRegistry, PolicyMatcher, RoutingEngine, UpstreamSelector};
use crate::security::{Resolver, SsrfGuard, SystemResolver};
use crate::store::{
    ApiKeyStore, ReferenceSecretResolver, RequestLogSink, RouteStore, SecretResolver, StaticStore,
    TracingLogSink,
};
use crate::utils::{SharedClock, system_clock};
use crate::{bail, linfo, lwarn};

/// 数据面服务构建器
pub struct GatewayBuilder {
    config: Arc<AppConfig>,
    clock: Option<SharedClock>,
    resolver: Option<Arc<dyn Resolver>>,
    key_store: Option<Arc<dyn ApiKeyStore>>,
    route_store: Option<Arc<dyn RouteStore>>,
    secrets: Option<Arc<dyn SecretResolver>>,
    counter_store: Option<Arc<dyn CounterStore>>,
    log_sink: Option<Arc<dyn RequestLogSink>>,
    adapters: Option<AdapterRegistry>,
}

impl GatewayBuilder {
    #[must_use]
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self {
            config,
            clock: None,
            resolver: None,
            key_store: None,
            route_store: None,
            secrets: None,
            counter_store: None,
            log_sink: None,
            adapters: None,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    #[must_use]
    pub fn with_key_store(mut self, store: Arc<dyn ApiKeyStore>) -> Self {
        self.key_store = Some(store);
        self
    }

    #[must_use]
    pub fn with_route_store(mut self, store: Arc<dyn RouteStore>) -> Self {
        self.route_store = Some(store);
        self
    }

    #[must_use]
    pub fn with_secrets(mut self, secrets: Arc<dyn SecretResolver>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    #[must_use]
    pub fn with_counter_store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.counter_store = Some(store);
        self
    }

    #[must_use]
    pub fn with_log_sink(mut self, sink: Arc<dyn RequestLogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    #[must_use]
    pub fn with_adapters(mut self, adapters: AdapterRegistry) -> Self {
        self.adapters = Some(adapters);
        self
    }

    /// 未注入时按配置中的密钥环境变量创建凭证解析器
    fn default_secrets(config: &AppConfig) -> Arc<dyn SecretResolver> {
        let crypto = match ConfigCrypto::from_env(&config.secrets.key_env) {
            Ok(crypto) => Some(crypto),
            Err(e) => {
                lwarn!(
                    "system",
                    LogStage::Startup,
                    LogComponent::Crypto,
                    "secret_key_unavailable",
                    "未配置凭证解密密钥，enc: 引用将无法解析",
                    key_env = config.secrets.key_env,
                    reason = e.to_string()
                );
                None
            }
        };
        Arc::new(ReferenceSecretResolver::new(crypto))
    }

    pub async fn build(self) -> Result<Arc<GatewayService>> {
        let config = self.config;
        let clock = self.clock.unwrap_or_else(system_clock);

        let adapters = self.adapters.unwrap_or_else(AdapterRegistry::with_defaults);
        if let Some(upstream) = config
            .upstreams
            .iter()
            .find(|u| !adapters.contains(&u.adapter))
        {
            bail!(
                Config,
                "upstream '{}' uses unknown adapter '{}'",
                upstream.id,
                upstream.adapter
            );
        }

        let static_store = Arc::new(StaticStore::from_config(&config));
        let key_store = self
            .key_store
            .unwrap_or_else(|| Arc::clone(&static_store) as Arc<dyn ApiKeyStore>);
        let route_store = self
            .route_store
            .unwrap_or_else(|| static_store as Arc<dyn RouteStore>);
        let secrets = self
            .secrets
            .unwrap_or_else(|| Self::default_secrets(&config));
        let counters = match self.counter_store {
            Some(store) => store,
            None => build_counter_store(&config.cache, Arc::clone(&clock)).await?,
        };

        let breakers = Arc::new(CircuitBreakerRegistry::new(
            config.circuit_breaker,
            Arc::clone(&clock),
        ));
        let engine = RoutingEngine::new(
            PolicyMatcher::new(Arc::clone(&route_store), Arc::clone(&breakers)),
            UpstreamSelector::new(config.routing.strategy),
            breakers,
            secrets,
            Duration::from_millis(config.server.default_timeout_ms),
        );

        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(SystemResolver) as Arc<dyn Resolver>);
        let ssrf = Arc::new(SsrfGuard::new(&config.ssrf, resolver)?);
        let client = UpstreamClient::new(
            ssrf,
            Duration::from_millis(config.server.stream_idle_timeout_ms),
        )?;

        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::Main,
            "gateway_built",
            "数据面服务已初始化",
            upstreams = config.upstreams.len(),
            routes = config.routes.len(),
            adapters = adapters.names(),
            strategy = config.routing.strategy.as_str()
        );

        Ok(Arc::new(GatewayService {
            auth: AuthService::new(key_store, &config.auth, Arc::clone(&clock)),
            rate_limiter: RateLimiter::new(
                Arc::clone(&counters),
                Arc::clone(&clock),
                config.rate_limit.clone(),
            ),
            quota: QuotaManager::new(counters, clock),
            engine,
            adapters,
            client,
            routes: route_store,
            log_sink: self
                .log_sink
                .unwrap_or_else(|| Arc::new(TracingLogSink) as Arc<dyn RequestLogSink>),
        }))
    }
}
