//! # 应用配置结构定义

use serde::{Deserialize, Serialize};

use crate::scheduler::SchedulingStrategy;
use crate::store::{KeyRecord, RouteRecord, UpstreamConfig};

/// 应用主配置结构
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub cache: CacheConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub routing: RoutingConfig,
    pub rate_limit: RateLimitSettings,
    pub ssrf: SsrfConfig,
    pub auth: AuthConfig,
    pub secrets: SecretsConfig,
    /// 静态数据面记录
    pub keys: Vec<KeyRecord>,
    pub upstreams: Vec<UpstreamConfig>,
    pub routes: Vec<RouteRecord>,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// 请求体大小上限
    pub max_body_bytes: usize,
    /// 路由与上游都未配置时的超时
    pub default_timeout_ms: u64,
    /// 流式响应相邻两块之间的最长等待
    pub stream_idle_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_body_bytes: 32 * 1024 * 1024,
            default_timeout_ms: 120_000,
            stream_idle_timeout_ms: 60_000,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// 缓存类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    /// 单进程内存计数
    #[default]
    Memory,
    /// 跨实例共享的 Redis 计数
    Redis,
}

/// 缓存配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub cache_type: CacheType,
    pub redis: Option<RedisConfig>,
}

/// Redis配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    /// 所有键的前缀
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            key_prefix: "gw".to_string(),
        }
    }
}

/// 熔断器配置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout_seconds: u64,
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_seconds: 60,
            half_open_max_requests: 3,
        }
    }
}

/// 路由配置
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub strategy: SchedulingStrategy,
}

/// 全局限流配置，key 记录上的配置优先
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub enabled: bool,
    /// key 未配置限流时的默认值，0 表示不限
    pub default_requests: u32,
    pub default_window_seconds: u64,
    /// 连续超限多少次后自动封禁，0 表示不自动封禁
    pub ban_after_violations: u32,
    pub ban_seconds: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            default_requests: 0,
            default_window_seconds: 60,
            ban_after_violations: 0,
            ban_seconds: 300,
        }
    }
}

/// 出站地址校验配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SsrfConfig {
    pub enabled: bool,
    /// 非空时目标必须匹配其中之一（主机名、`*.域名` 或 CIDR）
    pub allowlist: Vec<String>,
    /// 追加的禁止主机名
    pub blocked_hosts: Vec<String>,
    /// 运维信任的内网段，从默认黑名单中豁免
    pub exempt_cidrs: Vec<String>,
    pub max_redirects: usize,
}

impl Default for SsrfConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowlist: Vec::new(),
            blocked_hosts: Vec::new(),
            exempt_cidrs: Vec::new(),
            max_redirects: 5,
        }
    }
}

/// 鉴权配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// key 记录缓存时间，吊销最多延迟这么久生效
    pub key_cache_ttl_seconds: u64,
    pub touch_last_used: bool,
}

/// key 缓存 TTL 上限
pub const MAX_KEY_CACHE_TTL_SECONDS: u64 = 60;

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            key_cache_ttl_seconds: 30,
            touch_last_used: true,
        }
    }
}

/// 凭证解密配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// 保存 64 位十六进制 AES 密钥的环境变量名
    pub key_env: String,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            key_env: "GATEWAY_SECRET_KEY".to_string(),
        }
    }
}

impl AppConfig {
    /// 验证配置的有效性
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port must be non-zero".to_string());
        }
        if self.server.default_timeout_ms == 0 {
            return Err("server.default_timeout_ms must be positive".to_string());
        }
        let cb = &self.circuit_breaker;
        if cb.failure_threshold == 0 || cb.success_threshold == 0 || cb.half_open_max_requests == 0
        {
            return Err("circuit_breaker thresholds must be positive".to_string());
        }
        if self.auth.key_cache_ttl_seconds > MAX_KEY_CACHE_TTL_SECONDS {
            return Err(format!(
                "auth.key_cache_ttl_seconds must be at most {MAX_KEY_CACHE_TTL_SECONDS}"
            ));
        }
        if self.cache.cache_type == CacheType::Redis && self.cache.redis.is_none() {
            return Err("cache.redis must be set when cache_type = \"redis\"".to_string());
        }
        for cidr in &self.ssrf.exempt_cidrs {
            cidr.parse::<ipnetwork::IpNetwork>()
                .map_err(|e| format!("invalid ssrf.exempt_cidrs entry '{cidr}': {e}"))?;
        }
        for route in &self.routes {
            if route.targets.is_empty() {
                return Err(format!(
                    "route for tenant '{}' model '{}' has no targets",
                    route.tenant_id, route.virtual_model
                ));
            }
            for target in &route.targets {
                if !self.upstreams.iter().any(|u| u.id == target.upstream_id) {
                    return Err(format!(
                        "route '{}' references unknown upstream '{}'",
                        route.virtual_model, target.upstream_id
                    ));
                }
            }
        }
        for key in &self.keys {
            if key.prefix.is_empty() || key.prefix.contains('-') {
                return Err(format!("key '{}' has an invalid prefix", key.id));
            }
        }
        Ok(())
    }
}
