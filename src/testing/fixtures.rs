//! # 测试数据 Fixtures

use std::sync::OnceLock;

use crate::config::AppConfig;
use crate::store::{KeyRecord, RouteRecord, RouteTarget, UpstreamAuth, UpstreamConfig};

/// 测试调用方 token
pub const TEST_TOKEN: &str = "sk-test01-integrationsecret";
pub const TEST_PREFIX: &str = "test01";
pub const TEST_KEY_ID: &str = "key-test";
pub const TEST_TENANT: &str = "tenant-a";
/// 上游凭证明文，断言中用来确认它没有泄漏
pub const UPSTREAM_SECRET: &str = "sk-upstream-secret";

/// bcrypt 哈希较慢，整个进程只算一次
fn test_token_hash() -> String {
    static HASH: OnceLock<String> = OnceLock::new();
    HASH.get_or_init(|| bcrypt::hash(TEST_TOKEN, 4).unwrap_or_default())
        .clone()
}

/// 启用、不限模型的测试 key
#[must_use]
pub fn key_record() -> KeyRecord {
    KeyRecord {
        id: TEST_KEY_ID.to_string(),
        tenant_id: TEST_TENANT.to_string(),
        user_id: Some("user-1".to_string()),
        prefix: TEST_PREFIX.to_string(),
        key_hash: test_token_hash(),
        enabled: true,
        expires_at: None,
        allowed_models: Vec::new(),
        allowed_endpoints: Vec::new(),
        rate_limit: None,
        quota: None,
        log_payloads: false,
    }
}

/// OpenAI 适配器上游，凭证为明文引用
#[must_use]
pub fn upstream(id: &str, base_url: &str) -> UpstreamConfig {
    UpstreamConfig {
        id: id.to_string(),
        adapter: "openai".to_string(),
        base_url: base_url.to_string(),
        auth: UpstreamAuth::Bearer {
            credential: format!("plain:{UPSTREAM_SECRET}"),
        },
        headers: Default::default(),
        timeout_ms: None,
        extras: serde_json::Value::Null,
    }
}

/// 测试租户的路由
#[must_use]
pub fn route(virtual_model: &str, targets: &[(&str, u32)]) -> RouteRecord {
    RouteRecord {
        tenant_id: TEST_TENANT.to_string(),
        virtual_model: virtual_model.to_string(),
        endpoints: Vec::new(),
        priority: 0,
        timeout_ms: None,
        model_override: None,
        targets: targets
            .iter()
            .map(|(upstream_id, weight)| RouteTarget {
                upstream_id: (*upstream_id).to_string(),
                weight: *weight,
                model: None,
            })
            .collect(),
    }
}

/// 单上游配置：`gpt-4` 路由到 `primary`，上游模型名 `gpt-4-0613`
///
/// mock 上游监听在回环地址，因此豁免 127.0.0.0/8。
#[must_use]
pub fn gateway_config(base_url: &str) -> AppConfig {
    let mut config = AppConfig::default();
    config.server.default_timeout_ms = 5_000;
    config.server.stream_idle_timeout_ms = 2_000;
    config.circuit_breaker.failure_threshold = 2;
    config.circuit_breaker.timeout_seconds = 30;
    config.ssrf.exempt_cidrs = vec!["127.0.0.0/8".to_string()];
    config.keys = vec![key_record()];
    config.upstreams = vec![upstream("primary", base_url)];
    let mut gpt4 = route("gpt-4", &[("primary", 1)]);
    gpt4.model_override = Some("gpt-4-0613".to_string());
    config.routes = vec![gpt4];
    config
}
