//! # 配置管理模块
//!
//! 处理应用配置加载、验证和环境变量覆盖

mod app_config;
mod crypto;

pub use app_config::{
    AppConfig, AuthConfig, CacheConfig, CacheType, CircuitBreakerConfig, LoggingConfig,
    MAX_KEY_CACHE_TTL_SECONDS, RateLimitSettings, RedisConfig, RoutingConfig, SecretsConfig, ServerConfig,
    SsrfConfig,
};
pub use crypto::{ConfigCrypto, ENCRYPTED_PREFIX};

use std::env;
use std::path::Path;

use crate::ensure;
use crate::error::{GatewayError, Result};

/// 配置文件路径环境变量
pub const CONFIG_PATH_ENV: &str = "GATEWAY_CONFIG";
/// 监听地址覆盖环境变量，格式 `host:port`
pub const LISTEN_ENV: &str = "GATEWAY_LISTEN";

/// 从 TOML 文本解析并验证
pub fn from_toml_str(content: &str) -> Result<AppConfig> {
    let mut config: AppConfig = toml::from_str(content)?;
    apply_listen_override(&mut config, env::var(LISTEN_ENV).ok().as_deref())?;
    config.validate().map_err(GatewayError::config)?;
    Ok(config)
}

/// 加载配置文件
pub fn load_config(path: &Path) -> Result<AppConfig> {
    ensure!(path.exists(), Config, "配置文件不存在: {}", path.display());
    let content = std::fs::read_to_string(path).map_err(|e| {
        GatewayError::config_with_source(format!("读取配置文件失败: {}", path.display()), e)
    })?;
    from_toml_str(&content)
}

fn apply_listen_override(config: &mut AppConfig, listen: Option<&str>) -> Result<()> {
    if let Some(listen) = listen {
        let (host, port) = listen
            .rsplit_once(':')
            .ok_or_else(|| GatewayError::config(format!("{LISTEN_ENV} must be host:port")))?;
        config.server.host = host.to_string();
        config.server.port = port
            .parse()
            .map_err(|e| GatewayError::config_with_source(format!("{LISTEN_ENV} 端口无效"), e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[server]
port = 9000

[circuit_breaker]
failure_threshold = 3

[ssrf]
exempt_cidrs = ["127.0.0.0/8"]

[[upstreams]]
id = "openai-main"
adapter = "openai"
base_url = "https://api.openai.com"
auth = { type = "bearer", credential = "env:OPENAI_KEY" }

[[routes]]
tenant_id = "t1"
virtual_model = "gpt-4"
targets = [{ upstream_id = "openai-main", weight = 3 }]

[[keys]]
id = "k1"
tenant_id = "t1"
prefix = "abc123"
key_hash = "$2b$04$invalid"
rate_limit = { requests = 5 }
"#;

    #[test]
    fn parses_sample_config() {
        let config = from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.timeout_seconds, 60);
        assert_eq!(config.routes[0].targets[0].weight, 3);
        assert_eq!(config.keys[0].rate_limit.unwrap().window_seconds, 60);
        assert!(config.keys[0].enabled);
    }

    #[test]
    fn unknown_upstream_reference_rejected() {
        let bad = SAMPLE.replace("upstream_id = \"openai-main\"", "upstream_id = \"missing\"");
        assert!(matches!(from_toml_str(&bad), Err(GatewayError::Config { .. })));
    }

    #[test]
    fn key_cache_ttl_is_bounded() {
        let bad = format!("{SAMPLE}\n[auth]\nkey_cache_ttl_seconds = 3600\n");
        assert!(from_toml_str(&bad).is_err());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, SAMPLE.as_bytes()).unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.upstreams[0].id, "openai-main");
        assert!(load_config(Path::new("/nonexistent/gateway.toml")).is_err());
    }

    #[test]
    fn listen_override_applies() {
        let mut config = from_toml_str(SAMPLE).unwrap();
        apply_listen_override(&mut config, Some("127.0.0.1:7070")).unwrap();
        assert_eq!(config.server.bind_address(), "127.0.0.1:7070");
        assert!(apply_listen_override(&mut config, Some("no-port")).is_err());
    }
}
