//! # 错误类型定义

use axum::http::StatusCode;
use serde::Serialize;
use thiserror::Error;

use super::adapter::{AdapterError, AdapterErrorKind};
use super::auth::AuthError;
use super::ssrf::SsrfError;

/// 网关主要错误类型
#[derive(Debug, Error)]
pub enum GatewayError {
    /// 配置相关错误
    #[error("配置错误: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 认证与访问控制错误
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// 速率限制或封禁
    #[error("速率限制: {message}")]
    RateLimited {
        message: String,
        /// 距离窗口可用的秒数
        retry_after_secs: u64,
    },

    /// 配额耗尽
    #[error("配额耗尽: {message}")]
    QuotaExceeded { message: String },

    /// 没有匹配的路由
    #[error("路由未找到: {message}")]
    NoRouteFound { message: String },

    /// 路由存在但所有候选上游都不可用
    #[error("无可用上游: {message}")]
    NoHealthyUpstream { message: String },

    /// 适配器错误
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    /// 出站地址校验失败
    #[error(transparent)]
    Ssrf(#[from] SsrfError),

    /// 请求体不合法
    #[error("请求错误: {message}")]
    BadRequest {
        message: String,
        param: Option<String>,
    },

    /// 上游超时
    #[error("上游超时: {message}")]
    UpstreamTimeout { message: String, timeout_ms: u64 },

    /// 上游连接或传输错误
    #[error("上游连接错误: {message}")]
    UpstreamConnection {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 凭证解析失败
    #[error("凭证错误: {message}")]
    Credential {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 计数存储错误
    #[error("缓存错误: {message}")]
    Cache {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 数据源错误
    #[error("存储错误: {message}")]
    Store {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 服务器启动错误
    #[error("服务器启动错误: {message}")]
    ServerStart {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 系统内部错误
    #[error("内部错误: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// IO相关错误
    #[error("IO错误: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// 序列化/反序列化错误
    #[error("序列化错误: {message}")]
    Serialization {
        message: String,
        #[source]
        source: anyhow::Error,
    },
}

/// OpenAI 兼容错误体 `{"error": {...}}`
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

/// 错误详情
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    pub param: Option<String>,
    pub code: Option<String>,
}

impl GatewayError {
    /// 将错误转换为HTTP状态码、错误类型和错误代码
    pub fn to_http_response_parts(&self) -> (StatusCode, &str, Option<&str>) {
        match self {
            Self::Auth(err) => err.response_parts(),
            Self::RateLimited { .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limit_error",
                Some("rate_limit_exceeded"),
            ),
            Self::QuotaExceeded { .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                "insufficient_quota",
                Some("insufficient_quota"),
            ),
            Self::NoRouteFound { .. } => (
                StatusCode::NOT_FOUND,
                "not_found_error",
                Some("model_not_found"),
            ),
            Self::NoHealthyUpstream { .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "service_unavailable",
                Some("no_healthy_upstream"),
            ),
            Self::Adapter(err) => (
                err.http_status(),
                err.error_type.as_str(),
                err.code.as_deref(),
            ),
            Self::Ssrf(_) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                Some("blocked_target"),
            ),
            Self::BadRequest { .. } => (StatusCode::BAD_REQUEST, "invalid_request_error", None),
            Self::UpstreamTimeout { .. } => (
                StatusCode::GATEWAY_TIMEOUT,
                "upstream_error",
                Some("upstream_timeout"),
            ),
            Self::UpstreamConnection { .. } => (
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                Some("upstream_unreachable"),
            ),
            Self::Config { .. }
            | Self::Credential { .. }
            | Self::Cache { .. }
            | Self::Store { .. }
            | Self::ServerStart { .. }
            | Self::Internal { .. }
            | Self::Io { .. }
            | Self::Serialization { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "server_error", None)
            }
        }
    }

    /// 面向调用方的错误消息，内部细节与凭证不会出现在这里
    pub fn public_message(&self) -> String {
        match self {
            Self::Auth(err) => err.to_string(),
            Self::RateLimited { message, .. }
            | Self::QuotaExceeded { message }
            | Self::NoRouteFound { message }
            | Self::NoHealthyUpstream { message }
            | Self::BadRequest { message, .. }
            | Self::UpstreamTimeout { message, .. }
            | Self::UpstreamConnection { message, .. } => message.clone(),
            Self::Adapter(err) => err.message.clone(),
            Self::Ssrf(_) => "blocked target".to_string(),
            Self::Credential { .. } => "upstream credential unavailable".to_string(),
            Self::Config { .. }
            | Self::Cache { .. }
            | Self::Store { .. }
            | Self::ServerStart { .. }
            | Self::Internal { .. }
            | Self::Io { .. }
            | Self::Serialization { .. } => "internal server error".to_string(),
        }
    }

    /// 构造 OpenAI 错误体
    pub fn to_error_body(&self) -> ErrorBody {
        let (_, error_type, code) = self.to_http_response_parts();
        let param = match self {
            Self::BadRequest { param, .. } => param.clone(),
            Self::Adapter(err) => err.param.clone(),
            _ => None,
        };
        ErrorBody {
            error: ErrorDetail {
                message: self.public_message(),
                error_type: error_type.to_string(),
                param,
                code: code.map(str::to_string),
            },
        }
    }

    /// 该错误是否应计入熔断器失败
    pub const fn is_upstream_failure(&self) -> bool {
        match self {
            Self::UpstreamTimeout { .. } | Self::UpstreamConnection { .. } => true,
            Self::Adapter(err) => match err.kind {
                AdapterErrorKind::Upstream => match err.status {
                    Some(status) => status >= 500 || status == 408 || status == 429,
                    None => true,
                },
                AdapterErrorKind::Translation => true,
                AdapterErrorKind::Unsupported | AdapterErrorKind::Configuration => false,
            },
            _ => false,
        }
    }

    /// 429 响应的重试提示
    pub const fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// 创建配置错误
    pub fn config<T: Into<String>>(message: T) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的配置错误
    pub fn config_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建速率限制错误
    pub fn rate_limited<T: Into<String>>(message: T, retry_after_secs: u64) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after_secs,
        }
    }

    /// 创建配额错误
    pub fn quota_exceeded<T: Into<String>>(message: T) -> Self {
        Self::QuotaExceeded {
            message: message.into(),
        }
    }

    /// 创建路由未找到错误
    pub fn no_route<T: Into<String>>(message: T) -> Self {
        Self::NoRouteFound {
            message: message.into(),
        }
    }

    /// 创建无健康上游错误
    pub fn no_healthy_upstream<T: Into<String>>(message: T) -> Self {
        Self::NoHealthyUpstream {
            message: message.into(),
        }
    }

    /// 创建请求错误
    pub fn bad_request<T: Into<String>>(message: T) -> Self {
        Self::BadRequest {
            message: message.into(),
            param: None,
        }
    }

    /// 创建带参数名的请求错误
    pub fn bad_request_param<T: Into<String>, P: Into<String>>(message: T, param: P) -> Self {
        Self::BadRequest {
            message: message.into(),
            param: Some(param.into()),
        }
    }

    /// 创建上游超时错误
    pub fn upstream_timeout(timeout_ms: u64) -> Self {
        Self::UpstreamTimeout {
            message: format!("upstream did not respond within {timeout_ms}ms"),
            timeout_ms,
        }
    }

    /// 创建带来源的上游连接错误
    pub fn upstream_connection_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::UpstreamConnection {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建凭证错误
    pub fn credential<T: Into<String>>(message: T) -> Self {
        Self::Credential {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的凭证错误
    pub fn credential_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Credential {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建缓存错误
    pub fn cache<T: Into<String>>(message: T) -> Self {
        Self::Cache {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的缓存错误
    pub fn cache_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Cache {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建存储错误
    pub fn store<T: Into<String>>(message: T) -> Self {
        Self::Store {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的服务器启动错误
    pub fn server_start_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::ServerStart {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建内部错误
    pub fn internal<T: Into<String>>(message: T) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的内部错误
    pub fn internal_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
            source: err.into(),
        }
    }
}

impl From<toml::de::Error> for GatewayError {
    fn from(err: toml::de::Error) -> Self {
        Self::config_with_source("TOML 配置解析失败", err)
    }
}

impl From<redis::RedisError> for GatewayError {
    fn from(err: redis::RedisError) -> Self {
        Self::cache_with_source("Redis 操作失败", err)
    }
}
