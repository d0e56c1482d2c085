//! Errors produced by upstream protocol adapters.

use axum::http::StatusCode;
use thiserror::Error;

/// 适配器错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterErrorKind {
    /// 上游家族不支持该端点
    Unsupported,
    /// 路由上的适配器配置缺失或无效
    Configuration,
    /// 上游返回了 4xx/5xx
    Upstream,
    /// 上游响应无法翻译为公共协议
    Translation,
}

/// Adapter failure carrying the public `{type, status, param, code}` error fields.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct AdapterError {
    pub kind: AdapterErrorKind,
    pub message: String,
    pub error_type: String,
    /// 上游原始状态码（仅 Upstream 类）
    pub status: Option<u16>,
    pub param: Option<String>,
    pub code: Option<String>,
}

impl AdapterError {
    pub fn unsupported_endpoint(adapter: &str, endpoint: &str) -> Self {
        Self {
            kind: AdapterErrorKind::Unsupported,
            message: format!("endpoint '{endpoint}' is not supported by the {adapter} upstream"),
            error_type: "invalid_request_error".to_string(),
            status: None,
            param: None,
            code: Some("unsupported_endpoint".to_string()),
        }
    }

    pub fn configuration<T: Into<String>>(message: T) -> Self {
        Self {
            kind: AdapterErrorKind::Configuration,
            message: message.into(),
            error_type: "invalid_request_error".to_string(),
            status: None,
            param: None,
            code: Some("adapter_misconfigured".to_string()),
        }
    }

    pub fn invalid_param<T: Into<String>, P: Into<String>>(message: T, param: P) -> Self {
        Self {
            kind: AdapterErrorKind::Configuration,
            message: message.into(),
            error_type: "invalid_request_error".to_string(),
            status: None,
            param: Some(param.into()),
            code: None,
        }
    }

    pub fn upstream(
        status: u16,
        message: impl Into<String>,
        error_type: Option<String>,
        code: Option<String>,
    ) -> Self {
        Self {
            kind: AdapterErrorKind::Upstream,
            message: message.into(),
            error_type: error_type.unwrap_or_else(|| "upstream_error".to_string()),
            status: Some(status),
            param: None,
            code,
        }
    }

    pub fn translation<T: Into<String>>(message: T) -> Self {
        Self {
            kind: AdapterErrorKind::Translation,
            message: message.into(),
            error_type: "upstream_error".to_string(),
            status: None,
            param: None,
            code: Some("invalid_upstream_response".to_string()),
        }
    }

    /// 对外状态码：上游 4xx 透传，鉴权类与 5xx 映射为 502
    pub fn http_status(&self) -> StatusCode {
        match self.kind {
            AdapterErrorKind::Unsupported | AdapterErrorKind::Configuration => {
                StatusCode::BAD_REQUEST
            }
            AdapterErrorKind::Translation => StatusCode::BAD_GATEWAY,
            AdapterErrorKind::Upstream => match self.status {
                Some(401 | 403 | 407) | None => StatusCode::BAD_GATEWAY,
                Some(code @ 400..=499) => {
                    StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY)
                }
                Some(_) => StatusCode::BAD_GATEWAY,
            },
        }
    }
}
