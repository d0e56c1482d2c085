//! Errors related to API key authentication and access control.

use axum::http::StatusCode;
use thiserror::Error;

/// The primary error type for caller authentication and authorization.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing or malformed Authorization header, expected 'Bearer sk-<prefix>-<secret>'")]
    ApiKeyMalformed,

    /// Unknown prefix and hash mismatch share one message so callers cannot tell which prefixes exist.
    #[error("Incorrect API key provided")]
    ApiKeyInvalid,

    #[error("The provided API key is disabled")]
    ApiKeyDisabled,

    #[error("The provided API key has expired")]
    ApiKeyExpired,

    #[error("This API key is not allowed to access endpoint '{endpoint}'")]
    EndpointNotAllowed { endpoint: String },

    #[error("This API key is not allowed to use model '{model}'")]
    ModelNotAllowed { model: String },
}

impl AuthError {
    /// HTTP 状态码、错误类型与错误代码
    pub const fn response_parts(&self) -> (StatusCode, &'static str, Option<&'static str>) {
        match self {
            Self::ApiKeyMalformed | Self::ApiKeyInvalid => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                Some("invalid_api_key"),
            ),
            Self::ApiKeyDisabled => (StatusCode::FORBIDDEN, "forbidden", Some("key_disabled")),
            Self::ApiKeyExpired => (StatusCode::FORBIDDEN, "forbidden", Some("key_expired")),
            Self::EndpointNotAllowed { .. } | Self::ModelNotAllowed { .. } => {
                (StatusCode::FORBIDDEN, "forbidden", Some("access_denied"))
            }
        }
    }
}
