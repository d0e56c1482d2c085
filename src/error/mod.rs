//! The unified error handling system for the gateway.

use axum::http::{HeaderValue, header};
use axum::response::{IntoResponse, Response};

pub use adapter::{AdapterError, AdapterErrorKind};
pub use auth::AuthError;
pub use ssrf::SsrfError;
pub use types::{ErrorBody, ErrorDetail, GatewayError};

/// A unified `Result` type for the entire gateway.
pub type Result<T> = std::result::Result<T, GatewayError>;

pub mod adapter;
pub mod auth;
pub mod macros;
pub mod ssrf;
pub mod types;

/// Context trait for adding context to errors.
pub trait Context<T> {
    fn context<C>(self, context: C) -> Result<T>
    where
        C: std::fmt::Display;
}

impl<T, E> Context<T> for std::result::Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn context<C>(self, context: C) -> Result<T>
    where
        C: std::fmt::Display,
    {
        self.map_err(|e| GatewayError::internal_with_source(context.to_string(), e))
    }
}

/// Error category for monitoring and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// 4xx
    Client,
    /// 5xx
    Server,
}

impl GatewayError {
    pub fn category(&self) -> ErrorCategory {
        if self.to_http_response_parts().0.is_server_error() {
            ErrorCategory::Server
        } else {
            ErrorCategory::Client
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, _, _) = self.to_http_response_parts();
        let body = self.to_error_body();
        let mut response = (status, axum::Json(body)).into_response();
        if let Some(secs) = self.retry_after_secs() {
            let headers = response.headers_mut();
            headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
            headers.insert("x-ratelimit-reset", HeaderValue::from(secs));
        }
        response
    }
}

#[cfg(test)]
mod tests;
