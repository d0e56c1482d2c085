//! Errors raised by outbound URL validation.
//!
//! 细节只用于日志，调用方只会看到 "blocked target"。

use std::net::IpAddr;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SsrfError {
    #[error("invalid outbound url: {0}")]
    InvalidUrl(String),

    #[error("scheme '{0}' is not allowed")]
    SchemeNotAllowed(String),

    #[error("host '{0}' is blocked")]
    BlockedHost(String),

    #[error("host '{0}' could not be resolved")]
    ResolutionFailed(String),

    #[error("host '{host}' resolves to blocked address {ip}")]
    BlockedAddress { host: String, ip: IpAddr },

    #[error("host '{0}' is not in the outbound allowlist")]
    NotAllowlisted(String),

    #[error("redirect limit of {0} exceeded")]
    TooManyRedirects(usize),
}
