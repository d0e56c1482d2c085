//! # 调用方认证与访问控制
//!
//! API key 解析与校验、白名单访问控制、滑动窗口限流与封禁、token 配额。

pub mod access;
pub mod api_key;
pub mod quota;
pub mod rate_limit;
pub mod service;
pub mod types;

pub use access::{check_access, model_allowed, wildcard_match};
pub use api_key::{ParsedApiKey, parse_bearer, parse_token};
pub use quota::QuotaManager;
pub use rate_limit::{RateLimitStatus, RateLimiter};
pub use service::AuthService;
pub use types::AuthContext;

/// 限流标识：按 API key 计数
#[must_use]
pub fn rate_limit_identifier(api_key_id: &str) -> String {
    format!("api_key:{api_key_id}")
}
