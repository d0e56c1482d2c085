//! # Model Gateway
//!
//! 多租户、OpenAI 兼容的 LLM 网关数据面核心库

pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod providers;
pub mod proxy;
pub mod scheduler;
pub mod security;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod trace;
pub mod utils;

pub use config::AppConfig;
pub use error::{GatewayError, Result};
