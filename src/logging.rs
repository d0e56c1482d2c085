//! # 日志配置模块
//!
//! 结构化日志宏与订阅器初始化。每条数据面日志都带有 `request_id`、`stage`、
//! `component`、`operation` 四个字段，便于按请求串联。

use std::env;
use std::fmt;
use tracing_subscriber::{EnvFilter, fmt as tfmt, layer::SubscriberExt, util::SubscriberInitExt};

/// 请求处理阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStage {
    Startup,
    Shutdown,
    Configuration,
    Authentication,
    RateLimit,
    Routing,
    Scheduling,
    RequestModify,
    UpstreamRequest,
    Response,
    ResponseFailure,
    Streaming,
    Security,
    Cache,
    Error,
}

impl fmt::Display for LogStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Startup => "startup",
            Self::Shutdown => "shutdown",
            Self::Configuration => "configuration",
            Self::Authentication => "authentication",
            Self::RateLimit => "rate_limit",
            Self::Routing => "routing",
            Self::Scheduling => "scheduling",
            Self::RequestModify => "request_modify",
            Self::UpstreamRequest => "upstream_request",
            Self::Response => "response",
            Self::ResponseFailure => "response_failure",
            Self::Streaming => "streaming",
            Self::Security => "security",
            Self::Cache => "cache",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// 产生日志的组件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogComponent {
    Main,
    Server,
    Config,
    Crypto,
    Auth,
    RateLimiter,
    Quota,
    Router,
    Scheduler,
    CircuitBreaker,
    Adapter,
    Ssrf,
    Upstream,
    Tracing,
    Cache,
    Store,
}

impl fmt::Display for LogComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Main => "main",
            Self::Server => "server",
            Self::Config => "config",
            Self::Crypto => "crypto",
            Self::Auth => "auth",
            Self::RateLimiter => "rate_limiter",
            Self::Quota => "quota",
            Self::Router => "router",
            Self::Scheduler => "scheduler",
            Self::CircuitBreaker => "circuit_breaker",
            Self::Adapter => "adapter",
            Self::Ssrf => "ssrf",
            Self::Upstream => "upstream",
            Self::Tracing => "tracing",
            Self::Cache => "cache",
            Self::Store => "store",
        };
        f.write_str(s)
    }
}

#[doc(hidden)]
#[macro_export]
macro_rules! __gateway_log {
    ($level:ident, $request_id:expr, $stage:expr, $component:expr, $operation:expr, $message:expr $(, $key:ident = $value:expr)* $(,)?) => {
        ::tracing::$level!(
            request_id = %$request_id,
            stage = %$stage,
            component = %$component,
            operation = $operation,
            $($key = ?$value,)*
            "{}",
            $message
        )
    };
}

/// INFO 级结构化日志
#[macro_export]
macro_rules! linfo {
    ($($t:tt)*) => { $crate::__gateway_log!(info, $($t)*) };
}

/// DEBUG 级结构化日志
#[macro_export]
macro_rules! ldebug {
    ($($t:tt)*) => { $crate::__gateway_log!(debug, $($t)*) };
}

/// WARN 级结构化日志
#[macro_export]
macro_rules! lwarn {
    ($($t:tt)*) => { $crate::__gateway_log!(warn, $($t)*) };
}

/// ERROR 级结构化日志
#[macro_export]
macro_rules! lerror {
    ($($t:tt)*) => { $crate::__gateway_log!(error, $($t)*) };
}

/// 初始化日志系统
///
/// `RUST_LOG` 优先于配置里的级别；`json` 为真时输出 JSON 行。
pub fn init_logging(log_level: Option<&str>, json: bool) {
    let level = log_level.unwrap_or("info");
    let default_filter = format!("{level},model_gateway={level},hyper=warn,reqwest=warn");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(tfmt::layer().json().with_target(true).with_current_span(false))
            .try_init()
    } else {
        registry
            .with(
                tfmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_thread_ids(false)
                    .with_thread_names(false)
                    .with_file(false)
                    .with_line_number(false)
                    .compact(),
            )
            .try_init()
    };

    if result.is_err() {
        // 测试中可能重复初始化
        tracing::debug!("日志订阅器已安装，跳过");
    }

    if env::var("RUST_LOG").is_ok() {
        tracing::info!("日志过滤规则取自 RUST_LOG");
    }
}
