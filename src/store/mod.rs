//! # 外部协作者
//!
//! 路由表、key 表、凭证解密和请求日志都在数据面之外；这里定义接口和基于配置文件的默认实现。

mod log_sink;
mod memory;
mod secrets;
mod traits;
mod types;

#[cfg(any(test, feature = "testing"))]
pub use log_sink::CollectingLogSink;
pub use log_sink::TracingLogSink;
pub use memory::{StaticStore, model_pattern_matches};
pub use secrets::ReferenceSecretResolver;
pub use traits::{ApiKeyStore, RequestLogSink, RouteStore, SecretResolver};
pub use types::{
    Endpoint, KeyRecord, QuotaConfig, RateLimitConfig, RequestLogRecord,
    RouteRecord, RouteTarget, UpstreamAuth, UpstreamConfig, Usage,
};
