//! # 路由调度模块
//!
//! 策略匹配、加权选择与按上游的熔断

pub mod circuit_breaker;
pub mod engine;
pub mod policy;
pub mod selector;
pub mod types;

pub use circuit_breaker::{
    BreakerSnapshot, CircuitBreaker, CircuitBreakerRegistry, CircuitState, Permit,
};
pub use engine::{RouteRequest, RoutedRequest, RoutingEngine};
pub use policy::PolicyMatcher;
pub use selector::UpstreamSelector;
pub use types::{SchedulingStrategy, WeightedUpstream};
