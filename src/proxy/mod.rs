//! # 数据面代理
//!
//! 路由上下文、上游客户端、请求编排与 axum 服务器。

pub mod builder;
pub mod context;
pub mod handlers;
pub mod server;
pub mod service;
pub mod state;
pub mod upstream;
pub mod upstream_url;

pub use builder::GatewayBuilder;
pub use context::{ResolvedAuth, RouteContext, Secret};
pub use server::{GatewayServer, create_router};
pub use service::GatewayService;
pub use state::AppState;
pub use upstream::{UpstreamClient, UpstreamReply};

#[cfg(test)]
mod tests;
