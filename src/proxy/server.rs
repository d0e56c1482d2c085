//! # 数据面 HTTP 服务器

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use super::handlers;
use super::service::GatewayService;
use super::state::AppState;
use crate::config::ServerConfig;
use crate::error::{GatewayError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::store::Endpoint;
use crate::{lerror, linfo};

/// 构建路由：`/healthz`、`GET /v1/models` 与全部 OpenAI 兼容 POST 端点
pub fn create_router(gateway: Arc<GatewayService>, max_body_bytes: usize) -> Router {
    let mut router = Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/v1/models", get(handlers::list_models));
    for endpoint in Endpoint::ALL {
        router = router.route(endpoint.path(), post(handlers::proxy));
    }
    router
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(DefaultBodyLimit::disable())
                .layer(RequestBodyLimitLayer::new(max_body_bytes)),
        )
        .with_state(AppState::new(gateway))
}

/// 数据面服务器
#[derive(Debug)]
pub struct GatewayServer {
    config: ServerConfig,
    router: Router,
}

/// 等待 Ctrl+C
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => linfo!(
            "system",
            LogStage::Shutdown,
            LogComponent::Server,
            "shutdown_signal",
            "收到 Ctrl+C，开始优雅关闭"
        ),
        Err(e) => lerror!(
            "system",
            LogStage::Shutdown,
            LogComponent::Server,
            "ctrl_c_error",
            "无法监听 Ctrl+C",
            error = e.to_string()
        ),
    }
}

impl GatewayServer {
    #[must_use]
    pub fn new(config: ServerConfig, gateway: Arc<GatewayService>) -> Self {
        let router = create_router(gateway, config.max_body_bytes);
        Self { config, router }
    }

    /// 绑定端口并运行，直到收到关闭信号
    pub async fn serve(self) -> Result<()> {
        let addr = self.config.bind_address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| GatewayError::server_start_with_source(format!("无法绑定 {addr}"), e))?;

        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::Server,
            "server_start",
            "数据面服务器已启动",
            addr = addr
        );

        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| GatewayError::server_start_with_source("服务器运行出错", e))?;

        linfo!(
            "system",
            LogStage::Shutdown,
            LogComponent::Server,
            "server_stopped",
            "数据面服务器已关闭"
        );
        Ok(())
    }
}
