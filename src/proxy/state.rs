//! axum 处理器共享状态

use std::ops::Deref;
use std::sync::Arc;

use super::service::GatewayService;

/// 处理器共享状态
#[derive(Debug, Clone)]
pub struct AppState {
    gateway: Arc<GatewayService>,
}

impl AppState {
    #[must_use]
    pub const fn new(gateway: Arc<GatewayService>) -> Self {
        Self { gateway }
    }

    #[must_use]
    pub const fn gateway(&self) -> &Arc<GatewayService> {
        &self.gateway
    }
}

impl Deref for AppState {
    type Target = GatewayService;

    fn deref(&self) -> &Self::Target {
        &self.gateway
    }
}
