//! # 测试辅助函数

use std::sync::{Arc, Once};
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, header};
use axum::response::Response;
use serde_json::Value;
use tower::ServiceExt;
use tracing::Level;

use crate::cache::MemoryCounterStore;
use crate::config::AppConfig;
use crate::proxy::{GatewayBuilder, GatewayService, create_router};
use crate::store::{CollectingLogSink, RequestLogRecord};
use crate::utils::{ManualClock, SharedClock};

static INIT: Once = Once::new();

/// 初始化测试日志
pub fn init_test_env() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_max_level(Level::DEBUG)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// 带可控时钟与日志收集的网关实例
pub struct TestGateway {
    pub service: Arc<GatewayService>,
    pub clock: Arc<ManualClock>,
    pub logs: Arc<CollectingLogSink>,
    router: Router,
}

impl TestGateway {
    pub async fn start(config: AppConfig) -> Self {
        Self::start_with(config, |builder| builder).await
    }

    /// 在默认装配之后再调整 builder，用来注入 mock 协作者
    pub async fn start_with(
        config: AppConfig,
        customize: impl FnOnce(GatewayBuilder) -> GatewayBuilder,
    ) -> Self {
        init_test_env();
        let now = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default();
        let clock = ManualClock::new(now);
        let shared: SharedClock = clock.clone();
        let logs = Arc::new(CollectingLogSink::default());
        let max_body_bytes = config.server.max_body_bytes;
        let builder = GatewayBuilder::new(Arc::new(config))
            .with_clock(Arc::clone(&shared))
            .with_counter_store(Arc::new(MemoryCounterStore::new(shared)))
            .with_log_sink(logs.clone());
        let service = customize(builder)
            .build()
            .await
            .expect("gateway should build");
        let router = create_router(Arc::clone(&service), max_body_bytes);
        Self {
            service,
            clock,
            logs,
            router,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible")
    }

    /// 等待异步写出的日志记录
    pub async fn wait_for_logs(&self, count: usize) -> Vec<RequestLogRecord> {
        for _ in 0..100 {
            let records = self.logs.records();
            if records.len() >= count {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.logs.records()
    }
}

/// 带 bearer token 的 JSON POST
pub fn post_json(path: &str, token: Option<&str>, body: &Value) -> Request<Body> {
    let mut builder = Request::post(path).header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder
        .body(Body::from(body.to_string()))
        .expect("valid request")
}

pub async fn body_bytes(response: Response) -> bytes::Bytes {
    to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should be readable")
}

pub async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).expect("body should be JSON")
}

pub async fn body_text(response: Response) -> String {
    String::from_utf8_lossy(&body_bytes(response).await).into_owned()
}
