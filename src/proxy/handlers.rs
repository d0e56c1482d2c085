//! # HTTP 处理器
//!
//! 所有 `/v1/*` POST 端点共用一个处理器，按请求路径确定端点。

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde_json::json;

use super::state::AppState;
use crate::error::GatewayError;
use crate::store::Endpoint;

/// 存活检查，不需要鉴权
pub async fn healthz() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

pub async fn list_models(State(state): State<AppState>, headers: HeaderMap) -> Response {
    state.gateway().list_models(headers).await
}

/// OpenAI 兼容端点
pub async fn proxy(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match Endpoint::from_path(uri.path()) {
        Some(endpoint) => state.gateway().handle(endpoint, headers, body).await,
        None => GatewayError::no_route(format!("unknown endpoint {}", uri.path())).into_response(),
    }
}
