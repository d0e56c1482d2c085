//! # 数据面编排
//!
//! 单个请求的完整流水线：
//! 追踪 → 认证 → 访问控制 → 限流/配额 → 路由 → 适配器构造请求 → SSRF + 上游调用 → 解析或流式翻译。
//!
//! 熔断结果由 [`BreakerGuard`] 记录：上游故障计失败，成功计成功，调用方错误与调用方断开只归还名额。
//! 流式响应的记账（用量、日志）放在 [`StreamTracker`] 的 Drop 中，调用方中途断开也能执行。

use axum::body::Body;
use axum::http::header::{AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;

use super::context::RouteContext;
use super::upstream::{UpstreamClient, UpstreamReply};
use crate::auth::{
    AuthService, QuotaManager, RateLimitStatus, RateLimiter, check_access,
    model_allowed, rate_limit_identifier,
};
use crate::error::{GatewayError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::providers::normalize::unix_now;
use crate::providers::{AdapterRegistry, ChunkStream, PublicBody, PublicResponse, StreamChunk};
use crate::scheduler::{CircuitBreaker, CircuitBreakerRegistry, Permit, RouteRequest, RoutingEngine};
use crate::store::{Endpoint, QuotaConfig, RequestLogRecord, RequestLogSink, RouteStore, Usage};
use crate::trace::{REQUEST_ID_HEADER, RESPONSE_TIME_HEADER, TRACE_ID_HEADER, TraceContext, UPSTREAM_HEADER};
use crate::utils::parse_form;
use crate::{lerror, linfo, lwarn};

/// 调用方主动断开时记录的状态码
const CLIENT_CLOSED_STATUS: u16 = 499;
/// 日志中请求/响应体的最大字符数
const MAX_LOGGED_PAYLOAD_CHARS: usize = 16 * 1024;
const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// 数据面服务
pub struct GatewayService {
    pub(super) auth: AuthService,
    pub(super) rate_limiter: RateLimiter,
    pub(super) quota: QuotaManager,
    pub(super) engine: RoutingEngine,
    pub(super) adapters: AdapterRegistry,
    pub(super) client: UpstreamClient,
    pub(super) routes: Arc<dyn RouteStore>,
    pub(super) log_sink: Arc<dyn RequestLogSink>,
}

impl std::fmt::Debug for GatewayService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayService")
            .field("adapters", &self.adapters.names())
            .finish_non_exhaustive()
    }
}

/// 熔断结果守卫
///
/// 持有路由时拿到的 [`Permit`]；未记录成功或失败就被丢弃时交回 `release()`。
struct BreakerGuard {
    slot: Option<(Arc<CircuitBreaker>, Permit)>,
}

impl BreakerGuard {
    const fn new(breaker: Arc<CircuitBreaker>, permit: Permit) -> Self {
        Self {
            slot: Some((breaker, permit)),
        }
    }

    fn success(&mut self) {
        if let Some((breaker, permit)) = self.slot.take() {
            breaker.record_success(permit);
        }
    }

    fn failure(&mut self) {
        if let Some((breaker, permit)) = self.slot.take() {
            breaker.record_failure(permit);
        }
    }

    /// 上游故障计失败，其余错误视为调用方原因
    fn settle(&mut self, err: &GatewayError) {
        if err.is_upstream_failure() {
            self.failure();
        }
    }
}

impl Drop for BreakerGuard {
    fn drop(&mut self) {
        if let Some((breaker, permit)) = self.slot.take() {
            breaker.release(permit);
        }
    }
}

/// 请求日志草稿，随流水线推进逐步填充
#[derive(Debug, Clone)]
struct LogDraft {
    request_id: String,
    trace_id: String,
    endpoint: Endpoint,
    stream: bool,
    tenant_id: Option<String>,
    api_key_id: Option<String>,
    virtual_model: Option<String>,
    upstream_id: Option<String>,
    upstream_model: Option<String>,
    log_payloads: bool,
    request_body: Option<String>,
}

fn truncate_payload(text: &str) -> String {
    if text.chars().count() <= MAX_LOGGED_PAYLOAD_CHARS {
        return text.to_string();
    }
    let mut out: String = text.chars().take(MAX_LOGGED_PAYLOAD_CHARS).collect();
    out.push_str("...[truncated]");
    out
}

impl LogDraft {
    fn new(trace: &TraceContext, endpoint: Endpoint) -> Self {
        Self {
            request_id: trace.request_id.clone(),
            trace_id: trace.trace_id.clone(),
            endpoint,
            stream: false,
            tenant_id: None,
            api_key_id: None,
            virtual_model: None,
            upstream_id: None,
            upstream_model: None,
            log_payloads: false,
            request_body: None,
        }
    }

    fn finish(
        self,
        trace: &TraceContext,
        status: u16,
        usage: Option<Usage>,
        error_type: Option<String>,
        response_body: Option<String>,
    ) -> RequestLogRecord {
        RequestLogRecord {
            request_id: self.request_id,
            trace_id: self.trace_id,
            tenant_id: self.tenant_id,
            api_key_id: self.api_key_id,
            endpoint: self.endpoint.as_str().to_string(),
            virtual_model: self.virtual_model,
            upstream_id: self.upstream_id,
            upstream_model: self.upstream_model,
            status,
            stream: self.stream,
            duration_ms: trace.elapsed_ms(),
            ttfb_ms: trace
                .ttfb()
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            usage,
            error_type,
            request_body: self.request_body,
            response_body: if self.log_payloads {
                response_body.map(|b| truncate_payload(&b))
            } else {
                None
            },
            created_at: Utc::now(),
        }
    }
}

/// 解析调用方请求体
fn parse_public_body(endpoint: Endpoint, headers: &HeaderMap, body: &Bytes) -> Result<PublicBody> {
    if endpoint.is_multipart() {
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !content_type.starts_with("multipart/form-data") {
            return Err(GatewayError::bad_request(
                "expected a multipart/form-data request body",
            ));
        }
        return parse_form(content_type, body).map(PublicBody::Multipart);
    }
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| GatewayError::bad_request(format!("invalid JSON body: {e}")))?;
    if !value.is_object() {
        return Err(GatewayError::bad_request("request body must be a JSON object"));
    }
    Ok(PublicBody::Json(value))
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

fn apply_rate_limit_headers(headers: &mut HeaderMap, status: Option<RateLimitStatus>) {
    if let Some(status) = status {
        headers.insert("x-ratelimit-limit-requests", HeaderValue::from(status.limit));
        headers.insert("x-ratelimit-remaining-requests", HeaderValue::from(status.remaining));
    }
}

fn sse_frame(data: &str) -> Bytes {
    Bytes::from(format!("data: {data}\n\n"))
}

impl GatewayService {
    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        self.engine.breakers()
    }

    /// 处理一个 `/v1/*` 请求，所有错误都转换为 OpenAI 错误体
    pub async fn handle(self: &Arc<Self>, endpoint: Endpoint, headers: HeaderMap, body: Bytes) -> Response {
        let trace = Arc::new(TraceContext::from_headers(&headers));
        let mut draft = LogDraft::new(&trace, endpoint);

        let mut response = match self.process(endpoint, &headers, &body, &trace, &mut draft).await {
            Ok(response) => response,
            Err(err) => {
                let (status, error_type, _) = err.to_http_response_parts();
                let error_type = error_type.to_string();
                if status.is_server_error() {
                    lerror!(
                        trace.request_id,
                        LogStage::ResponseFailure,
                        LogComponent::Server,
                        "request_failed",
                        "请求处理失败",
                        status = status.as_u16(),
                        error = err.to_string()
                    );
                } else {
                    lwarn!(
                        trace.request_id,
                        LogStage::ResponseFailure,
                        LogComponent::Server,
                        "request_rejected",
                        "请求被拒绝",
                        status = status.as_u16(),
                        error = err.to_string()
                    );
                }
                self.emit(draft.finish(&trace, status.as_u16(), None, Some(error_type), None));
                err.into_response()
            }
        };
        Self::apply_trace_headers(response.headers_mut(), &trace);
        response
    }

    /// `GET /v1/models`：租户可见且 key 允许的虚拟模型
    pub async fn list_models(self: &Arc<Self>, headers: HeaderMap) -> Response {
        let trace = TraceContext::from_headers(&headers);
        let result = async {
            let authorization = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
            let auth = self.auth.authenticate(&trace.request_id, authorization).await?;
            let created = unix_now();
            let data: Vec<Value> = self
                .routes
                .virtual_models(&auth.tenant_id)
                .await?
                .into_iter()
                .filter(|model| model_allowed(&auth, model))
                .map(|id| json!({"id": id, "object": "model", "created": created, "owned_by": "model-gateway"}))
                .collect();
            Ok::<_, GatewayError>(json!({"object": "list", "data": data}))
        }
        .await;

        let mut response = match result {
            Ok(body) => axum::Json(body).into_response(),
            Err(err) => err.into_response(),
        };
        Self::apply_trace_headers(response.headers_mut(), &trace);
        response
    }

    fn apply_trace_headers(headers: &mut HeaderMap, trace: &TraceContext) {
        insert_header(headers, REQUEST_ID_HEADER, &trace.request_id);
        insert_header(headers, TRACE_ID_HEADER, &trace.trace_id);
    }

    async fn process(
        self: &Arc<Self>,
        endpoint: Endpoint,
        headers: &HeaderMap,
        body: &Bytes,
        trace: &Arc<TraceContext>,
        draft: &mut LogDraft,
    ) -> Result<Response> {
        let request_id = trace.request_id.as_str();

        let authorization = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
        let auth = self.auth.authenticate(request_id, authorization).await?;
        draft.tenant_id = Some(auth.tenant_id.clone());
        draft.api_key_id = Some(auth.api_key_id.clone());
        draft.log_payloads = auth.log_payloads;

        // 端点权限不依赖请求体，先于解析检查
        check_access(&auth, endpoint, None)?;
        let public = parse_public_body(endpoint, headers, body)?;
        if auth.log_payloads {
            draft.request_body = Some(truncate_payload(&public.describe()));
        }
        let model = public
            .model()
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| GatewayError::bad_request_param("you must provide a model parameter", "model"))?;
        let stream = public.is_stream();
        draft.virtual_model = Some(model.clone());
        draft.stream = stream;

        check_access(&auth, endpoint, Some(&model))?;
        let rate = self
            .rate_limiter
            .check(
                request_id,
                &rate_limit_identifier(&auth.api_key_id),
                endpoint.as_str(),
                auth.rate_limit,
            )
            .await?;
        self.quota
            .check(request_id, &auth.api_key_id, auth.quota)
            .await?;

        let routed = self
            .engine
            .route(RouteRequest {
                request_id,
                trace_id: &trace.trace_id,
                tenant_id: &auth.tenant_id,
                api_key_id: &auth.api_key_id,
                endpoint,
                virtual_model: &model,
                stream,
            })
            .await?;
        let ctx = routed.context;
        let mut guard = BreakerGuard::new(routed.breaker, routed.permit);
        draft.upstream_id = Some(ctx.upstream_id.clone());
        draft.upstream_model = Some(ctx.upstream_model.clone());

        let adapter = self.adapters.get(&ctx.adapter)?;
        let upstream_request = adapter.build_upstream_request(public, &ctx)?;
        linfo!(
            request_id,
            LogStage::UpstreamRequest,
            LogComponent::Upstream,
            "upstream_request",
            "转发到上游",
            upstream_id = ctx.upstream_id,
            adapter = adapter.name(),
            method = upstream_request.method.as_str(),
            stream = stream
        );

        let reply = match self.client.send(upstream_request, ctx.timeout, trace).await {
            Ok(reply) => reply,
            Err(err) => {
                guard.settle(&err);
                return Err(err);
            }
        };

        match reply {
            UpstreamReply::Complete(raw) => {
                trace.mark_first_byte();
                let upstream_status = raw.status;
                let public = match adapter.parse_upstream_response(raw, &ctx) {
                    Ok(public) => public,
                    Err(err) => {
                        let err = GatewayError::from(err);
                        lwarn!(
                            request_id,
                            LogStage::Response,
                            LogComponent::Adapter,
                            "upstream_error",
                            "上游返回错误",
                            upstream_id = ctx.upstream_id,
                            upstream_status = upstream_status,
                            counts_as_failure = err.is_upstream_failure()
                        );
                        guard.settle(&err);
                        return Err(err);
                    }
                };
                guard.success();

                let usage = public.usage();
                self.record_usage(request_id, &auth.api_key_id, auth.quota, usage)
                    .await;
                let response_body = match &public {
                    PublicResponse::Json(value) if auth.log_payloads => Some(value.to_string()),
                    _ => None,
                };
                self.emit(draft.clone().finish(trace, 200, usage, None, response_body));

                let mut response = match public {
                    PublicResponse::Json(value) => axum::Json(value).into_response(),
                    PublicResponse::Binary { content_type, body } => {
                        let mut response = Response::new(Body::from(body));
                        insert_header(response.headers_mut(), "content-type", &content_type);
                        response
                    }
                };
                let headers = response.headers_mut();
                insert_header(headers, UPSTREAM_HEADER, &ctx.upstream_id);
                headers.insert(RESPONSE_TIME_HEADER, HeaderValue::from(trace.elapsed_ms()));
                apply_rate_limit_headers(headers, rate);
                Ok(response)
            }
            UpstreamReply::Streaming(raw) => {
                let chunks = adapter.stream_translate(raw, &ctx);
                let tracker = StreamTracker {
                    service: Arc::clone(self),
                    trace: Arc::clone(trace),
                    upstream_id: ctx.upstream_id.clone(),
                    api_key_id: auth.api_key_id.clone(),
                    quota: auth.quota,
                    guard,
                    draft: draft.clone(),
                    usage: None,
                    end: None,
                };
                Ok(Self::stream_response(chunks, tracker, &ctx, rate))
            }
        }
    }

    fn stream_response(
        chunks: ChunkStream,
        tracker: StreamTracker,
        ctx: &RouteContext,
        rate: Option<RateLimitStatus>,
    ) -> Response {
        let body = futures::stream::unfold(Some((chunks, tracker)), |state| async move {
            let (mut chunks, mut tracker) = state?;
            match chunks.next().await {
                Some(Ok(chunk)) => {
                    tracker.on_chunk(&chunk);
                    let frame = sse_frame(&chunk.data);
                    Some((Ok::<_, Infallible>(frame), Some((chunks, tracker))))
                }
                Some(Err(err)) => {
                    let err = GatewayError::from(err);
                    let frame = sse_frame(&serde_json::to_string(&err.to_error_body()).unwrap_or_default());
                    tracker.fail(&err);
                    Some((Ok(frame), None))
                }
                None => {
                    tracker.complete();
                    Some((Ok(Bytes::from_static(DONE_FRAME)), None))
                }
            }
        });

        let mut response = Response::new(Body::from_stream(body));
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
        insert_header(headers, UPSTREAM_HEADER, &ctx.upstream_id);
        apply_rate_limit_headers(headers, rate);
        *response.status_mut() = StatusCode::OK;
        response
    }

    /// 按上游报告的用量记账；失败只记日志
    async fn record_usage(
        &self,
        request_id: &str,
        key_id: &str,
        quota: Option<QuotaConfig>,
        usage: Option<Usage>,
    ) {
        let Some(usage) = usage else {
            return;
        };
        if let Err(err) = self.quota.record_usage(request_id, key_id, quota, usage).await {
            lwarn!(
                request_id,
                LogStage::Response,
                LogComponent::Quota,
                "record_usage_failed",
                "配额记账失败",
                error = err.to_string()
            );
        }
    }

    /// 异步投递请求日志，失败只记日志
    fn emit(self: &Arc<Self>, record: RequestLogRecord) {
        let sink = Arc::clone(&self.log_sink);
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        handle.spawn(async move {
            let request_id = record.request_id.clone();
            if let Err(err) = sink.emit(record).await {
                lwarn!(
                    request_id,
                    LogStage::Response,
                    LogComponent::Store,
                    "log_emit_failed",
                    "请求日志投递失败",
                    error = err.to_string()
                );
            }
        });
    }
}

/// 流式响应结束方式
#[derive(Debug)]
enum StreamEnd {
    Completed,
    Failed { status: u16, error_type: String },
}

/// 流式响应的收尾：熔断结果、用量记账与请求日志
struct StreamTracker {
    service: Arc<GatewayService>,
    trace: Arc<TraceContext>,
    upstream_id: String,
    api_key_id: String,
    quota: Option<QuotaConfig>,
    guard: BreakerGuard,
    draft: LogDraft,
    usage: Option<Usage>,
    end: Option<StreamEnd>,
}

impl StreamTracker {
    fn on_chunk(&mut self, chunk: &StreamChunk) {
        self.trace.mark_first_byte();
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }
    }

    fn complete(&mut self) {
        self.guard.success();
        self.end = Some(StreamEnd::Completed);
    }

    fn fail(&mut self, err: &GatewayError) {
        let (status, error_type, _) = err.to_http_response_parts();
        lwarn!(
            self.trace.request_id,
            LogStage::Streaming,
            LogComponent::Adapter,
            "stream_failed",
            "流式响应中断",
            upstream_id = self.upstream_id,
            error = err.to_string()
        );
        self.guard.settle(err);
        self.end = Some(StreamEnd::Failed {
            status: status.as_u16(),
            error_type: error_type.to_string(),
        });
    }
}

impl Drop for StreamTracker {
    fn drop(&mut self) {
        let (status, error_type) = match self.end.take() {
            Some(StreamEnd::Completed) => (200, None),
            Some(StreamEnd::Failed { status, error_type }) => (status, Some(error_type)),
            None => {
                // 调用方断开：上游连接随分片流一起关闭，熔断器只归还名额
                linfo!(
                    self.trace.request_id,
                    LogStage::Streaming,
                    LogComponent::Server,
                    "client_disconnected",
                    "调用方中途断开流式响应",
                    upstream_id = self.upstream_id
                );
                (CLIENT_CLOSED_STATUS, Some("client_closed".to_string()))
            }
        };

        let record = self
            .draft
            .clone()
            .finish(&self.trace, status, self.usage, error_type, None);
        self.service.emit(record);

        if self.usage.is_some() && self.quota.is_some() {
            let service = Arc::clone(&self.service);
            let request_id = self.trace.request_id.clone();
            let key_id = self.api_key_id.clone();
            let (quota, usage) = (self.quota, self.usage);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    service.record_usage(&request_id, &key_id, quota, usage).await;
                });
            }
        }
    }
}
