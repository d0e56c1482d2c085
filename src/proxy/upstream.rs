//! # 上游 HTTP 客户端
//!
//! reqwest 不自动跟随重定向；每一跳的目标都先经过 SSRF 校验。
//! 超时覆盖到响应头（流式）或完整响应体（非流式），流式响应另有相邻分片的空闲超时。

use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, LOCATION};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use futures::StreamExt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

use crate::error::{GatewayError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::providers::{ByteStream, UpstreamBody, UpstreamRequest, UpstreamResponse, UpstreamStream};
use crate::security::SsrfGuard;
use crate::trace::{REQUEST_ID_HEADER, TRACEPARENT_HEADER, TraceContext};
use crate::{ldebug, lwarn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// 上游回复
#[derive(Debug)]
pub enum UpstreamReply {
    /// 已读完的响应（非流式请求，或流式请求返回了错误状态）
    Complete(UpstreamResponse),
    /// 2xx 流式响应，响应体尚未读取
    Streaming(UpstreamStream),
}

/// 上游客户端
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    ssrf: Arc<SsrfGuard>,
    stream_idle_timeout: Duration,
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn transport_error(err: reqwest::Error, timeout_ms: u64) -> GatewayError {
    if err.is_timeout() {
        return GatewayError::upstream_timeout(timeout_ms);
    }
    // 去掉 URL，避免把带参数的上游地址带进错误链
    GatewayError::upstream_connection_with_source("failed to reach upstream", err.without_url())
}

/// 跨源重定向时移除所有 sensitive 请求头（鉴权头）
fn strip_sensitive(headers: &mut HeaderMap) {
    let names: Vec<_> = headers
        .iter()
        .filter(|(_, v)| v.is_sensitive())
        .map(|(k, _)| k.clone())
        .collect();
    for name in names {
        headers.remove(name);
    }
    headers.remove(AUTHORIZATION);
}

/// 相邻两个分片之间超过 `idle` 没有数据即报错结束
fn with_idle_timeout(body: ByteStream, idle: Duration) -> ByteStream {
    futures::stream::unfold(Some(body), move |state| async move {
        let mut body = state?;
        match tokio::time::timeout(idle, body.next()).await {
            Ok(Some(item)) => Some((item, Some(body))),
            Ok(None) => None,
            Err(_) => Some((
                Err(io::Error::new(io::ErrorKind::TimedOut, "upstream stream idle timeout")),
                None,
            )),
        }
    })
    .boxed()
}

impl UpstreamClient {
    pub fn new(ssrf: Arc<SsrfGuard>, stream_idle_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::internal_with_source("failed to build HTTP client", e))?;
        Ok(Self {
            http,
            ssrf,
            stream_idle_timeout,
        })
    }

    fn build(
        &self,
        method: Method,
        url: Url,
        headers: HeaderMap,
        body: UpstreamBody,
    ) -> Result<reqwest::RequestBuilder> {
        let builder = self.http.request(method, url).headers(headers);
        Ok(match body {
            UpstreamBody::Empty => builder,
            UpstreamBody::Json(value) => builder.body(serde_json::to_vec(&value)?),
            UpstreamBody::Multipart(form) => builder.multipart(form.into_reqwest_form()?),
        })
    }

    /// 发送请求；SSRF 校验、重定向与超时都在这里处理
    pub async fn send(
        &self,
        request: UpstreamRequest,
        timeout: Duration,
        trace: &TraceContext,
    ) -> Result<UpstreamReply> {
        let request_id = trace.request_id.as_str();
        let timeout_ms = millis(timeout);
        let deadline = Instant::now() + timeout;

        let UpstreamRequest {
            mut method,
            url,
            mut headers,
            mut body,
            stream,
        } = request;

        if let Ok(value) = HeaderValue::from_str(request_id) {
            headers.insert(REQUEST_ID_HEADER, value);
        }
        if let Some(value) = trace
            .outbound_traceparent()
            .and_then(|tp| HeaderValue::from_str(&tp).ok())
        {
            headers.insert(TRACEPARENT_HEADER, value);
        }

        let mut url = self.ssrf.validate_url(&url).await.inspect_err(|e| {
            lwarn!(
                request_id,
                LogStage::Security,
                LogComponent::Ssrf,
                "outbound_blocked",
                "出站地址被拒绝",
                reason = e.to_string()
            );
        })?;

        let mut hop = 0;
        let response = loop {
            let builder = self.build(method.clone(), url.clone(), headers.clone(), body.clone())?;
            let response = match tokio::time::timeout_at(deadline, builder.send()).await {
                Err(_) => return Err(GatewayError::upstream_timeout(timeout_ms)),
                Ok(Err(e)) => return Err(transport_error(e, timeout_ms)),
                Ok(Ok(response)) => response,
            };
            if !response.status().is_redirection() {
                break response;
            }
            let Some(location) = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
            else {
                break response;
            };

            let next = self
                .ssrf
                .validate_redirect(&url, location, hop)
                .await
                .inspect_err(|e| {
                    lwarn!(
                        request_id,
                        LogStage::Security,
                        LogComponent::Ssrf,
                        "redirect_blocked",
                        "重定向目标被拒绝",
                        hop = hop,
                        reason = e.to_string()
                    );
                })?;
            ldebug!(
                request_id,
                LogStage::UpstreamRequest,
                LogComponent::Upstream,
                "follow_redirect",
                "跟随上游重定向",
                hop = hop,
                status = response.status().as_u16()
            );

            let status = response.status();
            if status == StatusCode::SEE_OTHER
                || (matches!(status, StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND)
                    && method == Method::POST)
            {
                method = Method::GET;
                body = UpstreamBody::Empty;
                headers.remove(CONTENT_TYPE);
            }
            if next.origin() != url.origin() {
                strip_sensitive(&mut headers);
            }
            url = next;
            hop += 1;
        };

        let status = response.status().as_u16();
        let response_headers = response.headers().clone();

        if stream && response.status().is_success() {
            let content_type = response_headers
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = response
                .bytes_stream()
                .map(|item| item.map_err(io::Error::other))
                .boxed();
            return Ok(UpstreamReply::Streaming(UpstreamStream {
                content_type,
                body: with_idle_timeout(body, self.stream_idle_timeout),
            }));
        }

        let body = match tokio::time::timeout_at(deadline, response.bytes()).await {
            Err(_) => return Err(GatewayError::upstream_timeout(timeout_ms)),
            Ok(Err(e)) => return Err(transport_error(e, timeout_ms)),
            Ok(Ok(body)) => body,
        };
        Ok(UpstreamReply::Complete(UpstreamResponse {
            status,
            headers: response_headers,
            body,
        }))
    }
}
