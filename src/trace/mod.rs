//! # 请求追踪
//!
//! 分配请求 ID，传播或生成 trace ID（支持 `X-Trace-ID` 与 W3C `traceparent`），
//! 并记录总耗时与首字节时间。

use axum::http::HeaderMap;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const TRACE_ID_HEADER: &str = "x-trace-id";
pub const TRACEPARENT_HEADER: &str = "traceparent";
pub const RESPONSE_TIME_HEADER: &str = "x-response-time-ms";
pub const UPSTREAM_HEADER: &str = "x-gateway-upstream";

const MAX_ID_LEN: usize = 128;

/// 单个请求的追踪上下文
#[derive(Debug)]
pub struct TraceContext {
    pub request_id: String,
    pub trace_id: String,
    /// 调用方 traceparent 中的 span id
    pub parent_span_id: Option<String>,
    started: Instant,
    first_byte: OnceLock<Duration>,
}

fn is_valid_id(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_ID_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
}

fn is_hex_of_len(value: &str, len: usize) -> bool {
    value.len() == len && value.chars().all(|c| c.is_ascii_hexdigit())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
}

/// 解析 `traceparent`：`version-traceid-spanid-flags`，返回 (trace id, span id)
#[must_use]
pub fn parse_traceparent(value: &str) -> Option<(String, String)> {
    let mut parts = value.trim().split('-');
    let version = parts.next()?;
    let trace_id = parts.next()?;
    let span_id = parts.next()?;
    let flags = parts.next()?;
    if !is_hex_of_len(version, 2) || version.eq_ignore_ascii_case("ff") {
        return None;
    }
    // 版本 00 不允许额外字段
    if version == "00" && parts.next().is_some() {
        return None;
    }
    if !is_hex_of_len(trace_id, 32) || trace_id.chars().all(|c| c == '0') {
        return None;
    }
    if !is_hex_of_len(span_id, 16) || span_id.chars().all(|c| c == '0') {
        return None;
    }
    if !is_hex_of_len(flags, 2) {
        return None;
    }
    Some((trace_id.to_ascii_lowercase(), span_id.to_ascii_lowercase()))
}

/// 生成请求 ID（UUIDv7，按时间单调递增）
#[must_use]
pub fn generate_request_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// 生成 32 位十六进制 trace ID
#[must_use]
pub fn generate_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

impl TraceContext {
    /// 从入站请求头构建
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let request_id = header_str(headers, REQUEST_ID_HEADER)
            .filter(|v| is_valid_id(v))
            .map_or_else(generate_request_id, str::to_string);

        let traceparent = header_str(headers, TRACEPARENT_HEADER).and_then(parse_traceparent);
        let (trace_id, parent_span_id) = match header_str(headers, TRACE_ID_HEADER)
            .filter(|v| is_valid_id(v))
        {
            Some(explicit) => (explicit.to_string(), traceparent.map(|(_, span)| span)),
            None => match traceparent {
                Some((trace, span)) => (trace, Some(span)),
                None => (generate_trace_id(), None),
            },
        };

        Self {
            request_id,
            trace_id,
            parent_span_id,
            started: Instant::now(),
            first_byte: OnceLock::new(),
        }
    }

    /// 发往上游的 traceparent；trace ID 不是 W3C 格式时返回 None
    #[must_use]
    pub fn outbound_traceparent(&self) -> Option<String> {
        is_hex_of_len(&self.trace_id, 32)
            .then(|| format!("00-{}-{:016x}-01", self.trace_id, fastrand::u64(1..)))
    }

    /// 记录首字节时间，只有第一次调用生效
    pub fn mark_first_byte(&self) {
        let _ = self.first_byte.set(self.started.elapsed());
    }

    #[must_use]
    pub fn ttfb(&self) -> Option<Duration> {
        self.first_byte.get().copied()
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use pretty_assertions::assert_eq;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_str(v).unwrap());
        }
        map
    }

    #[test]
    fn generates_ids_when_absent() {
        let ctx = TraceContext::from_headers(&HeaderMap::new());
        assert!(!ctx.request_id.is_empty());
        assert_eq!(ctx.trace_id.len(), 32);
        assert!(ctx.parent_span_id.is_none());
    }

    #[test]
    fn keeps_caller_request_id() {
        let ctx = TraceContext::from_headers(&headers(&[(REQUEST_ID_HEADER, "abc-123")]));
        assert_eq!(ctx.request_id, "abc-123");
    }

    #[test]
    fn rejects_unsafe_request_id() {
        let ctx = TraceContext::from_headers(&headers(&[(REQUEST_ID_HEADER, "bad id\twith tab")]));
        assert_ne!(ctx.request_id, "bad id\twith tab");
        assert!(!ctx.request_id.is_empty());
    }

    #[test]
    fn extracts_trace_id_from_traceparent() {
        let ctx = TraceContext::from_headers(&headers(&[(
            TRACEPARENT_HEADER,
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
        )]));
        assert_eq!(ctx.trace_id, "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(ctx.parent_span_id.as_deref(), Some("00f067aa0ba902b7"));
    }

    #[test]
    fn explicit_trace_header_wins() {
        let ctx = TraceContext::from_headers(&headers(&[
            (TRACE_ID_HEADER, "my-trace"),
            (TRACEPARENT_HEADER, "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"),
        ]));
        assert_eq!(ctx.trace_id, "my-trace");
        assert!(ctx.outbound_traceparent().is_none());
    }

    #[test]
    fn invalid_traceparent_ignored() {
        assert!(parse_traceparent("00-00000000000000000000000000000000-00f067aa0ba902b7-01").is_none());
        assert!(parse_traceparent("ff-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01").is_none());
        assert!(parse_traceparent("garbage").is_none());
    }

    #[test]
    fn ttfb_recorded_once() {
        let ctx = TraceContext::from_headers(&HeaderMap::new());
        assert!(ctx.ttfb().is_none());
        ctx.mark_first_byte();
        let first = ctx.ttfb();
        std::thread::sleep(Duration::from_millis(2));
        ctx.mark_first_byte();
        assert_eq!(ctx.ttfb(), first);
        let outbound = ctx.outbound_traceparent().unwrap();
        assert!(outbound.starts_with(&format!("00-{}-", ctx.trace_id)));
    }
}
