//! # 请求与响应归一化
//!
//! 各适配器共用：鉴权头、额外请求头注入、模型名改写、响应字段补齐、上游错误提取。

use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{Map, Value, json};

use super::types::{ProviderResult, PublicBody, UpstreamBody, UpstreamResponse};
use crate::error::AdapterError;
use crate::proxy::{ResolvedAuth, RouteContext};
use crate::store::Endpoint;

const MAX_ERROR_TEXT: usize = 512;

fn header_name(name: &str) -> ProviderResult<HeaderName> {
    HeaderName::from_bytes(name.trim().as_bytes())
        .map_err(|_| AdapterError::configuration(format!("invalid header name '{name}'")))
}

fn header_value(name: &str, value: &str) -> ProviderResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| AdapterError::configuration(format!("invalid value for header '{name}'")))
}

/// 注入上游配置的额外请求头，再写入鉴权头（鉴权头不可被覆盖）
pub fn base_headers(ctx: &RouteContext, json_body: bool) -> ProviderResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    if json_body {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }
    for (name, value) in &ctx.headers {
        headers.insert(header_name(name)?, header_value(name, value)?);
    }
    apply_auth(&mut headers, &ctx.auth)?;
    Ok(headers)
}

fn apply_auth(headers: &mut HeaderMap, auth: &ResolvedAuth) -> ProviderResult<()> {
    match auth {
        ResolvedAuth::None => {}
        ResolvedAuth::Bearer(secret) => {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", secret.expose()))
                .map_err(|_| AdapterError::configuration("upstream credential is not a valid header value"))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        ResolvedAuth::Header { name, value } => {
            let mut header = HeaderValue::from_str(value.expose())
                .map_err(|_| AdapterError::configuration("upstream credential is not a valid header value"))?;
            header.set_sensitive(true);
            headers.insert(header_name(name)?, header);
        }
    }
    Ok(())
}

/// 托管服务必须携带凭证
pub fn require_credential(ctx: &RouteContext, adapter: &str) -> ProviderResult<()> {
    if matches!(ctx.auth, ResolvedAuth::None) {
        return Err(AdapterError::configuration(format!(
            "{adapter} upstream '{}' has no credential configured",
            ctx.upstream_id
        )));
    }
    Ok(())
}

/// 改写请求体中的模型名为上游模型
pub fn prepare_body(body: PublicBody, ctx: &RouteContext) -> UpstreamBody {
    match body {
        PublicBody::Json(mut value) => {
            if let Some(obj) = value.as_object_mut() {
                obj.insert("model".to_string(), Value::String(ctx.upstream_model.clone()));
            }
            UpstreamBody::Json(value)
        }
        PublicBody::Multipart(mut form) => {
            form.set_text("model", &ctx.upstream_model);
            UpstreamBody::Multipart(form)
        }
    }
}

#[must_use]
pub fn zero_usage() -> Value {
    json!({"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0})
}

#[must_use]
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn ensure_usage(obj: &mut Map<String, Value>) {
    match obj.get_mut("usage") {
        Some(Value::Object(usage)) => {
            let prompt = usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0);
            let completion = usage
                .get("completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            usage.entry("prompt_tokens").or_insert(json!(prompt));
            usage.entry("total_tokens").or_insert(json!(prompt + completion));
        }
        _ => {
            obj.insert("usage".to_string(), zero_usage());
        }
    }
}

/// 补齐 `object`/`model`/`usage`，模型名统一为调用方请求的虚拟模型
pub fn normalize_response(value: Value, ctx: &RouteContext) -> ProviderResult<Value> {
    let Value::Object(mut obj) = value else {
        return Err(AdapterError::translation("upstream response is not a JSON object"));
    };
    if let Some(object) = ctx.endpoint.default_object() {
        obj.entry("object").or_insert_with(|| json!(object));
    }
    if ctx.endpoint.reports_usage() || obj.contains_key("model") {
        obj.insert("model".to_string(), Value::String(ctx.virtual_model.clone()));
    }
    if ctx.endpoint.reports_usage() {
        ensure_usage(&mut obj);
    }
    if matches!(ctx.endpoint, Endpoint::ChatCompletions | Endpoint::Completions) {
        obj.entry("id")
            .or_insert_with(|| json!(format!("chatcmpl-{}", ctx.request_id)));
        obj.entry("created").or_insert_with(|| json!(unix_now()));
    }
    Ok(Value::Object(obj))
}

/// 流式分片补齐 `object`/`model`
pub fn normalize_chunk(value: Value, ctx: &RouteContext) -> ProviderResult<Value> {
    let Value::Object(mut obj) = value else {
        return Err(AdapterError::translation("upstream stream chunk is not a JSON object"));
    };
    let object = match ctx.endpoint {
        Endpoint::Completions => "text_completion",
        _ => "chat.completion.chunk",
    };
    obj.entry("object").or_insert_with(|| json!(object));
    obj.insert("model".to_string(), Value::String(ctx.virtual_model.clone()));
    obj.entry("id")
        .or_insert_with(|| json!(format!("chatcmpl-{}", ctx.request_id)));
    obj.entry("created").or_insert_with(|| json!(unix_now()));
    Ok(Value::Object(obj))
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn truncate(text: &str) -> String {
    if text.len() <= MAX_ERROR_TEXT {
        return text.to_string();
    }
    let mut end = MAX_ERROR_TEXT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

/// 从上游错误体中提取 message/type/code
///
/// 兼容 `{"error":{...}}`、`{"error":"..."}`、`{"message":..}` 与 `{"detail":..}`。
#[must_use]
pub fn extract_upstream_error(status: u16, body: &[u8]) -> AdapterError {
    let fallback = || format!("upstream returned status {status}");
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        let text = String::from_utf8_lossy(body);
        let text = text.trim();
        let message = if text.is_empty() { fallback() } else { truncate(text) };
        return AdapterError::upstream(status, message, None, None);
    };

    let (message, error_type, code) = match value.get("error") {
        Some(Value::Object(err)) => (
            err.get("message").and_then(value_to_string),
            err.get("type").and_then(value_to_string),
            err.get("code").and_then(value_to_string),
        ),
        Some(Value::String(msg)) => (Some(msg.clone()), None, None),
        _ => (
            value
                .get("message")
                .or_else(|| value.get("detail"))
                .and_then(value_to_string),
            value.get("type").and_then(value_to_string),
            value.get("code").and_then(value_to_string),
        ),
    };
    AdapterError::upstream(
        status,
        truncate(&message.unwrap_or_else(fallback)),
        error_type,
        code,
    )
}

/// 非 2xx 转错误，2xx 解析为 JSON
pub fn parse_json_response(raw: &UpstreamResponse) -> ProviderResult<Value> {
    if !raw.is_success() {
        return Err(extract_upstream_error(raw.status, &raw.body));
    }
    serde_json::from_slice(&raw.body)
        .map_err(|e| AdapterError::translation(format!("upstream returned invalid JSON: {e}")))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::proxy::Secret;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::time::Duration;

    pub(crate) fn ctx(endpoint: Endpoint, adapter: &str, extras: Value) -> RouteContext {
        RouteContext {
            request_id: "req-1".into(),
            trace_id: "trace-1".into(),
            tenant_id: "tenant-a".into(),
            api_key_id: "key-1".into(),
            endpoint,
            virtual_model: "gpt-4".into(),
            stream: false,
            upstream_id: "up-1".into(),
            upstream_model: "gpt-4-0613".into(),
            base_url: "https://api.example.com/v1".into(),
            adapter: adapter.into(),
            auth: ResolvedAuth::Bearer(Secret::new("sk-upstream".into())),
            headers: BTreeMap::new(),
            model_override: None,
            timeout: Duration::from_secs(30),
            extras,
        }
    }

    #[test]
    fn missing_usage_is_zeroed_and_model_is_virtual() {
        let c = ctx(Endpoint::ChatCompletions, "openai", Value::Null);
        let raw = json!({
            "id": "x",
            "object": "chat.completion",
            "model": "gpt-4-0613",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}]
        });
        let out = normalize_response(raw, &c).unwrap();
        assert_eq!(out["model"], "gpt-4");
        assert_eq!(out["usage"], zero_usage());
        assert_eq!(out["id"], "x");
    }

    #[test]
    fn missing_object_defaults_by_endpoint() {
        let c = ctx(Endpoint::Embeddings, "openai", Value::Null);
        let out = normalize_response(json!({"data": []}), &c).unwrap();
        assert_eq!(out["object"], "list");
        assert_eq!(out["model"], "gpt-4");
    }

    #[test]
    fn partial_usage_gets_total() {
        let c = ctx(Endpoint::Embeddings, "openai", Value::Null);
        let out = normalize_response(json!({"usage": {"prompt_tokens": 7}}), &c).unwrap();
        assert_eq!(out["usage"]["total_tokens"], 7);
    }

    #[test]
    fn error_shapes_are_extracted() {
        let err = extract_upstream_error(
            400,
            br#"{"error":{"message":"bad temp","type":"invalid_request_error","code":"x"}}"#,
        );
        assert_eq!(err.message, "bad temp");
        assert_eq!(err.error_type, "invalid_request_error");
        assert_eq!(err.http_status().as_u16(), 400);

        let err = extract_upstream_error(422, br#"{"detail":"field required"}"#);
        assert_eq!(err.message, "field required");

        let err = extract_upstream_error(500, b"");
        assert_eq!(err.message, "upstream returned status 500");
        assert_eq!(err.http_status().as_u16(), 502);
    }

    #[test]
    fn upstream_auth_failure_maps_to_bad_gateway() {
        let err = extract_upstream_error(401, br#"{"error":{"message":"invalid key"}}"#);
        assert_eq!(err.http_status().as_u16(), 502);
    }

    #[test]
    fn headers_carry_sensitive_auth_and_injected_values() {
        let mut c = ctx(Endpoint::ChatCompletions, "openai", Value::Null);
        c.headers.insert("x-extra".into(), "1".into());
        c.headers.insert("authorization".into(), "Bearer spoofed".into());
        let headers = base_headers(&c, true).unwrap();
        assert_eq!(headers["x-extra"], "1");
        assert_eq!(headers[AUTHORIZATION], "Bearer sk-upstream");
        assert!(headers[AUTHORIZATION].is_sensitive());
        assert!(!format!("{headers:?}").contains("sk-upstream"));
    }
}
