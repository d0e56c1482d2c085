//! # 模板配置的自定义 HTTP 适配器
//!
//! 全部行为来自上游配置的 `extras`：
//!
//! ```json
//! {
//!   "method": "POST",
//!   "path": "/generate/{{ctx.model}}",
//!   "endpoints": ["chat_completions"],
//!   "headers": {"x-task": "chat"},
//!   "request_template": {"prompt": "{{messages|last}}", "max_new_tokens": "{{max_tokens|default:256}}"},
//!   "response_mapping": {"choices[0].message.content": "$.generated_text"},
//!   "stream_format": "ndjson",
//!   "stream_mapping": {"choices[0].delta.content": "$.token.text"}
//! }
//! ```
//!
//! 模板作用域为请求体字段加上 `ctx`（model、virtual_model、request_id、trace_id、tenant_id、endpoint、stream）。

use axum::http::{HeaderName, HeaderValue, Method};
use serde_json::{Map, Value, json};

use super::normalize::{base_headers, normalize_response, parse_json_response, zero_usage};
use super::stream::{StreamFormat, translate};
use super::template::{apply_mapping, render_str, render_value};
use super::traits::ProviderAdapter;
use super::types::{
    Capability, ChunkStream, ProviderResult, PublicBody, PublicResponse, UpstreamBody,
    UpstreamRequest, UpstreamResponse, UpstreamStream,
};
use crate::error::AdapterError;
use crate::proxy::RouteContext;
use crate::proxy::upstream_url::join_upstream_url;
use crate::store::Endpoint;

/// 自定义 HTTP 适配器
#[derive(Debug, Default, Clone, Copy)]
pub struct CustomHttpAdapter;

impl CustomHttpAdapter {
    pub const NAME: &'static str = "custom_http";
}

fn extras_object<'a>(ctx: &'a RouteContext, key: &str) -> ProviderResult<Option<&'a Map<String, Value>>> {
    match ctx.extras.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(_) => Err(AdapterError::configuration(format!(
            "custom upstream '{}': '{key}' must be an object",
            ctx.upstream_id
        ))),
    }
}

/// 上游配置允许的端点，缺省只允许 chat
fn endpoint_enabled(ctx: &RouteContext) -> bool {
    ctx.extras
        .get("endpoints")
        .and_then(Value::as_array)
        .map_or(ctx.endpoint == Endpoint::ChatCompletions, |list| {
            list.iter()
                .filter_map(Value::as_str)
                .any(|e| e == ctx.endpoint.as_str())
        })
}

/// 模板作用域：请求体字段 + `ctx`
fn template_scope(body: &Value, ctx: &RouteContext) -> Value {
    let mut scope = match body {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    scope.insert(
        "ctx".to_string(),
        json!({
            "model": ctx.upstream_model,
            "virtual_model": ctx.virtual_model,
            "request_id": ctx.request_id,
            "trace_id": ctx.trace_id,
            "tenant_id": ctx.tenant_id,
            "endpoint": ctx.endpoint.as_str(),
            "stream": ctx.stream,
        }),
    );
    Value::Object(scope)
}

/// 公共响应骨架，映射结果写入其中
fn response_skeleton(ctx: &RouteContext) -> Value {
    match ctx.endpoint {
        Endpoint::ChatCompletions => json!({
            "choices": [{"index": 0, "message": {"role": "assistant", "content": ""}, "finish_reason": "stop"}],
            "usage": zero_usage()
        }),
        Endpoint::Completions => json!({
            "choices": [{"index": 0, "text": "", "finish_reason": "stop"}],
            "usage": zero_usage()
        }),
        Endpoint::Embeddings => json!({
            "data": [{"object": "embedding", "index": 0, "embedding": []}],
            "usage": zero_usage()
        }),
        Endpoint::Rerank => json!({"results": [], "usage": zero_usage()}),
        _ => json!({}),
    }
}

fn chunk_skeleton(endpoint: Endpoint) -> Value {
    match endpoint {
        Endpoint::Completions => json!({"choices": [{"index": 0, "text": "", "finish_reason": null}]}),
        _ => json!({"choices": [{"index": 0, "delta": {"content": ""}, "finish_reason": null}]}),
    }
}

fn parse_method(ctx: &RouteContext) -> ProviderResult<Method> {
    let method = ctx.extra_str("method").unwrap_or("POST");
    Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| AdapterError::configuration(format!("invalid HTTP method '{method}'")))
}

impl ProviderAdapter for CustomHttpAdapter {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Endpoint(endpoint) => matches!(
                endpoint,
                Endpoint::ChatCompletions
                    | Endpoint::Completions
                    | Endpoint::Embeddings
                    | Endpoint::Rerank
            ),
            Capability::Stream(endpoint) => {
                matches!(endpoint, Endpoint::ChatCompletions | Endpoint::Completions)
            }
        }
    }

    fn build_upstream_request(
        &self,
        body: PublicBody,
        ctx: &RouteContext,
    ) -> ProviderResult<UpstreamRequest> {
        if !self.supports(Capability::Endpoint(ctx.endpoint)) || !endpoint_enabled(ctx) {
            return Err(AdapterError::unsupported_endpoint(Self::NAME, ctx.endpoint.path()));
        }
        if ctx.stream
            && (!self.supports(Capability::Stream(ctx.endpoint))
                || extras_object(ctx, "stream_mapping")?.is_none())
        {
            return Err(AdapterError::invalid_param(
                "streaming is not configured for this upstream",
                "stream",
            ));
        }
        let PublicBody::Json(body) = body else {
            return Err(AdapterError::invalid_param("expected a JSON request body", "body"));
        };

        let scope = template_scope(&body, ctx);
        let path_template = ctx.extra_str("path").ok_or_else(|| {
            AdapterError::configuration(format!(
                "custom upstream '{}' is missing 'path'",
                ctx.upstream_id
            ))
        })?;
        let path = match render_str(path_template, &scope)? {
            Value::String(s) => s,
            other => other.to_string(),
        };

        let method = parse_method(ctx)?;
        let upstream_body = match ctx.extras.get("request_template") {
            Some(template) if !template.is_null() => UpstreamBody::Json(render_value(template, &scope)?),
            _ if method == Method::GET => UpstreamBody::Empty,
            _ => UpstreamBody::Json(body),
        };

        let mut headers = base_headers(ctx, matches!(upstream_body, UpstreamBody::Json(_)))?;
        if let Some(extra) = extras_object(ctx, "headers")? {
            for (name, template) in extra {
                let value = match render_value(template, &scope)? {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|_| AdapterError::configuration(format!("invalid header name '{name}'")))?;
                let value = HeaderValue::from_str(&value)
                    .map_err(|_| AdapterError::configuration("invalid templated header value"))?;
                // 鉴权头优先
                headers.entry(name).or_insert(value);
            }
        }

        Ok(UpstreamRequest {
            method,
            url: join_upstream_url(&ctx.base_url, &path)?,
            headers,
            body: upstream_body,
            stream: ctx.stream,
        })
    }

    fn parse_upstream_response(
        &self,
        raw: UpstreamResponse,
        ctx: &RouteContext,
    ) -> ProviderResult<PublicResponse> {
        let value = parse_json_response(&raw)?;
        let value = match extras_object(ctx, "response_mapping")? {
            Some(mapping) => apply_mapping(response_skeleton(ctx), mapping, &value)?,
            None => value,
        };
        normalize_response(value, ctx).map(PublicResponse::Json)
    }

    fn stream_translate(&self, raw: UpstreamStream, ctx: &RouteContext) -> ChunkStream {
        let format = StreamFormat::detect(ctx, raw.content_type.as_deref());
        let mapping = extras_object(ctx, "stream_mapping").map(|m| m.cloned());
        let endpoint = ctx.endpoint;
        translate(raw, format, ctx, move |value| match &mapping {
            Ok(Some(mapping)) => apply_mapping(chunk_skeleton(endpoint), mapping, &value).map(Some),
            Ok(None) => Ok(Some(value)),
            Err(e) => Err(e.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::normalize::tests::ctx;
    use axum::http::HeaderMap;
    use bytes::Bytes;
    use futures::{StreamExt, stream};
    use pretty_assertions::assert_eq;

    fn tgi_extras() -> Value {
        json!({
            "path": "/generate",
            "headers": {"x-model": "{{ctx.model}}"},
            "request_template": {
                "inputs": "{{messages|last}}",
                "parameters": {
                    "max_new_tokens": "{{max_tokens|default:128}}",
                    "stop": "{{stop}}"
                }
            },
            "response_mapping": {
                "choices[0].message.content": "$.generated_text",
                "usage.completion_tokens": "$.details.generated_tokens",
                "usage.total_tokens": "$.details.generated_tokens"
            },
            "stream_format": "sse",
            "stream_mapping": {"choices[0].delta.content": "$.token.text"}
        })
    }

    #[test]
    fn request_template_is_rendered() {
        let mut c = ctx(Endpoint::ChatCompletions, "custom_http", tgi_extras());
        c.base_url = "http://tgi.internal".into();
        let body = PublicBody::Json(json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}],
            "stop": ["\n"]
        }));
        let req = CustomHttpAdapter.build_upstream_request(body, &c).unwrap();
        assert_eq!(req.url, "http://tgi.internal/generate");
        assert_eq!(req.method, Method::POST);
        assert_eq!(req.headers["x-model"], "gpt-4-0613");
        let UpstreamBody::Json(payload) = req.body else {
            panic!("expected json");
        };
        assert_eq!(
            payload,
            json!({
                "inputs": {"role": "user", "content": "hi"},
                "parameters": {"max_new_tokens": 128, "stop": ["\n"]}
            })
        );
    }

    #[test]
    fn response_mapping_fills_chat_skeleton() {
        let c = ctx(Endpoint::ChatCompletions, "custom_http", tgi_extras());
        let raw = UpstreamResponse {
            status: 200,
            headers: HeaderMap::new(),
            body: Bytes::from(json!({"generated_text": "hello", "details": {"generated_tokens": 3}}).to_string()),
        };
        let PublicResponse::Json(v) = CustomHttpAdapter.parse_upstream_response(raw, &c).unwrap() else {
            panic!("expected json");
        };
        assert_eq!(v["object"], "chat.completion");
        assert_eq!(v["model"], "gpt-4");
        assert_eq!(v["choices"][0]["message"]["content"], "hello");
        assert_eq!(v["choices"][0]["message"]["role"], "assistant");
        assert_eq!(v["usage"]["total_tokens"], 3);
        assert_eq!(v["usage"]["prompt_tokens"], 0);
    }

    #[test]
    fn missing_path_is_configuration_error() {
        let c = ctx(Endpoint::ChatCompletions, "custom_http", json!({}));
        let err = CustomHttpAdapter
            .build_upstream_request(PublicBody::Json(json!({})), &c)
            .unwrap_err();
        assert_eq!(err.http_status().as_u16(), 400);
        assert_eq!(err.code.as_deref(), Some("adapter_misconfigured"));
    }

    #[test]
    fn endpoints_are_opt_in() {
        let c = ctx(Endpoint::Embeddings, "custom_http", tgi_extras());
        assert!(CustomHttpAdapter.build_upstream_request(PublicBody::Json(json!({})), &c).is_err());
        let c = ctx(
            Endpoint::Embeddings,
            "custom_http",
            json!({"path": "/embed", "endpoints": ["embeddings"]}),
        );
        assert!(CustomHttpAdapter.build_upstream_request(PublicBody::Json(json!({})), &c).is_ok());
    }

    #[test]
    fn stream_without_mapping_is_rejected() {
        let mut c = ctx(Endpoint::ChatCompletions, "custom_http", json!({"path": "/x"}));
        c.stream = true;
        let err = CustomHttpAdapter
            .build_upstream_request(PublicBody::Json(json!({})), &c)
            .unwrap_err();
        assert_eq!(err.param.as_deref(), Some("stream"));
    }

    #[tokio::test]
    async fn stream_mapping_builds_deltas() {
        let c = ctx(Endpoint::ChatCompletions, "custom_http", tgi_extras());
        let items: Vec<std::io::Result<Bytes>> = vec![Ok(Bytes::from_static(
            b"data: {\"token\":{\"text\":\"He\"}}\n\ndata: {\"token\":{\"text\":\"y\"}}\n\n",
        ))];
        let raw = UpstreamStream {
            content_type: Some("text/event-stream".into()),
            body: stream::iter(items).boxed(),
        };
        let chunks: Vec<_> = CustomHttpAdapter.stream_translate(raw, &c).collect().await;
        let texts: Vec<String> = chunks
            .into_iter()
            .map(|c| {
                let v: Value = serde_json::from_str(&c.unwrap().data).unwrap();
                v["choices"][0]["delta"]["content"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(texts, vec!["He".to_string(), "y".to_string()]);
    }
}
