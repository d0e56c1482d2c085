//! # OpenAI 官方托管服务适配器
//!
//! 公共协议与上游协议一致，只需改写模型名、附加鉴权，并对响应做字段补齐。

use axum::http::{HeaderValue, Method};
use serde_json::{Value, json};

use super::normalize::{
    base_headers, extract_upstream_error, normalize_response, parse_json_response, prepare_body,
    require_credential,
};
use super::stream::{StreamFormat, translate};
use super::traits::ProviderAdapter;
use super::types::{
    Capability, ChunkStream, ProviderResult, PublicBody, PublicResponse, UpstreamBody,
    UpstreamRequest, UpstreamResponse, UpstreamStream,
};
use crate::error::AdapterError;
use crate::proxy::RouteContext;
use crate::proxy::upstream_url::join_upstream_url;
use crate::store::Endpoint;

/// OpenAI 官方 API 适配器
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenAIAdapter;

impl OpenAIAdapter {
    pub const NAME: &'static str = "openai";

    /// 流式请求默认要求上游在最后一个分片里报告用量
    fn request_stream_usage(body: &mut UpstreamBody) {
        if let UpstreamBody::Json(Value::Object(obj)) = body {
            let options = obj
                .entry("stream_options")
                .or_insert_with(|| json!({}));
            if let Some(options) = options.as_object_mut() {
                options.entry("include_usage").or_insert(Value::Bool(true));
            }
        }
    }
}

impl ProviderAdapter for OpenAIAdapter {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Endpoint(endpoint) => endpoint != Endpoint::Rerank,
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
        if !self.supports(Capability::Endpoint(ctx.endpoint)) {
            return Err(AdapterError::unsupported_endpoint(Self::NAME, ctx.endpoint.path()));
        }
        if ctx.stream && !self.supports(Capability::Stream(ctx.endpoint)) {
            return Err(AdapterError::invalid_param(
                format!("streaming is not supported for {}", ctx.endpoint.path()),
                "stream",
            ));
        }
        require_credential(ctx, Self::NAME)?;

        let is_json = matches!(body, PublicBody::Json(_));
        let mut headers = base_headers(ctx, is_json)?;
        if let Some(org) = ctx.extra_str("organization") {
            let value = HeaderValue::from_str(org)
                .map_err(|_| AdapterError::configuration("invalid organization header value"))?;
            headers.insert("openai-organization", value);
        }

        let mut upstream_body = prepare_body(body, ctx);
        if ctx.stream {
            Self::request_stream_usage(&mut upstream_body);
        }

        Ok(UpstreamRequest {
            method: Method::POST,
            url: join_upstream_url(&ctx.base_url, ctx.endpoint.path())?,
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
        if ctx.endpoint.is_binary_response() {
            if !raw.is_success() {
                return Err(extract_upstream_error(raw.status, &raw.body));
            }
            let content_type = raw
                .content_type()
                .unwrap_or("application/octet-stream")
                .to_string();
            return Ok(PublicResponse::Binary {
                content_type,
                body: raw.body,
            });
        }
        let value = parse_json_response(&raw)?;
        normalize_response(value, ctx).map(PublicResponse::Json)
    }

    fn stream_translate(&self, raw: UpstreamStream, ctx: &RouteContext) -> ChunkStream {
        translate(raw, StreamFormat::Sse, ctx, |value| Ok(Some(value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::normalize::tests::ctx;
    use crate::proxy::ResolvedAuth;
    use axum::http::HeaderMap;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;

    #[test]
    fn builds_request_with_upstream_model_and_auth() {
        let mut c = ctx(Endpoint::ChatCompletions, "openai", json!({"organization": "org-1"}));
        c.stream = true;
        let body = PublicBody::Json(json!({"model": "gpt-4", "messages": [], "stream": true}));
        let req = OpenAIAdapter.build_upstream_request(body, &c).unwrap();
        assert_eq!(req.url, "https://api.example.com/v1/chat/completions");
        assert_eq!(req.headers["authorization"], "Bearer sk-upstream");
        assert_eq!(req.headers["openai-organization"], "org-1");
        let UpstreamBody::Json(body) = req.body else {
            panic!("expected json body");
        };
        assert_eq!(body["model"], "gpt-4-0613");
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn rerank_is_unsupported() {
        let c = ctx(Endpoint::Rerank, "openai", Value::Null);
        let err = OpenAIAdapter
            .build_upstream_request(PublicBody::Json(json!({})), &c)
            .unwrap_err();
        assert_eq!(err.http_status().as_u16(), 400);
        assert_eq!(err.code.as_deref(), Some("unsupported_endpoint"));
    }

    #[test]
    fn missing_credential_is_configuration_error() {
        let mut c = ctx(Endpoint::Embeddings, "openai", Value::Null);
        c.auth = ResolvedAuth::None;
        let err = OpenAIAdapter
            .build_upstream_request(PublicBody::Json(json!({"input": "x"})), &c)
            .unwrap_err();
        assert!(!err.message.contains("sk-"));
    }

    #[test]
    fn binary_speech_passes_through() {
        let c = ctx(Endpoint::AudioSpeech, "openai", Value::Null);
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("audio/mpeg"));
        let raw = UpstreamResponse {
            status: 200,
            headers,
            body: Bytes::from_static(b"ID3"),
        };
        let out = OpenAIAdapter.parse_upstream_response(raw, &c).unwrap();
        assert_eq!(
            out,
            PublicResponse::Binary {
                content_type: "audio/mpeg".into(),
                body: Bytes::from_static(b"ID3"),
            }
        );
    }

    #[test]
    fn upstream_429_keeps_message() {
        let c = ctx(Endpoint::ChatCompletions, "openai", Value::Null);
        let raw = UpstreamResponse {
            status: 429,
            headers: HeaderMap::new(),
            body: Bytes::from_static(br#"{"error":{"message":"slow down","type":"rate_limit_error"}}"#),
        };
        let err = OpenAIAdapter.parse_upstream_response(raw, &c).unwrap_err();
        assert_eq!(err.message, "slow down");
        assert_eq!(err.http_status().as_u16(), 429);
    }
}
