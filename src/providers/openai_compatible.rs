//! # OpenAI 兼容本地服务适配器
//!
//! 面向 vLLM、llama.cpp、Ollama、TEI 一类自建服务：
//! - 鉴权可选，路径可通过 `extras.paths.<endpoint>` 覆盖
//! - 流式响应可能是 SSE，也可能是逐行 JSON
//! - 少数服务返回原生形状（Ollama 的 `message`/`done`，TEI 的裸 rerank 数组），在这里转换

use axum::http::Method;
use serde_json::{Value, json};

use super::normalize::{base_headers, normalize_response, parse_json_response, prepare_body};
use super::stream::{StreamFormat, translate};
use super::traits::ProviderAdapter;
use super::types::{
    Capability, ChunkStream, ProviderResult, PublicBody, PublicResponse, UpstreamRequest,
    UpstreamResponse, UpstreamStream,
};
use crate::error::AdapterError;
use crate::proxy::RouteContext;
use crate::proxy::upstream_url::join_upstream_url;
use crate::store::Endpoint;

/// OpenAI 兼容适配器
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenAICompatibleAdapter;

impl OpenAICompatibleAdapter {
    pub const NAME: &'static str = "openai_compatible";

    fn path(ctx: &RouteContext) -> String {
        ctx.extras
            .get("paths")
            .and_then(|p| p.get(ctx.endpoint.as_str()))
            .and_then(Value::as_str)
            .map_or_else(|| ctx.endpoint.path().to_string(), str::to_string)
    }
}

/// 原生用量字段（Ollama: prompt_eval_count / eval_count）
fn native_usage(value: &Value) -> Option<Value> {
    let prompt = value.get("prompt_eval_count").and_then(Value::as_u64);
    let completion = value.get("eval_count").and_then(Value::as_u64);
    if prompt.is_none() && completion.is_none() {
        return None;
    }
    let (p, c) = (prompt.unwrap_or(0), completion.unwrap_or(0));
    Some(json!({"prompt_tokens": p, "completion_tokens": c, "total_tokens": p + c}))
}

fn native_text(value: &Value) -> Option<&str> {
    value
        .get("message")
        .and_then(|m| m.get("content"))
        .or_else(|| value.get("response"))
        .and_then(Value::as_str)
}

/// 原生非流式响应 -> OpenAI 形状；已经是 OpenAI 形状时原样返回
fn native_to_openai(value: Value, endpoint: Endpoint) -> Value {
    if value.get("choices").is_some() {
        return value;
    }
    let Some(text) = native_text(&value).map(str::to_string) else {
        return value;
    };
    let usage = native_usage(&value);
    let choice = match endpoint {
        Endpoint::Completions => json!({"index": 0, "text": text, "finish_reason": "stop"}),
        _ => json!({
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": "stop"
        }),
    };
    let mut out = json!({"choices": [choice]});
    if let Some(usage) = usage {
        out["usage"] = usage;
    }
    out
}

/// 原生流式行 -> OpenAI 分片
fn native_chunk_to_openai(value: Value, endpoint: Endpoint) -> Value {
    if value.get("choices").is_some() {
        return value;
    }
    let done = value.get("done").and_then(Value::as_bool).unwrap_or(false);
    let text = native_text(&value).unwrap_or_default().to_string();
    let finish_reason = if done { json!("stop") } else { Value::Null };
    let choice = match endpoint {
        Endpoint::Completions => json!({"index": 0, "text": text, "finish_reason": finish_reason}),
        _ => json!({"index": 0, "delta": {"content": text}, "finish_reason": finish_reason}),
    };
    let mut out = json!({"choices": [choice]});
    if done {
        if let Some(usage) = native_usage(&value) {
            out["usage"] = usage;
        }
    }
    out
}

/// TEI 风格裸数组 `[{"index","score"}]` -> `{"results":[{"index","relevance_score"}]}`
fn rerank_to_openai(value: Value) -> Value {
    let Value::Array(items) = value else {
        return value;
    };
    let results: Vec<Value> = items
        .into_iter()
        .map(|item| {
            let index = item.get("index").cloned().unwrap_or(Value::Null);
            let score = item
                .get("relevance_score")
                .or_else(|| item.get("score"))
                .cloned()
                .unwrap_or(Value::Null);
            let mut result = json!({"index": index, "relevance_score": score});
            if let Some(text) = item.get("text") {
                result["document"] = json!({"text": text});
            }
            result
        })
        .collect();
    json!({"results": results})
}

impl ProviderAdapter for OpenAICompatibleAdapter {
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
        if !self.supports(Capability::Endpoint(ctx.endpoint)) {
            return Err(AdapterError::unsupported_endpoint(Self::NAME, ctx.endpoint.path()));
        }
        if ctx.stream && !self.supports(Capability::Stream(ctx.endpoint)) {
            return Err(AdapterError::invalid_param(
                format!("streaming is not supported for {}", ctx.endpoint.path()),
                "stream",
            ));
        }
        if !matches!(body, PublicBody::Json(_)) {
            return Err(AdapterError::invalid_param("expected a JSON request body", "body"));
        }
        Ok(UpstreamRequest {
            method: Method::POST,
            url: join_upstream_url(&ctx.base_url, &Self::path(ctx))?,
            headers: base_headers(ctx, true)?,
            body: prepare_body(body, ctx),
            stream: ctx.stream,
        })
    }

    fn parse_upstream_response(
        &self,
        raw: UpstreamResponse,
        ctx: &RouteContext,
    ) -> ProviderResult<PublicResponse> {
        let value = parse_json_response(&raw)?;
        let value = match ctx.endpoint {
            Endpoint::Rerank => rerank_to_openai(value),
            endpoint => native_to_openai(value, endpoint),
        };
        normalize_response(value, ctx).map(PublicResponse::Json)
    }

    fn stream_translate(&self, raw: UpstreamStream, ctx: &RouteContext) -> ChunkStream {
        let format = StreamFormat::detect(ctx, raw.content_type.as_deref());
        let endpoint = ctx.endpoint;
        translate(raw, format, ctx, move |value| {
            Ok(Some(native_chunk_to_openai(value, endpoint)))
        })
    }
}
