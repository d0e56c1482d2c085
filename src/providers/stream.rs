//! # 流式响应翻译
//!
//! 上游字节流按 SSE（`data: ` 帧）或 NDJSON（每行一个 JSON）切分，遇到 `[DONE]`
//! 或流结束即停止；每个负载交给适配器的映射函数，再补齐公共字段。
//! 整条管线是惰性的，下游丢弃后不会再读取上游。

use futures::{StreamExt, future};
use serde_json::Value;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;

use super::normalize::normalize_chunk;
use super::types::{ChunkStream, ProviderResult, StreamChunk, UpstreamStream};
use crate::error::AdapterError;
use crate::proxy::RouteContext;
use crate::store::Usage;
use crate::utils::EventStreamData;

const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// 上游流格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    Sse,
    Ndjson,
}

impl StreamFormat {
    /// `extras.stream_format` 优先，否则按 Content-Type 判断，默认 SSE
    #[must_use]
    pub fn detect(ctx: &RouteContext, content_type: Option<&str>) -> Self {
        match ctx.extra_str("stream_format") {
            Some("ndjson") => return Self::Ndjson,
            Some("sse") => return Self::Sse,
            _ => {}
        }
        match content_type {
            Some(ct) if ct.contains("ndjson") || ct.starts_with("application/json") => Self::Ndjson,
            _ => Self::Sse,
        }
    }
}

fn interrupted(err: &std::io::Error) -> AdapterError {
    AdapterError::translation(format!("upstream stream interrupted: {err}"))
}

/// 原始负载序列（每项为一个 JSON 文本）
pub fn payloads(
    raw: UpstreamStream,
    format: StreamFormat,
) -> futures::stream::BoxStream<'static, ProviderResult<String>> {
    let reader = StreamReader::new(raw.body);
    match format {
        StreamFormat::Sse => FramedRead::new(reader, EventStreamData::new())
            .take_while(|event| future::ready(!matches!(event, Ok(ev) if ev.is_done())))
            .filter_map(|event| {
                future::ready(match event {
                    Ok(ev) if ev.data.trim().is_empty() => None,
                    Ok(ev) => Some(Ok(ev.data)),
                    Err(e) => Some(Err(interrupted(&e))),
                })
            })
            .boxed(),
        StreamFormat::Ndjson => FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_BYTES))
            .map(|line| {
                line.map(|l| {
                    let l = l.trim();
                    l.strip_prefix("data:").map_or(l, str::trim).to_string()
                })
            })
            .take_while(|line| future::ready(!matches!(line, Ok(l) if l == "[DONE]")))
            .filter_map(|line| {
                future::ready(match line {
                    Ok(l) if l.is_empty() => None,
                    Ok(l) => Some(Ok(l)),
                    Err(e) => Some(Err(AdapterError::translation(format!(
                        "upstream stream interrupted: {e}"
                    )))),
                })
            })
            .boxed(),
    }
}

/// 流内错误对象，如 `{"error":{"message":..}}`
fn in_stream_error(value: &Value) -> Option<AdapterError> {
    let err = value.get("error")?;
    if err.is_null() {
        return None;
    }
    let message = err
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| err.as_str())
        .unwrap_or("upstream reported an error mid-stream");
    let error_type = err.get("type").and_then(Value::as_str).map(str::to_string);
    Some(AdapterError::upstream(502, message, error_type, None))
}

/// 将负载序列翻译为公共分片；`map` 返回 `None` 表示丢弃该负载
pub fn translate<F>(raw: UpstreamStream, format: StreamFormat, ctx: &RouteContext, mut map: F) -> ChunkStream
where
    F: FnMut(Value) -> ProviderResult<Option<Value>> + Send + 'static,
{
    let ctx = ctx.clone();
    payloads(raw, format)
        .filter_map(move |payload| {
            let item = payload.and_then(|text| {
                let value: Value = serde_json::from_str(&text).map_err(|e| {
                    AdapterError::translation(format!("invalid JSON in upstream stream: {e}"))
                })?;
                if let Some(err) = in_stream_error(&value) {
                    return Err(err);
                }
                let Some(mapped) = map(value)? else {
                    return Ok(None);
                };
                let chunk = normalize_chunk(mapped, &ctx)?;
                let usage = chunk
                    .get("usage")
                    .filter(|u| u.is_object())
                    .and_then(Usage::from_json);
                Ok(Some(StreamChunk {
                    data: chunk.to_string(),
                    usage,
                }))
            });
            future::ready(item.transpose())
        })
        .boxed()
}
