//! # 适配器通用类型定义

use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::error::AdapterError;
use crate::store::{Endpoint, Usage};
use crate::utils::MultipartForm;

pub type ProviderResult<T> = std::result::Result<T, AdapterError>;

/// 适配器能力标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// 非流式调用该端点
    Endpoint(Endpoint),
    /// 流式调用该端点
    Stream(Endpoint),
}

/// 调用方发来的请求体
#[derive(Debug, Clone)]
pub enum PublicBody {
    Json(Value),
    Multipart(MultipartForm),
}

impl PublicBody {
    /// 请求的虚拟模型名
    #[must_use]
    pub fn model(&self) -> Option<String> {
        match self {
            Self::Json(value) => value.get("model").and_then(Value::as_str).map(str::to_string),
            Self::Multipart(form) => form.text("model"),
        }
    }

    #[must_use]
    pub fn is_stream(&self) -> bool {
        match self {
            Self::Json(value) => value.get("stream").and_then(Value::as_bool).unwrap_or(false),
            Self::Multipart(_) => false,
        }
    }

    /// 记录日志用的文本形式，二进制表单只记录字段名
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Json(value) => value.to_string(),
            Self::Multipart(form) => {
                let names: Vec<&str> = form.parts.iter().map(|p| p.name.as_str()).collect();
                format!("multipart[{}]", names.join(","))
            }
        }
    }
}

/// 发往上游的请求体
#[derive(Debug, Clone)]
pub enum UpstreamBody {
    Empty,
    Json(Value),
    Multipart(MultipartForm),
}

/// 适配器构造的上游请求；鉴权头标记为 sensitive，Debug 输出不含凭证
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: UpstreamBody,
    pub stream: bool,
}

/// 上游完整响应
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamResponse {
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

/// 上游原始字节流
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// 上游流式响应：状态码已确认成功，响应体尚未读取
pub struct UpstreamStream {
    pub content_type: Option<String>,
    pub body: ByteStream,
}

impl std::fmt::Debug for UpstreamStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamStream")
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// 归一化后的公共响应
#[derive(Debug, Clone, PartialEq)]
pub enum PublicResponse {
    Json(Value),
    Binary { content_type: String, body: Bytes },
}

impl PublicResponse {
    #[must_use]
    pub fn usage(&self) -> Option<Usage> {
        match self {
            Self::Json(value) => value.get("usage").and_then(Usage::from_json),
            Self::Binary { .. } => None,
        }
    }
}

/// 公共协议的一个流式分片，`data` 为 JSON 文本，不含 `data: ` 帧头
#[derive(Debug, Clone, PartialEq)]
pub struct StreamChunk {
    pub data: String,
    /// 分片里携带的用量（通常只有最后一个分片有）
    pub usage: Option<Usage>,
}

/// 翻译后的分片序列，只能向前消费一次，丢弃即关闭上游连接
pub type ChunkStream = BoxStream<'static, ProviderResult<StreamChunk>>;
