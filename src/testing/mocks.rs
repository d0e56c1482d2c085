//! # Mock 上游与协作者
//!
//! 基于 wiremock 的 OpenAI 风格上游响应，以及 mockall 生成的存储/凭证/日志替身

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mockall::mock;
use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::error::Result;
use crate::store::{ApiKeyStore, KeyRecord, RequestLogRecord, RequestLogSink, SecretResolver};

mock! {
    /// Mock API key 存储
    pub KeyStore {}

    #[async_trait]
    impl ApiKeyStore for KeyStore {
        async fn find_by_prefix(&self, prefix: &str) -> Result<Option<KeyRecord>>;
        async fn touch_last_used(&self, key_id: &str, at: DateTime<Utc>) -> Result<()>;
    }
}

mock! {
    /// Mock 凭证解密
    pub Secrets {}

    #[async_trait]
    impl SecretResolver for Secrets {
        async fn resolve(&self, reference: &str) -> Result<String>;
    }
}

mock! {
    /// Mock 请求日志接收端
    pub LogSink {}

    #[async_trait]
    impl RequestLogSink for LogSink {
        async fn emit(&self, record: RequestLogRecord) -> Result<()>;
    }
}

pub const CHAT_PATH: &str = "/v1/chat/completions";

/// 非流式 chat 响应；故意省略 `object`，由网关补齐
#[must_use]
pub fn chat_completion_json(content: &str) -> Value {
    json!({
        "id": "chatcmpl-mock",
        "model": "gpt-4-0613",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 7, "completion_tokens": 3, "total_tokens": 10}
    })
}

/// 把若干 JSON 分片编码成 SSE 正文，以 `[DONE]` 结尾
#[must_use]
pub fn sse_body(chunks: &[Value]) -> String {
    let mut body = String::new();
    for chunk in chunks {
        body.push_str("data: ");
        body.push_str(&chunk.to_string());
        body.push_str("\n\n");
    }
    body.push_str("data: [DONE]\n\n");
    body
}

/// 逐字增量的流式 chat 分片，最后一片带用量
#[must_use]
pub fn chat_stream_chunks(deltas: &[&str]) -> Vec<Value> {
    let mut chunks: Vec<Value> = deltas
        .iter()
        .map(|delta| {
            json!({
                "id": "chatcmpl-mock",
                "object": "chat.completion.chunk",
                "model": "gpt-4-0613",
                "choices": [{"index": 0, "delta": {"content": delta}, "finish_reason": null}]
            })
        })
        .collect();
    chunks.push(json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion.chunk",
        "model": "gpt-4-0613",
        "choices": [],
        "usage": {"prompt_tokens": 5, "completion_tokens": deltas.len(), "total_tokens": 5 + deltas.len()}
    }));
    chunks
}

pub async fn mount_chat(server: &MockServer, content: &str) {
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion_json(content)))
        .mount(server)
        .await;
}

pub async fn mount_chat_stream(server: &MockServer, deltas: &[&str]) {
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse_body(&chat_stream_chunks(deltas)), "text/event-stream"),
        )
        .mount(server)
        .await;
}

/// 以 OpenAI 错误体返回指定状态
pub async fn mount_chat_error(server: &MockServer, status: u16) {
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(ResponseTemplate::new(status).set_body_json(json!({
            "error": {"message": "upstream exploded", "type": "server_error", "code": null}
        })))
        .mount(server)
        .await;
}
