//! # 数据面服务器集成测试
//!
//! 从 TOML 配置启动真实监听的网关，经 HTTP 调用 wiremock 上游。

use std::sync::Arc;

use futures::StreamExt;
use model_gateway::config::from_toml_str;
use model_gateway::proxy::{GatewayBuilder, create_router};
use pretty_assertions::assert_eq;
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOKEN: &str = "sk-srv01-integrationsecret";

fn config_toml(upstream: &str, hash: &str) -> String {
    format!(
        r#"
[server]
max_body_bytes = 4096

[ssrf]
exempt_cidrs = ["127.0.0.0/8"]

[[upstreams]]
id = "local-vllm"
adapter = "openai_compatible"
base_url = "{upstream}"
auth = {{ type = "bearer", credential = "plain:sk-local" }}

[[routes]]
tenant_id = "acme"
virtual_model = "llama-*"
targets = [{{ upstream_id = "local-vllm", model = "meta-llama/Llama-3-8B" }}]

[[keys]]
id = "k-srv"
tenant_id = "acme"
prefix = "srv01"
key_hash = "{hash}"
"#
    )
}

/// 启动网关，返回其基础地址
async fn spawn_gateway(upstream: &MockServer) -> String {
    let hash = bcrypt::hash(TOKEN, 4).unwrap();
    let config = from_toml_str(&config_toml(&upstream.uri(), &hash)).unwrap();
    let max_body = config.server.max_body_bytes;
    let gateway = GatewayBuilder::new(Arc::new(config)).build().await.unwrap();
    let app = create_router(gateway, max_body);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn wildcard_route_reaches_compatible_upstream() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-local"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}]
        })))
        .expect(1)
        .mount(&upstream)
        .await;
    let base = spawn_gateway(&upstream).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/v1/chat/completions"))
        .bearer_auth(TOKEN)
        .json(&json!({"model": "llama-3-8b", "messages": [{"role": "user", "content": "hey"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["model"], "llama-3-8b");
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["usage"]["total_tokens"], 0);

    let received = upstream.received_requests().await.unwrap();
    let sent: Value = serde_json::from_slice(&received[0].body).unwrap();
    assert_eq!(sent["model"], "meta-llama/Llama-3-8B");
}

#[tokio::test]
async fn streaming_arrives_incrementally_over_http() {
    let upstream = MockServer::start().await;
    let sse = [
        r#"data: {"choices":[{"index":0,"delta":{"content":"a"}}]}"#,
        r#"data: {"choices":[{"index":0,"delta":{"content":"b"}}]}"#,
        "data: [DONE]",
    ]
    .join("\n\n")
        + "\n\n";
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"),
        )
        .mount(&upstream)
        .await;
    let base = spawn_gateway(&upstream).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/v1/chat/completions"))
        .bearer_auth(TOKEN)
        .json(&json!({"model": "llama-3-8b", "messages": [], "stream": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/event-stream");

    let mut collected = Vec::new();
    let mut chunks = response.bytes_stream();
    while let Some(chunk) = chunks.next().await {
        collected.extend_from_slice(&chunk.unwrap());
    }
    let text = String::from_utf8(collected).unwrap();
    assert!(text.contains(r#""content":"a""#));
    assert!(text.contains(r#""model":"llama-3-8b""#));
    assert!(text.trim_end().ends_with("data: [DONE]"));
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let upstream = MockServer::start().await;
    let base = spawn_gateway(&upstream).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/v1/embeddings"))
        .bearer_auth(TOKEN)
        .json(&json!({"model": "llama-3-8b", "input": "x".repeat(8192)}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert!(upstream.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_route_and_missing_key() {
    let upstream = MockServer::start().await;
    let base = spawn_gateway(&upstream).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({"model": "llama-3-8b"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = client
        .get(format!("{base}/v1/models"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["object"], "list");
    assert_eq!(body["data"], json!([]));

    let response = client.get(format!("{base}/healthz")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
