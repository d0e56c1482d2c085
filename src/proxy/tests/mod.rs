//! 端到端请求流程：axum 路由 -> 编排 -> wiremock 上游

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use chrono::{Duration as ChronoDuration, Utc};
use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use wiremock::MockServer;

use crate::error::GatewayError;
use crate::scheduler::CircuitState;
use crate::store::RateLimitConfig;
use crate::testing::*;

fn chat_body(stream: bool) -> Value {
    json!({
        "model": "gpt-4",
        "messages": [{"role": "user", "content": "hi"}],
        "stream": stream
    })
}

fn chat(token: Option<&str>, body: &Value) -> Request<Body> {
    post_json("/v1/chat/completions", token, body)
}

/// 让 `primary` 连续失败直到熔断，再拨过冷却期进入半开
fn trip_primary_then_cool_down(gw: &TestGateway) {
    let breaker = gw.service.breakers().get_or_create("primary");
    while let Some(permit) = breaker.can_execute() {
        breaker.record_failure(permit);
    }
    gw.clock.advance_secs(31);
}

#[tokio::test]
async fn chat_completion_is_translated_and_logged() {
    let upstream = MockServer::start().await;
    mount_chat(&upstream, "hello there").await;
    let gw = TestGateway::start(gateway_config(&upstream.uri())).await;

    let mut request = chat(Some(TEST_TOKEN), &chat_body(false));
    request
        .headers_mut()
        .insert("x-request-id", "req-flow-1".parse().unwrap());
    let response = gw.send(request).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-request-id"], "req-flow-1");
    assert_eq!(response.headers()["x-gateway-upstream"], "primary");
    assert!(response.headers().contains_key("x-trace-id"));
    let body = body_json(response).await;
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "gpt-4");
    assert_eq!(body["choices"][0]["message"]["content"], "hello there");
    assert_eq!(body["usage"]["total_tokens"], 10);

    let received = upstream.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    let sent: Value = serde_json::from_slice(&received[0].body).unwrap();
    assert_eq!(sent["model"], "gpt-4-0613");
    assert_eq!(
        received[0].headers["authorization"],
        format!("Bearer {UPSTREAM_SECRET}").as_str()
    );
    assert_eq!(received[0].headers["x-request-id"], "req-flow-1");

    let logs = gw.wait_for_logs(1).await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, 200);
    assert_eq!(logs[0].tenant_id.as_deref(), Some(TEST_TENANT));
    assert_eq!(logs[0].upstream_id.as_deref(), Some("primary"));
    assert_eq!(logs[0].usage.map(|u| u.total_tokens), Some(10));
    assert!(logs[0].request_body.is_none());
}

#[tokio::test]
async fn streaming_chat_ends_with_done() {
    let upstream = MockServer::start().await;
    mount_chat_stream(&upstream, &["Hel", "lo"]).await;
    let gw = TestGateway::start(gateway_config(&upstream.uri())).await;

    let response = gw.send(chat(Some(TEST_TOKEN), &chat_body(true))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");

    let text = body_text(response).await;
    let frames: Vec<&str> = text
        .split("\n\n")
        .filter(|f| !f.is_empty())
        .collect();
    assert_eq!(frames.last(), Some(&"data: [DONE]"));
    assert_eq!(text.matches("data: [DONE]").count(), 1);
    let first: Value = serde_json::from_str(frames[0].trim_start_matches("data: ")).unwrap();
    assert_eq!(first["model"], "gpt-4");
    assert_eq!(first["choices"][0]["delta"]["content"], "Hel");

    let logs = gw.wait_for_logs(1).await;
    assert_eq!(logs[0].status, 200);
    assert!(logs[0].stream);
    assert!(logs[0].ttfb_ms.is_some());
    assert_eq!(logs[0].usage.map(|u| u.completion_tokens), Some(2));
}

#[tokio::test]
async fn bad_credentials_never_reach_upstream() {
    let upstream = MockServer::start().await;
    mount_chat(&upstream, "unused").await;
    let gw = TestGateway::start(gateway_config(&upstream.uri())).await;

    for token in [None, Some("sk-test01-wrong"), Some("not-a-key")] {
        let response = gw.send(chat(token, &chat_body(false))).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "authentication_error");
        assert_eq!(body["error"]["code"], "invalid_api_key");
    }
    assert!(upstream.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn expired_key_is_forbidden() {
    let upstream = MockServer::start().await;
    let mut config = gateway_config(&upstream.uri());
    config.keys[0].expires_at = Some(Utc::now() - ChronoDuration::hours(1));
    let gw = TestGateway::start(config).await;

    let response = gw.send(chat(Some(TEST_TOKEN), &chat_body(false))).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await["error"]["code"], "key_expired");
}

#[tokio::test]
async fn rate_limit_rejects_with_retry_after() {
    let upstream = MockServer::start().await;
    mount_chat(&upstream, "ok").await;
    let mut config = gateway_config(&upstream.uri());
    config.keys[0].rate_limit = Some(RateLimitConfig {
        requests: 2,
        window_seconds: 60,
    });
    let gw = TestGateway::start(config).await;

    for remaining in ["1", "0"] {
        let response = gw.send(chat(Some(TEST_TOKEN), &chat_body(false))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-remaining-requests"], remaining);
    }
    let response = gw.send(chat(Some(TEST_TOKEN), &chat_body(false))).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key(header::RETRY_AFTER));
    assert_eq!(body_json(response).await["error"]["type"], "rate_limit_error");
    assert_eq!(upstream.received_requests().await.unwrap().len(), 2);

    gw.clock.advance_secs(61);
    let response = gw.send(chat(Some(TEST_TOKEN), &chat_body(false))).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_model_is_not_found() {
    let upstream = MockServer::start().await;
    let gw = TestGateway::start(gateway_config(&upstream.uri())).await;

    let mut body = chat_body(false);
    body["model"] = json!("claude-3");
    let response = gw.send(chat(Some(TEST_TOKEN), &body)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["error"]["code"], "model_not_found");

    let response = gw
        .send(chat(Some(TEST_TOKEN), &json!({"messages": []})))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"]["param"], "model");
}

#[tokio::test]
async fn breaker_opens_after_upstream_failures_and_recovers() {
    let upstream = MockServer::start().await;
    mount_chat_error(&upstream, 500).await;
    let gw = TestGateway::start(gateway_config(&upstream.uri())).await;

    for _ in 0..2 {
        let response = gw.send(chat(Some(TEST_TOKEN), &chat_body(false))).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
    let response = gw.send(chat(Some(TEST_TOKEN), &chat_body(false))).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["error"]["code"], "no_healthy_upstream");
    assert_eq!(upstream.received_requests().await.unwrap().len(), 2);

    upstream.reset().await;
    mount_chat(&upstream, "back").await;
    gw.clock.advance_secs(31);
    let response = gw.send(chat(Some(TEST_TOKEN), &chat_body(false))).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn upstream_client_error_passes_through_without_tripping() {
    let upstream = MockServer::start().await;
    mount_chat_error(&upstream, 400).await;
    let gw = TestGateway::start(gateway_config(&upstream.uri())).await;

    for _ in 0..3 {
        let response = gw.send(chat(Some(TEST_TOKEN), &chat_body(false))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let text = body_text(response).await;
        assert!(text.contains("upstream exploded"));
        assert!(!text.contains(UPSTREAM_SECRET));
    }
    assert_eq!(upstream.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn metadata_target_is_blocked() {
    let gw = TestGateway::start(gateway_config("http://169.254.169.254")).await;

    let response = gw.send(chat(Some(TEST_TOKEN), &chat_body(false))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "blocked_target");
    assert!(!body.to_string().contains(UPSTREAM_SECRET));
}

#[tokio::test]
async fn models_listing_respects_key_restrictions() {
    let upstream = MockServer::start().await;
    let mut config = gateway_config(&upstream.uri());
    config.routes.push(route("gpt-3.5-turbo", &[("primary", 1)]));
    config.routes.push(route("llama-*", &[("primary", 1)]));
    let gw = TestGateway::start(config.clone()).await;

    let request = Request::get("/v1/models")
        .header(header::AUTHORIZATION, format!("Bearer {TEST_TOKEN}"))
        .body(Body::empty())
        .unwrap();
    let body = body_json(gw.send(request).await).await;
    let mut ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|m| m["id"].as_str())
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec!["gpt-3.5-turbo", "gpt-4"]);

    config.keys[0].allowed_models = vec!["gpt-4".to_string()];
    let gw = TestGateway::start(config).await;
    let request = Request::get("/v1/models")
        .header(header::AUTHORIZATION, format!("Bearer {TEST_TOKEN}"))
        .body(Body::empty())
        .unwrap();
    let body = body_json(gw.send(request).await).await;
    assert_eq!(body["data"].as_array().map(Vec::len), Some(1));
    assert_eq!(body["data"][0]["id"], "gpt-4");
}

#[tokio::test]
async fn healthz_needs_no_auth() {
    let upstream = MockServer::start().await;
    let gw = TestGateway::start(gateway_config(&upstream.uri())).await;
    let response = gw
        .send(Request::get("/healthz").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn client_disconnect_mid_stream_is_logged_without_tripping() {
    let upstream = MockServer::start().await;
    mount_chat_stream(&upstream, &["a", "b", "c", "d"]).await;
    let gw = TestGateway::start(gateway_config(&upstream.uri())).await;

    // 次数超过熔断阈值，断开不能算作上游失败
    for attempt in 1..=3 {
        let response = gw.send(chat(Some(TEST_TOKEN), &chat_body(true))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let mut frames = response.into_body().into_data_stream();
        let first = frames.next().await.unwrap().unwrap();
        assert!(first.starts_with(b"data: "));
        drop(frames);

        let logs = gw.wait_for_logs(attempt).await;
        let record = &logs[attempt - 1];
        assert_eq!(record.status, 499);
        assert_eq!(record.error_type.as_deref(), Some("client_closed"));
        assert!(record.stream);
    }

    let snapshot = gw.service.breakers().snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].1.state, CircuitState::Closed);
    assert_eq!(snapshot[0].1.consecutive_failures, 0);
}

#[tokio::test]
async fn client_disconnect_returns_half_open_trial_slot() {
    let upstream = MockServer::start().await;
    mount_chat_stream(&upstream, &["a", "b"]).await;
    let gw = TestGateway::start(gateway_config(&upstream.uri())).await;
    trip_primary_then_cool_down(&gw);

    for _ in 0..4 {
        let response = gw.send(chat(Some(TEST_TOKEN), &chat_body(true))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let mut frames = response.into_body().into_data_stream();
        frames.next().await.unwrap().unwrap();
    }

    let snapshot = gw.service.breakers().snapshot();
    assert_eq!(snapshot[0].1.state, CircuitState::HalfOpen);
    assert_eq!(snapshot[0].1.half_open_in_flight, 0);
    assert_eq!(snapshot[0].1.consecutive_successes, 0);
}

#[tokio::test]
async fn log_sink_failure_does_not_affect_response() {
    let upstream = MockServer::start().await;
    mount_chat(&upstream, "still fine").await;
    let mut sink = MockLogSink::new();
    sink.expect_emit()
        .times(1)
        .returning(|_| Err(GatewayError::store("log pipeline unavailable")));
    let gw = TestGateway::start_with(gateway_config(&upstream.uri()), |builder| {
        builder.with_log_sink(Arc::new(sink))
    })
    .await;

    let response = gw.send(chat(Some(TEST_TOKEN), &chat_body(false))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await["choices"][0]["message"]["content"],
        "still fine"
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn credential_failure_is_generic_and_releases_trial_slot() {
    let upstream = MockServer::start().await;
    mount_chat(&upstream, "unused").await;
    let mut secrets = MockSecrets::new();
    secrets
        .expect_resolve()
        .times(4)
        .returning(|reference| Err(GatewayError::credential(format!("cannot decrypt {reference}"))));
    let gw = TestGateway::start_with(gateway_config(&upstream.uri()), |builder| {
        builder.with_secrets(Arc::new(secrets))
    })
    .await;
    trip_primary_then_cool_down(&gw);

    // 半开名额为 3，第 4 次仍能拿到名额说明每次失败都归还了
    for _ in 0..4 {
        let response = gw.send(chat(Some(TEST_TOKEN), &chat_body(false))).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let text = body_text(response).await;
        assert!(text.contains("upstream credential unavailable"));
        assert!(!text.contains(UPSTREAM_SECRET));
        assert!(!text.contains("cannot decrypt"));
    }
    assert!(upstream.received_requests().await.unwrap().is_empty());
    let snapshot = gw.service.breakers().snapshot();
    assert_eq!(snapshot[0].1.half_open_in_flight, 0);
}

#[tokio::test]
async fn endpoint_denial_precedes_body_validation() {
    let upstream = MockServer::start().await;
    let mut config = gateway_config(&upstream.uri());
    config.keys[0].allowed_endpoints = vec!["/v1/embeddings".to_string()];
    let gw = TestGateway::start(config).await;

    let request = Request::post("/v1/chat/completions")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, format!("Bearer {TEST_TOKEN}"))
        .body(Body::from("{not json"))
        .unwrap();
    let response = gw.send(request).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await["error"]["code"], "access_denied");
}
