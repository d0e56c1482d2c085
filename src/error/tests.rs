use super::*;
use axum::http::StatusCode;
use pretty_assertions::assert_eq;
use rstest::rstest;

#[rstest]
#[case(AuthError::ApiKeyMalformed, StatusCode::UNAUTHORIZED, "authentication_error")]
#[case(AuthError::ApiKeyInvalid, StatusCode::UNAUTHORIZED, "authentication_error")]
#[case(AuthError::ApiKeyDisabled, StatusCode::FORBIDDEN, "forbidden")]
#[case(AuthError::ApiKeyExpired, StatusCode::FORBIDDEN, "forbidden")]
#[case(
    AuthError::ModelNotAllowed { model: "gpt-4".into() },
    StatusCode::FORBIDDEN,
    "forbidden"
)]
fn auth_errors_map_to_expected_status(
    #[case] err: AuthError,
    #[case] status: StatusCode,
    #[case] error_type: &str,
) {
    let err = GatewayError::from(err);
    let (actual_status, actual_type, _) = err.to_http_response_parts();
    assert_eq!(actual_status, status);
    assert_eq!(actual_type, error_type);
}

#[rstest]
#[case(400, StatusCode::BAD_REQUEST)]
#[case(404, StatusCode::NOT_FOUND)]
#[case(401, StatusCode::BAD_GATEWAY)]
#[case(403, StatusCode::BAD_GATEWAY)]
#[case(500, StatusCode::BAD_GATEWAY)]
#[case(503, StatusCode::BAD_GATEWAY)]
fn upstream_status_passthrough_rules(#[case] upstream: u16, #[case] expected: StatusCode) {
    let err = AdapterError::upstream(upstream, "boom", None, None);
    assert_eq!(err.http_status(), expected);
}

#[test]
fn ssrf_error_body_is_generic() {
    let err = GatewayError::from(SsrfError::BlockedAddress {
        host: "internal.corp".into(),
        ip: "10.0.0.5".parse().unwrap(),
    });
    let body = err.to_error_body();
    assert_eq!(body.error.message, "blocked target");
    assert_eq!(body.error.code.as_deref(), Some("blocked_target"));
    assert!(!serde_json::to_string(&body).unwrap().contains("10.0.0.5"));
}

#[test]
fn credential_error_hides_details() {
    let err = GatewayError::credential_with_source(
        "decrypt failed for enc:v1:abc",
        anyhow::anyhow!("tag mismatch"),
    );
    let (status, _, _) = err.to_http_response_parts();
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!err.public_message().contains("enc:"));
}

#[test]
fn upstream_failure_classification() {
    assert!(GatewayError::upstream_timeout(1000).is_upstream_failure());
    assert!(GatewayError::from(AdapterError::upstream(503, "x", None, None)).is_upstream_failure());
    assert!(GatewayError::from(AdapterError::upstream(429, "x", None, None)).is_upstream_failure());
    assert!(!GatewayError::from(AdapterError::upstream(400, "x", None, None)).is_upstream_failure());
    assert!(!GatewayError::no_route("gpt-4").is_upstream_failure());
}

#[test]
fn rate_limited_response_carries_retry_after() {
    let response = GatewayError::rate_limited("slow down", 17).into_response();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["retry-after"], "17");
}

#[test]
fn error_macro_builds_variant() {
    let err = crate::error!(Internal, "bad state {}", 3);
    assert!(matches!(err, GatewayError::Internal { ref message, .. } if message == "bad state 3"));
    assert_eq!(err.category(), ErrorCategory::Server);
}

fn positive(n: i64) -> crate::error::Result<i64> {
    crate::ensure!(n > 0, Config, "value must be positive, got {}", n);
    if n > 1_000 {
        crate::bail!(Config, "value too large");
    }
    Ok(n)
}

#[test]
fn ensure_and_bail_return_early() {
    assert_eq!(positive(5).unwrap(), 5);
    assert!(matches!(
        positive(-1),
        Err(GatewayError::Config { ref message, .. }) if message == "value must be positive, got -1"
    ));
    assert!(matches!(
        positive(5_000),
        Err(GatewayError::Config { ref message, .. }) if message == "value too large"
    ));
}
