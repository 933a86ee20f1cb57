//! OAuth and metering HTTP clients against a local fake upstream

use std::collections::HashMap;
use std::time::Duration;

use axum::{
    Form, Json, Router,
    extract::Query,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use conso_gateway::MetricType;
use conso_gateway::tokens::{AuthError, AuthorizationServer, OAuthClient};
use conso_gateway::upstream::{HttpMeteringApi, MeteringApi, UpstreamError};
use secrecy::SecretString;
use serde_json::json;
use tokio::net::TcpListener;

mod common;
use common::day;

async fn token_endpoint(Form(form): Form<HashMap<String, String>>) -> Response {
    if form.get("client_secret").map(String::as_str) != Some("s3cret") {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "invalid_client" }))).into_response();
    }

    match form.get("refresh_token").map(String::as_str) {
        Some("withdrawn") => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid_grant", "error_description": "consent withdrawn" })),
        )
            .into_response(),
        Some("flaky") => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        Some(_) => Json(json!({
            "access_token": "fresh-access",
            "refresh_token": "next-refresh",
            "expires_in": 12600,
            "scope": "metering consumption",
        }))
        .into_response(),
        None => StatusCode::BAD_REQUEST.into_response(),
    }
}

async fn daily_consumption(headers: HeaderMap, Query(query): Query<HashMap<String, String>>) -> Response {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if bearer != "Bearer good-token" {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    match query.get("usage_point_id").map(String::as_str) {
        Some("busy") => (StatusCode::TOO_MANY_REQUESTS, [(header::RETRY_AFTER, "7")]).into_response(),
        Some("down") => (StatusCode::BAD_GATEWAY, "maintenance").into_response(),
        Some("unknown") => (StatusCode::NOT_FOUND, "no such usage point").into_response(),
        Some(_) => {
            let start = query.get("start").cloned().unwrap_or_default();
            let end = query.get("end").cloned().unwrap_or_default();
            Json(json!({
                "meter_reading": {
                    "interval_reading": [
                        { "date": start, "value": "1200" },
                        { "date": end, "value": "1300" },
                    ]
                }
            }))
            .into_response()
        }
        None => StatusCode::BAD_REQUEST.into_response(),
    }
}

/// Serve the fake upstream on an ephemeral port and return its base URL
async fn spawn_upstream() -> String {
    let app = Router::new()
        .route("/oauth/token", post(token_endpoint))
        .route("/oauth/revoke", post(|| async { StatusCode::OK }))
        .route("/api/metering_data_dc/v5/daily_consumption", get(daily_consumption));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{addr}")
}

fn http() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

fn oauth(base: &str, secret: &str) -> OAuthClient {
    OAuthClient::new(
        http(),
        format!("{base}/oauth/token"),
        "conso-test",
        SecretString::new(secret.into()),
    )
    .with_revoke_url(format!("{base}/oauth/revoke"))
}

#[tokio::test]
async fn refresh_returns_new_grant() {
    let base = spawn_upstream().await;
    let grant = oauth(&base, "s3cret").refresh("current-refresh").await.unwrap();

    assert_eq!(grant.access_token, "fresh-access");
    assert_eq!(grant.refresh_token.as_deref(), Some("next-refresh"));
    assert_eq!(grant.expires_in, 12600);
    assert!(grant.scopes.contains("consumption"));
}

#[tokio::test]
async fn refresh_classifies_failures() {
    let base = spawn_upstream().await;

    let err = oauth(&base, "s3cret").refresh("withdrawn").await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidGrant(_)));

    let err = oauth(&base, "s3cret").refresh("flaky").await.unwrap_err();
    assert!(matches!(err, AuthError::Transient(_)));

    let err = oauth(&base, "wrong").refresh("current-refresh").await.unwrap_err();
    assert!(matches!(err, AuthError::Rejected(_)));
}

#[tokio::test]
async fn refresh_against_unreachable_server_is_transient() {
    let client = OAuthClient::new(
        http(),
        "http://127.0.0.1:9/oauth/token",
        "conso-test",
        SecretString::new("s3cret".into()),
    );
    let err = client.refresh("current-refresh").await.unwrap_err();
    assert!(matches!(err, AuthError::Transient(_)));
}

#[tokio::test]
async fn revoke_posts_to_revocation_endpoint() {
    let base = spawn_upstream().await;
    oauth(&base, "s3cret").revoke("current-refresh").await.unwrap();
}

#[tokio::test]
async fn fetch_parses_readings() {
    let base = spawn_upstream().await;
    let api = HttpMeteringApi::new(http(), &format!("{base}/api")).unwrap();

    let readings = api
        .fetch(
            "good-token",
            "pdl-0001",
            MetricType::DailyConsumption,
            day("2024-03-01"),
            day("2024-03-02"),
        )
        .await
        .unwrap();

    assert_eq!(readings.len(), 2);
    assert_eq!(readings[0].date, "2024-03-01");
    assert_eq!(readings[0].value, "1200");
    assert_eq!(readings[1].date, "2024-03-02");
}

async fn fetch_err(api: &HttpMeteringApi, bearer: &str, meter: &str) -> UpstreamError {
    api.fetch(
        bearer,
        meter,
        MetricType::DailyConsumption,
        day("2024-03-01"),
        day("2024-03-02"),
    )
    .await
    .unwrap_err()
}

#[tokio::test]
async fn fetch_classifies_failures() {
    let base = spawn_upstream().await;
    let api = HttpMeteringApi::new(http(), &format!("{base}/api/")).unwrap();
    let err = fetch_err(&api, "good-token", "busy").await;
    assert!(matches!(err, UpstreamError::RateLimited { .. }));
    assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));

    assert!(matches!(fetch_err(&api, "good-token", "down").await, UpstreamError::Transient(_)));
    assert!(matches!(fetch_err(&api, "good-token", "unknown").await, UpstreamError::Rejected(_)));
    assert!(matches!(fetch_err(&api, "stale-token", "pdl-0001").await, UpstreamError::Unauthorized(_)));
}

#[tokio::test]
async fn unreachable_upstream_is_transient() {
    let api = HttpMeteringApi::new(http(), "http://127.0.0.1:9/api").unwrap();
    let err = api
        .fetch(
            "good-token",
            "pdl-0001",
            MetricType::DailyConsumption,
            day("2024-03-01"),
            day("2024-03-02"),
        )
        .await
        .unwrap_err();
    assert!(err.is_recoverable());
}
