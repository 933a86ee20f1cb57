//! JSON error envelope shared by every handler

use axum::{Json, http::StatusCode};
use serde::Serialize;

use crate::Error;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

/// Handler error: status plus envelope
pub type ApiError = (StatusCode, Json<ErrorResponse>);

/// Handler result
pub type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn error_response(code: &str, message: &str) -> Json<ErrorResponse> {
    Json(ErrorResponse {
        error: ErrorDetail {
            code: code.to_string(),
            message: message.to_string(),
        },
    })
}

/// Status and machine-readable code for a gateway error
#[must_use]
pub const fn classify(err: &Error) -> (StatusCode, &'static str) {
    match err {
        Error::ConsentRevoked(_) => (StatusCode::FORBIDDEN, "reconsent_required"),
        Error::NoConsent(_) => (StatusCode::FORBIDDEN, "consent_required"),
        Error::QuotaExceeded { .. } => (StatusCode::TOO_MANY_REQUESTS, "quota_exceeded"),
        Error::InvalidRange(_) => (StatusCode::BAD_REQUEST, "invalid_range"),
        Error::InvalidCaller(_) => (StatusCode::BAD_REQUEST, "invalid_caller"),
        Error::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        Error::RateLimited(_) => (StatusCode::SERVICE_UNAVAILABLE, "upstream_rate_limited"),
        Error::Cancelled(_) => (StatusCode::SERVICE_UNAVAILABLE, "cancelled"),
        Error::RefreshFailed { .. } => (StatusCode::BAD_GATEWAY, "refresh_failed"),
        Error::UpstreamTransient(_) | Error::Http(_) => (StatusCode::BAD_GATEWAY, "upstream_unavailable"),
        Error::UpstreamRejected(_) => (StatusCode::BAD_GATEWAY, "upstream_rejected"),
        Error::Database(_) | Error::Sqlite(_) => (StatusCode::INTERNAL_SERVER_ERROR, "db_error"),
        Error::Config(_)
        | Error::Crypto(_)
        | Error::Io(_)
        | Error::Serialization(_)
        | Error::Toml(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    }
}

/// Convert a gateway error into a handler error, logging server-side faults
pub fn api_error(err: &Error) -> ApiError {
    let (status, code) = classify(err);
    if status.is_server_error() {
        tracing::error!(error = %err, code, "request failed");
    } else {
        tracing::debug!(error = %err, code, "request rejected");
    }
    (status, error_response(code, &err.to_string()))
}

/// 400 for malformed input
pub fn bad_request(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, error_response("bad_request", message))
}
