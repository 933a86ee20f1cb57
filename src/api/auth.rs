//! Bearer authentication for admin and caller routes

use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{HeaderMap, StatusCode, request::Parts},
    middleware::Next,
    response::Response,
};
use secrecy::SecretString;

use super::ApiState;
use super::error::{ApiError, api_error, error_response};
use crate::caller::Caller;

/// Extract the bearer value from the Authorization header
fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Middleware to verify the admin key
pub async fn require_admin_key(
    State(state): State<Arc<ApiState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    // If no admin key configured, allow all requests (development mode)
    let Some(expected_key) = &state.admin_key else {
        tracing::warn!("admin key not configured - allowing unauthenticated admin access");
        return Ok(next.run(req).await);
    };

    match extract_bearer(req.headers()) {
        Some(key) if key == expected_key => Ok(next.run(req).await),
        Some(_) => {
            tracing::warn!("invalid admin key provided");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            tracing::debug!("no admin key provided");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

/// A registered caller, resolved from its bearer secret
///
/// The secret never leaves this extractor: only the registered id and the
/// derived cache key are kept.
pub struct AuthenticatedCaller(pub Caller);

impl FromRequestParts<Arc<ApiState>> for AuthenticatedCaller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<ApiState>,
    ) -> Result<Self, Self::Rejection> {
        let Some(secret) = extract_bearer(&parts.headers) else {
            return Err((
                StatusCode::UNAUTHORIZED,
                error_response("unauthorized", "caller bearer secret required"),
            ));
        };

        let secret = SecretString::new(secret.into());
        match state.callers.authenticate(&secret) {
            Ok(Some(caller)) => Ok(Self(caller)),
            Ok(None) => {
                tracing::warn!("unknown caller secret presented");
                Err((
                    StatusCode::UNAUTHORIZED,
                    error_response("unauthorized", "unknown caller"),
                ))
            }
            Err(e) => Err(api_error(&e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn test_extract_bearer() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_bearer(&headers), None);

        headers.insert("authorization", HeaderValue::from_static("Bearer test-key-123"));
        assert_eq!(extract_bearer(&headers), Some("test-key-123"));

        headers.insert("authorization", HeaderValue::from_static("Bearer "));
        assert_eq!(extract_bearer(&headers), None);

        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_bearer(&headers), None);
    }
}
