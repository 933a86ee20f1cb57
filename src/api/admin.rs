//! Admin API endpoints: cache busting, consent bookkeeping and callers
//!
//! The accounts collaborator calls these when consent is granted or
//! withdrawn, or when an account is deleted.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    middleware,
    routing::{delete, get, post},
};
use chrono::{DateTime, NaiveDate, Utc};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use super::auth::require_admin_key;
use super::error::{ApiResult, api_error, bad_request};
use super::ApiState;
use crate::cache::CacheStats;
use crate::caller::CallerRecord;
use crate::metric::MetricType;
use crate::tokens::{ConsentStatus, TokenGrant, TokenType};

// --- Request/Response types ---

#[derive(Deserialize)]
pub struct GrantRequest {
    pub token_type: TokenType,
    #[serde(flatten)]
    pub grant: TokenGrant,
}

#[derive(Serialize)]
pub struct ConsentResponse {
    pub owner: String,
    pub status: Option<ConsentStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<TokenType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consent_expires_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct LinkRequest {
    pub subscriber: String,
}

#[derive(Serialize)]
pub struct RemovedResponse {
    pub removed: usize,
}

/// A newly issued caller secret; shown only in this response
#[derive(Serialize)]
pub struct IssuedCaller {
    pub id: String,
    pub secret: String,
}

// --- Handlers ---

/// Drop one cached day
async fn invalidate_day(
    State(state): State<Arc<ApiState>>,
    Path((meter, metric, date)): Path<(String, String, String)>,
) -> ApiResult<Json<RemovedResponse>> {
    let metric: MetricType = metric.parse().map_err(|e| api_error(&e))?;
    let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
        .map_err(|_| bad_request("date must be YYYY-MM-DD"))?;

    let removed = state
        .adapter
        .invalidate(&meter, date, metric)
        .map_err(|e| api_error(&e))?;

    Ok(Json(RemovedResponse {
        removed: usize::from(removed),
    }))
}

/// Drop every cached day of a meter
async fn invalidate_meter(
    State(state): State<Arc<ApiState>>,
    Path(meter): Path<String>,
) -> ApiResult<Json<RemovedResponse>> {
    let removed = state
        .adapter
        .cache()
        .invalidate_meter(&meter)
        .map_err(|e| api_error(&e))?;
    Ok(Json(RemovedResponse { removed }))
}

/// Reclaim storage held by expired entries
async fn purge_cache(State(state): State<Arc<ApiState>>) -> ApiResult<Json<RemovedResponse>> {
    let removed = state
        .adapter
        .cache()
        .purge_expired()
        .map_err(|e| api_error(&e))?;
    Ok(Json(RemovedResponse { removed }))
}

async fn cache_stats(State(state): State<Arc<ApiState>>) -> ApiResult<Json<CacheStats>> {
    state
        .adapter
        .cache()
        .stats()
        .map(Json)
        .map_err(|e| api_error(&e))
}

/// Record a consent after the OAuth code exchange
async fn grant_consent(
    State(state): State<Arc<ApiState>>,
    Path(owner): Path<String>,
    Json(req): Json<GrantRequest>,
) -> ApiResult<(StatusCode, Json<ConsentResponse>)> {
    if req.grant.access_token.is_empty() {
        return Err(bad_request("access_token must not be empty"));
    }

    let token = state
        .adapter
        .tokens()
        .grant(&owner, req.token_type, &req.grant)
        .map_err(|e| api_error(&e))?;

    Ok((
        StatusCode::CREATED,
        Json(ConsentResponse {
            owner,
            status: Some(token.consent_status),
            token_type: Some(token.token_type),
            expires_at: Some(token.expires_at),
            consent_expires_at: token.consent_expires_at,
        }),
    ))
}

/// Withdraw a consent
async fn revoke_consent(
    State(state): State<Arc<ApiState>>,
    Path(owner): Path<String>,
) -> ApiResult<Json<RemovedResponse>> {
    let removed = state
        .adapter
        .tokens()
        .revoke(&owner)
        .await
        .map_err(|e| api_error(&e))?;
    Ok(Json(RemovedResponse { removed }))
}

async fn get_consent(
    State(state): State<Arc<ApiState>>,
    Path(owner): Path<String>,
) -> ApiResult<Json<ConsentResponse>> {
    let tokens = state.adapter.tokens();
    let status = tokens.consent_status(&owner).map_err(|e| api_error(&e))?;
    let live = tokens.repo().find_live(&owner).map_err(|e| api_error(&e))?;

    Ok(Json(ConsentResponse {
        owner,
        status,
        token_type: live.as_ref().map(|t| t.token_type),
        expires_at: live.as_ref().map(|t| t.expires_at),
        consent_expires_at: live.and_then(|t| t.consent_expires_at),
    }))
}

/// Account deletion: drop tokens, links and cached days of the owner
async fn forget_owner(
    State(state): State<Arc<ApiState>>,
    Path(owner): Path<String>,
) -> ApiResult<Json<RemovedResponse>> {
    let tokens = state
        .adapter
        .tokens()
        .forget(&owner)
        .map_err(|e| api_error(&e))?;
    let cached = state
        .adapter
        .cache()
        .invalidate_meter(&owner)
        .map_err(|e| api_error(&e))?;

    Ok(Json(RemovedResponse {
        removed: tokens + cached,
    }))
}

async fn link_meter(
    State(state): State<Arc<ApiState>>,
    Path(meter): Path<String>,
    Json(req): Json<LinkRequest>,
) -> ApiResult<StatusCode> {
    if req.subscriber.is_empty() {
        return Err(bad_request("subscriber must not be empty"));
    }

    state
        .adapter
        .tokens()
        .link_meter(&meter, &req.subscriber)
        .map_err(|e| api_error(&e))?;
    Ok(StatusCode::NO_CONTENT)
}

/// Register a caller, or rotate its secret
async fn issue_caller(
    State(state): State<Arc<ApiState>>,
    Path(caller): Path<String>,
) -> ApiResult<(StatusCode, Json<IssuedCaller>)> {
    let secret = state.callers.issue(&caller).map_err(|e| api_error(&e))?;

    Ok((
        StatusCode::CREATED,
        Json(IssuedCaller {
            id: caller.trim().to_string(),
            secret: secret.expose_secret().to_string(),
        }),
    ))
}

async fn list_callers(State(state): State<Arc<ApiState>>) -> ApiResult<Json<Vec<CallerRecord>>> {
    state.callers.list().map(Json).map_err(|e| api_error(&e))
}

async fn remove_caller(
    State(state): State<Arc<ApiState>>,
    Path(caller): Path<String>,
) -> ApiResult<Json<RemovedResponse>> {
    let removed = state.callers.remove(&caller).map_err(|e| api_error(&e))?;
    Ok(Json(RemovedResponse {
        removed: usize::from(removed),
    }))
}

/// Build admin router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/cache/stats", get(cache_stats))
        .route("/cache/purge", post(purge_cache))
        .route("/cache/{meter}", delete(invalidate_meter))
        .route("/cache/{meter}/{metric}/{date}", delete(invalidate_day))
        .route("/consents/{owner}", post(grant_consent))
        .route("/consents/{owner}", get(get_consent))
        .route("/consents/{owner}", delete(revoke_consent))
        .route("/owners/{owner}", delete(forget_owner))
        .route("/meters/{meter}/link", post(link_meter))
        .route("/callers", get(list_callers))
        .route("/callers/{caller}", post(issue_caller))
        .route("/callers/{caller}", delete(remove_caller))
        .layer(middleware::from_fn_with_state(state.clone(), require_admin_key))
        .with_state(state)
}
