//! Caller-facing metering endpoints

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::get,
};
use chrono::NaiveDate;
use serde::Deserialize;

use super::ApiState;
use super::auth::AuthenticatedCaller;
use super::error::{ApiResult, api_error};
use crate::adapter::TimeSeries;
use crate::metric::MetricType;
use crate::quota::QuotaUsage;

/// Inclusive day range
#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Read a metric for a meter over a day range
async fn fetch_range(
    State(state): State<Arc<ApiState>>,
    AuthenticatedCaller(caller): AuthenticatedCaller,
    Path((meter, metric)): Path<(String, String)>,
    Query(range): Query<RangeQuery>,
) -> ApiResult<Json<TimeSeries>> {
    let metric: MetricType = metric.parse().map_err(|e| api_error(&e))?;

    let series = state
        .adapter
        .fetch_range(&meter, metric, range.start, range.end, &caller)
        .await
        .map_err(|e| api_error(&e))?;

    if !series.is_complete() {
        tracing::info!(
            meter = %meter,
            %metric,
            served = series.days.len(),
            failed = series.failures.len(),
            "partial range served"
        );
    }

    Ok(Json(series))
}

/// Today's quota usage of the calling account
async fn quota(
    State(state): State<Arc<ApiState>>,
    AuthenticatedCaller(caller): AuthenticatedCaller,
) -> ApiResult<Json<QuotaUsage>> {
    state
        .adapter
        .quota()
        .usage(&caller.id)
        .map(Json)
        .map_err(|e| api_error(&e))
}

/// Build the caller router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/meters/{meter}/{metric}", get(fetch_range))
        .route("/quota", get(quota))
        .with_state(state)
}
