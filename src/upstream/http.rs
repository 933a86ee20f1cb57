//! reqwest implementation of [`MeteringApi`]

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

use super::retry::parse_retry_after;
use super::{MeteringApi, UpstreamError};
use crate::config::UpstreamConfig;
use crate::db::format_day;
use crate::metric::{MetricType, Reading};
use crate::{Error, Result};

/// Metering data response envelope
#[derive(Deserialize)]
struct MeteringResponse {
    meter_reading: MeterReading,
}

#[derive(Deserialize)]
struct MeterReading {
    #[serde(default)]
    interval_reading: Vec<Reading>,
}

/// HTTP client for the metering API
pub struct HttpMeteringApi {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpMeteringApi {
    /// Create a client rooted at `base_url`
    ///
    /// # Errors
    ///
    /// Returns `Config` if the URL is invalid or cannot be a base
    pub fn new(http: reqwest::Client, base_url: &str) -> Result<Self> {
        // Trailing slash so `join` appends rather than replaces the last segment
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base_url = Url::parse(&normalized)
            .map_err(|e| Error::Config(format!("invalid metering API URL {base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::Config(format!("metering API URL cannot be a base: {base_url}")));
        }

        Ok(Self { http, base_url })
    }

    /// Build a client from the upstream configuration
    ///
    /// # Errors
    ///
    /// Returns `Config` if `CONSO_UPSTREAM_URL` is missing or invalid
    pub fn from_config(config: &UpstreamConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .as_deref()
            .ok_or_else(|| Error::Config("CONSO_UPSTREAM_URL is required".to_string()))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Self::new(http, base_url)
    }

    fn endpoint(&self, meter: &str, metric: MetricType, start: NaiveDate, end: NaiveDate) -> Result<Url> {
        let mut url = self
            .base_url
            .join(&metric.api_path())
            .map_err(|e| Error::Config(format!("invalid metering endpoint: {e}")))?;
        url.query_pairs_mut()
            .append_pair("usage_point_id", meter)
            .append_pair("start", &format_day(start))
            .append_pair("end", &format_day(end));
        Ok(url)
    }
}

#[async_trait]
impl MeteringApi for HttpMeteringApi {
    async fn fetch(
        &self,
        bearer: &str,
        meter: &str,
        metric: MetricType,
        start: NaiveDate,
        end: NaiveDate,
    ) -> std::result::Result<Vec<Reading>, UpstreamError> {
        let url = self
            .endpoint(meter, metric, start, end)
            .map_err(|e| UpstreamError::Rejected(e.to_string()))?;

        tracing::debug!(meter, %metric, %start, %end, "fetching metering data");

        let response = self
            .http
            .get(url)
            .bearer_auth(bearer)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| UpstreamError::Transient(format!("metering request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            let body: MeteringResponse = response
                .json()
                .await
                .map_err(|e| UpstreamError::Rejected(format!("metering response parse error: {e}")))?;
            return Ok(body.meter_reading.interval_reading);
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await.unwrap_or_default();

        Err(classify(status, retry_after, &body))
    }
}

/// Map a failed metering response onto [`UpstreamError`]
fn classify(status: StatusCode, retry_after: Option<Duration>, body: &str) -> UpstreamError {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status} - {}", body.chars().take(200).collect::<String>())
    };

    match status {
        StatusCode::TOO_MANY_REQUESTS => UpstreamError::RateLimited { retry_after },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => UpstreamError::Unauthorized(detail),
        StatusCode::REQUEST_TIMEOUT => UpstreamError::Transient(detail),
        s if s.is_server_error() => UpstreamError::Transient(detail),
        _ => UpstreamError::Rejected(detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn endpoint_appends_metric_path_and_query() {
        let api = HttpMeteringApi::new(reqwest::Client::new(), "https://gw.example.com/api").unwrap();
        let url = api
            .endpoint("pdl-1", MetricType::DailyConsumption, day("2024-03-01"), day("2024-03-02"))
            .unwrap();

        assert_eq!(url.path(), "/api/metering_data_dc/v5/daily_consumption");
        assert_eq!(
            url.query(),
            Some("usage_point_id=pdl-1&start=2024-03-01&end=2024-03-02")
        );
    }

    #[test]
    fn rejects_invalid_base_url() {
        assert!(matches!(
            HttpMeteringApi::new(reqwest::Client::new(), "not a url"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn classifies_statuses() {
        assert!(matches!(
            classify(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(3)), ""),
            UpstreamError::RateLimited { retry_after: Some(d) } if d == Duration::from_secs(3)
        ));
        assert!(matches!(classify(StatusCode::SERVICE_UNAVAILABLE, None, ""), UpstreamError::Transient(_)));
        assert!(matches!(classify(StatusCode::FORBIDDEN, None, ""), UpstreamError::Unauthorized(_)));
        assert!(matches!(classify(StatusCode::NOT_FOUND, None, "no data"), UpstreamError::Rejected(d) if d.contains("no data")));
    }

    #[test]
    fn parses_reading_envelope() {
        let body = r#"{"meter_reading":{"usage_point_id":"pdl-1","interval_reading":[
            {"date":"2024-03-01","value":"1234"},{"date":"2024-03-02","value":"987"}]}}"#;
        let parsed: MeteringResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.meter_reading.interval_reading.len(), 2);
        assert_eq!(parsed.meter_reading.interval_reading[1].value, "987");
    }
}
