//! Client side of the upstream metering API

mod http;
pub mod retry;

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;

pub use http::HttpMeteringApi;
pub use retry::RetryPolicy;

use crate::Error;
use crate::metric::{MetricType, Reading};

/// Failure of one upstream metering call
#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    /// HTTP 429
    #[error("rate limited by upstream")]
    RateLimited { retry_after: Option<Duration> },

    /// Timeout, connection failure or 5xx
    #[error("transient upstream failure: {0}")]
    Transient(String),

    /// The bearer token was refused (401/403)
    #[error("upstream refused the access token: {0}")]
    Unauthorized(String),

    /// Any other 4xx, or an unreadable response
    #[error("upstream rejected the request: {0}")]
    Rejected(String),
}

impl UpstreamError {
    /// Whether retrying the same call may succeed
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Transient(_))
    }

    /// Server-provided wait before the next attempt
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<UpstreamError> for Error {
    fn from(e: UpstreamError) -> Self {
        match e {
            UpstreamError::RateLimited { .. } => Self::RateLimited(e.to_string()),
            UpstreamError::Transient(msg) => Self::UpstreamTransient(msg),
            UpstreamError::Unauthorized(msg) | UpstreamError::Rejected(msg) => {
                Self::UpstreamRejected(msg)
            }
        }
    }
}

/// Upstream metering data source
#[async_trait]
pub trait MeteringApi: Send + Sync {
    /// Fetch readings of `metric` for `meter` over `[start, end)`
    async fn fetch(
        &self,
        bearer: &str,
        meter: &str,
        metric: MetricType,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Reading>, UpstreamError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rate_limits_and_transients_are_recoverable() {
        assert!(UpstreamError::RateLimited { retry_after: None }.is_recoverable());
        assert!(UpstreamError::Transient("503".into()).is_recoverable());
        assert!(!UpstreamError::Unauthorized("401".into()).is_recoverable());
        assert!(!UpstreamError::Rejected("400".into()).is_recoverable());
    }

    #[test]
    fn maps_onto_gateway_errors() {
        let err: Error = UpstreamError::Transient("502".into()).into();
        assert!(matches!(err, Error::UpstreamTransient(_)));

        let err: Error = UpstreamError::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        }
        .into();
        assert!(matches!(err, Error::RateLimited(_)));

        let err: Error = UpstreamError::Unauthorized("401".into()).into();
        assert!(matches!(err, Error::UpstreamRejected(_)));
    }
}
