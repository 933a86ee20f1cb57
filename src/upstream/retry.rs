//! Retry with exponential backoff for metering API calls

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::config::UpstreamConfig;

/// Retry policy for metering API calls
///
/// Controls how many times a failed request is retried and how
/// long to wait between attempts using exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Base delay between retries (doubles each attempt)
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Policy from the upstream configuration
    #[must_use]
    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self {
            max_retries: config.retry_max,
            base_delay: Duration::from_millis(config.retry_base_ms),
            ..Self::default()
        }
    }

    /// Compute the delay before the next retry attempt.
    ///
    /// A server-provided `retry_after` wins but is capped at `max_delay`.
    /// Otherwise: `min(base_delay * 2^attempt + jitter, max_delay)` with
    /// 0-25% jitter.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(ra) = retry_after {
            return ra.min(self.max_delay);
        }

        let base = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);

        let jitter = base.mul_f64(rand::thread_rng().gen_range(0.0..0.25));

        (base + jitter).min(self.max_delay)
    }
}

/// Parse a `Retry-After` header: delta seconds or an HTTP date
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    (at - Utc::now()).to_std().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_delta_seconds() {
        assert_eq!(parse_retry_after("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after(" 1 "), Some(Duration::from_secs(1)));
    }

    #[test]
    fn parses_http_date_in_future() {
        let at = (Utc::now() + chrono::Duration::seconds(120)).to_rfc2822();
        let delay = parse_retry_after(&at).unwrap();
        assert!(delay > Duration::from_secs(100) && delay <= Duration::from_secs(120));
    }

    #[test]
    fn past_date_and_garbage_are_ignored() {
        let past = (Utc::now() - chrono::Duration::seconds(60)).to_rfc2822();
        assert_eq!(parse_retry_after(&past), None);
        assert_eq!(parse_retry_after("soon"), None);
        assert_eq!(parse_retry_after(""), None);
    }

    #[test]
    fn respects_retry_after() {
        let policy = RetryPolicy::default();
        let ra = Duration::from_secs(10);
        assert_eq!(policy.delay_for_attempt(0, Some(ra)), ra);
    }

    #[test]
    fn caps_retry_after_at_max_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_for_attempt(0, Some(Duration::from_secs(120))),
            policy.max_delay
        );
    }

    #[test]
    fn backoff_doubles_with_bounded_jitter() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        };
        for attempt in 0..4 {
            let expected = Duration::from_millis(100 * 2u64.pow(attempt));
            let delay = policy.delay_for_attempt(attempt, None);
            assert!(delay >= expected, "attempt {attempt}: {delay:?}");
            assert!(delay <= expected.mul_f64(1.25), "attempt {attempt}: {delay:?}");
        }
    }

    #[test]
    fn backoff_never_exceeds_max_delay() {
        let policy = RetryPolicy {
            max_retries: 50,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        };
        assert_eq!(policy.delay_for_attempt(20, None), Duration::from_secs(5));
    }

    #[test]
    fn from_config_uses_configured_values() {
        let config = UpstreamConfig {
            retry_max: 7,
            retry_base_ms: 40,
            ..UpstreamConfig::default()
        };
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_retries, 7);
        assert_eq!(policy.base_delay, Duration::from_millis(40));
    }
}
