//! Metering adapter: serves day ranges from cache or the upstream API
//!
//! Per request: cache lookup for every day, quota reservation for hits and
//! misses, then one rate-limited upstream call per batch of contiguous
//! missing days. Each upstream attempt runs in its own task so a result
//! already in flight is cached even if the request is dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::NaiveDate;
use serde::Serialize;

use crate::cache::{CacheStore, CallerKey};
use crate::caller::Caller;
use crate::config::UpstreamConfig;
use crate::metric::{DayPayload, MetricType, Reading};
use crate::quota::{QuotaKind, QuotaTracker};
use crate::rate_limit::SharedLimiter;
use crate::tokens::TokenStore;
use crate::upstream::{MeteringApi, RetryPolicy, UpstreamError};
use crate::{Error, Result};

/// Where a day of the result came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DaySource {
    Cached,
    Fetched,
}

/// One served day
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DaySeries {
    pub date: NaiveDate,
    pub source: DaySource,
    pub readings: Vec<Reading>,
}

/// A day that could not be served, with the reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayFailure {
    pub date: NaiveDate,
    pub reason: String,
}

/// Result of a range read; may be partial
#[derive(Debug, Clone, Serialize)]
pub struct TimeSeries {
    pub meter: String,
    pub metric: MetricType,
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// Served days in date order
    pub days: Vec<DaySeries>,
    /// Days that failed after exhausting retries, in date order
    pub failures: Vec<DayFailure>,
}

impl TimeSeries {
    /// Whether every requested day was served
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// All readings of the served days, flattened in date order
    pub fn readings(&self) -> impl Iterator<Item = &Reading> {
        self.days.iter().flat_map(|d| d.readings.iter())
    }
}

/// Days fetched from upstream and days that failed
struct Backfill {
    days: Vec<DaySeries>,
    failures: Vec<DayFailure>,
}

/// Quota charged to one request that has not been settled yet
///
/// Dropping the reservation refunds the cached hits unless they were served,
/// plus every missing day no upstream call was issued for. Days already in
/// flight stay charged: their call completes and is cached regardless.
struct Reservation {
    quota: QuotaTracker,
    caller: String,
    day: NaiveDate,
    cached: u32,
    undispatched: AtomicU32,
}

impl Reservation {
    fn new(quota: QuotaTracker, caller: &str, day: NaiveDate, cached: u32, uncached: u32) -> Self {
        Self {
            quota,
            caller: caller.to_string(),
            day,
            cached,
            undispatched: AtomicU32::new(uncached),
        }
    }

    /// The cached hits were delivered
    fn settle_cached(&mut self) {
        self.cached = 0;
    }

    /// `n` missing days now have an upstream call in flight
    fn dispatch(&self, n: u32) {
        let _ = self
            .undispatched
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| {
                Some(left.saturating_sub(n))
            });
    }

    /// Refund `n` dispatched days that ended up not being served
    fn release(&self, n: u32) {
        self.refund(QuotaKind::Uncached, n);
    }

    fn refund(&self, kind: QuotaKind, n: u32) {
        if let Err(e) = self.quota.refund(&self.caller, self.day, kind, n) {
            tracing::warn!(caller = %self.caller, %kind, error = %e, "quota refund failed");
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let undispatched = self.undispatched.swap(0, Ordering::AcqRel);
        if self.cached > 0 || undispatched > 0 {
            tracing::debug!(
                caller = %self.caller,
                cached = self.cached,
                uncached = undispatched,
                "releasing unused quota"
            );
        }
        self.refund(QuotaKind::Cached, self.cached);
        self.refund(QuotaKind::Uncached, undispatched);
    }
}

/// Orchestrates cache, quota, tokens and the rate limiter
#[derive(Clone)]
pub struct MeteringAdapter {
    cache: CacheStore,
    quota: QuotaTracker,
    tokens: TokenStore,
    limiter: SharedLimiter,
    api: Arc<dyn MeteringApi>,
    retry: RetryPolicy,
    batch_days: usize,
    max_range_days: u32,
}

impl MeteringAdapter {
    /// Create an adapter with default retry and batching settings
    #[must_use]
    pub fn new(
        cache: CacheStore,
        quota: QuotaTracker,
        tokens: TokenStore,
        limiter: SharedLimiter,
        api: Arc<dyn MeteringApi>,
    ) -> Self {
        let defaults = UpstreamConfig::default();
        Self {
            cache,
            quota,
            tokens,
            limiter,
            api,
            retry: RetryPolicy::from_config(&defaults),
            batch_days: usize::try_from(defaults.batch_days).unwrap_or(1),
            max_range_days: defaults.max_range_days,
        }
    }

    /// Apply retry, batching and range settings from configuration
    #[must_use]
    pub fn with_upstream_config(mut self, config: &UpstreamConfig) -> Self {
        self.retry = RetryPolicy::from_config(config);
        self.batch_days = usize::try_from(config.batch_days.max(1)).unwrap_or(1);
        self.max_range_days = config.max_range_days;
        self
    }

    /// Maximum contiguous missing days fetched per upstream call
    #[must_use]
    pub fn with_batch_days(mut self, batch_days: usize) -> Self {
        self.batch_days = batch_days.max(1);
        self
    }

    #[must_use]
    pub const fn cache(&self) -> &CacheStore {
        &self.cache
    }

    #[must_use]
    pub const fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    #[must_use]
    pub const fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    #[must_use]
    pub const fn limiter(&self) -> &SharedLimiter {
        &self.limiter
    }

    /// Read `metric` for `meter` over the inclusive range `[start, end]`
    ///
    /// Cached days are charged to the caller's cached quota, missing days to
    /// the uncached quota, both before any upstream traffic. Days whose fetch
    /// fails after retries are listed in `failures` and refunded. If the
    /// request errors or is dropped, everything not yet sent upstream is
    /// refunded too.
    ///
    /// # Errors
    ///
    /// Returns `QuotaExceeded`, `ConsentRevoked` or `NoConsent` before any
    /// result is assembled, `InvalidRange` for oversized ranges and
    /// `Cancelled` if the rate limiter shuts down or times out
    pub async fn fetch_range(
        &self,
        meter: &str,
        metric: MetricType,
        start: NaiveDate,
        end: NaiveDate,
        caller: &Caller,
    ) -> Result<TimeSeries> {
        let mut series = TimeSeries {
            meter: meter.to_string(),
            metric,
            start,
            end,
            days: Vec::new(),
            failures: Vec::new(),
        };

        if end < start {
            return Ok(series);
        }

        let span = (end - start).num_days() + 1;
        if span > i64::from(self.max_range_days) {
            return Err(Error::InvalidRange(format!(
                "{span} days requested, at most {} allowed",
                self.max_range_days
            )));
        }

        let mut misses = Vec::new();
        for date in start.iter_days().take_while(|d| *d <= end) {
            match self.cache.get(meter, date, metric, &caller.key)? {
                Some(payload) => series.days.push(DaySeries {
                    date,
                    source: DaySource::Cached,
                    readings: payload.readings,
                }),
                None => misses.push(date),
            }
        }

        let hits = u32::try_from(series.days.len()).unwrap_or(u32::MAX);
        let missing = u32::try_from(misses.len()).unwrap_or(u32::MAX);
        let day = self.quota.reserve(&caller.id, hits, missing)?;
        let mut reservation = Reservation::new(self.quota.clone(), &caller.id, day, hits, missing);

        tracing::debug!(
            meter,
            %metric,
            caller = %caller.id,
            hits,
            misses = missing,
            "range partitioned"
        );

        if misses.is_empty() {
            reservation.settle_cached();
            return Ok(series);
        }

        match self.fetch_misses(meter, metric, &misses, caller, &reservation).await {
            Ok(backfill) => {
                reservation.settle_cached();
                series.days.extend(backfill.days);
                series.days.sort_by_key(|d| d.date);
                series.failures = backfill.failures;
                Ok(series)
            }
            Err(error) => {
                tracing::warn!(meter, %metric, caller = %caller.id, error = %error, "range fetch aborted");
                Err(error)
            }
        }
    }

    /// Drop one cached day (admin cache busting)
    ///
    /// # Errors
    ///
    /// Returns error if the database write fails
    pub fn invalidate(&self, meter: &str, date: NaiveDate, metric: MetricType) -> Result<bool> {
        let removed = self.cache.invalidate(meter, date, metric)?;
        tracing::info!(meter, %date, %metric, removed, "cache entry invalidated");
        Ok(removed)
    }

    /// Fetch the missing days batch by batch
    ///
    /// Failed days are refunded through `reservation` as they are known.
    async fn fetch_misses(
        &self,
        meter: &str,
        metric: MetricType,
        misses: &[NaiveDate],
        caller: &Caller,
        reservation: &Reservation,
    ) -> Result<Backfill> {
        let mut fetched = Vec::new();
        let mut failures = Vec::new();

        let owner = self.tokens.owner_for_meter(meter)?;

        for batch in contiguous_batches(misses, self.batch_days) {
            let outcome = self
                .fetch_batch(&owner, meter, metric, &batch, &caller.key, reservation)
                .await?;
            match outcome {
                Ok(days) => fetched.extend(days.into_iter().map(|payload| DaySeries {
                    date: payload.date,
                    source: DaySource::Fetched,
                    readings: payload.readings,
                })),
                Err(reason) => {
                    reservation.release(batch_len(&batch));
                    failures.extend(batch.iter().map(|&date| DayFailure {
                        date,
                        reason: reason.clone(),
                    }));
                }
            }
        }

        // Batch days the upstream returned nothing for
        let mut served: Vec<NaiveDate> = fetched.iter().map(|d: &DaySeries| d.date).collect();
        served.extend(failures.iter().map(|f| f.date));
        let mut empty = 0;
        for &date in misses {
            if !served.contains(&date) {
                empty += 1;
                failures.push(DayFailure {
                    date,
                    reason: "no readings returned by upstream".to_string(),
                });
            }
        }
        reservation.release(empty);
        failures.sort_by_key(|f| f.date);

        Ok(Backfill {
            days: fetched,
            failures,
        })
    }

    /// Fetch one batch with retries
    ///
    /// The outer error aborts the request; the inner one fails only this batch.
    async fn fetch_batch(
        &self,
        owner: &str,
        meter: &str,
        metric: MetricType,
        batch: &[NaiveDate],
        key: &CallerKey,
        reservation: &Reservation,
    ) -> Result<std::result::Result<Vec<DayPayload>, String>> {
        let (Some(&first), Some(&last)) = (batch.first(), batch.last()) else {
            return Ok(Ok(Vec::new()));
        };

        let mut attempt = 0;
        let mut reauthorized = false;
        let mut dispatched = false;

        loop {
            // Re-read on every call so a revocation mid-range stops further traffic
            let ready = match self.tokens.get_valid_token(owner).await {
                Ok(token) => self.limiter.acquire(1).await.map(|()| token),
                Err(e) => Err(e),
            };
            let token = match ready {
                Ok(token) => token,
                Err(e) => {
                    if dispatched {
                        reservation.release(batch_len(batch));
                    }
                    return Err(e);
                }
            };

            if !dispatched {
                reservation.dispatch(batch_len(batch));
                dispatched = true;
            }

            let outcome = self
                .spawn_attempt(token.access_token, meter, metric, first, last, key)
                .await;

            let err = match outcome {
                Ok(days) => return Ok(Ok(days)),
                Err(err) => err,
            };

            match err {
                UpstreamError::Unauthorized(ref reason) if !reauthorized => {
                    tracing::warn!(owner, %reason, "upstream refused token, forcing refresh");
                    reauthorized = true;
                    if let Err(e) = self.tokens.mark_stale(owner) {
                        reservation.release(batch_len(batch));
                        return Err(e);
                    }
                }
                e if e.is_recoverable() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for_attempt(attempt, e.retry_after());
                    tracing::warn!(
                        meter,
                        %first,
                        %last,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "upstream call failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                e => {
                    tracing::warn!(meter, %first, %last, attempt, error = %e, "giving up on batch");
                    return Ok(Err(Error::from(e).to_string()));
                }
            }
        }
    }

    /// Run one upstream call and cache its days in a detached task
    async fn spawn_attempt(
        &self,
        bearer: String,
        meter: &str,
        metric: MetricType,
        first: NaiveDate,
        last: NaiveDate,
        key: &CallerKey,
    ) -> std::result::Result<Vec<DayPayload>, UpstreamError> {
        let api = self.api.clone();
        let cache = self.cache.clone();
        let key = key.clone();
        let meter = meter.to_string();
        let ttl = self.cache.ttl();

        let handle = tokio::spawn(async move {
            let end = last.succ_opt().unwrap_or(last);
            let readings = api.fetch(&bearer, &meter, metric, first, end).await?;
            let days: Vec<DayPayload> = DayPayload::split_by_day(readings)
                .into_iter()
                .filter(|d| d.date >= first && d.date <= last)
                .collect();

            for day in &days {
                if let Err(e) = cache.put(&meter, metric, &key, day, ttl) {
                    tracing::warn!(meter = %meter, day = %day.date, error = %e, "failed to cache day");
                }
            }
            Ok(days)
        });

        handle
            .await
            .unwrap_or_else(|e| Err(UpstreamError::Transient(format!("upstream task failed: {e}"))))
    }
}

fn batch_len(batch: &[NaiveDate]) -> u32 {
    u32::try_from(batch.len()).unwrap_or(u32::MAX)
}

/// Split sorted days into runs of consecutive dates, each at most `max` long
fn contiguous_batches(days: &[NaiveDate], max: usize) -> Vec<Vec<NaiveDate>> {
    let mut batches: Vec<Vec<NaiveDate>> = Vec::new();
    for &day in days {
        match batches.last_mut() {
            Some(batch)
                if batch.len() < max && batch.last().and_then(|d| d.succ_opt()) == Some(day) =>
            {
                batch.push(day);
            }
            _ => batches.push(vec![day]),
        }
    }
    batches
}
