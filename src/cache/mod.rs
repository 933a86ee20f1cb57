//! Encrypted per-day cache of upstream metering data
//!
//! One entry per `(meter, day, metric)`. Entries are sealed with the
//! caller's [`CallerKey`]; anything that cannot be opened with the key
//! presented on read (foreign key, corruption, expiry) is a miss.

mod crypto;

use std::time::Duration;

use chrono::{NaiveDate, Utc};
use rusqlite::OptionalExtension;
use serde::Serialize;

pub use crypto::{CallerKey, NONCE_LEN, Sealed};

use crate::db::{DbPool, format_day};
use crate::metric::{DayPayload, MetricType};
use crate::Result;

/// Cache usage counters for the admin surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: u64,
    pub expired: u64,
}

/// SQLite-backed encrypted cache store
#[derive(Clone)]
pub struct CacheStore {
    pool: DbPool,
    ttl: Duration,
}

impl CacheStore {
    /// Create a cache store with the given default TTL
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool, ttl: Duration) -> Self {
        Self { pool, ttl }
    }

    /// Default time-to-live applied by the adapter
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Read a cached day, or `None` on miss
    ///
    /// Expired, foreign-key and undecryptable entries are all misses.
    ///
    /// # Errors
    ///
    /// Returns error only if the database cannot be queried
    pub fn get(
        &self,
        meter: &str,
        day: NaiveDate,
        metric: MetricType,
        key: &CallerKey,
    ) -> Result<Option<DayPayload>> {
        let conn = self.pool.get()?;

        let row = conn
            .query_row(
                "SELECT nonce, ciphertext, key_fingerprint, created_at, ttl_secs
                 FROM cache_entries WHERE meter_id = ?1 AND day = ?2 AND metric = ?3",
                rusqlite::params![meter, format_day(day), metric.as_str()],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((nonce, ciphertext, fingerprint, created_at, ttl_secs)) = row else {
            return Ok(None);
        };

        if Utc::now().timestamp() >= created_at.saturating_add(ttl_secs) {
            tracing::debug!(meter, %day, %metric, "cache entry expired");
            return Ok(None);
        }

        if fingerprint != key.fingerprint() {
            tracing::debug!(meter, %day, %metric, "cache entry sealed for another caller");
            return Ok(None);
        }

        let plaintext = match key.open(&nonce, &ciphertext) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(meter, %day, %metric, error = %e, "corrupt cache entry, refetching");
                return Ok(None);
            }
        };

        match serde_json::from_slice::<DayPayload>(&plaintext) {
            Ok(payload) if payload.date == day => Ok(Some(payload)),
            Ok(payload) => {
                tracing::warn!(meter, %day, stored = %payload.date, "cache entry holds another day");
                Ok(None)
            }
            Err(e) => {
                tracing::warn!(meter, %day, %metric, error = %e, "undecodable cache entry, refetching");
                Ok(None)
            }
        }
    }

    /// Seal and store one day, replacing any existing entry (last write wins)
    ///
    /// # Errors
    ///
    /// Returns error if encryption or the database write fails
    pub fn put(
        &self,
        meter: &str,
        metric: MetricType,
        key: &CallerKey,
        payload: &DayPayload,
        ttl: Duration,
    ) -> Result<()> {
        let plaintext = serde_json::to_vec(payload)?;
        let sealed = key.seal(&plaintext)?;
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);

        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO cache_entries (meter_id, day, metric, nonce, ciphertext, key_fingerprint, created_at, ttl_secs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(meter_id, day, metric) DO UPDATE SET
                nonce = excluded.nonce,
                ciphertext = excluded.ciphertext,
                key_fingerprint = excluded.key_fingerprint,
                created_at = excluded.created_at,
                ttl_secs = excluded.ttl_secs",
            rusqlite::params![
                meter,
                format_day(payload.date),
                metric.as_str(),
                sealed.nonce.as_slice(),
                sealed.ciphertext,
                key.fingerprint(),
                Utc::now().timestamp(),
                ttl_secs,
            ],
        )?;

        tracing::trace!(meter, day = %payload.date, %metric, "cached day");
        Ok(())
    }

    /// Drop one cached day; returns whether an entry existed
    ///
    /// # Errors
    ///
    /// Returns error if the database write fails
    pub fn invalidate(&self, meter: &str, day: NaiveDate, metric: MetricType) -> Result<bool> {
        let conn = self.pool.get()?;
        let removed = conn.execute(
            "DELETE FROM cache_entries WHERE meter_id = ?1 AND day = ?2 AND metric = ?3",
            rusqlite::params![meter, format_day(day), metric.as_str()],
        )?;

        tracing::info!(meter, %day, %metric, removed, "cache entry invalidated");
        Ok(removed > 0)
    }

    /// Drop every cached day of a meter
    ///
    /// # Errors
    ///
    /// Returns error if the database write fails
    pub fn invalidate_meter(&self, meter: &str) -> Result<usize> {
        let conn = self.pool.get()?;
        let removed = conn.execute("DELETE FROM cache_entries WHERE meter_id = ?1", [meter])?;

        tracing::info!(meter, removed, "meter cache invalidated");
        Ok(removed)
    }

    /// Delete entries past their TTL to reclaim storage
    ///
    /// # Errors
    ///
    /// Returns error if the database write fails
    pub fn purge_expired(&self) -> Result<usize> {
        let conn = self.pool.get()?;
        let removed = conn.execute(
            "DELETE FROM cache_entries WHERE created_at + ttl_secs <= ?1",
            [Utc::now().timestamp()],
        )?;

        if removed > 0 {
            tracing::info!(removed, "purged expired cache entries");
        }
        Ok(removed)
    }

    /// Count live and expired entries
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be queried
    pub fn stats(&self) -> Result<CacheStats> {
        let conn = self.pool.get()?;
        let (entries, expired): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN created_at + ttl_secs <= ?1 THEN 1 ELSE 0 END), 0)
             FROM cache_entries",
            [Utc::now().timestamp()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(CacheStats {
            entries: u64::try_from(entries).unwrap_or_default(),
            expired: u64::try_from(expired).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::*;
    use crate::db;
    use crate::metric::Reading;

    const DAY_TTL: Duration = Duration::from_secs(86_400);

    fn store() -> CacheStore {
        CacheStore::new(db::init_memory().unwrap(), DAY_TTL)
    }

    fn key(secret: &str) -> CallerKey {
        CallerKey::derive(&SecretString::new(secret.into()))
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    fn payload(d: u32, value: &str) -> DayPayload {
        DayPayload {
            date: day(d),
            readings: vec![Reading {
                date: format_day(day(d)),
                value: value.to_string(),
            }],
        }
    }

    #[test]
    fn put_then_get_with_same_key() {
        let store = store();
        let k = key("alice");
        store
            .put("pdl-1", MetricType::DailyConsumption, &k, &payload(1, "1200"), DAY_TTL)
            .unwrap();

        let got = store.get("pdl-1", day(1), MetricType::DailyConsumption, &k).unwrap();
        assert_eq!(got, Some(payload(1, "1200")));
    }

    #[test]
    fn different_key_reads_as_miss() {
        let store = store();
        store
            .put("pdl-1", MetricType::DailyConsumption, &key("alice"), &payload(1, "1"), DAY_TTL)
            .unwrap();

        let got = store
            .get("pdl-1", day(1), MetricType::DailyConsumption, &key("mallory"))
            .unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn metric_and_day_are_part_of_the_key() {
        let store = store();
        let k = key("alice");
        store
            .put("pdl-1", MetricType::DailyConsumption, &k, &payload(1, "1"), DAY_TTL)
            .unwrap();

        assert!(store.get("pdl-1", day(1), MetricType::DailyProduction, &k).unwrap().is_none());
        assert!(store.get("pdl-1", day(2), MetricType::DailyConsumption, &k).unwrap().is_none());
        assert!(store.get("pdl-2", day(1), MetricType::DailyConsumption, &k).unwrap().is_none());
    }

    #[test]
    fn expired_entry_is_absent() {
        let store = store();
        let k = key("alice");
        store
            .put("pdl-1", MetricType::DailyConsumption, &k, &payload(1, "1"), Duration::ZERO)
            .unwrap();

        assert!(store.get("pdl-1", day(1), MetricType::DailyConsumption, &k).unwrap().is_none());
        assert_eq!(store.stats().unwrap(), CacheStats { entries: 1, expired: 1 });
        assert_eq!(store.purge_expired().unwrap(), 1);
        assert_eq!(store.stats().unwrap().entries, 0);
    }

    #[test]
    fn rewrite_overwrites_previous_value() {
        let store = store();
        let k = key("alice");
        store
            .put("pdl-1", MetricType::DailyConsumption, &k, &payload(1, "1"), DAY_TTL)
            .unwrap();
        store
            .put("pdl-1", MetricType::DailyConsumption, &k, &payload(1, "2"), DAY_TTL)
            .unwrap();

        let got = store.get("pdl-1", day(1), MetricType::DailyConsumption, &k).unwrap();
        assert_eq!(got, Some(payload(1, "2")));
        assert_eq!(store.stats().unwrap().entries, 1);
    }

    #[test]
    fn corrupted_ciphertext_is_a_miss() {
        let pool = db::init_memory().unwrap();
        let store = CacheStore::new(pool.clone(), DAY_TTL);
        let k = key("alice");
        store
            .put("pdl-1", MetricType::DailyConsumption, &k, &payload(1, "1"), DAY_TTL)
            .unwrap();

        pool.get()
            .unwrap()
            .execute("UPDATE cache_entries SET ciphertext = x'00010203'", [])
            .unwrap();

        assert!(store.get("pdl-1", day(1), MetricType::DailyConsumption, &k).unwrap().is_none());
    }

    #[test]
    fn invalidate_removes_single_day() {
        let store = store();
        let k = key("alice");
        for d in 1..=3 {
            store
                .put("pdl-1", MetricType::DailyConsumption, &k, &payload(d, "1"), DAY_TTL)
                .unwrap();
        }

        assert!(store.invalidate("pdl-1", day(2), MetricType::DailyConsumption).unwrap());
        assert!(!store.invalidate("pdl-1", day(2), MetricType::DailyConsumption).unwrap());
        assert!(store.get("pdl-1", day(2), MetricType::DailyConsumption, &k).unwrap().is_none());
        assert!(store.get("pdl-1", day(3), MetricType::DailyConsumption, &k).unwrap().is_some());

        assert_eq!(store.invalidate_meter("pdl-1").unwrap(), 2);
    }
}
