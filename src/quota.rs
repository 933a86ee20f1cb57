//! Per-caller daily quotas for cached and uncached reads
//!
//! Counters live in `SQLite` so every pooled connection (and every process
//! sharing the database) sees the same totals. Check-then-increment runs in
//! an `IMMEDIATE` transaction, which takes the write lock up front.

use std::fmt;

use chrono::{FixedOffset, NaiveDate, Utc};
use rusqlite::{OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::config::QuotaConfig;
use crate::db::{DbPool, format_day};
use crate::{Error, Result};

/// Kind of read charged against a quota
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaKind {
    /// Served from the cache store
    Cached,
    /// Caused an upstream call
    Uncached,
}

impl QuotaKind {
    /// Stored representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cached => "cached",
            Self::Uncached => "uncached",
        }
    }
}

impl fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Used and allowed reads of one kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaCounter {
    pub used: u32,
    pub limit: u32,
}

impl QuotaCounter {
    /// Reads left today
    #[must_use]
    pub const fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.used)
    }
}

/// A caller's consumption for the current quota day
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaUsage {
    pub caller_id: String,
    pub day: NaiveDate,
    pub cached: QuotaCounter,
    pub uncached: QuotaCounter,
}

/// Atomic per-caller, per-day read counters
#[derive(Clone)]
pub struct QuotaTracker {
    pool: DbPool,
    cached_per_day: u32,
    uncached_per_day: u32,
    offset: FixedOffset,
}

impl QuotaTracker {
    /// Create a tracker with the configured ceilings and day boundary
    ///
    /// # Errors
    ///
    /// Returns error if the reset offset is not a valid UTC offset
    pub fn new(pool: DbPool, config: &QuotaConfig) -> Result<Self> {
        let offset = FixedOffset::east_opt(config.reset_offset_hours * 3600).ok_or_else(|| {
            Error::Config(format!(
                "invalid quota reset offset: {}h",
                config.reset_offset_hours
            ))
        })?;

        Ok(Self {
            pool,
            cached_per_day: config.cached_per_day,
            uncached_per_day: config.uncached_per_day,
            offset,
        })
    }

    /// Configured ceiling for a kind
    #[must_use]
    pub const fn ceiling(&self, kind: QuotaKind) -> u32 {
        match kind {
            QuotaKind::Cached => self.cached_per_day,
            QuotaKind::Uncached => self.uncached_per_day,
        }
    }

    /// Current quota day (UTC unless an offset is configured)
    #[must_use]
    pub fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.offset).date_naive()
    }

    /// Charge one read of `kind` to `caller`
    ///
    /// # Errors
    ///
    /// Returns `QuotaExceeded` if the caller is already at the ceiling
    pub fn check_and_increment(&self, caller: &str, kind: QuotaKind) -> Result<()> {
        let (cached, uncached) = match kind {
            QuotaKind::Cached => (1, 0),
            QuotaKind::Uncached => (0, 1),
        };
        self.reserve(caller, cached, uncached).map(|_| ())
    }

    /// Charge `cached` and `uncached` reads at once, all or nothing
    ///
    /// Cached reads are checked first, so a request exceeding both ceilings
    /// reports the cached one.
    ///
    /// # Errors
    ///
    /// Returns `QuotaExceeded` naming the first ceiling that would be crossed;
    /// nothing is charged in that case
    pub fn reserve(&self, caller: &str, cached: u32, uncached: u32) -> Result<NaiveDate> {
        let day = self.today();
        self.charge(caller, day, cached, uncached)?;
        Ok(day)
    }

    /// Charge reads to the counters of `day`
    fn charge(&self, caller: &str, day: NaiveDate, cached: u32, uncached: u32) -> Result<()> {
        if cached == 0 && uncached == 0 {
            return Ok(());
        }

        let day = format_day(day);
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        for (kind, wanted) in [(QuotaKind::Cached, cached), (QuotaKind::Uncached, uncached)] {
            if wanted == 0 {
                continue;
            }

            let used = current(&tx, caller, &day, kind)?;
            let limit = self.ceiling(kind);
            if used.saturating_add(wanted) > limit {
                tracing::warn!(caller, %kind, used, wanted, limit, "quota exceeded");
                return Err(Error::QuotaExceeded {
                    caller: caller.to_string(),
                    kind,
                });
            }

            tx.execute(
                "INSERT INTO quota_counters (caller_id, day, kind, count) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(caller_id, day, kind) DO UPDATE SET count = count + excluded.count",
                rusqlite::params![caller, day, kind.as_str(), wanted],
            )?;
        }

        tx.commit()?;
        tracing::debug!(caller, %day, cached, uncached, "quota reserved");
        Ok(())
    }

    /// Give back reads that were charged on `day` but never served
    ///
    /// `day` is the one returned by [`reserve`](Self::reserve), so a refund
    /// issued after midnight still credits the day that was charged.
    ///
    /// # Errors
    ///
    /// Returns error if the database write fails
    pub fn refund(&self, caller: &str, day: NaiveDate, kind: QuotaKind, n: u32) -> Result<()> {
        if n == 0 {
            return Ok(());
        }

        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE quota_counters SET count = MAX(count - ?4, 0)
             WHERE caller_id = ?1 AND day = ?2 AND kind = ?3",
            rusqlite::params![caller, format_day(day), kind.as_str(), n],
        )?;

        tracing::debug!(caller, %day, %kind, n, "quota refunded");
        Ok(())
    }

    /// Today's usage for a caller
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be queried
    pub fn usage(&self, caller: &str) -> Result<QuotaUsage> {
        self.usage_on(caller, self.today())
    }

    /// A caller's usage on a given quota day
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be queried
    pub fn usage_on(&self, caller: &str, today: NaiveDate) -> Result<QuotaUsage> {
        let day = format_day(today);
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        let cached = current(&tx, caller, &day, QuotaKind::Cached)?;
        let uncached = current(&tx, caller, &day, QuotaKind::Uncached)?;

        Ok(QuotaUsage {
            caller_id: caller.to_string(),
            day: today,
            cached: QuotaCounter {
                used: cached,
                limit: self.cached_per_day,
            },
            uncached: QuotaCounter {
                used: uncached,
                limit: self.uncached_per_day,
            },
        })
    }

    /// Delete counters of days before `day`
    ///
    /// # Errors
    ///
    /// Returns error if the database write fails
    pub fn prune_before(&self, day: NaiveDate) -> Result<usize> {
        let conn = self.pool.get()?;
        let removed = conn.execute("DELETE FROM quota_counters WHERE day < ?1", [format_day(day)])?;

        if removed > 0 {
            tracing::info!(removed, before = %day, "pruned quota counters");
        }
        Ok(removed)
    }
}

/// Current count for one caller, day and kind
fn current(tx: &Transaction<'_>, caller: &str, day: &str, kind: QuotaKind) -> Result<u32> {
    let count: Option<i64> = tx
        .query_row(
            "SELECT count FROM quota_counters WHERE caller_id = ?1 AND day = ?2 AND kind = ?3",
            rusqlite::params![caller, day, kind.as_str()],
            |row| row.get(0),
        )
        .optional()?;

    Ok(count.map_or(0, |c| u32::try_from(c).unwrap_or(u32::MAX)))
}
