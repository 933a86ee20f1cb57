//! Identity of an internal caller of the adapter
//!
//! Callers are registered by an operator and authenticate with a bearer
//! secret. Only a salted digest of the secret is stored; the secret itself
//! is shown once, when it is issued.

use chrono::{DateTime, Utc};
use rand::RngCore;
use rusqlite::{OptionalExtension, params};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::cache::CallerKey;
use crate::db::{DbPool, parse_datetime};
use crate::{Error, Result};

/// Domain separation prefix for stored secret digests
const SECRET_DIGEST_CONTEXT: &[u8] = b"conso-caller-secret-v1\0";

/// Random bytes in an issued secret
const SECRET_BYTES: usize = 32;

/// An account or application reading metering data through the gateway
///
/// Quotas are charged to `id`; cache entries are sealed with `key`.
#[derive(Debug, Clone)]
pub struct Caller {
    pub id: String,
    pub key: CallerKey,
}

impl Caller {
    /// Caller with an explicit id whose cache key derives from `secret`
    #[must_use]
    pub fn new(id: impl Into<String>, secret: &SecretString) -> Self {
        Self {
            id: id.into(),
            key: CallerKey::derive(secret),
        }
    }
}

/// A registered caller as listed to operators
#[derive(Debug, Clone, Serialize)]
pub struct CallerRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Registered callers, looked up by the digest of their bearer secret
#[derive(Clone)]
pub struct CallerRegistry {
    pool: DbPool,
}

impl CallerRegistry {
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Register `id` with a freshly generated secret
    ///
    /// Re-issuing for a known id rotates its secret; the old one stops
    /// working immediately.
    ///
    /// # Errors
    ///
    /// Returns `InvalidCaller` for an empty id, or a database error
    pub fn issue(&self, id: &str) -> Result<SecretString> {
        let mut bytes = [0u8; SECRET_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        let secret = SecretString::new(hex::encode(bytes).into());

        self.register(id, &secret)?;
        Ok(secret)
    }

    /// Register `id` with a secret chosen by the operator
    ///
    /// # Errors
    ///
    /// Returns `InvalidCaller` for an empty id or a secret already held by
    /// another caller, or a database error
    pub fn register(&self, id: &str, secret: &SecretString) -> Result<()> {
        let id = id.trim();
        if id.is_empty() {
            return Err(Error::InvalidCaller("caller id must not be empty".to_string()));
        }
        if secret.expose_secret().is_empty() {
            return Err(Error::InvalidCaller("caller secret must not be empty".to_string()));
        }

        let digest = secret_digest(secret);
        let conn = self.pool.get()?;

        let holder: Option<String> = conn
            .query_row(
                "SELECT caller_id FROM callers WHERE secret_hash = ?1",
                [&digest],
                |row| row.get(0),
            )
            .optional()?;
        if holder.is_some_and(|holder| holder != id) {
            return Err(Error::InvalidCaller("secret already in use".to_string()));
        }

        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO callers (caller_id, secret_hash, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(caller_id) DO UPDATE SET
                 secret_hash = excluded.secret_hash,
                 updated_at = excluded.updated_at",
            params![id, digest, now],
        )?;

        tracing::info!(caller = id, "caller registered");
        Ok(())
    }

    /// Resolve a bearer secret to its registered caller
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be queried
    pub fn authenticate(&self, secret: &SecretString) -> Result<Option<Caller>> {
        let conn = self.pool.get()?;
        let id: Option<String> = conn
            .query_row(
                "SELECT caller_id FROM callers WHERE secret_hash = ?1",
                [secret_digest(secret)],
                |row| row.get(0),
            )
            .optional()?;

        Ok(id.map(|id| Caller::new(id, secret)))
    }

    /// Unregister a caller; its secret stops working
    ///
    /// # Errors
    ///
    /// Returns error if the database write fails
    pub fn remove(&self, id: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        let removed = conn.execute("DELETE FROM callers WHERE caller_id = ?1", [id])?;

        if removed > 0 {
            tracing::info!(caller = id, "caller removed");
        }
        Ok(removed > 0)
    }

    /// All registered callers, by id
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be queried
    pub fn list(&self) -> Result<Vec<CallerRecord>> {
        let conn = self.pool.get()?;
        let mut stmt =
            conn.prepare("SELECT caller_id, created_at, updated_at FROM callers ORDER BY caller_id")?;

        let records = stmt
            .query_map([], |row| {
                let created_at: String = row.get(1)?;
                let updated_at: String = row.get(2)?;
                Ok(CallerRecord {
                    id: row.get(0)?,
                    created_at: parse_datetime(&created_at),
                    updated_at: parse_datetime(&updated_at),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(records)
    }
}

/// Stored digest of a bearer secret
fn secret_digest(secret: &SecretString) -> String {
    let mut hasher = Sha256::new();
    hasher.update(SECRET_DIGEST_CONTEXT);
    hasher.update(secret.expose_secret().as_bytes());
    hex::encode(hasher.finalize())
}
