//! Error types for the Conso gateway

use thiserror::Error;

use crate::quota::QuotaKind;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Conso gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The data owner withdrew consent; a new consent flow is required
    #[error("consent revoked for {0}: re-consent required")]
    ConsentRevoked(String),

    /// No consent was ever granted for this owner
    #[error("no consent on record for {0}: complete the authorization flow first")]
    NoConsent(String),

    /// Token refresh failed at the authorization server
    #[error("token refresh failed for {owner}: {reason}")]
    RefreshFailed { owner: String, reason: String },

    /// Caller exhausted today's quota for the given read kind
    #[error("daily {kind} quota exceeded for caller {caller}")]
    QuotaExceeded { caller: String, kind: QuotaKind },

    /// Upstream explicitly asked us to slow down
    #[error("upstream rate limited: {0}")]
    RateLimited(String),

    /// Upstream timeout, connection failure or 5xx
    #[error("upstream transient failure: {0}")]
    UpstreamTransient(String),

    /// Upstream rejected the request for a non-retryable reason
    #[error("upstream rejected request: {0}")]
    UpstreamRejected(String),

    /// Waiting for an outbound slot was cancelled (shutdown or timeout)
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Caller registration was refused
    #[error("invalid caller: {0}")]
    InvalidCaller(String),

    /// Requested date range is not acceptable
    #[error("invalid range: {0}")]
    InvalidRange(String),

    /// Encryption / key derivation failure
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl From<r2d2::Error> for Error {
    fn from(e: r2d2::Error) -> Self {
        Self::Database(e.to_string())
    }
}
