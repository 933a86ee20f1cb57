//! Configuration management for the Conso gateway
//!
//! Values come from an optional `conso.toml` file and are overridden by
//! `CONSO_*` environment variables.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::{Error, Result};

/// Gateway configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Path to data directory (database)
    pub data_dir: PathBuf,

    /// HTTP API server configuration
    pub api_server: ApiServerConfig,

    /// Cache store configuration
    pub cache: CacheConfig,

    /// Outbound rate limiter configuration
    pub rate_limit: RateLimitConfig,

    /// Per-caller daily quotas
    pub quota: QuotaConfig,

    /// Token lifecycle settings
    pub tokens: TokenConfig,

    /// Upstream metering API and OAuth endpoints
    pub upstream: UpstreamConfig,
}

/// HTTP API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Port to listen on
    pub port: u16,

    /// Bearer key for admin endpoints (from `CONSO_ADMIN_KEY`)
    pub admin_key: Option<String>,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            port: 18800,
            admin_key: None,
        }
    }
}

/// Cache store configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Time-to-live of a cached day
    pub ttl_secs: u64,

    /// Interval of the background task purging expired entries and old
    /// quota counters; 0 disables it
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 86_400,
            sweep_interval_secs: 3_600,
        }
    }
}

/// Outbound rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Outbound calls allowed per second
    pub per_second: u32,

    /// Bucket capacity
    pub burst: u32,

    /// Longest a caller may wait for a slot
    pub acquire_timeout_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_second: 5,
            burst: 1,
            acquire_timeout_secs: 30,
        }
    }
}

impl RateLimitConfig {
    /// Maximum wait in `acquire`
    #[must_use]
    pub const fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

/// Per-caller daily quota ceilings
#[derive(Debug, Clone)]
pub struct QuotaConfig {
    /// Reads that trigger an upstream call
    pub uncached_per_day: u32,

    /// Reads served from cache
    pub cached_per_day: u32,

    /// Day boundary offset from UTC, in hours
    pub reset_offset_hours: i32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            uncached_per_day: 50,
            cached_per_day: 1000,
            reset_offset_hours: 0,
        }
    }
}

/// Token lifecycle settings
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// Refresh when the access token expires within this margin
    pub refresh_margin_secs: i64,

    /// Flag consent as expiring when it ends within this many days
    pub consent_expiring_days: i64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            refresh_margin_secs: 120,
            consent_expiring_days: 7,
        }
    }
}

/// Upstream metering API and OAuth endpoints
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Metering API base URL
    pub base_url: Option<String>,

    /// OAuth token endpoint
    pub token_url: Option<String>,

    /// OAuth revocation endpoint
    pub revoke_url: Option<String>,

    /// OAuth client id
    pub client_id: Option<String>,

    /// OAuth client secret, redacted from `Debug`
    pub client_secret: Option<SecretString>,

    /// Per-call HTTP timeout
    pub timeout_secs: u64,

    /// Retry attempts on transient failures
    pub retry_max: u32,

    /// Backoff base delay in milliseconds
    pub retry_base_ms: u64,

    /// Maximum contiguous miss-days fetched per upstream call
    pub batch_days: u32,

    /// Longest accepted range in days
    pub max_range_days: u32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            token_url: None,
            revoke_url: None,
            client_id: None,
            client_secret: None,
            timeout_secs: 30,
            retry_max: 3,
            retry_base_ms: 500,
            batch_days: 1,
            max_range_days: 366,
        }
    }
}

/// Subset of the configuration that can be set from `conso.toml`
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    data_dir: Option<PathBuf>,
    port: Option<u16>,
    cache_ttl_secs: Option<u64>,
    cache_sweep_secs: Option<u64>,
    rate_limit_per_second: Option<u32>,
    rate_limit_burst: Option<u32>,
    rate_limit_timeout_secs: Option<u64>,
    quota_uncached: Option<u32>,
    quota_cached: Option<u32>,
    quota_reset_offset_hours: Option<i32>,
    token_refresh_margin_secs: Option<i64>,
    consent_expiring_days: Option<i64>,
    upstream_url: Option<String>,
    token_url: Option<String>,
    revoke_url: Option<String>,
    client_id: Option<String>,
    upstream_timeout_secs: Option<u64>,
    retry_max: Option<u32>,
    retry_base_ms: Option<u64>,
    batch_days: Option<u32>,
    max_range_days: Option<u32>,
}

/// Read and parse an environment variable, falling back to the file value then the default
fn setting<T: FromStr>(key: &str, file: Option<T>, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparsable setting");
            file.unwrap_or(default)
        }),
        Err(_) => file.unwrap_or(default),
    }
}

/// Read an optional string setting, environment first
fn optional(key: &str, file: Option<String>) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or(file)
}

impl Config {
    /// Load configuration from `conso.toml` (if present) and the environment
    ///
    /// # Errors
    ///
    /// Returns error if the configuration file exists but cannot be parsed
    pub fn from_env() -> Result<Self> {
        let file = match Self::config_path() {
            Some(path) if path.exists() => Self::load_file(&path)?,
            _ => FileConfig::default(),
        };

        let data_dir = std::env::var("CONSO_DATA_DIR")
            .map(PathBuf::from)
            .ok()
            .or(file.data_dir)
            .unwrap_or_else(default_data_dir);

        let port = std::env::var("CONSO_API_PORT")
            .or_else(|_| std::env::var("PORT"))
            .ok()
            .and_then(|s| s.parse().ok())
            .or(file.port)
            .unwrap_or(18800);

        let api_server = ApiServerConfig {
            port,
            admin_key: optional("CONSO_ADMIN_KEY", None),
        };

        let cache = CacheConfig {
            ttl_secs: setting("CONSO_CACHE_TTL_SECS", file.cache_ttl_secs, 86_400),
            sweep_interval_secs: setting("CONSO_CACHE_SWEEP_SECS", file.cache_sweep_secs, 3_600),
        };

        let rate_limit = RateLimitConfig {
            per_second: setting("CONSO_RATE_LIMIT_PER_SECOND", file.rate_limit_per_second, 5),
            burst: setting("CONSO_RATE_LIMIT_BURST", file.rate_limit_burst, 1),
            acquire_timeout_secs: setting(
                "CONSO_RATE_LIMIT_TIMEOUT_SECS",
                file.rate_limit_timeout_secs,
                30,
            ),
        };

        let quota = QuotaConfig {
            uncached_per_day: setting("CONSO_QUOTA_UNCACHED", file.quota_uncached, 50),
            cached_per_day: setting("CONSO_QUOTA_CACHED", file.quota_cached, 1000),
            reset_offset_hours: setting(
                "CONSO_QUOTA_RESET_OFFSET_HOURS",
                file.quota_reset_offset_hours,
                0,
            ),
        };

        let tokens = TokenConfig {
            refresh_margin_secs: setting(
                "CONSO_TOKEN_REFRESH_MARGIN_SECS",
                file.token_refresh_margin_secs,
                120,
            ),
            consent_expiring_days: setting(
                "CONSO_CONSENT_EXPIRING_DAYS",
                file.consent_expiring_days,
                7,
            ),
        };

        let upstream = UpstreamConfig {
            base_url: optional("CONSO_UPSTREAM_URL", file.upstream_url),
            token_url: optional("CONSO_TOKEN_URL", file.token_url),
            revoke_url: optional("CONSO_REVOKE_URL", file.revoke_url),
            client_id: optional("CONSO_CLIENT_ID", file.client_id),
            // Secrets are only read from the environment
            client_secret: optional("CONSO_CLIENT_SECRET", None).map(|s| SecretString::new(s.into())),
            timeout_secs: setting("CONSO_UPSTREAM_TIMEOUT_SECS", file.upstream_timeout_secs, 30),
            retry_max: setting("CONSO_RETRY_MAX", file.retry_max, 3),
            retry_base_ms: setting("CONSO_RETRY_BASE_MS", file.retry_base_ms, 500),
            batch_days: setting("CONSO_BATCH_DAYS", file.batch_days, 1),
            max_range_days: setting("CONSO_MAX_RANGE_DAYS", file.max_range_days, 366),
        };

        let config = Self {
            data_dir,
            api_server,
            cache,
            rate_limit,
            quota,
            tokens,
            upstream,
        };
        config.validate()?;

        Ok(config)
    }

    /// Reject settings the gateway cannot run with
    ///
    /// # Errors
    ///
    /// Returns error describing the first invalid setting
    pub fn validate(&self) -> Result<()> {
        if self.rate_limit.per_second == 0 {
            return Err(Error::Config(
                "CONSO_RATE_LIMIT_PER_SECOND must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.burst == 0 {
            return Err(Error::Config(
                "CONSO_RATE_LIMIT_BURST must be at least 1".to_string(),
            ));
        }
        if self.upstream.batch_days == 0 {
            return Err(Error::Config("CONSO_BATCH_DAYS must be at least 1".to_string()));
        }
        if !(-23..=23).contains(&self.quota.reset_offset_hours) {
            return Err(Error::Config(format!(
                "CONSO_QUOTA_RESET_OFFSET_HOURS out of range: {}",
                self.quota.reset_offset_hours
            )));
        }
        Ok(())
    }

    /// Path of the SQLite database inside the data directory
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("conso.db")
    }

    /// Location of the optional TOML configuration file
    fn config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("CONSO_CONFIG") {
            return Some(PathBuf::from(path));
        }
        directories::ProjectDirs::from("dev", "conso", "conso")
            .map(|d| d.config_dir().join("conso.toml"))
    }

    fn load_file(path: &Path) -> Result<FileConfig> {
        let content = std::fs::read_to_string(path)?;
        let file: FileConfig = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), "loaded configuration file");
        Ok(file)
    }
}

/// Return the XDG data directory (`~/.local/share/conso` on Linux)
fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("dev", "conso", "conso")
        .map_or_else(|| PathBuf::from("."), |d| d.data_dir().to_path_buf())
}
