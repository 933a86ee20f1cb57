//! Conso Gateway - metering data adapter for a quota-limited utility API
//!
//! Internal consumers ask for "metric X of meter M between dates A and B";
//! the gateway answers from an encrypted per-day cache where it can and
//! otherwise fetches from the upstream metering API, under one global
//! outbound rate limit, per-caller daily quotas and per-owner OAuth consent.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              REST handlers / schedulers             │
//! └────────────────────┬────────────────────────────────┘
//!                      │ fetch_range / invalidate
//! ┌────────────────────▼────────────────────────────────┐
//! │                 Metering Adapter                    │
//! │  Quota  │  Cache Store  │  Rate Limiter  │  Tokens  │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │        Upstream metering API  +  OAuth server       │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod adapter;
pub mod api;
pub mod cache;
pub mod caller;
pub mod config;
pub mod daemon;
pub mod db;
pub mod error;
pub mod metric;
pub mod quota;
pub mod rate_limit;
pub mod tokens;
pub mod upstream;

pub use adapter::{DayFailure, DaySeries, DaySource, MeteringAdapter, TimeSeries};
pub use caller::{Caller, CallerRegistry};
pub use config::Config;
pub use daemon::Daemon;
pub use db::{DbConn, DbPool};
pub use error::{Error, Result};
pub use metric::{MetricType, Reading};
pub use quota::{QuotaKind, QuotaTracker};
pub use rate_limit::{OutboundLimiter, SharedLimiter};
pub use tokens::{ConsentStatus, MeteringToken, TokenStore, TokenType};
