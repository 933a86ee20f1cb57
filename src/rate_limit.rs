//! Global ceiling on outbound calls to the metering API
//!
//! The limit is imposed by the upstream provider, so a single bucket is
//! shared by every caller and every feature issuing upstream traffic.
//! Waiters are admitted in arrival order: a fair `tokio` mutex queues them
//! in front of the GCRA bucket.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{Quota, RateLimiter, clock::DefaultClock, state::InMemoryState, state::NotKeyed};
use tokio::sync::{Mutex, watch};

use crate::config::RateLimitConfig;
use crate::{Error, Result};

/// Direct (unkeyed) governor bucket
type Bucket = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Shared handle to the outbound limiter
pub type SharedLimiter = Arc<OutboundLimiter>;

/// FIFO token bucket guarding every outbound metering call
pub struct OutboundLimiter {
    bucket: Bucket,
    /// Admission queue; `tokio::sync::Mutex` grants the lock in FIFO order
    queue: Mutex<()>,
    shutdown: watch::Sender<bool>,
    timeout: Duration,
    burst: NonZeroU32,
}

impl std::fmt::Debug for OutboundLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundLimiter")
            .field("burst", &self.burst)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl OutboundLimiter {
    /// Create a limiter allowing `per_second` calls with a bucket of `burst`
    ///
    /// # Errors
    ///
    /// Returns error if the rate or the burst is zero
    pub fn new(config: &RateLimitConfig) -> Result<Self> {
        let per_second = NonZeroU32::new(config.per_second)
            .ok_or_else(|| Error::Config("rate limit must be at least 1/s".to_string()))?;
        let burst = NonZeroU32::new(config.burst)
            .ok_or_else(|| Error::Config("rate limit burst must be at least 1".to_string()))?;

        let quota = Quota::per_second(per_second).allow_burst(burst);
        let (shutdown, _) = watch::channel(false);

        tracing::debug!(
            per_second = config.per_second,
            burst = config.burst,
            "outbound rate limiter created"
        );

        Ok(Self {
            bucket: RateLimiter::direct(quota),
            queue: Mutex::new(()),
            shutdown,
            timeout: config.acquire_timeout(),
            burst,
        })
    }

    /// Create a shared limiter
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn shared(config: &RateLimitConfig) -> Result<SharedLimiter> {
        Self::new(config).map(Arc::new)
    }

    /// Wait until `n` outbound slots are available and consume them
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` on shutdown or when the wait exceeds the configured
    /// timeout, and `Config` if `n` can never fit in the bucket
    pub async fn acquire(&self, n: u32) -> Result<()> {
        let Some(n) = NonZeroU32::new(n) else {
            return Ok(());
        };
        if n > self.burst {
            return Err(Error::Config(format!(
                "cannot acquire {n} slots from a bucket of {}",
                self.burst
            )));
        }

        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Err(Error::Cancelled("rate limiter shut down".to_string()));
        }

        let admitted = async {
            let _turn = self.queue.lock().await;
            self.bucket.until_n_ready(n).await
        };

        tokio::select! {
            res = tokio::time::timeout(self.timeout, admitted) => match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(Error::Config(format!("rate limiter capacity: {e}"))),
                Err(_) => {
                    tracing::warn!(timeout = ?self.timeout, "timed out waiting for outbound slot");
                    Err(Error::Cancelled("timed out waiting for outbound slot".to_string()))
                }
            },
            _ = shutdown.wait_for(|stopped| *stopped) => {
                Err(Error::Cancelled("rate limiter shut down".to_string()))
            }
        }
    }

    /// Fail every current and future `acquire`
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        tracing::info!("outbound rate limiter shut down");
    }
}
