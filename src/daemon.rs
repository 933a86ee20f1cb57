//! Gateway process: wires the stores together and runs the HTTP server

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::adapter::MeteringAdapter;
use crate::api::{ApiServer, ApiServerBuilder};
use crate::cache::CacheStore;
use crate::db::{self, DbPool};
use crate::quota::QuotaTracker;
use crate::rate_limit::OutboundLimiter;
use crate::tokens::{AuthorizationServer, OAuthClient, TokenStore};
use crate::upstream::{HttpMeteringApi, MeteringApi};
use crate::{Config, Result};

/// Days of quota history kept for support queries
const QUOTA_HISTORY_DAYS: i64 = 7;

/// Main gateway daemon
pub struct Daemon {
    config: Config,
    db: DbPool,
    adapter: MeteringAdapter,
}

impl Daemon {
    /// Open the database and build the HTTP clients from configuration
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be opened or the upstream
    /// endpoints and credentials are missing
    pub fn new(config: Config) -> Result<Self> {
        let db = db::init(config.database_path())?;
        let auth: Arc<dyn AuthorizationServer> = Arc::new(OAuthClient::from_config(&config.upstream)?);
        let api: Arc<dyn MeteringApi> = Arc::new(HttpMeteringApi::from_config(&config.upstream)?);
        Self::with_components(config, db, auth, api)
    }

    /// Build the daemon around explicit collaborators
    ///
    /// # Errors
    ///
    /// Returns error if the rate limit or quota settings are invalid
    pub fn with_components(
        config: Config,
        db: DbPool,
        auth: Arc<dyn AuthorizationServer>,
        api: Arc<dyn MeteringApi>,
    ) -> Result<Self> {
        let adapter = build_adapter(&config, db.clone(), auth, api)?;
        Ok(Self { config, db, adapter })
    }

    #[must_use]
    pub const fn adapter(&self) -> &MeteringAdapter {
        &self.adapter
    }

    fn api_server(&self) -> ApiServer {
        ApiServerBuilder::new(self.db.clone(), self.adapter.clone())
            .admin_key(self.config.api_server.admin_key.clone())
            .build()
    }

    /// Run until Ctrl-C
    ///
    /// # Errors
    ///
    /// Returns error if the server fails to bind or run
    pub async fn run(self) -> Result<()> {
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                stop_tx.send_replace(true);
            }
        });

        let addr = format!("0.0.0.0:{}", self.config.api_server.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server: {e}")))?;

        self.serve(listener, stop_rx).await
    }

    /// Serve on `listener` until `stop` flips to true
    ///
    /// # Errors
    ///
    /// Returns error if the server fails
    pub async fn serve(self, listener: TcpListener, stop: watch::Receiver<bool>) -> Result<()> {
        tracing::info!(
            port = self.config.api_server.port,
            per_second = self.config.rate_limit.per_second,
            cache_ttl_secs = self.config.cache.ttl_secs,
            "starting conso gateway"
        );

        let sweeper = (self.config.cache.sweep_interval_secs > 0).then(|| {
            spawn_maintenance(
                self.adapter.clone(),
                Duration::from_secs(self.config.cache.sweep_interval_secs),
                stop.clone(),
            )
        });

        let mut server_stop = stop;
        let shutdown = async move {
            let _ = server_stop.wait_for(|stopped| *stopped).await;
        };

        let result = self.api_server().serve(listener, shutdown).await;

        // Fail waiters still queued for an outbound slot
        self.adapter.limiter().shutdown();
        if let Some(sweeper) = sweeper {
            if let Err(e) = sweeper.await {
                tracing::warn!(error = %e, "maintenance task failed");
            }
        }

        tracing::info!("gateway stopped");
        result
    }
}

/// Purge expired cache entries and old quota counters every `interval`
///
/// The first pass runs immediately. Stops once `shutdown` flips to true.
#[must_use]
pub fn spawn_maintenance(
    adapter: MeteringAdapter,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = adapter.cache().purge_expired() {
                        tracing::warn!(error = %e, "cache sweep failed");
                    }

                    let quota = adapter.quota();
                    let cutoff = quota.today() - chrono::Duration::days(QUOTA_HISTORY_DAYS);
                    if let Err(e) = quota.prune_before(cutoff) {
                        tracing::warn!(error = %e, "failed to prune quota counters");
                    }
                }
                _ = shutdown.wait_for(|stopped| *stopped) => break,
            }
        }

        tracing::debug!("maintenance task stopped");
    })
}

/// Compose the adapter from configuration and collaborators
///
/// # Errors
///
/// Returns error if the rate limit or quota settings are invalid
pub fn build_adapter(
    config: &Config,
    db: DbPool,
    auth: Arc<dyn AuthorizationServer>,
    api: Arc<dyn MeteringApi>,
) -> Result<MeteringAdapter> {
    let limiter = OutboundLimiter::shared(&config.rate_limit)?;
    let cache = CacheStore::new(db.clone(), Duration::from_secs(config.cache.ttl_secs));
    let quota = QuotaTracker::new(db.clone(), &config.quota)?;
    let tokens = TokenStore::new(db, auth, &config.tokens);

    Ok(MeteringAdapter::new(cache, quota, tokens, limiter, api).with_upstream_config(&config.upstream))
}
