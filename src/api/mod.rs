//! HTTP API server for the conso gateway

pub mod admin;
mod auth;
pub mod error;
pub mod health;
pub mod metering;

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

pub use auth::AuthenticatedCaller;

use crate::adapter::MeteringAdapter;
use crate::caller::CallerRegistry;
use crate::db::DbPool;
use crate::Result;

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub db: DbPool,
    pub admin_key: Option<String>,
    pub adapter: MeteringAdapter,
    pub callers: CallerRegistry,
}

/// Configuration for building an API server
pub struct ApiServerBuilder {
    db: DbPool,
    adapter: MeteringAdapter,
    admin_key: Option<String>,
}

impl ApiServerBuilder {
    /// Create a new API server builder
    #[must_use]
    pub fn new(db: DbPool, adapter: MeteringAdapter) -> Self {
        Self {
            db,
            adapter,
            admin_key: None,
        }
    }

    /// Set the bearer key guarding admin routes
    #[must_use]
    pub fn admin_key(mut self, key: Option<String>) -> Self {
        self.admin_key = key;
        self
    }

    /// Build the API server
    #[must_use]
    pub fn build(self) -> ApiServer {
        if self.admin_key.is_none() {
            tracing::warn!("CONSO_ADMIN_KEY not set - admin API is unauthenticated");
        }

        ApiServer {
            state: Arc::new(ApiState {
                callers: CallerRegistry::new(self.db.clone()),
                db: self.db,
                admin_key: self.admin_key,
                adapter: self.adapter,
            }),
        }
    }
}

/// HTTP API server
pub struct ApiServer {
    state: Arc<ApiState>,
}

impl ApiServer {
    /// Build the router with all routes
    #[must_use]
    pub fn router(&self) -> Router {
        Router::new()
            .nest("/api/admin", admin::router(self.state.clone()))
            .nest("/api", metering::router(self.state.clone()))
            .merge(health::router())
            .merge(health::ready_router(self.state.clone()))
            .layer(TraceLayer::new_for_http())
    }

    /// Serve on an already bound listener
    ///
    /// # Errors
    ///
    /// Returns error if the server fails
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| crate::Error::Config(format!("API server error: {e}")))?;

        tracing::info!("API server stopped");
        Ok(())
    }
}
