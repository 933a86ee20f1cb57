use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use tracing_subscriber::EnvFilter;

use conso_gateway::cache::CacheStore;
use conso_gateway::db;
use conso_gateway::tokens::{AuthError, AuthorizationServer, OAuthClient, TokenGrant, TokenStore};
use conso_gateway::{CallerRegistry, Config, Daemon, MetricType, QuotaTracker};

/// Conso - metering data gateway
#[derive(Parser)]
#[command(name = "conso", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP gateway (default)
    Serve {
        /// Port to listen on
        #[arg(long, env = "CONSO_API_PORT")]
        port: Option<u16>,
    },
    /// Drop one cached day
    Invalidate {
        #[arg(long)]
        meter: String,
        /// Metric name, e.g. `daily_consumption`
        #[arg(long)]
        metric: String,
        /// Day as YYYY-MM-DD
        #[arg(long)]
        date: NaiveDate,
    },
    /// Delete expired cache entries
    PurgeCache,
    /// Withdraw an owner's consent
    Revoke {
        #[arg(long)]
        owner: String,
    },
    /// Show today's quota usage for a caller
    Quota {
        /// Registered caller id
        #[arg(long)]
        caller: String,
    },
    /// Register a caller (or rotate its secret) and print the new secret
    AddCaller {
        #[arg(long)]
        id: String,
    },
    /// Unregister a caller
    RemoveCaller {
        #[arg(long)]
        id: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,conso_gateway=info",
        1 => "info,conso_gateway=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::from_env()?;

    match cli.command.unwrap_or(Command::Serve { port: None }) {
        Command::Serve { port } => {
            if let Some(port) = port {
                config.api_server.port = port;
            }
            Daemon::new(config)?.run().await?;
        }
        Command::Invalidate { meter, metric, date } => {
            let metric: MetricType = metric.parse()?;
            let cache = open_cache(&config)?;
            let removed = cache.invalidate(&meter, date, metric)?;
            println!("{}", if removed { "removed" } else { "not cached" });
        }
        Command::PurgeCache => {
            let removed = open_cache(&config)?.purge_expired()?;
            println!("purged {removed} expired entries");
        }
        Command::Revoke { owner } => {
            let pool = db::init(config.database_path())?;
            let auth: Arc<dyn AuthorizationServer> = match OAuthClient::from_config(&config.upstream) {
                Ok(client) => Arc::new(client),
                Err(e) => {
                    tracing::warn!(error = %e, "OAuth client not configured, revoking locally only");
                    Arc::new(Offline)
                }
            };
            let revoked = TokenStore::new(pool, auth, &config.tokens).revoke(&owner).await?;
            println!("revoked {revoked} token(s) for {owner}");
        }
        Command::Quota { caller } => {
            let pool = db::init(config.database_path())?;
            let usage = QuotaTracker::new(pool, &config.quota)?.usage(&caller)?;
            println!("{}", serde_json::to_string_pretty(&usage)?);
        }
        Command::AddCaller { id } => {
            let registry = CallerRegistry::new(db::init(config.database_path())?);
            let secret = registry.issue(&id)?;
            println!("{}", secret.expose_secret());
        }
        Command::RemoveCaller { id } => {
            let registry = CallerRegistry::new(db::init(config.database_path())?);
            let removed = registry.remove(&id)?;
            println!("{}", if removed { "removed" } else { "not registered" });
        }
    }

    Ok(())
}

fn open_cache(config: &Config) -> anyhow::Result<CacheStore> {
    let pool = db::init(config.database_path())?;
    Ok(CacheStore::new(pool, Duration::from_secs(config.cache.ttl_secs)))
}

/// Authorization server stand-in for maintenance commands without OAuth credentials
struct Offline;

#[async_trait]
impl AuthorizationServer for Offline {
    async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant, AuthError> {
        Err(AuthError::Rejected("no OAuth client configured".to_string()))
    }
}
