//! Shared test utilities

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::NaiveDate;
use conso_gateway::config::Config;
use conso_gateway::daemon::build_adapter;
use conso_gateway::tokens::{AuthError, AuthorizationServer, TokenGrant, TokenType};
use conso_gateway::upstream::{MeteringApi, UpstreamError};
use conso_gateway::{Caller, CallerRegistry, DbPool, MeteringAdapter, MetricType, Reading, db};
use secrecy::SecretString;

/// Set up an in-memory test database
#[must_use]
pub fn setup_test_db() -> DbPool {
    db::init_memory().expect("failed to init test db")
}

pub fn day(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("invalid test date")
}

/// Caller named after its secret
pub fn caller(secret: &str) -> Caller {
    Caller::new(secret, &SecretString::new(secret.into()))
}

pub fn grant(access: &str, expires_in: i64) -> TokenGrant {
    TokenGrant {
        access_token: access.to_string(),
        refresh_token: Some(format!("{access}-refresh")),
        expires_in,
        scopes: BTreeSet::from(["metering".to_string()]),
        consent_expires_at: None,
    }
}

/// Configuration with fast retries and a generous rate limit
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.rate_limit.per_second = 1000;
    config.rate_limit.acquire_timeout_secs = 10;
    config.upstream.retry_max = 2;
    config.upstream.retry_base_ms = 1;
    config
}

/// Authorization server that always succeeds and counts refreshes
#[derive(Default)]
pub struct FakeAuth {
    refreshes: AtomicUsize,
    pub delay: Duration,
}

impl FakeAuth {
    /// Authorization server whose refreshes take `delay`
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthorizationServer for FakeAuth {
    async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant, AuthError> {
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(grant(&format!("refreshed-{n}"), 3600))
    }
}

/// One recorded upstream call
#[derive(Debug, Clone)]
pub struct Call {
    pub bearer: String,
    pub meter: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub at: Instant,
}

type Hook = Box<dyn FnMut(usize) + Send>;

/// Metering API returning one reading per day, with scripted failures
#[derive(Default)]
pub struct FakeMeteringApi {
    calls: Mutex<Vec<Call>>,
    failing: Mutex<HashMap<NaiveDate, (UpstreamError, usize)>>,
    on_call: Mutex<Option<Hook>>,
    pub delay: Duration,
}

impl FakeMeteringApi {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Fail every call covering `date` with `err`, `times` times
    pub fn fail(&self, date: NaiveDate, err: UpstreamError, times: usize) {
        self.failing.lock().unwrap().insert(date, (err, times));
    }

    /// Run `hook` with the call index before each call is answered
    pub fn on_call(&self, hook: impl FnMut(usize) + Send + 'static) {
        *self.on_call.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl MeteringApi for FakeMeteringApi {
    async fn fetch(
        &self,
        bearer: &str,
        meter: &str,
        _metric: MetricType,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Reading>, UpstreamError> {
        let index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Call {
                bearer: bearer.to_string(),
                meter: meter.to_string(),
                start,
                end,
                at: Instant::now(),
            });
            calls.len() - 1
        };

        if let Some(hook) = self.on_call.lock().unwrap().as_mut() {
            hook(index);
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let days: Vec<NaiveDate> = start.iter_days().take_while(|d| *d < end).collect();

        {
            let mut failing = self.failing.lock().unwrap();
            for d in &days {
                if let Some((err, remaining)) = failing.get_mut(d) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(err.clone());
                    }
                }
            }
        }

        Ok(days
            .into_iter()
            .map(|d| Reading {
                date: d.format("%Y-%m-%d").to_string(),
                value: "1000".to_string(),
            })
            .collect())
    }
}

/// Adapter wired to fakes over an in-memory database
pub struct TestGateway {
    pub db: DbPool,
    pub adapter: MeteringAdapter,
    pub api: Arc<FakeMeteringApi>,
    pub auth: Arc<FakeAuth>,
}

impl TestGateway {
    pub fn new() -> Self {
        Self::with(test_config(), FakeMeteringApi::default(), FakeAuth::default())
    }

    pub fn with(config: Config, api: FakeMeteringApi, auth: FakeAuth) -> Self {
        let db = setup_test_db();
        let api = Arc::new(api);
        let auth = Arc::new(auth);
        let adapter = build_adapter(&config, db.clone(), auth.clone(), api.clone())
            .expect("failed to build adapter");

        Self {
            db,
            adapter,
            api,
            auth,
        }
    }

    /// Record a live consent for `owner`
    pub fn consent(&self, owner: &str, token_type: TokenType, expires_in: i64) {
        self.adapter
            .tokens()
            .grant(owner, token_type, &grant("initial", expires_in))
            .expect("failed to grant consent");
    }

    /// Register a caller that authenticates with `secret`
    pub fn register_caller(&self, id: &str, secret: &str) {
        CallerRegistry::new(self.db.clone())
            .register(id, &SecretString::new(secret.into()))
            .expect("failed to register caller");
    }
}
