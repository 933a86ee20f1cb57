//! OAuth token lifecycle per subscriber or meter
//!
//! The store hands out bearer tokens that stay valid for at least the
//! configured safety margin, refreshing them when needed. Refreshes are
//! single-flight per owner: concurrent callers share one in-flight refresh
//! instead of each hitting the authorization server.

mod oauth;
mod repo;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};

pub use oauth::{AuthError, AuthorizationServer, OAuthClient};
pub use repo::TokenRepo;

use crate::config::TokenConfig;
use crate::db::DbPool;
use crate::{Error, Result};

/// Pause before the single retry of a transient refresh failure
const REFRESH_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Who a token was granted for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    /// Covers every meter linked to the subscriber
    Subscriber,
    /// Covers a single meter
    Meter,
}

impl TokenType {
    /// Stored representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Subscriber => "subscriber",
            Self::Meter => "meter",
        }
    }
}

impl FromStr for TokenType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "subscriber" => Ok(Self::Subscriber),
            "meter" => Ok(Self::Meter),
            other => Err(Error::Database(format!("unknown token type: {other}"))),
        }
    }
}

/// State of the data owner's consent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentStatus {
    Active,
    /// Still usable, but the consent ends soon
    Expiring,
    Revoked,
}

impl ConsentStatus {
    /// Stored representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expiring => "expiring",
            Self::Revoked => "revoked",
        }
    }
}

impl FromStr for ConsentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "expiring" => Ok(Self::Expiring),
            "revoked" => Ok(Self::Revoked),
            other => Err(Error::Database(format!("unknown consent status: {other}"))),
        }
    }
}

impl fmt::Display for ConsentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored OAuth grant
#[derive(Clone)]
pub struct MeteringToken {
    pub id: String,
    pub owner_id: String,
    pub token_type: TokenType,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub scopes: BTreeSet<String>,
    pub consent_status: ConsentStatus,
    pub consent_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Debug for MeteringToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeteringToken")
            .field("id", &self.id)
            .field("owner_id", &self.owner_id)
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .field("consent_status", &self.consent_status)
            .field("consent_expires_at", &self.consent_expires_at)
            .finish_non_exhaustive()
    }
}

impl MeteringToken {
    /// Whether the access token outlives `now + margin`
    #[must_use]
    pub fn is_fresh(&self, margin: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.expires_at > now + margin
    }

    /// Bearer value for the `Authorization` header
    #[must_use]
    pub fn bearer(&self) -> &str {
        &self.access_token
    }
}

/// Tokens returned by an authorization-code exchange or a refresh
#[derive(Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime of the access token in seconds
    pub expires_in: i64,
    #[serde(default)]
    pub scopes: BTreeSet<String>,
    /// End of the data owner's consent, when known
    #[serde(default)]
    pub consent_expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("expires_in", &self.expires_in)
            .field("scopes", &self.scopes)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .finish_non_exhaustive()
    }
}

/// Outcome of a refresh shared between single-flight waiters
#[derive(Debug, Clone)]
enum RefreshFailure {
    ConsentRevoked,
    NoConsent,
    Failed(String),
}

type RefreshResult = std::result::Result<MeteringToken, RefreshFailure>;
type InFlight = Arc<Mutex<HashMap<String, Shared<BoxFuture<'static, RefreshResult>>>>>;

/// Token store with single-flight refresh
#[derive(Clone)]
pub struct TokenStore {
    repo: TokenRepo,
    auth: Arc<dyn AuthorizationServer>,
    margin: chrono::Duration,
    expiring_window: chrono::Duration,
    in_flight: InFlight,
}

impl TokenStore {
    /// Create a token store refreshing through `auth`
    #[must_use]
    pub fn new(pool: DbPool, auth: Arc<dyn AuthorizationServer>, config: &TokenConfig) -> Self {
        Self {
            repo: TokenRepo::new(pool),
            auth,
            margin: chrono::Duration::seconds(config.refresh_margin_secs),
            expiring_window: chrono::Duration::days(config.consent_expiring_days),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Underlying repository
    #[must_use]
    pub const fn repo(&self) -> &TokenRepo {
        &self.repo
    }

    /// Return a token valid for at least the safety margin, refreshing if needed
    ///
    /// # Errors
    ///
    /// Returns `NoConsent` if the owner never granted access and
    /// `ConsentRevoked` if consent was withdrawn or refreshing kept failing
    pub async fn get_valid_token(&self, owner: &str) -> Result<MeteringToken> {
        let token = self.live_token(owner)?;
        if token.is_fresh(self.margin, Utc::now()) {
            return Ok(token);
        }

        tracing::debug!(owner, expires_at = %token.expires_at, "access token needs refresh");
        match self.refresh(owner).await {
            Err(Error::RefreshFailed { owner, reason }) => {
                tracing::warn!(%owner, %reason, "refresh kept failing, treating consent as revoked");
                Err(Error::ConsentRevoked(owner))
            }
            other => other,
        }
    }

    /// Refresh the owner's access token
    ///
    /// Concurrent calls for the same owner wait on a single refresh.
    ///
    /// # Errors
    ///
    /// Returns `RefreshFailed` after a failed retry, `ConsentRevoked` when
    /// the authorization server reports the grant as revoked
    pub async fn refresh(&self, owner: &str) -> Result<MeteringToken> {
        let flight = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = in_flight.get(owner) {
                tracing::debug!(owner, "joining in-flight refresh");
                existing.clone()
            } else {
                let flight = self.start_refresh(owner);
                in_flight.insert(owner.to_string(), flight.clone());
                flight
            }
        };

        flight.await.map_err(|failure| match failure {
            RefreshFailure::ConsentRevoked => Error::ConsentRevoked(owner.to_string()),
            RefreshFailure::NoConsent => Error::NoConsent(owner.to_string()),
            RefreshFailure::Failed(reason) => Error::RefreshFailed {
                owner: owner.to_string(),
                reason,
            },
        })
    }

    /// Spawn the refresh so it completes even if every waiter goes away
    fn start_refresh(&self, owner: &str) -> Shared<BoxFuture<'static, RefreshResult>> {
        let repo = self.repo.clone();
        let auth = self.auth.clone();
        let in_flight = self.in_flight.clone();
        let margin = self.margin;
        let owner = owner.to_string();

        let handle = tokio::spawn(async move {
            let result = perform_refresh(&repo, auth.as_ref(), &owner, margin).await;
            in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&owner);
            result
        });

        async move {
            handle
                .await
                .unwrap_or_else(|e| Err(RefreshFailure::Failed(format!("refresh task failed: {e}"))))
        }
        .boxed()
        .shared()
    }

    /// Force the next `get_valid_token` to refresh, e.g. after the upstream
    /// refused the access token
    ///
    /// # Errors
    ///
    /// Returns error if the database write fails
    pub fn mark_stale(&self, owner: &str) -> Result<()> {
        self.repo.expire_live(owner)?;
        tracing::debug!(owner, "access token marked stale");
        Ok(())
    }

    /// Record a token obtained from an authorization-code exchange
    ///
    /// Any previous live token of the owner is revoked.
    ///
    /// # Errors
    ///
    /// Returns error if the database write fails
    pub fn grant(&self, owner: &str, token_type: TokenType, grant: &TokenGrant) -> Result<MeteringToken> {
        let token = self.repo.insert_grant(owner, token_type, grant)?;
        tracing::info!(owner, token_type = token_type.as_str(), "consent granted");
        Ok(token)
    }

    /// Withdraw consent: mark live tokens revoked and notify the authorization server
    ///
    /// # Errors
    ///
    /// Returns error if the database write fails; revocation at the
    /// authorization server is best effort
    pub async fn revoke(&self, owner: &str) -> Result<usize> {
        let revoked = self.repo.revoke_owner(owner)?;

        for token in &revoked {
            let value = token.refresh_token.as_deref().unwrap_or(&token.access_token);
            if let Err(e) = self.auth.revoke(value).await {
                tracing::warn!(owner, error = %e, "upstream token revocation failed");
            }
        }

        tracing::info!(owner, count = revoked.len(), "consent revoked");
        Ok(revoked.len())
    }

    /// Delete every token and meter link of an owner (account deletion)
    ///
    /// # Errors
    ///
    /// Returns error if the database write fails
    pub fn forget(&self, owner: &str) -> Result<usize> {
        let removed = self.repo.delete_owner(owner)?;
        tracing::info!(owner, removed, "owner tokens deleted");
        Ok(removed)
    }

    /// Read a meter's data with its subscriber's consent
    ///
    /// # Errors
    ///
    /// Returns error if the database write fails
    pub fn link_meter(&self, meter: &str, subscriber: &str) -> Result<()> {
        self.repo.link_meter(meter, subscriber)
    }

    /// Owner whose token covers `meter`: the meter itself, else its subscriber
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be queried
    pub fn owner_for_meter(&self, meter: &str) -> Result<String> {
        if self.repo.has_any(meter)? {
            return Ok(meter.to_string());
        }
        Ok(self
            .repo
            .subscriber_for(meter)?
            .unwrap_or_else(|| meter.to_string()))
    }

    /// Current consent status, `None` if the owner never consented
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be queried
    pub fn consent_status(&self, owner: &str) -> Result<Option<ConsentStatus>> {
        if let Some(token) = self.repo.find_live(owner)? {
            return Ok(Some(self.refresh_status(&token)?));
        }
        if self.repo.has_revoked(owner)? {
            return Ok(Some(ConsentStatus::Revoked));
        }
        Ok(None)
    }

    /// Fail unless the owner still holds a live consent
    ///
    /// # Errors
    ///
    /// Returns `ConsentRevoked` or `NoConsent`
    pub fn ensure_active(&self, owner: &str) -> Result<()> {
        self.live_token(owner).map(|_| ())
    }

    fn live_token(&self, owner: &str) -> Result<MeteringToken> {
        match self.repo.find_live(owner)? {
            Some(token) => {
                self.refresh_status(&token)?;
                Ok(token)
            }
            None if self.repo.has_revoked(owner)? => Err(Error::ConsentRevoked(owner.to_string())),
            None => Err(Error::NoConsent(owner.to_string())),
        }
    }

    /// Recompute `Active` or `Expiring` from the consent end date
    ///
    /// A refresh can push the end date back out of the warning window, so the
    /// status moves both ways. Revoked stays revoked.
    fn refresh_status(&self, token: &MeteringToken) -> Result<ConsentStatus> {
        if token.consent_status == ConsentStatus::Revoked {
            return Ok(ConsentStatus::Revoked);
        }

        let expiring = token
            .consent_expires_at
            .is_some_and(|end| end <= Utc::now() + self.expiring_window);
        let status = if expiring {
            ConsentStatus::Expiring
        } else {
            ConsentStatus::Active
        };

        if status != token.consent_status {
            self.repo.set_status(&token.id, status)?;
            match status {
                ConsentStatus::Expiring => tracing::info!(owner = %token.owner_id, "consent expiring soon"),
                _ => tracing::info!(owner = %token.owner_id, "consent extended"),
            }
        }
        Ok(status)
    }
}

/// Refresh body run once per owner at a time
async fn perform_refresh(
    repo: &TokenRepo,
    auth: &dyn AuthorizationServer,
    owner: &str,
    margin: chrono::Duration,
) -> RefreshResult {
    let lookup = |r: &TokenRepo| -> RefreshResult {
        match r.find_live(owner) {
            Ok(Some(token)) => Ok(token),
            Ok(None) => match r.has_revoked(owner) {
                Ok(true) => Err(RefreshFailure::ConsentRevoked),
                Ok(false) => Err(RefreshFailure::NoConsent),
                Err(e) => Err(RefreshFailure::Failed(e.to_string())),
            },
            Err(e) => Err(RefreshFailure::Failed(e.to_string())),
        }
    };

    let token = lookup(repo)?;

    // Another flight may have finished between the caller's read and ours
    if token.is_fresh(margin, Utc::now()) {
        return Ok(token);
    }

    let Some(refresh_token) = token.refresh_token.clone() else {
        return Err(RefreshFailure::Failed("no refresh token stored".to_string()));
    };

    let mut last_error = String::new();
    for attempt in 0..2 {
        match auth.refresh(&refresh_token).await {
            Ok(grant) => {
                return repo
                    .apply_refresh(&token.id, &grant)
                    .inspect(|_| tracing::info!(owner, attempt, "access token refreshed"))
                    .map_err(|e| RefreshFailure::Failed(e.to_string()));
            }
            Err(AuthError::InvalidGrant(reason)) => {
                tracing::warn!(owner, %reason, "refresh grant rejected, revoking consent");
                if let Err(e) = repo.revoke_owner(owner) {
                    tracing::error!(owner, error = %e, "failed to persist consent revocation");
                }
                return Err(RefreshFailure::ConsentRevoked);
            }
            Err(AuthError::Rejected(reason)) => {
                tracing::error!(owner, %reason, "refresh rejected by authorization server");
                return Err(RefreshFailure::Failed(reason));
            }
            Err(AuthError::Transient(reason)) => {
                tracing::warn!(owner, attempt, %reason, "transient refresh failure");
                last_error = reason;
                if attempt == 0 {
                    tokio::time::sleep(REFRESH_RETRY_DELAY).await;
                }
            }
        }
    }

    Err(RefreshFailure::Failed(last_error))
}
