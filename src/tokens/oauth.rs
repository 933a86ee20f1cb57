//! Authorization server seam and its OAuth 2.0 HTTP client

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::TokenGrant;
use crate::config::UpstreamConfig;
use crate::{Error, Result};

/// Why the authorization server refused a request
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    /// The refresh token is no longer honored (consent withdrawn)
    #[error("grant no longer valid: {0}")]
    InvalidGrant(String),

    /// Network failure, timeout, 429 or 5xx
    #[error("transient authorization failure: {0}")]
    Transient(String),

    /// Any other refusal, e.g. bad client credentials
    #[error("authorization request rejected: {0}")]
    Rejected(String),
}

/// Issues and revokes metering access tokens
#[async_trait]
pub trait AuthorizationServer: Send + Sync {
    /// Exchange a refresh token for a new access token
    async fn refresh(&self, refresh_token: &str) -> std::result::Result<TokenGrant, AuthError>;

    /// Revoke a token upstream; servers without revocation accept silently
    async fn revoke(&self, _token: &str) -> std::result::Result<(), AuthError> {
        Ok(())
    }
}

/// Token endpoint response
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
    /// Space-separated scopes
    #[serde(default)]
    scope: Option<String>,
}

impl From<TokenResponse> for TokenGrant {
    fn from(response: TokenResponse) -> Self {
        let scopes: BTreeSet<String> = response
            .scope
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect();

        Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            expires_in: response.expires_in,
            scopes,
            consent_expires_at: None,
        }
    }
}

/// OAuth error body
#[derive(Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// OAuth 2.0 client using the refresh-token grant
pub struct OAuthClient {
    http: reqwest::Client,
    token_url: String,
    revoke_url: Option<String>,
    client_id: String,
    client_secret: SecretString,
}

impl OAuthClient {
    /// Create a client for the given endpoints and credentials
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: SecretString,
    ) -> Self {
        Self {
            http,
            token_url: token_url.into(),
            revoke_url: None,
            client_id: client_id.into(),
            client_secret,
        }
    }

    /// Enable upstream revocation (RFC 7009)
    #[must_use]
    pub fn with_revoke_url(mut self, url: impl Into<String>) -> Self {
        self.revoke_url = Some(url.into());
        self
    }

    /// Build a client from the upstream configuration
    ///
    /// # Errors
    ///
    /// Returns `Config` if the token endpoint or client credentials are missing
    pub fn from_config(config: &UpstreamConfig) -> Result<Self> {
        let missing = |name: &str| Error::Config(format!("{name} is required"));

        let token_url = config.token_url.clone().ok_or_else(|| missing("CONSO_TOKEN_URL"))?;
        let client_id = config.client_id.clone().ok_or_else(|| missing("CONSO_CLIENT_ID"))?;
        let client_secret = config
            .client_secret
            .clone()
            .ok_or_else(|| missing("CONSO_CLIENT_SECRET"))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        let client = Self::new(http, token_url, client_id, client_secret);
        Ok(match &config.revoke_url {
            Some(url) => client.with_revoke_url(url.clone()),
            None => client,
        })
    }
}

#[async_trait]
impl AuthorizationServer for OAuthClient {
    async fn refresh(&self, refresh_token: &str) -> std::result::Result<TokenGrant, AuthError> {
        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose_secret()),
            ])
            .send()
            .await
            .map_err(|e| AuthError::Transient(format!("token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify(status, &body));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Transient(format!("token parse error: {e}")))?;

        Ok(token.into())
    }

    async fn revoke(&self, token: &str) -> std::result::Result<(), AuthError> {
        let Some(url) = &self.revoke_url else {
            return Ok(());
        };

        let response = self
            .http
            .post(url)
            .form(&[
                ("token", token),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose_secret()),
            ])
            .send()
            .await
            .map_err(|e| AuthError::Transient(format!("revocation request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(classify(status, &body))
        }
    }
}

/// Map a failed token endpoint response onto [`AuthError`]
fn classify(status: reqwest::StatusCode, body: &str) -> AuthError {
    let parsed: Option<OAuthErrorBody> = serde_json::from_str(body).ok();

    if let Some(err) = &parsed {
        if err.error == "invalid_grant" {
            return AuthError::InvalidGrant(err.error_description.clone().unwrap_or_default());
        }
    }

    let detail = parsed.map_or_else(|| format!("{status}"), |e| format!("{status} {}", e.error));
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        AuthError::Transient(detail)
    } else {
        AuthError::Rejected(detail)
    }
}
