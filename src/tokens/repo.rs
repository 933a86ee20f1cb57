//! Token repository backed by `metering_tokens` and `meter_links`

use std::collections::BTreeSet;

use chrono::{Duration, Utc};
use rusqlite::{OptionalExtension, Row, params};
use uuid::Uuid;

use super::{ConsentStatus, MeteringToken, TokenGrant, TokenType};
use crate::db::{DbPool, parse_datetime};
use crate::{Error, Result};

const TOKEN_COLUMNS: &str = "id, owner_id, token_type, access_token, refresh_token, expires_at, \
     scopes, consent_status, consent_expires_at, created_at, updated_at";

/// Token repository
#[derive(Clone)]
pub struct TokenRepo {
    pool: DbPool,
}

impl TokenRepo {
    /// Create a new token repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Most recent non-revoked token of an owner
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find_live(&self, owner: &str) -> Result<Option<MeteringToken>> {
        let conn = self.pool.get()?;

        let token = conn
            .query_row(
                &format!(
                    "SELECT {TOKEN_COLUMNS} FROM metering_tokens
                     WHERE owner_id = ?1 AND consent_status != 'revoked'
                     ORDER BY updated_at DESC LIMIT 1"
                ),
                [owner],
                row_to_token,
            )
            .optional()?;

        token.transpose()
    }

    /// Whether the owner has a revoked token on record
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn has_revoked(&self, owner: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM metering_tokens
             WHERE owner_id = ?1 AND consent_status = 'revoked')",
            [owner],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Whether any token, live or revoked, exists for the owner
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn has_any(&self, owner: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM metering_tokens WHERE owner_id = ?1)",
            [owner],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Store a fresh grant, revoking the owner's previous live tokens
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn insert_grant(
        &self,
        owner: &str,
        token_type: TokenType,
        grant: &TokenGrant,
    ) -> Result<MeteringToken> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        let now = Utc::now();
        let now_str = now.to_rfc3339();
        let id = Uuid::new_v4().to_string();
        let expires_at = now + Duration::seconds(grant.expires_in);
        let scopes = serde_json::to_string(&grant.scopes)?;

        tx.execute(
            "UPDATE metering_tokens SET consent_status = 'revoked', updated_at = ?2
             WHERE owner_id = ?1 AND consent_status != 'revoked'",
            params![owner, now_str],
        )?;
        tx.execute(
            "INSERT INTO metering_tokens
                (id, owner_id, token_type, access_token, refresh_token, expires_at,
                 scopes, consent_status, consent_expires_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'active', ?8, ?9, ?9)",
            params![
                id,
                owner,
                token_type.as_str(),
                grant.access_token,
                grant.refresh_token,
                expires_at.to_rfc3339(),
                scopes,
                grant.consent_expires_at.map(|t| t.to_rfc3339()),
                now_str,
            ],
        )?;
        tx.commit()?;

        Ok(MeteringToken {
            id,
            owner_id: owner.to_string(),
            token_type,
            access_token: grant.access_token.clone(),
            refresh_token: grant.refresh_token.clone(),
            expires_at,
            scopes: grant.scopes.clone(),
            consent_status: ConsentStatus::Active,
            consent_expires_at: grant.consent_expires_at,
            created_at: now,
            updated_at: now,
        })
    }

    /// Replace the access token after a refresh
    ///
    /// A grant without a refresh token keeps the stored one; empty scopes
    /// keep the stored scopes.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the token was deleted or revoked meanwhile
    pub fn apply_refresh(&self, id: &str, grant: &TokenGrant) -> Result<MeteringToken> {
        let conn = self.pool.get()?;

        let now = Utc::now();
        let expires_at = now + Duration::seconds(grant.expires_in);
        let scopes = if grant.scopes.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&grant.scopes)?)
        };

        let updated = conn.execute(
            "UPDATE metering_tokens
             SET access_token = ?2,
                 refresh_token = COALESCE(?3, refresh_token),
                 expires_at = ?4,
                 scopes = COALESCE(?5, scopes),
                 consent_expires_at = COALESCE(?6, consent_expires_at),
                 updated_at = ?7
             WHERE id = ?1 AND consent_status != 'revoked'",
            params![
                id,
                grant.access_token,
                grant.refresh_token,
                expires_at.to_rfc3339(),
                scopes,
                grant.consent_expires_at.map(|t| t.to_rfc3339()),
                now.to_rfc3339(),
            ],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!("live token {id}")));
        }

        conn.query_row(
            &format!("SELECT {TOKEN_COLUMNS} FROM metering_tokens WHERE id = ?1"),
            [id],
            row_to_token,
        )?
    }

    /// Expire the access token of every live grant of an owner
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn expire_live(&self, owner: &str) -> Result<()> {
        let conn = self.pool.get()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE metering_tokens SET expires_at = ?2, updated_at = ?2
             WHERE owner_id = ?1 AND consent_status != 'revoked'",
            params![owner, now],
        )?;
        Ok(())
    }

    /// Update the consent status of a token
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn set_status(&self, id: &str, status: ConsentStatus) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE metering_tokens SET consent_status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Revoke every live token of an owner, returning them as they were
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn revoke_owner(&self, owner: &str) -> Result<Vec<MeteringToken>> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        let live = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {TOKEN_COLUMNS} FROM metering_tokens
                 WHERE owner_id = ?1 AND consent_status != 'revoked'"
            ))?;
            let rows = stmt.query_map([owner], row_to_token)?;
            let mut live = Vec::new();
            for row in rows {
                live.push(row??);
            }
            live
        };

        tx.execute(
            "UPDATE metering_tokens SET consent_status = 'revoked', updated_at = ?2
             WHERE owner_id = ?1 AND consent_status != 'revoked'",
            params![owner, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;

        Ok(live)
    }

    /// Delete all tokens of an owner and the meter links naming it
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn delete_owner(&self, owner: &str) -> Result<usize> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let tokens = tx.execute("DELETE FROM metering_tokens WHERE owner_id = ?1", [owner])?;
        let links = tx.execute(
            "DELETE FROM meter_links WHERE meter_id = ?1 OR subscriber_id = ?1",
            [owner],
        )?;
        tx.commit()?;
        Ok(tokens + links)
    }

    /// Attach a meter to a subscriber, replacing any previous link
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn link_meter(&self, meter: &str, subscriber: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO meter_links (meter_id, subscriber_id, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(meter_id) DO UPDATE SET subscriber_id = excluded.subscriber_id",
            params![meter, subscriber, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Subscriber a meter is linked to
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn subscriber_for(&self, meter: &str) -> Result<Option<String>> {
        let conn = self.pool.get()?;
        let subscriber = conn
            .query_row(
                "SELECT subscriber_id FROM meter_links WHERE meter_id = ?1",
                [meter],
                |row| row.get(0),
            )
            .optional()?;
        Ok(subscriber)
    }
}

/// Map a row, keeping enum and JSON decoding errors out of rusqlite's error type
fn row_to_token(row: &Row<'_>) -> rusqlite::Result<Result<MeteringToken>> {
    let token_type: String = row.get(2)?;
    let scopes: String = row.get(6)?;
    let consent_status: String = row.get(7)?;
    let consent_expires_at: Option<String> = row.get(8)?;

    let partial = MeteringToken {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        token_type: TokenType::Meter,
        access_token: row.get(3)?,
        refresh_token: row.get(4)?,
        expires_at: parse_datetime(&row.get::<_, String>(5)?),
        scopes: BTreeSet::new(),
        consent_status: ConsentStatus::Revoked,
        consent_expires_at: consent_expires_at.as_deref().map(parse_datetime),
        created_at: parse_datetime(&row.get::<_, String>(9)?),
        updated_at: parse_datetime(&row.get::<_, String>(10)?),
    };

    Ok(decode_columns(partial, &token_type, &scopes, &consent_status))
}

fn decode_columns(
    mut token: MeteringToken,
    token_type: &str,
    scopes: &str,
    consent_status: &str,
) -> Result<MeteringToken> {
    token.token_type = token_type.parse()?;
    token.scopes = serde_json::from_str(scopes)?;
    token.consent_status = consent_status.parse()?;
    Ok(token)
}
