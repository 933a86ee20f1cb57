//! Database schema and migrations

use rusqlite::Connection;

use crate::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 4;

/// Initialize the database schema
///
/// # Errors
///
/// Returns error if migration fails
pub fn init(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }
    if version < 3 {
        migrate_v3(conn)?;
    }
    if version < 4 {
        migrate_v4(conn)?;
    }

    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- OAuth grants per subscriber or meter
        CREATE TABLE IF NOT EXISTS metering_tokens (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            token_type TEXT NOT NULL CHECK(token_type IN ('subscriber', 'meter')),
            access_token TEXT NOT NULL,
            refresh_token TEXT,
            expires_at TEXT NOT NULL,
            scopes TEXT NOT NULL DEFAULT '[]',
            consent_status TEXT NOT NULL DEFAULT 'active'
                CHECK(consent_status IN ('active', 'expiring', 'revoked')),
            consent_expires_at TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- At most one live token per owner and token type
        CREATE UNIQUE INDEX IF NOT EXISTS idx_tokens_live_owner
            ON metering_tokens(owner_id, token_type)
            WHERE consent_status != 'revoked';

        CREATE INDEX IF NOT EXISTS idx_tokens_owner ON metering_tokens(owner_id);

        -- Meter to subscriber links for subscriber-level consents
        CREATE TABLE IF NOT EXISTS meter_links (
            meter_id TEXT PRIMARY KEY,
            subscriber_id TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_meter_links_subscriber ON meter_links(subscriber_id);

        PRAGMA user_version = 1;
        ",
    )?;

    tracing::info!("migrated to schema v1");
    Ok(())
}

fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- One sealed entry per meter, day and metric
        CREATE TABLE IF NOT EXISTS cache_entries (
            meter_id TEXT NOT NULL,
            day TEXT NOT NULL,
            metric TEXT NOT NULL,
            nonce BLOB NOT NULL,
            ciphertext BLOB NOT NULL,
            key_fingerprint TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            ttl_secs INTEGER NOT NULL,
            PRIMARY KEY (meter_id, day, metric)
        );

        CREATE INDEX IF NOT EXISTS idx_cache_expiry ON cache_entries(created_at);

        PRAGMA user_version = 2;
        ",
    )?;

    tracing::info!("migrated to schema v2");
    Ok(())
}

fn migrate_v3(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Per caller, per day read counters
        CREATE TABLE IF NOT EXISTS quota_counters (
            caller_id TEXT NOT NULL,
            day TEXT NOT NULL,
            kind TEXT NOT NULL CHECK(kind IN ('cached', 'uncached')),
            count INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (caller_id, day, kind)
        );

        CREATE INDEX IF NOT EXISTS idx_quota_day ON quota_counters(day);

        PRAGMA user_version = 3;
        ",
    )?;

    tracing::info!("migrated to schema v3");
    Ok(())
}

fn migrate_v4(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Registered callers; only a digest of the bearer secret is stored
        CREATE TABLE IF NOT EXISTS callers (
            caller_id TEXT PRIMARY KEY,
            secret_hash TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        PRAGMA user_version = 4;
        ",
    )?;

    tracing::info!("migrated to schema v4");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();
        init(&conn).unwrap();

        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn live_token_index_allows_revoked_duplicates() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();

        let insert = "INSERT INTO metering_tokens (id, owner_id, token_type, access_token, expires_at, consent_status)
                      VALUES (?1, 'pdl-1', 'meter', 'a', '2030-01-01T00:00:00Z', ?2)";
        conn.execute(insert, ["t1", "revoked"]).unwrap();
        conn.execute(insert, ["t2", "revoked"]).unwrap();
        conn.execute(insert, ["t3", "active"]).unwrap();
        assert!(conn.execute(insert, ["t4", "active"]).is_err());
    }

    #[test]
    fn caller_secret_digests_are_unique() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();

        let insert = "INSERT INTO callers (caller_id, secret_hash) VALUES (?1, ?2)";
        conn.execute(insert, ["billing", "aa"]).unwrap();
        assert!(conn.execute(insert, ["reporting", "aa"]).is_err());
        assert!(conn.execute(insert, ["billing", "bb"]).is_err());
    }
}
