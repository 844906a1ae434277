//! SQLite pool management and schema migrations
//!
//! The pool is deliberately capped at a single connection: SQLite in WAL
//! mode serialises writers anyway, and a one-writer pool avoids
//! `SQLITE_BUSY` storms. Read volume is absorbed by the in-memory device
//! registry, so the durable store only sees catalogue writes, auth traffic,
//! and state write-through.
//!
//! Migrations are additive-only, ordered by `YYYYMMDD_HHMMSS` version
//! strings and recorded in `schema_migrations(version, applied_at)`. Each
//! migration runs in its own transaction, so a failure leaves all earlier
//! migrations applied.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};

/// A single schema migration
struct Migration {
    version: &'static str,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: "20250301_120000",
        name: "identity",
        sql: r#"
CREATE TABLE users (
    id            TEXT PRIMARY KEY,
    username      TEXT NOT NULL UNIQUE,
    display_name  TEXT NOT NULL,
    email         TEXT,
    password_hash TEXT NOT NULL,
    role          TEXT NOT NULL,
    active        INTEGER NOT NULL DEFAULT 1,
    created_by    TEXT,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);

CREATE TABLE refresh_tokens (
    id           TEXT PRIMARY KEY,
    user_id      TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    family_id    TEXT NOT NULL,
    token_hash   TEXT NOT NULL UNIQUE,
    device_label TEXT,
    expires_at   TEXT NOT NULL,
    revoked      INTEGER NOT NULL DEFAULT 0,
    created_at   TEXT NOT NULL
);

CREATE INDEX idx_refresh_tokens_family ON refresh_tokens(family_id);
CREATE INDEX idx_refresh_tokens_user ON refresh_tokens(user_id);

CREATE TABLE panels (
    id           TEXT PRIMARY KEY,
    name         TEXT NOT NULL,
    token_hash   TEXT NOT NULL UNIQUE,
    active       INTEGER NOT NULL DEFAULT 1,
    last_seen_at TEXT,
    created_by   TEXT,
    created_at   TEXT NOT NULL
);
"#,
    },
    Migration {
        version: "20250301_120500",
        name: "locations",
        sql: r#"
CREATE TABLE sites (
    id         TEXT PRIMARY KEY,
    name       TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE areas (
    id         TEXT PRIMARY KEY,
    site_id    TEXT REFERENCES sites(id) ON DELETE CASCADE,
    name       TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE rooms (
    id         TEXT PRIMARY KEY,
    area_id    TEXT REFERENCES areas(id) ON DELETE SET NULL,
    name       TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE infrastructure_zones (
    id        TEXT PRIMARY KEY,
    name      TEXT NOT NULL,
    zone_type TEXT NOT NULL
);

CREATE TABLE infrastructure_zone_rooms (
    zone_id TEXT NOT NULL REFERENCES infrastructure_zones(id) ON DELETE CASCADE,
    room_id TEXT NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
    PRIMARY KEY (zone_id, room_id)
);
"#,
    },
    Migration {
        version: "20250301_121000",
        name: "room_access",
        sql: r#"
CREATE TABLE user_room_access (
    user_id           TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    room_id           TEXT NOT NULL,
    can_manage_scenes INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (user_id, room_id)
);

CREATE TABLE panel_room_access (
    panel_id TEXT NOT NULL REFERENCES panels(id) ON DELETE CASCADE,
    room_id  TEXT NOT NULL,
    PRIMARY KEY (panel_id, room_id)
);
"#,
    },
    Migration {
        version: "20250301_121500",
        name: "devices",
        sql: r#"
CREATE TABLE devices (
    id               TEXT PRIMARY KEY,
    slug             TEXT NOT NULL UNIQUE,
    name             TEXT NOT NULL,
    room_id          TEXT,
    area_id          TEXT,
    domain           TEXT NOT NULL,
    device_type      TEXT NOT NULL,
    protocol         TEXT NOT NULL,
    address          TEXT NOT NULL,
    capabilities     TEXT NOT NULL DEFAULT '[]',
    state            TEXT NOT NULL DEFAULT '{}',
    state_updated_at TEXT,
    health           TEXT NOT NULL DEFAULT 'unknown',
    health_last_seen TEXT,
    gateway_id       TEXT,
    manufacturer     TEXT,
    model            TEXT,
    firmware         TEXT,
    settings         TEXT NOT NULL DEFAULT '{}',
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL
);

CREATE INDEX idx_devices_room ON devices(room_id);
CREATE INDEX idx_devices_protocol ON devices(protocol);
CREATE INDEX idx_devices_domain ON devices(domain);
"#,
    },
];

/// Open the SQLite pool described by `config`
///
/// WAL journal mode, foreign keys on, a single pooled connection, and a
/// bounded `SELECT 1` verification before the pool is handed out.
pub async fn open_pool(config: &DatabaseConfig) -> Result<SqlitePool> {
    let base = if config.path == ":memory:" {
        SqliteConnectOptions::from_str("sqlite::memory:").map_err(Error::Database)?
    } else {
        SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
    };
    let options = base
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    tokio::time::timeout(
        config.connect_verify_timeout(),
        sqlx::query("SELECT 1").execute(&pool),
    )
    .await
    .map_err(|_| Error::ConnectionFailed("database verify timed out".to_string()))??;

    tracing::info!(path = %config.path, "database pool opened");
    Ok(pool)
}

/// Apply all pending migrations
///
/// Safe to run on every start; already-applied versions are skipped.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    let applied: Vec<(String,)> = sqlx::query_as("SELECT version FROM schema_migrations")
        .fetch_all(pool)
        .await?;
    let applied: std::collections::HashSet<String> =
        applied.into_iter().map(|(v,)| v).collect();

    for migration in MIGRATIONS {
        if applied.contains(migration.version) {
            continue;
        }

        let mut tx = pool.begin().await?;

        sqlx::raw_sql(migration.sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Migration {
                version: migration.version.to_string(),
                message: e.to_string(),
            })?;

        sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)")
            .bind(migration.version)
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(
            version = migration.version,
            name = migration.name,
            "migration applied"
        );
    }

    Ok(())
}
