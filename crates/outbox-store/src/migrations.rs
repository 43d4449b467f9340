//! Database migrations.
//!
//! Migrations are run in order and tracked in the `migrations` table.

use crate::DatabaseResult;
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version.
pub const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> DatabaseResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM migrations",
        [],
        |row| row.get(0),
    )?;

    if current_version >= CURRENT_VERSION {
        debug!(current_version, "Schema up to date");
        return Ok(());
    }

    info!(current_version, target_version = CURRENT_VERSION, "Running migrations");

    if current_version < 1 {
        migrate_v1_outbox_table(conn)?;
    }
    if current_version < 2 {
        migrate_v2_unique_ordered_versions(conn)?;
    }
    if current_version < 3 {
        migrate_v3_dispatch_claims(conn)?;
    }

    info!("Migrations complete");
    Ok(())
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "Migration applied");
    Ok(())
}

/// V1: outbox table and dispatch indexes.
fn migrate_v1_outbox_table(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v1: outbox table");

    // Timestamps are INTEGER microseconds since the Unix epoch.
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS outbox (
            id TEXT PRIMARY KEY,
            topic TEXT NOT NULL,
            aggregate_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            headers TEXT,
            version INTEGER NOT NULL CHECK (version >= 0),
            status TEXT NOT NULL DEFAULT 'PENDING'
                CHECK (status IN ('PENDING', 'FAILED', 'PUBLISHED', 'DEAD_LETTER')),
            error_message TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            retryable INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL,
            retry_at INTEGER,
            next_retry_at INTEGER NOT NULL,
            published_at INTEGER,
            dead_letter_at INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_outbox_status_next_retry
            ON outbox(status, next_retry_at);
        CREATE INDEX IF NOT EXISTS idx_outbox_aggregate_version
            ON outbox(aggregate_id, version);
        CREATE INDEX IF NOT EXISTS idx_outbox_created_at
            ON outbox(created_at);
        ",
    )?;

    record_migration(conn, 1, "outbox_table")?;
    Ok(())
}

/// V2: ordered versions are unique per aggregate.
fn migrate_v2_unique_ordered_versions(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v2: unique ordered versions");

    conn.execute_batch(
        "
        CREATE UNIQUE INDEX IF NOT EXISTS idx_outbox_aggregate_ordered_version
            ON outbox(aggregate_id, version) WHERE version > 0;
        ",
    )?;

    record_migration(conn, 2, "unique_ordered_versions")?;
    Ok(())
}

/// V3: dispatch claims, so publishing happens outside the write lock.
fn migrate_v3_dispatch_claims(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v3: dispatch claims");

    conn.execute_batch(
        "
        ALTER TABLE outbox ADD COLUMN claim_token TEXT;
        ALTER TABLE outbox ADD COLUMN claimed_until INTEGER;
        ",
    )?;

    record_migration(conn, 3, "dispatch_claims")?;
    Ok(())
}
