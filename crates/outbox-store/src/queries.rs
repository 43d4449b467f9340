//! Standalone query functions over the `outbox` table.
//!
//! Reads take a `&Connection`, so they also accept any transaction.
//! Inserts require an open `Transaction` so they always join the caller's
//! unit of work. Dispatch selection, claims, and updates require a
//! [`LockedTransaction`].
//!
//! # Claims
//!
//! A worker never publishes while holding the write lock. It claims an entry
//! in one short locked transaction, which stamps a `claim_token` and a
//! `claimed_until` lease, publishes with no transaction open, then records the
//! outcome with [`complete_claim`] in a second short one. Selection skips
//! entries whose lease is still running; once it lapses the entry is eligible
//! again.

use crate::entry::next_id;
use crate::{
    DatabaseError, DatabaseResult, LockedTransaction, OrderingPolicy, OutboxEntry, OutboxStatus,
};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row, Transaction};
use tracing::debug;

const ENTRY_COLUMNS: &str = "o.id, o.topic, o.aggregate_id, o.payload, o.headers, o.version, \
     o.status, o.error_message, o.retry_count, o.retryable, o.created_at, o.retry_at, \
     o.next_retry_at, o.published_at, o.dead_letter_at";

// ==========================================
// Writes
// ==========================================

/// Insert a new entry as part of the caller's transaction.
pub fn insert_entry(tx: &Transaction<'_>, entry: &OutboxEntry) -> DatabaseResult<()> {
    tx.execute(
        "INSERT INTO outbox (id, topic, aggregate_id, payload, headers, version, status, error_message,
                             retry_count, retryable, created_at, retry_at, next_retry_at, published_at, dead_letter_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            entry.id,
            entry.topic,
            entry.aggregate_id,
            entry.payload,
            entry.headers,
            entry.version,
            entry.status,
            entry.error_message,
            entry.retry_count,
            entry.retryable,
            micros(entry.created_at),
            entry.retry_at.map(micros),
            micros(entry.next_retry_at),
            entry.published_at.map(micros),
            entry.dead_letter_at.map(micros),
        ],
    )?;
    debug!(
        entry_id = %entry.id,
        aggregate_id = %entry.aggregate_id,
        version = entry.version,
        "Inserted outbox entry"
    );
    Ok(())
}

/// Insert an ordered entry, allocating the next version of its aggregate in
/// the same statement. Returns the version and stores it on `entry`.
///
/// Reading the current maximum and inserting in one statement means the
/// statement takes the write lock before it reads, so a DEFERRED caller
/// transaction waits on `busy_timeout` like any other writer. A transaction
/// that has already read from the database still cannot upgrade while
/// another writer is active; such callers should stage events first or use
/// `TransactionBehavior::Immediate`.
pub fn insert_ordered_entry(tx: &Transaction<'_>, entry: &mut OutboxEntry) -> DatabaseResult<i64> {
    let version: i64 = tx.query_row(
        "INSERT INTO outbox (id, topic, aggregate_id, payload, headers, version, status, error_message,
                             retry_count, retryable, created_at, retry_at, next_retry_at, published_at, dead_letter_at)
         SELECT ?1, ?2, ?3, ?4, ?5, COALESCE(MAX(version), 0) + 1, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14
         FROM outbox WHERE aggregate_id = ?3
         RETURNING version",
        params![
            entry.id,
            entry.topic,
            entry.aggregate_id,
            entry.payload,
            entry.headers,
            entry.status,
            entry.error_message,
            entry.retry_count,
            entry.retryable,
            micros(entry.created_at),
            entry.retry_at.map(micros),
            micros(entry.next_retry_at),
            entry.published_at.map(micros),
            entry.dead_letter_at.map(micros),
        ],
        |row| row.get(0),
    )?;
    entry.version = version;
    debug!(
        entry_id = %entry.id,
        aggregate_id = %entry.aggregate_id,
        version,
        "Inserted ordered outbox entry"
    );
    Ok(version)
}

/// Persist the lifecycle fields of an entry read under the same lock and
/// drop any claim on it.
pub fn update_entry(tx: &LockedTransaction<'_>, entry: &OutboxEntry) -> DatabaseResult<()> {
    let updated = tx.execute(
        "UPDATE outbox
         SET status = ?1, error_message = ?2, retry_count = ?3, retry_at = ?4,
             next_retry_at = ?5, published_at = ?6, dead_letter_at = ?7,
             claim_token = NULL, claimed_until = NULL
         WHERE id = ?8",
        params![
            entry.status,
            entry.error_message,
            entry.retry_count,
            entry.retry_at.map(micros),
            micros(entry.next_retry_at),
            entry.published_at.map(micros),
            entry.dead_letter_at.map(micros),
            entry.id,
        ],
    )?;
    if updated == 0 {
        return Err(DatabaseError::InvalidData(format!(
            "outbox entry {} does not exist",
            entry.id
        )));
    }
    Ok(())
}

/// Take a dispatch lease on an entry until `until`. Returns the claim token
/// that [`complete_claim`] must present.
pub fn claim_entry(
    tx: &LockedTransaction<'_>,
    id: &str,
    until: DateTime<Utc>,
) -> DatabaseResult<String> {
    let token = next_id();
    let updated = tx.execute(
        "UPDATE outbox SET claim_token = ?1, claimed_until = ?2 WHERE id = ?3",
        params![token, micros(until), id],
    )?;
    if updated == 0 {
        return Err(DatabaseError::InvalidData(format!(
            "outbox entry {id} does not exist"
        )));
    }
    debug!(entry_id = %id, claimed_until = %until, "Claimed outbox entry");
    Ok(token)
}

/// Persist the outcome of a claimed dispatch and release the claim.
///
/// Returns `false` without writing anything when `token` no longer holds the
/// claim, meaning the lease lapsed and another worker took the entry over.
pub fn complete_claim(
    tx: &LockedTransaction<'_>,
    entry: &OutboxEntry,
    token: &str,
) -> DatabaseResult<bool> {
    let updated = tx.execute(
        "UPDATE outbox
         SET status = ?1, error_message = ?2, retry_count = ?3, retry_at = ?4,
             next_retry_at = ?5, published_at = ?6, dead_letter_at = ?7,
             claim_token = NULL, claimed_until = NULL
         WHERE id = ?8 AND claim_token = ?9",
        params![
            entry.status,
            entry.error_message,
            entry.retry_count,
            entry.retry_at.map(micros),
            micros(entry.next_retry_at),
            entry.published_at.map(micros),
            entry.dead_letter_at.map(micros),
            entry.id,
            token,
        ],
    )?;
    Ok(updated > 0)
}

// ==========================================
// Dispatch selection
// ==========================================

/// Due PENDING entries whose ordering gate is open, oldest first.
pub fn select_pending(
    tx: &LockedTransaction<'_>,
    batch_size: usize,
    now: DateTime<Utc>,
    policy: OrderingPolicy,
) -> DatabaseResult<Vec<OutboxEntry>> {
    select_eligible(tx, OutboxStatus::Pending, batch_size, now, policy)
}

/// Due FAILED entries whose ordering gate is open, oldest first.
pub fn select_failed(
    tx: &LockedTransaction<'_>,
    batch_size: usize,
    now: DateTime<Utc>,
    policy: OrderingPolicy,
) -> DatabaseResult<Vec<OutboxEntry>> {
    select_eligible(tx, OutboxStatus::Failed, batch_size, now, policy)
}

/// Re-read one entry under lock, returning it only if it is still in
/// `status`, due, unclaimed and unblocked. `None` means another worker got
/// there first or a predecessor regressed.
pub fn lock_for_dispatch(
    tx: &LockedTransaction<'_>,
    id: &str,
    status: OutboxStatus,
    now: DateTime<Utc>,
    policy: OrderingPolicy,
) -> DatabaseResult<Option<OutboxEntry>> {
    let sql = eligible_sql(policy, "AND o.id = ?3");
    let mut stmt = tx.prepare_cached(&sql)?;
    let result = stmt.query_row(params![status, micros(now), id], entry_from_row);

    match result {
        Ok(entry) => Ok(Some(entry)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn select_eligible(
    tx: &LockedTransaction<'_>,
    status: OutboxStatus,
    batch_size: usize,
    now: DateTime<Utc>,
    policy: OrderingPolicy,
) -> DatabaseResult<Vec<OutboxEntry>> {
    let sql = eligible_sql(
        policy,
        "ORDER BY o.created_at ASC, o.aggregate_id ASC, o.version ASC, o.id ASC LIMIT ?3",
    );
    let limit = i64::try_from(batch_size).unwrap_or(i64::MAX);

    let mut stmt = tx.prepare_cached(&sql)?;
    let entries = stmt
        .query_map(params![status, micros(now), limit], entry_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    debug!(status = %status, count = entries.len(), "Selected eligible outbox entries");
    Ok(entries)
}

/// An ordered entry is eligible only when every lower version of its
/// aggregate is in a non-blocking status. Entries under a live claim are
/// never eligible.
fn eligible_sql(policy: OrderingPolicy, tail: &str) -> String {
    format!(
        "SELECT {ENTRY_COLUMNS} FROM outbox o
         WHERE o.status = ?1
           AND o.next_retry_at <= ?2
           AND (o.claimed_until IS NULL OR o.claimed_until <= ?2)
           AND (o.version = 0 OR NOT EXISTS (
                SELECT 1 FROM outbox p
                WHERE p.aggregate_id = o.aggregate_id
                  AND p.version < o.version
                  AND p.status NOT IN {non_blocking}))
         {tail}",
        non_blocking = policy.non_blocking_statuses(),
    )
}

// ==========================================
// Reads
// ==========================================

/// Highest version recorded for an aggregate, or `None` if it has no entries.
pub fn find_max_version(conn: &Connection, aggregate_id: &str) -> DatabaseResult<Option<i64>> {
    let max = conn.query_row(
        "SELECT MAX(version) FROM outbox WHERE aggregate_id = ?1",
        params![aggregate_id],
        |row| row.get(0),
    )?;
    Ok(max)
}

/// Get an entry by ID.
pub fn find_entry(conn: &Connection, id: &str) -> DatabaseResult<Option<OutboxEntry>> {
    let sql = format!("SELECT {ENTRY_COLUMNS} FROM outbox o WHERE o.id = ?1");
    let mut stmt = conn.prepare_cached(&sql)?;

    match stmt.query_row(params![id], entry_from_row) {
        Ok(entry) => Ok(Some(entry)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// All entries of an aggregate in version order.
pub fn find_by_aggregate(conn: &Connection, aggregate_id: &str) -> DatabaseResult<Vec<OutboxEntry>> {
    let sql = format!(
        "SELECT {ENTRY_COLUMNS} FROM outbox o
         WHERE o.aggregate_id = ?1
         ORDER BY o.version ASC, o.created_at ASC"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let entries = stmt
        .query_map(params![aggregate_id], entry_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// Get the ordered entry at `version` for an aggregate.
pub fn find_by_aggregate_and_version(
    conn: &Connection,
    aggregate_id: &str,
    version: i64,
) -> DatabaseResult<Option<OutboxEntry>> {
    let sql = format!(
        "SELECT {ENTRY_COLUMNS} FROM outbox o
         WHERE o.aggregate_id = ?1 AND o.version = ?2
         ORDER BY o.created_at ASC
         LIMIT 1"
    );
    let mut stmt = conn.prepare_cached(&sql)?;

    match stmt.query_row(params![aggregate_id, version], entry_from_row) {
        Ok(entry) => Ok(Some(entry)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

// ==========================================
// Counts
// ==========================================

pub fn count_by_status(conn: &Connection, status: OutboxStatus) -> DatabaseResult<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM outbox WHERE status = ?1",
        params![status],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

pub fn count_pending(conn: &Connection) -> DatabaseResult<u64> {
    count_by_status(conn, OutboxStatus::Pending)
}

pub fn count_failed(conn: &Connection) -> DatabaseResult<u64> {
    count_by_status(conn, OutboxStatus::Failed)
}

/// FAILED entries created before `cutoff`.
pub fn count_failed_older_than(conn: &Connection, cutoff: DateTime<Utc>) -> DatabaseResult<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM outbox WHERE status = ?1 AND created_at < ?2",
        params![OutboxStatus::Failed, micros(cutoff)],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

// ==========================================
// Row mapping
// ==========================================

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<OutboxEntry> {
    Ok(OutboxEntry {
        id: row.get(0)?,
        topic: row.get(1)?,
        aggregate_id: row.get(2)?,
        payload: row.get(3)?,
        headers: row.get(4)?,
        version: row.get(5)?,
        status: row.get(6)?,
        error_message: row.get(7)?,
        retry_count: row.get(8)?,
        retryable: row.get(9)?,
        created_at: timestamp_at(row, 10)?,
        retry_at: optional_timestamp_at(row, 11)?,
        next_retry_at: timestamp_at(row, 12)?,
        published_at: optional_timestamp_at(row, 13)?,
        dead_letter_at: optional_timestamp_at(row, 14)?,
    })
}

fn micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: i64 = row.get(idx)?;
    from_micros(raw, idx)
}

fn optional_timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<i64>>(idx)?
        .map(|raw| from_micros(raw, idx))
        .transpose()
}

fn from_micros(raw: i64, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            format!("timestamp out of range: {raw}").into(),
        )
    })
}
