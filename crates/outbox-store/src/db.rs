//! Database handle, connection setup, and locked transactions.

use crate::{migrations, DatabaseResult};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Handle to an outbox database file.
///
/// The handle itself holds no connection. Each worker or caller thread takes
/// its own with [`connect`](Self::connect); SQLite's file locks coordinate
/// them, including across processes.
#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
}

impl Database {
    /// Open a database at the given path, running migrations if needed.
    pub fn open(path: &Path) -> DatabaseResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Self {
            path: path.to_path_buf(),
        };
        let conn = db.connect()?;
        migrations::run_migrations(&conn)?;

        debug!(path = %path.display(), "Opened outbox database");
        Ok(db)
    }

    /// Open a new connection with the standard pragmas applied.
    pub fn connect(&self) -> DatabaseResult<Connection> {
        let conn = Connection::open(&self.path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
            PRAGMA busy_timeout = 5000;
        ",
        )?;

        Ok(conn)
    }

    /// Open a migrated in-memory database for testing.
    pub fn open_in_memory() -> DatabaseResult<Connection> {
        let conn = Connection::open_in_memory()?;
        // Note: WAL mode doesn't apply to in-memory databases
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
        ",
        )?;
        migrations::run_migrations(&conn)?;
        Ok(conn)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A transaction holding the database write lock from its first statement.
///
/// Dispatch selection and state updates require one of these, so no two
/// workers can claim the same entry. Dropping without
/// [`commit`](Self::commit) rolls back.
pub struct LockedTransaction<'conn> {
    tx: Transaction<'conn>,
}

impl<'conn> LockedTransaction<'conn> {
    /// `BEGIN IMMEDIATE`. Waits up to the connection's busy timeout for
    /// other writers to finish.
    pub fn begin(conn: &'conn mut Connection) -> DatabaseResult<Self> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        Ok(Self { tx })
    }

    pub fn commit(self) -> DatabaseResult<()> {
        self.tx.commit()?;
        Ok(())
    }

    pub fn rollback(self) -> DatabaseResult<()> {
        self.tx.rollback()?;
        Ok(())
    }
}

impl<'conn> Deref for LockedTransaction<'conn> {
    type Target = Transaction<'conn>;

    fn deref(&self) -> &Self::Target {
        &self.tx
    }
}
