//! SQLite-backed outbox store.
//!
//! This crate provides:
//! - The [`OutboxEntry`] record and its forward-only state machine
//! - Database open/connect with WAL pragmas and versioned migrations
//! - [`LockedTransaction`], the write-locked transaction every dispatch
//!   read and update goes through
//! - Query helpers, including the ordering-aware selection of due entries
//!
//! # Locking
//!
//! SQLite has no row locks. A [`LockedTransaction`] is a `BEGIN IMMEDIATE`
//! transaction: it takes the database write lock up front and keeps it until
//! it commits or is dropped, so rows read through it cannot be claimed by any
//! other connection (in this process or another) in the meantime. Because the
//! lock covers the whole database, dispatch holds it only to claim an entry
//! and to record the outcome, never while publishing (see [`queries`]).
//!
//! ```ignore
//! let db = Database::open(path)?;
//! let mut conn = db.connect()?;
//! let tx = LockedTransaction::begin(&mut conn)?;
//! let due = queries::select_pending(&tx, 100, Utc::now(), OrderingPolicy::default())?;
//! tx.commit()?;
//! ```

mod db;
mod entry;
mod error;
mod migrations;
mod models;
pub mod queries;

pub use db::{Database, LockedTransaction};
pub use entry::{backoff_delay, OutboxEntry};
pub use error::{DatabaseError, DatabaseResult, EntryError};
pub use migrations::{run_migrations, CURRENT_VERSION};
pub use models::{OrderingPolicy, OutboxStatus};
