//! SQLite-backed persistence and transaction orchestration.
//!
//! One [`SqliteStore`] wraps a single connection shared behind a mutex.
//! Every multi-statement mutation (record open/close plus its membership
//! edge) runs inside one SQLite transaction: all statements commit or none
//! do. The layer performs no automatic retries; failures surface to the
//! caller synchronously.
//!
//! Two constraints back up the engine's per-user serialization:
//!
//! - a partial unique index allows at most one open record per user, so a
//!   racing ENTER fails with [`StoreError::OpenRecordConflict`] instead of
//!   opening a duplicate;
//! - record closes are conditional (`WHERE disconnected = 0`), so closing
//!   an already-closed record fails with [`StoreError::StaleRecord`].

mod fences;
mod fraud;
mod records;
mod schema;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::Connection;
use thiserror::Error;

pub use fraud::FraudEvent;
pub(crate) use records::parse_timestamp;
pub use records::{LocationRecord, MembershipEdge};

/// How long a connection waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors surfaced by the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// An open record already exists for this user; a concurrent sample won
    /// the race.
    #[error("user {user_id} already has an open location record")]
    OpenRecordConflict {
        /// The user whose open-record slot was taken.
        user_id: String,
    },

    /// The record to close was already closed by a concurrent mutation.
    #[error("location record {record_id} is no longer open")]
    StaleRecord {
        /// Id of the record that was expected to be open.
        record_id: i64,
    },

    /// Fence radius must be strictly positive.
    #[error("invalid fence radius: {0} (must be > 0)")]
    InvalidRadius(f64),
}

/// Durable relational store for the ledger, the membership index, fences,
/// fraud events, and the event queue table.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (or creates) a store at the given path and ensures the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Opens an in-memory store. Intended for tests and experiments; the
    /// data vanishes when the last clone is dropped.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        schema::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Shares the underlying connection with sibling components (the event
    /// queue and read model live in the same database file).
    pub(crate) fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

/// True when the error is a SQLite uniqueness/constraint violation.
pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
