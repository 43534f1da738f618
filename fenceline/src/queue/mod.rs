//! Durable transition event queue and its producer/consumer pair.
//!
//! Committed transitions are serialized and appended to an ordered,
//! SQLite-backed queue. The [`EventPublisher`] append is best-effort: a
//! publish failure is logged and never unwinds the already-committed
//! transition. The [`EventWorker`] drains the queue into a detached read
//! model with its own idempotency check, so at-least-once delivery cannot
//! duplicate downstream state.
//!
//! Pop is destructive: the row is removed before processing completes. An
//! event whose processing then fails is parked in a dead-letter table with
//! the failure reason instead of being dropped, so nothing is silently
//! lost and operators can inspect or replay it. The durable ledger remains
//! the source of truth either way.

mod event;
mod publisher;
mod read_model;
mod worker;

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

pub use event::{TransitionData, TransitionEvent};
pub use publisher::EventPublisher;
pub use read_model::{PresenceReadModel, PresenceRow, ReadModel, ReadModelError, ReconcileOutcome};
pub use worker::{EventWorker, WorkerError};

use crate::store::SqliteStore;

/// Errors from queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Underlying SQLite error.
    #[error("queue database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Event could not be serialized for the wire.
    #[error("event serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Durable, ordered event queue.
///
/// Rows are delivered strictly in append order. Delivery is at-least-once
/// from the producer's point of view (a retried sample republishes), with
/// the destructive-pop caveat described in the module docs.
#[derive(Clone)]
pub struct EventQueue {
    conn: Arc<Mutex<Connection>>,
}

impl EventQueue {
    /// Creates a queue sharing the store's database.
    pub fn new(store: &SqliteStore) -> Self {
        Self {
            conn: store.connection(),
        }
    }

    /// Appends a payload. Returns the queue row id.
    pub fn push(&self, payload: &str) -> Result<i64, QueueError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO event_queue (payload, enqueued_at) VALUES (?1, ?2)",
            params![payload, Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Removes and returns the oldest payload, or `None` when empty.
    ///
    /// Select and delete run in one transaction, so concurrent poppers
    /// cannot observe the same row. The removal is not conditional on any
    /// later processing outcome.
    pub fn pop(&self) -> Result<Option<String>, QueueError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let head: Option<(i64, String)> = tx
            .query_row(
                "SELECT id, payload FROM event_queue ORDER BY id LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let payload = match head {
            Some((id, payload)) => {
                tx.execute("DELETE FROM event_queue WHERE id = ?1", params![id])?;
                Some(payload)
            }
            None => None,
        };
        tx.commit()?;
        Ok(payload)
    }

    /// Number of queued payloads.
    pub fn len(&self) -> Result<u64, QueueError> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM event_queue", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// True when no payloads are queued.
    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }

    /// Parks a payload whose processing failed, together with the reason.
    pub fn push_dead_letter(&self, payload: &str, error: &str) -> Result<i64, QueueError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO dead_letter_queue (payload, error, failed_at) VALUES (?1, ?2, ?3)",
            params![payload, error, Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Every parked event, oldest first.
    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, payload, error, failed_at FROM dead_letter_queue ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            let failed_raw: String = row.get(3)?;
            Ok(DeadLetter {
                id: row.get(0)?,
                payload: row.get(1)?,
                error: row.get(2)?,
                failed_at: crate::store::parse_timestamp(3, failed_raw)?,
            })
        })?;
        let mut letters = Vec::new();
        for row in rows {
            letters.push(row?);
        }
        Ok(letters)
    }
}

/// An event whose processing failed after the destructive pop.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    /// Dead-letter row id.
    pub id: i64,
    /// The raw payload as popped from the queue.
    pub payload: String,
    /// Why processing failed.
    pub error: String,
    /// When the failure happened.
    pub failed_at: chrono::DateTime<chrono::Utc>,
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue").finish_non_exhaustive()
    }
}
