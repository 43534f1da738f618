//! Downstream read model reconciliation.
//!
//! The worker reconciles queued transitions into a detached store through
//! the [`ReadModel`] trait. Implementations must be idempotent: they check
//! whether the state a transition implies is already present before
//! reapplying it, so at-least-once delivery and worker restarts cannot
//! duplicate downstream state.

use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use super::event::TransitionEvent;
use crate::engine::TransitionKind;
use crate::store::SqliteStore;

/// Outcome of reconciling one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The event changed downstream state.
    Applied,
    /// Downstream state already matched; nothing to do.
    AlreadyApplied,
}

/// Errors from read-model reconciliation.
#[derive(Debug, Error)]
pub enum ReadModelError {
    /// Underlying SQLite error.
    #[error("read model database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The event kind cannot appear on the queue (NONE is never
    /// published).
    #[error("unexpected event kind on queue: {0}")]
    UnexpectedKind(TransitionKind),
}

/// A detached downstream store transitions are reconciled into.
pub trait ReadModel: Send + Sync {
    /// Applies one transition idempotently.
    fn apply(&self, event: &TransitionEvent) -> Result<ReconcileOutcome, ReadModelError>;
}

/// Current-presence row: one per user currently inside a fence.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceRow {
    /// The user inside the fence.
    pub user_id: String,
    /// The fence the user is inside.
    pub area_id: i64,
    /// Fence name at transition time.
    pub area_name: String,
    /// When the presence began (the record's in-time).
    pub since: chrono::DateTime<chrono::Utc>,
}

/// Read model answering "who is inside what, right now" for dashboards.
///
/// Keyed by user: ENTER and SWITCH upsert the user's row, EXIT removes it.
/// Every write first checks the existing row, making replays no-ops.
pub struct PresenceReadModel {
    conn: Arc<Mutex<Connection>>,
}

impl PresenceReadModel {
    /// Creates a read model sharing the store's database.
    pub fn new(store: &SqliteStore) -> Self {
        Self {
            conn: store.connection(),
        }
    }

    /// The fence a user is currently shown inside, if any.
    pub fn presence_for_user(&self, user_id: &str) -> Result<Option<PresenceRow>, ReadModelError> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT user_id, area_id, area_name, since FROM presence WHERE user_id = ?1",
                params![user_id],
                presence_from_row,
            )
            .optional()?)
    }

    /// Every current presence row.
    pub fn all(&self) -> Result<Vec<PresenceRow>, ReadModelError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT user_id, area_id, area_name, since FROM presence ORDER BY user_id")?;
        let rows = stmt.query_map([], presence_from_row)?;
        let mut presences = Vec::new();
        for row in rows {
            presences.push(row?);
        }
        Ok(presences)
    }
}

impl ReadModel for PresenceReadModel {
    fn apply(&self, event: &TransitionEvent) -> Result<ReconcileOutcome, ReadModelError> {
        match event.kind {
            TransitionKind::Enter | TransitionKind::Switch => {
                let conn = self.conn.lock();
                let existing: Option<i64> = conn
                    .query_row(
                        "SELECT area_id FROM presence WHERE user_id = ?1",
                        params![event.data.user_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if existing == Some(event.data.area_id) {
                    return Ok(ReconcileOutcome::AlreadyApplied);
                }
                conn.execute(
                    "INSERT OR REPLACE INTO presence (user_id, area_id, area_name, since) \
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        event.data.user_id,
                        event.data.area_id,
                        event.data.area_name,
                        event.data.in_time.to_rfc3339()
                    ],
                )?;
                Ok(ReconcileOutcome::Applied)
            }
            TransitionKind::Exit => {
                let conn = self.conn.lock();
                let deleted = conn.execute(
                    "DELETE FROM presence WHERE user_id = ?1 AND area_id = ?2",
                    params![event.data.user_id, event.data.area_id],
                )?;
                if deleted > 0 {
                    Ok(ReconcileOutcome::Applied)
                } else {
                    Ok(ReconcileOutcome::AlreadyApplied)
                }
            }
            TransitionKind::None => Err(ReadModelError::UnexpectedKind(event.kind)),
        }
    }
}

fn presence_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PresenceRow> {
    let since_raw: String = row.get(3)?;
    Ok(PresenceRow {
        user_id: row.get(0)?,
        area_id: row.get(1)?,
        area_name: row.get(2)?,
        since: crate::store::parse_timestamp(3, since_raw)?,
    })
}
