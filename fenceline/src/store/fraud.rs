//! Append-only fraud event audit trail.
//!
//! Rows are written when the fingerprint guard sees a device hand-off and
//! are never mutated or deleted. Detection is observational: nothing here
//! influences transition processing.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;

use super::records::parse_timestamp;
use super::{SqliteStore, StoreError};

/// One observed device-fingerprint mismatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FraudEvent {
    /// Store-assigned identifier.
    pub id: i64,
    /// The user whose fingerprint changed.
    pub user_id: String,
    /// The fence context the mismatch was observed in.
    pub fence_id: i64,
    /// The fingerprint previously cached for the user.
    pub old_fingerprint: String,
    /// The fingerprint carried by the offending sample.
    pub new_fingerprint: String,
    /// When the mismatch was observed.
    pub created_at: DateTime<Utc>,
}

impl SqliteStore {
    /// Appends a fraud event. Never suppressed, never updated.
    pub fn append_fraud_event(
        &self,
        user_id: &str,
        fence_id: i64,
        old_fingerprint: &str,
        new_fingerprint: &str,
        at: DateTime<Utc>,
    ) -> Result<FraudEvent, StoreError> {
        let conn = self.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO fraud_events (user_id, fence_id, old_fingerprint, new_fingerprint, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user_id, fence_id, old_fingerprint, new_fingerprint, at.to_rfc3339()],
        )?;
        Ok(FraudEvent {
            id: conn.last_insert_rowid(),
            user_id: user_id.to_string(),
            fence_id,
            old_fingerprint: old_fingerprint.to_string(),
            new_fingerprint: new_fingerprint.to_string(),
            created_at: at,
        })
    }

    /// Audit query: fraud events for a user, newest first.
    pub fn fraud_events_for_user(&self, user_id: &str) -> Result<Vec<FraudEvent>, StoreError> {
        let conn = self.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, fence_id, old_fingerprint, new_fingerprint, created_at \
             FROM fraud_events WHERE user_id = ?1 ORDER BY id DESC",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            let created_raw: String = row.get(5)?;
            Ok(FraudEvent {
                id: row.get(0)?,
                user_id: row.get(1)?,
                fence_id: row.get(2)?,
                old_fingerprint: row.get(3)?,
                new_fingerprint: row.get(4)?,
                created_at: parse_timestamp(5, created_raw)?,
            })
        })?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_query() {
        let store = SqliteStore::open_in_memory().unwrap();
        let event = store
            .append_fraud_event("alice", 7, "print-a", "print-b", Utc::now())
            .unwrap();

        let events = store.fraud_events_for_user("alice").unwrap();
        assert_eq!(events, vec![event]);
        assert!(store.fraud_events_for_user("bob").unwrap().is_empty());
    }

    #[test]
    fn test_events_accumulate_newest_first() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .append_fraud_event("alice", 1, "a", "b", Utc::now())
            .unwrap();
        store
            .append_fraud_event("alice", 1, "b", "c", Utc::now())
            .unwrap();

        let events = store.fraud_events_for_user("alice").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].new_fingerprint, "c");
        assert_eq!(events[1].new_fingerprint, "b");
    }
}
