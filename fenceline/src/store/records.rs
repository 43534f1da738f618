//! Residency ledger and membership index operations.
//!
//! The ledger is append-mostly: records are created on ENTER and the new
//! leg of SWITCH, closed (never deleted) on EXIT and the old leg of SWITCH.
//! Membership edges are created and deleted in lockstep with record
//! open/close, inside the same transaction.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use super::{is_constraint_violation, SqliteStore, StoreError};
use crate::fence::GeofenceArea;
use crate::geo::Coordinate;

/// One contiguous residency interval of a user inside a fence.
///
/// A record with `disconnected = false` is "open": the user is currently
/// considered inside `area_id`. Per user there is at most one open record
/// at any time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationRecord {
    /// Store-assigned identifier.
    pub id: i64,
    /// The user this residency belongs to.
    pub user_id: String,
    /// The fence the user resided in.
    pub area_id: i64,
    /// Fence name at the time of entry (denormalized for history queries).
    pub area_name: String,
    /// Where the user was when the residency opened.
    pub in_coordinate: Coordinate,
    /// When the residency opened.
    pub in_time: DateTime<Utc>,
    /// Where the user was when the residency closed, if closed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out_coordinate: Option<Coordinate>,
    /// When the residency closed, if closed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out_time: Option<DateTime<Utc>>,
    /// True once the residency is closed.
    pub disconnected: bool,
    /// True when the residency was closed by a switch into another fence
    /// rather than a plain exit.
    pub switched: bool,
}

impl LocationRecord {
    /// Whether this residency is still open.
    pub fn is_open(&self) -> bool {
        !self.disconnected
    }
}

/// An entry in the fast "who is inside now" index.
///
/// Exists iff the user has an open [`LocationRecord`] with the same area
/// id. Derivable from the ledger, kept separate for query performance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipEdge {
    /// The user inside the fence.
    pub user_id: String,
    /// The fence the user is inside.
    pub area_id: i64,
}

const RECORD_COLUMNS: &str = "id, user_id, area_id, area_name, in_latitude, in_longitude, \
                              in_time, out_latitude, out_longitude, out_time, disconnected, switched";

impl SqliteStore {
    /// Finds the current open record for a user, if any.
    pub fn open_record(&self, user_id: &str) -> Result<Option<LocationRecord>, StoreError> {
        let conn = self.connection();
        let conn = conn.lock();
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM location_records \
             WHERE user_id = ?1 AND disconnected = 0"
        );
        Ok(conn
            .query_row(&sql, params![user_id], record_from_row)
            .optional()?)
    }

    /// Opens a new residency record and its membership edge (ENTER).
    ///
    /// Both rows are written in one transaction. If another sample already
    /// opened a record for this user, the partial unique index rejects the
    /// insert and [`StoreError::OpenRecordConflict`] is returned.
    pub fn enter(
        &self,
        user_id: &str,
        fence: &GeofenceArea,
        point: Coordinate,
        at: DateTime<Utc>,
    ) -> Result<LocationRecord, StoreError> {
        let conn = self.connection();
        let mut conn = conn.lock();
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT INTO location_records \
             (user_id, area_id, area_name, in_latitude, in_longitude, in_time, disconnected, switched) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0)",
            params![
                user_id,
                fence.id,
                fence.name,
                point.latitude,
                point.longitude,
                at.to_rfc3339()
            ],
        );
        if let Err(err) = inserted {
            return Err(if is_constraint_violation(&err) {
                StoreError::OpenRecordConflict {
                    user_id: user_id.to_string(),
                }
            } else {
                err.into()
            });
        }
        let record_id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO membership_edges (user_id, area_id) VALUES (?1, ?2)",
            params![user_id, fence.id],
        )?;
        tx.commit()?;

        Ok(LocationRecord {
            id: record_id,
            user_id: user_id.to_string(),
            area_id: fence.id,
            area_name: fence.name.clone(),
            in_coordinate: point,
            in_time: at,
            out_coordinate: None,
            out_time: None,
            disconnected: false,
            switched: false,
        })
    }

    /// Closes an open residency record and removes its edge (EXIT).
    ///
    /// The close is conditional on the record still being open; a
    /// concurrent close surfaces as [`StoreError::StaleRecord`] and nothing
    /// is committed.
    pub fn exit(
        &self,
        record: &LocationRecord,
        point: Coordinate,
        at: DateTime<Utc>,
    ) -> Result<LocationRecord, StoreError> {
        let conn = self.connection();
        let mut conn = conn.lock();
        let tx = conn.transaction()?;

        close_open_record(&tx, record.id, point, at, false)?;
        tx.execute(
            "DELETE FROM membership_edges WHERE user_id = ?1 AND area_id = ?2",
            params![record.user_id, record.area_id],
        )?;
        tx.commit()?;

        Ok(closed_copy(record, point, at, false))
    }

    /// Atomically moves a user from one fence to another (SWITCH).
    ///
    /// One transaction: close the old record (`switched = true`), open the
    /// new record, delete the old edge, insert the new edge. Returns the
    /// closed old record and the new open record.
    pub fn switch(
        &self,
        record: &LocationRecord,
        fence: &GeofenceArea,
        point: Coordinate,
        at: DateTime<Utc>,
    ) -> Result<(LocationRecord, LocationRecord), StoreError> {
        let conn = self.connection();
        let mut conn = conn.lock();
        let tx = conn.transaction()?;

        close_open_record(&tx, record.id, point, at, true)?;
        tx.execute(
            "DELETE FROM membership_edges WHERE user_id = ?1 AND area_id = ?2",
            params![record.user_id, record.area_id],
        )?;
        tx.execute(
            "INSERT INTO location_records \
             (user_id, area_id, area_name, in_latitude, in_longitude, in_time, disconnected, switched) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0)",
            params![
                record.user_id,
                fence.id,
                fence.name,
                point.latitude,
                point.longitude,
                at.to_rfc3339()
            ],
        )?;
        let new_id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO membership_edges (user_id, area_id) VALUES (?1, ?2)",
            params![record.user_id, fence.id],
        )?;
        tx.commit()?;

        let closed = closed_copy(record, point, at, true);
        let opened = LocationRecord {
            id: new_id,
            user_id: record.user_id.clone(),
            area_id: fence.id,
            area_name: fence.name.clone(),
            in_coordinate: point,
            in_time: at,
            out_coordinate: None,
            out_time: None,
            disconnected: false,
            switched: false,
        };
        Ok((closed, opened))
    }

    /// Residency history for a user, newest first. Includes open records.
    pub fn records_for_user(&self, user_id: &str) -> Result<Vec<LocationRecord>, StoreError> {
        let conn = self.connection();
        let conn = conn.lock();
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM location_records \
             WHERE user_id = ?1 ORDER BY in_time DESC, id DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id], record_from_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Membership index entries for a user.
    pub fn edges_for_user(&self, user_id: &str) -> Result<Vec<MembershipEdge>, StoreError> {
        let conn = self.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(
            "SELECT user_id, area_id FROM membership_edges WHERE user_id = ?1 ORDER BY area_id",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(MembershipEdge {
                user_id: row.get(0)?,
                area_id: row.get(1)?,
            })
        })?;
        let mut edges = Vec::new();
        for row in rows {
            edges.push(row?);
        }
        Ok(edges)
    }

    /// Whether the index holds an edge for `(user, area)`.
    pub fn edge_exists(&self, user_id: &str, area_id: i64) -> Result<bool, StoreError> {
        let conn = self.connection();
        let conn = conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM membership_edges WHERE user_id = ?1 AND area_id = ?2",
            params![user_id, area_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

/// Conditionally closes an open record inside an existing transaction.
fn close_open_record(
    tx: &rusqlite::Transaction<'_>,
    record_id: i64,
    point: Coordinate,
    at: DateTime<Utc>,
    switched: bool,
) -> Result<(), StoreError> {
    let updated = tx.execute(
        "UPDATE location_records \
         SET out_latitude = ?1, out_longitude = ?2, out_time = ?3, disconnected = 1, switched = ?4 \
         WHERE id = ?5 AND disconnected = 0",
        params![point.latitude, point.longitude, at.to_rfc3339(), switched, record_id],
    )?;
    if updated == 0 {
        return Err(StoreError::StaleRecord { record_id });
    }
    Ok(())
}

fn closed_copy(
    record: &LocationRecord,
    point: Coordinate,
    at: DateTime<Utc>,
    switched: bool,
) -> LocationRecord {
    LocationRecord {
        out_coordinate: Some(point),
        out_time: Some(at),
        disconnected: true,
        switched,
        ..record.clone()
    }
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LocationRecord> {
    let in_time_raw: String = row.get(6)?;
    let out_time_raw: Option<String> = row.get(9)?;
    let out_latitude: Option<f64> = row.get(7)?;
    let out_longitude: Option<f64> = row.get(8)?;

    let out_coordinate = match (out_latitude, out_longitude) {
        (Some(latitude), Some(longitude)) => Some(Coordinate {
            latitude,
            longitude,
        }),
        _ => None,
    };
    let out_time = match out_time_raw {
        Some(raw) => Some(parse_timestamp(9, raw)?),
        None => None,
    };

    Ok(LocationRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        area_id: row.get(2)?,
        area_name: row.get(3)?,
        in_coordinate: Coordinate {
            latitude: row.get(4)?,
            longitude: row.get(5)?,
        },
        in_time: parse_timestamp(6, in_time_raw)?,
        out_coordinate,
        out_time,
        disconnected: row.get(10)?,
        switched: row.get(11)?,
    })
}

pub(crate) fn parse_timestamp(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_fences() -> (SqliteStore, GeofenceArea, GeofenceArea) {
        let store = SqliteStore::open_in_memory().unwrap();
        let home = store
            .insert_fence("home", Coordinate::new(0.0, 0.0).unwrap(), 100.0, "owner-1")
            .unwrap();
        let office = store
            .insert_fence("office", Coordinate::new(1.0, 1.0).unwrap(), 100.0, "owner-2")
            .unwrap();
        (store, home, office)
    }

    #[test]
    fn test_enter_creates_record_and_edge() {
        let (store, home, _) = store_with_fences();
        let point = home.center;
        let record = store.enter("alice", &home, point, Utc::now()).unwrap();

        assert!(record.is_open());
        assert_eq!(record.area_id, home.id);
        assert_eq!(record.area_name, "home");

        let open = store.open_record("alice").unwrap().unwrap();
        assert_eq!(open, record);
        assert!(store.edge_exists("alice", home.id).unwrap());
    }

    #[test]
    fn test_second_enter_conflicts() {
        let (store, home, office) = store_with_fences();
        store.enter("alice", &home, home.center, Utc::now()).unwrap();

        let result = store.enter("alice", &office, office.center, Utc::now());
        assert!(matches!(
            result,
            Err(StoreError::OpenRecordConflict { user_id }) if user_id == "alice"
        ));
        // The failed transaction must not leave an edge behind.
        assert!(!store.edge_exists("alice", office.id).unwrap());
    }

    #[test]
    fn test_exit_closes_record_and_removes_edge() {
        let (store, home, _) = store_with_fences();
        let record = store.enter("alice", &home, home.center, Utc::now()).unwrap();

        let out_point = Coordinate::new(0.01, 0.01).unwrap();
        let closed = store.exit(&record, out_point, Utc::now()).unwrap();

        assert!(!closed.is_open());
        assert!(!closed.switched);
        assert_eq!(closed.out_coordinate, Some(out_point));
        assert!(closed.out_time.is_some());

        assert!(store.open_record("alice").unwrap().is_none());
        assert!(!store.edge_exists("alice", home.id).unwrap());
    }

    #[test]
    fn test_exit_twice_is_stale() {
        let (store, home, _) = store_with_fences();
        let record = store.enter("alice", &home, home.center, Utc::now()).unwrap();
        store.exit(&record, home.center, Utc::now()).unwrap();

        let result = store.exit(&record, home.center, Utc::now());
        assert!(matches!(
            result,
            Err(StoreError::StaleRecord { record_id }) if record_id == record.id
        ));
    }

    #[test]
    fn test_switch_moves_record_and_edge() {
        let (store, home, office) = store_with_fences();
        let record = store.enter("alice", &home, home.center, Utc::now()).unwrap();

        let (closed, opened) = store
            .switch(&record, &office, office.center, Utc::now())
            .unwrap();

        assert!(!closed.is_open());
        assert!(closed.switched);
        assert_eq!(closed.area_id, home.id);

        assert!(opened.is_open());
        assert_eq!(opened.area_id, office.id);
        assert!(!opened.switched);

        let open = store.open_record("alice").unwrap().unwrap();
        assert_eq!(open.id, opened.id);
        assert!(!store.edge_exists("alice", home.id).unwrap());
        assert!(store.edge_exists("alice", office.id).unwrap());
    }

    #[test]
    fn test_at_most_one_open_record_after_history() {
        let (store, home, office) = store_with_fences();
        let now = Utc::now();

        let r1 = store.enter("alice", &home, home.center, now).unwrap();
        let (_, r2) = store.switch(&r1, &office, office.center, now).unwrap();
        store.exit(&r2, office.center, now).unwrap();
        store.enter("alice", &home, home.center, now).unwrap();

        let open: Vec<_> = store
            .records_for_user("alice")
            .unwrap()
            .into_iter()
            .filter(LocationRecord::is_open)
            .collect();
        assert_eq!(open.len(), 1);
    }

    #[test]
    fn test_records_for_user_newest_first() {
        let (store, home, office) = store_with_fences();
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::seconds(60);

        let r1 = store.enter("alice", &home, home.center, t1).unwrap();
        let (_, _r2) = store.switch(&r1, &office, office.center, t2).unwrap();

        let records = store.records_for_user("alice").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].area_id, office.id);
        assert_eq!(records[1].area_id, home.id);
    }

    #[test]
    fn test_edges_are_per_user() {
        let (store, home, _) = store_with_fences();
        store.enter("alice", &home, home.center, Utc::now()).unwrap();
        store.enter("bob", &home, home.center, Utc::now()).unwrap();

        assert_eq!(store.edges_for_user("alice").unwrap().len(), 1);
        assert_eq!(store.edges_for_user("bob").unwrap().len(), 1);
        assert!(store.edges_for_user("carol").unwrap().is_empty());
    }

    #[test]
    fn test_timestamps_round_trip() {
        let (store, home, _) = store_with_fences();
        let at = Utc::now();
        store.enter("alice", &home, home.center, at).unwrap();

        let open = store.open_record("alice").unwrap().unwrap();
        // RFC 3339 storage keeps sub-second precision.
        assert_eq!(open.in_time, at);
    }
}
