//! Fence storage.
//!
//! Fences are administered out of band and read-only on the sample path.
//! Containment checks load live geometry through [`SqliteStore::load_fences`];
//! payload enrichment goes through the TTL fence cache instead.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::records::parse_timestamp;
use super::{SqliteStore, StoreError};
use crate::fence::GeofenceArea;
use crate::geo::Coordinate;

const FENCE_COLUMNS: &str = "id, name, latitude, longitude, radius_m, owner_id, created_at";

impl SqliteStore {
    /// Creates a fence and returns it with its assigned id.
    pub fn insert_fence(
        &self,
        name: &str,
        center: Coordinate,
        radius_m: f64,
        owner_id: &str,
    ) -> Result<GeofenceArea, StoreError> {
        if !(radius_m > 0.0) {
            return Err(StoreError::InvalidRadius(radius_m));
        }
        let created_at = Utc::now();
        let conn = self.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO geofence_areas (name, latitude, longitude, radius_m, owner_id, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                name,
                center.latitude,
                center.longitude,
                radius_m,
                owner_id,
                created_at.to_rfc3339()
            ],
        )?;
        Ok(GeofenceArea {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            center,
            radius_m,
            owner_id: owner_id.to_string(),
            created_at,
        })
    }

    /// Loads every fence. This is the live-geometry read used for
    /// containment checks on each sample.
    pub fn load_fences(&self) -> Result<Vec<GeofenceArea>, StoreError> {
        let conn = self.connection();
        let conn = conn.lock();
        let sql = format!("SELECT {FENCE_COLUMNS} FROM geofence_areas ORDER BY id");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], fence_from_row)?;
        let mut fences = Vec::new();
        for row in rows {
            fences.push(row?);
        }
        Ok(fences)
    }

    /// Looks up a single fence by id.
    pub fn fence_by_id(&self, id: i64) -> Result<Option<GeofenceArea>, StoreError> {
        let conn = self.connection();
        let conn = conn.lock();
        let sql = format!("SELECT {FENCE_COLUMNS} FROM geofence_areas WHERE id = ?1");
        Ok(conn.query_row(&sql, params![id], fence_from_row).optional()?)
    }

    /// Updates a fence's name and geometry. Out-of-band administration;
    /// running engines observe the change after their fence cache TTL.
    pub fn update_fence(&self, fence: &GeofenceArea) -> Result<bool, StoreError> {
        if !(fence.radius_m > 0.0) {
            return Err(StoreError::InvalidRadius(fence.radius_m));
        }
        let conn = self.connection();
        let conn = conn.lock();
        let updated = conn.execute(
            "UPDATE geofence_areas SET name = ?1, latitude = ?2, longitude = ?3, radius_m = ?4 \
             WHERE id = ?5",
            params![
                fence.name,
                fence.center.latitude,
                fence.center.longitude,
                fence.radius_m,
                fence.id
            ],
        )?;
        Ok(updated > 0)
    }

    /// Deletes a fence. Returns false when no such fence existed.
    pub fn delete_fence(&self, id: i64) -> Result<bool, StoreError> {
        let conn = self.connection();
        let conn = conn.lock();
        let deleted = conn.execute("DELETE FROM geofence_areas WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }
}

fn fence_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<GeofenceArea> {
    let created_raw: String = row.get(6)?;
    Ok(GeofenceArea {
        id: row.get(0)?,
        name: row.get(1)?,
        center: Coordinate {
            latitude: row.get(2)?,
            longitude: row.get(3)?,
        },
        radius_m: row.get(4)?,
        owner_id: row.get(5)?,
        created_at: parse_timestamp(6, created_raw)?,
    })
}
