//! Schema bootstrap.
//!
//! Idempotent: every statement is `IF NOT EXISTS`, so opening an existing
//! database is a no-op. The partial unique index on `location_records`
//! enforces the at-most-one-open-record invariant at the storage layer.

use rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS geofence_areas (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    latitude    REAL NOT NULL,
    longitude   REAL NOT NULL,
    radius_m    REAL NOT NULL,
    owner_id    TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS location_records (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id       TEXT NOT NULL,
    area_id       INTEGER NOT NULL,
    area_name     TEXT NOT NULL,
    in_latitude   REAL NOT NULL,
    in_longitude  REAL NOT NULL,
    in_time       TEXT NOT NULL,
    out_latitude  REAL,
    out_longitude REAL,
    out_time      TEXT,
    disconnected  INTEGER NOT NULL DEFAULT 0,
    switched      INTEGER NOT NULL DEFAULT 0
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_open_record_per_user
    ON location_records(user_id) WHERE disconnected = 0;

CREATE INDEX IF NOT EXISTS idx_records_by_user
    ON location_records(user_id, in_time);

CREATE TABLE IF NOT EXISTS membership_edges (
    user_id  TEXT NOT NULL,
    area_id  INTEGER NOT NULL,
    UNIQUE (user_id, area_id)
);

CREATE TABLE IF NOT EXISTS fraud_events (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id          TEXT NOT NULL,
    fence_id         INTEGER NOT NULL,
    old_fingerprint  TEXT NOT NULL,
    new_fingerprint  TEXT NOT NULL,
    created_at       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS event_queue (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    payload      TEXT NOT NULL,
    enqueued_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS dead_letter_queue (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    payload    TEXT NOT NULL,
    error      TEXT NOT NULL,
    failed_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS presence (
    user_id    TEXT PRIMARY KEY,
    area_id    INTEGER NOT NULL,
    area_name  TEXT NOT NULL,
    since      TEXT NOT NULL
);
";

pub(crate) fn init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)
}
