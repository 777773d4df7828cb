//! Relational store: SQLite behind a shared handle, one small
//! repository per table. The schema here is the public contract; the
//! driver is an implementation detail.

pub mod admins;
pub mod events;
pub mod locations;
pub mod settings;

use crate::error::Result;
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS locations (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    prefecture TEXT NOT NULL,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    elevation REAL NOT NULL,
    note TEXT,
    fuji_bearing_deg REAL NOT NULL,
    fuji_apparent_elevation_deg REAL NOT NULL,
    fuji_distance_m REAL NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_locations_coords ON locations (latitude, longitude);
CREATE INDEX IF NOT EXISTS idx_locations_prefecture ON locations (prefecture);
CREATE INDEX IF NOT EXISTS idx_locations_fuji_geom
    ON locations (fuji_bearing_deg, fuji_apparent_elevation_deg);

CREATE TABLE IF NOT EXISTS location_events (
    id INTEGER PRIMARY KEY,
    location_id INTEGER NOT NULL
        REFERENCES locations (id) ON DELETE CASCADE,
    event_kind TEXT NOT NULL CHECK (event_kind IN
        ('diamond_sunrise', 'diamond_sunset', 'pearl_moonrise', 'pearl_moonset')),
    event_date TEXT NOT NULL,
    event_time INTEGER NOT NULL,
    celestial_azimuth_deg REAL NOT NULL,
    celestial_altitude_deg REAL NOT NULL,
    moon_phase REAL,
    moon_illumination_fraction REAL,
    quality_score REAL NOT NULL,
    accuracy_tier TEXT NOT NULL CHECK (accuracy_tier IN
        ('perfect', 'excellent', 'good', 'fair')),
    calculation_year INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE (location_id, event_date, event_time, event_kind)
);
CREATE INDEX IF NOT EXISTS idx_events_date ON location_events (event_date);
CREATE INDEX IF NOT EXISTS idx_events_kind_date ON location_events (event_kind, event_date);
CREATE INDEX IF NOT EXISTS idx_events_location_date ON location_events (location_id, event_date);
CREATE INDEX IF NOT EXISTS idx_events_quality ON location_events (quality_score DESC);

CREATE TABLE IF NOT EXISTS admins (
    id INTEGER PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    email TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS system_settings (
    key TEXT NOT NULL UNIQUE,
    value TEXT NOT NULL,
    value_type TEXT NOT NULL,
    description TEXT NOT NULL,
    editable INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    dedup_key TEXT NOT NULL,
    location_id INTEGER NOT NULL,
    priority INTEGER NOT NULL,
    state TEXT NOT NULL CHECK (state IN
        ('waiting', 'active', 'completed', 'failed', 'delayed')),
    not_before INTEGER NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    last_error TEXT,
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    finished_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_jobs_drain ON jobs (state, priority DESC, not_before, id);
CREATE INDEX IF NOT EXISTS idx_jobs_dedup ON jobs (dedup_key)
    WHERE state IN ('waiting', 'delayed');
"#;

/// Shared database handle. Cheap to clone; every access serializes on
/// one connection, which keeps transactions simple and is plenty for
/// the write rates this pipeline sees.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        Self::from_connection(Connection::open(path)?)
    }

    /// Private in-memory database; used throughout the test suites.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        settings::seed_defaults(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Run a read or single-statement write against the connection.
    pub(crate) fn with<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        Ok(f(&conn)?)
    }

    /// Run a closure inside one transaction; commits on Ok.
    pub(crate) fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock().expect("database mutex poisoned");
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}
