//! Location rows and their derived summit geometry.
//!
//! The derived triple (bearing, apparent elevation, distance) is cached
//! alongside the geodetic base fields and recomputed whenever any of
//! them changes. A read that finds the triple out of step with the base
//! fields refuses to serve the row (`StaleDerivedGeometry`); the
//! scheduler reconciles and re-enqueues.

use super::Database;
use crate::astro::{geometry, Observer};
use crate::error::{CoreError, Result};
use chrono::Utc;
use rusqlite::{params, Row};
use serde::Serialize;

// Staleness thresholds: generous enough to tolerate eye-height tuning,
// tight enough that any real edit of a base field trips them.
const BEARING_EPS_DEG: f64 = 0.01;
const ELEVATION_EPS_DEG: f64 = 0.05;
const DISTANCE_EPS_M: f64 = 50.0;

#[derive(Debug, Clone, Serialize)]
pub struct Location {
    pub id: i64,
    pub name: String,
    pub prefecture: String,
    pub latitude: f64,
    pub longitude: f64,
    pub elevation_m: f64,
    pub note: Option<String>,
    pub fuji_bearing_deg: f64,
    pub fuji_apparent_elevation_deg: f64,
    pub fuji_distance_m: f64,
}

impl Location {
    pub fn observer(&self) -> Result<Observer> {
        Observer::new(self.latitude, self.longitude, self.elevation_m)
    }
}

/// Input for create/update; the derived triple is never accepted from
/// the outside.
#[derive(Debug, Clone)]
pub struct LocationInput {
    pub name: String,
    pub prefecture: String,
    pub latitude: f64,
    pub longitude: f64,
    pub elevation_m: f64,
    pub note: Option<String>,
}

/// (bearing, apparent elevation, distance) derived from the base fields.
pub fn derive_geometry(input: &LocationInput, eye_height_m: f64) -> Result<(f64, f64, f64)> {
    let obs = Observer::new(input.latitude, input.longitude, input.elevation_m)?;
    Ok((
        geometry::bearing_to_fuji(&obs),
        geometry::apparent_elevation_to_fuji(&obs, eye_height_m),
        geometry::distance_to_fuji_m(&obs),
    ))
}

#[derive(Clone)]
pub struct LocationRepo {
    db: Database,
}

impl LocationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn insert(&self, input: &LocationInput, eye_height_m: f64) -> Result<Location> {
        let (bearing, elev, dist) = derive_geometry(input, eye_height_m)?;
        let now = Utc::now().timestamp();
        let id = self.db.with(|c| {
            c.execute(
                "INSERT INTO locations (name, prefecture, latitude, longitude, elevation, note,
                 fuji_bearing_deg, fuji_apparent_elevation_deg, fuji_distance_m,
                 created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                params![
                    input.name,
                    input.prefecture,
                    input.latitude,
                    input.longitude,
                    input.elevation_m,
                    input.note,
                    bearing,
                    elev,
                    dist,
                    now
                ],
            )?;
            Ok(c.last_insert_rowid())
        })?;
        self.get(id)
    }

    /// Full-row update. Returns the fresh row and whether any geodetic
    /// base field changed (the caller decides about purging events).
    pub fn update(&self, id: i64, input: &LocationInput, eye_height_m: f64) -> Result<(Location, bool)> {
        let before = self.get_unchecked(id)?;
        let geodetic_changed = before.latitude != input.latitude
            || before.longitude != input.longitude
            || before.elevation_m != input.elevation_m;

        let (bearing, elev, dist) = derive_geometry(input, eye_height_m)?;
        let now = Utc::now().timestamp();
        self.db.with(|c| {
            c.execute(
                "UPDATE locations SET name = ?2, prefecture = ?3, latitude = ?4, longitude = ?5,
                 elevation = ?6, note = ?7, fuji_bearing_deg = ?8,
                 fuji_apparent_elevation_deg = ?9, fuji_distance_m = ?10, updated_at = ?11
                 WHERE id = ?1",
                params![
                    id,
                    input.name,
                    input.prefecture,
                    input.latitude,
                    input.longitude,
                    input.elevation_m,
                    input.note,
                    bearing,
                    elev,
                    dist,
                    now
                ],
            )
        })?;
        Ok((self.get(id)?, geodetic_changed))
    }

    pub fn delete(&self, id: i64) -> Result<()> {
        let n = self
            .db
            .with(|c| c.execute("DELETE FROM locations WHERE id = ?1", params![id]))?;
        if n == 0 {
            return Err(CoreError::NotFound(format!("location {id}")));
        }
        Ok(())
    }

    /// Fetch with the derived-geometry consistency check.
    pub fn get(&self, id: i64) -> Result<Location> {
        let loc = self.get_unchecked(id)?;
        self.verify_derived(&loc)?;
        Ok(loc)
    }

    /// Fetch without the staleness check; reconciliation needs the raw row.
    pub fn get_unchecked(&self, id: i64) -> Result<Location> {
        self.db
            .with(|c| {
                c.query_row(
                    &format!("SELECT {COLUMNS} FROM locations WHERE id = ?1"),
                    params![id],
                    map_location,
                )
            })
            .map_err(|e| match e {
                CoreError::Storage(rusqlite::Error::QueryReturnedNoRows) => {
                    CoreError::NotFound(format!("location {id}"))
                }
                other => other,
            })
    }

    pub fn list(&self) -> Result<Vec<Location>> {
        self.db.with(|c| {
            let mut stmt = c.prepare(&format!("SELECT {COLUMNS} FROM locations ORDER BY id"))?;
            let rows = stmt.query_map([], map_location)?;
            rows.collect()
        })
    }

    /// Recompute the derived triple from the base fields in place.
    pub fn reconcile(&self, id: i64, eye_height_m: f64) -> Result<Location> {
        let loc = self.get_unchecked(id)?;
        let input = LocationInput {
            name: loc.name.clone(),
            prefecture: loc.prefecture.clone(),
            latitude: loc.latitude,
            longitude: loc.longitude,
            elevation_m: loc.elevation_m,
            note: loc.note.clone(),
        };
        let (bearing, elev, dist) = derive_geometry(&input, eye_height_m)?;
        self.db.with(|c| {
            c.execute(
                "UPDATE locations SET fuji_bearing_deg = ?2, fuji_apparent_elevation_deg = ?3,
                 fuji_distance_m = ?4, updated_at = ?5 WHERE id = ?1",
                params![id, bearing, elev, dist, Utc::now().timestamp()],
            )
        })?;
        self.get(id)
    }

    fn verify_derived(&self, loc: &Location) -> Result<()> {
        let input = LocationInput {
            name: String::new(),
            prefecture: String::new(),
            latitude: loc.latitude,
            longitude: loc.longitude,
            elevation_m: loc.elevation_m,
            note: None,
        };
        // Eye height only nudges the apparent elevation; the thresholds
        // absorb that, so the default is fine for the check.
        let (bearing, elev, dist) = derive_geometry(&input, 1.7)?;
        let stale = (bearing - loc.fuji_bearing_deg).abs() > BEARING_EPS_DEG
            || (elev - loc.fuji_apparent_elevation_deg).abs() > ELEVATION_EPS_DEG
            || (dist - loc.fuji_distance_m).abs() > DISTANCE_EPS_M;
        if stale {
            return Err(CoreError::StaleDerivedGeometry(loc.id));
        }
        Ok(())
    }
}

const COLUMNS: &str = "id, name, prefecture, latitude, longitude, elevation, note, \
     fuji_bearing_deg, fuji_apparent_elevation_deg, fuji_distance_m";

pub(crate) fn map_location(row: &Row<'_>) -> rusqlite::Result<Location> {
    Ok(Location {
        id: row.get(0)?,
        name: row.get(1)?,
        prefecture: row.get(2)?,
        latitude: row.get(3)?,
        longitude: row.get(4)?,
        elevation_m: row.get(5)?,
        note: row.get(6)?,
        fuji_bearing_deg: row.get(7)?,
        fuji_apparent_elevation_deg: row.get(8)?,
        fuji_distance_m: row.get(9)?,
    })
}
