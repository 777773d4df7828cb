//! Raw system_settings rows. Typed access and the read cache live in
//! `crate::settings`; this layer only persists strings.

use super::Database;
use crate::error::{CoreError, Result};
use rusqlite::{params, Connection};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct SettingRow {
    pub key: String,
    pub value: String,
    pub value_type: String,
    pub description: String,
    pub editable: bool,
}

/// Recognized keys, their types, defaults, and operator descriptions.
/// Seeded once; later opens leave operator edits alone.
pub(crate) const DEFAULTS: &[(&str, &str, &str, &str)] = &[
    (
        "worker_concurrency",
        "number",
        "1",
        "Worker-pool parallelism, clamped to [1, 10]",
    ),
    (
        "job_delay_ms",
        "number",
        "5000",
        "Base delay applied to low/normal-priority jobs at enqueue",
    ),
    (
        "processing_delay_ms",
        "number",
        "2000",
        "Pacing between years inside a location-range job",
    ),
    (
        "refraction_coefficient",
        "number",
        "1.02",
        "Multiplier applied to atmospheric refraction",
    ),
    (
        "observer_eye_height_m",
        "number",
        "1.7",
        "Eye height stacked on site elevation for the apparent-elevation derivation",
    ),
    (
        "pearl_illumination_min",
        "number",
        "0.10",
        "Minimum Moon illumination fraction for a Pearl event",
    ),
    (
        "diamond_season_months",
        "json",
        "[10,11,12,1,2,3]",
        "Months in which the Diamond search runs",
    ),
];

pub(crate) fn seed_defaults(conn: &Connection) -> rusqlite::Result<()> {
    for (key, value_type, value, description) in DEFAULTS {
        conn.execute(
            "INSERT OR IGNORE INTO system_settings (key, value, value_type, description, editable)
             VALUES (?1, ?2, ?3, ?4, 1)",
            params![key, value, value_type, description],
        )?;
    }
    Ok(())
}

#[derive(Clone)]
pub struct SettingsRepo {
    db: Database,
}

impl SettingsRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.db.with(|c| {
            c.query_row(
                "SELECT value FROM system_settings WHERE key = ?1",
                params![key],
                |r| r.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let row = self.row(key)?;
        if !row.editable {
            return Err(CoreError::InvalidInput(format!("setting '{key}' is not editable")));
        }
        self.db.with(|c| {
            c.execute(
                "UPDATE system_settings SET value = ?2 WHERE key = ?1",
                params![key, value],
            )
        })?;
        Ok(())
    }

    pub fn row(&self, key: &str) -> Result<SettingRow> {
        self.db
            .with(|c| {
                c.query_row(
                    "SELECT key, value, value_type, description, editable
                     FROM system_settings WHERE key = ?1",
                    params![key],
                    map_row,
                )
            })
            .map_err(|e| match e {
                CoreError::Storage(rusqlite::Error::QueryReturnedNoRows) => {
                    CoreError::NotFound(format!("setting '{key}'"))
                }
                other => other,
            })
    }

    pub fn all(&self) -> Result<Vec<SettingRow>> {
        self.db.with(|c| {
            let mut stmt = c.prepare(
                "SELECT key, value, value_type, description, editable
                 FROM system_settings ORDER BY key",
            )?;
            let rows = stmt.query_map([], map_row)?;
            rows.collect()
        })
    }
}

fn map_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<SettingRow> {
    Ok(SettingRow {
        key: r.get(0)?,
        value: r.get(1)?,
        value_type: r.get(2)?,
        description: r.get(3)?,
        editable: r.get::<_, i64>(4)? != 0,
    })
}
