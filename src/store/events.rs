//! Event rows: the materialized Diamond/Pearl alignment table.

use super::locations::Location;
use super::Database;
use crate::error::{CoreError, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};

/// The four alignment kinds. Closed enumeration, persisted literally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    DiamondSunrise,
    DiamondSunset,
    PearlMoonrise,
    PearlMoonset,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::DiamondSunrise,
        EventKind::DiamondSunset,
        EventKind::PearlMoonrise,
        EventKind::PearlMoonset,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::DiamondSunrise => "diamond_sunrise",
            EventKind::DiamondSunset => "diamond_sunset",
            EventKind::PearlMoonrise => "pearl_moonrise",
            EventKind::PearlMoonset => "pearl_moonset",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "diamond_sunrise" => Ok(EventKind::DiamondSunrise),
            "diamond_sunset" => Ok(EventKind::DiamondSunset),
            "pearl_moonrise" => Ok(EventKind::PearlMoonrise),
            "pearl_moonset" => Ok(EventKind::PearlMoonset),
            other => Err(CoreError::InvalidInput(format!("unknown event kind '{other}'"))),
        }
    }

    pub fn is_diamond(&self) -> bool {
        matches!(self, EventKind::DiamondSunrise | EventKind::DiamondSunset)
    }
}

/// Ordinal quality band derived from the quality score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccuracyTier {
    Fair,
    Good,
    Excellent,
    Perfect,
}

impl AccuracyTier {
    pub fn from_quality(q: f64) -> Self {
        if q >= 0.90 {
            AccuracyTier::Perfect
        } else if q >= 0.75 {
            AccuracyTier::Excellent
        } else if q >= 0.50 {
            AccuracyTier::Good
        } else {
            AccuracyTier::Fair
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccuracyTier::Perfect => "perfect",
            AccuracyTier::Excellent => "excellent",
            AccuracyTier::Good => "good",
            AccuracyTier::Fair => "fair",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "perfect" => Ok(AccuracyTier::Perfect),
            "excellent" => Ok(AccuracyTier::Excellent),
            "good" => Ok(AccuracyTier::Good),
            "fair" => Ok(AccuracyTier::Fair),
            other => Err(CoreError::InvalidInput(format!("unknown accuracy tier '{other}'"))),
        }
    }
}

/// One alignment as produced by the finder, before persistence.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub kind: EventKind,
    pub time: DateTime<Utc>,
    pub azimuth_deg: f64,
    pub altitude_deg: f64,
    pub moon_phase: Option<f64>,
    pub moon_illumination: Option<f64>,
    pub quality_score: f64,
    pub tier: AccuracyTier,
}

/// A persisted alignment row.
#[derive(Debug, Clone, Serialize)]
pub struct StoredEvent {
    pub id: i64,
    pub location_id: i64,
    pub kind: EventKind,
    pub event_date: NaiveDate,
    pub event_time: DateTime<Utc>,
    pub azimuth_deg: f64,
    pub altitude_deg: f64,
    pub moon_phase: Option<f64>,
    pub moon_illumination: Option<f64>,
    pub quality_score: f64,
    pub tier: AccuracyTier,
    pub calculation_year: i32,
}

/// Read-side shape: event joined with its location.
#[derive(Debug, Clone, Serialize)]
pub struct EventWithLocation {
    pub event: StoredEvent,
    pub location: Location,
}

#[derive(Clone)]
pub struct EventRepo {
    db: Database,
}

impl EventRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Upsert one event on the uniqueness key, atomically replacing the
    /// mutable fields.
    pub fn upsert(
        &self,
        location_id: i64,
        date: NaiveDate,
        draft: &EventDraft,
        calculation_year: i32,
    ) -> Result<()> {
        self.db.with(|c| {
            insert_draft(c, location_id, date, draft, calculation_year)?;
            Ok(())
        })
    }

    /// Replace the full event set of one (location, JST day) in a
    /// single transaction: the day's previous rows vanish, the
    /// recomputed set lands, and readers only ever see one of the two
    /// complete sets.
    pub fn replace_day(
        &self,
        location_id: i64,
        date: NaiveDate,
        drafts: &[EventDraft],
        calculation_year: i32,
    ) -> Result<()> {
        self.db.with_tx(|tx| {
            tx.execute(
                "DELETE FROM location_events WHERE location_id = ?1 AND event_date = ?2",
                params![location_id, date],
            )?;
            for draft in drafts {
                insert_draft(tx, location_id, date, draft, calculation_year)?;
            }
            Ok(())
        })
    }

    pub fn delete_for_location(&self, location_id: i64) -> Result<usize> {
        self.db.with(|c| {
            c.execute(
                "DELETE FROM location_events WHERE location_id = ?1",
                params![location_id],
            )
        })
    }

    /// Events in an inclusive JST date range, joined with locations,
    /// ordered by time. Range form so the calendar grid can pull the
    /// trailing/leading days of neighbouring months in one query.
    pub fn date_range(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<EventWithLocation>> {
        self.query_joined(
            "WHERE e.event_date >= ?1 AND e.event_date <= ?2 ORDER BY e.event_time",
            params![from, to],
        )
    }

    /// One JST day, ordered by time ascending.
    pub fn day(&self, date: NaiveDate) -> Result<Vec<EventWithLocation>> {
        self.query_joined("WHERE e.event_date = ?1 ORDER BY e.event_time", params![date])
    }

    /// Events at or after `now`, ascending, limited.
    pub fn upcoming(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<EventWithLocation>> {
        self.query_joined(
            "WHERE e.event_time >= ?1 ORDER BY e.event_time LIMIT ?2",
            params![now.timestamp(), limit],
        )
    }

    /// Full civil year of one location.
    pub fn location_year(&self, location_id: i64, year: i32) -> Result<Vec<EventWithLocation>> {
        let from = NaiveDate::from_ymd_opt(year, 1, 1).expect("valid year");
        let to = NaiveDate::from_ymd_opt(year, 12, 31).expect("valid year");
        self.query_joined(
            "WHERE e.location_id = ?1 AND e.event_date >= ?2 AND e.event_date <= ?3
             ORDER BY e.event_time",
            params![location_id, from, to],
        )
    }

    /// Per-kind counts for a civil year.
    pub fn yearly_counts(&self, year: i32) -> Result<Vec<(EventKind, u32)>> {
        let from = NaiveDate::from_ymd_opt(year, 1, 1).expect("valid year");
        let to = NaiveDate::from_ymd_opt(year, 12, 31).expect("valid year");
        self.db.with(|c| {
            let mut stmt = c.prepare(
                "SELECT event_kind, count(*) FROM location_events
                 WHERE event_date >= ?1 AND event_date <= ?2
                 GROUP BY event_kind",
            )?;
            let rows = stmt.query_map(params![from, to], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, u32>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (kind, n) = row?;
                if let Ok(kind) = EventKind::parse(&kind) {
                    out.push((kind, n));
                }
            }
            Ok(out)
        })
    }

    /// Count of distinct locations carrying at least one event in a year.
    pub fn active_location_count(&self, year: i32) -> Result<u32> {
        let from = NaiveDate::from_ymd_opt(year, 1, 1).expect("valid year");
        let to = NaiveDate::from_ymd_opt(year, 12, 31).expect("valid year");
        self.db.with(|c| {
            c.query_row(
                "SELECT count(DISTINCT location_id) FROM location_events
                 WHERE event_date >= ?1 AND event_date <= ?2",
                params![from, to],
                |r| r.get(0),
            )
        })
    }

    /// Whether a location has any event inside one civil month.
    pub fn has_events_in_month(&self, location_id: i64, year: i32, month: u32) -> Result<bool> {
        let from = NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or_else(|| CoreError::InvalidInput(format!("bad month {year}-{month}")))?;
        let to = last_day_of_month(year, month);
        let n: u32 = self.db.with(|c| {
            c.query_row(
                "SELECT count(*) FROM location_events
                 WHERE location_id = ?1 AND event_date >= ?2 AND event_date <= ?3",
                params![location_id, from, to],
                |r| r.get(0),
            )
        })?;
        Ok(n > 0)
    }

    pub fn count_for_location(&self, location_id: i64) -> Result<u32> {
        self.db.with(|c| {
            c.query_row(
                "SELECT count(*) FROM location_events WHERE location_id = ?1",
                params![location_id],
                |r| r.get(0),
            )
        })
    }

    fn query_joined(
        &self,
        tail: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<EventWithLocation>> {
        let sql = format!(
            "SELECT e.id, e.location_id, e.event_kind, e.event_date, e.event_time,
                    e.celestial_azimuth_deg, e.celestial_altitude_deg,
                    e.moon_phase, e.moon_illumination_fraction,
                    e.quality_score, e.accuracy_tier, e.calculation_year,
                    l.id, l.name, l.prefecture, l.latitude, l.longitude, l.elevation,
                    l.note, l.fuji_bearing_deg, l.fuji_apparent_elevation_deg, l.fuji_distance_m
             FROM location_events e
             JOIN locations l ON l.id = e.location_id
             {tail}"
        );
        self.db.with(|c| {
            let mut stmt = c.prepare(&sql)?;
            let rows = stmt.query_map(params, map_joined)?;
            rows.collect()
        })
    }
}

fn insert_draft(
    conn: &rusqlite::Connection,
    location_id: i64,
    date: NaiveDate,
    draft: &EventDraft,
    calculation_year: i32,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO location_events (location_id, event_kind, event_date, event_time,
             celestial_azimuth_deg, celestial_altitude_deg, moon_phase,
             moon_illumination_fraction, quality_score, accuracy_tier,
             calculation_year, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT (location_id, event_date, event_time, event_kind) DO UPDATE SET
             celestial_azimuth_deg = excluded.celestial_azimuth_deg,
             celestial_altitude_deg = excluded.celestial_altitude_deg,
             moon_phase = excluded.moon_phase,
             moon_illumination_fraction = excluded.moon_illumination_fraction,
             quality_score = excluded.quality_score,
             accuracy_tier = excluded.accuracy_tier,
             calculation_year = excluded.calculation_year",
        params![
            location_id,
            draft.kind.as_str(),
            date,
            draft.time.timestamp(),
            draft.azimuth_deg,
            draft.altitude_deg,
            draft.moon_phase,
            draft.moon_illumination,
            draft.quality_score,
            draft.tier.as_str(),
            calculation_year,
            Utc::now().timestamp(),
        ],
    )?;
    Ok(())
}

fn map_joined(row: &Row<'_>) -> rusqlite::Result<EventWithLocation> {
    let kind: String = row.get(2)?;
    let tier: String = row.get(10)?;
    let event = StoredEvent {
        id: row.get(0)?,
        location_id: row.get(1)?,
        kind: EventKind::parse(&kind).map_err(|_| rusqlite::Error::InvalidQuery)?,
        event_date: row.get(3)?,
        event_time: Utc
            .timestamp_opt(row.get::<_, i64>(4)?, 0)
            .single()
            .ok_or(rusqlite::Error::InvalidQuery)?,
        azimuth_deg: row.get(5)?,
        altitude_deg: row.get(6)?,
        moon_phase: row.get(7)?,
        moon_illumination: row.get(8)?,
        quality_score: row.get(9)?,
        tier: AccuracyTier::parse(&tier).map_err(|_| rusqlite::Error::InvalidQuery)?,
        calculation_year: row.get(11)?,
    };

    // Location columns start at index 12.
    let location = Location {
        id: row.get(12)?,
        name: row.get(13)?,
        prefecture: row.get(14)?,
        latitude: row.get(15)?,
        longitude: row.get(16)?,
        elevation_m: row.get(17)?,
        note: row.get(18)?,
        fuji_bearing_deg: row.get(19)?,
        fuji_apparent_elevation_deg: row.get(20)?,
        fuji_distance_m: row.get(21)?,
    };
    Ok(EventWithLocation { event, location })
}

fn last_day_of_month(year: i32, month: u32) -> NaiveDate {
    let (ny, nm) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(ny, nm, 1)
        .expect("valid month")
        .pred_opt()
        .expect("valid date")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::locations::{LocationInput, LocationRepo};
    use chrono::TimeZone;

    fn setup() -> (EventRepo, LocationRepo, i64) {
        let db = Database::open_in_memory().unwrap();
        let locations = LocationRepo::new(db.clone());
        let events = EventRepo::new(db);
        let loc = locations
            .insert(
                &LocationInput {
                    name: "竜ヶ岳".into(),
                    prefecture: "山梨県".into(),
                    latitude: 35.4513,
                    longitude: 138.5825,
                    elevation_m: 1485.0,
                    note: None,
                },
                1.7,
            )
            .unwrap();
        (events, locations, loc.id)
    }

    fn draft(kind: EventKind, time: DateTime<Utc>, q: f64) -> EventDraft {
        let pearl = !kind.is_diamond();
        EventDraft {
            kind,
            time,
            azimuth_deg: 100.0,
            altitude_deg: 8.0,
            moon_phase: pearl.then_some(0.45),
            moon_illumination: pearl.then_some(0.9),
            quality_score: q,
            tier: AccuracyTier::from_quality(q),
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_upsert_replaces_not_duplicates() {
        let (events, _, loc) = setup();
        let t = Utc.with_ymd_and_hms(2025, 12, 1, 22, 10, 0).unwrap();
        let d = date(2025, 12, 2);

        events.upsert(loc, d, &draft(EventKind::DiamondSunrise, t, 0.95), 2025).unwrap();
        events.upsert(loc, d, &draft(EventKind::DiamondSunrise, t, 0.55), 2025).unwrap();

        let day = events.day(d).unwrap();
        assert_eq!(day.len(), 1, "same uniqueness key must collapse");
        assert!((day[0].event.quality_score - 0.55).abs() < 1e-9);
        assert_eq!(day[0].event.tier, AccuracyTier::Good);
    }

    #[test]
    fn test_replace_day_shrinks_over_emission() {
        let (events, _, loc) = setup();
        let d = date(2025, 12, 2);
        let t1 = Utc.with_ymd_and_hms(2025, 12, 1, 22, 10, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2025, 12, 2, 7, 30, 0).unwrap();

        events
            .replace_day(
                loc,
                d,
                &[
                    draft(EventKind::DiamondSunrise, t1, 0.9),
                    draft(EventKind::PearlMoonset, t2, 0.8),
                ],
                2025,
            )
            .unwrap();
        assert_eq!(events.day(d).unwrap().len(), 2);

        // Re-run converges on the smaller set.
        events
            .replace_day(loc, d, &[draft(EventKind::DiamondSunrise, t1, 0.9)], 2025)
            .unwrap();
        let day = events.day(d).unwrap();
        assert_eq!(day.len(), 1);
        assert_eq!(day[0].event.kind, EventKind::DiamondSunrise);
    }

    #[test]
    fn test_cascade_delete() {
        let (events, locations, loc) = setup();
        let t = Utc.with_ymd_and_hms(2025, 12, 1, 22, 10, 0).unwrap();
        events.upsert(loc, date(2025, 12, 2), &draft(EventKind::DiamondSunrise, t, 0.9), 2025).unwrap();
        assert_eq!(events.count_for_location(loc).unwrap(), 1);

        locations.delete(loc).unwrap();
        assert_eq!(events.count_for_location(loc).unwrap(), 0);
    }

    #[test]
    fn test_queries_by_range_day_upcoming() {
        let (events, _, loc) = setup();
        for day in 1..=5 {
            let t = Utc.with_ymd_and_hms(2025, 12, day, 22, 10, 0).unwrap();
            events
                .upsert(loc, date(2025, 12, day + 1), &draft(EventKind::DiamondSunrise, t, 0.9), 2025)
                .unwrap();
        }

        let range = events.date_range(date(2025, 12, 2), date(2025, 12, 4)).unwrap();
        assert_eq!(range.len(), 3);
        assert!(range.windows(2).all(|w| w[0].event.event_time <= w[1].event.event_time));

        let day = events.day(date(2025, 12, 3)).unwrap();
        assert_eq!(day.len(), 1);

        let now = Utc.with_ymd_and_hms(2025, 12, 3, 0, 0, 0).unwrap();
        let upcoming = events.upcoming(now, 2).unwrap();
        assert_eq!(upcoming.len(), 2);
        assert!(upcoming[0].event.event_time >= now);
    }

    #[test]
    fn test_yearly_counts_and_active_locations() {
        let (events, _, loc) = setup();
        let t1 = Utc.with_ymd_and_hms(2025, 12, 1, 22, 10, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2025, 12, 1, 9, 0, 0).unwrap();
        events.upsert(loc, date(2025, 12, 2), &draft(EventKind::DiamondSunrise, t1, 0.9), 2025).unwrap();
        events.upsert(loc, date(2025, 12, 1), &draft(EventKind::PearlMoonset, t2, 0.7), 2025).unwrap();

        let counts = events.yearly_counts(2025).unwrap();
        let total: u32 = counts.iter().map(|(_, n)| n).sum();
        assert_eq!(total, 2);
        assert_eq!(events.active_location_count(2025).unwrap(), 1);
        assert_eq!(events.active_location_count(2024).unwrap(), 0);
    }

    #[test]
    fn test_has_events_in_month() {
        let (events, _, loc) = setup();
        let t = Utc.with_ymd_and_hms(2025, 12, 1, 22, 10, 0).unwrap();
        events.upsert(loc, date(2025, 12, 2), &draft(EventKind::DiamondSunrise, t, 0.9), 2025).unwrap();
        assert!(events.has_events_in_month(loc, 2025, 12).unwrap());
        assert!(!events.has_events_in_month(loc, 2026, 1).unwrap());
    }

    #[test]
    fn test_tier_thresholds() {
        assert_eq!(AccuracyTier::from_quality(0.95), AccuracyTier::Perfect);
        assert_eq!(AccuracyTier::from_quality(0.90), AccuracyTier::Perfect);
        assert_eq!(AccuracyTier::from_quality(0.80), AccuracyTier::Excellent);
        assert_eq!(AccuracyTier::from_quality(0.60), AccuracyTier::Good);
        assert_eq!(AccuracyTier::from_quality(0.10), AccuracyTier::Fair);
    }
}
