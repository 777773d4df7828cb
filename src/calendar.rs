//! Calendar query facade: the read side consumed by the external HTTP
//! layer. Join, sort, bucket by JST date — no business logic.

use crate::error::Result;
use crate::jst;
use crate::store::events::{EventKind, EventRepo, EventWithLocation};
use chrono::{Datelike, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize)]
pub struct CalendarDay {
    pub date: NaiveDate,
    pub kinds_present: Vec<EventKind>,
    pub events: Vec<EventWithLocation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonthlyCalendar {
    pub year: i32,
    pub month: u32,
    pub days: Vec<CalendarDay>,
}

#[derive(Debug, Clone, Serialize)]
pub struct YearlyStats {
    pub total: u32,
    pub diamond_total: u32,
    pub pearl_total: u32,
    pub active_location_count: u32,
}

#[derive(Clone)]
pub struct CalendarService {
    events: EventRepo,
}

impl CalendarService {
    pub fn new(events: EventRepo) -> Self {
        Self { events }
    }

    /// Month view over the full calendar grid: first Sunday on/before
    /// the 1st through last Saturday on/after end-of-month, so the
    /// trailing and leading days of neighbouring months come filled.
    pub fn monthly_calendar(&self, year: i32, month: u32) -> Result<MonthlyCalendar> {
        let first = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(|| {
            crate::error::CoreError::InvalidInput(format!("bad month {year}-{month}"))
        })?;
        let last = end_of_month(first);

        let grid_start = first - Duration::days(first.weekday().num_days_from_sunday() as i64);
        let grid_end = last + Duration::days((6 - last.weekday().num_days_from_sunday()) as i64);

        let rows = self.events.date_range(grid_start, grid_end)?;
        let mut by_day: BTreeMap<NaiveDate, Vec<EventWithLocation>> = BTreeMap::new();
        for row in rows {
            by_day.entry(row.event.event_date).or_default().push(row);
        }

        let mut days = Vec::new();
        let mut date = grid_start;
        while date <= grid_end {
            let events = by_day.remove(&date).unwrap_or_default();
            let mut kinds_present: Vec<EventKind> =
                events.iter().map(|e| e.event.kind).collect();
            kinds_present.sort_by_key(|k| k.as_str());
            kinds_present.dedup();
            days.push(CalendarDay { date, kinds_present, events });
            date = date.succ_opt().expect("grid within valid dates");
        }

        Ok(MonthlyCalendar { year, month, days })
    }

    /// One JST day, ascending by time.
    pub fn day_events(&self, date: NaiveDate) -> Result<Vec<EventWithLocation>> {
        self.events.day(date)
    }

    /// The next `limit` events from now on.
    pub fn upcoming(&self, limit: u32) -> Result<Vec<EventWithLocation>> {
        self.events.upcoming(Utc::now(), limit)
    }

    pub fn location_year(&self, location_id: i64, year: i32) -> Result<Vec<EventWithLocation>> {
        self.events.location_year(location_id, year)
    }

    pub fn yearly_stats(&self, year: i32) -> Result<YearlyStats> {
        let counts = self.events.yearly_counts(year)?;
        let mut diamond_total = 0;
        let mut pearl_total = 0;
        for (kind, n) in counts {
            if kind.is_diamond() {
                diamond_total += n;
            } else {
                pearl_total += n;
            }
        }
        Ok(YearlyStats {
            total: diamond_total + pearl_total,
            diamond_total,
            pearl_total,
            active_location_count: self.events.active_location_count(year)?,
        })
    }
}

fn end_of_month(first: NaiveDate) -> NaiveDate {
    let (y, m) = if first.month() == 12 {
        (first.year() + 1, 1)
    } else {
        (first.year(), first.month() + 1)
    };
    NaiveDate::from_ymd_opt(y, m, 1)
        .expect("valid month")
        .pred_opt()
        .expect("valid date")
}

/// JST civil date for "today" as the HTTP layer sees it.
pub fn today_jst() -> NaiveDate {
    jst::civil_date(Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::events::{AccuracyTier, EventDraft};
    use crate::store::locations::{LocationInput, LocationRepo};
    use crate::store::Database;
    use chrono::{TimeZone, Weekday};

    fn service() -> (CalendarService, EventRepo, i64) {
        let db = Database::open_in_memory().unwrap();
        let locations = LocationRepo::new(db.clone());
        let events = EventRepo::new(db);
        let loc = locations
            .insert(
                &LocationInput {
                    name: "高尾山".into(),
                    prefecture: "東京都".into(),
                    latitude: 35.6251,
                    longitude: 139.2435,
                    elevation_m: 599.0,
                    note: None,
                },
                1.7,
            )
            .unwrap();
        (CalendarService::new(events.clone()), events, loc.id)
    }

    fn seed(events: &EventRepo, loc: i64, y: i32, m: u32, d: u32, kind: EventKind) {
        let t = Utc.with_ymd_and_hms(y, m, d, 8, 0, 0).unwrap();
        events
            .upsert(
                loc,
                NaiveDate::from_ymd_opt(y, m, d).unwrap(),
                &EventDraft {
                    kind,
                    time: t,
                    azimuth_deg: 245.0,
                    altitude_deg: 2.0,
                    moon_phase: (!kind.is_diamond()).then_some(0.5),
                    moon_illumination: (!kind.is_diamond()).then_some(0.98),
                    quality_score: 0.85,
                    tier: AccuracyTier::Excellent,
                },
                y,
            )
            .unwrap();
    }

    #[test]
    fn test_grid_spans_sunday_to_saturday() {
        let (cal, _, _) = service();
        let month = cal.monthly_calendar(2025, 3).unwrap();

        let first = month.days.first().unwrap().date;
        let last = month.days.last().unwrap().date;
        assert_eq!(first.weekday(), Weekday::Sun);
        assert_eq!(last.weekday(), Weekday::Sat);
        // March 2025 opens on a Saturday: the grid reaches back into
        // February and forward into April.
        assert_eq!(first, NaiveDate::from_ymd_opt(2025, 2, 23).unwrap());
        assert_eq!(last, NaiveDate::from_ymd_opt(2025, 4, 5).unwrap());
        assert_eq!(month.days.len() % 7, 0);
    }

    #[test]
    fn test_grid_includes_neighbouring_month_events() {
        let (cal, events, loc) = service();
        seed(&events, loc, 2025, 2, 24, EventKind::DiamondSunset); // trailing Feb day
        seed(&events, loc, 2025, 3, 10, EventKind::DiamondSunset);
        seed(&events, loc, 2025, 4, 2, EventKind::PearlMoonrise); // leading Apr day

        let month = cal.monthly_calendar(2025, 3).unwrap();
        let populated: Vec<_> = month
            .days
            .iter()
            .filter(|d| !d.events.is_empty())
            .map(|d| d.date)
            .collect();
        assert_eq!(
            populated,
            vec![
                NaiveDate::from_ymd_opt(2025, 2, 24).unwrap(),
                NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
                NaiveDate::from_ymd_opt(2025, 4, 2).unwrap(),
            ]
        );
    }

    #[test]
    fn test_kinds_present_deduped() {
        let (cal, events, loc) = service();
        seed(&events, loc, 2025, 3, 10, EventKind::DiamondSunset);
        // Second sunset event at a different time, same kind.
        let t = Utc.with_ymd_and_hms(2025, 3, 10, 8, 30, 0).unwrap();
        events
            .upsert(
                loc,
                NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
                &EventDraft {
                    kind: EventKind::DiamondSunset,
                    time: t,
                    azimuth_deg: 246.0,
                    altitude_deg: 2.1,
                    moon_phase: None,
                    moon_illumination: None,
                    quality_score: 0.6,
                    tier: AccuracyTier::Good,
                },
                2025,
            )
            .unwrap();
        seed(&events, loc, 2025, 3, 10, EventKind::PearlMoonset);

        let month = cal.monthly_calendar(2025, 3).unwrap();
        let day = month
            .days
            .iter()
            .find(|d| d.date == NaiveDate::from_ymd_opt(2025, 3, 10).unwrap())
            .unwrap();
        assert_eq!(day.events.len(), 3);
        assert_eq!(
            day.kinds_present,
            vec![EventKind::DiamondSunset, EventKind::PearlMoonset]
        );
    }

    #[test]
    fn test_yearly_stats_split() {
        let (cal, events, loc) = service();
        seed(&events, loc, 2025, 1, 10, EventKind::DiamondSunrise);
        seed(&events, loc, 2025, 2, 11, EventKind::DiamondSunset);
        seed(&events, loc, 2025, 3, 12, EventKind::PearlMoonrise);

        let stats = cal.yearly_stats(2025).unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.diamond_total, 2);
        assert_eq!(stats.pearl_total, 1);
        assert_eq!(stats.active_location_count, 1);
    }
}
