//! Scheduler & invalidator: turns location mutations into queue work
//! and keeps the rolling event horizon populated.
//!
//! Invalidation cascades down the tree: a geodetic change purges the
//! location's events before the recompute job is enqueued, so readers
//! never mix old geometry with new events.

use crate::error::{CoreError, Result};
use crate::jst;
use crate::queue::{JobPayload, JobQueue, Priority};
use crate::settings::RuntimeSettings;
use crate::store::events::EventRepo;
use crate::store::locations::{Location, LocationInput, LocationRepo};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Rolling horizon: a new or moved location gets the current year plus
/// this many following years.
const HORIZON_YEARS: i32 = 2;

/// Nightly maintenance wall-clock time, JST.
const NIGHTLY_HOUR: u32 = 2;

pub struct Scheduler {
    queue: JobQueue,
    locations: LocationRepo,
    events: EventRepo,
    settings: Arc<RuntimeSettings>,
}

impl Scheduler {
    pub fn new(
        queue: JobQueue,
        locations: LocationRepo,
        events: EventRepo,
        settings: Arc<RuntimeSettings>,
    ) -> Self {
        Self { queue, locations, events, settings }
    }

    /// Admin created a location: persist, then cover the rolling
    /// horizon. An enqueue failure is surfaced to the caller — the row
    /// stays, and a manual trigger repairs coverage.
    pub fn create_location(&self, input: &LocationInput) -> Result<Location> {
        let snapshot = self.settings.snapshot();
        let location = self.locations.insert(input, snapshot.observer_eye_height_m)?;
        let year = jst::civil_date(Utc::now()).year();
        self.enqueue(
            &JobPayload::LocationRange {
                location_id: location.id,
                year_from: year,
                year_to: year + HORIZON_YEARS,
            },
            Priority::Normal,
        )?;
        Ok(location)
    }

    /// Admin updated a location. A geodetic change invalidates every
    /// derived event immediately and recomputes at high priority;
    /// cosmetic edits touch nothing downstream.
    pub fn update_location(&self, id: i64, input: &LocationInput) -> Result<Location> {
        let snapshot = self.settings.snapshot();
        let (location, geodetic_changed) =
            self.locations.update(id, input, snapshot.observer_eye_height_m)?;
        if geodetic_changed {
            let purged = self.events.delete_for_location(id)?;
            tracing::info!(location_id = id, purged, "geodetic change purged events");
            let year = jst::civil_date(Utc::now()).year();
            self.enqueue(
                &JobPayload::LocationRange {
                    location_id: id,
                    year_from: year,
                    year_to: year + HORIZON_YEARS,
                },
                Priority::High,
            )?;
        }
        Ok(location)
    }

    /// Admin deleted a location: events cascade with the row; pending
    /// jobs are cancelled. Active jobs tolerate the vanished target.
    pub fn delete_location(&self, id: i64) -> Result<()> {
        self.locations.delete(id)?;
        let cancelled = self.queue.cancel_pending_for_location(id)?;
        if cancelled > 0 {
            tracing::info!(location_id = id, cancelled, "cancelled pending jobs for deleted location");
        }
        Ok(())
    }

    /// Manual admin trigger: recompute one location over a year range.
    pub fn trigger_location(&self, id: i64, year_from: i32, year_to: i32) -> Result<Option<i64>> {
        if year_to < year_from {
            return Err(CoreError::InvalidInput(format!(
                "empty year range {year_from}..{year_to}"
            )));
        }
        self.locations.get_unchecked(id)?;
        self.enqueue(
            &JobPayload::LocationRange { location_id: id, year_from, year_to },
            Priority::High,
        )
    }

    /// Fan out one range job per location.
    pub fn regenerate_all(&self, year_from: i32, year_to: i32) -> Result<usize> {
        let mut enqueued = 0;
        for location in self.locations.list()? {
            if self
                .trigger_location(location.id, year_from, year_to)?
                .is_some()
            {
                enqueued += 1;
            }
        }
        Ok(enqueued)
    }

    /// Re-derive a stale location's geometry and recompute its events.
    pub fn reconcile_location(&self, id: i64) -> Result<Location> {
        let snapshot = self.settings.snapshot();
        let location = self.locations.reconcile(id, snapshot.observer_eye_height_m)?;
        let year = jst::civil_date(Utc::now()).year();
        self.enqueue(
            &JobPayload::LocationRange {
                location_id: id,
                year_from: year,
                year_to: year + HORIZON_YEARS,
            },
            Priority::High,
        )?;
        Ok(location)
    }

    /// The 02:00 JST pass: any location with an empty next month gets a
    /// low-priority monthly job.
    pub fn nightly_pass(&self, today_jst: NaiveDate) -> Result<usize> {
        let (year, month) = next_month(today_jst);
        let mut enqueued = 0;
        for location in self.locations.list()? {
            if !self.events.has_events_in_month(location.id, year, month)? {
                let accepted = self.enqueue(
                    &JobPayload::MonthlyRange { location_id: location.id, year, month },
                    Priority::Low,
                )?;
                if accepted.is_some() {
                    enqueued += 1;
                }
            }
        }
        tracing::info!(year, month, enqueued, "nightly pass finished");
        Ok(enqueued)
    }

    /// Long-running nightly loop; exits on shutdown.
    pub async fn run_nightly(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            let wait = delay_until_nightly(Utc::now());
            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    let today = jst::civil_date(Utc::now());
                    if let Err(e) = self.nightly_pass(today) {
                        tracing::error!(error = %e, "nightly pass failed");
                    }
                }
                _ = shutdown_rx.changed() => return,
            }
        }
    }

    /// Low/normal-priority jobs pick up the configured base delay;
    /// high-priority work is eligible immediately.
    fn enqueue(&self, payload: &JobPayload, priority: Priority) -> Result<Option<i64>> {
        let delay = match priority {
            Priority::High => Duration::ZERO,
            _ => Duration::from_millis(self.settings.snapshot().job_delay_ms),
        };
        self.queue.enqueue(payload, priority, delay)
    }
}

fn next_month(date: NaiveDate) -> (i32, u32) {
    if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    }
}

/// Time until the next 02:00 JST wall-clock instant.
fn delay_until_nightly(now: DateTime<Utc>) -> Duration {
    let now_jst = jst::to_jst(now);
    let today = now_jst.date_naive();
    let target_today = jst::at_jst(today, NIGHTLY_HOUR, 0);
    let target = if now < target_today {
        target_today
    } else {
        jst::at_jst(today.succ_opt().expect("valid date"), NIGHTLY_HOUR, 0)
    };
    (target - now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::JobState;
    use crate::store::events::{AccuracyTier, EventDraft, EventKind};
    use crate::store::Database;
    use chrono::TimeZone;

    struct Fixture {
        db: Database,
        scheduler: Scheduler,
        queue: JobQueue,
        locations: LocationRepo,
        events: EventRepo,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let settings = Arc::new(RuntimeSettings::new(db.clone()));
        let queue = JobQueue::new(db.clone());
        let locations = LocationRepo::new(db.clone());
        let events = EventRepo::new(db.clone());
        let scheduler = Scheduler::new(
            queue.clone(),
            locations.clone(),
            events.clone(),
            settings,
        );
        Fixture { db, scheduler, queue, locations, events }
    }

    fn input(lat: f64) -> LocationInput {
        LocationInput {
            name: "三ツ峠".into(),
            prefecture: "山梨県".into(),
            latitude: lat,
            longitude: 138.8069,
            elevation_m: 1785.0,
            note: None,
        }
    }

    fn seed_event(f: &Fixture, location_id: i64, y: i32, m: u32, d: u32) {
        let t = Utc.with_ymd_and_hms(y, m, d, 7, 0, 0).unwrap();
        f.events
            .upsert(
                location_id,
                NaiveDate::from_ymd_opt(y, m, d).unwrap(),
                &EventDraft {
                    kind: EventKind::DiamondSunset,
                    time: t,
                    azimuth_deg: 240.0,
                    altitude_deg: 3.0,
                    moon_phase: None,
                    moon_illumination: None,
                    quality_score: 0.8,
                    tier: AccuracyTier::Excellent,
                },
                y,
            )
            .unwrap();
    }

    #[test]
    fn test_create_enqueues_rolling_range() {
        let f = fixture();
        let loc = f.scheduler.create_location(&input(35.55)).unwrap();

        let stats = f.queue.stats().unwrap();
        // Normal priority picks up the base job delay, so it parks as
        // delayed until due.
        assert_eq!(stats.delayed, 1, "{stats:?}");

        let year = jst::civil_date(Utc::now()).year();
        f.db.with(|c| c.execute("UPDATE jobs SET not_before = 0", []))
            .unwrap();
        let job = f.queue.lease().unwrap().unwrap();
        assert_eq!(
            job.payload,
            JobPayload::LocationRange {
                location_id: loc.id,
                year_from: year,
                year_to: year + 2
            }
        );
    }

    #[test]
    fn test_cosmetic_update_keeps_events_and_enqueues_nothing() {
        let f = fixture();
        let loc = f.scheduler.create_location(&input(35.55)).unwrap();
        seed_event(&f, loc.id, 2025, 11, 20);
        let before = f.queue.stats().unwrap();

        let mut renamed = input(35.55);
        renamed.name = "三ツ峠 開運山".into();
        f.scheduler.update_location(loc.id, &renamed).unwrap();

        assert_eq!(f.events.count_for_location(loc.id).unwrap(), 1);
        let after = f.queue.stats().unwrap();
        assert_eq!(before.delayed + before.waiting, after.delayed + after.waiting);
    }

    #[test]
    fn test_geodetic_update_purges_and_requeues_high() {
        let f = fixture();
        let loc = f.scheduler.create_location(&input(35.55)).unwrap();
        seed_event(&f, loc.id, 2025, 11, 20);
        seed_event(&f, loc.id, 2025, 12, 21);

        f.scheduler.update_location(loc.id, &input(35.56)).unwrap();

        // Events are gone until the recompute lands.
        assert_eq!(f.events.count_for_location(loc.id).unwrap(), 0);

        // The high-priority range job is immediately eligible.
        let job = f.queue.lease().unwrap().expect("high-priority job waiting");
        assert_eq!(job.priority, crate::queue::PRIORITY_HIGH);
        match job.payload {
            JobPayload::LocationRange { location_id, .. } => assert_eq!(location_id, loc.id),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_delete_cascades_and_cancels_jobs() {
        let f = fixture();
        let loc = f.scheduler.create_location(&input(35.55)).unwrap();
        seed_event(&f, loc.id, 2025, 11, 20);

        f.scheduler.delete_location(loc.id).unwrap();

        assert_eq!(f.events.count_for_location(loc.id).unwrap(), 0);
        let stats = f.queue.stats().unwrap();
        assert_eq!(stats.waiting + stats.delayed, 0, "pending jobs cancelled: {stats:?}");
        assert!(matches!(f.locations.get(loc.id), Err(CoreError::NotFound(_))));
    }

    #[test]
    fn test_nightly_pass_targets_empty_next_month() {
        let f = fixture();
        let covered = f.scheduler.create_location(&input(35.55)).unwrap();
        let bare = f.scheduler.create_location(&input(35.60)).unwrap();
        // Drop the creation-time range jobs to isolate the nightly pass.
        f.db.with(|c| c.execute("DELETE FROM jobs", [])).unwrap();

        // Covered location already has an April event.
        seed_event(&f, covered.id, 2025, 4, 10);

        let today = NaiveDate::from_ymd_opt(2025, 3, 5).unwrap();
        let enqueued = f.scheduler.nightly_pass(today).unwrap();
        assert_eq!(enqueued, 1);

        f.db.with(|c| c.execute("UPDATE jobs SET not_before = 0", []))
            .unwrap();
        let job = f.queue.lease().unwrap().unwrap();
        assert_eq!(
            job.payload,
            JobPayload::MonthlyRange { location_id: bare.id, year: 2025, month: 4 }
        );
        assert_eq!(job.priority, crate::queue::PRIORITY_LOW);
    }

    #[test]
    fn test_nightly_pass_is_idempotent_while_pending() {
        let f = fixture();
        f.scheduler.create_location(&input(35.55)).unwrap();
        f.db.with(|c| c.execute("DELETE FROM jobs", [])).unwrap();

        let today = NaiveDate::from_ymd_opt(2025, 3, 5).unwrap();
        assert_eq!(f.scheduler.nightly_pass(today).unwrap(), 1);
        // Second pass the same night collapses on the dedup key.
        assert_eq!(f.scheduler.nightly_pass(today).unwrap(), 0);
    }

    #[test]
    fn test_trigger_and_regenerate_all() {
        let f = fixture();
        let a = f.scheduler.create_location(&input(35.55)).unwrap();
        f.scheduler.create_location(&input(35.60)).unwrap();
        f.db.with(|c| c.execute("DELETE FROM jobs", [])).unwrap();

        assert!(f.scheduler.trigger_location(a.id, 2025, 2025).unwrap().is_some());
        assert!(matches!(
            f.scheduler.trigger_location(a.id, 2026, 2025),
            Err(CoreError::InvalidInput(_))
        ));
        assert!(matches!(
            f.scheduler.trigger_location(404, 2025, 2025),
            Err(CoreError::NotFound(_))
        ));

        f.db.with(|c| c.execute("DELETE FROM jobs", [])).unwrap();
        assert_eq!(f.scheduler.regenerate_all(2025, 2026).unwrap(), 2);
    }

    #[test]
    fn test_reconcile_location_repairs_and_requeues() {
        let f = fixture();
        let loc = f.scheduler.create_location(&input(35.55)).unwrap();
        f.db.with(|c| c.execute("DELETE FROM jobs", [])).unwrap();
        f.db.with(|c| {
            c.execute(
                "UPDATE locations SET longitude = 138.9 WHERE id = ?1",
                rusqlite::params![loc.id],
            )
        })
        .unwrap();
        assert!(matches!(f.locations.get(loc.id), Err(CoreError::StaleDerivedGeometry(_))));

        f.scheduler.reconcile_location(loc.id).unwrap();
        assert!(f.locations.get(loc.id).is_ok());
        let job = f.queue.lease().unwrap().expect("requeued after reconcile");
        assert_eq!(job.state, JobState::Active);
    }

    #[test]
    fn test_next_month_rollover() {
        assert_eq!(next_month(NaiveDate::from_ymd_opt(2025, 12, 31).unwrap()), (2026, 1));
        assert_eq!(next_month(NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()), (2025, 4));
    }

    #[test]
    fn test_delay_until_nightly() {
        // 2025-03-09 23:00 JST → three hours to 02:00.
        let now = Utc.with_ymd_and_hms(2025, 3, 9, 14, 0, 0).unwrap();
        let wait = delay_until_nightly(now);
        assert_eq!(wait, Duration::from_secs(3 * 3600));

        // 01:30 JST → thirty minutes.
        let now = Utc.with_ymd_and_hms(2025, 3, 9, 16, 30, 0).unwrap();
        assert_eq!(delay_until_nightly(now), Duration::from_secs(30 * 60));

        // Exactly 02:00 JST → a full day.
        let now = Utc.with_ymd_and_hms(2025, 3, 9, 17, 0, 0).unwrap();
        assert_eq!(delay_until_nightly(now), Duration::from_secs(24 * 3600));
    }
}
