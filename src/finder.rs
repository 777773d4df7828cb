//! Alignment finder: for one (JST civil date, location), the full set
//! of Diamond/Pearl events that day.
//!
//! Two-phase bracketed search per candidate window: a coarse 10-minute
//! sweep keeps instants whose azimuth lands near the summit bearing,
//! then a 1-minute bracket around the best coarse sample minimizes the
//! combined azimuth/altitude residual. "No alignment" is an empty
//! result, never an error; one window failing leaves the rest of the
//! day intact.

use crate::astro::{geometry, lunar, riseset, solar, Body, Crossing, Observer};
use crate::error::{CoreError, Result};
use crate::jst;
use crate::settings::Snapshot;
use crate::store::events::{AccuracyTier, EventDraft, EventKind};
use crate::store::locations::Location;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation handle, checked at every outer loop
/// iteration of the CPU-bound search.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Finder inputs drawn from one settings snapshot, so a running job
/// never sees values tear mid-day.
#[derive(Debug, Clone)]
pub struct FinderConfig {
    pub refraction_coefficient: f64,
    pub pearl_illumination_min: f64,
    pub diamond_season_months: Vec<u32>,
}

impl From<&Snapshot> for FinderConfig {
    fn from(s: &Snapshot) -> Self {
        Self {
            refraction_coefficient: s.refraction_coefficient,
            pearl_illumination_min: s.pearl_illumination_min,
            diamond_season_months: s.diamond_season_months.clone(),
        }
    }
}

impl Default for FinderConfig {
    fn default() -> Self {
        (&Snapshot::default()).into()
    }
}

const COARSE_STEP_MIN: i64 = 10;
const FINE_STEP_MIN: i64 = 1;
const BRACKET_MIN: i64 = 30;
/// Pearl windows straddle the rise/set instant by this much.
const PEARL_HALF_WINDOW_MIN: i64 = 90;

const DIAMOND_ALT_TOL: f64 = 0.25;
const PEARL_ALT_TOL: f64 = 0.5;

/// Distance-adaptive azimuth tolerance, degrees. The Pearl schedule is
/// broader — the Moon's angular diameter and elevation error dominate.
fn azimuth_tolerance(kind: EventKind, distance_m: f64) -> f64 {
    let band = if distance_m <= 50_000.0 {
        0
    } else if distance_m <= 100_000.0 {
        1
    } else {
        2
    };
    if kind.is_diamond() {
        [0.25, 0.4, 0.6][band]
    } else {
        [0.8, 1.6, 2.4][band]
    }
}

fn altitude_tolerance(kind: EventKind) -> f64 {
    if kind.is_diamond() { DIAMOND_ALT_TOL } else { PEARL_ALT_TOL }
}

/// Within-day coarse windows for Diamond search, JST hours, keyed by
/// northern-hemisphere season.
fn diamond_window(month: u32, kind: EventKind) -> (u32, u32) {
    let sunrise = matches!(kind, EventKind::DiamondSunrise);
    match month {
        // Winter
        10..=12 | 1 | 2 => if sunrise { (6, 9) } else { (15, 19) },
        // Spring
        3..=5 => if sunrise { (5, 8) } else { (16, 19) },
        // Summer / autumn
        _ => if sunrise { (4, 7) } else { (17, 20) },
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    time: DateTime<Utc>,
    azimuth: f64,
    /// Refracted altitude, the one compared against the summit's
    /// apparent elevation.
    altitude: f64,
    moon_phase: Option<f64>,
    moon_illumination: Option<f64>,
}

/// Signed shortest angular difference a − b, degrees in (-180, 180].
fn angle_diff(a: f64, b: f64) -> f64 {
    let mut d = (a - b) % 360.0;
    if d > 180.0 {
        d -= 360.0;
    } else if d <= -180.0 {
        d += 360.0;
    }
    d
}

/// All Diamond/Pearl events for one location on one JST civil date,
/// sorted by instant.
pub fn find_day_events(
    location: &Location,
    date: NaiveDate,
    cfg: &FinderConfig,
    cancel: &CancelFlag,
) -> Result<Vec<EventDraft>> {
    let observer = location.observer()?;
    let mut out = Vec::new();

    for kind in EventKind::ALL {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        match search_kind(location, &observer, date, kind, cfg, cancel) {
            Ok(Some(draft)) => out.push(draft),
            Ok(None) => {}
            Err(CoreError::Cancelled) => return Err(CoreError::Cancelled),
            Err(e) => {
                // Isolated per window: log with full context, keep going.
                tracing::warn!(
                    location_id = location.id,
                    date = %date,
                    kind = kind.as_str(),
                    error = %e,
                    "alignment window failed; continuing with the rest of the day"
                );
            }
        }
    }

    out.sort_by_key(|d| d.time);
    Ok(out)
}

fn search_kind(
    location: &Location,
    observer: &Observer,
    date: NaiveDate,
    kind: EventKind,
    cfg: &FinderConfig,
    cancel: &CancelFlag,
) -> Result<Option<EventDraft>> {
    let window = match kind {
        EventKind::DiamondSunrise | EventKind::DiamondSunset => {
            if !cfg.diamond_season_months.contains(&date.month()) {
                return Ok(None);
            }
            let (from_h, to_h) = diamond_window(date.month(), kind);
            (jst::at_jst(date, from_h, 0), jst::at_jst(date, to_h, 0))
        }
        EventKind::PearlMoonrise | EventKind::PearlMoonset => {
            let direction = if kind == EventKind::PearlMoonrise {
                Crossing::Rise
            } else {
                Crossing::Set
            };
            let instant =
                match riseset::next_rise_set(Body::Moon, observer, jst::day_start_utc(date), direction)
                {
                    Some(t) if t < jst::day_end_utc(date) => t,
                    _ => return Ok(None), // no rise/set on this civil date
                };
            let half = Duration::minutes(PEARL_HALF_WINDOW_MIN);
            (instant - half, instant + half)
        }
    };

    let body = if kind.is_diamond() { Body::Sun } else { Body::Moon };
    let az_tol = azimuth_tolerance(kind, location.fuji_distance_m);
    let alt_tol = altitude_tolerance(kind);

    let best = two_phase_search(
        body,
        observer,
        location,
        window,
        az_tol,
        cfg,
        cancel,
    )?;

    let Some(sample) = best else { return Ok(None) };

    let d_az = angle_diff(sample.azimuth, location.fuji_bearing_deg).abs();
    let d_alt = (sample.altitude - location.fuji_apparent_elevation_deg).abs();
    if d_az > az_tol || d_alt > alt_tol {
        return Ok(None);
    }

    // Pearl brightness gate: a near-new Moon is invisible next to the
    // twilight sky.
    if !kind.is_diamond() {
        if sample.moon_illumination.unwrap_or(0.0) < cfg.pearl_illumination_min {
            return Ok(None);
        }
    }

    let quality = (1.0 - (d_az / az_tol) * 0.5 - (d_alt / alt_tol) * 0.5).clamp(0.0, 1.0);

    Ok(Some(EventDraft {
        kind,
        time: sample.time,
        azimuth_deg: sample.azimuth,
        altitude_deg: sample.altitude,
        moon_phase: if kind.is_diamond() { None } else { sample.moon_phase },
        moon_illumination: if kind.is_diamond() { None } else { sample.moon_illumination },
        quality_score: quality,
        tier: AccuracyTier::from_quality(quality),
    }))
}

/// Phase A coarse sweep, then Phase B 1-minute bracket around the best
/// coarse sample. Returns the residual-minimizing sample, unchecked
/// against tolerances.
fn two_phase_search(
    body: Body,
    observer: &Observer,
    location: &Location,
    (start, end): (DateTime<Utc>, DateTime<Utc>),
    az_tol: f64,
    cfg: &FinderConfig,
    cancel: &CancelFlag,
) -> Result<Option<Sample>> {
    let bearing = location.fuji_bearing_deg;
    let coarse_tol = az_tol * 2.0;

    // Phase A: 10-minute sweep, keep the best azimuth match.
    let coarse_step = Duration::minutes(COARSE_STEP_MIN);
    let mut coarse_best: Option<Sample> = None;
    let mut t = start;
    while t <= end {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        let sample = sample_body(body, t, observer, location, cfg)?;
        let d_az = angle_diff(sample.azimuth, bearing).abs();
        if d_az <= coarse_tol {
            let better = match &coarse_best {
                Some(best) => d_az < angle_diff(best.azimuth, bearing).abs(),
                None => true,
            };
            if better {
                coarse_best = Some(sample);
            }
        }
        t += coarse_step;
    }
    let Some(anchor) = coarse_best else { return Ok(None) };

    // Phase B: 1-minute bracket minimizing the combined residual
    // (weights 1, 1).
    let target_alt = location.fuji_apparent_elevation_deg;
    let fine_step = Duration::minutes(FINE_STEP_MIN);
    let mut best: Option<(f64, Sample)> = None;
    let mut t = anchor.time - Duration::minutes(BRACKET_MIN);
    let fine_end = anchor.time + Duration::minutes(BRACKET_MIN);
    while t <= fine_end {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        let sample = sample_body(body, t, observer, location, cfg)?;
        let residual = angle_diff(sample.azimuth, bearing).abs() + (sample.altitude - target_alt).abs();
        if best.as_ref().map_or(true, |(r, _)| residual < *r) {
            best = Some((residual, sample));
        }
        t += fine_step;
    }

    Ok(best.map(|(_, s)| s))
}

fn sample_body(
    body: Body,
    t: DateTime<Utc>,
    observer: &Observer,
    location: &Location,
    cfg: &FinderConfig,
) -> Result<Sample> {
    let (azimuth, geometric_alt, moon_phase, moon_illumination) = match body {
        Body::Sun => {
            let pos = solar::sun_horizontal(t, observer);
            (pos.azimuth, pos.altitude, None, None)
        }
        Body::Moon => {
            let pos = lunar::moon_horizontal(t, observer);
            (pos.azimuth, pos.altitude, Some(pos.phase), Some(pos.illumination))
        }
    };

    if !azimuth.is_finite() || !geometric_alt.is_finite() {
        return Err(CoreError::EphemerisTransient {
            location_id: location.id,
            instant: t.to_rfc3339(),
            detail: "non-finite horizontal coordinates".into(),
        });
    }

    let altitude = geometric_alt + geometry::refraction_deg(geometric_alt, cfg.refraction_coefficient);
    Ok(Sample { time: t, azimuth, altitude, moon_phase, moon_illumination })
}
