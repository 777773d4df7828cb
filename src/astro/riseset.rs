//! Horizon-crossing search for Sun and Moon.
//!
//! Grid scan of the altitude curve with linear interpolation of the
//! crossing instant. The horizon thresholds fold in mean refraction and
//! apparent semidiameter: -0.833° for the Sun's upper limb, +0.125° for
//! the Moon (whose topocentric parallax is already in the altitude).

use super::{lunar, solar, Body, Crossing, Observer};
use chrono::{DateTime, Duration, Utc};

const SUN_HORIZON_DEG: f64 = -0.833;
const MOON_HORIZON_DEG: f64 = 0.125;

const STEP_SECS: i64 = 120;
const SEARCH_WINDOW_HOURS: i64 = 36;

fn altitude(body: Body, t: DateTime<Utc>, observer: &Observer) -> f64 {
    match body {
        Body::Sun => solar::sun_horizontal(t, observer).altitude,
        Body::Moon => lunar::moon_horizontal(t, observer).altitude,
    }
}

fn horizon(body: Body) -> f64 {
    match body {
        Body::Sun => SUN_HORIZON_DEG,
        Body::Moon => MOON_HORIZON_DEG,
    }
}

/// Earliest instant at or after `t0` at which `body` crosses the
/// horizon in the given direction, or `None` if no such crossing occurs
/// within 36 hours.
pub fn next_rise_set(
    body: Body,
    observer: &Observer,
    t0: DateTime<Utc>,
    direction: Crossing,
) -> Option<DateTime<Utc>> {
    let target = horizon(body);
    let step = Duration::seconds(STEP_SECS);
    let end = t0 + Duration::hours(SEARCH_WINDOW_HOURS);

    let mut prev_t = t0;
    let mut prev_alt = altitude(body, prev_t, observer);
    let mut t = t0 + step;

    while t <= end {
        let alt = altitude(body, t, observer);
        let crosses = match direction {
            Crossing::Rise => prev_alt <= target && alt > target,
            Crossing::Set => prev_alt >= target && alt < target,
        };
        if crosses {
            let frac = (target - prev_alt) / (alt - prev_alt);
            let offset_ms = (STEP_SECS as f64 * 1000.0 * frac).round() as i64;
            return Some(prev_t + Duration::milliseconds(offset_ms));
        }
        prev_t = t;
        prev_alt = alt;
        t += step;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jst;
    use chrono::NaiveDate;

    fn tokyo_bay() -> Observer {
        Observer::new(35.4648, 139.8729, 5.0).unwrap()
    }

    #[test]
    fn test_sunrise_sunset_march_tokyo() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        let day_start = jst::day_start_utc(date);

        let rise = next_rise_set(Body::Sun, &tokyo_bay(), day_start, Crossing::Rise)
            .expect("sun rises at mid-latitudes");
        let set = next_rise_set(Body::Sun, &tokyo_bay(), day_start, Crossing::Set)
            .expect("sun sets at mid-latitudes");

        // Around 2025-03-10 Tokyo sunrise ≈ 06:00 JST, sunset ≈ 17:45 JST.
        let rise_jst = jst::to_jst(rise).format("%H:%M").to_string();
        let set_jst = jst::to_jst(set).format("%H:%M").to_string();
        assert!(("05:45".."06:15").contains(&rise_jst.as_str()), "sunrise {rise_jst}");
        assert!(("17:30".."18:00").contains(&set_jst.as_str()), "sunset {set_jst}");
        assert!(rise < set);
    }

    #[test]
    fn test_moon_rise_and_set_exist_within_window() {
        // At mid-latitudes the Moon both rises and sets inside any 36 h span.
        let date = NaiveDate::from_ymd_opt(2025, 1, 16).unwrap();
        let t0 = jst::day_start_utc(date);
        let obs = Observer::new(35.329621, 138.535881, 1319.0).unwrap();

        let rise = next_rise_set(Body::Moon, &obs, t0, Crossing::Rise);
        let set = next_rise_set(Body::Moon, &obs, t0, Crossing::Set);
        assert!(rise.is_some(), "moonrise missing");
        assert!(set.is_some(), "moonset missing");
    }

    #[test]
    fn test_crossing_monotonicity() {
        // The reported rise instant actually sits on the upward crossing:
        // altitude below threshold shortly before, above shortly after.
        let date = NaiveDate::from_ymd_opt(2025, 6, 21).unwrap();
        let t0 = jst::day_start_utc(date);
        let obs = tokyo_bay();
        let rise = next_rise_set(Body::Sun, &obs, t0, Crossing::Rise).unwrap();

        let before = altitude(Body::Sun, rise - Duration::minutes(10), &obs);
        let after = altitude(Body::Sun, rise + Duration::minutes(10), &obs);
        assert!(before < SUN_HORIZON_DEG, "before {before}");
        assert!(after > SUN_HORIZON_DEG, "after {after}");
    }

    #[test]
    fn test_result_not_before_t0() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        let t0 = jst::at_jst(date, 12, 0);
        let rise = next_rise_set(Body::Sun, &tokyo_bay(), t0, Crossing::Rise).unwrap();
        assert!(rise >= t0);
    }
}
