//! Solar position: apparent ecliptic longitude (Meeus Ch. 25) pushed
//! through the shared equatorial → horizontal transforms.
//!
//! Aberration and nutation in longitude ride on the apparent longitude,
//! so the horizontal output is apparent topocentric; altitude is
//! geometric (refraction is applied downstream). Accuracy ~0.01° within
//! ±50 years of J2000.

use super::coords::{self, poly, wrap360};
use super::{Horizontal, Observer};
use chrono::{DateTime, Utc};

// Mean elements, degrees per Julian century.
const MEAN_LONGITUDE: [f64; 3] = [280.46646, 36_000.76983, 0.0003032];
const MEAN_ANOMALY: [f64; 3] = [357.52911, 35_999.05029, -0.0001537];
const ORBIT_ECCENTRICITY: [f64; 3] = [0.016708634, -0.000042037, -0.0000001267];

// Equation of center: sine coefficients on 1·M, 2·M, 3·M.
const CENTER_TERMS: [[f64; 3]; 3] = [
    [1.914602, -0.004817, -0.000014],
    [0.019993, -0.000101, 0.0],
    [0.000289, 0.0, 0.0],
];

fn mean_anomaly(t: f64) -> f64 {
    wrap360(poly(t, &MEAN_ANOMALY))
}

fn equation_of_center(t: f64, anomaly_deg: f64) -> f64 {
    CENTER_TERMS
        .iter()
        .enumerate()
        .map(|(i, c)| poly(t, c) * ((i + 1) as f64 * anomaly_deg).to_radians().sin())
        .sum()
}

/// Apparent ecliptic longitude: geometric longitude corrected for
/// aberration and nutation in longitude.
pub(crate) fn sun_apparent_longitude(t: f64) -> f64 {
    let geometric = poly(t, &MEAN_LONGITUDE) + equation_of_center(t, mean_anomaly(t));
    wrap360(geometric - 0.00569 - 0.00478 * coords::moon_node(t).to_radians().sin())
}

/// Earth-Sun distance in kilometres (needed for the lunar phase angle).
pub(crate) fn sun_distance_km(t: f64) -> f64 {
    let e = poly(t, &ORBIT_ECCENTRICITY);
    let m = mean_anomaly(t);
    let true_anomaly = (m + equation_of_center(t, m)).to_radians();
    let r_au = 1.000001018 * (1.0 - e * e) / (1.0 + e * true_anomaly.cos());
    r_au * 149_597_870.7
}

/// Apparent topocentric horizontal coordinates of the Sun.
pub fn sun_horizontal(t: DateTime<Utc>, observer: &Observer) -> Horizontal {
    let jd = coords::julian_day(t);
    let tc = coords::centuries(jd);

    let (ra, dec) = coords::ecliptic_to_equatorial(
        sun_apparent_longitude(tc),
        0.0,
        coords::obliquity_of_date(tc),
    );
    let (azimuth, altitude) = coords::equatorial_to_horizontal(
        ra,
        dec,
        observer.latitude,
        coords::sidereal_degrees(jd, observer.longitude),
    );
    Horizontal { azimuth, altitude }
}
