//! Time scales and coordinate transforms shared by the Sun and Moon
//! pipelines: Julian day, polynomial element evaluation, obliquity,
//! sidereal time, and the ecliptic → equatorial → horizontal rotations.

use chrono::{DateTime, Utc};

const UNIX_EPOCH_JD: f64 = 2_440_587.5;
pub(crate) const J2000_JD: f64 = 2_451_545.0;

/// Julian day of a UTC instant, straight off the unix timestamp.
pub(crate) fn julian_day(t: DateTime<Utc>) -> f64 {
    let seconds = t.timestamp() as f64 + t.timestamp_subsec_nanos() as f64 / 1e9;
    UNIX_EPOCH_JD + seconds / 86_400.0
}

/// Julian centuries since J2000.0.
pub(crate) fn centuries(jd: f64) -> f64 {
    (jd - J2000_JD) / 36_525.0
}

/// Wrap an angle into [0, 360).
pub(crate) fn wrap360(deg: f64) -> f64 {
    (deg % 360.0 + 360.0) % 360.0
}

/// Evaluate a₀ + a₁t + a₂t² + … by Horner's rule.
pub(crate) fn poly(t: f64, coeffs: &[f64]) -> f64 {
    coeffs.iter().rev().fold(0.0, |acc, c| acc * t + c)
}

// Mean obliquity of the ecliptic, degrees per Julian century
// (Meeus 22.2 in decimal form).
const MEAN_OBLIQUITY: [f64; 4] =
    [23.43929111, -0.0130041667, -0.00000016389, 0.00000050361];

/// Longitude of the Moon's ascending node, degrees. Drives the nutation
/// terms on both obliquity and the Sun's apparent longitude.
pub(crate) fn moon_node(t: f64) -> f64 {
    wrap360(125.04452 - 1_934.136261 * t)
}

/// Obliquity of date: mean obliquity plus the leading nutation term.
pub(crate) fn obliquity_of_date(t: f64) -> f64 {
    poly(t, &MEAN_OBLIQUITY) + 0.00256 * moon_node(t).to_radians().cos()
}

/// Mean sidereal time at the observer's meridian, degrees.
pub(crate) fn sidereal_degrees(jd: f64, longitude: f64) -> f64 {
    let t = centuries(jd);
    let gmst = 280.46061837
        + 360.98564736629 * (jd - J2000_JD)
        + t * t * (0.000387933 - t / 38_710_000.0);
    wrap360(gmst + longitude)
}

/// Ecliptic to equatorial: rectangular rotation about the
/// vernal-equinox axis. Returns (right_ascension_deg, declination_deg).
pub(crate) fn ecliptic_to_equatorial(lon: f64, lat: f64, obliquity: f64) -> (f64, f64) {
    let (sin_lon, cos_lon) = lon.to_radians().sin_cos();
    let (sin_lat, cos_lat) = lat.to_radians().sin_cos();
    let (sin_obl, cos_obl) = obliquity.to_radians().sin_cos();

    let x = cos_lat * cos_lon;
    let y = cos_lat * sin_lon * cos_obl - sin_lat * sin_obl;
    let z = cos_lat * sin_lon * sin_obl + sin_lat * cos_obl;

    (wrap360(y.atan2(x).to_degrees()), z.asin().to_degrees())
}

/// Equatorial to horizontal. Returns (azimuth_deg, altitude_deg) with
/// azimuth from North, clockwise.
pub(crate) fn equatorial_to_horizontal(
    ra: f64,
    dec: f64,
    latitude: f64,
    sidereal: f64,
) -> (f64, f64) {
    let (sin_ha, cos_ha) = (sidereal - ra).to_radians().sin_cos();
    let (sin_dec, cos_dec) = dec.to_radians().sin_cos();
    let (sin_lat, cos_lat) = latitude.to_radians().sin_cos();

    // Unit vector in the hour-angle frame, tilted about the east-west
    // axis into the horizon frame.
    let toward_meridian = cos_dec * cos_ha;
    let toward_west = cos_dec * sin_ha;
    let toward_pole = sin_dec;

    let altitude = (sin_lat * toward_pole + cos_lat * toward_meridian).asin();
    let from_south = toward_west.atan2(sin_lat * toward_meridian - cos_lat * toward_pole);

    (wrap360(from_south.to_degrees() + 180.0), altitude.to_degrees())
}
