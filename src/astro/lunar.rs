//! Lunar position from the abridged Meeus Ch. 47 theory, with synodic
//! phase and illuminated fraction from the Ch. 48 phase angle.
//!
//! The twenty strongest periodic terms of each series give ~0.3°
//! accuracy. Altitude output is topocentric (parallax-corrected, the
//! Moon's parallax is ~0.95°) but geometric: refraction is applied
//! downstream, like the Sun's.

use super::coords::{self, poly, wrap360};
use super::solar::{sun_apparent_longitude, sun_distance_km};
use super::Observer;
use chrono::{DateTime, Utc};

/// Topocentric lunar state at one instant.
#[derive(Debug, Clone, Copy)]
pub struct MoonHorizontal {
    pub azimuth: f64,
    pub altitude: f64,
    /// Synodic phase as a fraction of the elongation cycle:
    /// 0 = new, 0.5 = full.
    pub phase: f64,
    /// Illuminated fraction of the disc, [0, 1].
    pub illumination: f64,
}

// Mean orbital angles, degrees per Julian century (Meeus 47.1-47.5).
const MEAN_LONGITUDE: [f64; 5] =
    [218.3164477, 481_267.88123421, -0.0015786, 1.0 / 538_841.0, -1.0 / 65_194_000.0];
const MEAN_ELONGATION: [f64; 5] =
    [297.8501921, 445_267.1114034, -0.0018819, 1.0 / 545_868.0, -1.0 / 113_065_000.0];
const SUN_MEAN_ANOMALY: [f64; 4] =
    [357.5291092, 35_999.0502909, -0.0001536, 1.0 / 24_490_000.0];
const MEAN_ANOMALY: [f64; 5] =
    [134.9633964, 477_198.8675055, 0.0087414, 1.0 / 69_699.0, -1.0 / 14_712_000.0];
const ARGUMENT_OF_LATITUDE: [f64; 5] =
    [93.2720950, 483_202.0175233, -0.0036539, -1.0 / 3_526_000.0, 1.0 / 863_310_000.0];

/// Mean elements at one instant, all in degrees, plus the eccentricity
/// damping factor E applied to Sun-anomaly terms.
struct MeanElements {
    lp: f64,
    d: f64,
    m: f64,
    mp: f64,
    f: f64,
    e: f64,
}

fn mean_elements(t: f64) -> MeanElements {
    MeanElements {
        lp: wrap360(poly(t, &MEAN_LONGITUDE)),
        d: wrap360(poly(t, &MEAN_ELONGATION)),
        m: wrap360(poly(t, &SUN_MEAN_ANOMALY)),
        mp: wrap360(poly(t, &MEAN_ANOMALY)),
        f: wrap360(poly(t, &ARGUMENT_OF_LATITUDE)),
        e: poly(t, &[1.0, -0.002516, -0.0000074]),
    }
}

impl MeanElements {
    /// Argument Σ(multiple · element) for one table row, in radians,
    /// and the damping E^|m| on rows carrying the Sun's anomaly.
    fn term_parts(&self, mult: &[i8; 4]) -> (f64, f64) {
        let arg = f64::from(mult[0]) * self.d
            + f64::from(mult[1]) * self.m
            + f64::from(mult[2]) * self.mp
            + f64::from(mult[3]) * self.f;
        (arg.to_radians(), self.e.powi(i32::from(mult[1].abs())))
    }
}

// Strongest rows of Table 47.A: (D, M, M', F) multiples, Σl sine
// coefficient (1e-6 degrees), Σr cosine coefficient (1e-3 km).
const LON_DIST_TERMS: [([i8; 4], f64, f64); 20] = [
    ([0, 0, 1, 0], 6_288_774.0, -20_905_355.0),
    ([2, 0, -1, 0], 1_274_027.0, -3_699_111.0),
    ([2, 0, 0, 0], 658_314.0, -2_955_968.0),
    ([0, 0, 2, 0], 213_618.0, -569_925.0),
    ([0, 1, 0, 0], -185_116.0, 48_888.0),
    ([0, 0, 0, 2], -114_332.0, -3_149.0),
    ([2, 0, -2, 0], 58_793.0, 246_158.0),
    ([2, -1, -1, 0], 57_066.0, -152_138.0),
    ([2, 0, 1, 0], 53_322.0, -170_733.0),
    ([2, -1, 0, 0], 45_758.0, -204_586.0),
    ([0, 1, -1, 0], -40_923.0, -129_620.0),
    ([1, 0, 0, 0], -34_720.0, 108_743.0),
    ([0, 1, 1, 0], -30_383.0, 104_755.0),
    ([2, 0, 0, -2], 15_327.0, 10_321.0),
    ([0, 0, 1, 2], -12_528.0, 0.0),
    ([0, 0, 1, -2], 10_980.0, 79_661.0),
    ([4, 0, -1, 0], 10_675.0, -34_782.0),
    ([0, 0, 3, 0], 10_034.0, -23_210.0),
    ([4, 0, -2, 0], 8_548.0, -21_636.0),
    ([2, 1, -1, 0], -7_888.0, 24_208.0),
];

// Strongest rows of Table 47.B: (D, M, M', F) multiples, Σb sine
// coefficient (1e-6 degrees).
const LAT_TERMS: [([i8; 4], f64); 20] = [
    ([0, 0, 0, 1], 5_128_122.0),
    ([0, 0, 1, 1], 280_602.0),
    ([0, 0, 1, -1], 277_693.0),
    ([2, 0, 0, -1], 173_237.0),
    ([2, 0, -1, 1], 55_413.0),
    ([2, 0, -1, -1], 46_271.0),
    ([2, 0, 0, 1], 32_573.0),
    ([0, 0, 2, 1], 17_198.0),
    ([2, 0, 1, -1], 9_266.0),
    ([0, 0, 2, -1], 8_822.0),
    ([2, -1, 0, -1], 8_216.0),
    ([2, 0, -2, -1], 4_324.0),
    ([2, 0, 1, 1], 4_200.0),
    ([2, 1, 0, -1], -3_359.0),
    ([2, -1, -1, 1], 2_463.0),
    ([2, -1, 0, 1], 2_211.0),
    ([2, -1, -1, -1], 2_065.0),
    ([0, 1, -1, -1], -1_870.0),
    ([4, 0, -1, -1], 1_828.0),
    ([0, 1, 0, 1], -1_794.0),
];

pub(crate) struct MoonEcliptic {
    pub longitude: f64,
    pub latitude: f64,
    pub distance_km: f64,
}

/// Geocentric ecliptic position of the Moon.
pub(crate) fn moon_ecliptic(t: f64) -> MoonEcliptic {
    let el = mean_elements(t);

    let mut sum_lon = 0.0;
    let mut sum_dist = 0.0;
    for (mult, cl, cr) in &LON_DIST_TERMS {
        let (arg, damp) = el.term_parts(mult);
        sum_lon += cl * damp * arg.sin();
        sum_dist += cr * damp * arg.cos();
    }

    let mut sum_lat = 0.0;
    for (mult, cb) in &LAT_TERMS {
        let (arg, damp) = el.term_parts(mult);
        sum_lat += cb * damp * arg.sin();
    }

    // Additives outside the tables: Venus (A1), Jupiter (A2), and the
    // flattening term (A3).
    let a1 = (119.75 + 131.849 * t).to_radians();
    let a2 = (53.09 + 479_264.290 * t).to_radians();
    let a3 = (313.45 + 481_266.484 * t).to_radians();
    let lp = el.lp.to_radians();
    let mp = el.mp.to_radians();
    let f = el.f.to_radians();

    sum_lon += 3_958.0 * a1.sin() + 1_962.0 * (lp - f).sin() + 318.0 * a2.sin();
    sum_lat += -2_235.0 * lp.sin()
        + 382.0 * a3.sin()
        + 175.0 * (a1 - f).sin()
        + 175.0 * (a1 + f).sin()
        + 127.0 * (lp - mp).sin()
        - 115.0 * (lp + mp).sin();

    MoonEcliptic {
        longitude: wrap360(el.lp + sum_lon / 1e6),
        latitude: sum_lat / 1e6,
        distance_km: 385_000.56 + sum_dist / 1e3,
    }
}

/// Topocentric parallax correction to the Moon's altitude.
/// Horizontal parallax is approximately asin(6378.14 / distance_km).
fn topocentric_correction(geo_alt: f64, distance_km: f64) -> f64 {
    let hp = (6378.14 / distance_km).asin();
    geo_alt - (hp * geo_alt.to_radians().cos()).to_degrees()
}

/// Geocentric elongation of the Moon from the Sun, degrees.
/// 0° at conjunction, ~180° at full moon.
fn elongation(moon: &MoonEcliptic, sun_lon: f64) -> f64 {
    let cos_elong =
        moon.latitude.to_radians().cos() * (moon.longitude - sun_lon).to_radians().cos();
    cos_elong.clamp(-1.0, 1.0).acos().to_degrees()
}

/// Illuminated fraction via the Meeus Ch. 48 phase angle:
/// tan i = R·sin ψ / (Δ − R·cos ψ), k = (1 + cos i) / 2.
fn illuminated_fraction(elongation_deg: f64, moon_dist_km: f64, sun_dist_km: f64) -> f64 {
    let psi = elongation_deg.to_radians();
    let i = (sun_dist_km * psi.sin()).atan2(moon_dist_km - sun_dist_km * psi.cos());
    ((1.0 + i.cos()) / 2.0).clamp(0.0, 1.0)
}

/// Apparent topocentric horizontal coordinates of the Moon, with
/// synodic phase and illuminated fraction.
pub fn moon_horizontal(t: DateTime<Utc>, observer: &Observer) -> MoonHorizontal {
    let jd = coords::julian_day(t);
    let tc = coords::centuries(jd);

    let moon = moon_ecliptic(tc);
    let (ra, dec) = coords::ecliptic_to_equatorial(
        moon.longitude,
        moon.latitude,
        coords::obliquity_of_date(tc),
    );
    let (azimuth, geo_alt) = coords::equatorial_to_horizontal(
        ra,
        dec,
        observer.latitude,
        coords::sidereal_degrees(jd, observer.longitude),
    );

    let altitude = topocentric_correction(geo_alt, moon.distance_km);

    let sun_lon = sun_apparent_longitude(tc);
    let phase = wrap360(moon.longitude - sun_lon) / 360.0;
    let illumination =
        illuminated_fraction(elongation(&moon, sun_lon), moon.distance_km, sun_distance_km(tc));

    MoonHorizontal { azimuth, altitude, phase, illumination }
}
