//! Observer-to-summit geometry: great-circle bearing and distance,
//! apparent elevation with Earth-curvature and refraction corrections,
//! and the Bennett refraction formula used on celestial altitudes.

use super::coords::wrap360;
use super::Observer;

/// Mt. Fuji summit (Kengamine). Authoritative for the whole pipeline.
pub const FUJI_LAT: f64 = 35.3606;
pub const FUJI_LON: f64 = 138.7274;
pub const FUJI_SUMMIT_ELEVATION_M: f64 = 3776.0;

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Fraction of the curvature drop restored by atmospheric refraction
/// along a terrestrial sightline.
const TERRESTRIAL_REFRACTION_K: f64 = 0.13;

/// Great-circle distance from the observer to the summit, metres
/// (haversine form).
pub fn distance_to_fuji_m(observer: &Observer) -> f64 {
    let phi1 = observer.latitude.to_radians();
    let phi2 = FUJI_LAT.to_radians();
    let d_phi = (FUJI_LAT - observer.latitude).to_radians();
    let d_lambda = (FUJI_LON - observer.longitude).to_radians();

    let a = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().clamp(-1.0, 1.0).asin()
}

/// Forward azimuth from the observer to the summit, degrees [0, 360).
pub fn bearing_to_fuji(observer: &Observer) -> f64 {
    let phi1 = observer.latitude.to_radians();
    let phi2 = FUJI_LAT.to_radians();
    let d_lambda = (FUJI_LON - observer.longitude).to_radians();

    let y = d_lambda.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * d_lambda.cos();
    wrap360(y.atan2(x).to_degrees())
}

/// Signed angle of the summit above the observer's astronomical
/// horizon, degrees.
///
/// The geometric height difference loses the Earth-curvature drop
/// d²/2Rₑ and regains k times that drop from refraction along the
/// sightline; the observer's eye height stacks on the site elevation.
pub fn apparent_elevation_to_fuji(observer: &Observer, eye_height_m: f64) -> f64 {
    let d = distance_to_fuji_m(observer);
    let height_diff = FUJI_SUMMIT_ELEVATION_M - (observer.elevation_m + eye_height_m);
    let curvature_drop = d * d / (2.0 * EARTH_RADIUS_M);
    let net = height_diff - curvature_drop + TERRESTRIAL_REFRACTION_K * curvature_drop;
    net.atan2(d).to_degrees()
}

/// Atmospheric refraction to add to a geometric altitude, degrees.
///
/// Bennett form below 15°, simple-tangent form at and above; continuous
/// at the seam. `coefficient` scales for local atmosphere (1.02 for
/// Japan latitudes).
pub fn refraction_deg(altitude_deg: f64, coefficient: f64) -> f64 {
    let h = altitude_deg;
    let r = if h < 15.0 {
        (0.1594 + 0.0196 * h + 0.00002 * h * h) / (1.0 + 0.505 * h + 0.0845 * h * h)
    } else {
        0.00452 * ((90.0 - h).to_radians()).tan()
    };
    r * coefficient
}
