//! Distance Math - geodesic and kinematic primitives
//!
//! Pure, stateless functions shared by every other module:
//! - **Great-circle distance** (haversine on a spherical Earth)
//! - **Safe stopping distance** (reaction distance + braking distance)
//! - **Bearing delta** (minimal angle between two headings)

use serde::{Deserialize, Serialize};

/// Mean Earth radius used by the haversine formula (metres).
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Converts km/h to m/s.
#[inline]
pub fn kmh_to_ms(speed_kmh: f64) -> f64 {
    speed_kmh / 3.6
}

/// Converts m/s to km/h.
#[inline]
pub fn ms_to_kmh(speed_ms: f64) -> f64 {
    speed_ms * 3.6
}

// =============================================================================
// GREAT-CIRCLE DISTANCE
// =============================================================================

/// Haversine distance between two WGS84 points, in metres.
///
/// Symmetric, zero for identical points, never negative.
pub fn great_circle_distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();

    let half_chord = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);

    // Rounding can push the chord a hair outside [0, 1] for antipodal points
    let half_chord = half_chord.clamp(0.0, 1.0);
    let central_angle = 2.0 * half_chord.sqrt().atan2((1.0 - half_chord).sqrt());

    EARTH_RADIUS_M * central_angle
}

/// Point reached by travelling `distance_m` from a start point along an
/// initial bearing (spherical direct problem). Used to place peers and to
/// move simulated vehicles.
pub fn destination_point(lat: f64, lon: f64, bearing_deg: f64, distance_m: f64) -> (f64, f64) {
    let angular = distance_m / EARTH_RADIUS_M;
    let theta = bearing_deg.to_radians();
    let phi1 = lat.to_radians();
    let lambda1 = lon.to_radians();

    let phi2 = (phi1.sin() * angular.cos() + phi1.cos() * angular.sin() * theta.cos()).asin();
    let lambda2 = lambda1
        + (theta.sin() * angular.sin() * phi1.cos()).atan2(angular.cos() - phi1.sin() * phi2.sin());

    // Normalise longitude into [-180, 180)
    let lon2 = (lambda2.to_degrees() + 540.0).rem_euclid(360.0) - 180.0;
    (phi2.to_degrees(), lon2)
}

// =============================================================================
// SAFE STOPPING DISTANCE
// =============================================================================

/// Kinematic assumptions behind the safe stopping distance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoppingModel {
    /// Driver reaction time in seconds (default: 1.5)
    pub reaction_time_secs: f64,

    /// Constant braking deceleration in m/s² (default: 6.0)
    pub deceleration_ms2: f64,
}

impl Default for StoppingModel {
    fn default() -> Self {
        Self {
            reaction_time_secs: 1.5,
            deceleration_ms2: 6.0,
        }
    }
}

impl StoppingModel {
    /// Reaction distance plus braking distance at `speed_kmh`, in metres.
    ///
    /// ```text
    /// d = v * t_r + v² / (2 * a)
    /// ```
    ///
    /// Zero at standstill and strictly increasing in speed. Negative or
    /// non-finite speeds are treated as standstill.
    pub fn stopping_distance_m(&self, speed_kmh: f64) -> f64 {
        let v = if speed_kmh.is_finite() { kmh_to_ms(speed_kmh.max(0.0)) } else { 0.0 };
        let reaction_distance = v * self.reaction_time_secs;
        let braking_distance = (v * v) / (2.0 * self.deceleration_ms2);
        reaction_distance + braking_distance
    }
}

/// Safe stopping distance with the default model (1.5 s, 6.0 m/s²).
pub fn safe_stopping_distance_m(speed_kmh: f64) -> f64 {
    StoppingModel::default().stopping_distance_m(speed_kmh)
}

// =============================================================================
// BEARING DELTA
// =============================================================================

/// Minimal absolute angle between two headings, in [0, 180].
pub fn bearing_delta_deg(a: f64, b: f64) -> f64 {
    let d = ((b - a) % 360.0 + 360.0) % 360.0;
    if d > 180.0 {
        360.0 - d
    } else {
        d
    }
}

// =============================================================================
// TESTS
// =============================================================================
