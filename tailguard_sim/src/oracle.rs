//! Ground truth oracle for simulation.
//!
//! The Oracle maintains the "God's eye view" of the road:
//! - True positions of all vehicles on a local planar frame (metres east and
//!   north of a geodetic origin)
//! - Kinematics (constant acceleration along a fixed heading)
//! - GPS fix generation (with noise)

use nalgebra::Vector2;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tailguard_core::distance::{kmh_to_ms, ms_to_kmh, EARTH_RADIUS_M};

use crate::context::SimContext;

/// RNG stream used for sensor noise.
const PHYSICS_RNG_STREAM: u64 = 0x9e37;

/// A ground truth vehicle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimVehicle {
    pub id: u64,

    /// Position [east, north] in metres from the origin
    pub position: Vector2<f64>,

    /// Compass heading in degrees (0 = north, 90 = east)
    pub heading_deg: f64,

    /// Speed along the heading in m/s, never negative
    pub speed_ms: f64,

    /// Longitudinal acceleration in m/s² (negative = braking)
    pub accel_ms2: f64,

    /// Vehicle is still on the road
    pub active: bool,
}

impl SimVehicle {
    /// Unit vector along the heading.
    pub fn direction(&self) -> Vector2<f64> {
        let h = self.heading_deg.to_radians();
        Vector2::new(h.sin(), h.cos())
    }

    pub fn speed_kmh(&self) -> f64 {
        ms_to_kmh(self.speed_ms)
    }
}

/// One noisy GPS fix, as a phone's location provider would report it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsFix {
    pub lat: f64,
    pub lon: f64,
    pub speed_kmh: f64,
    pub bearing_deg: f64,
}

/// The Oracle - maintains ground truth and generates GPS fixes.
pub struct Oracle {
    origin_lat: f64,
    origin_lon: f64,

    /// RNG for sensor noise, separate from the store's loss stream
    physics_rng: ChaCha8Rng,

    vehicles: BTreeMap<u64, SimVehicle>,
    next_id: u64,

    /// Current simulation time (seconds)
    current_time: f64,

    position_noise: Option<Normal<f64>>,
    speed_noise: Option<Normal<f64>>,
    bearing_noise: Option<Normal<f64>>,
}

fn noise(std_dev: f64) -> Option<Normal<f64>> {
    if std_dev > 0.0 {
        Normal::new(0.0, std_dev).ok()
    } else {
        None
    }
}

impl Oracle {
    /// Creates an Oracle anchored at a geodetic origin.
    pub fn new(context: &SimContext, origin_lat: f64, origin_lon: f64) -> Self {
        Self {
            origin_lat,
            origin_lon,
            physics_rng: context.rng_stream(PHYSICS_RNG_STREAM),
            vehicles: BTreeMap::new(),
            next_id: 0,
            current_time: 0.0,
            position_noise: noise(0.5), // 50cm noise by default
            speed_noise: noise(0.3),
            bearing_noise: noise(2.0),
        }
    }

    /// Sets the noise standard deviations (metres, km/h, degrees). Zero
    /// disables a channel.
    pub fn set_noise(&mut self, position_m: f64, speed_kmh: f64, bearing_deg: f64) {
        self.position_noise = noise(position_m);
        self.speed_noise = noise(speed_kmh);
        self.bearing_noise = noise(bearing_deg);
    }

    /// Places a vehicle and returns its ID.
    pub fn spawn_vehicle(&mut self, east_m: f64, north_m: f64, heading_deg: f64, speed_kmh: f64) -> u64 {
        let id = self.next_id;
        self.next_id += 1;

        self.vehicles.insert(
            id,
            SimVehicle {
                id,
                position: Vector2::new(east_m, north_m),
                heading_deg,
                speed_ms: kmh_to_ms(speed_kmh.max(0.0)),
                accel_ms2: 0.0,
                active: true,
            },
        );
        id
    }

    /// Sets a vehicle's longitudinal acceleration.
    pub fn set_acceleration(&mut self, id: u64, accel_ms2: f64) {
        if let Some(vehicle) = self.vehicles.get_mut(&id) {
            vehicle.accel_ms2 = accel_ms2;
        }
    }

    pub fn remove_vehicle(&mut self, id: u64) {
        if let Some(vehicle) = self.vehicles.get_mut(&id) {
            vehicle.active = false;
        }
    }

    /// Advances physics by dt seconds.
    pub fn step(&mut self, dt: f64) {
        self.current_time += dt;

        for vehicle in self.vehicles.values_mut().filter(|v| v.active) {
            let start = vehicle.speed_ms;
            let end = (start + vehicle.accel_ms2 * dt).max(0.0);
            let travelled = if end == 0.0 && vehicle.accel_ms2 < 0.0 {
                // Halted mid-step: stop where v² / 2a says, never reverse
                (start * start / (-2.0 * vehicle.accel_ms2)).min(start * dt)
            } else {
                0.5 * (start + end) * dt
            };
            vehicle.position += vehicle.direction() * travelled;
            vehicle.speed_ms = end;
            if end == 0.0 && vehicle.accel_ms2 < 0.0 {
                vehicle.accel_ms2 = 0.0;
            }
        }
    }

    /// Returns the current simulation time.
    pub fn time(&self) -> f64 {
        self.current_time
    }

    pub fn vehicle(&self, id: u64) -> Option<&SimVehicle> {
        self.vehicles.get(&id)
    }

    pub fn active_vehicles(&self) -> impl Iterator<Item = &SimVehicle> {
        self.vehicles.values().filter(|v| v.active)
    }

    /// True distance between two vehicles in metres.
    pub fn gap_m(&self, a: u64, b: u64) -> Option<f64> {
        let a = self.vehicles.get(&a)?;
        let b = self.vehicles.get(&b)?;
        Some((a.position - b.position).norm())
    }

    /// Converts a local-frame point to latitude/longitude (equirectangular,
    /// fine over the few hundred metres a scenario spans).
    pub fn to_geodetic(&self, position: &Vector2<f64>) -> (f64, f64) {
        let lat = self.origin_lat + (position.y / EARTH_RADIUS_M).to_degrees();
        let lon = self.origin_lon
            + (position.x / (EARTH_RADIUS_M * self.origin_lat.to_radians().cos())).to_degrees();
        (lat, lon)
    }

    fn sample(dist: &Option<Normal<f64>>, rng: &mut ChaCha8Rng) -> f64 {
        dist.as_ref().map_or(0.0, |d| d.sample(rng))
    }

    /// Generates a noisy GPS fix for a vehicle.
    pub fn gps_fix(&mut self, id: u64) -> Option<GpsFix> {
        let vehicle = self.vehicles.get(&id).filter(|v| v.active)?.clone();

        let rng = &mut self.physics_rng;
        let noisy = vehicle.position
            + Vector2::new(
                Self::sample(&self.position_noise, rng),
                Self::sample(&self.position_noise, rng),
            );
        let speed_kmh = (vehicle.speed_kmh() + Self::sample(&self.speed_noise, rng)).max(0.0);
        let bearing_deg = (vehicle.heading_deg + Self::sample(&self.bearing_noise, rng)).rem_euclid(360.0);

        let (lat, lon) = self.to_geodetic(&noisy);
        Some(GpsFix { lat, lon, speed_kmh, bearing_deg })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tailguard_core::great_circle_distance_m;

    fn oracle() -> Oracle {
        Oracle::new(&SimContext::new(42), 48.137, 11.575)
    }

    #[test]
    fn test_constant_speed_step() {
        let mut oracle = oracle();
        let id = oracle.spawn_vehicle(0.0, 0.0, 90.0, 72.0); // 20 m/s east

        oracle.step(1.0);

        let vehicle = oracle.vehicle(id).unwrap();
        assert!((vehicle.position.x - 20.0).abs() < 1e-9);
        assert!(vehicle.position.y.abs() < 1e-9);
    }

    #[test]
    fn test_braking_stops_without_reversing() {
        let mut oracle = oracle();
        let id = oracle.spawn_vehicle(0.0, 0.0, 0.0, 36.0); // 10 m/s north
        oracle.set_acceleration(id, -5.0);

        for _ in 0..50 {
            oracle.step(0.1);
        }

        let vehicle = oracle.vehicle(id).unwrap();
        assert_eq!(vehicle.speed_ms, 0.0);
        // v² / 2a = 10 m
        assert!((vehicle.position.y - 10.0).abs() < 1e-6);
    }

    #[test]
    fn test_gap_between_vehicles() {
        let mut oracle = oracle();
        let a = oracle.spawn_vehicle(0.0, 0.0, 0.0, 0.0);
        let b = oracle.spawn_vehicle(3.0, 4.0, 0.0, 0.0);
        assert_eq!(oracle.gap_m(a, b), Some(5.0));
    }

    #[test]
    fn test_noiseless_fix_matches_truth() {
        let mut oracle = oracle();
        oracle.set_noise(0.0, 0.0, 0.0);
        let id = oracle.spawn_vehicle(30.0, 40.0, 370.0, 50.0);

        let fix = oracle.gps_fix(id).unwrap();
        let d = great_circle_distance_m(48.137, 11.575, fix.lat, fix.lon);
        assert!((d - 50.0).abs() < 0.05);
        assert!((fix.speed_kmh - 50.0).abs() < 1e-9);
        assert!((fix.bearing_deg - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_deterministic_noise() {
        let mut oracle1 = oracle();
        let mut oracle2 = oracle();
        let id1 = oracle1.spawn_vehicle(0.0, 0.0, 0.0, 30.0);
        let id2 = oracle2.spawn_vehicle(0.0, 0.0, 0.0, 30.0);

        // Same seed = same noise
        assert_eq!(oracle1.gps_fix(id1), oracle2.gps_fix(id2));
    }

    #[test]
    fn test_removed_vehicle_has_no_fix() {
        let mut oracle = oracle();
        let id = oracle.spawn_vehicle(0.0, 0.0, 0.0, 30.0);
        oracle.remove_vehicle(id);
        assert!(oracle.gps_fix(id).is_none());
        assert_eq!(oracle.active_vehicles().count(), 0);
    }

    proptest! {
        #[test]
        fn prop_geodetic_projection_preserves_short_distances(
            east in -300.0f64..300.0,
            north in -300.0f64..300.0,
        ) {
            let oracle = oracle();
            let (lat, lon) = oracle.to_geodetic(&Vector2::new(east, north));
            let planar = (east * east + north * north).sqrt();
            let geodesic = great_circle_distance_m(48.137, 11.575, lat, lon);
            prop_assert!((planar - geodesic).abs() < 0.01 + planar * 1e-3);
        }
    }
}
