//! Self-motion smoothing.
//!
//! GPS speed is noisy at walking pace and jumps between fixes. Two stages
//! turn raw fixes into a stable reading:
//! 1. [`SpeedEstimator`] converts successive fixes into km/h and suppresses
//!    sub-2 km/h jitter (only needed when the device reports no speed)
//! 2. [`SampleFilter`] averages the last five speeds
//!
//! [`SelfState`] owns the filter together with the current best reading.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

use crate::distance::{great_circle_distance_m, ms_to_kmh};
use crate::error::IngestError;
use crate::types::{SelfSample, VehicleSample};

/// Configuration for self-motion smoothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Sliding window length for speed averaging (default: 5)
    pub window: usize,

    /// Computed speeds below this are reported as 0 (default: 2.0 km/h)
    pub jitter_floor_kmh: f64,

    /// Speeds below this mark the vehicle as braking (default: 5.0 km/h)
    pub braking_threshold_kmh: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            window: 5,
            jitter_floor_kmh: 2.0,
            braking_threshold_kmh: 5.0,
        }
    }
}

// ============================================================================
// SPEED WINDOW
// ============================================================================

/// Fixed-capacity FIFO of recent speeds; reports their arithmetic mean.
#[derive(Debug, Clone)]
pub struct SampleFilter {
    window: VecDeque<f64>,
    capacity: usize,
}

impl SampleFilter {
    /// Creates a filter holding at most `capacity` speeds (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a speed, evicting the oldest when full, and returns the mean
    /// of the window.
    pub fn ingest(&mut self, raw_speed_kmh: f64) -> f64 {
        if self.window.len() >= self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(raw_speed_kmh);
        self.mean()
    }

    /// Mean of the current window, 0 when empty.
    pub fn mean(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Window contents, oldest first.
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.window.iter().copied()
    }
}

// ============================================================================
// RAW SPEED ESTIMATION
// ============================================================================

/// A raw position fix without speed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionFix {
    pub lat: f64,
    pub lon: f64,
    pub timestamp: Duration,
}

/// Elapsed milliseconds from `prev` to `cur`, negative when out of order.
fn elapsed_ms(prev: Duration, cur: Duration) -> i128 {
    cur.as_millis() as i128 - prev.as_millis() as i128
}

/// Speed in km/h between two fixes.
///
/// Returns 0.0 for a zero or negative elapsed time and for anything below
/// `jitter_floor_kmh`.
pub fn compute_speed(prev: &PositionFix, cur: &PositionFix, jitter_floor_kmh: f64) -> f64 {
    if cur.timestamp <= prev.timestamp {
        return 0.0;
    }
    let secs = (cur.timestamp - prev.timestamp).as_secs_f64();
    let meters = great_circle_distance_m(prev.lat, prev.lon, cur.lat, cur.lon);
    let speed = ms_to_kmh(meters / secs);
    if speed < jitter_floor_kmh {
        0.0
    } else {
        speed
    }
}

/// Remembers the last accepted fix so hosts can feed fixes one at a time.
#[derive(Debug, Clone)]
pub struct SpeedEstimator {
    last_fix: Option<PositionFix>,
    jitter_floor_kmh: f64,
}

impl SpeedEstimator {
    pub fn new(jitter_floor_kmh: f64) -> Self {
        Self {
            last_fix: None,
            jitter_floor_kmh,
        }
    }

    /// Speed from the previous fix to `fix`.
    ///
    /// The first fix yields 0.0. A duplicate or out-of-order fix yields
    /// `StaleTimestamp` and is not remembered.
    pub fn estimate(&mut self, fix: PositionFix) -> Result<f64, IngestError> {
        let Some(prev) = self.last_fix else {
            self.last_fix = Some(fix);
            return Ok(0.0);
        };
        if fix.timestamp <= prev.timestamp {
            return Err(IngestError::StaleTimestamp {
                elapsed_ms: elapsed_ms(prev.timestamp, fix.timestamp),
            });
        }
        self.last_fix = Some(fix);
        Ok(compute_speed(&prev, &fix, self.jitter_floor_kmh))
    }

    pub fn last_fix(&self) -> Option<&PositionFix> {
        self.last_fix.as_ref()
    }
}

// ============================================================================
// SELF STATE
// ============================================================================

/// The local vehicle's best-known reading plus its smoothing history.
#[derive(Debug, Clone)]
pub struct SelfState {
    filter: SampleFilter,
    current: Option<VehicleSample>,
    braking_threshold_kmh: f64,
}

impl SelfState {
    pub fn new(config: &FilterConfig) -> Self {
        Self {
            filter: SampleFilter::new(config.window),
            current: None,
            braking_threshold_kmh: config.braking_threshold_kmh,
        }
    }

    /// Smooths a new sample and makes it the current reading.
    ///
    /// A sample not newer than the current reading is rejected with
    /// `StaleTimestamp`; the previous reading (and window) stay as they were.
    pub fn ingest(&mut self, sample: &SelfSample) -> Result<&VehicleSample, IngestError> {
        sample.validate()?;
        if let Some(current) = &self.current {
            if sample.timestamp <= current.timestamp {
                return Err(IngestError::StaleTimestamp {
                    elapsed_ms: elapsed_ms(current.timestamp, sample.timestamp),
                });
            }
        }

        let filtered = self.filter.ingest(sample.speed_kmh);
        let reading = VehicleSample::observed(
            sample.lat,
            sample.lon,
            filtered,
            sample.bearing_deg,
            sample.timestamp,
            self.braking_threshold_kmh,
        );
        Ok(self.current.insert(reading))
    }

    /// Current smoothed reading, if any sample was accepted yet.
    pub fn current(&self) -> Option<&VehicleSample> {
        self.current.as_ref()
    }

    pub fn filter(&self) -> &SampleFilter {
        &self.filter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::destination_point;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn fix(lat: f64, lon: f64, ms: u64) -> PositionFix {
        PositionFix { lat, lon, timestamp: Duration::from_millis(ms) }
    }

    #[test]
    fn test_filter_averages_and_evicts_oldest() {
        let mut filter = SampleFilter::new(5);
        assert_eq!(filter.ingest(10.0), 10.0);
        assert_eq!(filter.ingest(20.0), 15.0);
        for v in [30.0, 40.0, 50.0] {
            filter.ingest(v);
        }
        assert_eq!(filter.mean(), 30.0);

        // 10 falls out: (20+30+40+50+60)/5
        assert_eq!(filter.ingest(60.0), 40.0);
        assert_eq!(filter.len(), 5);
        assert_eq!(filter.values().collect::<Vec<_>>(), vec![20.0, 30.0, 40.0, 50.0, 60.0]);
    }

    #[test]
    fn test_filter_zero_capacity_is_clamped() {
        let mut filter = SampleFilter::new(0);
        assert_eq!(filter.capacity(), 1);
        filter.ingest(3.0);
        assert_eq!(filter.ingest(7.0), 7.0);
    }

    #[test]
    fn test_compute_speed_from_fixes() {
        // 10 m in 1 s = 36 km/h
        let (lat, lon) = destination_point(0.0, 0.0, 0.0, 10.0);
        let speed = compute_speed(&fix(0.0, 0.0, 0), &fix(lat, lon, 1000), 2.0);
        assert_relative_eq!(speed, 36.0, epsilon = 1e-6);
    }

    #[test]
    fn test_compute_speed_suppresses_jitter() {
        // 0.5 m in 1 s = 1.8 km/h < 2.0
        let (lat, lon) = destination_point(0.0, 0.0, 90.0, 0.5);
        assert_eq!(compute_speed(&fix(0.0, 0.0, 0), &fix(lat, lon, 1000), 2.0), 0.0);
    }

    #[test]
    fn test_compute_speed_stale_timestamp() {
        let (lat, lon) = destination_point(0.0, 0.0, 0.0, 100.0);
        assert_eq!(compute_speed(&fix(0.0, 0.0, 1000), &fix(lat, lon, 1000), 2.0), 0.0);
        assert_eq!(compute_speed(&fix(0.0, 0.0, 1000), &fix(lat, lon, 500), 2.0), 0.0);
    }

    #[test]
    fn test_estimator_keeps_history_on_stale_fix() {
        let mut estimator = SpeedEstimator::new(2.0);
        assert_eq!(estimator.estimate(fix(0.0, 0.0, 1000)), Ok(0.0));

        let (lat, lon) = destination_point(0.0, 0.0, 0.0, 20.0);
        let stale = estimator.estimate(fix(lat, lon, 900));
        assert!(matches!(stale, Err(IngestError::StaleTimestamp { elapsed_ms: -100 })));
        assert_eq!(estimator.last_fix().map(|f| f.timestamp), Some(Duration::from_millis(1000)));

        // 20 m in 2 s measured from the original fix = 36 km/h
        let speed = estimator.estimate(fix(lat, lon, 3000)).unwrap();
        assert_relative_eq!(speed, 36.0, epsilon = 1e-6);
    }

    #[test]
    fn test_self_state_retains_reading_on_stale_sample() {
        let mut state = SelfState::new(&FilterConfig::default());
        let sample = |speed: f64, ms: u64| SelfSample {
            lat: 1.0,
            lon: 2.0,
            speed_kmh: speed,
            bearing_deg: Some(90.0),
            timestamp: Duration::from_millis(ms),
        };

        assert_eq!(state.ingest(&sample(40.0, 1000)).unwrap().speed_kmh, 40.0);
        assert!(state.ingest(&sample(80.0, 1000)).is_err());
        assert_eq!(state.current().unwrap().speed_kmh, 40.0);
        assert_eq!(state.filter().len(), 1);

        let reading = state.ingest(&sample(0.0, 2000)).unwrap();
        assert_eq!(reading.speed_kmh, 20.0);
        assert!(!reading.braking);
    }

    proptest! {
        #[test]
        fn prop_window_bounded_and_mean_of_tail(values in proptest::collection::vec(0.0f64..250.0, 1..40)) {
            let mut filter = SampleFilter::new(5);
            let mut last = 0.0;
            for v in &values {
                last = filter.ingest(*v);
                prop_assert!(filter.len() <= 5);
            }
            let tail: Vec<f64> = values.iter().rev().take(5).copied().collect();
            let expected = tail.iter().sum::<f64>() / tail.len() as f64;
            prop_assert!((last - expected).abs() < 1e-9);
        }
    }
}
