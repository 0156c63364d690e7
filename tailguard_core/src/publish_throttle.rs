//! Publication throttling for the local vehicle's state.
//!
//! A record is re-broadcast only when it carries news: the vehicle moved,
//! its speed changed, or the last publish is getting old. This bounds both
//! staleness at the peers and write volume on the store.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::distance::great_circle_distance_m;
use crate::types::VehicleSample;

/// Configuration for the publish throttle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Displacement that forces a publish (default: 5.0 m)
    pub min_displacement_m: f64,

    /// Speed change that forces a publish (default: 1.0 km/h)
    pub min_speed_delta_kmh: f64,

    /// Maximum silence between publishes (default: 2000 ms)
    pub max_interval_ms: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            min_displacement_m: 5.0,
            min_speed_delta_kmh: 1.0,
            max_interval_ms: 2_000,
        }
    }
}

/// What was last sent, and when.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PublishBaseline {
    pub lat: f64,
    pub lon: f64,
    pub speed_kmh: f64,
    pub published_at: Duration,
}

impl PublishBaseline {
    fn of(sample: &VehicleSample, now: Duration) -> Self {
        Self {
            lat: sample.lat,
            lon: sample.lon,
            speed_kmh: sample.speed_kmh,
            published_at: now,
        }
    }
}

/// Why a sample was approved for publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublishReason {
    /// Nothing was published before
    First,
    /// Displacement above the threshold
    Moved,
    /// Speed delta above the threshold
    SpeedChanged,
    /// Last publish older than the maximum interval
    Heartbeat,
    /// Caller bypassed the policy (emergency-brake flag changes)
    Forced,
}

/// Pure policy: should `cur` be published given the last baseline?
pub fn publish_reason(
    prev: Option<&PublishBaseline>,
    cur: &VehicleSample,
    now: Duration,
    config: &PublishConfig,
) -> Option<PublishReason> {
    let Some(prev) = prev else {
        return Some(PublishReason::First);
    };

    let moved = great_circle_distance_m(prev.lat, prev.lon, cur.lat, cur.lon);
    if moved > config.min_displacement_m {
        return Some(PublishReason::Moved);
    }
    if (cur.speed_kmh - prev.speed_kmh).abs() > config.min_speed_delta_kmh {
        return Some(PublishReason::SpeedChanged);
    }
    if now.saturating_sub(prev.published_at) > Duration::from_millis(config.max_interval_ms) {
        return Some(PublishReason::Heartbeat);
    }
    None
}

/// Stateful throttle: remembers the last published baseline.
#[derive(Debug, Clone)]
pub struct PublishThrottle {
    config: PublishConfig,
    last: Option<PublishBaseline>,
}

impl PublishThrottle {
    pub fn new(config: PublishConfig) -> Self {
        Self { config, last: None }
    }

    /// Decides whether to publish `cur`; on approval `cur` becomes the new
    /// baseline.
    pub fn decide(&mut self, cur: &VehicleSample, now: Duration) -> Option<PublishReason> {
        let reason = publish_reason(self.last.as_ref(), cur, now, &self.config);
        match reason {
            Some(reason) => {
                debug!(?reason, speed = cur.speed_kmh, "publish approved");
                self.last = Some(PublishBaseline::of(cur, now));
            }
            None => debug!(speed = cur.speed_kmh, "publish suppressed"),
        }
        reason
    }

    /// Boolean form of [`decide`](Self::decide).
    pub fn should_publish(&mut self, cur: &VehicleSample, now: Duration) -> bool {
        self.decide(cur, now).is_some()
    }

    /// Records a publish made outside the policy.
    pub fn force(&mut self, cur: &VehicleSample, now: Duration) -> PublishReason {
        self.last = Some(PublishBaseline::of(cur, now));
        PublishReason::Forced
    }

    pub fn last_published(&self) -> Option<&PublishBaseline> {
        self.last.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::destination_point;

    fn at(lat: f64, lon: f64, speed: f64) -> VehicleSample {
        VehicleSample::observed(lat, lon, speed, None, Duration::ZERO, 5.0)
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_first_sample_always_published() {
        let mut throttle = PublishThrottle::new(PublishConfig::default());
        assert_eq!(throttle.decide(&at(0.0, 0.0, 10.0), ms(0)), Some(PublishReason::First));
        assert!(throttle.last_published().is_some());
    }

    #[test]
    fn test_small_changes_are_suppressed() {
        let mut throttle = PublishThrottle::new(PublishConfig::default());
        throttle.decide(&at(0.0, 0.0, 10.0), ms(0));

        let (lat, lon) = destination_point(0.0, 0.0, 45.0, 4.0);
        assert!(!throttle.should_publish(&at(lat, lon, 10.5), ms(1500)));
        // Suppression does not move the baseline
        assert_eq!(throttle.last_published().unwrap().published_at, ms(0));
    }

    #[test]
    fn test_each_condition_alone_triggers() {
        let config = PublishConfig::default();
        let prev = PublishBaseline { lat: 0.0, lon: 0.0, speed_kmh: 10.0, published_at: ms(0) };

        let (lat, lon) = destination_point(0.0, 0.0, 0.0, 6.0);
        assert_eq!(publish_reason(Some(&prev), &at(lat, lon, 10.0), ms(100), &config), Some(PublishReason::Moved));
        assert_eq!(publish_reason(Some(&prev), &at(0.0, 0.0, 11.5), ms(100), &config), Some(PublishReason::SpeedChanged));
        assert_eq!(publish_reason(Some(&prev), &at(0.0, 0.0, 8.5), ms(100), &config), Some(PublishReason::SpeedChanged));
        assert_eq!(publish_reason(Some(&prev), &at(0.0, 0.0, 10.0), ms(2001), &config), Some(PublishReason::Heartbeat));
        assert_eq!(publish_reason(Some(&prev), &at(0.0, 0.0, 10.0), ms(2000), &config), None);
    }

    #[test]
    fn test_baseline_commits_on_publish() {
        let mut throttle = PublishThrottle::new(PublishConfig::default());
        throttle.decide(&at(0.0, 0.0, 10.0), ms(0));
        assert!(throttle.should_publish(&at(0.0, 0.0, 12.0), ms(500)));

        // Measured against 12.0 now, so 12.8 is not news
        assert!(!throttle.should_publish(&at(0.0, 0.0, 12.8), ms(900)));
        // Heartbeat counts from the last publish at 500 ms
        assert!(!throttle.should_publish(&at(0.0, 0.0, 12.8), ms(2400)));
        assert!(throttle.should_publish(&at(0.0, 0.0, 12.8), ms(2600)));
    }

    #[test]
    fn test_force_resets_baseline() {
        let mut throttle = PublishThrottle::new(PublishConfig::default());
        throttle.decide(&at(0.0, 0.0, 10.0), ms(0));
        assert_eq!(throttle.force(&at(0.0, 0.0, 10.2), ms(300)), PublishReason::Forced);
        assert_eq!(throttle.last_published().unwrap().published_at, ms(300));
    }
}
