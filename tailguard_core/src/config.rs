//! Engine configuration.
//!
//! Every tunable constant lives here with its documented default. Hosts can
//! override any subset from JSON; missing sections and fields keep their
//! defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;
use crate::hazard::{EmergencyBrakeConfig, HazardConfig};
use crate::peer_registry::RegistryConfig;
use crate::publish_throttle::PublishConfig;
use crate::sample_filter::FilterConfig;

/// Complete configuration for a [`ProximityEngine`](crate::ProximityEngine).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Self-motion smoothing
    pub filter: FilterConfig,

    /// Geofence, tier bands, direction filter and stopping model
    pub hazard: HazardConfig,

    /// Peer timeout and eviction cadence
    pub registry: RegistryConfig,

    /// Publish throttle thresholds
    pub publish: PublishConfig,

    /// Emergency-brake detection
    pub emergency: EmergencyBrakeConfig,
}

fn non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::invalid(field, format!("must be a finite value >= 0, got {}", value)));
    }
    Ok(())
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::invalid(field, format!("must be a finite value > 0, got {}", value)));
    }
    Ok(())
}

impl EngineConfig {
    /// Parses a (possibly partial) JSON document and validates it.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a JSON config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Rejects values the engine cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Filter
        if self.filter.window == 0 {
            return Err(ConfigError::invalid("filter.window", "must hold at least one sample"));
        }
        non_negative("filter.jitter_floor_kmh", self.filter.jitter_floor_kmh)?;
        non_negative("filter.braking_threshold_kmh", self.filter.braking_threshold_kmh)?;

        // Hazard
        let hazard = &self.hazard;
        non_negative("hazard.stopping.reaction_time_secs", hazard.stopping.reaction_time_secs)?;
        positive("hazard.stopping.deceleration_ms2", hazard.stopping.deceleration_ms2)?;
        positive("hazard.close_band_m", hazard.close_band_m)?;
        positive("hazard.near_band_m", hazard.near_band_m)?;
        positive("hazard.geofence_m", hazard.geofence_m)?;
        if hazard.close_band_m > hazard.near_band_m || hazard.near_band_m > hazard.geofence_m {
            return Err(ConfigError::invalid(
                "hazard",
                format!(
                    "bands must satisfy close <= near <= geofence, got {} / {} / {}",
                    hazard.close_band_m, hazard.near_band_m, hazard.geofence_m
                ),
            ));
        }
        if !(hazard.opposite_bearing_deg > 0.0 && hazard.opposite_bearing_deg <= 180.0) {
            return Err(ConfigError::invalid(
                "hazard.opposite_bearing_deg",
                format!("must be in (0, 180], got {}", hazard.opposite_bearing_deg),
            ));
        }

        // Registry
        if self.registry.peer_timeout_ms == 0 {
            return Err(ConfigError::invalid("registry.peer_timeout_ms", "must be > 0"));
        }
        if self.registry.eviction_interval_ms == 0 {
            return Err(ConfigError::invalid("registry.eviction_interval_ms", "must be > 0"));
        }

        // Publish
        non_negative("publish.min_displacement_m", self.publish.min_displacement_m)?;
        non_negative("publish.min_speed_delta_kmh", self.publish.min_speed_delta_kmh)?;
        if self.publish.max_interval_ms == 0 {
            return Err(ConfigError::invalid("publish.max_interval_ms", "must be > 0"));
        }

        // Emergency brake
        positive("emergency.min_drop_kmh", self.emergency.min_drop_kmh)?;
        if self.emergency.window_ms == 0 {
            return Err(ConfigError::invalid("emergency.window_ms", "must be > 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_constants() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());

        assert_eq!(config.filter.window, 5);
        assert_eq!(config.filter.braking_threshold_kmh, 5.0);
        assert_eq!(config.filter.jitter_floor_kmh, 2.0);
        assert_eq!(config.hazard.stopping.reaction_time_secs, 1.5);
        assert_eq!(config.hazard.stopping.deceleration_ms2, 6.0);
        assert_eq!(config.hazard.geofence_m, 100.0);
        assert_eq!(config.hazard.close_band_m, 25.0);
        assert_eq!(config.hazard.near_band_m, 50.0);
        assert_eq!(config.hazard.opposite_bearing_deg, 135.0);
        assert_eq!(config.registry.peer_timeout_ms, 10_000);
        assert_eq!(config.registry.eviction_interval_ms, 5_000);
        assert_eq!(config.publish.min_displacement_m, 5.0);
        assert_eq!(config.publish.min_speed_delta_kmh, 1.0);
        assert_eq!(config.publish.max_interval_ms, 2_000);
        assert_eq!(config.emergency.min_drop_kmh, 40.0);
        assert_eq!(config.emergency.window_ms, 2_000);
        assert_eq!(config.emergency.cooldown_ms, 1_000);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{"hazard": {"geofence_m": 150.0}, "registry": {"peer_timeout_ms": 4000}}"#,
        )
        .unwrap();

        assert_eq!(config.hazard.geofence_m, 150.0);
        assert_eq!(config.hazard.close_band_m, 25.0);
        assert_eq!(config.registry.peer_timeout_ms, 4_000);
        assert_eq!(config.filter, FilterConfig::default());
    }

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(EngineConfig::from_json_str("{}").unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_rejects_band_ordering() {
        let err = EngineConfig::from_json_str(r#"{"hazard": {"close_band_m": 60.0}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "hazard", .. }));
    }

    #[test]
    fn test_rejects_nonsense_values() {
        let mut config = EngineConfig::default();
        config.filter.window = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.hazard.stopping.deceleration_ms2 = 0.0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.publish.min_displacement_m = -1.0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.hazard.opposite_bearing_deg = 200.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_error_is_reported() {
        assert!(matches!(EngineConfig::from_json_str("{not json"), Err(ConfigError::Parse(_))));
        assert!(matches!(
            EngineConfig::from_path("/nonexistent/tailguard.json"),
            Err(ConfigError::Io(_))
        ));
    }
}
