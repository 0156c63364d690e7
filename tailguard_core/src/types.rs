//! Shared kinematic types: the vehicle sample and peer identity.

use h3o::{LatLng, Resolution};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::IngestError;

/// Resolution used for coordinate-derived identities (~0.9 m² cells).
const FALLBACK_ID_RESOLUTION: Resolution = Resolution::Fifteen;

/// One observation of a vehicle's kinematic state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleSample {
    /// Latitude in degrees (WGS84)
    pub lat: f64,
    
    /// Longitude in degrees (WGS84)
    pub lon: f64,
    
    /// Speed in km/h, never negative
    pub speed_kmh: f64,
    
    /// True when `speed_kmh` is below the braking threshold (or the vehicle
    /// announced an emergency stop)
    pub braking: bool,
    
    /// Heading in [0, 360); `None` when unknown
    pub bearing_deg: Option<f64>,
    
    /// Capture time on the host's monotonic clock
    pub timestamp: Duration,
}

impl VehicleSample {
    /// Builds a sample, deriving `braking` from `braking_threshold_kmh` and
    /// normalising the bearing.
    pub fn observed(
        lat: f64,
        lon: f64,
        speed_kmh: f64,
        bearing_deg: Option<f64>,
        timestamp: Duration,
        braking_threshold_kmh: f64,
    ) -> Self {
        let speed_kmh = speed_kmh.max(0.0);
        Self {
            lat,
            lon,
            speed_kmh,
            braking: speed_kmh < braking_threshold_kmh,
            bearing_deg: normalize_bearing(bearing_deg),
            timestamp,
        }
    }
}

/// Maps a raw heading onto [0, 360). NaN, infinities and absent headings
/// all mean "unknown direction".
pub fn normalize_bearing(bearing_deg: Option<f64>) -> Option<f64> {
    bearing_deg
        .filter(|b| b.is_finite())
        .map(|b| b.rem_euclid(360.0))
        // rem_euclid can round up to exactly 360.0 for tiny negative inputs
        .map(|b| if b >= 360.0 { 0.0 } else { b })
}

/// Checks that a coordinate pair is finite and on the globe.
pub fn validate_position(lat: f64, lon: f64) -> Result<(), IngestError> {
    if !lat.is_finite() {
        return Err(IngestError::NonFinite("lat"));
    }
    if !lon.is_finite() {
        return Err(IngestError::NonFinite("lon"));
    }
    if !(-90.0..=90.0).contains(&lat) {
        return Err(IngestError::OutOfRange { field: "lat", value: lat });
    }
    if !(-180.0..=180.0).contains(&lon) {
        return Err(IngestError::OutOfRange { field: "lon", value: lon });
    }
    Ok(())
}

/// A self-motion sample as handed over by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfSample {
    pub lat: f64,
    pub lon: f64,
    /// Device-reported speed, or the output of `SpeedEstimator`
    pub speed_kmh: f64,
    pub bearing_deg: Option<f64>,
    pub timestamp: Duration,
}

impl SelfSample {
    /// Rejects samples the filter must never see.
    pub fn validate(&self) -> Result<(), IngestError> {
        validate_position(self.lat, self.lon)?;
        if !self.speed_kmh.is_finite() {
            return Err(IngestError::NonFinite("speed"));
        }
        if self.speed_kmh < 0.0 {
            return Err(IngestError::OutOfRange { field: "speed", value: self.speed_kmh });
        }
        Ok(())
    }
}

/// Stable identifier of a peer vehicle.
///
/// Normally supplied by the sync boundary (the store record key or the
/// peer's announced device name). When a peer offers no identity at all,
/// [`PeerId::from_position`] derives one from its reported coordinates.
/// That fallback is weak: two peers inside the same cell share an id and
/// their updates overwrite each other ("ghosting").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Wraps a boundary-supplied identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
    
    /// Derives a coordinate-based identity (finest H3 cell).
    pub fn from_position(lat: f64, lon: f64) -> Result<Self, IngestError> {
        validate_position(lat, lon)?;
        let cell = LatLng::new(lat, lon)
            .map_err(|e| IngestError::Decode(format!("Invalid coordinates: {:?}", e)))?
            .to_cell(FALLBACK_ID_RESOLUTION);
        Ok(Self(format!("pos:{}", cell)))
    }
    
    /// True when this id was derived from coordinates.
    pub fn is_position_derived(&self) -> bool {
        self.0.starts_with("pos:")
    }
    
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_braking_derived_from_threshold() {
        let slow = VehicleSample::observed(0.0, 0.0, 4.9, None, Duration::ZERO, 5.0);
        let fast = VehicleSample::observed(0.0, 0.0, 5.0, None, Duration::ZERO, 5.0);
        assert!(slow.braking);
        assert!(!fast.braking);
    }
    
    #[test]
    fn test_normalize_bearing() {
        assert_eq!(normalize_bearing(None), None);
        assert_eq!(normalize_bearing(Some(f64::NAN)), None);
        assert_eq!(normalize_bearing(Some(f64::INFINITY)), None);
        assert_eq!(normalize_bearing(Some(-90.0)), Some(270.0));
        assert_eq!(normalize_bearing(Some(720.0)), Some(0.0));
        assert_eq!(normalize_bearing(Some(359.5)), Some(359.5));
    }
    
    #[test]
    fn test_validate_position() {
        assert!(validate_position(48.1, 11.5).is_ok());
        assert!(matches!(validate_position(f64::NAN, 0.0), Err(IngestError::NonFinite("lat"))));
        assert!(matches!(validate_position(91.0, 0.0), Err(IngestError::OutOfRange { field: "lat", .. })));
        assert!(matches!(validate_position(0.0, -181.0), Err(IngestError::OutOfRange { field: "lon", .. })));
    }
    
    #[test]
    fn test_self_sample_rejects_negative_speed() {
        let sample = SelfSample {
            lat: 0.0,
            lon: 0.0,
            speed_kmh: -1.0,
            bearing_deg: None,
            timestamp: Duration::ZERO,
        };
        assert!(sample.validate().is_err());
    }
    
    #[test]
    fn test_position_derived_ids_collide_within_a_cell() {
        // Two peers a centimetre apart round to the same identity
        let cell = LatLng::new(48.137154, 11.576124)
            .unwrap()
            .to_cell(FALLBACK_ID_RESOLUTION);
        let center = LatLng::from(cell);
        
        let a = PeerId::from_position(center.lat(), center.lng()).unwrap();
        let b = PeerId::from_position(center.lat() + 1e-7, center.lng()).unwrap();
        let far = PeerId::from_position(center.lat() + 1e-3, center.lng()).unwrap();
        
        assert!(a.is_position_derived());
        assert_eq!(a, b, "documented ghosting weakness");
        assert_ne!(a, far);
    }
    
    #[test]
    fn test_boundary_ids_are_not_position_derived() {
        assert!(!PeerId::new("9f1c2a").is_position_derived());
    }
}
