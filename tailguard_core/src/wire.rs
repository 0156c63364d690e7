//! Wire codec for vehicle records.
//!
//! Two carriers share one JSON record shape:
//!
//! ```text
//! {"lat":48.1,"lon":11.5,"speed":42.0,"braking":false,"bearing":90.0|null,
//!  "ts":{".sv":"timestamp"}|1718000000000,"deviceName":"9f1c2a..."}
//! ```
//!
//! - **Shared store**: one record per vehicle, keyed by the vehicle's id. The
//!   record key is the peer id; `ts` is filled in by the store.
//! - **Direct link**: newline-delimited records over a point-to-point stream.
//!   The peer id comes from `deviceName`, falling back to a position-derived
//!   id when the sender announces none.
//!
//! Inbound records are parsed leniently ([`RawPeerRecord`]) and validated
//! afterwards, so that a missing coordinate is an [`IngestError`] rather than
//! a serde failure with an opaque message.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tailguard_env::StoreEnvelope;

use crate::error::IngestError;
use crate::types::{normalize_bearing, validate_position, PeerId, VehicleSample};

/// Marker value the store replaces with its own write time.
const SERVER_TIMESTAMP_MARKER: &str = "timestamp";

// ============================================================================
// OUTBOUND
// ============================================================================

/// The `ts` field: a placeholder on the way out, milliseconds on the way in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerTimestamp {
    /// Resolved server time (ms since the Unix epoch)
    Millis(u64),
    /// Ask the store to stamp the write
    Pending {
        #[serde(rename = ".sv")]
        marker: String,
    },
}

impl ServerTimestamp {
    pub fn pending() -> Self {
        ServerTimestamp::Pending {
            marker: SERVER_TIMESTAMP_MARKER.to_string(),
        }
    }

    pub fn millis(&self) -> Option<u64> {
        match self {
            ServerTimestamp::Millis(ms) => Some(*ms),
            ServerTimestamp::Pending { .. } => None,
        }
    }
}

/// The record this vehicle broadcasts about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishRecord {
    pub lat: f64,
    pub lon: f64,
    /// Smoothed speed in km/h
    pub speed: f64,
    pub braking: bool,
    /// Serialized as `null` when unknown
    pub bearing: Option<f64>,
    pub ts: ServerTimestamp,
    #[serde(rename = "deviceName")]
    pub device_name: String,
}

impl PublishRecord {
    /// Builds an outbound record; the store assigns `ts`.
    pub fn from_sample(sample: &VehicleSample, device_name: impl Into<String>) -> Self {
        Self {
            lat: sample.lat,
            lon: sample.lon,
            speed: sample.speed_kmh,
            braking: sample.braking,
            bearing: sample.bearing_deg,
            ts: ServerTimestamp::pending(),
            device_name: device_name.into(),
        }
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Wraps the record for the shared store under `key`.
    pub fn to_envelope(&self, key: impl Into<String>) -> Result<StoreEnvelope, serde_json::Error> {
        Ok(StoreEnvelope::new(key, self.to_json_bytes()?))
    }
}

// ============================================================================
// INBOUND
// ============================================================================

/// An inbound record before validation. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPeerRecord {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub speed: Option<f64>,
    pub braking: Option<bool>,
    pub bearing: Option<f64>,
    pub ts: Option<serde_json::Value>,
    #[serde(rename = "deviceName")]
    pub device_name: Option<String>,
}

impl RawPeerRecord {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, IngestError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Checked coordinates.
    pub fn position(&self) -> Result<(f64, f64), IngestError> {
        let lat = self.lat.ok_or(IngestError::MissingField("lat"))?;
        let lon = self.lon.ok_or(IngestError::MissingField("lon"))?;
        validate_position(lat, lon)?;
        Ok((lat, lon))
    }

    /// Resolved server time, if the record carries one.
    pub fn server_ts_ms(&self) -> Option<u64> {
        self.ts.as_ref().and_then(serde_json::Value::as_u64)
    }

    /// Validates the record and attaches `id`.
    pub fn into_update(self, id: PeerId) -> Result<PeerUpdate, IngestError> {
        let (lat, lon) = self.position()?;
        let update = PeerUpdate {
            id,
            lat,
            lon,
            speed_kmh: self.speed.unwrap_or(0.0),
            braking: self.braking,
            bearing_deg: normalize_bearing(self.bearing),
            server_ts_ms: self.server_ts_ms(),
        };
        update.validate()?;
        Ok(update)
    }
}

/// A validated peer state update, ready for the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerUpdate {
    pub id: PeerId,
    pub lat: f64,
    pub lon: f64,
    pub speed_kmh: f64,
    /// Announced braking flag; derived from speed when absent
    pub braking: Option<bool>,
    pub bearing_deg: Option<f64>,
    pub server_ts_ms: Option<u64>,
}

impl PeerUpdate {
    /// Convenience constructor for hosts that decode records themselves.
    pub fn new(id: impl Into<PeerId>, lat: f64, lon: f64, speed_kmh: f64) -> Self {
        Self {
            id: id.into(),
            lat,
            lon,
            speed_kmh,
            braking: None,
            bearing_deg: None,
            server_ts_ms: None,
        }
    }

    pub fn with_bearing(mut self, bearing_deg: f64) -> Self {
        self.bearing_deg = Some(bearing_deg);
        self
    }

    pub fn with_braking(mut self, braking: bool) -> Self {
        self.braking = Some(braking);
        self
    }

    /// Rejects updates that must never reach the registry.
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

    /// Converts into the registry's sample, stamped with the local receive time.
    pub fn into_sample(&self, received_at: Duration, braking_threshold_kmh: f64) -> VehicleSample {
        let mut sample = VehicleSample::observed(
            self.lat,
            self.lon,
            self.speed_kmh,
            self.bearing_deg,
            received_at,
            braking_threshold_kmh,
        );
        if let Some(braking) = self.braking {
            sample.braking = braking;
        }
        sample
    }
}

/// Decodes a record delivered by the shared store; the record key is the id.
pub fn decode_store_record(envelope: &StoreEnvelope) -> Result<PeerUpdate, IngestError> {
    let raw = RawPeerRecord::from_slice(&envelope.payload)?;
    let mut update = raw.into_update(PeerId::new(envelope.key.as_str()))?;
    if update.server_ts_ms.is_none() {
        update.server_ts_ms = envelope.server_ts_ms;
    }
    Ok(update)
}

/// Decodes one line received over a direct peer link.
pub fn decode_link_line(line: &str) -> Result<PeerUpdate, IngestError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(IngestError::Decode("empty line".to_string()));
    }
    let raw: RawPeerRecord = serde_json::from_str(line)?;
    let (lat, lon) = raw.position()?;

    let id = match raw.device_name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => PeerId::new(name),
        _ => PeerId::from_position(lat, lon)?,
    };
    raw.into_update(id)
}

/// Encodes one newline-terminated line for a direct peer link.
pub fn encode_link_line(record: &PublishRecord) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> VehicleSample {
        VehicleSample::observed(48.1, 11.5, 42.0, None, Duration::ZERO, 5.0)
    }

    #[test]
    fn test_publish_record_field_names() {
        let record = PublishRecord::from_sample(&sample(), "car-1");
        let value = serde_json::to_value(&record).unwrap();

        assert_eq!(
            value,
            json!({
                "lat": 48.1,
                "lon": 11.5,
                "speed": 42.0,
                "braking": false,
                "bearing": null,
                "ts": {".sv": "timestamp"},
                "deviceName": "car-1",
            })
        );
    }

    #[test]
    fn test_server_timestamp_variants() {
        let resolved: ServerTimestamp = serde_json::from_value(json!(1718000000000u64)).unwrap();
        assert_eq!(resolved.millis(), Some(1_718_000_000_000));

        let pending: ServerTimestamp = serde_json::from_value(json!({".sv": "timestamp"})).unwrap();
        assert_eq!(pending, ServerTimestamp::pending());
        assert_eq!(pending.millis(), None);
    }

    #[test]
    fn test_store_record_uses_key_as_id() {
        let payload = br#"{"lat":48.1,"lon":11.5,"speed":30.0,"braking":false,"bearing":370.0,"ts":1700,"deviceName":"ignored"}"#;
        let envelope = StoreEnvelope::new("abc123", payload.to_vec());

        let update = decode_store_record(&envelope).unwrap();
        assert_eq!(update.id, PeerId::new("abc123"));
        assert_eq!(update.bearing_deg, Some(10.0));
        assert_eq!(update.server_ts_ms, Some(1700));
        assert_eq!(update.braking, Some(false));
    }

    #[test]
    fn test_store_record_falls_back_to_envelope_timestamp() {
        let mut envelope = StoreEnvelope::new("abc", br#"{"lat":1.0,"lon":2.0}"#.to_vec());
        envelope.server_ts_ms = Some(99);

        let update = decode_store_record(&envelope).unwrap();
        assert_eq!(update.server_ts_ms, Some(99));
        assert_eq!(update.speed_kmh, 0.0);
    }

    #[test]
    fn test_missing_coordinates_are_rejected() {
        let envelope = StoreEnvelope::new("abc", br#"{"lon":11.5,"speed":30.0}"#.to_vec());
        let err = decode_store_record(&envelope).unwrap_err();
        assert_eq!(err, IngestError::MissingField("lat"));
        assert!(err.is_malformed());
    }

    #[test]
    fn test_bad_values_are_rejected() {
        let out_of_range = RawPeerRecord { lat: Some(95.0), lon: Some(0.0), ..Default::default() };
        assert!(matches!(
            out_of_range.into_update(PeerId::new("x")),
            Err(IngestError::OutOfRange { field: "lat", .. })
        ));

        let negative_speed = RawPeerRecord { lat: Some(1.0), lon: Some(1.0), speed: Some(-3.0), ..Default::default() };
        assert!(negative_speed.into_update(PeerId::new("x")).is_err());

        let garbage = StoreEnvelope::new("abc", b"not json".to_vec());
        assert!(matches!(decode_store_record(&garbage), Err(IngestError::Decode(_))));
    }

    #[test]
    fn test_announced_braking_overrides_speed() {
        let update = PeerUpdate::new("a", 1.0, 1.0, 80.0).with_braking(true);
        assert!(update.into_sample(Duration::ZERO, 5.0).braking);

        let derived = PeerUpdate::new("a", 1.0, 1.0, 3.0);
        assert!(derived.into_sample(Duration::ZERO, 5.0).braking);
    }

    #[test]
    fn test_link_line_prefers_device_name() {
        let update = decode_link_line(r#"{"lat":48.1,"lon":11.5,"speed":12.0,"braking":false,"deviceName":"pixel-7"}"#).unwrap();
        assert_eq!(update.id, PeerId::new("pixel-7"));
    }

    #[test]
    fn test_link_line_without_identity_uses_position() {
        let update = decode_link_line("{\"lat\":48.1,\"lon\":11.5,\"speed\":12.0,\"braking\":false}\n").unwrap();
        assert!(update.id.is_position_derived());
        assert_eq!(update.id, PeerId::from_position(48.1, 11.5).unwrap());
    }

    #[test]
    fn test_link_line_rejects_blank_and_incomplete() {
        assert!(decode_link_line("   \n").is_err());
        assert_eq!(
            decode_link_line(r#"{"lat":48.1,"speed":12.0}"#).unwrap_err(),
            IngestError::MissingField("lon")
        );
    }

    #[test]
    fn test_encode_link_line_is_newline_terminated() {
        let record = PublishRecord::from_sample(&sample(), "car-1");
        let line = encode_link_line(&record).unwrap();

        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        assert_eq!(decode_link_line(&line).unwrap().id, PeerId::new("car-1"));
    }
}
