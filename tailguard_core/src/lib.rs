//! Tailguard Core - Proximity Hazard Detection for Connected Vehicles
//!
//! This library turns noisy position reports exchanged over an unreliable
//! shared store into a driver alert:
//! 1. **Noisy Speed Problem**: sliding-window smoothing and jitter suppression
//! 2. **Chatty Broadcast Problem**: movement/speed/heartbeat publish throttling
//! 3. **Ghost Peer Problem**: explicit peer identity plus timeout eviction
//! 4. **False Alarm Problem**: geofence and opposite-direction filtering
//!    before tiering against the safe stopping distance
//!
//! The crate performs no I/O and owns no thread or timer. Hosts drive it
//! through [`ProximityEngine`].

pub mod config;
pub mod distance;
pub mod engine;
pub mod error;
pub mod hazard;
pub mod peer_registry;
pub mod publish_throttle;
pub mod sample_filter;
pub mod stats;
pub mod types;
pub mod wire;

// Re-export key types for convenience
pub use config::EngineConfig;
pub use distance::{bearing_delta_deg, great_circle_distance_m, safe_stopping_distance_m, StoppingModel};
pub use engine::{
    EvaluationReport, EvictionOutcome, HazardEvent, OutboundPublish, ProximityEngine, SelfSampleOutcome,
    SelfUpdate,
};
pub use error::{ConfigError, IngestError};
pub use hazard::{AlertState, DangerEvent, EmergencyBrakeEvent, EmergencyBrakeMonitor, Evaluation, HazardDetector};
pub use peer_registry::{PeerEntry, PeerRegistry, RegistrySnapshot};
pub use publish_throttle::{PublishReason, PublishThrottle};
pub use sample_filter::{compute_speed, PositionFix, SampleFilter, SelfState, SpeedEstimator};
pub use stats::StatsSnapshot;
pub use types::{PeerId, SelfSample, VehicleSample};
pub use wire::{decode_link_line, encode_link_line, PeerUpdate, PublishRecord};
