//! Proximity Engine - wires the components to the host's event sources.
//!
//! The engine owns no thread and no timer. The host calls one entry point
//! per event:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      ProximityEngine                         │
//! │                                                              │
//! │  on_self_sample ──► SelfState ──► EmergencyBrakeMonitor      │
//! │                        │                │                    │
//! │                        ▼                ▼                    │
//! │                  PublishThrottle ──► PublishRecord (out)     │
//! │                        │                                     │
//! │  on_peer_update ──► PeerRegistry ──► HazardDetector ──► events│
//! │  on_peer_removed ─┘      ▲                                   │
//! │  on_eviction_tick ───────┘                                   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Lock discipline: the registry lock is never held while the self-state
//! lock is taken. Every entry point runs to completion before returning.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tailguard_env::StoreEvent;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{ConfigError, IngestError};
use crate::hazard::{
    AlertState, Assessment, DangerEvent, EmergencyBrakeEvent, EmergencyBrakeMonitor, Evaluation,
    HazardDetector,
};
use crate::peer_registry::{PeerRegistry, RegistrySnapshot, UpsertOutcome};
use crate::publish_throttle::{PublishReason, PublishThrottle};
use crate::sample_filter::{SelfState, SpeedEstimator};
use crate::stats::{add, bump, EngineStats, StatsSnapshot};
use crate::types::{PeerId, SelfSample, VehicleSample};
use crate::wire::{decode_store_record, PeerUpdate, PublishRecord, RawPeerRecord};

// ============================================================================
// OUTPUT TYPES
// ============================================================================

/// Events for UI and other collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HazardEvent {
    /// The cycle's alert tier differs from the previous cycle's
    AlertChanged { from: AlertState, to: AlertState },
    /// A peer is inside the close band and inside stopping distance
    Danger(DangerEvent),
    /// The local vehicle is braking hard
    EmergencyBrake(EmergencyBrakeEvent),
    /// The emergency-brake cool-down expired
    EmergencyBrakeCleared,
    /// A peer that was inside the geofence left it
    PeerOutOfRange { peer_id: PeerId },
    /// A peer timed out and was dropped from the registry
    PeerEvicted { peer_id: PeerId },
}

/// An evaluation cycle plus the events it produced.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationReport {
    pub evaluation: Evaluation,
    pub emergency_braking: bool,
    pub events: Vec<HazardEvent>,
}

/// A record approved for broadcast, and why.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundPublish {
    pub reason: PublishReason,
    pub record: PublishRecord,
}

/// Result of an accepted self sample.
#[derive(Debug, Clone, PartialEq)]
pub struct SelfUpdate {
    /// Smoothed reading; `braking` includes the emergency flag
    pub reading: VehicleSample,
    pub publish: Option<OutboundPublish>,
    pub report: EvaluationReport,
}

/// Result of [`ProximityEngine::on_self_sample`].
#[derive(Debug, Clone, PartialEq)]
pub enum SelfSampleOutcome {
    Accepted(SelfUpdate),
    /// The sample carried no usable information; prior state is unchanged
    Ignored(IngestError),
}

impl SelfSampleOutcome {
    pub fn update(&self) -> Option<&SelfUpdate> {
        match self {
            SelfSampleOutcome::Accepted(update) => Some(update),
            SelfSampleOutcome::Ignored(_) => None,
        }
    }
}

/// Result of [`ProximityEngine::on_eviction_tick`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvictionOutcome {
    /// Evicted peers, oldest sighting first
    pub evicted: Vec<PeerId>,
    pub events: Vec<HazardEvent>,
    /// Set when the emergency flag cleared and peers must see it
    pub publish: Option<OutboundPublish>,
}

// ============================================================================
// ENGINE
// ============================================================================

/// State mutated only by self samples and ticks.
#[derive(Debug)]
struct EgoState {
    self_state: SelfState,
    throttle: PublishThrottle,
    brake: EmergencyBrakeMonitor,
    last_alert: AlertState,
    /// Peers inside the geofence at their last evaluation
    in_range: HashSet<PeerId>,
}

/// Hazard detection and peer-state synchronization for one vehicle.
#[derive(Debug)]
pub struct ProximityEngine {
    local_id: PeerId,
    config: EngineConfig,
    registry: Arc<PeerRegistry>,
    detector: HazardDetector,
    ego: Mutex<EgoState>,
    stats: EngineStats,
}

impl ProximityEngine {
    /// Creates an engine for the vehicle `local_id` (also its broadcast
    /// device name).
    pub fn new(local_id: impl Into<PeerId>, config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(local_id.into(), config))
    }

    /// Engine with the default configuration.
    pub fn with_defaults(local_id: impl Into<PeerId>) -> Self {
        Self::build(local_id.into(), EngineConfig::default())
    }

    /// Assembles an engine from an already validated config.
    fn build(local_id: PeerId, config: EngineConfig) -> Self {
        let ego = EgoState {
            self_state: SelfState::new(&config.filter),
            throttle: PublishThrottle::new(config.publish.clone()),
            brake: EmergencyBrakeMonitor::new(config.emergency.clone()),
            last_alert: AlertState::Safe,
            in_range: HashSet::new(),
        };

        info!(local_id = %local_id, "proximity engine created");
        Self {
            registry: Arc::new(PeerRegistry::new(local_id.clone())),
            detector: HazardDetector::new(config.hazard.clone()),
            local_id,
            config,
            ego: Mutex::new(ego),
            stats: EngineStats::default(),
        }
    }

    fn ego(&self) -> MutexGuard<'_, EgoState> {
        self.ego.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // ENTRY POINTS
    // ========================================================================

    /// Ingests one self-motion sample.
    ///
    /// Smooths the speed, runs emergency-brake detection on the reported
    /// speed, decides whether to publish and re-evaluates the hazard tier.
    ///
    /// The brake detector runs on `sample.timestamp` here and on `now` in
    /// [`Self::on_eviction_tick`], so both must be read from the same
    /// `DriveContext` clock.
    pub fn on_self_sample(&self, sample: SelfSample, now: Duration) -> SelfSampleOutcome {
        let mut ego = self.ego();

        let mut reading = match ego.self_state.ingest(&sample) {
            Ok(reading) => reading.clone(),
            Err(err) => {
                if matches!(err, IngestError::StaleTimestamp { .. }) {
                    bump(&self.stats.self_samples_stale);
                    debug!(%err, "self sample ignored");
                } else {
                    bump(&self.stats.self_samples_rejected);
                    warn!(%err, "self sample rejected");
                }
                return SelfSampleOutcome::Ignored(err);
            }
        };
        bump(&self.stats.self_samples);

        let mut events = Vec::new();
        let brake = ego.brake.observe(sample.speed_kmh, sample.timestamp);
        if brake.cleared {
            events.push(HazardEvent::EmergencyBrakeCleared);
        }
        if let Some(event) = brake.triggered.clone() {
            bump(&self.stats.emergency_brake_events);
            events.push(HazardEvent::EmergencyBrake(event));
        }
        reading.braking |= ego.brake.is_active();

        let reason = if brake.cleared || brake.triggered.is_some() {
            Some(ego.throttle.force(&reading, now))
        } else {
            ego.throttle.decide(&reading, now)
        };
        let publish = match reason {
            Some(reason) => {
                bump(&self.stats.publishes_approved);
                Some(OutboundPublish {
                    reason,
                    record: PublishRecord::from_sample(&reading, self.local_id.as_str()),
                })
            }
            None => {
                bump(&self.stats.publishes_suppressed);
                None
            }
        };

        let mut report = self.evaluate_locked(&mut ego, &reading);
        events.append(&mut report.events);
        report.events = events;

        SelfSampleOutcome::Accepted(SelfUpdate { reading, publish, report })
    }

    /// Applies a decoded peer update.
    ///
    /// Returns the resulting evaluation, or `None` when the update was
    /// dropped or no self reading exists yet.
    pub fn on_peer_update(&self, update: PeerUpdate, now: Duration) -> Option<EvaluationReport> {
        if update.id == self.local_id {
            self.reject(&update.id, &IngestError::SelfEcho);
            return None;
        }
        if let Err(err) = update.validate() {
            self.reject(&update.id, &err);
            return None;
        }

        let sample = update.into_sample(now, self.config.filter.braking_threshold_kmh);
        match self.registry.upsert(update.id, sample, now) {
            UpsertOutcome::RejectedSelf => {
                self.reject(&self.local_id, &IngestError::SelfEcho);
                return None;
            }
            UpsertOutcome::Inserted | UpsertOutcome::Updated => {
                bump(&self.stats.peer_updates_accepted);
            }
        }

        self.evaluate()
    }

    /// Decodes a raw store record for peer `id` without applying it. The
    /// local vehicle's own record is classified as `SelfEcho`.
    pub fn decode_peer_record(&self, id: &str, payload: &[u8]) -> Result<PeerUpdate, IngestError> {
        let id = PeerId::new(id);
        if id == self.local_id {
            return Err(IngestError::SelfEcho);
        }
        RawPeerRecord::from_slice(payload).and_then(|raw| raw.into_update(id))
    }

    /// Decodes and applies a raw store record for peer `id`.
    pub fn on_peer_record(&self, id: &str, payload: &[u8], now: Duration) -> Option<EvaluationReport> {
        match self.decode_peer_record(id, payload) {
            Ok(update) => self.on_peer_update(update, now),
            Err(err) => {
                self.reject(&PeerId::new(id), &err);
                None
            }
        }
    }

    /// Routes one notification from the shared store.
    pub fn on_store_event(&self, event: &StoreEvent, now: Duration) -> Option<EvaluationReport> {
        match event {
            StoreEvent::Changed(envelope) => {
                if envelope.key == self.local_id.as_str() {
                    self.reject(&self.local_id, &IngestError::SelfEcho);
                    return None;
                }
                match decode_store_record(envelope) {
                    Ok(update) => self.on_peer_update(update, now),
                    Err(err) => {
                        self.reject(&PeerId::new(envelope.key.as_str()), &err);
                        None
                    }
                }
            }
            StoreEvent::Removed { key } => {
                if self.on_peer_removed(&PeerId::new(key.as_str())) {
                    self.evaluate()
                } else {
                    None
                }
            }
        }
    }

    /// Removes a peer whose record was deleted. Returns false if unknown.
    pub fn on_peer_removed(&self, id: &PeerId) -> bool {
        let removed = self.registry.remove(id).is_some();
        if removed {
            bump(&self.stats.peers_removed);
            self.ego().in_range.remove(id);
        }
        removed
    }

    /// Periodic housekeeping: evicts silent peers and lets an expired
    /// emergency-brake cool-down clear without waiting for a new sample.
    ///
    /// `now` must come from the clock that stamps self samples.
    pub fn on_eviction_tick(&self, now: Duration) -> EvictionOutcome {
        let evicted = self.registry.evict_stale(now, self.config.registry.peer_timeout());
        add(&self.stats.peers_evicted, evicted.len());

        let mut ego = self.ego();
        let mut events: Vec<HazardEvent> = evicted
            .iter()
            .map(|id| {
                ego.in_range.remove(id);
                info!(peer = %id, "peer evicted after timeout");
                HazardEvent::PeerEvicted { peer_id: id.clone() }
            })
            .collect();

        let mut publish = None;
        if ego.brake.advance(now) {
            events.push(HazardEvent::EmergencyBrakeCleared);
            if let Some(current) = ego.self_state.current().cloned() {
                let reason = ego.throttle.force(&current, now);
                bump(&self.stats.publishes_approved);
                publish = Some(OutboundPublish {
                    reason,
                    record: PublishRecord::from_sample(&current, self.local_id.as_str()),
                });
            }
        }

        EvictionOutcome { evicted, events, publish }
    }

    /// Re-evaluates against the current registry without new input.
    pub fn evaluate(&self) -> Option<EvaluationReport> {
        let mut ego = self.ego();
        let mut me = ego.self_state.current()?.clone();
        me.braking |= ego.brake.is_active();
        Some(self.evaluate_locked(&mut ego, &me))
    }

    fn evaluate_locked(&self, ego: &mut EgoState, me: &VehicleSample) -> EvaluationReport {
        let snapshot = self.registry.snapshot();
        let evaluation = self.detector.evaluate(me, &snapshot);
        bump(&self.stats.evaluations);

        let mut events = Vec::new();
        if evaluation.alert != ego.last_alert {
            info!(from = ?ego.last_alert, to = ?evaluation.alert, "alert changed");
            events.push(HazardEvent::AlertChanged {
                from: ego.last_alert,
                to: evaluation.alert,
            });
            ego.last_alert = evaluation.alert;
        }
        if let Some(danger) = &evaluation.danger {
            bump(&self.stats.danger_events);
            events.push(HazardEvent::Danger(danger.clone()));
        }
        for assessment in &evaluation.assessments {
            if assessment.assessment == Assessment::OutOfRange {
                if ego.in_range.remove(&assessment.peer_id) {
                    debug!(peer = %assessment.peer_id, distance = assessment.distance_m, "peer left geofence");
                    events.push(HazardEvent::PeerOutOfRange {
                        peer_id: assessment.peer_id.clone(),
                    });
                }
            } else {
                ego.in_range.insert(assessment.peer_id.clone());
            }
        }

        EvaluationReport {
            evaluation,
            emergency_braking: ego.brake.is_active(),
            events,
        }
    }

    /// Counts and logs one dropped peer input.
    fn reject(&self, id: &PeerId, err: &IngestError) {
        match err {
            IngestError::SelfEcho => {
                bump(&self.stats.self_echoes);
                debug!(peer = %id, "ignoring echo of own record");
            }
            err if err.is_malformed() => {
                bump(&self.stats.peer_updates_malformed);
                warn!(peer = %id, %err, "dropping malformed peer record");
            }
            err => debug!(peer = %id, %err, "ignoring peer input"),
        }
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared handle to the peer table.
    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn peers(&self) -> RegistrySnapshot {
        self.registry.snapshot()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Tier of the most recent evaluation.
    pub fn alert_state(&self) -> AlertState {
        self.ego().last_alert
    }

    pub fn emergency_braking(&self) -> bool {
        self.ego().brake.is_active()
    }

    /// Latest smoothed self reading.
    pub fn current_reading(&self) -> Option<VehicleSample> {
        self.ego().self_state.current().cloned()
    }

    /// A raw-fix speed estimator using this engine's jitter floor, for hosts
    /// without a device-reported speed.
    pub fn speed_estimator(&self) -> SpeedEstimator {
        SpeedEstimator::new(self.config.filter.jitter_floor_kmh)
    }
}

// ============================================================================
// TESTS
// ============================================================================
