//! The "HAZARD" Engine - alert tiering and emergency-brake detection
//!
//! Each evaluation recomputes the alert tier from scratch:
//! 1. Geofence: peers further than 100 m are out of relevance
//! 2. Direction: peers heading the opposite way (> 135° apart) are treated
//!    as oncoming traffic, not a rear-end risk. This is a heuristic, not a
//!    geometric proof that the paths never cross.
//! 3. Tiering: distance band x (distance < safe stopping distance)
//! 4. Precedence: the highest tier over all peers wins; the first peer that
//!    reaches `Danger` ends the scan and is the only one reported
//!
//! Emergency braking is history-dependent and lives in its own small state
//! machine, [`EmergencyBrakeMonitor`]: `Idle -> Triggered -> CoolingDown -> Idle`.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::distance::{bearing_delta_deg, great_circle_distance_m, StoppingModel};
use crate::peer_registry::RegistrySnapshot;
use crate::types::{PeerId, VehicleSample};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Distance bands and filters for per-peer evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HazardConfig {
    /// Relevance radius; peers beyond it are ignored (default: 100 m)
    pub geofence_m: f64,

    /// Inner band where a peer inside stopping distance is a danger (default: 25 m)
    pub close_band_m: f64,

    /// Middle band where a peer inside stopping distance is a warning (default: 50 m)
    pub near_band_m: f64,

    /// Heading difference above which a peer counts as oncoming (default: 135°)
    pub opposite_bearing_deg: f64,

    /// Reaction time and deceleration behind the safe distance
    pub stopping: StoppingModel,
}

impl Default for HazardConfig {
    fn default() -> Self {
        Self {
            geofence_m: 100.0,
            close_band_m: 25.0,
            near_band_m: 50.0,
            opposite_bearing_deg: 135.0,
            stopping: StoppingModel::default(),
        }
    }
}

/// Thresholds for the emergency-brake detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmergencyBrakeConfig {
    /// Speed drop that counts as an emergency stop (default: 40 km/h)
    pub min_drop_kmh: f64,

    /// Maximum time between the two compared samples (default: 2000 ms)
    pub window_ms: u64,

    /// How long the flag stays raised (default: 1000 ms)
    pub cooldown_ms: u64,
}

impl Default for EmergencyBrakeConfig {
    fn default() -> Self {
        Self {
            min_drop_kmh: 40.0,
            window_ms: 2_000,
            cooldown_ms: 1_000,
        }
    }
}

// ============================================================================
// OUTPUT TYPES
// ============================================================================

/// Alert tier, ordered by precedence (`Safe` lowest, `Danger` highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum AlertState {
    #[default]
    Safe,
    CautionNearby,
    CautionApproachingFast,
    Warning,
    Danger,
}

impl AlertState {
    /// Status label text for the driver display.
    pub fn label(&self) -> &'static str {
        match self {
            AlertState::Safe => "Distance Alert: SAFE",
            AlertState::CautionNearby => "Caution: vehicle nearby",
            AlertState::CautionApproachingFast => "Caution: approaching too fast",
            AlertState::Warning => "WARNING: Too close at current speed!",
            AlertState::Danger => "DANGER: Brake now!",
        }
    }
}

/// Informational cue for a relevant peer that does not raise the tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notice {
    /// 25-50 m away, outside stopping distance
    NearbyVehicle,
    /// 50-100 m away, outside stopping distance
    VehicleDetectedAhead,
}

/// Verdict for a single peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Assessment {
    /// Beyond the geofence
    OutOfRange,
    /// Heading the opposite way
    OppositeDirection,
    /// Raised the tier to this level
    Alert(AlertState),
    /// Relevant but harmless
    Notice(Notice),
}

/// One peer's evaluation details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerAssessment {
    pub peer_id: PeerId,
    pub distance_m: f64,
    pub assessment: Assessment,
}

/// The peer that triggered `Danger` in a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DangerEvent {
    pub peer_id: PeerId,
    pub actual_distance_m: f64,
    pub safe_distance_m: f64,
}

/// Raised once when the local vehicle sheds speed violently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyBrakeEvent {
    pub from_speed_kmh: f64,
    pub to_speed_kmh: f64,
    pub elapsed_ms: u64,
    pub at: Duration,
}

/// Result of one evaluation cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub alert: AlertState,
    pub danger: Option<DangerEvent>,
    /// Safe stopping distance at the self speed used for this cycle
    pub safe_distance_m: f64,
    /// Per-peer verdicts in snapshot order; stops at the danger peer
    pub assessments: Vec<PeerAssessment>,
}

impl Evaluation {
    /// Peers this cycle found outside the geofence.
    pub fn out_of_range(&self) -> impl Iterator<Item = &PeerId> {
        self.assessments
            .iter()
            .filter(|a| a.assessment == Assessment::OutOfRange)
            .map(|a| &a.peer_id)
    }
}

// ============================================================================
// HAZARD DETECTOR
// ============================================================================

/// Stateless per-cycle alert evaluation.
#[derive(Debug, Clone, Default)]
pub struct HazardDetector {
    config: HazardConfig,
}

impl HazardDetector {
    pub fn new(config: HazardConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HazardConfig {
        &self.config
    }

    /// The geofence boundary itself still counts as inside.
    fn in_geofence(&self, d: f64) -> bool {
        d <= self.config.geofence_m
    }

    /// Classifies one peer at distance `d` against stopping distance `safe`.
    fn classify(&self, d: f64, safe: f64) -> Assessment {
        let inside_stopping = d < safe;
        if d <= self.config.close_band_m {
            if inside_stopping {
                Assessment::Alert(AlertState::Danger)
            } else {
                Assessment::Alert(AlertState::CautionNearby)
            }
        } else if d <= self.config.near_band_m {
            if inside_stopping {
                Assessment::Alert(AlertState::Warning)
            } else {
                Assessment::Notice(Notice::NearbyVehicle)
            }
        } else if inside_stopping {
            Assessment::Alert(AlertState::CautionApproachingFast)
        } else {
            Assessment::Notice(Notice::VehicleDetectedAhead)
        }
    }

    /// Evaluates every peer in `peers` against the local reading `me`.
    ///
    /// `me.speed_kmh` should be the smoothed speed.
    pub fn evaluate(&self, me: &VehicleSample, peers: &RegistrySnapshot) -> Evaluation {
        let safe = self.config.stopping.stopping_distance_m(me.speed_kmh);
        let mut alert = AlertState::Safe;
        let mut danger = None;
        let mut assessments = Vec::with_capacity(peers.len());

        for peer in peers.iter() {
            let d = great_circle_distance_m(me.lat, me.lon, peer.sample.lat, peer.sample.lon);

            let assessment = if !self.in_geofence(d) {
                Assessment::OutOfRange
            } else if self.heading_opposite(me.bearing_deg, peer.sample.bearing_deg) {
                Assessment::OppositeDirection
            } else {
                self.classify(d, safe)
            };

            assessments.push(PeerAssessment {
                peer_id: peer.id.clone(),
                distance_m: d,
                assessment,
            });

            if let Assessment::Alert(tier) = assessment {
                alert = alert.max(tier);
                if tier == AlertState::Danger {
                    warn!(peer = %peer.id, distance = d, safe, "danger: peer inside stopping distance");
                    danger = Some(DangerEvent {
                        peer_id: peer.id.clone(),
                        actual_distance_m: d,
                        safe_distance_m: safe,
                    });
                    break;
                }
            }
        }

        debug!(?alert, peers = peers.len(), safe, "hazard evaluation");
        Evaluation {
            alert,
            danger,
            safe_distance_m: safe,
            assessments,
        }
    }

    fn heading_opposite(&self, mine: Option<f64>, theirs: Option<f64>) -> bool {
        match (mine, theirs) {
            (Some(a), Some(b)) if a.is_finite() && b.is_finite() => {
                bearing_delta_deg(a, b) > self.config.opposite_bearing_deg
            }
            _ => false,
        }
    }
}

// ============================================================================
// EMERGENCY BRAKE STATE MACHINE
// ============================================================================

/// Phase of the emergency-brake detector. `Triggered` is the instant of
/// detection; the monitor passes straight through it into `CoolingDown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrakePhase {
    Idle,
    CoolingDown { until: Duration },
}

/// What one observation did to the detector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BrakeUpdate {
    /// The previous cool-down expired before this observation
    pub cleared: bool,
    /// A new emergency stop was detected
    pub triggered: Option<EmergencyBrakeEvent>,
}

/// Edge-triggered detector with a fixed cool-down, advanced only by the
/// timestamps it is given.
///
/// The cycle is `Idle -> Triggered -> CoolingDown -> Idle`. `Triggered` lasts
/// no time: the observation that detects the drop reports it through
/// [`BrakeUpdate::triggered`] and leaves the monitor in `CoolingDown`, so
/// [`BrakePhase`] only ever holds `Idle` or `CoolingDown`.
#[derive(Debug, Clone)]
pub struct EmergencyBrakeMonitor {
    config: EmergencyBrakeConfig,
    phase: BrakePhase,
    last_check: Option<(Duration, f64)>,
}

impl EmergencyBrakeMonitor {
    pub fn new(config: EmergencyBrakeConfig) -> Self {
        Self {
            config,
            phase: BrakePhase::Idle,
            last_check: None,
        }
    }

    pub fn phase(&self) -> BrakePhase {
        self.phase
    }

    /// True while the emergency flag is raised.
    pub fn is_active(&self) -> bool {
        matches!(self.phase, BrakePhase::CoolingDown { .. })
    }

    /// Ends an expired cool-down. Returns true if the flag just cleared.
    pub fn advance(&mut self, now: Duration) -> bool {
        match self.phase {
            BrakePhase::CoolingDown { until } if now >= until => {
                self.phase = BrakePhase::Idle;
                debug!("emergency brake flag cleared");
                true
            }
            _ => false,
        }
    }

    /// Feeds one self speed sample.
    pub fn observe(&mut self, speed_kmh: f64, now: Duration) -> BrakeUpdate {
        let cleared = self.advance(now);
        let mut triggered = None;

        if let Some((then, previous_speed)) = self.last_check {
            if now > then {
                let elapsed = now - then;
                let drop = previous_speed - speed_kmh;
                if elapsed <= Duration::from_millis(self.config.window_ms)
                    && drop > self.config.min_drop_kmh
                    && !self.is_active()
                {
                    let event = EmergencyBrakeEvent {
                        from_speed_kmh: previous_speed,
                        to_speed_kmh: speed_kmh,
                        elapsed_ms: elapsed.as_millis() as u64,
                        at: now,
                    };
                    warn!(from = previous_speed, to = speed_kmh, elapsed_ms = event.elapsed_ms, "emergency braking detected");
                    self.phase = BrakePhase::CoolingDown {
                        until: now + Duration::from_millis(self.config.cooldown_ms),
                    };
                    triggered = Some(event);
                }
            }
        }

        // Out-of-order samples never rewind the reference point
        if self.last_check.map_or(true, |(then, _)| now > then) {
            self.last_check = Some((now, speed_kmh));
        }

        BrakeUpdate { cleared, triggered }
    }
}

impl Default for EmergencyBrakeMonitor {
    fn default() -> Self {
        Self::new(EmergencyBrakeConfig::default())
    }
}

// ============================================================================
// TESTS
// ============================================================================
