//! Engine counters.
//!
//! Entry points take `&self`, so counters are relaxed atomics. Read them
//! through [`EngineStats::snapshot`].

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters owned by the engine.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub(crate) self_samples: AtomicU64,
    pub(crate) self_samples_stale: AtomicU64,
    pub(crate) self_samples_rejected: AtomicU64,
    pub(crate) publishes_approved: AtomicU64,
    pub(crate) publishes_suppressed: AtomicU64,
    pub(crate) peer_updates_accepted: AtomicU64,
    pub(crate) peer_updates_malformed: AtomicU64,
    pub(crate) self_echoes: AtomicU64,
    pub(crate) peers_removed: AtomicU64,
    pub(crate) peers_evicted: AtomicU64,
    pub(crate) evaluations: AtomicU64,
    pub(crate) danger_events: AtomicU64,
    pub(crate) emergency_brake_events: AtomicU64,
}

#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub(crate) fn add(counter: &AtomicU64, n: usize) {
    counter.fetch_add(n as u64, Ordering::Relaxed);
}

impl EngineStats {
    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            self_samples: load(&self.self_samples),
            self_samples_stale: load(&self.self_samples_stale),
            self_samples_rejected: load(&self.self_samples_rejected),
            publishes_approved: load(&self.publishes_approved),
            publishes_suppressed: load(&self.publishes_suppressed),
            peer_updates_accepted: load(&self.peer_updates_accepted),
            peer_updates_malformed: load(&self.peer_updates_malformed),
            self_echoes: load(&self.self_echoes),
            peers_removed: load(&self.peers_removed),
            peers_evicted: load(&self.peers_evicted),
            evaluations: load(&self.evaluations),
            danger_events: load(&self.danger_events),
            emergency_brake_events: load(&self.emergency_brake_events),
        }
    }
}

/// Serializable copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Self samples accepted into the filter
    pub self_samples: u64,
    /// Self samples ignored for a duplicate or out-of-order timestamp
    pub self_samples_stale: u64,
    /// Self samples with invalid coordinates or speed
    pub self_samples_rejected: u64,
    pub publishes_approved: u64,
    pub publishes_suppressed: u64,
    pub peer_updates_accepted: u64,
    /// Dropped at the boundary (missing or invalid fields, undecodable)
    pub peer_updates_malformed: u64,
    /// Updates carrying the local vehicle's own id
    pub self_echoes: u64,
    pub peers_removed: u64,
    pub peers_evicted: u64,
    pub evaluations: u64,
    pub danger_events: u64,
    pub emergency_brake_events: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = EngineStats::default();
        bump(&stats.evaluations);
        bump(&stats.evaluations);
        add(&stats.peers_evicted, 3);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.evaluations, 2);
        assert_eq!(snapshot.peers_evicted, 3);
        assert_eq!(snapshot.danger_events, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(StatsSnapshot::default()).unwrap();
        assert_eq!(json["peer_updates_malformed"], 0);
    }
}
