//! Peer Registry - authoritative table of nearby vehicles
//!
//! Owns the peer lifecycle:
//! - **Add/update** on every inbound peer record (`upsert`)
//! - **Explicit removal** when the store reports a deleted record
//! - **Implicit eviction** after a silence longer than the peer timeout
//!
//! All operations take a single mutex for the duration of one call, so a
//! [`RegistrySnapshot`] never observes a half-applied update.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

use crate::types::{PeerId, VehicleSample};

/// Configuration for peer lifecycle management.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Silence after which a peer is evicted (default: 10000 ms)
    pub peer_timeout_ms: u64,

    /// Suggested cadence for `evict_stale` calls (default: 5000 ms)
    pub eviction_interval_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            peer_timeout_ms: 10_000,
            eviction_interval_ms: 5_000,
        }
    }
}

impl RegistryConfig {
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_millis(self.eviction_interval_ms)
    }
}

/// One known peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub id: PeerId,
    pub sample: VehicleSample,
    /// Last time an update for this peer was applied; never moves backwards
    pub last_seen_at: Duration,
    /// Order of first sighting; snapshots are sorted by it
    pub first_seen_seq: u64,
}

/// Result of an [`PeerRegistry::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// The id is the local vehicle's own; nothing was stored
    RejectedSelf,
}

#[derive(Debug, Default)]
struct RegistryInner {
    peers: HashMap<PeerId, PeerEntry>,
    next_seq: u64,
}

/// Thread-safe peer table.
#[derive(Debug)]
pub struct PeerRegistry {
    local_id: PeerId,
    inner: Mutex<RegistryInner>,
}

impl PeerRegistry {
    /// Creates an empty registry for the vehicle identified by `local_id`.
    pub fn new(local_id: PeerId) -> Self {
        Self {
            local_id,
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    // Every operation leaves the map consistent, so a panic elsewhere while
    // holding the lock cannot corrupt it.
    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // MUTATION
    // ========================================================================

    /// Inserts a new peer or replaces the sample of a known one.
    pub fn upsert(&self, id: PeerId, sample: VehicleSample, now: Duration) -> UpsertOutcome {
        if id == self.local_id {
            return UpsertOutcome::RejectedSelf;
        }

        let mut inner = self.lock();
        if let Some(entry) = inner.peers.get_mut(&id) {
            entry.sample = sample;
            entry.last_seen_at = entry.last_seen_at.max(now);
            return UpsertOutcome::Updated;
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        info!(peer = %id, lat = sample.lat, lon = sample.lon, "peer discovered");
        inner.peers.insert(
            id.clone(),
            PeerEntry {
                id,
                sample,
                last_seen_at: now,
                first_seen_seq: seq,
            },
        );
        UpsertOutcome::Inserted
    }

    /// Deletes a peer; returns the removed entry, `None` if it was unknown.
    pub fn remove(&self, id: &PeerId) -> Option<PeerEntry> {
        let removed = self.lock().peers.remove(id);
        if removed.is_some() {
            info!(peer = %id, "peer removed");
        }
        removed
    }

    /// Removes every peer silent for longer than `timeout` and returns their
    /// ids, oldest sighting first.
    pub fn evict_stale(&self, now: Duration, timeout: Duration) -> Vec<PeerId> {
        let mut inner = self.lock();

        let mut stale: Vec<(u64, PeerId)> = inner
            .peers
            .values()
            .filter(|entry| now.saturating_sub(entry.last_seen_at) > timeout)
            .map(|entry| (entry.first_seen_seq, entry.id.clone()))
            .collect();
        stale.sort_unstable_by_key(|(seq, _)| *seq);

        for (_, id) in &stale {
            inner.peers.remove(id);
        }
        drop(inner);

        if !stale.is_empty() {
            debug!(count = stale.len(), "evicted stale peers");
        }
        stale.into_iter().map(|(_, id)| id).collect()
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    /// Copies the current table, ordered by first sighting.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut entries: Vec<PeerEntry> = self.lock().peers.values().cloned().collect();
        entries.sort_unstable_by_key(|entry| entry.first_seen_seq);
        RegistrySnapshot { entries }
    }

    pub fn get(&self, id: &PeerId) -> Option<PeerEntry> {
        self.lock().peers.get(id).cloned()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.lock().peers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().peers.is_empty()
    }
}

/// Immutable copy of the registry taken under one lock acquisition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrySnapshot {
    entries: Vec<PeerEntry>,
}

impl RegistrySnapshot {
    /// Builds a snapshot directly from entries (hosts replaying recorded data).
    pub fn from_entries(mut entries: Vec<PeerEntry>) -> Self {
        entries.sort_unstable_by_key(|entry| entry.first_seen_seq);
        Self { entries }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerEntry> {
        self.entries.iter()
    }

    pub fn get(&self, id: &PeerId) -> Option<&PeerEntry> {
        self.entries.iter().find(|entry| &entry.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn sample(lat: f64, speed: f64) -> VehicleSample {
        VehicleSample::observed(lat, 11.5, speed, None, Duration::ZERO, 5.0)
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_upsert_then_snapshot() {
        let registry = PeerRegistry::new(PeerId::new("me"));
        let s = sample(48.0, 30.0);

        assert_eq!(registry.upsert(PeerId::new("a"), s.clone(), secs(1)), UpsertOutcome::Inserted);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        let entry = snapshot.get(&PeerId::new("a")).unwrap();
        assert_eq!(entry.sample, s);
        assert_eq!(entry.last_seen_at, secs(1));
    }

    #[test]
    fn test_upsert_replaces_in_place() {
        let registry = PeerRegistry::new(PeerId::new("me"));
        registry.upsert(PeerId::new("a"), sample(48.0, 30.0), secs(1));
        assert_eq!(
            registry.upsert(PeerId::new("a"), sample(48.001, 35.0), secs(2)),
            UpsertOutcome::Updated
        );

        assert_eq!(registry.len(), 1);
        let entry = registry.get(&PeerId::new("a")).unwrap();
        assert_eq!(entry.sample.speed_kmh, 35.0);
        assert_eq!(entry.last_seen_at, secs(2));
    }

    #[test]
    fn test_last_seen_never_moves_backwards() {
        let registry = PeerRegistry::new(PeerId::new("me"));
        registry.upsert(PeerId::new("a"), sample(48.0, 30.0), secs(5));
        registry.upsert(PeerId::new("a"), sample(48.0, 31.0), secs(3));

        let entry = registry.get(&PeerId::new("a")).unwrap();
        assert_eq!(entry.last_seen_at, secs(5));
        assert_eq!(entry.sample.speed_kmh, 31.0);
    }

    #[test]
    fn test_rejects_own_id() {
        let registry = PeerRegistry::new(PeerId::new("me"));
        assert_eq!(
            registry.upsert(PeerId::new("me"), sample(48.0, 30.0), secs(1)),
            UpsertOutcome::RejectedSelf
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = PeerRegistry::new(PeerId::new("me"));
        registry.upsert(PeerId::new("a"), sample(48.0, 30.0), secs(1));

        assert!(registry.remove(&PeerId::new("a")).is_some());
        assert!(registry.remove(&PeerId::new("a")).is_none());
        assert!(registry.remove(&PeerId::new("never")).is_none());
    }

    #[test]
    fn test_evict_stale_uses_strict_timeout() {
        let registry = PeerRegistry::new(PeerId::new("me"));
        let timeout = secs(10);
        registry.upsert(PeerId::new("old"), sample(48.0, 30.0), secs(0));
        registry.upsert(PeerId::new("fresh"), sample(48.0, 30.0), secs(5));

        // Exactly at the timeout nothing goes
        assert!(registry.evict_stale(secs(10), timeout).is_empty());

        let evicted = registry.evict_stale(Duration::from_millis(10_001), timeout);
        assert_eq!(evicted, vec![PeerId::new("old")]);
        assert!(registry.snapshot().get(&PeerId::new("old")).is_none());
        assert!(registry.contains(&PeerId::new("fresh")));
    }

    #[test]
    fn test_snapshot_ordered_by_first_sighting() {
        let registry = PeerRegistry::new(PeerId::new("me"));
        for name in ["zulu", "alpha", "mike"] {
            registry.upsert(PeerId::new(name), sample(48.0, 30.0), secs(1));
        }
        registry.upsert(PeerId::new("alpha"), sample(48.0, 40.0), secs(2));

        let snapshot = registry.snapshot();
        let order: Vec<&str> = snapshot.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(order, vec!["zulu", "alpha", "mike"]);
    }

    #[test]
    fn test_snapshot_unaffected_by_later_upserts() {
        let registry = PeerRegistry::new(PeerId::new("me"));
        registry.upsert(PeerId::new("a"), sample(48.0, 30.0), secs(1));
        let snapshot = registry.snapshot();

        registry.upsert(PeerId::new("a"), sample(48.0, 99.0), secs(2));
        registry.upsert(PeerId::new("b"), sample(48.0, 10.0), secs(2));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get(&PeerId::new("a")).unwrap().sample.speed_kmh, 30.0);
    }

    #[test]
    fn test_concurrent_upserts_and_snapshots() {
        let registry = Arc::new(PeerRegistry::new(PeerId::new("me")));
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for i in 0..250u64 {
                        let id = PeerId::new(format!("w{}-{}", w, i % 10));
                        registry.upsert(id, sample(48.0, i as f64), Duration::from_millis(i));
                    }
                })
            })
            .collect();

        for _ in 0..100 {
            let snapshot = registry.snapshot();
            assert!(snapshot.len() <= 40);
            assert!(snapshot.get(&PeerId::new("me")).is_none());
        }
        for writer in writers {
            writer.join().unwrap();
        }
        assert_eq!(registry.len(), 40);
    }
}
