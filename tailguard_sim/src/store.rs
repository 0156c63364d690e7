//! Simulated shared store with fault injection.
//!
//! Models the remote key-value broadcast medium the vehicles sync through:
//! - One record per vehicle, last write wins
//! - The store stamps every write with its own server time
//! - Every other subscriber is notified of changes and deletions
//! - New subscribers first receive every existing record
//!
//! Writes travel over a channel and are applied when the runner calls
//! [`SimStore::pump`], which keeps delivery order a pure function of the seed.

use async_trait::async_trait;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tailguard_env::{EnvError, GatewayController, NodeId, StoreEnvelope, StoreEvent, SyncGateway};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::context::SimContext;

/// RNG stream used for delivery loss.
const LOSS_RNG_STREAM: u64 = 0x5707e;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A write waiting to be applied by the store.
#[derive(Debug)]
pub struct StoreCommand {
    pub from: NodeId,
    pub op: StoreOp,
}

#[derive(Debug)]
pub enum StoreOp {
    Put(StoreEnvelope),
    Delete { key: String },
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreMetrics {
    pub writes: u64,
    pub deletes: u64,
    pub delivered: u64,
    pub dropped_loss: u64,
    pub dropped_partition: u64,
}

// ============================================================================
// GATEWAY
// ============================================================================

/// One vehicle's connection to the simulated store.
pub struct SimGateway {
    /// This node's ID
    local_id: NodeId,

    /// Sender to the store
    tx: mpsc::UnboundedSender<StoreCommand>,

    /// Notifications about other records (behind tokio mutex for async)
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<StoreEvent>>,
}

impl SimGateway {
    /// Next pending notification without waiting.
    pub fn try_recv(&self) -> Option<StoreEvent> {
        let mut rx = self.rx.try_lock().ok()?;
        rx.try_recv().ok()
    }

    fn send(&self, op: StoreOp) -> Result<(), EnvError> {
        self.tx
            .send(StoreCommand { from: self.local_id, op })
            .map_err(|_| EnvError::closed("store dropped"))
    }
}

#[async_trait]
impl SyncGateway for SimGateway {
    async fn publish(&self, mut envelope: StoreEnvelope) -> Result<(), EnvError> {
        // A vehicle can only write its own record
        envelope.key = self.local_id.store_key();
        self.send(StoreOp::Put(envelope))
    }

    async fn retract(&self) -> Result<(), EnvError> {
        self.send(StoreOp::Delete {
            key: self.local_id.store_key(),
        })
    }

    async fn recv(&self) -> Option<StoreEvent> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }

    fn local_id(&self) -> NodeId {
        self.local_id
    }
}

// ============================================================================
// STORE
// ============================================================================

/// The central store all gateways write to.
pub struct SimStore {
    context: SimContext,
    controller: Arc<SimStoreController>,
    records: Mutex<BTreeMap<String, StoreEnvelope>>,
    subscribers: Mutex<BTreeMap<NodeId, mpsc::UnboundedSender<StoreEvent>>>,
    commands_tx: mpsc::UnboundedSender<StoreCommand>,
    commands_rx: Mutex<mpsc::UnboundedReceiver<StoreCommand>>,
    loss_rng: Mutex<ChaCha8Rng>,
    writes: AtomicU64,
    deletes: AtomicU64,
    delivered: AtomicU64,
    dropped_loss: AtomicU64,
    dropped_partition: AtomicU64,
}

impl SimStore {
    pub fn new(context: SimContext) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Self {
            loss_rng: Mutex::new(context.rng_stream(LOSS_RNG_STREAM)),
            context,
            controller: Arc::new(SimStoreController::new()),
            records: Mutex::new(BTreeMap::new()),
            subscribers: Mutex::new(BTreeMap::new()),
            commands_tx,
            commands_rx: Mutex::new(commands_rx),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped_loss: AtomicU64::new(0),
            dropped_partition: AtomicU64::new(0),
        }
    }

    /// Fault injection handle.
    pub fn controller(&self) -> Arc<SimStoreController> {
        Arc::clone(&self.controller)
    }

    /// Subscribes `node` and returns its gateway. Existing records are
    /// delivered immediately, like an initial child listing.
    pub fn connect(&self, node: NodeId) -> SimGateway {
        let (tx, rx) = mpsc::unbounded_channel();
        let own_key = node.store_key();
        for envelope in lock(&self.records).values() {
            if envelope.key != own_key {
                let _ = tx.send(StoreEvent::Changed(envelope.clone()));
            }
        }
        lock(&self.subscribers).insert(node, tx);
        debug!(node = %node, "gateway connected");

        SimGateway {
            local_id: node,
            tx: self.commands_tx.clone(),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Applies every queued write and fans out notifications. Returns the
    /// number of commands applied.
    pub fn pump(&self) -> usize {
        let mut applied = 0;
        loop {
            let command = match lock(&self.commands_rx).try_recv() {
                Ok(command) => command,
                Err(_) => break,
            };
            applied += 1;

            match command.op {
                StoreOp::Put(mut envelope) => {
                    envelope.server_ts_ms = Some(self.context.epoch_millis());
                    lock(&self.records).insert(envelope.key.clone(), envelope.clone());
                    self.writes.fetch_add(1, Ordering::Relaxed);
                    self.fan_out(command.from, StoreEvent::Changed(envelope));
                }
                StoreOp::Delete { key } => {
                    if lock(&self.records).remove(&key).is_some() {
                        self.deletes.fetch_add(1, Ordering::Relaxed);
                        self.fan_out(command.from, StoreEvent::Removed { key });
                    }
                }
            }
        }
        applied
    }

    fn fan_out(&self, from: NodeId, event: StoreEvent) {
        let subscribers = lock(&self.subscribers);
        for (node, tx) in subscribers.iter() {
            if *node == from {
                continue;
            }
            if !self.controller.can_communicate(from, *node) {
                self.dropped_partition.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            let loss = self.controller.get_loss(from, *node);
            if loss > 0.0 && lock(&self.loss_rng).gen_bool(loss) {
                self.dropped_loss.fetch_add(1, Ordering::Relaxed);
                trace!(from = %from, to = %node, key = event.key(), "notification lost");
                continue;
            }
            if tx.send(event.clone()).is_ok() {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Current record under `key`.
    pub fn record(&self, key: &str) -> Option<StoreEnvelope> {
        lock(&self.records).get(key).cloned()
    }

    pub fn record_count(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn metrics(&self) -> StoreMetrics {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StoreMetrics {
            writes: load(&self.writes),
            deletes: load(&self.deletes),
            delivered: load(&self.delivered),
            dropped_loss: load(&self.dropped_loss),
            dropped_partition: load(&self.dropped_partition),
        }
    }
}

// ============================================================================
// FAULT INJECTION
// ============================================================================

/// Store controller for fault injection.
pub struct SimStoreController {
    /// Per-link notification loss rate (0.0 - 1.0)
    link_loss: Mutex<HashMap<(NodeId, NodeId), f64>>,

    /// Active partitions (nodes that cannot see each other's writes)
    partitions: Mutex<Vec<(Vec<NodeId>, Vec<NodeId>)>>,
}

impl SimStoreController {
    pub fn new() -> Self {
        Self {
            link_loss: Mutex::new(HashMap::new()),
            partitions: Mutex::new(Vec::new()),
        }
    }

    /// Checks if a write by `from` can reach `to` (not partitioned).
    pub fn can_communicate(&self, from: NodeId, to: NodeId) -> bool {
        let partitions = lock(&self.partitions);

        for (group_a, group_b) in partitions.iter() {
            let from_in_a = group_a.contains(&from);
            let from_in_b = group_b.contains(&from);
            let to_in_a = group_a.contains(&to);
            let to_in_b = group_b.contains(&to);

            if (from_in_a && to_in_b) || (from_in_b && to_in_a) {
                return false;
            }
        }

        true
    }

    /// Gets the loss rate for a link (default 0.0).
    pub fn get_loss(&self, from: NodeId, to: NodeId) -> f64 {
        lock(&self.link_loss).get(&(from, to)).copied().unwrap_or(0.0)
    }
}

impl Default for SimStoreController {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayController for SimStoreController {
    fn partition(&self, group_a: &[NodeId], group_b: &[NodeId]) {
        lock(&self.partitions).push((group_a.to_vec(), group_b.to_vec()));
    }

    fn heal_all(&self) {
        lock(&self.partitions).clear();
    }

    fn set_link_loss(&self, from: NodeId, to: NodeId, loss_rate: f64) {
        lock(&self.link_loss).insert((from, to), loss_rate.clamp(0.0, 1.0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SimStore {
        SimStore::new(SimContext::new(7))
    }

    #[tokio::test]
    async fn test_write_is_stamped_and_fanned_out() {
        let store = store();
        let a = NodeId::from_seed(1);
        let b = NodeId::from_seed(2);
        let gw_a = store.connect(a);
        let gw_b = store.connect(b);

        gw_a.publish(StoreEnvelope::new("whatever", b"{}".to_vec())).await.unwrap();
        assert_eq!(store.pump(), 1);

        match gw_b.try_recv() {
            Some(StoreEvent::Changed(envelope)) => {
                assert_eq!(envelope.key, a.store_key());
                assert!(envelope.server_ts_ms.is_some());
            }
            other => panic!("unexpected event: {:?}", other),
        }
        // Writers do not hear their own echo
        assert!(gw_a.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let store = store();
        let a = NodeId::from_seed(1);
        let gw_a = store.connect(a);

        gw_a.publish(StoreEnvelope::new("", b"1".to_vec())).await.unwrap();
        gw_a.publish(StoreEnvelope::new("", b"2".to_vec())).await.unwrap();
        store.pump();

        assert_eq!(store.record_count(), 1);
        assert_eq!(store.record(&a.store_key()).unwrap().payload, b"2".to_vec());
    }

    #[tokio::test]
    async fn test_late_subscriber_receives_existing_records() {
        let store = store();
        let a = NodeId::from_seed(1);
        let gw_a = store.connect(a);
        gw_a.publish(StoreEnvelope::new("", b"{}".to_vec())).await.unwrap();
        store.pump();

        let gw_c = store.connect(NodeId::from_seed(3));
        assert_eq!(gw_c.try_recv().map(|e| e.key().to_string()), Some(a.store_key()));
    }

    #[tokio::test]
    async fn test_retract_notifies_removal_once() {
        let store = store();
        let a = NodeId::from_seed(1);
        let gw_a = store.connect(a);
        let gw_b = store.connect(NodeId::from_seed(2));

        gw_a.publish(StoreEnvelope::new("", b"{}".to_vec())).await.unwrap();
        gw_a.retract().await.unwrap();
        gw_a.retract().await.unwrap();
        store.pump();

        assert!(matches!(gw_b.try_recv(), Some(StoreEvent::Changed(_))));
        assert_eq!(gw_b.try_recv(), Some(StoreEvent::Removed { key: a.store_key() }));
        assert!(gw_b.try_recv().is_none());
        assert_eq!(store.metrics().deletes, 1);
    }

    #[tokio::test]
    async fn test_partition_blocks_delivery() {
        let store = store();
        let a = NodeId::from_seed(1);
        let b = NodeId::from_seed(2);
        let gw_a = store.connect(a);
        let gw_b = store.connect(b);

        store.controller().partition(&[a], &[b]);
        gw_a.publish(StoreEnvelope::new("", b"{}".to_vec())).await.unwrap();
        store.pump();
        assert!(gw_b.try_recv().is_none());
        assert_eq!(store.metrics().dropped_partition, 1);

        store.controller().heal_all();
        gw_a.publish(StoreEnvelope::new("", b"{}".to_vec())).await.unwrap();
        store.pump();
        assert!(gw_b.try_recv().is_some());
    }

    #[tokio::test]
    async fn test_total_loss_drops_everything() {
        let store = store();
        let a = NodeId::from_seed(1);
        let b = NodeId::from_seed(2);
        let gw_a = store.connect(a);
        let gw_b = store.connect(b);

        store.controller().set_link_loss(a, b, 1.0);
        for _ in 0..5 {
            gw_a.publish(StoreEnvelope::new("", b"{}".to_vec())).await.unwrap();
        }
        store.pump();

        assert!(gw_b.try_recv().is_none());
        assert_eq!(store.metrics().dropped_loss, 5);
        // The record itself is still stored
        assert!(store.record(&a.store_key()).is_some());
    }

    #[tokio::test]
    async fn test_publish_after_store_dropped_fails() {
        let gw = store().connect(NodeId::from_seed(1));
        let err = gw.publish(StoreEnvelope::new("", Vec::new())).await.unwrap_err();
        assert!(matches!(err, EnvError::GatewayClosed(_)));
    }

    #[test]
    fn test_controller_partition_is_symmetric() {
        let controller = SimStoreController::new();
        let a = NodeId::from_seed(1);
        let b = NodeId::from_seed(2);
        let c = NodeId::from_seed(3);

        controller.partition(&[a], &[b, c]);
        assert!(!controller.can_communicate(a, b));
        assert!(!controller.can_communicate(c, a));
        assert!(controller.can_communicate(b, c));
    }
}
