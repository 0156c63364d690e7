//! Publish/subscribe boundary between the engine and the shared store.

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::{NodeId, StoreEnvelope, StoreEvent};

/// Abstraction over the eventually-consistent broadcast medium.
///
/// # Implementations
///
/// - **Production**: a remote key-value store (one record per vehicle) or a
///   direct peer link
/// - **Simulation**: channel-based store with configurable loss/partitions
///
/// # Record Flow
///
/// ```text
/// Vehicle A                  Store                     Vehicle B
///   |                          |                           |
///   |-- publish(record) ------>|  (last write wins, ts)    |
///   |                          |-- Changed(A, record) ---->|
///   |-- retract() ------------>|                           |
///   |                          |-- Removed(A) ------------>|
/// ```
#[async_trait]
pub trait SyncGateway: Send + Sync + 'static {
    /// Writes this node's record under its own key.
    ///
    /// # Returns
    /// * `Ok(())` - Write accepted by the local side of the gateway
    /// * `Err(EnvError)` - Immediate failure (closed, unreachable)
    ///
    /// # Note
    /// Success does not guarantee that any peer observes the write.
    async fn publish(&self, envelope: StoreEnvelope) -> Result<(), EnvError>;
    
    /// Deletes this node's record, notifying subscribers with `Removed`.
    async fn retract(&self) -> Result<(), EnvError>;
    
    /// Receives the next change notification about another node's record.
    ///
    /// Returns `None` once the gateway has shut down.
    async fn recv(&self) -> Option<StoreEvent>;
    
    /// Returns this node's ID (also its record key).
    fn local_id(&self) -> NodeId;
}

/// Fault injection for simulated stores.
pub trait GatewayController: Send + Sync {
    /// Creates a partition between two node sets.
    fn partition(&self, group_a: &[NodeId], group_b: &[NodeId]);
    
    /// Heals all partitions.
    fn heal_all(&self);
    
    /// Sets the probability (0.0 - 1.0) that a notification from `from` to `to` is lost.
    fn set_link_loss(&self, from: NodeId, to: NodeId, loss_rate: f64);
}
