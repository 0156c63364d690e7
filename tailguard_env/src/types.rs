//! Common types for the Tailguard environment abstraction.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a vehicle node on the sync boundary.
///
/// Uses UUID v4 for global uniqueness without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Creates a new random NodeId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
    
    /// Creates a deterministic NodeId from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }
    
    /// Returns the record key this node writes under in the store.
    pub fn store_key(&self) -> String {
        self.0.simple().to_string()
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability
        write!(f, "{}", &self.0.simple().to_string()[..8])
    }
}

/// One record as it travels through the store.
///
/// The payload is opaque bytes here; the engine's wire codec owns the format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreEnvelope {
    /// Record key (the publishing node's stable id)
    pub key: String,
    
    /// Serialized record
    pub payload: Vec<u8>,
    
    /// Server-assigned write time, filled in by the store on delivery
    pub server_ts_ms: Option<u64>,
}

impl StoreEnvelope {
    /// Creates an outbound envelope; the store assigns the timestamp.
    pub fn new(key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            payload,
            server_ts_ms: None,
        }
    }
}

/// Inbound change notification for another node's record.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// A record was added or overwritten.
    Changed(StoreEnvelope),
    
    /// A record was deleted by its owner.
    Removed { key: String },
}

impl StoreEvent {
    /// Returns the key this event concerns.
    pub fn key(&self) -> &str {
        match self {
            StoreEvent::Changed(envelope) => &envelope.key,
            StoreEvent::Removed { key } => key,
        }
    }
}
