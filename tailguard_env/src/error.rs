//! Error types for the Tailguard environment abstraction.

use thiserror::Error;

/// Errors surfaced by the sync boundary. The engine never sees these; the
/// host decides whether to retry, log or surface them to the driver.
#[derive(Debug, Error)]
pub enum EnvError {
    /// The gateway channel is closed (host shutting down, store disconnected)
    #[error("Gateway closed: {0}")]
    GatewayClosed(String),
    
    /// The store is unreachable from this node (simulated partition, offline)
    #[error("Store unreachable from node {0}")]
    Unreachable(String),
    
    /// Record serialization failed before it reached the store
    #[error("Serialization error: {0}")]
    Serialization(String),
    
    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a closed-gateway error.
    pub fn closed(msg: impl Into<String>) -> Self {
        Self::GatewayClosed(msg.into())
    }
    
    /// Creates an unreachable error.
    pub fn unreachable(node: impl std::fmt::Display) -> Self {
        Self::Unreachable(node.to_string())
    }
}
