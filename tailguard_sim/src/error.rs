//! Error types for the simulator.

use tailguard_core::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("Unknown scenario: {0} (available: tailgate, oncoming, hard_brake, dropout, retract, lossy, all)")]
    UnknownScenario(String),

    #[error("Invalid engine config: {0}")]
    Config(#[from] ConfigError),
}
