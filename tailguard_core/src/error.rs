//! Error types for the proximity engine.
//!
//! None of these is fatal: every `IngestError` means "ignore this update".

use thiserror::Error;

/// Why an inbound self sample or peer record was not applied.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IngestError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    
    #[error("Field {0} is not a finite number")]
    NonFinite(&'static str),
    
    #[error("Field {field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },
    
    #[error("Record could not be decoded: {0}")]
    Decode(String),
    
    /// Elapsed time since the previous sample was zero or negative
    #[error("Stale timestamp: {elapsed_ms}ms since previous sample")]
    StaleTimestamp { elapsed_ms: i128 },
    
    /// The record carries this vehicle's own id (store echo)
    #[error("Record echoes the local vehicle")]
    SelfEcho,
}

impl IngestError {
    /// Malformed records are counted separately from benign rejects.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            IngestError::MissingField(_)
                | IngestError::NonFinite(_)
                | IngestError::OutOfRange { .. }
                | IngestError::Decode(_)
        )
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(e: serde_json::Error) -> Self {
        IngestError::Decode(e.to_string())
    }
}

/// Rejected engine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    
    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    
    #[error("Config read error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid { field, reason: reason.into() }
    }
}
