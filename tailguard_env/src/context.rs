//! Core environment context trait for Tailguard hosts.

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, SystemTime};

/// The clock and task interface a host hands to the proximity engine.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time` and the system clock
/// - **Simulation**: `SimContext` - a manually advanced virtual clock
///
/// All engine timestamps (sample capture, peer `last_seen_at`, throttle and
/// cool-down bookkeeping) are durations on this monotonic clock.
#[async_trait]
pub trait DriveContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    fn now(&self) -> Duration;
    
    /// Returns the wall-clock time, used only for log correlation.
    fn system_time(&self) -> SystemTime;
    
    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances virtual clock
    async fn sleep(&self, duration: Duration);
    
    /// Spawns a background task (sample pump, gateway listener, eviction tick).
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;
    
    /// Returns the context's seed (0 in production).
    fn seed(&self) -> u64;
}
