//! Tailguard Deterministic Road Simulation
//!
//! A controlled road where several vehicles, each running its own
//! `ProximityEngine`, share state through a simulated realtime store.
//!
//! # Core Principle: Nothing Moves Unless The Runner Moves It
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: Virtual clock advances one tick at a time
//! - **Store**: Writes queue until the runner pumps them; delivery honours
//!   partitions and per-link loss
//! - **Randomness**: GPS noise and link loss draw from separate streams of
//!   one 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ScenarioRunner                         │
//! │                                                             │
//! │  ┌─────────┐   publish    ┌──────────┐   notify ┌─────────┐ │
//! │  │ Engine  │─────────────►│ SimStore │─────────►│ Engine  │ │
//! │  │ (ego)   │◄─────────────│  (LWW)   │◄─────────│ (peer)  │ │
//! │  └────▲────┘    notify    └──────────┘  publish └────▲────┘ │
//! │       │ GPS fix                              GPS fix │      │
//! │  ┌────┴──────────────────────────────────────────────┴───┐  │
//! │  │                 Oracle (ground truth)                 │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use tailguard_sim::ScenarioRunner;
//! use tailguard_sim::scenarios::ScenarioId;
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::Tailgate).await;
//! assert!(result.passed);
//! ```

mod context;
mod error;
mod oracle;
mod runner;
mod store;
pub mod scenarios;

pub use context::SimContext;
pub use error::SimError;
pub use oracle::{GpsFix, Oracle, SimVehicle};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use store::{SimGateway, SimStore, SimStoreController, StoreCommand, StoreMetrics, StoreOp};
