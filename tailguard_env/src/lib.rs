//! Tailguard Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" boundary that lets the Tailguard
//! proximity engine run unchanged inside a production host (tokio, a real
//! remote store) or inside the deterministic simulator.
//!
//! # Core Concept
//!
//! The engine itself owns no thread, timer or socket. Everything that can
//! suspend or fail lives behind two traits:
//! - Time (`now()`, `sleep()`) via [`DriveContext`]
//! - Delivery of self-state outward and peer-state inward via [`SyncGateway`]
//!
//! # Example
//!
//! ```ignore
//! use tailguard_env::{DriveContext, SyncGateway, StoreEvent};
//!
//! async fn host_loop<Ctx: DriveContext, Gw: SyncGateway>(ctx: &Ctx, gw: &Gw) {
//!     loop {
//!         tokio::select! {
//!             Some(event) = gw.recv() => handle_store_event(event, ctx.now()),
//!             _ = ctx.sleep(Duration::from_secs(5)) => eviction_tick(ctx.now()),
//!         }
//!     }
//! }
//! ```

mod context;
mod gateway;
mod types;
mod error;
mod tokio_impl;

pub use context::DriveContext;
pub use gateway::{SyncGateway, GatewayController};
pub use types::{NodeId, StoreEnvelope, StoreEvent};
pub use error::EnvError;
pub use tokio_impl::TokioContext;
