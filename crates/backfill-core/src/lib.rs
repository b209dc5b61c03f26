//! backfill-core: snapshot-driven document backfill with convergence tracking
//!
//! This crate moves documents from a source store to a target store through
//! four cooperating parts:
//!
//! - [`snapshot::SnapshotCoordinator`] captures a durable point-in-time view
//!   of the source.
//! - [`scheduler::BackfillScheduler`] leases snapshot shards to a scalable pool
//!   of worker units.
//! - [`transform::TransformerPipeline`] expands each source document into its
//!   target copies.
//! - [`progress::ProgressTracker`] polls target counts until they stabilize.
//!
//! [`context::RunContext`] drives all of them end to end.

#![forbid(unsafe_code)]

pub mod clock;
pub mod cluster;
pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod progress;
pub mod retry;
pub mod scheduler;
pub mod snapshot;
pub mod transform;
pub mod verify;
pub mod wait;

pub use error::{Error, Result};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
