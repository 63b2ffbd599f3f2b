#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # driftwatch
//!
//! Drift detection and push-upgrade reconciliation between a configuration
//! registry and a live cluster.
//!
//! The binary wires the workspace crates together; this library exposes that
//! wiring so it can be tested.

pub use driftwatch_core;
pub use driftwatch_events;
pub use driftwatch_reconciler;

pub mod cli;
pub mod commands;
pub mod fixture;
