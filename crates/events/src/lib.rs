//! Live-state observation for driftwatch.
//!
//! - **Cluster collaborator**: watch streams, point reads and apply ([`ClusterClient`])
//! - **In-memory cluster**: broadcast-backed implementation for tests and fixtures
//! - **Observer**: per-kind watch tasks with snapshot replay, debounce and re-subscription
//! - **Backoff**: exponential retry for transient failures
//!
//! # Example
//!
//! ```ignore
//! use driftwatch_events::{ActualStateObserver, InMemoryCluster, ObserverConfig};
//! use driftwatch_core::ShutdownCoordinator;
//! use std::sync::Arc;
//!
//! let cluster = Arc::new(InMemoryCluster::new());
//! let shutdown = Arc::new(ShutdownCoordinator::new());
//! let (mut events, handle) =
//!     ActualStateObserver::new(cluster, ObserverConfig::default(), shutdown).spawn();
//! while let Some(message) = events.recv().await {
//!     println!("{message:?}");
//! }
//! handle.join().await;
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod backoff;
pub mod cluster;
pub mod error;
pub mod observer;

pub use backoff::{RetryPolicy, retry_transient};
pub use cluster::{ChangeKind, ClusterClient, InMemoryCluster, WatchEvent, selector_matches};
pub use error::{Error, Result};
pub use observer::{ActualStateObserver, ObserverConfig, ObserverHandle, ObserverMessage};
