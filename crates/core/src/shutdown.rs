//! Graceful shutdown coordination.
//!
//! A single [`ShutdownCoordinator`] is shared by the observer, the dispatcher
//! and the workers. Once shutdown is initiated the observer stops watching,
//! the dispatcher stops accepting events and workers drain in-flight work.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownSignal {
    /// SIGTERM signal received
    Sigterm,
    /// SIGINT signal received (Ctrl+C)
    Sigint,
    /// Unrecoverable failure in a component
    Fatal,
    /// Programmatic shutdown requested
    Programmatic,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sigterm => write!(f, "SIGTERM"),
            Self::Sigint => write!(f, "SIGINT"),
            Self::Fatal => write!(f, "FATAL"),
            Self::Programmatic => write!(f, "PROGRAMMATIC"),
        }
    }
}

/// Shutdown coordinator for graceful system shutdown
#[derive(Debug)]
pub struct ShutdownCoordinator {
    /// Whether shutdown has been initiated
    shutdown_initiated: AtomicBool,
    /// Broadcast channel for shutdown signal
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_initiated: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    /// Check if shutdown has been initiated
    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Acquire)
    }

    /// Subscribe to shutdown notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.shutdown_tx.subscribe()
    }

    /// Initiate graceful shutdown. Duplicate signals are ignored.
    ///
    /// Returns whether this call initiated the shutdown.
    pub fn initiate_shutdown(&self, signal: ShutdownSignal) -> bool {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Shutdown already in progress, ignoring duplicate signal");
            return false;
        }

        info!(
            signal = %signal,
            subscribers = self.shutdown_tx.receiver_count(),
            "Initiating graceful shutdown"
        );

        if let Err(e) = self.shutdown_tx.send(signal) {
            debug!("No active subscribers for shutdown signal: {}", e);
        }
        true
    }

    /// Resolve once shutdown has been initiated, including before this call.
    pub async fn wait(&self) {
        let mut rx = self.subscribe();
        if self.is_shutdown_initiated() {
            return;
        }
        // Lagged or closed both mean the signal was sent.
        let _ = rx.recv().await;
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_duplicate_signal_is_ignored() {
        let coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.is_shutdown_initiated());
        assert!(coordinator.initiate_shutdown(ShutdownSignal::Sigint));
        assert!(!coordinator.initiate_shutdown(ShutdownSignal::Sigterm));
        assert!(coordinator.is_shutdown_initiated());
    }

    #[tokio::test]
    async fn test_subscribers_receive_signal() {
        let coordinator = ShutdownCoordinator::new();
        let mut rx = coordinator.subscribe();
        coordinator.initiate_shutdown(ShutdownSignal::Programmatic);
        assert!(matches!(rx.recv().await, Ok(ShutdownSignal::Programmatic)));
    }

    #[tokio::test]
    async fn test_wait_returns_after_late_subscription() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.initiate_shutdown(ShutdownSignal::Fatal);
        let waited = tokio::time::timeout(Duration::from_secs(1), coordinator.wait()).await;
        assert!(waited.is_ok());
    }

    #[tokio::test]
    async fn test_wait_wakes_on_signal() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        coordinator.initiate_shutdown(ShutdownSignal::Sigterm);
        let joined = tokio::time::timeout(Duration::from_secs(1), waiter).await;
        assert!(matches!(joined, Ok(Ok(()))));
    }
}
