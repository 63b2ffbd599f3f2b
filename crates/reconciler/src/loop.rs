//! Event-driven reconciliation loop.
//!
//! A dispatcher turns observer messages and fallback timer ticks into keyed
//! work; a fixed pool of workers drains the queue. A fatal observer error or
//! an unreachable registry at start-up stops the loop with
//! [`Error::LoopStopped`].

use std::sync::Arc;
use std::time::Duration;

use driftwatch_core::{ShutdownCoordinator, ShutdownSignal};
use driftwatch_events::{ChangeKind, ObserverMessage};
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

use crate::context::ReconcileContext;
use crate::error::{Error, Result};
use crate::queue::{EnqueueOutcome, WorkKey, WorkQueue};
use crate::reconciler::Reconciler;
use crate::report::{CycleReport, ReportSink};

/// Loop settings.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub workers: usize,
    /// Sweep after this long without events.
    pub poll_interval: Duration,
    pub queue_capacity: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_secs(300),
            queue_capacity: 1024,
        }
    }
}

/// Handle that stops a running loop.
#[derive(Clone)]
pub struct LoopStopper {
    shutdown: Arc<ShutdownCoordinator>,
}

impl LoopStopper {
    pub fn stop(&self) {
        self.shutdown.initiate_shutdown(ShutdownSignal::Programmatic);
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_shutdown_initiated()
    }
}

pub struct ReconciliationLoop {
    reconciler: Arc<Reconciler>,
    ctx: ReconcileContext,
    config: LoopConfig,
    sink: Arc<dyn ReportSink>,
    queue: Arc<WorkQueue>,
}

impl ReconciliationLoop {
    pub fn new(
        reconciler: Arc<Reconciler>,
        ctx: ReconcileContext,
        config: LoopConfig,
        sink: Arc<dyn ReportSink>,
    ) -> Self {
        let queue = Arc::new(WorkQueue::new(config.queue_capacity));
        Self {
            reconciler,
            ctx,
            config,
            sink,
            queue,
        }
    }

    pub fn stopper(&self) -> LoopStopper {
        LoopStopper {
            shutdown: self.ctx.shutdown.clone(),
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// One sweep over every monitored unit, outside the loop.
    pub async fn run_once(&self) -> CycleReport {
        let report = self
            .reconciler
            .run_cycle(&self.ctx, &WorkKey::Sweep, None)
            .await;
        self.sink.publish(&report).await;
        report
    }

    /// Run until shutdown, the observer channel closing, or a fatal error.
    ///
    /// In-flight passes finish before this returns; queued work is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LoopStopped`] when the registry is unreachable at
    /// start-up or the observer reports a fatal error. Shutdown is initiated
    /// with [`ShutdownSignal::Fatal`] in both cases.
    pub async fn run(&self, mut events: mpsc::Receiver<ObserverMessage>) -> Result<()> {
        if let Err(e) = self.ctx.provider.monitored_units(&self.ctx.monitored).await {
            error!(error = %e, "Registry unreachable at start-up");
            self.ctx.shutdown.initiate_shutdown(ShutdownSignal::Fatal);
            return Err(Error::LoopStopped {
                reason: format!("registry unreachable: {e}"),
            });
        }

        let workers: Vec<_> = (0..self.config.workers.max(1))
            .map(|id| {
                tokio::spawn(worker(
                    id,
                    self.reconciler.clone(),
                    self.ctx.clone(),
                    self.queue.clone(),
                    self.sink.clone(),
                ))
            })
            .collect();
        info!(
            workers = workers.len(),
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Reconciliation loop started"
        );

        let result = self.dispatch(&mut events).await;

        self.queue.close();
        for joined in join_all(workers).await {
            if let Err(e) = joined {
                warn!(error = %e, "Reconciliation worker ended abnormally");
            }
        }
        info!("Reconciliation loop stopped");
        result
    }

    async fn dispatch(&self, events: &mut mpsc::Receiver<ObserverMessage>) -> Result<()> {
        let mut deadline = Instant::now() + self.config.poll_interval;
        loop {
            tokio::select! {
                biased;
                () = self.ctx.shutdown.wait() => {
                    debug!("Dispatcher observed shutdown");
                    return Ok(());
                }
                message = events.recv() => match message {
                    Some(ObserverMessage::Change(event)) => {
                        deadline = Instant::now() + self.config.poll_interval;
                        if event.change == ChangeKind::Deleted {
                            debug!(resource = %event.resource.identity, "Ignoring deletion");
                            continue;
                        }
                        let identity = event.resource.identity;
                        match self.queue.enqueue(WorkKey::Resource(identity.clone())) {
                            EnqueueOutcome::Full => {
                                warn!(resource = %identity, "Work queue full, dropping event");
                            }
                            outcome => debug!(resource = %identity, outcome = ?outcome, "Event dispatched"),
                        }
                    }
                    Some(ObserverMessage::Fatal(e)) => {
                        error!(error = %e, "Observer failed, halting");
                        self.ctx.shutdown.initiate_shutdown(ShutdownSignal::Fatal);
                        return Err(Error::LoopStopped {
                            reason: e.to_string(),
                        });
                    }
                    None => {
                        info!("Observer channel closed");
                        return Ok(());
                    }
                },
                () = sleep_until(deadline) => {
                    deadline = Instant::now() + self.config.poll_interval;
                    debug!("No events within poll interval, sweeping");
                    self.queue.enqueue(WorkKey::Sweep);
                }
            }
        }
    }
}

async fn worker(
    id: usize,
    reconciler: Arc<Reconciler>,
    ctx: ReconcileContext,
    queue: Arc<WorkQueue>,
    sink: Arc<dyn ReportSink>,
) {
    debug!(worker = id, "Worker started");
    while let Some(key) = queue.next().await {
        let report = reconciler.run_cycle(&ctx, &key, Some(&queue)).await;
        queue.complete(&key);
        sink.publish(&report).await;
    }
    debug!(worker = id, "Worker stopped");
}
