//! Actual-state observer.
//!
//! One watch task per resource kind feeds a debouncer, which coalesces bursts
//! for the same identity and hands normalized events to the consumer over a
//! bounded channel. Each (re)subscription is followed by a full snapshot of
//! `Added` events, so consumers see every live resource at least once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use driftwatch_core::{
    Classify, ErrorClass, Labels, ResourceIdentity, ResourceKind, ShutdownCoordinator,
};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

use crate::backoff::RetryPolicy;
use crate::cluster::{ChangeKind, ClusterClient, WatchEvent};
use crate::error::Error;

/// Message delivered to the observer's consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverMessage {
    Change(WatchEvent),
    /// A watch could not be established; the consumer must halt.
    Fatal(Error),
}

/// Observer settings.
#[derive(Debug, Clone)]
pub struct ObserverConfig {
    pub kinds: Vec<ResourceKind>,
    pub selector: Labels,
    pub debounce: Duration,
    /// Backoff between re-subscriptions. Exhausting it before the first
    /// successful subscription is fatal.
    pub retry: RetryPolicy,
    pub channel_capacity: usize,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            kinds: vec![ResourceKind::Deployment],
            selector: Labels::new(),
            debounce: Duration::from_secs(2),
            retry: RetryPolicy::new(5, 200, 30_000),
            channel_capacity: 256,
        }
    }
}

enum Raw {
    Event { event: WatchEvent, immediate: bool },
    Fatal(Error),
}

struct Pending {
    event: WatchEvent,
    deadline: Instant,
}

/// Handle to the observer's background tasks.
pub struct ObserverHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl ObserverHandle {
    /// Wait for every watch task and the debouncer to exit.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Observer task ended abnormally");
            }
        }
    }
}

/// Watches the cluster and emits debounced, normalized change events.
pub struct ActualStateObserver {
    client: Arc<dyn ClusterClient>,
    config: ObserverConfig,
    shutdown: Arc<ShutdownCoordinator>,
}

impl ActualStateObserver {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        config: ObserverConfig,
        shutdown: Arc<ShutdownCoordinator>,
    ) -> Self {
        Self {
            client,
            config,
            shutdown,
        }
    }

    /// Start watching. Returns the consumer side of the event channel.
    ///
    /// The channel closes once shutdown is initiated and all tasks exit.
    pub fn spawn(self) -> (mpsc::Receiver<ObserverMessage>, ObserverHandle) {
        let capacity = self.config.channel_capacity.max(1);
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let (raw_tx, raw_rx) = mpsc::channel(capacity);

        let mut tasks: Vec<JoinHandle<()>> = self
            .config
            .kinds
            .iter()
            .cloned()
            .map(|kind| {
                let watcher = KindWatcher {
                    client: Arc::clone(&self.client),
                    kind,
                    selector: self.config.selector.clone(),
                    retry: self.config.retry,
                    shutdown: Arc::clone(&self.shutdown),
                    raw: raw_tx.clone(),
                };
                tokio::spawn(watcher.run())
            })
            .collect();
        drop(raw_tx);

        tasks.push(tokio::spawn(debounce(
            raw_rx,
            out_tx,
            self.config.debounce,
            Arc::clone(&self.shutdown),
        )));

        info!(kinds = self.config.kinds.len(), "Observer started");
        (out_rx, ObserverHandle { tasks })
    }
}

struct KindWatcher {
    client: Arc<dyn ClusterClient>,
    kind: ResourceKind,
    selector: Labels,
    retry: RetryPolicy,
    shutdown: Arc<ShutdownCoordinator>,
    raw: mpsc::Sender<Raw>,
}

enum Session {
    /// Stream ended or failed transiently; subscribe again.
    Resubscribe,
    Stop,
}

impl KindWatcher {
    async fn run(self) {
        let mut connected_once = false;
        let mut failures: u32 = 0;

        while !self.shutdown.is_shutdown_initiated() {
            let subscribed = tokio::select! {
                () = self.shutdown.wait() => return,
                result = self.client.watch(&self.kind, &self.selector) => result,
            };

            let outcome = match subscribed {
                Ok(stream) => {
                    connected_once = true;
                    failures = 0;
                    debug!(kind = %self.kind, "Watch subscribed");
                    self.session(stream).await
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(Session::Stop) => return,
                Ok(Session::Resubscribe) => {
                    failures = failures.saturating_add(1);
                }
                Err(e) if e.class() == ErrorClass::Fatal => {
                    self.fatal(e).await;
                    return;
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    if !connected_once && !self.retry.is_retryable(failures) {
                        self.fatal(e).await;
                        return;
                    }
                    warn!(kind = %self.kind, attempt = failures, error = %e, "Watch failed, retrying");
                }
            }

            let delay = self.retry.calculate_backoff(failures.max(1));
            tokio::select! {
                () = self.shutdown.wait() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn session(
        &self,
        mut stream: futures::stream::BoxStream<'static, crate::error::Result<WatchEvent>>,
    ) -> crate::error::Result<Session> {
        let snapshot = tokio::select! {
            () = self.shutdown.wait() => return Ok(Session::Stop),
            listed = self.client.list(&self.kind, &self.selector) => listed?,
        };
        debug!(kind = %self.kind, resources = snapshot.len(), "Replaying snapshot");
        for resource in snapshot {
            let event = WatchEvent::new(ChangeKind::Added, resource);
            if self.raw.send(Raw::Event { event, immediate: true }).await.is_err() {
                return Ok(Session::Stop);
            }
        }

        loop {
            let next = tokio::select! {
                () = self.shutdown.wait() => return Ok(Session::Stop),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(event)) => {
                    if self.raw.send(Raw::Event { event, immediate: false }).await.is_err() {
                        return Ok(Session::Stop);
                    }
                }
                Some(Err(e)) if e.class() == ErrorClass::Fatal => return Err(e),
                Some(Err(e)) => {
                    warn!(kind = %self.kind, error = %e, "Watch stream interrupted");
                    return Ok(Session::Resubscribe);
                }
                None => {
                    debug!(kind = %self.kind, "Watch stream ended");
                    return Ok(Session::Resubscribe);
                }
            }
        }
    }

    async fn fatal(&self, e: Error) {
        error!(kind = %self.kind, error = %e, "Watch cannot be established");
        let _ = self.raw.send(Raw::Fatal(e)).await;
    }
}

async fn debounce(
    mut raw: mpsc::Receiver<Raw>,
    out: mpsc::Sender<ObserverMessage>,
    window: Duration,
    shutdown: Arc<ShutdownCoordinator>,
) {
    let mut pending: HashMap<ResourceIdentity, Pending> = HashMap::new();

    loop {
        let next_deadline = pending.values().map(|p| p.deadline).min();
        let wake = async move {
            match next_deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            () = shutdown.wait() => break,
            () = wake => {
                let now = Instant::now();
                let due: Vec<ResourceIdentity> = pending
                    .iter()
                    .filter(|(_, p)| p.deadline <= now)
                    .map(|(id, _)| id.clone())
                    .collect();
                for identity in due {
                    if let Some(p) = pending.remove(&identity) {
                        if out.send(ObserverMessage::Change(p.event)).await.is_err() {
                            return;
                        }
                    }
                }
            }
            message = raw.recv() => match message {
                None => break,
                Some(Raw::Fatal(e)) => {
                    if out.send(ObserverMessage::Fatal(e)).await.is_err() {
                        return;
                    }
                }
                Some(Raw::Event { event, immediate }) => {
                    let identity = event.resource.identity.clone();
                    let merged = match pending.remove(&identity) {
                        Some(previous) => Pending {
                            event: WatchEvent::new(
                                previous.event.change.coalesce(event.change),
                                event.resource,
                            ),
                            deadline: previous.deadline,
                        },
                        None => Pending {
                            event,
                            deadline: Instant::now() + window,
                        },
                    };
                    if immediate {
                        if out.send(ObserverMessage::Change(merged.event)).await.is_err() {
                            return;
                        }
                    } else {
                        pending.insert(identity, merged);
                    }
                }
            },
        }
    }

    debug!(dropped = pending.len(), "Debouncer stopped");
}
