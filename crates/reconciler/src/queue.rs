//! Bounded work queue keyed by resource identity.
//!
//! A key is either waiting, in flight, or neither. Enqueueing a waiting key
//! is a no-op; enqueueing an in-flight key records a single pending
//! follow-up that is re-queued when the running pass completes. At most one
//! pass per identity is ever in flight.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use driftwatch_core::ResourceIdentity;
use serde::Serialize;
use tokio::sync::Notify;

/// Unit of work for a reconciliation worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "target", content = "resource", rename_all = "snake_case")]
pub enum WorkKey {
    /// Reconcile the units bound to one live resource.
    Resource(ResourceIdentity),
    /// Reconcile every monitored unit (fallback timer).
    Sweep,
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resource(identity) => write!(f, "{identity}"),
            Self::Sweep => f.write_str("sweep"),
        }
    }
}

/// What happened to an enqueued key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// The key was already waiting.
    Coalesced,
    /// The key is in flight; one follow-up pass is pending.
    FollowUp,
    /// The queue is at capacity; the key was dropped.
    Full,
    Closed,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<WorkKey>,
    waiting: HashSet<WorkKey>,
    in_flight: HashSet<WorkKey>,
    follow_ups: HashSet<WorkKey>,
    closed: bool,
}

impl QueueState {
    fn push(&mut self, key: WorkKey) {
        self.waiting.insert(key.clone());
        self.ready.push_back(key);
    }
}

pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl WorkQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue(&self, key: WorkKey) -> EnqueueOutcome {
        let outcome = {
            let mut state = self.lock();
            if state.closed {
                return EnqueueOutcome::Closed;
            }
            if state.waiting.contains(&key) {
                return EnqueueOutcome::Coalesced;
            }
            if state.in_flight.contains(&key) {
                state.follow_ups.insert(key);
                return EnqueueOutcome::FollowUp;
            }
            if state.ready.len() >= self.capacity {
                return EnqueueOutcome::Full;
            }
            state.push(key);
            EnqueueOutcome::Queued
        };
        self.notify.notify_one();
        outcome
    }

    /// Next key to work on, marked in flight. `None` once closed.
    pub async fn next(&self) -> Option<WorkKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if let Some(key) = state.ready.pop_front() {
                    state.waiting.remove(&key);
                    state.in_flight.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Claim `identity` for a sweep.
    ///
    /// A waiting key is taken over. An in-flight key is left alone, a
    /// follow-up is recorded, and `false` is returned.
    pub fn try_acquire(&self, identity: &ResourceIdentity) -> bool {
        let key = WorkKey::Resource(identity.clone());
        let mut state = self.lock();
        if state.in_flight.contains(&key) {
            state.follow_ups.insert(key);
            return false;
        }
        if state.waiting.remove(&key) {
            state.ready.retain(|queued| *queued != key);
        }
        state.in_flight.insert(key);
        true
    }

    /// Mark `key` done, re-queueing a pending follow-up.
    pub fn complete(&self, key: &WorkKey) {
        let requeued = {
            let mut state = self.lock();
            state.in_flight.remove(key);
            if state.follow_ups.remove(key) && !state.closed {
                state.push(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Stop handing out work. Waiting keys are dropped.
    pub fn close(&self) {
        {
            let mut state = self.lock();
            state.closed = true;
            state.ready.clear();
            state.waiting.clear();
        }
        self.notify.notify_waiters();
    }

    /// Number of waiting keys.
    pub fn len(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn key(name: &str) -> WorkKey {
        WorkKey::Resource(ResourceIdentity::new("Deployment", "shop", name))
    }

    #[tokio::test]
    async fn test_duplicate_keys_coalesce() {
        let queue = WorkQueue::new(8);
        assert_eq!(queue.enqueue(key("api")), EnqueueOutcome::Queued);
        assert_eq!(queue.enqueue(key("api")), EnqueueOutcome::Coalesced);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_in_flight_key_gets_one_follow_up() {
        let queue = WorkQueue::new(8);
        queue.enqueue(key("api"));
        let running = queue.next().await.unwrap();

        assert_eq!(queue.enqueue(key("api")), EnqueueOutcome::FollowUp);
        assert_eq!(queue.enqueue(key("api")), EnqueueOutcome::FollowUp);
        assert!(queue.is_empty());

        queue.complete(&running);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next().await.unwrap(), key("api"));
    }

    #[tokio::test]
    async fn test_full_queue_drops_new_keys() {
        let queue = WorkQueue::new(1);
        queue.enqueue(key("a"));
        assert_eq!(queue.enqueue(key("b")), EnqueueOutcome::Full);
    }

    #[tokio::test]
    async fn test_sweep_takes_over_waiting_key() {
        let queue = WorkQueue::new(8);
        queue.enqueue(key("api"));
        let identity = ResourceIdentity::new("Deployment", "shop", "api");

        assert!(queue.try_acquire(&identity));
        assert!(queue.is_empty());
        assert!(!queue.try_acquire(&identity));

        queue.complete(&key("api"));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_next_waits_for_work() {
        let queue = Arc::new(WorkQueue::new(8));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue(WorkKey::Sweep);

        assert_eq!(waiter.await.unwrap(), Some(WorkKey::Sweep));
    }

    #[tokio::test]
    async fn test_close_releases_waiters() {
        let queue = Arc::new(WorkQueue::new(8));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();

        assert_eq!(waiter.await.unwrap(), None);
        assert_eq!(queue.enqueue(key("api")), EnqueueOutcome::Closed);
    }
}
