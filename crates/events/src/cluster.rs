//! Cluster-state collaborator: watch streams, point reads and apply.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use driftwatch_core::{
    ConfigDocument, FieldPath, Labels, ObservedResource, ResourceIdentity, ResourceKind,
    ResourceStatus,
};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::debug;

use crate::error::{Error, Result};

/// Kind of change reported by a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Updated,
    Deleted,
}

impl ChangeKind {
    /// Combine two changes to the same identity inside one debounce window.
    ///
    /// A resource added and then updated is still new to the consumer; a
    /// delete followed by an add is an update of what the consumer knew.
    #[must_use]
    pub const fn coalesce(self, later: Self) -> Self {
        match (self, later) {
            (Self::Added, Self::Updated) => Self::Added,
            (Self::Deleted, Self::Added) => Self::Updated,
            (_, later) => later,
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Added => write!(f, "added"),
            Self::Updated => write!(f, "updated"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

/// One change delivered by a watch stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub change: ChangeKind,
    pub resource: ObservedResource,
}

impl WatchEvent {
    pub const fn new(change: ChangeKind, resource: ObservedResource) -> Self {
        Self { change, resource }
    }
}

/// Whether `labels` satisfy an equality selector.
pub fn selector_matches(selector: &Labels, labels: &Labels) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

/// Live cluster API as seen by the engine.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Incremental changes for one kind, filtered by label selector.
    async fn watch(
        &self,
        kind: &ResourceKind,
        selector: &Labels,
    ) -> Result<BoxStream<'static, Result<WatchEvent>>>;

    /// Current live state of a single resource.
    async fn get(&self, identity: &ResourceIdentity) -> Result<ObservedResource>;

    /// Every live resource of `kind` matching `selector`.
    async fn list(&self, kind: &ResourceKind, selector: &Labels) -> Result<Vec<ObservedResource>>;

    /// Push a desired document to the live resource.
    async fn apply(
        &self,
        document: &ConfigDocument,
        default_namespace: &str,
    ) -> Result<ObservedResource>;
}

/// In-process cluster used by tests and fixture-driven runs.
///
/// Every mutation bumps a global revision counter and is broadcast to
/// watchers. Failures can be queued to exercise retry paths.
pub struct InMemoryCluster {
    resources: RwLock<BTreeMap<ResourceIdentity, ObservedResource>>,
    events: broadcast::Sender<WatchEvent>,
    revision: AtomicU64,
    watch_failures: Mutex<VecDeque<Error>>,
    call_failures: Mutex<VecDeque<Error>>,
    applies: AtomicU64,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            resources: RwLock::new(BTreeMap::new()),
            events,
            revision: AtomicU64::new(0),
            watch_failures: Mutex::new(VecDeque::new()),
            call_failures: Mutex::new(VecDeque::new()),
            applies: AtomicU64::new(0),
        }
    }

    fn next_revision(&self) -> String {
        (self.revision.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn publish(&self, change: ChangeKind, resource: ObservedResource) {
        debug!(change = %change, resource = %resource.identity, "Cluster change");
        // No watchers is fine.
        let _ = self.events.send(WatchEvent::new(change, resource));
    }

    async fn take_call_failure(&self) -> Result<()> {
        self.call_failures.lock().await.pop_front().map_or(Ok(()), Err)
    }

    /// Make the next `watch` call fail with `error`.
    pub async fn fail_next_watch(&self, error: Error) {
        self.watch_failures.lock().await.push_back(error);
    }

    /// Make the next `get`/`list`/`apply` call fail with `error`.
    pub async fn fail_next_call(&self, error: Error) {
        self.call_failures.lock().await.push_back(error);
    }

    /// Insert or replace a live resource, stamping a fresh revision.
    pub async fn upsert(&self, mut resource: ObservedResource) -> ObservedResource {
        resource.revision = self.next_revision();
        let change = {
            let mut resources = self.resources.write().await;
            match resources.insert(resource.identity.clone(), resource.clone()) {
                Some(_) => ChangeKind::Updated,
                None => ChangeKind::Added,
            }
        };
        self.publish(change, resource.clone());
        resource
    }

    /// Mutate one live field, as an out-of-band edit would.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the resource does not exist.
    pub async fn set_field(
        &self,
        identity: &ResourceIdentity,
        path: FieldPath,
        value: Value,
    ) -> Result<ObservedResource> {
        let updated = {
            let mut resources = self.resources.write().await;
            let resource = resources
                .get_mut(identity)
                .ok_or_else(|| Error::not_found(identity))?;
            resource.fields.insert(path, value);
            resource.revision = self.next_revision();
            resource.clone()
        };
        self.publish(ChangeKind::Updated, updated.clone());
        Ok(updated)
    }

    /// Change the reported status of a live resource.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the resource does not exist.
    pub async fn set_status(
        &self,
        identity: &ResourceIdentity,
        status: ResourceStatus,
    ) -> Result<ObservedResource> {
        let updated = {
            let mut resources = self.resources.write().await;
            let resource = resources
                .get_mut(identity)
                .ok_or_else(|| Error::not_found(identity))?;
            resource.status = status;
            resource.revision = self.next_revision();
            resource.clone()
        };
        self.publish(ChangeKind::Updated, updated.clone());
        Ok(updated)
    }

    /// Remove a live resource.
    pub async fn delete(&self, identity: &ResourceIdentity) -> Option<ObservedResource> {
        let removed = self.resources.write().await.remove(identity);
        if let Some(resource) = &removed {
            self.publish(ChangeKind::Deleted, resource.clone());
        }
        removed
    }

    /// Snapshot of a live resource without failure injection.
    pub async fn snapshot(&self, identity: &ResourceIdentity) -> Option<ObservedResource> {
        self.resources.read().await.get(identity).cloned()
    }

    /// Number of successful `apply` calls.
    pub fn apply_count(&self) -> u64 {
        self.applies.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn watch(
        &self,
        kind: &ResourceKind,
        selector: &Labels,
    ) -> Result<BoxStream<'static, Result<WatchEvent>>> {
        if let Some(error) = self.watch_failures.lock().await.pop_front() {
            return Err(error);
        }

        let receiver = self.events.subscribe();
        let kind = kind.clone();
        let selector = selector.clone();
        let watched = kind.to_string();

        let stream = stream::unfold(receiver, move |mut receiver| {
            let watched = watched.clone();
            async move {
                match receiver.recv().await {
                    Ok(event) => Some((Ok(event), receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => Some((
                        Err(Error::watch_interrupted(
                            watched,
                            format!("lagged by {skipped} events"),
                        )),
                        receiver,
                    )),
                    Err(broadcast::error::RecvError::Closed) => None,
                }
            }
        })
        .filter(move |item| {
            let keep = match item {
                Ok(event) => {
                    event.resource.identity.kind == kind
                        && selector_matches(&selector, &event.resource.labels)
                }
                Err(_) => true,
            };
            futures::future::ready(keep)
        });

        Ok(stream.boxed())
    }

    async fn get(&self, identity: &ResourceIdentity) -> Result<ObservedResource> {
        self.take_call_failure().await?;
        self.resources
            .read()
            .await
            .get(identity)
            .cloned()
            .ok_or_else(|| Error::not_found(identity))
    }

    async fn list(&self, kind: &ResourceKind, selector: &Labels) -> Result<Vec<ObservedResource>> {
        self.take_call_failure().await?;
        Ok(self
            .resources
            .read()
            .await
            .values()
            .filter(|r| r.identity.kind == *kind && selector_matches(selector, &r.labels))
            .cloned()
            .collect())
    }

    async fn apply(
        &self,
        document: &ConfigDocument,
        default_namespace: &str,
    ) -> Result<ObservedResource> {
        self.take_call_failure().await?;
        let mut applied = ObservedResource::from_live_document(document, default_namespace, "0");
        let unchanged = self
            .resources
            .read()
            .await
            .get(&applied.identity)
            .filter(|live| live.fields == applied.fields && live.labels == applied.labels)
            .cloned();
        self.applies.fetch_add(1, Ordering::SeqCst);
        if let Some(live) = unchanged {
            // Server-side apply of identical content is a no-op.
            return Ok(live);
        }
        applied.status = ResourceStatus::Ready;
        Ok(self.upsert(applied).await)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn replicas() -> FieldPath {
        FieldPath::parse("spec.replicas").unwrap()
    }

    fn api() -> ObservedResource {
        ObservedResource::new(ResourceIdentity::new("Deployment", "shop", "api"), "0")
            .with_field(replicas(), json!(3))
    }

    #[test]
    fn test_coalesce_rules() {
        assert_eq!(ChangeKind::Added.coalesce(ChangeKind::Updated), ChangeKind::Added);
        assert_eq!(ChangeKind::Updated.coalesce(ChangeKind::Deleted), ChangeKind::Deleted);
        assert_eq!(ChangeKind::Deleted.coalesce(ChangeKind::Added), ChangeKind::Updated);
        assert_eq!(ChangeKind::Updated.coalesce(ChangeKind::Updated), ChangeKind::Updated);
    }

    #[tokio::test]
    async fn test_upsert_bumps_revision() {
        let cluster = InMemoryCluster::new();
        let first = cluster.upsert(api()).await;
        let second = cluster
            .set_field(&first.identity, replicas(), json!(5))
            .await
            .unwrap();
        assert_ne!(first.revision, second.revision);
        assert_eq!(second.field(&replicas()), Some(&json!(5)));
    }

    #[tokio::test]
    async fn test_watch_filters_kind_and_labels() {
        let cluster = InMemoryCluster::new();
        let selector = Labels::from([("team".to_string(), "shop".to_string())]);
        let mut stream = cluster
            .watch(&ResourceKind::Deployment, &selector)
            .await
            .unwrap();

        cluster
            .upsert(ObservedResource::new(
                ResourceIdentity::new("Service", "shop", "api"),
                "0",
            ))
            .await;
        cluster.upsert(api()).await;
        let mut labelled = api();
        labelled.identity.name = "web".to_string();
        labelled.labels.insert("team".to_string(), "shop".to_string());
        cluster.upsert(labelled).await;

        let event = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(event.change, ChangeKind::Added);
        assert_eq!(event.resource.identity.name, "web");
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let cluster = InMemoryCluster::new();
        let result = cluster
            .get(&ResourceIdentity::new("Deployment", "shop", "gone"))
            .await;
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed_once() {
        let cluster = InMemoryCluster::new();
        cluster.upsert(api()).await;
        cluster
            .fail_next_call(Error::unavailable("list", "reset"))
            .await;

        assert!(cluster.list(&ResourceKind::Deployment, &Labels::new()).await.is_err());
        assert_eq!(
            cluster
                .list(&ResourceKind::Deployment, &Labels::new())
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_apply_identical_document_is_noop() {
        let cluster = InMemoryCluster::new();
        let doc = ConfigDocument::new(json!({
            "kind": "Deployment",
            "metadata": {"name": "api", "namespace": "shop"},
            "spec": {"replicas": 3}
        }))
        .unwrap();

        let first = cluster.apply(&doc, "default").await.unwrap();
        let second = cluster.apply(&doc, "default").await.unwrap();
        assert_eq!(first.revision, second.revision);
        assert_eq!(cluster.apply_count(), 2);
    }
}
