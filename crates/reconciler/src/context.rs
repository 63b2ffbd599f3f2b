//! Reconciliation context passed through every cycle.
//!
//! Every collaborator call made on behalf of a cycle is bounded by a timeout
//! and raced against shutdown. Registry calls get this through
//! [`BoundedRegistry`], cluster reads through [`ReconcileContext::observe`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use driftwatch_core::{
    DesiredUnit, MonitoredScope, ObservedResource, Patch, ResourceIdentity, ScopeId, ScopeTree,
    ShutdownCoordinator, UnitFilter, UnitId, UnitSet,
};
use driftwatch_events::{ClusterClient, RetryPolicy, retry_transient};

use crate::error::{Error, Result};
use crate::propagation::PropagationReport;
use crate::provider::{DesiredStateProvider, RegistryDesiredStateProvider};
use crate::registry::Registry;

/// Run `fut` bounded by `limit` and cancelled by shutdown.
///
/// # Errors
///
/// Returns [`Error::Timeout`] when `limit` elapses, [`Error::Cancelled`] when
/// shutdown is initiated first, or the call's own error.
pub async fn bounded<T, Fut>(
    shutdown: &ShutdownCoordinator,
    operation: &str,
    limit: Duration,
    fut: Fut,
) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        () = shutdown.wait() => Err(Error::Cancelled),
        result = tokio::time::timeout(limit, fut) => {
            result.map_err(|_| Error::timeout(operation, limit))?
        }
    }
}

/// Timeouts and retry policy for collaborator calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallBounds {
    pub registry_timeout: Duration,
    pub cluster_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for CallBounds {
    fn default() -> Self {
        Self {
            registry_timeout: Duration::from_secs(30),
            cluster_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// Registry decorator bounding every call.
pub struct BoundedRegistry {
    inner: Arc<dyn Registry>,
    shutdown: Arc<ShutdownCoordinator>,
    timeout: Duration,
}

impl BoundedRegistry {
    pub fn new(
        inner: Arc<dyn Registry>,
        shutdown: Arc<ShutdownCoordinator>,
        timeout: Duration,
    ) -> Self {
        Self {
            inner,
            shutdown,
            timeout,
        }
    }

    async fn call<T, Fut>(&self, operation: &str, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        bounded(&self.shutdown, operation, self.timeout, fut).await
    }
}

#[async_trait]
impl Registry for BoundedRegistry {
    async fn list_units(&self, scope: &ScopeId, filter: &UnitFilter) -> Result<Vec<DesiredUnit>> {
        self.call("registry.list_units", self.inner.list_units(scope, filter))
            .await
    }

    async fn get_unit(&self, id: UnitId) -> Result<DesiredUnit> {
        self.call("registry.get_unit", self.inner.get_unit(id)).await
    }

    async fn update_unit(
        &self,
        id: UnitId,
        base_version: u64,
        patch: &Patch,
    ) -> Result<DesiredUnit> {
        self.call(
            "registry.update_unit",
            self.inner.update_unit(id, base_version, patch),
        )
        .await
    }

    async fn apply_unit(&self, id: UnitId) -> Result<()> {
        self.call("registry.apply_unit", self.inner.apply_unit(id)).await
    }

    async fn bulk_patch(
        &self,
        scope: &ScopeId,
        filter: &UnitFilter,
        patch: &Patch,
        propagate_downstream: bool,
    ) -> Result<Vec<PropagationReport>> {
        self.call(
            "registry.bulk_patch",
            self.inner
                .bulk_patch(scope, filter, patch, propagate_downstream),
        )
        .await
    }

    async fn downstream_units(&self, id: UnitId) -> Result<Vec<DesiredUnit>> {
        self.call("registry.downstream_units", self.inner.downstream_units(id))
            .await
    }

    async fn scopes(&self) -> Result<ScopeTree> {
        self.call("registry.scopes", self.inner.scopes()).await
    }

    async fn get_set(&self, name: &str) -> Result<UnitSet> {
        self.call("registry.get_set", self.inner.get_set(name)).await
    }
}

/// Everything one reconciliation cycle needs, with no global state.
#[derive(Clone)]
pub struct ReconcileContext {
    pub monitored: MonitoredScope,
    pub provider: Arc<dyn DesiredStateProvider>,
    /// Bounded registry handle.
    pub registry: Arc<dyn Registry>,
    pub cluster: Arc<dyn ClusterClient>,
    pub shutdown: Arc<ShutdownCoordinator>,
    pub bounds: CallBounds,
}

impl ReconcileContext {
    /// Wrap `registry` in call bounds and derive a registry-backed provider.
    pub fn new(
        monitored: MonitoredScope,
        registry: Arc<dyn Registry>,
        cluster: Arc<dyn ClusterClient>,
        shutdown: Arc<ShutdownCoordinator>,
        bounds: CallBounds,
    ) -> Self {
        let registry: Arc<dyn Registry> = Arc::new(BoundedRegistry::new(
            registry,
            shutdown.clone(),
            bounds.registry_timeout,
        ));
        let provider = Arc::new(RegistryDesiredStateProvider::new(
            registry.clone(),
            bounds.retry,
        ));
        Self {
            monitored,
            provider,
            registry,
            cluster,
            shutdown,
            bounds,
        }
    }

    /// Builder: replace the desired-state provider.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn DesiredStateProvider>) -> Self {
        self.provider = provider;
        self
    }

    /// Fetch the live resource, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns the final error; a vanished resource is `NotFound`-class.
    pub async fn observe(&self, identity: &ResourceIdentity) -> Result<ObservedResource> {
        retry_transient(&self.bounds.retry, "cluster.get", || {
            bounded(
                &self.shutdown,
                "cluster.get",
                self.bounds.cluster_timeout,
                async { Ok(self.cluster.get(identity).await?) },
            )
        })
        .await
    }
}
