//! Desired-state provider: resolves the monitored units of a scope.

use std::sync::Arc;

use async_trait::async_trait;
use driftwatch_core::{DesiredUnit, MonitoredScope};
use driftwatch_events::{RetryPolicy, retry_transient};
use tracing::debug;

use crate::error::Result;
use crate::registry::Registry;

/// Source of the desired units the engine monitors.
#[async_trait]
pub trait DesiredStateProvider: Send + Sync {
    /// Units selected by the scope's filter and optional Set.
    async fn monitored_units(&self, scope: &MonitoredScope) -> Result<Vec<DesiredUnit>>;
}

/// Provider reading from a [`Registry`], retrying transient failures.
pub struct RegistryDesiredStateProvider {
    registry: Arc<dyn Registry>,
    retry: RetryPolicy,
}

impl RegistryDesiredStateProvider {
    pub fn new(registry: Arc<dyn Registry>, retry: RetryPolicy) -> Self {
        Self { registry, retry }
    }
}

#[async_trait]
impl DesiredStateProvider for RegistryDesiredStateProvider {
    async fn monitored_units(&self, scope: &MonitoredScope) -> Result<Vec<DesiredUnit>> {
        let filter = match &scope.set {
            Some(name) => {
                let set = retry_transient(&self.retry, "registry.get_set", || {
                    self.registry.get_set(name)
                })
                .await?;
                scope.filter.clone().within(&set)
            }
            None => scope.filter.clone(),
        };

        let units = retry_transient(&self.retry, "registry.list_units", || {
            self.registry.list_units(&scope.scope, &filter)
        })
        .await?;
        debug!(scope = %scope.scope, units = units.len(), "Monitored units resolved");
        Ok(units)
    }
}
