//! Fixture files describing a registry and a cluster in one document.
//!
//! ```yaml
//! scopes:
//!   - name: base
//!   - name: prod
//!     upstream: base
//! units:
//!   - slug: api
//!     scope: base
//!     document: { kind: Deployment, metadata: { name: api }, spec: { replicas: 3 } }
//!   - slug: api
//!     scope: prod
//!     from: base
//!     document: { kind: Deployment, metadata: { name: api }, spec: { replicas: 3 } }
//! resources:
//!   - document: { kind: Deployment, metadata: { name: api }, spec: { replicas: 3 } }
//!     drift: { spec.replicas: 5 }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use driftwatch_core::{
    ConfigDocument, DesiredUnit, FieldPath, Labels, ObservedResource, ResourceStatus, ScopeId,
    ScopeTree, UnitId,
};
use driftwatch_events::InMemoryCluster;
use driftwatch_reconciler::InMemoryRegistry;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Fixture {
    #[serde(default)]
    pub scopes: Vec<FixtureScope>,
    #[serde(default)]
    pub units: Vec<FixtureUnit>,
    #[serde(default)]
    pub resources: Vec<FixtureResource>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixtureScope {
    pub name: String,
    #[serde(default)]
    pub upstream: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixtureUnit {
    pub slug: String,
    pub scope: String,
    /// Upstream scope holding the unit with the same slug this one was cloned from.
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub labels: Labels,
    pub document: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixtureResource {
    pub document: Value,
    /// Live values that differ from the document, keyed by dotted path.
    #[serde(default)]
    pub drift: BTreeMap<String, Value>,
    /// Failed reconciliation reason reported by the cluster.
    #[serde(default)]
    pub failed: Option<String>,
}

/// Registry and cluster populated from a fixture.
pub struct Installed {
    pub registry: Arc<InMemoryRegistry>,
    pub cluster: Arc<InMemoryCluster>,
}

impl Fixture {
    /// Read a fixture; `.json` files are JSON, anything else YAML.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixture {}", path.display()))?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            serde_json::from_str(&content)
                .with_context(|| format!("Invalid JSON fixture {}", path.display()))
        } else {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Invalid YAML fixture {}", path.display()))
        }
    }

    fn scope_tree(&self) -> Result<ScopeTree> {
        let mut tree = ScopeTree::new();
        for scope in &self.scopes {
            tree.add_scope(
                ScopeId::from(scope.name.as_str()),
                scope.upstream.as_deref().map(ScopeId::from),
            )
            .with_context(|| format!("Invalid scope '{}'", scope.name))?;
        }
        Ok(tree)
    }

    /// Build the in-memory collaborators. Units are inserted in file order,
    /// so a unit's upstream copy must come before it.
    ///
    /// # Errors
    ///
    /// Returns error for malformed documents, unknown scopes or paths, and
    /// units whose upstream copy is missing.
    pub async fn install(&self, namespace: &str) -> Result<Installed> {
        let cluster = Arc::new(InMemoryCluster::new());
        let registry = Arc::new(
            InMemoryRegistry::new(self.scope_tree()?).with_cluster(cluster.clone(), namespace),
        );

        let mut inserted: BTreeMap<(String, String), UnitId> = BTreeMap::new();
        for entry in &self.units {
            let document = ConfigDocument::new(entry.document.clone())
                .with_context(|| format!("Invalid document for unit '{}'", entry.slug))?;
            let mut unit = DesiredUnit::new(
                entry.slug.clone(),
                ScopeId::from(entry.scope.as_str()),
                document,
            );
            unit.labels.clone_from(&entry.labels);
            if let Some(from) = &entry.from {
                let upstream = inserted
                    .get(&(from.clone(), entry.slug.clone()))
                    .copied()
                    .ok_or_else(|| {
                        anyhow!(
                            "Unit '{}' in '{}' copies a unit missing from '{from}'",
                            entry.slug,
                            entry.scope
                        )
                    })?;
                unit.upstream = Some(upstream);
            }
            let id = registry
                .insert_unit(unit)
                .await
                .with_context(|| format!("Cannot register unit '{}'", entry.slug))?;
            inserted.insert((entry.scope.clone(), entry.slug.clone()), id);
        }

        for entry in &self.resources {
            cluster.upsert(entry.observed(namespace)?).await;
        }

        info!(
            scopes = self.scopes.len(),
            units = self.units.len(),
            resources = self.resources.len(),
            "Fixture installed"
        );
        Ok(Installed { registry, cluster })
    }
}

impl FixtureResource {
    fn observed(&self, namespace: &str) -> Result<ObservedResource> {
        let document =
            ConfigDocument::new(self.document.clone()).context("Invalid live resource document")?;
        let mut observed = ObservedResource::from_live_document(&document, namespace, "0");
        for (raw, value) in &self.drift {
            let path = FieldPath::parse(raw).with_context(|| format!("Invalid drift path '{raw}'"))?;
            observed = observed.with_field(path, value.clone());
        }
        if let Some(reason) = &self.failed {
            if reason.trim().is_empty() {
                bail!("Failure reason for {} must not be empty", observed.identity);
            }
            observed = observed.with_status(ResourceStatus::Failed {
                reason: reason.clone(),
            });
        }
        Ok(observed)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use driftwatch_core::ResourceIdentity;
    use driftwatch_core::document::paths;
    use driftwatch_reconciler::Registry;
    use serde_json::json;

    use super::*;

    const FIXTURE: &str = r"
scopes:
  - name: base
  - name: prod
    upstream: base
units:
  - slug: api
    scope: base
    labels: { team: checkout }
    document: { kind: Deployment, metadata: { name: api, namespace: shop }, spec: { replicas: 3 } }
  - slug: api
    scope: prod
    from: base
    document: { kind: Deployment, metadata: { name: api, namespace: shop }, spec: { replicas: 3 } }
resources:
  - document: { kind: Deployment, metadata: { name: api, namespace: shop }, spec: { replicas: 3 } }
    drift: { spec.replicas: 5 }
";

    #[tokio::test]
    async fn test_install_links_copies_and_drifts_live_state() {
        let fixture: Fixture = serde_yaml::from_str(FIXTURE).unwrap();
        let installed = fixture.install("default").await.unwrap();

        let prod = installed
            .registry
            .list_units(&ScopeId::from("prod"), &driftwatch_core::UnitFilter::all())
            .await
            .unwrap();
        assert_eq!(prod.len(), 1);
        assert!(prod[0].upstream.is_some());

        let live = installed
            .cluster
            .snapshot(&ResourceIdentity::new("Deployment", "shop", "api"))
            .await
            .unwrap();
        assert_eq!(live.field(&paths::replicas()), Some(&json!(5)));
    }

    #[tokio::test]
    async fn test_copy_without_upstream_unit_is_rejected() {
        let fixture: Fixture = serde_yaml::from_str(
            r"
scopes: [{ name: base }, { name: prod, upstream: base }]
units:
  - slug: api
    scope: prod
    from: base
    document: { kind: ConfigMap, metadata: { name: api } }
",
        )
        .unwrap();
        assert!(fixture.install("default").await.is_err());
    }

    #[test]
    fn test_load_reads_json_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixture.json");
        std::fs::write(&path, r#"{"scopes": [{"name": "base"}]}"#).unwrap();

        let fixture = Fixture::load(&path).unwrap();
        assert_eq!(fixture.scopes.len(), 1);
    }
}
