//! Identifiers shared across the workspace.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{Error, Result};

/// Opaque identifier of a desired unit in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitId(Ulid);

impl UnitId {
    /// Create a new random unit ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Create from a ULID.
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Get the inner ULID.
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl Default for UnitId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UnitId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::invalid_document(format!("invalid unit id '{s}': {e}")))
    }
}

/// Name of a scope (environment) in the hierarchy, e.g. `base` or `prod`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeId(String);

impl ScopeId {
    /// Create a scope ID.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the scope name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ScopeId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Broad schema family a resource kind belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceFamily {
    /// Scalable workloads (replicas, image, resource requests).
    Workload,
    /// Network endpoints (port list).
    NetworkEndpoint,
    /// Key/value configuration.
    KeyValueConfig,
    /// Anything the engine has no comparable fields for.
    Opaque,
}

/// Kind of a live resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResourceKind {
    Deployment,
    StatefulSet,
    DaemonSet,
    Service,
    ConfigMap,
    Other(String),
}

impl ResourceKind {
    /// Schema family of this kind.
    pub const fn family(&self) -> ResourceFamily {
        match self {
            Self::Deployment | Self::StatefulSet | Self::DaemonSet => ResourceFamily::Workload,
            Self::Service => ResourceFamily::NetworkEndpoint,
            Self::ConfigMap => ResourceFamily::KeyValueConfig,
            Self::Other(_) => ResourceFamily::Opaque,
        }
    }

    /// Canonical kind name.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Deployment => "Deployment",
            Self::StatefulSet => "StatefulSet",
            Self::DaemonSet => "DaemonSet",
            Self::Service => "Service",
            Self::ConfigMap => "ConfigMap",
            Self::Other(kind) => kind,
        }
    }
}

impl From<String> for ResourceKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Deployment" => Self::Deployment,
            "StatefulSet" => Self::StatefulSet,
            "DaemonSet" => Self::DaemonSet,
            "Service" => Self::Service,
            "ConfigMap" => Self::ConfigMap,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for ResourceKind {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<ResourceKind> for String {
    fn from(value: ResourceKind) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Namespace-qualified identity of a live resource.
///
/// Work for one identity is serialized by the reconciliation loop.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

impl ResourceIdentity {
    /// Create a resource identity.
    pub fn new(
        kind: impl Into<ResourceKind>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_kind_round_trips_through_strings() {
        assert_eq!(ResourceKind::from("Deployment"), ResourceKind::Deployment);
        assert_eq!(
            ResourceKind::from("CronJob"),
            ResourceKind::Other("CronJob".to_string())
        );
        let json = serde_json::to_string(&ResourceKind::ConfigMap).unwrap();
        assert_eq!(json, "\"ConfigMap\"");
    }

    #[test]
    fn test_kind_family() {
        assert_eq!(ResourceKind::StatefulSet.family(), ResourceFamily::Workload);
        assert_eq!(ResourceKind::Service.family(), ResourceFamily::NetworkEndpoint);
        assert_eq!(
            ResourceKind::from("Ingress").family(),
            ResourceFamily::Opaque
        );
    }

    #[test]
    fn test_identity_display() {
        let id = ResourceIdentity::new("Deployment", "shop", "api");
        assert_eq!(id.to_string(), "Deployment/shop/api");
    }

    #[test]
    fn test_unit_id_parse() {
        let id = UnitId::new();
        let parsed: UnitId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-ulid".parse::<UnitId>().is_err());
    }
}
