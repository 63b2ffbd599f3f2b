//! Configuration loading and management
//!
//! # Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//! 1. Built-in defaults
//! 2. Global config: `$XDG_CONFIG_HOME/driftwatch/config.toml`
//! 3. Project config: `.driftwatch/config.toml`, or an explicit `--config` path
//! 4. Environment variables: `DRIFTWATCH_*`
//! 5. CLI flags (applied by the binary)
//!
//! # Example Config
//!
//! ```toml
//! scope = "prod"
//! namespace = "shop"
//!
//! [labels]
//! team = "checkout"
//!
//! [reconcile]
//! auto_correct = true
//! debounce_ms = 1500
//! ignore_paths = ["spec.replicas"]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{Labels, MonitoredScope, UnitFilter};
use crate::path::FieldPath;
use crate::types::ScopeId;

const ENV_PREFIX: &str = "DRIFTWATCH_";

// ═══════════════════════════════════════════════════════════════════════════
// CONFIGURATION STRUCTURES
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Scope whose units are monitored.
    pub scope: String,
    /// Namespace assumed for documents that omit one.
    pub namespace: String,
    /// Label predicate selecting monitored units.
    pub labels: Labels,
    /// Optional registry Set restricting monitored units.
    pub set: Option<String>,
    pub registry: RegistryConfig,
    pub cluster: ClusterConfig,
    pub reconcile: ReconcileConfig,
    pub advisor: AdvisorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RegistryConfig {
    pub endpoint: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClusterConfig {
    pub context: Option<String>,
    pub timeout_secs: u64,
    /// Resource kinds watched by the observer.
    pub kinds: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconcileConfig {
    pub auto_correct: bool,
    pub poll_interval_secs: u64,
    pub debounce_ms: u64,
    pub workers: usize,
    pub queue_capacity: usize,
    pub max_attempts: u32,
    pub ignore_paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AdvisorConfig {
    pub enabled: bool,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub timeout_secs: u64,
}

// ═══════════════════════════════════════════════════════════════════════════
// DEFAULT IMPLEMENTATIONS
// ═══════════════════════════════════════════════════════════════════════════

impl Default for Config {
    fn default() -> Self {
        Self {
            scope: "base".to_string(),
            namespace: "default".to_string(),
            labels: Labels::new(),
            set: None,
            registry: RegistryConfig::default(),
            cluster: ClusterConfig::default(),
            reconcile: ReconcileConfig::default(),
            advisor: AdvisorConfig::default(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: 30,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            context: None,
            timeout_secs: 30,
            kinds: ["Deployment", "StatefulSet", "DaemonSet", "Service", "ConfigMap"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            auto_correct: false,
            poll_interval_secs: 300,
            debounce_ms: 2000,
            workers: 4,
            queue_capacity: 1024,
            max_attempts: 3,
            ignore_paths: Vec::new(),
        }
    }
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            model: None,
            timeout_secs: 60,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// PUBLIC API
// ═══════════════════════════════════════════════════════════════════════════

/// Load configuration from all sources with hierarchy
///
/// `explicit` replaces the project config file when given; unlike the
/// project file it must exist.
///
/// # Errors
///
/// Returns error if:
/// - A config file cannot be read or is malformed TOML
/// - An environment variable has an unparsable value
/// - Config values fail validation
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let project = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => project_config_path(),
    };
    load_layers(
        global_config_path().as_deref(),
        project.as_deref(),
        explicit.is_some(),
        |key| std::env::var(key).ok(),
    )
}

/// Layer defaults, files and environment. Missing optional files are skipped.
///
/// # Errors
///
/// See [`load_config`].
pub fn load_layers(
    global: Option<&Path>,
    project: Option<&Path>,
    project_required: bool,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Config> {
    let mut merged = toml::Table::new();

    if let Some(path) = global.filter(|path| path.exists()) {
        merge_tables(&mut merged, load_toml_file(path)?);
    }
    if let Some(path) = project {
        if project_required || path.exists() {
            merge_tables(&mut merged, load_toml_file(path)?);
        }
    }

    let mut config: Config = merged
        .try_into()
        .map_err(|e: toml::de::Error| Error::toml_parse_failed(e.to_string()))?;
    config.apply_env_vars(env)?;
    config.validate()?;
    Ok(config)
}

impl Config {
    /// Parse a single TOML document on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns error if the TOML is malformed or fails validation.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::toml_parse_failed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// The monitored scope described by this configuration.
    pub fn monitored_scope(&self) -> MonitoredScope {
        MonitoredScope {
            scope: ScopeId::new(self.scope.clone()),
            namespace: self.namespace.clone(),
            filter: UnitFilter {
                name: format!("{}-monitored", self.scope),
                label_equals: self.labels.clone(),
                ..UnitFilter::default()
            },
            set: self.set.clone(),
        }
    }

    /// Parsed ignore paths.
    ///
    /// # Errors
    ///
    /// Returns error for a malformed path.
    pub fn ignore_paths(&self) -> Result<Vec<FieldPath>> {
        self.reconcile
            .ignore_paths
            .iter()
            .map(|raw| FieldPath::parse(raw))
            .collect()
    }

    pub const fn registry_timeout(&self) -> Duration {
        Duration::from_secs(self.registry.timeout_secs)
    }

    pub const fn cluster_timeout(&self) -> Duration {
        Duration::from_secs(self.cluster.timeout_secs)
    }

    pub const fn advisor_timeout(&self) -> Duration {
        Duration::from_secs(self.advisor.timeout_secs)
    }

    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile.poll_interval_secs)
    }

    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.reconcile.debounce_ms)
    }

    /// Apply environment variable overrides read through `env`.
    ///
    /// # Errors
    ///
    /// Returns error if environment variable values are invalid
    pub fn apply_env_vars(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |name: &str| env(&format!("{ENV_PREFIX}{name}"));

        if let Some(value) = var("SCOPE") {
            self.scope = value;
        }
        if let Some(value) = var("NAMESPACE") {
            self.namespace = value;
        }
        if let Some(value) = var("SET") {
            self.set = Some(value);
        }
        if let Some(value) = var("LABELS") {
            self.labels = parse_labels(&value)?;
        }
        if let Some(value) = var("REGISTRY_ENDPOINT") {
            self.registry.endpoint = Some(value);
        }
        if let Some(value) = var("CLUSTER_CONTEXT") {
            self.cluster.context = Some(value);
        }
        if let Some(value) = var("AUTO_CORRECT") {
            self.reconcile.auto_correct = parse_env("DRIFTWATCH_AUTO_CORRECT", &value)?;
        }
        if let Some(value) = var("POLL_INTERVAL_SECS") {
            self.reconcile.poll_interval_secs = parse_env("DRIFTWATCH_POLL_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = var("DEBOUNCE_MS") {
            self.reconcile.debounce_ms = parse_env("DRIFTWATCH_DEBOUNCE_MS", &value)?;
        }
        if let Some(value) = var("WORKERS") {
            self.reconcile.workers = parse_env("DRIFTWATCH_WORKERS", &value)?;
        }
        if let Some(value) = var("ADVISOR_ENABLED") {
            self.advisor.enabled = parse_env("DRIFTWATCH_ADVISOR_ENABLED", &value)?;
        }
        if let Some(value) = var("ADVISOR_ENDPOINT") {
            self.advisor.endpoint = Some(value);
        }
        if let Some(value) = var("ADVISOR_MODEL") {
            self.advisor.model = Some(value);
        }

        Ok(())
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any values are out of range or invalid
    pub fn validate(&self) -> Result<()> {
        if self.scope.trim().is_empty() {
            return Err(Error::invalid_config("scope must not be empty"));
        }
        if !(1000..=5000).contains(&self.reconcile.debounce_ms) {
            return Err(Error::invalid_config("debounce_ms must be 1000-5000"));
        }
        if self.reconcile.poll_interval_secs == 0 {
            return Err(Error::invalid_config("poll_interval_secs must be positive"));
        }
        if self.reconcile.workers == 0 {
            return Err(Error::invalid_config("workers must be at least 1"));
        }
        if self.reconcile.queue_capacity == 0 {
            return Err(Error::invalid_config("queue_capacity must be at least 1"));
        }
        if self.reconcile.max_attempts == 0 {
            return Err(Error::invalid_config("max_attempts must be at least 1"));
        }
        if self.registry.timeout_secs == 0
            || self.cluster.timeout_secs == 0
            || self.advisor.timeout_secs == 0
        {
            return Err(Error::invalid_config("timeouts must be positive"));
        }
        if self.advisor.enabled && self.advisor.endpoint.is_none() {
            return Err(Error::invalid_config(
                "advisor.endpoint is required when the advisor is enabled",
            ));
        }
        self.ignore_paths()
            .map_err(|e| Error::invalid_config(format!("ignore_paths: {e}")))?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// HELPER FUNCTIONS
// ═══════════════════════════════════════════════════════════════════════════

/// Get path to global config file
pub fn global_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "driftwatch")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Get path to project config file
fn project_config_path() -> Option<PathBuf> {
    std::env::current_dir()
        .ok()
        .map(|dir| dir.join(".driftwatch/config.toml"))
}

fn load_toml_file(path: &Path) -> Result<toml::Table> {
    let content =
        std::fs::read_to_string(path).map_err(|e| Error::file_read_failed(path, e.to_string()))?;
    content
        .parse::<toml::Table>()
        .map_err(|e| Error::toml_parse_failed(format!("{}: {e}", path.display())))
}

/// Later tables override earlier ones key by key; lists are replaced, not appended.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn parse_env<T>(name: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::invalid_config(format!("Invalid {name} value: {e}")))
}

/// `team=checkout,tier=web`
fn parse_labels(raw: &str) -> Result<Labels> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| Error::invalid_config(format!("label '{pair}' is not key=value")))
        })
        .collect::<Result<BTreeMap<_, _>>>()
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════
