//! CLI command definitions using clap.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// driftwatch - configuration drift detection and reconciliation
#[derive(Parser, Debug)]
#[command(name = "driftwatch")]
#[command(version)]
#[command(about = "Detect and reconcile drift between a configuration registry and a live cluster")]
#[command(
    long_about = "driftwatch compares the desired units of a registry scope with the live resources they describe, reports every field-level divergence, and optionally restores the declared values, pushing corrections down the scope hierarchy."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file replacing .driftwatch/config.toml
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// YAML or JSON fixture with scopes, units and live resources
    #[arg(short, long, global = true)]
    pub fixture: Option<PathBuf>,

    /// Apply corrections instead of only planning them
    #[arg(long, global = true, default_value_t = false)]
    pub auto_correct: bool,

    /// Print reports as JSON
    #[arg(long, global = true, default_value_t = false)]
    pub json: bool,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Run one reconciliation cycle over every monitored unit and print the report
    Check,

    /// Watch the cluster and reconcile continuously until Ctrl+C
    Watch,
}
