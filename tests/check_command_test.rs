//! Integration tests for the `check` wiring against the demo fixture.
//!
//! These tests verify that:
//! - The demo fixture loads into working collaborators
//! - A dry-run check plans without touching live state
//! - Auto-correct restores live state and honours the staging override
//! - Start-up without a fixture fails with a clear error

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use driftwatch::cli::Cli;
use driftwatch::commands::{build_context, build_reconciler, execute_command, loop_config};
use driftwatch::fixture::Fixture;
use driftwatch_core::document::paths;
use driftwatch_core::{Config, ResourceIdentity, ScopeId, Severity, ShutdownCoordinator};
use driftwatch_reconciler::{ItemStatus, LogReportSink, ReconciliationLoop, ScopeOutcome};
use serde_json::json;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn demo(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos").join(name)
}

fn demo_config(auto_correct: bool) -> Result<Config, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(demo("driftwatch.toml"))?;
    let mut config = Config::from_toml_str(&content)?;
    config.reconcile.auto_correct = auto_correct;
    Ok(config)
}

#[tokio::test]
async fn test_dry_run_check_plans_without_applying() -> TestResult {
    let config = demo_config(false)?;
    let installed = Fixture::load(&demo("shop.yaml"))?
        .install(&config.namespace)
        .await?;
    let reconciliation = ReconciliationLoop::new(
        Arc::new(build_reconciler(&config)?),
        build_context(&config, &installed, Arc::new(ShutdownCoordinator::new())),
        loop_config(&config),
        Arc::new(LogReportSink),
    );

    let report = reconciliation.run_once().await;

    assert_eq!(report.units_checked, 3);
    assert_eq!(report.drift_count(), 3);
    assert_eq!(report.summary, "3 drift items detected across 3 units");
    let rendered = serde_json::to_value(&report)?;
    assert_eq!(rendered["drift_count"], json!(3));
    assert_eq!(rendered["corrections_applied"], json!(0));
    assert_eq!(report.corrections_applied, 0);
    assert_eq!(installed.registry.apply_count(), 0);

    let possible = report
        .items
        .iter()
        .find(|item| item.severity == Severity::PossibleDrift)
        .ok_or("no possible-drift item")?;
    assert_eq!(possible.status, ItemStatus::Detected);
    assert_eq!(
        report
            .items
            .iter()
            .filter(|item| item.status == ItemStatus::Planned)
            .count(),
        2
    );
    Ok(())
}

#[tokio::test]
async fn test_auto_correct_check_restores_live_state() -> TestResult {
    let config = demo_config(true)?;
    let installed = Fixture::load(&demo("shop.yaml"))?
        .install(&config.namespace)
        .await?;
    let reconciliation = ReconciliationLoop::new(
        Arc::new(build_reconciler(&config)?),
        build_context(&config, &installed, Arc::new(ShutdownCoordinator::new())),
        loop_config(&config),
        Arc::new(LogReportSink),
    );

    let report = reconciliation.run_once().await;

    assert_eq!(report.corrections_applied, 2);
    assert!(!report.has_failures());

    let api = installed
        .cluster
        .snapshot(&ResourceIdentity::new("Deployment", "shop", "api"))
        .await
        .ok_or("api missing")?;
    assert_eq!(api.field(&paths::replicas()), Some(&json!(3)));
    let app_config = installed
        .cluster
        .snapshot(&ResourceIdentity::new("ConfigMap", "shop", "app-config"))
        .await
        .ok_or("app-config missing")?;
    assert_eq!(
        app_config.field(&paths::data_key("log_level")),
        Some(&json!("info"))
    );

    let staging_skipped = report.propagations.iter().any(|propagation| {
        matches!(
            propagation.outcome(&ScopeId::from("staging")),
            Some(ScopeOutcome::Skipped { .. })
        )
    });
    assert!(staging_skipped);

    let again = reconciliation.run_once().await;
    assert_eq!(again.drift_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_check_without_fixture_fails() -> TestResult {
    let cli = Cli::try_parse_from([
        "driftwatch",
        "check",
        "--config",
        demo("driftwatch.toml").to_string_lossy().as_ref(),
    ])?;

    let result = execute_command(cli).await;

    let message = format!("{:#}", result.err().ok_or("expected an error")?);
    assert!(message.contains("--fixture"));
    Ok(())
}

#[tokio::test]
async fn test_check_command_runs_demo_fixture() -> TestResult {
    let cli = Cli::try_parse_from([
        "driftwatch",
        "check",
        "--config",
        demo("driftwatch.toml").to_string_lossy().as_ref(),
        "--fixture",
        demo("shop.yaml").to_string_lossy().as_ref(),
        "--json",
    ])?;

    assert!(execute_command(cli).await?);
    Ok(())
}
