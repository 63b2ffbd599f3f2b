//! CLI command handlers: wire configuration, collaborators and the engine.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use driftwatch_core::{Config, ResourceKind, ShutdownCoordinator, ShutdownSignal, load_config};
use driftwatch_events::{ActualStateObserver, ObserverConfig, RetryPolicy};
use driftwatch_reconciler::{
    CallBounds, ChannelReportSink, CycleReport, HttpAdvisor, LogReportSink, LoopConfig,
    ReconcileContext, Reconciler, ReconcilerBuilder, ReconciliationLoop, ReportSink,
};
use tokio::signal;
use tracing::{error, info, warn};

use crate::cli::{Cli, Commands};
use crate::fixture::{Fixture, Installed};

const DEFAULT_ADVISOR_MODEL: &str = "gpt-4o-mini";

/// Execute a CLI command.
///
/// Returns whether the run finished without failed items.
///
/// # Errors
///
/// Returns error when configuration, the fixture or start-up fails.
pub async fn execute_command(cli: Cli) -> Result<bool> {
    let mut config = load_config(cli.config.as_deref()).context("Failed to load configuration")?;
    if cli.auto_correct {
        config.reconcile.auto_correct = true;
    }

    let fixture_path = cli.fixture.as_deref().ok_or_else(|| {
        anyhow!("No registry backend configured: pass --fixture with scopes, units and resources")
    })?;
    let installed = Fixture::load(fixture_path)?
        .install(&config.namespace)
        .await?;

    match cli.command {
        Commands::Check => cmd_check(&config, &installed, cli.json).await,
        Commands::Watch => cmd_watch(&config, &installed, cli.json).await,
    }
}

/// One sweep over every monitored unit.
async fn cmd_check(config: &Config, installed: &Installed, json: bool) -> Result<bool> {
    let shutdown = Arc::new(ShutdownCoordinator::new());
    let reconciliation = ReconciliationLoop::new(
        Arc::new(build_reconciler(config)?),
        build_context(config, installed, shutdown),
        loop_config(config),
        Arc::new(LogReportSink),
    );

    let report = reconciliation.run_once().await;
    print_report(&report, json)?;
    Ok(!report.has_failures())
}

/// Observe and reconcile until Ctrl+C or a fatal error.
async fn cmd_watch(config: &Config, installed: &Installed, json: bool) -> Result<bool> {
    let shutdown = Arc::new(ShutdownCoordinator::new());
    let (sink, mut reports) = ChannelReportSink::new();
    let reconciliation = ReconciliationLoop::new(
        Arc::new(build_reconciler(config)?),
        build_context(config, installed, shutdown.clone()),
        loop_config(config),
        Arc::new(sink),
    );

    let printer = tokio::spawn(async move {
        let mut clean = true;
        while let Some(report) = reports.recv().await {
            LogReportSink.publish(&report).await;
            clean &= !report.has_failures();
            if let Err(e) = print_report(&report, json) {
                warn!(error = %e, "Cannot print report");
            }
        }
        clean
    });

    let signals = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C, initiating graceful shutdown");
                    shutdown.initiate_shutdown(ShutdownSignal::Sigint);
                }
                Err(err) => error!("Failed to listen for shutdown signal: {}", err),
            }
        })
    };

    let (events, observer) = ActualStateObserver::new(
        installed.cluster.clone(),
        observer_config(config),
        shutdown.clone(),
    )
    .spawn();
    info!(scope = %config.scope, "driftwatch is running. Press Ctrl+C to stop.");

    let result = reconciliation.run(events).await;
    shutdown.initiate_shutdown(ShutdownSignal::Programmatic);
    signals.abort();
    observer.join().await;
    drop(reconciliation);
    let clean = printer.await.unwrap_or(false);

    result.context("Reconciliation loop halted")?;
    info!("driftwatch stopped gracefully");
    Ok(clean)
}

/// Reconciler from configuration, with the HTTP advisor when enabled.
///
/// # Errors
///
/// Returns error for an invalid ignore path or advisor client setup.
pub fn build_reconciler(config: &Config) -> Result<Reconciler> {
    let mut builder = ReconcilerBuilder::new()
        .auto_correct(config.reconcile.auto_correct)
        .ignore_paths(config.reconcile.ignore_paths.iter().cloned());

    if config.advisor.enabled {
        let endpoint = config
            .advisor
            .endpoint
            .clone()
            .ok_or_else(|| anyhow!("advisor.endpoint is required when the advisor is enabled"))?;
        let model = config
            .advisor
            .model
            .clone()
            .unwrap_or_else(|| DEFAULT_ADVISOR_MODEL.to_string());
        let advisor = HttpAdvisor::new(endpoint, model, config.advisor_timeout())
            .context("Failed to create advisor client")?;
        builder = builder.with_advisor(Arc::new(advisor), config.advisor_timeout());
    }

    builder.build().context("Invalid reconciler configuration")
}

pub fn build_context(
    config: &Config,
    installed: &Installed,
    shutdown: Arc<ShutdownCoordinator>,
) -> ReconcileContext {
    ReconcileContext::new(
        config.monitored_scope(),
        installed.registry.clone(),
        installed.cluster.clone(),
        shutdown,
        CallBounds {
            registry_timeout: config.registry_timeout(),
            cluster_timeout: config.cluster_timeout(),
            retry: RetryPolicy::new(config.reconcile.max_attempts, 200, 30_000),
        },
    )
}

pub fn loop_config(config: &Config) -> LoopConfig {
    LoopConfig {
        workers: config.reconcile.workers,
        poll_interval: config.poll_interval(),
        queue_capacity: config.reconcile.queue_capacity,
    }
}

pub fn observer_config(config: &Config) -> ObserverConfig {
    ObserverConfig {
        kinds: config
            .cluster
            .kinds
            .iter()
            .cloned()
            .map(ResourceKind::from)
            .collect(),
        selector: config.labels.clone(),
        debounce: config.debounce(),
        retry: RetryPolicy::new(config.reconcile.max_attempts, 200, 30_000),
        ..ObserverConfig::default()
    }
}

fn print_report(report: &CycleReport, json: bool) -> Result<()> {
    if json {
        let rendered = serde_json::to_string(report).context("Failed to serialize report")?;
        println!("{rendered}");
    } else {
        print!("{}", report.render_text());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_observer_follows_configuration() {
        let mut config = Config::default();
        config.cluster.kinds = vec!["ConfigMap".to_string(), "Rollout".to_string()];
        config.reconcile.debounce_ms = 1500;

        let observer = observer_config(&config);

        assert_eq!(
            observer.kinds,
            vec![ResourceKind::ConfigMap, ResourceKind::Other("Rollout".to_string())]
        );
        assert_eq!(observer.debounce, std::time::Duration::from_millis(1500));
    }

    #[test]
    fn test_enabled_advisor_without_endpoint_is_rejected() {
        let mut config = Config::default();
        config.advisor.enabled = true;
        assert!(build_reconciler(&config).is_err());
    }

    #[test]
    fn test_auto_correct_flows_into_reconciler() {
        let mut config = Config::default();
        config.reconcile.auto_correct = true;
        assert!(build_reconciler(&config).unwrap().config().auto_correct);
    }
}
