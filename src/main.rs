//! # driftwatch
//!
//! ## Start-up Sequence
//!
//! 1. **Tracing** - `RUST_LOG` filter, `info` by default
//! 2. **Configuration** - defaults, config files, `DRIFTWATCH_*`, then CLI flags
//! 3. **Collaborators** - registry and cluster loaded from the fixture
//! 4. **Command** - one `check` cycle, or the `watch` loop until Ctrl+C
//!
//! ## Exit Status
//!
//! Start-up failures and a halted loop exit non-zero with the error chain.
//! A finished run with failed items exits with status 2.

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

use std::process::ExitCode;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use driftwatch::cli::Cli;
use driftwatch::commands::execute_command;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<bool> {
    let start_time = Instant::now();
    info!(command = ?cli.command, "driftwatch starting");
    let clean = execute_command(cli).await?;
    info!(elapsed = ?start_time.elapsed(), clean, "driftwatch finished");
    Ok(clean)
}

/// Initialize tracing subscriber with environment filter.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
