//! cdr-ingestd entry point: CLI parsing, tracing init, runtime bootstrap,
//! and signal-driven graceful shutdown.

use anyhow::Context;
use cdr_ingestd::cli::Cli;
use cdr_ingestd::supervisor::Supervisor;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Config is loaded before tracing is initialized (not after) so the
    // configured `logging.level` actually governs the daemon's own log
    // output; a load/parse/validate failure is reported to stderr directly
    // since no subscriber exists yet to carry it.
    let config = match cdr_ingestd::config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("cdr-ingestd: invalid configuration at {}: {e}", cli.config.display());
            std::process::exit(1);
        }
    };

    init_tracing(if cli.debug { "debug" } else { &config.logging.level });

    if cli.check_config {
        println!("configuration at {} is valid", cli.config.display());
        return Ok(());
    }

    let rt = tokio::runtime::Runtime::new().context("failed to create tokio runtime")?;
    rt.block_on(run(config))
}

async fn run(config: cdr_ingestd::config::Config) -> anyhow::Result<()> {
    let supervisor = Arc::new(
        Supervisor::new(config)
            .await
            .context("failed to initialize supervisor")?,
    );

    supervisor.start().await.context("failed to start channels")?;
    info!("cdr-ingestd started");

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping channels");

    supervisor.stop().await;
    info!("cdr-ingestd stopped cleanly");
    Ok(())
}

/// Waits for SIGTERM or SIGINT (Unix) — the two signals process supervisors
/// (systemd, docker, k8s) use to ask a daemon to exit.
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGINT handler");
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Initialize tracing at `level` (`--debug` overrides `logging.level` from
/// config; `RUST_LOG` overrides both, for ad hoc troubleshooting).
fn init_tracing(level: &str) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(filter)
        .try_init();
}
