//! # dprof-operator
//!
//! Entry point of the profiling operator.
//!
//! ## Startup
//!
//! 1. **Configuration** - defaults, then `--config`, then environment, then flags
//! 2. **Tracing** - `RUST_LOG` wins over the configured level
//! 3. **Controller** - HTTP stores and backends wired to the reconciler
//!
//! ## Shutdown
//!
//! Ctrl+C or SIGTERM flips the shutdown flag. Watchers stop, every identity
//! actor stops and every completion monitor is cancelled before exit.

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use dprof_operator::config::LogConfig;
use dprof_operator::{Cli, Commands, OperatorConfig, operator};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = OperatorConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?
        .with_process_env()
        .context("failed to apply environment overrides")?;
    let config = cli.apply(config);
    config.validate().context("invalid configuration")?;

    match cli.command {
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Run => {
            init_tracing(&config.log);
            run(config).await
        }
    }
}

async fn run(config: OperatorConfig) -> Result<()> {
    let start_time = Instant::now();
    info!(version = env!("CARGO_PKG_VERSION"), "dprof-operator starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown().await;
        let _ = shutdown_tx.send(true);
    });

    let result = operator::run(&config, shutdown_rx).await;
    match &result {
        Ok(()) => info!(uptime_secs = start_time.elapsed().as_secs(), "dprof-operator stopped gracefully"),
        Err(e) => error!(error = %format!("{e:#}"), "dprof-operator stopped with an error"),
    }
    result
}

/// Initialize tracing subscriber with environment filter.
fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let json = log.json.then(|| tracing_subscriber::fmt::layer().json());
    let text = (!log.json).then(tracing_subscriber::fmt::layer);

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .init();
}

/// Wait for Ctrl+C or SIGTERM.
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!("Failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown"),
        () = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}
