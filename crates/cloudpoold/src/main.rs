//! cloudpoold: the cloudpool daemon.
//!
//! Runs one pool controller and serves its management API:
//! - Pool configuration (TOML)
//! - Cloud driver
//! - Alert sink (log, optionally severity-filtered)
//! - Reconciliation loop
//! - REST API
//!
//! # Usage
//!
//! ```text
//! cloudpoold run --config /etc/cloudpool/pool.toml --port 8080
//! cloudpoold check --config /etc/cloudpool/pool.toml
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cloudpool_alert::{Alert, AlertSeverity, AlertSink, AlertTopic, FilteringAlertSink, LogAlertSink};
use cloudpool_core::{AlertSettings, CloudPoolConfig, DriverConfig};
use cloudpool_driver::{CloudDriver, InMemoryDriver};
use cloudpool_engine::PoolController;

const DEFAULT_LOG_FILTER: &str = "info,cloudpoold=debug,cloudpool=debug";

#[derive(Parser)]
#[command(name = "cloudpoold", about = "Elastic machine pool daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage a pool and serve its REST API.
    Run {
        /// Pool configuration file.
        #[arg(long)]
        config: PathBuf,

        /// Port to listen on.
        #[arg(long, default_value = "8080")]
        port: u16,
    },
    /// Validate a pool configuration and print it back.
    Check {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    match cli.command {
        Command::Run { config, port } => run(&config, port).await,
        Command::Check { config } => {
            let config = load_config(&config)?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(path: &Path) -> anyhow::Result<CloudPoolConfig> {
    let config = CloudPoolConfig::from_file(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid pool configuration in {}", path.display()))?;
    Ok(config)
}

async fn build_driver(config: &DriverConfig) -> anyhow::Result<Arc<dyn CloudDriver>> {
    match config {
        DriverConfig::Memory {
            pool_identifier,
            initial_machines,
        } => {
            let driver = InMemoryDriver::new(pool_identifier)?
                .with_running_machines(*initial_machines)
                .await;
            info!(%pool_identifier, initial_machines, "in-memory driver initialized");
            Ok(Arc::new(driver))
        }
    }
}

fn build_alert_sink(settings: Option<&AlertSettings>) -> anyhow::Result<Arc<dyn AlertSink>> {
    let log: Arc<dyn AlertSink> = Arc::new(LogAlertSink);
    match settings {
        Some(settings) => Ok(Arc::new(FilteringAlertSink::from_settings(log, settings)?)),
        None => Ok(log),
    }
}

/// Raise a fatal configuration alert for a startup failure and hand the
/// error back.
async fn setup_failed(sink: &dyn AlertSink, error: anyhow::Error) -> anyhow::Error {
    sink.notify(Alert::new(
        AlertTopic::Configuration,
        AlertSeverity::Fatal,
        format!("{error:#}"),
    ))
    .await;
    error
}

async fn run(config_path: &Path, port: u16) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "cloudpool daemon starting");

    // Configuration problems are fatal, and alerted before exiting.
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => return Err(setup_failed(&LogAlertSink, e).await),
    };

    // ── Initialize subsystems ──────────────────────────────────

    let driver = match build_driver(&config.driver).await {
        Ok(driver) => driver,
        Err(e) => return Err(setup_failed(&LogAlertSink, e).await),
    };
    let alerts = match build_alert_sink(config.alerts.as_ref()) {
        Ok(alerts) => alerts,
        Err(e) => return Err(setup_failed(&LogAlertSink, e).await),
    };
    let controller = Arc::new(PoolController::new(&config, driver, alerts)?);
    let interval = config.pool_update.update_interval()?;
    info!(pool = %config.name, interval_secs = interval.as_secs(), "pool controller initialized");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Reconciliation loop ────────────────────────────────────

    let controller_handle = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.run(interval, shutdown_rx).await })
    };

    // ── Start API server ───────────────────────────────────────

    let router = cloudpool_api::build_router(controller);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C, shutting down");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    match controller_handle.await {
        Ok(pending) if !pending.is_empty() => {
            warn!(count = pending.len(), "stopped with scheduled terminations pending");
        }
        Ok(_) => {}
        Err(e) => error!(error = %e, "pool controller task failed"),
    }

    info!("cloudpool daemon stopped");
    Ok(())
}
