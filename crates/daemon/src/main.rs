//! Crash Monitor - Main Entry Point
//! Admits crash artifacts from the index trees into the job queue and
//! cleans up after the processors.

mod settings;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// Import workspace crates
use crashmon_core::application::{shutdown_channel, Monitor, MonitorExit, ShutdownSender};
use crashmon_core::port::time_provider::SystemTimeProvider;
use crashmon_infra_sqlite::{create_pool, run_migrations, ConnectionPool};
use crashmon_infra_system::LocalCrashStorage;
use settings::{LogFormat, LogSettings, Settings};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_CONFIG_PATH: &str = "crashmon.toml";

#[derive(Parser)]
#[command(name = "crash-monitor")]
#[command(about = "Crash-report dispatch monitor", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML configuration file (optional unless given explicitly)
    #[arg(long, env = "CRASHMON_CONFIG")]
    config: Option<PathBuf>,
}

fn init_logging(log: &LogSettings) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log.filter))
        .context("invalid log filter")?;

    match log.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty())
            .try_init(),
    }
    .context("failed to install log subscriber")
}

/// SIGINT or SIGTERM -> cooperative shutdown of every loop
async fn forward_signals(sender: ShutdownSender) -> Result<()> {
    let mut terminate = signal(SignalKind::terminate()).context("cannot listen for SIGTERM")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("cannot listen for SIGINT")?,
        _ = terminate.recv() => {}
    }
    info!("Shutdown signal received. Stopping loops...");
    sender.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // 1. Load configuration
    let (config_path, required) = match cli.config {
        Some(path) => (path, true),
        None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
    };
    let settings = Settings::load(&config_path, required)
        .with_context(|| format!("cannot load configuration from {}", config_path.display()))?;

    // 2. Initialize logging
    init_logging(&settings.log)?;
    info!("Crash Monitor v{} starting...", VERSION);

    settings.monitor.validate()?;

    // 3. Initialize database
    info!(database = %settings.database.url, "Initializing database...");
    let migration_pool = create_pool(&settings.database.url)
        .await
        .context("DB pool creation failed")?;
    run_migrations(&migration_pool)
        .await
        .context("Migration failed")?;
    migration_pool.close().await;

    // 4. Setup dependencies (DI wiring)
    let db = Arc::new(ConnectionPool::new(&settings.database.url)?);
    let storage = Arc::new(LocalCrashStorage::new());
    let time_provider = Arc::new(SystemTimeProvider);
    let monitor = Monitor::new(db, storage, time_provider, settings.monitor);

    // 5. Signals
    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    let signal_handle = tokio::spawn(async move {
        if let Err(e) = forward_signals(shutdown_tx).await {
            warn!(error = ?e, "Signal handling failed");
        }
    });

    // 6. Run until shutdown or a fatal condition
    let exit = monitor.run(shutdown_rx).await;
    signal_handle.abort();

    match exit {
        MonitorExit::Clean => {
            info!("Shutdown complete.");
            Ok(ExitCode::SUCCESS)
        }
        MonitorExit::Fatal(reason) => {
            tracing::error!(reason = %reason, "Monitor terminated abnormally");
            Ok(ExitCode::FAILURE)
        }
    }
}
