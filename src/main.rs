//! strikegated - IP-strike enforcement daemon.
//!
//! Startup is all-or-nothing: a failure in config, firewall or socket
//! setup aborts with a nonzero exit. Once running, the daemon stays up
//! through transient external failures; going down means unblocking
//! everyone.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, Level};

use strikegate::blocklist::BlocklistManager;
use strikegate::cli::Cli;
use strikegate::config::Config;
use strikegate::firewall::{check_root, Firewall, FirewallDriver};
use strikegate::intake::IntakeServer;
use strikegate::lock::LockGuard;
use strikegate::metrics::{Metrics, MetricsServer};
use strikegate::shutdown::Shutdown;
use strikegate::store::Store;
use strikegate::sweeper;
use strikegate::tracker::Tracker;

fn init_logging(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_ansi(false)
        .with_writer(Arc::new(file))
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to install log subscriber")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log)?;
    info!(version = env!("CARGO_PKG_VERSION"), "daemon_start");

    let config = Arc::new(
        Config::load(&cli.config)
            .with_context(|| format!("failed to load configuration {}", cli.config.display()))?,
    );
    info!(domains = config.domains.len(), "config_loaded");

    check_root()?;
    let _lock = LockGuard::acquire(&cli.lock_file)?;

    let driver = FirewallDriver::detect().context("firewall initialization failed")?;
    info!(backend = %driver.backend(), "firewall_backend_detected");
    let fw: Arc<dyn Firewall> = Arc::new(driver);

    let blocklist = Arc::new(BlocklistManager::new(fw));
    blocklist
        .initialize()
        .await
        .context("kernel set initialization failed")?;

    // Best-effort: reload blocks recorded before the last shutdown.
    if let Err(e) = blocklist.load_initial_blacklist(&cli.blacklist).await {
        tracing::warn!(error = %e, "blacklist_load_failed");
    }

    let store = Store::open(&cli.db).await.context("failed to open strike database")?;
    let metrics = Arc::new(Metrics::new());
    let tracker = Arc::new(
        Tracker::new(store, config.clone(), blocklist.clone(), metrics.clone()).await,
    );

    let shutdown = Shutdown::new();
    shutdown.listen_for_signals();

    let metrics_server =
        MetricsServer::new(cli.metrics_port, tracker.clone(), blocklist.clone(), metrics);
    let metrics_token = shutdown.token();
    let metrics_task = tokio::spawn(async move {
        if let Err(e) = metrics_server.run(metrics_token).await {
            error!(error = %e, "metrics_server_failed");
        }
    });

    let intake = IntakeServer::bind(&cli.socket, tracker.clone())
        .context("IPC socket setup failed")?;
    let intake_task = tokio::spawn(intake.run(shutdown.token()));

    let sweeper_task = tokio::spawn(sweeper::run(tracker, shutdown.token()));

    let mut main_token = shutdown.token();
    main_token.cancelled().await;

    // In-flight handlers finish before the process exits.
    let _ = intake_task.await;
    let _ = sweeper_task.await;
    let _ = metrics_task.await;

    info!("daemon_stopped");
    Ok(())
}
