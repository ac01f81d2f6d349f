//! gtdash-daemon - HTTP backend for the Gas Town dashboard.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use gtdash_core::config::DashboardConfig;
use gtdash_daemon::{AppState, router};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// gtdash daemon - supervised gt/bd access over HTTP
#[derive(Parser, Debug)]
#[command(name = "gtdash-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "gtdash.toml")]
    config: PathBuf,

    /// Listen address (overrides `server.bind`)
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Path to the gt binary (overrides `supervisor.gt_path`)
    #[arg(long)]
    gt_path: Option<PathBuf>,

    /// Path to the bd binary (overrides `supervisor.bd_path`)
    #[arg(long)]
    bd_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let mut config = load_config(&args.config)?;
    if let Some(bind) = args.bind {
        config.server.bind = bind.to_string();
    }
    if let Some(gt_path) = args.gt_path {
        config.supervisor.gt_path = gt_path;
    }
    if let Some(bd_path) = args.bd_path {
        config.supervisor.bd_path = bd_path;
    }
    config.validate().context("invalid configuration")?;
    let addr = config.server.socket_addr()?;

    let state = AppState::new(&config).context("failed to register metrics")?;
    let sweeper = tokio::spawn(state.clone().run_retention_sweeper());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind HTTP listener")?;
    info!(
        addr = %addr,
        gt = %config.supervisor.gt_path.display(),
        bd = %config.supervisor.bd_path.display(),
        max_concurrent = config.supervisor.max_concurrent,
        "gtdash daemon listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    sweeper.abort();
    info!("gtdash daemon stopped");
    Ok(())
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

/// Load `path`, falling back to defaults when it does not exist.
fn load_config(path: &std::path::Path) -> Result<DashboardConfig> {
    if path.exists() {
        let config = DashboardConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?;
        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    } else {
        warn!(path = %path.display(), "config file not found, using defaults");
        Ok(DashboardConfig::default())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
