//! # notifyd — scheduled bulk notification dispatcher
//!
//! Serves the CRUD gateway and runs the send pipeline in one process.
//!
//! Usage:
//!   notifyd                              # ~/.notifyd/config.toml, port 8000
//!   notifyd --config ./notifyd.toml      # Explicit config file
//!   notifyd --port 9000 --verbose        # Override port, debug logging

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use notifyd_core::NotifydConfig;
use notifyd_gateway::AppState;
use notifyd_scheduler::{
    EventBus, HttpSender, NotifydDb, Pipeline, PipelineSettings, QueueSizes, Scheduler,
};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "notifyd",
    version,
    about = "📨 notifyd — scheduled bulk notification dispatcher"
)]
struct Cli {
    /// Config file (defaults to ~/.notifyd/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Gateway port, overrides [server] port
    #[arg(short, long)]
    port: Option<u16>,

    /// Database path, overrides [database] path
    #[arg(long)]
    db_path: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(cli: &Cli) -> Result<NotifydConfig> {
    let mut config = match &cli.config {
        Some(path) => NotifydConfig::load_from(&PathBuf::from(shellexpand::tilde(path).to_string()))?,
        None => NotifydConfig::load()?,
    };
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(db_path) = &cli.db_path {
        config.database.path = db_path.clone();
    }
    Ok(config)
}

fn open_db(path: &Path) -> Result<NotifydDb> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(NotifydDb::open(path)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "notifyd=debug,notifyd_core=debug,notifyd_scheduler=debug,notifyd_gateway=debug,tower_http=debug"
    } else {
        "notifyd=info,notifyd_core=info,notifyd_scheduler=info,notifyd_gateway=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = load_config(&cli)?;
    let db_path = config.database.expanded_path();
    let db = Arc::new(open_db(&db_path)?);
    tracing::info!("🗄️ Database: {}", db_path.display());

    if config.sender.token.is_empty() {
        tracing::warn!(
            "⚠️ No sender token configured (set [sender] token or {})",
            notifyd_core::config::SENDER_TOKEN_ENV
        );
    }

    let (bus, receivers) = EventBus::new(QueueSizes::from(&config.pipeline));
    let scheduler = Scheduler::new();
    let pipeline = Pipeline::new(
        db.clone(),
        Arc::new(HttpSender::new(&config.sender)),
        bus.clone(),
        scheduler.clone(),
        PipelineSettings::from(&config.pipeline),
    );

    // The loop must be consuming before the seed starts pushing.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let looped = pipeline.clone();
    let pipeline_handle = tokio::spawn(async move { looped.run(receivers, shutdown_rx).await });

    let seeder = pipeline.clone();
    tokio::spawn(async move {
        if let Err(e) = seeder.seed().await {
            tracing::error!("❌ Re-seed failed: {e}");
        }
    });

    let state = AppState::new(db, bus);
    let served = notifyd_gateway::start(&config.server, state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("❌ Could not listen for Ctrl-C: {e}");
        }
        tracing::info!("Shutdown requested");
    })
    .await;

    shutdown_tx.send_replace(true);
    match pipeline_handle.await {
        Ok(Err(notifyd_core::NotifydError::Stopped)) => {}
        Ok(Err(e)) => tracing::warn!("⚠️ Send pipeline ended: {e}"),
        Ok(Ok(())) => {}
        Err(e) => tracing::error!("❌ Send pipeline task failed: {e}"),
    }
    scheduler.stop_all();
    tracing::info!("👋 notifyd stopped");

    served
}
