//! Peergate Daemon
//!
//! Keeps the configured WireGuard node in step with the peer store.

use clap::Parser;
use peergate_common::{Database, PeerStore};
use peergate_daemon::{DaemonConfig, Reconciler, SshExecutor, WgNodeClient};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "peergated")]
#[command(about = "Peergate daemon - WireGuard peer reconciliation")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "PEERGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Database file, overrides the configuration
    #[arg(long, env = "PEERGATE_DB")]
    db: Option<PathBuf>,

    /// Apply reconciliation plans instead of logging them
    #[arg(long)]
    apply: bool,

    /// Run a single reconciliation pass and exit
    #[arg(long)]
    once: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("Peergate daemon v{}", peergate_common::VERSION);

    let config_path = cli
        .config
        .unwrap_or_else(peergate_common::default_config_path);
    let mut config = DaemonConfig::load(&config_path)?;
    if let Some(db) = cli.db {
        config.db_path = Some(db);
    }
    if cli.apply {
        config.reconcile.apply = true;
    }
    config.validate()?;

    let db = Database::open(config.db_path())?;
    let store = PeerStore::new(db);
    let executor = Arc::new(SshExecutor::new(config.ssh.clone()));
    let client = WgNodeClient::new(executor, config.ssh.sudo);

    let node = store.upsert_node(&config.node.id, &config.node.attrs()?)?;
    info!(
        "Managing node {} ({}@{}, {}, pool {})",
        node.id, node.ssh_user, node.ssh_host, node.wg_interface, node.pool
    );

    let reconciler = Reconciler::new(store, client, &config);

    if cli.once {
        let (plan, report) = reconciler.reconcile_once(config.reconcile.apply).await?;
        println!("{}", plan);
        if let Some(report) = report {
            println!(
                "applied {} change(s), {} skipped, {} failed",
                report.applied,
                report.skipped,
                report.failed.len()
            );
        }
        return Ok(());
    }

    if !config.reconcile.enabled {
        info!("Reconciliation disabled; nothing to do");
        return Ok(());
    }

    let reconciler_handle = tokio::spawn(async move { reconciler.run().await });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = reconciler_handle => {
            if let Err(e) = result {
                tracing::error!("Reconciler error: {}", e);
            }
        }
    }

    info!("Daemon shutdown complete");
    Ok(())
}
