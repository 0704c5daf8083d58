//! Peergate CLI - Main Entry Point
//!
//! Provisions, revokes and inspects WireGuard peers, and reconciles the
//! node with the database.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod output;

use commands::{config, node, peer, Context};

/// Peergate CLI - WireGuard peer provisioning
#[derive(Parser)]
#[command(name = "peergate")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "PEERGATE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Database file, overrides the configuration
    #[arg(long, env = "PEERGATE_DB", global = true)]
    db: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision, revoke and list peers
    #[command(subcommand)]
    Peer(peer::PeerCommands),

    /// Inspect and reconcile the WireGuard node
    #[command(subcommand)]
    Node(node::NodeCommands),

    /// Manage the configuration file
    #[command(subcommand)]
    Config(config::ConfigCommands),

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        match e.downcast_ref::<peergate_common::Error>() {
            Some(err) => output::print_error(&output::error_line(err)),
            None => output::print_error(&format!("{:#}", e)),
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli
        .config
        .unwrap_or_else(peergate_common::default_config_path);

    match cli.command {
        Commands::Peer(cmd) => {
            let ctx = Context::open(&config_path, cli.db)?;
            peer::execute(cmd, ctx, cli.format).await?
        }
        Commands::Node(cmd) => {
            let ctx = Context::open(&config_path, cli.db)?;
            node::execute(cmd, ctx, cli.format).await?
        }
        Commands::Config(cmd) => config::execute(cmd, &config_path, cli.format)?,
        Commands::Version => {
            println!("Peergate CLI v{}", peergate_common::VERSION);
        }
    }

    Ok(())
}
