//! Config Commands

use anyhow::{Context as _, Result};
use clap::Subcommand;
use peergate_daemon::DaemonConfig;
use std::path::Path;

use crate::output::{print_structured, print_success, print_warning, OutputFormat};

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write a configuration file with default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Check the configuration without touching the node
    Validate,
}

pub fn execute(cmd: ConfigCommands, path: &Path, format: OutputFormat) -> Result<()> {
    match cmd {
        ConfigCommands::Show => {
            let config = DaemonConfig::load(path)?;
            if format.is_structured() {
                print_structured(&config, format)?;
            } else {
                println!("# {}", path.display());
                print!("{}", toml::to_string_pretty(&config)?);
            }
        }

        ConfigCommands::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
            }
            DaemonConfig::default()
                .save(path)
                .with_context(|| format!("writing {}", path.display()))?;
            print_success(&format!("Wrote {}", path.display()));
            print_warning("Set node.server_public_key and node.endpoint_host before use");
        }

        ConfigCommands::Validate => {
            let config = DaemonConfig::load(path)?;
            config.validate()?;
            print_success(&format!(
                "Configuration valid: node {} ({}@{}, pool {})",
                config.node.id,
                config.node.ssh_user,
                config.node.ssh_host,
                config.node.pool()?
            ));
        }
    }

    Ok(())
}
