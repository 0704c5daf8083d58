//! Node Commands

use std::collections::BTreeMap;

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;
use peergate_common::Node;
use peergate_daemon::WgPeerEntry;
use serde::Serialize;

use super::{format_time, Context};
use crate::output::{
    print_item, print_list, print_structured, print_success, print_warning, OutputFormat,
    TableDisplay,
};

#[derive(Subcommand)]
pub enum NodeCommands {
    /// Write the configured node to the database and show it
    Show,

    /// List peers currently configured on the node
    Peers,

    /// Compare the database with the node and optionally fix drift
    Reconcile {
        /// Execute the plan instead of printing it
        #[arg(long)]
        apply: bool,

        /// Also remove node peers that have no active database row
        #[arg(long)]
        remove_unknown: bool,
    },
}

/// Node display wrapper for serialization
#[derive(Serialize)]
pub struct NodeDisplay {
    pub id: String,
    pub name: String,
    pub ssh: String,
    pub interface: String,
    pub endpoint: String,
    pub pool: String,
    pub server_public_key: String,
    pub updated_at: String,
}

impl From<&Node> for NodeDisplay {
    fn from(node: &Node) -> Self {
        Self {
            id: node.id.clone(),
            name: node.name.clone(),
            ssh: format!("{}@{}", node.ssh_user, node.ssh_host),
            interface: node.wg_interface.clone(),
            endpoint: node.endpoint(),
            pool: node.pool.to_string(),
            server_public_key: node.server_public_key.clone(),
            updated_at: format_time(node.updated_at),
        }
    }
}

impl TableDisplay for NodeDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Name", "SSH", "Interface", "Endpoint", "Pool", "Updated"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.name.clone(),
            self.ssh.clone(),
            self.interface.clone(),
            self.endpoint.clone(),
            self.pool.clone(),
            self.updated_at.clone(),
        ]
    }
}

/// Live peer display wrapper
#[derive(Serialize)]
pub struct LivePeerDisplay {
    pub public_key: String,
    pub allowed_ips: String,
    pub latest_handshake: String,
}

impl LivePeerDisplay {
    fn new(entry: &WgPeerEntry, handshakes: &BTreeMap<String, i64>) -> Self {
        let allowed_ips = if entry.allowed_ips.is_empty() {
            "(none)".to_string()
        } else {
            entry.allowed_ips.join(", ")
        };
        Self {
            public_key: entry.public_key.clone(),
            allowed_ips,
            latest_handshake: match handshakes.get(&entry.public_key) {
                Some(&ts) if ts > 0 => format_time(ts),
                _ => "never".to_string(),
            },
        }
    }
}

impl TableDisplay for LivePeerDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Public Key", "Allowed IPs", "Handshake"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.public_key.clone(),
            self.allowed_ips.clone(),
            self.latest_handshake.clone(),
        ]
    }
}

pub async fn execute(cmd: NodeCommands, ctx: Context, format: OutputFormat) -> Result<()> {
    match cmd {
        NodeCommands::Show => {
            let node = ctx.provisioner().sync_node()?;
            print_item(&NodeDisplay::from(&node), format)?;
        }

        NodeCommands::Peers => {
            let node = ctx.provisioner().sync_node()?;
            let peers = ctx.client.list_peers(&node).await?;
            let handshakes = ctx.client.latest_handshakes(&node).await?;
            let displays: Vec<LivePeerDisplay> = peers
                .iter()
                .map(|entry| LivePeerDisplay::new(entry, &handshakes))
                .collect();
            print_list(&displays, format)?;
        }

        NodeCommands::Reconcile {
            apply,
            remove_unknown,
        } => {
            let remove_unknown = remove_unknown || ctx.config.reconcile.remove_unknown;
            let reconciler = ctx.reconciler().remove_unknown(remove_unknown);
            let (plan, report) = reconciler.reconcile_once(apply).await?;

            if format.is_structured() {
                print_structured(
                    &serde_json::json!({ "plan": plan, "report": report }),
                    format,
                )?;
                return Ok(());
            }

            for line in plan.to_string().lines() {
                let line = match line.chars().next() {
                    Some('+') => line.green().to_string(),
                    Some('~') => line.yellow().to_string(),
                    Some('-') => line.red().to_string(),
                    Some('?') => line.dimmed().to_string(),
                    _ => line.bold().to_string(),
                };
                println!("{}", line);
            }

            match report {
                Some(report) if report.failed.is_empty() => {
                    print_success(&format!("Applied {} change(s)", report.applied));
                    if report.skipped > 0 {
                        print_warning(&format!(
                            "Skipped {} change(s): peers changed since planning",
                            report.skipped
                        ));
                    }
                }
                Some(report) => {
                    for failure in &report.failed {
                        print_warning(&format!("{}: {}", failure.action, failure.error));
                    }
                    anyhow::bail!(
                        "{} of {} change(s) failed",
                        report.failed.len(),
                        plan.actions.len()
                    );
                }
                None if !plan.is_empty() => {
                    println!("Dry run; use --apply to execute");
                }
                None => {}
            }
        }
    }

    Ok(())
}
