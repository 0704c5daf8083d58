//! Peer Commands

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;
use peergate_common::Peer;
use serde::Serialize;
use uuid::Uuid;

use super::{format_time, Context};
use crate::output::{
    print_item, print_list, print_structured, print_success, print_warning, OutputFormat,
    TableDisplay,
};

#[derive(Subcommand)]
pub enum PeerCommands {
    /// Provision a peer for a user's device and print its profile
    Provision {
        /// User ID
        #[arg(short, long)]
        user: String,

        /// Device WireGuard public key (base64)
        #[arg(short = 'k', long)]
        public_key: String,
    },

    /// Revoke one of a user's peers
    Revoke {
        /// User ID
        #[arg(short, long)]
        user: String,

        /// Peer ID
        peer_id: Uuid,
    },

    /// List a user's peers, active and revoked
    List {
        /// User ID
        #[arg(short, long)]
        user: String,
    },

    /// Print the client profile of an active peer
    Profile {
        /// User ID
        #[arg(short, long)]
        user: String,

        /// Peer ID
        peer_id: Uuid,
    },
}

/// Peer display wrapper for serialization
#[derive(Serialize)]
pub struct PeerDisplay {
    pub id: String,
    pub user_id: String,
    pub node_id: String,
    pub address: String,
    pub public_key: String,
    pub status: String,
    pub created_at: String,
    pub revoked_at: Option<String>,
}

impl From<&Peer> for PeerDisplay {
    fn from(peer: &Peer) -> Self {
        Self {
            id: peer.id.to_string(),
            user_id: peer.user_id.clone(),
            node_id: peer.node_id.clone(),
            address: peer.allowed_ip.to_string(),
            public_key: peer.public_key.clone(),
            status: if peer.is_active() { "active" } else { "revoked" }.to_string(),
            created_at: format_time(peer.created_at),
            revoked_at: peer.revoked_at.map(format_time),
        }
    }
}

impl TableDisplay for PeerDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "User", "Node", "Address", "Public Key", "Status", "Created"]
    }

    fn row(&self) -> Vec<String> {
        let status = if self.status == "active" {
            self.status.green().to_string()
        } else {
            self.status.dimmed().to_string()
        };
        vec![
            self.id.clone(),
            self.user_id.clone(),
            self.node_id.clone(),
            self.address.clone(),
            self.public_key.clone(),
            status,
            self.created_at.clone(),
        ]
    }
}

pub async fn execute(cmd: PeerCommands, ctx: Context, format: OutputFormat) -> Result<()> {
    match cmd {
        PeerCommands::Provision { user, public_key } => {
            let out = ctx.provisioner().provision(&user, &public_key).await?;
            if format.is_structured() {
                print_structured(&out, format)?;
                return Ok(());
            }

            if out.existing {
                print_success(&format!("Peer {} already active, re-applied", out.peer.id));
            } else {
                print_success(&format!(
                    "Peer {} provisioned at {}",
                    out.peer.id, out.peer.allowed_ip
                ));
            }
            print_item(&PeerDisplay::from(&out.peer), format)?;
            println!();
            println!("{}", out.config);
        }

        PeerCommands::Revoke { user, peer_id } => {
            let result = ctx.revoker().revoke(&user, peer_id).await?;
            if format.is_structured() {
                print_structured(&result, format)?;
                return Ok(());
            }

            if result.already_revoked {
                print_success(&format!("Peer {} was already revoked", peer_id));
            } else if result.node_confirmed {
                print_success(&format!("Peer {} revoked", peer_id));
            } else {
                print_warning(&format!(
                    "Peer {} revoked, but the node did not confirm removal",
                    peer_id
                ));
            }
        }

        PeerCommands::List { user } => {
            let peers = ctx.provisioner().list_peers(&user)?;
            let displays: Vec<PeerDisplay> = peers.iter().map(PeerDisplay::from).collect();
            print_list(&displays, format)?;
        }

        PeerCommands::Profile { user, peer_id } => {
            let out = ctx.provisioner().profile(&user, peer_id)?;
            if format.is_structured() {
                print_structured(&out, format)?;
            } else {
                println!("{}", out.config);
            }
        }
    }

    Ok(())
}
