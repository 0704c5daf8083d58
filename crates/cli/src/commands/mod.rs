//! CLI Commands
//!
//! Commands run the provisioning engine in-process against the same
//! database and node the daemon uses.

pub mod config;
pub mod node;
pub mod peer;

use anyhow::Result;
use peergate_common::{Database, PeerStore};
use peergate_daemon::{
    DaemonConfig, ProvisioningService, Reconciler, RevocationService, SshExecutor, WgNodeClient,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Everything a command needs to reach the store and the node
pub struct Context {
    pub config: DaemonConfig,
    pub store: PeerStore,
    pub client: WgNodeClient,
}

impl Context {
    /// Load and validate configuration, then open the database
    pub fn open(config_path: &Path, db_override: Option<PathBuf>) -> Result<Self> {
        let mut config = DaemonConfig::load(config_path)?;
        if let Some(db) = db_override {
            config.db_path = Some(db);
        }
        config.validate()?;

        let store = PeerStore::new(Database::open(config.db_path())?);
        let executor = Arc::new(SshExecutor::new(config.ssh.clone()));
        let client = WgNodeClient::new(executor, config.ssh.sudo);

        Ok(Self {
            config,
            store,
            client,
        })
    }

    pub fn provisioner(&self) -> ProvisioningService {
        ProvisioningService::new(self.store.clone(), self.client.clone(), &self.config)
    }

    pub fn revoker(&self) -> RevocationService {
        RevocationService::new(self.store.clone(), self.client.clone(), &self.config)
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.store.clone(), self.client.clone(), &self.config)
    }
}

/// Format a unix timestamp for tables
pub fn format_time(epoch_secs: i64) -> String {
    chrono::DateTime::from_timestamp(epoch_secs, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| epoch_secs.to_string())
}
