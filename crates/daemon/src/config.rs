//! Daemon configuration

use crate::revoke::RevocationPolicy;
use peergate_common::{
    validate_interface_name, Error, IpPool, NodeAttrs, Result, WireGuardKey,
};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// Database file; defaults to `<store_path>/state.db`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,

    /// The WireGuard node peers are provisioned on
    pub node: NodeConfig,

    /// Remote command transport
    pub ssh: SshConfig,

    /// Provisioning and revocation behaviour
    pub provisioning: ProvisioningConfig,

    /// Periodic DB -> node reconciliation
    pub reconcile: ReconcileConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            store_path: peergate_common::default_store_path(),
            db_path: None,
            node: NodeConfig::default(),
            ssh: SshConfig::default(),
            provisioning: ProvisioningConfig::default(),
            reconcile: ReconcileConfig::default(),
        }
    }
}

/// Node connection parameters, upserted into the `nodes` table on every flow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Stable node identifier (upsert key)
    pub id: String,

    /// Display name; defaults to the id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Host reached over SSH
    pub ssh_host: String,

    /// SSH login
    pub ssh_user: String,

    /// WireGuard interface on the node
    pub wg_interface: String,

    /// Server public key handed to clients
    pub server_public_key: String,

    /// Public endpoint host clients dial
    pub endpoint_host: String,

    /// WireGuard listen port
    pub wg_port: u16,

    /// First assignable peer address
    pub pool_start: Ipv4Addr,

    /// Last assignable peer address
    pub pool_end: Ipv4Addr,

    /// Alternative to start/end: every host of this network except .0, .1 and broadcast
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_cidr: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: "wg-node-1".to_string(),
            name: None,
            ssh_host: "127.0.0.1".to_string(),
            ssh_user: "root".to_string(),
            wg_interface: "wg0".to_string(),
            server_public_key: String::new(),
            endpoint_host: "127.0.0.1".to_string(),
            wg_port: 51820,
            pool_start: Ipv4Addr::new(10, 8, 0, 2),
            pool_end: Ipv4Addr::new(10, 8, 0, 254),
            pool_cidr: None,
        }
    }
}

impl NodeConfig {
    /// Address pool described by this config
    pub fn pool(&self) -> Result<IpPool> {
        match &self.pool_cidr {
            Some(cidr) => {
                let network = cidr
                    .parse()
                    .map_err(|e| Error::InvalidConfig(format!("pool_cidr {:?}: {}", cidr, e)))?;
                IpPool::from_network(network)
            }
            None => IpPool::new(self.pool_start, self.pool_end),
        }
    }

    /// Attributes written by the node upsert
    pub fn attrs(&self) -> Result<NodeAttrs> {
        Ok(NodeAttrs {
            name: self.name.clone().unwrap_or_else(|| self.id.clone()),
            ssh_host: self.ssh_host.clone(),
            ssh_user: self.ssh_user.clone(),
            wg_interface: self.wg_interface.clone(),
            server_public_key: self.server_public_key.clone(),
            endpoint_host: self.endpoint_host.clone(),
            wg_port: self.wg_port,
            pool: self.pool()?,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidConfig("node.id must not be empty".to_string()));
        }
        if self.ssh_host.trim().is_empty() || self.ssh_user.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "node.ssh_host and node.ssh_user must be set".to_string(),
            ));
        }
        if self.ssh_host.starts_with('-') || self.ssh_user.starts_with('-') {
            return Err(Error::InvalidConfig(
                "node.ssh_host and node.ssh_user must not start with '-'".to_string(),
            ));
        }
        validate_interface_name(&self.wg_interface)
            .map_err(|e| Error::InvalidConfig(format!("node.wg_interface: {}", e)))?;
        WireGuardKey::parse(&self.server_public_key)
            .map_err(|e| Error::InvalidConfig(format!("node.server_public_key: {}", e)))?;
        if self.endpoint_host.trim().is_empty() {
            return Err(Error::InvalidConfig("node.endpoint_host must be set".to_string()));
        }
        if self.wg_port == 0 {
            return Err(Error::InvalidConfig("node.wg_port must not be 0".to_string()));
        }
        self.pool()?;
        Ok(())
    }
}

/// SSH transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// Path to the ssh binary
    pub binary: String,

    /// SSH port
    pub port: u16,

    /// Identity file passed with `-i`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,

    /// Extra `ssh` arguments, e.g. `["-o", "StrictHostKeyChecking=accept-new"]`
    pub options: Vec<String>,

    /// Prefix `wg` with `sudo -n`
    pub sudo: bool,

    /// Per-command timeout
    pub command_timeout_secs: u64,

    /// Concurrent SSH sessions per daemon
    pub max_sessions: usize,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            binary: "ssh".to_string(),
            port: 22,
            identity_file: None,
            options: vec![
                "-o".to_string(),
                "StrictHostKeyChecking=accept-new".to_string(),
            ],
            sudo: true,
            command_timeout_secs: 20,
            max_sessions: 4,
        }
    }
}

impl SshConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Provisioning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Platform of the canonical device created per user
    pub platform: String,

    /// DNS server written into client profiles
    pub client_dns: String,

    /// Deadline for the remote apply step of one provisioning call
    pub apply_timeout_secs: u64,

    /// What revocation does when the node removal fails
    pub revocation_policy: RevocationPolicy,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            platform: "ios".to_string(),
            client_dns: "1.1.1.1".to_string(),
            apply_timeout_secs: 30,
            revocation_policy: RevocationPolicy::Strict,
        }
    }
}

impl ProvisioningConfig {
    pub fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_timeout_secs)
    }
}

/// Reconciliation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Run the reconciliation loop in the daemon
    pub enabled: bool,

    /// Seconds between passes
    pub interval_secs: u64,

    /// Execute plans instead of only logging them
    pub apply: bool,

    /// Remove node peers that have no active row
    pub remove_unknown: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            apply: false,
            remove_unknown: false,
        }
    }
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject configurations the engine cannot safely run with
    pub fn validate(&self) -> Result<()> {
        self.node.validate()?;
        if self.provisioning.platform.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "provisioning.platform must not be empty".to_string(),
            ));
        }
        if self.ssh.max_sessions == 0 {
            return Err(Error::InvalidConfig("ssh.max_sessions must be at least 1".to_string()));
        }
        if self.ssh.command_timeout_secs == 0 || self.provisioning.apply_timeout_secs == 0 {
            return Err(Error::InvalidConfig("timeouts must be at least 1 second".to_string()));
        }
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.store_path.join("state.db"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::key;

    fn valid() -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config.node.server_public_key = key(99);
        config.node.endpoint_host = "vpn.example.com".to_string();
        config
    }

    #[test]
    fn test_defaults_follow_deployment() {
        let config = DaemonConfig::default();
        assert_eq!(config.node.id, "wg-node-1");
        assert_eq!(config.node.wg_interface, "wg0");
        assert_eq!(config.node.wg_port, 51820);
        assert_eq!(config.node.pool().unwrap().to_string(), "10.8.0.2..10.8.0.254");
        assert_eq!(config.provisioning.client_dns, "1.1.1.1");
        assert_eq!(config.provisioning.revocation_policy, RevocationPolicy::Strict);
        assert!(!config.reconcile.apply);
    }

    #[test]
    fn test_validate() {
        assert!(valid().validate().is_ok());

        // Server key is required
        assert!(DaemonConfig::default().validate().is_err());

        let mut bad = valid();
        bad.node.wg_interface = "wg0 && reboot".to_string();
        assert!(bad.validate().is_err());

        let mut bad = valid();
        bad.node.pool_start = Ipv4Addr::new(10, 8, 0, 9);
        bad.node.pool_end = Ipv4Addr::new(10, 8, 0, 2);
        assert!(bad.validate().is_err());

        let mut bad = valid();
        bad.node.ssh_host = "-oProxyCommand=x".to_string();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_pool_cidr_overrides_range() {
        let mut config = valid();
        config.node.pool_cidr = Some("10.9.0.0/28".to_string());
        let pool = config.node.pool().unwrap();
        assert_eq!(pool.start.to_string(), "10.9.0.2");
        assert_eq!(pool.end.to_string(), "10.9.0.14");

        config.node.pool_cidr = Some("nonsense".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_save_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        // Missing file yields defaults
        let loaded = DaemonConfig::load(&path).unwrap();
        assert_eq!(loaded.node.id, "wg-node-1");

        let mut config = valid();
        config.provisioning.revocation_policy = RevocationPolicy::BestEffort;
        config.save(&path).unwrap();

        let loaded = DaemonConfig::load(&path).unwrap();
        assert_eq!(loaded.node.server_public_key, config.node.server_public_key);
        assert_eq!(loaded.provisioning.revocation_policy, RevocationPolicy::BestEffort);
        assert_eq!(loaded.db_path(), config.store_path.join("state.db"));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: DaemonConfig = toml::from_str(
            r#"
            [node]
            id = "edge-1"
            server_public_key = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="

            [provisioning]
            revocation_policy = "best_effort"
            "#,
        )
        .unwrap();
        assert_eq!(config.node.id, "edge-1");
        assert_eq!(config.node.wg_interface, "wg0");
        assert_eq!(config.provisioning.revocation_policy, RevocationPolicy::BestEffort);
        assert!(config.validate().is_ok());
    }
}
