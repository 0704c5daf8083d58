//! Test fixtures: an in-process stand-in for a WireGuard node

use crate::config::DaemonConfig;
use crate::provision::ProvisioningService;
use crate::reconciler::Reconciler;
use crate::revoke::RevocationService;
use crate::remote::{CommandOutput, RemoteExecutor, RemoteTarget, TransportError};
use crate::wg::WgNodeClient;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use parking_lot::Mutex;
use peergate_common::{Database, IpPool, Node, PeerStore};
use std::collections::{BTreeMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Deterministic valid public key
pub fn key(seed: u8) -> String {
    STANDARD.encode([seed; 32])
}

pub fn test_config() -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.node.server_public_key = key(99);
    config.node.endpoint_host = "vpn.example.com".to_string();
    config
}

pub fn test_node() -> Node {
    let config = test_config();
    let attrs = config.node.attrs().unwrap();
    Node {
        id: config.node.id.clone(),
        name: attrs.name,
        ssh_host: attrs.ssh_host,
        ssh_user: attrs.ssh_user,
        wg_interface: attrs.wg_interface,
        server_public_key: attrs.server_public_key,
        endpoint_host: attrs.endpoint_host,
        wg_port: attrs.wg_port,
        pool: attrs.pool,
        updated_at: 0,
    }
}

/// How an injected failure presents itself
#[derive(Debug, Clone, Copy)]
pub enum Failure {
    /// ssh could not connect; the command may or may not have run
    Transport,
    /// `wg` ran and exited with this status
    Exit(i32),
    /// The command took effect on the node, then the connection dropped
    Lost,
}

/// Simulates `wg show`/`wg set` against an in-memory peer table
#[derive(Default)]
pub struct FakeNode {
    peers: Mutex<BTreeMap<String, String>>,
    commands: Mutex<Vec<String>>,
    mutations: AtomicUsize,
    fail_mutations: Mutex<Option<Failure>>,
    fail_all: Mutex<Option<Failure>>,
    mutation_delay: Mutex<Option<Duration>>,
    script: Mutex<VecDeque<(Duration, Option<Failure>)>>,
}

impl FakeNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_peer(&self, public_key: &str, allowed_ips: &str) {
        self.peers
            .lock()
            .insert(public_key.to_string(), allowed_ips.to_string());
    }

    pub fn clear_peers(&self) {
        self.peers.lock().clear();
    }

    /// public key -> allowed ips
    pub fn peers(&self) -> BTreeMap<String, String> {
        self.peers.lock().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    /// Number of `wg set` invocations received, failed or not
    pub fn mutations(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    pub fn fail_mutations(&self, failure: Failure) {
        *self.fail_mutations.lock() = Some(failure);
    }

    pub fn fail_all(&self, failure: Failure) {
        *self.fail_all.lock() = Some(failure);
    }

    pub fn heal(&self) {
        *self.fail_mutations.lock() = None;
        *self.fail_all.lock() = None;
    }

    pub fn delay_mutations(&self, delay: Duration) {
        *self.mutation_delay.lock() = Some(delay);
    }

    /// Outcomes for the next `wg set` calls in arrival order: each waits for
    /// its delay, then fails with the given failure or succeeds. Later calls
    /// fall back to the other settings.
    pub fn script_mutations(&self, steps: Vec<(Duration, Option<Failure>)>) {
        self.script.lock().extend(steps);
    }

    fn injected(
        failure: Option<Failure>,
        target: &RemoteTarget,
    ) -> Option<Result<CommandOutput, TransportError>> {
        failure.map(|f| match f {
            Failure::Transport | Failure::Lost => Err(TransportError::Connection {
                target: target.to_string(),
                message: "Connection refused".to_string(),
            }),
            Failure::Exit(code) => Ok(CommandOutput {
                stdout: String::new(),
                stderr: "Unable to modify interface: Operation not permitted".to_string(),
                exit_code: code,
            }),
        })
    }
}

fn ok(stdout: String) -> Result<CommandOutput, TransportError> {
    Ok(CommandOutput {
        stdout,
        stderr: String::new(),
        exit_code: 0,
    })
}

impl FakeNode {
    /// Interpret a `wg` command against the peer table
    fn run_wg(&self, args: &[&str], command: &str) -> Result<CommandOutput, TransportError> {
        match args {
            ["wg", "show", _, "peers"] => {
                let keys: Vec<String> = self.peers.lock().keys().cloned().collect();
                ok(keys.iter().map(|k| format!("{}\n", k)).collect())
            }
            ["wg", "show", _, "allowed-ips"] => ok(self
                .peers
                .lock()
                .iter()
                .map(|(pk, ips)| format!("{}\t{}\n", pk, ips))
                .collect()),
            ["wg", "show", _, "latest-handshakes"] => ok(self
                .peers
                .lock()
                .keys()
                .map(|pk| format!("{}\t0\n", pk))
                .collect()),
            ["wg", "set", _, "peer", pk, "allowed-ips", ips] => {
                self.insert_peer(pk, ips);
                ok(String::new())
            }
            ["wg", "set", _, "peer", pk, "remove"] => {
                self.peers.lock().remove(*pk);
                ok(String::new())
            }
            _ => Ok(CommandOutput {
                stdout: String::new(),
                stderr: format!("unsupported command: {}", command),
                exit_code: 2,
            }),
        }
    }
}

#[async_trait]
impl RemoteExecutor for FakeNode {
    async fn exec(
        &self,
        target: &RemoteTarget,
        command: &str,
    ) -> Result<CommandOutput, TransportError> {
        self.commands.lock().push(command.to_string());

        let command = command.strip_prefix("sudo -n ").unwrap_or(command);
        let args: Vec<&str> = command.split_whitespace().collect();
        let mutating = args.get(1) == Some(&"set");

        let mut failure = *self.fail_all.lock();
        if mutating {
            self.mutations.fetch_add(1, Ordering::SeqCst);
            let step = self.script.lock().pop_front();
            let (delay, scripted) = match step {
                Some((delay, scripted)) => (Some(delay), Some(scripted)),
                None => (*self.mutation_delay.lock(), None),
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            failure = match scripted {
                Some(scripted) => failure.or(scripted),
                None => failure.or(*self.fail_mutations.lock()),
            };
        }

        if let Some(Failure::Lost) = failure {
            let _ = self.run_wg(&args, command);
        }
        if let Some(result) = Self::injected(failure, target) {
            return result;
        }
        self.run_wg(&args, command)
    }
}

/// Store, fake node and config wired together
pub struct Harness {
    pub store: PeerStore,
    pub fake: Arc<FakeNode>,
    pub config: DaemonConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: DaemonConfig) -> Self {
        let db = Database::open_memory().unwrap();
        Self {
            store: PeerStore::new(db),
            fake: Arc::new(FakeNode::new()),
            config,
        }
    }

    /// Shrink the node's pool to `start..=end` in the last octet
    pub fn with_pool(start: u8, end: u8) -> Self {
        let mut config = test_config();
        config.node.pool_start = Ipv4Addr::new(10, 8, 0, start);
        config.node.pool_end = Ipv4Addr::new(10, 8, 0, end);
        assert!(IpPool::new(config.node.pool_start, config.node.pool_end).is_ok());
        Self::with_config(config)
    }

    pub fn client(&self) -> WgNodeClient {
        WgNodeClient::new(self.fake.clone(), self.config.ssh.sudo)
    }

    pub fn provisioner(&self) -> ProvisioningService {
        ProvisioningService::new(self.store.clone(), self.client(), &self.config)
    }

    pub fn revoker(&self) -> RevocationService {
        RevocationService::new(self.store.clone(), self.client(), &self.config)
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.store.clone(), self.client(), &self.config)
    }
}
