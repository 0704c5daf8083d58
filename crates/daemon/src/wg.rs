//! WireGuard node client
//!
//! Treats a node's interface as a peer table keyed by public key. Every
//! mutation is a single `wg set`, which creates or updates a peer, so calling
//! it again with the same arguments converges to the same node state.

use crate::remote::{CommandOutput, RemoteExecutor, RemoteTarget};
use peergate_common::{
    host_route, validate_interface_name, Error, Node, NodeApplyError, NodeOp, Result,
    WireGuardKey,
};
use std::collections::BTreeMap;
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// One line of `wg show <iface> allowed-ips`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WgPeerEntry {
    pub public_key: String,
    pub allowed_ips: Vec<String>,
}

/// Applies, removes and queries peers on a node's WireGuard interface
#[derive(Clone)]
pub struct WgNodeClient {
    executor: Arc<dyn RemoteExecutor>,
    sudo: bool,
}

impl WgNodeClient {
    pub fn new(executor: Arc<dyn RemoteExecutor>, sudo: bool) -> Self {
        Self { executor, sudo }
    }

    /// Whether `public_key` is configured on the node right now
    pub async fn has_peer(&self, public_key: &WireGuardKey, node: &Node) -> Result<bool> {
        validate_interface_name(&node.wg_interface)?;
        let command = self.wg(&format!("show {} peers", node.wg_interface));
        let output = self.run(node, NodeOp::Query, &command).await?;

        Ok(output
            .stdout
            .lines()
            .any(|line| line.trim() == public_key.as_str()))
    }

    /// Create the peer, or move it to `allowed_ip` if it already exists
    pub async fn add_peer(
        &self,
        public_key: &WireGuardKey,
        allowed_ip: Ipv4Addr,
        node: &Node,
    ) -> Result<()> {
        validate_interface_name(&node.wg_interface)?;
        let command = self.wg(&format!(
            "set {} peer {} allowed-ips {}",
            node.wg_interface,
            public_key,
            host_route(allowed_ip)
        ));
        self.run(node, NodeOp::Add, &command).await?;

        info!(
            "Applied peer {} ({}) on node {}",
            public_key, allowed_ip, node.id
        );
        Ok(())
    }

    /// Remove the peer; succeeds without a mutation when it is already absent
    pub async fn remove_peer(&self, public_key: &WireGuardKey, node: &Node) -> Result<()> {
        if !self.has_peer(public_key, node).await? {
            debug!("Peer {} already absent on node {}", public_key, node.id);
            return Ok(());
        }

        let command = self.wg(&format!(
            "set {} peer {} remove",
            node.wg_interface, public_key
        ));
        self.run(node, NodeOp::Remove, &command).await?;

        info!("Removed peer {} from node {}", public_key, node.id);
        Ok(())
    }

    /// Every peer currently configured on the node with its routes.
    ///
    /// Reads `allowed-ips` rather than `dump`, which would also print the
    /// interface private key.
    pub async fn list_peers(&self, node: &Node) -> Result<Vec<WgPeerEntry>> {
        validate_interface_name(&node.wg_interface)?;
        let command = self.wg(&format!("show {} allowed-ips", node.wg_interface));
        let output = self.run(node, NodeOp::List, &command).await?;
        parse_allowed_ips(&output.stdout)
    }

    /// Unix time of each peer's last handshake, 0 for never
    pub async fn latest_handshakes(&self, node: &Node) -> Result<BTreeMap<String, i64>> {
        validate_interface_name(&node.wg_interface)?;
        let command = self.wg(&format!("show {} latest-handshakes", node.wg_interface));
        let output = self.run(node, NodeOp::List, &command).await?;

        let mut handshakes = BTreeMap::new();
        for line in output.stdout.lines().filter(|l| !l.trim().is_empty()) {
            let (key, value) = split_key_line(line)?;
            handshakes.insert(key.to_string(), value.parse().unwrap_or(0));
        }
        Ok(handshakes)
    }

    fn wg(&self, args: &str) -> String {
        if self.sudo {
            format!("sudo -n wg {}", args)
        } else {
            format!("wg {}", args)
        }
    }

    /// Run one command and classify the failure modes
    async fn run(&self, node: &Node, op: NodeOp, command: &str) -> Result<CommandOutput> {
        let target = RemoteTarget::from(node);
        let output = self
            .executor
            .exec(&target, command)
            .await
            .map_err(|e| NodeApplyError::unknown(&node.id, op, e.to_string()))?;

        if !output.success() {
            let reason = if output.stderr.is_empty() {
                format!("wg exited with status {}", output.exit_code)
            } else {
                output.stderr.clone()
            };
            return Err(NodeApplyError::unchanged(&node.id, op, output.exit_code, reason).into());
        }

        Ok(output)
    }
}

/// Bound a node operation by `deadline`.
///
/// An elapsed deadline leaves the node's state indeterminate, exactly like a
/// transport failure.
pub async fn with_deadline<T, F>(deadline: Duration, node_id: &str, op: NodeOp, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(NodeApplyError::unknown(
            node_id,
            op,
            format!("deadline of {}ms elapsed", deadline.as_millis()),
        )
        .into()),
    }
}

/// Parse `wg show <iface> allowed-ips`: one peer per line, the key, a tab,
/// then space separated routes or `(none)`
pub fn parse_allowed_ips(stdout: &str) -> Result<Vec<WgPeerEntry>> {
    let mut peers = Vec::new();

    for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
        let (key, routes) = split_key_line(line)?;
        let allowed_ips = match routes.trim() {
            "(none)" | "" => Vec::new(),
            other => other.split_whitespace().map(str::to_string).collect(),
        };
        peers.push(WgPeerEntry {
            public_key: key.to_string(),
            allowed_ips,
        });
    }

    Ok(peers)
}

fn split_key_line(line: &str) -> Result<(&str, &str)> {
    line.split_once('\t')
        .map(|(key, rest)| (key.trim(), rest))
        .ok_or_else(|| Error::Internal(format!("malformed wg output line: {:?}", line)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{key, test_node, FakeNode, Failure};
    use peergate_common::RemoteState;

    fn client(fake: &Arc<FakeNode>) -> WgNodeClient {
        WgNodeClient::new(fake.clone(), true)
    }

    #[tokio::test]
    async fn test_add_peer_is_idempotent() {
        let fake = Arc::new(FakeNode::new());
        let node = test_node();
        let pk = WireGuardKey::parse(&key(1)).unwrap();
        let ip = Ipv4Addr::new(10, 8, 0, 2);

        client(&fake).add_peer(&pk, ip, &node).await.unwrap();
        let once = fake.peers();
        client(&fake).add_peer(&pk, ip, &node).await.unwrap();

        assert_eq!(fake.peers(), once);
        assert_eq!(once.get(pk.as_str()).map(String::as_str), Some("10.8.0.2/32"));
        assert!(fake
            .commands()
            .iter()
            .all(|c| c.starts_with("sudo -n wg set wg0 peer ")));
    }

    #[tokio::test]
    async fn test_add_peer_updates_allowed_ip() {
        let fake = Arc::new(FakeNode::new());
        let node = test_node();
        let pk = WireGuardKey::parse(&key(1)).unwrap();

        client(&fake).add_peer(&pk, Ipv4Addr::new(10, 8, 0, 2), &node).await.unwrap();
        client(&fake).add_peer(&pk, Ipv4Addr::new(10, 8, 0, 7), &node).await.unwrap();

        assert_eq!(fake.peers().len(), 1);
        assert_eq!(fake.peers()[pk.as_str()], "10.8.0.7/32");
    }

    #[tokio::test]
    async fn test_has_peer_exact_match() {
        let fake = Arc::new(FakeNode::new());
        let node = test_node();
        fake.insert_peer(&key(1), "10.8.0.2/32");

        let present = WireGuardKey::parse(&key(1)).unwrap();
        let absent = WireGuardKey::parse(&key(2)).unwrap();
        assert!(client(&fake).has_peer(&present, &node).await.unwrap());
        assert!(!client(&fake).has_peer(&absent, &node).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_absent_peer_is_noop() {
        let fake = Arc::new(FakeNode::new());
        let node = test_node();
        let pk = WireGuardKey::parse(&key(3)).unwrap();

        client(&fake).remove_peer(&pk, &node).await.unwrap();
        assert_eq!(fake.mutations(), 0);

        fake.insert_peer(&key(3), "10.8.0.3/32");
        client(&fake).remove_peer(&pk, &node).await.unwrap();
        assert_eq!(fake.mutations(), 1);
        assert!(fake.peers().is_empty());
    }

    #[tokio::test]
    async fn test_failure_classification() {
        let fake = Arc::new(FakeNode::new());
        let node = test_node();
        let pk = WireGuardKey::parse(&key(1)).unwrap();
        let ip = Ipv4Addr::new(10, 8, 0, 2);

        fake.fail_mutations(Failure::Transport);
        let err = client(&fake).add_peer(&pk, ip, &node).await.unwrap_err();
        let cause = err.node_cause().unwrap();
        assert_eq!(cause.state, RemoteState::Unknown);
        assert_eq!(cause.op, NodeOp::Add);

        fake.fail_mutations(Failure::Exit(1));
        let err = client(&fake).add_peer(&pk, ip, &node).await.unwrap_err();
        let cause = err.node_cause().unwrap();
        assert_eq!(cause.state, RemoteState::Unchanged);
        assert_eq!(cause.exit_code, Some(1));
        assert_eq!(cause.node_id, "wg-node-1");
    }

    #[tokio::test]
    async fn test_bad_interface_never_reaches_node() {
        let fake = Arc::new(FakeNode::new());
        let mut node = test_node();
        node.wg_interface = "wg0;reboot".to_string();
        let pk = WireGuardKey::parse(&key(1)).unwrap();

        let err = client(&fake)
            .add_peer(&pk, Ipv4Addr::new(10, 8, 0, 2), &node)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(fake.commands().is_empty());
    }

    #[test]
    fn test_parse_allowed_ips() {
        let out = format!(
            "{a}\t10.8.0.2/32\n{b}\t(none)\n{c}\t10.8.0.4/32 10.9.0.0/24\n",
            a = key(1),
            b = key(2),
            c = key(3),
        );
        let peers = parse_allowed_ips(&out).unwrap();

        assert_eq!(peers.len(), 3);
        assert_eq!(peers[0].public_key, key(1));
        assert_eq!(peers[0].allowed_ips, vec!["10.8.0.2/32"]);
        assert!(peers[1].allowed_ips.is_empty());
        assert_eq!(peers[2].allowed_ips, vec!["10.8.0.4/32", "10.9.0.0/24"]);

        assert!(parse_allowed_ips("no tab here\n").is_err());
        assert!(parse_allowed_ips("").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_listing_reads_no_key_material() {
        let fake = Arc::new(FakeNode::new());
        let node = test_node();
        fake.insert_peer(&key(1), "10.8.0.2/32");

        let peers = client(&fake).list_peers(&node).await.unwrap();
        assert_eq!(peers[0].public_key, key(1));
        let handshakes = client(&fake).latest_handshakes(&node).await.unwrap();
        assert_eq!(handshakes.get(&key(1)), Some(&0));

        assert_eq!(
            fake.commands(),
            vec![
                "sudo -n wg show wg0 allowed-ips".to_string(),
                "sudo -n wg show wg0 latest-handshakes".to_string(),
            ]
        );
    }
}
