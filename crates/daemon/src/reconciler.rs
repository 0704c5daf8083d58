//! Reconciliation loop
//!
//! Compares the active peers in the store (desired state) with the node's
//! live peer table (actual state) and plans the `wg set` calls that bring
//! the node in line. Node peers whose key belongs to a revoked row are always
//! removed; keys the store has never seen are only removed when
//! `remove_unknown` is enabled.
//!
//! The node is read before the store, so a key on the node always had its
//! row written first. Each action is checked against the store again right
//! before it runs, so a revoke or provision that lands between planning and
//! applying is never undone.

use crate::config::{DaemonConfig, NodeConfig, ReconcileConfig};
use crate::wg::{WgNodeClient, WgPeerEntry};
use peergate_common::{host_route, Error, Node, PeerStore, Result, WireGuardKey};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// One change to the node's peer table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanAction {
    /// Active in the store, missing on the node
    Add {
        public_key: String,
        allowed_ip: Ipv4Addr,
    },
    /// Present on both, routed to a different address on the node
    Update {
        public_key: String,
        allowed_ip: Ipv4Addr,
        current: String,
    },
    /// On the node without an active row
    Remove { public_key: String },
}

impl PlanAction {
    pub fn public_key(&self) -> &str {
        match self {
            PlanAction::Add { public_key, .. }
            | PlanAction::Update { public_key, .. }
            | PlanAction::Remove { public_key } => public_key,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            PlanAction::Add { .. } => 0,
            PlanAction::Update { .. } => 1,
            PlanAction::Remove { .. } => 2,
        }
    }
}

impl std::fmt::Display for PlanAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanAction::Add {
                public_key,
                allowed_ip,
            } => write!(f, "+ add    {} -> {}", public_key, host_route(*allowed_ip)),
            PlanAction::Update {
                public_key,
                allowed_ip,
                current,
            } => write!(
                f,
                "~ update {} -> {} (was {})",
                public_key,
                host_route(*allowed_ip),
                current
            ),
            PlanAction::Remove { public_key } => write!(f, "- remove {}", public_key),
        }
    }
}

/// Planned changes for one node
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub node_id: String,
    pub actions: Vec<PlanAction>,
    /// Active peers in the store
    pub desired: usize,
    /// Peers configured on the node
    pub actual: usize,
    /// Node peers the store has never seen, left alone because removal is disabled
    pub unmanaged: Vec<String>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.actions.is_empty() {
            write!(f, "PLAN: no changes")?;
        } else {
            write!(f, "PLAN: {} change(s)", self.actions.len())?;
            for action in &self.actions {
                write!(f, "\n{}", action)?;
            }
        }
        for key in &self.unmanaged {
            write!(f, "\n? unmanaged {}", key)?;
        }
        Ok(())
    }
}

/// A plan action the node rejected
#[derive(Debug, Clone, Serialize)]
pub struct ActionFailure {
    pub action: PlanAction,
    pub error: String,
}

/// Outcome of applying a plan
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    pub applied: usize,
    /// Actions dropped because the store changed after planning
    pub skipped: usize,
    pub failed: Vec<ActionFailure>,
}

/// Brings a node's peer table in line with the store
pub struct Reconciler {
    store: PeerStore,
    client: WgNodeClient,
    node: NodeConfig,
    settings: ReconcileConfig,
}

impl Reconciler {
    /// Create a new reconciler
    pub fn new(store: PeerStore, client: WgNodeClient, config: &DaemonConfig) -> Self {
        Self {
            store,
            client,
            node: config.node.clone(),
            settings: config.reconcile.clone(),
        }
    }

    /// Override whether unknown node peers are planned for removal
    pub fn remove_unknown(mut self, enabled: bool) -> Self {
        self.settings.remove_unknown = enabled;
        self
    }

    /// Run the reconciliation loop
    pub async fn run(&self) {
        let interval = Duration::from_secs(self.settings.interval_secs.max(1));
        info!(
            "Reconciler started for node {} (every {}s, {})",
            self.node.id,
            interval.as_secs(),
            if self.settings.apply { "apply" } else { "dry-run" }
        );

        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.reconcile_once(self.settings.apply).await {
                error!("Reconciliation error: {}", e);
            }
        }
    }

    /// One pass over the configured node
    pub async fn reconcile_once(&self, apply: bool) -> Result<(Plan, Option<ApplyReport>)> {
        let node = self.store.upsert_node(&self.node.id, &self.node.attrs()?)?;
        let plan = self.plan_for(&node).await?;

        if plan.is_empty() {
            debug!("Node {} in sync ({} peers)", node.id, plan.actual);
        } else {
            info!("Node {} drift:\n{}", node.id, plan);
        }

        if !apply || plan.is_empty() {
            return Ok((plan, None));
        }
        let report = self.apply(&plan).await?;
        Ok((plan, Some(report)))
    }

    /// Plan the changes for a stored node
    pub async fn plan(&self, node_id: &str) -> Result<Plan> {
        let node = self
            .store
            .get_node(node_id)?
            .ok_or_else(|| Error::not_found("node", node_id))?;
        self.plan_for(&node).await
    }

    async fn plan_for(&self, node: &Node) -> Result<Plan> {
        let actual = self.client.list_peers(node).await?;
        let desired = self.store.list_active_peers(&node.id)?;
        let revoked = self.store.revoked_keys(&node.id)?;

        let desired_by_key: BTreeMap<&str, Ipv4Addr> = desired
            .iter()
            .map(|p| (p.public_key.as_str(), p.allowed_ip))
            .collect();
        let actual_by_key: BTreeMap<&str, Option<String>> = actual
            .iter()
            .map(|entry| (entry.public_key.as_str(), primary_route(entry)))
            .collect();

        let mut actions = Vec::new();
        for (key, want) in &desired_by_key {
            let want_route = host_route(*want).to_string();
            match actual_by_key.get(key) {
                None => actions.push(PlanAction::Add {
                    public_key: key.to_string(),
                    allowed_ip: *want,
                }),
                Some(Some(have)) if *have == want_route => {}
                Some(have) => actions.push(PlanAction::Update {
                    public_key: key.to_string(),
                    allowed_ip: *want,
                    current: have.clone().unwrap_or_else(|| "(none)".to_string()),
                }),
            }
        }

        let mut unmanaged = Vec::new();
        for key in actual_by_key.keys() {
            if desired_by_key.contains_key(key) {
                continue;
            }
            if revoked.contains(*key) || self.settings.remove_unknown {
                actions.push(PlanAction::Remove {
                    public_key: key.to_string(),
                });
            } else {
                unmanaged.push(key.to_string());
            }
        }

        actions.sort_by(|a, b| {
            a.rank()
                .cmp(&b.rank())
                .then_with(|| a.public_key().cmp(b.public_key()))
        });

        if desired.is_empty() && actions.iter().any(|a| a.rank() == 2) {
            warn!(
                "No active peers for node {}; plan removes every peer on the node",
                node.id
            );
        }

        Ok(Plan {
            node_id: node.id.clone(),
            actions,
            desired: desired.len(),
            actual: actual.len(),
            unmanaged,
        })
    }

    /// Execute a plan. Refuses to start if any action carries a malformed key.
    pub async fn apply(&self, plan: &Plan) -> Result<ApplyReport> {
        let node = self
            .store
            .get_node(&plan.node_id)?
            .ok_or_else(|| Error::not_found("node", &plan.node_id))?;

        let mut keyed = Vec::with_capacity(plan.actions.len());
        for action in &plan.actions {
            let key = WireGuardKey::parse(action.public_key()).map_err(|_| {
                Error::validation(format!("invalid public key in plan: {}", action.public_key()))
            })?;
            keyed.push((action, key));
        }

        let mut report = ApplyReport::default();
        for (action, key) in keyed {
            let active = self.store.find_active_peer_by_key(&node.id, key.as_str())?;
            let result = match (action, active) {
                (PlanAction::Add { .. } | PlanAction::Update { .. }, Some(peer)) => {
                    self.client.add_peer(&key, peer.allowed_ip, &node).await
                }
                (PlanAction::Remove { .. }, None) => self.client.remove_peer(&key, &node).await,
                (_, active) => {
                    debug!(
                        "Skipping `{}`: peer is {} now",
                        action,
                        if active.is_some() { "active" } else { "not active" }
                    );
                    report.skipped += 1;
                    continue;
                }
            };

            match result {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    warn!("Failed to apply `{}`: {}", action, e);
                    report.failed.push(ActionFailure {
                        action: action.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Applied {} of {} change(s) on node {} ({} skipped)",
            report.applied,
            plan.actions.len(),
            node.id,
            report.skipped
        );
        Ok(report)
    }
}

/// The `/32` route of a node peer, or its first route; `None` without routes
fn primary_route(entry: &WgPeerEntry) -> Option<String> {
    let primary = entry
        .allowed_ips
        .iter()
        .find(|ip| ip.ends_with("/32"))
        .or_else(|| entry.allowed_ips.first())?;

    if primary.contains('/') {
        Some(primary.clone())
    } else {
        Some(format!("{}/32", primary))
    }
}
