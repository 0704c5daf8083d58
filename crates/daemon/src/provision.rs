//! Peer provisioning
//!
//! A provision writes the peer row first and applies it to the node second.
//! The two steps are not transactional, so any failure of the second step
//! revokes the row before the error reaches the caller: the store never
//! reports an active peer the node did not confirm.
//!
//! Concurrent calls for one device can meet on the same row while it is
//! still being applied. Whichever apply succeeds first confirms the row;
//! a rollback only revokes rows nobody confirmed, and a call whose re-apply
//! finds the row already revoked starts over with a fresh one.

use crate::allocator::IpAllocator;
use crate::config::{DaemonConfig, NodeConfig, ProvisioningConfig};
use crate::template;
use crate::wg::{with_deadline, WgNodeClient};
use peergate_common::{
    ConflictKind, Error, NewPeer, Node, NodeApplyError, NodeOp, Peer, PeerStore, Result,
    WireGuardKey,
};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Insert attempts before giving up on address/device races
const MAX_CREATE_ATTEMPTS: usize = 8;

/// Result of a successful provision
#[derive(Debug, Clone, Serialize)]
pub struct Provisioned {
    pub peer: Peer,
    pub node: Node,
    /// Client profile
    pub config: String,
    /// True when an already active peer was returned
    pub existing: bool,
}

/// Orchestrates device lookup, allocation, node apply and rollback
#[derive(Clone)]
pub struct ProvisioningService {
    store: PeerStore,
    allocator: IpAllocator,
    client: WgNodeClient,
    node: NodeConfig,
    settings: ProvisioningConfig,
}

impl ProvisioningService {
    pub fn new(store: PeerStore, client: WgNodeClient, config: &DaemonConfig) -> Self {
        Self {
            allocator: IpAllocator::new(store.clone()),
            store,
            client,
            node: config.node.clone(),
            settings: config.provisioning.clone(),
        }
    }

    /// Write the configured node parameters and return the stored node
    pub fn sync_node(&self) -> Result<Node> {
        self.store.upsert_node(&self.node.id, &self.node.attrs()?)
    }

    /// Provision `public_key` for the user's canonical device
    pub async fn provision(&self, user_id: &str, public_key: &str) -> Result<Provisioned> {
        self.provision_with_deadline(user_id, public_key, self.settings.apply_timeout())
            .await
    }

    /// Like [`provision`](Self::provision) with an explicit bound on the node apply
    pub async fn provision_with_deadline(
        &self,
        user_id: &str,
        public_key: &str,
        deadline: Duration,
    ) -> Result<Provisioned> {
        let key = WireGuardKey::parse(public_key)?;
        validate_user(user_id)?;

        let device = self
            .store
            .find_or_create_device(user_id, &self.settings.platform)?;
        let node = self.sync_node()?;

        for attempt in 1..=MAX_CREATE_ATTEMPTS {
            if let Some(existing) = self.store.find_active_peer(device.id, &node.id)? {
                match self.reapply(existing, &key, &node, deadline).await? {
                    Some(peer) => return Ok(self.finish(peer, node, true)),
                    None => continue,
                }
            }

            let allowed_ip = self.allocator.allocate_on(&node)?;
            let new = NewPeer {
                node_id: node.id.clone(),
                device_id: device.id,
                user_id: user_id.to_string(),
                public_key: key.clone(),
                allowed_ip,
            };

            match self.store.create_peer(&new) {
                Ok(peer) => {
                    let peer = self
                        .apply_new(peer, key.clone(), node.clone(), deadline)
                        .await?;
                    info!(
                        "Provisioned peer {} for user {} at {} on node {}",
                        peer.id, user_id, peer.allowed_ip, node.id
                    );
                    return Ok(self.finish(peer, node, false));
                }
                Err(Error::Conflict {
                    kind: ConflictKind::AllowedIp | ConflictKind::ActiveDevicePeer,
                    detail,
                }) => {
                    debug!("Create attempt {} lost a race: {}", attempt, detail);
                }
                Err(Error::Conflict {
                    kind: ConflictKind::PublicKey,
                    detail,
                }) => {
                    // Same key inserted concurrently for this device, or held by another device
                    if self.store.find_active_peer(device.id, &node.id)?.is_none() {
                        return Err(Error::conflict(ConflictKind::PublicKey, detail));
                    }
                    debug!("Create attempt {} found the key on this device: {}", attempt, detail);
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::conflict(
            ConflictKind::Other,
            format!(
                "could not create a peer for user {} after {} attempts",
                user_id, MAX_CREATE_ATTEMPTS
            ),
        ))
    }

    /// Re-render the profile of one of the user's active peers
    pub fn profile(&self, user_id: &str, peer_id: Uuid) -> Result<Provisioned> {
        let peer = self
            .store
            .find_peer_owned_by_user(peer_id, user_id)?
            .filter(Peer::is_active)
            .ok_or_else(|| Error::not_found("peer", peer_id))?;
        let node = self
            .store
            .get_node(&peer.node_id)?
            .ok_or_else(|| Error::not_found("node", &peer.node_id))?;
        Ok(self.finish(peer, node, true))
    }

    /// Every peer the user has had, newest first
    pub fn list_peers(&self, user_id: &str) -> Result<Vec<Peer>> {
        self.store.list_peers_for_user(user_id)
    }

    /// Re-apply the device's active peer to the node and confirm it.
    ///
    /// `None` means the row was revoked while this call was applying it, by
    /// the rollback of the call that created it; the caller starts over.
    async fn reapply(
        &self,
        existing: Peer,
        key: &WireGuardKey,
        node: &Node,
        deadline: Duration,
    ) -> Result<Option<Peer>> {
        if existing.public_key != key.as_str() {
            return Err(Error::conflict(
                ConflictKind::KeyMismatch,
                format!(
                    "device already has active peer {} with a different public key",
                    existing.id
                ),
            ));
        }

        debug!("Re-applying existing peer {} on node {}", existing.id, node.id);
        let applied = with_deadline(
            deadline,
            &node.id,
            NodeOp::Add,
            self.client.add_peer(key, existing.allowed_ip, node),
        )
        .await;

        match applied {
            Ok(()) => {
                if !self.store.confirm_peer(existing.id)? {
                    info!(
                        "Peer {} was revoked while being re-applied, starting over",
                        existing.id
                    );
                    return Ok(None);
                }
                let peer = self
                    .store
                    .get_peer(existing.id)?
                    .ok_or_else(|| Error::not_found("peer", existing.id))?;
                Ok(Some(peer))
            }
            Err(Error::NodeApply(cause)) => {
                // A confirmed peer is left active for the next heal; an
                // unconfirmed one belongs to the call still applying it
                warn!("Re-apply of peer {} failed: {}", existing.id, cause);
                Err(Error::ProvisionFailed {
                    peer_id: Some(existing.id),
                    cause,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Apply a freshly created row, revoking it if the node does not confirm.
    ///
    /// Runs on its own task so that a caller that stops waiting cannot skip
    /// the rollback; dropping the caller's future cancels the apply and
    /// revokes the row.
    async fn apply_new(
        &self,
        peer: Peer,
        key: WireGuardKey,
        node: Node,
        deadline: Duration,
    ) -> Result<Peer> {
        let (_cancel, cancelled) = oneshot::channel::<()>();
        let task = tokio::spawn(apply_or_rollback(
            self.store.clone(),
            self.client.clone(),
            node,
            peer,
            key,
            deadline,
            cancelled,
        ));

        task.await
            .map_err(|e| Error::Internal(format!("apply task failed: {}", e)))?
    }

    fn finish(&self, peer: Peer, node: Node, existing: bool) -> Provisioned {
        Provisioned {
            config: template::render(&peer, &node, &self.settings.client_dns),
            peer,
            node,
            existing,
        }
    }
}

async fn apply_or_rollback(
    store: PeerStore,
    client: WgNodeClient,
    node: Node,
    peer: Peer,
    key: WireGuardKey,
    deadline: Duration,
    cancelled: oneshot::Receiver<()>,
) -> Result<Peer> {
    let applied = tokio::select! {
        result = with_deadline(
            deadline,
            &node.id,
            NodeOp::Add,
            client.add_peer(&key, peer.allowed_ip, &node),
        ) => result,
        _ = cancelled => Err(NodeApplyError::unknown(
            &node.id,
            NodeOp::Add,
            "provisioning cancelled before the node confirmed",
        )
        .into()),
    };

    let err = match applied {
        Ok(()) => {
            if store.confirm_peer(peer.id)? {
                return store
                    .get_peer(peer.id)?
                    .ok_or_else(|| Error::not_found("peer", peer.id));
            }
            // Revoked while the apply was in flight; the reconciler removes the key
            warn!("Peer {} was revoked before the node confirmed it", peer.id);
            return Err(Error::conflict(
                ConflictKind::Other,
                format!("peer {} was revoked during provisioning", peer.id),
            ));
        }
        Err(err) => err,
    };

    let rolled_back = store.revoke_unconfirmed(peer.id).map_err(|e| {
        error!("Rollback of peer {} failed: {}", peer.id, e);
        e
    })?;

    if !rolled_back {
        if let Some(current) = store.get_peer(peer.id)?.filter(Peer::is_active) {
            // Another call for this device applied and confirmed the same row
            info!(
                "Apply of peer {} failed but a concurrent apply confirmed it: {}",
                peer.id, err
            );
            return Ok(current);
        }
    }

    warn!(
        "Apply of peer {} on node {} failed, row revoked: {}",
        peer.id, node.id, err
    );
    match err {
        Error::NodeApply(cause) => Err(Error::ProvisionFailed {
            peer_id: Some(peer.id),
            cause,
        }),
        other => Err(other),
    }
}

fn validate_user(user_id: &str) -> Result<()> {
    if user_id.trim().is_empty() {
        return Err(Error::validation("user id must not be empty"));
    }
    Ok(())
}
