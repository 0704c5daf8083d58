//! Peer revocation
//!
//! Under the strict policy the row is only marked revoked after the node
//! confirmed the removal, so the store never claims a device lost access
//! while the node still routes its traffic.

use crate::config::{DaemonConfig, NodeConfig};
use crate::wg::{with_deadline, WgNodeClient};
use peergate_common::{Error, NodeOp, PeerStore, Result, WireGuardKey};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What happens to the row when the node removal fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationPolicy {
    /// Keep the peer active and report `RevokeFailed`
    #[default]
    Strict,
    /// Mark the peer revoked anyway; the reconciler removes it from the node later
    BestEffort,
}

/// Result of a revocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Revoked {
    pub revoked: bool,
    pub peer_id: Uuid,
    /// The node confirmed the peer is gone (false only under best effort)
    pub node_confirmed: bool,
    /// The peer was already revoked before this call
    pub already_revoked: bool,
}

/// Removes a user's peer from the node and soft-revokes its row
#[derive(Clone)]
pub struct RevocationService {
    store: PeerStore,
    client: WgNodeClient,
    node: NodeConfig,
    policy: RevocationPolicy,
    deadline: Duration,
}

impl RevocationService {
    pub fn new(store: PeerStore, client: WgNodeClient, config: &DaemonConfig) -> Self {
        Self {
            store,
            client,
            node: config.node.clone(),
            policy: config.provisioning.revocation_policy,
            deadline: config.provisioning.apply_timeout(),
        }
    }

    /// Revoke `peer_id` on behalf of `user_id`
    pub async fn revoke(&self, user_id: &str, peer_id: Uuid) -> Result<Revoked> {
        let peer = self
            .store
            .find_peer_owned_by_user(peer_id, user_id)?
            .ok_or_else(|| Error::not_found("peer", peer_id))?;

        if !peer.is_active() {
            debug!("Peer {} already revoked", peer.id);
            return Ok(Revoked {
                revoked: true,
                peer_id: peer.id,
                node_confirmed: true,
                already_revoked: true,
            });
        }

        // Refresh connection parameters before touching the node
        self.store.upsert_node(&self.node.id, &self.node.attrs()?)?;
        let node = self
            .store
            .get_node(&peer.node_id)?
            .ok_or_else(|| Error::not_found("node", &peer.node_id))?;
        let key = WireGuardKey::parse(&peer.public_key)?;

        let removed = with_deadline(
            self.deadline,
            &node.id,
            NodeOp::Remove,
            self.client.remove_peer(&key, &node),
        )
        .await;

        let node_confirmed = match removed {
            Ok(()) => true,
            Err(Error::NodeApply(cause)) => match self.policy {
                RevocationPolicy::Strict => {
                    warn!("Peer {} stays active, node removal failed: {}", peer.id, cause);
                    return Err(Error::RevokeFailed {
                        peer_id: peer.id,
                        cause,
                    });
                }
                RevocationPolicy::BestEffort => {
                    warn!(
                        "Revoking peer {} although node removal failed: {}",
                        peer.id, cause
                    );
                    false
                }
            },
            Err(e) => return Err(e),
        };

        self.store.mark_revoked(peer.id)?;
        info!("Revoked peer {} of user {}", peer.id, user_id);

        Ok(Revoked {
            revoked: true,
            peer_id: peer.id,
            node_confirmed,
            already_revoked: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{key, Failure, Harness};
    use peergate_common::RemoteState;

    #[tokio::test]
    async fn test_revoke_then_revoke_again() {
        let h = Harness::new();
        let out = h.provisioner().provision("U1", &key(1)).await.unwrap();
        let svc = h.revoker();

        let first = svc.revoke("U1", out.peer.id).await.unwrap();
        assert!(first.revoked);
        assert!(first.node_confirmed);
        assert!(!first.already_revoked);
        assert!(h.fake.peers().is_empty());
        assert!(!h.store.get_peer(out.peer.id).unwrap().unwrap().is_active());

        let mutations = h.fake.mutations();
        let commands = h.fake.commands().len();
        let second = svc.revoke("U1", out.peer.id).await.unwrap();
        assert!(second.revoked);
        assert!(second.already_revoked);
        assert_eq!(h.fake.mutations(), mutations);
        assert_eq!(h.fake.commands().len(), commands);
    }

    #[tokio::test]
    async fn test_revoke_other_users_peer_is_not_found() {
        let h = Harness::new();
        let out = h.provisioner().provision("U2", &key(2)).await.unwrap();

        let err = h.revoker().revoke("U1", out.peer.id).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert!(h.store.get_peer(out.peer.id).unwrap().unwrap().is_active());
        assert!(h.fake.peers().contains_key(&key(2)));

        let err = h.revoker().revoke("U1", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_strict_failure_keeps_peer_active() {
        let h = Harness::new();
        let out = h.provisioner().provision("U1", &key(1)).await.unwrap();

        h.fake.fail_mutations(Failure::Exit(1));
        let err = h.revoker().revoke("U1", out.peer.id).await.unwrap_err();

        match &err {
            Error::RevokeFailed { peer_id, cause } => {
                assert_eq!(*peer_id, out.peer.id);
                assert_eq!(cause.state, RemoteState::Unchanged);
                assert_eq!(cause.op, NodeOp::Remove);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(h.store.get_peer(out.peer.id).unwrap().unwrap().is_active());

        // Retrying once the node is reachable completes the revocation
        h.fake.heal();
        assert!(h.revoker().revoke("U1", out.peer.id).await.unwrap().node_confirmed);
        assert!(h.fake.peers().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_node_blocks_strict_revoke() {
        let h = Harness::new();
        let out = h.provisioner().provision("U1", &key(1)).await.unwrap();

        h.fake.fail_all(Failure::Transport);
        let err = h.revoker().revoke("U1", out.peer.id).await.unwrap_err();

        assert_eq!(err.node_cause().unwrap().state, RemoteState::Unknown);
        assert!(h.store.get_peer(out.peer.id).unwrap().unwrap().is_active());
    }

    #[tokio::test]
    async fn test_best_effort_marks_revoked() {
        let mut h = Harness::new();
        h.config.provisioning.revocation_policy = RevocationPolicy::BestEffort;
        let out = h.provisioner().provision("U1", &key(1)).await.unwrap();

        h.fake.fail_all(Failure::Transport);
        let result = h.revoker().revoke("U1", out.peer.id).await.unwrap();

        assert!(result.revoked);
        assert!(!result.node_confirmed);
        assert!(!h.store.get_peer(out.peer.id).unwrap().unwrap().is_active());
        // Still configured on the node until the reconciler removes it
        assert!(h.fake.peers().contains_key(&key(1)));
    }

    #[tokio::test]
    async fn test_peer_absent_on_node_still_revokes() {
        let h = Harness::new();
        let out = h.provisioner().provision("U1", &key(1)).await.unwrap();
        h.fake.clear_peers();

        let mutations = h.fake.mutations();
        let result = h.revoker().revoke("U1", out.peer.id).await.unwrap();

        assert!(result.node_confirmed);
        assert_eq!(h.fake.mutations(), mutations);
        assert!(!h.store.get_peer(out.peer.id).unwrap().unwrap().is_active());
    }
}
