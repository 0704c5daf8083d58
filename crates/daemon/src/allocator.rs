//! Address allocation
//!
//! Allocation is optimistic: the lowest free address is read from the store
//! and the caller inserts the peer row. If another request took the same
//! address in between, the active-address unique index rejects the insert
//! and the caller asks again.

use peergate_common::{Error, Node, PeerStore, Result};
use std::net::Ipv4Addr;
use tracing::debug;

/// Picks free addresses from a node's pool
#[derive(Clone)]
pub struct IpAllocator {
    store: PeerStore,
}

impl IpAllocator {
    pub fn new(store: PeerStore) -> Self {
        Self { store }
    }

    /// Lowest pool address of `node_id` not held by an active peer
    pub fn allocate(&self, node_id: &str) -> Result<Ipv4Addr> {
        let node = self
            .store
            .get_node(node_id)?
            .ok_or_else(|| Error::not_found("node", node_id))?;
        self.allocate_on(&node)
    }

    pub fn allocate_on(&self, node: &Node) -> Result<Ipv4Addr> {
        let used = self.store.active_addresses(&node.id)?;

        let addr = node
            .pool
            .iter()
            .find(|addr| !used.contains(addr))
            .ok_or_else(|| Error::PoolExhausted {
                node_id: node.id.clone(),
            })?;

        debug!(
            "Allocated {} on node {} ({} of {} in use)",
            addr,
            node.id,
            used.len(),
            node.pool.size()
        );
        Ok(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{key, Harness};
    use peergate_common::{NewPeer, WireGuardKey};

    fn occupy(h: &Harness, node: &Node, user: &str, seed: u8, addr: Ipv4Addr) {
        let device = h.store.find_or_create_device(user, "ios").unwrap();
        h.store
            .create_peer(&NewPeer {
                node_id: node.id.clone(),
                device_id: device.id,
                user_id: user.to_string(),
                public_key: WireGuardKey::parse(&key(seed)).unwrap(),
                allowed_ip: addr,
            })
            .unwrap();
    }

    #[test]
    fn test_allocates_lowest_free() {
        let h = Harness::with_pool(2, 4);
        let node = h
            .store
            .upsert_node(&h.config.node.id, &h.config.node.attrs().unwrap())
            .unwrap();
        let allocator = IpAllocator::new(h.store.clone());

        assert_eq!(allocator.allocate(&node.id).unwrap(), Ipv4Addr::new(10, 8, 0, 2));

        // Holes are filled before higher addresses
        occupy(&h, &node, "u1", 1, Ipv4Addr::new(10, 8, 0, 3));
        assert_eq!(allocator.allocate(&node.id).unwrap(), Ipv4Addr::new(10, 8, 0, 2));

        occupy(&h, &node, "u2", 2, Ipv4Addr::new(10, 8, 0, 2));
        assert_eq!(allocator.allocate(&node.id).unwrap(), Ipv4Addr::new(10, 8, 0, 4));
    }

    #[test]
    fn test_exhaustion_and_release() {
        let h = Harness::with_pool(2, 3);
        let node = h
            .store
            .upsert_node(&h.config.node.id, &h.config.node.attrs().unwrap())
            .unwrap();
        let allocator = IpAllocator::new(h.store.clone());

        occupy(&h, &node, "u1", 1, Ipv4Addr::new(10, 8, 0, 2));
        occupy(&h, &node, "u2", 2, Ipv4Addr::new(10, 8, 0, 3));
        let err = allocator.allocate(&node.id).unwrap_err();
        assert!(matches!(err, Error::PoolExhausted { .. }));

        // Revoked peers give their address back
        let device = h.store.find_or_create_device("u1", "ios").unwrap();
        let peer = h.store.find_active_peer(device.id, &node.id).unwrap().unwrap();
        h.store.mark_revoked(peer.id).unwrap();
        assert_eq!(allocator.allocate(&node.id).unwrap(), Ipv4Addr::new(10, 8, 0, 2));
    }

    #[test]
    fn test_unknown_node() {
        let h = Harness::new();
        let allocator = IpAllocator::new(h.store.clone());
        assert!(matches!(
            allocator.allocate("nowhere").unwrap_err(),
            Error::NotFound { .. }
        ));
    }
}
