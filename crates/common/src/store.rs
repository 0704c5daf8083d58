//! Device, node and peer persistence
//!
//! All writes go through SQLite constraints, so a conflicting create is
//! rejected by the database rather than by a read-then-write check:
//! - `devices(user_id, platform)` unique
//! - active `peers(device_id, node_id)` unique
//! - active `peers(node_id, allowed_ip)` unique
//! - active `peers(node_id, public_key)` unique

use crate::db::{now_epoch_secs, Database};
use crate::error::ConflictKind;
use crate::types::{Device, IpPool, NewPeer, Node, NodeAttrs, Peer};
use crate::{Error, Result};
use rusqlite::{params, OptionalExtension, Row};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use tracing::{debug, info};
use uuid::Uuid;

const PEER_COLUMNS: &str = "id, node_id, device_id, user_id, public_key, allowed_ip, created_at, \
     confirmed_at, revoked_at";

const NODE_COLUMNS: &str = "id, name, ssh_host, ssh_user, wg_interface, server_public_key, \
     endpoint_host, wg_port, pool_start, pool_end, updated_at";

/// Store for the three persisted entities
#[derive(Clone)]
pub struct PeerStore {
    db: Database,
}

impl PeerStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    // ========================================================================
    // Devices
    // ========================================================================

    /// Return the canonical device for (user, platform), creating it on first use.
    ///
    /// Concurrent first calls converge on one row: the insert is ignored when
    /// the unique index already holds a device, and the read that follows
    /// returns whichever row won.
    pub fn find_or_create_device(&self, user_id: &str, platform: &str) -> Result<Device> {
        let conn = self.db.connection();
        let conn = conn.lock();

        let inserted = conn.execute(
            "INSERT INTO devices (id, user_id, platform, name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id, platform) DO NOTHING",
            params![
                Uuid::new_v4().to_string(),
                user_id,
                platform,
                default_device_name(platform),
                now_epoch_secs(),
            ],
        )?;
        if inserted > 0 {
            info!("Created {} device for user {}", platform, user_id);
        }

        conn.query_row(
            "SELECT id, user_id, platform, name, created_at FROM devices
             WHERE user_id = ?1 AND platform = ?2",
            params![user_id, platform],
            device_from_row,
        )
        .map_err(Error::from)
    }

    // ========================================================================
    // Nodes
    // ========================================================================

    /// Create the node or overwrite its connection parameters
    pub fn upsert_node(&self, node_id: &str, attrs: &NodeAttrs) -> Result<Node> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let now = now_epoch_secs();

        conn.execute(
            "INSERT INTO nodes (id, name, ssh_host, ssh_user, wg_interface, server_public_key,
                                endpoint_host, wg_port, pool_start, pool_end, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                ssh_host = excluded.ssh_host,
                ssh_user = excluded.ssh_user,
                wg_interface = excluded.wg_interface,
                server_public_key = excluded.server_public_key,
                endpoint_host = excluded.endpoint_host,
                wg_port = excluded.wg_port,
                pool_start = excluded.pool_start,
                pool_end = excluded.pool_end,
                updated_at = excluded.updated_at",
            params![
                node_id,
                attrs.name,
                attrs.ssh_host,
                attrs.ssh_user,
                attrs.wg_interface,
                attrs.server_public_key,
                attrs.endpoint_host,
                attrs.wg_port,
                attrs.pool.start.to_string(),
                attrs.pool.end.to_string(),
                now,
            ],
        )?;
        debug!("Upserted node {}", node_id);

        conn.query_row(
            &format!("SELECT {} FROM nodes WHERE id = ?1", NODE_COLUMNS),
            params![node_id],
            node_from_row,
        )
        .map_err(Error::from)
    }

    pub fn get_node(&self, node_id: &str) -> Result<Option<Node>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM nodes WHERE id = ?1", NODE_COLUMNS),
            params![node_id],
            node_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    // ========================================================================
    // Peers
    // ========================================================================

    /// Insert a new active peer
    pub fn create_peer(&self, new: &NewPeer) -> Result<Peer> {
        let conn = self.db.connection();
        let conn = conn.lock();

        let peer = Peer {
            id: Uuid::new_v4(),
            node_id: new.node_id.clone(),
            device_id: new.device_id,
            user_id: new.user_id.clone(),
            public_key: new.public_key.as_str().to_string(),
            allowed_ip: new.allowed_ip,
            created_at: now_epoch_secs(),
            confirmed_at: None,
            revoked_at: None,
        };

        conn.execute(
            &format!(
                "INSERT INTO peers ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, NULL)",
                PEER_COLUMNS
            ),
            params![
                peer.id.to_string(),
                peer.node_id,
                peer.device_id.to_string(),
                peer.user_id,
                peer.public_key,
                peer.allowed_ip.to_string(),
                peer.created_at,
            ],
        )
        .map_err(classify_peer_conflict)?;

        debug!(
            "Created peer {} for device {} on node {} at {}",
            peer.id, peer.device_id, peer.node_id, peer.allowed_ip
        );
        Ok(peer)
    }

    pub fn get_peer(&self, id: Uuid) -> Result<Option<Peer>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM peers WHERE id = ?1", PEER_COLUMNS),
            params![id.to_string()],
            peer_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn find_active_peer(&self, device_id: Uuid, node_id: &str) -> Result<Option<Peer>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM peers
                 WHERE device_id = ?1 AND node_id = ?2 AND revoked_at IS NULL",
                PEER_COLUMNS
            ),
            params![device_id.to_string(), node_id],
            peer_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Look a peer up by id, but only if it belongs to `user_id`
    pub fn find_peer_owned_by_user(&self, peer_id: Uuid, user_id: &str) -> Result<Option<Peer>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM peers WHERE id = ?1 AND user_id = ?2",
                PEER_COLUMNS
            ),
            params![peer_id.to_string(), user_id],
            peer_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Set `revoked_at` if it is not set yet and return the stored row.
    ///
    /// An already revoked peer keeps its original timestamp.
    pub fn mark_revoked(&self, peer_id: Uuid) -> Result<Peer> {
        let conn = self.db.connection();
        let conn = conn.lock();

        let changed = conn.execute(
            "UPDATE peers SET revoked_at = ?1 WHERE id = ?2 AND revoked_at IS NULL",
            params![now_epoch_secs(), peer_id.to_string()],
        )?;
        if changed > 0 {
            info!("Marked peer {} revoked", peer_id);
        }

        conn.query_row(
            &format!("SELECT {} FROM peers WHERE id = ?1", PEER_COLUMNS),
            params![peer_id.to_string()],
            peer_from_row,
        )
        .optional()?
        .ok_or_else(|| Error::not_found("peer", peer_id))
    }

    /// Record that the node accepted an active peer.
    ///
    /// Returns false when the row was revoked in the meantime; the first
    /// confirmation timestamp is kept.
    pub fn confirm_peer(&self, peer_id: Uuid) -> Result<bool> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let changed = conn.execute(
            "UPDATE peers SET confirmed_at = COALESCE(confirmed_at, ?1)
             WHERE id = ?2 AND revoked_at IS NULL",
            params![now_epoch_secs(), peer_id.to_string()],
        )?;
        Ok(changed > 0)
    }

    /// Revoke a peer only if no node apply of it was ever confirmed.
    ///
    /// Rollback path of a failed provision: a concurrent call for the same
    /// device may have applied and confirmed the row first, and then the row
    /// must stay active.
    pub fn revoke_unconfirmed(&self, peer_id: Uuid) -> Result<bool> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let changed = conn.execute(
            "UPDATE peers SET revoked_at = ?1
             WHERE id = ?2 AND revoked_at IS NULL AND confirmed_at IS NULL",
            params![now_epoch_secs(), peer_id.to_string()],
        )?;
        if changed > 0 {
            info!("Rolled back unconfirmed peer {}", peer_id);
        }
        Ok(changed > 0)
    }

    /// The active peer holding `public_key` on a node
    pub fn find_active_peer_by_key(&self, node_id: &str, public_key: &str) -> Result<Option<Peer>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM peers
                 WHERE node_id = ?1 AND public_key = ?2 AND revoked_at IS NULL",
                PEER_COLUMNS
            ),
            params![node_id, public_key],
            peer_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Keys of a node whose peers were revoked and that no active peer holds
    pub fn revoked_keys(&self, node_id: &str) -> Result<HashSet<String>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT public_key FROM peers r
             WHERE r.node_id = ?1 AND r.revoked_at IS NOT NULL
               AND NOT EXISTS (
                 SELECT 1 FROM peers a
                 WHERE a.node_id = r.node_id AND a.public_key = r.public_key
                   AND a.revoked_at IS NULL
               )",
        )?;

        let rows = stmt.query_map(params![node_id], |row| row.get::<_, String>(0))?;
        let mut keys = HashSet::new();
        for row in rows {
            keys.insert(row?);
        }
        Ok(keys)
    }

    /// Active peers of a node, ordered by address
    pub fn list_active_peers(&self, node_id: &str) -> Result<Vec<Peer>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM peers WHERE node_id = ?1 AND revoked_at IS NULL",
            PEER_COLUMNS
        ))?;

        let rows = stmt.query_map(params![node_id], peer_from_row)?;
        let mut peers = Vec::new();
        for row in rows {
            peers.push(row?);
        }
        peers.sort_by_key(|p| u32::from(p.allowed_ip));
        Ok(peers)
    }

    /// Addresses held by active peers of a node
    pub fn active_addresses(&self, node_id: &str) -> Result<HashSet<Ipv4Addr>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt =
            conn.prepare("SELECT allowed_ip FROM peers WHERE node_id = ?1 AND revoked_at IS NULL")?;

        let rows = stmt.query_map(params![node_id], |row| row.get::<_, String>(0))?;
        let mut used = HashSet::new();
        for row in rows {
            let raw = row?;
            let addr = raw
                .parse()
                .map_err(|_| Error::Internal(format!("corrupt allowed_ip {:?}", raw)))?;
            used.insert(addr);
        }
        Ok(used)
    }

    /// Every peer a user ever had, newest first
    pub fn list_peers_for_user(&self, user_id: &str) -> Result<Vec<Peer>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM peers WHERE user_id = ?1 ORDER BY created_at DESC, rowid DESC",
            PEER_COLUMNS
        ))?;

        let rows = stmt.query_map(params![user_id], peer_from_row)?;
        let mut peers = Vec::new();
        for row in rows {
            peers.push(row?);
        }
        Ok(peers)
    }
}

fn default_device_name(platform: &str) -> String {
    match platform {
        "ios" => "iphone".to_string(),
        "android" => "android".to_string(),
        other => other.to_string(),
    }
}

/// Map a unique-index violation on `peers` to the rule it broke
fn classify_peer_conflict(err: rusqlite::Error) -> Error {
    if err.sqlite_error_code() != Some(rusqlite::ErrorCode::ConstraintViolation) {
        return Error::Database(err);
    }

    // SQLite names the offending columns: "UNIQUE constraint failed: peers.node_id, peers.allowed_ip"
    let message = err.to_string();
    let kind = if message.contains("peers.allowed_ip") {
        ConflictKind::AllowedIp
    } else if message.contains("peers.public_key") {
        ConflictKind::PublicKey
    } else if message.contains("peers.device_id") {
        ConflictKind::ActiveDevicePeer
    } else {
        ConflictKind::Other
    };
    Error::conflict(kind, message)
}

fn parse_uuid(raw: String, idx: usize) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_addr(raw: String, idx: usize) -> rusqlite::Result<Ipv4Addr> {
    raw.parse().map_err(|e: std::net::AddrParseError| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<Device> {
    Ok(Device {
        id: parse_uuid(row.get(0)?, 0)?,
        user_id: row.get(1)?,
        platform: row.get(2)?,
        name: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<Node> {
    Ok(Node {
        id: row.get(0)?,
        name: row.get(1)?,
        ssh_host: row.get(2)?,
        ssh_user: row.get(3)?,
        wg_interface: row.get(4)?,
        server_public_key: row.get(5)?,
        endpoint_host: row.get(6)?,
        wg_port: row.get(7)?,
        pool: IpPool {
            start: parse_addr(row.get(8)?, 8)?,
            end: parse_addr(row.get(9)?, 9)?,
        },
        updated_at: row.get(10)?,
    })
}

fn peer_from_row(row: &Row<'_>) -> rusqlite::Result<Peer> {
    Ok(Peer {
        id: parse_uuid(row.get(0)?, 0)?,
        node_id: row.get(1)?,
        device_id: parse_uuid(row.get(2)?, 2)?,
        user_id: row.get(3)?,
        public_key: row.get(4)?,
        allowed_ip: parse_addr(row.get(5)?, 5)?,
        created_at: row.get(6)?,
        confirmed_at: row.get(7)?,
        revoked_at: row.get(8)?,
    })
}
