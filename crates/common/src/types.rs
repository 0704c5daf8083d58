//! Core types for Peergate

use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use uuid::Uuid;

// ============================================================================
// Entities
// ============================================================================

/// A user's device; one per (user_id, platform)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: Uuid,
    pub user_id: String,
    pub platform: String,
    pub name: String,
    pub created_at: i64,
}

/// A WireGuard endpoint managed over remote command execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub ssh_host: String,
    pub ssh_user: String,
    pub wg_interface: String,
    pub server_public_key: String,
    pub endpoint_host: String,
    pub wg_port: u16,
    pub pool: IpPool,
    pub updated_at: i64,
}

impl Node {
    /// `host:port` clients connect to
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.endpoint_host, self.wg_port)
    }
}

/// Connection parameters written by a node upsert
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAttrs {
    pub name: String,
    pub ssh_host: String,
    pub ssh_user: String,
    pub wg_interface: String,
    pub server_public_key: String,
    pub endpoint_host: String,
    pub wg_port: u16,
    pub pool: IpPool,
}

/// A device's membership in a node's peer set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: Uuid,
    pub node_id: String,
    pub device_id: Uuid,
    pub user_id: String,
    pub public_key: String,
    pub allowed_ip: Ipv4Addr,
    pub created_at: i64,
    /// Set by the first node apply that succeeded
    pub confirmed_at: Option<i64>,
    pub revoked_at: Option<i64>,
}

impl Peer {
    pub fn is_active(&self) -> bool {
        self.revoked_at.is_none()
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed_at.is_some()
    }
}

/// Attributes for a new active peer row
#[derive(Debug, Clone)]
pub struct NewPeer {
    pub node_id: String,
    pub device_id: Uuid,
    pub user_id: String,
    pub public_key: WireGuardKey,
    pub allowed_ip: Ipv4Addr,
}

// ============================================================================
// Validated values
// ============================================================================

/// A base64 Curve25519 public key as WireGuard prints it (44 chars, '=' padded)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WireGuardKey(String);

impl WireGuardKey {
    pub fn parse(raw: &str) -> Result<Self> {
        let key = raw.trim();
        if key.len() != 44 || !key.ends_with('=') {
            return Err(Error::validation(
                "invalid WireGuard public key (expected 44 base64 chars ending with '=')",
            ));
        }
        if !key.as_bytes()[..43]
            .iter()
            .all(|&b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/')
        {
            return Err(Error::validation(
                "invalid WireGuard public key (non-base64 character)",
            ));
        }
        match STANDARD.decode(key) {
            Ok(bytes) if bytes.len() == 32 => Ok(Self(key.to_string())),
            _ => Err(Error::validation(
                "invalid WireGuard public key (does not decode to 32 bytes)",
            )),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for WireGuardKey {
    type Error = Error;
    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<WireGuardKey> for String {
    fn from(key: WireGuardKey) -> Self {
        key.0
    }
}

impl std::fmt::Display for WireGuardKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for WireGuardKey {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Interface names end up inside remote shell commands; only allow what Linux does
pub fn validate_interface_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 15
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.');
    if ok {
        Ok(())
    } else {
        Err(Error::validation(format!("invalid interface name: {:?}", name)))
    }
}

/// Single-host route for a peer address
pub fn host_route(addr: Ipv4Addr) -> Ipv4Network {
    Ipv4Network::from(addr)
}

// ============================================================================
// Address pool
// ============================================================================

/// Inclusive range of assignable peer addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpPool {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl IpPool {
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self> {
        if u32::from(start) > u32::from(end) {
            return Err(Error::InvalidConfig(format!(
                "pool start {} is after pool end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Every host of a network except the network address, the first host
    /// (server side of the tunnel) and the broadcast address
    pub fn from_network(network: Ipv4Network) -> Result<Self> {
        if network.prefix() > 29 {
            return Err(Error::InvalidConfig(format!(
                "network {} is too small for a peer pool",
                network
            )));
        }
        let first = u32::from(network.network()) + 2;
        let last = u32::from(network.broadcast()) - 1;
        Self::new(Ipv4Addr::from(first), Ipv4Addr::from(last))
    }

    pub fn size(&self) -> u64 {
        u64::from(u32::from(self.end) - u32::from(self.start)) + 1
    }

    /// Addresses in ascending order
    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> {
        (u32::from(self.start)..=u32::from(self.end)).map(Ipv4Addr::from)
    }
}

impl std::fmt::Display for IpPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}
