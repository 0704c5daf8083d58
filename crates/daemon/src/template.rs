//! Client profile rendering

use peergate_common::{Node, Peer};

/// Placeholder the client replaces with its locally generated private key
pub const PRIVATE_KEY_PLACEHOLDER: &str = "<DEVICE_PRIVATE_KEY>";

/// Render the `wg-quick` profile for `peer` on `node`.
///
/// Pure: the output depends only on the arguments. The private key never
/// leaves the device, so the profile carries a placeholder for it.
pub fn render(peer: &Peer, node: &Node, client_dns: &str) -> String {
    format!(
        r#"[Interface]
PrivateKey = {private_key}
Address = {address}/32
DNS = {dns}

[Peer]
PublicKey = {server_key}
Endpoint = {endpoint}
AllowedIPs = 0.0.0.0/0, ::/0
PersistentKeepalive = 25
"#,
        private_key = PRIVATE_KEY_PLACEHOLDER,
        address = peer.allowed_ip,
        dns = client_dns,
        server_key = node.server_public_key,
        endpoint = node.endpoint(),
    )
}
