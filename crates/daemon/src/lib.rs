//! Peergate daemon library
//!
//! Provisioning and revocation of WireGuard peers on a remote node, kept in
//! step with the SQLite store. The `peergated` binary runs the reconciliation
//! loop; the CLI drives the services in-process.

pub mod allocator;
pub mod config;
pub mod provision;
pub mod reconciler;
pub mod remote;
pub mod revoke;
pub mod template;
pub mod wg;

#[cfg(test)]
pub(crate) mod testing;

pub use allocator::IpAllocator;
pub use config::DaemonConfig;
pub use provision::{Provisioned, ProvisioningService};
pub use reconciler::{Plan, PlanAction, Reconciler};
pub use remote::{CommandOutput, RemoteExecutor, RemoteTarget, SshExecutor, TransportError};
pub use revoke::{RevocationPolicy, RevocationService, Revoked};
pub use wg::{WgNodeClient, WgPeerEntry};
