//! Error types for Peergate

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias using Peergate Error
pub type Result<T> = std::result::Result<T, Error>;

/// Which uniqueness rule a conflicting write ran into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// The device already has an active peer on the node
    ActiveDevicePeer,
    /// The address is held by another active peer on the node
    AllowedIp,
    /// The public key is held by another active peer on the node
    PublicKey,
    /// The device already has an active peer with a different key
    KeyMismatch,
    /// Any other unique constraint
    Other,
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ActiveDevicePeer => write!(f, "active_device_peer"),
            Self::AllowedIp => write!(f, "allowed_ip"),
            Self::PublicKey => write!(f, "public_key"),
            Self::KeyMismatch => write!(f, "key_mismatch"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// What is known about the node after a failed remote operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteState {
    /// The transport failed; the command may or may not have run
    Unknown,
    /// The command ran and reported failure; the node did not change
    Unchanged,
}

impl std::fmt::Display for RemoteState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "state unknown"),
            Self::Unchanged => write!(f, "state unchanged"),
        }
    }
}

/// Remote peer operation that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeOp {
    Query,
    Add,
    Remove,
    List,
}

impl std::fmt::Display for NodeOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Query => write!(f, "query"),
            Self::Add => write!(f, "add"),
            Self::Remove => write!(f, "remove"),
            Self::List => write!(f, "list"),
        }
    }
}

/// A remote apply/remove/query against a node failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("node {node_id} {op} failed ({state}): {reason}")]
pub struct NodeApplyError {
    pub node_id: String,
    pub op: NodeOp,
    pub state: RemoteState,
    pub reason: String,
    pub exit_code: Option<i32>,
}

impl NodeApplyError {
    /// Transport failure: effect on the node is indeterminate
    pub fn unknown(node_id: impl Into<String>, op: NodeOp, reason: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            op,
            state: RemoteState::Unknown,
            reason: reason.into(),
            exit_code: None,
        }
    }

    /// Command ran and exited non-zero
    pub fn unchanged(
        node_id: impl Into<String>,
        op: NodeOp,
        exit_code: i32,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            op,
            state: RemoteState::Unchanged,
            reason: reason.into(),
            exit_code: Some(exit_code),
        }
    }
}

/// Stable, machine-readable error kind for callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    PoolExhausted,
    NodeApply,
    ProvisionFailed,
    RevokeFailed,
    Database,
    Config,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::PoolExhausted => "pool_exhausted",
            Self::NodeApply => "node_apply",
            Self::ProvisionFailed => "provision_failed",
            Self::RevokeFailed => "revoke_failed",
            Self::Database => "database",
            Self::Config => "config",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Peergate error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Conflict ({kind}): {detail}")]
    Conflict { kind: ConflictKind, detail: String },

    #[error("Address pool exhausted on node {node_id}")]
    PoolExhausted { node_id: String },

    #[error(transparent)]
    NodeApply(#[from] NodeApplyError),

    #[error("Provisioning failed for peer {peer_id:?}: {cause}")]
    ProvisionFailed {
        peer_id: Option<Uuid>,
        #[source]
        cause: NodeApplyError,
    },

    #[error("Revocation failed for peer {peer_id}: {cause}")]
    RevokeFailed {
        peer_id: Uuid,
        #[source]
        cause: NodeApplyError,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn not_found(kind: impl Into<String>, id: impl std::fmt::Display) -> Self {
        Error::NotFound {
            kind: kind.into(),
            id: id.to_string(),
        }
    }

    pub fn conflict(kind: ConflictKind, detail: impl Into<String>) -> Self {
        Error::Conflict {
            kind,
            detail: detail.into(),
        }
    }

    /// Machine-readable kind for mapping to transport status codes
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Conflict { .. } => ErrorKind::Conflict,
            Error::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Error::NodeApply(_) => ErrorKind::NodeApply,
            Error::ProvisionFailed { .. } => ErrorKind::ProvisionFailed,
            Error::RevokeFailed { .. } => ErrorKind::RevokeFailed,
            Error::Database(_) => ErrorKind::Database,
            Error::InvalidConfig(_) => ErrorKind::Config,
            Error::Serialization(_) | Error::Io(_) | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The remote failure carried by this error, if any
    pub fn node_cause(&self) -> Option<&NodeApplyError> {
        match self {
            Error::NodeApply(cause)
            | Error::ProvisionFailed { cause, .. }
            | Error::RevokeFailed { cause, .. } => Some(cause),
            _ => None,
        }
    }

    /// Whether a caller may simply retry the same request
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::NodeApply | ErrorKind::ProvisionFailed | ErrorKind::RevokeFailed
        )
    }
}
