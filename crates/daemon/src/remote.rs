//! Remote command execution
//!
//! The engine only ever needs one primitive from a node: run a shell command,
//! get stdout/stderr/exit code back. `RemoteExecutor` is that seam; the
//! production implementation shells out to the system `ssh` client.

use crate::config::SshConfig;
use async_trait::async_trait;
use peergate_common::Node;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Where a command runs
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteTarget {
    pub host: String,
    pub user: String,
}

impl From<&Node> for RemoteTarget {
    fn from(node: &Node) -> Self {
        Self {
            host: node.ssh_host.clone(),
            user: node.ssh_user.clone(),
        }
    }
}

impl std::fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.user, self.host)
    }
}

/// Result of a command that actually ran on the node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// The command could not be run, or it is unknown whether it ran
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to start remote session: {0}")]
    Spawn(String),

    #[error("connection to {target} failed: {message}")]
    Connection { target: String, message: String },

    #[error("remote command timed out after {seconds}s")]
    Timeout { seconds: u64 },
}

/// Runs a single command against a node
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn exec(
        &self,
        target: &RemoteTarget,
        command: &str,
    ) -> Result<CommandOutput, TransportError>;
}

// ============================================================================
// SSH implementation
// ============================================================================

/// OpenSSH exits with 255 when the connection or authentication failed
const SSH_TRANSPORT_EXIT: i32 = 255;

/// Executes commands through the system `ssh` binary
pub struct SshExecutor {
    config: SshConfig,
    sessions: Arc<Semaphore>,
}

impl SshExecutor {
    pub fn new(config: SshConfig) -> Self {
        let sessions = Arc::new(Semaphore::new(config.max_sessions.max(1)));
        Self { config, sessions }
    }

    fn timeout(&self) -> Duration {
        self.config.command_timeout()
    }

    /// Build the `ssh` argument vector for a command
    pub fn build_args(&self, target: &RemoteTarget, command: &str) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            self.config.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.command_timeout_secs),
        ];

        if let Some(identity) = &self.config.identity_file {
            args.extend(["-i".to_string(), identity.display().to_string()]);
        }

        args.extend(self.config.options.iter().cloned());
        args.push(target.to_string());
        args.push(command.to_string());
        args
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn exec(
        &self,
        target: &RemoteTarget,
        command: &str,
    ) -> Result<CommandOutput, TransportError> {
        let _permit = self
            .sessions
            .acquire()
            .await
            .map_err(|e| TransportError::Spawn(e.to_string()))?;

        debug!("ssh {}: {}", target, command);

        let child = Command::new(&self.config.binary)
            .args(self.build_args(target, command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Spawn(e.to_string()))?;

        let output = match tokio::time::timeout(self.timeout(), child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| TransportError::Spawn(e.to_string()))?,
            Err(_) => {
                warn!("ssh {} timed out", target);
                return Err(TransportError::Timeout {
                    seconds: self.config.command_timeout_secs,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        match output.status.code() {
            Some(SSH_TRANSPORT_EXIT) | None => Err(TransportError::Connection {
                target: target.to_string(),
                message: if stderr.is_empty() {
                    format!("ssh exited with {}", output.status)
                } else {
                    stderr
                },
            }),
            Some(exit_code) => Ok(CommandOutput {
                stdout,
                stderr,
                exit_code,
            }),
        }
    }
}
