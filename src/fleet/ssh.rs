//! Remote command execution over SSH.
//!
//! [`OpenSshShell`] shells out to the system `ssh` client in batch mode, so
//! key handling and known-hosts behaviour are whatever the operator's OpenSSH
//! already does.

use crate::error::FleetError;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, instrument};

/// `ssh` exits with this status when the connection itself failed.
const SSH_CONNECTION_FAILURE: i32 = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub user: String,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

pub trait RemoteShell {
    /// Run `command` on `target`, capturing both output streams.
    async fn exec(&self, target: &SshTarget, command: &str) -> Result<CommandOutput, FleetError>;
}

#[derive(Debug, Clone)]
pub struct OpenSshShell {
    pub connect_timeout: Duration,
}

impl RemoteShell for OpenSshShell {
    #[instrument(level = "info", skip(self, command), fields(host = %target.host, user = %target.user))]
    async fn exec(&self, target: &SshTarget, command: &str) -> Result<CommandOutput, FleetError> {
        let output = Command::new("ssh")
            .arg("-i")
            .arg(&target.key_path)
            .args(["-o", "BatchMode=yes", "-o", "StrictHostKeyChecking=accept-new"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)))
            .arg(format!("{}@{}", target.user, target.host))
            .arg(command)
            .output()
            .await
            .map_err(|e| FleetError::Ssh {
                host: target.host.clone(),
                message: e.to_string(),
            })?;

        let status = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        debug!(status, stdout_bytes = stdout.len(), stderr_bytes = stderr.len(), "ssh finished");

        if status == SSH_CONNECTION_FAILURE {
            return Err(FleetError::Ssh {
                host: target.host.clone(),
                message: stderr.trim().to_string(),
            });
        }
        Ok(CommandOutput {
            status,
            stdout,
            stderr,
        })
    }
}
