//! Fleet configuration loaded from YAML.
//!
//! Scan options live on the command line (see [`crate::cli`]); everything
//! about the cloud side of a run lives in a YAML file so it can be reused
//! between runs:
//!
//! ```yaml
//! project: my-project
//! zone: europe-west2-a
//! source_image: projects/debian-cloud/global/images/family/debian-12
//! machine_type: e2-small
//! launch: ssh
//! readiness: marker
//! ssh:
//!   user: scraper
//!   private_key_path: /home/me/.ssh/top_comment
//!   public_key_path: /home/me/.ssh/top_comment.pub
//! setup_script: |
//!   apt-get update && apt-get install -y chromium-driver
//! ```

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tracing::{info, instrument};

/// How the worker process is started on each instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LaunchMode {
    /// The startup script runs the worker itself.
    #[default]
    SelfStart,
    /// The startup script only installs; the dispatcher runs the worker over SSH.
    Ssh,
}

/// Signal that an instance is ready for the worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Readiness {
    /// The setup marker shows up on the serial console.
    #[default]
    Marker,
    /// The instance reports `RUNNING`.
    Running,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    pub user: String,
    pub private_key_path: PathBuf,
    /// Public key installed through the `ssh-keys` instance metadata.
    pub public_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    pub project: String,
    pub zone: String,
    pub source_image: String,
    #[serde(default = "default_machine_type")]
    pub machine_type: String,
    #[serde(default = "default_network")]
    pub network: String,
    /// Create the network and an SSH firewall rule if they are missing.
    #[serde(default)]
    pub ensure_network: bool,
    #[serde(default = "default_base_name")]
    pub base_name: String,
    #[serde(default)]
    pub ssh: Option<SshConfig>,
    /// Shell run on boot before the worker, e.g. package installation.
    #[serde(default)]
    pub setup_script: String,
    #[serde(default = "default_worker_binary")]
    pub worker_binary: String,
    #[serde(default)]
    pub launch: LaunchMode,
    #[serde(default)]
    pub readiness: Readiness,
    #[serde(default = "default_setup_marker")]
    pub setup_marker: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    /// Upper bound on shards provisioned at once; defaults to all of them.
    #[serde(default)]
    pub max_parallel: Option<usize>,
}

fn default_machine_type() -> String {
    "e2-small".to_string()
}

fn default_network() -> String {
    "default".to_string()
}

fn default_base_name() -> String {
    "top-comment".to_string()
}

fn default_worker_binary() -> String {
    "/usr/local/bin/top_comment".to_string()
}

fn default_setup_marker() -> String {
    "TOP_COMMENT_SETUP_COMPLETE".to_string()
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_startup_timeout_secs() -> u64 {
    900
}

impl FleetConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

/// Read and parse a fleet configuration file.
#[instrument(level = "info")]
pub async fn load_config(path: &str) -> Result<FleetConfig, Box<dyn Error>> {
    let raw = fs::read_to_string(path).await?;
    let config: FleetConfig = serde_yaml::from_str(&raw)?;
    if config.launch == LaunchMode::Ssh && config.ssh.is_none() {
        return Err("launch mode `ssh` needs an `ssh` section".into());
    }
    info!(project = %config.project, zone = %config.zone, launch = ?config.launch, "Loaded fleet configuration");
    Ok(config)
}
