//! Fleet dispatch: one cloud instance per shard of the date range.
//!
//! Each shard runs through a strictly ordered lifecycle:
//!
//! 1. **Provision**: create the instance with the shard bounds and startup
//!    script in its metadata, and block until the insert operation is done
//! 2. **Await ready**: poll until the setup marker appears on the serial
//!    console (or the instance is `RUNNING`), bounded by the startup timeout
//! 3. **Execute** (SSH launch mode only): run the worker over SSH and
//!    capture its output
//!
//! Shards are driven concurrently, up to `max_parallel` at once. A failing
//! shard never cancels its siblings; its [`ShardError`] names the shard
//! bounds and the instance so that one shard can be retried by hand.
//! Instances are never deleted implicitly; see [`Dispatcher::teardown`].

pub mod compute;
pub mod ssh;

use crate::config::{FleetConfig, LaunchMode, Readiness};
use crate::error::{FleetError, ShardError};
use crate::models::{DateRange, Shard};
use crate::utils::{random_suffix, shell_quote};
use compute::{ComputeClient, InstanceInfo, InstanceSpec, InstanceStatus};
use futures::stream::{self, StreamExt};
use ssh::{RemoteShell, SshTarget};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::fs;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

/// What finished on a shard's instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardOutcome {
    /// Ready and running the worker on its own.
    Launched,
    /// Worker ran over SSH; output captured.
    Completed { stdout: String, stderr: String },
}

#[derive(Debug)]
pub struct ShardHandle {
    pub shard: Shard,
    pub instance: String,
    pub outcome: Result<ShardOutcome, ShardError>,
}

pub struct Dispatcher<'a, C, S> {
    compute: &'a C,
    shell: &'a S,
    config: &'a FleetConfig,
    /// Extra `scan` arguments forwarded to every worker.
    worker_args: Vec<String>,
    /// Public key line installed as `ssh-keys` metadata.
    ssh_public_key: Option<String>,
}

impl<'a, C: ComputeClient, S: RemoteShell> Dispatcher<'a, C, S> {
    pub fn new(compute: &'a C, shell: &'a S, config: &'a FleetConfig, worker_args: Vec<String>) -> Self {
        Self {
            compute,
            shell,
            config,
            worker_args,
            ssh_public_key: None,
        }
    }

    pub fn with_ssh_public_key(mut self, key: Option<String>) -> Self {
        self.ssh_public_key = key;
        self
    }

    /// Partition `range` into `workers` shards and bring up one instance each.
    ///
    /// # Returns
    ///
    /// One handle per shard in shard order, successful or not. Only a
    /// failure to ensure the shared network is returned as an error.
    #[instrument(level = "info", skip(self), fields(%range))]
    pub async fn dispatch(&self, range: DateRange, workers: usize) -> Result<Vec<ShardHandle>, FleetError> {
        if self.config.ensure_network {
            self.compute.ensure_network(&self.config.network).await?;
        }

        let shards = range.partition(workers);
        let parallel = self.config.max_parallel.unwrap_or(shards.len()).max(1);
        info!(shards = shards.len(), parallel, launch = ?self.config.launch, "Dispatching shards");

        let mut handles: Vec<ShardHandle> = stream::iter(shards)
            .map(|shard| self.run_shard(shard))
            .buffer_unordered(parallel)
            .collect()
            .await;
        handles.sort_by_key(|h| h.shard.index);

        let failed = handles.iter().filter(|h| h.outcome.is_err()).count();
        info!(total = handles.len(), failed, "Dispatch finished");
        Ok(handles)
    }

    async fn run_shard(&self, shard: Shard) -> ShardHandle {
        let instance = format!("{}-{}-{}", self.config.base_name, shard.index, random_suffix(6));
        let outcome = self
            .drive_shard(shard, &instance)
            .await
            .map_err(|source| ShardError {
                shard,
                instance: instance.clone(),
                source,
            });
        if let Err(e) = &outcome {
            error!(
                shard = shard.index,
                start = %shard.range.start(),
                end = %shard.range.end(),
                %instance,
                error = %e.source,
                "Shard failed; inspect the instance, then tear it down or retry this shard"
            );
        }
        ShardHandle {
            shard,
            instance,
            outcome,
        }
    }

    #[instrument(level = "info", skip(self), fields(shard = shard.index))]
    async fn drive_shard(&self, shard: Shard, instance: &str) -> Result<ShardOutcome, FleetError> {
        let spec = self.instance_spec(shard, instance);
        let operation = self.compute.create_instance(&spec).await?;
        self.compute.wait_operation(&operation).await?;
        info!("Instance provisioned");

        let info = self.await_ready(instance).await?;

        match self.config.launch {
            LaunchMode::SelfStart => Ok(ShardOutcome::Launched),
            LaunchMode::Ssh => self.execute(&info, shard).await,
        }
    }

    /// Metadata carries the shard bounds and a startup script that sets the
    /// instance up and, in self-start mode, runs the worker.
    pub fn instance_spec(&self, shard: Shard, instance: &str) -> InstanceSpec {
        let mut script = format!(
            "#!/bin/bash\nset -euo pipefail\n{}\necho \"{}\"\n",
            self.config.setup_script.trim_end(),
            self.config.setup_marker
        );
        if self.config.launch == LaunchMode::SelfStart {
            script.push_str(&self.worker_command(shard));
            script.push('\n');
        }

        let mut metadata = vec![
            ("startup-script".to_string(), script),
            ("start-date".to_string(), shard.range.start().to_string()),
            ("end-date".to_string(), shard.range.end().to_string()),
        ];
        if let (Some(ssh), Some(key)) = (&self.config.ssh, &self.ssh_public_key) {
            metadata.push(("ssh-keys".to_string(), format!("{}:{}", ssh.user, key.trim())));
        }

        InstanceSpec {
            name: instance.to_string(),
            machine_type: self.config.machine_type.clone(),
            source_image: self.config.source_image.clone(),
            network: self.config.network.clone(),
            metadata,
        }
    }

    /// The worker invocation for one shard.
    pub fn worker_command(&self, shard: Shard) -> String {
        let mut parts = vec![
            self.config.worker_binary.clone(),
            "scan".to_string(),
            "--start-date".to_string(),
            shard.range.start().to_string(),
            "--end-date".to_string(),
            shard.range.end().to_string(),
            "--shard-index".to_string(),
            shard.index.to_string(),
        ];
        parts.extend(self.worker_args.iter().cloned());
        if self.config.launch == LaunchMode::Ssh {
            parts.push("--emit-stdout".to_string());
        }
        parts.iter().map(|p| shell_quote(p)).collect::<Vec<_>>().join(" ")
    }

    #[instrument(level = "info", skip(self))]
    async fn await_ready(&self, instance: &str) -> Result<InstanceInfo, FleetError> {
        let t0 = Instant::now();
        let timeout = self.config.startup_timeout();
        loop {
            let info = self.compute.get_instance(instance).await?;
            if info.status == InstanceStatus::Terminated {
                return Err(FleetError::Operation {
                    operation: format!("boot {instance}"),
                    message: "instance terminated before becoming ready".to_string(),
                });
            }

            let ready = match self.config.readiness {
                Readiness::Running => info.status == InstanceStatus::Running,
                Readiness::Marker => match self.compute.serial_output(instance).await {
                    Ok(output) => output.contains(&self.config.setup_marker),
                    Err(e) => {
                        debug!(error = %e, "Serial output not available yet");
                        false
                    }
                },
            };
            if ready {
                info!(waited_secs = t0.elapsed().as_secs(), "Instance ready");
                return Ok(info);
            }

            let waited = t0.elapsed();
            if waited >= timeout {
                return Err(FleetError::ReadinessTimeout {
                    instance: instance.to_string(),
                    waited,
                });
            }
            debug!(status = ?info.status, waited_secs = waited.as_secs(), "Instance not ready yet");
            sleep(self.config.poll_interval()).await;
        }
    }

    /// Run the worker over SSH, addressing the instance by its external IP
    /// and the user named in its `ssh-keys` metadata.
    async fn execute(&self, info: &InstanceInfo, shard: Shard) -> Result<ShardOutcome, FleetError> {
        let host = info.external_ip.clone().ok_or_else(|| FleetError::NoAddress {
            instance: info.name.clone(),
        })?;
        let ssh = self.config.ssh.as_ref().ok_or_else(|| FleetError::Ssh {
            host: host.clone(),
            message: "no ssh credentials configured".to_string(),
        })?;
        let user = info
            .metadata
            .get("ssh-keys")
            .and_then(|keys| keys.split(':').next())
            .filter(|u| !u.is_empty())
            .unwrap_or(ssh.user.as_str())
            .to_string();

        let target = SshTarget {
            host,
            user,
            key_path: ssh.private_key_path.clone(),
        };
        let command = self.worker_command(shard);
        info!(host = %target.host, %command, "Executing worker over ssh");

        let output = self.shell.exec(&target, &command).await?;
        for line in output.stderr.lines() {
            debug!(remote = %line, "worker stderr");
        }
        if output.status != 0 {
            return Err(FleetError::RemoteCommand {
                status: output.status,
                stderr: output.stderr,
            });
        }
        Ok(ShardOutcome::Completed {
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    /// Delete instances by name. Each deletion is independent; failures are
    /// reported per instance.
    #[instrument(level = "info", skip(self))]
    pub async fn teardown(&self, instances: &[String]) -> Vec<(String, Result<(), FleetError>)> {
        let mut results = Vec::with_capacity(instances.len());
        for name in instances {
            let result = match self.compute.delete_instance(name).await {
                Ok(operation) => self.compute.wait_operation(&operation).await,
                Err(e) => Err(e),
            };
            match &result {
                Ok(()) => info!(instance = %name, "Instance deleted"),
                Err(e) => warn!(instance = %name, error = %e, "Instance deletion failed"),
            }
            results.push((name.clone(), result));
        }
        results
    }
}

/// Write the captured output table of every completed shard to `dir`.
///
/// # Returns
///
/// Paths of the written shard tables, in shard order.
#[instrument(level = "info", skip(handles))]
pub async fn collect_outputs(handles: &[ShardHandle], dir: &Path) -> Result<Vec<PathBuf>, FleetError> {
    fs::create_dir_all(dir).await?;
    let mut paths = Vec::new();
    for handle in handles {
        if let Ok(ShardOutcome::Completed { stdout, .. }) = &handle.outcome {
            let path = dir.join(format!(
                "shard_{}_{}_{}.csv",
                handle.shard.index,
                handle.shard.range.start(),
                handle.shard.range.end()
            ));
            fs::write(&path, stdout).await?;
            info!(path = %path.display(), "Collected shard output");
            paths.push(path);
        }
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::compute::Operation;
    use crate::fleet::ssh::CommandOutput;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeCompute {
        created: RefCell<Vec<InstanceSpec>>,
        deleted: RefCell<Vec<String>>,
        polls: RefCell<HashMap<String, usize>>,
        /// Polls before the marker shows; `usize::MAX` never becomes ready.
        ready_after: usize,
        status_polls: RefCell<HashMap<String, usize>>,
        /// Status polls reporting `STAGING` before `RUNNING`.
        running_after: usize,
        /// Shard index whose insert operation fails.
        failing_shard: Option<usize>,
    }

    impl ComputeClient for FakeCompute {
        async fn ensure_network(&self, _network: &str) -> Result<(), FleetError> {
            Ok(())
        }

        async fn create_instance(&self, spec: &InstanceSpec) -> Result<Operation, FleetError> {
            self.created.borrow_mut().push(spec.clone());
            let failing = self
                .failing_shard
                .is_some_and(|i| spec.name.starts_with(&format!("top-comment-{i}-")));
            Ok(Operation {
                name: format!("op-{}", spec.name),
                self_link: String::new(),
                status: "DONE".into(),
                error: failing.then(|| serde_json::json!({ "errors": ["QUOTA_EXCEEDED"] })),
            })
        }

        async fn wait_operation(&self, operation: &Operation) -> Result<(), FleetError> {
            match &operation.error {
                Some(e) => Err(FleetError::Operation {
                    operation: operation.name.clone(),
                    message: e.to_string(),
                }),
                None => Ok(()),
            }
        }

        async fn get_instance(&self, name: &str) -> Result<InstanceInfo, FleetError> {
            let spec = self
                .created
                .borrow()
                .iter()
                .find(|s| s.name == name)
                .cloned()
                .ok_or(FleetError::Api { status: 404, message: name.into() })?;
            let index: usize = name.split('-').nth(2).unwrap().parse().unwrap();
            let mut polls = self.status_polls.borrow_mut();
            let count = polls.entry(name.to_string()).or_default();
            *count += 1;
            let status = if *count > self.running_after {
                InstanceStatus::Running
            } else {
                InstanceStatus::Staging
            };
            Ok(InstanceInfo {
                name: name.to_string(),
                status,
                external_ip: Some(format!("10.0.0.{index}")),
                metadata: spec.metadata.into_iter().collect(),
            })
        }

        async fn serial_output(&self, name: &str) -> Result<String, FleetError> {
            let mut polls = self.polls.borrow_mut();
            let count = polls.entry(name.to_string()).or_default();
            *count += 1;
            if *count > self.ready_after {
                Ok("booting\nTOP_COMMENT_SETUP_COMPLETE\n".into())
            } else {
                Ok("booting\n".into())
            }
        }

        async fn delete_instance(&self, name: &str) -> Result<Operation, FleetError> {
            self.deleted.borrow_mut().push(name.to_string());
            Ok(Operation {
                name: format!("delete-{name}"),
                self_link: String::new(),
                status: "DONE".into(),
                error: None,
            })
        }
    }

    #[derive(Default)]
    struct FakeShell {
        commands: RefCell<Vec<(SshTarget, String)>>,
        unreachable_host: Option<String>,
    }

    impl RemoteShell for FakeShell {
        async fn exec(&self, target: &SshTarget, command: &str) -> Result<CommandOutput, FleetError> {
            self.commands
                .borrow_mut()
                .push((target.clone(), command.to_string()));
            if self.unreachable_host.as_deref() == Some(target.host.as_str()) {
                return Err(FleetError::Ssh {
                    host: target.host.clone(),
                    message: "Connection timed out".into(),
                });
            }
            Ok(CommandOutput {
                status: 0,
                stdout: format!("date,article_num,url,comment,upvotes\n# {}\n", target.host),
                stderr: String::new(),
            })
        }
    }

    fn config(launch: LaunchMode) -> FleetConfig {
        let mut config: FleetConfig = serde_yaml::from_str(
            "project: p\nzone: z\nsource_image: img\nsetup_script: apt-get install -y chromium-driver\n",
        )
        .unwrap();
        config.launch = launch;
        config.poll_interval_secs = 0;
        config.startup_timeout_secs = 0;
        if launch == LaunchMode::Ssh {
            config.ssh = Some(crate::config::SshConfig {
                user: "scraper".into(),
                private_key_path: "/keys/id".into(),
                public_key_path: None,
            });
        }
        config
    }

    fn range(start: &str, end: &str) -> DateRange {
        DateRange::new(start.parse().unwrap(), end.parse().unwrap()).unwrap()
    }

    #[test]
    fn test_worker_command_quotes_shell_metacharacters() {
        let compute = FakeCompute::default();
        let shell = FakeShell::default();
        let config = config(LaunchMode::SelfStart);
        let consent = "https://www.dailymail.co.uk/consent?a=1&b=two words";
        let dispatcher = Dispatcher::new(
            &compute,
            &shell,
            &config,
            vec![format!("--consent-url={consent}"), "--top-n".into(), "1".into()],
        );
        let shard = Shard {
            index: 0,
            range: range("2022-10-25", "2022-10-25"),
        };

        let command = dispatcher.worker_command(shard);
        assert!(command.ends_with(&format!("'--consent-url={consent}' --top-n 1")));
        assert!(command.contains("scan --start-date 2022-10-25"));
    }

    #[tokio::test]
    async fn test_dispatch_provisions_one_instance_per_shard() {
        let compute = FakeCompute::default();
        let shell = FakeShell::default();
        let config = config(LaunchMode::SelfStart);
        let dispatcher = Dispatcher::new(&compute, &shell, &config, vec!["--top-n".into(), "1".into()]);

        let handles = dispatcher
            .dispatch(range("2022-10-25", "2022-10-26"), 2)
            .await
            .unwrap();

        assert_eq!(handles.len(), 2);
        assert!(handles.iter().all(|h| matches!(h.outcome, Ok(ShardOutcome::Launched))));
        assert_ne!(handles[0].instance, handles[1].instance);
        assert!(handles[0].instance.starts_with("top-comment-0-"));

        let created = compute.created.borrow();
        let spec = created.iter().find(|s| s.name == handles[1].instance).unwrap();
        let meta: HashMap<_, _> = spec.metadata.iter().cloned().collect();
        assert_eq!(meta["start-date"], "2022-10-26");
        assert_eq!(meta["end-date"], "2022-10-26");
        let script = &meta["startup-script"];
        assert!(script.contains("apt-get install -y chromium-driver"));
        assert!(script.contains("TOP_COMMENT_SETUP_COMPLETE"));
        assert!(script.contains("scan --start-date 2022-10-26 --end-date 2022-10-26 --shard-index 1 --top-n 1"));

        assert!(shell.commands.borrow().is_empty());
        assert!(compute.deleted.borrow().is_empty(), "dispatch never tears down");
    }

    #[tokio::test]
    async fn test_running_readiness_waits_for_status_flip() {
        let compute = FakeCompute {
            running_after: 3,
            ready_after: usize::MAX,
            ..FakeCompute::default()
        };
        let shell = FakeShell::default();
        let mut config = config(LaunchMode::SelfStart);
        config.readiness = Readiness::Running;
        config.startup_timeout_secs = 60;
        let dispatcher = Dispatcher::new(&compute, &shell, &config, Vec::new());

        let handles = dispatcher
            .dispatch(range("2022-10-25", "2022-10-25"), 1)
            .await
            .unwrap();
        assert!(matches!(handles[0].outcome, Ok(ShardOutcome::Launched)));
        assert_eq!(compute.status_polls.borrow()[&handles[0].instance], 4);
        assert!(compute.polls.borrow().is_empty(), "serial console is not consulted");
    }

    #[tokio::test]
    async fn test_running_readiness_times_out_while_staging() {
        let compute = FakeCompute {
            running_after: usize::MAX,
            ..FakeCompute::default()
        };
        let shell = FakeShell::default();
        let mut config = config(LaunchMode::SelfStart);
        config.readiness = Readiness::Running;
        let dispatcher = Dispatcher::new(&compute, &shell, &config, Vec::new());

        let handles = dispatcher
            .dispatch(range("2022-10-25", "2022-10-25"), 1)
            .await
            .unwrap();
        let err = handles[0].outcome.as_ref().unwrap_err();
        assert!(matches!(err.source, FleetError::ReadinessTimeout { .. }));
    }

    #[tokio::test]
    async fn test_readiness_timeout_fails_only_that_shard() {
        let compute = FakeCompute {
            ready_after: usize::MAX,
            ..FakeCompute::default()
        };
        let shell = FakeShell::default();
        let config = config(LaunchMode::SelfStart);
        let dispatcher = Dispatcher::new(&compute, &shell, &config, Vec::new());

        let handles = dispatcher
            .dispatch(range("2022-10-25", "2022-10-25"), 1)
            .await
            .unwrap();
        let err = handles[0].outcome.as_ref().unwrap_err();
        assert!(matches!(err.source, FleetError::ReadinessTimeout { .. }));
        assert_eq!(err.instance, handles[0].instance);
        assert_eq!(err.shard.range, range("2022-10-25", "2022-10-25"));
    }

    #[tokio::test]
    async fn test_provisioning_failure_is_isolated() {
        let compute = FakeCompute {
            failing_shard: Some(0),
            ..FakeCompute::default()
        };
        let shell = FakeShell::default();
        let config = config(LaunchMode::SelfStart);
        let dispatcher = Dispatcher::new(&compute, &shell, &config, Vec::new());

        let handles = dispatcher
            .dispatch(range("2022-10-25", "2022-10-28"), 2)
            .await
            .unwrap();
        assert!(matches!(
            handles[0].outcome.as_ref().unwrap_err().source,
            FleetError::Operation { .. }
        ));
        assert!(handles[1].outcome.is_ok());
    }

    #[tokio::test]
    async fn test_ssh_launch_captures_output_and_isolates_failures() {
        let compute = FakeCompute::default();
        let shell = FakeShell {
            unreachable_host: Some("10.0.0.1".into()),
            ..FakeShell::default()
        };
        let config = config(LaunchMode::Ssh);
        let dispatcher = Dispatcher::new(&compute, &shell, &config, Vec::new())
            .with_ssh_public_key(Some("ssh-ed25519 AAAA scraper\n".into()));

        let handles = dispatcher
            .dispatch(range("2022-10-25", "2022-10-26"), 2)
            .await
            .unwrap();

        match handles[0].outcome.as_ref().unwrap() {
            ShardOutcome::Completed { stdout, .. } => assert!(stdout.contains("10.0.0.0")),
            other => panic!("unexpected {other:?}"),
        }
        let err = handles[1].outcome.as_ref().unwrap_err();
        assert!(matches!(err.source, FleetError::Ssh { .. }));

        let commands = shell.commands.borrow();
        let (target, command) = commands.iter().find(|(t, _)| t.host == "10.0.0.0").unwrap();
        assert_eq!(target.user, "scraper");
        assert!(command.ends_with("--emit-stdout"));

        let created = compute.created.borrow();
        let script = &created[0].metadata[0].1;
        assert!(!script.contains(" scan "), "ssh mode must not self-start");
        assert!(created[0].metadata.iter().any(|(k, v)| k == "ssh-keys" && v == "scraper:ssh-ed25519 AAAA scraper"));

        let dir = tempfile::tempdir().unwrap();
        let paths = collect_outputs(&handles, dir.path()).await.unwrap();
        assert_eq!(paths.len(), 1);
        assert!(paths[0].ends_with("shard_0_2022-10-25_2022-10-25.csv"));
    }

    #[tokio::test]
    async fn test_teardown_deletes_each_instance() {
        let compute = FakeCompute::default();
        let shell = FakeShell::default();
        let config = config(LaunchMode::SelfStart);
        let dispatcher = Dispatcher::new(&compute, &shell, &config, Vec::new());

        let names = vec!["top-comment-0-aaaaaa".to_string(), "top-comment-1-bbbbbb".to_string()];
        let results = dispatcher.teardown(&names).await;
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert_eq!(*compute.deleted.borrow(), names);
    }
}
