//! Single-node minikube lifecycle: start, status, teardown and host
//! container cleanup.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::command::{CommandRunner, CommandSpec};
use crate::error::CommandError;
use crate::retry::{retry, RetryError, RetryPolicy};

/// Machine state reported by a healthy cluster.
pub const RUNNING: &str = "Running";
/// Machine state reported by a cluster that exists but is not started.
pub const STOPPED: &str = "Stopped";

/// Minimum pause between `minikube start` and the first status check.
const MIN_SETTLE: Duration = Duration::from_secs(2);

/// Parsed `minikube status` report.
///
/// Keys are kept verbatim, so new subsystems reported by newer minikube
/// releases survive parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterStatus {
    entries: BTreeMap<String, String>,
}

impl ClusterStatus {
    /// Parse colon-delimited `<name>: <value>` lines.
    ///
    /// Lines are split on the first colon and both halves trimmed. A line
    /// without a colon maps to an empty value; blank lines are skipped.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let entries = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| match line.split_once(':') {
                Some((key, value)) => (key.trim().to_string(), value.trim().to_string()),
                None => (line.to_string(), String::new()),
            })
            .collect();
        Self { entries }
    }

    /// Status of a named subsystem.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    /// State of the cluster machine itself.
    ///
    /// Older minikube releases report it as `minikube`, newer ones as `host`.
    #[must_use]
    pub fn machine_state(&self) -> Option<&str> {
        self.get("minikube").or_else(|| self.get("host"))
    }

    /// Whether the machine reports [`RUNNING`].
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.machine_state() == Some(RUNNING)
    }

    /// Whether the machine exists, running or stopped.
    #[must_use]
    pub fn machine_present(&self) -> bool {
        matches!(self.machine_state(), Some(RUNNING | STOPPED))
    }

    /// Iterate over `(subsystem, status)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "{}", parts.join(", "))
    }
}

/// Errors from starting the cluster.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Status could not be read after cluster start.
    #[error("failed to get minikube status: {0}")]
    Status(#[source] RetryError<CommandError>),

    /// A local configuration directory never appeared.
    #[error("timed out after {}s waiting for {dir} to be created", .waited.as_secs())]
    DirectoryTimeout { dir: String, waited: Duration },

    /// The outer start budget ran out.
    #[error("minikube not running after {attempts} start attempts: {last}")]
    NotRunning { attempts: u32, last: String },
}

/// Host-side settings for the `--vm-driver=none` permission fix-up.
#[derive(Debug, Clone)]
pub struct PostStartOptions {
    /// Skip the fix-up because minikube changes ownership itself
    /// (`CHANGE_MINIKUBE_NONE_USER=true`).
    pub minikube_fixes_permissions: bool,
    /// Home directory of the invoking user.
    pub home: PathBuf,
    /// Home directory minikube writes to when run as root.
    pub root_home: PathBuf,
    /// Owner for the moved directories; chown is skipped when empty.
    pub user: String,
    /// Upper bound for the configuration directory wait.
    pub dir_wait: Duration,
}

impl Default for PostStartOptions {
    fn default() -> Self {
        Self {
            minikube_fixes_permissions: false,
            home: dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root")),
            root_home: PathBuf::from("/root"),
            user: std::env::var("USER").unwrap_or_default(),
            dir_wait: Duration::from_secs(60),
        }
    }
}

/// Controls the minikube test cluster through its CLI.
pub struct ClusterController {
    runner: Arc<dyn CommandRunner>,
    post_start: PostStartOptions,
}

impl ClusterController {
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, post_start: PostStartOptions) -> Self {
        Self { runner, post_start }
    }

    /// Query and parse `minikube status`.
    ///
    /// minikube exits non-zero when the machine is stopped but still prints
    /// a report; that report is returned instead of the error.
    ///
    /// # Errors
    ///
    /// Returns the command error when no usable report was printed.
    pub fn status(&self) -> Result<ClusterStatus, CommandError> {
        match self.runner.run(&minikube(["status"])) {
            Ok(out) => Ok(ClusterStatus::parse(&out)),
            Err(e) => {
                let partial = e.stdout().map(ClusterStatus::parse);
                match partial {
                    Some(status) if status.machine_state().is_some() => {
                        debug!(error = %e, "minikube status exited non-zero with a report");
                        Ok(status)
                    }
                    _ => Err(e),
                }
            }
        }
    }

    /// Start the cluster and wait until it reports [`RUNNING`].
    ///
    /// A running cluster is reused and a stopped one is deleted first. Each
    /// outer iteration starts the machine, runs the post-start fix-up, then
    /// polls status under `policy`; a machine that is not running afterwards
    /// is deleted and the next iteration begins.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] when status cannot be read, a configuration
    /// directory never appears, or `outer_max_try` iterations pass without
    /// a running machine.
    pub async fn start(
        &self,
        outer_max_try: u32,
        policy: RetryPolicy,
    ) -> Result<ClusterStatus, ClusterError> {
        match self.status() {
            Ok(status) if status.is_running() => {
                info!(%status, "minikube is already running");
                return Ok(status);
            }
            Ok(status) if status.machine_state() == Some(STOPPED) => {
                info!("minikube machine is stopped, deleting it before start");
                if let Err(e) = self.delete() {
                    warn!(error = %e, "Failed to delete stopped machine");
                }
            }
            Ok(status) => debug!(%status, "minikube not running"),
            Err(e) => debug!(error = %e, "minikube status unavailable before start"),
        }

        let outer_max_try = outer_max_try.max(1);
        let mut last = String::from("never started");

        for attempt in 1..=outer_max_try {
            info!(attempt, outer_max_try, "Starting minikube");

            if let Err(e) = self.runner.run(&minikube([
                "start",
                "--vm-driver=none",
                "--feature-gates=MountPropagation=true",
            ])) {
                warn!(attempt, error = %e, "minikube start failed");
                last = e.to_string();
                self.delete_quietly();
                continue;
            }

            self.fix_permissions(policy.delay()).await?;
            tokio::time::sleep(policy.delay().max(MIN_SETTLE)).await;

            let status = retry(policy, "minikube status", || async { self.status() })
                .await
                .map_err(ClusterError::Status)?;

            info!(
                minikube = status.machine_state().unwrap_or("<absent>"),
                cluster = status.get("cluster").unwrap_or("<absent>"),
                kubectl = status.get("kubectl").unwrap_or("<absent>"),
                "minikube status"
            );

            if status.is_running() {
                return Ok(status);
            }

            last = format!("machine state {:?}", status.machine_state().unwrap_or(""));
            warn!(attempt, state = %last, "minikube not running, deleting machine");
            self.delete_quietly();
        }

        Err(ClusterError::NotRunning {
            attempts: outer_max_try,
            last,
        })
    }

    /// Delete the machine if it exists. Failures are logged, never returned.
    ///
    /// Returns whether a delete was issued and succeeded.
    pub fn teardown(&self) -> bool {
        let status = match self.status() {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "Failed to check minikube status before teardown");
                return false;
            }
        };

        if !status.machine_present() {
            info!("minikube machine not present");
            return false;
        }

        match self.delete() {
            Ok(()) => {
                info!("minikube deleted");
                true
            }
            Err(e) => {
                warn!(error = %e, "Failed to delete minikube");
                false
            }
        }
    }

    /// Force-remove every container on the host.
    ///
    /// The first removal failure stops the sweep and is returned.
    ///
    /// # Errors
    ///
    /// Returns the listing error or the first removal error.
    pub fn clear_containers(&self) -> Result<usize, CommandError> {
        let listing = self.runner.run(&docker(["ps", "-aq"]))?;
        let ids: Vec<&str> = listing.split_whitespace().collect();

        for &id in &ids {
            debug!(container = %id, "Removing container");
            self.runner.run(&docker(["rm", "-f", id]))?;
        }

        info!(count = ids.len(), "Removed containers");
        Ok(ids.len())
    }

    fn delete(&self) -> Result<(), CommandError> {
        self.runner.run(&minikube(["delete"])).map(|_| ())
    }

    fn delete_quietly(&self) {
        if let Err(e) = self.delete() {
            warn!(error = %e, "Failed to delete minikube");
        }
    }

    /// Move minikube's root-owned configuration into the user's home.
    async fn fix_permissions(&self, poll: Duration) -> Result<(), ClusterError> {
        let opts = &self.post_start;
        if opts.minikube_fixes_permissions {
            debug!("minikube fixes permissions itself, skipping fix-up");
            return Ok(());
        }

        let poll = poll.max(Duration::from_millis(100));
        for dir in [".kube", ".minikube"] {
            self.wait_for_dir(dir, poll).await?;
        }

        if opts.home == opts.root_home {
            debug!(home = %opts.home.display(), "Home is root's home, nothing to move");
            return Ok(());
        }

        for dir in [".kube", ".minikube"] {
            let target = opts.home.join(dir);
            let target = target.display().to_string();
            let mut commands = vec![CommandSpec::new(
                "mv",
                [opts.root_home.join(dir).display().to_string(), target.clone()],
            )
            .privileged()];
            if !opts.user.is_empty() {
                commands.push(
                    CommandSpec::new("chown", ["-R", opts.user.as_str(), target.as_str()]).privileged(),
                );
                commands.push(
                    CommandSpec::new("chgrp", ["-R", opts.user.as_str(), target.as_str()]).privileged(),
                );
            }

            for spec in commands {
                match self.runner.run(&spec) {
                    Ok(_) => debug!(command = %spec.display(), "Fix-up command succeeded"),
                    Err(e) => warn!(command = %spec.display(), error = %e, "Fix-up command failed"),
                }
            }
        }

        Ok(())
    }

    async fn wait_for_dir(&self, dir: &str, poll: Duration) -> Result<(), ClusterError> {
        let opts = &self.post_start;
        let candidates = [opts.home.join(dir), opts.root_home.join(dir)];
        let started = Instant::now();

        info!(dir, "Waiting for configuration directory");
        loop {
            if let Some(found) = candidates.iter().find(|p| p.is_dir()) {
                info!(path = %found.display(), "Configuration directory created");
                return Ok(());
            }
            if started.elapsed() >= opts.dir_wait {
                return Err(ClusterError::DirectoryTimeout {
                    dir: dir.to_string(),
                    waited: opts.dir_wait,
                });
            }
            tokio::time::sleep(poll).await;
        }
    }
}

fn minikube<const N: usize>(args: [&str; N]) -> CommandSpec {
    CommandSpec::new("minikube", args).privileged()
}

fn docker<const N: usize>(args: [&str; N]) -> CommandSpec {
    CommandSpec::new("docker", args).privileged()
}
