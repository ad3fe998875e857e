//! Harness configuration.
//!
//! Command-line flags and environment variables are parsed by clap into
//! [`HarnessOptions`] and [`RunArgs`], then resolved once into a
//! [`HarnessConfig`] that every stage borrows.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args};
use tracing::{debug, warn};

use crate::cluster::PostStartOptions;
use crate::command::{CommandRunner, CommandSpec};
use crate::compare::{MountRemap, DEFAULT_REMAP_PREFIX};
use crate::manifest::{ImageRef, TEST_MANIFEST_PATH};
use crate::retry::RetryPolicy;

/// Default namespace the daemon is deployed to.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Default name prefix of the daemon pod.
pub const DEFAULT_POD_PREFIX: &str = "node-disk-manager";

/// Repository path below `$GOPATH`.
const NDM_REPO: &str = "src/github.com/openebs/node-disk-manager";

/// Options shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct HarnessOptions {
    /// node-disk-manager checkout
    #[arg(long, env = "NDM_DIR", value_name = "DIR", global = true)]
    pub ndm_dir: Option<PathBuf>,

    /// Base daemon manifest [default: <ndm-dir>/samples/node-disk-manager.yaml]
    #[arg(long, value_name = "FILE", global = true)]
    pub manifest: Option<PathBuf>,

    /// Where the prepared test manifest is written
    #[arg(long, value_name = "FILE", default_value = TEST_MANIFEST_PATH, global = true)]
    pub test_manifest: PathBuf,

    /// Namespace the daemon runs in
    #[arg(long, default_value = DEFAULT_NAMESPACE, global = true)]
    pub namespace: String,

    /// Name prefix of the daemon pod
    #[arg(long, default_value = DEFAULT_POD_PREFIX, global = true)]
    pub pod_prefix: String,

    /// Image architecture suffix [default: host architecture]
    #[arg(long, env = "XC_ARCH", global = true)]
    pub arch: Option<String>,

    /// Image tag [default: `git describe --tags --always` in the checkout]
    #[arg(long, env = "TAG", global = true)]
    pub tag: Option<String>,

    /// Host ndm binary [default: <ndm-dir>/bin/<arch>/ndm]
    #[arg(long, value_name = "FILE", global = true)]
    pub host_ndm: Option<PathBuf>,

    /// Prefix under which the daemon sees host mount points
    #[arg(long, default_value = DEFAULT_REMAP_PREFIX, global = true)]
    pub remap_prefix: String,

    /// Kubeconfig file [default: standard kube client inference]
    #[arg(long, env = "KUBECONFIG", value_name = "FILE", global = true)]
    pub kubeconfig: Option<PathBuf>,

    /// Run minikube and docker through sudo
    #[arg(long, env = "USE_SUDO", default_value_t = true, action = ArgAction::Set, global = true)]
    pub use_sudo: bool,

    /// minikube chowns its own configuration, skip the post-start fix-up
    #[arg(
        long,
        env = "CHANGE_MINIKUBE_NONE_USER",
        default_value_t = false,
        action = ArgAction::Set,
        global = true
    )]
    pub minikube_fixes_permissions: bool,
}

/// Attempt budgets for `run`.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Run cleanup after a successful test
    #[arg(long)]
    pub clean: bool,

    /// Outer minikube start attempts
    #[arg(long, default_value_t = 5, allow_negative_numbers = true)]
    pub start_attempts: i64,

    /// Status attempts per start, also used to connect to the API server
    #[arg(long, default_value_t = 5, allow_negative_numbers = true)]
    pub status_attempts: i64,

    /// Manifest apply attempts
    #[arg(long, default_value_t = 5, allow_negative_numbers = true)]
    pub apply_attempts: i64,

    /// Readiness polls before giving up
    #[arg(long, default_value_t = 120, allow_negative_numbers = true)]
    pub ready_attempts: i64,

    /// Pod lookup attempts before the comparisons
    #[arg(long, default_value_t = 5, allow_negative_numbers = true)]
    pub lookup_attempts: i64,

    /// Log retrieval attempts
    #[arg(long, default_value_t = 5, allow_negative_numbers = true)]
    pub log_attempts: i64,

    /// Seconds between attempts
    #[arg(long, default_value_t = 1, allow_negative_numbers = true)]
    pub delay_secs: i64,

    /// Upper bound for the post-start configuration directory wait
    #[arg(long, default_value_t = 60)]
    pub dir_wait_secs: u64,
}

/// Retry budgets for every stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budgets {
    pub start_attempts: u32,
    pub status: RetryPolicy,
    pub apply: RetryPolicy,
    pub ready: RetryPolicy,
    pub lookup: RetryPolicy,
    pub logs: RetryPolicy,
}

impl Default for Budgets {
    fn default() -> Self {
        let delay = Duration::from_secs(1);
        Self {
            start_attempts: 5,
            status: RetryPolicy::new(5, delay),
            apply: RetryPolicy::new(5, delay),
            ready: RetryPolicy::new(120, delay),
            lookup: RetryPolicy::new(5, delay),
            logs: RetryPolicy::new(5, delay),
        }
    }
}

impl From<&RunArgs> for Budgets {
    fn from(args: &RunArgs) -> Self {
        let policy = |attempts| RetryPolicy::coerced(attempts, args.delay_secs);
        Self {
            start_attempts: policy(args.start_attempts).max_attempts(),
            status: policy(args.status_attempts),
            apply: policy(args.apply_attempts),
            ready: policy(args.ready_attempts),
            lookup: policy(args.lookup_attempts),
            logs: policy(args.log_attempts),
        }
    }
}

/// Fully resolved harness configuration.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub ndm_dir: PathBuf,
    pub manifest: PathBuf,
    pub test_manifest: PathBuf,
    pub namespace: String,
    pub pod_prefix: String,
    /// Image under test. The tag is empty when it could not be determined.
    pub image: ImageRef,
    pub host_ndm: PathBuf,
    pub remap: MountRemap,
    pub kubeconfig: Option<PathBuf>,
    pub use_sudo: bool,
    pub post_start: PostStartOptions,
    pub budgets: Budgets,
}

impl HarnessConfig {
    /// Resolve defaults that depend on the host.
    ///
    /// `runner` is used for `git describe` when no tag was given.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkout location cannot be determined.
    pub fn resolve(
        options: &HarnessOptions,
        budgets: Budgets,
        dir_wait: Duration,
        runner: &dyn CommandRunner,
    ) -> Result<Self> {
        let ndm_dir = match &options.ndm_dir {
            Some(dir) => dir.clone(),
            None => default_ndm_dir().context("Failed to locate the node-disk-manager checkout")?,
        };

        let arch = options
            .arch
            .as_deref()
            .map(str::trim)
            .filter(|arch| !arch.is_empty())
            .map_or_else(|| host_arch().to_string(), str::to_string);

        let tag = match options.tag.as_deref() {
            Some(tag) => tag.trim().to_string(),
            None => describe_tag(&ndm_dir, runner),
        };

        let manifest = options
            .manifest
            .clone()
            .unwrap_or_else(|| ndm_dir.join("samples").join("node-disk-manager.yaml"));
        let host_ndm = options
            .host_ndm
            .clone()
            .unwrap_or_else(|| ndm_dir.join("bin").join(&arch).join("ndm"));

        let post_start = PostStartOptions {
            minikube_fixes_permissions: options.minikube_fixes_permissions,
            dir_wait,
            ..PostStartOptions::default()
        };

        let config = Self {
            image: ImageRef {
                name: format!("openebs/node-disk-manager-{arch}"),
                tag,
            },
            ndm_dir,
            manifest,
            test_manifest: options.test_manifest.clone(),
            namespace: options.namespace.clone(),
            pod_prefix: options.pod_prefix.clone(),
            host_ndm,
            remap: MountRemap::new(&options.remap_prefix),
            kubeconfig: options.kubeconfig.clone(),
            use_sudo: options.use_sudo,
            post_start,
            budgets,
        };
        debug!(?config, "Resolved configuration");
        Ok(config)
    }
}

/// `$GOPATH/src/github.com/openebs/node-disk-manager`, with Go's default
/// `~/go` when `GOPATH` is unset. Only the first `GOPATH` entry is used.
fn default_ndm_dir() -> Result<PathBuf> {
    let gopath = match std::env::var_os("GOPATH").filter(|p| !p.is_empty()) {
        Some(paths) => std::env::split_paths(&paths)
            .next()
            .context("GOPATH is set but has no entries")?,
        None => dirs::home_dir()
            .context("GOPATH is unset and the home directory is unknown")?
            .join("go"),
    };
    Ok(gopath.join(NDM_REPO))
}

/// Image architecture name for the build target.
#[must_use]
pub fn host_arch() -> &'static str {
    arch_name(std::env::consts::ARCH)
}

fn arch_name(target_arch: &'static str) -> &'static str {
    match target_arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64le",
        other => other,
    }
}

fn describe_tag(ndm_dir: &Path, runner: &dyn CommandRunner) -> String {
    let dir = ndm_dir.display().to_string();
    let spec = CommandSpec::new("git", ["-C", dir.as_str(), "describe", "--tags", "--always"]);
    match runner.run(&spec) {
        Ok(tag) => tag.trim().to_string(),
        Err(e) => {
            warn!(error = %e, "Failed to determine image tag from git");
            String::new()
        }
    }
}
