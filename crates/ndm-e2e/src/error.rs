//! Error types for the harness.
//!
//! Lower layers return the narrow errors defined next to them
//! ([`CommandError`], [`ControlPlaneError`], ...). Only the orchestrator
//! turns them into a [`HarnessError`], which carries the process exit code.

use thiserror::Error;

/// Errors from running an external command.
#[derive(Error, Debug)]
pub enum CommandError {
    /// The program could not be started at all.
    #[error("failed to run `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The program ran and exited unsuccessfully.
    #[error("`{program}` failed ({status}): {stderr}")]
    Failed {
        program: String,
        status: String,
        stdout: String,
        stderr: String,
    },
}

impl CommandError {
    /// Standard output captured before the command failed, if any.
    #[must_use]
    pub fn stdout(&self) -> Option<&str> {
        match self {
            Self::Failed { stdout, .. } if !stdout.trim().is_empty() => Some(stdout),
            _ => None,
        }
    }
}

/// Errors from the cluster's control-plane API.
#[derive(Error, Debug)]
pub enum ControlPlaneError {
    /// The client could not be configured.
    #[error("failed to connect to the control plane: {0}")]
    Connect(String),

    /// The requested object does not exist (yet).
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    /// The API server rejected or failed the request.
    #[error("control-plane API error: {0}")]
    Api(#[from] kube::Error),

    /// Running a command inside a pod failed.
    #[error("exec in pod {pod} failed: {message}")]
    Exec { pod: String, message: String },

    /// A manifest document could not be submitted.
    #[error("invalid manifest document: {0}")]
    Document(String),
}

impl ControlPlaneError {
    /// Whether the error means the object has not been created yet.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Api(kube::Error::Api(response)) => response.code == 404,
            _ => false,
        }
    }
}

/// A failed stage of the end-to-end run.
///
/// Each variant maps to exactly one process exit code through
/// [`HarnessError::exit_code`].
#[derive(Error, Debug)]
pub enum HarnessError {
    /// No pod matched the workload prefix.
    #[error("no pod with prefix {prefix:?} found in namespace {namespace}")]
    WorkloadNotFound { prefix: String, namespace: String },

    /// Paths, image tag or options could not be resolved before any stage ran.
    #[error("{0}")]
    Config(String),

    /// The cluster could not be started, queried or reached.
    #[error("{0}")]
    Cluster(String),

    /// The manifest could not be prepared or applied.
    #[error("{0}")]
    Manifest(String),

    /// The workload container exited during startup.
    #[error("pod {pod} terminated unexpectedly: {detail}")]
    PodTerminated { pod: String, detail: String },

    /// The workload is waiting for a reason that will not resolve itself.
    #[error("pod {pod} is in bad state {state}: {message}")]
    PodBadState {
        pod: String,
        state: String,
        message: String,
    },

    /// Polling the workload failed with a non-transient error.
    #[error("failed to query pod state: {0}")]
    PodQuery(String),

    /// The workload never reached the running state.
    #[error("pod {pod} not running after {attempts} attempts")]
    ReadinessTimeout { pod: String, attempts: u32 },

    /// Log retrieval or validation failed.
    #[error("{0}")]
    Logs(String),

    /// The block-device tree differs between host and workload.
    #[error("{0}")]
    DeviceTree(String),

    /// The daemon's device listing differs between host and workload.
    #[error("{0}")]
    DeviceList(String),
}

impl HarnessError {
    /// Process exit code for this failure.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::WorkloadNotFound { .. } => 1,
            Self::Config(_) | Self::Cluster(_) => 2,
            Self::Manifest(_) => 3,
            Self::PodTerminated { .. } | Self::PodBadState { .. } | Self::PodQuery(_) => 4,
            Self::Logs(_) => 5,
            Self::DeviceTree(_) => 6,
            Self::DeviceList(_) => 7,
            Self::ReadinessTimeout { .. } => 8,
        }
    }

    /// Name of the stage that failed, used in the final diagnostic line.
    #[must_use]
    pub fn stage(&self) -> &'static str {
        match self {
            Self::WorkloadNotFound { .. } => "workload lookup",
            Self::Config(_) => "configuration",
            Self::Cluster(_) => "cluster",
            Self::Manifest(_) => "manifest",
            Self::PodTerminated { .. }
            | Self::PodBadState { .. }
            | Self::PodQuery(_)
            | Self::ReadinessTimeout { .. } => "readiness",
            Self::Logs(_) => "log validation",
            Self::DeviceTree(_) => "lsblk validation",
            Self::DeviceList(_) => "ndm validation",
        }
    }
}
