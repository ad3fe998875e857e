//! End-to-end test orchestration.
//!
//! [`Harness::run`] walks the stages in order and stops at the first
//! failure, returning a [`HarnessError`] that names the stage and carries
//! the exit code. [`Harness::clean`] is best-effort and never fails.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterController, ClusterStatus};
use crate::command::CommandRunner;
use crate::config::HarnessConfig;
use crate::control_plane::{ControlPlane, KubeControlPlane};
use crate::error::{ControlPlaneError, HarnessError};
use crate::manifest::prepare_manifest;
use crate::pod::{PodPhase, PodSnapshot};
use crate::probe::{log_is_healthy, Prober};
use crate::readiness::{ReadinessError, ReadinessMonitor};
use crate::retry::retry;
use crate::ui;
use crate::validator::PrerequisitesValidator;
use crate::workload::Workload;

/// Stages of an end-to-end run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Checking host tools.
    CheckingPrerequisites,
    /// Writing the test manifest.
    PreparingManifest,
    /// Starting minikube.
    StartingCluster,
    /// Connecting to the API server and waiting for the namespace.
    ConnectingControlPlane,
    /// Applying the test manifest.
    ApplyingManifest,
    /// Waiting for the daemon container to run.
    WaitingForPod,
    /// Checking the daemon log.
    ValidatingLogs,
    /// Comparing `lsblk -J` output.
    ComparingDeviceTree,
    /// Comparing `ndm device list` output.
    ComparingDeviceList,
}

impl Stage {
    /// Get a human-readable description of the stage.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::CheckingPrerequisites => "Checking prerequisites",
            Self::PreparingManifest => "Preparing test manifest",
            Self::StartingCluster => "Starting minikube",
            Self::ConnectingControlPlane => "Connecting to the API server",
            Self::ApplyingManifest => "Applying test manifest",
            Self::WaitingForPod => "Waiting for node-disk-manager pod",
            Self::ValidatingLogs => "Validating daemon log",
            Self::ComparingDeviceTree => "Comparing lsblk output",
            Self::ComparingDeviceList => "Comparing ndm device list output",
        }
    }

    /// Get the stage number for progress display.
    #[must_use]
    pub fn step_number(&self) -> u8 {
        match self {
            Self::CheckingPrerequisites => 1,
            Self::PreparingManifest => 2,
            Self::StartingCluster => 3,
            Self::ConnectingControlPlane => 4,
            Self::ApplyingManifest => 5,
            Self::WaitingForPod => 6,
            Self::ValidatingLogs => 7,
            Self::ComparingDeviceTree => 8,
            Self::ComparingDeviceList => 9,
        }
    }

    /// Total number of stages.
    pub const TOTAL_STEPS: u8 = 9;
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Opens a control-plane session once the cluster is up.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        kubeconfig: Option<&Path>,
    ) -> Result<Arc<dyn ControlPlane>, ControlPlaneError>;
}

/// [`Connector`] for a real cluster through kube-rs.
#[derive(Debug, Clone, Copy, Default)]
pub struct KubeConnector;

#[async_trait]
impl Connector for KubeConnector {
    async fn connect(
        &self,
        kubeconfig: Option<&Path>,
    ) -> Result<Arc<dyn ControlPlane>, ControlPlaneError> {
        let plane = KubeControlPlane::connect(kubeconfig).await?;
        Ok(Arc::new(plane))
    }
}

/// Runs the end-to-end test against a single-node cluster.
pub struct Harness {
    config: HarnessConfig,
    runner: Arc<dyn CommandRunner>,
    connector: Arc<dyn Connector>,
    check_prerequisites: bool,
}

impl Harness {
    #[must_use]
    pub fn new(
        config: HarnessConfig,
        runner: Arc<dyn CommandRunner>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            config,
            runner,
            connector,
            check_prerequisites: true,
        }
    }

    /// Enable or disable the host tool check of the first stage.
    #[must_use]
    pub fn with_prerequisite_check(mut self, enabled: bool) -> Self {
        self.check_prerequisites = enabled;
        self
    }

    #[must_use]
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    fn cluster(&self) -> ClusterController {
        ClusterController::new(Arc::clone(&self.runner), self.config.post_start.clone())
    }

    fn enter(stage: Stage) {
        ui::print_progress_step(stage.step_number(), Stage::TOTAL_STEPS, stage.description());
        info!(stage = %stage, "Entering stage");
    }

    /// Run every stage in order.
    ///
    /// # Errors
    ///
    /// Returns the [`HarnessError`] of the first failing stage.
    pub async fn run(&self) -> Result<(), HarnessError> {
        let config = &self.config;
        ui::print_section("node-disk-manager end-to-end test");
        ui::print_kv("Image", &config.image.to_string());
        ui::print_kv("Namespace", &config.namespace);
        ui::print_kv("Host ndm", &config.host_ndm.display().to_string());
        println!();

        Self::enter(Stage::CheckingPrerequisites);
        self.prerequisites()?;

        Self::enter(Stage::PreparingManifest);
        self.prepare()?;

        Self::enter(Stage::StartingCluster);
        let status = self
            .cluster()
            .start(config.budgets.start_attempts, config.budgets.status)
            .await
            .map_err(|e| HarnessError::Cluster(e.to_string()))?;
        ui::print_cluster_status(&status);
        ui::print_success("minikube is running");

        Self::enter(Stage::ConnectingControlPlane);
        let control_plane = self.connect().await?;
        let workload = Workload::new(
            Arc::clone(&control_plane),
            Arc::clone(&self.runner),
            config.namespace.clone(),
        );

        Self::enter(Stage::ApplyingManifest);
        let path = config.test_manifest.as_path();
        let transport = retry(config.budgets.apply, "apply test manifest", || {
            workload.apply(path)
        })
        .await
        .map_err(|e| HarnessError::Manifest(e.to_string()))?;
        ui::print_success(&format!("Applied {} via {transport}", path.display()));

        Self::enter(Stage::WaitingForPod);
        let pod = ReadinessMonitor::new(control_plane.as_ref(), &config.namespace, &config.pod_prefix)
            .wait_until_ready(config.budgets.ready)
            .await
            .map_err(HarnessError::from)?;
        ui::print_success(&format!("Pod {} is running", pod.name));

        Self::enter(Stage::ValidatingLogs);
        self.validate_logs(&workload, &pod).await?;
        ui::print_success("Daemon log shows a started controller");

        let prober = Prober::new(&workload, self.runner.as_ref(), &config.remap);

        Self::enter(Stage::ComparingDeviceTree);
        let pod = self.locate_pod(control_plane.as_ref()).await?;
        prober
            .device_tree(&pod.name)
            .await
            .map_err(|e| HarnessError::DeviceTree(e.to_string()))?;
        ui::print_success("lsblk output matches");

        Self::enter(Stage::ComparingDeviceList);
        prober
            .device_list(&pod.name, &config.host_ndm)
            .await
            .map_err(|e| HarnessError::DeviceList(e.to_string()))?;
        ui::print_success("ndm device list output matches");

        println!();
        ui::print_success("End-to-end test passed");
        Ok(())
    }

    fn prerequisites(&self) -> Result<(), HarnessError> {
        if !self.check_prerequisites {
            debug!("Prerequisite check disabled");
            return Ok(());
        }
        PrerequisitesValidator::new(&self.config.host_ndm)
            .validate()
            .map_err(|e| HarnessError::Cluster(format!("{e:#}")))
    }

    fn prepare(&self) -> Result<(), HarnessError> {
        let config = &self.config;
        if config.image.tag.is_empty() {
            return Err(HarnessError::Manifest(
                "image tag is unknown, set TAG or pass --tag".into(),
            ));
        }
        prepare_manifest(&config.manifest, &config.test_manifest, &config.image)
            .map_err(|e| HarnessError::Manifest(e.to_string()))?;
        ui::print_success(&format!("Wrote {}", config.test_manifest.display()));
        Ok(())
    }

    async fn connect(&self) -> Result<Arc<dyn ControlPlane>, HarnessError> {
        let config = &self.config;
        let policy = config.budgets.status;
        let kubeconfig = config.kubeconfig.as_deref();

        let control_plane = retry(policy, "connect to API server", || {
            self.connector.connect(kubeconfig)
        })
        .await
        .map_err(|e| HarnessError::Cluster(e.to_string()))?;

        let namespace = config.namespace.as_str();
        retry(policy, "wait for namespace", || async {
            match control_plane.namespace_phase(namespace).await {
                Ok(Some(phase)) if phase == "Active" => Ok(()),
                Ok(Some(phase)) => Err(format!("namespace {namespace} is {phase}")),
                Ok(None) => Err(format!("namespace {namespace} does not exist")),
                Err(e) => Err(e.to_string()),
            }
        })
        .await
        .map_err(|e| HarnessError::Cluster(e.to_string()))?;

        ui::print_success(&format!("Namespace {namespace} is active"));
        Ok(control_plane)
    }

    async fn validate_logs(&self, workload: &Workload, pod: &PodSnapshot) -> Result<(), HarnessError> {
        match &pod.phase {
            PodPhase::Running => {}
            PodPhase::Unknown(phase) => {
                return Err(HarnessError::Logs(format!(
                    "pod {} has unrecognized phase {phase}",
                    pod.name
                )));
            }
            phase => {
                return Err(HarnessError::Logs(format!(
                    "pod {} is in phase {phase}, expected Running",
                    pod.name
                )));
            }
        }

        let log = retry(self.config.budgets.logs, "fetch daemon log", || {
            workload.logs(&pod.name)
        })
        .await
        .map_err(|e| HarnessError::Logs(e.to_string()))?;

        if !log_is_healthy(&log) {
            debug!(log = %log, "Daemon log");
            return Err(HarnessError::Logs(format!(
                "log of pod {} does not show a started controller",
                pod.name
            )));
        }
        Ok(())
    }

    /// Find the daemon pod again before running commands in it.
    async fn locate_pod(&self, control_plane: &dyn ControlPlane) -> Result<PodSnapshot, HarnessError> {
        let config = &self.config;
        let namespace = config.namespace.as_str();
        let prefix = config.pod_prefix.as_str();

        retry(config.budgets.lookup, "find daemon pod", || async {
            match control_plane.find_pod(namespace, prefix).await {
                Ok(Some(pod)) => Ok(pod),
                Ok(None) => Err(ControlPlaneError::NotFound {
                    kind: "Pod".into(),
                    name: format!("{prefix}*"),
                }),
                Err(e) => Err(e),
            }
        })
        .await
        .map_err(|e| {
            warn!(error = %e, "Daemon pod lookup failed");
            HarnessError::WorkloadNotFound {
                prefix: prefix.to_string(),
                namespace: namespace.to_string(),
            }
        })
    }

    /// Print the parsed cluster status.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Cluster`] if no status report is available.
    pub fn status(&self) -> Result<ClusterStatus, HarnessError> {
        let status = self
            .cluster()
            .status()
            .map_err(|e| HarnessError::Cluster(format!("failed to get minikube status: {e}")))?;
        ui::print_section("minikube status");
        ui::print_cluster_status(&status);
        Ok(status)
    }

    /// Delete the cluster, remove host containers and the test manifest.
    ///
    /// Failures are reported and logged, never returned.
    pub fn clean(&self) {
        ui::print_section("Cleanup");
        let cluster = self.cluster();

        if cluster.teardown() {
            ui::print_success("minikube deleted");
        } else {
            ui::print_info("minikube was not deleted");
        }

        match cluster.clear_containers() {
            Ok(count) => ui::print_success(&format!("Removed {count} containers")),
            Err(e) => {
                warn!(error = %e, "Failed to clear containers");
                ui::print_warning(&format!("Failed to clear containers: {e}"));
            }
        }

        let path = &self.config.test_manifest;
        match std::fs::remove_file(path) {
            Ok(()) => ui::print_success(&format!("Removed {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Test manifest already absent");
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to remove test manifest");
                ui::print_warning(&format!("Failed to remove {}: {e}", path.display()));
            }
        }
    }
}

impl From<ReadinessError> for HarnessError {
    fn from(err: ReadinessError) -> Self {
        match err {
            ReadinessError::Terminated {
                pod,
                reason,
                message,
                exit_code,
            } => {
                let mut detail = format!("exit code {exit_code}");
                if let Some(reason) = reason {
                    detail.push_str(&format!(", reason {reason}"));
                }
                if let Some(message) = message {
                    detail.push_str(&format!(": {message}"));
                }
                Self::PodTerminated { pod, detail }
            }
            ReadinessError::BadState {
                pod,
                reason,
                message,
            } => Self::PodBadState {
                pod,
                state: reason,
                message,
            },
            ReadinessError::BadPhase { pod, phase } => Self::PodBadState {
                pod,
                state: phase.to_string(),
                message: "pod phase will not recover".into(),
            },
            ReadinessError::Query(e) => Self::PodQuery(e.to_string()),
            ReadinessError::Exhausted {
                prefix, attempts, ..
            } => Self::ReadinessTimeout {
                pod: prefix,
                attempts,
            },
        }
    }
}
