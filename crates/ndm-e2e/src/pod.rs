//! Read-only snapshot of the workload pod.

use std::fmt;

use k8s_openapi::api::core::v1::Pod;

/// Coarse pod lifecycle phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    /// Reported as `Failed`, or `Error` by older clusters.
    Failed,
    /// Any phase string this harness does not recognize.
    Unknown(String),
}

impl PodPhase {
    /// Parse the phase string reported by the API server.
    #[must_use]
    pub fn parse(phase: &str) -> Self {
        match phase {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" | "Error" => Self::Failed,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Unknown(phase) => write!(f, "{phase}"),
        }
    }
}

/// State of the workload's container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Waiting {
        reason: Option<String>,
        message: Option<String>,
    },
    Running,
    Terminated {
        reason: Option<String>,
        message: Option<String>,
        exit_code: i32,
    },
}

impl ContainerState {
    /// Convert the API representation. Returns `None` when no state is set.
    ///
    /// `terminated` takes precedence over `waiting`, which takes precedence
    /// over `running`.
    #[must_use]
    pub fn from_api(state: &k8s_openapi::api::core::v1::ContainerState) -> Option<Self> {
        if let Some(t) = &state.terminated {
            return Some(Self::Terminated {
                reason: t.reason.clone(),
                message: t.message.clone(),
                exit_code: t.exit_code,
            });
        }
        if let Some(w) = &state.waiting {
            return Some(Self::Waiting {
                reason: w.reason.clone(),
                message: w.message.clone(),
            });
        }
        state.running.as_ref().map(|_| Self::Running)
    }
}

/// Snapshot of one workload pod, fetched fresh on every poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSnapshot {
    pub name: String,
    pub namespace: String,
    pub phase: PodPhase,
    /// State of the first container, if the kubelet has reported one.
    pub container: Option<ContainerState>,
}

impl PodSnapshot {
    /// Snapshot a pod returned by the API server.
    #[must_use]
    pub fn from_pod(pod: &Pod) -> Self {
        let status = pod.status.as_ref();
        let phase = status
            .and_then(|s| s.phase.as_deref())
            .map_or(PodPhase::Pending, PodPhase::parse);
        let container = status
            .and_then(|s| s.container_statuses.as_ref())
            .and_then(|statuses| statuses.first())
            .and_then(|cs| cs.state.as_ref())
            .and_then(ContainerState::from_api);

        Self {
            name: pod.metadata.name.clone().unwrap_or_default(),
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            phase,
            container,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerStateTerminated, ContainerStateWaiting, ContainerStatus, PodStatus,
    };
    use kube::api::ObjectMeta;

    fn pod_with(phase: Option<&str>, state: Option<k8s_openapi::api::core::v1::ContainerState>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("node-disk-manager-x7k2p".into()),
                namespace: Some("default".into()),
                ..ObjectMeta::default()
            },
            status: Some(PodStatus {
                phase: phase.map(String::from),
                container_statuses: state.map(|state| {
                    vec![ContainerStatus {
                        name: "node-disk-manager".into(),
                        state: Some(state),
                        ..ContainerStatus::default()
                    }]
                }),
                ..PodStatus::default()
            }),
            ..Pod::default()
        }
    }

    #[test]
    fn test_phase_parsing() {
        assert_eq!(PodPhase::parse("Running"), PodPhase::Running);
        assert_eq!(PodPhase::parse("Error"), PodPhase::Failed);
        assert_eq!(
            PodPhase::parse("Evicted"),
            PodPhase::Unknown("Evicted".into())
        );
        assert_eq!(PodPhase::Unknown("Evicted".into()).to_string(), "Evicted");
    }

    #[test]
    fn test_snapshot_waiting_container() {
        let pod = pod_with(
            Some("Pending"),
            Some(k8s_openapi::api::core::v1::ContainerState {
                waiting: Some(ContainerStateWaiting {
                    reason: Some("ContainerCreating".into()),
                    message: None,
                }),
                ..Default::default()
            }),
        );

        let snap = PodSnapshot::from_pod(&pod);
        assert_eq!(snap.name, "node-disk-manager-x7k2p");
        assert_eq!(snap.namespace, "default");
        assert_eq!(snap.phase, PodPhase::Pending);
        assert_eq!(
            snap.container,
            Some(ContainerState::Waiting {
                reason: Some("ContainerCreating".into()),
                message: None,
            })
        );
    }

    #[test]
    fn test_snapshot_terminated_wins_over_other_states() {
        let pod = pod_with(
            Some("Running"),
            Some(k8s_openapi::api::core::v1::ContainerState {
                terminated: Some(ContainerStateTerminated {
                    exit_code: 2,
                    reason: Some("Error".into()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        );

        let snap = PodSnapshot::from_pod(&pod);
        assert!(matches!(
            snap.container,
            Some(ContainerState::Terminated { exit_code: 2, .. })
        ));
    }

    #[test]
    fn test_snapshot_without_container_status() {
        let snap = PodSnapshot::from_pod(&pod_with(Some("Pending"), None));
        assert_eq!(snap.container, None);

        let snap = PodSnapshot::from_pod(&pod_with(
            None,
            Some(k8s_openapi::api::core::v1::ContainerState::default()),
        ));
        assert_eq!(snap.phase, PodPhase::Pending);
        assert_eq!(snap.container, None);
    }
}
