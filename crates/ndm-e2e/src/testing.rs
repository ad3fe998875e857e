//! Scripted control plane shared by unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::control_plane::ControlPlane;
use crate::error::ControlPlaneError;
use crate::pod::{ContainerState, PodPhase, PodSnapshot};

/// A [`ControlPlane`] that replays queued responses.
///
/// Empty queues fall back to: no pod, successful apply, missing logs and an
/// `Active` namespace. Exec answers come from a map keyed by the joined
/// command line.
#[derive(Default)]
pub struct FakeControlPlane {
    pods: Mutex<VecDeque<Result<Option<PodSnapshot>, ControlPlaneError>>>,
    applies: Mutex<VecDeque<Result<(), ControlPlaneError>>>,
    applied: Mutex<Vec<String>>,
    exec: Mutex<HashMap<String, String>>,
    logs: Mutex<VecDeque<Result<String, ControlPlaneError>>>,
    namespaces: Mutex<VecDeque<Option<String>>>,
    pod_queries: Mutex<u32>,
}

impl FakeControlPlane {
    pub fn push_pod(&self, pod: Result<Option<PodSnapshot>, ControlPlaneError>) {
        self.pods.lock().unwrap().push_back(pod);
    }

    pub fn push_apply(&self, result: Result<(), ControlPlaneError>) {
        self.applies.lock().unwrap().push_back(result);
    }

    pub fn push_logs(&self, result: Result<String, ControlPlaneError>) {
        self.logs.lock().unwrap().push_back(result);
    }

    pub fn push_namespace(&self, phase: Option<&str>) {
        self.namespaces
            .lock()
            .unwrap()
            .push_back(phase.map(String::from));
    }

    pub fn set_exec(&self, command: &str, output: &str) {
        self.exec
            .lock()
            .unwrap()
            .insert(command.to_string(), output.to_string());
    }

    pub fn applied(&self) -> Vec<String> {
        self.applied.lock().unwrap().clone()
    }

    pub fn pod_queries(&self) -> u32 {
        *self.pod_queries.lock().unwrap()
    }
}

/// Snapshot of a pod named `node-disk-manager-x7k2p` in `default`.
pub fn snapshot(phase: PodPhase, container: Option<ContainerState>) -> PodSnapshot {
    PodSnapshot {
        name: "node-disk-manager-x7k2p".into(),
        namespace: "default".into(),
        phase,
        container,
    }
}

/// Container waiting with `reason`.
pub fn waiting(reason: &str) -> Option<ContainerState> {
    Some(ContainerState::Waiting {
        reason: Some(reason.to_string()),
        message: Some(format!("{reason} message")),
    })
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn find_pod(
        &self,
        _namespace: &str,
        _prefix: &str,
    ) -> Result<Option<PodSnapshot>, ControlPlaneError> {
        *self.pod_queries.lock().unwrap() += 1;
        self.pods.lock().unwrap().pop_front().unwrap_or(Ok(None))
    }

    async fn apply_manifest(
        &self,
        manifest: &str,
        _default_namespace: &str,
    ) -> Result<(), ControlPlaneError> {
        let result = self.applies.lock().unwrap().pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            self.applied.lock().unwrap().push(manifest.to_string());
        }
        result
    }

    async fn exec(
        &self,
        _namespace: &str,
        pod: &str,
        command: &[String],
    ) -> Result<String, ControlPlaneError> {
        self.exec
            .lock()
            .unwrap()
            .get(&command.join(" "))
            .cloned()
            .ok_or_else(|| ControlPlaneError::Exec {
                pod: pod.to_string(),
                message: "upgrade request failed".into(),
            })
    }

    async fn logs(&self, _namespace: &str, pod: &str) -> Result<String, ControlPlaneError> {
        self.logs.lock().unwrap().pop_front().unwrap_or_else(|| {
            Err(ControlPlaneError::NotFound {
                kind: "Pod".into(),
                name: pod.to_string(),
            })
        })
    }

    async fn namespace_phase(&self, _namespace: &str) -> Result<Option<String>, ControlPlaneError> {
        Ok(self
            .namespaces
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Some("Active".into())))
    }
}
