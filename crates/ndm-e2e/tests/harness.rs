//! Drives the public harness API end to end against scripted fakes.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use ndm_e2e::manifest::ImageRef;
use ndm_e2e::{
    Budgets, CommandError, CommandRunner, CommandSpec, Connector, ContainerState, ControlPlane,
    ControlPlaneError, Harness, HarnessConfig, MountRemap, PodPhase, PodSnapshot, PostStartOptions,
    RetryPolicy,
};

const BASE_MANIFEST: &str = r"apiVersion: v1
kind: ConfigMap
metadata:
  name: node-disk-manager-config
data:
  node-disk-manager.config: |
    probeconfigs: []
---
apiVersion: apps/v1
kind: DaemonSet
metadata:
  name: node-disk-manager
spec:
  selector:
    matchLabels:
      name: node-disk-manager
  template:
    metadata:
      labels:
        name: node-disk-manager
    spec:
      containers:
      - name: node-disk-manager
        image: openebs/node-disk-manager-amd64:ci
        imagePullPolicy: Always
";

const HOST_LSBLK: &str = r#"{"blockdevices": [
    {"name": "sda", "size": "50G", "type": "disk", "mountpoints": [null],
     "children": [{"name": "sda1", "size": "50G", "type": "part", "mountpoints": ["/"]}]}
]}"#;

const POD_LSBLK: &str = r#"{"blockdevices": [
    {"name": "sda", "size": "50G", "type": "disk", "mountpoints": [null],
     "children": [{"name": "sda1", "size": "50G", "type": "part", "mountpoints": ["/etc/hosts"]}]}
]}"#;

const HOST_DEVICES: &str = "NAME PATH MOUNTPOINT\nsda1 /dev/sda1 /\n";
const POD_DEVICES: &str = "| NAME | PATH      | MOUNTPOINT |\n| sda1 | /dev/sda1 | /etc/hosts |\n";

const HOST_NDM: &str = "/opt/ndm/bin/amd64/ndm";

/// Answers host commands by program name and records every invocation.
#[derive(Default)]
struct ScriptedRunner {
    calls: Mutex<Vec<String>>,
    kubectl_apply_works: bool,
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, spec: &CommandSpec) -> Result<String, CommandError> {
        self.calls.lock().unwrap().push(spec.display());
        let failed = |stderr: &str| CommandError::Failed {
            program: spec.display(),
            status: "exit status: 1".into(),
            stdout: String::new(),
            stderr: stderr.into(),
        };

        match (spec.program.as_str(), spec.args.first().map(String::as_str)) {
            ("minikube", Some("status")) => Ok("host: Running\nkubelet: Running\napiserver: Running\nkubeconfig: Configured\n".into()),
            ("kubectl", Some("apply")) if self.kubectl_apply_works => Ok("daemonset.apps/node-disk-manager created\n".into()),
            ("lsblk", _) => Ok(HOST_LSBLK.into()),
            (HOST_NDM, Some("device")) => Ok(HOST_DEVICES.into()),
            _ => Err(failed("unexpected command")),
        }
    }
}

/// A cluster where the daemon pod is running from the first poll.
#[derive(Default)]
struct RunningCluster {
    api_apply_works: bool,
    applied: Mutex<Vec<String>>,
}

#[async_trait]
impl ControlPlane for RunningCluster {
    async fn find_pod(
        &self,
        namespace: &str,
        prefix: &str,
    ) -> Result<Option<PodSnapshot>, ControlPlaneError> {
        Ok(Some(PodSnapshot {
            name: format!("{prefix}-x7k2p"),
            namespace: namespace.to_string(),
            phase: PodPhase::Running,
            container: Some(ContainerState::Running),
        }))
    }

    async fn apply_manifest(
        &self,
        manifest: &str,
        _default_namespace: &str,
    ) -> Result<(), ControlPlaneError> {
        if !self.api_apply_works {
            return Err(ControlPlaneError::Connect("connection refused".into()));
        }
        self.applied.lock().unwrap().push(manifest.to_string());
        Ok(())
    }

    async fn exec(
        &self,
        _namespace: &str,
        pod: &str,
        command: &[String],
    ) -> Result<String, ControlPlaneError> {
        match command.join(" ").as_str() {
            "lsblk -J" => Ok(POD_LSBLK.into()),
            "ndm device list" => Ok(POD_DEVICES.into()),
            other => Err(ControlPlaneError::Exec {
                pod: pod.to_string(),
                message: format!("unknown command {other}"),
            }),
        }
    }

    async fn logs(&self, _namespace: &str, _pod: &str) -> Result<String, ControlPlaneError> {
        Ok("I0101 00:00:00 controller.go:42] Started controller\n".into())
    }

    async fn namespace_phase(&self, _namespace: &str) -> Result<Option<String>, ControlPlaneError> {
        Ok(Some("Active".into()))
    }
}

struct StaticConnector(Arc<RunningCluster>);

#[async_trait]
impl Connector for StaticConnector {
    async fn connect(
        &self,
        _kubeconfig: Option<&Path>,
    ) -> Result<Arc<dyn ControlPlane>, ControlPlaneError> {
        Ok(self.0.clone())
    }
}

fn harness_config(dir: &TempDir) -> HarnessConfig {
    let manifest = dir.path().join("node-disk-manager.yaml");
    std::fs::write(&manifest, BASE_MANIFEST).unwrap();
    let policy = RetryPolicy::new(2, Duration::ZERO);

    HarnessConfig {
        ndm_dir: dir.path().to_path_buf(),
        manifest,
        test_manifest: dir.path().join("NDM_Test_node-disk-manager.yaml"),
        namespace: "default".into(),
        pod_prefix: "node-disk-manager".into(),
        image: ImageRef {
            name: "openebs/node-disk-manager-amd64".into(),
            tag: "v0.4.1".into(),
        },
        host_ndm: PathBuf::from(HOST_NDM),
        remap: MountRemap::default(),
        kubeconfig: None,
        use_sudo: false,
        post_start: PostStartOptions {
            minikube_fixes_permissions: true,
            ..PostStartOptions::default()
        },
        budgets: Budgets {
            start_attempts: 1,
            status: policy,
            apply: policy,
            ready: policy,
            lookup: policy,
            logs: policy,
        },
    }
}

#[tokio::test]
async fn test_run_against_running_cluster() {
    let dir = TempDir::new().unwrap();
    let cluster = Arc::new(RunningCluster {
        api_apply_works: true,
        ..RunningCluster::default()
    });
    let runner = Arc::new(ScriptedRunner::default());

    let harness = Harness::new(
        harness_config(&dir),
        runner.clone(),
        Arc::new(StaticConnector(cluster.clone())),
    )
    .with_prerequisite_check(false);
    harness.run().await.unwrap();

    let applied = cluster.applied.lock().unwrap();
    assert_eq!(applied.len(), 1);
    assert!(applied[0].contains("kind: ConfigMap"));
    assert!(applied[0].contains("image: openebs/node-disk-manager-amd64:v0.4.1"));
    assert!(applied[0].contains("imagePullPolicy: IfNotPresent"));

    let calls = runner.calls.lock().unwrap();
    assert!(calls.contains(&"lsblk -J".to_string()));
    assert!(calls.contains(&format!("{HOST_NDM} device list")));
    assert!(!calls.iter().any(|c| c.starts_with("kubectl")));
}

#[tokio::test]
async fn test_apply_falls_back_to_kubectl() {
    let dir = TempDir::new().unwrap();
    let config = harness_config(&dir);
    let test_manifest = config.test_manifest.display().to_string();
    let cluster = Arc::new(RunningCluster::default());
    let runner = Arc::new(ScriptedRunner {
        kubectl_apply_works: true,
        ..ScriptedRunner::default()
    });

    let harness = Harness::new(config, runner.clone(), Arc::new(StaticConnector(cluster.clone())))
        .with_prerequisite_check(false);
    harness.run().await.unwrap();

    assert!(cluster.applied.lock().unwrap().is_empty());
    let calls = runner.calls.lock().unwrap();
    assert!(calls.contains(&format!("kubectl apply -f {test_manifest}")));
}

#[tokio::test]
async fn test_apply_exhaustion_exits_with_manifest_code() {
    let dir = TempDir::new().unwrap();
    let cluster = Arc::new(RunningCluster::default());
    let runner = Arc::new(ScriptedRunner::default());

    let err = Harness::new(harness_config(&dir), runner.clone(), Arc::new(StaticConnector(cluster)))
        .with_prerequisite_check(false)
        .run()
        .await
        .unwrap_err();

    assert_eq!(err.exit_code(), 3);
    assert_eq!(err.stage(), "manifest");
    let shell_attempts = runner
        .calls
        .lock()
        .unwrap()
        .iter()
        .filter(|c| c.starts_with("sh -c"))
        .count();
    assert_eq!(shell_attempts, 2);
}

#[test]
fn test_status_reports_every_subsystem() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new(
        harness_config(&dir),
        Arc::new(ScriptedRunner::default()),
        Arc::new(StaticConnector(Arc::new(RunningCluster::default()))),
    );

    let status = harness.status().unwrap();
    assert!(status.is_running());
    assert_eq!(status.get("kubeconfig"), Some("Configured"));
    assert_eq!(status.len(), 4);
}
