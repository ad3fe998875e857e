//! Runs the same probe on the host and inside the workload, then compares.

use std::path::Path;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::command::{CommandRunner, CommandSpec};
use crate::compare::{listings_match, trees_match, Mismatch, MountRemap};
use crate::error::CommandError;
use crate::workload::{ChainError, Workload};

/// Log lines the daemon prints once its controller loop is running.
pub const LOG_MARKERS: &[&str] = &["Started controller", "started the controller"];

/// Whether the daemon log shows a started controller.
#[must_use]
pub fn log_is_healthy(log: &str) -> bool {
    LOG_MARKERS.iter().any(|marker| log.contains(marker))
}

/// Errors from running or comparing a probe.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("error executing `{probe}` inside pod: {source}")]
    Workload {
        probe: String,
        #[source]
        source: ChainError,
    },

    #[error("error executing `{probe}` in host: {source}")]
    Host {
        probe: String,
        #[source]
        source: CommandError,
    },

    #[error("`{probe}` output from {side} is not valid JSON: {source}")]
    Parse {
        probe: String,
        side: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("`{probe}` output mismatch: {source}")]
    Mismatch {
        probe: String,
        #[source]
        source: Mismatch,
    },
}

/// Host and workload probe runner.
pub struct Prober<'a> {
    workload: &'a Workload,
    runner: &'a dyn CommandRunner,
    remap: &'a MountRemap,
}

impl<'a> Prober<'a> {
    #[must_use]
    pub fn new(workload: &'a Workload, runner: &'a dyn CommandRunner, remap: &'a MountRemap) -> Self {
        Self {
            workload,
            runner,
            remap,
        }
    }

    /// Compare `lsblk -J` inside `pod` with the host.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError`] if either side fails to run or parse, or the
    /// trees differ.
    pub async fn device_tree(&self, pod: &str) -> Result<(), ProbeError> {
        let probe = "lsblk -J".to_string();
        let command = vec!["lsblk".to_string(), "-J".to_string()];

        let in_pod = self
            .workload
            .exec(pod, &command)
            .await
            .map_err(|source| ProbeError::Workload {
                probe: probe.clone(),
                source,
            })?;
        let in_pod = parse_tree(&probe, "pod", &in_pod)?;

        let in_host = self
            .runner
            .run(&CommandSpec::new("lsblk", ["-J"]))
            .map_err(|source| ProbeError::Host {
                probe: probe.clone(),
                source,
            })?;
        let in_host = parse_tree(&probe, "host", &in_host)?;

        trees_match(&in_host, &in_pod, self.remap)
            .map_err(|source| ProbeError::Mismatch { probe, source })?;
        info!("lsblk output OK");
        Ok(())
    }

    /// Compare `ndm device list` inside `pod` with the host binary at
    /// `host_ndm`.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError`] if either side fails to run or the listings
    /// differ.
    pub async fn device_list(&self, pod: &str, host_ndm: &Path) -> Result<(), ProbeError> {
        let probe = "ndm device list".to_string();
        let command = vec!["ndm".to_string(), "device".to_string(), "list".to_string()];

        let in_pod = self
            .workload
            .exec(pod, &command)
            .await
            .map_err(|source| ProbeError::Workload {
                probe: probe.clone(),
                source,
            })?;

        let host_binary = host_ndm.display().to_string();
        let in_host = self
            .runner
            .run(&CommandSpec::new(host_binary, ["device", "list"]))
            .map_err(|source| ProbeError::Host {
                probe: probe.clone(),
                source,
            })?;

        debug!(in_pod = %in_pod, in_host = %in_host, "ndm device list output");
        listings_match(&in_host, &in_pod, self.remap)
            .map_err(|source| ProbeError::Mismatch { probe, source })?;
        info!("ndm output OK");
        Ok(())
    }
}

fn parse_tree(probe: &str, side: &'static str, output: &str) -> Result<Value, ProbeError> {
    serde_json::from_str(output).map_err(|source| ProbeError::Parse {
        probe: probe.to_string(),
        side,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::MockCommandRunner;
    use crate::testing::FakeControlPlane;
    use std::sync::Arc;

    const HOST_LSBLK: &str = r#"{"blockdevices": [
        {"name": "sda", "maj:min": "8:0", "rm": false, "size": "50G", "ro": false,
         "type": "disk", "mountpoints": [null],
         "children": [
            {"name": "sda1", "maj:min": "8:1", "rm": false, "size": "49G", "ro": false,
             "type": "part", "mountpoints": ["/"]}
         ]}
    ]}"#;

    fn host_runner(lsblk: &'static str, ndm: &'static str) -> Arc<MockCommandRunner> {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|spec| spec.program == "lsblk")
            .returning(move |_| Ok(lsblk.to_string()));
        runner
            .expect_run()
            .withf(|spec| spec.program.ends_with("/ndm") && spec.args == ["device", "list"])
            .returning(move |_| Ok(ndm.to_string()));
        Arc::new(runner)
    }

    #[test]
    fn test_log_markers() {
        assert!(log_is_healthy("I0101 setup\nI0101 Started controller\n"));
        assert!(log_is_healthy("started the controller"));
        assert!(!log_is_healthy("E0101 failed to list devices"));
    }

    #[tokio::test]
    async fn test_device_tree_matches_remapped_pod_output() {
        let plane = Arc::new(FakeControlPlane::default());
        plane.set_exec("lsblk -J", &HOST_LSBLK.replace(r#"["/"]"#, r#"["/etc/hosts"]"#));

        let runner = host_runner(HOST_LSBLK, "");
        let workload = Workload::new(plane, runner.clone(), "default");
        let remap = MountRemap::default();
        let prober = Prober::new(&workload, runner.as_ref(), &remap);

        prober.device_tree("node-disk-manager-x7k2p").await.unwrap();
    }

    #[tokio::test]
    async fn test_device_tree_mismatch() {
        let plane = Arc::new(FakeControlPlane::default());
        plane.set_exec("lsblk -J", &HOST_LSBLK.replace(r#""size": "50G""#, r#""size": "40G""#));

        let runner = host_runner(HOST_LSBLK, "");
        let workload = Workload::new(plane, runner.clone(), "default");
        let remap = MountRemap::default();
        let prober = Prober::new(&workload, runner.as_ref(), &remap);

        let err = prober.device_tree("node-disk-manager-x7k2p").await.unwrap_err();
        match err {
            ProbeError::Mismatch { source, .. } => assert_eq!(source.path, "blockdevices[0].size"),
            other => panic!("expected mismatch, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_device_tree_rejects_invalid_json() {
        let plane = Arc::new(FakeControlPlane::default());
        plane.set_exec("lsblk -J", "{'blockdevices': None}");

        let runner = host_runner(HOST_LSBLK, "");
        let workload = Workload::new(plane, runner.clone(), "default");
        let remap = MountRemap::default();
        let prober = Prober::new(&workload, runner.as_ref(), &remap);

        let err = prober.device_tree("node-disk-manager-x7k2p").await.unwrap_err();
        assert!(matches!(err, ProbeError::Parse { side: "pod", .. }));
    }

    #[tokio::test]
    async fn test_device_list_ignores_table_layout() {
        let plane = Arc::new(FakeControlPlane::default());
        plane.set_exec(
            "ndm device list",
            "Name  Path      Mountpoint\n----  ----      ----------\nsda1  /dev/sda1 /etc/hosts/boot\n",
        );

        let runner = host_runner(
            "",
            "Name Path Mountpoint\n---- ---- ----------\nsda1 /dev/sda1 /boot\n",
        );
        let workload = Workload::new(plane, runner.clone(), "default");
        let remap = MountRemap::default();
        let prober = Prober::new(&workload, runner.as_ref(), &remap);

        prober
            .device_list(
                "node-disk-manager-x7k2p",
                Path::new("/go/src/github.com/openebs/node-disk-manager/bin/amd64/ndm"),
            )
            .await
            .unwrap();
    }
}
