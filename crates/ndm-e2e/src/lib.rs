//! End-to-end test harness for node-disk-manager.
//!
//! Brings up a single-node minikube cluster with the `none` driver, deploys
//! the locally built node-disk-manager daemon, waits for it to run, and
//! checks that the daemon sees the same block devices from inside its pod
//! as the host does.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ndm_e2e::{Harness, HarnessConfig, KubeConnector, SystemRunner};
//!
//! let runner = Arc::new(SystemRunner::new(config.use_sudo));
//! let harness = Harness::new(config, runner, Arc::new(KubeConnector));
//! if let Err(err) = harness.run().await {
//!     std::process::exit(err.exit_code());
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cluster;
pub mod command;
pub mod compare;
pub mod config;
pub mod control_plane;
pub mod error;
pub mod manifest;
pub mod orchestrator;
pub mod pod;
pub mod probe;
pub mod readiness;
pub mod retry;
pub mod ui;
pub mod validator;
pub mod workload;

#[cfg(test)]
mod testing;

pub use cluster::{ClusterController, ClusterStatus, PostStartOptions};
pub use command::{CommandRunner, CommandSpec, SystemRunner};
pub use compare::{listings_match, trees_match, Mismatch, MountRemap};
pub use config::{Budgets, HarnessConfig, HarnessOptions, RunArgs};
pub use control_plane::{ControlPlane, KubeControlPlane};
pub use error::{CommandError, ControlPlaneError, HarnessError};
pub use orchestrator::{Connector, Harness, KubeConnector, Stage};
pub use pod::{ContainerState, PodPhase, PodSnapshot};
pub use retry::{retry, retry_if, RetryError, RetryPolicy};
