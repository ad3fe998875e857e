//! Polls the workload pod until its container runs.
//!
//! Each poll fetches a fresh [`PodSnapshot`] and classifies it:
//!
//! - a terminated container is fatal, a crash during startup is not a delay
//! - a container waiting for a transient or healthy-soon reason is retried
//! - a container waiting for any other reason is fatal
//! - without container state the pod phase decides; `Failed` is fatal
//! - a running container ends the wait
//!
//! A missing pod and a "not found" API error are transient. Any other API
//! error is fatal. Exhausting the attempt budget is fatal as well.

use std::fmt;

use thiserror::Error;
use tracing::info;

use crate::control_plane::ControlPlane;
use crate::error::ControlPlaneError;
use crate::pod::{ContainerState, PodPhase, PodSnapshot};
use crate::retry::{retry_if, RetryError, RetryPolicy};

/// Waiting reasons that resolve on their own.
pub const TRANSIENT_REASONS: &[&str] = &["ContainerCreating", "Pending"];

/// Waiting reasons that mean the container is about to run.
pub const HEALTHY_SOON_REASONS: &[&str] = &["Running"];

/// Why the workload will never become ready.
#[derive(Error, Debug)]
pub enum ReadinessError {
    #[error("pod {pod} terminated with exit code {exit_code}: {}", describe(.reason, .message))]
    Terminated {
        pod: String,
        reason: Option<String>,
        message: Option<String>,
        exit_code: i32,
    },

    #[error("pod {pod} is waiting with reason {reason}: {message}")]
    BadState {
        pod: String,
        reason: String,
        message: String,
    },

    #[error("pod {pod} is in bad phase {phase}")]
    BadPhase { pod: String, phase: PodPhase },

    #[error("failed to query pod: {0}")]
    Query(#[source] ControlPlaneError),

    #[error("pod with prefix {prefix:?} not running after {attempts} attempts, last seen: {last}")]
    Exhausted {
        prefix: String,
        attempts: u32,
        last: String,
    },
}

fn describe(reason: &Option<String>, message: &Option<String>) -> String {
    match (reason, message) {
        (Some(r), Some(m)) => format!("{r} ({m})"),
        (Some(r), None) => r.clone(),
        (None, Some(m)) => m.clone(),
        (None, None) => "no reason reported".to_string(),
    }
}

/// Outcome of classifying one snapshot.
#[derive(Debug)]
pub enum Verdict {
    /// The container is running.
    Ready,
    /// Not ready yet; the description says why.
    Wait(String),
    /// The workload will not become ready.
    Fatal(ReadinessError),
}

/// Classify a pod snapshot.
#[must_use]
pub fn classify(pod: &PodSnapshot) -> Verdict {
    match &pod.container {
        Some(ContainerState::Running) => Verdict::Ready,
        Some(ContainerState::Terminated {
            reason,
            message,
            exit_code,
        }) => Verdict::Fatal(ReadinessError::Terminated {
            pod: pod.name.clone(),
            reason: reason.clone(),
            message: message.clone(),
            exit_code: *exit_code,
        }),
        Some(ContainerState::Waiting { reason: None, .. }) => {
            Verdict::Wait("container waiting without a reason".into())
        }
        Some(ContainerState::Waiting {
            reason: Some(reason),
            message,
        }) => {
            let reason = reason.as_str();
            if TRANSIENT_REASONS.contains(&reason) || HEALTHY_SOON_REASONS.contains(&reason) {
                Verdict::Wait(format!("container state {reason}"))
            } else {
                Verdict::Fatal(ReadinessError::BadState {
                    pod: pod.name.clone(),
                    reason: reason.to_string(),
                    message: message.clone().unwrap_or_default(),
                })
            }
        }
        None => match &pod.phase {
            PodPhase::Failed => Verdict::Fatal(ReadinessError::BadPhase {
                pod: pod.name.clone(),
                phase: pod.phase.clone(),
            }),
            phase => Verdict::Wait(format!("pod phase {phase}")),
        },
    }
}

/// A poll that did not end the wait.
enum PollError {
    Pending(String),
    Fatal(ReadinessError),
}

impl fmt::Display for PollError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending(why) => write!(f, "{why}"),
            Self::Fatal(e) => write!(f, "{e}"),
        }
    }
}

/// Watches the workload pod identified by name prefix.
pub struct ReadinessMonitor<'a> {
    control_plane: &'a dyn ControlPlane,
    namespace: &'a str,
    prefix: &'a str,
}

impl<'a> ReadinessMonitor<'a> {
    #[must_use]
    pub fn new(control_plane: &'a dyn ControlPlane, namespace: &'a str, prefix: &'a str) -> Self {
        Self {
            control_plane,
            namespace,
            prefix,
        }
    }

    /// Poll under `policy` until the pod's container is running.
    ///
    /// # Errors
    ///
    /// Returns [`ReadinessError`] for a fatal pod state, a fatal query
    /// error, or when the attempt budget runs out.
    pub async fn wait_until_ready(&self, policy: RetryPolicy) -> Result<PodSnapshot, ReadinessError> {
        let result = retry_if(
            policy,
            "wait for pod",
            || async { self.poll_once().await },
            |e| matches!(e, PollError::Pending(_)),
        )
        .await;

        match result {
            Ok(pod) => {
                info!(pod = %pod.name, "Pod is up");
                Ok(pod)
            }
            Err(RetryError::Fatal {
                error: PollError::Fatal(e),
                ..
            }) => Err(e),
            Err(RetryError::Exhausted { attempts, last, .. }) => Err(ReadinessError::Exhausted {
                prefix: self.prefix.to_string(),
                attempts,
                last: last.to_string(),
            }),
            Err(RetryError::Fatal { error, .. }) => Err(ReadinessError::Exhausted {
                prefix: self.prefix.to_string(),
                attempts: policy.max_attempts(),
                last: error.to_string(),
            }),
        }
    }

    async fn poll_once(&self) -> Result<PodSnapshot, PollError> {
        match self.control_plane.find_pod(self.namespace, self.prefix).await {
            Ok(Some(pod)) => match classify(&pod) {
                Verdict::Ready => Ok(pod),
                Verdict::Wait(why) => {
                    info!(pod = %pod.name, state = %why, "Waiting for pod");
                    Err(PollError::Pending(why))
                }
                Verdict::Fatal(e) => Err(PollError::Fatal(e)),
            },
            Ok(None) => Err(PollError::Pending(format!(
                "no pod with prefix {:?} in namespace {}",
                self.prefix, self.namespace
            ))),
            Err(e) if e.is_not_found() => {
                info!(error = %e, "Pod not found yet");
                Err(PollError::Pending(e.to_string()))
            }
            Err(e) => Err(PollError::Fatal(ReadinessError::Query(e))),
        }
    }
}
