//! Operations against the deployed workload that degrade across transports.
//!
//! Apply and exec try the control-plane API first, then `kubectl`, then
//! `kubectl` through `sh -c`. Logs try the API, then `kubectl`. Each
//! transport is attempted once; earlier failures are only logged when a
//! later transport succeeds.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::command::{CommandRunner, CommandSpec};
use crate::control_plane::ControlPlane;

/// A way of reaching the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// The control-plane API through the kube client.
    Api,
    /// The `kubectl` binary.
    Kubectl,
    /// `kubectl` invoked through `sh -c`.
    Shell,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Api => write!(f, "api"),
            Self::Kubectl => write!(f, "kubectl"),
            Self::Shell => write!(f, "shell"),
        }
    }
}

/// One failed transport in a degrade chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFailure {
    pub transport: Transport,
    pub message: String,
}

/// Every transport of a degrade chain failed.
#[derive(Error, Debug)]
#[error("{operation} failed on every transport: {}", render_failures(.failures))]
pub struct ChainError {
    pub operation: String,
    pub failures: Vec<TransportFailure>,
}

fn render_failures(failures: &[TransportFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.transport, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Collects failures while walking a degrade chain.
struct Chain {
    operation: String,
    failures: Vec<TransportFailure>,
}

impl Chain {
    fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            failures: Vec::new(),
        }
    }

    fn failed(&mut self, transport: Transport, error: impl fmt::Display) {
        warn!(
            operation = %self.operation,
            transport = %transport,
            error = %error,
            "Transport failed, falling back"
        );
        self.failures.push(TransportFailure {
            transport,
            message: error.to_string(),
        });
    }

    fn succeeded(&self, transport: Transport) {
        if self.failures.is_empty() {
            debug!(operation = %self.operation, transport = %transport, "Succeeded");
        } else {
            info!(
                operation = %self.operation,
                transport = %transport,
                failed_transports = self.failures.len(),
                "Succeeded after fallback"
            );
        }
    }

    fn exhausted(self) -> ChainError {
        ChainError {
            operation: self.operation,
            failures: self.failures,
        }
    }
}

/// Deploys to and talks with the workload in one namespace.
pub struct Workload {
    control_plane: Arc<dyn ControlPlane>,
    runner: Arc<dyn CommandRunner>,
    namespace: String,
}

impl Workload {
    #[must_use]
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        runner: Arc<dyn CommandRunner>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            control_plane,
            runner,
            namespace: namespace.into(),
        }
    }

    /// Apply the manifest at `path`, returning the transport that worked.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError`] with all three causes if every transport fails.
    pub async fn apply(&self, path: &Path) -> Result<Transport, ChainError> {
        let mut chain = Chain::new(format!("apply {}", path.display()));

        match std::fs::read_to_string(path) {
            Ok(manifest) => match self
                .control_plane
                .apply_manifest(&manifest, &self.namespace)
                .await
            {
                Ok(()) => {
                    chain.succeeded(Transport::Api);
                    return Ok(Transport::Api);
                }
                Err(e) => chain.failed(Transport::Api, e),
            },
            Err(e) => chain.failed(Transport::Api, format!("failed to read manifest: {e}")),
        }

        let path = path.display().to_string();
        let kubectl = CommandSpec::new("kubectl", ["apply", "-f", path.as_str()]);
        self.degrade(chain, kubectl).map(|(transport, _)| transport)
    }

    /// Run `command` inside `pod` and return its standard output.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError`] if every transport fails.
    pub async fn exec(&self, pod: &str, command: &[String]) -> Result<String, ChainError> {
        let mut chain = Chain::new(format!("exec `{}` in {pod}", command.join(" ")));

        match self.control_plane.exec(&self.namespace, pod, command).await {
            Ok(output) => {
                chain.succeeded(Transport::Api);
                return Ok(output);
            }
            Err(e) => chain.failed(Transport::Api, e),
        }

        let mut args = vec![
            "exec".to_string(),
            "-n".to_string(),
            self.namespace.clone(),
            pod.to_string(),
            "--".to_string(),
        ];
        args.extend(command.iter().cloned());
        self.degrade(chain, CommandSpec::new("kubectl", args))
            .map(|(_, output)| output)
    }

    /// Fetch the log of `pod`.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError`] if both the API and `kubectl logs` fail.
    pub async fn logs(&self, pod: &str) -> Result<String, ChainError> {
        let mut chain = Chain::new(format!("logs of {pod}"));

        match self.control_plane.logs(&self.namespace, pod).await {
            Ok(log) => {
                chain.succeeded(Transport::Api);
                return Ok(log);
            }
            Err(e) => chain.failed(Transport::Api, e),
        }

        let kubectl = CommandSpec::new("kubectl", ["-n", self.namespace.as_str(), "logs", pod]);
        match self.runner.run(&kubectl) {
            Ok(log) => {
                chain.succeeded(Transport::Kubectl);
                Ok(log)
            }
            Err(e) => {
                chain.failed(Transport::Kubectl, e);
                Err(chain.exhausted())
            }
        }
    }

    /// Try `kubectl`, then the same command line through `sh -c`.
    fn degrade(
        &self,
        mut chain: Chain,
        kubectl: CommandSpec,
    ) -> Result<(Transport, String), ChainError> {
        match self.runner.run(&kubectl) {
            Ok(out) => {
                chain.succeeded(Transport::Kubectl);
                return Ok((Transport::Kubectl, out));
            }
            Err(e) => chain.failed(Transport::Kubectl, e),
        }

        let line = std::iter::once(kubectl.program.as_str())
            .chain(kubectl.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ");
        match self.runner.run(&CommandSpec::shell(line)) {
            Ok(out) => {
                chain.succeeded(Transport::Shell);
                Ok((Transport::Shell, out))
            }
            Err(e) => {
                chain.failed(Transport::Shell, e);
                Err(chain.exhausted())
            }
        }
    }
}

/// Quote `word` for `sh` unless it only contains safe characters.
fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}
