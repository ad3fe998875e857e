//! External command execution.
//!
//! Every host-side collaborator (minikube, docker, kubectl, lsblk, the host
//! `ndm` binary) is driven through the [`CommandRunner`] seam so the
//! components above it can be tested without touching the host.

use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::CommandError;

/// A single command invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program to run.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Run through `sudo` when the runner allows it.
    pub privileged: bool,
}

impl CommandSpec {
    /// Create a command from a program and its arguments.
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            privileged: false,
        }
    }

    /// Run a command line through `sh -c`.
    pub fn shell(command_line: impl Into<String>) -> Self {
        Self::new("sh", ["-c".to_string(), command_line.into()])
    }

    /// Mark the command as requiring elevated privileges.
    #[must_use]
    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    /// Render the command line for logs and error messages.
    #[must_use]
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Runs external commands and returns their standard output.
#[cfg_attr(test, mockall::automock)]
pub trait CommandRunner: Send + Sync {
    /// Run `spec` to completion.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the program cannot be started or exits
    /// unsuccessfully.
    fn run(&self, spec: &CommandSpec) -> Result<String, CommandError>;
}

/// [`CommandRunner`] backed by [`std::process::Command`].
#[derive(Debug, Clone, Copy)]
pub struct SystemRunner {
    use_sudo: bool,
}

impl SystemRunner {
    /// Create a runner. Privileged commands are prefixed with `sudo` only
    /// when `use_sudo` is set.
    #[must_use]
    pub fn new(use_sudo: bool) -> Self {
        Self { use_sudo }
    }

    fn argv(&self, spec: &CommandSpec) -> (String, Vec<String>) {
        if spec.privileged && self.use_sudo {
            let mut args = Vec::with_capacity(spec.args.len() + 1);
            args.push(spec.program.clone());
            args.extend(spec.args.iter().cloned());
            ("sudo".to_string(), args)
        } else {
            (spec.program.clone(), spec.args.clone())
        }
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<String, CommandError> {
        let (program, args) = self.argv(spec);
        let shown = spec.display();
        debug!(command = %shown, sudo = program == "sudo", "Running command");

        let output = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| CommandError::Spawn {
                program: shown.clone(),
                source,
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CommandError::Failed {
                program: shown,
                status: output.status.to_string(),
                stdout,
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_joins_arguments() {
        let spec = CommandSpec::new("docker", ["rm", "-f", "abc123"]);
        assert_eq!(spec.display(), "docker rm -f abc123");
        assert_eq!(CommandSpec::new("lsblk", Vec::<String>::new()).display(), "lsblk");
    }

    #[test]
    fn test_shell_wraps_command_line() {
        let spec = CommandSpec::shell("kubectl apply -f /tmp/x.yaml");
        assert_eq!(spec.program, "sh");
        assert_eq!(spec.args, vec!["-c", "kubectl apply -f /tmp/x.yaml"]);
        assert!(!spec.privileged);
    }

    #[test]
    fn test_sudo_prefix_only_for_privileged_commands() {
        let runner = SystemRunner::new(true);
        let (program, args) = runner.argv(&CommandSpec::new("minikube", ["status"]).privileged());
        assert_eq!(program, "sudo");
        assert_eq!(args, vec!["minikube", "status"]);

        let (program, _) = runner.argv(&CommandSpec::new("lsblk", ["-J"]));
        assert_eq!(program, "lsblk");

        let runner = SystemRunner::new(false);
        let (program, args) = runner.argv(&CommandSpec::new("docker", ["ps", "-aq"]).privileged());
        assert_eq!(program, "docker");
        assert_eq!(args, vec!["ps", "-aq"]);
    }

    #[test]
    fn test_system_runner_captures_output_and_failures() {
        let runner = SystemRunner::new(false);

        let out = runner.run(&CommandSpec::shell("echo hello")).unwrap();
        assert_eq!(out.trim(), "hello");

        let err = runner
            .run(&CommandSpec::shell("echo partial; echo broken >&2; exit 3"))
            .unwrap_err();
        match err {
            CommandError::Failed {
                program,
                stdout,
                stderr,
                ..
            } => {
                assert_eq!(program, "sh -c echo partial; echo broken >&2; exit 3");
                assert_eq!(stdout.trim(), "partial");
                assert_eq!(stderr, "broken");
            }
            other => panic!("expected failure, got {other:?}"),
        }

        let err = runner
            .run(&CommandSpec::new("definitely-not-a-real-binary-ndm", ["x"]))
            .unwrap_err();
        match err {
            CommandError::Spawn { program, .. } => {
                assert_eq!(program, "definitely-not-a-real-binary-ndm x");
            }
            other => panic!("expected spawn error, got {other:?}"),
        }
    }
}
