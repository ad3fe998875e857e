use std::path::{Path, PathBuf};

use anyhow::Result;
use colored::Colorize;

use crate::ui;

/// Validates host prerequisites for an end-to-end run
pub struct PrerequisitesValidator {
    requirements: Vec<Requirement>,
}

struct Requirement {
    name: String,
    check: Box<dyn Fn() -> bool>,
    install_instructions: String,
    critical: bool,
}

impl Requirement {
    fn tool(name: &str, install_instructions: &str, critical: bool) -> Self {
        let binary = name.to_string();
        Self {
            name: name.to_string(),
            check: Box::new(move || which::which(&binary).is_ok()),
            install_instructions: install_instructions.to_string(),
            critical,
        }
    }

    fn file(name: &str, path: PathBuf, install_instructions: &str, critical: bool) -> Self {
        Self {
            name: format!("{name} ({})", path.display()),
            check: Box::new(move || path.is_file()),
            install_instructions: install_instructions.to_string(),
            critical,
        }
    }
}

impl PrerequisitesValidator {
    pub fn new(host_ndm: &Path) -> Self {
        let requirements = vec![
            Requirement::tool(
                "minikube",
                "Install minikube from https://minikube.sigs.k8s.io/docs/start/",
                true,
            ),
            Requirement::tool(
                "kubectl",
                "Install kubectl from https://kubernetes.io/docs/tasks/tools/",
                true,
            ),
            Requirement::tool("docker", "Install Docker from https://docker.com", true),
            Requirement::tool("lsblk", "Install util-linux", true),
            Requirement::tool("sh", "A POSIX shell is required", true),
            // Only needed when the image tag is not given explicitly.
            Requirement::tool("git", "Install git or pass --tag", false),
            Requirement::file(
                "host ndm binary",
                host_ndm.to_path_buf(),
                "Build it with `make` in the node-disk-manager checkout",
                false,
            ),
        ];

        Self { requirements }
    }

    pub fn validate(&self) -> Result<()> {
        let mut failures = Vec::new();

        for requirement in &self.requirements {
            let passed = (requirement.check)();
            ui::print_check_result(&requirement.name, passed, None);
            if !passed {
                failures.push(requirement);
            }
        }

        println!();

        if failures.is_empty() {
            ui::print_success("All prerequisites met!");
            return Ok(());
        }

        ui::print_warning("Some prerequisites are not met:");
        for failure in &failures {
            if failure.critical {
                println!(
                    "  {} {} - {}",
                    "✗".red(),
                    failure.name.red(),
                    failure.install_instructions.bright_black()
                );
            } else {
                println!(
                    "  {} {} - {}",
                    "⚠".yellow(),
                    failure.name.yellow(),
                    failure.install_instructions.bright_black()
                );
            }
        }
        println!();

        let missing: Vec<&str> = failures
            .iter()
            .filter(|f| f.critical)
            .map(|f| f.name.as_str())
            .collect();
        if !missing.is_empty() {
            anyhow::bail!("Critical prerequisites not met: {}", missing.join(", "));
        }

        Ok(())
    }
}
