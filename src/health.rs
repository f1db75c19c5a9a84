//! Preflight checks for `polyrepo doctor`
//!
//! These verify the machine can run workspace operations at all. Per-repository
//! repair (cloning what is missing) lives in [`crate::workspace`].

use std::path::Path;

use crate::auth::DEFAULT_KEY_FILES;
use crate::config::{Config, Workspace};

/// Result of system health checks
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Git installation status
    pub git: CheckResult,
    /// Manifest validity
    pub manifest: CheckResult,
    /// Workspace directory status
    pub workspace_dir: CheckResult,
    /// SSH key presence (warning only)
    pub ssh_keys: CheckResult,
    /// SSH agent reachability (warning only)
    pub ssh_agent: CheckResult,
}

/// Result of an individual health check
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub passed: bool,
    pub message: String,
    pub details: Option<String>,
    pub is_warning: bool,
}

impl CheckResult {
    #[cfg_attr(unix, allow(dead_code))]
    fn ok(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: None,
            is_warning: false,
        }
    }

    fn ok_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn error_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn warning_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: true,
        }
    }
}

impl HealthCheck {
    /// Run all health checks against one workspace
    pub fn run(config: &Config, workspace: &Workspace) -> Self {
        let ssh_dir = dirs::home_dir().unwrap_or_default().join(".ssh");
        Self {
            git: Self::check_git("git"),
            manifest: Self::check_manifest(config),
            workspace_dir: Self::check_workspace_dir(workspace),
            ssh_keys: Self::check_ssh_keys(&ssh_dir),
            ssh_agent: Self::check_ssh_agent(std::env::var_os("SSH_AUTH_SOCK").as_deref().map(Path::new)),
        }
    }

    /// Check if all required checks passed (excludes warnings)
    pub fn all_passed(&self) -> bool {
        self.all_checks().iter().all(|(_, r)| r.passed)
    }

    /// Get list of failed checks (errors only, not warnings)
    pub fn errors(&self) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, r)| r)
            .filter(|r| !r.passed && !r.is_warning)
            .collect()
    }

    /// Get list of warnings
    pub fn warnings(&self) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, r)| r)
            .filter(|r| r.is_warning)
            .collect()
    }

    /// Status falls back to libgit2 alone when this fails, so it is a warning
    fn check_git(program: &str) -> CheckResult {
        match std::process::Command::new(program).arg("--version").output() {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                CheckResult::ok_with_details("Git installed", version.trim().to_string())
            }
            Ok(_) => CheckResult::warning_with_details(
                "Git command failed",
                "Status checks will rely on libgit2 only",
            ),
            Err(_) => CheckResult::warning_with_details(
                "Git not found in PATH",
                "Status checks will rely on libgit2 only. Install git: https://git-scm.com/downloads",
            ),
        }
    }

    fn check_manifest(config: &Config) -> CheckResult {
        match config.validate() {
            Ok(()) => CheckResult::ok_with_details(
                "Manifest is valid",
                config.path.display().to_string(),
            ),
            Err(e) => CheckResult::error_with_details("Manifest is invalid", e.to_string()),
        }
    }

    fn check_workspace_dir(workspace: &Workspace) -> CheckResult {
        let path = match workspace.absolute_path() {
            Ok(path) => path,
            Err(e) => {
                return CheckResult::error_with_details("Invalid workspace path", e.to_string())
            }
        };

        if path.is_dir() {
            CheckResult::ok_with_details("Workspace directory exists", path.display().to_string())
        } else if path.exists() {
            CheckResult::error_with_details(
                "Workspace path is not a directory",
                path.display().to_string(),
            )
        } else {
            // doctor creates it
            CheckResult::warning_with_details(
                "Workspace directory does not exist yet",
                format!("Will be created at {}", path.display()),
            )
        }
    }

    fn check_ssh_keys(ssh_dir: &Path) -> CheckResult {
        if !ssh_dir.exists() {
            return CheckResult::warning_with_details(
                "~/.ssh directory not found",
                "SSH cloning may not work. Run: ssh-keygen -t ed25519",
            );
        }

        let found_keys: Vec<_> = DEFAULT_KEY_FILES
            .iter()
            .filter(|key| ssh_dir.join(key).exists())
            .copied()
            .collect();

        if found_keys.is_empty() {
            CheckResult::warning_with_details(
                "No default SSH keys found",
                format!("Looked for {} in {}", DEFAULT_KEY_FILES.join(", "), ssh_dir.display()),
            )
        } else {
            CheckResult::ok_with_details("SSH keys found", found_keys.join(", "))
        }
    }

    fn check_ssh_agent(socket: Option<&Path>) -> CheckResult {
        let Some(socket) = socket else {
            return CheckResult::warning_with_details(
                "SSH agent not configured",
                "SSH_AUTH_SOCK is not set",
            );
        };

        #[cfg(unix)]
        {
            match std::os::unix::net::UnixStream::connect(socket) {
                Ok(_) => CheckResult::ok_with_details("SSH agent reachable", socket.display().to_string()),
                Err(e) => CheckResult::warning_with_details(
                    "SSH agent not reachable",
                    format!("{}: {}", socket.display(), e),
                ),
            }
        }

        #[cfg(not(unix))]
        {
            CheckResult::ok(format!("SSH agent socket {}", socket.display()))
        }
    }

    /// Get all checks as a slice for iteration
    pub fn all_checks(&self) -> [(&'static str, &CheckResult); 5] {
        [
            ("Git Installation", &self.git),
            ("Manifest", &self.manifest),
            ("Workspace Directory", &self.workspace_dir),
            ("SSH Keys", &self.ssh_keys),
            ("SSH Agent", &self.ssh_agent),
        ]
    }
}
