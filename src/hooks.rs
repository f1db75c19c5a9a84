//! Repository lifecycle hooks
//!
//! Hooks run sequentially inside the repository directory and stop at the
//! first failing command.

use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{HookType, Repository};
use crate::supervisor::run_blocking;
use crate::{Error, Result};

impl HookType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookType::Clone => "clone",
            HookType::Pull => "pull",
            HookType::Push => "push",
            HookType::PrePush => "pre_push",
        }
    }
}

/// Run every `kind` hook of `repository`; returns how many commands ran
pub async fn run_hooks(
    token: &CancellationToken,
    repository: &Repository,
    kind: HookType,
    repo_path: &Path,
) -> Result<usize> {
    let label = format!("{}:{}", repository.display_name(), kind.as_str());
    let mut ran = 0;

    for hook in repository.hooks_of(kind) {
        for command in &hook.commands {
            info!(label = %label, command = %command.name, "Running hook");
            let exit = run_blocking(token, &label, command, repo_path).await?;
            ran += 1;

            if !exit.success {
                warn!(label = %label, command = %command.name, code = ?exit.code, "Hook failed");
                if command.exit_on_error {
                    return Err(Error::CommandFatal {
                        name: command.name.clone(),
                    });
                }
                return Err(Error::Operation(format!(
                    "{} hook {:?} failed with exit code {:?}",
                    kind.as_str(),
                    command.name,
                    exit.code
                )));
            }
        }
    }
    Ok(ran)
}
