//! Working tree and branch reconciliation
//!
//! A repository is first checked for uncommitted changes. libgit2 has been
//! seen to report stale changes after some checkout sequences, so a non-empty
//! result is confirmed with `git status --porcelain`; the system binary wins.
//! A dirty tree always reports [`StatusCode::Dirty`] without looking at the
//! branch. Otherwise the current branch is compared with
//! `refs/remotes/<remote>/<branch>` by exact reachability counting.

use git2::{Oid, Repository};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::process::Command;
use tracing::{debug, warn};

use crate::git::changed_paths;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusCode {
    Unknown,
    Missing,
    Error,
    Clean,
    Dirty,
    Unpushed,
    Unpulled,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusCode::Unknown => "unknown",
            StatusCode::Missing => "missing",
            StatusCode::Error => "error",
            StatusCode::Clean => "clean",
            StatusCode::Dirty => "dirty",
            StatusCode::Unpushed => "unpushed",
            StatusCode::Unpulled => "unpulled",
        };
        f.write_str(s)
    }
}

/// Commit divergence between a branch and its remote-tracking reference
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BranchStatus {
    pub ahead: usize,
    pub behind: usize,
    pub needs_push: bool,
    pub needs_pull: bool,
}

impl BranchStatus {
    pub fn from_counts(ahead: usize, behind: usize) -> Self {
        Self {
            ahead,
            behind,
            needs_push: ahead > 0,
            needs_pull: behind > 0,
        }
    }

    pub fn diverged(&self) -> bool {
        self.needs_push && self.needs_pull
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusResult {
    pub code: StatusCode,
    pub message: String,
    pub branch: BranchStatus,
}

impl StatusResult {
    fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            branch: BranchStatus::default(),
        }
    }

    /// Dirty dominates, then diverged (reported dirty), unpushed, unpulled, clean
    fn from_branch(branch: BranchStatus) -> Self {
        let (code, message) = if branch.diverged() {
            (
                StatusCode::Dirty,
                format!("diverged: {} ahead, {} behind", branch.ahead, branch.behind),
            )
        } else if branch.needs_push {
            (StatusCode::Unpushed, format!("{} commit(s) to push", branch.ahead))
        } else if branch.needs_pull {
            (StatusCode::Unpulled, format!("{} commit(s) to pull", branch.behind))
        } else {
            (StatusCode::Clean, "up to date".to_string())
        };
        Self {
            code,
            message,
            branch,
        }
    }
}

/// Computes [`StatusResult`]s; never fails, errors become [`StatusCode::Error`]
#[derive(Debug, Clone)]
pub struct StatusReconciler {
    git_program: Option<String>,
}

impl Default for StatusReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusReconciler {
    /// Confirm dirty results with the `git` found on `PATH`
    pub fn new() -> Self {
        Self {
            git_program: Some("git".to_string()),
        }
    }

    pub fn with_git_program(program: impl Into<String>) -> Self {
        Self {
            git_program: Some(program.into()),
        }
    }

    /// Trust libgit2 alone
    pub fn embedded_only() -> Self {
        Self { git_program: None }
    }

    /// Working-tree state only
    pub fn status(&self, path: &Path) -> StatusResult {
        self.reconcile_or_error(path, None)
    }

    /// Working-tree state, then divergence from `remote`'s copy of the current branch
    pub fn status_with_remote(&self, path: &Path, remote: &str) -> StatusResult {
        self.reconcile_or_error(path, Some(remote))
    }

    fn reconcile_or_error(&self, path: &Path, remote: Option<&str>) -> StatusResult {
        match self.reconcile(path, remote) {
            Ok(result) => result,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Status check failed");
                StatusResult::new(StatusCode::Error, e.to_string())
            }
        }
    }

    fn reconcile(&self, path: &Path, remote: Option<&str>) -> Result<StatusResult> {
        if !path.exists() {
            return Ok(StatusResult::new(StatusCode::Missing, "not cloned"));
        }

        let repo = Repository::open(path)?;
        let changed = changed_paths(&repo)?;
        if !changed.is_empty() && self.confirm_dirty(path, changed.len()) {
            return Ok(StatusResult::new(
                StatusCode::Dirty,
                format!("{} uncommitted change(s)", changed.len()),
            ));
        }

        let Some(remote) = remote else {
            return Ok(StatusResult::new(StatusCode::Clean, "working tree clean"));
        };

        Ok(match branch_divergence(&repo, path, remote)? {
            Divergence::Branch(branch) => StatusResult::from_branch(branch),
            Divergence::NotTracked(message) => StatusResult::new(StatusCode::Clean, message),
        })
    }

    /// Ahead/behind of the current branch against `remote`, ignoring the worktree
    ///
    /// Unborn and detached heads have nothing to compare and yield zero counts.
    pub fn divergence(&self, path: &Path, remote: &str) -> Result<BranchStatus> {
        let repo = Repository::open(path)?;
        Ok(match branch_divergence(&repo, path, remote)? {
            Divergence::Branch(branch) => branch,
            Divergence::NotTracked(_) => BranchStatus::default(),
        })
    }

    /// Ask the system git whether the tree really is dirty
    fn confirm_dirty(&self, path: &Path, embedded_changes: usize) -> bool {
        let Some(program) = &self.git_program else {
            return true;
        };

        let output = Command::new(program)
            .arg("-C")
            .arg(path)
            .args(["status", "--porcelain"])
            .env("GIT_OPTIONAL_LOCKS", "0")
            .output();

        match output {
            Ok(output) if output.status.success() => {
                let clean = String::from_utf8_lossy(&output.stdout).trim().is_empty();
                if clean {
                    warn!(
                        path = %path.display(),
                        embedded_changes,
                        "libgit2 reports changes but git status is clean; treating as clean"
                    );
                }
                !clean
            }
            Ok(output) => {
                debug!(path = %path.display(), status = %output.status, "git status failed, keeping libgit2 result");
                true
            }
            Err(e) => {
                warn!(error = %e, "git binary unavailable, keeping libgit2 result");
                true
            }
        }
    }
}

enum Divergence {
    Branch(BranchStatus),
    /// Unborn or detached HEAD
    NotTracked(&'static str),
}

fn branch_divergence(repo: &Repository, path: &Path, remote: &str) -> Result<Divergence> {
    let head = match repo.head() {
        Ok(head) => head,
        Err(e) if e.code() == git2::ErrorCode::UnbornBranch => {
            return Ok(Divergence::NotTracked("no commits yet"));
        }
        Err(e) => return Err(e.into()),
    };
    if !head.is_branch() {
        return Ok(Divergence::NotTracked("detached HEAD"));
    }

    let branch = head.shorthand().unwrap_or_default().to_string();
    let local = head.peel_to_commit()?.id();
    let tracking = format!("refs/remotes/{}/{}", remote, branch);

    let status = match repo.refname_to_id(&tracking) {
        Ok(upstream) if upstream == local => BranchStatus::default(),
        Ok(upstream) => {
            let (ahead, behind) = count_divergence(repo, local, upstream)?;
            BranchStatus::from_counts(ahead, behind)
        }
        Err(_) => {
            debug!(path = %path.display(), tracking = %tracking, "No remote-tracking branch");
            BranchStatus::from_counts(count_reachable(repo, local)?, 0)
        }
    };
    Ok(Divergence::Branch(status))
}

/// Commits reachable from `a` but not `b`, and from `b` but not `a`
pub fn count_divergence(repo: &Repository, a: Oid, b: Oid) -> Result<(usize, usize)> {
    Ok((count_range(repo, a, b)?, count_range(repo, b, a)?))
}

fn count_range(repo: &Repository, from: Oid, exclude: Oid) -> Result<usize> {
    let mut walk = repo.revwalk()?;
    walk.push(from)?;
    walk.hide(exclude)?;
    let mut count = 0;
    for oid in walk {
        oid?;
        count += 1;
    }
    Ok(count)
}

fn count_reachable(repo: &Repository, from: Oid) -> Result<usize> {
    let mut walk = repo.revwalk()?;
    walk.push(from)?;
    let mut count = 0;
    for oid in walk {
        oid?;
        count += 1;
    }
    Ok(count)
}
