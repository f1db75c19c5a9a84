//! libgit2-backed repository operations
//!
//! Every network call resolves credentials through [`AuthResolver`] and runs on
//! the blocking pool. Pulls only ever fast-forward.

use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{
    AutotagOption, BranchType, FetchOptions, FetchPrune, IndexAddOption, PushOptions, Repository, Signature,
    StatusOptions,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::auth::{remote_callbacks, AuthMethod, AuthResolver};
use crate::config::Auth;
use crate::{Error, Result};

/// Git operations backed by libgit2, authenticating every network call afresh
#[derive(Clone)]
pub struct GitClient {
    resolver: Arc<AuthResolver>,
}

/// Result of a pull
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    UpToDate,
    FastForwarded { from: Option<String>, to: String },
}

/// Result of a commit that recorded changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    pub hash: String,
    pub changed: Vec<String>,
}

impl Default for GitClient {
    fn default() -> Self {
        Self::new()
    }
}

impl GitClient {
    pub fn new() -> Self {
        Self::with_resolver(AuthResolver::new())
    }

    pub fn with_resolver(resolver: AuthResolver) -> Self {
        Self {
            resolver: Arc::new(resolver),
        }
    }

    pub fn resolver(&self) -> &AuthResolver {
        &self.resolver
    }

    /// Clone `url` into `path`; a failed clone leaves no directory behind
    pub async fn clone_repository(
        &self,
        url: &str,
        path: &Path,
        branch: Option<&str>,
        auth: Option<&Auth>,
    ) -> Result<()> {
        if path.exists() && !is_empty_dir(path) {
            return Err(Error::Operation(format!(
                "cannot clone into {}: directory is not empty",
                path.display()
            )));
        }
        let existed = path.exists();
        let method = self.resolver.resolve(url, auth).await?;

        info!(url, path = %path.display(), "Cloning repository");

        let url_owned = url.to_string();
        let target = path.to_path_buf();
        let branch = branch.map(str::to_string);
        let result = blocking(move || {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::io(format!("creating {}", parent.display()), e))?;
            }
            let mut builder = RepoBuilder::new();
            builder.fetch_options(fetch_options(&method));
            if let Some(branch) = &branch {
                builder.branch(branch);
            }
            builder.clone(&url_owned, &target)?;
            Ok(())
        })
        .await;

        if let Err(e) = &result {
            warn!(url, path = %path.display(), error = %e, "Clone failed, cleaning up");
            if !existed && path.exists() {
                if let Err(cleanup) = tokio::fs::remove_dir_all(path).await {
                    warn!(path = %path.display(), error = %cleanup, "Failed to remove partial clone");
                }
            }
        }
        result
    }

    /// Fetch `remote`, updating its remote-tracking references
    pub async fn fetch(&self, path: &Path, remote: &str, auth: Option<&Auth>) -> Result<()> {
        let url = remote_url(path, remote)?;
        let method = self.resolver.resolve(&url, auth).await?;

        let path = path.to_path_buf();
        let remote = remote.to_string();
        blocking(move || {
            let repo = Repository::open(&path)?;
            fetch_remote(&repo, &remote, &method)
        })
        .await
    }

    /// Fetch then fast-forward the current branch onto its remote counterpart
    pub async fn pull(&self, path: &Path, remote: &str, auth: Option<&Auth>) -> Result<PullOutcome> {
        let url = remote_url(path, remote)?;
        let method = self.resolver.resolve(&url, auth).await?;

        let path = path.to_path_buf();
        let remote = remote.to_string();
        blocking(move || {
            let repo = Repository::open(&path)?;
            fetch_remote(&repo, &remote, &method)?;
            fast_forward(&repo, &remote)
        })
        .await
    }

    /// Push the current branch to the same-named branch on `remote`
    pub async fn push(&self, path: &Path, remote: &str, auth: Option<&Auth>) -> Result<()> {
        let url = remote_url(path, remote)?;
        let method = self.resolver.resolve(&url, auth).await?;

        let path = path.to_path_buf();
        let remote_name = remote.to_string();
        blocking(move || {
            let repo = Repository::open(&path)?;
            let branch = current_branch(&repo)?.ok_or_else(|| {
                Error::Operation(format!("{}: HEAD is not on a branch", path.display()))
            })?;
            let refspec = format!("refs/heads/{0}:refs/heads/{0}", branch);

            let mut callbacks = remote_callbacks(&method);
            callbacks.push_update_reference(|refname, status| match status {
                Some(message) => Err(git2::Error::from_str(&format!(
                    "push of {} rejected: {}",
                    refname, message
                ))),
                None => Ok(()),
            });
            let mut options = PushOptions::new();
            options.remote_callbacks(callbacks);

            let mut remote = repo.find_remote(&remote_name)?;
            remote.push(&[refspec.as_str()], Some(&mut options))?;
            debug!(path = %path.display(), branch = %branch, remote = %remote_name, "Pushed");
            Ok(())
        })
        .await
    }

    /// Stage everything and commit; `None` when the working tree has no changes
    pub async fn commit(&self, path: &Path, message: &str) -> Result<Option<CommitOutcome>> {
        let path = path.to_path_buf();
        let message = message.to_string();
        blocking(move || {
            let repo = Repository::open(&path)?;
            let changed = changed_paths(&repo)?;
            if changed.is_empty() {
                return Ok(None);
            }

            let mut index = repo.index()?;
            index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
            index.update_all(["*"].iter(), None)?;
            index.write()?;
            let tree = repo.find_tree(index.write_tree()?)?;

            let signature = signature(&repo)?;
            let parent = match repo.head() {
                Ok(head) => Some(head.peel_to_commit()?),
                Err(e) if e.code() == git2::ErrorCode::UnbornBranch => None,
                Err(e) => return Err(e.into()),
            };
            let parents: Vec<&git2::Commit> = parent.iter().collect();

            let oid = repo.commit(Some("HEAD"), &signature, &signature, &message, &tree, &parents)?;
            Ok(Some(CommitOutcome {
                hash: oid.to_string(),
                changed,
            }))
        })
        .await
    }

    /// Check out `branch`, creating it from `remote/branch` or HEAD when missing locally
    pub async fn switch(&self, path: &Path, branch: &str, remote: &str) -> Result<()> {
        let path = path.to_path_buf();
        let branch = branch.to_string();
        let remote = remote.to_string();
        blocking(move || {
            let repo = Repository::open(&path)?;
            let refname = format!("refs/heads/{}", branch);

            if repo.find_branch(&branch, BranchType::Local).is_err() {
                let tracking = format!("{}/{}", remote, branch);
                match repo.find_branch(&tracking, BranchType::Remote) {
                    Ok(remote_branch) => {
                        let commit = remote_branch.get().peel_to_commit()?;
                        let mut local = repo.branch(&branch, &commit, false)?;
                        local.set_upstream(Some(&tracking))?;
                    }
                    Err(_) => {
                        let commit = repo.head()?.peel_to_commit()?;
                        repo.branch(&branch, &commit, false)?;
                    }
                }
            }

            let target = repo.revparse_single(&refname)?;
            repo.checkout_tree(&target, Some(CheckoutBuilder::new().safe()))?;
            repo.set_head(&refname)?;
            Ok(())
        })
        .await
    }

    /// Names of configured remotes
    pub fn remotes(&self, path: &Path) -> Result<Vec<String>> {
        let repo = Repository::open(path)?;
        let remotes = repo.remotes()?;
        Ok(remotes.iter().flatten().map(str::to_string).collect())
    }

    /// Upstream of the current branch, else the only remote, else `origin`, else the first
    pub fn default_remote(&self, path: &Path) -> Result<Option<String>> {
        let repo = Repository::open(path)?;

        if let Some(branch) = current_branch(&repo)? {
            if let Ok(remote) = repo.branch_upstream_remote(&format!("refs/heads/{}", branch)) {
                if let Some(name) = remote.as_str() {
                    return Ok(Some(name.to_string()));
                }
            }
        }

        let remotes = self.remotes(path)?;
        Ok(match remotes.as_slice() {
            [] => None,
            [only] => Some(only.clone()),
            many => many
                .iter()
                .find(|r| r.as_str() == "origin")
                .or_else(|| many.first())
                .cloned(),
        })
    }
}

pub fn is_repository(path: &Path) -> bool {
    Repository::open(path).is_ok()
}

/// Kind of change recorded for one path in the working tree or index
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Renamed,
    TypeChange,
    Untracked,
    Conflicted,
}

impl ChangeKind {
    fn from_status(status: git2::Status) -> Option<Self> {
        use git2::Status;

        if status.is_conflicted() {
            Some(ChangeKind::Conflicted)
        } else if status.is_wt_new() {
            Some(ChangeKind::Untracked)
        } else if status.intersects(Status::INDEX_NEW) {
            Some(ChangeKind::Added)
        } else if status.intersects(Status::INDEX_DELETED | Status::WT_DELETED) {
            Some(ChangeKind::Deleted)
        } else if status.intersects(Status::INDEX_RENAMED | Status::WT_RENAMED) {
            Some(ChangeKind::Renamed)
        } else if status.intersects(Status::INDEX_TYPECHANGE | Status::WT_TYPECHANGE) {
            Some(ChangeKind::TypeChange)
        } else if status.intersects(Status::INDEX_MODIFIED | Status::WT_MODIFIED) {
            Some(ChangeKind::Modified)
        } else {
            None
        }
    }
}

/// Uncommitted changes, untracked files included, ignored files excluded
pub fn worktree_changes(repo: &Repository) -> Result<Vec<(String, ChangeKind)>> {
    let mut options = StatusOptions::new();
    options
        .include_untracked(true)
        .recurse_untracked_dirs(true)
        .include_ignored(false);

    let statuses = repo.statuses(Some(&mut options))?;
    Ok(statuses
        .iter()
        .filter_map(|entry| {
            let kind = ChangeKind::from_status(entry.status())?;
            entry.path().map(|path| (path.to_string(), kind))
        })
        .collect())
}

pub fn changed_paths(repo: &Repository) -> Result<Vec<String>> {
    Ok(worktree_changes(repo)?
        .into_iter()
        .map(|(path, _)| path)
        .collect())
}

/// Short name of the checked-out branch; `None` when HEAD is detached or unborn
pub fn current_branch(repo: &Repository) -> Result<Option<String>> {
    match repo.head() {
        Ok(head) if head.is_branch() => Ok(head.shorthand().map(str::to_string)),
        Ok(_) => Ok(None),
        Err(e) if e.code() == git2::ErrorCode::UnbornBranch => {
            let head = repo.find_reference("HEAD")?;
            Ok(head
                .symbolic_target()
                .and_then(|t| t.strip_prefix("refs/heads/"))
                .map(str::to_string))
        }
        Err(e) => Err(e.into()),
    }
}

fn remote_url(path: &Path, remote: &str) -> Result<String> {
    let repo = Repository::open(path)?;
    let remote_ref = repo.find_remote(remote)?;
    remote_ref
        .url()
        .map(str::to_string)
        .ok_or_else(|| Error::Operation(format!("remote {:?} has no URL", remote)))
}

fn fetch_options(method: &AuthMethod) -> FetchOptions<'_> {
    let mut options = FetchOptions::new();
    options.remote_callbacks(remote_callbacks(method));
    options
}

fn fetch_remote(repo: &Repository, remote: &str, method: &AuthMethod) -> Result<()> {
    let mut remote_ref = repo.find_remote(remote)?;
    let mut options = fetch_options(method);
    options.download_tags(AutotagOption::All);
    options.prune(FetchPrune::On);
    remote_ref.fetch(&[] as &[&str], Some(&mut options), None)?;
    Ok(())
}

fn fast_forward(repo: &Repository, remote: &str) -> Result<PullOutcome> {
    let branch = current_branch(repo)?
        .ok_or_else(|| Error::Operation("HEAD is not on a branch".to_string()))?;
    let tracking = match repo.find_reference(&format!("refs/remotes/{}/{}", remote, branch)) {
        Ok(reference) => reference,
        Err(_) => {
            debug!(branch = %branch, remote, "No remote-tracking branch, nothing to pull");
            return Ok(PullOutcome::UpToDate);
        }
    };
    let incoming = repo.reference_to_annotated_commit(&tracking)?;
    let (analysis, _) = repo.merge_analysis(&[&incoming])?;

    let refname = format!("refs/heads/{}", branch);
    let to = incoming.id().to_string();

    if analysis.is_up_to_date() {
        Ok(PullOutcome::UpToDate)
    } else if analysis.is_unborn() {
        repo.reference(&refname, incoming.id(), true, "pull: initial")?;
        repo.set_head(&refname)?;
        repo.checkout_head(Some(CheckoutBuilder::default().force()))?;
        Ok(PullOutcome::FastForwarded { from: None, to })
    } else if analysis.is_fast_forward() {
        let mut local = repo.find_reference(&refname)?;
        let from = local.target().map(|oid| oid.to_string());
        // worktree first; HEAD must still name the old tree for checkout to diff against
        let target = repo.find_object(incoming.id(), None)?;
        repo.checkout_tree(&target, Some(CheckoutBuilder::default().safe()))?;
        local.set_target(incoming.id(), "pull: fast-forward")?;
        repo.set_head(&refname)?;
        Ok(PullOutcome::FastForwarded { from, to })
    } else {
        Err(Error::Operation(format!(
            "{} and {}/{} have diverged; fast-forward impossible",
            branch, remote, branch
        )))
    }
}

/// Author from git config, else `$USER@<hostname>`
fn signature(repo: &Repository) -> Result<Signature<'static>> {
    if let Ok(signature) = repo.signature() {
        return Ok(signature.to_owned());
    }
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "polyrepo".to_string());
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    Ok(Signature::now(&user, &format!("{}@{}", user, host))?)
}

fn is_empty_dir(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Operation(format!("git task failed: {}", e)))?
}
