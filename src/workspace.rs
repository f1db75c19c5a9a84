//! Workspace orchestration
//!
//! Runs one operation (sync, pull, push, commit, switch, status, doctor) over
//! every selected repository of a workspace with bounded concurrency. A failing
//! repository never stops its siblings; every outcome lands in the returned
//! [`OperationSummary`].

use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{HookType, Repository, SyncSettings, Workspace};
use crate::git::{is_repository, GitClient, PullOutcome};
use crate::hooks::run_hooks;
use crate::status::{BranchStatus, StatusCode, StatusReconciler, StatusResult};
use crate::watch::WatchCoordinator;
use crate::{Error, Result};

/// What happened to one repository
#[derive(Debug, Clone, PartialEq)]
pub enum RepoOutcome {
    Cloned,
    Pulled { commit: String },
    UpToDate,
    Pushed,
    Committed { hash: String, changed: usize },
    Switched { branch: String },
    Status(StatusResult),
    Skipped { reason: String },
    Failed { error: String, fatal: bool },
}

impl RepoOutcome {
    fn failed(error: &Error) -> Self {
        RepoOutcome::Failed {
            error: error.to_string(),
            fatal: error.is_fatal(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepoResult {
    pub name: String,
    pub path: PathBuf,
    pub outcome: RepoOutcome,
}

/// Results from one workspace-wide operation
#[derive(Debug, Clone)]
pub struct OperationSummary {
    pub operation: &'static str,
    pub total: usize,
    pub successful: usize,
    pub skipped: usize,
    pub failed: usize,
    pub duration: Duration,
    pub results: Vec<RepoResult>,
}

impl OperationSummary {
    fn compile(operation: &'static str, mut results: Vec<RepoResult>, duration: Duration) -> Self {
        results.sort_by(|a, b| a.path.cmp(&b.path));

        let mut successful = 0;
        let mut skipped = 0;
        let mut failed = 0;
        for result in &results {
            match &result.outcome {
                RepoOutcome::Skipped { .. } => skipped += 1,
                RepoOutcome::Failed { .. } => failed += 1,
                RepoOutcome::Status(status) if status.code == StatusCode::Error => failed += 1,
                _ => successful += 1,
            }
        }

        Self {
            operation,
            total: results.len(),
            successful,
            skipped,
            failed,
            duration,
            results,
        }
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    /// A configuration-class failure (bad credentials config, fatal hook)
    pub fn has_fatal(&self) -> bool {
        self.results
            .iter()
            .any(|r| matches!(r.outcome, RepoOutcome::Failed { fatal: true, .. }))
    }

    pub fn failures(&self) -> impl Iterator<Item = &RepoResult> {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, RepoOutcome::Failed { .. }))
    }
}

/// Operates on the repositories of one workspace
#[derive(Clone)]
pub struct WorkspaceManager {
    workspace: Arc<Workspace>,
    settings: SyncSettings,
    git: GitClient,
    reconciler: StatusReconciler,
    token: CancellationToken,
}

impl WorkspaceManager {
    pub fn new(workspace: Workspace, settings: SyncSettings) -> Self {
        Self {
            workspace: Arc::new(workspace),
            settings,
            git: GitClient::new(),
            reconciler: StatusReconciler::new(),
            token: CancellationToken::new(),
        }
    }

    pub fn with_git(mut self, git: GitClient) -> Self {
        self.git = git;
        self
    }

    pub fn with_reconciler(mut self, reconciler: StatusReconciler) -> Self {
        self.reconciler = reconciler;
        self
    }

    /// Cancelling `token` kills running hooks
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Clone missing repositories and fast-forward clean existing ones
    pub async fn sync(&self, tags: &[String]) -> Result<OperationSummary> {
        self.ensure_root().await?;
        self.for_each("sync", tags, |repo, path| self.sync_one(repo, path))
            .await
    }

    pub async fn pull(&self, tags: &[String]) -> Result<OperationSummary> {
        self.for_each("pull", tags, |repo, path| self.pull_one(repo, path))
            .await
    }

    /// Push each repository's current branch, after its pre_push hooks pass
    pub async fn push(&self, tags: &[String]) -> Result<OperationSummary> {
        self.for_each("push", tags, |repo, path| self.push_one(repo, path))
            .await
    }

    pub async fn commit(&self, tags: &[String], message: &str) -> Result<OperationSummary> {
        self.for_each("commit", tags, |repo, path| self.commit_one(repo, path, message))
            .await
    }

    pub async fn switch(&self, tags: &[String], branch: &str) -> Result<OperationSummary> {
        self.for_each("switch", tags, |repo, path| self.switch_one(repo, path, branch))
            .await
    }

    pub async fn status(&self, tags: &[String]) -> Result<OperationSummary> {
        self.for_each("status", tags, |repo, path| self.status_one(repo, path))
            .await
    }

    /// Make the workspace whole: create its directory and clone what is missing
    pub async fn doctor(&self, tags: &[String]) -> Result<OperationSummary> {
        self.ensure_root().await?;
        self.for_each("doctor", tags, |repo, path| self.doctor_one(repo, path))
            .await
    }

    /// Run every runner of every selected repository until `shutdown` fires
    ///
    /// The first fatal runner error cancels all the others and is returned.
    pub async fn watch_all(&self, tags: &[String], shutdown: CancellationToken) -> Result<()> {
        let mut coordinators = Vec::new();
        for repo in self.workspace.repositories_tagged(tags) {
            let repo_path = match self.workspace.repository_path(repo) {
                Ok(path) => path,
                Err(e) => {
                    error!(repository = repo.display_name(), error = %e, "Cannot resolve checkout path, not watching");
                    continue;
                }
            };
            for runner in &repo.runners {
                let label = if runner.name.is_empty() {
                    repo.display_name().to_string()
                } else {
                    format!("{}/{}", repo.display_name(), runner.name)
                };
                coordinators.push(WatchCoordinator::new(label, &repo_path, runner.clone())?);
            }
        }

        if coordinators.is_empty() {
            warn!(workspace = %self.workspace.name, "No runners configured");
            return Ok(());
        }
        info!(workspace = %self.workspace.name, runners = coordinators.len(), "Starting runners");

        let mut running: FuturesUnordered<_> = coordinators
            .into_iter()
            .map(|coordinator| coordinator.run(shutdown.clone()))
            .collect();

        let mut first_error = None;
        while let Some(result) = running.next().await {
            if let Err(e) = result {
                error!(error = %e, "Runner stopped with an error");
                if first_error.is_none() && e.is_fatal() {
                    shutdown.cancel();
                }
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn for_each<'a, F, Fut>(
        &'a self,
        operation: &'static str,
        tags: &[String],
        op: F,
    ) -> Result<OperationSummary>
    where
        F: Fn(&'a Repository, PathBuf) -> Fut,
        Fut: Future<Output = Result<RepoOutcome>> + 'a,
    {
        let start = Instant::now();
        let repositories = self.workspace.repositories_tagged(tags);
        info!(
            operation,
            workspace = %self.workspace.name,
            repositories = repositories.len(),
            max_parallel = self.settings.max_parallel,
            "Starting workspace operation"
        );

        let semaphore = Arc::new(Semaphore::new(self.settings.max_parallel.max(1)));
        let mut futures = FuturesUnordered::new();

        let mut results = Vec::new();
        for repository in repositories {
            let path = match self.workspace.repository_path(repository) {
                Ok(path) => path,
                Err(e) => {
                    error!(operation, repository = repository.display_name(), error = %e, "Cannot resolve checkout path");
                    results.push(RepoResult {
                        name: repository.display_name().to_string(),
                        path: PathBuf::from(&repository.path),
                        outcome: RepoOutcome::failed(&e),
                    });
                    continue;
                }
            };
            let semaphore = semaphore.clone();
            let work = op(repository, path.clone());

            futures.push(async move {
                let _permit = semaphore.acquire().await.ok();
                let outcome = match work.await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(operation, repository = repository.display_name(), error = %e, "Repository operation failed");
                        RepoOutcome::failed(&e)
                    }
                };
                RepoResult {
                    name: repository.display_name().to_string(),
                    path,
                    outcome,
                }
            });
        }

        while let Some(result) = futures.next().await {
            debug!(operation, repository = %result.name, outcome = ?result.outcome, "Repository done");
            results.push(result);
        }

        let summary = OperationSummary::compile(operation, results, start.elapsed());
        info!(
            operation,
            successful = summary.successful,
            skipped = summary.skipped,
            failed = summary.failed,
            "Completed in {:.2}s",
            summary.duration.as_secs_f64()
        );
        Ok(summary)
    }

    async fn ensure_root(&self) -> Result<()> {
        let root = self.workspace.absolute_path()?;
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| Error::io(format!("creating workspace {}", root.display()), e))
    }

    fn remote(&self, repo: &Repository) -> String {
        repo.remote(&self.settings).to_string()
    }

    async fn status_of(&self, path: PathBuf, remote: Option<String>) -> Result<StatusResult> {
        let reconciler = self.reconciler.clone();
        tokio::task::spawn_blocking(move || match remote {
            Some(remote) => reconciler.status_with_remote(&path, &remote),
            None => reconciler.status(&path),
        })
        .await
        .map_err(|e| Error::Operation(format!("status task failed: {}", e)))
    }

    async fn divergence_of(&self, path: PathBuf, remote: String) -> Result<BranchStatus> {
        let reconciler = self.reconciler.clone();
        tokio::task::spawn_blocking(move || reconciler.divergence(&path, &remote))
            .await
            .map_err(|e| Error::Operation(format!("status task failed: {}", e)))?
    }

    async fn clone_one(&self, repo: &Repository, path: &Path) -> Result<RepoOutcome> {
        self.git
            .clone_repository(
                &repo.url,
                path,
                repo.branch.as_deref(),
                self.workspace.effective_auth(repo),
            )
            .await?;
        run_hooks(&self.token, repo, HookType::Clone, path).await?;
        Ok(RepoOutcome::Cloned)
    }

    async fn sync_one(&self, repo: &Repository, path: PathBuf) -> Result<RepoOutcome> {
        if !path.exists() {
            return self.clone_one(repo, &path).await;
        }
        self.pull_one(repo, path).await
    }

    async fn pull_one(&self, repo: &Repository, path: PathBuf) -> Result<RepoOutcome> {
        if !path.exists() {
            return Ok(RepoOutcome::Skipped {
                reason: "not cloned".to_string(),
            });
        }

        let remote = self.remote(repo);
        let auth = self.workspace.effective_auth(repo);

        let status = self.status_of(path.clone(), None).await?;
        if status.code == StatusCode::Dirty {
            self.git.fetch(&path, &remote, auth).await?;
            warn!(repository = repo.display_name(), "Uncommitted changes, fetched without pulling");
            return Ok(RepoOutcome::Skipped {
                reason: "uncommitted changes".to_string(),
            });
        }

        match self.git.pull(&path, &remote, auth).await? {
            PullOutcome::UpToDate => Ok(RepoOutcome::UpToDate),
            PullOutcome::FastForwarded { to, .. } => {
                run_hooks(&self.token, repo, HookType::Pull, &path).await?;
                Ok(RepoOutcome::Pulled { commit: to })
            }
        }
    }

    async fn push_one(&self, repo: &Repository, path: PathBuf) -> Result<RepoOutcome> {
        if !path.exists() {
            return Ok(RepoOutcome::Skipped {
                reason: "not cloned".to_string(),
            });
        }

        let remote = self.remote(repo);
        let status = self.status_of(path.clone(), Some(remote.clone())).await?;
        match status.code {
            StatusCode::Error => return Err(Error::Operation(status.message)),
            StatusCode::Dirty => {
                // committed work is pushable regardless of the worktree
                if !self.divergence_of(path.clone(), remote.clone()).await?.needs_push {
                    return Ok(RepoOutcome::Skipped {
                        reason: "uncommitted changes".to_string(),
                    });
                }
            }
            _ if !status.branch.needs_push => return Ok(RepoOutcome::UpToDate),
            _ => {}
        }

        run_hooks(&self.token, repo, HookType::PrePush, &path).await?;
        self.git
            .push(&path, &remote, self.workspace.effective_auth(repo))
            .await?;
        run_hooks(&self.token, repo, HookType::Push, &path).await?;
        Ok(RepoOutcome::Pushed)
    }

    async fn commit_one(&self, repo: &Repository, path: PathBuf, message: &str) -> Result<RepoOutcome> {
        if !path.exists() {
            return Ok(RepoOutcome::Skipped {
                reason: "not cloned".to_string(),
            });
        }
        match self.git.commit(&path, message).await? {
            Some(commit) => {
                info!(repository = repo.display_name(), hash = %commit.hash, files = commit.changed.len(), "Committed");
                Ok(RepoOutcome::Committed {
                    hash: commit.hash,
                    changed: commit.changed.len(),
                })
            }
            None => Ok(RepoOutcome::Skipped {
                reason: "nothing to commit".to_string(),
            }),
        }
    }

    async fn switch_one(&self, repo: &Repository, path: PathBuf, branch: &str) -> Result<RepoOutcome> {
        if !path.exists() {
            return Ok(RepoOutcome::Skipped {
                reason: "not cloned".to_string(),
            });
        }
        self.git.switch(&path, branch, &self.remote(repo)).await?;
        Ok(RepoOutcome::Switched {
            branch: branch.to_string(),
        })
    }

    async fn status_one(&self, repo: &Repository, path: PathBuf) -> Result<RepoOutcome> {
        let status = self.status_of(path, Some(self.remote(repo))).await?;
        Ok(RepoOutcome::Status(status))
    }

    async fn doctor_one(&self, repo: &Repository, path: PathBuf) -> Result<RepoOutcome> {
        if !path.exists() {
            info!(repository = repo.display_name(), "Missing, cloning");
            return self.clone_one(repo, &path).await;
        }
        if !is_repository(&path) {
            return Err(Error::Operation(format!(
                "{} exists but is not a git repository",
                path.display()
            )));
        }
        let status = self.status_of(path, Some(self.remote(repo))).await?;
        Ok(RepoOutcome::Status(status))
    }
}
