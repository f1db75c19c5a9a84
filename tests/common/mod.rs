//! Common test utilities and helpers for polyrepo tests
#![allow(dead_code)]

use git2::{Repository as GitRepository, Signature};
use polyrepo::auth::AuthResolver;
use polyrepo::config::{Repository, SyncSettings, Workspace};
use polyrepo::{GitClient, StatusReconciler, WorkspaceManager};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Temporary tree holding bare remotes and a workspace directory
pub struct GitFixture {
    pub temp_dir: TempDir,
    pub remotes: PathBuf,
    pub workspace: PathBuf,
}

impl GitFixture {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let remotes = temp_dir.path().join("remotes");
        let workspace = temp_dir.path().join("workspace");
        std::fs::create_dir_all(&remotes).expect("Failed to create remotes dir");

        Self {
            temp_dir,
            remotes,
            workspace,
        }
    }

    /// Bare repository `<name>.git` with one commit on `main`
    pub fn bare_remote(&self, name: &str) -> PathBuf {
        let remote = self.remotes.join(format!("{}.git", name));
        let bare = GitRepository::init_bare(&remote).expect("Failed to init bare remote");
        bare.set_head("refs/heads/main").unwrap();

        let seed = self.temp_dir.path().join(format!("seed-{}", name));
        let repo = GitRepository::init(&seed).expect("Failed to init seed");
        configure_identity(&repo);
        repo.set_head("refs/heads/main").unwrap();
        commit_file(&seed, "README.md", &format!("# {}\n", name), "initial");

        repo.remote("origin", &path_str(&remote)).unwrap();
        repo.find_remote("origin")
            .unwrap()
            .push(&["refs/heads/main:refs/heads/main"], None)
            .expect("Failed to seed remote");
        remote
    }

    /// Push one more commit to `remote` from a scratch clone
    pub fn advance_remote(&self, remote: &Path, file: &str, message: &str) {
        let scratch = self
            .temp_dir
            .path()
            .join(format!("scratch-{}", unique_suffix()));
        let repo = GitRepository::clone(&path_str(remote), &scratch).expect("Failed to clone");
        configure_identity(&repo);
        commit_file(&scratch, file, message, message);
        repo.find_remote("origin")
            .unwrap()
            .push(&["refs/heads/main:refs/heads/main"], None)
            .expect("Failed to push");
    }

    pub fn workspace_with(&self, repositories: Vec<Repository>) -> Workspace {
        Workspace {
            name: "test".to_string(),
            path: path_str(&self.workspace),
            repositories,
            ..Default::default()
        }
    }

    /// Manager with an empty credential chain; local remotes need none
    pub fn manager(&self, workspace: Workspace) -> WorkspaceManager {
        WorkspaceManager::new(workspace, SyncSettings::default())
            .with_git(GitClient::with_resolver(AuthResolver::with_strategies(Vec::new())))
            .with_reconciler(StatusReconciler::new())
    }
}

pub fn repository(name: &str, url: &Path) -> Repository {
    Repository {
        name: name.to_string(),
        url: path_str(url),
        path: name.to_string(),
        ..Default::default()
    }
}

pub fn configure_identity(repo: &GitRepository) {
    let mut config = repo.config().unwrap();
    config.set_str("user.name", "Test").unwrap();
    config.set_str("user.email", "test@example.com").unwrap();
}

/// Write `file` in the checkout at `dir` and commit it on HEAD
pub fn commit_file(dir: &Path, file: &str, content: &str, message: &str) -> git2::Oid {
    let repo = GitRepository::open(dir).expect("Failed to open repository");
    std::fs::write(dir.join(file), content).unwrap();

    let mut index = repo.index().unwrap();
    index.add_path(Path::new(file)).unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let sig = Signature::now("Test", "test@example.com").unwrap();

    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
    let parents: Vec<_> = parent.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
        .expect("Failed to commit")
}

pub fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn unique_suffix() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}

/// Assertion helpers for test validation
pub fn assert_contains_all(text: &str, expected: &[&str]) {
    for item in expected {
        assert!(
            text.contains(item),
            "Expected text to contain '{}', but it didn't. Text: {}",
            item,
            text
        );
    }
}
