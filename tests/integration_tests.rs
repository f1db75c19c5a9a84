mod common;

use assert_matches::assert_matches;
use common::{commit_file, path_str, repository, GitFixture};
use polyrepo::config::{Auth, Command, Matcher, Runner};
use polyrepo::{GitClient, RepoOutcome, StatusCode, StatusReconciler, Transition, WatchCoordinator};
use predicates::prelude::*;
use std::process::Command as Process;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

fn status_of(summary: &polyrepo::OperationSummary, name: &str) -> polyrepo::StatusResult {
    let result = summary
        .results
        .iter()
        .find(|r| r.name == name)
        .unwrap_or_else(|| panic!("no result for {}", name));
    match &result.outcome {
        RepoOutcome::Status(status) => status.clone(),
        other => panic!("expected a status for {}, got {:?}", name, other),
    }
}

/// Integration tests over real repositories on disk

#[tokio::test]
async fn test_sync_clones_missing_repositories() {
    let fixture = GitFixture::new();
    let api = fixture.bare_remote("api");
    let web = fixture.bare_remote("web");
    let manager = fixture.manager(fixture.workspace_with(vec![
        repository("api", &api),
        repository("web", &web),
    ]));

    let summary = manager.sync(&[]).await.unwrap();
    assert_eq!(summary.total, 2);
    assert_eq!(summary.successful, 2);
    assert!(summary.results.iter().all(|r| r.outcome == RepoOutcome::Cloned));
    assert!(fixture.workspace.join("api/README.md").exists());

    let again = manager.sync(&[]).await.unwrap();
    assert!(again.results.iter().all(|r| r.outcome == RepoOutcome::UpToDate));

    let status = manager.status(&[]).await.unwrap();
    assert_eq!(status_of(&status, "api").code, StatusCode::Clean);
    assert_eq!(status_of(&status, "web").code, StatusCode::Clean);
}

#[tokio::test]
async fn test_unpushed_commits_counted_then_pushed() {
    let fixture = GitFixture::new();
    let api = fixture.bare_remote("api");
    let manager = fixture.manager(fixture.workspace_with(vec![repository("api", &api)]));
    manager.sync(&[]).await.unwrap();

    let checkout = fixture.workspace.join("api");
    commit_file(&checkout, "one.txt", "1\n", "one");
    commit_file(&checkout, "two.txt", "2\n", "two");

    let status = status_of(&manager.status(&[]).await.unwrap(), "api");
    assert_eq!(status.code, StatusCode::Unpushed);
    assert_eq!(status.branch.ahead, 2);
    assert_eq!(status.branch.behind, 0);
    assert!(status.branch.needs_push);
    assert!(!status.branch.needs_pull);

    let pushed = manager.push(&[]).await.unwrap();
    assert_eq!(pushed.results[0].outcome, RepoOutcome::Pushed);

    let status = status_of(&manager.status(&[]).await.unwrap(), "api");
    assert_eq!(status.code, StatusCode::Clean);

    let nothing = manager.push(&[]).await.unwrap();
    assert_eq!(nothing.results[0].outcome, RepoOutcome::UpToDate);
}

#[tokio::test]
async fn test_clean_dirty_clean_round_trip() {
    let fixture = GitFixture::new();
    let api = fixture.bare_remote("api");
    let manager = fixture.manager(fixture.workspace_with(vec![repository("api", &api)]));
    manager.sync(&[]).await.unwrap();

    let readme = fixture.workspace.join("api/README.md");
    let original = std::fs::read_to_string(&readme).unwrap();

    std::fs::write(&readme, "edited\n").unwrap();
    let dirty = status_of(&manager.status(&[]).await.unwrap(), "api");
    assert_eq!(dirty.code, StatusCode::Dirty);

    std::fs::write(&readme, original).unwrap();
    let clean = status_of(&manager.status(&[]).await.unwrap(), "api");
    assert_eq!(clean.code, StatusCode::Clean);
}

#[tokio::test]
async fn test_commit_records_changes() {
    let fixture = GitFixture::new();
    let api = fixture.bare_remote("api");
    let manager = fixture.manager(fixture.workspace_with(vec![repository("api", &api)]));
    manager.sync(&[]).await.unwrap();

    std::fs::write(fixture.workspace.join("api/notes.md"), "notes\n").unwrap();
    let committed = manager.commit(&[], "add notes").await.unwrap();
    assert_matches!(
        &committed.results[0].outcome,
        RepoOutcome::Committed { changed: 1, .. }
    );

    let empty = manager.commit(&[], "nothing").await.unwrap();
    assert_matches!(&empty.results[0].outcome, RepoOutcome::Skipped { .. });

    let status = status_of(&manager.status(&[]).await.unwrap(), "api");
    assert_eq!(status.code, StatusCode::Unpushed);
    assert_eq!(status.branch.ahead, 1);
}

#[tokio::test]
async fn test_pull_fast_forwards_clean_and_skips_dirty() {
    let fixture = GitFixture::new();
    let api = fixture.bare_remote("api");
    let manager = fixture.manager(fixture.workspace_with(vec![repository("api", &api)]));
    manager.sync(&[]).await.unwrap();

    fixture.advance_remote(&api, "CHANGELOG.md", "release");
    let pulled = manager.pull(&[]).await.unwrap();
    assert_matches!(&pulled.results[0].outcome, RepoOutcome::Pulled { .. });
    assert!(fixture.workspace.join("api/CHANGELOG.md").exists());

    fixture.advance_remote(&api, "LICENSE", "license");
    std::fs::write(fixture.workspace.join("api/README.md"), "local edit\n").unwrap();
    let skipped = manager.pull(&[]).await.unwrap();
    assert_eq!(skipped.skipped, 1);
    assert!(!fixture.workspace.join("api/LICENSE").exists());

    // fetched even though skipped
    let status = status_of(&manager.status(&[]).await.unwrap(), "api");
    assert_eq!(status.code, StatusCode::Dirty);
}

#[tokio::test]
async fn test_failed_clone_leaves_no_directory() {
    let fixture = GitFixture::new();
    let good = fixture.bare_remote("good");
    let missing = fixture.remotes.join("missing.git");
    let manager = fixture.manager(fixture.workspace_with(vec![
        repository("good", &good),
        repository("broken", &missing),
    ]));

    let summary = manager.sync(&[]).await.unwrap();
    assert_eq!(summary.successful, 1);
    assert_eq!(summary.failed, 1);
    assert!(!summary.has_fatal());
    assert!(fixture.workspace.join("good").exists());
    assert!(!fixture.workspace.join("broken").exists());

    let doctor = manager.doctor(&[]).await.unwrap();
    assert_eq!(doctor.failed, 1);
    assert!(!fixture.workspace.join("broken").exists());
}

#[tokio::test]
async fn test_doctor_restores_removed_checkout() {
    let fixture = GitFixture::new();
    let api = fixture.bare_remote("api");
    let manager = fixture.manager(fixture.workspace_with(vec![repository("api", &api)]));
    manager.sync(&[]).await.unwrap();

    std::fs::remove_dir_all(fixture.workspace.join("api")).unwrap();
    let missing = status_of(&manager.status(&[]).await.unwrap(), "api");
    assert_eq!(missing.code, StatusCode::Missing);

    let doctor = manager.doctor(&[]).await.unwrap();
    assert_eq!(doctor.results[0].outcome, RepoOutcome::Cloned);
    assert!(fixture.workspace.join("api/.git").exists());
}

#[tokio::test]
async fn test_explicit_key_does_not_fall_through() {
    let fixture = GitFixture::new();
    let mut repo = repository("api", &fixture.remotes.join("api.git"));
    repo.url = "ssh://git@127.0.0.1/acme/api.git".to_string();
    repo.auth = Some(Auth {
        key: Some(path_str(&fixture.temp_dir.path().join("no-such-key"))),
        env: None,
    });

    let manager = fixture
        .manager(fixture.workspace_with(vec![repo]))
        .with_git(GitClient::new());
    let summary = manager.sync(&[]).await.unwrap();

    assert!(summary.has_fatal());
    assert_matches!(
        &summary.results[0].outcome,
        RepoOutcome::Failed { error, fatal: true } if error.contains("no-such-key")
    );
    assert!(!fixture.workspace.join("api").exists());
}

#[tokio::test]
async fn test_tags_select_repositories() {
    let fixture = GitFixture::new();
    let api = fixture.bare_remote("api");
    let web = fixture.bare_remote("web");
    let mut backend = repository("api", &api);
    backend.tags = vec!["backend".to_string()];
    let manager = fixture.manager(fixture.workspace_with(vec![backend, repository("web", &web)]));

    let summary = manager.sync(&["backend".to_string()]).await.unwrap();
    assert_eq!(summary.total, 1);
    assert!(fixture.workspace.join("api").exists());
    assert!(!fixture.workspace.join("web").exists());
}

#[tokio::test]
async fn test_push_on_dirty_tree_is_never_up_to_date() {
    let fixture = GitFixture::new();
    let api = fixture.bare_remote("api");
    let web = fixture.bare_remote("web");
    let manager = fixture.manager(fixture.workspace_with(vec![
        repository("api", &api),
        repository("web", &web),
    ]));
    manager.sync(&[]).await.unwrap();

    let api_checkout = fixture.workspace.join("api");
    commit_file(&api_checkout, "one.txt", "1\n", "one");
    commit_file(&api_checkout, "two.txt", "2\n", "two");
    std::fs::write(api_checkout.join("scratch.txt"), "wip\n").unwrap();
    std::fs::write(fixture.workspace.join("web/scratch.txt"), "wip\n").unwrap();

    let status = status_of(&manager.status(&[]).await.unwrap(), "api");
    assert_eq!(status.code, StatusCode::Dirty);
    let reconciler = StatusReconciler::new();
    assert_eq!(reconciler.divergence(&api_checkout, "origin").unwrap().ahead, 2);

    let pushed = manager.push(&[]).await.unwrap();
    let outcome = |name: &str| {
        pushed
            .results
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.outcome.clone())
            .unwrap()
    };
    assert_eq!(outcome("api"), RepoOutcome::Pushed);
    assert_matches!(outcome("web"), RepoOutcome::Skipped { reason } if reason == "uncommitted changes");

    let status = status_of(&manager.status(&[]).await.unwrap(), "api");
    assert_eq!(status.code, StatusCode::Dirty);
    assert_eq!(reconciler.divergence(&api_checkout, "origin").unwrap().ahead, 0);
}

#[tokio::test]
async fn test_unexpandable_path_fails_alone() {
    let fixture = GitFixture::new();
    let api = fixture.bare_remote("api");
    let web = fixture.bare_remote("web");
    let mut broken = repository("web", &web);
    broken.path = "$POLYREPO_TEST_UNSET_VAR/web".to_string();
    let manager = fixture.manager(fixture.workspace_with(vec![repository("api", &api), broken]));

    let summary = manager.sync(&[]).await.unwrap();
    assert_eq!(summary.total, 2);
    assert_eq!(summary.successful, 1);
    assert_eq!(summary.failed, 1);
    assert!(fixture.workspace.join("api/.git").exists());

    let failed: Vec<_> = summary.failures().map(|r| r.name.as_str()).collect();
    assert_eq!(failed, vec!["web"]);

    let status = manager.status(&[]).await.unwrap();
    assert_eq!(status_of(&status, "api").code, StatusCode::Clean);
    assert_eq!(status.failed, 1);
}

async fn next_transition(rx: &mut broadcast::Receiver<Transition>, within: Duration) -> Option<Transition> {
    tokio::time::timeout(within, rx.recv()).await.ok()?.ok()
}

async fn wait_for_lines(path: &std::path::Path, lines: usize) -> bool {
    for _ in 0..250 {
        let count = std::fs::read_to_string(path)
            .map(|c| c.lines().count())
            .unwrap_or(0);
        if count >= lines {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[cfg(unix)]
#[tokio::test]
async fn test_watch_restarts_only_on_matching_change() {
    let fixture = GitFixture::new();
    let repo_dir = fixture.workspace.join("svc");
    std::fs::create_dir_all(repo_dir.join("src")).unwrap();
    std::fs::write(repo_dir.join("src/main.go"), "package main\n").unwrap();
    std::fs::write(repo_dir.join("README.md"), "# svc\n").unwrap();
    let log = fixture.temp_dir.path().join("starts.log");

    let runner = Runner {
        name: "server".to_string(),
        cwd: String::new(),
        matchers: vec![Matcher {
            path: String::new(),
            include: r"\.go$".to_string(),
            ignore: String::new(),
        }],
        commands: vec![Command {
            name: "serve".to_string(),
            argv: vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("echo start >> {}; exec sleep 30", log.display()),
            ],
            ..Default::default()
        }],
    };

    let coordinator = WatchCoordinator::new("svc/server", &repo_dir, runner).unwrap();
    let mut transitions = coordinator.subscribe();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(coordinator.run(shutdown.clone()));

    let wait = Duration::from_secs(5);
    assert_eq!(next_transition(&mut transitions, wait).await, Some(Transition::Idle));
    assert_eq!(next_transition(&mut transitions, wait).await, Some(Transition::Watching));
    assert!(wait_for_lines(&log, 1).await);

    std::fs::write(repo_dir.join("src/main.go"), "package main\n\nfunc main() {}\n").unwrap();
    assert_eq!(next_transition(&mut transitions, wait).await, Some(Transition::ChangeDetected));
    assert_eq!(next_transition(&mut transitions, wait).await, Some(Transition::Cancelling));
    assert_eq!(next_transition(&mut transitions, wait).await, Some(Transition::Restarting));
    assert_eq!(next_transition(&mut transitions, wait).await, Some(Transition::Watching));
    assert!(wait_for_lines(&log, 2).await);

    // one save, one restart
    assert_eq!(next_transition(&mut transitions, Duration::from_millis(500)).await, None);

    std::fs::write(repo_dir.join("README.md"), "# svc\n\nmore docs\n").unwrap();
    assert_eq!(next_transition(&mut transitions, Duration::from_millis(500)).await, None);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(next_transition(&mut transitions, wait).await, Some(Transition::Terminated));

    let starts = std::fs::read_to_string(&log).unwrap();
    assert_eq!(starts.lines().count(), 2);
}

/// CLI tests run the built binary against a manifest in a temp dir

fn polyrepo(manifest: &std::path::Path, args: &[&str]) -> std::process::Output {
    Process::new(env!("CARGO_BIN_EXE_polyrepo"))
        .arg("--config")
        .arg(manifest)
        .args(args)
        .env_remove("POLYREPO_CONFIG")
        .output()
        .expect("Failed to execute polyrepo")
}

fn write_manifest(fixture: &GitFixture) -> std::path::PathBuf {
    let manifest = fixture.temp_dir.path().join(".polyrepo.yaml");
    std::fs::write(
        &manifest,
        format!(
            "workspaces:\n  - name: test\n    path: {}\n",
            fixture.workspace.display()
        ),
    )
    .unwrap();
    manifest
}

#[test]
fn test_cli_help() {
    let output = Process::new(env!("CARGO_BIN_EXE_polyrepo"))
        .arg("--help")
        .output()
        .expect("Failed to execute command");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    common::assert_contains_all(
        &stdout,
        &["sync", "pull", "push", "commit", "switch", "status", "watch", "doctor", "repo"],
    );
}

#[test]
fn test_cli_repo_add_list_remove() {
    let fixture = GitFixture::new();
    let api = fixture.bare_remote("api");
    let manifest = write_manifest(&fixture);

    let added = polyrepo(&manifest, &["repo", "add", &path_str(&api), "--tag", "backend"]);
    assert!(added.status.success(), "{}", String::from_utf8_lossy(&added.stderr));
    let saved = std::fs::read_to_string(&manifest).unwrap();
    common::assert_contains_all(&saved, &["path: api", "backend"]);

    let listed = polyrepo(&manifest, &["repo", "list"]);
    let stdout = String::from_utf8_lossy(&listed.stdout);
    assert!(predicate::str::contains("api")
        .and(predicate::str::contains("backend"))
        .eval(&stdout));

    let synced = polyrepo(&manifest, &["sync"]);
    assert!(synced.status.success());
    assert!(fixture.workspace.join("api/.git").exists());
    assert!(std::fs::read_to_string(&manifest).unwrap().contains("synced"));

    let removed = polyrepo(&manifest, &["repo", "remove", "api"]);
    assert!(removed.status.success());
    assert!(!std::fs::read_to_string(&manifest).unwrap().contains("path: api"));
}

#[test]
fn test_cli_exits_nonzero_on_failure() {
    let fixture = GitFixture::new();
    let manifest = write_manifest(&fixture);
    let missing = fixture.remotes.join("missing.git");

    let added = polyrepo(&manifest, &["repo", "add", &path_str(&missing), "--path", "broken"]);
    assert!(added.status.success());

    let synced = polyrepo(&manifest, &["sync"]);
    assert_eq!(synced.status.code(), Some(1));
    assert!(predicate::path::missing().eval(&fixture.workspace.join("broken")));
}

#[test]
fn test_cli_invalid_manifest() {
    let fixture = GitFixture::new();
    let manifest = fixture.temp_dir.path().join("bad.yaml");
    std::fs::write(&manifest, "workspaces:\n  - name: test\n").unwrap();

    let output = polyrepo(&manifest, &["status"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("manifest"));
}

#[test]
fn test_cli_init_creates_manifest_once() {
    let fixture = GitFixture::new();
    let manifest = fixture.temp_dir.path().join("fresh/.polyrepo.yaml");

    let created = polyrepo(&manifest, &["init", &path_str(&manifest)]);
    assert!(created.status.success(), "{}", String::from_utf8_lossy(&created.stderr));
    assert!(String::from_utf8_lossy(&created.stdout).contains("Manifest created"));
    let config = polyrepo::Config::load(&manifest).unwrap();
    assert!(config.workspaces.is_empty());

    let again = polyrepo(&manifest, &["init", &path_str(&manifest)]);
    assert!(!again.status.success());
}
