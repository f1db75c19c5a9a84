//! The YAML manifest: workspaces, repositories, hooks and runners
//!
//! Also owns manifest discovery, validation and path expansion.

use chrono::{DateTime, Utc};
use path_clean::PathClean;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::matcher::CompiledMatcher;
use crate::{Error, Result};

/// Manifest file name searched for when no explicit path is given
pub const MANIFEST_FILE: &str = ".polyrepo.yaml";

/// Environment variable pointing at a manifest
pub const CONFIG_ENV: &str = "POLYREPO_CONFIG";

const MAX_WALK_DEPTH: usize = 10;

/// Root of the manifest
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    /// Where this manifest was loaded from (used by `save`)
    #[serde(skip)]
    pub path: PathBuf,

    /// Name of the workspace used when none is selected explicitly
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<String>,

    /// Time of the last successful workspace sync
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced: Option<DateTime<Utc>>,

    /// Synchronization behavior settings
    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub workspaces: Vec<Workspace>,
}

/// Synchronization configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SyncSettings {
    /// Maximum parallel repository operations
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Remote used when a repository does not name one
    #[serde(default = "default_remote")]
    pub remote: String,
}

/// A group of repositories checked out under one directory
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Workspace {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub path: String,

    /// Credentials applied to repositories without their own `auth`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default)]
    pub repositories: Vec<Repository>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct Repository {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default)]
    pub url: String,

    /// Remote name, `sync.remote` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    /// Checkout location relative to the workspace path
    #[serde(default)]
    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<Hook>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub runners: Vec<Runner>,
}

/// Explicit credential descriptor
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct Auth {
    /// Path to an SSH private key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Names of environment variables holding HTTP credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<AuthEnv>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct AuthEnv {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HookType {
    Clone,
    Pull,
    Push,
    PrePush,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Hook {
    #[serde(rename = "type")]
    pub kind: HookType,
    pub commands: Vec<Command>,
}

/// A named set of watched paths and commands sharing one restart lifecycle
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct Runner {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Base directory for matchers and commands, relative to the repository checkout
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cwd: String,

    #[serde(default)]
    pub matchers: Vec<Matcher>,

    #[serde(default)]
    pub commands: Vec<Command>,
}

/// Include/ignore pattern pair scoping which files a runner watches
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct Matcher {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub include: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ignore: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct Command {
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cwd: String,

    #[serde(rename = "command", default)]
    pub argv: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    #[serde(default, alias = "exitOnError")]
    pub exit_on_error: bool,
}

fn default_max_parallel() -> usize {
    4
}

fn default_remote() -> String {
    "origin".to_string()
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            remote: default_remote(),
        }
    }
}

/// Expand `~` and environment variables in a manifest path
pub fn expand_path(path: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(path)
        .map_err(|e| Error::Config(format!("failed to expand path {:?}: {}", path, e)))?;
    Ok(PathBuf::from(expanded.as_ref()).clean())
}

/// Resolve `child` against `base` unless it is already absolute after expansion
pub fn resolve_path(base: &Path, child: &str) -> Result<PathBuf> {
    if child.is_empty() {
        return Ok(base.to_path_buf());
    }
    let expanded = expand_path(child)?;
    if expanded.is_absolute() {
        Ok(expanded)
    } else {
        Ok(base.join(expanded).clean())
    }
}

impl Config {
    /// Load the manifest from an explicit path, `POLYREPO_CONFIG`, the nearest
    /// `.polyrepo.yaml` above the working directory, or `~/.polyrepo.yaml`.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        let path = Self::locate(explicit)?;
        Self::load(&path)
    }

    pub fn locate(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            return expand_path(&path.to_string_lossy());
        }

        if let Ok(path) = std::env::var(CONFIG_ENV) {
            if !path.is_empty() {
                return expand_path(&path);
            }
        }

        let cwd = std::env::current_dir().map_err(|e| Error::io("current directory", e))?;
        if let Some(found) = find_upwards(&cwd, MANIFEST_FILE, MAX_WALK_DEPTH) {
            return Ok(found);
        }

        let home = dirs::home_dir()
            .ok_or_else(|| Error::Config("cannot determine home directory".to_string()))?;
        let fallback = home.join(MANIFEST_FILE);
        if fallback.exists() {
            return Ok(fallback);
        }

        Err(Error::Config(format!(
            "no {} found (set {} or pass --config)",
            MANIFEST_FILE, CONFIG_ENV
        )))
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("reading manifest {}", path.display()), e))?;

        let mut config: Config = serde_yaml::from_str(&content)?;
        config.path = path.to_path_buf();
        config.validate()?;

        tracing::debug!(path = %path.display(), workspaces = config.workspaces.len(), "Loaded manifest");
        Ok(config)
    }

    /// Save the manifest back to where it was loaded from
    pub fn save(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(Error::Config("manifest has no path to save to".to_string()));
        }
        self.save_to(&self.path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self)?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::io(format!("creating {}", parent.display()), e))?;
            }
        }

        std::fs::write(path, content)
            .map_err(|e| Error::io(format!("writing manifest {}", path.display()), e))
    }

    /// Create a manifest at `path`, either the one served at `url` or an empty
    /// default. An existing file is never overwritten.
    pub async fn init(path: &Path, url: Option<&str>) -> Result<Self> {
        let path = expand_path(&path.to_string_lossy())?;
        if path.exists() {
            return Err(Error::Config(format!(
                "{} already exists",
                path.display()
            )));
        }

        let Some(url) = url else {
            let config = Config {
                path,
                ..Default::default()
            };
            config.save()?;
            tracing::info!(path = %config.path.display(), "Created empty manifest");
            return Ok(config);
        };

        tracing::info!(url, path = %path.display(), "Downloading manifest");
        let body = reqwest::get(url).await?.error_for_status()?.text().await?;

        // validated before anything touches the disk
        let mut config: Config = serde_yaml::from_str(&body)?;
        config.path = path.clone();
        config.validate()?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Error::io(format!("creating {}", parent.display()), e))?;
            }
        }
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| Error::io(format!("writing manifest {}", path.display()), e))?;
        Ok(config)
    }

    /// Reject manifests with missing required fields or invalid matcher patterns
    pub fn validate(&self) -> Result<()> {
        for (wi, workspace) in self.workspaces.iter().enumerate() {
            if workspace.name.trim().is_empty() {
                return Err(Error::Config(format!("workspaces[{}] is missing 'name'", wi)));
            }
            if workspace.path.trim().is_empty() {
                return Err(Error::Config(format!(
                    "workspace {:?} is missing 'path'",
                    workspace.name
                )));
            }

            for repo in &workspace.repositories {
                let label = format!("{}/{}", workspace.name, repo.display_name());
                if repo.url.trim().is_empty() {
                    return Err(Error::Config(format!("repository {} is missing 'url'", label)));
                }
                if repo.path.trim().is_empty() {
                    return Err(Error::Config(format!("repository {} is missing 'path'", label)));
                }
                for hook in &repo.hooks {
                    for command in &hook.commands {
                        command.validate(&label)?;
                    }
                }
                for runner in &repo.runners {
                    for command in &runner.commands {
                        command.validate(&label)?;
                    }
                    for matcher in &runner.matchers {
                        CompiledMatcher::compile(matcher)?;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn workspace(&self, name: &str) -> Result<&Workspace> {
        self.workspaces
            .iter()
            .find(|w| w.name == name)
            .ok_or_else(|| Error::Config(format!("workspace {:?} not found", name)))
    }

    pub fn workspace_mut(&mut self, name: &str) -> Result<&mut Workspace> {
        self.workspaces
            .iter_mut()
            .find(|w| w.name == name)
            .ok_or_else(|| Error::Config(format!("workspace {:?} not found", name)))
    }

    /// Find the workspace containing `dir`, checking `dir` and then each parent
    pub fn workspace_for_dir(&self, dir: &Path) -> Result<&Workspace> {
        for workspace in &self.workspaces {
            let root = workspace.absolute_path()?;
            if dir.starts_with(&root) {
                return Ok(workspace);
            }
        }
        Err(Error::Config(format!(
            "no workspace contains {}",
            dir.display()
        )))
    }

    /// Pick the workspace to operate on: explicit name, `current`, the one
    /// containing `cwd`, or the only workspace in the manifest.
    pub fn select_workspace(&self, name: Option<&str>, cwd: &Path) -> Result<&Workspace> {
        if let Some(name) = name {
            return self.workspace(name);
        }
        if let Some(current) = self.current.as_deref() {
            return self.workspace(current);
        }
        if let Ok(workspace) = self.workspace_for_dir(cwd) {
            return Ok(workspace);
        }
        match self.workspaces.as_slice() {
            [only] => Ok(only),
            [] => Err(Error::Config("manifest defines no workspaces".to_string())),
            _ => Err(Error::Config(
                "multiple workspaces defined; pass --workspace or set 'current'".to_string(),
            )),
        }
    }

    /// Append a repository to a workspace; paths must be unique
    pub fn add_repository(&mut self, workspace: &str, repository: Repository) -> Result<()> {
        let ws = self.workspace_mut(workspace)?;
        if ws.repositories.iter().any(|r| r.path == repository.path) {
            return Err(Error::Config(format!(
                "repository with path {:?} already exists in workspace {:?}",
                repository.path, workspace
            )));
        }
        ws.repositories.push(repository);
        self.validate()
    }

    pub fn remove_repository(&mut self, workspace: &str, path: &str) -> Result<Repository> {
        let ws = self.workspace_mut(workspace)?;
        let index = ws
            .repositories
            .iter()
            .position(|r| r.path == path)
            .ok_or_else(|| {
                Error::Config(format!(
                    "repository with path {:?} not found in workspace {:?}",
                    path, workspace
                ))
            })?;
        Ok(ws.repositories.remove(index))
    }

    pub fn mark_synced(&mut self) {
        self.synced = Some(Utc::now());
    }
}

impl Workspace {
    pub fn absolute_path(&self) -> Result<PathBuf> {
        let expanded = expand_path(&self.path)?;
        if expanded.is_absolute() {
            return Ok(expanded);
        }
        let cwd = std::env::current_dir().map_err(|e| Error::io("current directory", e))?;
        Ok(cwd.join(expanded).clean())
    }

    /// Absolute checkout path of one of this workspace's repositories
    pub fn repository_path(&self, repository: &Repository) -> Result<PathBuf> {
        resolve_path(&self.absolute_path()?, &repository.path)
    }

    /// Repositories carrying any of `tags`; all of them when `tags` is empty
    pub fn repositories_tagged(&self, tags: &[String]) -> Vec<&Repository> {
        self.repositories
            .iter()
            .filter(|r| tags.is_empty() || tags.iter().any(|t| r.tags.contains(t)))
            .collect()
    }

    /// Repository credentials, falling back to the workspace-level descriptor
    pub fn effective_auth<'a>(&'a self, repository: &'a Repository) -> Option<&'a Auth> {
        repository.auth.as_ref().or(self.auth.as_ref())
    }
}

impl Repository {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.path
        } else {
            &self.name
        }
    }

    pub fn remote<'a>(&'a self, settings: &'a SyncSettings) -> &'a str {
        self.origin.as_deref().unwrap_or(&settings.remote)
    }

    pub fn hooks_of(&self, kind: HookType) -> impl Iterator<Item = &Hook> {
        self.hooks.iter().filter(move |h| h.kind == kind)
    }
}

impl Command {
    fn validate(&self, owner: &str) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config(format!("a command in {} is missing 'name'", owner)));
        }
        if self.argv.is_empty() || self.argv[0].trim().is_empty() {
            return Err(Error::Config(format!(
                "command {:?} in {} has an empty 'command'",
                self.name, owner
            )));
        }
        Ok(())
    }
}

fn find_upwards(start: &Path, file: &str, max_depth: usize) -> Option<PathBuf> {
    let mut dir = Some(start);
    let mut depth = 0;
    while let Some(current) = dir {
        if depth > max_depth {
            break;
        }
        let candidate = current.join(file);
        if candidate.is_file() {
            return Some(candidate);
        }
        dir = current.parent();
        depth += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serial_test::serial;
    use tempfile::TempDir;

    const MANIFEST: &str = r#"
current: dev
sync:
  max_parallel: 2
workspaces:
  - name: dev
    path: /tmp/polyrepo-dev
    auth:
      key: ~/.ssh/id_ed25519
    repositories:
      - name: api
        url: git@github.com:acme/api.git
        path: services/api
        branch: main
        tags: [backend]
        hooks:
          - type: pre_push
            commands:
              - name: test
                command: [cargo, test]
        runners:
          - name: server
            cwd: cmd/server
            matchers:
              - path: src
                include: '.*\.rs$'
                ignore: '^generated/'
            commands:
              - name: run
                command: [cargo, run]
                env:
                  RUST_LOG: debug
                exitOnError: true
      - url: https://github.com/acme/web.git
        path: web
        origin: upstream
        auth:
          env:
            username: WEB_USER
            password: WEB_TOKEN
        tags: [frontend]
"#;

    fn parse(content: &str) -> Config {
        let config: Config = serde_yaml::from_str(content).expect("Failed to parse YAML");
        config.validate().expect("manifest should validate");
        config
    }

    #[test]
    fn test_yaml_parsing() {
        let config = parse(MANIFEST);

        assert_eq!(config.current.as_deref(), Some("dev"));
        assert_eq!(config.sync.max_parallel, 2);
        assert_eq!(config.sync.remote, "origin");

        let ws = config.workspace("dev").unwrap();
        assert_eq!(ws.repositories.len(), 2);

        let api = &ws.repositories[0];
        assert_eq!(api.branch.as_deref(), Some("main"));
        assert_eq!(api.hooks[0].kind, HookType::PrePush);
        assert_eq!(api.hooks[0].commands[0].argv, vec!["cargo", "test"]);

        let runner = &api.runners[0];
        assert_eq!(runner.matchers[0].include, r".*\.rs$");
        assert!(runner.commands[0].exit_on_error);
        assert_eq!(runner.commands[0].env.get("RUST_LOG").map(String::as_str), Some("debug"));

        let web = &ws.repositories[1];
        assert_eq!(web.display_name(), "web");
        assert_eq!(web.remote(&config.sync), "upstream");
        assert_eq!(api.remote(&config.sync), "origin");
        assert_eq!(web.auth.as_ref().unwrap().env.as_ref().unwrap().password, "WEB_TOKEN");
    }

    #[test]
    fn test_effective_auth_falls_back_to_workspace() {
        let config = parse(MANIFEST);
        let ws = config.workspace("dev").unwrap();

        let api_auth = ws.effective_auth(&ws.repositories[0]).unwrap();
        assert_eq!(api_auth.key.as_deref(), Some("~/.ssh/id_ed25519"));

        let web_auth = ws.effective_auth(&ws.repositories[1]).unwrap();
        assert!(web_auth.key.is_none());
        assert!(web_auth.env.is_some());
    }

    #[test]
    fn test_missing_url_is_rejected() {
        let content = r#"
workspaces:
  - name: dev
    path: /tmp/dev
    repositories:
      - path: api
"#;
        let config: Config = serde_yaml::from_str(content).unwrap();
        let err = config.validate().unwrap_err();
        assert_matches!(err, Error::Config(msg) if msg.contains("'url'"));
    }

    #[test]
    fn test_empty_command_is_rejected() {
        let content = r#"
workspaces:
  - name: dev
    path: /tmp/dev
    repositories:
      - url: https://example.com/a.git
        path: a
        runners:
          - commands:
              - name: broken
                command: []
"#;
        let config: Config = serde_yaml::from_str(content).unwrap();
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_invalid_matcher_regex_is_rejected_at_load() {
        let content = r#"
workspaces:
  - name: dev
    path: /tmp/dev
    repositories:
      - url: https://example.com/a.git
        path: a
        runners:
          - matchers:
              - include: '(unclosed'
            commands:
              - name: run
                command: ["true"]
"#;
        let config: Config = serde_yaml::from_str(content).unwrap();
        let err = config.validate().unwrap_err();
        assert_matches!(err, Error::Pattern { .. });
        assert!(err.is_fatal());
    }

    #[test]
    fn test_tag_filtering() {
        let config = parse(MANIFEST);
        let ws = config.workspace("dev").unwrap();

        assert_eq!(ws.repositories_tagged(&[]).len(), 2);

        let backend = ws.repositories_tagged(&["backend".to_string()]);
        assert_eq!(backend.len(), 1);
        assert_eq!(backend[0].path, "services/api");

        let both = ws.repositories_tagged(&["backend".to_string(), "frontend".to_string()]);
        assert_eq!(both.len(), 2);

        assert!(ws.repositories_tagged(&["docs".to_string()]).is_empty());
    }

    #[test]
    fn test_repository_path_joins_workspace() {
        let config = parse(MANIFEST);
        let ws = config.workspace("dev").unwrap();
        let path = ws.repository_path(&ws.repositories[0]).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/polyrepo-dev/services/api"));
    }

    #[test]
    fn test_select_workspace_order() {
        let mut config = parse(MANIFEST);
        config.workspaces.push(Workspace {
            name: "ops".to_string(),
            path: "/tmp/polyrepo-ops".to_string(),
            ..Default::default()
        });

        let cwd = Path::new("/somewhere/else");
        assert_eq!(config.select_workspace(Some("ops"), cwd).unwrap().name, "ops");
        assert_eq!(config.select_workspace(None, cwd).unwrap().name, "dev");

        config.current = None;
        let inside = Path::new("/tmp/polyrepo-ops/tools");
        assert_eq!(config.select_workspace(None, inside).unwrap().name, "ops");
        assert!(config.select_workspace(None, cwd).is_err());
    }

    #[test]
    fn test_add_and_remove_repository_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let manifest = temp_dir.path().join(MANIFEST_FILE);

        let mut config = parse(MANIFEST);
        config.path = manifest.clone();

        let repo = Repository {
            name: "docs".to_string(),
            url: "https://github.com/acme/docs.git".to_string(),
            path: "docs".to_string(),
            ..Default::default()
        };
        config.add_repository("dev", repo.clone()).unwrap();
        assert_matches!(config.add_repository("dev", repo.clone()), Err(Error::Config(_)));
        config.mark_synced();
        config.save().unwrap();

        let mut loaded = Config::load(&manifest).unwrap();
        assert_eq!(loaded.workspace("dev").unwrap().repositories.len(), 3);
        assert!(loaded.synced.is_some());

        let removed = loaded.remove_repository("dev", "docs").unwrap();
        assert_eq!(removed, repo);
        assert!(loaded.remove_repository("dev", "docs").is_err());
        assert_eq!(loaded.workspace("dev").unwrap().repositories.len(), 2);
    }

    #[test]
    fn test_config_load_nonexistent_file() {
        let result = Config::load(Path::new("/nonexistent/path/.polyrepo.yaml"));
        assert_matches!(result, Err(Error::Io { .. }));
    }

    #[test]
    #[serial]
    fn test_locate_prefers_env_variable() {
        let temp_dir = TempDir::new().unwrap();
        let manifest = temp_dir.path().join("custom.yaml");
        std::fs::write(&manifest, "workspaces: []\n").unwrap();

        std::env::set_var(CONFIG_ENV, &manifest);
        let located = Config::locate(None);
        std::env::remove_var(CONFIG_ENV);

        assert_eq!(located.unwrap(), manifest);
    }

    #[test]
    fn test_locate_explicit_path_wins() {
        let located = Config::locate(Some(Path::new("/etc/polyrepo.yaml"))).unwrap();
        assert_eq!(located, PathBuf::from("/etc/polyrepo.yaml"));
    }

    #[test]
    fn test_find_upwards_walks_parents() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(temp_dir.path().join(MANIFEST_FILE), "workspaces: []\n").unwrap();

        let found = find_upwards(&nested, MANIFEST_FILE, MAX_WALK_DEPTH).unwrap();
        assert_eq!(found, temp_dir.path().join(MANIFEST_FILE));
        assert!(find_upwards(&nested, MANIFEST_FILE, 1).is_none());
    }

    #[test]
    #[serial]
    fn test_expand_path_uses_environment() {
        std::env::set_var("TEST_POLYREPO_HOME", "/test/home");
        let expanded = expand_path("${TEST_POLYREPO_HOME}/dev/../work").unwrap();
        std::env::remove_var("TEST_POLYREPO_HOME");
        assert_eq!(expanded, PathBuf::from("/test/home/work"));
    }

    #[test]
    fn test_resolve_path_keeps_absolute_children() {
        let base = Path::new("/work");
        assert_eq!(resolve_path(base, "api").unwrap(), PathBuf::from("/work/api"));
        assert_eq!(resolve_path(base, "/opt/api").unwrap(), PathBuf::from("/opt/api"));
        assert_eq!(resolve_path(base, "").unwrap(), PathBuf::from("/work"));
    }

    #[tokio::test]
    async fn test_init_writes_loadable_default() {
        let temp_dir = TempDir::new().unwrap();
        let manifest = temp_dir.path().join("nested/.polyrepo.yaml");

        let config = Config::init(&manifest, None).await.unwrap();
        assert!(config.workspaces.is_empty());

        let loaded = Config::load(&manifest).unwrap();
        assert_eq!(loaded.sync.max_parallel, 4);
        assert_eq!(loaded.sync.remote, "origin");
    }

    #[tokio::test]
    async fn test_init_never_overwrites() {
        let temp_dir = TempDir::new().unwrap();
        let manifest = temp_dir.path().join(MANIFEST_FILE);
        std::fs::write(&manifest, "workspaces: []\n").unwrap();

        let err = Config::init(&manifest, None).await.unwrap_err();
        assert_matches!(err, Error::Config(_));
        assert_eq!(std::fs::read_to_string(&manifest).unwrap(), "workspaces: []\n");
    }

    #[tokio::test]
    async fn test_init_downloads_manifest() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/team.yaml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(MANIFEST))
            .mount(&server)
            .await;

        let temp_dir = TempDir::new().unwrap();
        let manifest = temp_dir.path().join(MANIFEST_FILE);
        let url = format!("{}/team.yaml", server.uri());

        let config = Config::init(&manifest, Some(&url)).await.unwrap();
        assert_eq!(config.workspaces[0].name, "dev");
        assert_eq!(std::fs::read_to_string(&manifest).unwrap(), MANIFEST);
    }

    #[tokio::test]
    async fn test_init_download_failures_leave_no_file() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/invalid.yaml"))
            .respond_with(ResponseTemplate::new(200).set_body_string("workspaces:\n  - name: dev\n"))
            .mount(&server)
            .await;

        let temp_dir = TempDir::new().unwrap();
        let manifest = temp_dir.path().join(MANIFEST_FILE);

        let missing = Config::init(&manifest, Some(&format!("{}/missing.yaml", server.uri()))).await;
        assert_matches!(missing, Err(Error::Http(_)));
        assert!(!manifest.exists());

        let invalid = Config::init(&manifest, Some(&format!("{}/invalid.yaml", server.uri()))).await;
        assert_matches!(invalid, Err(Error::Config(_)));
        assert!(!manifest.exists());
    }
}
