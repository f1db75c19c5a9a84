//! Credential resolution for git remotes
//!
//! Every clone/fetch/pull/push asks [`AuthResolver::resolve`] for a fresh
//! [`AuthMethod`]. Resolution walks an ordered list of [`AuthStrategy`]
//! attempts and the first one that yields a method wins. Results are never
//! cached; agent sockets and helper tokens may expire between calls.

use async_trait::async_trait;
use git2::{CertificateCheckStatus, Cred, RemoteCallbacks};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::{expand_path, Auth};
use crate::{Error, Result};

/// Default key files tried for ssh remotes, in order
pub const DEFAULT_KEY_FILES: &[&str] = &["id_rsa", "id_ed25519"];

const HELPER_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport family of a remote URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Ssh,
    Http,
}

impl Protocol {
    /// `ssh://` and `git@` remotes are ssh; everything else is treated as http(s)
    pub fn of(url: &str) -> Self {
        if url.starts_with("ssh://") || url.starts_with("git@") {
            Protocol::Ssh
        } else {
            Protocol::Http
        }
    }
}

/// Username embedded in an ssh URL, `git` when there is none
pub fn ssh_username(url: &str) -> String {
    let rest = url.strip_prefix("ssh://").unwrap_or(url);
    match rest.split_once('@') {
        Some((user, _)) if !user.is_empty() && !user.contains('/') => user.to_string(),
        _ => "git".to_string(),
    }
}

/// How to authenticate against one remote
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    SshKey { username: String, private_key: PathBuf },
    SshAgent { username: String },
    Basic { username: String, password: String },
    None,
}

impl AuthMethod {
    pub fn kind(&self) -> &'static str {
        match self {
            AuthMethod::SshKey { .. } => "ssh-key",
            AuthMethod::SshAgent { .. } => "ssh-agent",
            AuthMethod::Basic { .. } => "basic",
            AuthMethod::None => "none",
        }
    }
}

// Secrets stay out of logs
impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::SshKey {
                username,
                private_key,
            } => f
                .debug_struct("SshKey")
                .field("username", username)
                .field("private_key", private_key)
                .finish(),
            AuthMethod::SshAgent { username } => f
                .debug_struct("SshAgent")
                .field("username", username)
                .finish(),
            AuthMethod::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            AuthMethod::None => f.write_str("None"),
        }
    }
}

/// Input to every strategy
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub url: String,
    pub protocol: Protocol,
    pub explicit: Option<Auth>,
}

impl AuthRequest {
    pub fn new(url: &str, explicit: Option<&Auth>) -> Self {
        Self {
            url: url.to_string(),
            protocol: Protocol::of(url),
            explicit: explicit.cloned(),
        }
    }
}

/// One attempt in the credential chain
///
/// `Ok(None)` passes to the next strategy. `Err` stops the chain and is
/// reserved for explicit configuration that cannot be honored.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn try_resolve(&self, request: &AuthRequest) -> Result<Option<AuthMethod>>;
}

/// Configured `auth.key`
pub struct ExplicitKey;

#[async_trait]
impl AuthStrategy for ExplicitKey {
    fn name(&self) -> &'static str {
        "explicit-key"
    }

    async fn try_resolve(&self, request: &AuthRequest) -> Result<Option<AuthMethod>> {
        let Some(key) = request.explicit.as_ref().and_then(|a| a.key.as_deref()) else {
            return Ok(None);
        };
        if key.trim().is_empty() {
            return Ok(None);
        }

        let private_key = expand_path(key)?;
        if !is_loadable_key(&private_key).await {
            return Err(Error::Auth(format!(
                "configured ssh key {} is missing or not a private key",
                private_key.display()
            )));
        }

        Ok(Some(AuthMethod::SshKey {
            username: ssh_username(&request.url),
            private_key,
        }))
    }
}

/// Configured `auth.env` variable names holding basic-auth credentials
pub struct ExplicitEnv;

#[async_trait]
impl AuthStrategy for ExplicitEnv {
    fn name(&self) -> &'static str {
        "explicit-env"
    }

    async fn try_resolve(&self, request: &AuthRequest) -> Result<Option<AuthMethod>> {
        let Some(env) = request.explicit.as_ref().and_then(|a| a.env.as_ref()) else {
            return Ok(None);
        };

        let username = lookup(&env.username);
        let password = lookup(&env.password);

        match (username.is_empty(), password.is_empty()) {
            (true, true) => Ok(Some(AuthMethod::None)),
            (false, false) => Ok(Some(AuthMethod::Basic { username, password })),
            (true, false) => Err(Error::Auth(format!(
                "username variable {:?} is empty but password is set",
                env.username
            ))),
            (false, true) => Err(Error::Auth(format!(
                "password variable {:?} is empty but username is set",
                env.password
            ))),
        }
    }
}

fn lookup(name: &str) -> String {
    if name.is_empty() {
        return String::new();
    }
    std::env::var(name).unwrap_or_default()
}

/// Well-known key files under `~/.ssh`, ssh remotes only
pub struct DefaultKeys {
    ssh_dir: Option<PathBuf>,
    files: Vec<String>,
}

impl DefaultKeys {
    pub fn new() -> Self {
        Self {
            ssh_dir: dirs::home_dir().map(|h| h.join(".ssh")),
            files: DEFAULT_KEY_FILES.iter().map(|f| f.to_string()).collect(),
        }
    }

    pub fn in_dir(ssh_dir: impl Into<PathBuf>) -> Self {
        Self {
            ssh_dir: Some(ssh_dir.into()),
            ..Self::new()
        }
    }
}

impl Default for DefaultKeys {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthStrategy for DefaultKeys {
    fn name(&self) -> &'static str {
        "default-keys"
    }

    async fn try_resolve(&self, request: &AuthRequest) -> Result<Option<AuthMethod>> {
        if request.protocol != Protocol::Ssh {
            return Ok(None);
        }
        let Some(dir) = &self.ssh_dir else {
            return Ok(None);
        };

        for file in &self.files {
            let candidate = dir.join(file);
            if is_loadable_key(&candidate).await {
                return Ok(Some(AuthMethod::SshKey {
                    username: ssh_username(&request.url),
                    private_key: candidate,
                }));
            }
        }
        Ok(None)
    }
}

async fn is_loadable_key(path: &std::path::Path) -> bool {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => content.contains("PRIVATE KEY"),
        Err(_) => false,
    }
}

/// `git credential fill`, http remotes only, bounded by a timeout
pub struct CredentialHelper {
    program: Vec<String>,
    timeout: Duration,
}

impl CredentialHelper {
    pub fn new() -> Self {
        Self {
            program: vec!["git".into(), "credential".into(), "fill".into()],
            timeout: HELPER_TIMEOUT,
        }
    }

    pub fn with_program(program: Vec<String>, timeout: Duration) -> Self {
        Self { program, timeout }
    }

    async fn query(&self, url: &str) -> std::io::Result<String> {
        let (program, args) = match self.program.split_first() {
            Some(split) => split,
            None => return Ok(String::new()),
        };

        let mut child = tokio::process::Command::new(program)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(format!("url={}\n\n", url).as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Ok(String::new());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for CredentialHelper {
    fn default() -> Self {
        Self::new()
    }
}

/// Pull `username=` and `password=` out of credential-helper output
pub fn parse_helper_output(output: &str) -> Option<(String, String)> {
    let mut username = None;
    let mut password = None;
    for line in output.lines() {
        if let Some(value) = line.strip_prefix("username=") {
            username = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("password=") {
            password = Some(value.trim().to_string());
        }
    }
    match (username, password) {
        (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some((u, p)),
        _ => None,
    }
}

#[async_trait]
impl AuthStrategy for CredentialHelper {
    fn name(&self) -> &'static str {
        "credential-helper"
    }

    async fn try_resolve(&self, request: &AuthRequest) -> Result<Option<AuthMethod>> {
        if request.protocol != Protocol::Http {
            return Ok(None);
        }

        match tokio::time::timeout(self.timeout, self.query(&request.url)).await {
            Ok(Ok(output)) => Ok(parse_helper_output(&output)
                .map(|(username, password)| AuthMethod::Basic { username, password })),
            Ok(Err(e)) => {
                debug!(error = %e, "Credential helper unavailable");
                Ok(None)
            }
            Err(_) => {
                warn!(timeout = ?self.timeout, "Credential helper timed out");
                Ok(None)
            }
        }
    }
}

/// A reachable `SSH_AUTH_SOCK`, tried for any protocol as the last resort
pub struct Agent {
    socket: Option<PathBuf>,
}

impl Agent {
    pub fn new() -> Self {
        Self { socket: None }
    }

    pub fn at(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: Some(socket.into()),
        }
    }

    fn socket(&self) -> Option<PathBuf> {
        self.socket.clone().or_else(|| {
            std::env::var_os("SSH_AUTH_SOCK")
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
        })
    }
}

impl Default for Agent {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn agent_reachable(socket: &std::path::Path) -> bool {
    tokio::net::UnixStream::connect(socket).await.is_ok()
}

#[cfg(not(unix))]
async fn agent_reachable(socket: &std::path::Path) -> bool {
    socket.exists()
}

#[async_trait]
impl AuthStrategy for Agent {
    fn name(&self) -> &'static str {
        "ssh-agent"
    }

    async fn try_resolve(&self, request: &AuthRequest) -> Result<Option<AuthMethod>> {
        let Some(socket) = self.socket() else {
            return Ok(None);
        };
        if !agent_reachable(&socket).await {
            debug!(socket = %socket.display(), "SSH agent socket not reachable");
            return Ok(None);
        }
        Ok(Some(AuthMethod::SshAgent {
            username: ssh_username(&request.url),
        }))
    }
}

/// Ordered credential chain
pub struct AuthResolver {
    strategies: Vec<Box<dyn AuthStrategy>>,
}

impl AuthResolver {
    /// Explicit key, explicit env, default keys, credential helper, then agent
    pub fn new() -> Self {
        Self::with_strategies(vec![
            Box::new(ExplicitKey),
            Box::new(ExplicitEnv),
            Box::new(DefaultKeys::new()),
            Box::new(CredentialHelper::new()),
            Box::new(Agent::new()),
        ])
    }

    pub fn with_strategies(strategies: Vec<Box<dyn AuthStrategy>>) -> Self {
        Self { strategies }
    }

    /// First strategy yielding a method wins; exhausting the chain is `AuthMethod::None`
    pub async fn resolve(&self, url: &str, explicit: Option<&Auth>) -> Result<AuthMethod> {
        let request = AuthRequest::new(url, explicit);

        for strategy in &self.strategies {
            if let Some(method) = strategy.try_resolve(&request).await? {
                debug!(url, strategy = strategy.name(), method = method.kind(), "Resolved credentials");
                return Ok(method);
            }
        }

        debug!(url, "No credentials found, continuing unauthenticated");
        Ok(AuthMethod::None)
    }
}

impl Default for AuthResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// git2 callbacks presenting `method` once and accepting any host key
pub fn remote_callbacks(method: &AuthMethod) -> RemoteCallbacks<'_> {
    let mut callbacks = RemoteCallbacks::new();
    let mut attempted = false;

    callbacks.credentials(move |url, username_from_url, _allowed| {
        if std::mem::replace(&mut attempted, true) {
            return Err(git2::Error::from_str(&format!(
                "authentication rejected for {}",
                url
            )));
        }
        match method {
            AuthMethod::SshKey {
                username,
                private_key,
            } => Cred::ssh_key(
                username_from_url.unwrap_or(username),
                None,
                private_key,
                None,
            ),
            AuthMethod::SshAgent { username } => {
                Cred::ssh_key_from_agent(username_from_url.unwrap_or(username))
            }
            AuthMethod::Basic { username, password } => Cred::userpass_plaintext(username, password),
            AuthMethod::None => Err(git2::Error::from_str(&format!(
                "{} requires credentials and none were found",
                url
            ))),
        }
    });

    callbacks.certificate_check(|_cert, _host| Ok(CertificateCheckStatus::CertificateOk));
    callbacks
}
