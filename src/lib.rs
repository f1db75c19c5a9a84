//! Polyrepo - manage a workspace of many git repositories from one manifest
//!
//! A YAML manifest lists workspaces, each a directory holding a set of
//! repositories. Polyrepo clones, pulls, pushes, commits and switches them in
//! parallel, reports their sync status, and runs live-development "runners"
//! that restart their commands when watched files change.
//!
//! ## Modules
//!
//! - [`config`]: Manifest model, discovery and persistence
//! - [`auth`]: Credential resolution for git transport
//! - [`git`]: libgit2 clone/fetch/pull/push/commit/switch
//! - [`status`]: Working tree and upstream status reconciliation
//! - [`matcher`]: Include/ignore path matching for watchers
//! - [`supervisor`]: Child process groups with cancellation
//! - [`watch`]: Watch-and-restart coordination for runners
//! - [`hooks`]: Lifecycle hooks around clone, pull and push
//! - [`workspace`]: Bounded-parallel operations over a workspace
//! - [`health`]: Preflight checks for `doctor`

pub mod auth;
pub mod config;
pub mod error;
pub mod git;
pub mod health;
pub mod hooks;
pub mod matcher;
pub mod status;
pub mod supervisor;
pub mod watch;
pub mod workspace;

pub use auth::{AuthMethod, AuthResolver};
pub use config::{Config, Repository, Workspace};
pub use error::{Error, Result};
pub use git::GitClient;
pub use health::HealthCheck;
pub use matcher::PathMatcher;
pub use status::{StatusCode, StatusReconciler, StatusResult};
pub use watch::{RestartPolicy, Transition, WatchCoordinator};
pub use workspace::{OperationSummary, RepoOutcome, RepoResult, WorkspaceManager};
