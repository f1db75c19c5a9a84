//! Watch-and-restart loop for runners
//!
//! One [`WatchCoordinator`] owns one filesystem watcher and the single live
//! generation of processes for one [`Runner`]. Only the coordinator's own loop
//! replaces the generation; supervised tasks only observe its cancellation
//! token.
//!
//! A qualifying change cancels the current generation, waits (bounded) for its
//! processes to be reaped, sleeps a short grace delay, drops any events that
//! piled up meanwhile, then launches every command again concurrently.

use futures::future::join_all;
use notify::event::ModifyKind;
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{resolve_path, Runner};
use crate::matcher::PathMatcher;
use crate::supervisor::{self, ProcessHandle};
use crate::{Error, Result};

/// Timing of the cancel-then-restart cycle
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    /// Pause between the old generation's teardown and the new launch
    pub grace_delay: Duration,
    /// Upper bound on waiting for cancelled processes to be reaped
    pub exit_timeout: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            grace_delay: Duration::from_millis(100),
            exit_timeout: Duration::from_secs(5),
        }
    }
}

/// States a runner moves through, published to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Idle,
    Watching,
    ChangeDetected,
    Cancelling,
    Restarting,
    Terminated,
}

/// Only content writes, creations and removals restart a runner
pub fn is_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Remove(_)
            | EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Any)
    )
}

struct Generation {
    token: CancellationToken,
    handles: Vec<ProcessHandle>,
}

impl Generation {
    async fn cancel_and_wait(&mut self, timeout: Duration) {
        self.token.cancel();
        join_all(self.handles.drain(..).map(|handle| handle.shutdown(timeout))).await;
    }
}

pub struct WatchCoordinator {
    label: String,
    base: PathBuf,
    runner: Runner,
    policy: RestartPolicy,
    transitions: broadcast::Sender<Transition>,
}

impl WatchCoordinator {
    /// `runner.cwd` is resolved against `workspace_path` and becomes the base
    /// for matchers and commands
    pub fn new(label: impl Into<String>, workspace_path: &Path, runner: Runner) -> Result<Self> {
        let base = resolve_path(workspace_path, &runner.cwd)?;
        let (transitions, _) = broadcast::channel(64);
        Ok(Self {
            label: label.into(),
            base,
            runner,
            policy: RestartPolicy::default(),
            transitions,
        })
    }

    pub fn with_policy(mut self, policy: RestartPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Transition> {
        self.transitions.subscribe()
    }

    fn emit(&self, transition: Transition) {
        debug!(label = %self.label, ?transition, "Runner transition");
        let _ = self.transitions.send(transition);
    }

    /// Watch until `shutdown` fires
    ///
    /// Invalid matcher patterns, watcher setup failures and start failures of
    /// `exit_on_error` commands end the loop with an error. Other start
    /// failures leave the runner idle until the next change.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        self.emit(Transition::Idle);

        let matcher = PathMatcher::new(&self.base, &self.runner.matchers)?;
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
            let _ = event_tx.send(event);
        })?;
        self.register(&matcher, &mut watcher)?;

        let mut generation = self.launch(&shutdown)?;
        self.emit(Transition::Watching);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = event_rx.recv() => {
                    let Some(event) = event else {
                        generation.cancel_and_wait(self.policy.exit_timeout).await;
                        return Err(Error::Operation(format!("watcher for {} stopped", self.label)));
                    };
                    let event = match event {
                        Ok(event) => event,
                        Err(err) => {
                            warn!(label = %self.label, error = %err, "Watcher event error");
                            continue;
                        }
                    };
                    if !is_change(&event.kind) {
                        continue;
                    }
                    let Some(path) = event.paths.iter().find(|p| matcher.matches(p)) else {
                        continue;
                    };

                    info!(label = %self.label, path = %path.display(), "Change detected, restarting");
                    self.emit(Transition::ChangeDetected);

                    self.emit(Transition::Cancelling);
                    generation.cancel_and_wait(self.policy.exit_timeout).await;

                    self.emit(Transition::Restarting);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.policy.grace_delay) => {}
                    }
                    let mut coalesced = 0usize;
                    while event_rx.try_recv().is_ok() {
                        coalesced += 1;
                    }
                    if coalesced > 0 {
                        debug!(label = %self.label, coalesced, "Dropped events during restart");
                    }

                    generation = self.launch(&shutdown)?;
                    self.emit(Transition::Watching);
                }
            }
        }

        generation.cancel_and_wait(self.policy.exit_timeout).await;
        drop(watcher);
        self.emit(Transition::Terminated);
        info!(label = %self.label, "Runner stopped");
        Ok(())
    }

    fn register(&self, matcher: &PathMatcher, watcher: &mut RecommendedWatcher) -> Result<()> {
        let set = matcher.discover()?;
        if set.is_empty() {
            warn!(label = %self.label, base = %self.base.display(), "No files matched, nothing to watch");
        }
        for file in &set.files {
            watcher.watch(file, RecursiveMode::NonRecursive)?;
        }
        for dir in &set.directories {
            watcher.watch(dir, RecursiveMode::NonRecursive)?;
        }
        info!(
            label = %self.label,
            files = set.files.len(),
            directories = set.directories.len(),
            "Watching"
        );
        Ok(())
    }

    fn launch(&self, shutdown: &CancellationToken) -> Result<Generation> {
        let token = shutdown.child_token();
        let mut handles = Vec::with_capacity(self.runner.commands.len());

        for command in &self.runner.commands {
            match supervisor::run(&token, &self.label, command, &self.base) {
                Ok(handle) => handles.push(handle),
                Err(e) if command.exit_on_error => {
                    error!(label = %self.label, command = %command.name, error = %e, "Command failed to start");
                    token.cancel();
                    return Err(Error::CommandFatal {
                        name: command.name.clone(),
                    });
                }
                Err(e) => {
                    error!(
                        label = %self.label,
                        command = %command.name,
                        error = %e,
                        "Command failed to start, waiting for the next change"
                    );
                }
            }
        }

        Ok(Generation { token, handles })
    }
}

/// Watch `runner` under `workspace_path` until `shutdown` fires
pub async fn watch(
    shutdown: CancellationToken,
    label: &str,
    workspace_path: &Path,
    runner: Runner,
) -> Result<()> {
    WatchCoordinator::new(label, workspace_path, runner)?
        .run(shutdown)
        .await
}
