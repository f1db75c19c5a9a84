//! Child process supervision
//!
//! [`run`] launches a [`Command`] as the leader of a new process group, forwards
//! its stdout and stderr line by line to the log, and kills the whole group as
//! soon as the run's cancellation token fires. [`run_blocking`] is the same
//! thing awaited to completion, used by hooks.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{resolve_path, Command};
use crate::{Error, Result};

const READER_DRAIN: Duration = Duration::from_millis(500);

/// How a supervised process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub success: bool,
    /// The run was cancelled before the process exited on its own
    pub cancelled: bool,
}

impl ProcessExit {
    fn lost() -> Self {
        Self {
            code: None,
            success: false,
            cancelled: false,
        }
    }
}

/// Forceful termination of a process and everything it spawned
pub trait Terminate: Send + Sync {
    fn terminate(&self) -> std::io::Result<()>;
}

/// The OS process group led by a supervised child
#[derive(Debug, Clone, Copy)]
pub struct ProcessGroup {
    leader: u32,
}

impl ProcessGroup {
    pub fn new(leader: u32) -> Self {
        Self { leader }
    }
}

#[cfg(unix)]
impl Terminate for ProcessGroup {
    fn terminate(&self) -> std::io::Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        match killpg(Pid::from_raw(self.leader as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(std::io::Error::from(errno)),
        }
    }
}

#[cfg(windows)]
impl Terminate for ProcessGroup {
    fn terminate(&self) -> std::io::Result<()> {
        std::process::Command::new("taskkill")
            .args(["/T", "/F", "/PID", &self.leader.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|_| ())
    }
}

/// A live supervised process
///
/// Cancelling the handle's token (directly, through [`ProcessHandle::terminate`],
/// or through the parent token passed to [`run`]) kills the process group.
#[derive(Debug)]
pub struct ProcessHandle {
    name: String,
    pid: Option<u32>,
    token: CancellationToken,
    exit: watch::Receiver<Option<ProcessExit>>,
    waiter: JoinHandle<()>,
}

impl ProcessHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Request termination; idempotent
    pub fn terminate(&self) {
        self.token.cancel();
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Wait until the process has exited and been reaped
    pub async fn wait(&self) -> ProcessExit {
        let mut exit = self.exit.clone();
        let result = match exit.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone(),
            Err(_) => None,
        };
        result.unwrap_or_else(ProcessExit::lost)
    }

    /// Terminate and wait at most `timeout` for the exit to be observed
    pub async fn shutdown(self, timeout: Duration) -> Option<ProcessExit> {
        self.terminate();
        let exit = tokio::time::timeout(timeout, self.wait()).await.ok();
        if exit.is_none() {
            warn!(command = %self.name, pid = ?self.pid, "Process did not exit in time");
            self.waiter.abort();
        }
        exit
    }
}

/// Directory a command runs in: its own `cwd` resolved against the runner's
pub fn working_dir(command: &Command, runner_cwd: &Path) -> Result<PathBuf> {
    let dir = resolve_path(runner_cwd, &command.cwd)?;
    if !dir.is_dir() {
        return Err(Error::MissingDirectory(dir));
    }
    Ok(dir)
}

/// Start `command` and return once the process is running
pub fn run(
    parent: &CancellationToken,
    label: &str,
    command: &Command,
    runner_cwd: &Path,
) -> Result<ProcessHandle> {
    let cwd = working_dir(command, runner_cwd)?;
    let (program, args) = command
        .argv
        .split_first()
        .ok_or_else(|| Error::Config(format!("command {:?} has no program", command.name)))?;

    let mut process = tokio::process::Command::new(program);
    process
        .args(args)
        .current_dir(&cwd)
        .envs(&command.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    process.process_group(0);

    let mut child = process.spawn().map_err(|source| Error::CommandStart {
        name: command.name.clone(),
        source,
    })?;

    let pid = child.id();
    let token = parent.child_token();
    info!(label, command = %command.name, pid = ?pid, cwd = %cwd.display(), "Started process");

    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(forward_lines(
            stdout,
            "stdout",
            label.to_string(),
            command.name.clone(),
            token.clone(),
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(forward_lines(
            stderr,
            "stderr",
            label.to_string(),
            command.name.clone(),
            token.clone(),
        )));
    }

    let (exit_tx, exit_rx) = watch::channel(None);
    let group = pid.map(ProcessGroup::new);
    let waiter_token = token.clone();
    let name = command.name.clone();
    let label = label.to_string();

    let waiter = tokio::spawn(async move {
        let (status, cancelled) = tokio::select! {
            status = child.wait() => (status, false),
            _ = waiter_token.cancelled() => {
                if let Some(group) = group {
                    if let Err(e) = group.terminate() {
                        warn!(label = %label, command = %name, error = %e, "Failed to kill process group");
                    }
                }
                (child.wait().await, true)
            }
        };

        // Readers stop at EOF; a detached grandchild can hold the pipe open
        for reader in readers {
            let _ = tokio::time::timeout(READER_DRAIN, reader).await;
        }
        waiter_token.cancel();

        let exit = match status {
            Ok(status) => ProcessExit {
                code: status.code(),
                success: status.success() && !cancelled,
                cancelled,
            },
            Err(e) => {
                warn!(label = %label, command = %name, error = %e, "Failed to reap process");
                ProcessExit {
                    cancelled,
                    ..ProcessExit::lost()
                }
            }
        };

        if cancelled {
            debug!(label = %label, command = %name, "Process terminated");
        } else {
            info!(label = %label, command = %name, code = ?exit.code, "Process exited");
        }
        let _ = exit_tx.send(Some(exit));
    });

    Ok(ProcessHandle {
        name: command.name.clone(),
        pid,
        token,
        exit: exit_rx,
        waiter,
    })
}

/// Start `command` and wait for it to exit
pub async fn run_blocking(
    parent: &CancellationToken,
    label: &str,
    command: &Command,
    runner_cwd: &Path,
) -> Result<ProcessExit> {
    let handle = run(parent, label, command, runner_cwd)?;
    Ok(handle.wait().await)
}

async fn forward_lines<R>(
    reader: R,
    stream: &'static str,
    label: String,
    command: String,
    token: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            read = reader.read_until(b'\n', &mut buf) => match read {
                Ok(0) => break,
                Ok(_) => {
                    if token.is_cancelled() {
                        break;
                    }
                    // output need not be UTF-8
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']);
                    if stream == "stderr" {
                        warn!(label = %label, command = %command, stream, "{}", line);
                    } else {
                        info!(label = %label, command = %command, stream, "{}", line);
                    }
                }
                Err(e) => {
                    debug!(label = %label, command = %command, stream, error = %e, "Stream closed");
                    break;
                }
            }
        }
    }
}
