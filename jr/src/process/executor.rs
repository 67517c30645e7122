//! Launching and reaping a single job process

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use chrono::Local;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{Notify, oneshot};
use tracing::{debug, info, warn};

use super::RunPaths;
use super::lock::{LockError, LockFile};
use crate::job::{ArgError, ProcessSpec};

const STDOUT_LOG: &str = "stdout.log";
const STDERR_LOG: &str = "stderr.log";

/// Errors from launching or reaping a job process
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Failed to prepare run directory {}: {source}", path.display())]
    RunDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to resolve arguments: {0}")]
    Arg(#[from] ArgError),

    #[error("Failed to spawn {cmd}: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: io::Error,
    },

    #[error("Spawned process has no pid")]
    NoPid,

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Failed to wait for process {pid}: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("Exit watcher for process {0} went away")]
    WatcherGone(u32),
}

impl ExecError {
    /// Whether reaping may simply be retried on the next cycle
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecError::Wait { source, .. }
                if matches!(source.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock)
        )
    }
}

/// Result of the pre-launch check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupOutcome {
    Ready,
    /// Lock held by this live process
    Busy(u32),
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Code(i32),
    Signal(i32),
}

impl From<ExitStatus> for Exit {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Exit::Code(code),
            (None, Some(sig)) => Exit::Signal(sig),
            (None, None) => Exit::Code(-1),
        }
    }
}

impl fmt::Display for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exit::Code(code) => write!(f, "exit_code={}", code),
            Exit::Signal(sig) => write!(f, "exit_signal={}", sig),
        }
    }
}

/// Non-blocking view of a launched process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    NotDone,
    Success,
    Failure {
        exit: Exit,
        /// Where the run directory was moved, when it was archived
        archive: Option<PathBuf>,
        message: String,
    },
}

/// Handle to a launched process
///
/// A watcher task owns the child and reports its exit status through a
/// oneshot channel, then wakes the engine.
#[derive(Debug)]
pub struct RunningProcess {
    pid: u32,
    exit: oneshot::Receiver<io::Result<ExitStatus>>,
}

impl RunningProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }
}

/// Launches one job's process and classifies its outcome
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    name: String,
    spec: ProcessSpec,
    lock: LockFile,
    run_dir: PathBuf,
}

impl ProcessExecutor {
    pub fn new(name: impl Into<String>, spec: ProcessSpec, paths: &RunPaths) -> Self {
        let name = name.into();
        Self {
            lock: LockFile::new(paths.lock_file(&name)),
            run_dir: paths.run_dir(&name),
            spec,
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn lock(&self) -> &LockFile {
        &self.lock
    }

    /// Check the lock file before launching
    pub fn setup(&self) -> SetupOutcome {
        debug!(job = %self.name, "ProcessExecutor::setup: called");
        match self.lock.holder() {
            Some(pid) => {
                if self.spec.wait {
                    info!(job = %self.name, pid, "Job is still running from a previous launch");
                } else {
                    debug!(job = %self.name, pid, "Job already running");
                }
                SetupOutcome::Busy(pid)
            }
            None => SetupOutcome::Ready,
        }
    }

    /// Spawn the process with output redirected into the run directory
    ///
    /// `wake` is notified once the process has exited.
    pub fn execute(&self, wake: Arc<Notify>) -> Result<RunningProcess, ExecError> {
        debug!(job = %self.name, cmd = %self.spec.pretty_cmd(), "ProcessExecutor::execute: called");
        let run_dir_err = |source| ExecError::RunDir {
            path: self.run_dir.clone(),
            source,
        };
        fs::create_dir_all(&self.run_dir).map_err(run_dir_err)?;

        let args = self.spec.resolve_args(Local::now())?;
        let open_log = |name: &str| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.run_dir.join(name))
                .map_err(run_dir_err)
        };
        let stdout = open_log(STDOUT_LOG)?;
        let stderr = open_log(STDERR_LOG)?;

        let mut child = Command::new(&self.spec.cmd)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|source| ExecError::Spawn {
                cmd: self.spec.cmd.clone(),
                source,
            })?;

        let pid = child.id().ok_or(ExecError::NoPid)?;
        if let Err(e) = self.lock.write(pid) {
            warn!(job = %self.name, pid, error = %e, "Failed to stamp lock file");
        }

        let (tx, rx) = oneshot::channel();
        let job = self.name.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            debug!(%job, pid, ?status, "exit watcher: process finished");
            let _ = tx.send(status);
            wake.notify_one();
        });

        info!(job = %self.name, pid, "Job started");
        Ok(RunningProcess { pid, exit: rx })
    }

    /// Check whether the process has exited and, if so, classify and clean up
    pub fn poll(&self, process: &mut RunningProcess) -> Result<PollOutcome, ExecError> {
        let status = match process.exit.try_recv() {
            Ok(Ok(status)) => status,
            Ok(Err(source)) => {
                return Err(ExecError::Wait {
                    pid: process.pid,
                    source,
                });
            }
            Err(oneshot::error::TryRecvError::Empty) => return Ok(PollOutcome::NotDone),
            Err(oneshot::error::TryRecvError::Closed) => return Err(ExecError::WatcherGone(process.pid)),
        };
        Ok(self.finish(Exit::from(status)))
    }

    fn finish(&self, exit: Exit) -> PollOutcome {
        debug!(job = %self.name, %exit, "ProcessExecutor::finish: called");
        let stdout = self.run_dir.join(STDOUT_LOG);
        let stderr = self.run_dir.join(STDERR_LOG);

        let (Some(out_len), Some(err_len)) = (file_len(&stdout), file_len(&stderr)) else {
            self.lock.release();
            return PollOutcome::Failure {
                exit,
                archive: None,
                message: format!("{}, full disk?", exit),
            };
        };

        let clean = exit == Exit::Code(0) && err_len == 0 && (out_len == 0 || self.spec.stdout_ok);
        if clean {
            remove_if_present(&stdout);
            remove_if_present(&stderr);
            self.lock.release();
            return PollOutcome::Success;
        }

        let archive = archive_path(&self.run_dir);
        let (archive, kept) = match fs::rename(&self.run_dir, &archive) {
            Ok(()) => (Some(archive.clone()), archive),
            Err(e) => {
                warn!(job = %self.name, error = %e, "Failed to archive run directory");
                (None, self.run_dir.clone())
            }
        };
        self.lock.release();
        PollOutcome::Failure {
            exit,
            archive,
            message: format!("{}, check {}", exit, kept.display()),
        }
    }
}

fn file_len(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().map(|m| m.len())
}

fn remove_if_present(path: &Path) {
    if let Err(e) = fs::remove_file(path)
        && e.kind() != io::ErrorKind::NotFound
    {
        warn!(?path, error = %e, "Failed to remove log file");
    }
}

fn archive_path(run_dir: &Path) -> PathBuf {
    let stamp = Local::now().format("%Y%m%dT%H%M%S%.3f");
    let mut name = run_dir.as_os_str().to_os_string();
    name.push(format!(".{}", stamp));
    PathBuf::from(name)
}
