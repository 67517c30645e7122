//! Process executor
//!
//! Launches one job as an external process, captures its output in a
//! per-job run directory and classifies the outcome once it exits.

mod executor;
mod lock;

pub use executor::{ExecError, Exit, PollOutcome, ProcessExecutor, RunningProcess, SetupOutcome};
pub use lock::{LockError, LockFile, is_process_alive};

use std::path::{Path, PathBuf};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::debug;

/// Filesystem layout for lock files and run directories
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub lock_dir: PathBuf,
    pub run_root: PathBuf,
}

impl RunPaths {
    /// `locks/` and `runs/` under a state directory
    pub fn under(state_dir: &Path) -> Self {
        Self {
            lock_dir: state_dir.join("locks"),
            run_root: state_dir.join("runs"),
        }
    }

    pub fn lock_file(&self, job: &str) -> PathBuf {
        self.lock_dir.join(format!("job-runner-{}.lock", job))
    }

    pub fn run_dir(&self, job: &str) -> PathBuf {
        self.run_root.join(job)
    }
}

/// Deliver a signal to a process
pub fn send_signal(pid: u32, signal: Signal) -> nix::Result<()> {
    debug!(pid, ?signal, "send_signal: called");
    let raw = i32::try_from(pid).map_err(|_| nix::errno::Errno::EINVAL)?;
    kill(Pid::from_raw(raw), signal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_paths_layout() {
        let paths = RunPaths::under(Path::new("/var/lib/jobrunner"));
        assert_eq!(
            paths.lock_file("backup"),
            PathBuf::from("/var/lib/jobrunner/locks/job-runner-backup.lock")
        );
        assert_eq!(paths.run_dir("backup"), PathBuf::from("/var/lib/jobrunner/runs/backup"));
    }
}
