//! Daemon process management
//!
//! Handles the master lock, background start and stop, and the version
//! file written next to the lock.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use eyre::{Context, Result};
use nix::sys::signal::Signal;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::ipc::{ControlClient, ServerState};
use crate::process::{LockError, LockFile, is_process_alive, send_signal};

/// Current version from git describe (set at compile time)
pub const VERSION: &str = env!("GIT_DESCRIBE");

/// How long `stop` waits for a SIGKILLed daemon to disappear
const KILL_SETTLE: Duration = Duration::from_secs(1);

/// How a `stop` request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The daemon exited on its own after SIGTERM
    Exited,
    /// The daemon was still running at the deadline and got SIGKILL
    Killed,
}

/// Daemon process manager
#[derive(Debug)]
pub struct DaemonManager {
    /// Master lock holding the daemon's PID
    lock: LockFile,
    /// Path to the version file
    version_file: PathBuf,
    /// Config file handed to a background daemon
    config_path: Option<PathBuf>,
}

impl DaemonManager {
    /// Manager for the daemon described by `config`
    pub fn new(config: &Config) -> Self {
        debug!("DaemonManager::new: called");
        Self::with_lock_file(config.master_lock_path())
    }

    /// Create a daemon manager with a custom lock file path
    pub fn with_lock_file(lock_file: PathBuf) -> Self {
        debug!(?lock_file, "DaemonManager::with_lock_file: called");
        let version_file = lock_file.with_extension("version");
        Self {
            lock: LockFile::new(lock_file),
            version_file,
            config_path: None,
        }
    }

    /// Pass `--config` to a daemon started in the background
    pub fn with_config_path(mut self, config_path: Option<PathBuf>) -> Self {
        self.config_path = config_path;
        self
    }

    pub fn lock_file(&self) -> &Path {
        self.lock.path()
    }

    /// Check if a daemon is running
    pub fn is_running(&self) -> bool {
        self.running_pid().is_some()
    }

    /// Get the running daemon's PID
    pub fn running_pid(&self) -> Option<u32> {
        let result = self.lock.holder();
        debug!(?result, "DaemonManager::running_pid: returning");
        result
    }

    fn write_version(&self, version: &str) -> Result<()> {
        debug!(?self.version_file, version, "DaemonManager::write_version: called");
        if let Some(parent) = self.version_file.parent() {
            fs::create_dir_all(parent).context("Failed to create version file directory")?;
        }
        fs::write(&self.version_file, version).context("Failed to write version file")?;
        Ok(())
    }

    /// Read the version from the version file
    pub fn read_version(&self) -> Option<String> {
        let contents = fs::read_to_string(&self.version_file).ok()?;
        Some(contents.trim().to_string())
    }

    fn remove_version_file(&self) {
        if let Err(e) = fs::remove_file(&self.version_file)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = ?self.version_file, error = %e, "Failed to remove version file");
        }
    }

    /// Check if the running daemon version matches this binary
    pub fn version_matches(&self) -> bool {
        match self.read_version() {
            Some(daemon_version) => {
                let matches = daemon_version == VERSION;
                debug!(%daemon_version, cli_version = VERSION, matches, "DaemonManager::version_matches: checked");
                matches
            }
            None => false,
        }
    }

    /// Start the daemon in the background
    ///
    /// Spawns `jr run-daemon` detached from the terminal and returns its PID.
    pub fn start(&self) -> Result<u32> {
        debug!("DaemonManager::start: called");
        if let Some(pid) = self.running_pid() {
            return Err(eyre::eyre!("Daemon already running with PID {}", pid));
        }

        info!("Starting daemon...");
        let exe = std::env::current_exe().context("Failed to get current executable")?;
        let mut command = Command::new(&exe);
        if let Some(config) = &self.config_path {
            let config = fs::canonicalize(config).unwrap_or_else(|_| config.clone());
            command.arg("--config").arg(config);
        }
        let child = command
            .arg("run-daemon")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to spawn daemon process")?;

        let pid = child.id();
        self.lock.write(pid).context("Failed to write master lock")?;
        info!(pid, "Daemon started");
        Ok(pid)
    }

    /// Stop the daemon with SIGTERM and wait for it to exit
    ///
    /// The daemon treats SIGTERM as a graceful quit, so this waits for its
    /// running jobs. `timeout` of `None` waits as long as that takes. A daemon
    /// still alive at the deadline is SIGKILLed only when `force` is set;
    /// otherwise it is left running and an error is returned.
    pub fn stop(&self, timeout: Option<Duration>, force: bool) -> Result<StopOutcome> {
        debug!(?timeout, force, "DaemonManager::stop: called");
        let pid = self.running_pid().ok_or_else(|| eyre::eyre!("Daemon is not running"))?;

        info!(pid, "Stopping daemon...");
        send_signal(pid, Signal::SIGTERM).context("Failed to send SIGTERM")?;
        if wait_for_exit(pid, timeout) {
            self.unregister_pid(pid);
            info!(pid, "Daemon stopped");
            return Ok(StopOutcome::Exited);
        }
        if !force {
            return Err(eyre::eyre!(
                "Daemon (PID {}) is still waiting for running jobs; it was left running",
                pid
            ));
        }

        warn!(pid, "Daemon did not stop in time, sending SIGKILL");
        send_signal(pid, Signal::SIGKILL).context("Failed to send SIGKILL")?;
        if !wait_for_exit(pid, Some(KILL_SETTLE)) {
            warn!(pid, "Daemon survived SIGKILL");
        }
        self.unregister_pid(pid);
        Ok(StopOutcome::Killed)
    }

    /// Release the master lock if it still names `pid`
    fn unregister_pid(&self, pid: u32) {
        if self.lock.read_pid() == Some(pid) {
            self.unregister();
        }
    }

    /// Take the master lock for the current process
    ///
    /// Fails when another live process holds it.
    pub fn register_self(&self) -> Result<()> {
        let pid = std::process::id();
        debug!(pid, version = VERSION, "DaemonManager::register_self: called");
        match self.lock.acquire(pid) {
            Ok(()) => {}
            Err(LockError::Held { pid: holder, .. }) => {
                return Err(eyre::eyre!("Daemon already running with PID {}", holder));
            }
            Err(e) => return Err(e).context("Failed to take master lock"),
        }
        self.write_version(VERSION)?;
        info!(pid, version = VERSION, "Daemon registered");
        Ok(())
    }

    /// Release the master lock and remove the version file
    pub fn unregister(&self) {
        debug!("DaemonManager::unregister: called");
        self.lock.release();
        self.remove_version_file();
    }

    /// Refuse to start when a daemon owns the control socket
    ///
    /// Call with the master lock held. A socket nobody listens on is stale
    /// and gets removed; one that accepts but does not answer is left alone.
    pub async fn ensure_single_instance(&self, socket_path: &Path) -> Result<()> {
        debug!(?socket_path, "DaemonManager::ensure_single_instance: called");
        let client = ControlClient::new(socket_path).with_timeout(Duration::from_secs(2));
        match client.probe().await {
            ServerState::Alive => Err(eyre::eyre!(
                "Another daemon is answering on {}",
                socket_path.display()
            )),
            ServerState::Busy => Err(eyre::eyre!(
                "Control socket {} is in use by a process that did not answer",
                socket_path.display()
            )),
            ServerState::Stale => {
                info!(?socket_path, "Removed stale control socket");
                Ok(())
            }
            ServerState::Absent => Ok(()),
        }
    }

    /// Get the daemon status
    pub fn status(&self) -> DaemonStatus {
        let pid = self.running_pid();
        let status = DaemonStatus {
            running: pid.is_some(),
            pid,
            lock_file: self.lock.path().to_path_buf(),
            version: self.read_version(),
        };
        debug!(?status, "DaemonManager::status: returning");
        status
    }
}

/// Poll every 100ms until `pid` is gone; true when it exited
///
/// `None` waits without a deadline.
pub fn wait_for_exit(pid: u32, timeout: Option<Duration>) -> bool {
    let deadline = timeout.map(|t| Instant::now() + t);
    while is_process_alive(pid) {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return false;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    true
}

/// Daemon status information
#[derive(Debug)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub lock_file: PathBuf,
    pub version: Option<String>,
}
