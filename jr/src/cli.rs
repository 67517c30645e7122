//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

/// jobrunner - dependency-aware job scheduler
#[derive(Parser)]
#[command(
    name = "jr",
    about = "Run scheduled jobs with dependencies, locks and health reporting",
    version = env!("GIT_DESCRIBE"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage the jobrunner daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Internal: Run as daemon process (used by `daemon start`)
    #[command(hide = true)]
    RunDaemon,

    /// Check that the daemon answers on its control socket
    Ping,

    /// Re-read job definitions
    Reload,

    /// Stop starting scheduled jobs (forced runs still start)
    Pause,

    /// Undo a pause
    Resume,

    /// Stop the daemon once running jobs finish
    Quit,

    /// Terminate running jobs and stop the daemon
    Kill,

    /// Show running, queued and known jobs
    Status,

    /// Print the health report as JSON
    Report,

    /// Run a job now
    Run {
        /// Job name
        name: String,

        /// Also queue its pre and post jobs, honouring dependencies
        #[arg(short = 'd', long)]
        with_deps: bool,
    },

    /// Show one job's definition and state
    Show {
        /// Job name
        name: String,
    },

    /// Print the dependency tree of the configured jobs
    Dump {
        /// Detail level: 1 adds schedules, 2 max-freq, 3 raw pre/post lists
        #[arg(short, long, default_value = "1")]
        depth: u8,
    },

    /// Validate job definition files without contacting the daemon
    Check,

    /// Show daemon logs
    Logs {
        /// Follow log output (like tail -f)
        #[arg(short, long)]
        follow: bool,

        /// Number of lines to show
        #[arg(short, long, default_value = "50")]
        lines: usize,
    },
}

/// Daemon management subcommands
#[derive(Debug, Subcommand)]
pub enum DaemonCommand {
    /// Start the daemon
    Start {
        /// Don't fork to background (run in foreground)
        #[arg(long)]
        foreground: bool,
    },

    /// Stop the daemon once its running jobs finish
    Stop {
        /// Give up waiting after this many seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// SIGKILL the daemon when the timeout expires
        #[arg(long, requires = "timeout")]
        force: bool,
    },

    /// Check daemon status
    Status,
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    debug!("get_log_path: called");
    let path = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("jobrunner")
        .join("logs")
        .join("jobrunner.log");
    debug!(?path, "get_log_path: returning path");
    path
}

/// Footer for `--help` naming the log file
pub fn generate_after_help() -> String {
    format!("Logs are written to: {}\n", get_log_path().display())
}
