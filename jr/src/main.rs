//! jobrunner - dependency-aware job scheduler
//!
//! CLI entry point for the daemon and its control commands.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, FromArgMatches};
use colored::Colorize;
use eyre::{Context, Result};
use tracing::{debug, error, info, warn};

use jobrunner::cli::{Cli, Command, DaemonCommand, generate_after_help, get_log_path};
use jobrunner::clock::{Clock, SystemClock};
use jobrunner::config::Config;
use jobrunner::daemon::{DaemonManager, StopOutcome};
use jobrunner::engine::Runner;
use jobrunner::health::HealthReporter;
use jobrunner::ipc::{self, ControlClient, ControlCommand};
use jobrunner::job::{JobSource, YamlJobSource};
use jobrunner::process::RunPaths;
use jobrunner::queue::JobQueue;
use runstore::RunStore;

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    let log_dir = get_log_path()
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level_str = cli_log_level.or(config_log_level);
    let level = match level_str.map(str::to_uppercase).as_deref() {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("INFO") | None => tracing::Level::INFO,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        Some(other) => {
            eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", other);
            tracing::Level::INFO
        }
    };

    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(get_log_path())
        .context("Failed to open log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cmd = Cli::command().after_help(generate_after_help());
    let cli = Cli::from_arg_matches(&cmd.get_matches())?;

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    info!(jobs_files = ?config.jobs_files, state_dir = ?config.state_dir, "jobrunner loaded config");

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Daemon { command } => {
            debug!("main: matched Daemon command");
            match command {
                DaemonCommand::Start { foreground } => {
                    debug!(foreground, "main: matched DaemonCommand::Start");
                    cmd_start(&config, cli.config.clone(), foreground).await
                }
                DaemonCommand::Stop { timeout, force } => {
                    debug!(?timeout, force, "main: matched DaemonCommand::Stop");
                    cmd_stop(&config, timeout.map(Duration::from_secs), force).await
                }
                DaemonCommand::Status => {
                    debug!("main: matched DaemonCommand::Status");
                    cmd_daemon_status(&config).await
                }
            }
        }
        Command::RunDaemon => {
            debug!("main: matched RunDaemon command");
            cmd_run_daemon(&config).await
        }
        Command::Ping => {
            debug!("main: matched Ping command");
            cmd_ping(&config).await
        }
        Command::Reload => {
            debug!("main: matched Reload command");
            cmd_control(&config, ControlCommand::Reload).await
        }
        Command::Pause => {
            debug!("main: matched Pause command");
            cmd_control(&config, ControlCommand::Pause).await
        }
        Command::Resume => {
            debug!("main: matched Resume command");
            cmd_control(&config, ControlCommand::Resume).await
        }
        Command::Quit => {
            debug!("main: matched Quit command");
            cmd_control(&config, ControlCommand::Quit).await
        }
        Command::Kill => {
            debug!("main: matched Kill command");
            cmd_control(&config, ControlCommand::Kill).await
        }
        Command::Status => {
            debug!("main: matched Status command");
            cmd_control(&config, ControlCommand::Status).await
        }
        Command::Report => {
            debug!("main: matched Report command");
            cmd_report(&config).await
        }
        Command::Run { name, with_deps } => {
            debug!(%name, with_deps, "main: matched Run command");
            cmd_control(&config, ControlCommand::RunJob { name, with_deps }).await
        }
        Command::Show { name } => {
            debug!(%name, "main: matched Show command");
            cmd_control(&config, ControlCommand::ShowJob { name }).await
        }
        Command::Dump { depth } => {
            debug!(depth, "main: matched Dump command");
            cmd_dump(&config, depth)
        }
        Command::Check => {
            debug!("main: matched Check command");
            cmd_check(&config)
        }
        Command::Logs { follow, lines } => {
            debug!(follow, lines, "main: matched Logs command");
            cmd_logs(follow, lines)
        }
    }
}

/// Start the daemon
async fn cmd_start(config: &Config, config_path: Option<PathBuf>, foreground: bool) -> Result<()> {
    debug!(foreground, "cmd_start: called");
    let daemon = DaemonManager::new(config).with_config_path(config_path);

    if let Some(pid) = daemon.running_pid() {
        debug!(pid, "cmd_start: daemon already running");
        println!("jobrunner is already running (PID: {})", pid);
        return Ok(());
    }

    if foreground {
        debug!("cmd_start: starting in foreground mode");
        println!("Starting jobrunner in foreground mode...");
        cmd_run_daemon(config).await
    } else {
        debug!("cmd_start: starting in background mode");
        let pid = daemon.start()?;
        println!("jobrunner started (PID: {})", pid);
        Ok(())
    }
}

/// Stop the daemon
///
/// Asks for a graceful QUIT over the socket first, falls back to SIGTERM.
/// Either way the daemon lets running jobs finish; it is only SIGKILLed
/// with `--force` once `--timeout` has expired.
async fn cmd_stop(config: &Config, timeout: Option<Duration>, force: bool) -> Result<()> {
    debug!(?timeout, force, "cmd_stop: called");
    let daemon = DaemonManager::new(config);

    let Some(pid) = daemon.running_pid() else {
        debug!("cmd_stop: daemon is not running");
        println!("jobrunner is not running");
        return Ok(());
    };

    let client = ControlClient::new(&config.socket_path);
    let quit_sent = match client.text(&ControlCommand::Quit).await {
        Ok(reply) => {
            println!("{}", reply.trim_end());
            true
        }
        Err(e) => {
            debug!(error = %e, "cmd_stop: QUIT failed, falling back to SIGTERM");
            false
        }
    };

    let outcome = if quit_sent {
        if wait_until_stopped(&daemon, timeout).await {
            println!("jobrunner stopped gracefully (was PID: {})", pid);
            return Ok(());
        }
        if !force {
            return Err(eyre::eyre!(
                "jobrunner (PID {}) is still waiting for running jobs; use --force to kill it",
                pid
            ));
        }
        daemon.stop(Some(Duration::ZERO), true)?
    } else {
        daemon.stop(timeout, force)?
    };

    match outcome {
        StopOutcome::Exited => println!("jobrunner stopped (was PID: {})", pid),
        StopOutcome::Killed => println!("jobrunner {} (was PID: {})", "killed".red(), pid),
    }
    Ok(())
}

/// Wait for the daemon to release its master lock; `None` waits forever
async fn wait_until_stopped(daemon: &DaemonManager, timeout: Option<Duration>) -> bool {
    let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
    while daemon.is_running() {
        if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    true
}

/// Show whether the daemon is running and answering
async fn cmd_daemon_status(config: &Config) -> Result<()> {
    debug!("cmd_daemon_status: called");
    let daemon = DaemonManager::new(config);
    let status = daemon.status();

    match status.pid {
        Some(pid) => println!("jobrunner is {} (PID: {})", "running".green(), pid),
        None => println!("jobrunner is {}", "stopped".red()),
    }
    println!("  Lock file: {}", status.lock_file.display());
    if let Some(version) = &status.version {
        if daemon.version_matches() {
            println!("  Version:   {}", version);
        } else {
            println!("  Version:   {} ({})", version, "differs from this binary".yellow());
        }
    }

    if status.running {
        let client = ControlClient::new(&config.socket_path);
        match client.ping().await {
            Ok(()) => println!("  Socket:    {} ({})", config.socket_path.display(), "responding".green()),
            Err(e) => println!("  Socket:    {} ({})", config.socket_path.display(), e.to_string().red()),
        }
    }
    Ok(())
}

async fn cmd_ping(config: &Config) -> Result<()> {
    debug!("cmd_ping: called");
    let client = ControlClient::new(&config.socket_path);
    client.ping().await.context("Daemon did not answer")?;
    println!("PONG");
    Ok(())
}

/// Send a command and print the daemon's text answer
async fn cmd_control(config: &Config, command: ControlCommand) -> Result<()> {
    debug!(?command, "cmd_control: called");
    let client = ControlClient::new(&config.socket_path);
    let body = client.text(&command).await?;
    println!("{}", body.trim_end());
    Ok(())
}

async fn cmd_report(config: &Config) -> Result<()> {
    debug!("cmd_report: called");
    let client = ControlClient::new(&config.socket_path);
    let report = client.report().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Print the dependency tree from the job files
fn cmd_dump(config: &Config, depth: u8) -> Result<()> {
    debug!(depth, "cmd_dump: called");
    let source = YamlJobSource::load(config.jobs_files.clone())?;
    let jobs = source.get_jobs()?;
    print!("{}", jobs.dump(depth));
    Ok(())
}

/// Validate the job files
fn cmd_check(config: &Config) -> Result<()> {
    debug!("cmd_check: called");
    match YamlJobSource::load(config.jobs_files.clone()) {
        Ok(source) => {
            let jobs = source.get_jobs()?;
            println!("{} {} jobs in {}", "OK".green(), jobs.len(), source.describe());
            Ok(())
        }
        Err(e) => {
            println!("{} {}", "FAILED".red(), e);
            Err(eyre::eyre!("Job definitions are invalid"))
        }
    }
}

fn cmd_logs(follow: bool, lines: usize) -> Result<()> {
    debug!(follow, lines, "cmd_logs: called");
    let log_path = get_log_path();

    if !log_path.exists() {
        debug!(?log_path, "cmd_logs: log file does not exist");
        println!("No log file found at: {}", log_path.display());
        println!("The daemon may not have been started yet.");
        return Ok(());
    }

    if follow {
        debug!(?log_path, "cmd_logs: following log file");
        println!("Following log file: {} (Ctrl+C to stop)", log_path.display());
        println!();

        let mut child = std::process::Command::new("tail")
            .args(["-f", "-n", &lines.to_string()])
            .arg(&log_path)
            .spawn()
            .context("Failed to run tail -f")?;

        child.wait()?;
    } else {
        debug!(?log_path, lines, "cmd_logs: reading last N lines");
        let file = fs::File::open(&log_path).context("Failed to open log file")?;
        let reader = BufReader::new(file);
        let all_lines: Vec<String> = reader.lines().map_while(Result::ok).collect();

        let start = all_lines.len().saturating_sub(lines);
        for line in &all_lines[start..] {
            println!("{}", line);
        }
    }

    Ok(())
}

/// Await a background task, logging a panic or cancellation
async fn join_task<T>(name: &str, handle: tokio::task::JoinHandle<T>) -> Option<T> {
    match handle.await {
        Ok(value) => Some(value),
        Err(e) => {
            error!(task = name, error = %e, "Background task failed");
            None
        }
    }
}

/// Run the daemon in this process until QUIT, KILL or a signal
async fn cmd_run_daemon(config: &Config) -> Result<()> {
    debug!("cmd_run_daemon: called");
    let daemon = DaemonManager::new(config);
    // Only the master lock's owner may check and clean up the socket
    daemon.register_self()?;
    if let Err(e) = daemon.ensure_single_instance(&config.socket_path).await {
        daemon.unregister();
        return Err(e);
    }
    debug!("cmd_run_daemon: daemon registered, starting run_daemon");

    let result = run_daemon(config).await;
    if let Err(e) = &result {
        error!(error = %e, "Daemon failed");
    }
    daemon.unregister();
    result
}

async fn run_daemon(config: &Config) -> Result<()> {
    debug!("run_daemon: called");
    info!("Daemon starting...");

    fs::create_dir_all(&config.state_dir)
        .with_context(|| format!("Cannot create state directory {}", config.state_dir.display()))?;

    let store = RunStore::open(config.db_path()).context("Failed to open last-run database")?;
    let source = YamlJobSource::load(config.jobs_files.clone()).context("Failed to load job definitions")?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let queue = JobQueue::new(Box::new(source), Box::new(store), clock.clone())?;
    info!("Startup validation passed");

    let (runner, engine, snapshots) = Runner::new(config.runner.clone(), queue, RunPaths::under(&config.state_dir));
    let mut runner_handle = tokio::spawn(runner.run());
    info!("Runner started");

    let socket_path = config.socket_path.clone();
    let listener = ipc::bind_control_socket(&socket_path)?;
    let listener_handle = tokio::spawn(ipc::serve(listener, engine.clone()));
    info!(?socket_path, "Control socket listening");

    let reporter_handle = if config.health.enabled {
        let reporter = HealthReporter::new(
            config.report_path(),
            Duration::from_secs(config.health.interval_secs.max(1)),
            snapshots,
            clock,
        );
        Some(tokio::spawn(reporter.run()))
    } else {
        debug!("run_daemon: health reporting disabled");
        None
    };

    info!("Daemon running. SIGHUP reloads jobs, SIGINT/SIGTERM quit.");

    use tokio::signal::unix::{SignalKind, signal};
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let finished = loop {
        tokio::select! {
            result = &mut runner_handle => {
                debug!("run_daemon: runner finished");
                break result;
            }
            _ = sighup.recv() => {
                info!("SIGHUP received - reloading job definitions");
                match engine.reload().await {
                    Ok(response) => info!(?response, "Reload answered"),
                    Err(e) => warn!(error = %e, "Reload not delivered"),
                }
            }
            _ = sigint.recv() => {
                warn!("SIGINT received");
                if let Err(e) = engine.quit().await {
                    warn!(error = %e, "Quit not delivered");
                }
            }
            _ = sigterm.recv() => {
                warn!("SIGTERM received");
                if let Err(e) = engine.quit().await {
                    warn!(error = %e, "Quit not delivered");
                }
            }
        }
    };

    info!("Daemon shutting down...");
    listener_handle.abort();
    ipc::remove_socket_file(&socket_path);
    drop(engine);

    if let Some(handle) = reporter_handle {
        debug!("run_daemon: waiting for final health report");
        join_task("health reporter", handle).await;
    }

    match finished {
        Ok(Ok(queue)) => {
            info!(running = queue.running_jobs().len(), "Runner stopped");
            Ok(())
        }
        Ok(Err(e)) => Err(e.wrap_err("Runner failed")),
        Err(e) => Err(eyre::eyre!("Runner task panicked: {}", e)),
    }
}
