//! Runner engine
//!
//! The daemon's main loop. One task owns the [`JobQueue`] and cycles
//! through reap, admit-forced, refresh, admit-ready and sleep. The sleep
//! ends early on a control command or a child exit; child watchers signal
//! through a [`Notify`], which keeps a permit when nobody is waiting yet, so
//! an exit that lands before the engine goes to sleep is never lost.

mod handle;
pub mod render;

pub use handle::{EngineError, EngineHandle, EngineRequest};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use nix::sys::signal::Signal;
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::RunnerConfig;
use crate::health::build_report;
use crate::ipc::{ControlCommand, ControlResponse};
use crate::process::{PollOutcome, ProcessExecutor, RunPaths, RunningProcess, SetupOutcome, send_signal};
use crate::queue::{JobQueue, JobStatus, QueueSnapshot};
use crate::schedule::format_duration;

/// How long kill mode waits for survivors after SIGKILL
const KILL_SETTLE: Duration = Duration::from_secs(3);

/// Capacity of the command channel
const COMMAND_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shutdown {
    /// Stop admitting work, let running jobs finish
    Graceful,
    /// Terminate running jobs, then exit
    Kill,
}

/// Result of trying to launch one queued job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Launch {
    /// A process is now tracked as running
    Started,
    /// The job was marked done without a tracked run
    Done,
    /// Nothing happened; the entry stays queued
    Skipped,
}

/// A launched process being watched by the engine
#[derive(Debug)]
struct ActiveRun {
    name: String,
    forced: bool,
    waits: bool,
    started_at: i64,
    max_duration: Option<u64>,
    term_sent_at: Option<i64>,
    executor: ProcessExecutor,
    process: RunningProcess,
}

/// The engine task
pub struct Runner {
    config: RunnerConfig,
    queue: JobQueue,
    paths: RunPaths,
    wake: Arc<Notify>,
    commands: mpsc::Receiver<EngineRequest>,
    commands_open: bool,
    snapshots: watch::Sender<QueueSnapshot>,
    active: HashMap<u32, ActiveRun>,
    paused_since: Option<i64>,
    last_pause_warn: i64,
    sleep_to: Option<i64>,
    shutdown: Option<Shutdown>,
}

impl Runner {
    /// Create the engine plus the handle used to command it and the
    /// channel on which it publishes queue snapshots
    pub fn new(config: RunnerConfig, queue: JobQueue, paths: RunPaths) -> (Self, EngineHandle, watch::Receiver<QueueSnapshot>) {
        debug!(?config, "Runner::new: called");
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let (snap_tx, snap_rx) = watch::channel(queue.snapshot(None));
        let runner = Self {
            config,
            queue,
            paths,
            wake: Arc::new(Notify::new()),
            commands: rx,
            commands_open: true,
            snapshots: snap_tx,
            active: HashMap::new(),
            paused_since: None,
            last_pause_warn: 0,
            sleep_to: None,
            shutdown: None,
        };
        (runner, EngineHandle::new(tx), snap_rx)
    }

    /// Run until QUIT or KILL, then return the queue
    pub async fn run(mut self) -> Result<JobQueue> {
        info!(jobs = self.queue.known_jobs().len(), "Runner starting");

        loop {
            self.drain_commands();
            if self.shutdown == Some(Shutdown::Kill) {
                break;
            }

            let mut progressed = self.reap();
            self.enforce_max_duration();

            if self.shutdown.is_none() {
                progressed |= self.admit_forced();
            }
            let min_wait = self.queue.refresh();
            if self.shutdown.is_none() && self.paused_since.is_none() {
                progressed |= self.admit_ready();
            }
            self.warn_if_paused();
            self.publish();

            if self.shutdown == Some(Shutdown::Graceful) {
                let waiting = self.active.values().filter(|r| r.waits).count();
                if waiting == 0 {
                    break;
                }
                debug!(waiting, "run: waiting for running jobs before exit");
            }

            if progressed {
                debug!("run: progress made, cycling again");
                continue;
            }
            self.sleep(min_wait).await;
        }

        if self.shutdown == Some(Shutdown::Kill) {
            self.kill_running().await;
        }
        self.sleep_to = None;
        self.publish();
        info!(still_running = self.active.len(), "Runner stopped");
        Ok(self.queue)
    }

    fn drain_commands(&mut self) {
        while let Ok(request) = self.commands.try_recv() {
            self.handle_request(request);
        }
    }

    fn handle_request(&mut self, request: EngineRequest) {
        let response = self.handle_command(request.command);
        if request.reply.send(response).is_err() {
            debug!("handle_request: requester went away");
        }
    }

    fn handle_command(&mut self, command: ControlCommand) -> ControlResponse {
        debug!(?command, "Runner::handle_command: called");
        let now = self.queue.now();
        match command {
            ControlCommand::Ping => ControlResponse::text("PONG"),
            ControlCommand::Reload => match self.queue.reload() {
                Ok(summary) => ControlResponse::text(format!("OK ({})", summary)),
                Err(e) => {
                    error!(error = %e, "Reload rejected, keeping previous job definitions");
                    ControlResponse::error(format!("Reload failed: {}", e))
                }
            },
            ControlCommand::Pause => {
                if self.paused_since.is_none() {
                    info!("Job runner paused");
                    self.paused_since = Some(now);
                    self.last_pause_warn = now;
                }
                ControlResponse::text("OK")
            }
            ControlCommand::Resume => {
                if self.paused_since.take().is_some() {
                    info!("Job runner resumed");
                }
                ControlResponse::text("OK")
            }
            ControlCommand::Quit => {
                let running = self.active.values().filter(|r| r.waits).count();
                self.request_shutdown(Shutdown::Graceful);
                ControlResponse::text(format!(
                    "Quitting: no new jobs will start, waiting for {} running job(s)",
                    running
                ))
            }
            ControlCommand::Kill => {
                if self.paused_since.is_none() {
                    self.paused_since = Some(now);
                }
                self.request_shutdown(Shutdown::Kill);
                ControlResponse::text(format!("Killing {} running job(s) and quitting", self.active.len()))
            }
            ControlCommand::RunJob { name, with_deps } => {
                let queued = if with_deps {
                    self.queue.enqueue_with_deps(&name)
                } else {
                    self.queue.enqueue_forced(&name)
                };
                match queued {
                    Ok(()) if with_deps => ControlResponse::text(format!("Queued {} with its dependencies", name)),
                    Ok(()) => ControlResponse::text(format!("Forced run of {} queued", name)),
                    Err(e) => ControlResponse::error(e.to_string()),
                }
            }
            ControlCommand::ShowJob { name } => match render::show_job(&self.queue, &name) {
                Some(text) => ControlResponse::Text(text),
                None => ControlResponse::error(format!("Unknown job: {}", name)),
            },
            ControlCommand::Status => ControlResponse::Text(render::status(&self.queue, self.paused_since, self.sleep_to)),
            ControlCommand::Report => ControlResponse::Report(build_report(&self.queue.snapshot(self.paused_since), now)),
        }
    }

    fn request_shutdown(&mut self, mode: Shutdown) {
        if self.shutdown != Some(Shutdown::Kill) {
            info!(?mode, "Shutdown requested");
            self.shutdown = Some(mode);
        }
    }

    /// Collect finished processes; true when anything completed
    fn reap(&mut self) -> bool {
        let pids: Vec<u32> = self.active.keys().copied().collect();
        let mut completed = false;
        for pid in pids {
            let Some(run) = self.active.get_mut(&pid) else {
                continue;
            };
            let status = match run.executor.poll(&mut run.process) {
                Ok(PollOutcome::NotDone) => continue,
                Ok(PollOutcome::Success) => {
                    info!(job = %run.name, pid, "Job completed");
                    JobStatus::Ok
                }
                Ok(PollOutcome::Failure { message, .. }) => {
                    error!(job = %run.name, pid, %message, "Job failed");
                    JobStatus::Failed(message)
                }
                Err(e) if e.is_retryable() => {
                    debug!(job = %run.name, pid, error = %e, "reap: retrying next cycle");
                    continue;
                }
                Err(e) => {
                    error!(job = %run.name, pid, error = %e, "Lost track of job process");
                    run.executor.lock().release();
                    JobStatus::Failed(e.to_string())
                }
            };
            if let Some(run) = self.active.remove(&pid) {
                self.queue.mark_done(&run.name, Some(pid), status, run.forced);
            }
            completed = true;
        }
        completed
    }

    /// SIGTERM runs past their max duration, SIGKILL them after the grace period
    fn enforce_max_duration(&mut self) {
        let now = self.queue.now();
        let grace = self.config.kill_grace_secs as i64;
        for (pid, run) in self.active.iter_mut() {
            let Some(max) = run.max_duration else {
                continue;
            };
            let ran_for = now - run.started_at;
            match run.term_sent_at {
                None if ran_for > max as i64 => {
                    error!(job = %run.name, pid, ran_for, "Job exceeded max duration, sending SIGTERM");
                    if let Err(e) = send_signal(*pid, Signal::SIGTERM) {
                        error!(job = %run.name, pid, error = %e, "Failed to signal job");
                    }
                    run.term_sent_at = Some(now);
                }
                Some(sent) if now - sent >= grace => {
                    error!(job = %run.name, pid, "Job ignored SIGTERM, sending SIGKILL");
                    if let Err(e) = send_signal(*pid, Signal::SIGKILL) {
                        error!(job = %run.name, pid, error = %e, "Failed to signal job");
                    }
                    // Wait another grace period before repeating
                    run.term_sent_at = Some(now);
                }
                _ => {}
            }
        }
    }

    /// Seconds until the nearest max-duration action
    fn next_deadline(&self, now: i64) -> Option<i64> {
        let grace = self.config.kill_grace_secs as i64;
        self.active
            .values()
            .filter_map(|run| match run.term_sent_at {
                Some(sent) => Some(sent + grace - now),
                None => run.max_duration.map(|max| run.started_at + max as i64 + 1 - now),
            })
            .min()
    }

    /// Forced runs skip every check except the job's lock
    fn admit_forced(&mut self) -> bool {
        let forced: Vec<String> = self.queue.forced_queue().to_vec();
        let mut progressed = false;
        for name in forced {
            debug!(job = %name, "admit_forced: ready");
            progressed |= self.launch(&name, true) == Launch::Done;
        }
        progressed
    }

    /// Launch ready jobs that are unblocked, unconflicted and within the cap
    fn admit_ready(&mut self) -> bool {
        let mut waited = self.queue.waited_running_count();
        let ready: Vec<String> = self.queue.run_queue().to_vec();
        let mut progressed = false;

        for name in ready {
            let Some(waits) = self.queue.job(&name).map(|j| j.waits()) else {
                continue;
            };
            if waits && waited >= self.config.max_parallel_jobs {
                debug!(job = %name, waited, "admit_ready: too many parallel jobs");
                continue;
            }
            if self.queue.is_blocked(&name) {
                debug!(job = %name, "admit_ready: blocked by queued or running job");
                continue;
            }
            if self.queue.is_conflicting(&name) {
                debug!(job = %name, "admit_ready: conflicting job running");
                continue;
            }
            match self.launch(&name, false) {
                Launch::Started if waits => waited += 1,
                Launch::Done => progressed = true,
                _ => {}
            }
        }
        progressed
    }

    fn launch(&mut self, name: &str, forced: bool) -> Launch {
        let Some(job) = self.queue.job(name) else {
            return Launch::Skipped;
        };
        let max_duration = job.max_duration;
        let Some(spec) = job.action.clone() else {
            debug!(job = %name, "launch: barrier job done");
            self.queue.mark_done(name, None, JobStatus::Ok, forced);
            return Launch::Done;
        };

        let executor = ProcessExecutor::new(name, spec, &self.paths);
        let waits = executor.spec().wait;
        if let SetupOutcome::Busy(pid) = executor.setup() {
            if waits {
                return Launch::Skipped;
            }
            debug!(job = %name, pid, "launch: no-wait job already running");
            self.queue.mark_done(name, None, JobStatus::Ok, forced);
            return Launch::Done;
        }

        match executor.execute(self.wake.clone()) {
            Ok(process) => {
                let pid = process.pid();
                self.queue.mark_started(name, pid, forced);
                self.active.insert(
                    pid,
                    ActiveRun {
                        name: name.to_string(),
                        forced,
                        waits,
                        started_at: self.queue.now(),
                        max_duration,
                        term_sent_at: None,
                        executor,
                        process,
                    },
                );
                if waits {
                    Launch::Started
                } else {
                    self.queue.mark_done(name, None, JobStatus::Ok, forced);
                    Launch::Done
                }
            }
            Err(e) => {
                error!(job = %name, error = %e, "Failed to start job");
                self.queue
                    .mark_done(name, None, JobStatus::Failed(format!("spawn failed: {}", e)), forced);
                Launch::Done
            }
        }
    }

    fn warn_if_paused(&mut self) {
        let Some(since) = self.paused_since else {
            return;
        };
        let now = self.queue.now();
        if now - self.last_pause_warn >= self.config.pause_warn_secs as i64 {
            warn!(paused_for = %format_duration(now - since), "Job runner is paused");
            self.last_pause_warn = now;
        }
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.queue.snapshot(self.paused_since));
    }

    /// Wait for a command, a child exit or the next due time
    async fn sleep(&mut self, min_wait: i64) {
        let now = self.queue.now();
        let mut secs = self.config.max_sleep_secs.max(1) as i64;
        if min_wait > 0 {
            secs = secs.min(min_wait);
        }
        if let Some(deadline) = self.next_deadline(now) {
            secs = secs.min(deadline.max(1));
        }
        if self.paused_since.is_some() {
            secs = secs.min(self.config.pause_warn_secs.max(1) as i64);
        }
        self.sleep_to = Some(now + secs);
        debug!(secs, "sleep: waiting");

        tokio::select! {
            request = self.commands.recv(), if self.commands_open => match request {
                Some(request) => self.handle_request(request),
                None => {
                    debug!("sleep: command channel closed");
                    self.commands_open = false;
                }
            },
            _ = self.wake.notified() => debug!("sleep: woken by child exit"),
            _ = tokio::time::sleep(Duration::from_secs(secs as u64)) => debug!("sleep: timer expired"),
        }
    }

    /// Kill mode: SIGTERM everything, then SIGKILL what is left
    async fn kill_running(&mut self) {
        info!(running = self.active.len(), "Sending SIGTERM to running jobs");
        self.signal_all(Signal::SIGTERM);
        self.wait_for_exits(Duration::from_secs(self.config.kill_grace_secs)).await;
        if self.active.is_empty() {
            return;
        }
        info!(running = self.active.len(), "Sending SIGKILL to running jobs");
        self.signal_all(Signal::SIGKILL);
        self.wait_for_exits(KILL_SETTLE).await;
        for run in self.active.values() {
            warn!(job = %run.name, pid = run.process.pid(), "Job survived SIGKILL");
        }
    }

    fn signal_all(&self, signal: Signal) {
        for (pid, run) in &self.active {
            if let Err(e) = send_signal(*pid, signal) {
                warn!(job = %run.name, pid, ?signal, error = %e, "Failed to signal job");
            }
        }
    }

    async fn wait_for_exits(&mut self, limit: Duration) {
        let deadline = Instant::now() + limit;
        loop {
            self.reap();
            if self.active.is_empty() {
                return;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(remaining) => {}
            }
        }
    }
}
