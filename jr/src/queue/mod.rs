//! Job queue
//!
//! Owns the dependency-ordered ready queue, the forced queue and the
//! bookkeeping of what is running and when each job last ran. All mutation
//! happens on the engine task; other tasks only ever see a [`QueueSnapshot`].

mod snapshot;
mod store;

pub use snapshot::{JobSnapshot, JobStatus, QueueSnapshot, ReloadSummary, RunningJob};
pub use store::{LastRunStore, MemoryRunStore};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::job::{Job, JobError, JobSet, JobSource};

/// Wait reported when no job is scheduled to become due
pub const IDLE_WAIT: i64 = 999_999;

/// Dependency-aware scheduling state
pub struct JobQueue {
    source: Box<dyn JobSource>,
    store: Box<dyn LastRunStore>,
    clock: Arc<dyn Clock>,
    known_jobs: JobSet,
    run_queue: Vec<String>,
    forced_queue: Vec<String>,
    running: Vec<RunningJob>,
    /// Base for the schedule; new calendar jobs are seeded with load time
    last_run: HashMap<String, i64>,
    /// Real completions only
    completed: HashMap<String, i64>,
    last_duration: HashMap<String, i64>,
    last_status: HashMap<String, JobStatus>,
    last_success: HashMap<String, i64>,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("source", &self.source.describe())
            .field("known_jobs", &self.known_jobs.len())
            .field("run_queue", &self.run_queue)
            .field("forced_queue", &self.forced_queue)
            .field("running", &self.running)
            .finish()
    }
}

impl JobQueue {
    /// Load the source's current definitions and the stored last-run times
    pub fn new(
        source: Box<dyn JobSource>,
        store: Box<dyn LastRunStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, JobError> {
        debug!(source = %source.describe(), "JobQueue::new: called");
        let jobs = source.get_jobs()?;
        let mut queue = Self {
            source,
            store,
            clock,
            known_jobs: JobSet::default(),
            run_queue: Vec::new(),
            forced_queue: Vec::new(),
            running: Vec::new(),
            last_run: HashMap::new(),
            completed: HashMap::new(),
            last_duration: HashMap::new(),
            last_status: HashMap::new(),
            last_success: HashMap::new(),
        };
        let summary = queue.apply(jobs);
        info!(jobs = queue.known_jobs.len(), added = summary.added.len(), "Job queue initialized");
        Ok(queue)
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    /// Re-read definitions from the source
    ///
    /// On error nothing changes and the previous definitions stay in effect.
    pub fn reload(&mut self) -> Result<ReloadSummary, JobError> {
        debug!("JobQueue::reload: called");
        self.source.reload()?;
        let jobs = self.source.get_jobs()?;
        let summary = self.apply(jobs);
        info!(%summary, "Reloaded job definitions");
        Ok(summary)
    }

    fn apply(&mut self, jobs: JobSet) -> ReloadSummary {
        let now = self.clock.now();
        let added: Vec<String> = jobs
            .names()
            .filter(|n| !self.known_jobs.contains(n))
            .map(String::from)
            .collect();
        let removed: Vec<String> = self
            .known_jobs
            .names()
            .filter(|n| !jobs.contains(n))
            .map(String::from)
            .collect();

        for name in &removed {
            self.last_run.remove(name);
            self.completed.remove(name);
            self.last_duration.remove(name);
            self.last_status.remove(name);
            self.last_success.remove(name);
        }
        self.run_queue.retain(|n| jobs.contains(n));
        self.forced_queue.retain(|n| jobs.contains(n));

        for name in &added {
            let calendar = jobs.get(name).and_then(|j| j.when.as_ref()).is_some_and(|w| w.is_calendar());
            // Calendar jobs count from now so they do not fire on first load
            self.last_run.insert(name.clone(), if calendar { now } else { 0 });
        }

        self.known_jobs = jobs;

        match self.store.get_last_run() {
            Ok(stored) => {
                for (name, ts) in stored {
                    if self.known_jobs.contains(&name) {
                        self.last_run.insert(name.clone(), ts);
                        self.completed.insert(name, ts);
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to read stored last-run times"),
        }

        ReloadSummary { added, removed }
    }

    /// Queue every due job and return seconds until the next one becomes due
    pub fn refresh(&mut self) -> i64 {
        let now = self.clock.now();
        self.compute_due_and_extend(now)
    }

    /// Extend the ready queue with jobs due at `now`
    ///
    /// Returns the smallest positive delta among jobs that are not yet due,
    /// or [`IDLE_WAIT`] when nothing is scheduled.
    pub fn compute_due_and_extend(&mut self, now: i64) -> i64 {
        let mut queue = self.run_queue.clone();
        let mut min_wait = IDLE_WAIT;

        for job in self.known_jobs.iter() {
            let last = self.last_run.get(&job.name).copied().unwrap_or(0);
            match job.next_delta(last, now, self.clock.as_ref()) {
                Ok(None) => {}
                Ok(Some(delta)) if delta <= 0 => {
                    if !queue.contains(&job.name) {
                        debug!(job = %job.name, delta, "compute_due_and_extend: job is due");
                        self.insert_job(&mut queue, &job.name, now);
                    }
                }
                Ok(Some(delta)) => min_wait = min_wait.min(delta),
                Err(e) => warn!(job = %job.name, error = %e, "Failed to evaluate schedule"),
            }
        }

        self.run_queue = queue;
        min_wait
    }

    /// Insert `name` with its pre and post jobs into `queue`
    pub fn insert_job(&self, queue: &mut Vec<String>, name: &str, now: i64) {
        let mut seen = HashSet::new();
        self.insert(queue, name, now, &mut seen);
    }

    /// Pre jobs first, then the job itself if allowed, then post jobs
    ///
    /// The job is added only when it is not already queued (unless
    /// `multi_ok`), its `max_freq` window has passed and it is not running.
    /// `seen` stops re-entry within one insertion.
    pub fn insert(&self, queue: &mut Vec<String>, name: &str, now: i64, seen: &mut HashSet<String>) {
        if !seen.insert(name.to_string()) {
            return;
        }
        let Some(job) = self.known_jobs.get(name) else {
            warn!(job = %name, "insert: unknown job");
            return;
        };

        for pre in &job.pre {
            self.insert(queue, pre, now, seen);
        }

        let queued = queue.iter().any(|n| n == name);
        let last = self.last_run.get(name).copied().unwrap_or(0);
        let freq_ok = job.max_freq.is_none_or(|f| now - last > f as i64);
        if (!queued || job.multi_ok) && freq_ok && !self.is_running(name) {
            debug!(job = %name, "insert: queued");
            queue.push(name.to_string());
        } else {
            debug!(job = %name, queued, freq_ok, "insert: skipped");
        }

        for post in &job.post {
            self.insert(queue, post, now, seen);
        }
    }

    /// Whether a queued job has to wait for related jobs
    ///
    /// At the top level the job waits for its own `pre` chain and for any
    /// queued or running job that lists it in `post`. Nested levels (the
    /// `pre` jobs and everything reached from them) block when they are
    /// queued or running and also follow their `post` edges. The reverse
    /// `post` check and the skip of `post` edges apply only at the top, so
    /// a job is never held back by its own `post` jobs.
    pub fn is_blocked(&self, name: &str) -> bool {
        let mut visited = HashSet::from([name.to_string()]);
        self.blocked_at(name, 0, &mut visited)
    }

    fn blocked_at(&self, name: &str, depth: usize, visited: &mut HashSet<String>) -> bool {
        if depth > 0 && self.is_queued(name, false) {
            debug!(job = %name, depth, "is_blocked: queued");
            return true;
        }
        if self.is_running(name) {
            debug!(job = %name, depth, "is_blocked: running");
            return true;
        }
        let Some(job) = self.known_jobs.get(name) else {
            return false;
        };

        for pre in &job.pre {
            if visited.insert(pre.clone()) && self.blocked_at(pre, depth + 1, visited) {
                return true;
            }
        }

        if depth > 0 {
            for post in &job.post {
                if visited.insert(post.clone()) && self.blocked_at(post, depth + 1, visited) {
                    return true;
                }
            }
        } else {
            let waiting_on = self
                .run_queue
                .iter()
                .chain(self.running.iter().map(|r| &r.name))
                .filter(|other| other.as_str() != name)
                .find(|other| self.known_jobs.get(other).is_some_and(|j| j.post.iter().any(|p| p == name)));
            if let Some(other) = waiting_on {
                debug!(job = %name, after = %other, "is_blocked: must run after");
                return true;
            }
        }

        false
    }

    /// Whether a job in `name`'s nonconcurrent list is running
    pub fn is_conflicting(&self, name: &str) -> bool {
        let Some(job) = self.known_jobs.get(name) else {
            return false;
        };
        job.nonconcurrent.iter().any(|other| self.is_running(other))
    }

    /// Request a run that bypasses normal gating
    pub fn enqueue_forced(&mut self, name: &str) -> Result<(), JobError> {
        debug!(job = %name, "JobQueue::enqueue_forced: called");
        self.require_known(name)?;
        self.forced_queue.push(name.to_string());
        Ok(())
    }

    /// Request a run of `name` together with its pre and post jobs
    pub fn enqueue_with_deps(&mut self, name: &str) -> Result<(), JobError> {
        debug!(job = %name, "JobQueue::enqueue_with_deps: called");
        self.require_known(name)?;
        let now = self.clock.now();
        let mut queue = std::mem::take(&mut self.run_queue);
        self.insert_job(&mut queue, name, now);
        self.run_queue = queue;
        Ok(())
    }

    fn require_known(&self, name: &str) -> Result<(), JobError> {
        if self.known_jobs.contains(name) {
            Ok(())
        } else {
            Err(JobError::UnknownJob(name.to_string()))
        }
    }

    /// Move a job from its queue to the running set
    pub fn mark_started(&mut self, name: &str, pid: u32, forced: bool) {
        debug!(job = %name, pid, forced, "JobQueue::mark_started: called");
        self.remove_queued(name, forced);
        self.running.push(RunningJob {
            name: name.to_string(),
            pid,
            started_at: self.clock.now(),
        });
    }

    /// Record a completion
    ///
    /// With a `pid` the matching running entry is reaped. Without one the job
    /// finished without a tracked exit (barrier, spawn failure, or the launch
    /// of a fire-and-forget job). `last_run` is updated for waited jobs and
    /// for completions without a pid, never for a fire-and-forget process
    /// that later exits.
    pub fn mark_done(&mut self, name: &str, pid: Option<u32>, status: JobStatus, forced: bool) {
        debug!(job = %name, ?pid, %status, forced, "JobQueue::mark_done: called");
        let now = self.clock.now();

        match pid {
            Some(pid) => {
                if let Some(idx) = self.running.iter().position(|r| r.name == name && r.pid == pid) {
                    let entry = self.running.remove(idx);
                    self.last_duration.insert(name.to_string(), now - entry.started_at);
                }
            }
            None => {
                if !self.is_running(name) {
                    self.remove_queued(name, forced);
                }
            }
        }

        let Some(job) = self.known_jobs.get(name) else {
            debug!(job = %name, "mark_done: job no longer known");
            return;
        };
        let update_last_run = pid.is_none() || job.waits();

        if update_last_run {
            self.last_run.insert(name.to_string(), now);
            self.completed.insert(name.to_string(), now);
            if status.is_ok() {
                self.last_success.insert(name.to_string(), now);
            }
            if let Err(e) = self.store.update_last_run(name, now) {
                warn!(job = %name, error = %e, "Failed to persist last-run time");
            }
        }
        self.last_status.insert(name.to_string(), status);
    }

    fn remove_queued(&mut self, name: &str, forced: bool) {
        let queue = if forced {
            &mut self.forced_queue
        } else {
            &mut self.run_queue
        };
        if let Some(idx) = queue.iter().position(|n| n == name) {
            queue.remove(idx);
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.running.iter().any(|r| r.name == name)
    }

    pub fn is_queued(&self, name: &str, include_forced: bool) -> bool {
        self.run_queue.iter().any(|n| n == name) || (include_forced && self.forced_queue.iter().any(|n| n == name))
    }

    pub fn known_jobs(&self) -> &JobSet {
        &self.known_jobs
    }

    pub fn job(&self, name: &str) -> Option<&Job> {
        self.known_jobs.get(name)
    }

    pub fn run_queue(&self) -> &[String] {
        &self.run_queue
    }

    pub fn forced_queue(&self) -> &[String] {
        &self.forced_queue
    }

    pub fn running_jobs(&self) -> &[RunningJob] {
        &self.running
    }

    /// Number of running jobs whose exit the daemon waits for
    pub fn waited_running_count(&self) -> usize {
        self.running
            .iter()
            .filter(|r| self.known_jobs.get(&r.name).is_some_and(Job::waits))
            .count()
    }

    /// Most recent start of a running instance
    pub fn last_started_at(&self, name: &str) -> Option<i64> {
        self.running.iter().filter(|r| r.name == name).map(|r| r.started_at).max()
    }

    /// Time of the last recorded completion; `None` if the job never ran
    pub fn last_done_at(&self, name: &str) -> Option<i64> {
        self.completed.get(name).copied().filter(|&ts| ts > 0)
    }

    /// Time the schedule counts from
    pub fn schedule_base(&self, name: &str) -> i64 {
        self.last_run.get(name).copied().unwrap_or(0)
    }

    pub fn last_duration(&self, name: &str) -> Option<i64> {
        self.last_duration.get(name).copied()
    }

    pub fn last_status(&self, name: &str) -> Option<&JobStatus> {
        self.last_status.get(name)
    }

    pub fn last_success(&self, name: &str) -> Option<i64> {
        self.last_success.get(name).copied()
    }

    /// Owned copy of the state the health reporter reads
    pub fn snapshot(&self, paused_since: Option<i64>) -> QueueSnapshot {
        QueueSnapshot {
            taken_at: self.clock.now(),
            paused_since,
            jobs: self
                .known_jobs
                .iter()
                .map(|job| JobSnapshot {
                    name: job.name.clone(),
                    health: job.health.clone(),
                    last_status: self.last_status.get(&job.name).cloned(),
                    last_run: self.last_done_at(&job.name),
                    last_success: self.last_success(&job.name),
                    running: self.is_running(&job.name),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::job::{ProcessSpec, StaticJobSource};
    use crate::schedule::{ExclusionWindow, HOUR, TimeSpec, When};
    use proptest::prelude::*;
    use std::sync::Mutex;

    const MONDAY: i64 = 1_704_067_200;

    /// Source whose contents tests can swap after handing it to the queue
    #[derive(Clone, Default)]
    struct SharedSource(Arc<Mutex<Option<JobSet>>>);

    impl SharedSource {
        fn set(&self, jobs: Vec<Job>) {
            *self.0.lock().unwrap() = Some(JobSet::from_jobs(jobs).unwrap());
        }
    }

    impl JobSource for SharedSource {
        fn get_jobs(&self) -> Result<JobSet, JobError> {
            Ok(self.0.lock().unwrap().clone().unwrap_or_default())
        }

        fn reload(&mut self) -> Result<(), JobError> {
            Ok(())
        }

        fn describe(&self) -> String {
            "shared".to_string()
        }
    }

    /// Store whose writes tests can observe
    #[derive(Clone, Default)]
    struct SharedStore(Arc<Mutex<HashMap<String, i64>>>);

    impl LastRunStore for SharedStore {
        fn get_last_run(&self) -> eyre::Result<HashMap<String, i64>> {
            Ok(self.0.lock().unwrap().clone())
        }

        fn update_last_run(&mut self, name: &str, ts: i64) -> eyre::Result<()> {
            self.0.lock().unwrap().insert(name.to_string(), ts);
            Ok(())
        }
    }

    fn action() -> ProcessSpec {
        ProcessSpec::new("/bin/true")
    }

    fn queue_with(jobs: Vec<Job>) -> (JobQueue, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(MONDAY));
        let source = StaticJobSource::new(JobSet::from_jobs(jobs).unwrap());
        let queue = JobQueue::new(Box::new(source), Box::new(MemoryRunStore::new()), clock.clone()).unwrap();
        (queue, clock)
    }

    fn scenario_a() -> Vec<Job> {
        vec![
            Job::new("pre_job"),
            Job::new("post_job"),
            Job::new("test_job").with_pre(["pre_job"]).with_post(["post_job"]),
        ]
    }

    #[test]
    fn test_scenario_a_insert_order() {
        let (queue, clock) = queue_with(scenario_a());
        let mut q = Vec::new();
        queue.insert_job(&mut q, "test_job", clock.now());
        assert_eq!(q, vec!["pre_job", "test_job", "post_job"]);
    }

    #[test]
    fn test_pre_before_job() {
        let (queue, clock) = queue_with(vec![Job::new("A"), Job::new("B").with_pre(["A"])]);
        let mut q = Vec::new();
        queue.insert_job(&mut q, "B", clock.now());
        queue.insert_job(&mut q, "A", clock.now());
        assert_eq!(q, vec!["A", "B"]);
    }

    #[test]
    fn test_insert_respects_max_freq() {
        let (mut queue, clock) = queue_with(vec![Job::new("A").with_max_freq(600)]);
        queue.mark_done("A", None, JobStatus::Ok, false);

        let mut q = Vec::new();
        clock.advance(600);
        queue.insert_job(&mut q, "A", clock.now());
        assert!(q.is_empty());

        clock.advance(1);
        queue.insert_job(&mut q, "A", clock.now());
        assert_eq!(q, vec!["A"]);
    }

    #[test]
    fn test_insert_skips_running_job() {
        let (mut queue, clock) = queue_with(vec![Job::new("A").with_action(action())]);
        queue.mark_started("A", 4242, false);
        let mut q = Vec::new();
        queue.insert_job(&mut q, "A", clock.now());
        assert!(q.is_empty());
    }

    #[test]
    fn test_multi_ok_allows_duplicates() {
        let (queue, clock) = queue_with(vec![Job::new("A").with_multi_ok(true)]);
        let mut q = Vec::new();
        queue.insert_job(&mut q, "A", clock.now());
        queue.insert_job(&mut q, "A", clock.now());
        assert_eq!(q, vec!["A", "A"]);
    }

    proptest! {
        #[test]
        fn prop_insert_never_duplicates(order in proptest::collection::vec(0usize..4, 1..20)) {
            let names = ["a", "b", "c", "d"];
            let (queue, clock) = queue_with(vec![
                Job::new("a"),
                Job::new("b").with_pre(["a"]),
                Job::new("c").with_pre(["b"]).with_post(["d"]),
                Job::new("d").with_post(["a"]),
            ]);
            let mut q = Vec::new();
            for i in order {
                queue.insert_job(&mut q, names[i], clock.now());
            }
            for name in names {
                prop_assert!(q.iter().filter(|n| *n == name).count() <= 1);
            }
        }
    }

    #[test]
    fn test_conflict_while_running_and_after_reap() {
        let (mut queue, _clock) = queue_with(vec![
            Job::new("X").with_action(action()).with_nonconcurrent(["Y"]),
            Job::new("Y").with_action(action()),
        ]);
        assert!(!queue.is_conflicting("X"));

        queue.mark_started("Y", 100, true);
        assert!(queue.is_conflicting("X"));

        queue.mark_done("Y", Some(100), JobStatus::Ok, true);
        assert!(!queue.is_conflicting("X"));
    }

    #[test]
    fn test_scenario_a_blocking_sequence() {
        let (mut queue, _clock) = queue_with(
            scenario_a()
                .into_iter()
                .map(|j| j.with_action(action()))
                .collect(),
        );
        queue.enqueue_with_deps("test_job").unwrap();
        assert_eq!(queue.run_queue(), ["pre_job", "test_job", "post_job"]);

        assert!(!queue.is_blocked("pre_job"));
        assert!(queue.is_blocked("test_job"));
        assert!(queue.is_blocked("post_job"));

        queue.mark_started("pre_job", 1, false);
        assert!(queue.is_blocked("test_job"));
        queue.mark_done("pre_job", Some(1), JobStatus::Ok, false);
        assert!(!queue.is_blocked("test_job"));
        assert!(queue.is_blocked("post_job"));

        queue.mark_started("test_job", 2, false);
        assert!(queue.is_blocked("post_job"));
        queue.mark_done("test_job", Some(2), JobStatus::Ok, false);
        assert!(!queue.is_blocked("post_job"));
    }

    #[test]
    fn test_blocking_is_asymmetric_between_top_and_nested_levels() {
        // A needs B first; B must be followed by C
        let (mut queue, _clock) = queue_with(vec![
            Job::new("A").with_pre(["B"]),
            Job::new("B").with_post(["C"]),
            Job::new("C"),
        ]);
        queue.run_queue = vec!["C".to_string(), "A".to_string()];

        // Nested: A reaches B, and from B follows post edges to the queued C
        assert!(queue.is_blocked("A"));
        // Top level: C only looks for queued jobs listing it as post; B is not queued
        assert!(!queue.is_blocked("C"));

        // A top-level job is never held back by its own queued post job
        queue.run_queue = vec!["B".to_string(), "C".to_string()];
        assert!(!queue.is_blocked("B"));
        assert!(queue.is_blocked("C"));
    }

    #[test]
    fn test_blocking_ignores_self_through_post_loop() {
        // B runs before A and lists A as its follow-up
        let (mut queue, _clock) = queue_with(vec![Job::new("A").with_pre(["B"]), Job::new("B").with_post(["A"])]);
        queue.run_queue = vec!["A".to_string()];
        assert!(!queue.is_blocked("A"));
    }

    #[test]
    fn test_forced_queue_and_unknown_job() {
        let (mut queue, _clock) = queue_with(scenario_a());
        queue.enqueue_forced("test_job").unwrap();
        assert_eq!(queue.forced_queue(), ["test_job"]);
        assert!(queue.run_queue().is_empty());
        assert!(queue.enqueue_forced("nope").is_err());
        assert!(queue.enqueue_with_deps("nope").is_err());
    }

    #[test]
    fn test_barrier_done_removes_queue_entry() {
        let (mut queue, clock) = queue_with(scenario_a());
        queue.enqueue_with_deps("test_job").unwrap();
        queue.mark_done("pre_job", None, JobStatus::Ok, false);
        assert_eq!(queue.run_queue(), ["test_job", "post_job"]);
        assert_eq!(queue.last_done_at("pre_job"), Some(clock.now()));
        assert_eq!(queue.last_status("pre_job"), Some(&JobStatus::Ok));
    }

    #[test]
    fn test_fire_and_forget_exit_keeps_last_run() {
        let (mut queue, clock) = queue_with(vec![Job::new("agent").with_action(action().wait(false))]);
        queue.mark_started("agent", 77, false);
        queue.mark_done("agent", None, JobStatus::Ok, false);
        let launched = clock.now();
        assert_eq!(queue.last_done_at("agent"), Some(launched));
        assert!(queue.is_running("agent"));

        clock.advance(300);
        queue.mark_done("agent", Some(77), JobStatus::Failed("exit_code=1".into()), false);
        assert!(!queue.is_running("agent"));
        assert_eq!(queue.last_done_at("agent"), Some(launched));
        assert_eq!(queue.last_status("agent"), Some(&JobStatus::Failed("exit_code=1".into())));
    }

    #[test]
    fn test_waited_job_updates_duration_and_store() {
        let clock = Arc::new(ManualClock::new(MONDAY));
        let store = SharedStore::default();
        let source = StaticJobSource::new(JobSet::from_jobs([Job::new("A").with_action(action())]).unwrap());
        let mut queue = JobQueue::new(Box::new(source), Box::new(store.clone()), clock.clone()).unwrap();

        queue.run_queue.push("A".to_string());
        queue.mark_started("A", 9, false);
        assert!(queue.run_queue().is_empty());
        clock.advance(42);
        queue.mark_done("A", Some(9), JobStatus::Ok, false);

        assert_eq!(queue.last_duration("A"), Some(42));
        assert_eq!(queue.last_success("A"), Some(MONDAY + 42));
        assert_eq!(store.0.lock().unwrap().get("A"), Some(&(MONDAY + 42)));
    }

    #[test]
    fn test_compute_due_queues_overdue_and_reports_min_wait() {
        let (mut queue, clock) = queue_with(vec![
            Job::new("often").with_when(When::every(60)),
            Job::new("hourly").with_when(When::every(3600)),
            Job::new("manual"),
        ]);
        // Never-run frequency jobs are due immediately
        assert_eq!(queue.refresh(), IDLE_WAIT);
        assert_eq!(queue.run_queue(), ["hourly", "often"]);

        queue.mark_done("hourly", None, JobStatus::Ok, false);
        queue.mark_done("often", None, JobStatus::Ok, false);
        clock.advance(10);
        assert_eq!(queue.refresh(), 50);
        assert!(queue.run_queue().is_empty());
    }

    #[test]
    fn test_compute_due_does_not_requeue_waiting_multi_ok_job() {
        let (mut queue, _clock) = queue_with(vec![Job::new("often").with_when(When::every(60)).with_multi_ok(true)]);
        queue.refresh();
        queue.refresh();
        assert_eq!(queue.run_queue(), ["often"]);
    }

    #[test]
    fn test_calendar_job_does_not_fire_on_first_load() {
        let (mut queue, _clock) = queue_with(vec![Job::new("nightly").with_when(When::at(
            TimeSpec::new().with_min([0]).with_hour([2]),
        ))]);
        assert_eq!(queue.refresh(), 2 * HOUR);
        assert!(queue.run_queue().is_empty());

        // The load-time seed drives the schedule but is not reported as a run
        assert_eq!(queue.schedule_base("nightly"), MONDAY);
        assert_eq!(queue.last_done_at("nightly"), None);
        assert_eq!(queue.snapshot(None).jobs[0].last_run, None);
    }

    #[test]
    fn test_exclusion_window_postpones_due_job() {
        let (mut queue, clock) = queue_with(vec![
            Job::new("import")
                .with_when(When::every(600))
                .with_not_when(ExclusionWindow::new(vec![TimeSpec::new().with_hour([2])])),
        ]);
        clock.set(MONDAY + 2 * HOUR + 45 * 60);
        assert_eq!(queue.refresh(), 15 * 60);
        assert!(queue.run_queue().is_empty());
    }

    #[test]
    fn test_stored_last_run_wins() {
        let clock = Arc::new(ManualClock::new(MONDAY));
        let store = MemoryRunStore::with_runs([("A".to_string(), MONDAY - 30), ("gone".to_string(), 5)]);
        let source = StaticJobSource::new(JobSet::from_jobs([Job::new("A").with_when(When::every(60))]).unwrap());
        let mut queue = JobQueue::new(Box::new(source), Box::new(store), clock).unwrap();

        assert_eq!(queue.last_done_at("A"), Some(MONDAY - 30));
        assert_eq!(queue.last_done_at("gone"), None);
        assert_eq!(queue.refresh(), 30);
    }

    #[test]
    fn test_reload_preserves_and_discards() {
        let clock = Arc::new(ManualClock::new(MONDAY));
        let source = SharedSource::default();
        source.set(vec![Job::new("keep"), Job::new("drop")]);
        let mut queue =
            JobQueue::new(Box::new(source.clone()), Box::new(MemoryRunStore::new()), clock.clone()).unwrap();

        queue.mark_done("keep", None, JobStatus::Ok, false);
        queue.mark_done("drop", None, JobStatus::Failed("boom".into()), false);
        queue.run_queue = vec!["drop".to_string()];

        source.set(vec![Job::new("keep"), Job::new("fresh")]);
        let summary = queue.reload().unwrap();
        assert_eq!(summary.added, vec!["fresh"]);
        assert_eq!(summary.removed, vec!["drop"]);

        assert_eq!(queue.last_done_at("keep"), Some(MONDAY));
        assert_eq!(queue.last_done_at("drop"), None);
        assert_eq!(queue.last_status("drop"), None);
        assert!(queue.run_queue().is_empty());
        assert_eq!(queue.last_done_at("fresh"), None);
    }

    #[test]
    fn test_mark_done_for_removed_job_reaps_only() {
        let clock = Arc::new(ManualClock::new(MONDAY));
        let source = SharedSource::default();
        source.set(vec![Job::new("old").with_action(action())]);
        let mut queue = JobQueue::new(Box::new(source.clone()), Box::new(MemoryRunStore::new()), clock).unwrap();

        queue.mark_started("old", 5, false);
        source.set(vec![]);
        queue.reload().unwrap();
        assert!(queue.is_running("old"));

        queue.mark_done("old", Some(5), JobStatus::Ok, false);
        assert!(!queue.is_running("old"));
        assert_eq!(queue.last_status("old"), None);
    }

    #[test]
    fn test_waited_running_count_ignores_fire_and_forget() {
        let (mut queue, _clock) = queue_with(vec![
            Job::new("waited").with_action(action()),
            Job::new("agent").with_action(action().wait(false)),
        ]);
        queue.mark_started("waited", 1, false);
        queue.mark_started("agent", 2, false);
        assert_eq!(queue.waited_running_count(), 1);
    }

    #[test]
    fn test_snapshot() {
        let (mut queue, _clock) = queue_with(vec![Job::new("A"), Job::new("B").with_action(action())]);
        queue.mark_done("A", None, JobStatus::Ok, false);
        queue.mark_started("B", 3, false);

        let snap = queue.snapshot(Some(10));
        assert_eq!(snap.paused_since, Some(10));
        assert_eq!(snap.jobs.len(), 2);
        assert_eq!(snap.jobs[0].last_success, Some(MONDAY));
        assert!(snap.jobs[1].running);
    }
}
