//! Validated collection of job definitions

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write;

use tracing::debug;

use super::{Job, JobError};
use crate::schedule::format_duration;

/// Immutable, validated mapping of job name to definition
///
/// Guarantees: names are unique, every `pre`, `post` and `nonconcurrent`
/// reference resolves, schedules are well-formed and the `pre` graph is
/// acyclic.
#[derive(Debug, Clone, Default)]
pub struct JobSet {
    jobs: BTreeMap<String, Job>,
}

impl JobSet {
    pub fn builder() -> JobSetBuilder {
        JobSetBuilder::default()
    }

    /// Build a set from jobs, failing on the first duplicate or invalid reference
    pub fn from_jobs(jobs: impl IntoIterator<Item = Job>) -> Result<Self, JobError> {
        let mut builder = Self::builder();
        for job in jobs {
            builder.add(job)?;
        }
        builder.build()
    }

    pub fn get(&self, name: &str) -> Option<&Job> {
        self.jobs.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Jobs in name order
    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.jobs.keys().map(String::as_str)
    }

    /// Indented tree of every scheduled job with its pre and post jobs
    ///
    /// `detail` adds the schedule (1), `max-freq` (2) and the raw pre/post
    /// lists (3). Jobs never reached from a scheduled job are listed last.
    pub fn dump(&self, detail: u8) -> String {
        debug!(detail, "JobSet::dump: called");
        let mut out = String::new();
        let mut shown = HashSet::new();
        for job in self.jobs.values().filter(|j| j.when.is_some()) {
            let mut path = Vec::new();
            self.dump_job(&job.name, 0, detail, &mut shown, &mut path, &mut out);
        }

        let never: Vec<&str> = self.names().filter(|n| !shown.contains(*n)).collect();
        if !never.is_empty() {
            out.push_str("Never run:\n");
            for name in never {
                let _ = writeln!(out, "  {}", name);
            }
        }
        out
    }

    fn dump_job<'a>(
        &'a self,
        name: &'a str,
        indent: usize,
        detail: u8,
        shown: &mut HashSet<&'a str>,
        path: &mut Vec<&'a str>,
        out: &mut String,
    ) {
        let Some(job) = self.jobs.get(name) else {
            return;
        };
        let mut info = Vec::new();
        if detail > 0
            && let Some(when) = &job.when
        {
            info.push(when.to_string());
        }
        if detail > 1
            && let Some(max_freq) = job.max_freq
        {
            info.push(format!("max-freq={}", format_duration(max_freq as i64)));
        }
        if detail > 2 {
            if !job.pre.is_empty() {
                info.push(format!("pre=[{}]", job.pre.join(", ")));
            }
            if !job.post.is_empty() {
                info.push(format!("post=[{}]", job.post.join(", ")));
            }
        }

        let label = format!("{}{}", "   ".repeat(indent), name);
        let line = format!("{:<40} {}", label, info.join(", "));
        let _ = writeln!(out, "{}", line.trim_end());
        shown.insert(name);

        // post edges are not checked for cycles
        if path.contains(&name) {
            return;
        }
        path.push(name);
        for dep in job.pre.iter().chain(job.post.iter()) {
            self.dump_job(dep, indent + 2, detail, shown, path, out);
        }
        path.pop();
    }
}

/// Incremental construction of a [`JobSet`]
#[derive(Debug, Default)]
pub struct JobSetBuilder {
    jobs: BTreeMap<String, Job>,
}

impl JobSetBuilder {
    /// Add a job, rejecting a name that is already present
    pub fn add(&mut self, job: Job) -> Result<&mut Self, JobError> {
        if self.jobs.contains_key(&job.name) {
            return Err(JobError::Duplicate { name: job.name });
        }
        self.jobs.insert(job.name.clone(), job);
        Ok(self)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    /// Validate references, schedules and the `pre` graph
    pub fn build(self) -> Result<JobSet, JobError> {
        debug!(count = self.jobs.len(), "JobSetBuilder::build: called");
        for job in self.jobs.values() {
            check_name(&job.name)?;
            job.validate_schedule()?;
            for (kind, refs) in [("pre", &job.pre), ("post", &job.post), ("nonconcurrent", &job.nonconcurrent)] {
                if let Some(target) = refs.iter().find(|r| !self.jobs.contains_key(*r)) {
                    return Err(JobError::UnknownReference {
                        job: job.name.clone(),
                        kind,
                        target: target.clone(),
                    });
                }
            }
        }

        if let Some(cycle) = find_cycle(&self.jobs) {
            return Err(JobError::Cycle(cycle));
        }

        Ok(JobSet { jobs: self.jobs })
    }
}

/// Job names become file names under the state directory
fn check_name(name: &str) -> Result<(), JobError> {
    let reason = if name.is_empty() {
        "must not be empty"
    } else if name.starts_with('.') {
        "must not start with '.'"
    } else if name.contains(['/', '\0']) {
        "must not contain '/' or NUL"
    } else {
        return Ok(());
    };
    Err(JobError::InvalidName {
        name: name.to_string(),
        reason,
    })
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

/// Find a cycle over `pre` edges using three-colour DFS
///
/// The returned names are the cycle itself, starting at the job that was
/// re-entered and following `pre` edges.
pub fn find_cycle(jobs: &BTreeMap<String, Job>) -> Option<Vec<String>> {
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut stack: Vec<&str> = Vec::new();
    for name in jobs.keys() {
        if !marks.contains_key(name.as_str())
            && let Some(cycle) = visit(jobs, name, &mut marks, &mut stack)
        {
            debug!(?cycle, "find_cycle: cycle found");
            return Some(cycle);
        }
    }
    None
}

fn visit<'a>(
    jobs: &'a BTreeMap<String, Job>,
    name: &'a str,
    marks: &mut HashMap<&'a str, Mark>,
    stack: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    marks.insert(name, Mark::InProgress);
    stack.push(name);

    if let Some(job) = jobs.get(name) {
        for dep in &job.pre {
            match marks.get(dep.as_str()) {
                Some(Mark::InProgress) => {
                    let start = stack.iter().position(|n| *n == dep.as_str()).unwrap_or(0);
                    return Some(stack[start..].iter().map(|s| s.to_string()).collect());
                }
                Some(Mark::Done) => {}
                None => {
                    if let Some(cycle) = visit(jobs, dep, marks, stack) {
                        return Some(cycle);
                    }
                }
            }
        }
    }

    stack.pop();
    marks.insert(name, Mark::Done);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::When;
    use proptest::prelude::*;

    fn is_rotation(found: &[String], expected: &[&str]) -> bool {
        if found.len() != expected.len() {
            return false;
        }
        (0..expected.len()).any(|shift| (0..expected.len()).all(|i| found[i] == expected[(i + shift) % expected.len()]))
    }

    #[test]
    fn test_duplicate_rejected_on_insert() {
        let mut builder = JobSet::builder();
        builder.add(Job::new("a")).unwrap();
        let err = builder.add(Job::new("a")).unwrap_err();
        assert!(matches!(err, JobError::Duplicate { name } if name == "a"));
    }

    #[test]
    fn test_names_unsafe_as_paths_rejected() {
        for name in ["", "../x", "/tmp/foo", ".hidden", "a/b", "nul\0byte"] {
            let err = JobSet::from_jobs([Job::new(name)]).unwrap_err();
            assert!(matches!(err, JobError::InvalidName { name: ref n, .. } if n == name), "accepted {name:?}");
        }
        JobSet::from_jobs([Job::new("nightly-backup.v2")]).unwrap();
    }

    #[test]
    fn test_unknown_pre_reference() {
        let err = JobSet::from_jobs([Job::new("a").with_pre(["missing"])]).unwrap_err();
        assert!(matches!(
            err,
            JobError::UnknownReference { ref job, kind: "pre", ref target } if job == "a" && target == "missing"
        ));
    }

    #[test]
    fn test_unknown_post_reference() {
        let err = JobSet::from_jobs([Job::new("a").with_post(["gone"])]).unwrap_err();
        assert!(matches!(err, JobError::UnknownReference { kind: "post", .. }));
    }

    #[test]
    fn test_unknown_nonconcurrent_reference() {
        let err = JobSet::from_jobs([Job::new("a").with_nonconcurrent(["gone"])]).unwrap_err();
        assert!(matches!(err, JobError::UnknownReference { kind: "nonconcurrent", .. }));
    }

    #[test]
    fn test_invalid_schedule_rejected() {
        let err = JobSet::from_jobs([Job::new("a").with_when(When::every(0))]).unwrap_err();
        assert!(matches!(err, JobError::Schedule { ref job, .. } if job == "a"));
    }

    #[test]
    fn test_three_cycle_is_rotation() {
        let err = JobSet::from_jobs([
            Job::new("A").with_pre(["B"]),
            Job::new("B").with_pre(["C"]),
            Job::new("C").with_pre(["A"]),
        ])
        .unwrap_err();
        let JobError::Cycle(cycle) = err else {
            panic!("expected cycle, got {err:?}");
        };
        assert!(is_rotation(&cycle, &["A", "B", "C"]), "got {cycle:?}");
    }

    #[test]
    fn test_cycle_excludes_entry_path() {
        // X leads into the A-B cycle but is not part of it
        let err = JobSet::from_jobs([
            Job::new("X").with_pre(["A"]),
            Job::new("A").with_pre(["B"]),
            Job::new("B").with_pre(["A"]),
        ])
        .unwrap_err();
        let JobError::Cycle(cycle) = err else {
            panic!("expected cycle");
        };
        assert!(is_rotation(&cycle, &["A", "B"]), "got {cycle:?}");
    }

    #[test]
    fn test_self_cycle() {
        let err = JobSet::from_jobs([Job::new("A").with_pre(["A"])]).unwrap_err();
        assert!(matches!(err, JobError::Cycle(c) if c == vec!["A".to_string()]));
    }

    #[test]
    fn test_post_edges_may_loop() {
        // Only pre edges have to be acyclic
        let set = JobSet::from_jobs([Job::new("A").with_post(["B"]), Job::new("B").with_post(["A"])]).unwrap();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_diamond_is_acyclic() {
        let set = JobSet::from_jobs([
            Job::new("top").with_pre(["left", "right"]),
            Job::new("left").with_pre(["base"]),
            Job::new("right").with_pre(["base"]),
            Job::new("base"),
        ])
        .unwrap();
        assert_eq!(set.names().collect::<Vec<_>>(), vec!["base", "left", "right", "top"]);
    }

    #[test]
    fn test_dump_tree_and_never_run() {
        let set = JobSet::from_jobs([
            Job::new("nightly").with_when(When::every(86_400)).with_pre(["fetch"]).with_post(["notify"]),
            Job::new("fetch"),
            Job::new("notify"),
            Job::new("orphan"),
        ])
        .unwrap();

        let out = set.dump(1);
        let lines: Vec<&str> = out.lines().collect();
        assert!(lines[0].starts_with("nightly"));
        assert!(lines[0].ends_with("every 1d"));
        assert_eq!(lines[1].trim_end(), "      fetch");
        assert_eq!(lines[2].trim_end(), "      notify");
        assert_eq!(lines[3], "Never run:");
        assert_eq!(lines[4], "  orphan");
    }

    #[test]
    fn test_dump_survives_post_loop() {
        let set = JobSet::from_jobs([
            Job::new("A").with_when(When::every(60)).with_post(["B"]),
            Job::new("B").with_post(["A"]),
        ])
        .unwrap();
        assert_eq!(set.dump(0).lines().count(), 3);
    }

    proptest! {
        #[test]
        fn prop_forward_edges_never_cycle(edges in proptest::collection::vec((0usize..12, 0usize..12), 0..40)) {
            // pre edges only point at lower-numbered jobs
            let mut pre: Vec<Vec<String>> = vec![Vec::new(); 12];
            for (a, b) in edges {
                if a > b && !pre[a].contains(&format!("j{b}")) {
                    pre[a].push(format!("j{b}"));
                }
            }
            let jobs = pre.into_iter().enumerate().map(|(i, p)| Job::new(format!("j{i}")).with_pre(p));
            prop_assert!(JobSet::from_jobs(jobs).is_ok());
        }
    }
}
