//! Point-in-time views of queue state

use std::fmt;

use serde::Serialize;

use crate::job::HealthCheckSpec;

/// Outcome of a job's most recent completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Ok,
    Failed(String),
}

impl JobStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, JobStatus::Ok)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Ok => write!(f, "ok"),
            JobStatus::Failed(message) => write!(f, "{}", message),
        }
    }
}

/// A launched process the queue is tracking
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunningJob {
    pub name: String,
    pub pid: u32,
    pub started_at: i64,
}

/// Jobs added and removed by a reload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl fmt::Display for ReloadSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.added.is_empty() && self.removed.is_empty() {
            return write!(f, "no jobs added or removed");
        }
        let mut parts = Vec::new();
        if !self.added.is_empty() {
            parts.push(format!("added: {}", self.added.join(", ")));
        }
        if !self.removed.is_empty() {
            parts.push(format!("removed: {}", self.removed.join(", ")));
        }
        write!(f, "{}", parts.join("; "))
    }
}

/// Per-job fields the health reporter needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSnapshot {
    pub name: String,
    pub health: Option<HealthCheckSpec>,
    pub last_status: Option<JobStatus>,
    pub last_run: Option<i64>,
    pub last_success: Option<i64>,
    pub running: bool,
}

/// Owned copy of the queue state, safe to hand to other tasks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub taken_at: i64,
    pub paused_since: Option<i64>,
    pub jobs: Vec<JobSnapshot>,
}
