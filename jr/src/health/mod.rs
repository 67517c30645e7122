//! Health report
//!
//! A JSON document for monitoring: which jobs have checks, whether each one
//! last completed cleanly and how far past its allowed interval it is.

mod reporter;

pub use reporter::{HealthReporter, write_report};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::queue::{JobStatus, QueueSnapshot};

/// One job's checks, for auto-registration in the monitoring system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryEntry {
    pub job: String,
    pub status: bool,
    pub overdue: bool,
}

/// Current health of one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHealth {
    pub is_ok: bool,
    pub last_status: String,
    pub is_running: bool,
    pub last_run: Option<i64>,
    pub last_success: Option<i64>,
    /// Seconds past the allowed interval; negative means within it
    pub is_overdue: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportState {
    pub now: i64,
    pub paused_since: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub discovery: Vec<DiscoveryEntry>,
    pub jobs: BTreeMap<String, JobHealth>,
    pub state: ReportState,
}

/// Build the report for every job that has a health spec
pub fn build_report(snapshot: &QueueSnapshot, now: i64) -> HealthReport {
    let mut discovery = Vec::new();
    let mut jobs = BTreeMap::new();

    for job in &snapshot.jobs {
        let Some(health) = &job.health else {
            continue;
        };
        discovery.push(DiscoveryEntry {
            job: job.name.clone(),
            status: health.check_status,
            overdue: health.check_overdue.is_some(),
        });

        // Falls back to the last completion so a job never seen to succeed
        // is not reported overdue right after startup
        let is_overdue = health.check_overdue.and_then(|allowed| {
            job.last_success
                .or(job.last_run)
                .map(|base| now - base - allowed as i64)
        });

        jobs.insert(
            job.name.clone(),
            JobHealth {
                is_ok: job.last_status.as_ref().is_none_or(JobStatus::is_ok),
                last_status: job.last_status.as_ref().map(ToString::to_string).unwrap_or_default(),
                is_running: job.running,
                last_run: job.last_run,
                last_success: job.last_success,
                is_overdue,
            },
        );
    }

    HealthReport {
        discovery,
        jobs,
        state: ReportState {
            now,
            paused_since: snapshot.paused_since,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::HealthCheckSpec;
    use crate::queue::JobSnapshot;

    const T: i64 = 1_704_067_200;

    fn snap(name: &str, health: Option<HealthCheckSpec>) -> JobSnapshot {
        JobSnapshot {
            name: name.to_string(),
            health,
            last_status: None,
            last_run: None,
            last_success: None,
            running: false,
        }
    }

    fn overdue_after(secs: u64) -> HealthCheckSpec {
        HealthCheckSpec {
            check_status: true,
            check_overdue: Some(secs),
        }
    }

    #[test]
    fn test_overdue_counts_from_last_success() {
        let mut job = snap("import", Some(overdue_after(30)));
        job.last_status = Some(JobStatus::Ok);
        job.last_run = Some(T);
        job.last_success = Some(T);
        let snapshot = QueueSnapshot {
            taken_at: T + 35,
            paused_since: None,
            jobs: vec![job],
        };

        let report = build_report(&snapshot, T + 35);
        let health = &report.jobs["import"];
        assert_eq!(health.is_overdue, Some(5));
        assert!(health.is_ok);
        assert_eq!(health.last_status, "ok");
        assert_eq!(
            report.discovery,
            vec![DiscoveryEntry {
                job: "import".to_string(),
                status: true,
                overdue: true
            }]
        );
    }

    #[test]
    fn test_overdue_falls_back_to_last_run() {
        let mut job = snap("import", Some(overdue_after(60)));
        job.last_status = Some(JobStatus::Failed("exit_code=1".to_string()));
        job.last_run = Some(T);
        let snapshot = QueueSnapshot {
            taken_at: T + 10,
            paused_since: None,
            jobs: vec![job],
        };

        let health = &build_report(&snapshot, T + 10).jobs["import"];
        assert_eq!(health.is_overdue, Some(-50));
        assert!(!health.is_ok);
        assert_eq!(health.last_status, "exit_code=1");
    }

    #[test]
    fn test_never_run_job_is_ok_and_not_overdue() {
        let snapshot = QueueSnapshot {
            taken_at: T,
            paused_since: Some(T - 5),
            jobs: vec![snap("fresh", Some(overdue_after(60)))],
        };
        let report = build_report(&snapshot, T);
        assert!(report.jobs["fresh"].is_ok);
        assert_eq!(report.jobs["fresh"].is_overdue, None);
        assert_eq!(report.state.paused_since, Some(T - 5));
    }

    #[test]
    fn test_jobs_without_health_spec_are_left_out() {
        let snapshot = QueueSnapshot {
            taken_at: T,
            paused_since: None,
            jobs: vec![snap("quiet", None), snap("watched", Some(HealthCheckSpec::default()))],
        };
        let report = build_report(&snapshot, T);
        assert_eq!(report.jobs.len(), 1);
        assert!(report.jobs.contains_key("watched"));
        assert!(!report.discovery[0].overdue);
    }

    #[test]
    fn test_report_json_shape() {
        let snapshot = QueueSnapshot {
            taken_at: T,
            paused_since: None,
            jobs: vec![snap("a", Some(HealthCheckSpec::default()))],
        };
        let json = serde_json::to_value(build_report(&snapshot, T)).unwrap();
        assert_eq!(json["discovery"][0]["job"], "a");
        assert_eq!(json["jobs"]["a"]["is_running"], false);
        assert_eq!(json["state"]["now"], T);
        assert!(json["state"]["paused_since"].is_null());
    }
}
