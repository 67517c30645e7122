//! Periodic writer of the health report file

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use eyre::{Context, Result};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{HealthReport, build_report};
use crate::clock::Clock;
use crate::queue::QueueSnapshot;

/// Write `report` as pretty JSON, replacing `path` atomically
pub fn write_report(path: &Path, report: &HealthReport) -> Result<()> {
    debug!(?path, "write_report: called");
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).context("Failed to create report directory")?;

    let file_name = path
        .file_name()
        .ok_or_else(|| eyre::eyre!("Report path has no file name: {}", path.display()))?;
    let mut tmp_name = std::ffi::OsString::from(".");
    tmp_name.push(file_name);
    tmp_name.push(".tmp");
    let tmp = dir.join(tmp_name);

    let json = serde_json::to_string_pretty(report).context("Failed to serialize health report")?;
    fs::write(&tmp, json).context("Failed to write temporary report file")?;
    fs::rename(&tmp, path).context("Failed to move report into place")?;
    Ok(())
}

/// Writes the health report on its own timer from engine snapshots
pub struct HealthReporter {
    path: PathBuf,
    interval: Duration,
    snapshots: watch::Receiver<QueueSnapshot>,
    clock: Arc<dyn Clock>,
}

impl HealthReporter {
    pub fn new(
        path: impl Into<PathBuf>,
        interval: Duration,
        snapshots: watch::Receiver<QueueSnapshot>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            path: path.into(),
            interval,
            snapshots,
            clock,
        }
    }

    /// Build and write one report from the latest snapshot
    pub fn write_once(&self) -> Result<()> {
        let report = {
            let snapshot = self.snapshots.borrow();
            build_report(&snapshot, self.clock.now())
        };
        write_report(&self.path, &report)
    }

    /// Write a report every interval until the engine goes away
    pub async fn run(mut self) {
        info!(path = ?self.path, interval = ?self.interval, "Health reporter starting");
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = self.snapshots.changed() => {
                    if changed.is_err() {
                        debug!("HealthReporter::run: engine gone");
                        break;
                    }
                    continue;
                }
            }
            if let Err(e) = self.write_once() {
                warn!(error = %e, "Failed to write health report");
            }
        }
        if let Err(e) = self.write_once() {
            warn!(error = %e, "Failed to write final health report");
        }
        info!("Health reporter stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::job::HealthCheckSpec;
    use crate::queue::{JobSnapshot, JobStatus};
    use tempfile::TempDir;

    const T: i64 = 1_704_067_200;

    fn snapshot() -> QueueSnapshot {
        QueueSnapshot {
            taken_at: T,
            paused_since: None,
            jobs: vec![JobSnapshot {
                name: "import".to_string(),
                health: Some(HealthCheckSpec {
                    check_status: true,
                    check_overdue: Some(30),
                }),
                last_status: Some(JobStatus::Ok),
                last_run: Some(T),
                last_success: Some(T),
                running: false,
            }],
        }
    }

    #[test]
    fn test_write_report_replaces_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("health").join("report.json");
        let report = build_report(&snapshot(), T);

        write_report(&path, &report).unwrap();
        write_report(&path, &report).unwrap();

        let written: HealthReport = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written, report);
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_write_report_to_unwritable_path_fails() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("file");
        fs::write(&blocker, "x").unwrap();
        let report = build_report(&snapshot(), T);
        assert!(write_report(&blocker.join("report.json"), &report).is_err());
    }

    #[tokio::test]
    async fn test_reporter_uses_clock_and_latest_snapshot() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("report.json");
        let (tx, rx) = watch::channel(QueueSnapshot::default());
        let clock = Arc::new(ManualClock::new(T + 35));
        let reporter = HealthReporter::new(&path, Duration::from_secs(60), rx, clock);

        tx.send_replace(snapshot());
        reporter.write_once().unwrap();

        let written: HealthReport = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written.jobs["import"].is_overdue, Some(5));
        assert_eq!(written.state.now, T + 35);
    }

    #[tokio::test]
    async fn test_reporter_stops_when_engine_goes_away() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("report.json");
        let (tx, rx) = watch::channel(snapshot());
        let reporter = HealthReporter::new(&path, Duration::from_secs(3600), rx, Arc::new(ManualClock::new(T)));

        let task = tokio::spawn(reporter.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(tx);
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(path.exists());
    }
}
