//! Text answers for STATUS and SHOWJOB

use chrono::{DateTime, Local};

use crate::queue::JobQueue;
use crate::schedule::{DAY, format_duration};

const NAME_WIDTH: usize = 35;

fn local(ts: i64) -> Option<DateTime<Local>> {
    DateTime::from_timestamp(ts, 0).map(|dt| dt.with_timezone(&Local))
}

/// `HH:MM:SS` in local time
pub fn clock_time(ts: i64) -> String {
    local(ts)
        .map(|dt| dt.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

/// `YYYY-mm-dd HH:MM:SS` in local time
pub fn date_time(ts: i64) -> String {
    local(ts)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn days_ago(ts: i64, now: i64) -> String {
    match (now - ts) / DAY {
        0 => String::new(),
        1 => " (1 day ago)".to_string(),
        days => format!(" ({} days ago)", days),
    }
}

fn list(names: &[String]) -> String {
    if names.is_empty() {
        "-".to_string()
    } else {
        names.join(", ")
    }
}

/// Full scheduler state
pub fn status(queue: &JobQueue, paused_since: Option<i64>, sleep_to: Option<i64>) -> String {
    let now = queue.now();
    let mut lines = Vec::new();

    lines.push("Running jobs:".to_string());
    for job in queue.running_jobs() {
        lines.push(format!(
            "  {:<width$} pid {:<8} started {}",
            job.name,
            job.pid,
            clock_time(job.started_at),
            width = NAME_WIDTH
        ));
    }

    lines.push("Ready queue:".to_string());
    for name in queue.run_queue() {
        lines.push(format!("  {}", name));
    }

    if !queue.forced_queue().is_empty() {
        lines.push("Forced queue:".to_string());
        for name in queue.forced_queue() {
            lines.push(format!("  {}", name));
        }
    }

    lines.push(format!("{:<width$}   Last run  Last duration", "Known jobs", width = NAME_WIDTH));
    for name in queue.known_jobs().names() {
        let mut line = match queue.last_done_at(name) {
            Some(ts) => clock_time(ts),
            None => "never   ".to_string(),
        };
        match queue.last_duration(name) {
            Some(secs) => line.push_str(&format!("  {}", format_duration(secs))),
            None => line.push_str("  unknown"),
        }
        if let Some(ts) = queue.last_done_at(name) {
            line.push_str(&days_ago(ts, now));
        }
        lines.push(format!("  {:<width$} {}", name, line, width = NAME_WIDTH));
    }

    if let Some(since) = paused_since {
        lines.push(format!(
            "Paused since {} ({})",
            date_time(since),
            format_duration(now - since)
        ));
    }
    if let Some(to) = sleep_to {
        lines.push(format!("Sleep to {} ({} seconds)", clock_time(to), (to - now).max(0)));
    }

    lines.join("\n")
}

/// One job's definition and state, `None` when the job is unknown
pub fn show_job(queue: &JobQueue, name: &str) -> Option<String> {
    let job = queue.job(name)?;
    let now = queue.now();
    let mut lines = vec![format!("Job: {}", job.name)];

    let command = job
        .action
        .as_ref()
        .map(|a| {
            let mut cmd = a.pretty_cmd();
            if !a.wait {
                cmd.push_str(" (no wait)");
            }
            cmd
        })
        .unwrap_or_else(|| "- (barrier)".to_string());
    lines.push(format!("  Command:        {}", command));
    lines.push(format!(
        "  Schedule:       {}",
        job.when.as_ref().map(ToString::to_string).unwrap_or_else(|| "-".to_string())
    ));
    if let Some(window) = &job.not_when {
        lines.push(format!("  Not when:       {}", window));
    }
    lines.push(format!("  Pre:            {}", list(&job.pre)));
    lines.push(format!("  Post:           {}", list(&job.post)));
    lines.push(format!("  Nonconcurrent:  {}", list(&job.nonconcurrent)));
    if let Some(freq) = job.max_freq {
        lines.push(format!("  Max freq:       {}", format_duration(freq as i64)));
    }
    lines.push(format!(
        "  Max duration:   {}",
        job.max_duration
            .map(|d| format_duration(d as i64))
            .unwrap_or_else(|| "none".to_string())
    ));
    if job.multi_ok {
        lines.push("  Multi ok:       yes".to_string());
    }

    match queue.last_done_at(name) {
        Some(ts) => lines.push(format!("  Last run:       {}{}", date_time(ts), days_ago(ts, now))),
        None => lines.push("  Last run:       never".to_string()),
    }
    if let Some(secs) = queue.last_duration(name) {
        lines.push(format!("  Last duration:  {}", format_duration(secs)));
    }
    if let Some(status) = queue.last_status(name) {
        lines.push(format!("  Last status:    {}", status));
    }

    let last = queue.schedule_base(name);
    match job.next_delta(last, now, queue.clock().as_ref()) {
        Ok(Some(delta)) if delta > 0 => lines.push(format!("  Next run in:    {}", format_duration(delta))),
        Ok(Some(_)) => lines.push("  Next run in:    due".to_string()),
        Ok(None) => {}
        Err(e) => lines.push(format!("  Next run in:    {}", e)),
    }

    for run in queue.running_jobs().iter().filter(|r| r.name == name) {
        lines.push(format!(
            "  Running:        pid {} since {}",
            run.pid,
            clock_time(run.started_at)
        ));
    }
    if queue.is_queued(name, true) {
        lines.push("  Queued:         yes".to_string());
    }

    Some(lines.join("\n"))
}
