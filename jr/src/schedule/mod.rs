//! Time scheduler
//!
//! Pure functions computing how many seconds remain until a job is due.
//! A job is scheduled either on a fixed frequency or on calendar entries
//! ([`TimeSpec`]), optionally with an [`ExclusionWindow`] it must not start in.

mod time;

pub use time::TimeSpec;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::clock::Clock;

pub const MINUTE: i64 = 60;
pub const HOUR: i64 = 60 * MINUTE;
pub const DAY: i64 = 24 * HOUR;
pub const WEEK: i64 = 7 * DAY;

/// Errors from schedule validation and evaluation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("{field} list must not be empty")]
    EmptyList { field: &'static str },

    #[error("{field} value {value} out of range (max {max})")]
    OutOfRange { field: &'static str, value: u32, max: u32 },

    #[error("time list must not be empty")]
    NoTimes,

    #[error("frequency must be positive")]
    ZeroFrequency,

    #[error("no matching time found for [{spec}] after {attempts} attempts")]
    NoMatch { spec: String, attempts: usize },
}

/// When a job should run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WhenDef", into = "WhenDef")]
pub enum When {
    /// Every N seconds after the previous run
    Freq(u64),
    /// At the earliest of several calendar entries
    Time(Vec<TimeSpec>),
}

impl When {
    pub fn every(secs: u64) -> Self {
        When::Freq(secs)
    }

    pub fn at(spec: TimeSpec) -> Self {
        When::Time(vec![spec])
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        match self {
            When::Freq(0) => Err(ScheduleError::ZeroFrequency),
            When::Freq(_) => Ok(()),
            When::Time(specs) if specs.is_empty() => Err(ScheduleError::NoTimes),
            When::Time(specs) => specs.iter().try_for_each(TimeSpec::validate),
        }
    }

    /// Whether this is a calendar schedule
    pub fn is_calendar(&self) -> bool {
        matches!(self, When::Time(_))
    }

    /// Seconds from `now` until the job is due; zero or negative means due
    pub fn next_delta(&self, last_run: i64, now: i64, clock: &dyn Clock) -> Result<i64, ScheduleError> {
        match self {
            When::Freq(freq) => Ok(last_run + *freq as i64 - now),
            When::Time(specs) => {
                let mut best: Option<i64> = None;
                for spec in specs {
                    let delta = spec.next_time(last_run, clock)? + last_run - now;
                    best = Some(best.map_or(delta, |b| b.min(delta)));
                }
                best.ok_or(ScheduleError::NoTimes)
            }
        }
    }
}

/// On-disk shape of [`When`]: exactly one of `freq` or `time`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WhenDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    freq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    time: Option<Vec<TimeSpec>>,
}

impl TryFrom<WhenDef> for When {
    type Error = String;

    fn try_from(def: WhenDef) -> Result<Self, Self::Error> {
        match (def.freq, def.time) {
            (Some(freq), None) => Ok(When::Freq(freq)),
            (None, Some(time)) => Ok(When::Time(time)),
            (Some(_), Some(_)) => Err("schedule takes either freq or time, not both".to_string()),
            (None, None) => Err("schedule needs freq or time".to_string()),
        }
    }
}

impl From<When> for WhenDef {
    fn from(when: When) -> Self {
        match when {
            When::Freq(freq) => WhenDef {
                freq: Some(freq),
                time: None,
            },
            When::Time(time) => WhenDef {
                freq: None,
                time: Some(time),
            },
        }
    }
}

impl fmt::Display for When {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            When::Freq(secs) => write!(f, "every {}", format_duration(*secs as i64)),
            When::Time(specs) => {
                let parts: Vec<String> = specs.iter().map(|s| format!("[{}]", s)).collect();
                write!(f, "at {}", parts.join(" or "))
            }
        }
    }
}

/// Calendar window in which a job must not be started
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExclusionWindow {
    pub times: Vec<TimeSpec>,
}

impl ExclusionWindow {
    pub fn new(times: Vec<TimeSpec>) -> Self {
        Self { times }
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        if self.times.is_empty() {
            return Err(ScheduleError::NoTimes);
        }
        self.times.iter().try_for_each(TimeSpec::validate)
    }

    /// Whether `ts` falls inside the window
    pub fn contains(&self, ts: i64, clock: &dyn Clock) -> bool {
        let moment = clock.moment(ts);
        self.times.iter().any(|t| t.matches(&moment))
    }

    /// Seconds until the window is left; zero when `now` is outside it
    pub fn delta_to_leave(&self, now: i64, clock: &dyn Clock) -> i64 {
        if !self.contains(now, clock) {
            return 0;
        }
        let mut t = now - clock.moment(now).sec as i64 + MINUTE;
        while t - now <= WEEK {
            if !self.contains(t, clock) {
                debug!(now, leave_at = t, "ExclusionWindow::delta_to_leave: found exit");
                return t - now;
            }
            t += MINUTE;
        }
        WEEK
    }
}

impl fmt::Display for ExclusionWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.times.iter().map(|s| format!("[{}]", s)).collect();
        write!(f, "{}", parts.join(" or "))
    }
}

/// Render seconds as a compact `1d 2h 3m 4s` string
pub fn format_duration(secs: i64) -> String {
    if secs <= 0 {
        return "0s".to_string();
    }
    let mut parts = Vec::new();
    let (d, rem) = (secs / DAY, secs % DAY);
    let (h, rem) = (rem / HOUR, rem % HOUR);
    let (m, s) = (rem / MINUTE, rem % MINUTE);
    if d > 0 {
        parts.push(format!("{}d", d));
    }
    if h > 0 {
        parts.push(format!("{}h", h));
    }
    if m > 0 {
        parts.push(format!("{}m", m));
    }
    if s > 0 {
        parts.push(format!("{}s", s));
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const MONDAY: i64 = 1_704_067_200;

    #[test]
    fn test_freq_delta() {
        let clock = ManualClock::new(MONDAY);
        let when = When::every(600);
        assert_eq!(when.next_delta(1000, 1300, &clock).unwrap(), 300);
        assert_eq!(when.next_delta(1000, 1600, &clock).unwrap(), 0);
        assert_eq!(when.next_delta(0, 1000, &clock).unwrap(), -400);
    }

    #[test]
    fn test_time_list_takes_earliest() {
        let clock = ManualClock::new(MONDAY);
        let when = When::Time(vec![
            TimeSpec::new().with_min([0]).with_hour([6]),
            TimeSpec::new().with_min([0]).with_hour([3]),
        ]);
        let now = MONDAY + HOUR;
        assert_eq!(when.next_delta(now, now, &clock).unwrap(), 2 * HOUR);
    }

    #[test]
    fn test_time_delta_is_relative_to_now() {
        let clock = ManualClock::new(MONDAY);
        let when = When::at(TimeSpec::new().with_min([0]).with_hour([2]));
        // Last ran at Monday 02:00, now Tuesday 03:00: overdue by an hour
        let last = MONDAY + 2 * HOUR;
        let now = MONDAY + DAY + 3 * HOUR;
        assert_eq!(when.next_delta(last, now, &clock).unwrap(), -HOUR);
    }

    #[test]
    fn test_when_validate() {
        assert_eq!(When::every(0).validate(), Err(ScheduleError::ZeroFrequency));
        assert_eq!(When::Time(vec![]).validate(), Err(ScheduleError::NoTimes));
        assert!(When::at(TimeSpec::new().with_min([5])).validate().is_ok());
    }

    #[test]
    fn test_when_deserialize() {
        let freq: When = serde_yaml::from_str("freq: 600").unwrap();
        assert_eq!(freq, When::every(600));

        let time: When = serde_yaml::from_str("time:\n  - {min: [0], hour: [2]}\n").unwrap();
        assert_eq!(time, When::at(TimeSpec::new().with_min([0]).with_hour([2])));

        assert!(serde_yaml::from_str::<When>("{freq: 60, time: []}").is_err());
        assert!(serde_yaml::from_str::<When>("{}").is_err());
    }

    #[test]
    fn test_exclusion_window_outside_is_zero() {
        let clock = ManualClock::new(MONDAY);
        let window = ExclusionWindow::new(vec![TimeSpec::new().with_hour([2])]);
        assert_eq!(window.delta_to_leave(MONDAY + HOUR, &clock), 0);
    }

    #[test]
    fn test_exclusion_window_leave_delta() {
        let clock = ManualClock::new(MONDAY);
        let window = ExclusionWindow::new(vec![TimeSpec::new().with_hour([2])]);
        let now = MONDAY + 2 * HOUR + 10 * MINUTE + 30;
        assert_eq!(window.delta_to_leave(now, &clock), 49 * MINUTE + 30);
    }

    #[test]
    fn test_exclusion_window_adjacent_entries() {
        let clock = ManualClock::new(MONDAY);
        let window = ExclusionWindow::new(vec![TimeSpec::new().with_hour([2]), TimeSpec::new().with_hour([3])]);
        let now = MONDAY + 2 * HOUR + 59 * MINUTE;
        assert_eq!(window.delta_to_leave(now, &clock), HOUR + MINUTE);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "0s");
        assert_eq!(format_duration(59), "59s");
        assert_eq!(format_duration(3_661), "1h 1m 1s");
        assert_eq!(format_duration(DAY + 2 * HOUR), "1d 2h");
    }

    #[test]
    fn test_when_display() {
        assert_eq!(When::every(600).to_string(), "every 10m");
        assert_eq!(
            When::at(TimeSpec::new().with_min([0]).with_hour([2])).to_string(),
            "at [min=0 hour=2]"
        );
    }
}
