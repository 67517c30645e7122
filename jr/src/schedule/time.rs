//! Calendar-based schedule entries
//!
//! A [`TimeSpec`] fires at every minute whose weekday, hour and minute are all
//! in the configured lists. Unset lists match anything.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{DAY, HOUR, MINUTE, ScheduleError, WEEK};
use crate::clock::{Clock, Moment};

/// Attempts before giving up on finding the next matching minute
const MAX_ATTEMPTS: usize = 10;

/// Calendar constraints for a scheduled job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeSpec {
    /// Minutes of the hour (0-59)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<Vec<u32>>,

    /// Hours of the day (0-23)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hour: Option<Vec<u32>>,

    /// Days of the week, Monday = 0 .. Sunday = 6
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wday: Option<Vec<u32>>,

    /// Minimum spacing between two runs, in seconds
    #[serde(rename = "max-freq")]
    pub max_freq: u64,
}

impl TimeSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min(mut self, min: impl Into<Vec<u32>>) -> Self {
        self.min = Some(min.into());
        self
    }

    pub fn with_hour(mut self, hour: impl Into<Vec<u32>>) -> Self {
        self.hour = Some(hour.into());
        self
    }

    pub fn with_wday(mut self, wday: impl Into<Vec<u32>>) -> Self {
        self.wday = Some(wday.into());
        self
    }

    pub fn with_max_freq(mut self, secs: u64) -> Self {
        self.max_freq = secs;
        self
    }

    /// Reject empty lists and out-of-range values
    pub fn validate(&self) -> Result<(), ScheduleError> {
        check_field("min", self.min.as_deref(), 59)?;
        check_field("hour", self.hour.as_deref(), 23)?;
        check_field("wday", self.wday.as_deref(), 6)?;
        Ok(())
    }

    /// Whether the given instant falls in a matching minute
    pub fn matches(&self, m: &Moment) -> bool {
        let hit = |list: &Option<Vec<u32>>, v: u32| list.as_ref().is_none_or(|l| l.contains(&v));
        hit(&self.wday, m.wday) && hit(&self.hour, m.hour) && hit(&self.min, m.min)
    }

    /// Seconds from `prev` to the next matching minute at least `max_freq` later
    pub fn next_time(&self, prev: i64, clock: &dyn Clock) -> Result<i64, ScheduleError> {
        debug!(prev, spec = %self, "TimeSpec::next_time: called");
        let target = prev + self.max_freq as i64;
        let start = clock.moment(target);
        // Fields below are measured from the Monday 00:00 of the target's week
        let week_base = target - start.seconds_into_week() - prev;

        let (mut wday, mut hour, mut min) = (start.wday as i64, start.hour as i64, start.min as i64);
        let mut add_week = 0i64;

        for _ in 0..MAX_ATTEMPTS {
            if let Some(days) = &self.wday
                && !contains(days, wday)
            {
                hour = 0;
                min = 0;
                let (next, wrapped) = next_in(days, wday);
                wday = next;
                if wrapped {
                    add_week += 1;
                }
            }

            if let Some(hours) = &self.hour
                && !contains(hours, hour)
            {
                min = 0;
                let (next, wrapped) = next_in(hours, hour);
                hour = next;
                if wrapped {
                    wday += 1;
                    continue;
                }
            }

            if let Some(mins) = &self.min
                && !contains(mins, min)
            {
                let (next, wrapped) = next_in(mins, min);
                min = next;
                if wrapped {
                    hour += 1;
                    continue;
                }
            }

            let delta = week_base + add_week * WEEK + wday * DAY + hour * HOUR + min * MINUTE;
            if delta <= 0 {
                if self.min.is_some() || (self.hour.is_none() && self.wday.is_none()) {
                    min += 1;
                } else if self.hour.is_some() {
                    hour += 1;
                } else {
                    wday += 1;
                }
                continue;
            }

            debug!(prev, delta, "TimeSpec::next_time: found");
            return Ok(delta);
        }

        Err(ScheduleError::NoMatch {
            spec: self.to_string(),
            attempts: MAX_ATTEMPTS,
        })
    }
}

impl fmt::Display for TimeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        for (label, list) in [("min", &self.min), ("hour", &self.hour), ("wday", &self.wday)] {
            if let Some(values) = list {
                let joined: Vec<String> = values.iter().map(u32::to_string).collect();
                parts.push(format!("{}={}", label, joined.join(",")));
            }
        }
        if self.max_freq > 0 {
            parts.push(format!("max-freq={}s", self.max_freq));
        }
        if parts.is_empty() {
            write!(f, "every minute")
        } else {
            write!(f, "{}", parts.join(" "))
        }
    }
}

fn check_field(field: &'static str, values: Option<&[u32]>, max: u32) -> Result<(), ScheduleError> {
    let Some(values) = values else {
        return Ok(());
    };
    if values.is_empty() {
        return Err(ScheduleError::EmptyList { field });
    }
    if let Some(&value) = values.iter().find(|&&v| v > max) {
        return Err(ScheduleError::OutOfRange { field, value, max });
    }
    Ok(())
}

fn contains(list: &[u32], value: i64) -> bool {
    list.iter().any(|&v| v as i64 == value)
}

/// Smallest value greater than `current`, or the smallest overall with a wrap flag
fn next_in(list: &[u32], current: i64) -> (i64, bool) {
    match list.iter().map(|&v| v as i64).filter(|&v| v > current).min() {
        Some(next) => (next, false),
        None => (list.iter().map(|&v| v as i64).min().unwrap_or(current), true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use proptest::prelude::*;

    // 2024-01-01 00:00:00 UTC, a Monday
    const MONDAY: i64 = 1_704_067_200;

    fn at(wday: i64, hour: i64, min: i64, sec: i64) -> i64 {
        MONDAY + wday * DAY + hour * HOUR + min * MINUTE + sec
    }

    fn clock() -> ManualClock {
        ManualClock::new(MONDAY)
    }

    #[test]
    fn test_quarter_hours_from_exact_match() {
        let spec = TimeSpec::new().with_min([0, 15, 30, 45]);
        let delta = spec.next_time(at(0, 12, 15, 0), &clock()).unwrap();
        assert_eq!(delta, 15 * MINUTE);
    }

    #[test]
    fn test_quarter_hours_wraps_into_next_hour() {
        let spec = TimeSpec::new().with_min([0, 15, 30, 45]);
        let delta = spec.next_time(at(0, 12, 50, 0), &clock()).unwrap();
        assert_eq!(delta, 10 * MINUTE);
    }

    #[test]
    fn test_quarter_hours_wraps_across_sunday_midnight() {
        let spec = TimeSpec::new().with_min([0, 15, 30, 45]);
        let delta = spec.next_time(at(6, 23, 50, 0), &clock()).unwrap();
        assert_eq!(delta, 10 * MINUTE);
    }

    #[test]
    fn test_daily_hour() {
        let spec = TimeSpec::new().with_min([0]).with_hour([2]);
        assert_eq!(spec.next_time(at(0, 1, 0, 0), &clock()).unwrap(), HOUR);
        assert_eq!(spec.next_time(at(0, 2, 0, 0), &clock()).unwrap(), DAY);
        assert_eq!(spec.next_time(at(0, 3, 0, 0), &clock()).unwrap(), 23 * HOUR);
    }

    #[test]
    fn test_weekly_rolls_over_to_next_week() {
        // Saturdays at 22:00
        let spec = TimeSpec::new().with_min([0]).with_hour([22]).with_wday([5]);
        assert_eq!(spec.next_time(at(5, 21, 0, 0), &clock()).unwrap(), HOUR);
        assert_eq!(spec.next_time(at(5, 22, 0, 0), &clock()).unwrap(), WEEK);
        assert_eq!(spec.next_time(at(6, 10, 0, 0), &clock()).unwrap(), 6 * DAY + 12 * HOUR);
    }

    #[test]
    fn test_wday_only_starts_at_midnight() {
        let spec = TimeSpec::new().with_wday([2]);
        assert_eq!(spec.next_time(at(0, 10, 0, 0), &clock()).unwrap(), DAY + 14 * HOUR);
    }

    #[test]
    fn test_max_freq_pushes_past_next_slot() {
        let spec = TimeSpec::new().with_min([0, 30]).with_max_freq(45 * MINUTE as u64);
        // 10:00 + 45m lands at 10:45, next slot 11:00
        assert_eq!(spec.next_time(at(0, 10, 0, 0), &clock()).unwrap(), HOUR);
    }

    #[test]
    fn test_max_freq_crossing_week_boundary() {
        let spec = TimeSpec::new().with_min([0]).with_hour([1]).with_max_freq(2 * DAY as u64);
        // Saturday 01:00 + 2 days is Monday 01:00 of the next week
        assert_eq!(spec.next_time(at(5, 1, 0, 0), &clock()).unwrap(), 2 * DAY);
    }

    #[test]
    fn test_unconstrained_is_every_minute() {
        let spec = TimeSpec::new();
        assert_eq!(spec.next_time(at(0, 4, 7, 20), &clock()).unwrap(), 40);
    }

    #[test]
    fn test_matches() {
        let spec = TimeSpec::new().with_hour([2, 3]);
        let c = clock();
        assert!(spec.matches(&c.moment(at(3, 2, 59, 0))));
        assert!(!spec.matches(&c.moment(at(3, 4, 0, 0))));
    }

    #[test]
    fn test_validate() {
        assert!(TimeSpec::new().with_min([0, 59]).validate().is_ok());
        assert!(matches!(
            TimeSpec::new().with_hour([24]).validate(),
            Err(ScheduleError::OutOfRange { field: "hour", value: 24, .. })
        ));
        assert!(matches!(
            TimeSpec::new().with_wday(Vec::<u32>::new()).validate(),
            Err(ScheduleError::EmptyList { field: "wday" })
        ));
    }

    #[test]
    fn test_deserialize_yaml() {
        let spec: TimeSpec = serde_yaml::from_str("min: [0, 30]\nhour: [2]\nmax-freq: 600\n").unwrap();
        assert_eq!(spec, TimeSpec::new().with_min([0, 30]).with_hour([2]).with_max_freq(600));
    }

    #[test]
    fn test_display() {
        let spec = TimeSpec::new().with_min([0, 30]).with_wday([5]);
        assert_eq!(spec.to_string(), "min=0,30 wday=5");
        assert_eq!(TimeSpec::new().to_string(), "every minute");
    }

    proptest! {
        #[test]
        fn prop_quarter_hour_alignment(offset in 0i64..(4 * WEEK)) {
            let spec = TimeSpec::new().with_min([0, 15, 30, 45]);
            let prev = MONDAY + offset;
            let delta = spec.next_time(prev, &clock()).unwrap();
            prop_assert!(delta > 0);
            prop_assert!(delta <= 15 * MINUTE);
            prop_assert_eq!((prev + delta) % (15 * MINUTE), 0);
        }

        #[test]
        fn prop_next_time_matches_spec(
            offset in 0i64..(2 * WEEK),
            min in 0u32..60,
            hour in 0u32..24,
        ) {
            let spec = TimeSpec::new().with_min([min]).with_hour([hour]);
            let c = clock();
            let prev = MONDAY + offset;
            let delta = spec.next_time(prev, &c).unwrap();
            prop_assert!(delta > 0);
            prop_assert!(delta <= DAY);
            prop_assert!(spec.matches(&c.moment(prev + delta)));
        }
    }
}
