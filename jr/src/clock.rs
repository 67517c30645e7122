//! Time source for scheduling decisions
//!
//! Everything that needs "now" or a calendar breakdown goes through a
//! [`Clock`] so tests can drive time by hand.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Datelike, Local, TimeZone, Timelike, Utc};

/// Calendar fields of a single instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Moment {
    /// Day of week, Monday = 0 .. Sunday = 6
    pub wday: u32,
    pub hour: u32,
    pub min: u32,
    pub sec: u32,
}

impl Moment {
    fn from_datetime<Tz: TimeZone>(dt: &DateTime<Tz>) -> Self {
        Self {
            wday: dt.weekday().num_days_from_monday(),
            hour: dt.hour(),
            min: dt.minute(),
            sec: dt.second(),
        }
    }

    /// Seconds elapsed since Monday 00:00 of this week
    pub fn seconds_into_week(&self) -> i64 {
        self.wday as i64 * 86_400 + self.hour as i64 * 3_600 + self.min as i64 * 60 + self.sec as i64
    }
}

/// Source of the current time and its calendar interpretation
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time as Unix seconds
    fn now(&self) -> i64;

    /// Break a Unix timestamp into calendar fields
    fn moment(&self, ts: i64) -> Moment;
}

/// Wall clock in the host's local time zone
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        Utc::now().timestamp()
    }

    fn moment(&self, ts: i64) -> Moment {
        match Local.timestamp_opt(ts, 0).earliest() {
            Some(dt) => Moment::from_datetime(&dt),
            None => utc_moment(ts),
        }
    }
}

/// Hand-driven clock with a UTC calendar
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, ts: i64) {
        self.now.store(ts, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }

    fn moment(&self, ts: i64) -> Moment {
        utc_moment(ts)
    }
}

fn utc_moment(ts: i64) -> Moment {
    let dt = DateTime::<Utc>::from_timestamp(ts, 0).unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    Moment::from_datetime(&dt)
}
