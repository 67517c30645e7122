//! Job model
//!
//! A [`Job`] is an immutable definition: what to run, when, and how it
//! relates to other jobs. Definitions are grouped in a validated [`JobSet`]
//! and supplied to the daemon by a [`JobSource`].

mod set;
mod source;

pub use set::{JobSet, JobSetBuilder, find_cycle};
pub use source::{JobSource, StaticJobSource, YamlJobSource};

use std::fmt::{self, Write as _};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local, TimeDelta};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::Clock;
use crate::schedule::{ExclusionWindow, ScheduleError, When};

/// Default upper bound on a job's runtime (two hours)
pub const DEFAULT_MAX_DURATION: u64 = 2 * 60 * 60;

/// Errors from loading and validating job definitions
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Duplicate job name: {name}")]
    Duplicate { name: String },

    #[error("Job '{name}' is defined in both {} and {}", first.display(), second.display())]
    DuplicateAcrossFiles { name: String, first: PathBuf, second: PathBuf },

    #[error("Job '{job}' references unknown {kind} job '{target}'")]
    UnknownReference {
        job: String,
        kind: &'static str,
        target: String,
    },

    #[error("Unknown job: {0}")]
    UnknownJob(String),

    #[error("Invalid job name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("Dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("Invalid schedule for job '{job}': {source}")]
    Schedule {
        job: String,
        #[source]
        source: ScheduleError,
    },

    #[error("Job '{0}' has an empty command")]
    EmptyCommand(String),

    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Errors resolving launch-time argument values
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ArgError {
    #[error("Environment variable {0} is not set")]
    MissingEnv(String),

    #[error("Date offset of {0} days is out of range")]
    OffsetOutOfRange(i64),

    #[error("Invalid date format: {0}")]
    BadFormat(String),
}

/// Reject strftime strings chrono cannot render
fn check_date_format(format: &str) -> Result<(), ArgError> {
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(ArgError::BadFormat(format.to_string()));
    }
    Ok(())
}

/// Health checks the monitoring feed should run for a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthCheckSpec {
    /// Alert when the last run failed
    #[serde(rename = "check-status")]
    pub check_status: bool,

    /// Alert when no successful run happened within this many seconds
    #[serde(rename = "check-overdue", skip_serializing_if = "Option::is_none")]
    pub check_overdue: Option<u64>,
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            check_status: true,
            check_overdue: None,
        }
    }
}

/// Value computed when the job is launched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ProviderDef", into = "ProviderDef")]
pub enum ValueProvider {
    /// Local date formatted with strftime, shifted by whole days
    Date { format: String, offset_days: i64 },
    /// Environment variable of the daemon, with an optional fallback
    Env { name: String, default: Option<String> },
}

impl ValueProvider {
    pub fn resolve(&self, now: DateTime<Local>) -> Result<String, ArgError> {
        match self {
            ValueProvider::Date { format, offset_days } => {
                check_date_format(format)?;
                let day = TimeDelta::try_days(*offset_days)
                    .and_then(|delta| now.checked_add_signed(delta))
                    .ok_or(ArgError::OffsetOutOfRange(*offset_days))?;
                let mut out = String::new();
                write!(out, "{}", day.format(format)).map_err(|_| ArgError::BadFormat(format.clone()))?;
                Ok(out)
            }
            ValueProvider::Env { name, default } => match std::env::var(name) {
                Ok(value) => Ok(value),
                Err(_) => default.clone().ok_or_else(|| ArgError::MissingEnv(name.clone())),
            },
        }
    }
}

impl fmt::Display for ValueProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueProvider::Date { format, offset_days: 0 } => write!(f, "<date:{}>", format),
            ValueProvider::Date { format, offset_days } => write!(f, "<date:{}{:+}d>", format, offset_days),
            ValueProvider::Env { name, .. } => write!(f, "<env:{}>", name),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct DateDef {
    format: String,
    #[serde(default, rename = "offset-days")]
    offset_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct EnvDef {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    default: Option<String>,
}

/// On-disk shape of [`ValueProvider`]: exactly one of `date` or `env`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProviderDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    date: Option<DateDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    env: Option<EnvDef>,
}

impl TryFrom<ProviderDef> for ValueProvider {
    type Error = String;

    fn try_from(def: ProviderDef) -> Result<Self, Self::Error> {
        match (def.date, def.env) {
            (Some(d), None) => {
                check_date_format(&d.format).map_err(|e| e.to_string())?;
                if TimeDelta::try_days(d.offset_days).is_none() {
                    return Err(ArgError::OffsetOutOfRange(d.offset_days).to_string());
                }
                Ok(ValueProvider::Date {
                    format: d.format,
                    offset_days: d.offset_days,
                })
            }
            (None, Some(e)) => Ok(ValueProvider::Env {
                name: e.name,
                default: e.default,
            }),
            _ => Err("argument provider takes exactly one of date or env".to_string()),
        }
    }
}

impl From<ValueProvider> for ProviderDef {
    fn from(provider: ValueProvider) -> Self {
        match provider {
            ValueProvider::Date { format, offset_days } => ProviderDef {
                date: Some(DateDef { format, offset_days }),
                env: None,
            },
            ValueProvider::Env { name, default } => ProviderDef {
                date: None,
                env: Some(EnvDef { name, default }),
            },
        }
    }
}

/// Closure evaluated at launch time, for jobs defined in code
#[derive(Clone)]
pub struct ComputedArg {
    label: String,
    func: Arc<dyn Fn() -> String + Send + Sync>,
}

impl ComputedArg {
    pub fn new(label: impl Into<String>, func: impl Fn() -> String + Send + Sync + 'static) -> Self {
        Self {
            label: label.into(),
            func: Arc::new(func),
        }
    }
}

impl fmt::Debug for ComputedArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputedArg").field("label", &self.label).finish()
    }
}

/// One command-line argument of a job
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Arg {
    Literal(String),
    Provider(ValueProvider),
    #[serde(skip)]
    Computed(ComputedArg),
}

impl Arg {
    pub fn resolve(&self, now: DateTime<Local>) -> Result<String, ArgError> {
        match self {
            Arg::Literal(s) => Ok(s.clone()),
            Arg::Provider(p) => p.resolve(now),
            Arg::Computed(c) => Ok((c.func)()),
        }
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg::Literal(s.to_string())
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Arg::Literal(s)
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Literal(s) => write!(f, "{}", s),
            Arg::Provider(p) => write!(f, "{}", p),
            Arg::Computed(c) => write!(f, "<{}>", c.label),
        }
    }
}

fn default_true() -> bool {
    true
}

/// External program launched for a job
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessSpec {
    pub cmd: String,

    #[serde(default)]
    pub args: Vec<Arg>,

    /// Output on stdout is expected and does not mark the run as failed
    #[serde(default, rename = "stdout-ok")]
    pub stdout_ok: bool,

    /// Track the process until it exits; false means fire-and-forget
    #[serde(default = "default_true")]
    pub wait: bool,
}

impl ProcessSpec {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            args: Vec::new(),
            stdout_ok: false,
            wait: true,
        }
    }

    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdout_ok(mut self, ok: bool) -> Self {
        self.stdout_ok = ok;
        self
    }

    pub fn wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    /// Resolve every argument for a launch happening at `now`
    pub fn resolve_args(&self, now: DateTime<Local>) -> Result<Vec<String>, ArgError> {
        self.args.iter().map(|a| a.resolve(now)).collect()
    }

    /// Human-readable command line with unresolved providers shown as placeholders
    pub fn pretty_cmd(&self) -> String {
        std::iter::once(self.cmd.clone())
            .chain(self.args.iter().map(|a| a.to_string()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn default_max_duration() -> Option<u64> {
    Some(DEFAULT_MAX_DURATION)
}

/// A named unit of work
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Job {
    /// Filled from the key the job is stored under
    #[serde(skip)]
    pub name: String,

    #[serde(default)]
    pub action: Option<ProcessSpec>,

    #[serde(default)]
    pub pre: Vec<String>,

    #[serde(default)]
    pub post: Vec<String>,

    #[serde(default)]
    pub nonconcurrent: Vec<String>,

    #[serde(default)]
    pub when: Option<When>,

    #[serde(default, rename = "not-when")]
    pub not_when: Option<ExclusionWindow>,

    #[serde(default, rename = "max-freq")]
    pub max_freq: Option<u64>,

    #[serde(default = "default_max_duration", rename = "max-duration")]
    pub max_duration: Option<u64>,

    #[serde(default, rename = "multi-ok")]
    pub multi_ok: bool,

    #[serde(default)]
    pub health: Option<HealthCheckSpec>,
}

impl Job {
    /// A barrier job: no action, no schedule
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: None,
            pre: Vec::new(),
            post: Vec::new(),
            nonconcurrent: Vec::new(),
            when: None,
            not_when: None,
            max_freq: None,
            max_duration: default_max_duration(),
            multi_ok: false,
            health: None,
        }
    }

    pub fn with_action(mut self, action: ProcessSpec) -> Self {
        self.action = Some(action);
        self
    }

    pub fn with_pre<I: IntoIterator<Item = S>, S: Into<String>>(mut self, pre: I) -> Self {
        self.pre = pre.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_post<I: IntoIterator<Item = S>, S: Into<String>>(mut self, post: I) -> Self {
        self.post = post.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_nonconcurrent<I: IntoIterator<Item = S>, S: Into<String>>(mut self, names: I) -> Self {
        self.nonconcurrent = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_when(mut self, when: When) -> Self {
        self.when = Some(when);
        self
    }

    pub fn with_not_when(mut self, window: ExclusionWindow) -> Self {
        self.not_when = Some(window);
        self
    }

    pub fn with_max_freq(mut self, secs: u64) -> Self {
        self.max_freq = Some(secs);
        self
    }

    pub fn with_max_duration(mut self, secs: Option<u64>) -> Self {
        self.max_duration = secs;
        self
    }

    pub fn with_multi_ok(mut self, multi_ok: bool) -> Self {
        self.multi_ok = multi_ok;
        self
    }

    pub fn with_health(mut self, health: HealthCheckSpec) -> Self {
        self.health = Some(health);
        self
    }

    /// Whether the job has a process whose exit the daemon waits for
    pub fn waits(&self) -> bool {
        self.action.as_ref().is_some_and(|a| a.wait)
    }

    /// Seconds until the job is due, `None` when it has no schedule
    ///
    /// Inside the exclusion window the result is the positive time until the
    /// window is left, regardless of how overdue the schedule is.
    pub fn next_delta(&self, last_run: i64, now: i64, clock: &dyn Clock) -> Result<Option<i64>, ScheduleError> {
        let Some(when) = &self.when else {
            return Ok(None);
        };
        if let Some(window) = &self.not_when {
            let leave = window.delta_to_leave(now, clock);
            if leave > 0 {
                return Ok(Some(leave));
            }
        }
        when.next_delta(last_run, now, clock).map(Some)
    }

    fn validate_schedule(&self) -> Result<(), JobError> {
        let wrap = |source| JobError::Schedule {
            job: self.name.clone(),
            source,
        };
        if let Some(when) = &self.when {
            when.validate().map_err(wrap)?;
        }
        if let Some(window) = &self.not_when {
            window.validate().map_err(wrap)?;
        }
        if let Some(action) = &self.action
            && action.cmd.trim().is_empty()
        {
            return Err(JobError::EmptyCommand(self.name.clone()));
        }
        Ok(())
    }
}
