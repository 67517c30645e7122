//! jobrunner - dependency-aware job scheduling daemon
//!
//! Jobs are read from YAML, scheduled by interval or calendar, ordered by
//! their `pre` and `post` dependencies and launched as child processes with
//! per-job lock files. A local control socket accepts commands and a health
//! report is written periodically.

pub mod cli;
pub mod clock;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod health;
pub mod ipc;
pub mod job;
pub mod process;
pub mod queue;
pub mod schedule;

pub use clock::{Clock, SystemClock};
pub use config::Config;
pub use engine::{EngineHandle, Runner};
pub use job::{Job, JobSet, JobSource, YamlJobSource};
pub use queue::JobQueue;
