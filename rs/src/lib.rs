//! RunStore - durable record of when each job last ran
//!
//! A single SQLite table keyed by job name. The daemon reads every row at
//! startup and after a reload, and upserts one row each time a job finishes.

mod store;

pub use store::{RunRecord, RunStore, StoreError};
