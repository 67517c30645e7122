//! Persistence of last-run timestamps

use std::collections::HashMap;

use eyre::Result;
use runstore::RunStore;

/// Durable record of when each job last ran
pub trait LastRunStore: Send {
    fn get_last_run(&self) -> Result<HashMap<String, i64>>;

    fn update_last_run(&mut self, name: &str, ts: i64) -> Result<()>;
}

impl LastRunStore for RunStore {
    fn get_last_run(&self) -> Result<HashMap<String, i64>> {
        Ok(self.last_runs()?)
    }

    fn update_last_run(&mut self, name: &str, ts: i64) -> Result<()> {
        Ok(self.record(name, ts)?)
    }
}

/// Non-durable store for tests and dry runs
#[derive(Debug, Clone, Default)]
pub struct MemoryRunStore {
    runs: HashMap<String, i64>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runs(runs: impl IntoIterator<Item = (String, i64)>) -> Self {
        Self {
            runs: runs.into_iter().collect(),
        }
    }
}

impl LastRunStore for MemoryRunStore {
    fn get_last_run(&self) -> Result<HashMap<String, i64>> {
        Ok(self.runs.clone())
    }

    fn update_last_run(&mut self, name: &str, ts: i64) -> Result<()> {
        self.runs.insert(name.to_string(), ts);
        Ok(())
    }
}
