//! SQLite-backed last-run table

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use tracing::{debug, info};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS job_ran (
    id TEXT PRIMARY KEY NOT NULL,
    timestamp INTEGER NOT NULL
)";

/// Errors from the run store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to create store directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// One row of the `job_ran` table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    pub id: String,
    pub timestamp: i64,
}

/// Handle to the SQLite database holding last-run timestamps
#[derive(Debug)]
pub struct RunStore {
    conn: Connection,
    path: PathBuf,
}

impl RunStore {
    /// Open (or create) the store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        debug!(?path, "RunStore::open: called");

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(&path)?;
        conn.execute(SCHEMA, [])?;
        info!(?path, "RunStore opened");
        Ok(Self { conn, path })
    }

    /// Open a throwaway in-memory store
    pub fn open_in_memory() -> Result<Self, StoreError> {
        debug!("RunStore::open_in_memory: called");
        let conn = Connection::open_in_memory()?;
        conn.execute(SCHEMA, [])?;
        Ok(Self {
            conn,
            path: PathBuf::from(":memory:"),
        })
    }

    /// Path of the database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All recorded last-run times keyed by job name
    pub fn last_runs(&self) -> Result<HashMap<String, i64>, StoreError> {
        debug!("RunStore::last_runs: called");
        let mut stmt = self.conn.prepare("SELECT id, timestamp FROM job_ran")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut out = HashMap::new();
        for row in rows {
            let (id, ts) = row?;
            out.insert(id, ts);
        }
        debug!(count = out.len(), "RunStore::last_runs: returning");
        Ok(out)
    }

    /// Rows ordered by job name
    pub fn records(&self) -> Result<Vec<RunRecord>, StoreError> {
        debug!("RunStore::records: called");
        let mut stmt = self.conn.prepare("SELECT id, timestamp FROM job_ran ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(RunRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Last-run time of a single job
    pub fn get(&self, id: &str) -> Result<Option<i64>, StoreError> {
        debug!(%id, "RunStore::get: called");
        let ts = self
            .conn
            .query_row("SELECT timestamp FROM job_ran WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;
        Ok(ts)
    }

    /// Insert or replace the last-run time of a job
    pub fn record(&self, id: &str, timestamp: i64) -> Result<(), StoreError> {
        debug!(%id, timestamp, "RunStore::record: called");
        self.conn.execute(
            "INSERT INTO job_ran (id, timestamp) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET timestamp = excluded.timestamp",
            params![id, timestamp],
        )?;
        Ok(())
    }

    /// Forget a job; returns whether a row was removed
    pub fn remove(&self, id: &str) -> Result<bool, StoreError> {
        debug!(%id, "RunStore::remove: called");
        let n = self.conn.execute("DELETE FROM job_ran WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }
}
