//! Where job definitions come from

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info};

use super::{Job, JobError, JobSet};

/// Supplier of job definitions
pub trait JobSource: Send {
    /// Currently loaded definitions
    fn get_jobs(&self) -> Result<JobSet, JobError>;

    /// Re-read definitions; on error the previously loaded set is kept
    fn reload(&mut self) -> Result<(), JobError>;

    /// Short description for logs
    fn describe(&self) -> String;
}

/// Fixed, in-memory definitions
#[derive(Debug, Clone, Default)]
pub struct StaticJobSource {
    jobs: JobSet,
}

impl StaticJobSource {
    pub fn new(jobs: JobSet) -> Self {
        Self { jobs }
    }

    /// Swap in a new set; takes effect on the next reload of the queue
    pub fn replace(&mut self, jobs: JobSet) {
        self.jobs = jobs;
    }
}

impl JobSource for StaticJobSource {
    fn get_jobs(&self) -> Result<JobSet, JobError> {
        Ok(self.jobs.clone())
    }

    fn reload(&mut self) -> Result<(), JobError> {
        Ok(())
    }

    fn describe(&self) -> String {
        format!("static ({} jobs)", self.jobs.len())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct JobFile {
    #[serde(default)]
    jobs: BTreeMap<String, Job>,
}

/// Definitions read from one or more YAML files
#[derive(Debug)]
pub struct YamlJobSource {
    paths: Vec<PathBuf>,
    jobs: JobSet,
}

impl YamlJobSource {
    /// Read and validate the given files
    pub fn load(paths: Vec<PathBuf>) -> Result<Self, JobError> {
        debug!(?paths, "YamlJobSource::load: called");
        let jobs = read_files(&paths)?;
        info!(count = jobs.len(), files = paths.len(), "Loaded job definitions");
        Ok(Self { paths, jobs })
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl JobSource for YamlJobSource {
    fn get_jobs(&self) -> Result<JobSet, JobError> {
        Ok(self.jobs.clone())
    }

    fn reload(&mut self) -> Result<(), JobError> {
        debug!(paths = ?self.paths, "YamlJobSource::reload: called");
        self.jobs = read_files(&self.paths)?;
        info!(count = self.jobs.len(), "Reloaded job definitions");
        Ok(())
    }

    fn describe(&self) -> String {
        let names: Vec<String> = self.paths.iter().map(|p| p.display().to_string()).collect();
        names.join(", ")
    }
}

fn read_files(paths: &[PathBuf]) -> Result<JobSet, JobError> {
    let mut builder = JobSet::builder();
    let mut origin: HashMap<String, PathBuf> = HashMap::new();

    for path in paths {
        for job in parse_file(path)? {
            if let Some(first) = origin.get(&job.name) {
                return Err(JobError::DuplicateAcrossFiles {
                    name: job.name,
                    first: first.clone(),
                    second: path.clone(),
                });
            }
            origin.insert(job.name.clone(), path.clone());
            builder.add(job)?;
        }
    }

    builder.build()
}

fn parse_file(path: &Path) -> Result<Vec<Job>, JobError> {
    debug!(?path, "parse_file: called");
    let content = fs::read_to_string(path).map_err(|source| JobError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_str(&content).map_err(|source| JobError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Parse the jobs of a single YAML document
fn parse_str(content: &str) -> Result<Vec<Job>, serde_yaml::Error> {
    let file: JobFile = serde_yaml::from_str(content)?;
    Ok(file
        .jobs
        .into_iter()
        .map(|(name, mut job)| {
            job.name = name;
            job
        })
        .collect())
}
