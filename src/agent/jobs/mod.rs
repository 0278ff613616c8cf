//! Resolves which scheduler job owns each process.
//!
//! Two strategies are provided behind the [`JobResolver`] trait:
//! * [`CgroupTree`] walks the scheduler cgroup root top-down and reads the
//!   `cgroup.procs` files under every job directory. One pass yields the full
//!   mapping, including jobs which currently own no processes.
//! * [`ProcCgroup`] reads `/proc/<pid>/cgroup` for every process and looks
//!   for a job segment in its cgroup path.

use crate::config::{Config, Strategy};

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

mod proc;
mod tree;

pub use proc::ProcCgroup;
pub use tree::CgroupTree;

pub type Pid = u32;

/// Scheduler job identifier, e.g. `"42"` for a `job_42` cgroup.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Extracts the job id from a path segment of the form
    /// `<marker><digits>`.
    pub fn from_segment(segment: &str, marker: &str) -> Option<Self> {
        let id = segment.strip_prefix(marker)?;

        if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        Some(Self(id.to_string()))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("cgroup root {path} is unavailable: {source}")]
    RootUnavailable {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Process to job mapping produced by one resolver refresh.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct JobTable {
    pids: BTreeMap<Pid, JobId>,
    jobs: BTreeSet<JobId>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a job, even if it owns no processes.
    pub fn add_job(&mut self, job: JobId) {
        self.jobs.insert(job);
    }

    pub fn insert(&mut self, pid: Pid, job: JobId) {
        self.jobs.insert(job.clone());
        self.pids.insert(pid, job);
    }

    pub fn lookup(&self, pid: Pid) -> Option<&JobId> {
        self.pids.get(&pid)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &JobId> {
        self.jobs.iter()
    }

    pub fn pids(&self) -> impl Iterator<Item = (Pid, &JobId)> {
        self.pids.iter().map(|(pid, job)| (*pid, job))
    }

    /// Groups the processes by job. Every known job is present, jobs without
    /// processes map to an empty list.
    pub fn by_job(&self) -> BTreeMap<&JobId, Vec<Pid>> {
        let mut grouped: BTreeMap<&JobId, Vec<Pid>> =
            self.jobs.iter().map(|job| (job, Vec::new())).collect();

        for (pid, job) in &self.pids {
            grouped.entry(job).or_default().push(*pid);
        }

        grouped
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Maps processes to the scheduler job which contains them.
pub trait JobResolver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Builds the complete mapping for this cycle. Blocking.
    fn refresh(&self) -> Result<JobTable, JobError>;
}

/// Builds the resolver selected by `[jobs] strategy`.
pub fn resolver(config: &Config) -> Box<dyn JobResolver> {
    let jobs = config.jobs();

    match jobs.strategy() {
        Strategy::CgroupTree => Box::new(CgroupTree::new(jobs.root(), jobs.marker())),
        Strategy::ProcCgroup => Box::new(ProcCgroup::new(config.general().procfs(), jobs.marker())),
    }
}
