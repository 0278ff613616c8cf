use super::*;

use ringlog::{debug, trace};
use walkdir::WalkDir;

use std::path::Path;

const PROCS_FILE: &str = "cgroup.procs";

/// Top-down resolver. Job directories are found anywhere beneath the root,
/// which covers both the cgroup v1 `uid_<n>/job_<n>` layout and the flat v2
/// `job_<n>` layout.
pub struct CgroupTree {
    root: PathBuf,
    marker: String,
}

impl CgroupTree {
    pub fn new(root: impl Into<PathBuf>, marker: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            marker: marker.into(),
        }
    }

    fn job_dirs(&self) -> Vec<(JobId, PathBuf)> {
        let mut jobs = Vec::new();
        let mut it = WalkDir::new(&self.root).min_depth(1).into_iter();

        while let Some(entry) = it.next() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("skipping unreadable cgroup entry: {e}");
                    continue;
                }
            };

            if !entry.file_type().is_dir() {
                continue;
            }

            let Some(segment) = entry.file_name().to_str() else {
                continue;
            };

            if let Some(job) = JobId::from_segment(segment, &self.marker) {
                jobs.push((job, entry.path().to_path_buf()));
                // steps and tasks below belong to this job
                it.skip_current_dir();
            }
        }

        jobs
    }
}

impl JobResolver for CgroupTree {
    fn name(&self) -> &'static str {
        "cgroup_tree"
    }

    fn refresh(&self) -> Result<JobTable, JobError> {
        std::fs::read_dir(&self.root).map_err(|source| JobError::RootUnavailable {
            path: self.root.clone(),
            source,
        })?;

        let mut table = JobTable::new();

        for (job, dir) in self.job_dirs() {
            table.add_job(job.clone());

            for pid in job_pids(&dir) {
                if let Some(previous) = table.lookup(pid) {
                    debug!("pid {pid} found in both job {previous} and job {job}");
                }
                table.insert(pid, job.clone());
            }
        }

        Ok(table)
    }
}

/// Collects the pids from every `cgroup.procs` in a job's subtree.
fn job_pids(dir: &Path) -> Vec<Pid> {
    let mut pids = Vec::new();

    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() || entry.file_name() != PROCS_FILE {
            continue;
        }

        match std::fs::read_to_string(entry.path()) {
            Ok(content) => pids.extend(parse_procs(&content)),
            Err(e) => {
                debug!("unable to read {}: {e}", entry.path().display());
            }
        }
    }

    pids
}

fn parse_procs(content: &str) -> impl Iterator<Item = Pid> + '_ {
    content.lines().filter_map(|line| {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match line.parse() {
            Ok(pid) => Some(pid),
            Err(_) => {
                trace!("ignoring malformed pid line: {line}");
                None
            }
        }
    })
}
