use super::*;

use ringlog::debug;

use std::io;
use std::path::Path;

/// Bottom-up resolver. Each process' own cgroup membership record is read
/// and the first `<marker><digits>` path segment names the job.
pub struct ProcCgroup {
    procfs: PathBuf,
    marker: String,
}

impl ProcCgroup {
    pub fn new(procfs: impl Into<PathBuf>, marker: impl Into<String>) -> Self {
        Self {
            procfs: procfs.into(),
            marker: marker.into(),
        }
    }

    /// Resolves a single process. `Ok(None)` means the process exists but
    /// is not part of any job.
    pub fn resolve_pid(&self, pid: Pid) -> io::Result<Option<JobId>> {
        let path = self.procfs.join(pid.to_string()).join("cgroup");
        let content = std::fs::read_to_string(path)?;
        Ok(job_from_cgroup(&content, &self.marker))
    }
}

impl JobResolver for ProcCgroup {
    fn name(&self) -> &'static str {
        "proc_cgroup"
    }

    fn refresh(&self) -> Result<JobTable, JobError> {
        let entries = std::fs::read_dir(&self.procfs).map_err(|source| JobError::RootUnavailable {
            path: self.procfs.clone(),
            source,
        })?;

        let mut table = JobTable::new();

        for entry in entries.filter_map(|e| e.ok()) {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<Pid>().ok()) else {
                continue;
            };

            match self.resolve_pid(pid) {
                Ok(Some(job)) => table.insert(pid, job),
                Ok(None) => {}
                Err(e) => debug!("unable to read cgroup for pid {pid}: {e}"),
            }
        }

        Ok(table)
    }
}

/// Scans `hierarchy-id:controllers:path` lines for a job segment.
fn job_from_cgroup(content: &str, marker: &str) -> Option<JobId> {
    content
        .lines()
        .filter_map(|line| line.splitn(3, ':').nth(2))
        .flat_map(|path| Path::new(path).iter())
        .filter_map(|segment| segment.to_str())
        .find_map(|segment| JobId::from_segment(segment, marker))
}
