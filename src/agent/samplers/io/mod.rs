//! Collects per-process storage I/O from `/proc/<pid>/io` for every process
//! which belongs to a job.
//!
//! And produces these stats:
//! * `io_read_bytes`
//! * `io_write_bytes`
//!
//! A job with no readable processes is published with `pid="none"` and a
//! value of zero.

const NAME: &str = "io";

mod stats;

use stats::*;

use crate::agent::deadline;
use crate::agent::jobs::{JobId, JobTable, Pid};
use crate::agent::samplers::{Sampler, SamplerResult, SAMPLERS};
use crate::config::Config;
use crate::store::{MetricDesc, MetricStore, NONE};

use async_trait::async_trait;
use linkme::distributed_slice;
use ringlog::{debug, error};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[distributed_slice(SAMPLERS)]
fn init(config: Arc<Config>) -> SamplerResult {
    if !config.enabled(NAME) {
        return Ok(None);
    }

    Ok(Some(Box::new(Io {
        procfs: config.general().procfs().to_path_buf(),
        timeout: config.general().timeout(),
    })))
}

struct Io {
    procfs: PathBuf,
    timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoCounters {
    pub read_bytes: u64,
    pub write_bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IoSample {
    pub pid: Pid,
    pub job_id: JobId,
    pub counters: IoCounters,
}

#[derive(Debug, Default, PartialEq)]
pub struct IoReport {
    pub samples: Vec<IoSample>,
    /// Jobs for which no process could be read.
    pub idle_jobs: Vec<JobId>,
}

#[async_trait]
impl Sampler for Io {
    fn name(&self) -> &'static str {
        NAME
    }

    fn metrics(&self) -> &'static [&'static MetricDesc] {
        METRICS
    }

    async fn refresh(&self, jobs: &JobTable, store: &MetricStore) -> anyhow::Result<()> {
        let procfs = self.procfs.clone();
        let jobs = jobs.clone();

        let report = deadline::blocking(self.timeout, move || collect(&procfs, &jobs)).await?;

        publish(&report, store);

        Ok(())
    }
}

/// Extracts `read_bytes` and `write_bytes` from an io accounting record.
/// Every other key is ignored.
pub fn parse_io(content: &str) -> Option<IoCounters> {
    let mut read_bytes = None;
    let mut write_bytes = None;

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };

        match key.trim() {
            "read_bytes" => read_bytes = value.trim().parse().ok(),
            "write_bytes" => write_bytes = value.trim().parse().ok(),
            _ => {}
        }
    }

    Some(IoCounters {
        read_bytes: read_bytes?,
        write_bytes: write_bytes?,
    })
}

fn read_io(procfs: &Path, pid: Pid) -> Result<IoCounters, String> {
    let path = procfs.join(pid.to_string()).join("io");

    let content =
        std::fs::read_to_string(&path).map_err(|e| format!("{}: {e}", path.display()))?;

    parse_io(&content).ok_or_else(|| format!("{}: malformed record", path.display()))
}

/// Reads the counters for every process in the table. Blocking.
pub fn collect(procfs: &Path, jobs: &JobTable) -> IoReport {
    let mut report = IoReport::default();

    for (job, pids) in jobs.by_job() {
        let mut live = 0;

        for pid in pids {
            match read_io(procfs, pid) {
                Ok(counters) => {
                    live += 1;
                    report.samples.push(IoSample {
                        pid,
                        job_id: job.clone(),
                        counters,
                    });
                }
                // exited or not permitted, siblings are unaffected
                Err(e) => debug!("{NAME}: skipping pid {pid} of job {job}: {e}"),
            }
        }

        if live == 0 {
            report.idle_jobs.push(job.clone());
        }
    }

    report
}

fn publish(report: &IoReport, store: &MetricStore) {
    let set = |desc: &MetricDesc, labels: &[&str], value: f64| {
        if let Err(e) = store.set(desc.name, labels, value) {
            error!("{NAME}: {e}");
        }
    };

    for sample in &report.samples {
        let pid = sample.pid.to_string();
        let labels = [pid.as_str(), sample.job_id.as_str()];

        set(&IO_READ_BYTES, &labels, sample.counters.read_bytes as f64);
        set(&IO_WRITE_BYTES, &labels, sample.counters.write_bytes as f64);
    }

    for job in &report.idle_jobs {
        let labels = [NONE, job.as_str()];

        set(&IO_READ_BYTES, &labels, 0.0);
        set(&IO_WRITE_BYTES, &labels, 0.0);
    }
}
