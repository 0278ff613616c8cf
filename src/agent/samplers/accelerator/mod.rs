//! Collects GPU usage by querying `nvidia-smi`:
//! * `--query-gpu=gpu_uuid,index,name,utilization.gpu`
//! * `--query-compute-apps=pid,used_gpu_memory,gpu_uuid`
//!
//! The two result sets are joined on the device UUID and each process is
//! attributed to its job. Produces:
//! * `gpu_memory_usage_bytes`
//! * `gpu_utilization`
//! * `gpu_info`
//!
//! Devices without any attributed job are published under `job_id="none"`
//! so that idle GPUs stay visible.

const NAME: &str = "accelerator";

mod parse;
mod stats;

use parse::*;
use stats::*;

use crate::agent::deadline;
use crate::agent::jobs::{JobId, JobTable};
use crate::agent::samplers::{Sampler, SamplerResult, SAMPLERS};
use crate::config::Config;
use crate::store::{MetricDesc, MetricStore, NONE};

use async_trait::async_trait;
use linkme::distributed_slice;
use ringlog::{debug, error};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

const QUERY_GPU: &[&str] = &[
    "--query-gpu=gpu_uuid,index,name,utilization.gpu",
    "--format=csv",
];

const QUERY_APPS: &[&str] = &[
    "--query-compute-apps=pid,used_gpu_memory,gpu_uuid",
    "--format=csv",
];

#[distributed_slice(SAMPLERS)]
fn init(config: Arc<Config>) -> SamplerResult {
    if !config.enabled(NAME) {
        return Ok(None);
    }

    Ok(Some(Box::new(Accelerator {
        command: config.accelerator().command().to_string(),
        timeout: config.general().timeout(),
    })))
}

struct Accelerator {
    command: String,
    timeout: Duration,
}

/// Memory used by one job on one device.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceleratorSample {
    pub gpu_id: u32,
    pub job_id: JobId,
    pub memory_used_bytes: u64,
    pub utilization: f64,
}

#[async_trait]
impl Sampler for Accelerator {
    fn name(&self) -> &'static str {
        NAME
    }

    fn metrics(&self) -> &'static [&'static MetricDesc] {
        METRICS
    }

    async fn refresh(&self, jobs: &JobTable, store: &MetricStore) -> anyhow::Result<()> {
        // both queries must succeed, otherwise the previous values stand
        let devices = deadline::command(&self.command, QUERY_GPU, self.timeout).await?;
        let apps = deadline::command(&self.command, QUERY_APPS, self.timeout).await?;

        let devices = parse_rows(&devices, device, |line, e| {
            debug!("{NAME}: skipping gpu row `{line}`: {e}");
        });
        let apps = parse_rows(&apps, compute_app, |line, e| {
            debug!("{NAME}: skipping compute-apps row `{line}`: {e}");
        });

        let samples = correlate(&devices, &apps, jobs);

        publish(&devices, &samples, store);

        Ok(())
    }
}

/// Joins process memory rows to devices by UUID and attributes them to jobs.
///
/// Rows with an unknown UUID and processes outside of any job are dropped.
/// Several processes of one job on one device are summed.
pub fn correlate(devices: &[Device], apps: &[ComputeApp], jobs: &JobTable) -> Vec<AcceleratorSample> {
    let by_uuid: HashMap<&str, &Device> = devices.iter().map(|d| (d.uuid.as_str(), d)).collect();

    let mut samples: BTreeMap<(u32, JobId), AcceleratorSample> = BTreeMap::new();

    for app in apps {
        let Some(device) = by_uuid.get(app.uuid.as_str()) else {
            debug!("{NAME}: pid {} uses unknown device {}", app.pid, app.uuid);
            continue;
        };

        let Some(job) = jobs.lookup(app.pid) else {
            debug!("{NAME}: pid {} on gpu {} is not part of a job", app.pid, device.index);
            continue;
        };

        samples
            .entry((device.index, job.clone()))
            .or_insert_with(|| AcceleratorSample {
                gpu_id: device.index,
                job_id: job.clone(),
                memory_used_bytes: 0,
                utilization: device.utilization,
            })
            .memory_used_bytes += app.memory_bytes;
    }

    samples.into_values().collect()
}

fn publish(devices: &[Device], samples: &[AcceleratorSample], store: &MetricStore) {
    let set = |desc: &MetricDesc, labels: &[&str], value: f64| {
        if let Err(e) = store.set(desc.name, labels, value) {
            error!("{NAME}: {e}");
        }
    };

    for sample in samples {
        let gpu_id = sample.gpu_id.to_string();
        let labels = [gpu_id.as_str(), sample.job_id.as_str()];

        set(&GPU_MEMORY_USAGE, &labels, sample.memory_used_bytes as f64);
        set(&GPU_UTILIZATION, &labels, sample.utilization);
    }

    for device in devices {
        let gpu_id = device.index.to_string();

        set(&GPU_INFO, &[gpu_id.as_str(), device.uuid.as_str(), device.name.as_str()], 1.0);

        if !samples.iter().any(|s| s.gpu_id == device.index) {
            set(&GPU_MEMORY_USAGE, &[gpu_id.as_str(), NONE], 0.0);
            set(&GPU_UTILIZATION, &[gpu_id.as_str(), NONE], device.utilization);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MetricStore {
        let store = MetricStore::new();
        for desc in METRICS {
            store.register(desc);
        }
        store
    }

    fn run(devices: &str, apps: &str, jobs: &JobTable, store: &MetricStore) -> Vec<AcceleratorSample> {
        let devices = parse_rows(devices, device, |_, _| {});
        let apps = parse_rows(apps, compute_app, |_, _| {});
        let samples = correlate(&devices, &apps, jobs);
        publish(&devices, &samples, store);
        samples
    }

    #[test]
    fn attributes_memory_to_job() {
        let mut jobs = JobTable::new();
        jobs.insert(1234, JobId::new("42"));
        let store = store();

        run(
            "uuid, index, name, utilization.gpu\ngpu-uuid-1, 0, \"GPUX\", 37\n",
            "pid, used_gpu_memory, gpu_uuid\n1234, 512 MiB, gpu-uuid-1\n",
            &jobs,
            &store,
        );

        assert_eq!(
            store.get("gpu_memory_usage_bytes", &["0", "42"]),
            Some(536870912.0)
        );
        assert_eq!(store.get("gpu_utilization", &["0", "42"]), Some(37.0));
        assert_eq!(store.get("gpu_info", &["0", "gpu-uuid-1", "GPUX"]), Some(1.0));
    }

    #[test]
    fn device_index_follows_uuid() {
        let mut jobs = JobTable::new();
        jobs.insert(10, JobId::new("1"));
        jobs.insert(11, JobId::new("2"));
        jobs.insert(12, JobId::new("3"));
        let store = store();

        // rows deliberately out of index order
        let samples = run(
            "h\nGPU-b, 1, X, 50\nGPU-a, 0, X, 20\nGPU-c, 2, X, 90\n",
            "h\n10, 1 MiB, GPU-c\n11, 1 MiB, GPU-a\n12, 1 MiB, GPU-zzz\n",
            &jobs,
            &store,
        );

        assert_eq!(samples.len(), 2);
        assert!(samples.contains(&AcceleratorSample {
            gpu_id: 2,
            job_id: JobId::new("1"),
            memory_used_bytes: 1 << 20,
            utilization: 90.0,
        }));
        assert!(samples.contains(&AcceleratorSample {
            gpu_id: 0,
            job_id: JobId::new("2"),
            memory_used_bytes: 1 << 20,
            utilization: 20.0,
        }));
        // unmatched uuid is dropped, not zero-filled
        assert!(samples.iter().all(|s| s.job_id != JobId::new("3")));
        assert_eq!(store.get("gpu_memory_usage_bytes", &["0", "3"]), None);
    }

    #[test]
    fn sums_processes_of_one_job() {
        let mut jobs = JobTable::new();
        jobs.insert(10, JobId::new("7"));
        jobs.insert(11, JobId::new("7"));

        let samples = run(
            "h\nGPU-a, 0, X, 60\n",
            "h\n10, 100 MiB, GPU-a\n11, 28 MiB, GPU-a\n",
            &jobs,
            &store(),
        );

        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].memory_used_bytes, 128 << 20);
    }

    #[test]
    fn unattributed_processes_are_skipped() {
        let jobs = JobTable::new();
        let store = store();

        let samples = run("h\nGPU-a, 0, X, 60\n", "h\n10, 100 MiB, GPU-a\n", &jobs, &store);

        assert!(samples.is_empty());
        // the device is idle as far as jobs are concerned
        assert_eq!(store.get("gpu_utilization", &["0", "none"]), Some(60.0));
        assert_eq!(store.get("gpu_memory_usage_bytes", &["0", "none"]), Some(0.0));
    }

    #[test]
    fn idle_devices_keep_a_placeholder() {
        let mut jobs = JobTable::new();
        jobs.insert(10, JobId::new("1"));
        let store = store();

        run(
            "h\nGPU-a, 0, X, 60\nGPU-b, 1, X, 3\n",
            "h\n10, 100 MiB, GPU-a\n",
            &jobs,
            &store,
        );

        assert_eq!(store.get("gpu_utilization", &["1", "none"]), Some(3.0));
        assert_eq!(store.get("gpu_memory_usage_bytes", &["1", "none"]), Some(0.0));
        assert_eq!(store.get("gpu_utilization", &["0", "none"]), None);
    }

    /// Writes an executable stand-in for `nvidia-smi` which answers the
    /// compute-apps query once and fails with exit code 3 afterwards.
    #[cfg(unix)]
    fn fake_smi(dir: &std::path::Path) -> String {
        use std::os::unix::fs::PermissionsExt;

        let marker = dir.join("apps-queried");
        let script = dir.join("nvidia-smi");
        let body = format!(
            r#"#!/bin/sh
case "$1" in
    --query-gpu=*)
        printf 'uuid, index, name, utilization.gpu [%%]\nGPU-a, 0, "GPUX", 37 %%\n'
        ;;
    --query-compute-apps=*)
        if [ -e "{marker}" ]; then
            echo "driver went away" >&2
            exit 3
        fi
        touch "{marker}"
        printf 'pid, used_gpu_memory [MiB], gpu_uuid\n1234, 512 MiB, GPU-a\n'
        ;;
    *)
        exit 2
        ;;
esac
"#,
            marker = marker.display()
        );

        std::fs::write(&script, body).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        script.display().to_string()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_query_keeps_previous_values() {
        let dir = tempfile::tempdir().unwrap();

        let sampler = Accelerator {
            command: fake_smi(dir.path()),
            timeout: Duration::from_secs(5),
        };

        let mut jobs = JobTable::new();
        jobs.insert(1234, JobId::new("42"));
        let store = store();

        sampler.refresh(&jobs, &store).await.unwrap();

        assert_eq!(
            store.get("gpu_memory_usage_bytes", &["0", "42"]),
            Some(536870912.0)
        );
        assert_eq!(store.get("gpu_utilization", &["0", "42"]), Some(37.0));

        // the process moved to another job, but the second query fails
        let mut jobs = JobTable::new();
        jobs.insert(1234, JobId::new("43"));

        assert!(sampler.refresh(&jobs, &store).await.is_err());

        assert_eq!(
            store.get("gpu_memory_usage_bytes", &["0", "42"]),
            Some(536870912.0)
        );
        assert_eq!(store.get("gpu_memory_usage_bytes", &["0", "43"]), None);
    }

    #[tokio::test]
    async fn missing_command_is_an_error() {
        let dir = tempfile::tempdir().unwrap();

        let sampler = Accelerator {
            command: dir.path().join("nvidia-smi").display().to_string(),
            timeout: Duration::from_secs(5),
        };
        let store = store();

        assert!(sampler.refresh(&JobTable::new(), &store).await.is_err());
        assert_eq!(store.get("gpu_utilization", &["none", "none"]), Some(0.0));
    }

    #[test]
    fn malformed_row_does_not_block_later_rows() {
        let mut jobs = JobTable::new();
        jobs.insert(10, JobId::new("1"));
        jobs.insert(11, JobId::new("1"));
        let store = store();

        run(
            "h\nGPU-a, 0, X, 60\n",
            "h\n10, 100 MiB\n11, 64 MiB, GPU-a\n",
            &jobs,
            &store,
        );

        assert_eq!(
            store.get("gpu_memory_usage_bytes", &["0", "1"]),
            Some((64u64 << 20) as f64)
        );
    }
}
