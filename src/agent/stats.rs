use crate::store::{MetricDesc, MetricKind};

pub static SAMPLER_UP: MetricDesc = MetricDesc {
    name: "sampler_up",
    description: "Whether the last pass of a sampler succeeded (1) or failed (0)",
    kind: MetricKind::Gauge,
    labels: &["sampler"],
};

pub static SAMPLER_DURATION: MetricDesc = MetricDesc {
    name: "sampler_duration_seconds",
    description: "Duration of the last pass of a sampler",
    kind: MetricKind::Gauge,
    labels: &["sampler"],
};

pub static JOB_PROCESSES: MetricDesc = MetricDesc {
    name: "job_processes",
    description: "Number of processes found in the cgroup of a job",
    kind: MetricKind::Gauge,
    labels: &["job_id"],
};

pub static METRICS: &[&MetricDesc] = &[&SAMPLER_UP, &SAMPLER_DURATION, &JOB_PROCESSES];
