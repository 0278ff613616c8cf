use crate::store::{MetricDesc, MetricKind};

pub static GPU_MEMORY_USAGE: MetricDesc = MetricDesc {
    name: "gpu_memory_usage_bytes",
    description: "GPU memory used by the processes of a job, in bytes",
    kind: MetricKind::Gauge,
    labels: &["gpu_id", "job_id"],
};

pub static GPU_UTILIZATION: MetricDesc = MetricDesc {
    name: "gpu_utilization",
    description: "Device utilization (0-100) of a GPU used by a job",
    kind: MetricKind::Gauge,
    labels: &["gpu_id", "job_id"],
};

pub static GPU_INFO: MetricDesc = MetricDesc {
    name: "gpu_info",
    description: "Identity of each GPU on the host, always 1",
    kind: MetricKind::Gauge,
    labels: &["gpu_id", "uuid", "name"],
};

pub static METRICS: &[&MetricDesc] = &[&GPU_MEMORY_USAGE, &GPU_UTILIZATION, &GPU_INFO];
