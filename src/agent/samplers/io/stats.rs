use crate::store::{MetricDesc, MetricKind};

pub static IO_READ_BYTES: MetricDesc = MetricDesc {
    name: "io_read_bytes",
    description: "Bytes a job process caused to be fetched from storage",
    kind: MetricKind::Counter,
    labels: &["pid", "job_id"],
};

pub static IO_WRITE_BYTES: MetricDesc = MetricDesc {
    name: "io_write_bytes",
    description: "Bytes a job process caused to be sent to storage",
    kind: MetricKind::Counter,
    labels: &["pid", "job_id"],
};

pub static METRICS: &[&MetricDesc] = &[&IO_READ_BYTES, &IO_WRITE_BYTES];
