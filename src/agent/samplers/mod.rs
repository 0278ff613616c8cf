use crate::agent::jobs::JobTable;
use crate::config::Config;
use crate::store::{MetricDesc, MetricStore};

use async_trait::async_trait;
use linkme::distributed_slice;
use ringlog::debug;

use std::sync::Arc;
use std::time::Instant;

mod accelerator;
mod io;

#[distributed_slice]
pub static SAMPLERS: [fn(config: Arc<Config>) -> SamplerResult] = [..];

/// A sampler publishes one group of metrics per collection pass. All
/// samplers in a pass see the same job table.
#[async_trait]
pub trait Sampler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Metrics this sampler writes. Registered with the store before the
    /// first pass.
    fn metrics(&self) -> &'static [&'static MetricDesc];

    async fn refresh(&self, jobs: &JobTable, store: &MetricStore) -> anyhow::Result<()>;

    async fn refresh_with_logging(&self, jobs: &JobTable, store: &MetricStore) -> anyhow::Result<()> {
        let start = Instant::now();

        let result = self.refresh(jobs, store).await;

        let duration = start.elapsed().as_micros();

        debug!("{} sampling latency: {duration} us", self.name());

        result
    }
}

pub type SamplerResult = anyhow::Result<Option<Box<dyn Sampler>>>;
