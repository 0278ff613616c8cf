//! The sample loop. On every tick it refreshes the job table and then runs
//! each enabled sampler against it, publishing into the metric store.
//!
//! Passes never overlap: the loop awaits each pass before waiting for the
//! next tick, missed ticks are skipped, and [`SampleLoop::sample`] refuses to
//! start while another pass is in flight.
//!
//! When a textfile is configured the store is rendered to it at the end of
//! every pass.

use crate::config::Config;
use crate::exporter::textfile;
use crate::store::{MetricDesc, MetricStore};

use ringlog::{debug, error, info, warn};
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub mod deadline;
pub mod jobs;
pub mod samplers;

mod stats;

use jobs::{JobResolver, JobTable};
use samplers::{Sampler, SAMPLERS};
use stats::*;

const JOBS_STAGE: &str = "jobs";

pub struct SampleLoop {
    interval: Duration,
    timeout: Duration,
    resolver: Arc<dyn JobResolver>,
    samplers: Vec<Box<dyn Sampler>>,
    store: MetricStore,
    textfile: Option<PathBuf>,
    pass: Mutex<()>,
}

impl SampleLoop {
    /// Initializes every registered sampler and declares all metrics with
    /// the store.
    pub fn new(config: Arc<Config>, store: MetricStore) -> Self {
        let mut samplers = Vec::new();

        for init in SAMPLERS {
            match init(config.clone()) {
                Ok(Some(sampler)) => {
                    info!("{} sampler enabled", sampler.name());
                    samplers.push(sampler);
                }
                Ok(None) => {}
                Err(e) => error!("failed to initialize sampler: {e}"),
            }
        }

        // stable order regardless of link order
        samplers.sort_by_key(|s| s.name());

        let resolver: Arc<dyn JobResolver> = Arc::from(jobs::resolver(&config));
        info!("resolving jobs with the {} strategy", resolver.name());

        Self::with_samplers(
            config.general().interval(),
            config.general().timeout(),
            resolver,
            samplers,
            store,
        )
        .with_textfile(config.exporter().textfile().map(PathBuf::from))
    }

    pub fn with_samplers(
        interval: Duration,
        timeout: Duration,
        resolver: Arc<dyn JobResolver>,
        samplers: Vec<Box<dyn Sampler>>,
        store: MetricStore,
    ) -> Self {
        let declared = METRICS
            .iter()
            .chain(samplers.iter().flat_map(|s| s.metrics().iter()))
            .copied();

        for desc in declared {
            store.register(desc);
        }

        Self {
            interval,
            timeout,
            resolver,
            samplers,
            store,
            textfile: None,
            pass: Mutex::new(()),
        }
    }

    pub fn with_textfile(mut self, path: Option<PathBuf>) -> Self {
        if let Some(path) = &path {
            info!("writing textfile collector output to {}", path.display());
        }
        self.textfile = path;
        self
    }

    /// Runs until the shutdown flag is raised. A pass in progress is allowed
    /// to finish.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("sampling every {}", humantime::format_duration(self.interval));

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            self.sample().await;

            if *shutdown.borrow() {
                break;
            }
        }

        info!("sample loop stopped");
    }

    /// Runs one complete pass. Returns the job table used, or `None` when
    /// another pass was already running and this one was dropped.
    pub async fn sample(&self) -> Option<JobTable> {
        let Ok(_pass) = self.pass.try_lock() else {
            debug!("previous pass still running, dropping tick");
            return None;
        };

        let start = Instant::now();

        let table = self.resolve().await;

        for sampler in &self.samplers {
            let start = Instant::now();

            let result = sampler.refresh_with_logging(&table, &self.store).await;

            if let Err(e) = &result {
                warn!("{} sampler failed, keeping previous values: {e}", sampler.name());
            }

            self.record(sampler.name(), result.is_ok(), start.elapsed());
        }

        self.write_textfile().await;

        debug!("pass complete in {:?}", start.elapsed());

        Some(table)
    }

    async fn resolve(&self) -> JobTable {
        let start = Instant::now();
        let resolver = self.resolver.clone();

        let table = match deadline::blocking(self.timeout, move || resolver.refresh()).await {
            Ok(Ok(table)) => Ok(table),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match table {
            Ok(table) => {
                for (job, pids) in table.by_job() {
                    self.set(&JOB_PROCESSES, &[job.as_str()], pids.len() as f64);
                }
                self.record(JOBS_STAGE, true, start.elapsed());
                table
            }
            Err(e) => {
                // nothing is attributable this cycle, the samplers still run
                warn!("unable to resolve jobs: {e}");
                self.record(JOBS_STAGE, false, start.elapsed());
                JobTable::new()
            }
        }
    }

    async fn write_textfile(&self) {
        let Some(path) = self.textfile.clone() else {
            return;
        };

        let text = match self.store.snapshot().to_prometheus() {
            Ok(text) => text,
            Err(e) => {
                warn!("failed to encode metrics for {}: {e}", path.display());
                return;
            }
        };

        let target = path.clone();

        match deadline::blocking(self.timeout, move || textfile::write(&target, &text)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("failed to write {}: {e}", path.display()),
            Err(e) => warn!("failed to write {}: {e}", path.display()),
        }
    }

    fn record(&self, stage: &str, up: bool, duration: Duration) {
        self.set(&SAMPLER_UP, &[stage], if up { 1.0 } else { 0.0 });
        self.set(&SAMPLER_DURATION, &[stage], duration.as_secs_f64());
    }

    fn set(&self, desc: &MetricDesc, labels: &[&str], value: f64) {
        if let Err(e) = self.store.set(desc.name, labels, value) {
            error!("{e}");
        }
    }
}
