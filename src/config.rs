use ringlog::Level;
use serde::Deserialize;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    general: General,
    #[serde(default)]
    log: Log,
    #[serde(default)]
    jobs: Jobs,
    #[serde(default)]
    accelerator: Accelerator,
    #[serde(default)]
    exporter: Exporter,
    #[serde(default)]
    defaults: SamplerConfig,
    #[serde(default)]
    samplers: HashMap<String, SamplerConfig>,
}

impl Config {
    pub fn load(path: &dyn AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        config.check()?;

        Ok(config)
    }

    fn check(&self) -> Result<(), ConfigError> {
        self.general.check()?;
        self.log.check()?;
        self.jobs.check()?;
        self.exporter.check()?;

        if self.accelerator.command.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "accelerator command must not be empty".into(),
            ));
        }

        Ok(())
    }

    pub fn general(&self) -> &General {
        &self.general
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn jobs(&self) -> &Jobs {
        &self.jobs
    }

    pub fn accelerator(&self) -> &Accelerator {
        &self.accelerator
    }

    pub fn exporter(&self) -> &Exporter {
        &self.exporter
    }

    /// Whether the named sampler should run. Falls back to `[defaults]`
    /// when the sampler has no section of its own.
    pub fn enabled(&self, name: &str) -> bool {
        self.samplers
            .get(name)
            .and_then(|s| s.enabled)
            .or(self.defaults.enabled)
            .unwrap_or(true)
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct General {
    #[serde(default = "listen")]
    listen: String,
    #[serde(default = "interval")]
    interval: String,
    #[serde(default = "timeout")]
    timeout: String,
    #[serde(default = "procfs")]
    procfs: PathBuf,
}

impl Default for General {
    fn default() -> Self {
        Self {
            listen: listen(),
            interval: interval(),
            timeout: timeout(),
            procfs: procfs(),
        }
    }
}

impl General {
    fn check(&self) -> Result<(), ConfigError> {
        self.listen.parse::<SocketAddr>().map_err(|e| {
            ConfigError::Invalid(format!("listen address `{}`: {e}", self.listen))
        })?;

        for (field, value) in [("interval", &self.interval), ("timeout", &self.timeout)] {
            match value.parse::<humantime::Duration>() {
                Ok(d) if Duration::from(d).is_zero() => {
                    return Err(ConfigError::Invalid(format!("{field} must be non-zero")));
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(ConfigError::Invalid(format!("{field} `{value}`: {e}")));
                }
            }
        }

        Ok(())
    }

    pub fn listen(&self) -> SocketAddr {
        // validated in `check()`, the default always parses
        self.listen
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 9400)))
    }

    pub fn interval(&self) -> Duration {
        self.interval
            .parse::<humantime::Duration>()
            .map(Duration::from)
            .unwrap_or(Duration::from_secs(10))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
            .parse::<humantime::Duration>()
            .map(Duration::from)
            .unwrap_or(Duration::from_secs(5))
    }

    pub fn procfs(&self) -> &Path {
        &self.procfs
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Log {
    #[serde(default = "log_level")]
    level: String,
}

impl Default for Log {
    fn default() -> Self {
        Self { level: log_level() }
    }
}

impl Log {
    fn check(&self) -> Result<(), ConfigError> {
        parse_level(&self.level)
            .map(|_| ())
            .ok_or_else(|| ConfigError::Invalid(format!("unknown log level `{}`", self.level)))
    }

    pub fn level(&self) -> Level {
        parse_level(&self.level).unwrap_or(Level::Info)
    }
}

fn parse_level(level: &str) -> Option<Level> {
    match level.to_ascii_lowercase().as_str() {
        "error" => Some(Level::Error),
        "warn" => Some(Level::Warn),
        "info" => Some(Level::Info),
        "debug" => Some(Level::Debug),
        "trace" => Some(Level::Trace),
        _ => None,
    }
}

/// How job ownership is discovered.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Walk the scheduler cgroup tree once per cycle.
    #[default]
    CgroupTree,
    /// Read `/proc/<pid>/cgroup` for every process.
    ProcCgroup,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Jobs {
    #[serde(default)]
    strategy: Strategy,
    #[serde(default = "cgroup_root")]
    root: PathBuf,
    #[serde(default = "job_marker")]
    marker: String,
}

impl Default for Jobs {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            root: cgroup_root(),
            marker: job_marker(),
        }
    }
}

impl Jobs {
    fn check(&self) -> Result<(), ConfigError> {
        if self.marker.is_empty() {
            return Err(ConfigError::Invalid("job marker must not be empty".into()));
        }
        Ok(())
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Accelerator {
    #[serde(default = "accelerator_command")]
    command: String,
}

impl Default for Accelerator {
    fn default() -> Self {
        Self {
            command: accelerator_command(),
        }
    }
}

impl Accelerator {
    pub fn command(&self) -> &str {
        &self.command
    }
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Exporter {
    /// node_exporter textfile collector output, rewritten after every pass.
    textfile: Option<PathBuf>,
}

impl Exporter {
    fn check(&self) -> Result<(), ConfigError> {
        match &self.textfile {
            Some(path) if path.file_name().is_none() => Err(ConfigError::Invalid(format!(
                "textfile `{}` must name a file",
                path.display()
            ))),
            _ => Ok(()),
        }
    }

    pub fn textfile(&self) -> Option<&Path> {
        self.textfile.as_deref()
    }
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct SamplerConfig {
    enabled: Option<bool>,
}

fn listen() -> String {
    "0.0.0.0:9400".into()
}

fn interval() -> String {
    "10s".into()
}

fn timeout() -> String {
    "5s".into()
}

fn procfs() -> PathBuf {
    "/proc".into()
}

fn log_level() -> String {
    "info".into()
}

fn cgroup_root() -> PathBuf {
    "/sys/fs/cgroup/cpuset/slurm".into()
}

fn job_marker() -> String {
    "job_".into()
}

fn accelerator_command() -> String {
    "nvidia-smi".into()
}
