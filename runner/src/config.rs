use crate::{
    batcher::{BatcherConfig, FlushMode},
    protocol::CapacityLimits,
    transport::TransportKind,
};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[from] Error),
    #[error("Failed to parse configuration")]
    Parse(#[from] serde_yaml::Error),
    #[error("Configuration failed preflight checks")]
    Preflight,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    // number of worker processes, the master is not counted
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub transport: TransportKind,
    // devices each worker reports, items are spread over them round robin
    #[serde(default = "default_devices")]
    pub devices: Vec<String>,
    #[serde(default)]
    pub batcher: BatcherSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    pub backend: Option<BackendConfig>,
    // capacity of each worker's derived data cache
    #[serde(default = "default_caches")]
    pub caches: usize,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BatcherSection {
    // bytes held in memory before a flush
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    // seconds between forced flushes, 0 disables checkpointing
    #[serde(default)]
    pub checkpoint: u64,
    #[serde(default)]
    pub flush: FlushMode,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SchedulerSection {
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold_ms: u64,
    #[serde(default = "default_setup_timeout")]
    pub setup_timeout_ms: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_target_assignment")]
    pub target_assignment_ms: u64,
    #[serde(default = "default_units_per_worker")]
    pub units_per_worker: usize,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    pub exec: PathBuf,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default = "default_backend_timeout")]
    pub timeout_ms: u64,
}

/// Timing knobs of the master's scheduling loop
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerSettings {
    pub idle_threshold: Duration,
    pub setup_timeout: Duration,
    pub poll_interval: Duration,
    pub target_assignment: Duration,
    pub units_per_worker: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            transport: TransportKind::default(),
            devices: default_devices(),
            batcher: BatcherSection::default(),
            scheduler: SchedulerSection::default(),
            backend: None,
            caches: default_caches(),
        }
    }
}

impl Default for BatcherSection {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            checkpoint: 0,
            flush: FlushMode::default(),
        }
    }
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            idle_threshold_ms: default_idle_threshold(),
            setup_timeout_ms: default_setup_timeout(),
            poll_interval_ms: default_poll_interval(),
            target_assignment_ms: default_target_assignment(),
            units_per_worker: default_units_per_worker(),
        }
    }
}

impl RunnerConfig {
    /// load from a YAML file
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        if !path.is_file() {
            return Err(ConfigErrors::FileNotFound(path.to_path_buf()));
        }

        let file = File::open(path)?;
        Ok(serde_yaml::from_reader(file)?)
    }

    pub fn capacity_limits(&self) -> CapacityLimits {
        CapacityLimits {
            batcher_capacity: self.batcher.capacity,
            checkpoint: Duration::from_secs(self.batcher.checkpoint),
            flush: self.batcher.flush,
            caches: self.caches,
        }
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            idle_threshold: Duration::from_millis(self.scheduler.idle_threshold_ms),
            setup_timeout: Duration::from_millis(self.scheduler.setup_timeout_ms),
            poll_interval: Duration::from_millis(self.scheduler.poll_interval_ms),
            target_assignment: Duration::from_millis(self.scheduler.target_assignment_ms),
            units_per_worker: self.scheduler.units_per_worker,
        }
    }

    /// report every problem at once instead of piece-by-piece, returns true if any was found
    pub fn preflight_checks(&mut self) -> bool {
        let mut contains_error = false;

        if self.workers == 0 {
            error!("workers must be at least 1, the master never runs work itself");
            contains_error = true;
        }

        if self.devices.is_empty() {
            warn!("No devices configured, falling back to a single cpu lane");
            self.devices = default_devices();
        }

        if self.batcher.capacity == 0 {
            error!("batcher.capacity cannot be 0, every record would cause a flush");
            contains_error = true;
        }

        if self.scheduler.units_per_worker == 0 {
            error!("scheduler.units_per_worker must be at least 1");
            contains_error = true;
        }

        if self.scheduler.poll_interval_ms > self.scheduler.idle_threshold_ms {
            warn!(
                "scheduler.poll_interval_ms ({}) exceeds the idle threshold ({}), aggregation will lag",
                self.scheduler.poll_interval_ms, self.scheduler.idle_threshold_ms
            );
        }

        if let Some(ref backend) = self.backend {
            match check_executable(&backend.exec) {
                Ok(true) => {}
                Ok(false) => {
                    error!(
                        "Backend {} is not executable",
                        backend.exec.to_string_lossy()
                    );
                    contains_error = true;
                }
                Err(e) => {
                    error!(
                        "Failed to determine if backend.exec ({}) is an executable: {e}",
                        backend.exec.to_string_lossy()
                    );
                    contains_error = true;
                }
            }

            if backend.timeout_ms == 0 {
                error!("backend.timeout_ms cannot be 0");
                contains_error = true;
            }
        } else {
            warn!("No backend configured, every work item will fail");
        }

        contains_error
    }
}

impl From<&CapacityLimits> for BatcherConfig {
    fn from(limits: &CapacityLimits) -> Self {
        BatcherConfig {
            capacity: limits.batcher_capacity,
            checkpoint: limits.checkpoint,
            mode: limits.flush,
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get().saturating_sub(1).max(1))
        .unwrap_or(1)
}

fn default_devices() -> Vec<String> {
    vec!["cpu".to_owned()]
}

fn default_caches() -> usize {
    64
}

fn default_capacity() -> usize {
    64 * 1024 * 1024
}

fn default_idle_threshold() -> u64 {
    5_000
}

fn default_setup_timeout() -> u64 {
    30_000
}

fn default_poll_interval() -> u64 {
    10
}

fn default_target_assignment() -> u64 {
    10_000
}

fn default_units_per_worker() -> usize {
    4
}

fn default_backend_timeout() -> u64 {
    600_000
}
