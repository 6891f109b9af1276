pub mod exec;

use crate::{
    batcher::ResultRecord,
    catalog::WorkItem,
    config::BackendConfig,
    protocol::CacheCounters,
    store::ContentGroup,
    tasks::TaskRecord,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("No integration backend is configured")]
    NotConfigured,
    #[error("Failed to spawn backend")]
    Spawn(#[source] std::io::Error),
    #[error("Failed to talk to backend process")]
    Child(#[from] std::io::Error),
    #[error("Failed to (de)serialize backend data")]
    Serde(#[from] serde_yaml::Error),
    #[error("Backend timed out")]
    Timeout,
    #[error("Backend exited with status {status}: {stderr}")]
    Failed { status: i32, stderr: String },
    #[error("Item {serial} failed: {reason}")]
    Item { serial: u32, reason: String },
}

/// What the backend sees of one item
#[derive(Debug, Clone, Serialize)]
pub struct ItemContext<'a> {
    pub task: &'a TaskRecord,
    pub item: &'a WorkItem,
    // committed parent content, only for unpaired postintegrations
    pub source: Option<&'a ContentGroup>,
    pub device: &'a str,
    pub log_dir: &'a Path,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemOutput {
    #[serde(default)]
    pub records: Vec<ResultRecord>,
    #[serde(default)]
    pub background: Vec<ResultRecord>,
    // rows for the paired postintegration, ignored when nothing is paired
    #[serde(default)]
    pub paired: Vec<ResultRecord>,
    #[serde(default)]
    pub cache: CacheCounters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedProduct {
    pub product: String,
    pub path: PathBuf,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub cache: CacheCounters,
}

/// The numerical integrator a worker invokes, opaque to the scheduler
pub trait IntegrationBackend {
    /// integrate (or postintegrate) a single item
    fn integrate(&mut self, context: &ItemContext) -> Result<ItemOutput, BackendError>;

    /// produce a derived product for an output element inside `out_dir`
    fn derive(&mut self, context: &ItemContext, out_dir: &Path)
        -> Result<DerivedProduct, BackendError>;
}

#[derive(Debug, Clone)]
pub enum Backends {
    Exec(exec::ExecBackend),
    Unconfigured,
}

impl Backends {
    pub fn load(config: Option<&BackendConfig>) -> Self {
        match config {
            Some(config) => Self::Exec(exec::ExecBackend::load(config)),
            None => Self::Unconfigured,
        }
    }
}

impl IntegrationBackend for Backends {
    fn integrate(&mut self, context: &ItemContext) -> Result<ItemOutput, BackendError> {
        match self {
            Self::Exec(backend) => backend.integrate(context),
            Self::Unconfigured => Err(BackendError::NotConfigured),
        }
    }

    fn derive(
        &mut self,
        context: &ItemContext,
        out_dir: &Path,
    ) -> Result<DerivedProduct, BackendError> {
        match self {
            Self::Exec(backend) => backend.derive(context, out_dir),
            Self::Unconfigured => Err(BackendError::NotConfigured),
        }
    }
}
