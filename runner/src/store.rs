pub mod sqlite;

use crate::{
    protocol::{AssignmentReport, CacheCounters, TaskClass, WorkerId},
    tasks::TaskRecord,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;

pub use sqlite::{Repository, SqliteWriter};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{kind} record '{name}' not found")]
    NotFound { kind: RecordKind, name: String },
    #[error("{kind} record '{name}' is malformed")]
    Malformed {
        kind: RecordKind,
        name: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("No committed content for task '{0}' matches the requested tags")]
    NoContent(String),
    #[error("Unknown record kind '{0}'")]
    UnknownKind(String),
    #[error("Task '{task}' is not an {expected} task")]
    WrongClass { task: String, expected: TaskClass },
    #[error("Container {0} does not exist")]
    MissingContainer(PathBuf),
    #[error("Writer for '{0}' is no longer usable")]
    WriterClosed(String),
    #[error("SQLite error")]
    SQLite(#[from] rusqlite::Error),
    #[error("Filesystem error")]
    IO(#[from] std::io::Error),
    #[error("Failed to serialize record")]
    Serialize(#[from] serde_yaml::Error),
    #[error("Failed to encode content metadata")]
    Json(#[from] serde_json::Error),
}

/// Kinds of named records kept in a repository
#[derive(Serialize_repr, Deserialize_repr, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i8)]
pub enum RecordKind {
    Package = 0,
    Task = 1,
    Product = 2,
    Content = 3,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Package => "package",
            Self::Task => "task",
            Self::Product => "product",
            Self::Content => "content",
        })
    }
}

impl FromStr for RecordKind {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "package" => Ok(Self::Package),
            "task" => Ok(Self::Task),
            "product" => Ok(Self::Product),
            "content" => Ok(Self::Content),
            other => Err(StoreError::UnknownKind(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub assignments: u32,
    pub failures: u32,
    pub items: u64,
    pub wallclock: Duration,
}

/// Bookkeeping folded from every assignment report of a task run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub wallclock: Duration,
    pub items: u64,
    pub failures: u32,
    pub min_item: Option<Duration>,
    pub max_item: Option<Duration>,
    pub cache: CacheCounters,
    pub workers: BTreeMap<WorkerId, WorkerSummary>,
}

impl TaskMetadata {
    pub fn fold(&mut self, worker: WorkerId, report: &AssignmentReport, failed: bool) {
        self.wallclock += report.total;
        self.items += report.items as u64;
        self.cache.merge(&report.cache);

        // a report without completed items carries no per-item timing
        if report.items > 0 {
            self.min_item = Some(
                self.min_item
                    .map_or(report.min_item, |min| min.min(report.min_item)),
            );
            self.max_item = Some(
                self.max_item
                    .map_or(report.max_item, |max| max.max(report.max_item)),
            );
        }

        let summary = self.workers.entry(worker).or_default();
        summary.assignments += 1;
        summary.items += report.items as u64;
        summary.wallclock += report.total;

        if failed {
            self.failures += 1;
            summary.failures += 1;
        }
    }
}

/// A committed output group in the repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentGroup {
    pub task: String,
    pub name: String,
    pub class: TaskClass,
    pub tags: Vec<String>,
    pub path: PathBuf,
    pub created: DateTime<Utc>,
    pub metadata: TaskMetadata,
}

/// Persistent repository of tasks, records and committed content
pub trait Store {
    type Writer: Writer;

    fn root(&self) -> &Path;

    fn query_task(&self, name: &str) -> Result<TaskRecord, StoreError>;

    /// raw YAML body of a named record
    fn query_record(&self, kind: RecordKind, name: &str) -> Result<String, StoreError>;

    /// most recent committed group of `task` carrying all of `tags`
    fn latest_content(&self, task: &str, tags: &[String]) -> Result<ContentGroup, StoreError>;

    fn new_integration_writer(
        &self,
        task: &TaskRecord,
        tags: &[String],
    ) -> Result<Self::Writer, StoreError>;

    fn new_postintegration_writer(
        &self,
        task: &TaskRecord,
        tags: &[String],
    ) -> Result<Self::Writer, StoreError>;

    fn new_output_writer(
        &self,
        task: &TaskRecord,
        tags: &[String],
    ) -> Result<Self::Writer, StoreError>;

    fn export_record(&self, kind: RecordKind, name: &str, out: &Path) -> Result<(), StoreError>;

    /// commit several writers as one unit, either every group becomes visible or none does
    fn commit_together(
        &self,
        writers: Vec<Self::Writer>,
    ) -> Result<Vec<ContentGroup>, StoreError>;
}

/// Handle to an uncommitted output container, dropping it without `commit` rolls back
pub trait Writer {
    fn task(&self) -> &str;

    fn class(&self) -> TaskClass;

    /// scratch space for workers' temporary containers
    fn temp_dir(&self) -> &Path;

    fn log_dir(&self) -> &Path;

    /// merge a flushed temporary container, returns the number of rows taken over
    fn aggregate_container(&mut self, container: &Path) -> Result<usize, StoreError>;

    /// take over a derived product written by a worker
    fn aggregate_product(
        &mut self,
        product: &str,
        path: &Path,
        groups: &[String],
    ) -> Result<(), StoreError>;

    fn metadata_mut(&mut self) -> &mut TaskMetadata;

    fn commit(self) -> Result<ContentGroup, StoreError>;
}
