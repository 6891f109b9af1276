use crate::batcher::{BatcherStats, FlushMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, time::Duration};

/// Identity of a single worker, handed out by the transport when the pool is spawned
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u32);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker {}", self.0)
    }
}

/// The three families of work a task can hand out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskClass {
    Integration,
    Postintegration,
    DerivedContent,
}

impl TaskClass {
    pub fn finished_label(&self) -> &'static str {
        match self {
            Self::Integration => "FINISHED_INTEGRATION",
            Self::Postintegration => "FINISHED_POSTINTEGRATION",
            Self::DerivedContent => "FINISHED_DERIVED_CONTENT",
        }
    }

    pub fn fail_label(&self) -> &'static str {
        match self {
            Self::Integration => "INTEGRATION_FAIL",
            Self::Postintegration => "POSTINTEGRATION_FAIL",
            Self::DerivedContent => "DERIVED_CONTENT_FAIL",
        }
    }
}

impl fmt::Display for TaskClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Integration => "integration",
            Self::Postintegration => "postintegration",
            Self::DerivedContent => "derived content",
        })
    }
}

/// Limits every worker has to respect while executing assignments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityLimits {
    pub batcher_capacity: usize,
    pub checkpoint: Duration,
    pub flush: FlushMode,
    pub caches: usize,
}

/// Reported by a worker in response to an information request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerCapabilities {
    pub hostname: String,
    pub devices: Vec<String>,
    pub caches: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairedSetup {
    pub task: String,
    pub temp_dir: PathBuf,
    pub log_dir: PathBuf,
}

/// Everything a worker needs to prepare for a new task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSetup {
    pub task: String,
    pub temp_dir: PathBuf,
    pub log_dir: PathBuf,
    #[serde(default)]
    pub paired: Option<PairedSetup>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
}

impl CacheCounters {
    pub fn merge(&mut self, other: &CacheCounters) {
        self.hits += other.hits;
        self.misses += other.misses;
    }
}

/// Timing and bookkeeping for one completed (or failed) assignment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentReport {
    pub total: Duration,
    pub min_item: Duration,
    pub max_item: Duration,
    pub items: u32,
    pub cache: CacheCounters,
    pub batcher: BatcherStats,
    pub finished_at: DateTime<Utc>,
}

/// master -> worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MasterMessage {
    InformationRequest {
        store: PathBuf,
        limits: CapacityLimits,
    },
    NewIntegration(TaskSetup),
    NewPostintegration(TaskSetup),
    NewDerivedContent(TaskSetup),
    NewWorkAssignment {
        items: Vec<u32>,
    },
    EndOfWork,
    Terminate,
}

/// worker -> master
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    InformationResponse(WorkerCapabilities),
    NewWorkAcknowledgment {
        timestamp: DateTime<Utc>,
    },
    IntegrationDataReady {
        container: PathBuf,
    },
    PostintegrationDataReady {
        container: PathBuf,
    },
    DerivedContentReady {
        product: String,
        path: PathBuf,
        groups: Vec<String>,
    },
    Finished {
        class: TaskClass,
        report: AssignmentReport,
    },
    Fail {
        class: TaskClass,
        report: AssignmentReport,
    },
    WorkerCloseDown,
}

impl MasterMessage {
    pub fn label(&self) -> &'static str {
        match self {
            Self::InformationRequest { .. } => "INFORMATION_REQUEST",
            Self::NewIntegration(_) => "NEW_INTEGRATION",
            Self::NewPostintegration(_) => "NEW_POSTINTEGRATION",
            Self::NewDerivedContent(_) => "NEW_DERIVED_CONTENT",
            Self::NewWorkAssignment { .. } => "NEW_WORK_ASSIGNMENT",
            Self::EndOfWork => "END_OF_WORK",
            Self::Terminate => "TERMINATE",
        }
    }
}

impl WorkerMessage {
    pub fn label(&self) -> &'static str {
        match self {
            Self::InformationResponse(_) => "INFORMATION_RESPONSE",
            Self::NewWorkAcknowledgment { .. } => "NEW_WORK_ACKNOWLEDGMENT",
            Self::IntegrationDataReady { .. } => "INTEGRATION_DATA_READY",
            Self::PostintegrationDataReady { .. } => "POSTINTEGRATION_DATA_READY",
            Self::DerivedContentReady { .. } => "DERIVED_CONTENT_READY",
            Self::Finished { class, .. } => class.finished_label(),
            Self::Fail { class, .. } => class.fail_label(),
            Self::WorkerCloseDown => "WORKER_CLOSE_DOWN",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_survive_the_wire() {
        let message = MasterMessage::NewWorkAssignment {
            items: vec![3, 4, 9],
        };
        let line = serde_json::to_string(&message).unwrap();

        assert!(line.contains("NEW_WORK_ASSIGNMENT"));
        assert_eq!(serde_json::from_str::<MasterMessage>(&line).unwrap(), message);

        let line = serde_json::to_string(&WorkerMessage::WorkerCloseDown).unwrap();
        assert_eq!(
            serde_json::from_str::<WorkerMessage>(&line).unwrap(),
            WorkerMessage::WorkerCloseDown
        );
    }

    #[test]
    fn labels_follow_task_class() {
        let report = AssignmentReport {
            total: Duration::from_millis(10),
            min_item: Duration::from_millis(1),
            max_item: Duration::from_millis(4),
            items: 4,
            cache: CacheCounters::default(),
            batcher: BatcherStats::default(),
            finished_at: Utc::now(),
        };

        assert_eq!(
            WorkerMessage::Fail {
                class: TaskClass::Postintegration,
                report,
            }
            .label(),
            "POSTINTEGRATION_FAIL"
        );
        assert_eq!(WorkerId(3).to_string(), "worker 3");
    }
}
