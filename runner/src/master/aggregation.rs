use super::MasterError;
use crate::{
    protocol::WorkerId,
    store::{StoreError, Writer},
};
use std::{
    collections::VecDeque,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, error, warn};

/// Merges a flushed integration container into the task's output
pub trait IntegrationAggregator {
    fn aggregate(&mut self, container: &Path) -> Result<usize, StoreError>;
}

/// Merges a flushed postintegration container into the task's output
pub trait PostintegrationAggregator {
    fn aggregate(&mut self, container: &Path) -> Result<usize, StoreError>;
}

/// Takes over a derived product
pub trait DerivedContentAggregator {
    fn aggregate(&mut self, product: &str, path: &Path, groups: &[String])
        -> Result<(), StoreError>;
}

/// Aggregates straight into a writer
#[derive(Debug)]
pub struct WriterAggregator<'a, W: Writer>(pub &'a mut W);

impl<W: Writer> IntegrationAggregator for WriterAggregator<'_, W> {
    fn aggregate(&mut self, container: &Path) -> Result<usize, StoreError> {
        self.0.aggregate_container(container)
    }
}

impl<W: Writer> PostintegrationAggregator for WriterAggregator<'_, W> {
    fn aggregate(&mut self, container: &Path) -> Result<usize, StoreError> {
        self.0.aggregate_container(container)
    }
}

impl<W: Writer> DerivedContentAggregator for WriterAggregator<'_, W> {
    fn aggregate(
        &mut self,
        product: &str,
        path: &Path,
        groups: &[String],
    ) -> Result<(), StoreError> {
        self.0.aggregate_product(product, path, groups)
    }
}

/// The aggregators bound for one task run, unbound streams reject their data
#[derive(Default)]
pub struct AggregatorSet<'a> {
    pub integration: Option<Box<dyn IntegrationAggregator + 'a>>,
    pub postintegration: Option<Box<dyn PostintegrationAggregator + 'a>>,
    pub derived: Option<Box<dyn DerivedContentAggregator + 'a>>,
}

/// A `*_READY` notification waiting for the master to go idle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregationRecord {
    Integration {
        worker: WorkerId,
        container: PathBuf,
    },
    Postintegration {
        worker: WorkerId,
        container: PathBuf,
    },
    DerivedContent {
        worker: WorkerId,
        product: String,
        path: PathBuf,
        groups: Vec<String>,
    },
}

impl AggregationRecord {
    pub fn worker(&self) -> WorkerId {
        match self {
            Self::Integration { worker, .. }
            | Self::Postintegration { worker, .. }
            | Self::DerivedContent { worker, .. } => *worker,
        }
    }

    /// merge through the matching aggregator, a temporary container is removed only on success
    pub fn aggregate(&self, aggregators: &mut AggregatorSet) -> Result<usize, MasterError> {
        match self {
            Self::Integration { container, .. } => {
                let aggregator = aggregators
                    .integration
                    .as_mut()
                    .ok_or(MasterError::NoAggregator("integration"))?;
                let rows = aggregator.aggregate(container)?;
                remove_container(container);

                Ok(rows)
            }
            Self::Postintegration { container, .. } => {
                let aggregator = aggregators
                    .postintegration
                    .as_mut()
                    .ok_or(MasterError::NoAggregator("postintegration"))?;
                let rows = aggregator.aggregate(container)?;
                remove_container(container);

                Ok(rows)
            }
            Self::DerivedContent {
                product,
                path,
                groups,
                ..
            } => {
                let aggregator = aggregators
                    .derived
                    .as_mut()
                    .ok_or(MasterError::NoAggregator("derived content"))?;
                aggregator.aggregate(product, path, groups)?;

                Ok(1)
            }
        }
    }
}

fn remove_container(container: &Path) {
    match fs::remove_file(container) {
        Ok(()) => debug!("Removed {}", container.to_string_lossy()),
        Err(error) => {
            warn!(error = ?error, "Failed to remove aggregated container {}: {error}", container.to_string_lossy())
        }
    }
}

/// Pending aggregations in arrival order, gated on master idleness
#[derive(Debug, Clone, Default)]
pub struct AggregationQueue {
    records: VecDeque<AggregationRecord>,
}

impl AggregationQueue {
    pub fn push(&mut self, record: AggregationRecord) {
        self.records.push_back(record);
    }

    /// true once something is queued and no message arrived for longer than `threshold`
    pub fn ready(&self, idle: Duration, threshold: Duration) -> bool {
        !self.records.is_empty() && idle > threshold
    }

    pub fn pop(&mut self) -> Option<AggregationRecord> {
        self.records.pop_front()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// process one record, returns whether it succeeded
pub fn process(record: &AggregationRecord, aggregators: &mut AggregatorSet) -> bool {
    match record.aggregate(aggregators) {
        Ok(rows) => {
            debug!(worker = %record.worker(), rows = rows, "Aggregated");

            true
        }
        Err(error) => {
            error!(error = ?error, worker = %record.worker(), "Aggregation failed: {error}");

            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batcher::{
        container::{self, Staged},
        ResultRecord,
    };
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[derive(Default, Clone)]
    struct Recording {
        seen: Arc<Mutex<Vec<PathBuf>>>,
        fail: bool,
    }

    impl IntegrationAggregator for Recording {
        fn aggregate(&mut self, container: &Path) -> Result<usize, StoreError> {
            if self.fail {
                return Err(StoreError::MissingContainer(container.to_path_buf()));
            }
            self.seen.lock().push(container.to_path_buf());

            Ok(1)
        }
    }

    fn containers(dir: &TempDir, count: usize) -> Vec<PathBuf> {
        (0..count)
            .map(|index| {
                let path = dir.path().join(format!("integration_w0_{index:05}.sqlite"));
                let staged = Staged {
                    records: vec![ResultRecord::new(index as u32, 0, vec![1.0])],
                    ..Staged::default()
                };
                container::write_container(&path, &staged).unwrap();

                path
            })
            .collect()
    }

    fn integration(container: &Path) -> AggregationRecord {
        AggregationRecord::Integration {
            worker: WorkerId(0),
            container: container.to_path_buf(),
        }
    }

    #[test]
    fn aggregation_waits_for_idle_master() {
        let dir = TempDir::new().unwrap();
        let threshold = Duration::from_secs(5);
        let recording = Recording::default();
        let mut aggregators = AggregatorSet {
            integration: Some(Box::new(recording.clone())),
            ..AggregatorSet::default()
        };
        let mut queue = AggregationQueue::default();

        // three notifications within a second, the master never went quiet
        let paths = containers(&dir, 3);
        for (offset, path) in paths.iter().enumerate() {
            queue.push(integration(path));
            assert!(!queue.ready(Duration::from_millis(400 * offset as u64), threshold));
        }
        assert!(!queue.ready(Duration::from_secs(5), threshold));

        let idle = Duration::from_millis(5_001);
        while queue.ready(idle, threshold) {
            let record = queue.pop().unwrap();
            assert!(process(&record, &mut aggregators));
        }

        assert!(queue.is_empty());
        assert_eq!(*recording.seen.lock(), paths);
    }

    #[test]
    fn containers_are_removed_only_after_success() {
        let dir = TempDir::new().unwrap();
        let paths = containers(&dir, 2);

        let mut failing = AggregatorSet {
            integration: Some(Box::new(Recording {
                fail: true,
                ..Recording::default()
            })),
            ..AggregatorSet::default()
        };
        assert!(!process(&integration(&paths[0]), &mut failing));
        assert!(paths[0].is_file());

        let mut working = AggregatorSet {
            integration: Some(Box::new(Recording::default())),
            ..AggregatorSet::default()
        };
        assert!(process(&integration(&paths[1]), &mut working));
        assert!(!paths[1].exists());
    }

    #[test]
    fn unbound_streams_are_rejected() {
        let dir = TempDir::new().unwrap();
        let paths = containers(&dir, 1);
        let record = AggregationRecord::Postintegration {
            worker: WorkerId(3),
            container: paths[0].clone(),
        };

        assert!(matches!(
            record.aggregate(&mut AggregatorSet::default()),
            Err(MasterError::NoAggregator("postintegration"))
        ));
        assert!(paths[0].is_file());
    }
}
