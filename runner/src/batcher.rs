pub mod container;

use crate::{protocol::WorkerId, transport::TransportError};
use container::Staged;
use serde::{Deserialize, Serialize};
use std::{
    fmt, mem,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, info, warn};

// fixed bookkeeping cost of one record (serial, step, vec header) on top of its values
pub const RECORD_OVERHEAD: usize = 32;

#[derive(Error, Debug)]
pub enum BatcherError {
    #[error("Batcher for {0} stream is already closed")]
    Closed(StreamKind),
    #[error("Failed to write temporary container")]
    Container(#[from] rusqlite::Error),
    #[error("Failed to prepare temporary directory")]
    IO(#[from] std::io::Error),
    #[error("Failed to dispatch flushed container")]
    Dispatch(#[from] TransportError),
    #[error("No paired batcher to receive {0} records")]
    NotPaired(StreamKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Integration,
    Postintegration,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Integration => "integration",
            Self::Postintegration => "postintegration",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// flush as soon as capacity is exceeded
    #[default]
    Immediate,
    /// only raise `flush_due`, the owner picks a safe point to flush
    Delayed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Capacity,
    Checkpoint,
    Close,
}

/// One computed row, as produced by the integration backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub serial: u32,
    #[serde(default)]
    pub step: u32,
    pub values: Vec<f64>,
}

impl ResultRecord {
    pub fn new(serial: u32, step: u32, values: Vec<f64>) -> Self {
        Self {
            serial,
            step,
            values,
        }
    }

    /// estimated in-memory footprint
    pub fn storage(&self) -> usize {
        RECORD_OVERHEAD + self.values.len() * mem::size_of::<f64>()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatcherConfig {
    pub capacity: usize,
    pub checkpoint: Duration,
    pub mode: FlushMode,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatcherStats {
    pub flushes: u32,
    pub checkpoints: u32,
    pub records: u64,
    pub bytes: u64,
}

impl BatcherStats {
    pub fn merge(&mut self, other: &BatcherStats) {
        self.flushes += other.flushes;
        self.checkpoints += other.checkpoints;
        self.records += other.records;
        self.bytes += other.bytes;
    }

    /// what happened after `earlier` was taken
    pub fn since(&self, earlier: &BatcherStats) -> BatcherStats {
        BatcherStats {
            flushes: self.flushes.saturating_sub(earlier.flushes),
            checkpoints: self.checkpoints.saturating_sub(earlier.checkpoints),
            records: self.records.saturating_sub(earlier.records),
            bytes: self.bytes.saturating_sub(earlier.bytes),
        }
    }
}

/// Receives every container a batcher writes
pub trait Dispatcher {
    fn dispatch(&mut self, stream: StreamKind, container: &Path) -> Result<(), BatcherError>;
}

/// Bounded accumulator of result records for one worker and one stream
pub struct Batcher {
    stream: StreamKind,
    worker: WorkerId,
    config: BatcherConfig,
    temp_dir: PathBuf,
    staged: Staged,
    storage: usize,
    flush_due: bool,
    last_flush: Instant,
    sequence: u32,
    closed: bool,
    stats: BatcherStats,
    dispatcher: Box<dyn Dispatcher>,
    paired: Option<Box<Batcher>>,
}

impl fmt::Debug for Batcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batcher")
            .field("stream", &self.stream)
            .field("worker", &self.worker)
            .field("config", &self.config)
            .field("storage", &self.storage)
            .field("flush_due", &self.flush_due)
            .field("closed", &self.closed)
            .field("paired", &self.paired)
            .finish()
    }
}

impl Batcher {
    pub fn new(
        stream: StreamKind,
        worker: WorkerId,
        config: BatcherConfig,
        temp_dir: PathBuf,
        dispatcher: Box<dyn Dispatcher>,
    ) -> Result<Self, BatcherError> {
        std::fs::create_dir_all(&temp_dir)?;

        Ok(Self {
            stream,
            worker,
            config,
            temp_dir,
            staged: Staged::default(),
            storage: 0,
            flush_due: false,
            last_flush: Instant::now(),
            sequence: 0,
            closed: false,
            stats: BatcherStats::default(),
            dispatcher,
            paired: None,
        })
    }

    /// attach `partner`, from now on both are flushed and closed together
    pub fn pair(mut self, partner: Batcher) -> Self {
        self.paired = Some(Box::new(partner));
        self
    }

    pub fn stream(&self) -> StreamKind {
        self.stream
    }

    pub fn is_paired(&self) -> bool {
        self.paired.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn flush_mode(&self) -> FlushMode {
        self.config.mode
    }

    pub fn flush_due(&self) -> bool {
        self.flush_due
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// current byte estimate, including the paired batcher
    pub fn storage(&self) -> usize {
        self.storage + self.paired.as_ref().map_or(0, |paired| paired.storage)
    }

    /// statistics of this batcher and its partner
    pub fn stats(&self) -> BatcherStats {
        let mut stats = self.stats.clone();
        if let Some(paired) = self.paired.as_ref() {
            stats.merge(&paired.stats);
        }

        stats
    }

    pub fn push(&mut self, record: ResultRecord) -> Result<(), BatcherError> {
        self.ensure_open()?;
        self.storage += record.storage();
        self.staged.records.push(record);

        self.after_insert()
    }

    pub fn push_background(&mut self, record: ResultRecord) -> Result<(), BatcherError> {
        self.ensure_open()?;
        self.storage += record.storage();
        self.staged.background.push(record);

        self.after_insert()
    }

    pub fn push_configuration(&mut self, serial: u32, values: Vec<f64>) -> Result<(), BatcherError> {
        self.ensure_open()?;
        let record = ResultRecord::new(serial, 0, values);
        self.storage += record.storage();
        self.staged.configurations.push(record);

        self.after_insert()
    }

    /// stage a record in the paired batcher, capacity is accounted for the pair
    pub fn push_paired(&mut self, record: ResultRecord) -> Result<(), BatcherError> {
        self.ensure_open()?;
        match self.paired.as_mut() {
            Some(paired) => {
                paired.storage += record.storage();
                paired.staged.records.push(record);
            }
            None => {
                return Err(BatcherError::NotPaired(match self.stream {
                    StreamKind::Integration => StreamKind::Postintegration,
                    StreamKind::Postintegration => StreamKind::Integration,
                }))
            }
        }

        self.after_insert()
    }

    fn ensure_open(&self) -> Result<(), BatcherError> {
        if self.closed {
            Err(BatcherError::Closed(self.stream))
        } else {
            Ok(())
        }
    }

    fn after_insert(&mut self) -> Result<(), BatcherError> {
        if self.storage() > self.config.capacity {
            match self.config.mode {
                FlushMode::Immediate => return self.flush(FlushReason::Capacity),
                FlushMode::Delayed => {
                    if !self.flush_due {
                        debug!(stream = %self.stream, storage = self.storage(), "Capacity exceeded, flush is due");
                    }
                    self.flush_due = true;
                }
            }
        }

        self.checkpoint().map(|_| ())
    }

    /// flush if the checkpoint interval has elapsed since the last flush
    pub fn checkpoint(&mut self) -> Result<bool, BatcherError> {
        if self.closed
            || self.config.checkpoint.is_zero()
            || self.last_flush.elapsed() < self.config.checkpoint
        {
            return Ok(false);
        }

        match self.config.mode {
            FlushMode::Immediate => {
                self.flush(FlushReason::Checkpoint)?;

                Ok(true)
            }
            FlushMode::Delayed => {
                self.flush_due = true;

                Ok(false)
            }
        }
    }

    /// honour a pending flush request, returns whether a flush happened
    pub fn flush_if_due(&mut self) -> Result<bool, BatcherError> {
        if !self.flush_due {
            return Ok(false);
        }

        let reason = if self.storage() > self.config.capacity {
            FlushReason::Capacity
        } else {
            FlushReason::Checkpoint
        };
        self.flush(reason)?;

        Ok(true)
    }

    /// write everything staged (here and in the partner) to fresh containers and dispatch them
    pub fn flush(&mut self, reason: FlushReason) -> Result<(), BatcherError> {
        self.flush_own(reason)?;

        if let Some(paired) = self.paired.as_mut() {
            paired.flush_own(reason)?;
        }

        Ok(())
    }

    fn flush_own(&mut self, reason: FlushReason) -> Result<(), BatcherError> {
        if self.staged.is_empty() {
            self.flush_due = false;
            self.last_flush = Instant::now();
            return Ok(());
        }

        let path = self.temp_dir.join(format!(
            "{}_w{}_{:05}.sqlite",
            self.stream, self.worker.0, self.sequence
        ));
        self.sequence += 1;

        // staged records are only released once the container holds them
        let rows = match container::write_container(&path, &self.staged) {
            Ok(rows) => rows,
            Err(error) => {
                if let Err(cleanup) = std::fs::remove_file(&path) {
                    debug!(error = ?cleanup, "No partial container to remove: {cleanup}");
                }

                return Err(error.into());
            }
        };
        self.staged = Staged::default();
        let bytes = mem::replace(&mut self.storage, 0);
        self.flush_due = false;

        self.stats.flushes += 1;
        self.stats.records += rows as u64;
        self.stats.bytes += bytes as u64;
        if reason == FlushReason::Checkpoint {
            self.stats.checkpoints += 1;
        }

        info!(
            worker = %self.worker,
            stream = %self.stream,
            reason = ?reason,
            rows = rows,
            "Flushed batcher to {}",
            path.to_string_lossy()
        );

        let dispatched = self.dispatcher.dispatch(self.stream, &path);
        // the checkpoint window starts once the container has been handed off
        self.last_flush = Instant::now();

        dispatched
    }

    /// final flush of anything left, afterwards the batcher rejects records
    pub fn close(&mut self) -> Result<(), BatcherError> {
        if self.closed {
            return Ok(());
        }

        let result = if self.storage() > 0 {
            self.flush(FlushReason::Close)
        } else {
            Ok(())
        };

        self.closed = true;
        if let Some(paired) = self.paired.as_mut() {
            paired.closed = true;
        }

        if let Err(ref error) = result {
            warn!(error = ?error, stream = %self.stream, "Final flush failed: {error}");
        }

        result
    }
}

#[cfg(test)]
#[path = "batcher_test.rs"]
mod batcher_test;
