use crate::{
    catalog::WorkCatalog,
    protocol::{WorkerCapabilities, WorkerId},
};
use std::{collections::VecDeque, time::Duration};
use tracing::{debug, info, warn};

/// The assigner's view of a single worker
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerRecord {
    pub worker: WorkerId,
    pub reported: bool,
    pub active: bool,
    pub assigned: bool,
    pub capabilities: Option<WorkerCapabilities>,
    pub current: Vec<u32>,
    pub assignments: u32,
    pub items: u64,
    pub total_time: Duration,
}

impl WorkerRecord {
    fn new(worker: WorkerId) -> Self {
        Self {
            worker,
            reported: false,
            active: false,
            assigned: false,
            capabilities: None,
            current: Vec::new(),
            assignments: 0,
            items: 0,
            total_time: Duration::ZERO,
        }
    }

    /// running mean time per item, unknown until the first completed item
    pub fn mean_time(&self) -> Option<Duration> {
        if self.items == 0 {
            None
        } else {
            Some(self.total_time.div_f64(self.items as f64))
        }
    }
}

/// Turns the remaining catalog into per-worker assignments, sized on observed throughput
#[derive(Debug, Clone)]
pub struct Assigner {
    workers: Vec<WorkerRecord>,
    queue: VecDeque<u32>,
    max_unit: usize,
    target: Duration,
    units_per_worker: usize,
    min_time: Option<Duration>,
    max_time: Option<Duration>,
}

impl Assigner {
    pub fn new(target: Duration, units_per_worker: usize) -> Self {
        Self {
            workers: Vec::new(),
            queue: VecDeque::new(),
            max_unit: 1,
            target,
            units_per_worker: units_per_worker.max(1),
            min_time: None,
            max_time: None,
        }
    }

    /// forget everything about the previous task, `workers` is the pool size
    pub fn reset(&mut self, workers: usize) {
        self.workers = (0..workers)
            .map(|index| WorkerRecord::new(WorkerId(index as u32)))
            .collect();
        self.queue.clear();
        self.max_unit = 1;
        self.min_time = None;
        self.max_time = None;
    }

    /// a worker answered the information request, it takes part in this task
    pub fn initialize_worker(&mut self, worker: WorkerId, capabilities: WorkerCapabilities) -> bool {
        match self.record_mut(worker) {
            Some(record) => {
                if record.reported {
                    warn!(worker = %worker, "Worker reported twice during setup");
                }
                record.reported = true;
                record.active = true;
                record.capabilities = Some(capabilities);

                true
            }
            None => {
                warn!(worker = %worker, "Capabilities from unknown worker");

                false
            }
        }
    }

    pub fn all_reported(&self) -> bool {
        self.workers.iter().all(|record| record.reported)
    }

    pub fn prepare_queue(&mut self, catalog: &WorkCatalog) {
        self.queue = catalog.serials().into();
        debug!(task = catalog.task(), items = self.queue.len(), "Prepared queue");
    }

    /// fix the largest allocation unit, returns it
    pub fn complete_queue_setup(&mut self) -> usize {
        let active = self.active_count().max(1);
        let units = active * self.units_per_worker;

        self.max_unit = ((self.queue.len() + units - 1) / units).max(1);
        info!(
            items = self.queue.len(),
            active = active,
            max_unit = self.max_unit,
            "Queue setup complete"
        );

        self.max_unit
    }

    pub fn assignable(&self) -> bool {
        !self.queue.is_empty()
            && self
                .workers
                .iter()
                .any(|record| record.active && !record.assigned)
    }

    /// hand out the next slice of the queue to every idle active worker
    pub fn assign_work(&mut self) -> Vec<(WorkerId, Vec<u32>)> {
        let mut assignments = Vec::new();
        let mut idle = self
            .workers
            .iter()
            .filter(|record| record.active && !record.assigned)
            .count();

        for record in self
            .workers
            .iter_mut()
            .filter(|record| record.active && !record.assigned)
        {
            if self.queue.is_empty() {
                break;
            }

            let wanted = match record.mean_time() {
                // pilot assignment, gives the first timing sample
                None => 1,
                Some(mean) if mean.is_zero() => self.max_unit,
                Some(mean) => {
                    let fit = (self.target.as_secs_f64() / mean.as_secs_f64()).floor() as usize;

                    fit.clamp(1, self.max_unit)
                }
            };
            // leave a share of the tail to every other idle worker
            let share = (self.queue.len() + idle - 1) / idle;
            let count = wanted.min(share).max(1).min(self.queue.len());
            idle -= 1;

            let items: Vec<u32> = self.queue.drain(..count).collect();
            record.assigned = true;
            record.assignments += 1;
            record.current = items.clone();

            debug!(worker = %record.worker, items = items.len(), "Assigned work");
            assignments.push((record.worker, items));
        }

        assignments
    }

    /// fold a completed assignment back into the worker's statistics
    pub fn mark_unassigned(&mut self, worker: WorkerId, elapsed: Duration, count: u32) -> bool {
        let record = match self.record_mut(worker) {
            Some(record) => record,
            None => {
                warn!(worker = %worker, "Completion from unknown worker");

                return false;
            }
        };

        if !record.assigned {
            warn!(worker = %worker, "Completion from a worker without an assignment");
        }
        record.assigned = false;
        record.current.clear();

        if count == 0 {
            return true;
        }

        record.total_time += elapsed;
        record.items += count as u64;

        let per_item = elapsed / count;
        self.min_time = Some(self.min_time.map_or(per_item, |min| min.min(per_item)));
        self.max_time = Some(self.max_time.map_or(per_item, |max| max.max(per_item)));

        true
    }

    /// the worker acknowledged shutdown
    pub fn mark_inactive(&mut self, worker: WorkerId) -> bool {
        match self.record_mut(worker) {
            Some(record) => {
                record.active = false;

                true
            }
            None => false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn all_inactive(&self) -> bool {
        self.workers.iter().all(|record| !record.active)
    }

    pub fn active_count(&self) -> usize {
        self.workers.iter().filter(|record| record.active).count()
    }

    pub fn active_workers(&self) -> Vec<WorkerId> {
        self.workers
            .iter()
            .filter(|record| record.active)
            .map(|record| record.worker)
            .collect()
    }

    pub fn remaining(&self) -> usize {
        self.queue.len()
    }

    pub fn max_unit(&self) -> usize {
        self.max_unit
    }

    pub fn min_time(&self) -> Option<Duration> {
        self.min_time
    }

    pub fn max_time(&self) -> Option<Duration> {
        self.max_time
    }

    pub fn record(&self, worker: WorkerId) -> Option<&WorkerRecord> {
        self.workers.get(worker.0 as usize)
    }

    fn record_mut(&mut self, worker: WorkerId) -> Option<&mut WorkerRecord> {
        self.workers.get_mut(worker.0 as usize)
    }
}

#[cfg(test)]
#[path = "assigner_test.rs"]
mod assigner_test;
