use super::{
    aggregation::{self, AggregationQueue, AggregationRecord, AggregatorSet},
    MasterCoordinator, MasterError, TaskOutcome,
};
use crate::{
    catalog::WorkCatalog,
    journal::{EventKind, Lane},
    protocol::{MasterMessage, WorkerId, WorkerMessage},
    store::{Store, TaskMetadata},
};
use chrono::Utc;
use std::{
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, error, info, warn};

// lower bound on the sleep between idle polls
const MIN_POLL: Duration = Duration::from_micros(100);

/// Mutable state of one poll loop
#[derive(Debug)]
struct PollState {
    success: bool,
    metadata: TaskMetadata,
    queue: AggregationQueue,
    aggregated: usize,
    end_of_work_sent: bool,
    last_message: Instant,
}

impl<S: Store> MasterCoordinator<S> {
    /// barrier, announcement and poll loop for one task
    pub(super) fn run_task(
        &mut self,
        catalog: &WorkCatalog,
        announcement: MasterMessage,
        aggregators: &mut AggregatorSet,
    ) -> Result<TaskOutcome, MasterError> {
        self.sequence += 1;
        self.journal.set_correlation(Some(self.sequence));

        let result = self.announce(catalog, &announcement).map(|success| {
            let started = Instant::now();
            let mut outcome = self.poll_loop(aggregators, success);
            outcome.metadata.wallclock = started.elapsed();

            outcome
        });
        self.journal.set_correlation(None);

        result
    }

    /// collect capabilities, fix the queue and hand the task to every active worker
    fn announce(
        &mut self,
        catalog: &WorkCatalog,
        announcement: &MasterMessage,
    ) -> Result<bool, MasterError> {
        let active = self.setup_barrier()?;
        let mut success = true;

        self.assigner.prepare_queue(catalog);
        let max_unit = self.assigner.complete_queue_setup();
        info!(
            task = catalog.task(),
            items = catalog.len(),
            workers = active,
            max_unit = max_unit,
            "Starting {}",
            announcement.label()
        );

        for worker in self.assigner.active_workers() {
            if let Err(error) = self.link.send(worker, announcement) {
                error!(error = ?error, worker = %worker, "Failed to announce task: {error}");
                self.assigner.mark_inactive(worker);
                success = false;
            }
        }

        Ok(success)
    }

    /// INFORMATION_REQUEST to every worker, then wait for the answers, returns the active count
    fn setup_barrier(&mut self) -> Result<usize, MasterError> {
        let began = Utc::now();
        self.assigner.reset(self.link.len());

        let request = MasterMessage::InformationRequest {
            store: self.store.root().to_path_buf(),
            limits: self.limits.clone(),
        };
        for (worker, error) in self.link.broadcast(&request) {
            warn!(error = ?error, worker = %worker, "Failed to reach worker: {error}");
        }

        let deadline = Instant::now() + self.settings.setup_timeout;
        while !self.assigner.all_reported() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    reported = self.assigner.active_count(),
                    workers = self.link.len(),
                    "Setup timed out, continuing with the workers that answered"
                );
                break;
            }

            match self.link.recv_timeout(remaining)? {
                Some((worker, WorkerMessage::InformationResponse(capabilities))) => {
                    debug!(
                        worker = %worker,
                        hostname = %capabilities.hostname,
                        devices = capabilities.devices.len(),
                        "Worker reported"
                    );
                    self.assigner.initialize_worker(worker, capabilities);
                }
                Some((worker, message)) => {
                    warn!(worker = %worker, message = message.label(), "Discarding message during setup");
                }
                None => {}
            }
        }

        self.journal.begin(Lane::master(), EventKind::Setup, began);
        self.journal.end(Lane::master(), EventKind::Setup, Utc::now());

        match self.assigner.active_count() {
            0 => Err(MasterError::NoWorkers),
            active => Ok(active),
        }
    }

    fn poll_loop(&mut self, aggregators: &mut AggregatorSet, success: bool) -> TaskOutcome {
        let mut state = PollState {
            success,
            metadata: TaskMetadata::default(),
            queue: AggregationQueue::default(),
            aggregated: 0,
            end_of_work_sent: false,
            last_message: Instant::now(),
        };

        while !self.assigner.all_inactive() {
            if !state.end_of_work_sent && self.assigner.is_finished() {
                self.end_of_work(&mut state);
            }

            if self.assigner.assignable() {
                self.dispatch_work(&mut state);
            }

            let received = self.drain_inbox(&mut state);
            if received > 0 {
                state.last_message = Instant::now();
            }

            if state
                .queue
                .ready(state.last_message.elapsed(), self.settings.idle_threshold)
            {
                if let Some(record) = state.queue.pop() {
                    self.aggregate(&record, aggregators, &mut state);
                }
            } else if received == 0 {
                thread::sleep(self.settings.poll_interval.max(MIN_POLL));
            }
        }

        if !state.queue.is_empty() {
            debug!(pending = state.queue.len(), "Draining aggregation queue");
        }
        while let Some(record) = state.queue.pop() {
            self.aggregate(&record, aggregators, &mut state);
        }

        TaskOutcome {
            success: state.success,
            metadata: state.metadata,
            aggregated: state.aggregated,
        }
    }

    fn end_of_work(&mut self, state: &mut PollState) {
        debug!("Queue exhausted, sending END_OF_WORK");

        for worker in self.assigner.active_workers() {
            if let Err(error) = self.link.send(worker, &MasterMessage::EndOfWork) {
                error!(error = ?error, worker = %worker, "Failed to close down worker: {error}");
                self.assigner.mark_inactive(worker);
                state.success = false;
            }
        }
        state.end_of_work_sent = true;
    }

    fn dispatch_work(&mut self, state: &mut PollState) {
        for (worker, items) in self.assigner.assign_work() {
            let message = MasterMessage::NewWorkAssignment { items };

            if let Err(error) = self.link.send(worker, &message) {
                error!(error = ?error, worker = %worker, "Failed to send assignment: {error}");
                self.assigner.mark_inactive(worker);
                state.success = false;
            }
        }
    }

    /// handle everything currently waiting, returns the number of messages
    fn drain_inbox(&mut self, state: &mut PollState) -> usize {
        let began = Utc::now();
        let mut received = 0;

        loop {
            match self.link.try_recv() {
                Ok(Some((worker, message))) => {
                    received += 1;
                    self.handle(worker, message, state);
                }
                Ok(None) => break,
                Err(error) => {
                    error!(error = ?error, "Lost every worker: {error}");
                    for worker in self.assigner.active_workers() {
                        self.assigner.mark_inactive(worker);
                    }
                    state.success = false;

                    break;
                }
            }
        }

        if received > 0 {
            self.journal.begin(Lane::master(), EventKind::Communication, began);
            self.journal.end(Lane::master(), EventKind::Communication, Utc::now());
        }

        received
    }

    fn handle(&mut self, worker: WorkerId, message: WorkerMessage, state: &mut PollState) {
        debug!(worker = %worker, message = message.label(), "Received");
        let lane = Lane::worker(worker);

        match message {
            WorkerMessage::NewWorkAcknowledgment { timestamp } => {
                self.journal.begin(lane, EventKind::Assignment, timestamp);
            }
            WorkerMessage::IntegrationDataReady { container } => {
                self.journal.milestone(lane, EventKind::DataReady, Utc::now());
                state
                    .queue
                    .push(AggregationRecord::Integration { worker, container });
            }
            WorkerMessage::PostintegrationDataReady { container } => {
                self.journal.milestone(lane, EventKind::DataReady, Utc::now());
                state
                    .queue
                    .push(AggregationRecord::Postintegration { worker, container });
            }
            WorkerMessage::DerivedContentReady {
                product,
                path,
                groups,
            } => {
                self.journal.milestone(lane, EventKind::DataReady, Utc::now());
                state.queue.push(AggregationRecord::DerivedContent {
                    worker,
                    product,
                    path,
                    groups,
                });
            }
            WorkerMessage::Finished { class, report } => {
                self.journal
                    .end(lane, EventKind::Assignment, report.finished_at);
                self.assigner
                    .mark_unassigned(worker, report.total, report.items);
                state.metadata.fold(worker, &report, false);
                debug!(worker = %worker, items = report.items, total = ?report.total, "{class} assignment finished");
            }
            WorkerMessage::Fail { class, report } => {
                self.journal
                    .end(lane, EventKind::Assignment, report.finished_at);
                self.assigner
                    .mark_unassigned(worker, report.total, report.items);
                state.metadata.fold(worker, &report, true);
                state.success = false;
                error!(worker = %worker, items = report.items, "{class} assignment failed");
            }
            WorkerMessage::WorkerCloseDown => {
                self.journal.milestone(lane, EventKind::CloseDown, Utc::now());
                self.assigner.mark_inactive(worker);
                info!(worker = %worker, "Worker closed down");
            }
            WorkerMessage::InformationResponse(_) => {
                warn!(worker = %worker, "Late information response, discarding it");
            }
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(worker = %record.worker()))]
    fn aggregate(
        &mut self,
        record: &AggregationRecord,
        aggregators: &mut AggregatorSet,
        state: &mut PollState,
    ) {
        self.journal
            .begin(Lane::master(), EventKind::Aggregation, Utc::now());
        let aggregated = aggregation::process(record, aggregators);
        let finished = Utc::now();
        self.journal
            .end(Lane::master(), EventKind::Aggregation, finished);

        if aggregated {
            self.journal
                .milestone(Lane::master(), EventKind::AggregationOccurred, finished);
            state.aggregated += 1;
        } else {
            state.success = false;
        }
    }
}
