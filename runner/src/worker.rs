use crate::{
    backend::{IntegrationBackend, ItemContext},
    batcher::{
        Batcher, BatcherConfig, BatcherError, BatcherStats, Dispatcher, ResultRecord, StreamKind,
    },
    catalog::{CatalogError, Context, IdFilter, ItemPayload, WorkCatalog, WorkItem},
    protocol::{
        AssignmentReport, CacheCounters, CapacityLimits, MasterMessage, TaskClass, TaskSetup,
        WorkerCapabilities, WorkerId, WorkerMessage,
    },
    store::{ContentGroup, Repository, Store, StoreError},
    tasks::TaskRecord,
    transport::{local::LocalPool, MasterLink, TransportError, WorkerInbox, WorkerOutbox},
};
use chrono::Utc;
use once_cell::sync::Lazy;
use std::{
    path::Path,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

static HOSTNAME: Lazy<String> = Lazy::new(|| match nix::unistd::gethostname() {
    Ok(name) => name.to_string_lossy().into_owned(),
    Err(error) => {
        warn!(error = ?error, "Failed to read hostname: {error}");

        "unknown".to_owned()
    }
});

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Lost connection to the master")]
    Transport(#[from] TransportError),
    #[error("Batcher failed")]
    Batcher(#[from] BatcherError),
    #[error("Repository lookup failed")]
    Store(#[from] StoreError),
    #[error("Failed to build work catalog")]
    Catalog(#[from] CatalogError),
    #[error("Task setup arrived before the information request")]
    NotInitialised,
    #[error("Task '{task}' is not a {expected} task")]
    WrongClass { task: String, expected: TaskClass },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Idle,
    SetupAcknowledged,
    AwaitingAssignment,
    Executing,
    Reporting,
}

/// Turns every flushed container into a `*_DATA_READY` message
#[derive(Debug, Clone)]
struct DataReadyDispatcher {
    outbox: WorkerOutbox,
}

impl Dispatcher for DataReadyDispatcher {
    fn dispatch(&mut self, stream: StreamKind, container: &Path) -> Result<(), BatcherError> {
        let container = container.to_path_buf();
        let message = match stream {
            StreamKind::Integration => WorkerMessage::IntegrationDataReady { container },
            StreamKind::Postintegration => WorkerMessage::PostintegrationDataReady { container },
        };

        Ok(self.outbox.send(message)?)
    }
}

/// Everything needed to run assignments of the current task
#[derive(Debug)]
struct ActiveTask {
    class: TaskClass,
    record: TaskRecord,
    catalog: WorkCatalog,
    source: Option<ContentGroup>,
    batcher: Option<Batcher>,
    setup: TaskSetup,
}

#[derive(Debug)]
enum TaskState {
    None,
    Ready(Box<ActiveTask>),
    // setup failed, every assignment is answered with a failure report
    Broken(TaskClass),
}

/// Drives a single worker from the information request to TERMINATE
pub struct WorkerCoordinator<B: IntegrationBackend> {
    id: WorkerId,
    inbox: WorkerInbox,
    outbox: WorkerOutbox,
    backend: B,
    devices: Vec<String>,
    phase: WorkerPhase,
    store: Option<Repository>,
    limits: Option<CapacityLimits>,
    task: TaskState,
}

impl<B: IntegrationBackend> WorkerCoordinator<B> {
    pub fn new(
        id: WorkerId,
        inbox: WorkerInbox,
        outbox: WorkerOutbox,
        backend: B,
        devices: Vec<String>,
    ) -> Self {
        Self {
            id,
            inbox,
            outbox,
            backend,
            devices,
            phase: WorkerPhase::Idle,
            store: None,
            limits: None,
            task: TaskState::None,
        }
    }

    pub fn phase(&self) -> WorkerPhase {
        self.phase
    }

    pub fn capabilities(&self) -> WorkerCapabilities {
        WorkerCapabilities {
            hostname: HOSTNAME.clone(),
            devices: self.devices.clone(),
            caches: self.limits.as_ref().map_or(0, |limits| limits.caches),
        }
    }

    /// block on the inbox until TERMINATE or the master goes away
    pub fn run(mut self) -> Result<(), WorkerError> {
        info!(worker = %self.id, "Worker ready");

        loop {
            let message = match self.inbox.recv() {
                Ok(message) => message,
                Err(TransportError::Disconnected(_)) => {
                    info!(worker = %self.id, "Master went away, stopping");

                    return Ok(());
                }
                Err(error) => return Err(error.into()),
            };
            debug!(worker = %self.id, message = message.label(), phase = ?self.phase, "Received");

            match message {
                MasterMessage::InformationRequest { store, limits } => {
                    self.initialise(&store, limits)?
                }
                MasterMessage::NewIntegration(setup) => {
                    self.begin_task(TaskClass::Integration, setup)
                }
                MasterMessage::NewPostintegration(setup) => {
                    self.begin_task(TaskClass::Postintegration, setup)
                }
                MasterMessage::NewDerivedContent(setup) => {
                    self.begin_task(TaskClass::DerivedContent, setup)
                }
                MasterMessage::NewWorkAssignment { items } => self.execute(&items)?,
                MasterMessage::EndOfWork => self.close_down()?,
                MasterMessage::Terminate => {
                    info!(worker = %self.id, "Terminating");

                    return Ok(());
                }
            }
        }
    }

    fn initialise(&mut self, store: &Path, limits: CapacityLimits) -> Result<(), WorkerError> {
        self.store = match Repository::open(store) {
            Ok(repository) => Some(repository),
            Err(error) => {
                error!(error = ?error, worker = %self.id, "Failed to open repository: {error}");

                None
            }
        };
        self.limits = Some(limits);
        self.outbox
            .send(WorkerMessage::InformationResponse(self.capabilities()))?;
        self.phase = WorkerPhase::SetupAcknowledged;

        Ok(())
    }

    fn begin_task(&mut self, class: TaskClass, setup: TaskSetup) {
        if !matches!(self.task, TaskState::None) {
            warn!(worker = %self.id, "New task while the previous one is still open, dropping it");
        }

        self.task = match self.prepare(class, setup) {
            Ok(task) => {
                info!(worker = %self.id, task = %task.record.name, items = task.catalog.len(), "Prepared task");

                TaskState::Ready(Box::new(task))
            }
            Err(error) => {
                error!(error = ?error, worker = %self.id, "Failed to prepare {class} task: {error}");

                TaskState::Broken(class)
            }
        };
        self.phase = WorkerPhase::AwaitingAssignment;
    }

    fn prepare(&self, class: TaskClass, setup: TaskSetup) -> Result<ActiveTask, WorkerError> {
        let store = self.store.as_ref().ok_or(WorkerError::NotInitialised)?;
        let limits = self.limits.as_ref().ok_or(WorkerError::NotInitialised)?;
        let config = BatcherConfig::from(limits);
        let context = Context::new(self.devices.clone());

        let record = store.query_task(&setup.task)?;
        if record.class() != class {
            return Err(WorkerError::WrongClass {
                task: record.name,
                expected: class,
            });
        }

        let dispatcher = || {
            Box::new(DataReadyDispatcher {
                outbox: self.outbox.clone(),
            })
        };

        let (catalog, source, batcher) = match class {
            TaskClass::Integration => {
                let catalog = WorkCatalog::build(&record, None, &context)?;
                let mut batcher = Batcher::new(
                    StreamKind::Integration,
                    self.id,
                    config,
                    setup.temp_dir.clone(),
                    dispatcher(),
                )?;

                if let Some(paired) = setup.paired.as_ref() {
                    let partner = Batcher::new(
                        StreamKind::Postintegration,
                        self.id,
                        config,
                        paired.temp_dir.clone(),
                        dispatcher(),
                    )?;
                    batcher = batcher.pair(partner);
                }

                (catalog, None, Some(batcher))
            }
            TaskClass::Postintegration => {
                let parent = match record.parent() {
                    Some(parent) => store.query_task(parent)?,
                    None => {
                        return Err(WorkerError::WrongClass {
                            task: record.name.clone(),
                            expected: class,
                        })
                    }
                };
                let catalog = WorkCatalog::build(&record, Some(&parent), &context)?;
                let source = store.latest_content(&parent.name, &setup.tags)?;
                let batcher = Batcher::new(
                    StreamKind::Postintegration,
                    self.id,
                    config,
                    setup.temp_dir.clone(),
                    dispatcher(),
                )?;

                (catalog, Some(source), Some(batcher))
            }
            TaskClass::DerivedContent => {
                let catalog = WorkCatalog::build(&record, None, &context)?;
                std::fs::create_dir_all(&setup.temp_dir).map_err(BatcherError::IO)?;

                (catalog, None, None)
            }
        };

        Ok(ActiveTask {
            class,
            record,
            catalog,
            source,
            batcher,
            setup,
        })
    }

    #[tracing::instrument(level = "debug", skip(self, items), fields(worker = %self.id, items = items.len()))]
    fn execute(&mut self, items: &[u32]) -> Result<(), WorkerError> {
        // acknowledge first, the master journals the real start time from it
        self.outbox.send(WorkerMessage::NewWorkAcknowledgment {
            timestamp: Utc::now(),
        })?;
        self.phase = WorkerPhase::Executing;

        let task = match &mut self.task {
            TaskState::Ready(task) => task,
            TaskState::Broken(class) => {
                let class = *class;
                warn!(worker = %self.id, "Rejecting assignment of a task that failed to set up");
                self.phase = WorkerPhase::Reporting;
                self.outbox.send(WorkerMessage::Fail {
                    class,
                    report: Timing::start().finish(BatcherStats::default()),
                })?;
                self.phase = WorkerPhase::AwaitingAssignment;

                return Ok(());
            }
            TaskState::None => {
                warn!(worker = %self.id, "Assignment without a task, discarding it");
                self.phase = WorkerPhase::Idle;

                return Ok(());
            }
        };

        let view = task.catalog.filter(&IdFilter::new(items.iter().copied()));
        let mut failed = view.len() != items.len();
        if failed {
            error!(
                worker = %self.id,
                assigned = items.len(),
                known = view.len(),
                "Assignment names items outside the catalog"
            );
        }

        let before = task
            .batcher
            .as_ref()
            .map(Batcher::stats)
            .unwrap_or_default();
        let mut timing = Timing::start();

        if !failed {
            for item in view.iter() {
                let started = Instant::now();
                let result = run_item(&mut self.backend, &self.outbox, &self.devices, task, item);

                match result {
                    Ok(cache) => timing.item(started.elapsed(), &cache),
                    Err(reason) => {
                        error!(worker = %self.id, serial = item.serial, "Item failed: {reason}");
                        failed = true;

                        break;
                    }
                }

                // safe point between items, delayed flushes and checkpoints happen here
                if let Some(batcher) = task.batcher.as_mut() {
                    if let Err(error) = batcher.flush_if_due().and_then(|_| batcher.checkpoint()) {
                        error!(error = ?error, worker = %self.id, "Flush failed: {error}");
                        failed = true;

                        break;
                    }
                }
            }
        }

        self.phase = WorkerPhase::Reporting;
        let stats = task
            .batcher
            .as_ref()
            .map(|batcher| batcher.stats().since(&before))
            .unwrap_or_default();
        let report = timing.finish(stats);
        let class = task.class;

        info!(
            worker = %self.id,
            items = report.items,
            total = ?report.total,
            failed = failed,
            "Assignment complete"
        );

        self.outbox.send(if failed {
            WorkerMessage::Fail { class, report }
        } else {
            WorkerMessage::Finished { class, report }
        })?;
        self.phase = WorkerPhase::AwaitingAssignment;

        Ok(())
    }

    fn close_down(&mut self) -> Result<(), WorkerError> {
        if let TaskState::Ready(mut task) = std::mem::replace(&mut self.task, TaskState::None) {
            if let Some(batcher) = task.batcher.as_mut() {
                if let Err(error) = batcher.close() {
                    error!(error = ?error, worker = %self.id, "Final flush failed: {error}");
                }
            }
        }

        self.outbox.send(WorkerMessage::WorkerCloseDown)?;
        self.phase = WorkerPhase::Idle;
        info!(worker = %self.id, "Closed down");

        Ok(())
    }
}

/// spawn `workers` worker threads in this process, each with a fresh backend from `backend`
pub fn local_pool<B, F>(
    workers: usize,
    devices: Vec<String>,
    backend: F,
) -> Result<MasterLink, TransportError>
where
    B: IntegrationBackend,
    F: Fn() -> B + Send + Sync + Clone + 'static,
{
    let pool = LocalPool::spawn(workers, move |id, inbox, outbox| {
        let coordinator = WorkerCoordinator::new(id, inbox, outbox, backend(), devices.clone());

        if let Err(error) = coordinator.run() {
            error!(error = ?error, worker = %id, "Worker stopped: {error}");
        }
    })?;

    Ok(MasterLink::Local(pool))
}

/// run the backend on one item and stage its output, the error is the failure reason
fn run_item<B: IntegrationBackend>(
    backend: &mut B,
    outbox: &WorkerOutbox,
    devices: &[String],
    task: &mut ActiveTask,
    item: &WorkItem,
) -> Result<CacheCounters, String> {
    let device = devices
        .get(item.lane % devices.len().max(1))
        .map_or("cpu", String::as_str);
    let context = ItemContext {
        task: &task.record,
        item,
        source: task.source.as_ref(),
        device,
        log_dir: &task.setup.log_dir,
    };

    match task.class {
        TaskClass::Integration | TaskClass::Postintegration => {
            let output = backend.integrate(&context).map_err(|error| error.to_string())?;
            let batcher = match task.batcher.as_mut() {
                Some(batcher) => batcher,
                None => return Err("no batcher for this task".to_owned()),
            };

            stage(batcher, item, output.records, output.background, output.paired)
                .map_err(|error| error.to_string())?;

            Ok(output.cache)
        }
        TaskClass::DerivedContent => {
            let product = backend
                .derive(&context, &task.setup.temp_dir)
                .map_err(|error| error.to_string())?;

            outbox
                .send(WorkerMessage::DerivedContentReady {
                    product: product.product,
                    path: product.path,
                    groups: product.groups,
                })
                .map_err(|error| error.to_string())?;

            Ok(product.cache)
        }
    }
}

fn stage(
    batcher: &mut Batcher,
    item: &WorkItem,
    records: Vec<ResultRecord>,
    background: Vec<ResultRecord>,
    paired: Vec<ResultRecord>,
) -> Result<(), BatcherError> {
    if item.store_prefix {
        if let ItemPayload::Configuration { values } = &item.payload {
            batcher.push_configuration(item.serial, values.clone())?;
        }
    }

    if item.store_background {
        for record in background {
            batcher.push_background(record)?;
        }
    }

    for record in records {
        batcher.push(record)?;
    }

    if batcher.is_paired() {
        for record in paired {
            batcher.push_paired(record)?;
        }
    } else if !paired.is_empty() {
        debug!(serial = item.serial, "Ignoring paired rows without a paired batcher");
    }

    Ok(())
}

/// wallclock bookkeeping of one assignment
#[derive(Debug)]
struct Timing {
    started: Instant,
    min_item: Option<Duration>,
    max_item: Option<Duration>,
    items: u32,
    cache: CacheCounters,
}

impl Timing {
    fn start() -> Self {
        Self {
            started: Instant::now(),
            min_item: None,
            max_item: None,
            items: 0,
            cache: CacheCounters::default(),
        }
    }

    fn item(&mut self, elapsed: Duration, cache: &CacheCounters) {
        self.items += 1;
        self.cache.merge(cache);
        self.min_item = Some(self.min_item.map_or(elapsed, |min| min.min(elapsed)));
        self.max_item = Some(self.max_item.map_or(elapsed, |max| max.max(elapsed)));
    }

    fn finish(self, batcher: BatcherStats) -> AssignmentReport {
        AssignmentReport {
            total: self.started.elapsed(),
            min_item: self.min_item.unwrap_or_default(),
            max_item: self.max_item.unwrap_or_default(),
            items: self.items,
            cache: self.cache,
            batcher,
            finished_at: Utc::now(),
        }
    }
}

#[cfg(test)]
#[path = "worker_test.rs"]
mod worker_test;
