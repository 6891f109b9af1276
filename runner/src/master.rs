pub mod aggregation;
mod poll;

use crate::{
    assigner::Assigner,
    catalog::{CatalogError, Context, WorkCatalog},
    config::{RunnerConfig, SchedulerSettings},
    jobs::{JobDescriptor, JobQueue},
    journal::Journal,
    protocol::{CapacityLimits, MasterMessage, PairedSetup, TaskSetup},
    store::{Store, StoreError, TaskMetadata, Writer},
    tasks::{PostintegrationTask, TaskKind, TaskRecord},
    transport::{MasterLink, TransportError},
};
use aggregation::{AggregatorSet, WriterAggregator};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum MasterError {
    #[error("No worker answered the information request")]
    NoWorkers,
    #[error("No aggregator bound for {0} data")]
    NoAggregator(&'static str),
    #[error("Repository operation failed")]
    Store(#[from] StoreError),
    #[error("Failed to build work catalog")]
    Catalog(#[from] CatalogError),
    #[error("Worker communication failed")]
    Transport(#[from] TransportError),
}

/// What happened to the jobs of one run
#[derive(Debug, Default)]
pub struct RunSummary {
    /// tasks committed and records exported
    pub completed: Vec<String>,
    /// tasks that ran but were rolled back
    pub failed: Vec<String>,
    /// jobs that could not be started at all
    pub skipped: Vec<String>,
    pub journal: Journal,
}

/// Result of one pass through the poll loop
#[derive(Debug, Clone, Default)]
pub struct TaskOutcome {
    pub success: bool,
    pub metadata: TaskMetadata,
    pub aggregated: usize,
}

/// Runs the job queue against a pool of workers, one task at a time
pub struct MasterCoordinator<S: Store> {
    store: S,
    link: MasterLink,
    assigner: Assigner,
    journal: Journal,
    settings: SchedulerSettings,
    limits: CapacityLimits,
    context: Context,
    sequence: u64,
}

impl<S: Store> MasterCoordinator<S> {
    pub fn new(store: S, link: MasterLink, config: &RunnerConfig) -> Self {
        let settings = config.scheduler_settings();

        Self {
            store,
            link,
            assigner: Assigner::new(settings.target_assignment, settings.units_per_worker),
            journal: Journal::new(),
            settings,
            limits: config.capacity_limits(),
            context: Context::new(config.devices.clone()),
            sequence: 0,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// execute every job in order, then terminate the workers
    pub fn run(mut self, jobs: JobQueue) -> RunSummary {
        let mut summary = RunSummary::default();

        for job in jobs {
            let name = job.name().to_owned();

            match self.run_job(&job) {
                Ok(true) => summary.completed.push(name),
                Ok(false) => summary.failed.push(name),
                Err(error) => {
                    error!(error = ?error, job = %name, "Skipping job: {error}");
                    summary.skipped.push(name);
                }
            }
        }

        info!(
            completed = summary.completed.len(),
            failed = summary.failed.len(),
            skipped = summary.skipped.len(),
            "Job queue drained, terminating workers"
        );

        let Self { link, journal, .. } = self;
        if let Err(error) = link.shutdown() {
            error!(error = ?error, "Failed to shut down workers: {error}");
        }
        summary.journal = journal;

        summary
    }

    /// returns whether the job's output was committed
    #[tracing::instrument(level = "info", skip(self, job), fields(job = job.name()))]
    fn run_job(&mut self, job: &JobDescriptor) -> Result<bool, MasterError> {
        match job {
            JobDescriptor::Get { kind, name, out } => {
                self.store.export_record(*kind, name, out)?;
                info!("Exported {kind} '{name}' to {}", out.to_string_lossy());

                Ok(true)
            }
            JobDescriptor::Task { name, tags } => {
                let task = self.store.query_task(name)?;
                info!(kind = task.task.name(), "Scheduling task '{name}'");

                match &task.task {
                    TaskKind::Twopf(_) | TaskKind::Threepf(_) => {
                        self.schedule_integration(&task, tags)
                    }
                    TaskKind::ZetaTwopf(post)
                    | TaskKind::ZetaThreepf(post)
                    | TaskKind::FNL(post) => self.schedule_postintegration(&task, post, tags),
                    TaskKind::Output(_) => self.schedule_output(&task, tags),
                }
            }
        }
    }

    fn schedule_integration(
        &mut self,
        task: &TaskRecord,
        tags: &[String],
    ) -> Result<bool, MasterError> {
        let mut writer = self.store.new_integration_writer(task, tags)?;
        let catalog = WorkCatalog::build(task, None, &self.context)?;
        let setup = task_setup(&task.name, &writer, None, tags);

        let outcome = {
            let mut aggregators = AggregatorSet {
                integration: Some(Box::new(WriterAggregator(&mut writer))),
                ..AggregatorSet::default()
            };
            self.run_task(&catalog, MasterMessage::NewIntegration(setup), &mut aggregators)?
        };

        finish_writer(writer, &outcome)
    }

    fn schedule_postintegration(
        &mut self,
        task: &TaskRecord,
        post: &PostintegrationTask,
        tags: &[String],
    ) -> Result<bool, MasterError> {
        let parent = self.store.query_task(&post.parent)?;
        // validates the parent kind, serials match the parent's configurations
        let catalog = WorkCatalog::build(task, Some(&parent), &self.context)?;

        if post.paired {
            let mut parent_writer = self.store.new_integration_writer(&parent, tags)?;
            let mut writer = self.store.new_postintegration_writer(task, tags)?;
            let paired = PairedSetup {
                task: task.name.clone(),
                temp_dir: writer.temp_dir().to_path_buf(),
                log_dir: writer.log_dir().to_path_buf(),
            };
            let setup = task_setup(&parent.name, &parent_writer, Some(paired), tags);

            let outcome = {
                let mut aggregators = AggregatorSet {
                    integration: Some(Box::new(WriterAggregator(&mut parent_writer))),
                    postintegration: Some(Box::new(WriterAggregator(&mut writer))),
                    ..AggregatorSet::default()
                };
                self.run_task(&catalog, MasterMessage::NewIntegration(setup), &mut aggregators)?
            };

            finish_pair(&self.store, parent_writer, writer, &outcome)
        } else {
            let source = self.store.latest_content(&parent.name, tags)?;
            info!(
                parent = %parent.name,
                group = %source.name,
                "Reading parent content"
            );

            let mut writer = self.store.new_postintegration_writer(task, tags)?;
            let setup = task_setup(&task.name, &writer, None, tags);

            let outcome = {
                let mut aggregators = AggregatorSet {
                    postintegration: Some(Box::new(WriterAggregator(&mut writer))),
                    ..AggregatorSet::default()
                };
                self.run_task(
                    &catalog,
                    MasterMessage::NewPostintegration(setup),
                    &mut aggregators,
                )?
            };

            finish_writer(writer, &outcome)
        }
    }

    fn schedule_output(&mut self, task: &TaskRecord, tags: &[String]) -> Result<bool, MasterError> {
        let mut writer = self.store.new_output_writer(task, tags)?;
        let catalog = WorkCatalog::build(task, None, &self.context)?;
        let setup = task_setup(&task.name, &writer, None, tags);

        let outcome = {
            let mut aggregators = AggregatorSet {
                derived: Some(Box::new(WriterAggregator(&mut writer))),
                ..AggregatorSet::default()
            };
            self.run_task(&catalog, MasterMessage::NewDerivedContent(setup), &mut aggregators)?
        };

        finish_writer(writer, &outcome)
    }
}

fn task_setup<W: Writer>(
    task: &str,
    writer: &W,
    paired: Option<PairedSetup>,
    tags: &[String],
) -> TaskSetup {
    TaskSetup {
        task: task.to_owned(),
        temp_dir: writer.temp_dir().to_path_buf(),
        log_dir: writer.log_dir().to_path_buf(),
        paired,
        tags: tags.to_vec(),
    }
}

/// commit on success, otherwise let the writer roll back
fn finish_writer<W: Writer>(mut writer: W, outcome: &TaskOutcome) -> Result<bool, MasterError> {
    *writer.metadata_mut() = outcome.metadata.clone();

    if !outcome.success {
        warn!(
            task = writer.task(),
            failures = outcome.metadata.failures,
            "Task failed, discarding its output"
        );

        return Ok(false);
    }

    let group = writer.commit()?;
    info!(
        task = %group.task,
        group = %group.name,
        items = group.metadata.items,
        aggregated = outcome.aggregated,
        "Committed {} content",
        group.class
    );

    Ok(true)
}

/// commit a paired parent and child as one unit, or discard both
fn finish_pair<S: Store>(
    store: &S,
    mut parent: S::Writer,
    mut child: S::Writer,
    outcome: &TaskOutcome,
) -> Result<bool, MasterError> {
    *parent.metadata_mut() = outcome.metadata.clone();
    *child.metadata_mut() = outcome.metadata.clone();

    if !outcome.success {
        warn!(
            task = child.task(),
            parent = parent.task(),
            failures = outcome.metadata.failures,
            "Paired task failed, discarding both outputs"
        );

        return Ok(false);
    }

    for group in store.commit_together(vec![parent, child])? {
        info!(
            task = %group.task,
            group = %group.name,
            items = group.metadata.items,
            aggregated = outcome.aggregated,
            "Committed paired {} content",
            group.class
        );
    }

    Ok(true)
}
