use quadrature_runner::{
    backend::{BackendError, DerivedProduct, IntegrationBackend, ItemContext, ItemOutput},
    batcher::{container, FlushMode, ResultRecord},
    catalog::ItemPayload,
    config::{BatcherSection, RunnerConfig, SchedulerSection},
    jobs::JobQueue,
    journal::{Bar, EventKind, Lane},
    master::{MasterCoordinator, RunSummary},
    protocol::CacheCounters,
    store::{sqlite::OUTPUT_FILE, Repository, Store, StoreError},
    tasks::{
        Configuration, IntegrationTask, OutputElement, OutputTask, PostintegrationTask,
        TaskKind, TaskRecord,
    },
    worker,
};
use rusqlite::Connection;
use std::{collections::BTreeSet, path::Path, thread, time::Duration};
use tempfile::TempDir;

/// Answers every item with one record (and one paired row), optionally failing or stalling on a serial
#[derive(Debug, Clone, Default)]
struct Scripted {
    fail_on: Option<u32>,
    stall_on: Option<u32>,
}

const STALL: Duration = Duration::from_millis(80);
const IDLE_THRESHOLD_MS: u64 = 20;

impl IntegrationBackend for Scripted {
    fn integrate(&mut self, context: &ItemContext) -> Result<ItemOutput, BackendError> {
        let serial = context.item.serial;
        // enough work per item that every worker gets a share
        thread::sleep(Duration::from_millis(2));
        if self.stall_on == Some(serial) {
            thread::sleep(STALL);
        }

        if self.fail_on == Some(serial) {
            return Err(BackendError::Item {
                serial,
                reason: "step size underflow".to_owned(),
            });
        }

        Ok(ItemOutput {
            records: vec![ResultRecord::new(serial, 0, vec![serial as f64, 1.0])],
            background: vec![ResultRecord::new(serial, 0, vec![0.0])],
            paired: vec![ResultRecord::new(serial, 0, vec![-(serial as f64)])],
            cache: CacheCounters { hits: 0, misses: 1 },
        })
    }

    fn derive(
        &mut self,
        context: &ItemContext,
        out_dir: &Path,
    ) -> Result<DerivedProduct, BackendError> {
        let product = match &context.item.payload {
            ItemPayload::Element(element) => element.product.clone(),
            ItemPayload::Configuration { .. } => {
                return Err(BackendError::Item {
                    serial: context.item.serial,
                    reason: "not an output element".to_owned(),
                })
            }
        };
        let path = out_dir.join(format!("{product}.csv"));
        std::fs::write(&path, "k,value\n1,0.5\n")?;

        Ok(DerivedProduct {
            product,
            path,
            groups: vec!["grid".to_owned()],
            cache: CacheCounters { hits: 1, misses: 0 },
        })
    }
}

fn config(workers: usize) -> RunnerConfig {
    RunnerConfig {
        workers,
        batcher: BatcherSection {
            // small enough that every worker flushes a few containers
            capacity: 400,
            checkpoint: 0,
            flush: FlushMode::Immediate,
        },
        scheduler: SchedulerSection {
            idle_threshold_ms: IDLE_THRESHOLD_MS,
            setup_timeout_ms: 5_000,
            poll_interval_ms: 1,
            target_assignment_ms: 20,
            units_per_worker: 4,
        },
        ..RunnerConfig::default()
    }
}

fn integration(name: &str, count: u32) -> TaskRecord {
    TaskRecord {
        name: name.to_owned(),
        task: TaskKind::Twopf(IntegrationTask {
            package: "quadratic".to_owned(),
            configurations: (0..count)
                .map(|serial| Configuration {
                    serial,
                    values: vec![serial as f64 * 0.1],
                    store_background: serial == 0,
                    store_prefix: true,
                })
                .collect(),
        }),
    }
}

fn zeta(name: &str, parent: &str, paired: bool) -> TaskRecord {
    TaskRecord {
        name: name.to_owned(),
        task: TaskKind::ZetaTwopf(PostintegrationTask {
            parent: parent.to_owned(),
            paired,
        }),
    }
}

fn repository(tasks: &[TaskRecord]) -> (TempDir, Repository) {
    let dir = TempDir::new().unwrap();
    let repository = Repository::open(dir.path()).unwrap();
    for task in tasks {
        repository.insert_task(task).unwrap();
    }

    (dir, repository)
}

fn run(repository: &Repository, workers: usize, backend: Scripted, words: &[&str]) -> RunSummary {
    let config = config(workers);
    let link = worker::local_pool(workers, config.devices.clone(), move || backend.clone()).unwrap();
    let (jobs, errors) = JobQueue::parse(words.iter().copied(), &[]);
    assert!(errors.is_empty(), "{errors:?}");

    MasterCoordinator::new(repository.clone(), link, &config).run(jobs)
}

fn serials(output: &Path, table: &str) -> Vec<u32> {
    let connection = Connection::open(output).unwrap();
    let mut statement = connection
        .prepare(&format!("select serial from {table} order by serial"))
        .unwrap();
    let serials = statement
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<Vec<u32>, _>>()
        .unwrap();

    serials
}

#[test]
pub fn integration_covers_every_item_once() {
    let (_dir, repository) = repository(&[integration("grid", 40)]);

    let summary = run(&repository, 3, Scripted::default(), &["task", "grid"]);
    assert_eq!(summary.completed, vec!["grid"]);
    assert!(summary.failed.is_empty());

    let group = repository.latest_content("grid", &[]).unwrap();
    let output = group.path.join(OUTPUT_FILE);
    assert_eq!(serials(&output, "records"), (0..40).collect::<Vec<_>>());
    assert_eq!(serials(&output, "configurations"), (0..40).collect::<Vec<_>>());
    assert_eq!(serials(&output, "background"), vec![0]);

    assert_eq!(group.metadata.items, 40);
    assert_eq!(group.metadata.failures, 0);
    assert_eq!(group.metadata.cache.misses, 40);
    assert_eq!(
        group
            .metadata
            .workers
            .values()
            .map(|summary| summary.items)
            .sum::<u64>(),
        40
    );

    // every temporary container was aggregated and the scratch space is gone
    assert!(!group.path.join("temp").exists());

    let timeline = summary.journal.timeline().unwrap();
    assert_eq!(
        timeline
            .bars
            .iter()
            .filter(|bar| bar.kind == EventKind::Setup)
            .count(),
        1
    );
    assert!(timeline
        .milestones
        .iter()
        .any(|milestone| milestone.kind == EventKind::AggregationOccurred));
    assert_eq!(
        timeline
            .milestones
            .iter()
            .filter(|milestone| milestone.kind == EventKind::CloseDown)
            .count(),
        3
    );
}

#[test]
pub fn one_failed_item_discards_the_whole_task() {
    let (dir, repository) = repository(&[integration("grid", 30)]);

    let summary = run(
        &repository,
        3,
        Scripted {
            fail_on: Some(17),
            ..Scripted::default()
        },
        &["task", "grid"],
    );

    assert_eq!(summary.failed, vec!["grid"]);
    assert!(summary.completed.is_empty());
    assert!(matches!(
        repository.latest_content("grid", &[]),
        Err(StoreError::NoContent(_))
    ));
    // the rolled back writer leaves nothing pending
    assert_eq!(std::fs::read_dir(dir.path().join("pending")).unwrap().count(), 0);
    assert!(summary.journal.timeline().is_ok());
}

#[test]
pub fn paired_postintegration_commits_both_outputs() {
    let (_dir, repository) = repository(&[integration("grid", 24), zeta("zeta", "grid", true)]);

    let summary = run(&repository, 2, Scripted::default(), &["task", "zeta"]);
    assert_eq!(summary.completed, vec!["zeta"]);

    let parent = repository.latest_content("grid", &[]).unwrap();
    let child = repository.latest_content("zeta", &[]).unwrap();

    assert_eq!(
        serials(&parent.path.join(OUTPUT_FILE), "records"),
        (0..24).collect::<Vec<_>>()
    );
    assert_eq!(
        serials(&child.path.join(OUTPUT_FILE), "records"),
        (0..24).collect::<Vec<_>>()
    );
    assert_eq!(parent.metadata.items, child.metadata.items);
}

#[test]
pub fn postintegration_waits_for_parent_content() {
    let (_dir, repository) = repository(&[integration("grid", 12), zeta("zeta", "grid", false)]);

    // the first attempt has nothing to read, the second one follows the parent run
    let summary = run(
        &repository,
        2,
        Scripted::default(),
        &["task", "zeta", "task", "grid", "task", "zeta"],
    );

    assert_eq!(summary.skipped, vec!["zeta"]);
    assert_eq!(summary.completed, vec!["grid", "zeta"]);

    let child = repository.latest_content("zeta", &[]).unwrap();
    assert_eq!(
        serials(&child.path.join(OUTPUT_FILE), "records")
            .into_iter()
            .collect::<BTreeSet<_>>()
            .len(),
        12
    );
}

#[test]
pub fn output_task_takes_over_products() {
    let output = TaskRecord {
        name: "plots".to_owned(),
        task: TaskKind::Output(OutputTask {
            elements: ["spectrum", "bispectrum", "tilt"]
                .into_iter()
                .map(|product| OutputElement {
                    product: product.to_owned(),
                    tags: Vec::new(),
                })
                .collect(),
        }),
    };
    let (_dir, repository) = repository(&[output]);

    let summary = run(&repository, 2, Scripted::default(), &["task", "plots"]);
    assert_eq!(summary.completed, vec!["plots"]);

    let group = repository.latest_content("plots", &[]).unwrap();
    for product in ["spectrum", "bispectrum", "tilt"] {
        assert!(group.path.join("products").join(format!("{product}.csv")).is_file());
    }
    assert_eq!(
        container::count_rows(&group.path.join(OUTPUT_FILE), "products").unwrap(),
        3
    );
}

#[test]
pub fn missing_tasks_are_skipped_and_records_exported() {
    let (dir, repository) = repository(&[integration("grid", 6)]);
    let exported = dir.path().join("export").join("grid.yaml");

    let summary = run(
        &repository,
        1,
        Scripted::default(),
        &[
            "task",
            "nonexistent",
            "get",
            "task",
            "grid",
            exported.to_str().unwrap(),
            "task",
            "grid",
        ],
    );

    assert_eq!(summary.skipped, vec!["nonexistent"]);
    assert_eq!(summary.completed, vec!["grid", "grid"]);

    let body = std::fs::read_to_string(&exported).unwrap();
    let record: TaskRecord = serde_yaml::from_str(&body).unwrap();
    assert_eq!(record, integration("grid", 6));
}

#[test]
pub fn aggregation_waits_for_quiet() {
    let (_dir, repository) = repository(&[integration("grid", 40)]);

    let summary = run(
        &repository,
        1,
        Scripted {
            stall_on: Some(30),
            ..Scripted::default()
        },
        &["task", "grid"],
    );
    assert_eq!(summary.completed, vec!["grid"]);

    let timeline = summary.journal.timeline().unwrap();
    let master = |kind: EventKind| {
        timeline
            .bars
            .iter()
            .filter(move |bar| bar.lane == Lane::master() && bar.kind == kind)
            .collect::<Vec<&Bar>>()
    };
    let communication = master(EventKind::Communication);
    let last_message = communication.iter().map(|bar| bar.begin).max().unwrap();

    // everything after the last message belongs to the final drain
    let gated = master(EventKind::Aggregation)
        .into_iter()
        .filter(|bar| bar.begin < last_message)
        .collect::<Vec<_>>();
    assert!(!gated.is_empty(), "the stall should have let the master aggregate");

    let threshold = chrono::Duration::milliseconds(IDLE_THRESHOLD_MS as i64 - 2);
    for bar in gated {
        let quiet_since = communication
            .iter()
            .map(|message| message.end)
            .filter(|end| *end <= bar.begin)
            .max()
            .unwrap();
        assert!(
            bar.begin - quiet_since >= threshold,
            "aggregated {:?} after the last message",
            bar.begin - quiet_since
        );
    }
}
