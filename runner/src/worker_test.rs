use super::*;
use crate::{
    backend::{BackendError, DerivedProduct, ItemOutput},
    batcher::{container, FlushMode, ResultRecord},
    protocol::PairedSetup,
    store::Writer,
    tasks::{
        Configuration, IntegrationTask, OutputElement, OutputTask, PostintegrationTask, TaskKind,
    },
};
use std::{
    path::PathBuf,
    sync::mpsc,
    thread::{self, JoinHandle},
};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default)]
struct Scripted {
    fail_on: Option<u32>,
}

impl IntegrationBackend for Scripted {
    fn integrate(&mut self, context: &ItemContext) -> Result<ItemOutput, BackendError> {
        let serial = context.item.serial;
        if self.fail_on == Some(serial) {
            return Err(BackendError::Item {
                serial,
                reason: "diverged".to_owned(),
            });
        }

        Ok(ItemOutput {
            records: vec![ResultRecord::new(serial, 0, vec![1.0, 2.0])],
            background: vec![ResultRecord::new(serial, 0, vec![0.5])],
            paired: vec![ResultRecord::new(serial, 0, vec![3.0])],
            cache: CacheCounters { hits: 1, misses: 0 },
        })
    }

    fn derive(
        &mut self,
        context: &ItemContext,
        out_dir: &Path,
    ) -> Result<DerivedProduct, BackendError> {
        let product = match &context.item.payload {
            ItemPayload::Element(element) => element.product.clone(),
            ItemPayload::Configuration { .. } => "unexpected".to_owned(),
        };
        let path = out_dir.join(format!("{product}.dat"));
        std::fs::write(&path, "0 1 2")?;

        Ok(DerivedProduct {
            product,
            path,
            groups: vec!["grid".to_owned()],
            cache: CacheCounters::default(),
        })
    }
}

struct Harness {
    to_worker: mpsc::Sender<MasterMessage>,
    from_worker: mpsc::Receiver<(WorkerId, WorkerMessage)>,
    handle: JoinHandle<Result<(), WorkerError>>,
    dir: TempDir,
    repository: Repository,
}

impl Harness {
    fn new(backend: Scripted) -> Self {
        let dir = TempDir::new().unwrap();
        let repository = Repository::open(dir.path()).unwrap();
        let (to_worker, receiver) = mpsc::channel();
        let (sender, from_worker) = mpsc::channel();
        let worker = WorkerId(1);

        let handle = thread::spawn(move || {
            WorkerCoordinator::new(
                worker,
                WorkerInbox::Local(receiver),
                WorkerOutbox::Local { worker, sender },
                backend,
                vec!["cpu".to_owned()],
            )
            .run()
        });

        Self {
            to_worker,
            from_worker,
            handle,
            dir,
            repository,
        }
    }

    fn send(&self, message: MasterMessage) {
        self.to_worker.send(message).unwrap();
    }

    fn next(&self) -> WorkerMessage {
        let (worker, message) = self.from_worker.recv_timeout(WAIT).unwrap();
        assert_eq!(worker, WorkerId(1));

        message
    }

    fn initialise(&self, capacity: usize) {
        self.send(MasterMessage::InformationRequest {
            store: self.dir.path().to_path_buf(),
            limits: CapacityLimits {
                batcher_capacity: capacity,
                checkpoint: Duration::ZERO,
                flush: FlushMode::Immediate,
                caches: 2,
            },
        });

        match self.next() {
            WorkerMessage::InformationResponse(capabilities) => {
                assert_eq!(capabilities.caches, 2);
                assert_eq!(capabilities.devices, vec!["cpu".to_owned()]);
                assert!(!capabilities.hostname.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    fn setup(&self, task: &str) -> TaskSetup {
        TaskSetup {
            task: task.to_owned(),
            temp_dir: self.dir.path().join("temp").join(task),
            log_dir: self.dir.path().join("logs"),
            paired: None,
            tags: Vec::new(),
        }
    }

    fn terminate(self) {
        self.send(MasterMessage::Terminate);
        assert!(self.handle.join().unwrap().is_ok());
    }
}

fn twopf(name: &str, count: u32) -> TaskRecord {
    TaskRecord {
        name: name.to_owned(),
        task: TaskKind::Twopf(IntegrationTask {
            package: "quadratic".to_owned(),
            configurations: (0..count)
                .map(|serial| Configuration {
                    serial,
                    values: vec![serial as f64],
                    store_background: serial == 0,
                    store_prefix: false,
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

fn container_of(message: WorkerMessage) -> PathBuf {
    match message {
        WorkerMessage::IntegrationDataReady { container }
        | WorkerMessage::PostintegrationDataReady { container } => container,
        other => panic!("expected a data ready message, got {other:?}"),
    }
}

#[test]
pub fn failed_item_keeps_partial_progress() {
    let harness = Harness::new(Scripted { fail_on: Some(5) });
    harness.repository.insert_task(&twopf("grid", 10)).unwrap();
    harness.initialise(1 << 20);

    harness.send(MasterMessage::NewIntegration(harness.setup("grid")));
    harness.send(MasterMessage::NewWorkAssignment {
        items: (0..10).collect(),
    });

    assert!(matches!(
        harness.next(),
        WorkerMessage::NewWorkAcknowledgment { .. }
    ));
    match harness.next() {
        WorkerMessage::Fail { class, report } => {
            assert_eq!(class, TaskClass::Integration);
            assert_eq!(report.items, 5);
            assert_eq!(report.cache.hits, 5);
        }
        other => panic!("unexpected {other:?}"),
    }

    // the five completed items are still flushed on close
    harness.send(MasterMessage::EndOfWork);
    let container = container_of(harness.next());
    assert_eq!(container::count_rows(&container, "records").unwrap(), 5);
    assert_eq!(container::count_rows(&container, "background").unwrap(), 1);
    assert_eq!(harness.next(), WorkerMessage::WorkerCloseDown);

    harness.terminate();
}

#[test]
pub fn capacity_flushes_are_announced_before_the_report() {
    let harness = Harness::new(Scripted::default());
    harness.repository.insert_task(&twopf("grid", 6)).unwrap();
    // 48 bytes per record, the fourth one overflows
    harness.initialise(150);

    harness.send(MasterMessage::NewIntegration(harness.setup("grid")));
    harness.send(MasterMessage::NewWorkAssignment {
        items: vec![1, 2, 3, 4, 5],
    });

    assert!(matches!(
        harness.next(),
        WorkerMessage::NewWorkAcknowledgment { .. }
    ));
    let first = container_of(harness.next());
    assert!(first.starts_with(harness.dir.path().join("temp").join("grid")));
    match harness.next() {
        WorkerMessage::Finished { report, .. } => {
            assert_eq!(report.items, 5);
            assert_eq!(report.batcher.flushes, 1);
            assert!(report.min_item <= report.max_item);
        }
        other => panic!("unexpected {other:?}"),
    }

    harness.send(MasterMessage::EndOfWork);
    container_of(harness.next());
    assert_eq!(harness.next(), WorkerMessage::WorkerCloseDown);

    harness.terminate();
}

#[test]
pub fn broken_setup_fails_every_assignment() {
    let harness = Harness::new(Scripted::default());
    harness.initialise(1 << 20);

    harness.send(MasterMessage::NewIntegration(harness.setup("missing")));
    harness.send(MasterMessage::NewWorkAssignment { items: vec![0, 1] });

    assert!(matches!(
        harness.next(),
        WorkerMessage::NewWorkAcknowledgment { .. }
    ));
    match harness.next() {
        WorkerMessage::Fail { report, .. } => assert_eq!(report.items, 0),
        other => panic!("unexpected {other:?}"),
    }

    harness.send(MasterMessage::EndOfWork);
    assert_eq!(harness.next(), WorkerMessage::WorkerCloseDown);

    harness.terminate();
}

#[test]
pub fn unknown_serials_fail_the_assignment() {
    let harness = Harness::new(Scripted::default());
    harness.repository.insert_task(&twopf("grid", 3)).unwrap();
    harness.initialise(1 << 20);

    harness.send(MasterMessage::NewIntegration(harness.setup("grid")));
    harness.send(MasterMessage::NewWorkAssignment { items: vec![1, 42] });

    harness.next();
    assert!(matches!(harness.next(), WorkerMessage::Fail { .. }));

    harness.terminate();
}

#[test]
pub fn paired_integration_feeds_both_streams() {
    let harness = Harness::new(Scripted::default());
    harness.repository.insert_task(&twopf("grid", 4)).unwrap();
    harness
        .repository
        .insert_task(&zeta("zeta", "grid", true))
        .unwrap();
    harness.initialise(1 << 20);

    let mut setup = harness.setup("grid");
    setup.paired = Some(PairedSetup {
        task: "zeta".to_owned(),
        temp_dir: harness.dir.path().join("temp").join("zeta"),
        log_dir: harness.dir.path().join("logs"),
    });
    harness.send(MasterMessage::NewIntegration(setup));
    harness.send(MasterMessage::NewWorkAssignment {
        items: vec![0, 1, 2, 3],
    });
    harness.next();
    assert!(matches!(harness.next(), WorkerMessage::Finished { .. }));

    harness.send(MasterMessage::EndOfWork);
    match harness.next() {
        WorkerMessage::IntegrationDataReady { container } => {
            assert_eq!(container::count_rows(&container, "records").unwrap(), 4)
        }
        other => panic!("unexpected {other:?}"),
    }
    match harness.next() {
        WorkerMessage::PostintegrationDataReady { container } => {
            assert_eq!(container::count_rows(&container, "records").unwrap(), 4)
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(harness.next(), WorkerMessage::WorkerCloseDown);

    harness.terminate();
}

#[test]
pub fn postintegration_reads_committed_parent() {
    let harness = Harness::new(Scripted::default());
    let parent = twopf("grid", 3);
    harness.repository.insert_task(&parent).unwrap();
    harness
        .repository
        .insert_task(&zeta("zeta", "grid", false))
        .unwrap();
    harness
        .repository
        .new_integration_writer(&parent, &[])
        .unwrap()
        .commit()
        .unwrap();
    harness.initialise(1 << 20);

    harness.send(MasterMessage::NewPostintegration(harness.setup("zeta")));
    harness.send(MasterMessage::NewWorkAssignment {
        items: vec![0, 1, 2],
    });
    harness.next();
    match harness.next() {
        WorkerMessage::Finished { class, report } => {
            assert_eq!(class, TaskClass::Postintegration);
            assert_eq!(report.items, 3);
        }
        other => panic!("unexpected {other:?}"),
    }

    harness.send(MasterMessage::EndOfWork);
    assert!(matches!(
        harness.next(),
        WorkerMessage::PostintegrationDataReady { .. }
    ));
    assert_eq!(harness.next(), WorkerMessage::WorkerCloseDown);

    harness.terminate();
}

#[test]
pub fn derived_content_is_announced_per_element() {
    let harness = Harness::new(Scripted::default());
    harness
        .repository
        .insert_task(&TaskRecord {
            name: "plots".to_owned(),
            task: TaskKind::Output(OutputTask {
                elements: vec![
                    OutputElement {
                        product: "spectrum".to_owned(),
                        tags: Vec::new(),
                    },
                    OutputElement {
                        product: "bispectrum".to_owned(),
                        tags: Vec::new(),
                    },
                ],
            }),
        })
        .unwrap();
    harness.initialise(1 << 20);

    harness.send(MasterMessage::NewDerivedContent(harness.setup("plots")));
    harness.send(MasterMessage::NewWorkAssignment { items: vec![0, 1] });
    harness.next();

    for expected in ["spectrum", "bispectrum"] {
        match harness.next() {
            WorkerMessage::DerivedContentReady {
                product,
                path,
                groups,
            } => {
                assert_eq!(product, expected);
                assert!(path.is_file());
                assert_eq!(groups, vec!["grid".to_owned()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert!(matches!(harness.next(), WorkerMessage::Finished { .. }));

    harness.terminate();
}

#[test]
pub fn worker_stops_when_master_goes_away() {
    let harness = Harness::new(Scripted::default());
    let Harness {
        to_worker, handle, ..
    } = harness;

    drop(to_worker);

    assert!(handle.join().unwrap().is_ok());
}

#[test]
pub fn phases_follow_the_task_lifecycle() {
    let dir = TempDir::new().unwrap();
    let repository = Repository::open(dir.path()).unwrap();
    repository.insert_task(&twopf("grid", 4)).unwrap();
    let (_to_worker, receiver) = mpsc::channel();
    let (sender, from_worker) = mpsc::channel();
    let worker = WorkerId(3);

    let mut coordinator = WorkerCoordinator::new(
        worker,
        WorkerInbox::Local(receiver),
        WorkerOutbox::Local { worker, sender },
        Scripted::default(),
        vec!["cpu".to_owned()],
    );
    assert_eq!(coordinator.phase(), WorkerPhase::Idle);

    let limits = CapacityLimits {
        batcher_capacity: 1 << 20,
        checkpoint: Duration::ZERO,
        flush: FlushMode::Immediate,
        caches: 1,
    };
    coordinator.initialise(dir.path(), limits).unwrap();
    assert_eq!(coordinator.phase(), WorkerPhase::SetupAcknowledged);

    let setup = TaskSetup {
        task: "grid".to_owned(),
        temp_dir: dir.path().join("temp"),
        log_dir: dir.path().join("logs"),
        paired: None,
        tags: Vec::new(),
    };
    coordinator.begin_task(TaskClass::Integration, setup);
    assert_eq!(coordinator.phase(), WorkerPhase::AwaitingAssignment);

    coordinator.execute(&[0, 1, 2, 3]).unwrap();
    assert_eq!(coordinator.phase(), WorkerPhase::AwaitingAssignment);

    coordinator.close_down().unwrap();
    assert_eq!(coordinator.phase(), WorkerPhase::Idle);

    let labels = from_worker
        .try_iter()
        .map(|(_, message)| message.label())
        .collect::<Vec<_>>();
    assert_eq!(
        labels,
        vec![
            "INFORMATION_RESPONSE",
            "NEW_WORK_ACKNOWLEDGMENT",
            "FINISHED_INTEGRATION",
            "INTEGRATION_DATA_READY",
            "WORKER_CLOSE_DOWN",
        ]
    );
}
