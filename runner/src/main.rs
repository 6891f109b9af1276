use clap::{Args, Parser, Subcommand};
use quadrature_runner::{
    backend::Backends,
    config::{ConfigErrors, RunnerConfig},
    jobs::JobQueue,
    journal::JournalError,
    master::MasterCoordinator,
    protocol::WorkerId,
    store::{Repository, StoreError},
    tasks::TaskRecord,
    transport::{
        process::ProcessPool, MasterLink, TransportError, TransportKind, WorkerInbox,
        WorkerOutbox,
    },
    worker::{self, WorkerCoordinator},
};
use std::{
    ffi::OsString,
    fs::File,
    path::{Path, PathBuf},
    process::ExitCode,
};
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Error, Debug)]
enum RunnerError {
    #[error("Invalid configuration")]
    Config(#[from] ConfigErrors),
    #[error("Repository unavailable")]
    Store(#[from] StoreError),
    #[error("Failed to start workers")]
    Transport(#[from] TransportError),
    #[error("Failed to write timeline")]
    Journal(#[from] JournalError),
    #[error("Cannot locate the runner executable")]
    CurrentExe(#[source] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "runner", version, about = "Schedules integration tasks over a pool of workers")]
struct Cli {
    /// debug output, RUST_LOG takes precedence
    #[arg(short, long, global = true)]
    verbose: bool,
    /// YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute jobs against a repository
    Run(RunArgs),
    /// Add task records from YAML files to a repository
    Import {
        repository: PathBuf,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Worker process speaking the protocol over stdio, spawned by `run`
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        id: u32,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    repository: PathBuf,
    /// only content carrying this tag is used, new content receives it (repeatable)
    #[arg(long = "tag")]
    tags: Vec<String>,
    /// capacity of each worker's derived data cache
    #[arg(long)]
    caches: Option<usize>,
    #[arg(long)]
    workers: Option<usize>,
    /// write the matched journal as YAML timeline
    #[arg(long)]
    gantt_chart: Option<PathBuf>,
    /// `task <name>` or `get <package|task|product|content> <name> <out-file>`, repeatable
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    jobs: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "info" }));
    // stdout belongs to the protocol in worker processes
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Command::Run(args) => run(args, cli.config.as_deref(), cli.verbose),
        Command::Import { repository, files } => import(&repository, &files),
        Command::Worker { id } => work(WorkerId(id), cli.config.as_deref()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(error = ?error, "{error}");

            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<RunnerConfig, ConfigErrors> {
    match path {
        Some(path) => RunnerConfig::load(path),
        None => Ok(RunnerConfig::default()),
    }
}

fn run(args: RunArgs, config_path: Option<&Path>, verbose: bool) -> Result<(), RunnerError> {
    let mut config = load_config(config_path)?;
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(caches) = args.caches {
        config.caches = caches;
    }
    if config.preflight_checks() {
        return Err(ConfigErrors::Preflight.into());
    }

    let repository = Repository::open(&args.repository)?;
    let (jobs, problems) = JobQueue::parse(args.jobs, &args.tags);
    if !problems.is_empty() {
        warn!("{} job argument(s) skipped", problems.len());
    }
    if jobs.is_empty() {
        warn!("Nothing to do");
    }

    let link = match config.transport {
        TransportKind::Local => {
            let backend = Backends::load(config.backend.as_ref());
            worker::local_pool(config.workers, config.devices.clone(), move || {
                backend.clone()
            })?
        }
        TransportKind::Process => {
            let program = std::env::current_exe().map_err(RunnerError::CurrentExe)?;
            let mut forwarded: Vec<OsString> = Vec::new();
            if let Some(path) = config_path {
                forwarded.push("--config".into());
                forwarded.push(path.as_os_str().to_owned());
            }
            if verbose {
                forwarded.push("--verbose".into());
            }

            MasterLink::Process(ProcessPool::spawn(config.workers, &program, &forwarded)?)
        }
    };

    let summary = MasterCoordinator::new(repository, link, &config).run(jobs);
    info!(
        completed = ?summary.completed,
        failed = ?summary.failed,
        skipped = ?summary.skipped,
        "Run finished"
    );

    if let Some(path) = args.gantt_chart.as_deref() {
        // an inconsistent journal only costs the timeline, never the run
        match summary.journal.timeline() {
            Ok(timeline) => {
                timeline.write_yaml(path)?;
                info!("Timeline written to {}", path.to_string_lossy());
            }
            Err(error) => error!(error = ?error, "Journal is inconsistent: {error}"),
        }
    }

    Ok(())
}

fn import(repository: &Path, files: &[PathBuf]) -> Result<(), RunnerError> {
    let repository = Repository::open(repository)?;

    for file in files {
        let task = File::open(file)
            .map_err(StoreError::IO)
            .and_then(|reader| Ok(serde_yaml::from_reader::<_, TaskRecord>(reader)?));

        match task.and_then(|task| repository.insert_task(&task).map(|_| task)) {
            Ok(task) => info!(kind = task.task.name(), "Imported task '{}'", task.name),
            Err(error) => error!(error = ?error, "Skipping {}: {error}", file.to_string_lossy()),
        }
    }

    Ok(())
}

fn work(id: WorkerId, config_path: Option<&Path>) -> Result<(), RunnerError> {
    let config = load_config(config_path)?;
    let coordinator = WorkerCoordinator::new(
        id,
        WorkerInbox::stdin(),
        WorkerOutbox::stdout(),
        Backends::load(config.backend.as_ref()),
        config.devices,
    );

    if let Err(error) = coordinator.run() {
        error!(error = ?error, worker = %id, "Worker stopped: {error}");
    }

    Ok(())
}
