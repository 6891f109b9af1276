use super::{BackendError, DerivedProduct, IntegrationBackend, ItemContext, ItemOutput};
use crate::config::BackendConfig;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs::OpenOptions,
    io::{Read, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
    time::Duration,
};
use tracing::{debug, error, warn};
use tracing_unwrap::OptionExt;
use wait_timeout::ChildExt;

/// Runs an external executable once per item
///
/// The executable is called as `<exec> <params..> <mode> <task>` with the item context as YAML
/// on stdin and has to answer with YAML on stdout. Anything it writes to stderr ends up in
/// `backend.log` inside the task's log directory.
#[derive(Debug, Clone)]
pub struct ExecBackend {
    pub exec: PathBuf,
    pub params: Vec<String>,
    pub timeout: Duration,
}

#[derive(Serialize)]
struct DeriveRequest<'a> {
    #[serde(flatten)]
    context: &'a ItemContext<'a>,
    out_dir: &'a Path,
}

impl ExecBackend {
    pub fn load(config: &BackendConfig) -> Self {
        Self {
            exec: config.exec.clone(),
            params: config.params.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, input, log_dir))]
    fn run<I: Serialize, O: DeserializeOwned>(
        &self,
        mode: &str,
        task: &str,
        input: &I,
        log_dir: &Path,
    ) -> Result<O, BackendError> {
        let input = serde_yaml::to_string(input)?;

        let mut handle = Command::new(&self.exec)
            .args(self.params.iter())
            .arg(mode)
            .arg(task)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(BackendError::Spawn)?;

        // drain both pipes on their own threads, a chatty backend must not block on a full pipe
        let stdout = handle.stdout.take().map(|mut stdout| {
            thread::spawn(move || {
                let mut buffer = String::new();
                stdout.read_to_string(&mut buffer).map(|_| buffer)
            })
        });
        let stderr = handle.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut buffer = String::new();
                stderr.read_to_string(&mut buffer).map(|_| buffer)
            })
        });

        let mut stdin = handle.stdin.take().unwrap_or_log();
        stdin.write_all(input.as_bytes())?;
        // dropping stdin closes the pipe, the backend sees a clear end of input
        drop(stdin);

        debug!("Backend waiting on {}", handle.id());
        let status = match handle.wait_timeout(self.timeout)? {
            Some(status) => status,
            None => {
                warn!(timeout = ?self.timeout, "Backend ran into timeout, killing it");
                handle.kill()?;
                handle.wait()?;

                return Err(BackendError::Timeout);
            }
        };

        let output = join_pipe(stdout)?;
        let diagnostics = join_pipe(stderr)?;

        if !diagnostics.is_empty() {
            if let Err(error) = append_log(log_dir, &diagnostics) {
                warn!(error = ?error, "Failed to write backend log: {error}");
            }
        }

        if !status.success() {
            return Err(BackendError::Failed {
                status: status.code().unwrap_or(-1),
                stderr: diagnostics.trim().to_owned(),
            });
        }

        match serde_yaml::from_str::<O>(&output) {
            Ok(result) => Ok(result),
            Err(error) => {
                error!("Backend output could not be read: {error}");

                Err(error.into())
            }
        }
    }
}

impl IntegrationBackend for ExecBackend {
    fn integrate(&mut self, context: &ItemContext) -> Result<ItemOutput, BackendError> {
        let mode = match context.task.class() {
            crate::protocol::TaskClass::Postintegration => "postintegrate",
            _ => "integrate",
        };

        self.run(mode, &context.task.name, context, context.log_dir)
    }

    fn derive(
        &mut self,
        context: &ItemContext,
        out_dir: &Path,
    ) -> Result<DerivedProduct, BackendError> {
        let request = DeriveRequest { context, out_dir };

        self.run("derive", &context.task.name, &request, context.log_dir)
    }
}

fn join_pipe(
    handle: Option<thread::JoinHandle<std::io::Result<String>>>,
) -> Result<String, BackendError> {
    match handle {
        Some(handle) => match handle.join() {
            Ok(result) => Ok(result?),
            Err(_) => Err(BackendError::Child(std::io::Error::new(
                std::io::ErrorKind::Other,
                "pipe reader panicked",
            ))),
        },
        None => Ok(String::new()),
    }
}

fn append_log(log_dir: &Path, diagnostics: &str) -> std::io::Result<()> {
    std::fs::create_dir_all(log_dir)?;
    let mut log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("backend.log"))?;

    writeln!(log, "{diagnostics}")
}
