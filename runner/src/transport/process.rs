use super::TransportError;
use crate::protocol::{MasterMessage, WorkerId, WorkerMessage};
use std::{
    ffi::OsString,
    io::{BufRead, BufReader, Write},
    path::Path,
    process::{Child, ChildStdin, Command, Stdio},
    sync::mpsc,
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, error, info, warn};
use wait_timeout::ChildExt;

const REAP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct WorkerProcess {
    worker: WorkerId,
    child: Child,
    stdin: Option<ChildStdin>,
    reader: Option<JoinHandle<()>>,
}

/// Worker pool made of child processes, `<program> worker --id N <args>`
#[derive(Debug)]
pub struct ProcessPool {
    processes: Vec<WorkerProcess>,
    pub(super) inbox: mpsc::Receiver<(WorkerId, WorkerMessage)>,
}

impl ProcessPool {
    pub fn spawn(workers: usize, program: &Path, args: &[OsString]) -> Result<Self, TransportError> {
        let (outbound, inbox) = mpsc::channel();
        let mut processes = Vec::with_capacity(workers);

        for index in 0..workers {
            let worker = WorkerId(index as u32);
            let mut child = Command::new(program)
                .arg("worker")
                .arg("--id")
                .arg(index.to_string())
                .args(args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .spawn()
                .map_err(|error| TransportError::Spawn(worker, error))?;

            let stdin = child.stdin.take();
            let reader = match child.stdout.take() {
                Some(stdout) => {
                    let outbound = outbound.clone();

                    // forward decoded lines so the master can poll a single channel
                    Some(
                        thread::Builder::new()
                            .name(format!("reader-{index}"))
                            .spawn(move || {
                                for line in BufReader::new(stdout).lines() {
                                    let line = match line {
                                        Ok(line) => line,
                                        Err(error) => {
                                            warn!(error = ?error, worker = %worker, "Worker pipe failed: {error}");
                                            break;
                                        }
                                    };

                                    if line.trim().is_empty() {
                                        continue;
                                    }

                                    match serde_json::from_str::<WorkerMessage>(&line) {
                                        Ok(message) => {
                                            if outbound.send((worker, message)).is_err() {
                                                break;
                                            }
                                        }
                                        Err(error) => {
                                            warn!(error = ?error, worker = %worker, "Discarding undecodable line: {error}")
                                        }
                                    }
                                }

                                debug!(worker = %worker, "Worker pipe closed");
                            })
                            .map_err(|error| TransportError::Spawn(worker, error))?,
                    )
                }
                None => None,
            };

            debug!(worker = %worker, pid = child.id(), "Spawned worker process");
            processes.push(WorkerProcess {
                worker,
                child,
                stdin,
                reader,
            });
        }

        info!("Started {workers} worker processes");

        Ok(Self { processes, inbox })
    }

    pub fn workers(&self) -> Vec<WorkerId> {
        self.processes.iter().map(|process| process.worker).collect()
    }

    pub fn send(&mut self, worker: WorkerId, message: &MasterMessage) -> Result<(), TransportError> {
        let process = self
            .processes
            .iter_mut()
            .find(|process| process.worker == worker)
            .ok_or(TransportError::UnknownWorker(worker))?;

        match process.stdin.as_mut() {
            Some(stdin) => {
                let line = serde_json::to_string(message)?;
                writeln!(stdin, "{line}")?;
                stdin.flush()?;

                Ok(())
            }
            None => Err(TransportError::Disconnected(worker.to_string())),
        }
    }

    pub fn shutdown(mut self) -> Result<(), TransportError> {
        for worker in self.workers() {
            if let Err(error) = self.send(worker, &MasterMessage::Terminate) {
                debug!(error = ?error, worker = %worker, "Failed to send TERMINATE: {error}");
            }
        }

        for mut process in self.processes.drain(..) {
            // closing stdin lets a worker that missed TERMINATE see end of input
            drop(process.stdin.take());

            match process.child.wait_timeout(REAP_TIMEOUT)? {
                Some(status) => debug!(worker = %process.worker, status = ?status, "Worker exited"),
                None => {
                    warn!(worker = %process.worker, "Worker did not exit, killing it");
                    process.child.kill()?;
                    process.child.wait()?;
                }
            }

            if let Some(reader) = process.reader.take() {
                if reader.join().is_err() {
                    error!(worker = %process.worker, "Reader thread panicked");
                }
            }
        }

        info!("All worker processes stopped");

        Ok(())
    }
}
