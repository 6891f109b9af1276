pub mod local;
pub mod process;

use crate::protocol::{MasterMessage, WorkerId, WorkerMessage};
use parking_lot::FairMutex;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    io::{BufRead, BufReader, Lines, Stdout, Write},
    sync::{mpsc, Arc},
    time::Duration,
};
use thiserror::Error;
use tracing::{trace, warn};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Channel to {0} is closed")]
    Disconnected(String),
    #[error("Failed to encode message")]
    Encode(#[from] serde_json::Error),
    #[error("IO error on worker pipe")]
    IO(#[from] std::io::Error),
    #[error("Unknown {0}")]
    UnknownWorker(WorkerId),
    #[error("Failed to spawn {0}")]
    Spawn(WorkerId, #[source] std::io::Error),
}

/// How worker processes are realised
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// worker threads inside the master process
    #[default]
    Local,
    /// child processes speaking line delimited JSON over stdio
    Process,
}

/// Master side of the worker pool
#[derive(Debug)]
pub enum MasterLink {
    Local(local::LocalPool),
    Process(process::ProcessPool),
}

impl MasterLink {
    pub fn workers(&self) -> Vec<WorkerId> {
        match self {
            Self::Local(pool) => pool.workers(),
            Self::Process(pool) => pool.workers(),
        }
    }

    pub fn len(&self) -> usize {
        self.workers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn send(&mut self, worker: WorkerId, message: &MasterMessage) -> Result<(), TransportError> {
        trace!(worker = %worker, message = message.label(), "Sending");

        match self {
            Self::Local(pool) => pool.send(worker, message),
            Self::Process(pool) => pool.send(worker, message),
        }
    }

    /// send to every worker, returns the workers that could not be reached
    pub fn broadcast(&mut self, message: &MasterMessage) -> Vec<(WorkerId, TransportError)> {
        self.workers()
            .into_iter()
            .filter_map(|worker| self.send(worker, message).err().map(|error| (worker, error)))
            .collect()
    }

    /// next inbound message, if one is waiting
    pub fn try_recv(&mut self) -> Result<Option<(WorkerId, WorkerMessage)>, TransportError> {
        let inbox = match self {
            Self::Local(pool) => &pool.inbox,
            Self::Process(pool) => &pool.inbox,
        };

        match inbox.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(mpsc::TryRecvError::Empty) => Ok(None),
            Err(mpsc::TryRecvError::Disconnected) => {
                Err(TransportError::Disconnected("all workers".to_owned()))
            }
        }
    }

    /// bounded wait, used by the setup barrier only
    pub fn recv_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<(WorkerId, WorkerMessage)>, TransportError> {
        let inbox = match self {
            Self::Local(pool) => &pool.inbox,
            Self::Process(pool) => &pool.inbox,
        };

        match inbox.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(TransportError::Disconnected("all workers".to_owned()))
            }
        }
    }

    /// send TERMINATE to every worker and wait for them to go away
    pub fn shutdown(self) -> Result<(), TransportError> {
        match self {
            Self::Local(pool) => pool.shutdown(),
            Self::Process(pool) => pool.shutdown(),
        }
    }
}

/// Blocking receive side of a worker
pub enum WorkerInbox {
    Local(mpsc::Receiver<MasterMessage>),
    /// line-delimited JSON
    Pipe(Lines<Box<dyn BufRead + Send>>),
}

impl fmt::Debug for WorkerInbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(receiver) => f.debug_tuple("Local").field(receiver).finish(),
            Self::Pipe(_) => f.write_str("Pipe"),
        }
    }
}

impl WorkerInbox {
    pub fn stdin() -> Self {
        Self::reader(BufReader::new(std::io::stdin()))
    }

    pub fn reader<R: BufRead + Send + 'static>(reader: R) -> Self {
        let reader: Box<dyn BufRead + Send> = Box::new(reader);

        Self::Pipe(reader.lines())
    }

    pub fn recv(&mut self) -> Result<MasterMessage, TransportError> {
        match self {
            Self::Local(receiver) => receiver
                .recv()
                .map_err(|_| TransportError::Disconnected("master".to_owned())),
            Self::Pipe(lines) => loop {
                match lines.next() {
                    Some(Ok(line)) if line.trim().is_empty() => continue,
                    Some(Ok(line)) => match serde_json::from_str(&line) {
                        Ok(message) => return Ok(message),
                        Err(error) => {
                            warn!(error = ?error, "Discarding undecodable message from master: {error}")
                        }
                    },
                    Some(Err(error)) => return Err(TransportError::IO(error)),
                    None => return Err(TransportError::Disconnected("master".to_owned())),
                }
            },
        }
    }
}

/// Send side of a worker, cheap to clone so batchers can dispatch through it
#[derive(Debug, Clone)]
pub enum WorkerOutbox {
    Local {
        worker: WorkerId,
        sender: mpsc::Sender<(WorkerId, WorkerMessage)>,
    },
    Pipe(Arc<FairMutex<Stdout>>),
}

impl WorkerOutbox {
    pub fn stdout() -> Self {
        Self::Pipe(Arc::new(FairMutex::new(std::io::stdout())))
    }

    pub fn send(&self, message: WorkerMessage) -> Result<(), TransportError> {
        match self {
            Self::Local { worker, sender } => sender
                .send((*worker, message))
                .map_err(|_| TransportError::Disconnected("master".to_owned())),
            Self::Pipe(stdout) => {
                let line = serde_json::to_string(&message)?;
                let mut stdout = stdout.lock_arc();

                writeln!(stdout, "{line}")?;
                stdout.flush()?;

                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn undecodable_lines_are_skipped() {
        let terminate = serde_json::to_string(&MasterMessage::Terminate).unwrap();
        let input = format!("not json at all\n\n{{\"half\": \n{terminate}\n");
        let mut inbox = WorkerInbox::reader(Cursor::new(input.into_bytes()));

        assert!(matches!(inbox.recv(), Ok(MasterMessage::Terminate)));
        assert!(matches!(
            inbox.recv(),
            Err(TransportError::Disconnected(_))
        ));
    }

    #[test]
    fn closed_local_inbox_disconnects() {
        let (sender, receiver) = mpsc::channel();
        let mut inbox = WorkerInbox::Local(receiver);
        sender.send(MasterMessage::EndOfWork).unwrap();
        drop(sender);

        assert!(matches!(inbox.recv(), Ok(MasterMessage::EndOfWork)));
        assert!(matches!(
            inbox.recv(),
            Err(TransportError::Disconnected(_))
        ));
    }
}
