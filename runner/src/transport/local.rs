use super::{TransportError, WorkerInbox, WorkerOutbox};
use crate::protocol::{MasterMessage, WorkerId, WorkerMessage};
use std::{
    sync::mpsc,
    thread::{self, JoinHandle},
};
use tracing::{debug, error, info};

/// Worker pool made of threads inside the master process, one per worker
#[derive(Debug)]
pub struct LocalPool {
    senders: Vec<(WorkerId, mpsc::Sender<MasterMessage>)>,
    pub(super) inbox: mpsc::Receiver<(WorkerId, WorkerMessage)>,
    handles: Vec<(WorkerId, JoinHandle<()>)>,
}

impl LocalPool {
    /// spawn `workers` threads, each running `start` with its own inbox and outbox
    pub fn spawn<F>(workers: usize, start: F) -> Result<Self, TransportError>
    where
        F: Fn(WorkerId, WorkerInbox, WorkerOutbox) + Send + Sync + Clone + 'static,
    {
        let (outbound, inbox) = mpsc::channel();
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for index in 0..workers {
            let worker = WorkerId(index as u32);
            let (sender, receiver) = mpsc::channel();
            let outbox = WorkerOutbox::Local {
                worker,
                sender: outbound.clone(),
            };
            let start = start.clone();

            let handle = thread::Builder::new()
                .name(format!("worker-{index}"))
                .spawn(move || start(worker, WorkerInbox::Local(receiver), outbox))
                .map_err(|error| TransportError::Spawn(worker, error))?;

            debug!(worker = %worker, "Spawned worker thread");
            senders.push((worker, sender));
            handles.push((worker, handle));
        }

        info!("Started {workers} local workers");

        Ok(Self {
            senders,
            inbox,
            handles,
        })
    }

    pub fn workers(&self) -> Vec<WorkerId> {
        self.senders.iter().map(|(worker, _)| *worker).collect()
    }

    pub fn send(&self, worker: WorkerId, message: &MasterMessage) -> Result<(), TransportError> {
        match self.senders.iter().find(|(id, _)| *id == worker) {
            Some((_, sender)) => sender
                .send(message.clone())
                .map_err(|_| TransportError::Disconnected(worker.to_string())),
            None => Err(TransportError::UnknownWorker(worker)),
        }
    }

    pub fn shutdown(self) -> Result<(), TransportError> {
        for (worker, sender) in self.senders.iter() {
            // a worker that already went away is fine here
            if sender.send(MasterMessage::Terminate).is_err() {
                debug!(worker = %worker, "Worker gone before TERMINATE");
            }
        }
        drop(self.senders);

        for (worker, handle) in self.handles {
            if handle.join().is_err() {
                error!(worker = %worker, "Worker thread panicked");
            }
        }

        info!("All local workers stopped");

        Ok(())
    }
}
