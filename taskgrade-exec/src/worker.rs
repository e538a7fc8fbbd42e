//! The worker: a long-running agent that keeps a pipeline of requests pulled
//! from the server while respecting two budgets — the number of in-flight
//! `GetWork` requests and the core budget of the machine.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Error};
use crossbeam_channel::{bounded, Receiver, Sender};
use ductile::ChannelReceiver;

use taskgrade_store::FileStoreKey;

use crate::environment::Environment;
use crate::executor::WorkerExecutor;
use crate::proto::{
    ChannelFileIterator, FramedSender, Request, ServerWorkerMessage, WorkerMessage,
};

/// The budget state machine of a worker.
///
/// Invariants, restored by [`on_done`](Budget::on_done) after every change:
/// - `reserved + running ≤ num_cores`
/// - `pending ≤ max_pending`
/// - while there is spare budget (`pending + reserved + running < num_cores`)
///   one more request is asked to the server.
///
/// Tasks are admitted strictly in FIFO order: the head of the queue starts
/// as soon as it fits into `num_cores - running`.
pub(crate) struct Budget {
    /// Total core budget.
    num_cores: usize,
    /// Maximum number of unanswered `GetWork` requests.
    max_pending: usize,
    /// Cores promised to tasks that have not started yet.
    reserved: usize,
    /// Cores of the currently running tasks.
    running: usize,
    /// Unanswered `GetWork` requests.
    pending: usize,
    /// Admission queue: task size and the fulfiller that releases it.
    waiting: VecDeque<(usize, Sender<()>)>,
}

impl Budget {
    pub(crate) fn new(num_cores: usize, max_pending: usize) -> Budget {
        Budget {
            num_cores,
            max_pending,
            reserved: 0,
            running: 0,
            pending: 0,
            waiting: VecDeque::new(),
        }
    }

    /// Account a reply from the server: reserve `size` cores for the task
    /// and enqueue it. The returned receiver resolves when the task may
    /// start. Call [`on_done`](Budget::on_done) afterwards.
    pub(crate) fn schedule(&mut self, size: usize) -> Receiver<()> {
        let (tx, rx) = bounded(1);
        self.reserved += size;
        self.pending -= 1;
        self.waiting.push_back((size, tx));
        rx
    }

    /// Account a finished task. Call [`on_done`](Budget::on_done)
    /// afterwards.
    pub(crate) fn task_finished(&mut self, size: usize) {
        self.running -= size;
    }

    /// Account a pending request that will never be answered (server-side
    /// failure).
    pub(crate) fn cancel_pending(&mut self) {
        self.pending -= 1;
    }

    /// Restore the invariants: admit every queued task that fits, then
    /// return how many new `GetWork` requests to send to the server.
    pub(crate) fn on_done(&mut self) -> usize {
        while let Some((size, _)) = self.waiting.front() {
            if self.running + size > self.num_cores {
                break;
            }
            let (size, fulfiller) = self.waiting.pop_front().unwrap();
            self.running += size;
            self.reserved -= size;
            // the task may have been dropped, the budget is released by
            // its completion path anyway
            let _ = fulfiller.send(());
        }
        let mut new_requests = 0;
        while self.pending + self.reserved + self.running < self.num_cores
            && self.pending < self.max_pending
        {
            self.pending += 1;
            new_requests += 1;
        }
        new_requests
    }

    #[cfg(test)]
    fn state(&self) -> (usize, usize, usize) {
        (self.pending, self.reserved, self.running)
    }
}

/// Blobs some task thread is waiting for, with the fulfillers to wake them.
type FileWaiters = Arc<Mutex<HashMap<FileStoreKey, Vec<Sender<()>>>>>;

/// A worker connected to a server: pulls requests, runs them through the
/// [`WorkerExecutor`] under the budget, pushes results and blobs back.
pub struct Worker {
    /// The RPC surface doing the actual work.
    executor: Arc<WorkerExecutor>,
    /// Human readable name advertised to the server.
    name: String,
    /// Maximum number of unanswered `GetWork` requests.
    max_pending: usize,
    /// Sender towards the server, shared with the task threads.
    sender: Arc<FramedSender<WorkerMessage>>,
    /// Receiver of the server messages.
    receiver: ChannelReceiver<ServerWorkerMessage>,
}

impl Worker {
    /// Make a worker over a connected channel pair.
    pub fn new<S: Into<String>>(
        env: Arc<Environment>,
        name: S,
        max_pending: usize,
        sender: Arc<FramedSender<WorkerMessage>>,
        receiver: ChannelReceiver<ServerWorkerMessage>,
    ) -> Worker {
        Worker {
            executor: Arc::new(WorkerExecutor::new(env)),
            name: name.into(),
            max_pending,
            sender,
            receiver,
        }
    }

    /// Serve the connection until the server asks to exit or disconnects.
    pub fn run(self) -> Result<(), Error> {
        let env = self.executor.env().clone();
        info!(
            "Worker '{}' serving with {} cores, {} pending requests",
            self.name, env.num_cores, self.max_pending
        );
        self.sender
            .send(WorkerMessage::Hello {
                name: self.name.clone(),
            })
            .context("Cannot greet the server")?;
        let budget = Arc::new(Mutex::new(Budget::new(env.num_cores, self.max_pending)));
        let waiters: FileWaiters = Arc::new(Mutex::new(HashMap::new()));
        send_get_work(&self.sender, budget.lock().unwrap().on_done())?;

        loop {
            let message = match self.receiver.recv() {
                Ok(message) => message,
                Err(_) => {
                    info!("Server disconnected");
                    break;
                }
            };
            match message {
                ServerWorkerMessage::Work(request) => {
                    self.spawn_task(*request, &budget, &waiters)?;
                }
                ServerWorkerMessage::AskFiles(keys) => {
                    for key in keys {
                        let blob = env
                            .store
                            .get(&key)
                            .with_context(|| format!("Server asked unknown blob {}", key))?;
                        self.sender
                            .send_with_file(WorkerMessage::ProvideFile(key), blob.path())
                            .context("Cannot send blob to the server")?;
                    }
                }
                ServerWorkerMessage::ProvideFile(key) => {
                    let chunks = ChannelFileIterator::new(&self.receiver);
                    env.store
                        .store(&key, chunks)
                        .context("Cannot store blob from the server")?;
                    if let Some(waiting) = waiters.lock().unwrap().remove(&key) {
                        for fulfiller in waiting {
                            let _ = fulfiller.send(());
                        }
                    }
                }
                ServerWorkerMessage::Kill(request_id) => {
                    self.executor.cancel(request_id);
                }
                ServerWorkerMessage::Exit => {
                    info!("Server asked to exit");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Start the thread of one task: wait for admission, evaluate, report.
    fn spawn_task(
        &self,
        request: Request,
        budget: &Arc<Mutex<Budget>>,
        waiters: &FileWaiters,
    ) -> Result<(), Error> {
        let size = if request.exclusive {
            self.executor.env().num_cores
        } else {
            1
        };
        let admission = {
            let mut budget = budget.lock().unwrap();
            let admission = budget.schedule(size);
            send_get_work(&self.sender, budget.on_done())?;
            admission
        };
        let executor = self.executor.clone();
        let sender = self.sender.clone();
        let budget = budget.clone();
        let waiters = waiters.clone();
        std::thread::Builder::new()
            .name(format!("Task {}", request.id))
            .spawn(move || {
                if admission.recv().is_err() {
                    return;
                }
                let mut fetch = make_fetcher(&executor, &sender, &waiters);
                let response = executor.evaluate(&request, &mut fetch);
                if let Err(e) = sender.send(WorkerMessage::Done(Box::new(response))) {
                    warn!("Cannot report request {}: {:?}", request.id, e);
                }
                let mut budget = budget.lock().unwrap();
                budget.task_finished(size);
                if let Err(e) = send_get_work(&sender, budget.on_done()) {
                    warn!("Cannot ask for more work: {:?}", e);
                }
            })
            .context("Failed to spawn task thread")?;
        Ok(())
    }
}

/// The blob-pulling callback of a task thread: ask the server for the blob
/// and block until the connection loop has stored it.
fn make_fetcher<'a>(
    executor: &'a Arc<WorkerExecutor>,
    sender: &'a Arc<FramedSender<WorkerMessage>>,
    waiters: &'a FileWaiters,
) -> impl FnMut(&FileStoreKey) -> Result<(), Error> + 'a {
    move |key: &FileStoreKey| {
        let receiver = {
            let mut waiters = waiters.lock().unwrap();
            if executor.env().store.has_key(key) {
                return Ok(());
            }
            let (tx, rx) = bounded(1);
            let entry = waiters.entry(key.clone()).or_default();
            // only the first waiter asks the server
            let first = entry.is_empty();
            entry.push(tx);
            if first {
                sender
                    .send(WorkerMessage::RequestFile(key.clone()))
                    .context("Cannot request blob from the server")?;
            }
            rx
        };
        receiver
            .recv()
            .with_context(|| format!("Blob {} never arrived", key))?;
        Ok(())
    }
}

fn send_get_work(
    sender: &FramedSender<WorkerMessage>,
    count: usize,
) -> Result<(), Error> {
    for _ in 0..count {
        sender
            .send(WorkerMessage::GetWork)
            .context("Cannot ask the server for work")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_initial_requests_fill_both_budgets() {
        // num_cores bounds the pipeline before max_pending does
        let mut budget = Budget::new(2, 4);
        assert_eq!(budget.on_done(), 2);
        assert_eq!(budget.state(), (2, 0, 0));

        let mut budget = Budget::new(8, 3);
        assert_eq!(budget.on_done(), 3);
        assert_eq!(budget.state(), (3, 0, 0));
    }

    #[test]
    fn test_backpressure_two_cores() {
        // worker with num_cores=2, max_pending=4, fed single-core tasks: at
        // most 2 run concurrently, one more request per completion
        let mut budget = Budget::new(2, 4);
        assert_eq!(budget.on_done(), 2);

        // two replies arrive and start immediately
        let first = budget.schedule(1);
        assert_eq!(budget.on_done(), 0);
        assert!(first.try_recv().is_ok());
        assert_eq!(budget.state(), (1, 0, 1));
        let second = budget.schedule(1);
        assert_eq!(budget.on_done(), 0);
        assert!(second.try_recv().is_ok());
        assert_eq!(budget.state(), (0, 0, 2));

        // a completion frees a core: exactly one more request goes out
        budget.task_finished(1);
        assert_eq!(budget.on_done(), 1);
        assert_eq!(budget.state(), (1, 0, 1));

        // its reply starts immediately
        let third = budget.schedule(1);
        assert_eq!(budget.on_done(), 0);
        assert!(third.try_recv().is_ok());
        assert_eq!(budget.state(), (0, 0, 2));
    }

    #[test]
    fn test_admission_is_fifo() {
        let mut budget = Budget::new(2, 4);
        assert_eq!(budget.on_done(), 2);
        // an exclusive task starts on the idle machine
        let exclusive = budget.schedule(2);
        budget.on_done();
        assert!(exclusive.try_recv().is_ok());
        // a second reply queues behind it
        let queued = budget.schedule(1);
        budget.on_done();
        assert!(queued.try_recv().is_err());
        assert_eq!(budget.state(), (0, 1, 2));
        // the head of the queue is admitted as soon as it fits
        budget.task_finished(2);
        assert_eq!(budget.on_done(), 1);
        assert!(queued.try_recv().is_ok());
        assert_eq!(budget.state(), (1, 0, 1));
    }

    #[test]
    fn test_exclusive_task_waits_for_idle() {
        let mut budget = Budget::new(4, 8);
        assert_eq!(budget.on_done(), 4);
        // a small task is running
        let small = budget.schedule(1);
        budget.on_done();
        assert!(small.try_recv().is_ok());
        // the exclusive task waits until the machine is idle
        let exclusive = budget.schedule(4);
        budget.on_done();
        assert!(exclusive.try_recv().is_err());
        budget.task_finished(1);
        budget.on_done();
        assert!(exclusive.try_recv().is_ok());
        assert_eq!(budget.state(), (2, 0, 4));
        // the budget refills once the exclusive task ends
        budget.task_finished(4);
        assert_eq!(budget.on_done(), 2);
    }

    #[test]
    fn test_cancel_pending_frees_a_slot() {
        let mut budget = Budget::new(1, 1);
        assert_eq!(budget.on_done(), 1);
        assert_eq!(budget.state(), (1, 0, 0));
        budget.cancel_pending();
        assert_eq!(budget.on_done(), 1);
        assert_eq!(budget.state(), (1, 0, 0));
    }
}
