//! The server-side broker pairing client requests with free evaluator
//! workers.

use std::collections::VecDeque;
use std::sync::Mutex;

use crossbeam_channel::Sender;
use uuid::Uuid;

use crate::proto::{Request, RequestId, Response};

/// The identity of a worker connection.
pub type WorkerId = Uuid;

/// A request handed to a worker: the request itself and the fulfiller its
/// response must be piped into, so the result streams back to the
/// originating client without an intermediate step.
#[derive(Debug)]
pub struct Assignment {
    /// The request to evaluate.
    pub request: Request,
    /// Where the response must be delivered.
    pub respond: Sender<Response>,
}

/// A worker slot waiting for work.
#[derive(Debug)]
struct FreeEvaluator {
    /// The worker owning the slot.
    worker: WorkerId,
    /// Fulfiller that fires when the slot is assigned work.
    assign: Sender<Assignment>,
}

/// A request waiting for a worker slot.
#[derive(Debug)]
struct PendingRequest {
    /// The request to evaluate.
    request: Request,
    /// Where the response must be delivered.
    respond: Sender<Response>,
}

/// The two queues of the broker. At any quiescent moment at most one of
/// them is non-empty: an arrival on one side is matched immediately when the
/// other side has someone waiting.
#[derive(Debug, Default)]
struct DispatcherQueues {
    /// Worker slots waiting for work, FIFO by arrival.
    evaluators: VecDeque<FreeEvaluator>,
    /// Requests waiting for a slot, FIFO by arrival.
    requests: VecDeque<PendingRequest>,
}

/// Pairs evaluators advertising availability with submitted requests,
/// FIFO on both sides, with no starvation for either.
#[derive(Debug, Default)]
pub struct Dispatcher {
    /// The queues, behind one lock.
    queues: Mutex<DispatcherQueues>,
}

impl Dispatcher {
    /// Make a broker with empty queues.
    pub fn new() -> Dispatcher {
        Dispatcher::default()
    }

    /// A worker slot became available: serve the oldest pending request, or
    /// queue the slot.
    pub fn add_evaluator(&self, worker: WorkerId, assign: Sender<Assignment>) {
        let mut queues = self.queues.lock().unwrap();
        if let Some(PendingRequest { request, respond }) = queues.requests.pop_front() {
            trace!("Evaluator of {} gets request {}", worker, request.id);
            // a dead worker connection drops its receiver: put the request
            // back for somebody else
            if let Err(e) = assign.send(Assignment { request, respond }) {
                let assignment = e.into_inner();
                queues.requests.push_front(PendingRequest {
                    request: assignment.request,
                    respond: assignment.respond,
                });
            }
        } else {
            queues.evaluators.push_back(FreeEvaluator { worker, assign });
        }
    }

    /// A request arrived: hand it to the oldest free slot, or queue it.
    pub fn add_request(&self, request: Request, respond: Sender<Response>) {
        let mut queues = self.queues.lock().unwrap();
        let mut pending = PendingRequest { request, respond };
        while let Some(FreeEvaluator { worker, assign }) = queues.evaluators.pop_front() {
            trace!("Request {} goes to evaluator of {}", pending.request.id, worker);
            match assign.send(Assignment {
                request: pending.request,
                respond: pending.respond,
            }) {
                Ok(()) => return,
                // that worker is gone, try the next slot
                Err(e) => {
                    let assignment = e.into_inner();
                    pending = PendingRequest {
                        request: assignment.request,
                        respond: assignment.respond,
                    };
                }
            }
        }
        queues.requests.push_back(pending);
    }

    /// Drop every queued slot of a disconnected worker.
    pub fn remove_evaluator(&self, worker: WorkerId) {
        let mut queues = self.queues.lock().unwrap();
        queues.evaluators.retain(|evaluator| evaluator.worker != worker);
    }

    /// Remove a not-yet-assigned request, returning its response fulfiller
    /// so the caller can report the cancellation. Returns `None` if the
    /// request was already assigned (or never queued).
    pub fn cancel_request(&self, request_id: RequestId) -> Option<Sender<Response>> {
        let mut queues = self.queues.lock().unwrap();
        let position = queues
            .requests
            .iter()
            .position(|pending| pending.request.id == request_id)?;
        queues.requests.remove(position).map(|pending| pending.respond)
    }

    /// Number of queued free slots and queued requests.
    pub fn queue_sizes(&self) -> (usize, usize) {
        let queues = self.queues.lock().unwrap();
        (queues.evaluators.len(), queues.requests.len())
    }
}
