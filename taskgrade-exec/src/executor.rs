//! The worker-side RPC surface: evaluate requests through the local
//! executor, cancel in-flight requests, serve blobs by hash.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::environment::Environment;
use crate::local_executor::{execute_request, FetchFileFn, RunHandle};
use crate::proto::{Request, RequestId, Response};
use crate::ExecError;

/// Implements the three remote methods of a worker: `evaluate`,
/// `cancelRequest` and `requestFile` (the latter is answered straight from
/// the environment's store by the connection loop).
///
/// Tracks the [`RunHandle`] of every running request and the set of canceled
/// ids; both entries are cleared when the response is delivered.
pub struct WorkerExecutor {
    /// The execution context.
    env: Arc<Environment>,
    /// Live runs, by request id.
    running: Mutex<HashMap<RequestId, RunHandle>>,
    /// Requests canceled before or during their execution.
    canceled: Mutex<HashSet<RequestId>>,
}

impl WorkerExecutor {
    /// Make an executor over the given environment.
    pub fn new(env: Arc<Environment>) -> WorkerExecutor {
        WorkerExecutor {
            env,
            running: Mutex::new(HashMap::new()),
            canceled: Mutex::new(HashSet::new()),
        }
    }

    /// The execution context.
    pub fn env(&self) -> &Arc<Environment> {
        &self.env
    }

    /// Run a request end to end, translating executor failures into an
    /// `InternalError` response. Best-effort cancellation: a request
    /// canceled before this call is not executed at all.
    pub fn evaluate(&self, request: &Request, fetch_file: &mut FetchFileFn) -> Response {
        if self.canceled.lock().unwrap().remove(&request.id) {
            debug!("Request {} was canceled before starting", request.id);
            let mut response = Response::internal_error(request.id, "Canceled");
            response.was_killed = true;
            return response;
        }
        let handle = RunHandle::default();
        self.running
            .lock()
            .unwrap()
            .insert(request.id, handle.clone());
        let result = execute_request(&self.env, request, fetch_file, &handle);
        self.running.lock().unwrap().remove(&request.id);
        let killed = self.canceled.lock().unwrap().remove(&request.id);
        let mut response = match result {
            Ok(response) => response,
            Err(e) => match e.downcast_ref::<ExecError>() {
                Some(ExecError::Busy) => Response::internal_error(request.id, "Worker busy"),
                _ => {
                    warn!("Request {} failed: {:?}", request.id, e);
                    Response::internal_error(request.id, format!("{:#}", e))
                }
            },
        };
        response.was_killed = response.was_killed || killed;
        response
    }

    /// Mark a request as canceled and ask its sandbox, if live, to
    /// terminate.
    pub fn cancel(&self, request_id: RequestId) {
        self.canceled.lock().unwrap().insert(request_id);
        let handle = self.running.lock().unwrap().get(&request_id).cloned();
        let handle = match handle {
            Some(handle) => handle,
            None => return,
        };
        handle.cancelled.store(true, Ordering::SeqCst);
        // the sandbox may not have spawned the process yet: wait a bit for
        // the PID to be published before giving up
        let mut pid = 0;
        for _ in 0..5 {
            pid = handle.pid.load(Ordering::SeqCst);
            if pid != 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(200));
        }
        if pid == 0 {
            warn!("Cannot kill request {}: PID unknown", request_id);
            return;
        }
        info!("Killing request {} (pid {})", request_id, pid);
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            warn!("Cannot kill pid {}: {:?}", pid, e);
        }
    }

    /// Whether the request is currently running.
    pub fn is_running(&self, request_id: RequestId) -> bool {
        self.running.lock().unwrap().contains_key(&request_id)
    }
}
