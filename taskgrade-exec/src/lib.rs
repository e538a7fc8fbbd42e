//! Execution of a graph of sandboxed commands, locally or across machines.
//!
//! The components mirror the three actors of the protocol:
//!
//! - [`evaluate_graph`] is the *client* (manager) side: it validates the
//!   graph, seeds the provided files, consults the response cache and drives
//!   the ready executions through a server connection, threading content
//!   hashes through the files as responses arrive.
//! - [`Server`] is the broker: it pairs submitted requests with free
//!   workers through the [`Dispatcher`], collecting the blobs each side is
//!   missing via the chunked file-transfer protocol of
//!   [`proto`].
//! - [`Worker`] pulls requests, keeping its pipeline full while respecting
//!   the core budget and the pending-request budget, and evaluates each one
//!   through the [`WorkerExecutor`] and the local executor, inside the
//!   sandbox backend selected from the [`sandbox::SandboxRegistry`].
//!
//! Every blob is content-addressed in a [`FileStore`](taskgrade_store::FileStore);
//! identical files are transferred and stored once, and the results of
//! identical requests are served from the
//! [`Cache`](taskgrade_cache::Cache) without touching a sandbox.
//!
//! In local evaluations ([`eval_graph_locally`]) the three actors run in one
//! process over in-memory channels; distributed setups use the same code
//! over TCP channels.

#![deny(missing_docs)]

#[macro_use]
extern crate log;

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context, Error};
use ductile::new_local_channel;

use taskgrade_cache::Cache;
use taskgrade_dag::{ExecutionGraph, ExecutionId, ExecutionResult};
use taskgrade_store::FileStore;

pub use check_dag::{check_graph, GraphError};
pub use client::evaluate_graph;
pub use dispatcher::{Assignment, Dispatcher, WorkerId};
pub use environment::{Environment, ThreadGuard};
pub use executor::WorkerExecutor;
pub use local_executor::{execute_request, FetchFileFn, RunHandle};
pub use server::Server;
pub use worker::Worker;

// the channel crate is part of the public API of this crate
pub use ductile;

mod check_dag;
mod client;
mod detect_exe;
mod dispatcher;
mod environment;
mod executor;
mod local_executor;
pub mod proto;
pub mod sandbox;
mod server;
mod worker;

use proto::{ClientMessage, FramedSender, ServerClientMessage, ServerWorkerMessage, WorkerMessage};

/// Errors a caller of the executor must branch on.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// Admission was refused: every core is busy or an exclusive job owns
    /// the machine. Retry on a different worker.
    #[error("the worker is busy")]
    Busy,
}

/// Connect to the client port of a server.
pub fn connect_to_server(
    addr: &str,
) -> Result<
    (
        ductile::ChannelSender<ClientMessage>,
        ductile::ChannelReceiver<ServerClientMessage>,
    ),
    Error,
> {
    ductile::connect_channel(addr)
        .map_err(|e| anyhow!("Failed to connect to the server at {}: {:?}", addr, e))
}

/// Connect to the worker port of a server.
pub fn connect_to_server_as_worker(
    addr: &str,
) -> Result<
    (
        ductile::ChannelSender<WorkerMessage>,
        ductile::ChannelReceiver<ServerWorkerMessage>,
    ),
    Error,
> {
    ductile::connect_channel(addr)
        .map_err(|e| anyhow!("Failed to connect to the server at {}: {:?}", addr, e))
}

/// Evaluate a graph spawning a server and one worker inside this process,
/// talking over in-memory channels.
///
/// The client, the server and the worker each use the store they are given;
/// passing distinct stores exercises the full blob-transfer protocol, while
/// sharing one store mimics the usual single-machine setup.
pub fn eval_graph_locally(
    graph: ExecutionGraph,
    client_store: Arc<FileStore>,
    server_store: Arc<FileStore>,
    worker_env: Arc<Environment>,
    cache: &mut Cache,
    max_pending: usize,
    executor_id: &str,
) -> Result<HashMap<ExecutionId, ExecutionResult>, Error> {
    let server = Server::new(server_store);

    let (client_tx, from_client) = new_local_channel::<ClientMessage>();
    let (to_client, client_rx) = new_local_channel::<ServerClientMessage>();
    let client_conn = server.connect_client(to_client, from_client);

    let (worker_tx, from_worker) = new_local_channel::<WorkerMessage>();
    let (to_worker, worker_rx) = new_local_channel::<ServerWorkerMessage>();
    let worker_conn = server.connect_worker(to_worker, from_worker);

    let worker = Worker::new(
        worker_env,
        "local worker",
        max_pending,
        Arc::new(FramedSender::new(worker_tx)),
        worker_rx,
    );
    let worker_thread = thread::Builder::new()
        .name("Local worker".into())
        .spawn(move || worker.run())
        .context("Failed to spawn the local worker")?;
    // the shutdown below reaches the worker only once it is registered
    while server.connected_workers() == 0 {
        thread::sleep(std::time::Duration::from_millis(5));
    }

    let sender = FramedSender::new(client_tx);
    let result = evaluate_graph(graph, &sender, &client_rx, &client_store, cache, executor_id);

    server.stop();
    drop(sender);
    drop(client_rx);
    if let Err(e) = worker_thread.join().expect("The local worker panicked") {
        warn!("The local worker failed: {:?}", e);
    }
    client_conn.join().ok();
    worker_conn.join().ok();
    result
}
