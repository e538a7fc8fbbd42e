//! The server: accepts client and worker connections, materializes the blobs
//! each side is missing, and brokers requests through the [`Dispatcher`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{Context, Error};
use crossbeam_channel::{unbounded, Sender};
use ductile::{ChannelReceiver, ChannelSender};
use uuid::Uuid;

use taskgrade_store::{FileStore, FileStoreKey};

use crate::dispatcher::{Dispatcher, WorkerId};
use crate::proto::{
    ChannelFileIterator, ClientMessage, FramedSender, Request, Response, ServerClientMessage,
    ServerWorkerMessage, Status, WorkerMessage,
};

/// `ductile::ChannelServer` is generic over the message types it carries and
/// only stores them as `PhantomData<*const _>`, but the crate does not mark
/// it `Send`. Wrap it so it can be moved into the listener threads below.
struct SendServer<S, R>(ductile::ChannelServer<S, R>);

unsafe impl<S, R> Send for SendServer<S, R> {}

/// The broker between clients submitting requests and workers evaluating
/// them. Owns the server-side blob store and the pairing queues.
pub struct Server {
    /// The server-side blob store.
    store: Arc<FileStore>,
    /// The pairing queues.
    dispatcher: Dispatcher,
    /// The senders of the connected workers, for `Kill` and `Exit`.
    workers: Mutex<HashMap<WorkerId, Arc<FramedSender<ServerWorkerMessage>>>>,
    /// Which worker is running each request.
    running: Mutex<HashMap<u64, WorkerId>>,
    /// Server-wide unique request ids: client ids may collide across
    /// connections.
    next_request_id: AtomicU64,
}

impl Server {
    /// Make a server over its blob store.
    pub fn new(store: Arc<FileStore>) -> Arc<Server> {
        Arc::new(Server {
            store,
            dispatcher: Dispatcher::new(),
            workers: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
        })
    }

    /// Ask every connected worker to exit once idle.
    pub fn stop(&self) {
        for sender in self.workers.lock().unwrap().values() {
            let _ = sender.send(ServerWorkerMessage::Exit);
        }
    }

    /// Number of workers currently attached.
    pub fn connected_workers(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    /// Serve a client connection on its own thread.
    pub fn connect_client(
        self: &Arc<Self>,
        sender: ChannelSender<ServerClientMessage>,
        receiver: ChannelReceiver<ClientMessage>,
    ) -> JoinHandle<()> {
        let server = self.clone();
        std::thread::Builder::new()
            .name("Client connection".into())
            .spawn(move || {
                if let Err(e) = client_connection(server, sender, receiver) {
                    warn!("Client connection failed: {:?}", e);
                }
            })
            .expect("Failed to spawn client connection thread")
    }

    /// Serve a worker connection on its own thread.
    pub fn connect_worker(
        self: &Arc<Self>,
        sender: ChannelSender<ServerWorkerMessage>,
        receiver: ChannelReceiver<WorkerMessage>,
    ) -> JoinHandle<()> {
        let server = self.clone();
        std::thread::Builder::new()
            .name("Worker connection".into())
            .spawn(move || {
                if let Err(e) = worker_connection(server, sender, receiver) {
                    warn!("Worker connection failed: {:?}", e);
                }
            })
            .expect("Failed to spawn worker connection thread")
    }

    /// Bind the two listening sockets and serve incoming connections
    /// forever.
    pub fn serve(self: Arc<Self>, client_addr: &str, worker_addr: &str) -> Result<(), Error> {
        let client_server = SendServer(
            ductile::ChannelServer::bind(client_addr)
                .with_context(|| format!("Failed to bind client address {}", client_addr))?,
        );
        let worker_server = SendServer(
            ductile::ChannelServer::bind(worker_addr)
                .with_context(|| format!("Failed to bind worker address {}", worker_addr))?,
        );
        info!(
            "Accepting clients on tcp://{} and workers on tcp://{}",
            client_addr, worker_addr
        );
        let server = self.clone();
        let client_thread = std::thread::Builder::new()
            .name("Client listener".into())
            .spawn(move || {
                let client_server = client_server;
                for (sender, receiver, addr) in client_server.0 {
                    info!("Client connected from {:?}", addr);
                    server.connect_client(sender, receiver);
                }
            })
            .context("Cannot spawn client listener")?;
        let worker_thread = std::thread::Builder::new()
            .name("Worker listener".into())
            .spawn(move || {
                let worker_server = worker_server;
                for (sender, receiver, addr) in worker_server.0 {
                    info!("Worker connected from {:?}", addr);
                    self.connect_worker(sender, receiver);
                }
            })
            .context("Cannot spawn worker listener")?;
        client_thread.join().ok();
        worker_thread.join().ok();
        Ok(())
    }
}

/// Per-connection state of a client: requests whose inputs the server is
/// still collecting, and the id translation between the client's ids and
/// the server-wide ones.
struct ClientConnection {
    server: Arc<Server>,
    sender: Arc<FramedSender<ServerClientMessage>>,
    /// Requests waiting for input blobs, by server id, with the number of
    /// blobs still missing.
    pending: HashMap<u64, (Request, usize)>,
    /// Server ids waiting for each input blob.
    waiting_inputs: HashMap<FileStoreKey, Vec<u64>>,
    /// server id → client id, consumed when the response is delivered.
    id_map: Arc<Mutex<HashMap<u64, u64>>>,
    /// client id → server id, for cancellation.
    reverse_ids: HashMap<u64, u64>,
    /// Where the workers deliver the responses of this client.
    respond: Sender<Response>,
}

fn client_connection(
    server: Arc<Server>,
    sender: ChannelSender<ServerClientMessage>,
    receiver: ChannelReceiver<ClientMessage>,
) -> Result<(), Error> {
    let sender = Arc::new(FramedSender::new(sender));
    let (respond, responses) = unbounded::<Response>();
    let id_map: Arc<Mutex<HashMap<u64, u64>>> = Arc::new(Mutex::new(HashMap::new()));

    // pump the responses back to the client, translating the ids
    let forwarder = {
        let sender = sender.clone();
        let id_map = id_map.clone();
        std::thread::Builder::new()
            .name("Response forwarder".into())
            .spawn(move || {
                for mut response in responses {
                    let client_id = id_map.lock().unwrap().remove(&response.request_id);
                    match client_id {
                        Some(client_id) => response.request_id = client_id,
                        None => continue, // canceled and already answered
                    }
                    if sender
                        .send(ServerClientMessage::Response(Box::new(response)))
                        .is_err()
                    {
                        break;
                    }
                }
            })
            .context("Cannot spawn response forwarder")?
    };

    let mut connection = ClientConnection {
        server,
        sender,
        pending: HashMap::new(),
        waiting_inputs: HashMap::new(),
        id_map,
        reverse_ids: HashMap::new(),
        respond,
    };
    loop {
        let message = match receiver.recv() {
            Ok(message) => message,
            Err(_) => {
                debug!("Client disconnected");
                break;
            }
        };
        match message {
            ClientMessage::Evaluate(request) => connection.evaluate(*request)?,
            ClientMessage::ProvideFile(key) => {
                let chunks = ChannelFileIterator::new(&receiver);
                connection
                    .server
                    .store
                    .store(&key, chunks)
                    .context("Cannot store blob from the client")?;
                connection.input_ready(&key);
            }
            ClientMessage::RequestFile(key) => {
                let blob = connection.server.store.get(&key);
                match blob {
                    Some(blob) => connection
                        .sender
                        .send_with_file(ServerClientMessage::ProvideFile(key), blob.path())
                        .context("Cannot send blob to the client")?,
                    None => connection
                        .sender
                        .send(ServerClientMessage::Error(format!(
                            "Blob {} is not on the server",
                            key
                        )))
                        .context("Cannot report the missing blob")?,
                }
            }
            ClientMessage::CancelRequest(client_id) => connection.cancel(client_id),
        }
    }
    // the forwarder ends once every pending fulfiller is gone; requests
    // still queued in the dispatcher may outlive this connection, so it is
    // not joined here
    drop(connection);
    drop(forwarder);
    Ok(())
}

impl ClientConnection {
    /// Accept a request: translate its id, ingest the inline inputs, ask the
    /// client for the missing blobs and queue it once complete.
    fn evaluate(&mut self, mut request: Request) -> Result<(), Error> {
        let client_id = request.id;
        let server_id = self.server.next_request_id.fetch_add(1, Ordering::SeqCst);
        self.id_map.lock().unwrap().insert(server_id, client_id);
        self.reverse_ids.insert(client_id, server_id);
        request.id = server_id;

        let mut missing = vec![];
        for input in &request.inputs {
            if self.server.store.has_key(&input.hash) {
                continue;
            }
            if let Some(contents) = &input.contents {
                if FileStoreKey::from_content(contents) != input.hash {
                    self.respond
                        .send(Response {
                            status: Status::InvalidRequest,
                            error_message: format!(
                                "Inline contents of {:?} do not match their hash",
                                input.name
                            ),
                            ..Response::internal_error(server_id, "")
                        })
                        .ok();
                    return Ok(());
                }
                self.server
                    .store
                    .store(&input.hash, vec![contents.clone()])
                    .context("Cannot store inline input")?;
            } else {
                missing.push(input.hash.clone());
            }
        }
        if missing.is_empty() {
            trace!("Request {} is complete, queueing", server_id);
            self.server
                .dispatcher
                .add_request(request, self.respond.clone());
            return Ok(());
        }
        for key in &missing {
            let waiting = self.waiting_inputs.entry(key.clone()).or_default();
            if waiting.is_empty() {
                self.sender
                    .send(ServerClientMessage::AskFile(key.clone()))
                    .context("Cannot ask the client for a blob")?;
            }
            waiting.push(server_id);
        }
        let count = missing.len();
        self.pending.insert(server_id, (request, count));
        Ok(())
    }

    /// A blob arrived: queue every request that was only waiting for it.
    fn input_ready(&mut self, key: &FileStoreKey) {
        for server_id in self.waiting_inputs.remove(key).unwrap_or_default() {
            let (_, count) = match self.pending.get_mut(&server_id) {
                Some(entry) => entry,
                None => continue,
            };
            *count -= 1;
            if *count == 0 {
                let (request, _) = self.pending.remove(&server_id).unwrap();
                trace!("Request {} is complete, queueing", server_id);
                self.server
                    .dispatcher
                    .add_request(request, self.respond.clone());
            }
        }
    }

    /// Best-effort cancellation: unqueue the request, or forward the kill to
    /// the worker running it.
    fn cancel(&mut self, client_id: u64) {
        let server_id = match self.reverse_ids.get(&client_id) {
            Some(server_id) => *server_id,
            None => return,
        };
        if let Some(respond) = self.server.dispatcher.cancel_request(server_id) {
            debug!("Request {} canceled while queued", server_id);
            let mut response = Response::internal_error(server_id, "Canceled");
            response.was_killed = true;
            respond.send(response).ok();
            return;
        }
        let worker = self.server.running.lock().unwrap().get(&server_id).copied();
        if let Some(worker) = worker {
            if let Some(sender) = self.server.workers.lock().unwrap().get(&worker) {
                debug!("Forwarding kill of request {} to {}", server_id, worker);
                sender.send(ServerWorkerMessage::Kill(server_id)).ok();
            }
        }
    }
}

/// Per-connection state of a worker: the requests assigned to it and the
/// `Done` responses waiting for their output blobs.
struct WorkerConnection {
    server: Arc<Server>,
    id: WorkerId,
    sender: Arc<FramedSender<ServerWorkerMessage>>,
    /// Response fulfillers of the assigned requests.
    assigned: Arc<Mutex<HashMap<u64, Sender<Response>>>>,
    /// Completed responses still waiting for blobs, with the number of
    /// blobs missing.
    pending_done: HashMap<u64, (Response, usize)>,
    /// Request ids waiting for each output blob.
    waiting_outputs: HashMap<FileStoreKey, Vec<u64>>,
}

fn worker_connection(
    server: Arc<Server>,
    sender: ChannelSender<ServerWorkerMessage>,
    receiver: ChannelReceiver<WorkerMessage>,
) -> Result<(), Error> {
    let name = match receiver.recv() {
        Ok(WorkerMessage::Hello { name }) => name,
        Ok(other) => {
            anyhow::bail!("Worker did not introduce itself, got {:?}", other);
        }
        Err(_) => return Ok(()),
    };
    let id = Uuid::new_v4();
    info!("Worker '{}' connected as {}", name, id);
    let sender = Arc::new(FramedSender::new(sender));
    server.workers.lock().unwrap().insert(id, sender.clone());

    let assigned: Arc<Mutex<HashMap<u64, Sender<Response>>>> =
        Arc::new(Mutex::new(HashMap::new()));
    // pump the assignments of the dispatcher to the worker
    let (assign, assignments) = unbounded();
    let pump = {
        let server = server.clone();
        let sender = sender.clone();
        let assigned = assigned.clone();
        std::thread::Builder::new()
            .name(format!("Assignment pump of {}", name))
            .spawn(move || {
                for assignment in assignments {
                    let crate::dispatcher::Assignment { request, respond } = assignment;
                    let request_id = request.id;
                    assigned.lock().unwrap().insert(request_id, respond);
                    server.running.lock().unwrap().insert(request_id, id);
                    if sender
                        .send(ServerWorkerMessage::Work(Box::new(request)))
                        .is_err()
                    {
                        // connection gone: fail the request so the client
                        // can resubmit
                        if let Some(respond) = assigned.lock().unwrap().remove(&request_id) {
                            respond
                                .send(Response::internal_error(
                                    request_id,
                                    "Worker disconnected",
                                ))
                                .ok();
                        }
                        server.running.lock().unwrap().remove(&request_id);
                        break;
                    }
                }
            })
            .context("Cannot spawn assignment pump")?
    };

    let mut connection = WorkerConnection {
        server: server.clone(),
        id,
        sender,
        assigned,
        pending_done: HashMap::new(),
        waiting_outputs: HashMap::new(),
    };
    loop {
        let message = match receiver.recv() {
            Ok(message) => message,
            Err(_) => {
                info!("Worker '{}' disconnected", name);
                break;
            }
        };
        match message {
            WorkerMessage::Hello { .. } => {
                warn!("Worker '{}' sent a second hello", name);
            }
            WorkerMessage::GetWork => {
                connection.server.dispatcher.add_evaluator(id, assign.clone());
            }
            WorkerMessage::Done(response) => connection.done(*response)?,
            WorkerMessage::ProvideFile(key) => {
                let chunks = ChannelFileIterator::new(&receiver);
                connection
                    .server
                    .store
                    .store(&key, chunks)
                    .context("Cannot store blob from the worker")?;
                connection.output_ready(&key);
            }
            WorkerMessage::RequestFile(key) => {
                let blob = connection
                    .server
                    .store
                    .get(&key)
                    .with_context(|| format!("Worker asked for unknown blob {}", key))?;
                connection
                    .sender
                    .send_with_file(ServerWorkerMessage::ProvideFile(key), blob.path())
                    .context("Cannot send blob to the worker")?;
            }
        }
    }
    // cleanup: unqueue the free slots and fail whatever was assigned here
    drop(assign);
    server.dispatcher.remove_evaluator(id);
    server.workers.lock().unwrap().remove(&id);
    let orphans: Vec<(u64, Sender<Response>)> =
        connection.assigned.lock().unwrap().drain().collect();
    for (request_id, respond) in orphans {
        server.running.lock().unwrap().remove(&request_id);
        respond
            .send(Response::internal_error(request_id, "Worker disconnected"))
            .ok();
    }
    pump.join().ok();
    Ok(())
}

impl WorkerConnection {
    /// A request completed: ingest the inline outputs, collect the blobs the
    /// server is missing, deliver once everything is here.
    fn done(&mut self, response: Response) -> Result<(), Error> {
        let request_id = response.request_id;
        let mut missing = vec![];
        for output in &response.outputs {
            if self.server.store.has_key(&output.hash) {
                continue;
            }
            match &output.contents {
                Some(contents) => {
                    self.server
                        .store
                        .store(&output.hash, vec![contents.clone()])
                        .context("Cannot store inline output")?;
                }
                None => missing.push(output.hash.clone()),
            }
        }
        if missing.is_empty() {
            self.deliver(response);
            return Ok(());
        }
        trace!(
            "Request {} done, asking {} output blobs",
            request_id,
            missing.len()
        );
        for key in &missing {
            self.waiting_outputs
                .entry(key.clone())
                .or_default()
                .push(request_id);
        }
        let count = missing.len();
        self.pending_done.insert(request_id, (response, count));
        self.sender
            .send(ServerWorkerMessage::AskFiles(missing))
            .context("Cannot ask the worker for the output blobs")?;
        Ok(())
    }

    /// An output blob arrived: deliver every response that was only waiting
    /// for it.
    fn output_ready(&mut self, key: &FileStoreKey) {
        for request_id in self.waiting_outputs.remove(key).unwrap_or_default() {
            let (_, count) = match self.pending_done.get_mut(&request_id) {
                Some(entry) => entry,
                None => continue,
            };
            *count -= 1;
            if *count == 0 {
                let (response, _) = self.pending_done.remove(&request_id).unwrap();
                self.deliver(response);
            }
        }
    }

    /// Hand the response to the client-side fulfiller.
    fn deliver(&mut self, response: Response) {
        let request_id = response.request_id;
        self.server.running.lock().unwrap().remove(&request_id);
        match self.assigned.lock().unwrap().remove(&request_id) {
            Some(respond) => {
                respond.send(response).ok();
            }
            None => warn!("Response for unassigned request {}", request_id),
        }
    }
}
