//! The wire protocol between the three actors of an evaluation.
//!
//! There are three actors:
//!
//! - the *client* (the manager), who owns the execution graph and wants the
//!   results;
//! - the *server*, who brokers requests between clients and workers and
//!   relays blobs in both directions;
//! - the *worker*, who evaluates requests inside a sandbox.
//!
//! Clients and workers only ever talk to the server. The protocol renders
//! three remote methods: `evaluate(Request) → Response`, `cancelRequest(id)`
//! and `requestFile(hash) → chunks`.
//!
//! When an actor needs a blob the channel switches to file-transfer mode: the
//! producer sends a `ProvideFile` message followed by raw frames of at most
//! [`CHUNK_SIZE`](../constant.CHUNK_SIZE.html) bytes, terminated by an empty
//! frame. A sender must not interleave other messages inside a stream, which
//! is what [`FramedSender`] enforces.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Error};
use ductile::{ChannelReceiver, ChannelSender};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use taskgrade_dag::{ResourceLimits, ResourceUsage};
use taskgrade_store::{FileChunkIterator, FileStoreKey};

/// The identifier a client assigns to a request. Unique within a client
/// connection.
pub type RequestId = u64;

/// The role a file plays in a request or a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    /// The standard input of the process.
    Stdin,
    /// The captured standard output.
    Stdout,
    /// The captured standard error.
    Stderr,
    /// A file staged into (or captured from) the sandbox directory.
    Other,
}

/// A file referenced by a request or a response, addressed by content hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileInfo {
    /// The name of the file inside the sandbox. Empty for stdin, stdout and
    /// stderr.
    pub name: String,
    /// The role of the file.
    pub file_type: FileType,
    /// The content hash.
    pub hash: FileStoreKey,
    /// Whether the file must be staged with the executable bit.
    pub executable: bool,
    /// The content of the blob, present iff its size is at most
    /// [`CHUNK_SIZE`](../constant.CHUNK_SIZE.html). Larger blobs are fetched
    /// by hash with `requestFile`.
    pub contents: Option<Vec<u8>>,
}

/// A single execution to run inside a sandbox on a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Client-assigned identifier, echoed in the response and used for
    /// cancellation.
    pub id: RequestId,
    /// Path of the executable.
    pub executable: PathBuf,
    /// Command line arguments.
    pub args: Vec<String>,
    /// Input files, including the optional stdin.
    pub inputs: Vec<FileInfo>,
    /// Names of the declared output files; stdout and stderr are implicit.
    pub outputs: Vec<String>,
    /// Limits enforced on the process.
    pub limits: ResourceLimits,
    /// Extra time granted past the limits before the kill.
    pub extra_time: f64,
    /// Whether the request needs sole ownership of the worker's cores.
    pub exclusive: bool,
    /// Whether the worker keeps the sandbox directory after the run.
    pub keep_sandbox: bool,
    /// Number of FIFO pipes to create. Unsupported: a non-zero value makes
    /// the request invalid.
    pub fifo_size: u32,
}

/// The outcome class of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// The process exited normally; `status_code` carries the exit code.
    Success,
    /// The process was terminated by a signal; `signal` carries it.
    Signal,
    /// The executor itself failed. Never cached: the request may be retried.
    InternalError,
    /// The executable is not runnable on the worker's platform.
    NotExecutable,
    /// The request is malformed (bad input name, FIFOs, unknown output).
    InvalidRequest,
    /// An input blob could not be materialized on the worker.
    MissingFiles,
}

/// The result of a request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    /// The id of the request this response answers.
    pub request_id: RequestId,
    /// The outcome class.
    pub status: Status,
    /// The exit code of the process. Meaningful when the process exited
    /// normally, preserved as reported otherwise.
    pub status_code: u32,
    /// The signal that terminated the process, 0 if none.
    pub signal: u32,
    /// Resources used by the process.
    pub resources: ResourceUsage,
    /// The produced files: stdout, stderr and the declared outputs. Every
    /// hash listed here is present in the producing worker's store when the
    /// response is emitted.
    pub outputs: Vec<FileInfo>,
    /// Human readable explanation of a failure.
    pub error_message: String,
    /// Whether the process was killed by the sandbox or a cancellation.
    pub was_killed: bool,
}

impl Response {
    /// A response reporting an executor failure.
    pub fn internal_error<S: Into<String>>(request_id: RequestId, message: S) -> Response {
        Response {
            request_id,
            status: Status::InternalError,
            status_code: 0,
            signal: 0,
            resources: ResourceUsage::default(),
            outputs: vec![],
            error_message: message.into(),
            was_killed: false,
        }
    }
}

/// Messages from a client to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Ask to evaluate a request.
    Evaluate(Box<Request>),
    /// Ask to cancel an in-flight request by id.
    CancelRequest(RequestId),
    /// Answer to `AskFile`: the blob follows as a chunk stream.
    ProvideFile(FileStoreKey),
    /// Ask the server for a blob, answered by `ProvideFile`.
    RequestFile(FileStoreKey),
}

/// Messages from the server to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerClientMessage {
    /// The server is missing an input blob of a submitted request.
    AskFile(FileStoreKey),
    /// Answer to `RequestFile`: the blob follows as a chunk stream.
    ProvideFile(FileStoreKey),
    /// A request completed.
    Response(Box<Response>),
    /// The evaluation cannot proceed.
    Error(String),
}

/// Messages from a worker to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkerMessage {
    /// Present the worker to the server. First message of a connection.
    Hello {
        /// Human readable name of the worker.
        name: String,
    },
    /// The worker has budget for one more request.
    GetWork,
    /// A request completed. The server asks for the output blobs it is
    /// missing with `AskFiles`.
    Done(Box<Response>),
    /// Answer to `AskFiles`, one per blob: the content follows as a chunk
    /// stream.
    ProvideFile(FileStoreKey),
    /// Ask the server for an input blob, answered by `ProvideFile`.
    RequestFile(FileStoreKey),
}

/// Messages from the server to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerWorkerMessage {
    /// A request to evaluate, answering a previous `GetWork`.
    Work(Box<Request>),
    /// The output blobs of a `Done` response the server is missing.
    AskFiles(Vec<FileStoreKey>),
    /// Answer to `RequestFile`: the blob follows as a chunk stream.
    ProvideFile(FileStoreKey),
    /// Abort the request with that id if it is still running.
    Kill(RequestId),
    /// Ask the worker to exit.
    Exit,
}

/// Iterator over the chunk stream that follows a `ProvideFile` message.
/// Yields the raw frames until the empty terminator.
pub struct ChannelFileIterator<'a, T> {
    /// The channel the stream is read from.
    reader: &'a ChannelReceiver<T>,
}

impl<'a, T> ChannelFileIterator<'a, T>
where
    T: 'static + Send + Sync + DeserializeOwned,
{
    /// Start reading a chunk stream from the channel.
    pub fn new(reader: &'a ChannelReceiver<T>) -> ChannelFileIterator<'a, T> {
        ChannelFileIterator { reader }
    }
}

impl<'a, T> Iterator for ChannelFileIterator<'a, T>
where
    T: 'static + Send + Sync + DeserializeOwned,
{
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        // a truncated stream must not be silently ingested as a short blob
        let data = self.reader.recv_raw().expect("File stream interrupted");
        if data.is_empty() {
            None
        } else {
            Some(data)
        }
    }
}

/// Sender half of the file-transfer protocol: writes the chunk stream that a
/// `ProvideFile` message announced.
pub struct ChannelFileSender;

impl ChannelFileSender {
    /// Stream a file from disk, chunk by chunk, ending with the terminator.
    pub fn send<P: AsRef<Path>, T>(path: P, sender: &ChannelSender<T>) -> Result<(), Error>
    where
        T: 'static + Send + Sync + Serialize,
    {
        let path = path.as_ref();
        let chunks = FileChunkIterator::new(path)
            .with_context(|| format!("Failed to read {} for sending", path.display()))?;
        for chunk in chunks {
            sender.send_raw(&chunk).context("Failed to send file chunk")?;
        }
        sender
            .send_raw(&[])
            .context("Failed to send file terminator")?;
        Ok(())
    }

    /// Stream an in-memory blob, ending with the terminator.
    pub fn send_data<T>(data: &[u8], sender: &ChannelSender<T>) -> Result<(), Error>
    where
        T: 'static + Send + Sync + Serialize,
    {
        if !data.is_empty() {
            sender.send_raw(data).context("Failed to send file chunk")?;
        }
        sender
            .send_raw(&[])
            .context("Failed to send file terminator")?;
        Ok(())
    }
}

/// A channel sender shared between threads. A plain message takes the lock
/// for one send; a message followed by a chunk stream holds the lock for the
/// whole stream, so concurrent senders can never corrupt the framing.
pub struct FramedSender<T> {
    /// The underlying channel.
    inner: Mutex<ChannelSender<T>>,
}

impl<T> FramedSender<T>
where
    T: 'static + Send + Sync + Serialize,
{
    /// Wrap a channel sender.
    pub fn new(sender: ChannelSender<T>) -> FramedSender<T> {
        FramedSender {
            inner: Mutex::new(sender),
        }
    }

    /// Send a single message.
    pub fn send(&self, message: T) -> Result<(), Error> {
        let sender = self.inner.lock().unwrap();
        sender.send(message).context("Failed to send message")
    }

    /// Send a message announcing a blob, followed by its chunk stream read
    /// from `path`.
    pub fn send_with_file<P: AsRef<Path>>(&self, message: T, path: P) -> Result<(), Error> {
        let sender = self.inner.lock().unwrap();
        sender.send(message).context("Failed to send message")?;
        ChannelFileSender::send(path, &sender)
    }

    /// Run `body` while holding the channel lock, for custom send sequences.
    pub fn with_lock<R>(&self, body: impl FnOnce(&ChannelSender<T>) -> R) -> R {
        let sender = self.inner.lock().unwrap();
        body(&sender)
    }

    /// Send a message announcing a blob, followed by its content.
    pub fn send_with_data(&self, message: T, data: &[u8]) -> Result<(), Error> {
        let sender = self.inner.lock().unwrap();
        sender.send(message).context("Failed to send message")?;
        ChannelFileSender::send_data(data, &sender)
    }
}

#[cfg(test)]
mod tests {
    use ductile::new_local_channel;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_send_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("file.txt");
        std::fs::write(&path, "hello world").unwrap();

        let (sender, receiver) = new_local_channel::<()>();
        ChannelFileSender::send(&path, &sender).unwrap();
        let data: Vec<u8> = ChannelFileIterator::new(&receiver).flatten().collect();
        assert_eq!(String::from_utf8(data).unwrap(), "hello world");
    }

    #[test]
    fn test_send_data() {
        let (sender, receiver) = new_local_channel::<()>();
        ChannelFileSender::send_data(b"hello world", &sender).unwrap();
        let data: Vec<u8> = ChannelFileIterator::new(&receiver).flatten().collect();
        assert_eq!(String::from_utf8(data).unwrap(), "hello world");
    }

    #[test]
    fn test_send_empty_data() {
        let (sender, receiver) = new_local_channel::<()>();
        ChannelFileSender::send_data(b"", &sender).unwrap();
        let data: Vec<u8> = ChannelFileIterator::new(&receiver).flatten().collect();
        assert_eq!(data, Vec::<u8>::new());
    }

    #[test]
    fn test_framed_sender_keeps_stream_contiguous() {
        let (sender, receiver) = new_local_channel::<u32>();
        let sender = std::sync::Arc::new(FramedSender::new(sender));
        let s1 = sender.clone();
        let handle = std::thread::spawn(move || {
            for _ in 0..100 {
                s1.send_with_data(42, b"0123456789").unwrap();
            }
        });
        for _ in 0..100 {
            sender.send_with_data(7, b"abcdefghij").unwrap();
        }
        handle.join().unwrap();
        for _ in 0..200 {
            let header: u32 = receiver.recv().unwrap();
            let data: Vec<u8> = ChannelFileIterator::new(&receiver).flatten().collect();
            match header {
                42 => assert_eq!(data, b"0123456789"),
                7 => assert_eq!(data, b"abcdefghij"),
                _ => panic!("unexpected header"),
            }
        }
    }
}
