//! The graph driver: topologically drives the executions of a graph,
//! threading content hashes through the files, consulting the response
//! cache and dispatching the rest to the server.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::{bail, Context, Error};
use ductile::ChannelReceiver;
use itertools::Itertools;

use taskgrade_cache::{Cache, CacheEntry, CacheHit, CacheKey, CacheResult, Fingerprint};
use taskgrade_dag::{
    CachingMode, ExecutionGraph, ExecutionId, ExecutionResult, ExecutionStatus, FileCallbacks,
    FileId,
};
use taskgrade_store::{cheap_copy, file_size, FileChunkIterator, FileStore, FileStoreHandle,
    FileStoreKey, CHUNK_SIZE};

use crate::check_dag::check_graph;
use crate::proto::{
    ChannelFileIterator, ClientMessage, FileInfo, FileType, FramedSender, Request, Response,
    ServerClientMessage, Status,
};

/// How many times an execution hit by an executor failure is resubmitted
/// before the whole evaluation is aborted.
const MAX_RETRIES: usize = 2;

/// Drive a whole graph to completion against a connected server.
///
/// Returns the outcome of every execution that ran; executions skipped
/// because a dependency failed only fire their `on_skip` callbacks.
pub fn evaluate_graph(
    mut graph: ExecutionGraph,
    sender: &FramedSender<ClientMessage>,
    receiver: &ChannelReceiver<ServerClientMessage>,
    store: &Arc<FileStore>,
    cache: &mut Cache,
    executor_id: &str,
) -> Result<HashMap<ExecutionId, ExecutionResult>, Error> {
    check_graph(&graph).context("Invalid execution graph")?;
    let mut callbacks = std::mem::take(&mut graph.execution_callbacks);
    let file_callbacks = std::mem::take(&mut graph.file_callbacks);
    let mut driver = Driver {
        graph: &graph,
        sender,
        receiver,
        store,
        cache,
        executor_id,
        file_keys: HashMap::new(),
        handles: HashMap::new(),
        missing: HashMap::new(),
        dependents: HashMap::new(),
        ready: VecDeque::new(),
        in_flight: HashMap::new(),
        retries: HashMap::new(),
        results: HashMap::new(),
        skipped: vec![],
        stash: VecDeque::new(),
        file_callbacks,
    };
    driver.setup()?;
    driver.run()?;

    for exec_id in driver.skipped.iter() {
        if let Some(callbacks) = callbacks.get_mut(exec_id) {
            for on_skip in callbacks.on_skip.drain(..) {
                on_skip();
            }
        }
    }
    for (exec_id, result) in driver.results.iter() {
        if let Some(callbacks) = callbacks.get_mut(exec_id) {
            for on_done in callbacks.on_done.drain(..) {
                on_done(result.clone());
            }
        }
    }
    Ok(driver.results)
}

struct Driver<'a> {
    graph: &'a ExecutionGraph,
    sender: &'a FramedSender<ClientMessage>,
    receiver: &'a ChannelReceiver<ServerClientMessage>,
    store: &'a Arc<FileStore>,
    cache: &'a mut Cache,
    executor_id: &'a str,
    /// Hash bound to each materialized file.
    file_keys: HashMap<FileId, FileStoreKey>,
    /// Pinned blobs of the materialized files.
    handles: HashMap<FileId, FileStoreHandle>,
    /// Unset dependency count of each not-yet-ready execution.
    missing: HashMap<ExecutionId, usize>,
    /// Executions reading each file.
    dependents: HashMap<FileId, Vec<ExecutionId>>,
    /// Executions with every input materialized, not dispatched yet.
    ready: VecDeque<ExecutionId>,
    /// Dispatched executions awaiting a response, by request id.
    in_flight: HashMap<u64, ExecutionId>,
    /// Executor-failure resubmissions, by execution.
    retries: HashMap<ExecutionId, usize>,
    /// Outcome of every completed execution.
    results: HashMap<ExecutionId, ExecutionResult>,
    /// Executions whose dependencies failed.
    skipped: Vec<ExecutionId>,
    /// Messages received while waiting for a blob stream, replayed later.
    stash: VecDeque<ServerClientMessage>,
    /// Client file callbacks, by file id.
    file_callbacks: HashMap<FileId, FileCallbacks>,
}

impl Driver<'_> {
    /// Seed the provided files and the ready set.
    fn setup(&mut self) -> Result<(), Error> {
        for (id, execution) in self.graph.executions.iter().enumerate() {
            let deps = execution.dependencies();
            if deps.is_empty() {
                self.ready.push_back(id);
            } else {
                self.missing.insert(id, deps.len());
                for dep in deps {
                    self.dependents.entry(dep).or_default().push(id);
                }
            }
        }
        let provided = self.graph.provided_files.values().cloned().collect_vec();
        for file in provided {
            let chunks = FileChunkIterator::new(&file.local_path).with_context(|| {
                format!("Cannot read provided file {}", file.local_path.display())
            })?;
            let handle = self
                .store
                .store(&file.key, chunks)
                .context("Cannot seed provided file")?;
            self.file_ready(file.file.id, file.key.clone(), handle)?;
        }
        Ok(())
    }

    /// Dispatch ready executions and consume responses until the graph is
    /// settled.
    fn run(&mut self) -> Result<(), Error> {
        loop {
            while let Some(exec_id) = self.ready.pop_front() {
                self.dispatch(exec_id)?;
            }
            if self.in_flight.is_empty() {
                break;
            }
            let message = match self.stash.pop_front() {
                Some(message) => message,
                None => self.receiver.recv().context("Server connection lost")?,
            };
            self.handle_message(message)?;
        }
        // whatever never became ready is unreachable
        let unreachable = self.missing.keys().copied().collect_vec();
        for exec_id in unreachable {
            self.skipped.push(exec_id);
        }
        Ok(())
    }

    fn handle_message(&mut self, message: ServerClientMessage) -> Result<(), Error> {
        match message {
            ServerClientMessage::AskFile(key) => {
                let handle = self
                    .store
                    .get(&key)
                    .with_context(|| format!("Server asked for unknown blob {}", key))?;
                self.sender
                    .send_with_file(ClientMessage::ProvideFile(key), handle.path())
                    .context("Cannot send blob to the server")?;
            }
            ServerClientMessage::ProvideFile(key) => {
                // a stream nobody is waiting for: ingest it anyway
                let chunks = ChannelFileIterator::new(self.receiver);
                self.store
                    .store(&key, chunks)
                    .context("Cannot store blob from the server")?;
            }
            ServerClientMessage::Response(response) => {
                self.handle_response(*response)?;
            }
            ServerClientMessage::Error(message) => {
                bail!("Server error: {}", message);
            }
        }
        Ok(())
    }

    /// Consult the cache, then send the request to the server on a miss.
    fn dispatch(&mut self, exec_id: ExecutionId) -> Result<(), Error> {
        let execution = &self.graph.executions[exec_id];
        let fingerprint = Fingerprint::of(execution, &self.file_keys);
        let cache_key = match execution.caching_mode {
            CachingMode::Never => None,
            CachingMode::Always => Some(CacheKey::global(fingerprint)),
            CachingMode::SameExecutor => Some(CacheKey::scoped(fingerprint, self.executor_id)),
        };
        if let Some(key) = &cache_key {
            if let CacheResult::Hit(hit) = self.cache.get(key, self.store) {
                if self.complete_from_cache(exec_id, hit)? {
                    return Ok(());
                }
                // the entry cannot serve this execution (differently named
                // outputs): drop it and run for real
                self.cache.invalidate(key);
            }
        }
        let request = self.build_request(exec_id)?;
        debug!(
            "Dispatching '{}' as request {}",
            execution.description, request.id
        );
        self.in_flight.insert(request.id, exec_id);
        self.sender
            .send(ClientMessage::Evaluate(Box::new(request)))
            .context("Cannot send request to the server")?;
        Ok(())
    }

    fn build_request(&self, exec_id: ExecutionId) -> Result<Request, Error> {
        let execution = &self.graph.executions[exec_id];
        let mut inputs = vec![];
        if let Some(stdin) = execution.stdin {
            inputs.push(self.input_info(stdin, "", FileType::Stdin, false)?);
        }
        for (name, input) in execution.inputs.iter().sorted_by(|a, b| a.0.cmp(b.0)) {
            inputs.push(self.input_info(input.file, name, FileType::Other, input.executable)?);
        }
        Ok(Request {
            id: exec_id as u64,
            executable: execution.executable.clone(),
            args: execution.args.clone(),
            inputs,
            outputs: execution.outputs.keys().sorted().cloned().collect(),
            limits: execution.limits.clone(),
            extra_time: execution.extra_time,
            exclusive: execution.exclusive,
            keep_sandbox: execution.keep_sandbox,
            fifo_size: 0,
        })
    }

    fn input_info(
        &self,
        file: FileId,
        name: &str,
        file_type: FileType,
        executable: bool,
    ) -> Result<FileInfo, Error> {
        let hash = self.file_keys[&file].clone();
        let handle = &self.handles[&file];
        let contents = match file_size(handle.path()) {
            Some(size) if size as usize <= CHUNK_SIZE => Some(
                std::fs::read(handle.path())
                    .with_context(|| format!("Cannot read blob {}", hash))?,
            ),
            _ => None,
        };
        Ok(FileInfo {
            name: name.to_owned(),
            file_type,
            hash,
            executable,
            contents,
        })
    }

    /// Serve an execution from a cache hit. Returns false if the entry does
    /// not cover the declared outputs of this execution.
    fn complete_from_cache(&mut self, exec_id: ExecutionId, hit: CacheHit) -> Result<bool, Error> {
        let execution = &self.graph.executions[exec_id];
        for name in execution.outputs.keys() {
            if !hit.outputs.contains_key(name) {
                return Ok(false);
            }
        }
        debug!("'{}' served from the cache", execution.description);
        let stdout = execution.stdout.id;
        let stderr = execution.stderr.id;
        let named = execution
            .outputs
            .iter()
            .map(|(name, file)| (name.clone(), file.id))
            .collect_vec();
        let mut result = hit.entry.result.clone();
        result.was_cached = true;
        let success = result.status == ExecutionStatus::Success;
        if success {
            self.file_ready(stdout, hit.entry.stdout.clone(), hit.stdout)?;
            self.file_ready(stderr, hit.entry.stderr.clone(), hit.stderr)?;
            let mut outputs = hit.outputs;
            for (name, file_id) in named {
                let handle = outputs.remove(&name).expect("checked above");
                let key = hit.entry.outputs[&name].clone();
                self.file_ready(file_id, key, handle)?;
            }
        }
        self.results.insert(exec_id, result.clone());
        if !success {
            self.execution_failed(exec_id, &result)?;
        }
        Ok(true)
    }

    fn handle_response(&mut self, response: Response) -> Result<(), Error> {
        let exec_id = match self.in_flight.remove(&response.request_id) {
            Some(exec_id) => exec_id,
            None => {
                debug!("Response for unknown request {}", response.request_id);
                return Ok(());
            }
        };
        let execution = &self.graph.executions[exec_id];
        if matches!(response.status, Status::InternalError | Status::MissingFiles) {
            let attempts = self.retries.entry(exec_id).or_insert(0);
            if *attempts < MAX_RETRIES {
                *attempts += 1;
                warn!(
                    "Executor failure on '{}' ({}), resubmitting ({}/{})",
                    execution.description, response.error_message, attempts, MAX_RETRIES
                );
                self.ready.push_back(exec_id);
                return Ok(());
            }
            bail!(
                "Executor failure on '{}' after {} attempts: {}",
                execution.description,
                MAX_RETRIES + 1,
                response.error_message
            );
        }

        // materialize every output blob locally, fetching the big ones
        let mut produced: HashMap<FileId, (FileStoreKey, FileStoreHandle)> = HashMap::new();
        let mut entry_outputs = HashMap::new();
        let mut stdout_key = None;
        let mut stderr_key = None;
        for output in &response.outputs {
            let handle = self.materialize_blob(output)?;
            let file_id = match output.file_type {
                FileType::Stdout => {
                    stdout_key = Some(output.hash.clone());
                    execution.stdout.id
                }
                FileType::Stderr => {
                    stderr_key = Some(output.hash.clone());
                    execution.stderr.id
                }
                FileType::Other => match execution.outputs.get(&output.name) {
                    Some(file) => {
                        entry_outputs.insert(output.name.clone(), output.hash.clone());
                        file.id
                    }
                    None => bail!(
                        "Response of '{}' names an undeclared output {:?}",
                        execution.description,
                        output.name
                    ),
                },
                FileType::Stdin => bail!("Response contains a stdin output"),
            };
            produced.insert(file_id, (output.hash.clone(), handle));
        }

        let result = ExecutionResult {
            status: response_status(&response),
            was_cached: false,
            was_killed: response.was_killed,
            resources: response.resources.clone(),
        };

        // every completed run is recorded; retrieval is governed by the
        // node's caching mode
        if let (Some(stdout), Some(stderr)) = (stdout_key, stderr_key) {
            let entry = CacheEntry {
                result: result.clone(),
                stdout,
                stderr,
                outputs: entry_outputs,
            };
            let fingerprint = Fingerprint::of(execution, &self.file_keys);
            self.cache
                .insert(CacheKey::global(fingerprint), entry.clone());
            self.cache
                .insert(CacheKey::scoped(fingerprint, self.executor_id), entry);
        }

        let success = result.status == ExecutionStatus::Success;
        self.results.insert(exec_id, result.clone());
        if success {
            for (file_id, (key, handle)) in produced {
                self.file_ready(file_id, key, handle)?;
            }
        } else {
            self.execution_failed(exec_id, &result)?;
        }
        Ok(())
    }

    /// Make sure the blob of a response output is in the local store,
    /// pulling it from the server unless it came inline.
    fn materialize_blob(&mut self, info: &FileInfo) -> Result<FileStoreHandle, Error> {
        if let Some(handle) = self.store.get(&info.hash) {
            return Ok(handle);
        }
        if let Some(contents) = &info.contents {
            return self
                .store
                .store(&info.hash, vec![contents.clone()])
                .context("Cannot store inline output");
        }
        self.sender
            .send(ClientMessage::RequestFile(info.hash.clone()))
            .context("Cannot request blob from the server")?;
        loop {
            let message = self.receiver.recv().context("Server connection lost")?;
            match message {
                ServerClientMessage::ProvideFile(key) => {
                    let chunks = ChannelFileIterator::new(self.receiver);
                    let handle = self
                        .store
                        .store(&key, chunks)
                        .context("Cannot store blob from the server")?;
                    if key == info.hash {
                        return Ok(handle);
                    }
                }
                other => self.stash.push_back(other),
            }
        }
    }

    /// Bind a hash to a file, fire its client callback and wake the
    /// executions that were waiting for it.
    fn file_ready(
        &mut self,
        file_id: FileId,
        key: FileStoreKey,
        handle: FileStoreHandle,
    ) -> Result<(), Error> {
        if let Some(callback) = self.file_callbacks.get(&file_id) {
            if let Some(dest) = &callback.write_to {
                cheap_copy(handle.path(), dest)
                    .with_context(|| format!("Cannot write file to {}", dest.display()))?;
            }
        }
        self.file_keys.insert(file_id, key);
        self.handles.insert(file_id, handle);
        for exec_id in self.dependents.remove(&file_id).unwrap_or_default() {
            if let Some(count) = self.missing.get_mut(&exec_id) {
                *count -= 1;
                if *count == 0 {
                    self.missing.remove(&exec_id);
                    self.ready.push_back(exec_id);
                }
            }
        }
        Ok(())
    }

    /// A non-successful execution: abort the run under `die_on_error`,
    /// otherwise mark the transitive dependents unreachable.
    fn execution_failed(
        &mut self,
        exec_id: ExecutionId,
        result: &ExecutionResult,
    ) -> Result<(), Error> {
        let execution = &self.graph.executions[exec_id];
        if execution.die_on_error {
            bail!(
                "Execution '{}' failed with {:?}",
                execution.description,
                result.status
            );
        }
        let mut failed_files: VecDeque<FileId> = execution.produces().into();
        while let Some(file_id) = failed_files.pop_front() {
            for dependent in self.dependents.remove(&file_id).unwrap_or_default() {
                if self.missing.remove(&dependent).is_some() {
                    trace!(
                        "Skipping '{}': a dependency failed",
                        self.graph.executions[dependent].description
                    );
                    self.skipped.push(dependent);
                    for produced in self.graph.executions[dependent].produces() {
                        failed_files.push_back(produced);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Translate a wire status into the client-facing one.
fn response_status(response: &Response) -> ExecutionStatus {
    match response.status {
        Status::Success if response.status_code == 0 => ExecutionStatus::Success,
        Status::Success => ExecutionStatus::ReturnCode(response.status_code),
        Status::Signal => ExecutionStatus::Signal(response.signal),
        Status::NotExecutable => ExecutionStatus::NotExecutable(response.error_message.clone()),
        Status::InvalidRequest => ExecutionStatus::InvalidRequest(response.error_message.clone()),
        Status::InternalError | Status::MissingFiles => {
            ExecutionStatus::InternalError(response.error_message.clone())
        }
    }
}
