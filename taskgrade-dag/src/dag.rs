use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Error};

use taskgrade_store::FileStoreKey;

use crate::execution::{Execution, ExecutionResult};
use crate::file::{FileId, FileRef};

/// The position of an execution inside its graph. Executions are identified
/// by insertion order.
pub type ExecutionId = usize;

/// A file provided by the client: its handle, the hash of its content and the
/// path it lives at on the client's disk.
#[derive(Debug, Clone)]
pub struct ProvidedFile {
    /// The file handle.
    pub file: FileRef,
    /// Content hash, computed when the file is provided.
    pub key: FileStoreKey,
    /// Path of the file on the client.
    pub local_path: PathBuf,
}

/// Callbacks fired by the graph driver when an execution completes or is
/// skipped.
#[derive(Default)]
pub struct ExecutionCallbacks {
    /// Called with the outcome when the execution completes.
    pub on_done: Vec<Box<dyn FnOnce(ExecutionResult) + Send>>,
    /// Called when the execution becomes unreachable because a dependency
    /// failed.
    pub on_skip: Vec<Box<dyn FnOnce() + Send>>,
}

/// Callbacks bound to a file of the graph.
#[derive(Debug, Default)]
pub struct FileCallbacks {
    /// Write the file here once it is materialized. Not written if the
    /// producing execution failed.
    pub write_to: Option<PathBuf>,
}

/// The DAG of executions the manager wants to evaluate: provided files,
/// execution nodes and the callbacks of the client.
///
/// The graph owns every [`FileRef`]; the driver and the executors only see
/// ids. Dependencies are implied by the files: an execution is runnable once
/// every file it reads has a known hash.
#[derive(Debug, Default)]
pub struct ExecutionGraph {
    /// Files provided by the client, by id.
    pub provided_files: HashMap<FileId, ProvidedFile>,
    /// The executions, in insertion order.
    pub executions: Vec<Execution>,
    /// Completion callbacks, by execution id.
    pub execution_callbacks: HashMap<ExecutionId, ExecutionCallbacks>,
    /// File callbacks, by file id.
    pub file_callbacks: HashMap<FileId, FileCallbacks>,
}

impl ExecutionGraph {
    /// Create an empty graph.
    pub fn new() -> ExecutionGraph {
        ExecutionGraph::default()
    }

    /// Provide a local file for the evaluation. The content is hashed
    /// immediately, so the file must exist and should not change afterwards.
    pub fn provide_file<P: Into<PathBuf>>(&mut self, file: FileRef, path: P) -> Result<(), Error> {
        let local_path = path.into();
        let key = FileStoreKey::from_file(&local_path).with_context(|| {
            format!("Cannot hash provided file at {}", local_path.display())
        })?;
        self.provided_files.insert(
            file.id,
            ProvidedFile {
                file,
                key,
                local_path,
            },
        );
        Ok(())
    }

    /// Add an execution to the graph, returning its id.
    pub fn add_execution(&mut self, execution: Execution) -> ExecutionId {
        self.executions.push(execution);
        self.executions.len() - 1
    }

    /// Register a callback fired with the outcome of an execution.
    pub fn on_execution_done<F>(&mut self, execution: ExecutionId, callback: F)
    where
        F: FnOnce(ExecutionResult) + Send + 'static,
    {
        self.execution_callbacks
            .entry(execution)
            .or_default()
            .on_done
            .push(Box::new(callback));
    }

    /// Register a callback fired when an execution is skipped.
    pub fn on_execution_skip<F>(&mut self, execution: ExecutionId, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.execution_callbacks
            .entry(execution)
            .or_default()
            .on_skip
            .push(Box::new(callback));
    }

    /// Write `file` to `path` once it is materialized. Nothing is written if
    /// the execution producing the file fails.
    pub fn write_file_to<F: Into<FileId>, P: Into<PathBuf>>(&mut self, file: F, path: P) {
        self.file_callbacks.entry(file.into()).or_default().write_to = Some(path.into());
    }
}

impl std::fmt::Debug for ExecutionCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ExecutionCallbacks")
            .field("on_done", &self.on_done.len())
            .field("on_skip", &self.on_skip.len())
            .finish()
    }
}
