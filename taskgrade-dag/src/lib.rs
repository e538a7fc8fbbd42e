//! Data model of the evaluation: logical files, execution nodes and the graph
//! that ties them together.
//!
//! An [`Execution`] names a command, the files it reads (by [`FileId`]), the
//! files it produces and the limits the sandbox must enforce. A
//! [`FileRef`] starts with no content; the graph driver binds a content hash
//! to its id exactly once, when the producing execution succeeds or the
//! client provides the file. Executions become runnable when every file they
//! read has a bound hash, which is what makes the graph a DAG.

#![deny(missing_docs)]

mod dag;
mod execution;
mod file;

pub use dag::{ExecutionCallbacks, ExecutionGraph, ExecutionId, FileCallbacks, ProvidedFile};
pub use execution::{
    CachingMode, Execution, ExecutionInput, ExecutionResult, ExecutionStatus, ResourceLimits,
    ResourceUsage,
};
pub use file::{FileId, FileRef};
