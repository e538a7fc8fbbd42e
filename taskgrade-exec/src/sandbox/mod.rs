//! The sandbox abstraction: something able to run one process under resource
//! limits and report how it terminated.
//!
//! Backends are registered by name in a [`SandboxRegistry`] and selected at
//! startup; they are stateless across calls. The built-in backends are
//! [`echo`](struct.EchoSandbox.html), which only prints what it would run,
//! and [`process`](struct.ProcessSandbox.html), which spawns the real
//! command with POSIX rlimits but no isolation. Hardened isolators live
//! outside this crate and register themselves under their own name.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use taskgrade_dag::ResourceLimits;

pub use echo::EchoSandbox;
pub use process::ProcessSandbox;

mod echo;
mod process;

/// Everything a backend needs to run one process.
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    /// The working directory of the process, an absolute path to the sandbox
    /// root (`<scratch>/box`).
    pub root: PathBuf,
    /// Path of the executable. Non-absolute paths are resolved in `$PATH`.
    pub executable: PathBuf,
    /// Command line arguments.
    pub args: Vec<String>,
    /// File bound to the standard input, `/dev/null` if absent.
    pub stdin_file: Option<PathBuf>,
    /// File capturing the standard output.
    pub stdout_file: PathBuf,
    /// File capturing the standard error.
    pub stderr_file: PathBuf,
    /// Limits to enforce on the process.
    pub limits: ResourceLimits,
    /// Extra time granted past the cpu/wall limits before the kill.
    pub extra_time: f64,
    /// Whether the process owns all the cores of the machine.
    pub exclusive: bool,
}

/// How the process terminated and what it consumed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    /// Milliseconds spent in user space.
    pub cpu_time_millis: u64,
    /// Milliseconds spent in kernel space.
    pub sys_time_millis: u64,
    /// Milliseconds elapsed between spawn and exit.
    pub wall_time_millis: u64,
    /// Peak resident memory, in KiB.
    pub memory_usage_kb: u64,
    /// Exit code, when the process exited normally.
    pub status_code: u32,
    /// Terminating signal, 0 when the process exited normally.
    pub signal: u32,
}

/// Why a backend could not run the process. A failure of the sandboxed
/// process itself is not an error: it is reported through
/// [`ExecutionInfo`].
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The sandbox could not be set up or the child could not be spawned.
    /// Surfaces as an internal error: the request may be retried elsewhere.
    #[error("sandbox failure: {0}")]
    Setup(String),
    /// The executable is not runnable on this platform. Surfaces as
    /// `NotExecutable` and is cached like any other outcome of the binary.
    #[error("not executable: {0}")]
    NotExecutable(String),
}

/// A process isolator backend.
pub trait Sandbox: Send + Sync {
    /// Run the process described by `options`, blocking until it exits.
    ///
    /// The backend stores the PID of the spawned process in `pid` as soon as
    /// it is known, so that a cancellation can signal it from another
    /// thread.
    fn execute(
        &self,
        options: &ExecutionOptions,
        pid: Arc<AtomicU32>,
    ) -> Result<ExecutionInfo, SandboxError>;
}

/// The registry of the available backends, selected by name.
pub struct SandboxRegistry {
    /// The known backends.
    backends: HashMap<String, Arc<dyn Sandbox>>,
}

impl SandboxRegistry {
    /// A registry with the built-in backends (`echo` and `process`).
    pub fn with_builtins() -> SandboxRegistry {
        let mut registry = SandboxRegistry {
            backends: HashMap::new(),
        };
        registry.register("echo", Arc::new(EchoSandbox));
        registry.register("process", Arc::new(ProcessSandbox));
        registry
    }

    /// Register a backend under `name`, replacing any previous one.
    pub fn register<S: Into<String>>(&mut self, name: S, sandbox: Arc<dyn Sandbox>) {
        self.backends.insert(name.into(), sandbox);
    }

    /// The backend registered under `name`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Sandbox>> {
        self.backends.get(name).cloned()
    }

    /// The names of the registered backends, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }
}
