use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::file::{FileId, FileRef};

/// How the result of an execution may be reused across runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CachingMode {
    /// Never reuse a previous result.
    Never,
    /// Reuse a previous result only if it was produced by the same executor.
    SameExecutor,
    /// Reuse any previous result with a matching fingerprint.
    Always,
}

/// An input file staged inside the sandbox of an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionInput {
    /// Id of the file to stage.
    pub file: FileId,
    /// Whether the staged file must be executable.
    pub executable: bool,
}

/// Limits enforced on the sandboxed process. A missing limit means no
/// constraint. Times are in seconds, sizes in KiB.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceLimits {
    /// Userspace cpu time, in seconds.
    pub cpu_time: Option<f64>,
    /// Total elapsed time, including io-wait, in seconds.
    pub wall_time: Option<f64>,
    /// Peak resident memory, in KiB.
    pub memory: Option<u64>,
    /// Number of open file descriptors.
    pub nfiles: Option<u32>,
    /// Number of processes/threads that can be spawned.
    pub processes: Option<u32>,
    /// Maximum size of a created file, in KiB.
    pub fsize: Option<u64>,
    /// Maximum locked memory, in KiB.
    pub mlock: Option<u64>,
    /// Stack size, in KiB.
    pub stack: Option<u64>,
}

impl ResourceLimits {
    /// Limits with every constraint disabled.
    pub fn new() -> ResourceLimits {
        ResourceLimits::default()
    }

    /// Set the cpu time limit, in seconds.
    pub fn cpu_time(&mut self, limit: f64) -> &mut Self {
        self.cpu_time = Some(limit);
        self
    }

    /// Set the wall time limit, in seconds.
    pub fn wall_time(&mut self, limit: f64) -> &mut Self {
        self.wall_time = Some(limit);
        self
    }

    /// Set the memory limit, in KiB.
    pub fn memory(&mut self, limit: u64) -> &mut Self {
        self.memory = Some(limit);
        self
    }

    /// Set the open file descriptors limit.
    pub fn nfiles(&mut self, limit: u32) -> &mut Self {
        self.nfiles = Some(limit);
        self
    }

    /// Set the processes/threads limit.
    pub fn processes(&mut self, limit: u32) -> &mut Self {
        self.processes = Some(limit);
        self
    }

    /// Set the created file size limit, in KiB.
    pub fn fsize(&mut self, limit: u64) -> &mut Self {
        self.fsize = Some(limit);
        self
    }

    /// Set the locked memory limit, in KiB.
    pub fn mlock(&mut self, limit: u64) -> &mut Self {
        self.mlock = Some(limit);
        self
    }

    /// Set the stack size limit, in KiB.
    pub fn stack(&mut self, limit: u64) -> &mut Self {
        self.stack = Some(limit);
        self
    }
}

/// A single sandboxed command invocation with declared inputs, outputs and
/// limits. Immutable once added to the graph.
///
/// The process reads its inputs from the paths they are staged at inside the
/// sandbox, with an optional standard input; standard output and standard
/// error are always captured. Declared outputs are hashed and published after
/// a successful run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    /// Human readable description of the execution.
    pub description: String,
    /// Path of the executable to run. Non-absolute paths are resolved in the
    /// worker's `$PATH`.
    pub executable: PathBuf,
    /// Command line arguments.
    pub args: Vec<String>,

    /// Optional file bound to the standard input.
    pub stdin: Option<FileId>,
    /// Handle to the captured standard output.
    pub stdout: FileRef,
    /// Handle to the captured standard error.
    pub stderr: FileRef,
    /// Input files staged inside the sandbox, keyed by the name they are
    /// exposed at.
    pub inputs: HashMap<String, ExecutionInput>,
    /// Output files captured from the sandbox, keyed by their name.
    pub outputs: HashMap<String, FileRef>,

    /// Limits enforced on the process.
    pub limits: ResourceLimits,
    /// Extra time granted past the cpu/wall limits before the process is
    /// killed, so that a just-over-the-limit run is observed as such instead
    /// of being truncated exactly at the limit.
    pub extra_time: f64,
    /// Whether this execution needs sole ownership of the worker's cores
    /// (used for accurate timing).
    pub exclusive: bool,
    /// How the result may be reused across runs.
    pub caching_mode: CachingMode,
    /// Whether a failure of this execution aborts the whole evaluation.
    pub die_on_error: bool,
    /// Whether the worker keeps the sandbox directory after the run.
    pub keep_sandbox: bool,
}

/// Status of a completed execution, as observed by the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ExecutionStatus {
    /// The process exited with status 0.
    Success,
    /// The process exited with the attached non-zero status code.
    ReturnCode(u32),
    /// The process was terminated by the attached signal.
    Signal(u32),
    /// The executable is not runnable on the worker's platform.
    NotExecutable(String),
    /// The request was malformed (bad input name, FIFO, unknown output).
    InvalidRequest(String),
    /// The executor itself failed; the execution may be retried elsewhere.
    InternalError(String),
}

/// Resources used by a completed execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceUsage {
    /// Seconds spent in user space.
    pub cpu_time: f64,
    /// Seconds spent in kernel space.
    pub sys_time: f64,
    /// Seconds elapsed between start and exit.
    pub wall_time: f64,
    /// Peak resident memory, in KiB.
    pub memory: u64,
}

/// The outcome of an execution, delivered to the completion callbacks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    /// Status of the completed execution.
    pub status: ExecutionStatus,
    /// Whether the result was served from the response cache.
    pub was_cached: bool,
    /// Whether the process was killed by the sandbox or by a cancellation.
    pub was_killed: bool,
    /// Resources used by the process.
    pub resources: ResourceUsage,
}

impl Execution {
    /// Create an execution with default limits and `Always` caching.
    pub fn new<S: Into<String>, P: Into<PathBuf>>(description: S, executable: P) -> Execution {
        let description = description.into();
        let stdout = FileRef::new(format!("Stdout of '{}'", description));
        let stderr = FileRef::new(format!("Stderr of '{}'", description));
        Execution {
            description,
            executable: executable.into(),
            args: vec![],
            stdin: None,
            stdout,
            stderr,
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            limits: ResourceLimits::default(),
            extra_time: 0.0,
            exclusive: false,
            caching_mode: CachingMode::Always,
            die_on_error: false,
            keep_sandbox: false,
        }
    }

    /// Set the command line arguments, overwriting previous values.
    pub fn args<S: Into<String>, I: IntoIterator<Item = S>>(&mut self, args: I) -> &mut Self {
        self.args = args.into_iter().map(|s| s.into()).collect();
        self
    }

    /// Bind the standard input to a file.
    pub fn stdin<F: Into<FileId>>(&mut self, stdin: F) -> &mut Self {
        self.stdin = Some(stdin.into());
        self
    }

    /// Handle to the captured standard output.
    pub fn stdout(&self) -> FileRef {
        self.stdout.clone()
    }

    /// Handle to the captured standard error.
    pub fn stderr(&self) -> FileRef {
        self.stderr.clone()
    }

    /// Stage a file inside the sandbox under `name`.
    pub fn input<F: Into<FileId>, S: Into<String>>(
        &mut self,
        file: F,
        name: S,
        executable: bool,
    ) -> &mut Self {
        self.inputs.insert(
            name.into(),
            ExecutionInput {
                file: file.into(),
                executable,
            },
        );
        self
    }

    /// Declare an output of the execution with that name, returning its
    /// handle. Declaring the same name twice returns the same handle.
    pub fn output<S: Into<String>>(&mut self, name: S) -> FileRef {
        let name = name.into();
        let description = format!("Output of '{}' at {}", self.description, name);
        self.outputs
            .entry(name)
            .or_insert_with(|| FileRef::new(description))
            .clone()
    }

    /// Mutable access to the resource limits.
    pub fn limits_mut(&mut self) -> &mut ResourceLimits {
        &mut self.limits
    }

    /// Grant some extra time past the limits before the kill.
    pub fn extra_time(&mut self, extra_time: f64) -> &mut Self {
        self.extra_time = extra_time;
        self
    }

    /// Require sole ownership of the worker's cores.
    pub fn exclusive(&mut self, exclusive: bool) -> &mut Self {
        self.exclusive = exclusive;
        self
    }

    /// Set how the result may be reused across runs.
    pub fn caching_mode(&mut self, mode: CachingMode) -> &mut Self {
        self.caching_mode = mode;
        self
    }

    /// Abort the whole evaluation if this execution fails.
    pub fn die_on_error(&mut self, die_on_error: bool) -> &mut Self {
        self.die_on_error = die_on_error;
        self
    }

    /// Keep the sandbox directory after the run.
    pub fn keep_sandbox(&mut self, keep_sandbox: bool) -> &mut Self {
        self.keep_sandbox = keep_sandbox;
        self
    }

    /// Ids of all the files this execution depends on, including stdin.
    pub fn dependencies(&self) -> Vec<FileId> {
        let mut deps = vec![];
        if let Some(stdin) = self.stdin {
            deps.push(stdin);
        }
        for input in self.inputs.values() {
            deps.push(input.file);
        }
        deps
    }

    /// Ids of all the files this execution produces, including stdout and
    /// stderr.
    pub fn produces(&self) -> Vec<FileId> {
        let mut outs = vec![self.stdout.id, self.stderr.id];
        for output in self.outputs.values() {
            outs.push(output.id);
        }
        outs
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_dependencies_include_stdin_and_inputs() {
        let mut exec = Execution::new("test", "/bin/true");
        let stdin = FileRef::new("stdin");
        let input = FileRef::new("input");
        exec.stdin(&stdin);
        exec.input(&input, "data.txt", false);
        let mut deps = exec.dependencies();
        deps.sort_unstable();
        let mut expected = vec![stdin.id, input.id];
        expected.sort_unstable();
        assert_eq!(deps, expected);
    }

    #[test]
    fn test_produces_includes_stdout_stderr() {
        let mut exec = Execution::new("test", "/bin/true");
        let out = exec.output("result.txt");
        let produced = exec.produces();
        assert!(produced.contains(&exec.stdout.id));
        assert!(produced.contains(&exec.stderr.id));
        assert!(produced.contains(&out.id));
        assert_eq!(produced.len(), 3);
    }

    #[test]
    fn test_output_same_name_same_handle() {
        let mut exec = Execution::new("test", "/bin/true");
        let first = exec.output("out.txt");
        let second = exec.output("out.txt");
        assert_eq!(first.id, second.id);
        assert_eq!(exec.outputs.len(), 1);
    }

    #[test]
    fn test_limits_builder() {
        let mut exec = Execution::new("test", "/bin/true");
        exec.limits_mut().cpu_time(2.0).wall_time(3.0).memory(1024).processes(1);
        assert_eq!(exec.limits.cpu_time, Some(2.0));
        assert_eq!(exec.limits.wall_time, Some(3.0));
        assert_eq!(exec.limits.memory, Some(1024));
        assert_eq!(exec.limits.processes, Some(1));
        assert_eq!(exec.limits.stack, None);
    }

    #[test]
    fn test_input_executable_bit() {
        let mut exec = Execution::new("test", "/bin/true");
        let file = FileRef::new("bin");
        exec.input(&file, "solution", true);
        assert!(exec.inputs["solution"].executable);
    }
}
