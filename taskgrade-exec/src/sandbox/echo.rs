use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use crate::sandbox::{ExecutionInfo, ExecutionOptions, Sandbox, SandboxError};

/// A backend that does not run anything: it prints the command it would
/// execute and reports an immediate successful exit with zero resource
/// usage. Useful to inspect what a graph would run.
#[derive(Debug, Default)]
pub struct EchoSandbox;

impl Sandbox for EchoSandbox {
    fn execute(
        &self,
        options: &ExecutionOptions,
        _pid: Arc<AtomicU32>,
    ) -> Result<ExecutionInfo, SandboxError> {
        let mut command = options.executable.display().to_string();
        for arg in &options.args {
            command.push(' ');
            command.push_str(arg);
        }
        println!("[echo] executing {}", command);
        println!("[echo] inside {}", options.root.display());
        Ok(ExecutionInfo::default())
    }
}
