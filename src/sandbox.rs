use std::io::Write;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use anyhow::{Context, Error};

use taskgrade_dag::ResourceLimits;
use taskgrade_exec::sandbox::{ExecutionOptions, Sandbox, SandboxRegistry};

use crate::opt::{GlobalOpt, SandboxOpt};

/// Entry point of the `sandbox` subcommand: run one command inside the
/// selected backend, forward its captured streams and print the resource
/// usage as JSON.
pub fn main(global: &GlobalOpt, opt: &SandboxOpt) -> Result<(), Error> {
    let registry = SandboxRegistry::with_builtins();
    let sandbox = registry
        .get(&opt.sandbox)
        .with_context(|| format!("Unknown sandbox backend {:?}", opt.sandbox))?;

    let scratch = tempfile::TempDir::new_in(ensured(&global.temp_dir())?)
        .context("Cannot create the sandbox directory")?;
    let root = scratch.path().join("box");
    std::fs::create_dir_all(&root).context("Cannot create the sandbox root")?;
    let mut limits = ResourceLimits::new();
    if let Some(cpu_time) = opt.cpu_time {
        limits.cpu_time(cpu_time);
    }
    if let Some(wall_time) = opt.wall_time {
        limits.wall_time(wall_time);
    }
    if let Some(memory) = opt.memory {
        limits.memory(memory);
    }
    let options = ExecutionOptions {
        root,
        executable: opt.command.clone(),
        args: opt.args.clone(),
        stdin_file: None,
        stdout_file: scratch.path().join("stdout"),
        stderr_file: scratch.path().join("stderr"),
        limits,
        extra_time: 0.0,
        exclusive: false,
    };
    let info = sandbox
        .execute(&options, Arc::new(AtomicU32::new(0)))
        .context("The sandbox failed")?;

    std::io::stdout().write_all(&std::fs::read(&options.stdout_file)?)?;
    std::io::stderr().write_all(&std::fs::read(&options.stderr_file)?)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&info).context("Cannot serialize the outcome")?
    );
    Ok(())
}

/// Create the directory if needed and hand it back.
fn ensured(path: &std::path::Path) -> Result<&std::path::Path, Error> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Cannot create {}", path.display()))?;
    Ok(path)
}
