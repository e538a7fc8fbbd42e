use std::path::Path;

use anyhow::{Context, Error};
use nix::unistd::{fork, setsid, ForkResult};

/// Detach from the controlling terminal with the usual double fork, then
/// write the pidfile of the surviving process.
pub fn daemonize(pidfile: Option<&Path>) -> Result<(), Error> {
    // SAFETY: the process is still single-purpose here, no other thread has
    // been spawned yet
    match unsafe { fork() }.context("First fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    setsid().context("setsid failed")?;
    match unsafe { fork() }.context("Second fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    if let Some(pidfile) = pidfile {
        write_pidfile(pidfile)?;
    }
    Ok(())
}

/// Write the PID of this process to `path`.
pub fn write_pidfile(path: &Path) -> Result<(), Error> {
    std::fs::write(path, format!("{}\n", std::process::id()))
        .with_context(|| format!("Cannot write pidfile at {}", path.display()))?;
    Ok(())
}
