use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::libc;
use nix::sys::resource::{setrlimit, Resource, RLIM_INFINITY};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::detect_exe::detect_exe;
use crate::sandbox::{ExecutionInfo, ExecutionOptions, Sandbox, SandboxError};

/// A backend that spawns the real command with POSIX rlimits and a
/// wall-clock watchdog, without any isolation. The process runs as the
/// current user inside the sandbox root: do not feed it untrusted code.
///
/// The cpu limit is enforced with `RLIMIT_CPU` (rounded up to whole
/// seconds, extra time included), the wall limit by a watchdog thread that
/// kills the process. Resource usage is read back with `wait4`.
#[derive(Debug, Default)]
pub struct ProcessSandbox;

impl Sandbox for ProcessSandbox {
    fn execute(
        &self,
        options: &ExecutionOptions,
        pid_slot: Arc<AtomicU32>,
    ) -> Result<ExecutionInfo, SandboxError> {
        let executable = resolve_executable(options)?;
        match detect_exe(&executable) {
            Err(e) => return Err(SandboxError::Setup(format!("{:?}", e))),
            Ok(None) => {
                return Err(SandboxError::NotExecutable(format!(
                    "{} is not in a runnable format, missing shebang?",
                    executable.display()
                )))
            }
            Ok(Some(_)) => {}
        }

        let mut command = Command::new(&executable);
        command.args(&options.args).current_dir(&options.root);
        match &options.stdin_file {
            Some(path) => {
                let file = std::fs::File::open(path)
                    .map_err(|e| SandboxError::Setup(format!("Cannot open stdin: {}", e)))?;
                command.stdin(Stdio::from(file));
            }
            None => {
                command.stdin(Stdio::null());
            }
        }
        let stdout = std::fs::File::create(&options.stdout_file)
            .map_err(|e| SandboxError::Setup(format!("Cannot create stdout: {}", e)))?;
        let stderr = std::fs::File::create(&options.stderr_file)
            .map_err(|e| SandboxError::Setup(format!("Cannot create stderr: {}", e)))?;
        command.stdout(Stdio::from(stdout));
        command.stderr(Stdio::from(stderr));

        let limits = options.limits.clone();
        let extra_time = options.extra_time;
        unsafe {
            command.pre_exec(move || apply_rlimits(&limits, extra_time));
        }

        let start = Instant::now();
        let child = command.spawn().map_err(|e| {
            if e.raw_os_error() == Some(libc::ENOEXEC) {
                SandboxError::NotExecutable(format!("{}: {}", executable.display(), e))
            } else {
                SandboxError::Setup(format!("Cannot spawn {}: {}", executable.display(), e))
            }
        })?;
        let pid = child.id();
        pid_slot.store(pid, Ordering::SeqCst);

        // watchdog enforcing the wall clock limit
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
        if let Some(wall) = options.limits.wall_time {
            let deadline = Duration::from_secs_f64(wall + options.extra_time);
            std::thread::Builder::new()
                .name(format!("Wall watchdog of pid {}", pid))
                .spawn(move || {
                    if done_rx.recv_timeout(deadline).is_err() {
                        warn!("Process {} exceeded the wall limit, killing it", pid);
                        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
                    }
                })
                .map_err(|e| SandboxError::Setup(format!("Cannot spawn watchdog: {}", e)))?;
        }

        let (status, rusage) = wait_child(pid as i32)?;
        let _ = done_tx.send(());
        drop(child);

        let wall_time_millis = start.elapsed().as_millis() as u64;
        let (status_code, signal) = if libc::WIFEXITED(status) {
            (libc::WEXITSTATUS(status) as u32, 0)
        } else if libc::WIFSIGNALED(status) {
            (0, libc::WTERMSIG(status) as u32)
        } else {
            return Err(SandboxError::Setup(format!(
                "Unexpected wait status {:#x} for pid {}",
                status, pid
            )));
        };
        Ok(ExecutionInfo {
            cpu_time_millis: timeval_millis(rusage.ru_utime),
            sys_time_millis: timeval_millis(rusage.ru_stime),
            wall_time_millis,
            memory_usage_kb: max_rss_kb(&rusage),
            status_code,
            signal,
        })
    }
}

/// Where the executable actually lives: absolute paths are used as-is, names
/// staged inside the sandbox win over `$PATH` lookup.
fn resolve_executable(options: &ExecutionOptions) -> Result<std::path::PathBuf, SandboxError> {
    if options.executable.is_absolute() {
        return Ok(options.executable.clone());
    }
    let staged = options.root.join(&options.executable);
    if staged.is_file() {
        return Ok(staged);
    }
    which::which(&options.executable).map_err(|_| {
        SandboxError::Setup(format!(
            "Executable {} not found",
            options.executable.display()
        ))
    })
}

/// Install the resource limits in the child, between fork and exec.
fn apply_rlimits(
    limits: &taskgrade_dag::ResourceLimits,
    extra_time: f64,
) -> std::io::Result<()> {
    let set = |resource: Resource, soft: u64, hard: u64| {
        setrlimit(resource, soft, hard)
            .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
    };
    if let Some(cpu) = limits.cpu_time {
        let secs = (cpu + extra_time).ceil() as u64;
        // one extra second of hard limit so SIGKILL follows an ignored SIGXCPU
        set(Resource::RLIMIT_CPU, secs, secs + 1)?;
    }
    if let Some(memory) = limits.memory {
        set(Resource::RLIMIT_AS, memory * 1024, memory * 1024)?;
    }
    if let Some(nfiles) = limits.nfiles {
        set(Resource::RLIMIT_NOFILE, nfiles as u64, nfiles as u64)?;
    }
    if let Some(procs) = limits.processes {
        set(Resource::RLIMIT_NPROC, procs as u64, procs as u64)?;
    }
    if let Some(fsize) = limits.fsize {
        set(Resource::RLIMIT_FSIZE, fsize * 1024, fsize * 1024)?;
    }
    if let Some(mlock) = limits.mlock {
        set(Resource::RLIMIT_MEMLOCK, mlock * 1024, mlock * 1024)?;
    }
    if let Some(stack) = limits.stack {
        let bytes = if stack == 0 { RLIM_INFINITY } else { stack * 1024 };
        set(Resource::RLIMIT_STACK, bytes, bytes)?;
    }
    Ok(())
}

/// Reap the child, retrying on EINTR, returning the raw wait status and the
/// resource usage.
fn wait_child(pid: i32) -> Result<(i32, libc::rusage), SandboxError> {
    let mut status: libc::c_int = 0;
    let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        let ret = unsafe { libc::wait4(pid, &mut status, 0, &mut rusage) };
        if ret == pid {
            return Ok((status, rusage));
        }
        let errno = std::io::Error::last_os_error();
        if errno.raw_os_error() != Some(libc::EINTR) {
            return Err(SandboxError::Setup(format!(
                "wait4 failed for pid {}: {}",
                pid, errno
            )));
        }
    }
}

fn timeval_millis(tv: libc::timeval) -> u64 {
    tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000
}

/// Peak resident set size in KiB. Linux reports `ru_maxrss` in KiB already,
/// macos in bytes.
fn max_rss_kb(rusage: &libc::rusage) -> u64 {
    #[cfg(target_os = "macos")]
    {
        rusage.ru_maxrss as u64 / 1024
    }
    #[cfg(not(target_os = "macos"))]
    {
        rusage.ru_maxrss as u64
    }
}
