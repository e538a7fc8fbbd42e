use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Error};

use taskgrade_store::FileStore;

use crate::sandbox::Sandbox;
use crate::ExecError;

/// Counters of the admission policy.
#[derive(Debug, Default)]
struct AdmissionState {
    /// Cores currently admitted. Equals `max_threads` while an exclusive job
    /// holds the guard.
    cur_threads: usize,
}

/// The process-wide context of an executor: the file store, the scratch
/// directory for sandboxes, the core budget and the selected sandbox
/// backend.
///
/// Threading it by explicit reference keeps components decoupled and lets
/// tests instantiate parallel environments.
pub struct Environment {
    /// The local blob store.
    pub store: Arc<FileStore>,
    /// Directory the sandbox scratch directories are created in.
    pub sandbox_dir: PathBuf,
    /// Number of cores available for admissions.
    pub num_cores: usize,
    /// The sandbox backend used to run the processes.
    pub sandbox: Arc<dyn Sandbox>,
    /// The admission counters.
    admission: Mutex<AdmissionState>,
}

/// An admission slot of the core budget, held while a sandbox runs. Dropping
/// the guard releases the slot on every exit path, panics included.
pub struct ThreadGuard<'a> {
    /// The environment owning the counters.
    env: &'a Environment,
    /// Whether this admission owns the whole budget.
    exclusive: bool,
}

impl Environment {
    /// Build an environment. A `num_cores` of 0 means autodetection.
    pub fn new<P: Into<PathBuf>>(
        store: Arc<FileStore>,
        sandbox_dir: P,
        num_cores: usize,
        sandbox: Arc<dyn Sandbox>,
    ) -> Result<Environment, Error> {
        let sandbox_dir = sandbox_dir.into();
        std::fs::create_dir_all(&sandbox_dir).with_context(|| {
            format!(
                "Failed to create sandbox directory at {}",
                sandbox_dir.display()
            )
        })?;
        let num_cores = if num_cores == 0 {
            num_cpus::get()
        } else {
            num_cores
        };
        Ok(Environment {
            store,
            sandbox_dir,
            num_cores,
            sandbox,
            admission: Mutex::new(AdmissionState::default()),
        })
    }

    /// Try to acquire an admission slot. An exclusive admission succeeds only
    /// when no other job is running and blocks all the others until
    /// released; a shared one succeeds while there is budget left. On
    /// refusal the caller gets [`ExecError::Busy`] and should retry on a
    /// different worker.
    pub fn try_admit(&self, exclusive: bool) -> Result<ThreadGuard, ExecError> {
        let mut admission = self.admission.lock().unwrap();
        if exclusive {
            if admission.cur_threads != 0 {
                return Err(ExecError::Busy);
            }
            admission.cur_threads = self.num_cores;
        } else {
            if admission.cur_threads >= self.num_cores {
                return Err(ExecError::Busy);
            }
            admission.cur_threads += 1;
        }
        Ok(ThreadGuard {
            env: self,
            exclusive,
        })
    }

    /// Cores currently admitted.
    pub fn admitted_cores(&self) -> usize {
        self.admission.lock().unwrap().cur_threads
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("sandbox_dir", &self.sandbox_dir)
            .field("num_cores", &self.num_cores)
            .field("admitted", &self.admitted_cores())
            .finish()
    }
}

impl Drop for ThreadGuard<'_> {
    fn drop(&mut self) {
        let mut admission = self.env.admission.lock().unwrap();
        if self.exclusive {
            admission.cur_threads = 0;
        } else {
            admission.cur_threads -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::sandbox::EchoSandbox;

    use super::*;

    fn env(dir: &TempDir, num_cores: usize) -> Environment {
        let store = Arc::new(FileStore::new(dir.path().join("store"), 1 << 30, 1 << 30).unwrap());
        Environment::new(store, dir.path().join("tmp"), num_cores, Arc::new(EchoSandbox)).unwrap()
    }

    #[test]
    fn test_admission_up_to_budget() {
        let dir = TempDir::new().unwrap();
        let env = env(&dir, 2);
        let first = env.try_admit(false).unwrap();
        let _second = env.try_admit(false).unwrap();
        assert!(matches!(env.try_admit(false), Err(ExecError::Busy)));
        drop(first);
        let _third = env.try_admit(false).unwrap();
    }

    #[test]
    fn test_exclusive_requires_idle() {
        let dir = TempDir::new().unwrap();
        let env = env(&dir, 4);
        let shared = env.try_admit(false).unwrap();
        assert!(matches!(env.try_admit(true), Err(ExecError::Busy)));
        drop(shared);
        let exclusive = env.try_admit(true).unwrap();
        assert_eq!(env.admitted_cores(), 4);
        assert!(matches!(env.try_admit(false), Err(ExecError::Busy)));
        drop(exclusive);
        assert_eq!(env.admitted_cores(), 0);
    }

    #[test]
    fn test_guard_released_on_panic() {
        let dir = TempDir::new().unwrap();
        let env = Arc::new(env(&dir, 1));
        let env2 = env.clone();
        let _ = std::thread::spawn(move || {
            let _guard = env2.try_admit(false).unwrap();
            panic!("boom");
        })
        .join();
        assert_eq!(env.admitted_cores(), 0);
        let _guard = env.try_admit(false).unwrap();
    }

    #[test]
    fn test_autodetect_cores() {
        let dir = TempDir::new().unwrap();
        let env = env(&dir, 0);
        assert!(env.num_cores >= 1);
    }
}
