use std::collections::HashMap;
use std::fmt::Formatter;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use taskgrade_dag::{Execution, FileId, ResourceLimits};
use taskgrade_store::FileStoreKey;

/// The fingerprint of a request: the SHA-256 digest of the canonical
/// serialization of everything that determines what the sandbox will observe.
///
/// Two requests that differ only in their declared output *names* share the
/// same fingerprint, since output names do not influence the run.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

/// The canonical view of a request that the fingerprint digests. Inputs are
/// sorted by their sandbox name so that map ordering cannot leak into the
/// digest.
#[derive(Serialize)]
struct CanonicalRequest<'a> {
    executable: &'a std::path::Path,
    args: &'a [String],
    stdin: Option<&'a FileStoreKey>,
    inputs: Vec<(&'a String, &'a FileStoreKey, bool)>,
    limits: &'a ResourceLimits,
    extra_time: f64,
    exclusive: bool,
}

impl Fingerprint {
    /// Compute the fingerprint of an execution given the content hashes of
    /// its input files.
    ///
    /// Panics if a dependency of the execution is missing from `file_keys`;
    /// the driver only fingerprints runnable executions.
    pub fn of(execution: &Execution, file_keys: &HashMap<FileId, FileStoreKey>) -> Fingerprint {
        let canonical = CanonicalRequest {
            executable: &execution.executable,
            args: &execution.args,
            stdin: execution.stdin.as_ref().map(|id| &file_keys[id]),
            inputs: execution
                .inputs
                .iter()
                .map(|(name, input)| (name, &file_keys[&input.file], input.executable))
                .sorted()
                .collect(),
            limits: &execution.limits,
            extra_time: execution.extra_time,
            exclusive: execution.exclusive,
        };
        let serialized =
            bincode::serialize(&canonical).expect("Cannot serialize request fingerprint");
        let mut hasher = Sha256::new();
        hasher.update(&serialized);
        Fingerprint(hasher.finalize().into())
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_string())
    }
}

/// The key of a cache entry: the request fingerprint, optionally scoped to a
/// single executor identity (for `CachingMode::SameExecutor`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// The request fingerprint.
    pub fingerprint: Fingerprint,
    /// The executor identity the entry is bound to, if any.
    pub scope: Option<String>,
}

impl CacheKey {
    /// A key valid on any executor.
    pub fn global(fingerprint: Fingerprint) -> CacheKey {
        CacheKey {
            fingerprint,
            scope: None,
        }
    }

    /// A key bound to the given executor identity.
    pub fn scoped<S: Into<String>>(fingerprint: Fingerprint, executor: S) -> CacheKey {
        CacheKey {
            fingerprint,
            scope: Some(executor.into()),
        }
    }
}
