//! The response cache: executions whose command, inputs and limits match a
//! previous run are answered from here without touching a sandbox.
//!
//! Entries are addressed by a [`Fingerprint`] of the request (command,
//! arguments, input hashes and executable bits, limits, exclusivity —
//! declared output *names* are excluded). Under
//! `CachingMode::SameExecutor` the key additionally carries the executor
//! identity, so an entry produced by one worker is invisible to the others.
//!
//! A hit is only served while every blob it references is still in the file
//! store: an entry whose blobs were evicted is dropped on lookup, since no
//! executor can regenerate them. Responses reporting an executor failure
//! (`InternalError`) are never stored — a transient infrastructure failure
//! must not poison the cache.
//!
//! The cache is persisted on drop, framed by a magic string and the crate
//! version; entries therefore survive restarts (including `SameExecutor`
//! entries, which are scoped by worker name). Use [`Cache::ephemeral`] for
//! the in-memory behavior.

#![deny(missing_docs)]

#[macro_use]
extern crate log;

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Error;
use serde::{Deserialize, Serialize};

use taskgrade_dag::{ExecutionResult, ExecutionStatus};
use taskgrade_store::{FileStore, FileStoreHandle, FileStoreKey};

pub use key::{CacheKey, Fingerprint};

mod key;
mod storage;

/// The name of the file holding the persisted cache.
const CACHE_FILE: &str = "cache.bin";

/// A cached response: the outcome of the execution and the hashes of every
/// file it produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    /// The outcome of the execution.
    pub result: ExecutionResult,
    /// Hash of the captured standard output.
    pub stdout: FileStoreKey,
    /// Hash of the captured standard error.
    pub stderr: FileStoreKey,
    /// Hashes of the declared outputs, by sandbox name.
    pub outputs: HashMap<String, FileStoreKey>,
}

/// A served cache hit: the stored entry plus handles pinning every referenced
/// blob in the store for as long as the caller needs them.
#[derive(Debug)]
pub struct CacheHit {
    /// The stored entry.
    pub entry: CacheEntry,
    /// Handle to the stdout blob.
    pub stdout: FileStoreHandle,
    /// Handle to the stderr blob.
    pub stderr: FileStoreHandle,
    /// Handles to the declared outputs, by sandbox name.
    pub outputs: HashMap<String, FileStoreHandle>,
}

/// The outcome of a cache lookup.
#[derive(Debug)]
pub enum CacheResult {
    /// No valid entry for the key.
    Miss,
    /// A valid entry, with all its blobs pinned.
    Hit(CacheHit),
}

/// The cache of execution responses, persisted to disk unless ephemeral.
#[derive(Debug)]
pub struct Cache {
    /// All the cached entries.
    entries: HashMap<CacheKey, CacheEntry>,
    /// Where to persist the entries; `None` for an ephemeral cache.
    cache_file: Option<PathBuf>,
}

impl Cache {
    /// Open the cache persisted inside `cache_dir`, starting empty if there
    /// is no valid cache file.
    pub fn new<P: Into<PathBuf>>(cache_dir: P) -> Result<Cache, Error> {
        let cache_file = cache_dir.into().join(CACHE_FILE);
        let entries = if cache_file.exists() {
            match storage::load(&cache_file) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Discarding invalid cache file: {:?}", e);
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };
        Ok(Cache {
            entries,
            cache_file: Some(cache_file),
        })
    }

    /// An in-memory cache that is lost when dropped.
    pub fn ephemeral() -> Cache {
        Cache {
            entries: HashMap::new(),
            cache_file: None,
        }
    }

    /// Whether a result is allowed into the cache. Executor failures are
    /// transient and must not be replayed.
    pub fn is_cacheable(result: &ExecutionResult) -> bool {
        !matches!(result.status, ExecutionStatus::InternalError(_))
    }

    /// Store an entry under `key`. Entries with an uncacheable result are
    /// silently rejected.
    pub fn insert(&mut self, key: CacheKey, entry: CacheEntry) {
        if !Self::is_cacheable(&entry.result) {
            debug!(
                "Rejecting cache entry for {} because of {:?}",
                key.fingerprint, entry.result.status
            );
            return;
        }
        self.entries.insert(key, entry);
    }

    /// Look up `key`, pinning the referenced blobs in `store`. An entry
    /// referencing a blob no longer in the store is removed and reported as
    /// a miss.
    pub fn get(&mut self, key: &CacheKey, store: &FileStore) -> CacheResult {
        let entry = match self.entries.get(key) {
            Some(entry) => entry,
            None => return CacheResult::Miss,
        };
        let hit = (|| {
            let stdout = store.get(&entry.stdout)?;
            let stderr = store.get(&entry.stderr)?;
            let mut outputs = HashMap::new();
            for (name, hash) in entry.outputs.iter() {
                outputs.insert(name.clone(), store.get(hash)?);
            }
            Some(CacheHit {
                entry: entry.clone(),
                stdout,
                stderr,
                outputs,
            })
        })();
        match hit {
            Some(hit) => CacheResult::Hit(hit),
            None => {
                debug!(
                    "Dropping cache entry for {}: a referenced blob is gone",
                    key.fingerprint
                );
                self.entries.remove(key);
                CacheResult::Miss
            }
        }
    }

    /// Remove the entry under `key`, if any. Used when a hit turns out to be
    /// unusable downstream (a referenced blob cannot be materialized).
    pub fn invalidate(&mut self, key: &CacheKey) {
        self.entries.remove(key);
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        if let Some(path) = &self.cache_file {
            if let Err(e) = storage::save(path, &self.entries) {
                error!("Cannot save the cache file: {:?}", e);
            }
        }
    }
}
