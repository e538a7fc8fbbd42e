use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::SystemTime;

use anyhow::{bail, Context, Error};
use serde::{Deserialize, Serialize};

use crate::{FileStore, FileStoreKey, PinnedBlobs};

/// Magic string prepended to the index file, rejecting foreign files.
const MAGIC: &[u8] = b"taskgrade-store-index";
/// Changing the crate version invalidates the on-disk index, so any breaking
/// change to the format has to go through a version bump.
const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Maximum number of bytes reserved for the version string.
const VERSION_MAX_LEN: usize = 16;

/// Bookkeeping for a single blob known to the store.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
struct BlobStat {
    /// Size of the blob in bytes.
    size: u64,
    /// Last time the blob was stored or fetched.
    last_access: SystemTime,
}

/// Index of all the blobs in the store, tracking sizes and access times so
/// that the least-recently-used blobs can be evicted when the store grows past
/// its quota.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct BlobIndex {
    /// Sum of the sizes of all known blobs.
    total_size: u64,
    /// Per-blob statistics.
    blobs: HashMap<FileStoreKey, BlobStat>,
}

impl BlobIndex {
    /// Load the index from `path`, starting empty if the file does not exist
    /// or carries a stale format.
    pub(crate) fn load<P: AsRef<Path>>(path: P) -> Result<BlobIndex, Error> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("No index at {}, starting empty", path.display());
            return Ok(BlobIndex {
                total_size: 0,
                blobs: HashMap::new(),
            });
        }
        let mut file = File::open(path)
            .with_context(|| format!("Failed to open index at {}", path.display()))?;
        let mut header = [0u8; MAGIC.len() + VERSION_MAX_LEN];
        file.read_exact(&mut header)
            .context("Failed to read index header")?;
        if &header[..MAGIC.len()] != MAGIC {
            bail!("Index magic mismatch at {}", path.display());
        }
        if &header[MAGIC.len()..MAGIC.len() + VERSION.len()] != VERSION.as_bytes() {
            warn!("Index version mismatch, discarding {}", path.display());
            return Ok(BlobIndex {
                total_size: 0,
                blobs: HashMap::new(),
            });
        }
        bincode::deserialize_from(file).context("Failed to deserialize index")
    }

    /// Atomically write a snapshot of the index to `path`.
    pub(crate) fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        let mut file = File::create(&tmp)
            .with_context(|| format!("Failed to create index at {}", tmp.display()))?;
        let mut header = [0u8; MAGIC.len() + VERSION_MAX_LEN];
        header[..MAGIC.len()].clone_from_slice(MAGIC);
        header[MAGIC.len()..MAGIC.len() + VERSION.len()].clone_from_slice(VERSION.as_bytes());
        file.write_all(&header)
            .context("Failed to write index header")?;
        bincode::serialize_into(file, self).context("Failed to serialize index")?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to move {} -> {}", tmp.display(), path.display()))?;
        Ok(())
    }

    /// Record an access to a known blob, moving it to the most-recent position
    /// of the eviction order.
    pub(crate) fn touch(&mut self, key: &FileStoreKey) {
        if let Some(stat) = self.blobs.get_mut(key) {
            stat.last_access = SystemTime::now();
        }
    }

    /// Register a blob. Registering a known hash only bumps its access time.
    pub(crate) fn register(&mut self, key: FileStoreKey, size: u64) {
        use std::collections::hash_map::Entry;
        match self.blobs.entry(key) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().last_access = SystemTime::now();
            }
            Entry::Vacant(entry) => {
                entry.insert(BlobStat {
                    size,
                    last_access: SystemTime::now(),
                });
                self.total_size += size;
            }
        }
    }

    /// Whether the store grew past its quota.
    pub(crate) fn over_quota(&self, quota: u64) -> bool {
        self.total_size >= quota
    }

    /// Evict least-recently-used blobs until the total size drops to
    /// `target_size`. Blobs with live handles are never evicted. Eviction
    /// physically removes the file from the store.
    pub(crate) fn evict(
        &mut self,
        store: &FileStore,
        pinned: &PinnedBlobs,
        target_size: u64,
    ) -> Result<(), Error> {
        debug!(
            "Evicting blobs: {} KiB -> at most {} KiB",
            self.total_size / 1024,
            target_size / 1024
        );
        let mut by_age: Vec<(FileStoreKey, BlobStat)> = self.blobs.drain().collect();
        // oldest last, so eviction candidates pop cheaply
        by_age.sort_by(|a, b| b.1.last_access.cmp(&a.1.last_access));
        let mut reclaimed = 0;
        while self.total_size > target_size {
            let (key, stat) = match by_age.pop() {
                Some(entry) => entry,
                None => break,
            };
            if pinned.is_pinned(&key) {
                self.blobs.insert(key, stat);
                continue;
            }
            self.total_size -= stat.size;
            reclaimed += stat.size;
            let path = store.blob_path(&key);
            trace!("Evicting {} ({} KiB)", path.display(), stat.size / 1024);
            if let Err(e) = FileStore::remove_blob(&path) {
                warn!("Cannot evict {}: {:?}", path.display(), e);
            }
            // drop the shard directory if this was its last blob
            if let Some(shard) = path.parent() {
                let _ = std::fs::remove_dir(shard);
            }
        }
        debug!("Reclaimed {} KiB", reclaimed / 1024);
        for (key, stat) in by_age {
            self.blobs.insert(key, stat);
        }
        Ok(())
    }
}
