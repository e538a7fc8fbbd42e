//! Content-addressed file store shared by managers, servers and workers.
//!
//! Blobs are keyed by the SHA-256 of their content and laid out on disk as
//! `store-dir/<hh>/<full-hex>` where `hh` is the first hex byte of the hash.
//! A blob is written at most once: identical content reuses the existing
//! file, and a partially-written blob is never observable at its final path.
//!
//! The store keeps an LRU index of blob sizes and access times; when the
//! total size grows past the configured quota the least-recently-used blobs
//! are evicted, except those with live [`FileStoreHandle`]s. Access to the
//! store directory is exclusive between processes via a lock file.

#![deny(missing_docs)]

#[macro_use]
extern crate log;

use std::collections::HashMap;
use std::fmt::Formatter;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Error};
use fslock::LockFile;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

pub use chunks::FileChunkIterator;
use index::BlobIndex;

mod chunks;
mod index;

/// Maximum number of bytes of a blob chunk, both on disk reads and on the
/// wire. Blobs of at most this size may travel inline inside a message.
pub const CHUNK_SIZE: usize = 32 * 1024;

/// The name of the lock file guarding the store directory.
const STORE_LOCK_FILE: &str = "store.lock";
/// The name of the index snapshot inside the store directory.
const STORE_INDEX_FILE: &str = "index.bin";

/// SHA-256 content address of a blob. Ordered by byte comparison and printed
/// as 64 hex characters.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileStoreKey {
    /// The raw hash bytes.
    hash: [u8; 32],
}

/// Ref counts of the blobs with live handles; those blobs are never evicted.
#[derive(Debug, Default)]
pub(crate) struct PinnedBlobs {
    /// Map from a blob key to the number of live handles.
    ref_counts: HashMap<FileStoreKey, usize>,
}

impl PinnedBlobs {
    /// Whether at least one handle to the blob is alive.
    pub(crate) fn is_pinned(&self, key: &FileStoreKey) -> bool {
        self.ref_counts.contains_key(key)
    }
}

/// A content-addressed blob store rooted at a directory on the local disk.
#[derive(Debug)]
pub struct FileStore {
    /// Root directory of the store.
    base_path: PathBuf,
    /// Lock keeping the store directory exclusive to this process.
    _lock: LockFile,
    /// Blobs protected from eviction by live handles.
    pub(crate) pinned: Arc<Mutex<PinnedBlobs>>,
    /// The LRU index of known blobs.
    pub(crate) index: Arc<Mutex<BlobIndex>>,
    /// Size at which eviction starts.
    max_store_size: u64,
    /// Target size after an eviction pass.
    min_store_size: u64,
}

/// Handle to a blob inside the store. The blob will not be evicted while at
/// least one handle to it is alive. Cloning the handle extends the lifetime
/// of the blob.
#[derive(Debug)]
pub struct FileStoreHandle {
    /// The key of the blob.
    key: FileStoreKey,
    /// The path of the blob on disk.
    path: PathBuf,
    /// Shared ref counts, used to unpin on drop.
    pinned: Arc<Mutex<PinnedBlobs>>,
}

impl FileStore {
    /// Open (or create) the store rooted at `base_path`. Blocks if another
    /// process holds the store lock. Eviction starts when the total size of
    /// the blobs exceeds `max_store_size` and stops at `min_store_size`.
    pub fn new<P: Into<PathBuf>>(
        base_path: P,
        max_store_size: u64,
        min_store_size: u64,
    ) -> Result<FileStore, Error> {
        let base_path = base_path.into();
        debug!("Opening file store at {}", base_path.display());
        std::fs::create_dir_all(&base_path).with_context(|| {
            format!("Failed to create store directory at {}", base_path.display())
        })?;
        let lock_path = base_path.join(STORE_LOCK_FILE);
        let mut lock = LockFile::open(lock_path.as_os_str())
            .with_context(|| format!("Failed to open lock file at {}", lock_path.display()))?;
        if !lock.try_lock().context("Failed to lock the store")? {
            warn!("Store at {} is locked, waiting", base_path.display());
            lock.lock().context("Failed to lock the store")?;
        }
        let index = BlobIndex::load(base_path.join(STORE_INDEX_FILE))
            .context("Failed to load the store index")?;
        Ok(FileStore {
            base_path,
            _lock: lock,
            pinned: Arc::new(Mutex::new(PinnedBlobs::default())),
            index: Arc::new(Mutex::new(index)),
            max_store_size,
            min_store_size,
        })
    }

    /// Consume an iterator of chunks, writing the blob to disk if not already
    /// present. If the blob is already present the iterator is still drained
    /// but the file is not rewritten. Returns a handle keeping the blob
    /// alive.
    pub fn store<I>(&self, key: &FileStoreKey, content: I) -> Result<FileStoreHandle, Error>
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        let path = self.blob_path(key);
        // pin before writing so a concurrent eviction cannot race us
        let handle = FileStoreHandle::new(self, key);
        if path.exists() {
            trace!("Blob {} already present", key);
            content.into_iter().last();
            self.index.lock().unwrap().touch(key);
            return Ok(handle);
        }
        let shard = path.parent().context("Invalid blob path")?;
        std::fs::create_dir_all(shard)
            .with_context(|| format!("Cannot create shard directory {}", shard.display()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(shard)
            .context("Failed to create temporary blob file")?;
        for chunk in content {
            tmp.write_all(&chunk).context("Failed to write blob chunk")?;
        }
        let size = tmp.as_file().metadata().map(|m| m.len()).unwrap_or(0);
        // the rename makes the blob atomically visible; a concurrent writer
        // of the same hash produced identical bytes, so either copy wins
        tmp.persist(&path)
            .with_context(|| format!("Failed to persist blob at {}", path.display()))?;
        Self::mark_readonly(&path)?;
        {
            let mut index = self.index.lock().unwrap();
            index.register(key.clone(), size);
            if index.over_quota(self.max_store_size) {
                let pinned = self.pinned.lock().unwrap();
                index
                    .evict(self, &pinned, self.min_store_size)
                    .context("Failed to evict blobs")?;
            }
            index
                .save(self.base_path.join(STORE_INDEX_FILE))
                .context("Failed to save the store index")?;
        }
        Ok(handle)
    }

    /// Return a handle to the blob with that key, or `None` if it is not in
    /// the store.
    pub fn get(&self, key: &FileStoreKey) -> Option<FileStoreHandle> {
        if !self.blob_path(key).exists() {
            return None;
        }
        self.index.lock().unwrap().touch(key);
        Some(FileStoreHandle::new(self, key))
    }

    /// Whether the blob with that key is present in the store.
    pub fn has_key(&self, key: &FileStoreKey) -> bool {
        self.blob_path(key).exists()
    }

    /// The path of the blob on disk: `<store>/<hh>/<full-hex>`.
    pub(crate) fn blob_path(&self, key: &FileStoreKey) -> PathBuf {
        self.base_path.join(key.shard()).join(key.to_string())
    }

    /// Root directory of the store.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Strip the write bit from a stored blob.
    fn mark_readonly(path: &Path) -> Result<(), Error> {
        let mut perms = std::fs::metadata(path)
            .with_context(|| format!("Failed to stat {}", path.display()))?
            .permissions();
        perms.set_readonly(true);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("Failed to chmod {}", path.display()))?;
        Ok(())
    }

    /// Remove a read-only blob from disk.
    pub(crate) fn remove_blob(path: &Path) -> Result<(), Error> {
        let mut perms = std::fs::metadata(path)
            .with_context(|| format!("Failed to stat {}", path.display()))?
            .permissions();
        #[allow(clippy::permissions_set_readonly_false)]
        perms.set_readonly(false);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("Failed to chmod {}", path.display()))?;
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove {}", path.display()))?;
        Ok(())
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        if let Ok(index) = self.index.lock() {
            if let Err(e) = index.save(self.base_path.join(STORE_INDEX_FILE)) {
                warn!("Cannot save the store index: {:?}", e);
            }
        }
    }
}

/// Size of the file at `path`, or `None` if it does not exist. This is the
/// canonical existence test for a blob.
pub fn file_size<P: AsRef<Path>>(path: P) -> Option<u64> {
    std::fs::metadata(path.as_ref()).ok().map(|m| m.len())
}

/// Copy `from` to `to`, hardlinking when possible. The two paths may share
/// the underlying data, so callers must not mutate either copy in place.
pub fn cheap_copy<P: AsRef<Path>, Q: AsRef<Path>>(from: P, to: Q) -> Result<(), Error> {
    let (from, to) = (from.as_ref(), to.as_ref());
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    if std::fs::hard_link(from, to).is_err() {
        std::fs::copy(from, to)
            .with_context(|| format!("Failed to copy {} -> {}", from.display(), to.display()))?;
    }
    Ok(())
}

impl FileStoreKey {
    /// Compute the key of the file at `path` with a streaming read.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<FileStoreKey, Error> {
        let path = path.as_ref();
        if !path.exists() {
            bail!("Cannot hash {}, maybe a broken symlink?", path.display());
        }
        let mut hasher = Sha256::new();
        let chunks = FileChunkIterator::new(path)
            .with_context(|| format!("Cannot read {} for hashing", path.display()))?;
        for chunk in chunks {
            hasher.update(&chunk);
        }
        Ok(FileStoreKey {
            hash: hasher.finalize().into(),
        })
    }

    /// Compute the key of an in-memory blob.
    pub fn from_content(content: &[u8]) -> FileStoreKey {
        let mut hasher = Sha256::new();
        hasher.update(content);
        FileStoreKey {
            hash: hasher.finalize().into(),
        }
    }

    /// The shard directory of this key: the first hex byte of the hash.
    fn shard(&self) -> String {
        hex::encode([self.hash[0]])
    }
}

impl std::fmt::Display for FileStoreKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.hash))
    }
}

impl std::fmt::Debug for FileStoreKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_string())
    }
}

impl std::str::FromStr for FileStoreKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).context("Invalid hash: not hex")?;
        let hash: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("Invalid hash: wrong length"))?;
        Ok(FileStoreKey { hash })
    }
}

impl Serialize for FileStoreKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for FileStoreKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error as _;
        let data = String::deserialize(deserializer)?;
        data.parse().map_err(|_| D::Error::custom("invalid hash"))
    }
}

impl FileStoreHandle {
    /// Make a new handle, pinning the blob.
    fn new(store: &FileStore, key: &FileStoreKey) -> FileStoreHandle {
        let path = store.blob_path(key);
        let mut pinned = store.pinned.lock().unwrap();
        *pinned.ref_counts.entry(key.clone()).or_default() += 1;
        FileStoreHandle {
            key: key.clone(),
            path,
            pinned: store.pinned.clone(),
        }
    }

    /// The path of the blob on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The key of the blob.
    pub fn key(&self) -> &FileStoreKey {
        &self.key
    }
}

impl PartialEq for FileStoreHandle {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Clone for FileStoreHandle {
    fn clone(&self) -> Self {
        let mut pinned = self.pinned.lock().unwrap();
        *pinned.ref_counts.entry(self.key.clone()).or_default() += 1;
        FileStoreHandle {
            key: self.key.clone(),
            path: self.path.clone(),
            pinned: self.pinned.clone(),
        }
    }
}

impl Drop for FileStoreHandle {
    fn drop(&mut self) {
        let mut pinned = match self.pinned.lock() {
            Ok(guard) => guard,
            Err(_) => return, // a thread panicked while pinning
        };
        let count = match pinned.ref_counts.get_mut(&self.key) {
            Some(count) => count,
            None => return,
        };
        *count -= 1;
        if *count == 0 {
            pinned.ref_counts.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Read;

    use pretty_assertions::{assert_eq, assert_ne};
    use tempfile::TempDir;

    use super::*;

    fn new_store(dir: &TempDir) -> FileStore {
        FileStore::new(dir.path().join("store"), 1 << 30, 1 << 30).unwrap()
    }

    fn put_blob(store: &FileStore, content: &[u8]) -> FileStoreHandle {
        let key = FileStoreKey::from_content(content);
        store.store(&key, vec![content.to_vec()]).unwrap()
    }

    #[test]
    fn test_new_store_creates_lock() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        assert!(store.base_path().join(STORE_LOCK_FILE).exists());
    }

    #[test]
    fn test_store_blob() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        let handle = put_blob(&store, b"test");
        assert!(handle.path().exists());
        let mut content = String::new();
        File::open(handle.path())
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(&content, "test");
        assert!(File::open(handle.path())
            .unwrap()
            .metadata()
            .unwrap()
            .permissions()
            .readonly());
    }

    #[test]
    fn test_store_is_deduplicating() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        let first = put_blob(&store, b"same content");
        let second = put_blob(&store, b"same content");
        assert_eq!(first.path(), second.path());
    }

    #[test]
    fn test_get_present() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        let handle = put_blob(&store, b"hello");
        let fetched = store.get(handle.key()).unwrap();
        assert_eq!(fetched.path(), handle.path());
    }

    #[test]
    fn test_get_absent() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        let key = FileStoreKey::from_content(b"never stored");
        assert!(store.get(&key).is_none());
        assert!(!store.has_key(&key));
    }

    #[test]
    fn test_blob_path_layout() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        let key = FileStoreKey::from_content(b"x");
        let path = store.blob_path(&key);
        let hex = key.to_string();
        assert!(path.ends_with(Path::new(&hex[0..2]).join(&hex)));
        assert!(path.starts_with(store.base_path()));
    }

    #[test]
    fn test_key_hash_is_sha256() {
        // SHA-256 of the empty string
        let key = FileStoreKey::from_content(b"");
        assert_eq!(
            key.to_string(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_key_from_file_matches_from_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file.txt");
        std::fs::write(&path, b"some bytes").unwrap();
        assert_eq!(
            FileStoreKey::from_file(&path).unwrap(),
            FileStoreKey::from_content(b"some bytes")
        );
    }

    #[test]
    fn test_key_equality() {
        let a = FileStoreKey::from_content(b"one");
        let b = FileStoreKey::from_content(b"one");
        let c = FileStoreKey::from_content(b"two");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_key_serde_roundtrip() {
        let key = FileStoreKey::from_content(b"roundtrip");
        let json = serde_json::to_string(&key).unwrap();
        let back: FileStoreKey = serde_json::from_str(&json).unwrap();
        assert_eq!(key, back);
    }

    #[test]
    fn test_rehash_stored_blob() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        let handle = put_blob(&store, b"stable");
        assert_eq!(&FileStoreKey::from_file(handle.path()).unwrap(), handle.key());
    }

    #[test]
    fn test_store_drains_iterator_when_present() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        let key = FileStoreKey::from_content(b"abc");
        store.store(&key, vec![b"abc".to_vec()]).unwrap();
        let mut consumed = false;
        let chunks = std::iter::once_with(|| {
            consumed = true;
            b"abc".to_vec()
        });
        store.store(&key, chunks).unwrap();
        assert!(consumed);
    }

    #[test]
    fn test_handle_pinning() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        let handle = put_blob(&store, b"pinned");
        let key = handle.key().clone();
        assert_eq!(store.pinned.lock().unwrap().ref_counts[&key], 1);
        let clone = handle.clone();
        assert_eq!(store.pinned.lock().unwrap().ref_counts[&key], 2);
        drop(handle);
        assert_eq!(store.pinned.lock().unwrap().ref_counts[&key], 1);
        drop(clone);
        assert!(!store.pinned.lock().unwrap().is_pinned(&key));
    }

    #[test]
    fn test_file_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file.txt");
        assert_eq!(file_size(&path), None);
        std::fs::write(&path, b"1234").unwrap();
        assert_eq!(file_size(&path), Some(4));
    }

    #[test]
    fn test_cheap_copy() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("from.txt");
        let to = dir.path().join("sub").join("to.txt");
        std::fs::write(&from, b"payload").unwrap();
        cheap_copy(&from, &to).unwrap();
        assert_eq!(std::fs::read(&to).unwrap(), b"payload");
    }

    #[test]
    fn test_chunked_write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        let content: Vec<u8> = (0..CHUNK_SIZE * 2 + 7).map(|i| (i % 251) as u8).collect();
        let key = FileStoreKey::from_content(&content);
        let chunks: Vec<Vec<u8>> = content.chunks(CHUNK_SIZE).map(|c| c.to_vec()).collect();
        let handle = store.store(&key, chunks).unwrap();
        let read: Vec<u8> = FileChunkIterator::new(handle.path())
            .unwrap()
            .flatten()
            .collect();
        assert_eq!(read, content);
    }
}
