use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{bail, Context, Error};
use itertools::Itertools;

use crate::key::CacheKey;
use crate::CacheEntry;

/// Magic string prepended to the cache file, rejecting foreign files.
const MAGIC: &[u8] = b"taskgrade-cache";
/// Changing the crate version invalidates the cache file, so any breaking
/// change to the entry format has to go through a version bump.
const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Maximum number of bytes reserved for the version string.
const VERSION_MAX_LEN: usize = 16;

/// Read the cache file, checking the magic string and the version.
pub(crate) fn load<P: AsRef<Path>>(path: P) -> Result<HashMap<CacheKey, CacheEntry>, Error> {
    let path = path.as_ref();
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("Cannot open cache file at {}", path.display()))?;
    let mut header = [0u8; MAGIC.len() + VERSION_MAX_LEN];
    file.read_exact(&mut header)
        .context("Failed to read cache header")?;
    if &header[..MAGIC.len()] != MAGIC {
        bail!("Cache magic mismatch at {}", path.display());
    }
    if &header[MAGIC.len()..MAGIC.len() + VERSION.len()] != VERSION.as_bytes() {
        bail!("Cache version mismatch at {}", path.display());
    }
    Ok(
        bincode::deserialize_from::<_, Vec<(CacheKey, CacheEntry)>>(file)
            .context("Failed to deserialize cache content")?
            .into_iter()
            .collect(),
    )
}

/// Atomically write the entries to the cache file, with the magic string and
/// the version prefix.
pub(crate) fn save<P: AsRef<Path>>(
    path: P,
    entries: &HashMap<CacheKey, CacheEntry>,
) -> Result<(), Error> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create cache directory")?;
    }
    let tmp = path.with_extension("tmp");
    let mut file = std::fs::File::create(&tmp)
        .with_context(|| format!("Failed to create cache file at {}", tmp.display()))?;
    let mut header = [0u8; MAGIC.len() + VERSION_MAX_LEN];
    header[..MAGIC.len()].clone_from_slice(MAGIC);
    header[MAGIC.len()..MAGIC.len() + VERSION.len()].clone_from_slice(VERSION.as_bytes());
    file.write_all(&header)
        .context("Failed to write cache header")?;
    let serialized = bincode::serialize(&entries.iter().collect_vec())
        .context("Failed to serialize cache content")?;
    file.write_all(&serialized)
        .context("Failed to write cache content")?;
    drop(file);
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}
