use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// The identifier of a logical file. Unique within the manager process and
/// assigned monotonically starting from 1.
pub type FileId = u64;

/// The next id to hand out. Starts at 1 so that 0 can never name a file.
static NEXT_FILE_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a logical file of the evaluation: an artifact that either is
/// provided by the client or will be produced by an execution. The handle only
/// tracks identity and dependencies; the content hash is bound to the id by
/// the graph driver once the artifact is materialized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRef {
    /// Id of the file.
    pub id: FileId,
    /// Human readable description of the file.
    pub description: String,
    /// Whether the file must carry the executable bit when staged inside a
    /// sandbox. Set on creation, immutable thereafter.
    pub executable: bool,
}

impl FileRef {
    /// Create a new file handle.
    pub fn new<S: Into<String>>(description: S) -> FileRef {
        FileRef {
            id: NEXT_FILE_ID.fetch_add(1, Ordering::SeqCst),
            description: description.into(),
            executable: false,
        }
    }

    /// Create a new file handle for an executable file.
    pub fn new_executable<S: Into<String>>(description: S) -> FileRef {
        FileRef {
            executable: true,
            ..FileRef::new(description)
        }
    }
}

impl From<&FileRef> for FileId {
    fn from(file: &FileRef) -> Self {
        file.id
    }
}

impl From<FileRef> for FileId {
    fn from(file: FileRef) -> Self {
        file.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic_and_nonzero() {
        let a = FileRef::new("a");
        let b = FileRef::new("b");
        assert!(a.id >= 1);
        assert!(b.id > a.id);
    }

    #[test]
    fn test_executable_bit() {
        assert!(!FileRef::new("plain").executable);
        assert!(FileRef::new_executable("exe").executable);
    }
}
