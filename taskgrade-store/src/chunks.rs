use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{Context, Error};

use crate::CHUNK_SIZE;

/// Iterator over the content of a file, yielding chunks of at most
/// [`CHUNK_SIZE`](constant.CHUNK_SIZE.html) bytes.
///
/// The chunk size matches the maximum payload of a file-transfer frame, so the
/// same iterator feeds both local hashing and the wire protocol.
pub struct FileChunkIterator {
    /// Buffered reader over the file.
    reader: BufReader<File>,
    /// Scratch buffer reused between chunks.
    buf: Box<[u8; CHUNK_SIZE]>,
}

impl FileChunkIterator {
    /// Open the file at `path` and iterate over its content.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<FileChunkIterator, Error> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open {} for reading", path.display()))?;
        Ok(FileChunkIterator {
            reader: BufReader::new(file),
            buf: Box::new([0; CHUNK_SIZE]),
        })
    }
}

impl Iterator for FileChunkIterator {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.read(&mut self.buf[..]) {
            Ok(0) => None,
            Ok(n) => Some(self.buf[0..n].to_vec()),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn write_file(dir: &TempDir, content: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join("file.bin");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(FileChunkIterator::new(dir.path().join("nope")).is_err());
    }

    #[test]
    fn test_empty_file() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, b"");
        let mut iter = FileChunkIterator::new(path).unwrap();
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn test_small_file() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, &[1, 2, 3, 4]);
        let mut iter = FileChunkIterator::new(path).unwrap();
        assert_eq!(iter.next(), Some(vec![1, 2, 3, 4]));
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn test_exactly_one_chunk() {
        let dir = TempDir::new().unwrap();
        let content = vec![42u8; CHUNK_SIZE];
        let path = write_file(&dir, &content);
        let mut iter = FileChunkIterator::new(path).unwrap();
        assert_eq!(iter.next(), Some(content));
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn test_chunk_boundary() {
        let dir = TempDir::new().unwrap();
        let content = vec![42u8; CHUNK_SIZE + 1];
        let path = write_file(&dir, &content);
        let mut iter = FileChunkIterator::new(path).unwrap();
        assert_eq!(iter.next().unwrap().len(), CHUNK_SIZE);
        assert_eq!(iter.next(), Some(vec![42u8]));
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn test_content_roundtrip() {
        let dir = TempDir::new().unwrap();
        let content: Vec<u8> = (0..CHUNK_SIZE * 2 + 123).map(|i| i as u8).collect();
        let path = write_file(&dir, &content);
        let read: Vec<u8> = FileChunkIterator::new(path).unwrap().flatten().collect();
        assert_eq!(read, content);
    }
}
