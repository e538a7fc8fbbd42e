use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Error};

/// The recognized executable formats.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ExecutableFormat {
    /// An interpreter script starting with `#!`.
    Shebang,
    /// A 32-bit ELF binary.
    Elf32,
    /// A 64-bit ELF binary.
    Elf64,
}

/// Header patterns of the recognized formats.
const PATTERNS: [(&[u8], ExecutableFormat); 3] = [
    (b"#!", ExecutableFormat::Shebang),
    (b"\x7f\x45\x4c\x46\x01", ExecutableFormat::Elf32),
    (b"\x7f\x45\x4c\x46\x02", ExecutableFormat::Elf64),
];

/// Inspect the header of the file at `path` and report its executable
/// format, if any.
///
/// - `Err(_)` if the file cannot be read.
/// - `Ok(None)` if the header matches no runnable format.
/// - `Ok(Some(format))` otherwise.
pub fn detect_exe<P: AsRef<Path>>(path: P) -> Result<Option<ExecutableFormat>, Error> {
    let path = path.as_ref();
    let mut file = File::open(path)
        .with_context(|| format!("Failed to open {} for format detection", path.display()))?;
    let mut header = [0u8; 5];
    let mut len = 0;
    while len < header.len() {
        let n = file
            .read(&mut header[len..])
            .with_context(|| format!("Failed to read the header of {}", path.display()))?;
        if n == 0 {
            break;
        }
        len += n;
    }
    for (pattern, format) in &PATTERNS {
        if header[..len].starts_with(pattern) {
            return Ok(Some(*format));
        }
    }
    Ok(None)
}
