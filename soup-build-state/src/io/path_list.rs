//! Reader and writer for persisted path lists (`GenerateReadAccessList`,
//! `GenerateWriteAccessList`).
//!
//! Order is preserved and meaningful: the runner compares lists
//! order-sensitively, so a reordering invalidates the generate phase.

use std::path::{Path, PathBuf};

use super::{ensure_eof, open_versioned, persist_atomic, read_count, read_string, write_header, write_string, write_u32};
use crate::error::StateError;

const MAGIC: &[u8; 4] = b"SPTH";
const VERSION: u32 = 1;

/// Loads a path list. `Ok(None)` means the file does not exist.
pub fn try_load(path: &Path) -> Result<Option<Vec<PathBuf>>, StateError> {
    let mut reader = match open_versioned(path, MAGIC, VERSION)? {
        Some(reader) => reader,
        None => return Ok(None),
    };

    let count = read_count(&mut reader)?;
    let mut paths = Vec::with_capacity(count as usize);
    for _ in 0..count {
        paths.push(PathBuf::from(read_string(&mut reader)?));
    }

    ensure_eof(&mut reader)?;
    Ok(Some(paths))
}

/// Writes the list atomically.
pub fn save(path: &Path, paths: &[PathBuf]) -> Result<(), StateError> {
    let mut bytes = Vec::new();
    write_header(&mut bytes, MAGIC, VERSION);
    write_u32(&mut bytes, paths.len() as u32);
    for entry in paths {
        write_string(&mut bytes, &entry.to_string_lossy());
    }
    persist_atomic(path, &bytes)
}
