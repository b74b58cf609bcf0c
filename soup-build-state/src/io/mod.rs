//! Binary readers and writers for the persisted build state.
//!
//! Four independent formats share the same conventions: a four-byte magic
//! followed by a little-endian `u32` version, length-prefixed UTF-8
//! strings, path tables stored once and referenced by 1-based index, and
//! strict reads (unknown versions and trailing bytes are rejected).
//! Writers serialise to memory and then persist through a sibling temp
//! file, fsync and rename, so a crashed write never leaves a torn state
//! file behind.

pub mod graph;
pub mod path_list;
pub mod results;
pub mod value;

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tempfile::NamedTempFile;

use crate::error::StateError;

/// Upper bound for any persisted element count. Counts beyond this are
/// rejected as corrupt before any allocation happens.
const MAX_COUNT: u32 = 1 << 24;

/// Opens `path` and checks the magic and version. `Ok(None)` means the file
/// does not exist.
pub(crate) fn open_versioned(
    path: &Path,
    magic: &[u8; 4],
    version: u32,
) -> Result<Option<BufReader<File>>, StateError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(error.into()),
    };

    let mut reader = BufReader::new(file);
    let mut found_magic = [0u8; 4];
    reader.read_exact(&mut found_magic).map_err(|_| StateError::corrupt("truncated header"))?;
    if &found_magic != magic {
        return Err(StateError::corrupt(format!(
            "unexpected magic {:?} (wanted {:?})",
            found_magic, magic
        )));
    }

    let found_version = reader
        .read_u32::<LittleEndian>()
        .map_err(|_| StateError::corrupt("truncated header"))?;
    if found_version != version {
        return Err(StateError::VersionMismatch { expected: version, found: found_version });
    }

    Ok(Some(reader))
}

pub(crate) fn write_header(out: &mut Vec<u8>, magic: &[u8; 4], version: u32) {
    out.extend_from_slice(magic);
    out.write_u32::<LittleEndian>(version).expect("write to vec");
}

/// Writes the serialised bytes through a sibling temp file and renames it
/// into place.
pub(crate) fn persist_atomic(path: &Path, bytes: &[u8]) -> Result<(), StateError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|error| StateError::Io(error.error))?;
    Ok(())
}

pub(crate) fn read_count(reader: &mut impl Read) -> Result<u32, StateError> {
    let count = reader.read_u32::<LittleEndian>().map_err(|_| StateError::corrupt("truncated count"))?;
    if count > MAX_COUNT {
        return Err(StateError::corrupt(format!("implausible element count {}", count)));
    }
    Ok(count)
}

pub(crate) fn read_u32(reader: &mut impl Read) -> Result<u32, StateError> {
    reader.read_u32::<LittleEndian>().map_err(|_| StateError::corrupt("truncated integer"))
}

pub(crate) fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.write_u32::<LittleEndian>(value).expect("write to vec");
}

pub(crate) fn read_string(reader: &mut impl Read) -> Result<String, StateError> {
    let length = read_count(reader)?;
    let mut bytes = vec![0u8; length as usize];
    reader.read_exact(&mut bytes).map_err(|_| StateError::corrupt("truncated string"))?;
    String::from_utf8(bytes).map_err(|_| StateError::corrupt("string is not valid UTF-8"))
}

pub(crate) fn write_string(out: &mut Vec<u8>, value: &str) {
    write_u32(out, value.len() as u32);
    out.extend_from_slice(value.as_bytes());
}

pub(crate) fn read_time(reader: &mut impl Read) -> Result<SystemTime, StateError> {
    let secs = reader.read_u64::<LittleEndian>().map_err(|_| StateError::corrupt("truncated time"))?;
    let nanos = read_u32(reader)?;
    if nanos >= 1_000_000_000 {
        return Err(StateError::corrupt("invalid sub-second timestamp component"));
    }
    Ok(UNIX_EPOCH + Duration::new(secs, nanos))
}

pub(crate) fn write_time(out: &mut Vec<u8>, time: SystemTime) {
    let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    out.write_u64::<LittleEndian>(since_epoch.as_secs()).expect("write to vec");
    write_u32(out, since_epoch.subsec_nanos());
}

/// Rejects any bytes left after the last expected section.
pub(crate) fn ensure_eof(reader: &mut impl Read) -> Result<(), StateError> {
    let mut probe = [0u8; 1];
    match reader.read(&mut probe) {
        Ok(0) => Ok(()),
        Ok(_) => Err(StateError::corrupt("unexpected trailing bytes")),
        Err(error) => Err(error.into()),
    }
}

/// Deduplicating path table written once per file and referenced by
/// 1-based index from every other section.
#[derive(Default)]
pub(crate) struct PathTable {
    paths: Vec<PathBuf>,
    index: HashMap<PathBuf, u32>,
}

impl PathTable {
    pub(crate) fn new() -> PathTable {
        PathTable::default()
    }

    /// Interns `path`, returning its 1-based index.
    pub(crate) fn intern(&mut self, path: &Path) -> u32 {
        if let Some(&index) = self.index.get(path) {
            return index;
        }
        let index = self.paths.len() as u32 + 1;
        self.paths.push(path.to_owned());
        self.index.insert(path.to_owned(), index);
        index
    }

    pub(crate) fn write(&self, out: &mut Vec<u8>) {
        write_u32(out, self.paths.len() as u32);
        for path in &self.paths {
            write_string(out, &path.to_string_lossy());
        }
    }

    pub(crate) fn read(reader: &mut impl Read) -> Result<LoadedPathTable, StateError> {
        let count = read_count(reader)?;
        let mut paths = Vec::with_capacity(count as usize);
        for _ in 0..count {
            paths.push(PathBuf::from(read_string(reader)?));
        }
        Ok(LoadedPathTable { paths })
    }
}

/// Path table as read back from disk; resolves 1-based references.
pub(crate) struct LoadedPathTable {
    paths: Vec<PathBuf>,
}

impl LoadedPathTable {
    pub(crate) fn resolve(&self, index: u32) -> Result<&Path, StateError> {
        if index == 0 || index as usize > self.paths.len() {
            return Err(StateError::corrupt(format!("path reference {} out of range", index)));
        }
        Ok(&self.paths[index as usize - 1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_table_deduplicates_and_resolves() {
        let mut table = PathTable::new();
        let a = table.intern(Path::new("/pkg/a"));
        let b = table.intern(Path::new("/pkg/b"));
        let a_again = table.intern(Path::new("/pkg/a"));
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(a, a_again);

        let mut bytes = Vec::new();
        table.write(&mut bytes);
        let loaded = PathTable::read(&mut bytes.as_slice()).unwrap();
        assert_eq!(loaded.resolve(1).unwrap(), Path::new("/pkg/a"));
        assert_eq!(loaded.resolve(2).unwrap(), Path::new("/pkg/b"));
        assert!(loaded.resolve(0).is_err());
        assert!(loaded.resolve(3).is_err());
    }

    #[test]
    fn time_round_trips_with_nanos() {
        let time = UNIX_EPOCH + Duration::new(1_700_000_000, 123_456_789);
        let mut bytes = Vec::new();
        write_time(&mut bytes, time);
        let read = read_time(&mut bytes.as_slice()).unwrap();
        assert_eq!(read, time);
    }

    #[test]
    fn invalid_nanos_are_corrupt() {
        let mut bytes = Vec::new();
        bytes.write_u64::<LittleEndian>(1).unwrap();
        bytes.write_u32::<LittleEndian>(2_000_000_000).unwrap();
        assert!(read_time(&mut bytes.as_slice()).is_err());
    }

    #[test]
    fn ensure_eof_rejects_trailing_bytes() {
        assert!(ensure_eof(&mut [].as_slice()).is_ok());
        assert!(ensure_eof(&mut [1u8].as_slice()).is_err());
    }
}
