//! Process-wide file-system state.
//!
//! Every path referenced by an operation graph or result set is interned
//! here once and referred to by a `FileId` for the rest of the process.
//! The state also caches file observations (missing, or last-write time
//! with an optional content hash) so one Evaluate pass stats each file at
//! most once.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::trace;
use sha2::{Digest, Sha256};

/// Stable handle for an interned path.
///
/// Ids are dense starting at 1 and monotonic within a process. They are
/// never persisted directly; the binary formats store path tables and
/// re-intern on load.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct FileId(u32);

impl FileId {
    fn index(self) -> usize {
        self.0 as usize - 1
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SHA-256 digest of a file's contents.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct ContentHash(pub [u8; 32]);

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// The result of observing a single file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileObservation {
    Missing,
    Present { last_write: SystemTime },
}

impl FileObservation {
    pub fn last_write(&self) -> Option<SystemTime> {
        match self {
            FileObservation::Missing => None,
            FileObservation::Present { last_write } => Some(*last_write),
        }
    }
}

/// The narrow file-system capability the state layer depends on.
///
/// Production code uses [`RealFileSystem`]; tests substitute in-memory
/// implementations to control observations without touching disk.
pub trait FileSystem {
    fn exists(&self, path: &Path) -> bool;
    /// Last write time, or `None` if the file does not exist.
    fn last_write(&self, path: &Path) -> Option<SystemTime>;
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
}

/// `FileSystem` backed by `std::fs`.
#[derive(Debug, Default)]
pub struct RealFileSystem;

impl FileSystem for RealFileSystem {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn last_write(&self, path: &Path) -> Option<SystemTime> {
        fs::metadata(path).and_then(|metadata| metadata.modified()).ok()
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }
}

/// Bidirectional Path ↔ FileId table plus the per-pass observation cache.
#[derive(Default)]
pub struct FileSystemState {
    paths: Vec<PathBuf>,
    ids: HashMap<PathBuf, FileId>,
    observations: HashMap<FileId, FileObservation>,
    content_hashes: HashMap<FileId, ContentHash>,
}

impl FileSystemState {
    pub fn new() -> FileSystemState {
        FileSystemState::default()
    }

    /// Interns `path`, assigning the next dense id on first sight.
    pub fn to_id(&mut self, path: &Path) -> FileId {
        if let Some(&id) = self.ids.get(path) {
            return id;
        }

        let id = FileId(self.paths.len() as u32 + 1);
        self.paths.push(path.to_owned());
        self.ids.insert(path.to_owned(), id);
        id
    }

    /// The path behind an id handed out by this state.
    pub fn to_path(&self, id: FileId) -> &Path {
        &self.paths[id.index()]
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Drops any cached observation for `id`; the next observe re-stats.
    pub fn invalidate(&mut self, id: FileId) {
        self.observations.remove(&id);
        self.content_hashes.remove(&id);
    }

    /// Drops every cached observation. Called at the start of an Evaluate
    /// pass so observations never leak across passes.
    pub fn invalidate_all(&mut self) {
        self.observations.clear();
        self.content_hashes.clear();
    }

    /// Observes the file behind `id`, consulting the cache first.
    pub fn observe(&mut self, id: FileId, fs: &dyn FileSystem) -> FileObservation {
        if let Some(&observation) = self.observations.get(&id) {
            return observation;
        }

        let path = &self.paths[id.index()];
        let observation = match fs.last_write(path) {
            Some(last_write) => FileObservation::Present { last_write },
            None => FileObservation::Missing,
        };
        trace!("observe {}: {:?}", path.display(), observation);
        self.observations.insert(id, observation);
        observation
    }

    /// Cached last write time, or `None` for a missing file.
    pub fn last_write(&mut self, id: FileId, fs: &dyn FileSystem) -> Option<SystemTime> {
        self.observe(id, fs).last_write()
    }

    /// Content hash for the file behind `id`, computed on first request and
    /// cached until the observation is invalidated. Returns `None` for a
    /// missing file.
    ///
    /// Last-write times are the primary evidence for incremental decisions;
    /// the hash exists for consumers that need to disambiguate files whose
    /// observed timestamps are equal.
    pub fn content_hash(
        &mut self,
        id: FileId,
        fs: &dyn FileSystem,
    ) -> io::Result<Option<ContentHash>> {
        if let FileObservation::Missing = self.observe(id, fs) {
            return Ok(None);
        }
        if let Some(&hash) = self.content_hashes.get(&id) {
            return Ok(Some(hash));
        }

        let contents = fs.read(&self.paths[id.index()])?;
        let mut hasher = Sha256::new();
        hasher.update(&contents);
        let hash = ContentHash(hasher.finalize().into());
        self.content_hashes.insert(id, hash);
        Ok(Some(hash))
    }
}

impl fmt::Debug for FileSystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSystemState")
            .field("paths", &self.paths.len())
            .field("observations", &self.observations.len())
            .finish()
    }
}
