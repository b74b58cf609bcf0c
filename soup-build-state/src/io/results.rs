//! Reader and writer for operation result files (`EvaluateResults`,
//! `GenerateResults`).

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use log::debug;

use super::{
    ensure_eof, open_versioned, persist_atomic, read_count, read_time, read_u32, write_header,
    write_time, write_u32, PathTable,
};
use crate::error::StateError;
use crate::fs_state::{ContentHash, FileId, FileSystemState};
use crate::graph::OperationGraph;
use crate::operation::OperationId;
use crate::results::{OperationResult, OperationResults};

const MAGIC: &[u8; 4] = b"SOPR";
const VERSION: u32 = 1;

/// Loads operation results, interning observed paths into `state`.
/// `Ok(None)` means the file does not exist.
pub fn try_load(
    path: &Path,
    state: &mut FileSystemState,
) -> Result<Option<OperationResults>, StateError> {
    let mut reader = match open_versioned(path, MAGIC, VERSION)? {
        Some(reader) => reader,
        None => return Ok(None),
    };

    let paths = PathTable::read(&mut reader)?;
    let mut results = OperationResults::new();

    let count = read_count(&mut reader)?;
    for _ in 0..count {
        let id = read_u32(&mut reader)?;
        if id == 0 {
            return Err(StateError::corrupt("operation id must be positive"));
        }
        let was_successful = match read_u32(&mut reader)? {
            0 => false,
            1 => true,
            other => {
                return Err(StateError::corrupt(format!("invalid success flag {}", other)));
            }
        };
        let evaluate_time = read_time(&mut reader)?;
        let observed_inputs = read_file_id_list(&mut reader, &paths, state)?;
        let observed_outputs = read_file_id_list(&mut reader, &paths, state)?;
        let input_hashes = read_input_hashes(&mut reader, &paths, state)?;

        results.put(
            OperationId(id),
            OperationResult {
                was_successful,
                evaluate_time,
                observed_inputs,
                observed_outputs,
                input_hashes,
            },
        );
    }

    ensure_eof(&mut reader)?;
    debug!("loaded {} operation results from {}", results.len(), path.display());
    Ok(Some(results))
}

/// Writes the results atomically. Results for operations no longer present
/// in the paired graph are stale and are dropped here rather than carried
/// forward indefinitely.
pub fn save(
    path: &Path,
    results: &OperationResults,
    graph: &OperationGraph,
    state: &FileSystemState,
) -> Result<(), StateError> {
    let live: Vec<_> =
        results.iter().filter(|(id, _)| graph.operation(*id).is_some()).collect();
    let dropped = results.len() - live.len();
    if dropped > 0 {
        debug!("dropping {} stale operation results on save", dropped);
    }

    let mut paths = PathTable::new();
    let mut body = Vec::new();
    write_u32(&mut body, live.len() as u32);
    for (id, result) in live {
        write_u32(&mut body, id.0);
        write_u32(&mut body, if result.was_successful { 1 } else { 0 });
        write_time(&mut body, result.evaluate_time);
        for file_ids in &[&result.observed_inputs, &result.observed_outputs] {
            write_u32(&mut body, file_ids.len() as u32);
            for &file_id in file_ids.iter() {
                write_u32(&mut body, paths.intern(state.to_path(file_id)));
            }
        }
        write_u32(&mut body, result.input_hashes.len() as u32);
        for (&file_id, hash) in &result.input_hashes {
            write_u32(&mut body, paths.intern(state.to_path(file_id)));
            body.extend_from_slice(&hash.0);
        }
    }

    let mut bytes = Vec::new();
    write_header(&mut bytes, MAGIC, VERSION);
    paths.write(&mut bytes);
    bytes.extend_from_slice(&body);
    persist_atomic(path, &bytes)
}

fn read_file_id_list(
    reader: &mut impl Read,
    paths: &super::LoadedPathTable,
    state: &mut FileSystemState,
) -> Result<Vec<FileId>, StateError> {
    let count = read_count(reader)?;
    let mut ids = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let reference = read_u32(reader)?;
        ids.push(state.to_id(paths.resolve(reference)?));
    }
    Ok(ids)
}

fn read_input_hashes(
    reader: &mut impl Read,
    paths: &super::LoadedPathTable,
    state: &mut FileSystemState,
) -> Result<BTreeMap<FileId, ContentHash>, StateError> {
    let count = read_count(reader)?;
    let mut hashes = BTreeMap::new();
    for _ in 0..count {
        let reference = read_u32(reader)?;
        let file_id = state.to_id(paths.resolve(reference)?);
        let mut hash = [0u8; 32];
        reader.read_exact(&mut hash).map_err(|_| StateError::corrupt("truncated hash"))?;
        hashes.insert(file_id, ContentHash(hash));
    }
    Ok(hashes)
}
