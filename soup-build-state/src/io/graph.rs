//! Reader and writer for the operation graph file (`EvaluateGraph`).

use std::io::Read;
use std::path::Path;

use log::debug;

use super::{
    ensure_eof, open_versioned, persist_atomic, read_count, read_string, read_u32, write_header,
    write_string, write_u32, PathTable,
};
use crate::error::StateError;
use crate::fs_state::FileSystemState;
use crate::graph::OperationGraph;
use crate::operation::{CommandInfo, OperationId, OperationInfo};

const MAGIC: &[u8; 4] = b"SOPG";
const VERSION: u32 = 1;

/// Loads an operation graph, interning every referenced path into `state`.
///
/// Returns `Ok(None)` if the file does not exist. Any structural violation
/// (unresolvable references, duplicate commands, cycles, trailing bytes)
/// loads as a corrupt-state error.
pub fn try_load(
    path: &Path,
    state: &mut FileSystemState,
) -> Result<Option<OperationGraph>, StateError> {
    let mut reader = match open_versioned(path, MAGIC, VERSION)? {
        Some(reader) => reader,
        None => return Ok(None),
    };

    let paths = PathTable::read(&mut reader)?;
    let mut graph = OperationGraph::new();

    let operation_count = read_count(&mut reader)?;
    for _ in 0..operation_count {
        graph.add_operation(read_operation(&mut reader, &paths, state)?)?;
    }

    let root_count = read_count(&mut reader)?;
    let mut roots = Vec::with_capacity(root_count as usize);
    for _ in 0..root_count {
        roots.push(OperationId(read_u32(&mut reader)?));
    }
    graph.set_root_ids(roots);

    ensure_eof(&mut reader)?;
    graph.validate()?;

    debug!("loaded operation graph with {} operations from {}", graph.len(), path.display());
    Ok(Some(graph))
}

/// Writes the graph atomically, canonicalising every referenced path into
/// the file's own path table.
pub fn save(path: &Path, graph: &OperationGraph, state: &FileSystemState) -> Result<(), StateError> {
    let mut paths = PathTable::new();
    let mut body = Vec::new();

    write_u32(&mut body, graph.len() as u32);
    for operation in graph.operations() {
        write_operation(&mut body, operation, &mut paths, state);
    }

    write_u32(&mut body, graph.root_ids().len() as u32);
    for root in graph.root_ids() {
        write_u32(&mut body, root.0);
    }

    let mut bytes = Vec::new();
    write_header(&mut bytes, MAGIC, VERSION);
    paths.write(&mut bytes);
    bytes.extend_from_slice(&body);
    persist_atomic(path, &bytes)
}

fn read_operation(
    reader: &mut impl Read,
    paths: &super::LoadedPathTable,
    state: &mut FileSystemState,
) -> Result<OperationInfo, StateError> {
    let id = read_u32(reader)?;
    if id == 0 {
        return Err(StateError::corrupt("operation id must be positive"));
    }
    let title = read_string(reader)?;

    let working_directory = paths.resolve(read_u32(reader)?)?.to_owned();
    let executable = paths.resolve(read_u32(reader)?)?.to_owned();
    let arguments = read_string(reader)?;

    let declared_inputs = read_file_id_list(reader, paths, state)?;
    let declared_outputs = read_file_id_list(reader, paths, state)?;

    let child_count = read_count(reader)?;
    let mut children = Vec::with_capacity(child_count as usize);
    for _ in 0..child_count {
        children.push(OperationId(read_u32(reader)?));
    }

    let dependency_count = read_u32(reader)?;

    Ok(OperationInfo {
        id: OperationId(id),
        title,
        command: CommandInfo { working_directory, executable, arguments },
        declared_inputs,
        declared_outputs,
        children,
        dependency_count,
    })
}

fn read_file_id_list(
    reader: &mut impl Read,
    paths: &super::LoadedPathTable,
    state: &mut FileSystemState,
) -> Result<Vec<crate::fs_state::FileId>, StateError> {
    let count = read_count(reader)?;
    let mut ids = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let reference = read_u32(reader)?;
        ids.push(state.to_id(paths.resolve(reference)?));
    }
    Ok(ids)
}

fn write_operation(
    out: &mut Vec<u8>,
    operation: &OperationInfo,
    paths: &mut PathTable,
    state: &FileSystemState,
) {
    write_u32(out, operation.id.0);
    write_string(out, &operation.title);

    write_u32(out, paths.intern(&operation.command.working_directory));
    write_u32(out, paths.intern(&operation.command.executable));
    write_string(out, &operation.command.arguments);

    for file_ids in &[&operation.declared_inputs, &operation.declared_outputs] {
        write_u32(out, file_ids.len() as u32);
        for &file_id in file_ids.iter() {
            write_u32(out, paths.intern(state.to_path(file_id)));
        }
    }

    write_u32(out, operation.children.len() as u32);
    for child in &operation.children {
        write_u32(out, child.0);
    }

    write_u32(out, operation.dependency_count);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    fn sample_graph(state: &mut FileSystemState) -> OperationGraph {
        let source = state.to_id(Path::new("/pkg/src/main.cpp"));
        let object = state.to_id(Path::new("/pkg/out/main.o"));
        let binary = state.to_id(Path::new("/pkg/out/main"));

        let mut compile = OperationInfo::new(
            OperationId(1),
            "Compile main.cpp",
            CommandInfo::new("/pkg", "/tools/cc", "-c src/main.cpp -o out/main.o"),
        );
        compile.declared_inputs = vec![source];
        compile.declared_outputs = vec![object];
        compile.children = vec![OperationId(2)];

        let mut link = OperationInfo::new(
            OperationId(2),
            "Link main",
            CommandInfo::new("/pkg", "/tools/ld", "out/main.o -o out/main"),
        );
        link.declared_inputs = vec![object];
        link.declared_outputs = vec![binary];
        link.dependency_count = 1;

        let mut graph = OperationGraph::new();
        graph.add_operation(compile).unwrap();
        graph.add_operation(link).unwrap();
        graph.set_root_ids(vec![OperationId(1)]);
        graph
    }

    #[test]
    fn round_trip_preserves_everything() {
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("EvaluateGraph");

        let mut state = FileSystemState::new();
        let graph = sample_graph(&mut state);
        save(&file, &graph, &state).unwrap();

        // A fresh process re-interns ids from scratch.
        let mut fresh_state = FileSystemState::new();
        let loaded = try_load(&file, &mut fresh_state).unwrap().unwrap();

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.root_ids(), &[OperationId(1)]);

        let compile = loaded.operation(OperationId(1)).unwrap();
        assert_eq!(compile.title, "Compile main.cpp");
        assert_eq!(compile.children, vec![OperationId(2)]);
        assert_eq!(
            fresh_state.to_path(compile.declared_inputs[0]),
            Path::new("/pkg/src/main.cpp")
        );

        let link = loaded.operation(OperationId(2)).unwrap();
        assert_eq!(link.dependency_count, 1);
        assert_eq!(
            loaded.find_by_command(&CommandInfo::new("/pkg", "/tools/ld", "out/main.o -o out/main")),
            Some(OperationId(2))
        );
    }

    #[test]
    fn absent_file_loads_as_none() {
        let temp = tempfile::tempdir().unwrap();
        let mut state = FileSystemState::new();
        let loaded = try_load(&temp.path().join("EvaluateGraph"), &mut state).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn bad_magic_is_corrupt() {
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("EvaluateGraph");
        fs::write(&file, b"NOPE\x01\x00\x00\x00").unwrap();

        let mut state = FileSystemState::new();
        match try_load(&file, &mut state) {
            Err(StateError::Corrupt(_)) => {}
            other => panic!("expected corrupt, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn unknown_version_is_a_version_mismatch() {
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("EvaluateGraph");
        fs::write(&file, b"SOPG\x63\x00\x00\x00").unwrap();

        let mut state = FileSystemState::new();
        match try_load(&file, &mut state) {
            Err(StateError::VersionMismatch { expected: 1, found: 0x63 }) => {}
            other => panic!("expected version mismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("EvaluateGraph");

        let mut state = FileSystemState::new();
        let graph = sample_graph(&mut state);
        save(&file, &graph, &state).unwrap();

        let mut bytes = fs::read(&file).unwrap();
        bytes.push(0);
        fs::write(&file, &bytes).unwrap();

        let mut fresh_state = FileSystemState::new();
        assert!(try_load(&file, &mut fresh_state).is_err());
    }

    #[test]
    fn truncated_file_is_corrupt() {
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("EvaluateGraph");

        let mut state = FileSystemState::new();
        let graph = sample_graph(&mut state);
        save(&file, &graph, &state).unwrap();

        let bytes = fs::read(&file).unwrap();
        fs::write(&file, &bytes[..bytes.len() / 2]).unwrap();

        let mut fresh_state = FileSystemState::new();
        assert!(try_load(&file, &mut fresh_state).is_err());
    }

    #[test]
    fn save_is_atomic_under_existing_file(){
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("EvaluateGraph");

        let mut state = FileSystemState::new();
        let graph = sample_graph(&mut state);
        save(&file, &graph, &state).unwrap();
        save(&file, &graph, &state).unwrap();

        let entries: Vec<PathBuf> =
            fs::read_dir(temp.path()).unwrap().map(|e| e.unwrap().path()).collect();
        assert_eq!(entries, vec![file]);
    }
}
