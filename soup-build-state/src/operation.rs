//! Operation records: a single sandboxed process invocation and the
//! statically-declared knowledge about it.

use std::fmt;
use std::path::PathBuf;

use crate::fs_state::FileId;

/// Identifier for an operation, unique within one graph. Always positive.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub u32);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The exact command an operation runs. Two operations are considered the
/// same across regenerated graphs if and only if their commands are
/// field-wise equal; the reconciliation step relies on this.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct CommandInfo {
    pub working_directory: PathBuf,
    pub executable: PathBuf,
    pub arguments: String,
}

impl CommandInfo {
    pub fn new(
        working_directory: impl Into<PathBuf>,
        executable: impl Into<PathBuf>,
        arguments: impl Into<String>,
    ) -> CommandInfo {
        CommandInfo {
            working_directory: working_directory.into(),
            executable: executable.into(),
            arguments: arguments.into(),
        }
    }
}

/// A single operation in an operation graph.
///
/// `declared_inputs` and `declared_outputs` are the generator's static
/// sandbox hints; the observed sets recorded after execution live in the
/// paired result store. `children` are the operations that must run after
/// this one, and `dependency_count` is the number of parents, consumed by
/// the topological execution in the evaluator.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationInfo {
    pub id: OperationId,
    pub title: String,
    pub command: CommandInfo,
    pub declared_inputs: Vec<FileId>,
    pub declared_outputs: Vec<FileId>,
    pub children: Vec<OperationId>,
    pub dependency_count: u32,
}

impl OperationInfo {
    /// A leaf operation with no declared files, children or parents.
    pub fn new(id: OperationId, title: impl Into<String>, command: CommandInfo) -> OperationInfo {
        OperationInfo {
            id,
            title: title.into(),
            command,
            declared_inputs: Vec::new(),
            declared_outputs: Vec::new(),
            children: Vec::new(),
            dependency_count: 0,
        }
    }
}
