//! The operation graph: every operation a package build has to perform,
//! with dependency edges and a command index for reconciliation.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::error::StateError;
use crate::fs_state::FileId;
use crate::operation::{CommandInfo, OperationId, OperationInfo};

/// A validated set of operations.
///
/// Invariants, enforced by [`OperationGraph::validate`] and checked on every
/// load: all ids referenced by `children` and the root set resolve, the
/// command index is one-to-one, `dependency_count` matches the number of
/// parents, and the graph is acyclic.
#[derive(Debug, Default)]
pub struct OperationGraph {
    operations: BTreeMap<OperationId, OperationInfo>,
    command_index: HashMap<CommandInfo, OperationId>,
    root_ids: Vec<OperationId>,
}

impl OperationGraph {
    pub fn new() -> OperationGraph {
        OperationGraph::default()
    }

    /// Appends an operation. The id and the command must both be new to the
    /// graph; the command index has to stay one-to-one for reconciliation
    /// to be meaningful.
    pub fn add_operation(&mut self, info: OperationInfo) -> Result<(), StateError> {
        if self.operations.contains_key(&info.id) {
            return Err(StateError::corrupt(format!("duplicate operation id {}", info.id)));
        }
        if self.command_index.contains_key(&info.command) {
            return Err(StateError::corrupt(format!(
                "duplicate operation command for operation {}",
                info.id
            )));
        }

        self.command_index.insert(info.command.clone(), info.id);
        self.operations.insert(info.id, info);
        Ok(())
    }

    pub fn set_root_ids(&mut self, ids: Vec<OperationId>) {
        self.root_ids = ids;
    }

    pub fn root_ids(&self) -> &[OperationId] {
        &self.root_ids
    }

    pub fn operation(&self, id: OperationId) -> Option<&OperationInfo> {
        self.operations.get(&id)
    }

    /// Iterates operations in id order.
    pub fn operations(&self) -> impl Iterator<Item = &OperationInfo> {
        self.operations.values()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Looks up the operation with exactly this command, if any.
    pub fn find_by_command(&self, command: &CommandInfo) -> Option<OperationId> {
        self.command_index.get(command).copied()
    }

    /// Every file id declared by any operation, deduplicated.
    pub fn referenced_file_ids(&self) -> BTreeSet<FileId> {
        self.operations
            .values()
            .flat_map(|op| op.declared_inputs.iter().chain(op.declared_outputs.iter()))
            .copied()
            .collect()
    }

    /// Checks the structural invariants. Loaders call this and surface any
    /// violation as a corrupt state file.
    pub fn validate(&self) -> Result<(), StateError> {
        for root in &self.root_ids {
            if !self.operations.contains_key(root) {
                return Err(StateError::corrupt(format!("unknown root operation id {}", root)));
            }
        }

        // Count parents while checking that every edge resolves.
        let mut parent_counts: BTreeMap<OperationId, u32> =
            self.operations.keys().map(|&id| (id, 0)).collect();
        for operation in self.operations.values() {
            for child in &operation.children {
                match parent_counts.get_mut(child) {
                    Some(count) => *count += 1,
                    None => {
                        return Err(StateError::corrupt(format!(
                            "operation {} references unknown child {}",
                            operation.id, child
                        )))
                    }
                }
            }
        }

        for operation in self.operations.values() {
            let parents = parent_counts[&operation.id];
            if operation.dependency_count != parents {
                return Err(StateError::corrupt(format!(
                    "operation {} declares {} dependencies but has {} parents",
                    operation.id, operation.dependency_count, parents
                )));
            }
        }

        // Topological pass over the child edges; anything left unprocessed
        // sits on a cycle.
        let mut remaining = parent_counts;
        let mut queue: VecDeque<OperationId> = remaining
            .iter()
            .filter(|(_, &count)| count == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut processed = 0usize;
        while let Some(id) = queue.pop_front() {
            processed += 1;
            for &child in &self.operations[&id].children {
                let count = remaining.get_mut(&child).unwrap();
                *count -= 1;
                if *count == 0 {
                    queue.push_back(child);
                }
            }
        }
        if processed != self.operations.len() {
            return Err(StateError::corrupt("operation graph contains a cycle"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(arguments: &str) -> CommandInfo {
        CommandInfo::new("/pkg", "/tools/compiler", arguments)
    }

    fn operation(id: u32, arguments: &str) -> OperationInfo {
        OperationInfo::new(OperationId(id), format!("op {}", id), command(arguments))
    }

    /// A(root) -> B -> C with consistent dependency counts.
    fn chain() -> OperationGraph {
        let mut graph = OperationGraph::new();
        let mut a = operation(1, "a");
        a.children = vec![OperationId(2)];
        let mut b = operation(2, "b");
        b.children = vec![OperationId(3)];
        b.dependency_count = 1;
        let mut c = operation(3, "c");
        c.dependency_count = 1;
        graph.add_operation(a).unwrap();
        graph.add_operation(b).unwrap();
        graph.add_operation(c).unwrap();
        graph.set_root_ids(vec![OperationId(1)]);
        graph
    }

    #[test]
    fn valid_chain_passes_validation() {
        chain().validate().unwrap();
    }

    #[test]
    fn find_by_command_uses_exact_identity() {
        let graph = chain();
        assert_eq!(graph.find_by_command(&command("b")), Some(OperationId(2)));
        assert_eq!(graph.find_by_command(&command("missing")), None);

        let mut different_cwd = command("b");
        different_cwd.working_directory = "/elsewhere".into();
        assert_eq!(graph.find_by_command(&different_cwd), None);
    }

    #[test]
    fn referenced_files_deduplicate_across_operations() {
        use crate::fs_state::FileSystemState;
        use std::path::Path;

        let mut state = FileSystemState::new();
        let source = state.to_id(Path::new("/pkg/src/a.cpp"));
        let object = state.to_id(Path::new("/pkg/out/a.o"));
        let binary = state.to_id(Path::new("/pkg/out/a"));

        let mut compile = operation(1, "compile");
        compile.declared_inputs = vec![source];
        compile.declared_outputs = vec![object];
        let mut link = operation(2, "link");
        link.declared_inputs = vec![object];
        link.declared_outputs = vec![binary];

        let mut graph = OperationGraph::new();
        graph.add_operation(compile).unwrap();
        graph.add_operation(link).unwrap();

        let referenced: Vec<_> = graph.referenced_file_ids().into_iter().collect();
        assert_eq!(referenced, vec![source, object, binary]);
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mut graph = OperationGraph::new();
        graph.add_operation(operation(1, "a")).unwrap();
        assert!(graph.add_operation(operation(1, "b")).is_err());
    }

    #[test]
    fn duplicate_command_is_rejected() {
        let mut graph = OperationGraph::new();
        graph.add_operation(operation(1, "same")).unwrap();
        assert!(graph.add_operation(operation(2, "same")).is_err());
    }

    #[test]
    fn unknown_child_fails_validation() {
        let mut graph = OperationGraph::new();
        let mut a = operation(1, "a");
        a.children = vec![OperationId(99)];
        graph.add_operation(a).unwrap();
        graph.set_root_ids(vec![OperationId(1)]);
        assert!(graph.validate().is_err());
    }

    #[test]
    fn unknown_root_fails_validation() {
        let mut graph = OperationGraph::new();
        graph.add_operation(operation(1, "a")).unwrap();
        graph.set_root_ids(vec![OperationId(7)]);
        assert!(graph.validate().is_err());
    }

    #[test]
    fn wrong_dependency_count_fails_validation() {
        let mut graph = OperationGraph::new();
        let mut a = operation(1, "a");
        a.children = vec![OperationId(2)];
        let b = operation(2, "b"); // dependency_count left at 0
        graph.add_operation(a).unwrap();
        graph.add_operation(b).unwrap();
        graph.set_root_ids(vec![OperationId(1)]);
        assert!(graph.validate().is_err());
    }

    #[test]
    fn cycle_fails_validation() {
        let mut graph = OperationGraph::new();
        let mut a = operation(1, "a");
        a.children = vec![OperationId(2)];
        a.dependency_count = 1;
        let mut b = operation(2, "b");
        b.children = vec![OperationId(1)];
        b.dependency_count = 1;
        graph.add_operation(a).unwrap();
        graph.add_operation(b).unwrap();
        graph.set_root_ids(vec![]);
        assert!(graph.validate().is_err());
    }
}
