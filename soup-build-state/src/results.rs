//! Per-operation observation records from previous Evaluate passes.

use std::collections::BTreeMap;
use std::time::SystemTime;

use crate::fs_state::{ContentHash, FileId};
use crate::operation::OperationId;

/// What actually happened the last time an operation was evaluated.
///
/// The observed sets come from the sandbox and are the ground truth for the
/// next incremental decision; the declared sets on the operation are only
/// hints. `input_hashes` carries content evidence for the inputs whose
/// observed write time tied the evaluate time, so the next skip decision
/// can tell an in-place rewrite from an unchanged file.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationResult {
    pub was_successful: bool,
    pub evaluate_time: SystemTime,
    pub observed_inputs: Vec<FileId>,
    pub observed_outputs: Vec<FileId>,
    pub input_hashes: BTreeMap<FileId, ContentHash>,
}

/// Result store keyed by operation id.
///
/// Absence of an entry means the operation has never been evaluated
/// successfully under the current graph.
#[derive(Debug, Default)]
pub struct OperationResults {
    results: BTreeMap<OperationId, OperationResult>,
}

impl OperationResults {
    pub fn new() -> OperationResults {
        OperationResults::default()
    }

    pub fn get(&self, id: OperationId) -> Option<&OperationResult> {
        self.results.get(&id)
    }

    /// Inserts or replaces the result for `id`.
    pub fn put(&mut self, id: OperationId, result: OperationResult) {
        self.results.insert(id, result);
    }

    pub fn remove(&mut self, id: OperationId) -> Option<OperationResult> {
        self.results.remove(&id)
    }

    /// Iterates results in operation-id order.
    pub fn iter(&self) -> impl Iterator<Item = (OperationId, &OperationResult)> {
        self.results.iter().map(|(&id, result)| (id, result))
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}
