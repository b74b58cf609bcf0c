//! Incremental execution of an operation graph.
//!
//! The evaluator walks the graph in dependency order with a single-threaded
//! ready queue. For every operation it first decides, from the prior result
//! and the current file observations, whether the operation can be skipped;
//! only when the evidence says otherwise does it execute the command under
//! the sandbox and record fresh observations. Children become runnable when
//! all of their parents have completed, whether those parents executed or
//! were skipped.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use log::{debug, info, trace, warn};

use soup_build_state::{
    ContentHash, FileId, FileObservation, FileSystem, FileSystemState, OperationGraph,
    OperationInfo, OperationResult, OperationResults,
};

use crate::error::BuildError;
use crate::sandbox::{Sandbox, SandboxRequest};

/// The evaluate contract shared by the Generate and Evaluate phases.
///
/// Returns whether any operation actually executed, so the caller knows the
/// paired results need to be persisted. On failure the engine has already
/// recorded a failed result for the offending operation; the caller owns
/// persisting partial state.
pub trait EvaluateEngine {
    fn evaluate(
        &mut self,
        graph: &OperationGraph,
        results: &mut OperationResults,
        state: &mut FileSystemState,
        temp_directory: &Path,
        allowed_reads: &[PathBuf],
        allowed_writes: &[PathBuf],
    ) -> Result<bool, BuildError>;

    /// Treat every prior result as absent in subsequent `evaluate` calls:
    /// every operation runs. The runner applies the caller's force-rebuild
    /// argument through this before building any package.
    fn set_force_rebuild(&mut self, force_rebuild: bool);
}

enum RunDecision {
    Skip,
    Run(&'static str),
}

/// The production evaluate engine.
pub struct Evaluator<S> {
    sandbox: S,
    file_system: Arc<dyn FileSystem>,
    force_rebuild: bool,
    cancellation: Arc<AtomicBool>,
}

impl<S: Sandbox> Evaluator<S> {
    pub fn new(sandbox: S, file_system: Arc<dyn FileSystem>) -> Evaluator<S> {
        Evaluator {
            sandbox,
            file_system,
            force_rebuild: false,
            cancellation: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cooperative cancellation flag. Setting it stops dispatch at the next
    /// dequeue; the in-flight operation runs to completion and its result
    /// is preserved.
    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancellation)
    }

    fn check_run_required(
        &self,
        operation: &OperationInfo,
        prior: Option<&OperationResult>,
        state: &mut FileSystemState,
    ) -> RunDecision {
        let prior = match prior {
            Some(prior) => prior,
            None => return RunDecision::Run("no previous result"),
        };
        if !prior.was_successful {
            return RunDecision::Run("previous run failed");
        }

        let outputs: BTreeSet<FileId> = operation
            .declared_outputs
            .iter()
            .chain(prior.observed_outputs.iter())
            .copied()
            .collect();
        for output in outputs {
            if let FileObservation::Missing = state.observe(output, self.file_system.as_ref()) {
                trace!("output missing: {}", state.to_path(output).display());
                return RunDecision::Run("output was deleted");
            }
        }

        let inputs: BTreeSet<FileId> = operation
            .declared_inputs
            .iter()
            .chain(prior.observed_inputs.iter())
            .copied()
            .collect();
        for input in inputs {
            match state.observe(input, self.file_system.as_ref()) {
                FileObservation::Missing => {
                    trace!("input missing: {}", state.to_path(input).display());
                    return RunDecision::Run("input is missing");
                }
                FileObservation::Present { last_write } if last_write > prior.evaluate_time => {
                    trace!("input changed: {}", state.to_path(input).display());
                    return RunDecision::Run("input changed");
                }
                FileObservation::Present { last_write } if last_write == prior.evaluate_time => {
                    // The write time alone cannot tell an in-place rewrite
                    // from an unchanged file; escalate to content evidence.
                    if let RunDecision::Run(reason) = self.check_tied_input(input, prior, state) {
                        trace!("input tied: {}", state.to_path(input).display());
                        return RunDecision::Run(reason);
                    }
                }
                FileObservation::Present { .. } => {}
            }
        }

        RunDecision::Skip
    }

    /// Stronger-evidence check for an input whose last write ties the prior
    /// evaluate time: skip only when the recorded content hash matches the
    /// file's current contents.
    fn check_tied_input(
        &self,
        input: FileId,
        prior: &OperationResult,
        state: &mut FileSystemState,
    ) -> RunDecision {
        let recorded = match prior.input_hashes.get(&input) {
            Some(recorded) => *recorded,
            None => return RunDecision::Run("input write time ties previous evaluation"),
        };
        match state.content_hash(input, self.file_system.as_ref()) {
            Ok(Some(current)) if current == recorded => RunDecision::Skip,
            Ok(_) => RunDecision::Run("input rewritten in place"),
            Err(error) => {
                warn!("failed to hash {}: {}", state.to_path(input).display(), error);
                RunDecision::Run("input could not be hashed")
            }
        }
    }

    fn run_operation(
        &mut self,
        operation: &OperationInfo,
        results: &mut OperationResults,
        state: &mut FileSystemState,
        temp_directory: &Path,
        allowed_reads: &[PathBuf],
        allowed_writes: &[PathBuf],
    ) -> Result<(), BuildError> {
        let request = SandboxRequest {
            working_directory: &operation.command.working_directory,
            executable: &operation.command.executable,
            arguments: &operation.command.arguments,
            allowed_reads,
            allowed_writes,
            temp_directory,
        };

        let outcome = match self.sandbox.run(&request) {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(
                    "failed to spawn {}: {}",
                    operation.command.executable.display(),
                    error
                );
                record_failure(results, operation);
                return Err(BuildError::BuildFailed);
            }
        };

        if !outcome.was_successful() {
            warn!("operation exited with {}: {}", outcome.exit_code, operation.title);
            record_failure(results, operation);
            return Err(BuildError::BuildFailed);
        }

        let observed_inputs: Vec<FileId> =
            outcome.observed_reads.iter().map(|path| state.to_id(path)).collect();
        let observed_outputs: Vec<FileId> =
            outcome.observed_writes.iter().map(|path| state.to_id(path)).collect();

        let evaluate_time = SystemTime::now();
        let input_hashes = self.collect_tied_input_hashes(
            operation,
            &observed_inputs,
            evaluate_time,
            state,
        );

        // Everything this operation may have written must be re-observed by
        // any consumer later in this pass.
        for &output in operation.declared_outputs.iter().chain(observed_outputs.iter()) {
            state.invalidate(output);
        }

        results.put(
            operation.id,
            OperationResult {
                was_successful: true,
                evaluate_time,
                observed_inputs,
                observed_outputs,
                input_hashes,
            },
        );
        Ok(())
    }

    /// Content hashes for the inputs whose write time ties the new evaluate
    /// time. Only those are ambiguous on the next skip decision, so only
    /// those pay for a hash.
    fn collect_tied_input_hashes(
        &self,
        operation: &OperationInfo,
        observed_inputs: &[FileId],
        evaluate_time: SystemTime,
        state: &mut FileSystemState,
    ) -> BTreeMap<FileId, ContentHash> {
        let inputs: BTreeSet<FileId> = operation
            .declared_inputs
            .iter()
            .chain(observed_inputs.iter())
            .copied()
            .collect();

        let mut hashes = BTreeMap::new();
        for input in inputs {
            if state.last_write(input, self.file_system.as_ref()) != Some(evaluate_time) {
                continue;
            }
            match state.content_hash(input, self.file_system.as_ref()) {
                Ok(Some(hash)) => {
                    hashes.insert(input, hash);
                }
                Ok(None) => {}
                Err(error) => {
                    warn!("failed to hash {}: {}", state.to_path(input).display(), error);
                }
            }
        }
        hashes
    }
}

fn record_failure(results: &mut OperationResults, operation: &OperationInfo) {
    results.put(
        operation.id,
        OperationResult {
            was_successful: false,
            evaluate_time: SystemTime::now(),
            observed_inputs: Vec::new(),
            observed_outputs: Vec::new(),
            input_hashes: BTreeMap::new(),
        },
    );
}

impl<S: Sandbox> EvaluateEngine for Evaluator<S> {
    fn evaluate(
        &mut self,
        graph: &OperationGraph,
        results: &mut OperationResults,
        state: &mut FileSystemState,
        temp_directory: &Path,
        allowed_reads: &[PathBuf],
        allowed_writes: &[PathBuf],
    ) -> Result<bool, BuildError> {
        graph.validate()?;

        // Observations are only valid within one pass; start fresh.
        state.invalidate_all();

        let mut remaining: HashMap<_, _> =
            graph.operations().map(|op| (op.id, op.dependency_count)).collect();
        let mut ready: VecDeque<_> = graph.root_ids().iter().copied().collect();
        let mut ran_any = false;

        while let Some(id) = ready.pop_front() {
            if self.cancellation.load(Ordering::SeqCst) {
                info!("evaluation cancelled before operation {}", id);
                return Err(BuildError::Cancelled);
            }

            let operation = graph.operation(id).expect("graph was validated");
            let decision = if self.force_rebuild {
                RunDecision::Run("forced rebuild")
            } else {
                self.check_run_required(operation, results.get(id), state)
            };

            match decision {
                RunDecision::Skip => trace!("up to date: {}", operation.title),
                RunDecision::Run(reason) => {
                    debug!("run required ({}): {}", reason, operation.title);
                    info!("{}", operation.title);
                    ran_any = true;
                    self.run_operation(
                        operation,
                        results,
                        state,
                        temp_directory,
                        allowed_reads,
                        allowed_writes,
                    )?;
                }
            }

            // Completion, not execution, is what releases children: a
            // skipped parent still unblocks its subtree.
            for &child in &operation.children {
                let count = remaining.get_mut(&child).expect("graph was validated");
                *count -= 1;
                if *count == 0 {
                    ready.push_back(child);
                }
            }
        }

        Ok(ran_any)
    }

    fn set_force_rebuild(&mut self, force_rebuild: bool) {
        self.force_rebuild = force_rebuild;
    }
}
