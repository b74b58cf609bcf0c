use std::io;
use std::path::PathBuf;

use thiserror::Error;

use soup_build_state::StateError;

use crate::packages::{PackageGraphId, PackageId};

/// Errors surfaced by the build runner and the evaluate engine.
///
/// `BuildFailed` and `Cancelled` leave partial results persisted; callers
/// must not assume any state was rolled back. Corrupt persisted state never
/// reaches this enum; the runner discards it and proceeds as a first
/// build. A `State` error here is therefore always fatal (I/O while
/// persisting, or a corrupt graph freshly produced by a generator).
#[derive(Debug, Error)]
pub enum BuildError {
    /// An operation exited non-zero or violated its sandbox.
    #[error("build failed")]
    BuildFailed,

    /// Generate ran but did not produce the expected evaluate graph.
    #[error("missing required evaluate operation graph after generate: {}", .0.display())]
    MissingEvaluateGraph(PathBuf),

    /// The runner consulted the build cache for a package that has not been
    /// built yet. The resolver hands the runner a complete graph, so this
    /// is a programmer error.
    #[error("dependency does not exist in build cache: {}", .0.display())]
    DependencyNotBuilt(PathBuf),

    /// A package depends on itself through some chain of references.
    #[error("circular package reference: {0}")]
    CircularDependency(String),

    /// Caller-requested cancellation; dispatching stopped at a dequeue.
    #[error("build cancelled")]
    Cancelled,

    #[error("package graph id {0} not found in lookup")]
    PackageGraphNotFound(PackageGraphId),

    #[error("package id {0} not found in lookup")]
    PackageNotFound(PackageId),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Io(#[from] io::Error),
}
