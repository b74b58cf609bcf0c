use std::io;

use thiserror::Error;

/// Errors surfaced by the persistent state stores.
///
/// Absence of a state file is not an error: loaders return `Ok(None)` for a
/// missing file. `VersionMismatch` and `Corrupt` are recoverable from the
/// orchestrator's point of view (the prior state is discarded and the build
/// proceeds as a first build); `Io` is not.
#[derive(Debug, Error)]
pub enum StateError {
    /// The file carried an unknown magic or an unsupported format version.
    #[error("state file version mismatch (expected {expected}, found {found})")]
    VersionMismatch { expected: u32, found: u32 },

    /// The file had the right header but an invalid shape.
    #[error("corrupt state file: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StateError {
    /// Whether a caller may treat the load as "no prior state" and proceed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            StateError::VersionMismatch { .. } | StateError::Corrupt(_) => true,
            StateError::Io(_) => false,
        }
    }

    pub(crate) fn corrupt(message: impl Into<String>) -> StateError {
        StateError::Corrupt(message.into())
    }
}
