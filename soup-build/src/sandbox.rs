//! The sandbox contract consumed by the evaluate engine.
//!
//! A sandbox runs one command to completion with an allow list of readable
//! and writable paths and reports, after exit, which paths were actually
//! read and written. Those observations are the ground truth for the next
//! incremental decision. A read or write outside the allow lists must force
//! a non-zero exit code; the evaluator treats a violation and an ordinary
//! failure identically.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{debug, trace};

/// One command execution request.
#[derive(Debug)]
pub struct SandboxRequest<'a> {
    pub working_directory: &'a Path,
    pub executable: &'a Path,
    pub arguments: &'a str,
    pub allowed_reads: &'a [PathBuf],
    pub allowed_writes: &'a [PathBuf],
    /// Scratch directory, implicitly readable and writable.
    pub temp_directory: &'a Path,
}

/// What the sandbox saw the command do.
#[derive(Debug, Default)]
pub struct SandboxOutcome {
    pub exit_code: i32,
    pub observed_reads: Vec<PathBuf>,
    pub observed_writes: Vec<PathBuf>,
}

impl SandboxOutcome {
    pub fn was_successful(&self) -> bool {
        self.exit_code == 0
    }
}

/// File-system access enforcer capability.
///
/// A spawn failure is an `Err`; the evaluator treats it as an operation
/// failure, the same as a non-zero exit.
pub trait Sandbox {
    fn run(&mut self, request: &SandboxRequest<'_>) -> io::Result<SandboxOutcome>;
}

/// Sandbox that spawns the command synchronously with no syscall
/// instrumentation.
///
/// Without instrumentation there is nothing to observe and nothing to
/// enforce, so the outcome carries empty observation sets and only the exit
/// code; the declared inputs and outputs on each operation still drive
/// incrementality. Enforcing sandboxes are external collaborators that
/// implement the same trait.
#[derive(Debug, Default)]
pub struct ProcessSandbox;

impl Sandbox for ProcessSandbox {
    fn run(&mut self, request: &SandboxRequest<'_>) -> io::Result<SandboxOutcome> {
        trace!(
            "spawn {} {} (cwd {})",
            request.executable.display(),
            request.arguments,
            request.working_directory.display()
        );

        let status = Command::new(request.executable)
            .args(request.arguments.split_whitespace())
            .current_dir(request.working_directory)
            .status()?;

        let exit_code = status.code().unwrap_or(-1);
        debug!("{} exited with {}", request.executable.display(), exit_code);
        Ok(SandboxOutcome { exit_code, ..SandboxOutcome::default() })
    }
}
