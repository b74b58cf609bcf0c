//! The soup-build orchestrator.
//!
//! Given a resolved package graph, the build runner walks packages in
//! dependency order and drives a two-phase pipeline per package: a Generate
//! phase turns the recipe and its resolved inputs into a concrete operation
//! graph, and an Evaluate phase executes that graph incrementally,
//! re-running only operations whose observed inputs or commands changed
//! since the last successful run. All persistent state lives in the
//! `soup-build-state` crate and is written under each package's `.soup/`
//! directory.
//!
//! Recipe parsing, package resolution, CLI handling and the syscall-level
//! sandbox are external collaborators; this crate consumes their contracts
//! (see `packages::PackageProvider` and `sandbox::Sandbox`).

#![warn(rust_2018_idioms)]

pub use soup_build_state::{
    FileSystem, FileSystemState, OperationGraph, OperationResults, RealFileSystem, Value,
    ValueList, ValueTable,
};

pub mod build;
pub mod constants;
pub mod error;
pub mod evaluate;
pub mod packages;
pub mod sandbox;

pub use crate::build::{BuildArguments, BuildRunner};
pub use crate::error::BuildError;
pub use crate::evaluate::{EvaluateEngine, Evaluator};
