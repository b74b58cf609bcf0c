//! Well-known file names and sub-paths for persisted build state.
//!
//! Everything the core persists for a package lives under
//! `<target-directory>/.soup/`; the scratch directory shared by all of a
//! package's operations lives under `<target-directory>/temp/`.

use std::path::{Path, PathBuf};

pub const SOUP_TARGET_DIRECTORY: &str = ".soup";
pub const TEMPORARY_FOLDER_NAME: &str = "temp";

pub const EVALUATE_GRAPH_FILE_NAME: &str = "EvaluateGraph";
pub const EVALUATE_RESULTS_FILE_NAME: &str = "EvaluateResults";
pub const GENERATE_PARAMETERS_FILE_NAME: &str = "GenerateParameters";
pub const GENERATE_RESULTS_FILE_NAME: &str = "GenerateResults";
pub const GENERATE_READ_ACCESS_FILE_NAME: &str = "GenerateReadAccessList";
pub const GENERATE_WRITE_ACCESS_FILE_NAME: &str = "GenerateWriteAccessList";

pub fn soup_target_directory(target_directory: &Path) -> PathBuf {
    target_directory.join(SOUP_TARGET_DIRECTORY)
}

pub fn temporary_directory(target_directory: &Path) -> PathBuf {
    target_directory.join(TEMPORARY_FOLDER_NAME)
}
