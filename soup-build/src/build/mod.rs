//! Dependency-ordered orchestration of package builds.
//!
//! The runner walks the resolved package graph children-first and drives
//! the Generate and Evaluate phases for each package exactly once per run.
//! For every package it materialises the generate parameter table and the
//! sandbox access sets, evaluates the single-operation generate graph,
//! reconciles prior results onto the freshly generated evaluate graph, and
//! evaluates that graph under the package sandbox. Results are persisted
//! after every evaluation, including partial failure; callers must not
//! assume any rollback on error.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use itertools::Itertools;
use log::{debug, error, info, trace, warn};

use soup_build_state::io;
use soup_build_state::{
    CommandInfo, FileSystem, FileSystemState, OperationGraph, OperationId, OperationInfo,
    OperationResults, StateError, Value, ValueList, ValueTable,
};

use crate::constants;
use crate::error::BuildError;
use crate::evaluate::EvaluateEngine;
use crate::packages::{PackageChildInfo, PackageGraph, PackageId, PackageInfo, PackageProvider, Recipe};

/// Root arguments for one build run.
#[derive(Debug, Clone)]
pub struct BuildArguments {
    /// The generator executable evaluated during the Generate phase. Its
    /// parent folder is granted read access to the generate sandbox.
    pub generate_executable: PathBuf,
    /// Treat every prior operation result as absent: every operation in
    /// every package runs, and prior results are overwritten.
    pub force_rebuild: bool,
    pub skip_generate: bool,
    pub skip_evaluate: bool,
}

/// The state a finished package publishes for its dependents.
#[derive(Debug, Clone)]
pub struct RecipeBuildCacheState {
    pub name: String,
    pub target_directory: PathBuf,
    pub soup_target_directory: PathBuf,
    pub recursive_child_target_directories: BTreeSet<PathBuf>,
}

/// Computes the per-package output root.
///
/// The output directory must be a pure function of the package root, the
/// recipe and the graph's global parameters, so that dependents arrive at
/// the same answer without consulting the package's build.
pub trait TargetLocationManager {
    fn output_directory(
        &self,
        package_root: &Path,
        recipe: &Recipe,
        global_parameters: &ValueTable,
    ) -> PathBuf;
}

/// Location manager placing output under
/// `<package-root>/out/<16-hex-digit fingerprint>`.
#[derive(Debug, Default)]
pub struct DefaultTargetLocationManager;

impl TargetLocationManager for DefaultTargetLocationManager {
    fn output_directory(
        &self,
        package_root: &Path,
        recipe: &Recipe,
        global_parameters: &ValueTable,
    ) -> PathBuf {
        let mut hasher = DefaultHasher::new();
        recipe.language.hash(&mut hasher);
        recipe.name.hash(&mut hasher);
        io::value::to_bytes(global_parameters).hash(&mut hasher);
        package_root.join("out").join(format!("{:016x}", hasher.finish()))
    }
}

/// The build runner that knows how to perform the correct build for a
/// package and all of its dependencies.
pub struct BuildRunner<'a> {
    arguments: &'a BuildArguments,

    // SDK parameters handed to every generator, and the shared access sets.
    sdk_parameters: ValueList,
    sdk_read_access: Vec<PathBuf>,
    system_read_access: Vec<PathBuf>,

    // Shared runtime.
    package_provider: &'a PackageProvider,
    evaluate_engine: &'a mut dyn EvaluateEngine,
    file_system_state: &'a mut FileSystemState,
    file_system: Arc<dyn FileSystem>,
    location_manager: &'a dyn TargetLocationManager,

    // Per-run state a package publishes for its dependents.
    build_cache: HashMap<PackageId, RecipeBuildCacheState>,
    packages_in_progress: HashSet<PackageId>,
}

impl<'a> BuildRunner<'a> {
    pub fn new(
        arguments: &'a BuildArguments,
        sdk_parameters: ValueList,
        sdk_read_access: Vec<PathBuf>,
        system_read_access: Vec<PathBuf>,
        package_provider: &'a PackageProvider,
        evaluate_engine: &'a mut dyn EvaluateEngine,
        file_system_state: &'a mut FileSystemState,
        file_system: Arc<dyn FileSystem>,
        location_manager: &'a dyn TargetLocationManager,
    ) -> BuildRunner<'a> {
        BuildRunner {
            arguments,
            sdk_parameters,
            sdk_read_access,
            system_read_access,
            package_provider,
            evaluate_engine,
            file_system_state,
            file_system,
            location_manager,
            build_cache: HashMap::new(),
            packages_in_progress: HashSet::new(),
        }
    }

    /// Builds the root package and all of its transitive dependencies.
    pub fn execute(&mut self) -> Result<(), BuildError> {
        self.evaluate_engine.set_force_rebuild(self.arguments.force_rebuild);

        let provider = self.package_provider;
        let package_graph = provider.root_package_graph()?;
        let package_info = provider.package_info(package_graph.root_package_id)?;
        self.build_package_and_dependencies(package_graph, package_info)
    }

    /// Build cache state published so far, keyed by package id.
    pub fn build_cache(&self) -> &HashMap<PackageId, RecipeBuildCacheState> {
        &self.build_cache
    }

    fn build_package_and_dependencies(
        &mut self,
        package_graph: &PackageGraph,
        package_info: &PackageInfo,
    ) -> Result<(), BuildError> {
        // The resolver owes us an acyclic graph; fail loudly if it lied.
        if !self.packages_in_progress.insert(package_info.id) {
            return Err(BuildError::CircularDependency(language_package_name(
                &package_info.recipe,
            )));
        }

        for children in package_info.dependencies.values() {
            for dependency in children {
                let provider = self.package_provider;
                if dependency.is_sub_graph {
                    // A sub-graph dependency builds under its own graph's
                    // global parameters.
                    let dependency_graph = provider.package_graph(dependency.package_graph_id)?;
                    let dependency_info =
                        provider.package_info(dependency_graph.root_package_id)?;
                    self.build_package_and_dependencies(dependency_graph, dependency_info)?;
                } else {
                    let dependency_info = provider.package_info(dependency.package_id)?;
                    self.build_package_and_dependencies(package_graph, dependency_info)?;
                }
            }
        }

        self.check_build_package(package_graph, package_info)?;
        self.packages_in_progress.remove(&package_info.id);
        Ok(())
    }

    /// Runs the package build unless another dependency path already built
    /// it during this run.
    fn check_build_package(
        &mut self,
        package_graph: &PackageGraph,
        package_info: &PackageInfo,
    ) -> Result<(), BuildError> {
        let name = language_package_name(&package_info.recipe);
        debug!("running build: {}", name);

        if self.build_cache.contains_key(&package_info.id) {
            debug!("recipe already built: {}", name);
            return Ok(());
        }
        self.run_build(package_graph, package_info)
    }

    /// Setup, Generate, Reconcile and Evaluate for a single package.
    fn run_build(
        &mut self,
        package_graph: &PackageGraph,
        package_info: &PackageInfo,
    ) -> Result<(), BuildError> {
        info!("Build '{}'", package_info.recipe.name);

        let target_directory = self.location_manager.output_directory(
            &package_info.package_root,
            &package_info.recipe,
            &package_graph.global_parameters,
        );
        let soup_target_directory = constants::soup_target_directory(&target_directory);

        let (direct_child_target_directories, recursive_child_target_directories) =
            self.child_target_directories(package_info)?;

        // SETUP: prior evaluate graph and results, if any survive scrutiny.
        debug!("checking for existing evaluate operation graph");
        let evaluate_graph_file = soup_target_directory.join(constants::EVALUATE_GRAPH_FILE_NAME);
        let previous_graph = discard_corrupt(
            io::graph::try_load(&evaluate_graph_file, &mut *self.file_system_state),
            &evaluate_graph_file,
        )?;

        let mut evaluate_results = OperationResults::new();
        if previous_graph.is_some() {
            debug!("previous graph found, checking for existing evaluate results");
            let evaluate_results_file =
                soup_target_directory.join(constants::EVALUATE_RESULTS_FILE_NAME);
            if let Some(previous_results) = discard_corrupt(
                io::results::try_load(&evaluate_results_file, &mut *self.file_system_state),
                &evaluate_results_file,
            )? {
                debug!("previous results found");
                evaluate_results = previous_results;
            }
        } else {
            debug!("no previous graph found");
        }
        let mut evaluate_graph = previous_graph.unwrap_or_default();

        // GENERATE
        if !self.arguments.skip_generate {
            let ran_generate = self.run_incremental_generate(
                package_graph,
                package_info,
                &target_directory,
                &soup_target_directory,
                &direct_child_target_directories,
                &recursive_child_target_directories,
            )?;

            // Load the fresh evaluate graph and carry forward every prior
            // result whose command survived regeneration.
            if ran_generate {
                debug!("loading new evaluate operation graph");
                let updated_graph =
                    io::graph::try_load(&evaluate_graph_file, &mut *self.file_system_state)?
                        .ok_or_else(|| {
                            BuildError::MissingEvaluateGraph(evaluate_graph_file.clone())
                        })?;

                trace!("mapping previous operation results onto the new graph");
                evaluate_results =
                    reconcile_results(&evaluate_graph, evaluate_results, &updated_graph);
                evaluate_graph = updated_graph;
            }
        }

        // EVALUATE
        if !self.arguments.skip_evaluate {
            self.run_evaluate(
                &evaluate_graph,
                &mut evaluate_results,
                &target_directory,
                &soup_target_directory,
            )?;
        }

        // Publish the build state for upstream dependents.
        self.build_cache.insert(
            package_info.id,
            RecipeBuildCacheState {
                name: package_info.recipe.name.clone(),
                target_directory,
                soup_target_directory,
                recursive_child_target_directories,
            },
        );
        Ok(())
    }

    /// Runs the Generate phase through the evaluate engine so an unchanged
    /// recipe and parameter set skips the generator process entirely.
    /// Returns whether the generator actually ran.
    fn run_incremental_generate(
        &mut self,
        package_graph: &PackageGraph,
        package_info: &PackageInfo,
        target_directory: &Path,
        soup_target_directory: &Path,
        direct_child_target_directories: &BTreeSet<PathBuf>,
        recursive_child_target_directories: &BTreeSet<PathBuf>,
    ) -> Result<bool, BuildError> {
        // The input parameters, starting from the graph's global set.
        let mut parameters = package_graph.global_parameters.clone();
        let language_extension_path = package_info
            .language_extension
            .as_ref()
            .map(|path| path_string(path))
            .unwrap_or_default();
        parameters.set("LanguageExtensionPath", Value::String(language_extension_path));
        parameters.set("PackageDirectory", Value::String(path_string(&package_info.package_root)));
        parameters.set("TargetDirectory", Value::String(path_string(target_directory)));
        parameters.set("SoupTargetDirectory", Value::String(path_string(soup_target_directory)));
        parameters
            .set("Dependencies", Value::Table(self.dependencies_parameters_table(package_info)?));
        parameters.set("SDKs", Value::List(self.sdk_parameters.clone()));

        let parameters_file = soup_target_directory.join(constants::GENERATE_PARAMETERS_FILE_NAME);
        debug!("check outdated parameters file: {}", parameters_file.display());
        if self.is_outdated_parameters(&parameters, &parameters_file)? {
            info!("saving updated parameters file");
            io::value::save(&parameters_file, &parameters)?;
        }

        // Access sets for the upcoming Evaluate phase, persisted so the
        // generator can embed them into the plan it produces.
        let mut evaluate_allowed_reads: Vec<PathBuf> = Vec::new();
        evaluate_allowed_reads.extend(self.sdk_read_access.iter().cloned());
        evaluate_allowed_reads.extend(recursive_child_target_directories.iter().cloned());
        evaluate_allowed_reads.push(package_info.package_root.clone());
        evaluate_allowed_reads.push(target_directory.to_owned());
        let evaluate_allowed_writes = vec![target_directory.to_owned()];

        let read_access_file =
            soup_target_directory.join(constants::GENERATE_READ_ACCESS_FILE_NAME);
        debug!("check outdated read access file: {}", read_access_file.display());
        if self.is_outdated_path_list(&evaluate_allowed_reads, &read_access_file)? {
            info!("saving updated read access file");
            io::path_list::save(&read_access_file, &evaluate_allowed_reads)?;
        }

        let write_access_file =
            soup_target_directory.join(constants::GENERATE_WRITE_ACCESS_FILE_NAME);
        debug!("check outdated write access file: {}", write_access_file.display());
        if self.is_outdated_path_list(&evaluate_allowed_writes, &write_access_file)? {
            info!("saving updated write access file");
            io::path_list::save(&write_access_file, &evaluate_allowed_writes)?;
        }

        // The generate phase is itself a one-operation graph evaluated
        // through the same engine.
        let generate_executable = self.arguments.generate_executable.clone();
        let generate_folder =
            generate_executable.parent().map(Path::to_owned).unwrap_or_else(|| PathBuf::from("."));
        let generate_operation_id = OperationId(1);
        let generate_operation = OperationInfo::new(
            generate_operation_id,
            format!("Generate: {}", language_package_name(&package_info.recipe)),
            CommandInfo::new(
                package_info.package_root.clone(),
                generate_executable,
                path_string(soup_target_directory),
            ),
        );
        let mut generate_graph = OperationGraph::new();
        generate_graph.add_operation(generate_operation)?;
        generate_graph.set_root_ids(vec![generate_operation_id]);

        // The generator reads its own folder, the language extension, the
        // platform runtime, the package sources, the target directory and
        // the direct child targets; it writes only the target directory.
        let mut generate_allowed_reads = vec![generate_folder];
        if let Some(extension) = &package_info.language_extension {
            if let Some(parent) = extension.parent() {
                generate_allowed_reads.push(parent.to_owned());
            }
        }
        generate_allowed_reads.extend(self.system_read_access.iter().cloned());
        generate_allowed_reads.push(package_info.package_root.clone());
        generate_allowed_reads.push(target_directory.to_owned());
        generate_allowed_reads.extend(direct_child_target_directories.iter().cloned());
        let generate_allowed_writes = vec![target_directory.to_owned()];
        trace!(
            "generate read access: {}",
            generate_allowed_reads.iter().map(|path| path.display().to_string()).sorted().join(", ")
        );

        debug!("checking for existing generate operation results");
        let generate_results_file =
            soup_target_directory.join(constants::GENERATE_RESULTS_FILE_NAME);
        let mut generate_results = discard_corrupt(
            io::results::try_load(&generate_results_file, &mut *self.file_system_state),
            &generate_results_file,
        )?
        .unwrap_or_default();

        let temporary_directory = constants::temporary_directory(target_directory);
        let evaluated = self.evaluate_engine.evaluate(
            &generate_graph,
            &mut generate_results,
            &mut *self.file_system_state,
            &temporary_directory,
            &generate_allowed_reads,
            &generate_allowed_writes,
        );

        match evaluated {
            Ok(ran_generate) => {
                if ran_generate {
                    io::results::save(
                        &generate_results_file,
                        &generate_results,
                        &generate_graph,
                        &*self.file_system_state,
                    )?;
                }
                Ok(ran_generate)
            }
            Err(error) => {
                if matches!(error, BuildError::BuildFailed | BuildError::Cancelled) {
                    info!("saving partial generate state");
                    io::results::save(
                        &generate_results_file,
                        &generate_results,
                        &generate_graph,
                        &*self.file_system_state,
                    )?;
                }
                Err(error)
            }
        }
    }

    /// Evaluates the package's operation graph under the package sandbox.
    fn run_evaluate(
        &mut self,
        evaluate_graph: &OperationGraph,
        evaluate_results: &mut OperationResults,
        target_directory: &Path,
        soup_target_directory: &Path,
    ) -> Result<(), BuildError> {
        let temporary_directory = constants::temporary_directory(target_directory);

        let mut allowed_reads: Vec<PathBuf> = Vec::new();
        allowed_reads.extend(self.system_read_access.iter().cloned());
        allowed_reads.extend(self.sdk_read_access.iter().cloned());
        allowed_reads.push(temporary_directory.clone());
        let allowed_writes = vec![temporary_directory.clone(), target_directory.to_owned()];
        trace!(
            "evaluate read access: {}",
            allowed_reads.iter().map(|path| path.display().to_string()).sorted().join(", ")
        );

        if !self.file_system.exists(&temporary_directory) {
            info!("create directory: {}", temporary_directory.display());
            self.file_system.create_dir_all(&temporary_directory)?;
        }

        let evaluate_results_file =
            soup_target_directory.join(constants::EVALUATE_RESULTS_FILE_NAME);
        let evaluated = self.evaluate_engine.evaluate(
            evaluate_graph,
            evaluate_results,
            &mut *self.file_system_state,
            &temporary_directory,
            &allowed_reads,
            &allowed_writes,
        );

        match evaluated {
            Ok(ran_evaluate) => {
                if ran_evaluate {
                    info!("saving updated build state");
                    io::results::save(
                        &evaluate_results_file,
                        evaluate_results,
                        evaluate_graph,
                        &*self.file_system_state,
                    )?;
                }
                Ok(())
            }
            Err(error) => {
                if matches!(error, BuildError::BuildFailed | BuildError::Cancelled) {
                    info!("saving partial build state");
                    io::results::save(
                        &evaluate_results_file,
                        evaluate_results,
                        evaluate_graph,
                        &*self.file_system_state,
                    )?;
                }
                Err(error)
            }
        }
    }

    /// Compares the assembled parameter table against the persisted copy.
    /// Unreadable prior state counts as outdated.
    fn is_outdated_parameters(
        &self,
        parameters: &ValueTable,
        parameters_file: &Path,
    ) -> Result<bool, BuildError> {
        match io::value::try_load(parameters_file) {
            Ok(Some(previous)) => Ok(previous != *parameters),
            Ok(None) => Ok(true),
            Err(error) if error.is_recoverable() => {
                warn!(
                    "discarding unusable state file {}: {}",
                    parameters_file.display(),
                    error
                );
                Ok(true)
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Order-sensitive comparison against the persisted path list: sandbox
    /// ordering can matter to downstream tooling, so a reorder invalidates.
    fn is_outdated_path_list(
        &self,
        paths: &[PathBuf],
        path_list_file: &Path,
    ) -> Result<bool, BuildError> {
        match io::path_list::try_load(path_list_file) {
            Ok(Some(previous)) => Ok(previous != paths),
            Ok(None) => Ok(true),
            Err(error) if error.is_recoverable() => {
                warn!(
                    "discarding unusable state file {}: {}",
                    path_list_file.display(),
                    error
                );
                Ok(true)
            }
            Err(error) => Err(error.into()),
        }
    }

    /// The `Dependencies` parameter table: one sub-table per dependency
    /// kind, each mapping the child's name to its reference and target
    /// directories.
    fn dependencies_parameters_table(
        &self,
        package_info: &PackageInfo,
    ) -> Result<ValueTable, BuildError> {
        let mut result = ValueTable::new();
        for (dependency_type, children) in &package_info.dependencies {
            let mut type_table = ValueTable::new();
            for dependency in children {
                let dependency_info = self.dependency_package_info(dependency)?;
                let state = self.cached_build_state(dependency_info)?;

                let mut entry = ValueTable::new();
                entry.set("Reference", Value::String(dependency.original_reference.clone()));
                entry.set("TargetDirectory", Value::String(path_string(&state.target_directory)));
                entry.set(
                    "SoupTargetDirectory",
                    Value::String(path_string(&state.soup_target_directory)),
                );
                type_table.set(state.name.clone(), Value::Table(entry));
            }
            result.set(dependency_type.clone(), Value::Table(type_table));
        }
        Ok(result)
    }

    /// Direct and recursive child target directory sets from the build
    /// cache of the already-built dependencies.
    fn child_target_directories(
        &self,
        package_info: &PackageInfo,
    ) -> Result<(BTreeSet<PathBuf>, BTreeSet<PathBuf>), BuildError> {
        let mut direct = BTreeSet::new();
        let mut recursive = BTreeSet::new();
        for children in package_info.dependencies.values() {
            for dependency in children {
                let dependency_info = self.dependency_package_info(dependency)?;
                let state = self.cached_build_state(dependency_info)?;

                direct.insert(state.target_directory.clone());
                recursive.insert(state.target_directory.clone());
                recursive.extend(state.recursive_child_target_directories.iter().cloned());
            }
        }
        Ok((direct, recursive))
    }

    fn dependency_package_info(
        &self,
        dependency: &PackageChildInfo,
    ) -> Result<&'a PackageInfo, BuildError> {
        let provider = self.package_provider;
        let package_id = if dependency.is_sub_graph {
            provider.package_graph(dependency.package_graph_id)?.root_package_id
        } else {
            dependency.package_id
        };
        provider.package_info(package_id)
    }

    fn cached_build_state(
        &self,
        package_info: &PackageInfo,
    ) -> Result<&RecipeBuildCacheState, BuildError> {
        self.build_cache.get(&package_info.id).ok_or_else(|| {
            error!(
                "dependency does not exist in build cache: {}",
                package_info.package_root.display()
            );
            BuildError::DependencyNotBuilt(package_info.package_root.clone())
        })
    }
}

/// Carries prior results onto a regenerated graph by command identity:
/// every result whose command still appears in the new graph moves over
/// under the new operation id, everything else is dropped.
fn reconcile_results(
    previous_graph: &OperationGraph,
    mut previous_results: OperationResults,
    updated_graph: &OperationGraph,
) -> OperationResults {
    let mut updated_results = OperationResults::new();
    for operation in updated_graph.operations() {
        if let Some(previous_id) = previous_graph.find_by_command(&operation.command) {
            if let Some(result) = previous_results.remove(previous_id) {
                updated_results.put(operation.id, result);
            }
        }
    }
    updated_results
}

fn language_package_name(recipe: &Recipe) -> String {
    format!("{}|{}", recipe.language, recipe.name)
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn discard_corrupt<T>(
    loaded: Result<Option<T>, StateError>,
    path: &Path,
) -> Result<Option<T>, BuildError> {
    match loaded {
        Ok(value) => Ok(value),
        Err(error) if error.is_recoverable() => {
            warn!("discarding unusable state file {}: {}", path.display(), error);
            Ok(None)
        }
        Err(error) => Err(error.into()),
    }
}
