//! End-to-end build runner tests.
//!
//! These drive the real runner against a temp workspace with real persisted
//! state files; only the sandbox is scripted. The fake toolchain's
//! generator writes a genuine `EvaluateGraph` through the state crate's
//! writer, and its build tool copies real files, so incrementality is
//! exercised against actual on-disk observations.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

use soup_build::build::{
    BuildArguments, BuildRunner, RecipeBuildCacheState, TargetLocationManager,
};
use soup_build::constants;
use soup_build::error::BuildError;
use soup_build::evaluate::Evaluator;
use soup_build::packages::{
    PackageChildInfo, PackageGraph, PackageId, PackageInfo, PackageProvider, Recipe,
};
use soup_build::sandbox::{Sandbox, SandboxOutcome, SandboxRequest};
use soup_build::{FileSystem, FileSystemState, RealFileSystem, Value, ValueTable};
use soup_build_state::io::{graph as graph_io, results as results_io, value as value_io};
use soup_build_state::{CommandInfo, OperationGraph, OperationId, OperationInfo};

const GENERATOR: &str = "/tools/generate/soup-generate";
const BUILD_TOOL: &str = "/tools/do";

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Puts every package's output at `<package-root>/out` so tests can predict
/// target directories regardless of global parameters.
struct FixedLocationManager;

impl TargetLocationManager for FixedLocationManager {
    fn output_directory(
        &self,
        package_root: &Path,
        _recipe: &Recipe,
        _global_parameters: &ValueTable,
    ) -> PathBuf {
        package_root.join("out")
    }
}

/// Scripted sandbox playing both the generator and the build tool.
///
/// The generator writes a one-operation evaluate graph whose operation
/// copies `src/input.txt` into `<target>/<package>.out`; the build tool
/// performs that copy for real.
struct FakeToolchain {
    executed: Rc<RefCell<Vec<String>>>,
    emit_graph: bool,
    fail_build_commands: bool,
}

impl FakeToolchain {
    fn new() -> FakeToolchain {
        FakeToolchain {
            executed: Rc::new(RefCell::new(Vec::new())),
            emit_graph: true,
            fail_build_commands: false,
        }
    }

    fn executions(&self) -> Rc<RefCell<Vec<String>>> {
        Rc::clone(&self.executed)
    }

    fn run_generator(&self, request: &SandboxRequest<'_>) -> io::Result<SandboxOutcome> {
        if !self.emit_graph {
            return Ok(SandboxOutcome { exit_code: 0, ..SandboxOutcome::default() });
        }

        let soup_directory = PathBuf::from(request.arguments);
        let target_directory =
            soup_directory.parent().expect("soup directory has a parent").to_owned();
        let package_directory = request.working_directory.to_owned();
        let package_name = package_directory
            .file_name()
            .expect("package directory has a name")
            .to_string_lossy()
            .into_owned();

        let input = package_directory.join("src").join("input.txt");
        let output = target_directory.join(format!("{}.out", package_name));

        let mut state = FileSystemState::new();
        let input_id = state.to_id(&input);
        let output_id = state.to_id(&output);

        let mut operation = OperationInfo::new(
            OperationId(1),
            format!("Build {}", package_name),
            CommandInfo::new(
                package_directory,
                PathBuf::from(BUILD_TOOL),
                format!("copy {} {}", input.display(), output.display()),
            ),
        );
        operation.declared_inputs = vec![input_id];
        operation.declared_outputs = vec![output_id];

        let mut graph = OperationGraph::new();
        graph.add_operation(operation).expect("fresh graph accepts the operation");
        graph.set_root_ids(vec![OperationId(1)]);

        let graph_file = soup_directory.join(constants::EVALUATE_GRAPH_FILE_NAME);
        graph_io::save(&graph_file, &graph, &state).expect("generator writes the graph");

        let parameters_file = soup_directory.join(constants::GENERATE_PARAMETERS_FILE_NAME);
        Ok(SandboxOutcome {
            exit_code: 0,
            observed_reads: vec![parameters_file],
            observed_writes: vec![graph_file],
        })
    }

    fn run_build_tool(&self, request: &SandboxRequest<'_>) -> io::Result<SandboxOutcome> {
        if self.fail_build_commands {
            return Ok(SandboxOutcome { exit_code: 1, ..SandboxOutcome::default() });
        }

        let mut words = request.arguments.split_whitespace();
        assert_eq!(words.next(), Some("copy"));
        let input = PathBuf::from(words.next().expect("copy has an input"));
        let output = PathBuf::from(words.next().expect("copy has an output"));

        let contents = fs::read(&input)?;
        fs::write(&output, contents)?;
        Ok(SandboxOutcome {
            exit_code: 0,
            observed_reads: vec![input],
            observed_writes: vec![output],
        })
    }
}

impl Sandbox for FakeToolchain {
    fn run(&mut self, request: &SandboxRequest<'_>) -> io::Result<SandboxOutcome> {
        if request.executable == Path::new(GENERATOR) {
            self.executed.borrow_mut().push(format!("generate {}", request.arguments));
            self.run_generator(request)
        } else {
            self.executed.borrow_mut().push(format!("tool {}", request.arguments));
            self.run_build_tool(request)
        }
    }
}

fn make_package_root(workspace: &Path, name: &str) -> PathBuf {
    let root = workspace.join(name);
    fs::create_dir_all(root.join("src")).unwrap();
    fs::write(root.join("src").join("input.txt"), format!("contents of {}", name)).unwrap();
    root
}

fn package(id: PackageId, root: &Path, name: &str) -> PackageInfo {
    PackageInfo {
        id,
        package_root: root.to_owned(),
        recipe: Recipe { name: name.to_owned(), language: "C++".to_owned() },
        language_extension: None,
        dependencies: BTreeMap::new(),
    }
}

fn graph(id: u32, root_package_id: PackageId, flavor: &str) -> PackageGraph {
    let mut global_parameters = ValueTable::new();
    global_parameters.set("Flavor", Value::from(flavor));
    PackageGraph { id, root_package_id, global_parameters }
}

fn arguments() -> BuildArguments {
    BuildArguments {
        generate_executable: PathBuf::from(GENERATOR),
        force_rebuild: false,
        skip_generate: false,
        skip_evaluate: false,
    }
}

/// App (graph 1) with a runtime dependency on Lib through a sub-graph
/// (graph 2) that carries its own global parameters.
fn app_with_lib_provider(app_root: &Path, lib_root: &Path) -> PackageProvider {
    let mut app = package(10, app_root, "App");
    app.dependencies.insert(
        "Runtime".to_owned(),
        vec![PackageChildInfo {
            original_reference: "Lib@1.0".to_owned(),
            is_sub_graph: true,
            package_id: 0,
            package_graph_id: 2,
        }],
    );
    let lib = package(11, lib_root, "Lib");

    PackageProvider::new(
        1,
        vec![(1, graph(1, 10, "debug")), (2, graph(2, 11, "release"))].into_iter().collect(),
        vec![(10, app), (11, lib)].into_iter().collect(),
    )
}

fn execute(
    provider: &PackageProvider,
    toolchain: FakeToolchain,
    arguments: &BuildArguments,
) -> (Result<(), BuildError>, Rc<RefCell<Vec<String>>>, HashMap<PackageId, RecipeBuildCacheState>)
{
    let executed = toolchain.executions();
    let file_system: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
    let mut evaluator = Evaluator::new(toolchain, Arc::clone(&file_system));
    let mut file_system_state = FileSystemState::new();
    let location_manager = FixedLocationManager;
    let mut runner = BuildRunner::new(
        arguments,
        Vec::new(),
        Vec::new(),
        Vec::new(),
        provider,
        &mut evaluator,
        &mut file_system_state,
        file_system,
        &location_manager,
    );
    let result = runner.execute();
    let build_cache = runner.build_cache().clone();
    (result, executed, build_cache)
}

#[test]
fn builds_dependencies_first_and_second_run_does_nothing() {
    init_logging();
    let workspace = tempfile::tempdir().unwrap();
    let app_root = make_package_root(workspace.path(), "App");
    let lib_root = make_package_root(workspace.path(), "Lib");

    let provider = app_with_lib_provider(&app_root, &lib_root);

    let (result, executed, build_cache) = execute(&provider, FakeToolchain::new(), &arguments());
    result.unwrap();

    // Both packages published their build state for dependents.
    assert_eq!(build_cache.len(), 2);
    let lib_state = &build_cache[&11];
    assert_eq!(lib_state.name, "Lib");
    assert_eq!(lib_state.target_directory, lib_root.join("out"));

    // Children before parents: Lib's generate and build run before App's.
    let runs = executed.borrow().clone();
    assert_eq!(runs.len(), 4);
    assert!(runs[0].starts_with("generate") && runs[0].contains("Lib"));
    assert!(runs[1].starts_with("tool") && runs[1].contains("Lib.out"));
    assert!(runs[2].starts_with("generate") && runs[2].contains("App"));
    assert!(runs[3].starts_with("tool") && runs[3].contains("App.out"));

    assert_eq!(
        fs::read(lib_root.join("out").join("Lib.out")).unwrap(),
        b"contents of Lib".to_vec()
    );
    assert_eq!(
        fs::read(app_root.join("out").join("App.out")).unwrap(),
        b"contents of App".to_vec()
    );

    // The dependency parameters surfaced Lib's target directories to App.
    let app_parameters = value_io::try_load(
        &app_root.join("out").join(constants::SOUP_TARGET_DIRECTORY).join(constants::GENERATE_PARAMETERS_FILE_NAME),
    )
    .unwrap()
    .unwrap();
    let lib_entry = app_parameters
        .get("Dependencies")
        .and_then(Value::as_table)
        .and_then(|table| table.get("Runtime"))
        .and_then(Value::as_table)
        .and_then(|table| table.get("Lib"))
        .and_then(Value::as_table)
        .expect("App parameters carry the Lib dependency");
    assert_eq!(lib_entry.get("Reference").and_then(Value::as_str), Some("Lib@1.0"));
    let lib_target = lib_root.join("out").to_string_lossy().into_owned();
    assert_eq!(lib_entry.get("TargetDirectory").and_then(Value::as_str), Some(lib_target.as_str()));

    // A second run in a fresh process finds everything up to date.
    let (result, executed, _) = execute(&provider, FakeToolchain::new(), &arguments());
    result.unwrap();
    assert!(executed.borrow().is_empty(), "second run executed {:?}", executed.borrow());
}

#[test]
fn force_rebuild_reruns_every_operation() {
    init_logging();
    let workspace = tempfile::tempdir().unwrap();
    let app_root = make_package_root(workspace.path(), "App");
    let lib_root = make_package_root(workspace.path(), "Lib");
    let provider = app_with_lib_provider(&app_root, &lib_root);

    let (result, executed, _) = execute(&provider, FakeToolchain::new(), &arguments());
    result.unwrap();
    assert_eq!(executed.borrow().len(), 4);

    // The pass that would otherwise be a no-op reruns every operation,
    // generate included, exactly once per package.
    let mut forced = arguments();
    forced.force_rebuild = true;
    let (result, executed, _) = execute(&provider, FakeToolchain::new(), &forced);
    result.unwrap();

    let runs = executed.borrow().clone();
    assert_eq!(runs.len(), 4, "forced run executed {:?}", runs);
    assert!(runs[0].starts_with("generate") && runs[0].contains("Lib"));
    assert!(runs[1].starts_with("tool") && runs[1].contains("Lib.out"));
    assert!(runs[2].starts_with("generate") && runs[2].contains("App"));
    assert!(runs[3].starts_with("tool") && runs[3].contains("App.out"));
    assert!(app_root.join("out").join("App.out").exists());
}

#[test]
fn changed_global_parameters_rerun_generate_but_reconcile_spares_the_plan() {
    init_logging();
    let workspace = tempfile::tempdir().unwrap();
    let app_root = make_package_root(workspace.path(), "App");

    let debug_provider = PackageProvider::new(
        1,
        vec![(1, graph(1, 10, "debug"))].into_iter().collect(),
        vec![(10, package(10, &app_root, "App"))].into_iter().collect(),
    );
    let (result, executed, _) = execute(&debug_provider, FakeToolchain::new(), &arguments());
    result.unwrap();
    assert_eq!(executed.borrow().len(), 2);

    // Same package, new global parameters: the parameters file is rewritten
    // and generate reruns, but the regenerated plan has the same command,
    // so the carried-forward result lets the build operation skip.
    let release_provider = PackageProvider::new(
        1,
        vec![(1, graph(1, 10, "release"))].into_iter().collect(),
        vec![(10, package(10, &app_root, "App"))].into_iter().collect(),
    );
    let (result, executed, _) = execute(&release_provider, FakeToolchain::new(), &arguments());
    result.unwrap();

    let runs = executed.borrow().clone();
    assert_eq!(runs.len(), 1, "only generate reruns: {:?}", runs);
    assert!(runs[0].starts_with("generate"));

    let parameters = value_io::try_load(
        &app_root.join("out").join(constants::SOUP_TARGET_DIRECTORY).join(constants::GENERATE_PARAMETERS_FILE_NAME),
    )
    .unwrap()
    .unwrap();
    assert_eq!(parameters.get("Flavor").and_then(Value::as_str), Some("release"));
}

#[test]
fn generator_that_produces_no_graph_is_fatal() {
    init_logging();
    let workspace = tempfile::tempdir().unwrap();
    let app_root = make_package_root(workspace.path(), "App");

    let provider = PackageProvider::new(
        1,
        vec![(1, graph(1, 10, "debug"))].into_iter().collect(),
        vec![(10, package(10, &app_root, "App"))].into_iter().collect(),
    );

    let mut toolchain = FakeToolchain::new();
    toolchain.emit_graph = false;
    let (result, _, _) = execute(&provider, toolchain, &arguments());
    match result {
        Err(BuildError::MissingEvaluateGraph(_)) => {}
        other => panic!("expected MissingEvaluateGraph, got {:?}", other),
    }
}

#[test]
fn failed_operation_persists_partial_results_and_recovers_next_run() {
    init_logging();
    let workspace = tempfile::tempdir().unwrap();
    let app_root = make_package_root(workspace.path(), "App");
    let soup_directory = app_root.join("out").join(constants::SOUP_TARGET_DIRECTORY);

    let provider = PackageProvider::new(
        1,
        vec![(1, graph(1, 10, "debug"))].into_iter().collect(),
        vec![(10, package(10, &app_root, "App"))].into_iter().collect(),
    );

    let mut toolchain = FakeToolchain::new();
    toolchain.fail_build_commands = true;
    let (result, _, _) = execute(&provider, toolchain, &arguments());
    match result {
        Err(BuildError::BuildFailed) => {}
        other => panic!("expected BuildFailed, got {:?}", other),
    }

    // The failed result was persisted before surfacing the error.
    let mut state = FileSystemState::new();
    let results = results_io::try_load(
        &soup_directory.join(constants::EVALUATE_RESULTS_FILE_NAME),
        &mut state,
    )
    .unwrap()
    .expect("partial results were persisted");
    assert!(!results.get(OperationId(1)).unwrap().was_successful);

    // The failed prior result forces a rerun; generate is still up to date.
    let (result, executed, _) = execute(&provider, FakeToolchain::new(), &arguments());
    result.unwrap();
    let runs = executed.borrow().clone();
    assert_eq!(runs.len(), 1, "only the failed operation reruns: {:?}", runs);
    assert!(runs[0].starts_with("tool"));
    assert!(app_root.join("out").join("App.out").exists());
}

#[test]
fn skip_evaluate_generates_the_plan_but_runs_nothing() {
    init_logging();
    let workspace = tempfile::tempdir().unwrap();
    let app_root = make_package_root(workspace.path(), "App");
    let soup_directory = app_root.join("out").join(constants::SOUP_TARGET_DIRECTORY);

    let provider = PackageProvider::new(
        1,
        vec![(1, graph(1, 10, "debug"))].into_iter().collect(),
        vec![(10, package(10, &app_root, "App"))].into_iter().collect(),
    );

    let mut build_arguments = arguments();
    build_arguments.skip_evaluate = true;
    let (result, executed, _) = execute(&provider, FakeToolchain::new(), &build_arguments);
    result.unwrap();

    let runs = executed.borrow().clone();
    assert_eq!(runs.len(), 1);
    assert!(runs[0].starts_with("generate"));
    assert!(soup_directory.join(constants::EVALUATE_GRAPH_FILE_NAME).exists());
    assert!(!app_root.join("out").join("App.out").exists());
}

#[test]
fn circular_package_references_fail_loudly() {
    init_logging();
    let workspace = tempfile::tempdir().unwrap();
    let app_root = make_package_root(workspace.path(), "App");

    let mut app = package(10, &app_root, "App");
    app.dependencies.insert(
        "Runtime".to_owned(),
        vec![PackageChildInfo {
            original_reference: "App@1.0".to_owned(),
            is_sub_graph: false,
            package_id: 10,
            package_graph_id: 0,
        }],
    );

    let provider = PackageProvider::new(
        1,
        vec![(1, graph(1, 10, "debug"))].into_iter().collect(),
        vec![(10, app)].into_iter().collect(),
    );

    let (result, executed, _) = execute(&provider, FakeToolchain::new(), &arguments());
    match result {
        Err(BuildError::CircularDependency(name)) => assert!(name.contains("App")),
        other => panic!("expected CircularDependency, got {:?}", other),
    }
    assert!(executed.borrow().is_empty());
}
