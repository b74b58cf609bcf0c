//! The resolved package graph consumed by the build runner.
//!
//! Resolution (recipe discovery, lock files, version selection, cycle
//! detection) happens in an external resolver; the runner receives the
//! finished product. The in-memory model mirrors what the resolver hands
//! over: one root package graph, a lookup of graphs (each with its own
//! global parameters), and a lookup of packages with typed dependency
//! edges. Lookup failures are fatal.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Context;
use serde_derive::Deserialize;

use soup_build_state::{Value, ValueTable};

use crate::error::BuildError;

pub type PackageId = u32;
pub type PackageGraphId = u32;

/// The slice of the user-authored recipe the core needs: identity only.
/// Parsing the full recipe is the resolver's job.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Recipe {
    pub name: String,
    pub language: String,
}

/// One resolved dependency edge.
///
/// `package_graph_id` is only meaningful when `is_sub_graph` is set; a
/// sub-graph dependency is built under its own graph's global parameters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PackageChildInfo {
    pub original_reference: String,
    #[serde(default)]
    pub is_sub_graph: bool,
    #[serde(default)]
    pub package_id: PackageId,
    #[serde(default)]
    pub package_graph_id: PackageGraphId,
}

/// Dependency kind (`Runtime`, `Build`, `Test`, …) to resolved children.
pub type PackageChildrenMap = BTreeMap<String, Vec<PackageChildInfo>>;

#[derive(Debug)]
pub struct PackageInfo {
    pub id: PackageId,
    pub package_root: PathBuf,
    pub recipe: Recipe,
    pub language_extension: Option<PathBuf>,
    pub dependencies: PackageChildrenMap,
}

#[derive(Debug)]
pub struct PackageGraph {
    pub id: PackageGraphId,
    pub root_package_id: PackageId,
    pub global_parameters: ValueTable,
}

/// In-memory view of everything the resolver produced for one build.
#[derive(Debug)]
pub struct PackageProvider {
    root_package_graph_id: PackageGraphId,
    graphs: BTreeMap<PackageGraphId, PackageGraph>,
    packages: BTreeMap<PackageId, PackageInfo>,
}

impl PackageProvider {
    pub fn new(
        root_package_graph_id: PackageGraphId,
        graphs: BTreeMap<PackageGraphId, PackageGraph>,
        packages: BTreeMap<PackageId, PackageInfo>,
    ) -> PackageProvider {
        PackageProvider { root_package_graph_id, graphs, packages }
    }

    /// Ingests the resolver's JSON output.
    pub fn from_json(json: &str) -> anyhow::Result<PackageProvider> {
        let raw: RawPackageProvider =
            serde_json::from_str(json).context("invalid package provider")?;

        let mut graphs = BTreeMap::new();
        for graph in raw.graphs {
            let global_parameters = table_from_json(&graph.global_parameters)
                .with_context(|| format!("invalid global parameters for graph {}", graph.id))?;
            graphs.insert(
                graph.id,
                PackageGraph { id: graph.id, root_package_id: graph.root_package_id, global_parameters },
            );
        }

        let mut packages = BTreeMap::new();
        for package in raw.packages {
            packages.insert(
                package.id,
                PackageInfo {
                    id: package.id,
                    package_root: package.package_root,
                    recipe: package.recipe,
                    language_extension: package.language_extension,
                    dependencies: package.dependencies,
                },
            );
        }

        Ok(PackageProvider::new(raw.root_package_graph_id, graphs, packages))
    }

    pub fn root_package_graph(&self) -> Result<&PackageGraph, BuildError> {
        self.package_graph(self.root_package_graph_id)
    }

    pub fn package_graph(&self, id: PackageGraphId) -> Result<&PackageGraph, BuildError> {
        self.graphs.get(&id).ok_or(BuildError::PackageGraphNotFound(id))
    }

    pub fn package_info(&self, id: PackageId) -> Result<&PackageInfo, BuildError> {
        self.packages.get(&id).ok_or(BuildError::PackageNotFound(id))
    }
}

#[derive(Debug, Deserialize)]
struct RawPackageProvider {
    root_package_graph_id: PackageGraphId,
    graphs: Vec<RawPackageGraph>,
    packages: Vec<RawPackageInfo>,
}

#[derive(Debug, Deserialize)]
struct RawPackageGraph {
    id: PackageGraphId,
    root_package_id: PackageId,
    #[serde(default)]
    global_parameters: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawPackageInfo {
    id: PackageId,
    package_root: PathBuf,
    recipe: Recipe,
    #[serde(default)]
    language_extension: Option<PathBuf>,
    #[serde(default)]
    dependencies: PackageChildrenMap,
}

fn table_from_json(map: &serde_json::Map<String, serde_json::Value>) -> anyhow::Result<ValueTable> {
    let mut table = ValueTable::new();
    for (key, value) in map {
        table.set(key.clone(), value_from_json(value).with_context(|| format!("key {:?}", key))?);
    }
    Ok(table)
}

fn value_from_json(value: &serde_json::Value) -> anyhow::Result<Value> {
    use serde_json::Value as Json;
    Ok(match value {
        Json::Bool(value) => Value::Boolean(*value),
        Json::String(value) => Value::String(value.clone()),
        Json::Number(number) => match number.as_i64() {
            Some(value) => Value::Integer(value),
            None => Value::Float(
                number.as_f64().context("number is representable neither as i64 nor f64")?,
            ),
        },
        Json::Array(values) => {
            Value::List(values.iter().map(value_from_json).collect::<anyhow::Result<_>>()?)
        }
        Json::Object(map) => Value::Table(table_from_json(map)?),
        Json::Null => anyhow::bail!("null is not a representable parameter value"),
    })
}
