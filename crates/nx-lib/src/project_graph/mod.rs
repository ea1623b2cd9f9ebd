//! The project graph: first-party projects, external packages, and the
//! edges between them. A graph value is immutable once built; a new snapshot
//! supersedes it.

mod builder;
pub mod cache;
mod lockfile;
mod locator;
pub mod plugins;

use std::collections::{BTreeMap, HashMap};

pub use builder::ProjectGraphBuilder;
pub use cache::ProjectGraphCache;
pub use lockfile::external_nodes_from_lockfile;
pub use locator::{ProjectLocator, Resolution};
use miette::Diagnostic;
use nx_scanner::ImportKind;
use nxpath::{RelativeUnixPath, RelativeUnixPathBuf};
use petgraph::graph::Graph;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::TargetConfig;

pub const EXTERNAL_NODE_PREFIX: &str = "npm:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectType {
    App,
    Lib,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub name: String,
    /// Workspace-relative root, unix separators (the persisted form).
    pub root: RelativeUnixPathBuf,
    #[serde(rename = "type")]
    pub project_type: ProjectType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_root: Option<RelativeUnixPathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub targets: BTreeMap<String, TargetConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub implicit_dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub named_inputs: BTreeMap<String, Vec<String>>,
}

/// An installed third-party package, id `npm:<name>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalNode {
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    Static,
    Dynamic,
    Implicit,
}

impl EdgeKind {
    pub fn from_import(kind: ImportKind) -> Self {
        if kind.is_dynamic() {
            EdgeKind::Dynamic
        } else {
            EdgeKind::Static
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub kind: EdgeKind,
    /// The source file the dependency was discovered in, when it came from
    /// an import.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_file: Option<RelativeUnixPathBuf>,
}

#[derive(Debug, Error, Diagnostic)]
pub enum ProjectGraphError {
    #[error("the project graph has a cycle: {}", path.join(" -> "))]
    #[diagnostic(code(project_graph_cycle))]
    Cycle { path: Vec<String> },
    #[error("external package {source_pkg} cannot depend on workspace project {target}")]
    ExternalEdge { source_pkg: String, target: String },
    #[error("edge references unknown node {0}")]
    UnknownNode(String),
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error("unable to hash workspace files: {0}")]
    Hash(#[from] nx_hash::Error),
    #[error(transparent)]
    Plugin(#[from] plugins::PluginError),
    #[error("io error while building the project graph: {0}")]
    IO(#[from] std::io::Error),
    #[error("invalid path in workspace: {0}")]
    Path(#[from] nxpath::PathError),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectGraph {
    pub nodes: BTreeMap<String, Project>,
    pub external_nodes: BTreeMap<String, ExternalNode>,
    pub dependencies: BTreeMap<String, Vec<Edge>>,
}

impl ProjectGraph {
    pub fn project(&self, name: &str) -> Option<&Project> {
        self.nodes.get(name)
    }

    pub fn edges_of(&self, name: &str) -> &[Edge] {
        self.dependencies
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Direct first-party dependencies of a project.
    pub fn immediate_dependencies(&self, name: &str) -> Vec<&str> {
        let mut deps: Vec<&str> = self
            .edges_of(name)
            .iter()
            .filter(|edge| self.nodes.contains_key(&edge.target))
            .map(|edge| edge.target.as_str())
            .collect();
        deps.sort();
        deps.dedup();
        deps
    }

    /// The project owning `file`: the one whose root is the longest matching
    /// prefix.
    pub fn project_for_file(&self, file: &RelativeUnixPath) -> Option<&Project> {
        self.nodes
            .values()
            .filter(|project| project.root.contains(file))
            .max_by_key(|project| project.root.as_str().len())
    }

    /// Validates the structural invariants:
    /// - edges reference known nodes,
    /// - external packages never depend on first-party projects,
    /// - the static first-party subgraph is acyclic.
    pub fn validate(&self) -> Result<(), ProjectGraphError> {
        for (source, edges) in &self.dependencies {
            for edge in edges {
                let source_is_external = self.external_nodes.contains_key(source);
                let target_is_first_party = self.nodes.contains_key(&edge.target);
                if !target_is_first_party && !self.external_nodes.contains_key(&edge.target) {
                    return Err(ProjectGraphError::UnknownNode(edge.target.clone()));
                }
                if source_is_external && target_is_first_party {
                    return Err(ProjectGraphError::ExternalEdge {
                        source_pkg: source.clone(),
                        target: edge.target.clone(),
                    });
                }
            }
        }

        let mut graph: Graph<&str, ()> = Graph::new();
        let mut indices = HashMap::new();
        for name in self.nodes.keys() {
            indices.insert(name.as_str(), graph.add_node(name.as_str()));
        }
        for (source, edges) in &self.dependencies {
            let Some(&source_index) = indices.get(source.as_str()) else {
                continue;
            };
            for edge in edges {
                if edge.kind != EdgeKind::Static {
                    continue;
                }
                if let Some(&target_index) = indices.get(edge.target.as_str()) {
                    if source_index != target_index {
                        graph.add_edge(source_index, target_index, ());
                    }
                }
            }
        }
        nx_graph_utils::validate_graph(&graph).map_err(|err| ProjectGraphError::Cycle {
            path: err.cycle_path().to_vec(),
        })
    }
}
