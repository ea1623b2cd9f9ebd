//! Persisted project graph, keyed by an aggregate input hash.

use nx_hash::{ContentHasher, FileHasher};
use nxpath::{AbsoluteSystemPath, AbsoluteSystemPathBuf};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{plugins::PluginRegistry, ProjectGraph};

const GRAPH_CACHE_VERSION: &str = "1.0.0";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphCacheFile {
    version: String,
    hash: String,
    #[serde(flatten)]
    graph: ProjectGraph,
}

/// Computes the hash the cached graph is keyed by: the workspace manifest,
/// the plugin list, the lockfile, and the aggregate of all tracked files.
pub fn graph_input_hash(
    repo_root: &AbsoluteSystemPath,
    registry: &PluginRegistry,
    file_hasher: &FileHasher,
) -> String {
    let mut hasher = ContentHasher::new();
    let manifest = repo_root
        .join_component(crate::config::WORKSPACE_CONFIG_FILENAME)
        .read_to_string()
        .unwrap_or_default();
    hasher.put_section("manifest", nx_hash::hash_bytes(manifest));
    for spec in registry.plugin_specs() {
        hasher.put_section("plugin", format!("{}{}", spec.name, spec.options));
    }
    let lockfile = repo_root
        .join_component("package-lock.json")
        .read_to_string()
        .unwrap_or_default();
    hasher.put_section("lockfile", nx_hash::hash_bytes(lockfile));
    hasher.put_section("files", file_hasher.aggregate_hash());
    hasher.finish()
}

pub struct ProjectGraphCache {
    path: AbsoluteSystemPathBuf,
}

impl ProjectGraphCache {
    pub fn new(repo_root: &AbsoluteSystemPath) -> Self {
        Self {
            path: repo_root.join_components(&[".nx", "cache", "graph.json"]),
        }
    }

    /// Returns the cached graph when its version and hash match.
    pub fn read(&self, expected_hash: &str) -> Option<ProjectGraph> {
        let text = self.path.read_to_string().ok()?;
        let cached: GraphCacheFile = serde_json::from_str(&text).ok()?;
        if cached.version != GRAPH_CACHE_VERSION || cached.hash != expected_hash {
            debug!("project graph cache is stale");
            return None;
        }
        Some(cached.graph)
    }

    /// Writes atomically: temp file, then rename.
    pub fn write(&self, graph: &ProjectGraph, hash: &str) -> std::io::Result<()> {
        let parent = match self.path.parent() {
            Some(parent) => parent,
            None => return Ok(()),
        };
        parent.create_dir_all()?;
        let file = GraphCacheFile {
            version: GRAPH_CACHE_VERSION.to_string(),
            hash: hash.to_string(),
            graph: graph.clone(),
        };
        let contents = serde_json::to_string_pretty(&file)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        let temp = parent.join_component(&format!(".graph.json.{}.tmp", std::process::id()));
        temp.create_with_contents(contents)?;
        temp.rename(&self.path)
    }

    /// Drops the persisted graph; the next invocation rebuilds.
    pub fn invalidate(&self) -> std::io::Result<()> {
        match self.path.remove_file() {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use nxpath::RelativeUnixPathBuf;

    use super::*;
    use crate::project_graph::{Project, ProjectType};

    fn graph() -> ProjectGraph {
        let mut graph = ProjectGraph::default();
        graph.nodes.insert(
            "a".into(),
            Project {
                name: "a".into(),
                root: RelativeUnixPathBuf::new("packages/a").unwrap(),
                project_type: ProjectType::Lib,
                source_root: None,
                tags: Vec::new(),
                targets: BTreeMap::new(),
                implicit_dependencies: Vec::new(),
                named_inputs: BTreeMap::new(),
            },
        );
        graph
    }

    #[test]
    fn test_round_trip_and_hash_check() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsoluteSystemPathBuf::from_std_path(dir.path()).unwrap();
        let cache = ProjectGraphCache::new(&root);

        assert!(cache.read("h1").is_none());
        cache.write(&graph(), "h1").unwrap();
        let loaded = cache.read("h1").expect("hash matches");
        assert!(loaded.nodes.contains_key("a"));
        assert!(cache.read("h2").is_none(), "stale hash must miss");

        cache.invalidate().unwrap();
        assert!(cache.read("h1").is_none());
        // invalidating twice is fine
        cache.invalidate().unwrap();
    }

    #[test]
    fn test_cache_file_shape() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsoluteSystemPathBuf::from_std_path(dir.path()).unwrap();
        let cache = ProjectGraphCache::new(&root);
        cache.write(&graph(), "abc123").unwrap();

        let raw: serde_json::Value = serde_json::from_str(
            &root
                .join_components(&[".nx", "cache", "graph.json"])
                .read_to_string()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(raw["version"], GRAPH_CACHE_VERSION);
        assert_eq!(raw["hash"], "abc123");
        assert!(raw["nodes"].is_object());
        assert!(raw["externalNodes"].is_object());
        assert!(raw["dependencies"].is_object());
    }
}
