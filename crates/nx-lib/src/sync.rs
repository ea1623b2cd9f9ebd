//! Root tsconfig project-reference sync.
//!
//! Keeps the root `tsconfig.json` `references` array in step with the
//! project graph: existing entries are preserved (even ones pointing at
//! directories that no longer exist; removing them is the user's call),
//! and missing project roots are appended uniquely in sorted order.

use nxpath::RelativeUnixPath;
use serde_json::{json, Value};

use crate::{config::parse_jsonc, project_graph::ProjectGraph, tree::FsTree};

const ROOT_TSCONFIG: &str = "tsconfig.json";

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("unable to parse {ROOT_TSCONFIG}: {0}")]
    Parse(String),
    #[error("io error during sync: {0}")]
    IO(#[from] std::io::Error),
}

/// Stages the reference sync into the tree. Returns whether anything
/// changed.
pub fn sync_root_tsconfig_references(
    tree: &mut FsTree,
    graph: &ProjectGraph,
) -> Result<bool, SyncError> {
    let tsconfig_path = RelativeUnixPath::new(ROOT_TSCONFIG).expect("static path is relative");
    let text = tree
        .read_to_string(tsconfig_path)
        .unwrap_or_else(|| "{}".to_string());
    let mut tsconfig =
        parse_jsonc(&text, ROOT_TSCONFIG).map_err(|err| SyncError::Parse(err.to_string()))?;
    if tsconfig.is_null() {
        tsconfig = json!({});
    }

    let references = tsconfig
        .as_object_mut()
        .ok_or_else(|| SyncError::Parse("root tsconfig is not an object".to_string()))?
        .entry("references")
        .or_insert_with(|| json!([]));
    let Some(references) = references.as_array_mut() else {
        return Err(SyncError::Parse("references is not an array".to_string()));
    };

    let existing: Vec<String> = references
        .iter()
        .filter_map(|reference| reference.get("path"))
        .filter_map(|path| path.as_str().map(normalize_reference))
        .collect();

    let mut missing: Vec<&str> = graph
        .nodes
        .values()
        .map(|project| project.root.as_str())
        .filter(|root| !root.is_empty())
        .filter(|root| !existing.iter().any(|entry| entry == root))
        .collect();
    missing.sort();
    missing.dedup();

    if missing.is_empty() {
        return Ok(false);
    }
    for root in missing {
        references.push(json!({ "path": root }));
    }

    let mut serialized =
        serde_json::to_string_pretty(&tsconfig).map_err(|err| SyncError::Parse(err.to_string()))?;
    serialized.push('\n');
    tree.write(tsconfig_path, serialized);
    Ok(true)
}

// references may be written as "./packages/a"; compare them in the graph's
// root form
fn normalize_reference(path: &str) -> String {
    path.trim_start_matches("./").trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use nxpath::{AbsoluteSystemPathBuf, RelativeUnixPathBuf};

    use super::*;
    use crate::project_graph::{Project, ProjectType};

    fn graph_with(roots: &[(&str, &str)]) -> ProjectGraph {
        let mut graph = ProjectGraph::default();
        for (name, root) in roots {
            graph.nodes.insert(
                name.to_string(),
                Project {
                    name: name.to_string(),
                    root: RelativeUnixPathBuf::new(root.to_string()).unwrap(),
                    project_type: ProjectType::Lib,
                    source_root: None,
                    tags: Vec::new(),
                    targets: BTreeMap::new(),
                    implicit_dependencies: Vec::new(),
                    named_inputs: BTreeMap::new(),
                },
            );
        }
        graph
    }

    fn workspace() -> (tempfile::TempDir, AbsoluteSystemPathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsoluteSystemPathBuf::from_std_path(dir.path()).unwrap();
        (dir, root)
    }

    fn committed_references(root: &AbsoluteSystemPathBuf) -> Vec<String> {
        let text = root.join_component(ROOT_TSCONFIG).read_to_string().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        value["references"]
            .as_array()
            .unwrap()
            .iter()
            .map(|reference| reference["path"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_fresh_tsconfig_gets_sorted_references() {
        let (_dir, root) = workspace();
        root.join_component(ROOT_TSCONFIG)
            .create_with_contents("{}")
            .unwrap();
        let graph = graph_with(&[("b", "packages/b"), ("a", "packages/a")]);

        let mut tree = FsTree::new(&root);
        assert!(sync_root_tsconfig_references(&mut tree, &graph).unwrap());
        tree.commit().unwrap();

        assert_eq!(
            committed_references(&root),
            vec!["packages/a".to_string(), "packages/b".to_string()]
        );
    }

    #[test]
    fn test_existing_references_preserved_and_appended_uniquely() {
        let (_dir, root) = workspace();
        root.join_component(ROOT_TSCONFIG)
            .create_with_contents(
                r#"{
                    // keep the dangling reference: pruning is not ours to do
                    "references": [
                        { "path": "packages/c" },
                        { "path": "packages/a" }
                    ]
                }"#,
            )
            .unwrap();
        let graph = graph_with(&[("a", "packages/a"), ("b", "packages/b")]);

        let mut tree = FsTree::new(&root);
        assert!(sync_root_tsconfig_references(&mut tree, &graph).unwrap());
        tree.commit().unwrap();

        assert_eq!(
            committed_references(&root),
            vec![
                "packages/c".to_string(),
                "packages/a".to_string(),
                "packages/b".to_string()
            ]
        );
    }

    #[test]
    fn test_no_changes_when_up_to_date() {
        let (_dir, root) = workspace();
        root.join_component(ROOT_TSCONFIG)
            .create_with_contents(r#"{ "references": [{ "path": "packages/a" }] }"#)
            .unwrap();
        let graph = graph_with(&[("a", "packages/a")]);

        let mut tree = FsTree::new(&root);
        assert!(!sync_root_tsconfig_references(&mut tree, &graph).unwrap());
    }
}
