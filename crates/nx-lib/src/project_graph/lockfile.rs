//! npm lockfile ingestion. Only the `packages` map of a v2/v3
//! `package-lock.json` is read; everything else is passed over.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use super::{ExternalNode, EXTERNAL_NODE_PREFIX};
use crate::config::ConfigError;

#[derive(Debug, Default, Deserialize)]
struct NpmLockfile {
    #[serde(rename = "lockfileVersion", default)]
    lockfile_version: i64,
    #[serde(default)]
    packages: BTreeMap<String, NpmPackage>,
    // Older lockfiles carry a `dependencies` tree; parse it so it doesn't
    // trip strictness, but v1-only lockfiles produce no external nodes.
    #[serde(default)]
    #[allow(dead_code)]
    dependencies: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct NpmPackage {
    version: Option<String>,
    integrity: Option<String>,
}

/// Produces the external node set from `package-lock.json` text. Every
/// hoisted top-level `node_modules/<name>` entry becomes an `npm:<name>`
/// node; nested copies keep the graph small and are skipped.
pub fn external_nodes_from_lockfile(
    text: &str,
) -> Result<BTreeMap<String, ExternalNode>, ConfigError> {
    let lockfile: NpmLockfile =
        serde_json::from_str(text).map_err(|err| ConfigError::Shape {
            path: "package-lock.json".to_string(),
            message: err.to_string(),
        })?;

    if lockfile.lockfile_version < 2 {
        return Ok(BTreeMap::new());
    }

    let mut nodes = BTreeMap::new();
    for (key, package) in &lockfile.packages {
        let Some(name) = key.strip_prefix("node_modules/") else {
            continue;
        };
        if name.contains("node_modules/") {
            continue;
        }
        let Some(version) = &package.version else {
            continue;
        };
        let id = format!("{EXTERNAL_NODE_PREFIX}{name}");
        nodes.insert(
            id.clone(),
            ExternalNode {
                name: id,
                version: version.clone(),
                hash: package.integrity.clone(),
            },
        );
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_level_packages_become_external_nodes() {
        let lockfile = r#"{
            "name": "fixture",
            "lockfileVersion": 3,
            "packages": {
                "": { "name": "fixture" },
                "node_modules/lodash": {
                    "version": "4.17.21",
                    "integrity": "sha512-abc"
                },
                "node_modules/@scope/pkg": { "version": "1.0.0" },
                "node_modules/a/node_modules/b": { "version": "9.9.9" }
            }
        }"#;
        let nodes = external_nodes_from_lockfile(lockfile).unwrap();
        assert_eq!(nodes.len(), 2);
        let lodash = &nodes["npm:lodash"];
        assert_eq!(lodash.version, "4.17.21");
        assert_eq!(lodash.hash.as_deref(), Some("sha512-abc"));
        assert!(nodes.contains_key("npm:@scope/pkg"));
    }

    #[test]
    fn test_v1_lockfiles_are_skipped() {
        let lockfile = r#"{ "lockfileVersion": 1, "dependencies": { "lodash": { "version": "4.0.0" } } }"#;
        assert!(external_nodes_from_lockfile(lockfile).unwrap().is_empty());
    }
}
