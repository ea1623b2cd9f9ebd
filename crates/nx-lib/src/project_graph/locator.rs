//! Maps a module specifier to the project (or external package) it refers
//! to.

use std::collections::BTreeMap;

use nxpath::{RelativeUnixPath, RelativeUnixPathBuf};

use super::{ExternalNode, Project, EXTERNAL_NODE_PREFIX};
use crate::config::parse_jsonc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Project(String),
    External(String),
    Unresolved,
}

#[derive(Debug, Clone)]
pub struct PathMapping {
    /// A compiler path pattern, optionally ending in `/*`.
    pub pattern: String,
    /// Files the pattern points at, workspace-relative.
    pub targets: Vec<String>,
}

/// Reads `compilerOptions.paths` out of the workspace base tsconfig.
pub fn path_mappings_from_tsconfig(text: &str, path: &str) -> Vec<PathMapping> {
    let Ok(value) = parse_jsonc(text, path) else {
        return Vec::new();
    };
    let Some(paths) = value
        .get("compilerOptions")
        .and_then(|options| options.get("paths"))
        .and_then(|paths| paths.as_object())
    else {
        return Vec::new();
    };
    paths
        .iter()
        .map(|(pattern, targets)| PathMapping {
            pattern: pattern.clone(),
            targets: targets
                .as_array()
                .map(|array| {
                    array
                        .iter()
                        .filter_map(|target| target.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
        })
        .collect()
}

pub struct ProjectLocator<'a> {
    projects: &'a BTreeMap<String, Project>,
    external_nodes: &'a BTreeMap<String, ExternalNode>,
    path_mappings: &'a [PathMapping],
}

impl<'a> ProjectLocator<'a> {
    pub fn new(
        projects: &'a BTreeMap<String, Project>,
        external_nodes: &'a BTreeMap<String, ExternalNode>,
        path_mappings: &'a [PathMapping],
    ) -> Self {
        Self {
            projects,
            external_nodes,
            path_mappings,
        }
    }

    /// Resolution order: compiler path mappings, installed packages,
    /// relative specifiers, then unresolved. Ties on owning project go to
    /// the longest matching root prefix.
    pub fn locate(&self, specifier: &str, source_file: &RelativeUnixPath) -> Resolution {
        if let Some(mapped) = self.match_path_mappings(specifier) {
            if let Some(project) = self.owning_project(&mapped) {
                return Resolution::Project(project.to_string());
            }
            return Resolution::Unresolved;
        }

        if !specifier.starts_with('.') {
            let package = package_name_of(specifier);
            let id = format!("{EXTERNAL_NODE_PREFIX}{package}");
            if self.external_nodes.contains_key(&id) {
                return Resolution::External(id);
            }
            return Resolution::Unresolved;
        }

        let base = parent_of(source_file.as_str());
        let Some(resolved) = normalize_join(base, specifier) else {
            return Resolution::Unresolved;
        };
        match self.owning_project_str(&resolved) {
            Some(project) => Resolution::Project(project.to_string()),
            None => Resolution::Unresolved,
        }
    }

    fn match_path_mappings(&self, specifier: &str) -> Option<RelativeUnixPathBuf> {
        for mapping in self.path_mappings {
            let target = if let Some(prefix) = mapping.pattern.strip_suffix("/*") {
                let rest = specifier.strip_prefix(prefix)?.strip_prefix('/');
                match rest {
                    Some(rest) => mapping
                        .targets
                        .first()
                        .map(|target| target.replace('*', rest)),
                    None => continue,
                }
            } else if mapping.pattern == specifier {
                mapping.targets.first().cloned()
            } else {
                continue;
            };
            if let Some(target) = target {
                return RelativeUnixPathBuf::new(target).ok();
            }
        }
        None
    }

    fn owning_project(&self, file: &RelativeUnixPath) -> Option<&str> {
        self.projects
            .values()
            .filter(|project| project.root.contains(file))
            .max_by_key(|project| project.root.as_str().len())
            .map(|project| project.name.as_str())
    }

    fn owning_project_str(&self, file: &str) -> Option<&str> {
        let file = RelativeUnixPath::new(file).ok()?;
        self.owning_project(file)
    }
}

fn package_name_of(specifier: &str) -> &str {
    let mut segments = specifier.splitn(3, '/');
    match (segments.next(), segments.next()) {
        (Some(scope), Some(name)) if scope.starts_with('@') => {
            &specifier[..scope.len() + 1 + name.len()]
        }
        (Some(name), _) => name,
        (None, _) => specifier,
    }
}

fn parent_of(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

/// Joins `specifier` onto `base` and normalizes `.` and `..` segments. A
/// specifier escaping the workspace root yields `None`.
fn normalize_join(base: &str, specifier: &str) -> Option<String> {
    let mut segments: Vec<&str> = base.split('/').filter(|s| !s.is_empty()).collect();
    for segment in specifier.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            other => segments.push(other),
        }
    }
    Some(segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project_graph::ProjectType;

    fn project(name: &str, root: &str) -> (String, Project) {
        (
            name.to_string(),
            Project {
                name: name.to_string(),
                root: RelativeUnixPathBuf::new(root).unwrap(),
                project_type: ProjectType::Lib,
                source_root: None,
                tags: Vec::new(),
                targets: BTreeMap::new(),
                implicit_dependencies: Vec::new(),
                named_inputs: BTreeMap::new(),
            },
        )
    }

    fn external(name: &str) -> (String, ExternalNode) {
        let id = format!("npm:{name}");
        (
            id.clone(),
            ExternalNode {
                name: id,
                version: "1.0.0".to_string(),
                hash: None,
            },
        )
    }

    fn fixture() -> (
        BTreeMap<String, Project>,
        BTreeMap<String, ExternalNode>,
        Vec<PathMapping>,
    ) {
        let projects = BTreeMap::from([
            project("proj", "libs/proj"),
            project("proj2", "libs/proj2"),
            project("proj3a", "libs/proj3a"),
            project("proj4ab", "libs/proj4ab"),
        ]);
        let externals = BTreeMap::from([external("lodash"), external("@angular/core")]);
        let mappings = vec![
            PathMapping {
                pattern: "@proj/my-second-proj".into(),
                targets: vec!["libs/proj2/index.ts".into()],
            },
            PathMapping {
                pattern: "@proj/project-3".into(),
                targets: vec!["libs/proj3a/index.ts".into()],
            },
            PathMapping {
                pattern: "@proj/proj4ab".into(),
                targets: vec!["libs/proj4ab/index.ts".into()],
            },
            PathMapping {
                pattern: "@proj/wild/*".into(),
                targets: vec!["libs/proj/src/*".into()],
            },
        ];
        (projects, externals, mappings)
    }

    #[test]
    fn test_path_mappings_resolve_to_projects() {
        let (projects, externals, mappings) = fixture();
        let locator = ProjectLocator::new(&projects, &externals, &mappings);
        let source = RelativeUnixPath::new("libs/proj/index.ts").unwrap();

        assert_eq!(
            locator.locate("@proj/my-second-proj", source),
            Resolution::Project("proj2".into())
        );
        assert_eq!(
            locator.locate("@proj/wild/feature", source),
            Resolution::Project("proj".into())
        );
    }

    #[test]
    fn test_installed_packages_are_external() {
        let (projects, externals, mappings) = fixture();
        let locator = ProjectLocator::new(&projects, &externals, &mappings);
        let source = RelativeUnixPath::new("libs/proj/index.ts").unwrap();

        assert_eq!(
            locator.locate("lodash", source),
            Resolution::External("npm:lodash".into())
        );
        assert_eq!(
            locator.locate("lodash/fp", source),
            Resolution::External("npm:lodash".into())
        );
        assert_eq!(
            locator.locate("@angular/core/testing", source),
            Resolution::External("npm:@angular/core".into())
        );
    }

    #[test]
    fn test_relative_resolution() {
        let (projects, externals, mappings) = fixture();
        let locator = ProjectLocator::new(&projects, &externals, &mappings);
        let source = RelativeUnixPath::new("libs/proj2/src/feature.ts").unwrap();

        assert_eq!(
            locator.locate("../index", source),
            Resolution::Project("proj2".into())
        );
        assert_eq!(
            locator.locate("../../proj3a/index", source),
            Resolution::Project("proj3a".into())
        );
    }

    #[test]
    fn test_unknown_package_is_unresolved() {
        let (projects, externals, mappings) = fixture();
        let locator = ProjectLocator::new(&projects, &externals, &mappings);
        let source = RelativeUnixPath::new("libs/proj/index.ts").unwrap();
        assert_eq!(locator.locate("not-installed", source), Resolution::Unresolved);
    }

    #[test]
    fn test_tsconfig_parse() {
        let mappings = path_mappings_from_tsconfig(
            r#"{
                "compilerOptions": {
                    "paths": {
                        "@proj/a": ["libs/a/index.ts"],
                        "@proj/b/*": ["libs/b/src/*"]
                    }
                }
            }"#,
            "tsconfig.base.json",
        );
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[0].pattern, "@proj/a");
        assert_eq!(mappings[1].targets, vec!["libs/b/src/*".to_string()]);
    }
}
