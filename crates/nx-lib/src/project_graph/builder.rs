//! Builds a `ProjectGraph` from the workspace: discovered projects, plugin
//! contributions, lockfile externals, and explicit/implicit edges.

use std::collections::{BTreeMap, HashSet};

use nx_hash::{hash_bytes, FileHasher};
use nxpath::{AbsoluteSystemPath, RelativeUnixPath, RelativeUnixPathBuf};
use tracing::debug;

use super::{
    external_nodes_from_lockfile,
    locator::{path_mappings_from_tsconfig, PathMapping, ProjectLocator, Resolution},
    plugins::{CreateDependenciesContext, PluginContext, PluginRegistry, ProjectDelta},
    Edge, EdgeKind, Project, ProjectGraph, ProjectGraphError, ProjectType,
};
use crate::{
    config::{
        ImplicitDependants, ProjectConfig, TargetConfig, WorkspaceConfig, PROJECT_DESCRIPTOR,
    },
    package_json::{PackageJson, PACKAGE_JSON},
};

const SCANNABLE_EXTENSIONS: &[&str] = &["ts", "tsx", "js", "jsx"];
const LOCKFILE_NAME: &str = "package-lock.json";
const BASE_TSCONFIG_NAME: &str = "tsconfig.base.json";

pub struct ProjectGraphBuilder<'a> {
    repo_root: &'a AbsoluteSystemPath,
    config: &'a WorkspaceConfig,
    file_hasher: &'a FileHasher,
    registry: &'a PluginRegistry,
    warnings: Vec<String>,
}

impl<'a> ProjectGraphBuilder<'a> {
    pub fn new(
        repo_root: &'a AbsoluteSystemPath,
        config: &'a WorkspaceConfig,
        file_hasher: &'a FileHasher,
        registry: &'a PluginRegistry,
    ) -> Self {
        Self {
            repo_root,
            config,
            file_hasher,
            registry,
            warnings: Vec::new(),
        }
    }

    /// Builds and validates the graph. On a cycle no partial graph is
    /// returned. Alongside the graph come non-fatal warnings (unreadable or
    /// unscannable files).
    pub fn build(mut self) -> Result<(ProjectGraph, Vec<String>), ProjectGraphError> {
        let lockfile_path = self.repo_root.join_component(LOCKFILE_NAME);
        let (external_nodes, lockfile_hash) = if lockfile_path.is_file() {
            let text = lockfile_path.read_to_string()?;
            (external_nodes_from_lockfile(&text)?, hash_bytes(&text))
        } else {
            (BTreeMap::new(), String::new())
        };

        let mut nodes = self.discover_projects()?;

        let plugin_ctx = PluginContext {
            workspace_root: self.repo_root,
            workspace_config: self.config,
        };
        let deltas = self
            .registry
            .create_nodes(self.file_hasher, &lockfile_hash, &plugin_ctx)?;
        apply_deltas(&mut nodes, deltas);

        let path_mappings = self.load_path_mappings();
        let mut dependencies: BTreeMap<String, Vec<Edge>> = BTreeMap::new();
        let mut seen_edges: HashSet<(String, String, EdgeKind, Option<RelativeUnixPathBuf>)> =
            HashSet::new();
        let mut add_edge = |dependencies: &mut BTreeMap<String, Vec<Edge>>, edge: Edge| {
            let key = (
                edge.source.clone(),
                edge.target.clone(),
                edge.kind,
                edge.source_file.clone(),
            );
            if seen_edges.insert(key) {
                dependencies.entry(edge.source.clone()).or_default().push(edge);
            }
        };

        // explicit edges from imports
        {
            let locator = ProjectLocator::new(&nodes, &external_nodes, &path_mappings);
            for record in self.file_hasher.all_file_data() {
                let path = &record.path;
                if !is_scannable(path) {
                    continue;
                }
                let Some(source_project) = owning_project(&nodes, path) else {
                    continue;
                };
                let absolute = self.repo_root.resolve(&path.to_system());
                let text = match absolute.read_to_string() {
                    Ok(text) => text,
                    Err(err) => {
                        self.warnings.push(format!("unable to read {path}: {err}"));
                        continue;
                    }
                };
                let scan = match nx_scanner::scan(&text, path.as_str()) {
                    Ok(scan) => scan,
                    Err(err) => {
                        // scanner trouble drops the file, never the build
                        self.warnings.push(err.to_string());
                        continue;
                    }
                };
                for import in scan.imports {
                    let target = match locator.locate(&import.specifier, path) {
                        Resolution::Project(project) => project,
                        Resolution::External(package) => package,
                        Resolution::Unresolved => continue,
                    };
                    if target == source_project {
                        continue;
                    }
                    add_edge(
                        &mut dependencies,
                        Edge {
                            source: source_project.to_string(),
                            target,
                            kind: EdgeKind::from_import(import.kind),
                            source_file: Some(path.clone()),
                        },
                    );
                }
            }
        }

        // implicit edges from project descriptors
        for project in nodes.values() {
            for dependency in &project.implicit_dependencies {
                if nodes.contains_key(dependency) {
                    add_edge(
                        &mut dependencies,
                        Edge {
                            source: project.name.clone(),
                            target: dependency.clone(),
                            kind: EdgeKind::Implicit,
                            source_file: None,
                        },
                    );
                } else {
                    self.warnings.push(format!(
                        "{} declares an implicit dependency on unknown project {dependency}",
                        project.name
                    ));
                }
            }
        }

        // implicit edges from workspace configuration: a pattern owned by a
        // project makes the listed projects (or all of them) depend on it
        for (pattern, dependants) in &self.config.implicit_dependencies {
            let Ok(glob) = globset::Glob::new(pattern) else {
                self.warnings
                    .push(format!("invalid implicit dependency pattern {pattern}"));
                continue;
            };
            let matcher = glob.compile_matcher();
            let owners: HashSet<String> = self
                .file_hasher
                .all_file_data()
                .filter(|record| matcher.is_match(record.path.as_str()))
                .filter_map(|record| owning_project(&nodes, &record.path))
                .map(str::to_string)
                .collect();
            for owner in owners {
                let dependants: Vec<&str> = match dependants {
                    ImplicitDependants::All => nodes.keys().map(String::as_str).collect(),
                    ImplicitDependants::Projects(projects) => {
                        projects.iter().map(String::as_str).collect()
                    }
                };
                for dependant in dependants {
                    if dependant == owner || !nodes.contains_key(dependant) {
                        continue;
                    }
                    add_edge(
                        &mut dependencies,
                        Edge {
                            source: dependant.to_string(),
                            target: owner.clone(),
                            kind: EdgeKind::Implicit,
                            source_file: None,
                        },
                    );
                }
            }
        }

        let mut graph = ProjectGraph {
            nodes,
            external_nodes,
            dependencies,
        };

        // plugins may contribute edges once the node set is final
        let plugin_edges = self.registry.create_dependencies(&CreateDependenciesContext {
            workspace_root: self.repo_root,
            graph: &graph,
        })?;
        for edge in plugin_edges {
            add_edge(&mut graph.dependencies, edge);
        }

        graph.validate()?;
        debug!(
            "built project graph: {} projects, {} external packages",
            graph.nodes.len(),
            graph.external_nodes.len()
        );
        Ok((graph, self.warnings))
    }

    fn discover_projects(&mut self) -> Result<BTreeMap<String, Project>, ProjectGraphError> {
        let mut nodes = BTreeMap::new();

        let descriptor_suffix = format!("/{PROJECT_DESCRIPTOR}");
        let package_suffix = format!("/{PACKAGE_JSON}");
        let mut descriptor_roots: Vec<RelativeUnixPathBuf> = Vec::new();
        let mut package_roots: Vec<RelativeUnixPathBuf> = Vec::new();
        for record in self.file_hasher.all_file_data() {
            let path = record.path.as_str();
            if let Some(root) = path.strip_suffix(&descriptor_suffix) {
                descriptor_roots.push(RelativeUnixPathBuf::new(root.to_string())?);
            } else if let Some(root) = path.strip_suffix(&package_suffix) {
                package_roots.push(RelativeUnixPathBuf::new(root.to_string())?);
            }
        }

        for root in &descriptor_roots {
            let descriptor_path = self
                .repo_root
                .resolve(&root.join(PROJECT_DESCRIPTOR).to_system());
            let descriptor = ProjectConfig::load(&descriptor_path)?;
            let package_json = self.load_package_json(root);
            let name = descriptor
                .name
                .clone()
                .or_else(|| package_json.as_ref().and_then(|p| p.name.clone()))
                .unwrap_or_else(|| default_name(root));
            let mut targets = script_targets(package_json.as_ref());
            // descriptor targets win over inferred script targets
            for (target_name, target) in &descriptor.targets {
                targets.insert(target_name.clone(), target.clone());
            }
            nodes.insert(
                name.clone(),
                Project {
                    name,
                    root: root.clone(),
                    project_type: self.project_type_of(root, descriptor.project_type.as_deref()),
                    source_root: descriptor.source_root.clone(),
                    tags: descriptor.tags.clone(),
                    targets,
                    implicit_dependencies: descriptor.implicit_dependencies.clone(),
                    named_inputs: descriptor.named_inputs.clone(),
                },
            );
        }

        for root in &package_roots {
            if root.as_str().is_empty() || descriptor_roots.contains(root) {
                continue;
            }
            let Some(package_json) = self.load_package_json(root) else {
                continue;
            };
            let name = package_json
                .name
                .clone()
                .unwrap_or_else(|| default_name(root));
            if nodes.contains_key(&name) {
                continue;
            }
            nodes.insert(
                name.clone(),
                Project {
                    name,
                    root: root.clone(),
                    project_type: self.project_type_of(root, None),
                    source_root: None,
                    tags: Vec::new(),
                    targets: script_targets(Some(&package_json)),
                    implicit_dependencies: Vec::new(),
                    named_inputs: BTreeMap::new(),
                },
            );
        }

        Ok(nodes)
    }

    fn load_package_json(&self, root: &RelativeUnixPath) -> Option<PackageJson> {
        let path = self.repo_root.resolve(&root.join(PACKAGE_JSON).to_system());
        path.is_file()
            .then(|| PackageJson::load(&path).ok())
            .flatten()
    }

    fn project_type_of(&self, root: &RelativeUnixPath, declared: Option<&str>) -> ProjectType {
        match declared {
            Some("application") => ProjectType::App,
            Some(_) => ProjectType::Lib,
            None => {
                let apps_prefix = format!("{}/", self.config.workspace_layout.apps_dir);
                if root.as_str().starts_with(&apps_prefix) {
                    ProjectType::App
                } else {
                    ProjectType::Lib
                }
            }
        }
    }

    fn load_path_mappings(&self) -> Vec<PathMapping> {
        for candidate in [BASE_TSCONFIG_NAME, "tsconfig.json"] {
            let path = self.repo_root.join_component(candidate);
            if let Ok(text) = path.read_to_string() {
                let mappings = path_mappings_from_tsconfig(&text, candidate);
                if !mappings.is_empty() {
                    return mappings;
                }
            }
        }
        Vec::new()
    }
}

fn is_scannable(path: &RelativeUnixPath) -> bool {
    if path.as_str().starts_with("node_modules/") || path.as_str().contains("/node_modules/") {
        return false;
    }
    path.extension()
        .map_or(false, |ext| SCANNABLE_EXTENSIONS.contains(&ext))
}

fn owning_project<'n>(
    nodes: &'n BTreeMap<String, Project>,
    file: &RelativeUnixPath,
) -> Option<&'n str> {
    nodes
        .values()
        .filter(|project| project.root.contains(file))
        .max_by_key(|project| project.root.as_str().len())
        .map(|project| project.name.as_str())
}

fn default_name(root: &RelativeUnixPath) -> String {
    root.as_str()
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .unwrap_or("root")
        .to_string()
}

/// A script becomes a runnable (but uncached) target with the script text as
/// its command.
fn script_targets(package_json: Option<&PackageJson>) -> BTreeMap<String, TargetConfig> {
    let Some(package_json) = package_json else {
        return BTreeMap::new();
    };
    package_json
        .scripts
        .iter()
        .map(|(name, command)| {
            (
                name.clone(),
                TargetConfig {
                    command: Some(command.clone()),
                    ..Default::default()
                },
            )
        })
        .collect()
}

fn apply_deltas(nodes: &mut BTreeMap<String, Project>, deltas: Vec<ProjectDelta>) {
    for delta in deltas {
        let existing = nodes
            .values()
            .find(|project| project.root == delta.root)
            .map(|project| project.name.clone());
        match existing {
            Some(name) => {
                let project = nodes.get_mut(&name).expect("project was just found");
                if let Some(project_type) = delta.project_type {
                    project.project_type = project_type;
                }
                // plugin targets never clobber declared ones
                for (name, target) in delta.targets {
                    project.targets.entry(name).or_insert(target);
                }
            }
            None => {
                let name = default_name(&delta.root);
                if nodes.contains_key(&name) {
                    continue;
                }
                nodes.insert(
                    name.clone(),
                    Project {
                        name,
                        root: delta.root,
                        project_type: delta.project_type.unwrap_or(ProjectType::Lib),
                        source_root: None,
                        tags: Vec::new(),
                        targets: delta.targets,
                        implicit_dependencies: Vec::new(),
                        named_inputs: BTreeMap::new(),
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use nxpath::AbsoluteSystemPathBuf;

    use super::*;
    use crate::project_graph::plugins::PluginRegistry;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: AbsoluteSystemPathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = AbsoluteSystemPathBuf::from_std_path(dir.path()).unwrap();
            Self { _dir: dir, root }
        }

        fn write(&self, path: &str, contents: &str) {
            let file = self
                .root
                .resolve(&RelativeUnixPathBuf::new(path).unwrap().to_system());
            file.parent().unwrap().create_dir_all().unwrap();
            file.create_with_contents(contents).unwrap();
        }

        fn build(&self) -> Result<(ProjectGraph, Vec<String>), ProjectGraphError> {
            self.build_with_config(WorkspaceConfig::default())
        }

        fn build_with_config(
            &self,
            config: WorkspaceConfig,
        ) -> Result<(ProjectGraph, Vec<String>), ProjectGraphError> {
            let mut hasher = FileHasher::new(&self.root);
            hasher.init().unwrap();
            let registry = PluginRegistry::from_config(&config).unwrap();
            ProjectGraphBuilder::new(&self.root, &config, &hasher, &registry).build()
        }
    }

    fn import_workspace() -> Fixture {
        let fixture = Fixture::new();
        fixture.write(
            "tsconfig.base.json",
            r#"{
                "compilerOptions": {
                    "paths": {
                        "@proj/my-second-proj": ["libs/proj2/index.ts"],
                        "@proj/project-3": ["libs/proj3a/index.ts"],
                        "@proj/proj4ab": ["libs/proj4ab/index.ts"]
                    }
                }
            }"#,
        );
        for (name, root) in [
            ("proj", "libs/proj"),
            ("proj2", "libs/proj2"),
            ("proj3a", "libs/proj3a"),
            ("proj4ab", "libs/proj4ab"),
        ] {
            fixture.write(
                &format!("{root}/project.json"),
                &format!(r#"{{ "name": "{name}" }}"#),
            );
            fixture.write(&format!("{root}/index.ts"), "export {};");
        }
        fixture
    }

    #[test]
    fn test_cross_project_import_resolution() {
        let fixture = import_workspace();
        fixture.write(
            "libs/proj/index.ts",
            "import {a} from '@proj/my-second-proj';\n\
             await import('@proj/project-3');\n\
             require('@proj/proj4ab');\n",
        );

        let (graph, warnings) = fixture.build().unwrap();
        assert!(warnings.is_empty(), "{warnings:?}");

        let edges = graph.edges_of("proj");
        assert_eq!(edges.len(), 3);
        let targets: Vec<&str> = edges.iter().map(|e| e.target.as_str()).collect();
        assert_eq!(targets, vec!["proj2", "proj3a", "proj4ab"]);
        for edge in edges {
            assert_eq!(
                edge.source_file.as_ref().unwrap().as_str(),
                "libs/proj/index.ts"
            );
        }
        let dynamic = edges.iter().find(|e| e.target == "proj3a").unwrap();
        assert_eq!(dynamic.kind, EdgeKind::Dynamic);
    }

    #[test]
    fn test_ignored_import_produces_no_edges() {
        let fixture = import_workspace();
        fixture.write(
            "libs/proj/index.ts",
            "// nx-ignore-next-line\nimport {a} from '@proj/my-second-proj';\n",
        );
        let (graph, _) = fixture.build().unwrap();
        assert!(graph.edges_of("proj").is_empty());
    }

    #[test]
    fn test_stringified_import_produces_no_edges() {
        let fixture = import_workspace();
        fixture.write(
            "libs/proj/index.ts",
            "const s = `import {a} from '@proj/my-second-proj'`;\n",
        );
        let (graph, _) = fixture.build().unwrap();
        assert!(graph.edges_of("proj").is_empty());
    }

    #[test]
    fn test_load_children_produces_one_edge() {
        let fixture = import_workspace();
        fixture.write(
            "libs/proj/index.ts",
            "const routes = [{ loadChildren: '@proj/proj4ab#a' }];\n",
        );
        let (graph, _) = fixture.build().unwrap();
        let edges = graph.edges_of("proj");
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].target, "proj4ab");
        assert_eq!(edges[0].kind, EdgeKind::Dynamic);
    }

    #[test]
    fn test_import_cycle_aborts_build() {
        let fixture = import_workspace();
        fixture.write(
            "libs/proj2/index.ts",
            "import {x} from '@proj/project-3';\nexport {};",
        );
        fixture.write(
            "libs/proj3a/index.ts",
            "import {y} from '@proj/my-second-proj';\nexport {};",
        );

        let err = fixture.build().unwrap_err();
        match err {
            ProjectGraphError::Cycle { path } => {
                assert!(path.contains(&"proj2".to_string()));
                assert!(path.contains(&"proj3a".to_string()));
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_unterminated_template_is_a_warning() {
        let fixture = import_workspace();
        fixture.write("libs/proj/index.ts", "const t = `never closed\n");
        let (graph, warnings) = fixture.build().unwrap();
        assert!(graph.edges_of("proj").is_empty());
        assert!(warnings
            .iter()
            .any(|warning| warning.contains("unterminated template")));
    }

    #[test]
    fn test_lockfile_externals_and_package_imports() {
        let fixture = import_workspace();
        fixture.write(
            "package-lock.json",
            r#"{
                "lockfileVersion": 3,
                "packages": {
                    "node_modules/lodash": { "version": "4.17.21" }
                }
            }"#,
        );
        fixture.write(
            "libs/proj/index.ts",
            "import {chunk} from 'lodash';\nexport {};",
        );

        let (graph, _) = fixture.build().unwrap();
        assert!(graph.external_nodes.contains_key("npm:lodash"));
        let edges = graph.edges_of("proj");
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].target, "npm:lodash");
    }

    #[test]
    fn test_package_json_projects_and_scripts() {
        let fixture = Fixture::new();
        fixture.write(
            "packages/a/package.json",
            r#"{ "name": "a", "scripts": { "build": "echo building a" } }"#,
        );
        let (graph, _) = fixture.build().unwrap();
        let project = graph.project("a").unwrap();
        assert_eq!(project.root.as_str(), "packages/a");
        assert_eq!(
            project.targets["build"].command.as_deref(),
            Some("echo building a")
        );
    }

    #[test]
    fn test_workspace_implicit_dependencies() {
        let fixture = import_workspace();
        fixture.write("libs/proj/global.txt", "shared config");
        let config = WorkspaceConfig::from_str(
            r#"{ "implicitDependencies": { "libs/proj/global.txt": ["proj2"] } }"#,
            "nx.json",
        )
        .unwrap();
        let (graph, _) = fixture.build_with_config(config).unwrap();
        let edges = graph.edges_of("proj2");
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].target, "proj");
        assert_eq!(edges[0].kind, EdgeKind::Implicit);
    }

    #[test]
    fn test_typescript_plugin_contributes_typecheck() {
        let fixture = import_workspace();
        fixture.write("libs/proj/tsconfig.json", "{}");
        let config =
            WorkspaceConfig::from_str(r#"{ "plugins": ["typescript"] }"#, "nx.json").unwrap();
        let (graph, _) = fixture.build_with_config(config).unwrap();
        let project = graph.project("proj").unwrap();
        assert!(project.targets.contains_key("typecheck"));
    }
}
