//! Task hashing.
//!
//! A task's hash folds in, and only in: its filtered source inputs, its
//! prerequisite task hashes, its resolved options, its declared env and
//! runtime inputs, and the tool fingerprint. Sections enter a canonical
//! labeled buffer in a fixed order with sorted contents, so key order, file
//! iteration order, and the host machine never influence the result.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use nx_env::EnvironmentVariableMap;
use nx_hash::{ContentHasher, FileHasher};
use nxpath::{AbsoluteSystemPath, RelativeUnixPath};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::{
    config::WorkspaceConfig,
    engine::TaskDefinition,
    project_graph::{Project, ProjectGraph},
    task_id::TaskId,
};

/// Stable identifier of the orchestrator contributing to every task hash.
pub fn tool_fingerprint(plugin_names: impl IntoIterator<Item = String>) -> String {
    let mut plugins: Vec<String> = plugin_names.into_iter().collect();
    plugins.sort();
    format!(
        "nx@{}+{}",
        env!("CARGO_PKG_VERSION"),
        plugins.join(",")
    )
}

#[derive(Debug, Error)]
pub enum TaskHashError {
    #[error("invalid env wildcard: {0}")]
    Env(#[from] nx_env::Error),
    #[error("invalid input glob {glob}: {message}")]
    Glob { glob: String, message: String },
    #[error("runtime input {command} failed: {message}")]
    RuntimeCommand { command: String, message: String },
    #[error("prerequisite {0} has no recorded hash")]
    MissingPrerequisiteHash(String),
    #[error("named input {0} expands into itself")]
    CyclicNamedInput(String),
    #[error("task {0} references project missing from the graph")]
    MissingProject(String),
}

/// Per-task hash bookkeeping shared between the hasher and the runner.
/// Multiple workers read and write it, hence the lock; nothing holds the
/// lock across an await.
#[derive(Debug, Clone, Default)]
pub struct TaskHashTracker {
    state: Arc<Mutex<HashMap<TaskId, String>>>,
}

impl TaskHashTracker {
    pub fn hash(&self, task_id: &TaskId) -> Option<String> {
        self.state
            .lock()
            .expect("hash tracker lock poisoned")
            .get(task_id)
            .cloned()
    }

    pub fn insert(&self, task_id: TaskId, hash: String) {
        self.state
            .lock()
            .expect("hash tracker lock poisoned")
            .insert(task_id, hash);
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskHashDetails {
    pub sections: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct ExpandedInputs {
    /// Globs anchored at the project root.
    project_globs: Vec<String>,
    /// Globs anchored at the workspace root.
    workspace_globs: Vec<String>,
    /// Exclusions, project-anchored.
    exclude_globs: Vec<String>,
    /// Exclusions, workspace-anchored.
    workspace_exclude_globs: Vec<String>,
    env_vars: Vec<String>,
    runtime_commands: Vec<String>,
}

pub struct TaskHasher<'a> {
    repo_root: &'a AbsoluteSystemPath,
    project_graph: &'a ProjectGraph,
    workspace_config: &'a WorkspaceConfig,
    file_hasher: &'a FileHasher,
    env_at_execution_start: &'a EnvironmentVariableMap,
    overrides: serde_json::Value,
    tool_fingerprint: String,
    tracker: TaskHashTracker,
}

impl<'a> TaskHasher<'a> {
    pub fn new(
        repo_root: &'a AbsoluteSystemPath,
        project_graph: &'a ProjectGraph,
        workspace_config: &'a WorkspaceConfig,
        file_hasher: &'a FileHasher,
        env_at_execution_start: &'a EnvironmentVariableMap,
        overrides: serde_json::Value,
        tool_fingerprint: String,
    ) -> Self {
        Self {
            repo_root,
            project_graph,
            workspace_config,
            file_hasher,
            env_at_execution_start,
            overrides,
            tool_fingerprint,
            tracker: TaskHashTracker::default(),
        }
    }

    pub fn tracker(&self) -> TaskHashTracker {
        self.tracker.clone()
    }

    /// Computes the task's hash and records it in the tracker.
    /// `prerequisites` must already have recorded hashes; the runner
    /// guarantees this by hashing in dependency order.
    pub fn calculate(
        &self,
        task_id: &TaskId,
        definition: &TaskDefinition,
        prerequisites: &[TaskId],
    ) -> Result<(String, TaskHashDetails), TaskHashError> {
        let project = self
            .project_graph
            .project(task_id.project())
            .ok_or_else(|| TaskHashError::MissingProject(task_id.to_string()))?;

        let mut inputs = self.expand_inputs(project, &definition.inputs)?;
        // A task's own outputs are never inputs: producing them must not
        // change the next run's hash.
        for output in &definition.outputs {
            if let Some(glob) = output.strip_prefix("{workspaceRoot}/") {
                inputs
                    .workspace_exclude_globs
                    .push(output_exclusion_glob(glob));
            } else {
                let glob = output.strip_prefix("{projectRoot}/").unwrap_or(output);
                inputs.exclude_globs.push(output_exclusion_glob(glob));
            }
        }
        let mut details = TaskHashDetails::default();
        let mut hasher = ContentHasher::new();

        // 1. filtered source inputs
        let files_hash = self.hash_input_files(project, &inputs)?;
        hasher.put_section("files", &files_hash);
        details
            .sections
            .insert("files".to_string(), files_hash.clone());

        // 2. prerequisite hashes
        let mut prerequisite_ids: Vec<&TaskId> = prerequisites.iter().collect();
        prerequisite_ids.sort();
        for prerequisite in prerequisite_ids {
            let hash = self
                .tracker
                .hash(prerequisite)
                .ok_or_else(|| TaskHashError::MissingPrerequisiteHash(prerequisite.to_string()))?;
            hasher.put_section("deps", format!("{prerequisite}={hash}"));
            details
                .sections
                .insert(format!("deps:{prerequisite}"), hash);
        }

        // 3. resolved options and overrides, canonical form
        let options = self.options_with_overrides(&definition.options);
        let options_canonical =
            serde_json::to_string(&options).unwrap_or_default();
        hasher.put_section("options", &options_canonical);
        details.sections.insert(
            "options".to_string(),
            nx_hash::hash_bytes(&options_canonical),
        );

        // 4a. declared env inputs
        let env_pairs = self.env_pairs(&inputs.env_vars)?;
        for pair in &env_pairs {
            hasher.put_section("env", pair);
        }
        details
            .sections
            .insert("env".to_string(), nx_hash::hash_bytes(env_pairs.join("\n")));

        // 4b. runtime inputs
        for command in &inputs.runtime_commands {
            let stdout = run_runtime_command(self.repo_root, command)?;
            hasher.put_section("runtime", format!("{command}\0{stdout}"));
            details
                .sections
                .insert(format!("runtime:{command}"), nx_hash::hash_bytes(&stdout));
        }

        // 5. tool fingerprint
        hasher.put_section("tool", &self.tool_fingerprint);
        details
            .sections
            .insert("tool".to_string(), self.tool_fingerprint.clone());

        let hash = hasher.finish();
        debug!("task {task_id} hash is {hash}");
        self.tracker.insert(task_id.clone(), hash.clone());
        Ok((hash, details))
    }

    fn options_with_overrides(&self, options: &serde_json::Value) -> serde_json::Value {
        let mut merged = options.clone();
        if let (serde_json::Value::Object(base), serde_json::Value::Object(overrides)) =
            (&mut merged, &self.overrides)
        {
            for (key, value) in overrides {
                base.insert(key.clone(), value.clone());
            }
        }
        merged
    }

    /// Expands input declarations into globs, env names, and runtime
    /// commands. Plain names are named-input references resolved against the
    /// project's and workspace's `namedInputs`; `default` with no definition
    /// anywhere means every file in the project.
    fn expand_inputs(
        &self,
        project: &Project,
        inputs: &[String],
    ) -> Result<ExpandedInputs, TaskHashError> {
        let mut expanded = ExpandedInputs::default();
        let mut in_flight = Vec::new();
        if inputs.is_empty() {
            expanded.project_globs.push("**/*".to_string());
            return Ok(expanded);
        }
        self.expand_into(project, inputs, &mut expanded, &mut in_flight)?;
        if expanded.project_globs.is_empty() && expanded.workspace_globs.is_empty() {
            expanded.project_globs.push("**/*".to_string());
        }
        Ok(expanded)
    }

    fn expand_into(
        &self,
        project: &Project,
        inputs: &[String],
        expanded: &mut ExpandedInputs,
        in_flight: &mut Vec<String>,
    ) -> Result<(), TaskHashError> {
        for input in inputs {
            if let Some(var) = input.strip_prefix("env:") {
                expanded.env_vars.push(var.to_string());
            } else if let Some(command) = input.strip_prefix("runtime:") {
                expanded.runtime_commands.push(command.to_string());
            } else if let Some(excluded) = input.strip_prefix('!') {
                expanded.exclude_globs.push(
                    excluded
                        .strip_prefix("{projectRoot}/")
                        .unwrap_or(excluded)
                        .to_string(),
                );
            } else if let Some(glob) = input.strip_prefix("{workspaceRoot}/") {
                expanded.workspace_globs.push(glob.to_string());
            } else if let Some(glob) = input.strip_prefix("{projectRoot}/") {
                expanded.project_globs.push(glob.to_string());
            } else if let Some(named) = self.named_input(project, input) {
                if in_flight.contains(input) {
                    return Err(TaskHashError::CyclicNamedInput(input.clone()));
                }
                in_flight.push(input.clone());
                self.expand_into(project, &named, expanded, in_flight)?;
                in_flight.pop();
            } else if input == "default" {
                expanded.project_globs.push("**/*".to_string());
            } else if input.contains('*') || input.contains('.') || input.contains('/') {
                expanded.project_globs.push(input.clone());
            } else {
                // an undefined named input contributes nothing; surfacing
                // this is configuration linting, not hashing
                debug!("ignoring undefined named input {input}");
            }
        }
        Ok(())
    }

    fn named_input(&self, project: &Project, name: &str) -> Option<Vec<String>> {
        project
            .named_inputs
            .get(name)
            .or_else(|| self.workspace_config.named_inputs.get(name))
            .cloned()
    }

    fn hash_input_files(
        &self,
        project: &Project,
        inputs: &ExpandedInputs,
    ) -> Result<String, TaskHashError> {
        let project_matcher = build_glob_set(&inputs.project_globs)?;
        let workspace_matcher = build_glob_set(&inputs.workspace_globs)?;
        let exclude_matcher = build_glob_set(&inputs.exclude_globs)?;
        let workspace_exclude_matcher = build_glob_set(&inputs.workspace_exclude_globs)?;

        let project_prefix = format!("{}/", project.root.as_str());
        let selected: Vec<&RelativeUnixPath> = self
            .file_hasher
            .all_file_data()
            .filter(|record| {
                let path = record.path.as_str();
                if workspace_exclude_matcher
                    .as_ref()
                    .map_or(false, |m| m.is_match(path))
                {
                    return false;
                }
                if let Some(project_relative) = path.strip_prefix(&project_prefix) {
                    if exclude_matcher
                        .as_ref()
                        .map_or(false, |m| m.is_match(project_relative))
                    {
                        return false;
                    }
                    if project_matcher
                        .as_ref()
                        .map_or(false, |m| m.is_match(project_relative))
                    {
                        return true;
                    }
                }
                workspace_matcher
                    .as_ref()
                    .map_or(false, |m| m.is_match(path))
            })
            .map(|record| record.path.as_ref())
            .collect();

        Ok(self.file_hasher.hash_files(selected))
    }

    fn env_pairs(&self, env_vars: &[String]) -> Result<Vec<String>, TaskHashError> {
        let mut pairs = Vec::new();
        for var in env_vars {
            if var.contains('*') {
                let selected = self
                    .env_at_execution_start
                    .from_wildcards(std::slice::from_ref(var))?;
                pairs.extend(selected.to_hashable());
            } else {
                let value = self
                    .env_at_execution_start
                    .get(var)
                    .map(String::as_str)
                    .unwrap_or_default();
                pairs.push(format!("{var}={value}"));
            }
        }
        pairs.sort();
        pairs.dedup();
        Ok(pairs)
    }
}

/// A declared output may be a bare directory; exclude everything under it.
fn output_exclusion_glob(glob: &str) -> String {
    if glob.contains('*') {
        glob.to_string()
    } else {
        format!("{{{glob},{glob}/**}}")
    }
}

fn build_glob_set(globs: &[String]) -> Result<Option<globset::GlobSet>, TaskHashError> {
    if globs.is_empty() {
        return Ok(None);
    }
    let mut builder = globset::GlobSetBuilder::new();
    for glob in globs {
        builder.add(
            globset::Glob::new(glob).map_err(|err| TaskHashError::Glob {
                glob: glob.clone(),
                message: err.to_string(),
            })?,
        );
    }
    Ok(Some(builder.build().map_err(|err| TaskHashError::Glob {
        glob: globs.join(","),
        message: err.to_string(),
    })?))
}

/// Runs a declared runtime command and returns its stdout for hashing.
fn run_runtime_command(
    repo_root: &AbsoluteSystemPath,
    command: &str,
) -> Result<String, TaskHashError> {
    let output = std::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(repo_root.as_std_path())
        .output()
        .map_err(|err| TaskHashError::RuntimeCommand {
            command: command.to_string(),
            message: err.to_string(),
        })?;
    if !output.status.success() {
        return Err(TaskHashError::RuntimeCommand {
            command: command.to_string(),
            message: format!("exited with {:?}", output.status.code()),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use nx_env::EnvironmentVariableMap;
    use nxpath::AbsoluteSystemPathBuf;

    use super::*;
    use crate::{
        config::WorkspaceConfig,
        engine::TaskDefinition,
        project_graph::{Project, ProjectGraph, ProjectType},
    };

    struct Fixture {
        _dir: tempfile::TempDir,
        root: AbsoluteSystemPathBuf,
        graph: ProjectGraph,
        config: WorkspaceConfig,
        env: EnvironmentVariableMap,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = AbsoluteSystemPathBuf::from_std_path(dir.path()).unwrap();
            let mut graph = ProjectGraph::default();
            graph.nodes.insert(
                "a".into(),
                Project {
                    name: "a".into(),
                    root: nxpath::RelativeUnixPathBuf::new("packages/a").unwrap(),
                    project_type: ProjectType::Lib,
                    source_root: None,
                    tags: Vec::new(),
                    targets: Default::default(),
                    implicit_dependencies: Vec::new(),
                    named_inputs: Default::default(),
                },
            );
            let env = EnvironmentVariableMap::from(
                [("NODE_ENV".to_string(), "test".to_string())]
                    .into_iter()
                    .collect::<HashMap<_, _>>(),
            );
            Self {
                _dir: dir,
                root,
                graph,
                config: WorkspaceConfig::default(),
                env,
            }
        }

        fn write(&self, path: &str, contents: &str) {
            let file = self.root.resolve(
                &nxpath::RelativeUnixPathBuf::new(path)
                    .unwrap()
                    .to_system(),
            );
            file.parent().unwrap().create_dir_all().unwrap();
            file.create_with_contents(contents).unwrap();
        }

        fn hash(&self, definition: &TaskDefinition) -> String {
            let mut file_hasher = FileHasher::new(&self.root);
            file_hasher.init().unwrap();
            let hasher = TaskHasher::new(
                &self.root,
                &self.graph,
                &self.config,
                &file_hasher,
                &self.env,
                serde_json::json!({}),
                "nx@test".to_string(),
            );
            hasher
                .calculate(&TaskId::new("a", "build"), definition, &[])
                .unwrap()
                .0
        }
    }

    #[test]
    fn test_hash_invariant_under_option_key_order() {
        let fixture = Fixture::new();
        fixture.write("packages/a/index.ts", "export {};");

        let first = TaskDefinition {
            options: serde_json::json!({ "b": 2, "a": 1 }),
            ..Default::default()
        };
        let second = TaskDefinition {
            options: serde_json::json!({ "a": 1, "b": 2 }),
            ..Default::default()
        };
        assert_eq!(fixture.hash(&first), fixture.hash(&second));
    }

    #[test]
    fn test_hash_sensitive_to_declared_input_bytes() {
        let fixture = Fixture::new();
        fixture.write("packages/a/src/index.ts", "export const x = 1;");
        fixture.write("packages/a/README.md", "docs");

        let definition = TaskDefinition {
            inputs: vec!["src/**/*.ts".to_string()],
            ..Default::default()
        };
        let before = fixture.hash(&definition);

        // a byte inside the declared inputs changes the hash
        fixture.write("packages/a/src/index.ts", "export const x = 2;");
        let after = fixture.hash(&definition);
        assert_ne!(before, after);

        // a byte outside the declared inputs does not
        fixture.write("packages/a/README.md", "docs changed");
        assert_eq!(after, fixture.hash(&definition));
    }

    #[test]
    fn test_prerequisite_hash_contributes() {
        let fixture = Fixture::new();
        fixture.write("packages/a/index.ts", "export {};");
        let mut file_hasher = FileHasher::new(&fixture.root);
        file_hasher.init().unwrap();
        let hasher = TaskHasher::new(
            &fixture.root,
            &fixture.graph,
            &fixture.config,
            &file_hasher,
            &fixture.env,
            serde_json::json!({}),
            "nx@test".to_string(),
        );

        let dep_id = TaskId::new("a", "codegen");
        let definition = TaskDefinition::default();
        hasher.tracker().insert(dep_id.clone(), "hash-one".into());
        let (with_first_dep, _) = hasher
            .calculate(
                &TaskId::new("a", "build"),
                &definition,
                std::slice::from_ref(&dep_id),
            )
            .unwrap();

        hasher.tracker().insert(dep_id.clone(), "hash-two".into());
        let (with_second_dep, _) = hasher
            .calculate(
                &TaskId::new("a", "build"),
                &definition,
                std::slice::from_ref(&dep_id),
            )
            .unwrap();
        assert_ne!(with_first_dep, with_second_dep);
    }

    #[test]
    fn test_env_input_contributes() {
        let mut fixture = Fixture::new();
        fixture.write("packages/a/index.ts", "export {};");
        let definition = TaskDefinition {
            inputs: vec!["default".to_string(), "env:NODE_ENV".to_string()],
            ..Default::default()
        };
        let before = fixture.hash(&definition);
        fixture
            .env
            .insert("NODE_ENV".to_string(), "production".to_string());
        assert_ne!(before, fixture.hash(&definition));
    }

    #[test]
    fn test_named_inputs_expand() {
        let mut fixture = Fixture::new();
        fixture.write("packages/a/src/index.ts", "code");
        fixture.write("packages/a/src/index.spec.ts", "test");
        fixture.config = WorkspaceConfig::from_str(
            r#"{ "namedInputs": { "production": ["src/**/*.ts", "!src/**/*.spec.ts"] } }"#,
            "nx.json",
        )
        .unwrap();

        let definition = TaskDefinition {
            inputs: vec!["production".to_string()],
            ..Default::default()
        };
        let before = fixture.hash(&definition);

        // spec files are excluded from the production input set
        fixture.write("packages/a/src/index.spec.ts", "test changed");
        assert_eq!(before, fixture.hash(&definition));

        fixture.write("packages/a/src/index.ts", "code changed");
        assert_ne!(before, fixture.hash(&definition));
    }

    #[test]
    fn test_runtime_input_contributes() {
        let fixture = Fixture::new();
        fixture.write("packages/a/index.ts", "export {};");
        let echo_a = TaskDefinition {
            inputs: vec!["default".to_string(), "runtime:echo one".to_string()],
            ..Default::default()
        };
        let echo_b = TaskDefinition {
            inputs: vec!["default".to_string(), "runtime:echo two".to_string()],
            ..Default::default()
        };
        assert_ne!(fixture.hash(&echo_a), fixture.hash(&echo_b));
    }
}
