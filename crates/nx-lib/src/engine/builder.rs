//! Expands requested `(project, target, configuration?)` tuples into the
//! task graph, honoring `dependsOn` rules.

use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
};

use miette::Diagnostic;
use thiserror::Error;

use super::{Building, Built, Engine, TaskDefinition};
use crate::{
    config::{ConfigError, TargetConfig, WorkspaceConfig},
    project_graph::{Project, ProjectGraph},
    task_id::{TargetDependencySpec, TaskId},
};

#[derive(Debug, Error, Diagnostic)]
pub enum BuilderError {
    #[error("project {0} does not exist")]
    #[diagnostic(code(unknown_project))]
    MissingProject(String),
    #[error("project {project} has no target {target}")]
    #[diagnostic(code(unknown_target))]
    MissingTarget { project: String, target: String },
    #[error("configuration {configuration} is not defined for {project}:{target}")]
    #[diagnostic(code(unknown_configuration))]
    MissingConfiguration {
        project: String,
        target: String,
        configuration: String,
    },
    #[error("the task graph has a cycle: {}", path.join(" -> "))]
    #[diagnostic(code(task_graph_cycle))]
    Cycle { path: Vec<String> },
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),
}

/// A requested entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub project: String,
    pub target: String,
    pub configuration: Option<String>,
}

pub struct EngineBuilder<'a> {
    project_graph: &'a ProjectGraph,
    workspace_config: &'a WorkspaceConfig,
    specs: Vec<TaskSpec>,
}

struct QueueEntry {
    project: String,
    target: String,
    /// The configuration as originally requested; each task resolves it
    /// against its own declared configurations.
    requested_configuration: Option<String>,
}

impl<'a> EngineBuilder<'a> {
    pub fn new(project_graph: &'a ProjectGraph, workspace_config: &'a WorkspaceConfig) -> Self {
        Self {
            project_graph,
            workspace_config,
            specs: Vec::new(),
        }
    }

    pub fn with_tasks<I: IntoIterator<Item = TaskSpec>>(mut self, specs: I) -> Self {
        self.specs = specs.into_iter().collect();
        self
    }

    pub fn build(self) -> Result<Engine<Built>, BuilderError> {
        let mut engine: Engine<Building> = Engine::new();
        let mut queue = VecDeque::new();
        let mut visited: HashSet<TaskId> = HashSet::new();

        // The initiating set is validated strictly: unknown projects,
        // targets, and configurations are the user's own request being
        // wrong.
        for spec in &self.specs {
            let project = self
                .project_graph
                .project(&spec.project)
                .ok_or_else(|| BuilderError::MissingProject(spec.project.clone()))?;
            let target =
                project
                    .targets
                    .get(&spec.target)
                    .ok_or_else(|| BuilderError::MissingTarget {
                        project: spec.project.clone(),
                        target: spec.target.clone(),
                    })?;
            if let Some(configuration) = &spec.configuration {
                let merged = self.merged_target(target, &spec.target);
                let declared = merged.configurations.unwrap_or_default();
                if !declared.contains_key(configuration) {
                    return Err(BuilderError::MissingConfiguration {
                        project: spec.project.clone(),
                        target: spec.target.clone(),
                        configuration: configuration.clone(),
                    });
                }
            }
            let task_id = self.resolved_task_id(project, &spec.target, spec.configuration.as_deref());
            if let Some(task_id) = task_id {
                engine.connect_to_root(&task_id);
            }
            queue.push_back(QueueEntry {
                project: spec.project.clone(),
                target: spec.target.clone(),
                requested_configuration: spec.configuration.clone(),
            });
        }

        while let Some(entry) = queue.pop_front() {
            let project = self
                .project_graph
                .project(&entry.project)
                .ok_or_else(|| BuilderError::MissingProject(entry.project.clone()))?;
            let Some(raw_target) = project.targets.get(&entry.target) else {
                // Non-initiating tasks reaching a project without the target
                // were already lifted past it.
                continue;
            };

            let merged = self.merged_target(raw_target, &entry.target);
            let task_id = self
                .resolved_task_id(project, &entry.target, entry.requested_configuration.as_deref())
                .expect("target presence was checked above");

            if !visited.insert(task_id.clone()) {
                continue;
            }

            let definition = self.task_definition(project, &merged, &task_id)?;
            engine.add_definition(task_id.clone(), Arc::new(definition.clone()));

            for dependency in &definition.depends_on {
                match dependency {
                    TargetDependencySpec::Own { target } => {
                        if let Some(dep_id) = self.resolved_task_id(
                            project,
                            target,
                            entry.requested_configuration.as_deref(),
                        ) {
                            engine.add_dependency(&task_id, &dep_id);
                            queue.push_back(QueueEntry {
                                project: project.name.clone(),
                                target: target.clone(),
                                requested_configuration: entry.requested_configuration.clone(),
                            });
                        }
                    }
                    TargetDependencySpec::Dependencies { target } => {
                        let mut lifted = Vec::new();
                        let mut seen = HashSet::new();
                        self.lift_through_dependencies(
                            &project.name,
                            target,
                            &mut seen,
                            &mut lifted,
                        );
                        for dependency_project in lifted {
                            let dep_project = self
                                .project_graph
                                .project(&dependency_project)
                                .expect("lift walks graph projects");
                            if let Some(dep_id) = self.resolved_task_id(
                                dep_project,
                                target,
                                entry.requested_configuration.as_deref(),
                            ) {
                                engine.add_dependency(&task_id, &dep_id);
                                queue.push_back(QueueEntry {
                                    project: dependency_project,
                                    target: target.clone(),
                                    requested_configuration: entry
                                        .requested_configuration
                                        .clone(),
                                });
                            }
                        }
                    }
                }
            }
        }

        let engine = engine.seal();
        engine.validate()?;
        Ok(engine)
    }

    fn merged_target(&self, target: &TargetConfig, target_name: &str) -> TargetConfig {
        target.merged_with_defaults(self.workspace_config.target_defaults.get(target_name))
    }

    /// The task id `(project, target)` resolves to under a requested
    /// configuration, or `None` when the project lacks the target. A
    /// requested configuration the target does not declare falls back to
    /// the target's default configuration; only the initiating tasks treat
    /// that as an error, and they were validated up front.
    fn resolved_task_id(
        &self,
        project: &Project,
        target_name: &str,
        requested: Option<&str>,
    ) -> Option<TaskId> {
        let target = project.targets.get(target_name)?;
        let merged = self.merged_target(target, target_name);
        let declared = merged.configurations.unwrap_or_default();
        let configuration = match requested {
            Some(requested) if declared.contains_key(requested) => Some(requested.to_string()),
            _ => merged
                .default_configuration
                .filter(|default| declared.contains_key(default)),
        };
        Some(TaskId::new(&project.name, target_name).with_configuration(configuration))
    }

    /// `^T` expansion: direct dependencies with target `T` contribute a
    /// task; a dependency without it is lifted through, contributing its
    /// own dependencies' `T` tasks transitively.
    fn lift_through_dependencies(
        &self,
        from: &str,
        target: &str,
        seen: &mut HashSet<String>,
        out: &mut Vec<String>,
    ) {
        for dependency in self.project_graph.immediate_dependencies(from) {
            if !seen.insert(dependency.to_string()) {
                continue;
            }
            let has_target = self
                .project_graph
                .project(dependency)
                .map_or(false, |project| project.targets.contains_key(target));
            if has_target {
                out.push(dependency.to_string());
            } else {
                self.lift_through_dependencies(dependency, target, seen, out);
            }
        }
    }

    fn task_definition(
        &self,
        project: &Project,
        merged: &TargetConfig,
        task_id: &TaskId,
    ) -> Result<TaskDefinition, BuilderError> {
        let mut options = merged
            .options
            .clone()
            .unwrap_or_else(|| serde_json::json!({}));
        if let Some(configuration) = task_id.configuration() {
            let declared = merged.configurations.clone().unwrap_or_default();
            if let Some(overlay) = declared.get(configuration) {
                overlay_options(&mut options, overlay);
            }
        }
        let options = interpolate_value(options, project, task_id)?;

        Ok(TaskDefinition {
            command: merged.command.clone(),
            executor: merged.executor.clone(),
            options,
            depends_on: merged
                .depends_on
                .clone()
                .unwrap_or_default()
                .iter()
                .map(|raw| TargetDependencySpec::parse(raw))
                .collect(),
            inputs: merged.inputs.clone().unwrap_or_default(),
            outputs: merged.outputs.clone().unwrap_or_default(),
            cache: merged.cache.unwrap_or(false),
        })
    }
}

/// Shallow merge: configuration keys replace base option keys.
fn overlay_options(options: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (options, overlay) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overlay)) => {
            for (key, value) in overlay {
                base.insert(key.clone(), value.clone());
            }
        }
        (options, overlay) => *options = overlay.clone(),
    }
}

/// Substitutes `{project.name}` and `{project.root}` in string option
/// values. `{{` and `}}` escape literal braces; unknown `project.*` keys
/// and nested interpolations are configuration errors; any other braced
/// text (glob alternations and the like) passes through untouched.
fn interpolate_value(
    value: serde_json::Value,
    project: &Project,
    task_id: &TaskId,
) -> Result<serde_json::Value, BuilderError> {
    Ok(match value {
        serde_json::Value::String(text) => {
            serde_json::Value::String(interpolate_str(&text, project, task_id)?)
        }
        serde_json::Value::Array(items) => serde_json::Value::Array(
            items
                .into_iter()
                .map(|item| interpolate_value(item, project, task_id))
                .collect::<Result<_, _>>()?,
        ),
        serde_json::Value::Object(entries) => serde_json::Value::Object(
            entries
                .into_iter()
                .map(|(key, item)| Ok((key, interpolate_value(item, project, task_id)?)))
                .collect::<Result<_, BuilderError>>()?,
        ),
        other => other,
    })
}

fn interpolate_str(
    input: &str,
    project: &Project,
    task_id: &TaskId,
) -> Result<String, BuilderError> {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();
    while let Some((start, ch)) = chars.next() {
        match ch {
            '{' if matches!(chars.peek(), Some((_, '{'))) => {
                chars.next();
                out.push('{');
            }
            '}' if matches!(chars.peek(), Some((_, '}'))) => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let rest = &input[start + 1..];
                let Some(end) = rest.find('}') else {
                    out.push('{');
                    continue;
                };
                let token = &rest[..end];
                if let Some(key) = token.strip_prefix("project.") {
                    if token.contains('{') {
                        return Err(interpolation_error(
                            token,
                            task_id,
                            "nested interpolation is not supported",
                        ));
                    }
                    match key {
                        "name" => out.push_str(&project.name),
                        "root" => out.push_str(project.root.as_str()),
                        _ => {
                            return Err(interpolation_error(
                                token,
                                task_id,
                                "only project.name and project.root are available",
                            ))
                        }
                    }
                    // skip over the consumed token and closing brace
                    while let Some((index, _)) = chars.peek() {
                        if *index > start + end + 1 {
                            break;
                        }
                        chars.next();
                    }
                } else {
                    out.push('{');
                }
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

fn interpolation_error(token: &str, task_id: &TaskId, message: &str) -> BuilderError {
    BuilderError::Config(ConfigError::Interpolation {
        token: format!("{{{token}}}"),
        target: task_id.to_string(),
        message: message.to_string(),
    })
}
