//! Workspace-level configuration (`nx.json`).
//!
//! Parsing happens in two steps: a permissive raw shape deserialized from
//! JSONC, then normalization into the struct the rest of the core consumes.
//! Dynamic shapes (plugin entries, runner options) become tagged values here
//! and nowhere else.

pub mod parser;
pub mod project;

use std::collections::BTreeMap;

use miette::Diagnostic;
use nxpath::AbsoluteSystemPath;
pub use parser::{parse_jsonc, parse_jsonc_as, ParseDiagnostic};
pub use project::{ProjectConfig, TargetConfig, PROJECT_DESCRIPTOR};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const WORKSPACE_CONFIG_FILENAME: &str = "nx.json";

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Parse(Box<ParseDiagnostic>),
    #[error("{path} has an unexpected shape: {message}")]
    Shape { path: String, message: String },
    #[error("unable to read {path}: {message}")]
    Read { path: String, message: String },
    #[error("unknown plugin: {0}")]
    UnknownPlugin(String),
    #[error("plugin {0} is registered more than once")]
    DuplicatePlugin(String),
    #[error("invalid option interpolation {token} in {target}: {message}")]
    Interpolation {
        token: String,
        target: String,
        message: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawPluginEntry {
    Name(String),
    Configured {
        plugin: String,
        #[serde(default)]
        options: serde_json::Value,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawImplicitDependants {
    /// `"*"`
    All(String),
    Projects(Vec<String>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRunnerOptions {
    runner: String,
    #[serde(default)]
    options: serde_json::Value,
}

/// `tasksRunnerOptions` accepts a mapping of named runners, or the legacy
/// simplified form where the value is a single runner that becomes the
/// default.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawTasksRunnerOptions {
    Legacy(RawRunnerOptions),
    Named(BTreeMap<String, RawRunnerOptions>),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawAffected {
    default_base: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawWorkspaceLayout {
    apps_dir: Option<String>,
    libs_dir: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawWorkspaceConfig {
    plugins: Vec<RawPluginEntry>,
    named_inputs: BTreeMap<String, Vec<String>>,
    target_defaults: BTreeMap<String, TargetConfig>,
    tasks_runner_options: Option<RawTasksRunnerOptions>,
    implicit_dependencies: BTreeMap<String, RawImplicitDependants>,
    affected: RawAffected,
    workspace_layout: RawWorkspaceLayout,
}

/// A plugin reference after normalization: always a name plus options.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginSpec {
    pub name: String,
    pub options: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImplicitDependants {
    All,
    Projects(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunnerOptions {
    pub runner: String,
    pub options: serde_json::Value,
}

pub const DEFAULT_RUNNER_NAME: &str = "default";

#[derive(Debug, Clone, PartialEq)]
pub struct WorkspaceLayout {
    pub apps_dir: String,
    pub libs_dir: String,
}

impl Default for WorkspaceLayout {
    fn default() -> Self {
        Self {
            apps_dir: "apps".to_string(),
            libs_dir: "libs".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkspaceConfig {
    pub plugins: Vec<PluginSpec>,
    pub named_inputs: BTreeMap<String, Vec<String>>,
    pub target_defaults: BTreeMap<String, TargetConfig>,
    pub tasks_runner_options: BTreeMap<String, RunnerOptions>,
    pub implicit_dependencies: BTreeMap<String, ImplicitDependants>,
    pub default_base: Option<String>,
    pub workspace_layout: WorkspaceLayout,
}

impl WorkspaceConfig {
    /// Loads `nx.json` from the workspace root. A missing file yields the
    /// default configuration.
    pub fn load(repo_root: &AbsoluteSystemPath) -> Result<Self, ConfigError> {
        let path = repo_root.join_component(WORKSPACE_CONFIG_FILENAME);
        if !path.is_file() {
            return Ok(Self::default());
        }
        let text = path.read_to_string().map_err(|err| ConfigError::Read {
            path: path.to_string(),
            message: err.to_string(),
        })?;
        Self::from_str(&text, WORKSPACE_CONFIG_FILENAME)
    }

    pub fn from_str(text: &str, path: &str) -> Result<Self, ConfigError> {
        let raw: RawWorkspaceConfig = parse_jsonc_as(text, path)?;
        Ok(Self::normalize(raw))
    }

    fn normalize(raw: RawWorkspaceConfig) -> Self {
        let plugins = raw
            .plugins
            .into_iter()
            .map(|entry| match entry {
                RawPluginEntry::Name(name) => PluginSpec {
                    name,
                    options: serde_json::Value::Null,
                },
                RawPluginEntry::Configured { plugin, options } => PluginSpec {
                    name: plugin,
                    options,
                },
            })
            .collect();

        let tasks_runner_options = match raw.tasks_runner_options {
            None => BTreeMap::new(),
            Some(RawTasksRunnerOptions::Legacy(runner)) => BTreeMap::from([(
                DEFAULT_RUNNER_NAME.to_string(),
                RunnerOptions {
                    runner: runner.runner,
                    options: runner.options,
                },
            )]),
            Some(RawTasksRunnerOptions::Named(named)) => named
                .into_iter()
                .map(|(name, runner)| {
                    (
                        name,
                        RunnerOptions {
                            runner: runner.runner,
                            options: runner.options,
                        },
                    )
                })
                .collect(),
        };

        let implicit_dependencies = raw
            .implicit_dependencies
            .into_iter()
            .filter_map(|(pattern, value)| match value {
                RawImplicitDependants::All(star) if star == "*" => {
                    Some((pattern, ImplicitDependants::All))
                }
                RawImplicitDependants::All(_) => None,
                RawImplicitDependants::Projects(projects) => {
                    Some((pattern, ImplicitDependants::Projects(projects)))
                }
            })
            .collect();

        WorkspaceConfig {
            plugins,
            named_inputs: raw.named_inputs,
            target_defaults: raw.target_defaults,
            tasks_runner_options,
            implicit_dependencies,
            default_base: raw.affected.default_base,
            workspace_layout: WorkspaceLayout {
                apps_dir: raw
                    .workspace_layout
                    .apps_dir
                    .unwrap_or_else(|| WorkspaceLayout::default().apps_dir),
                libs_dir: raw
                    .workspace_layout
                    .libs_dir
                    .unwrap_or_else(|| WorkspaceLayout::default().libs_dir),
            },
        }
    }

    pub fn default_runner(&self) -> Option<&RunnerOptions> {
        self.tasks_runner_options.get(DEFAULT_RUNNER_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_entries_normalize() {
        let config = WorkspaceConfig::from_str(
            r#"{
                "plugins": [
                    "typescript",
                    { "plugin": "typescript", "options": { "targetName": "tc" } }
                ]
            }"#,
            "nx.json",
        )
        .unwrap();
        assert_eq!(config.plugins.len(), 2);
        assert_eq!(config.plugins[0].name, "typescript");
        assert!(config.plugins[0].options.is_null());
        assert_eq!(config.plugins[1].options["targetName"], "tc");
    }

    #[test]
    fn test_runner_options_both_forms() {
        let named = WorkspaceConfig::from_str(
            r#"{
                "tasksRunnerOptions": {
                    "default": { "runner": "nx/tasks-runners/default", "options": { "cacheableOperations": ["build"] } }
                }
            }"#,
            "nx.json",
        )
        .unwrap();
        assert_eq!(
            named.default_runner().unwrap().runner,
            "nx/tasks-runners/default"
        );

        let legacy = WorkspaceConfig::from_str(
            r#"{ "tasksRunnerOptions": { "runner": "nx/tasks-runners/default" } }"#,
            "nx.json",
        )
        .unwrap();
        assert_eq!(
            legacy.default_runner().unwrap().runner,
            "nx/tasks-runners/default"
        );
    }

    #[test]
    fn test_implicit_dependencies_forms() {
        let config = WorkspaceConfig::from_str(
            r#"{
                "implicitDependencies": {
                    "package.json": "*",
                    "tools/shared.js": ["api", "web"]
                }
            }"#,
            "nx.json",
        )
        .unwrap();
        assert_eq!(
            config.implicit_dependencies["package.json"],
            ImplicitDependants::All
        );
        assert_eq!(
            config.implicit_dependencies["tools/shared.js"],
            ImplicitDependants::Projects(vec!["api".into(), "web".into()])
        );
    }

    #[test]
    fn test_affected_and_layout() {
        let config = WorkspaceConfig::from_str(
            r#"{
                "affected": { "defaultBase": "origin/main" },
                "workspaceLayout": { "appsDir": "applications" }
            }"#,
            "nx.json",
        )
        .unwrap();
        assert_eq!(config.default_base.as_deref(), Some("origin/main"));
        assert_eq!(config.workspace_layout.apps_dir, "applications");
        assert_eq!(config.workspace_layout.libs_dir, "libs");
    }
}
