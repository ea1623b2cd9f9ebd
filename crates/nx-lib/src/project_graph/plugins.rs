//! The plugin registry: a uniform contract for modules that contribute
//! nodes and edges to the project graph.
//!
//! Plugins are pure with respect to the graph. The registry only ever hands
//! out owned values (freshly computed or deserialized from the memo store),
//! so a caller mutating a returned delta cannot affect what anyone else
//! sees.

use std::{collections::BTreeMap, fmt};

use nx_hash::{ContentHasher, FileHasher};
use nxpath::{AbsoluteSystemPath, RelativeUnixPathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::{Edge, ProjectGraph, ProjectType};
use crate::config::{ConfigError, PluginSpec, TargetConfig, WorkspaceConfig};

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin {plugin} failed: {message}")]
    Failed { plugin: String, message: String },
    #[error("plugin {plugin} declared an invalid glob {glob}: {message}")]
    InvalidGlob {
        plugin: String,
        glob: String,
        message: String,
    },
}

/// What a plugin proposes for one project root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectDelta {
    pub root: RelativeUnixPathBuf,
    pub project_type: Option<ProjectType>,
    pub targets: BTreeMap<String, TargetConfig>,
}

pub struct PluginContext<'a> {
    pub workspace_root: &'a AbsoluteSystemPath,
    pub workspace_config: &'a WorkspaceConfig,
}

pub struct CreateDependenciesContext<'a> {
    pub workspace_root: &'a AbsoluteSystemPath,
    pub graph: &'a ProjectGraph,
}

/// The capability surface of a graph plugin. Both entry points are
/// optional; the defaults contribute nothing.
pub trait GraphPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Glob selecting the files this plugin wants to see, or `None` when it
    /// contributes no nodes.
    fn create_nodes_glob(&self) -> Option<String> {
        None
    }

    fn create_nodes(
        &self,
        _matches: &[RelativeUnixPathBuf],
        _ctx: &PluginContext,
    ) -> Result<Vec<ProjectDelta>, PluginError> {
        Ok(Vec::new())
    }

    fn create_dependencies(
        &self,
        _ctx: &CreateDependenciesContext,
    ) -> Result<Vec<Edge>, PluginError> {
        Ok(Vec::new())
    }
}

/// Options of the built-in typescript plugin, as written by users:
/// `true`/`false`, or `{ targetName?, configName? }`. Normalized exactly
/// once, here.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawTypescriptOptions {
    Toggle(bool),
    Configured {
        #[serde(rename = "targetName")]
        target_name: Option<String>,
        #[serde(rename = "configName")]
        config_name: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypescriptPluginOptions {
    Disabled,
    Enabled {
        target_name: String,
        config_name: String,
    },
}

impl TypescriptPluginOptions {
    pub fn normalize(options: &serde_json::Value) -> Self {
        let enabled_default = TypescriptPluginOptions::Enabled {
            target_name: "typecheck".to_string(),
            config_name: "tsconfig.json".to_string(),
        };
        if options.is_null() {
            return enabled_default;
        }
        match serde_json::from_value::<RawTypescriptOptions>(options.clone()) {
            Ok(RawTypescriptOptions::Toggle(false)) => TypescriptPluginOptions::Disabled,
            Ok(RawTypescriptOptions::Toggle(true)) | Err(_) => enabled_default,
            Ok(RawTypescriptOptions::Configured {
                target_name,
                config_name,
            }) => TypescriptPluginOptions::Enabled {
                target_name: target_name.unwrap_or_else(|| "typecheck".to_string()),
                config_name: config_name.unwrap_or_else(|| "tsconfig.json".to_string()),
            },
        }
    }
}

/// Built-in plugin: projects carrying a tsconfig get a cached `typecheck`
/// target.
pub struct TypescriptPlugin {
    options: TypescriptPluginOptions,
}

impl TypescriptPlugin {
    pub const NAME: &'static str = "typescript";

    pub fn new(options: &serde_json::Value) -> Self {
        Self {
            options: TypescriptPluginOptions::normalize(options),
        }
    }
}

impl GraphPlugin for TypescriptPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn create_nodes_glob(&self) -> Option<String> {
        match &self.options {
            TypescriptPluginOptions::Disabled => None,
            TypescriptPluginOptions::Enabled { config_name, .. } => {
                Some(format!("**/{config_name}"))
            }
        }
    }

    fn create_nodes(
        &self,
        matches: &[RelativeUnixPathBuf],
        _ctx: &PluginContext,
    ) -> Result<Vec<ProjectDelta>, PluginError> {
        let TypescriptPluginOptions::Enabled {
            target_name,
            config_name,
        } = &self.options
        else {
            return Ok(Vec::new());
        };

        let mut deltas = Vec::new();
        for config_path in matches {
            let Some(root) = config_path
                .as_str()
                .strip_suffix(config_name)
                .map(|root| root.trim_end_matches('/'))
            else {
                continue;
            };
            // the workspace root's tsconfig is not a project
            if root.is_empty() {
                continue;
            }
            let target = TargetConfig {
                command: Some(format!("tsc -p {} --noEmit", config_path.as_str())),
                cache: Some(true),
                inputs: Some(vec!["default".to_string()]),
                ..Default::default()
            };
            deltas.push(ProjectDelta {
                root: RelativeUnixPathBuf::new(root.to_string())
                    .expect("tsconfig match is workspace-relative"),
                project_type: None,
                targets: BTreeMap::from([(target_name.clone(), target)]),
            });
        }
        Ok(deltas)
    }
}

struct RegisteredPlugin {
    spec: PluginSpec,
    plugin: Box<dyn GraphPlugin>,
}

pub struct PluginRegistry {
    plugins: Vec<RegisteredPlugin>,
    /// Memoized plugin results live here, keyed by input fingerprint.
    memo_dir: Option<nxpath::AbsoluteSystemPathBuf>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.plugins.iter().map(|p| &p.spec).collect::<Vec<_>>())
            .field("memo_dir", &self.memo_dir)
            .finish()
    }
}

impl PluginRegistry {
    /// Resolves the configured plugin list. Unknown plugin names and
    /// duplicate registrations are configuration errors.
    pub fn from_config(config: &WorkspaceConfig) -> Result<Self, ConfigError> {
        let mut plugins: Vec<RegisteredPlugin> = Vec::new();
        for spec in &config.plugins {
            if plugins.iter().any(|existing| existing.spec.name == spec.name) {
                return Err(ConfigError::DuplicatePlugin(spec.name.clone()));
            }
            let plugin: Box<dyn GraphPlugin> = match spec.name.as_str() {
                TypescriptPlugin::NAME => Box::new(TypescriptPlugin::new(&spec.options)),
                other => return Err(ConfigError::UnknownPlugin(other.to_string())),
            };
            plugins.push(RegisteredPlugin {
                spec: spec.clone(),
                plugin,
            });
        }
        Ok(Self {
            plugins,
            memo_dir: None,
        })
    }

    pub fn with_memo_dir(mut self, memo_dir: nxpath::AbsoluteSystemPathBuf) -> Self {
        self.memo_dir = Some(memo_dir);
        self
    }

    pub fn plugin_specs(&self) -> impl Iterator<Item = &PluginSpec> {
        self.plugins.iter().map(|registered| &registered.spec)
    }

    /// Runs every plugin's `create_nodes` over the workspace file set.
    /// Results are memoized per plugin, keyed by the plugin's declared
    /// input fingerprint: its options, the lockfile, and the matched files'
    /// content hashes.
    pub fn create_nodes(
        &self,
        file_hasher: &FileHasher,
        lockfile_hash: &str,
        ctx: &PluginContext,
    ) -> Result<Vec<ProjectDelta>, PluginError> {
        let mut deltas = Vec::new();
        for registered in &self.plugins {
            let Some(glob) = registered.plugin.create_nodes_glob() else {
                continue;
            };
            let matcher = globset::Glob::new(&glob)
                .map_err(|err| PluginError::InvalidGlob {
                    plugin: registered.spec.name.clone(),
                    glob: glob.clone(),
                    message: err.to_string(),
                })?
                .compile_matcher();

            let matches: Vec<RelativeUnixPathBuf> = file_hasher
                .all_file_data()
                .filter(|record| matcher.is_match(record.path.as_str()))
                .map(|record| record.path.clone())
                .collect();

            let fingerprint = self.fingerprint(registered, lockfile_hash, file_hasher, &matches);
            if let Some(memoized) = self.read_memo(&registered.spec.name, &fingerprint) {
                debug!(
                    "plugin {} satisfied from memo {fingerprint}",
                    registered.spec.name
                );
                deltas.extend(memoized);
                continue;
            }

            let result = registered.plugin.create_nodes(&matches, ctx)?;
            self.write_memo(&registered.spec.name, &fingerprint, &result);
            deltas.extend(result);
        }
        Ok(deltas)
    }

    pub fn create_dependencies(
        &self,
        ctx: &CreateDependenciesContext,
    ) -> Result<Vec<Edge>, PluginError> {
        let mut edges = Vec::new();
        for registered in &self.plugins {
            edges.extend(registered.plugin.create_dependencies(ctx)?);
        }
        Ok(edges)
    }

    fn fingerprint(
        &self,
        registered: &RegisteredPlugin,
        lockfile_hash: &str,
        file_hasher: &FileHasher,
        matches: &[RelativeUnixPathBuf],
    ) -> String {
        let mut hasher = ContentHasher::new();
        hasher.put_section("plugin", &registered.spec.name);
        hasher.put_section("options", registered.spec.options.to_string());
        hasher.put_section("lockfile", lockfile_hash);
        hasher.put_section(
            "matches",
            file_hasher.hash_files(matches.iter().map(|path| path.as_ref())),
        );
        hasher.finish()
    }

    fn memo_path(&self, plugin: &str, fingerprint: &str) -> Option<nxpath::AbsoluteSystemPathBuf> {
        self.memo_dir
            .as_ref()
            .map(|dir| dir.join_component(&format!("{plugin}-{fingerprint}.json")))
    }

    fn read_memo(&self, plugin: &str, fingerprint: &str) -> Option<Vec<ProjectDelta>> {
        let path = self.memo_path(plugin, fingerprint)?;
        let text = path.read_to_string().ok()?;
        serde_json::from_str(&text).ok()
    }

    fn write_memo(&self, plugin: &str, fingerprint: &str, deltas: &[ProjectDelta]) {
        let Some(path) = self.memo_path(plugin, fingerprint) else {
            return;
        };
        let Ok(contents) = serde_json::to_string(deltas) else {
            return;
        };
        let write = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                parent.create_dir_all()?;
            }
            let temp = path
                .parent()
                .expect("memo path has a parent")
                .join_component(&format!(".{plugin}-{fingerprint}.{}.tmp", std::process::id()));
            temp.create_with_contents(&contents)?;
            temp.rename(&path)
        };
        if let Err(err) = write() {
            warn!("unable to memoize plugin {plugin} result: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkspaceConfig;

    #[test]
    fn test_options_normalization() {
        assert_eq!(
            TypescriptPluginOptions::normalize(&serde_json::json!(false)),
            TypescriptPluginOptions::Disabled
        );
        assert_eq!(
            TypescriptPluginOptions::normalize(&serde_json::Value::Null),
            TypescriptPluginOptions::Enabled {
                target_name: "typecheck".into(),
                config_name: "tsconfig.json".into()
            }
        );
        assert_eq!(
            TypescriptPluginOptions::normalize(&serde_json::json!({
                "targetName": "tc",
                "configName": "tsconfig.lib.json"
            })),
            TypescriptPluginOptions::Enabled {
                target_name: "tc".into(),
                config_name: "tsconfig.lib.json".into()
            }
        );
    }

    #[test]
    fn test_typescript_plugin_contributes_targets() {
        let plugin = TypescriptPlugin::new(&serde_json::Value::Null);
        let config = WorkspaceConfig::default();
        let dir = tempfile::tempdir().unwrap();
        let root = nxpath::AbsoluteSystemPathBuf::from_std_path(dir.path()).unwrap();
        let ctx = PluginContext {
            workspace_root: &root,
            workspace_config: &config,
        };
        let deltas = plugin
            .create_nodes(
                &[
                    RelativeUnixPathBuf::new("libs/a/tsconfig.json").unwrap(),
                    RelativeUnixPathBuf::new("tsconfig.json").unwrap(),
                ],
                &ctx,
            )
            .unwrap();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].root.as_str(), "libs/a");
        let target = &deltas[0].targets["typecheck"];
        assert_eq!(target.cache, Some(true));
        assert!(target.command.as_deref().unwrap().contains("libs/a/tsconfig.json"));
    }

    #[test]
    fn test_unknown_and_duplicate_plugins_rejected() {
        let unknown = WorkspaceConfig::from_str(
            r#"{ "plugins": ["does-not-exist"] }"#,
            "nx.json",
        )
        .unwrap();
        assert!(matches!(
            PluginRegistry::from_config(&unknown).unwrap_err(),
            ConfigError::UnknownPlugin(name) if name == "does-not-exist"
        ));

        let duplicate = WorkspaceConfig::from_str(
            r#"{ "plugins": ["typescript", { "plugin": "typescript" }] }"#,
            "nx.json",
        )
        .unwrap();
        assert!(matches!(
            PluginRegistry::from_config(&duplicate).unwrap_err(),
            ConfigError::DuplicatePlugin(name) if name == "typescript"
        ));
    }
}
