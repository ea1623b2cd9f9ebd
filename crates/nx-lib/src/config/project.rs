//! Per-project configuration: the `project.json` descriptor and the target
//! configuration shape shared with `targetDefaults`.

use std::collections::BTreeMap;

use nxpath::{AbsoluteSystemPath, RelativeUnixPathBuf};
use serde::{Deserialize, Serialize};

use crate::config::{parser::parse_jsonc_as, ConfigError};

pub const PROJECT_DESCRIPTOR: &str = "project.json";

/// A target as declared in a descriptor or in `targetDefaults`. `Option`
/// everywhere so merging can tell "unset" from "set to the default".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TargetConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configurations: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_configuration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<bool>,
}

impl TargetConfig {
    /// Overlays `self` (the more specific config) on top of `defaults`.
    /// Field-wise: a set field wins over the default wholesale; lists are
    /// not concatenated.
    pub fn merged_with_defaults(&self, defaults: Option<&TargetConfig>) -> TargetConfig {
        let Some(defaults) = defaults else {
            return self.clone();
        };
        TargetConfig {
            executor: self.executor.clone().or_else(|| defaults.executor.clone()),
            command: self.command.clone().or_else(|| defaults.command.clone()),
            options: self.options.clone().or_else(|| defaults.options.clone()),
            configurations: self
                .configurations
                .clone()
                .or_else(|| defaults.configurations.clone()),
            default_configuration: self
                .default_configuration
                .clone()
                .or_else(|| defaults.default_configuration.clone()),
            depends_on: self
                .depends_on
                .clone()
                .or_else(|| defaults.depends_on.clone()),
            inputs: self.inputs.clone().or_else(|| defaults.inputs.clone()),
            outputs: self.outputs.clone().or_else(|| defaults.outputs.clone()),
            cache: self.cache.or(defaults.cache),
        }
    }
}

/// The raw `project.json` descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectConfig {
    pub name: Option<String>,
    pub project_type: Option<String>,
    pub source_root: Option<RelativeUnixPathBuf>,
    pub tags: Vec<String>,
    pub targets: BTreeMap<String, TargetConfig>,
    pub implicit_dependencies: Vec<String>,
    pub named_inputs: BTreeMap<String, Vec<String>>,
}

impl ProjectConfig {
    pub fn load(path: &AbsoluteSystemPath) -> Result<Self, ConfigError> {
        let text = path
            .read_to_string()
            .map_err(|err| ConfigError::Read {
                path: path.to_string(),
                message: err.to_string(),
            })?;
        parse_jsonc_as(&text, path.as_str())
    }
}
