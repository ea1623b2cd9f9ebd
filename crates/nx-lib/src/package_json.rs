use std::collections::BTreeMap;

use nxpath::AbsoluteSystemPath;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

pub const PACKAGE_JSON: &str = "package.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PackageJson {
    pub name: Option<String>,
    pub version: Option<String>,
    pub scripts: BTreeMap<String, String>,
    pub dependencies: BTreeMap<String, String>,
    pub dev_dependencies: BTreeMap<String, String>,
}

impl PackageJson {
    pub fn load(path: &AbsoluteSystemPath) -> Result<Self, ConfigError> {
        let text = path.read_to_string().map_err(|err| ConfigError::Read {
            path: path.to_string(),
            message: err.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|err| ConfigError::Shape {
            path: path.to_string(),
            message: err.to_string(),
        })
    }

    /// Every declared dependency name, production and development.
    pub fn all_dependency_names(&self) -> impl Iterator<Item = &str> {
        self.dependencies
            .keys()
            .chain(self.dev_dependencies.keys())
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let parsed: PackageJson = serde_json::from_str(
            r#"{
                "name": "@proj/api",
                "version": "1.2.3",
                "scripts": { "build": "tsc -b" },
                "dependencies": { "lodash": "^4.17.0" },
                "devDependencies": { "typescript": "~5.0.0" }
            }"#,
        )
        .unwrap();
        assert_eq!(parsed.name.as_deref(), Some("@proj/api"));
        assert_eq!(
            parsed.all_dependency_names().collect::<Vec<_>>(),
            vec!["lodash", "typescript"]
        );
    }
}
