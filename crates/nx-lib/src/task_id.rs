use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies one task: `project:target`, or `project:target:configuration`
/// when a configuration was resolved for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    project: String,
    target: String,
    configuration: Option<String>,
}

impl TaskId {
    pub fn new(project: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            target: target.into(),
            configuration: None,
        }
    }

    pub fn with_configuration(mut self, configuration: Option<String>) -> Self {
        self.configuration = configuration;
        self
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn configuration(&self) -> Option<&str> {
        self.configuration.as_deref()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.configuration {
            Some(configuration) => {
                write!(f, "{}:{}:{}", self.project, self.target, configuration)
            }
            None => write!(f, "{}:{}", self.project, self.target),
        }
    }
}

/// One entry of a target's `dependsOn` list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetDependencySpec {
    /// `"T"`: run `T` on the same project first.
    Own { target: String },
    /// `"^T"`: run `T` on each of the project's dependencies first.
    Dependencies { target: String },
}

impl TargetDependencySpec {
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix('^') {
            Some(target) => TargetDependencySpec::Dependencies {
                target: target.to_string(),
            },
            None => TargetDependencySpec::Own {
                target: raw.to_string(),
            },
        }
    }

    pub fn target(&self) -> &str {
        match self {
            TargetDependencySpec::Own { target } => target,
            TargetDependencySpec::Dependencies { target } => target,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(TaskId::new("web", "build").to_string(), "web:build");
        assert_eq!(
            TaskId::new("web", "build")
                .with_configuration(Some("production".into()))
                .to_string(),
            "web:build:production"
        );
    }

    #[test]
    fn test_depends_on_parse() {
        assert_eq!(
            TargetDependencySpec::parse("^build"),
            TargetDependencySpec::Dependencies {
                target: "build".into()
            }
        );
        assert_eq!(
            TargetDependencySpec::parse("codegen"),
            TargetDependencySpec::Own {
                target: "codegen".into()
            }
        );
    }
}
