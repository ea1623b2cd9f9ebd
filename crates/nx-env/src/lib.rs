//! Environment variable capture and selection.
//!
//! The environment is snapshotted once at startup and selections are made
//! against that snapshot, so a task hash can never observe a variable that
//! changed mid-run.

use std::{
    collections::HashMap,
    env,
    ops::{Deref, DerefMut},
};

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error("failed to parse env wildcard: {0}")]
    Regex(#[from] regex::Error),
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(transparent)]
pub struct EnvironmentVariableMap(HashMap<String, String>);

/// A list of `k=v` strings, the form that enters the task hash.
pub type EnvironmentVariablePairs = Vec<String>;

impl EnvironmentVariableMap {
    /// Snapshot of the current process environment.
    pub fn infer() -> Self {
        EnvironmentVariableMap(env::vars().collect())
    }

    pub fn into_inner(self) -> HashMap<String, String> {
        self.0
    }

    /// Sorted `k=v` pairs. Sorting makes the result hashable without regard
    /// to map iteration order.
    pub fn to_hashable(&self) -> EnvironmentVariablePairs {
        let mut pairs: Vec<_> = self.iter().map(|(k, v)| format!("{k}={v}")).collect();
        pairs.sort();
        pairs
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.keys().cloned().collect();
        names.sort();
        names
    }

    /// Adds all entries from `other`, overwriting existing keys.
    pub fn union(&mut self, other: &EnvironmentVariableMap) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Removes all keys present in `other`.
    pub fn difference(&mut self, other: &EnvironmentVariableMap) {
        for key in other.0.keys() {
            self.0.remove(key);
        }
    }

    /// Returns the variables matching a set of wildcard patterns. Patterns
    /// prefixed with `!` exclude, and exclusions win over inclusions. A
    /// leading `\!` matches a literal bang.
    pub fn from_wildcards(
        &self,
        wildcard_patterns: &[impl AsRef<str>],
    ) -> Result<EnvironmentVariableMap, Error> {
        if wildcard_patterns.is_empty() {
            return Ok(EnvironmentVariableMap::default());
        }

        let mut include_patterns = Vec::new();
        let mut exclude_patterns = Vec::new();
        for pattern in wildcard_patterns {
            let pattern = pattern.as_ref();
            if let Some(rest) = pattern.strip_prefix('!') {
                exclude_patterns.push(wildcard_to_regex_pattern(rest));
            } else if let Some(rest) = pattern.strip_prefix("\\!") {
                include_patterns.push(wildcard_to_regex_pattern(&format!("!{rest}")));
            } else {
                include_patterns.push(wildcard_to_regex_pattern(pattern));
            }
        }

        let include_regex = Regex::new(&format!("^({})$", include_patterns.join("|")))?;
        let exclude_regex = Regex::new(&format!("^({})$", exclude_patterns.join("|")))?;

        let mut output = EnvironmentVariableMap::default();
        for (name, value) in &self.0 {
            if !include_patterns.is_empty()
                && include_regex.is_match(name)
                && !(!exclude_patterns.is_empty() && exclude_regex.is_match(name))
            {
                output.insert(name.clone(), value.clone());
            }
        }
        Ok(output)
    }
}

impl From<HashMap<String, String>> for EnvironmentVariableMap {
    fn from(map: HashMap<String, String>) -> Self {
        EnvironmentVariableMap(map)
    }
}

impl Deref for EnvironmentVariableMap {
    type Target = HashMap<String, String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for EnvironmentVariableMap {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

const WILDCARD: char = '*';
const WILDCARD_ESCAPE: char = '\\';
const REGEX_WILDCARD_SEGMENT: &str = ".*";

/// Translates a `*` wildcard pattern into a regex fragment. `\*` matches a
/// literal star; runs of adjacent wildcards collapse into one dynamic
/// segment. Everything else is matched literally, so regex metacharacters
/// in variable names cannot smuggle in syntax.
fn wildcard_to_regex_pattern(pattern: &str) -> String {
    let mut regex = String::with_capacity(pattern.len() + 4);
    // literal characters accumulate here until a wildcard flushes them
    let mut literal = String::new();
    let mut previous_was_wildcard = false;

    let mut chars = pattern.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == WILDCARD_ESCAPE && chars.peek() == Some(&WILDCARD) {
            chars.next();
            literal.push(WILDCARD);
            previous_was_wildcard = false;
        } else if ch == WILDCARD {
            if !literal.is_empty() {
                regex.push_str(&regex::escape(&literal));
                literal.clear();
            }
            if !previous_was_wildcard {
                regex.push_str(REGEX_WILDCARD_SEGMENT);
            }
            previous_was_wildcard = true;
        } else {
            literal.push(ch);
            previous_was_wildcard = false;
        }
    }
    if !literal.is_empty() {
        regex.push_str(&regex::escape(&literal));
    }
    regex
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use test_case::test_case;

    use super::*;

    #[test_case("LITERAL_\\*", "LITERAL_\\*" ; "literal star")]
    #[test_case("\\*LEADING", "\\*LEADING" ; "leading literal star")]
    #[test_case("\\!LEADING", "\\\\!LEADING" ; "leading literal bang")]
    #[test_case("!LEADING", "!LEADING" ; "leading bang")]
    #[test_case("*LEADING", ".*LEADING" ; "leading star")]
    #[test_case("TRAILING_*", "TRAILING_.*" ; "trailing star")]
    #[test_case("DOUBLE**STAR", "DOUBLE.*STAR" ; "adjacent stars collapse")]
    #[test_case("NO_WILDCARD", "NO_WILDCARD" ; "no wildcard")]
    fn test_wildcard_to_regex_pattern(pattern: &str, expected: &str) {
        let actual = super::wildcard_to_regex_pattern(pattern);
        assert_eq!(actual, expected);
    }

    fn fixture() -> EnvironmentVariableMap {
        EnvironmentVariableMap::from(HashMap::from([
            ("CI".to_string(), "true".to_string()),
            ("NODE_ENV".to_string(), "production".to_string()),
            ("NODE_OPTIONS".to_string(), "--max-old-space".to_string()),
            ("HOME".to_string(), "/home/dev".to_string()),
        ]))
    }

    #[test]
    fn test_from_wildcards_selects() {
        let env = fixture();
        let selected = env.from_wildcards(&["NODE_*"]).unwrap();
        assert_eq!(selected.names(), vec!["NODE_ENV", "NODE_OPTIONS"]);
    }

    #[test]
    fn test_exclusions_win() {
        let env = fixture();
        let selected = env.from_wildcards(&["NODE_*", "!NODE_OPTIONS"]).unwrap();
        assert_eq!(selected.names(), vec!["NODE_ENV"]);
    }

    #[test]
    fn test_escaped_bang_is_a_literal_inclusion() {
        let mut env = fixture();
        env.insert("!FLAG".to_string(), "set".to_string());
        let selected = env.from_wildcards(&["\\!FLAG"]).unwrap();
        assert_eq!(selected.names(), vec!["!FLAG"]);
    }

    #[test]
    fn test_to_hashable_is_sorted() {
        let env = fixture();
        let pairs = env.to_hashable();
        let mut sorted = pairs.clone();
        sorted.sort();
        assert_eq!(pairs, sorted);
    }
}
