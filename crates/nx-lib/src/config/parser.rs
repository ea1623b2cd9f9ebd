//! JSON-with-comments parsing shared by every configuration surface.

use jsonc_parser::ParseOptions;
use miette::{Diagnostic, NamedSource, SourceSpan};
use thiserror::Error;

/// A parse failure with enough context for miette to show the offending
/// bytes.
#[derive(Debug, Error, Diagnostic)]
#[error("failed to parse {path}: {message}")]
pub struct ParseDiagnostic {
    pub path: String,
    pub message: String,
    #[source_code]
    pub source_code: NamedSource<String>,
    #[label("here")]
    pub label: Option<SourceSpan>,
}

/// Parses JSONC text into a `serde_json::Value`.
pub fn parse_jsonc(text: &str, path: &str) -> Result<serde_json::Value, Box<ParseDiagnostic>> {
    match jsonc_parser::parse_to_serde_value(text, &ParseOptions::default()) {
        Ok(Some(value)) => Ok(value),
        Ok(None) => Ok(serde_json::Value::Null),
        Err(err) => {
            let message = err.to_string();
            // The parser renders "<kind> on line N column M"; recover a span
            // from the line/column so miette can label the source.
            let label = span_from_message(&message, text);
            Err(Box::new(ParseDiagnostic {
                path: path.to_string(),
                message,
                source_code: NamedSource::new(path, text.to_string()),
                label,
            }))
        }
    }
}

fn span_from_message(message: &str, text: &str) -> Option<SourceSpan> {
    let line: usize = capture_number(message, "line ")?;
    let column: usize = capture_number(message, "column ")?;
    let line_start: usize = text
        .split_inclusive('\n')
        .take(line.saturating_sub(1))
        .map(str::len)
        .sum();
    let offset = (line_start + column.saturating_sub(1)).min(text.len());
    Some(SourceSpan::new(offset.into(), 1_usize.into()))
}

fn capture_number(message: &str, prefix: &str) -> Option<usize> {
    let rest = &message[message.find(prefix)? + prefix.len()..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Parses JSONC text straight into a deserializable type.
pub fn parse_jsonc_as<T: serde::de::DeserializeOwned>(
    text: &str,
    path: &str,
) -> Result<T, crate::config::ConfigError> {
    let value = parse_jsonc(text, path).map_err(crate::config::ConfigError::Parse)?;
    serde_json::from_value(value).map_err(|err| crate::config::ConfigError::Shape {
        path: path.to_string(),
        message: err.to_string(),
    })
}
