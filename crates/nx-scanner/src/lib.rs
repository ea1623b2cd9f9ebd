//! Import scanner for TypeScript/JavaScript sources.
//!
//! Extracts module specifiers referenced from a source file without a full
//! semantic parse. A single token-level pass recognizes every import-like
//! form; a detail pass runs only when the fast pass saw an ignore marker or a
//! `loadChildren` route string, keeping the common path cheap.
//!
//! The scanner is a pure function of the source text: scanning the same bytes
//! twice yields identical output.

mod lexer;

use std::ops::Range;

use serde::{Deserialize, Serialize};

pub use crate::lexer::IGNORE_MARKER;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ImportKind {
    /// `import … from 'M'`, `import 'M'`
    Static,
    /// `import('M')`
    Dynamic,
    /// `import type … from 'M'`
    TypeOnly,
    /// `require('M')`, `import x = require('M')`
    Require,
    /// `export … from 'M'`, `export * from 'M'`, `export * as NS from 'M'`
    ReExport,
    /// AMD `define(['M'], …)`
    Amd,
    /// `loadChildren: 'M#Routes'` on an object literal
    LoadChildren,
}

impl ImportKind {
    /// Whether an edge produced from this import is resolved lazily at
    /// runtime rather than at load time.
    pub fn is_dynamic(&self) -> bool {
        matches!(self, ImportKind::Dynamic | ImportKind::LoadChildren)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Import {
    pub specifier: String,
    pub kind: ImportKind,
    /// Byte range of the specifier literal, quotes excluded.
    pub span: Range<usize>,
    /// 1-based line the import starts on.
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directive {
    pub text: String,
    pub line: usize,
}

/// Everything the scanner learned about one source file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceScan {
    pub imports: Vec<Import>,
    /// Module names from `declare module 'M'` blocks.
    pub ambient_modules: Vec<String>,
    /// Targets of `/// <reference path="…" />` directives.
    pub referenced_files: Vec<String>,
    /// Comment pragmas (`// @…`, `/* @… */`, `/// <reference types=…>`).
    pub directives: Vec<Directive>,
}

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("unterminated template literal starting on line {line} of {path}")]
    UnterminatedTemplate { path: String, line: usize },
}

/// Scans a source file for module references.
///
/// Errors are non-fatal by contract: a caller building a graph downgrades
/// them to warnings and drops the file from explicit-edge contribution.
pub fn scan(source: &str, file_path: &str) -> Result<SourceScan, ScanError> {
    lexer::Lexer::new(source, file_path).scan()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;

    fn specifiers(source: &str) -> Vec<(String, ImportKind)> {
        scan(source, "test.ts")
            .unwrap()
            .imports
            .into_iter()
            .map(|import| (import.specifier, import.kind))
            .collect()
    }

    #[test]
    fn test_static_import_forms() {
        let source = r#"
            import {a} from '@proj/one';
            import two from "@proj/two";
            import * as three from '@proj/three';
            import '@proj/side-effect';
            import type {T} from '@proj/types';
        "#;
        assert_eq!(
            specifiers(source),
            vec![
                ("@proj/one".to_string(), ImportKind::Static),
                ("@proj/two".to_string(), ImportKind::Static),
                ("@proj/three".to_string(), ImportKind::Static),
                ("@proj/side-effect".to_string(), ImportKind::Static),
                ("@proj/types".to_string(), ImportKind::TypeOnly),
            ]
        );
    }

    #[test]
    fn test_dynamic_and_require_forms() {
        let source = r#"
            const a = await import('@proj/lazy');
            const b = require('@proj/legacy');
            import tls = require('@proj/tls');
            function nested() { return require('@proj/nested'); }
        "#;
        assert_eq!(
            specifiers(source),
            vec![
                ("@proj/lazy".to_string(), ImportKind::Dynamic),
                ("@proj/legacy".to_string(), ImportKind::Require),
                ("@proj/tls".to_string(), ImportKind::Require),
                ("@proj/nested".to_string(), ImportKind::Require),
            ]
        );
    }

    #[test]
    fn test_reexport_forms() {
        let source = r#"
            export {a, b as c} from '@proj/barrel';
            export * from '@proj/star';
            export * as ns from '@proj/named-star';
            export const local = 1;
        "#;
        assert_eq!(
            specifiers(source),
            vec![
                ("@proj/barrel".to_string(), ImportKind::ReExport),
                ("@proj/star".to_string(), ImportKind::ReExport),
                ("@proj/named-star".to_string(), ImportKind::ReExport),
            ]
        );
    }

    #[test]
    fn test_amd_define() {
        let source = r#"
            define(['dep/one', 'dep/two'], function (one, two) { return one; });
            define('named', ['dep/three'], (three) => three);
        "#;
        assert_eq!(
            specifiers(source),
            vec![
                ("dep/one".to_string(), ImportKind::Amd),
                ("dep/two".to_string(), ImportKind::Amd),
                ("dep/three".to_string(), ImportKind::Amd),
            ]
        );
    }

    #[test]
    fn test_load_children() {
        let source = r#"
            const routes = [{
                path: 'admin',
                loadChildren: '@proj/proj4ab#AdminModule',
            }];
        "#;
        assert_eq!(
            specifiers(source),
            vec![("@proj/proj4ab".to_string(), ImportKind::LoadChildren)]
        );
    }

    #[test_case("// nx-ignore-next-line" ; "line comment")]
    #[test_case("/* nx-ignore-next-line */" ; "block comment")]
    #[test_case("/*   nx-ignore-next-line   */" ; "block comment with padding")]
    fn test_ignore_marker_suppresses_next_line(marker: &str) {
        let source = format!("{marker}\nimport {{a}} from '@proj/one';\nimport b from '@proj/two';\n");
        assert_eq!(
            specifiers(&source),
            vec![("@proj/two".to_string(), ImportKind::Static)]
        );
    }

    #[test]
    fn test_ignore_marker_across_excess_whitespace() {
        let source = "/* nx-ignore-next-line */\n\n   \nimport {a} from '@proj/one';\n";
        assert_eq!(specifiers(source), vec![]);
    }

    #[test]
    fn test_ignore_marker_suppresses_load_children() {
        let source = "const r = {\n// nx-ignore-next-line\nloadChildren: '@proj/proj4ab#a',\n};";
        assert_eq!(specifiers(source), vec![]);
    }

    #[test]
    fn test_strings_are_not_import_positions() {
        let source = r#"
            const s = "import {a} from '@proj/one'";
            const t = `import {a} from '@proj/two'`;
            const u = 'require("@proj/three")';
        "#;
        assert_eq!(specifiers(source), vec![]);
    }

    #[test]
    fn test_import_after_template_still_counts() {
        let source = "const t = `import {a} from '@proj/fake'`;\nimport {b} from '@proj/real';";
        assert_eq!(
            specifiers(source),
            vec![("@proj/real".to_string(), ImportKind::Static)]
        );
    }

    #[test]
    fn test_template_interpolation_is_code() {
        let source = "const t = `prefix ${require('@proj/inner')} suffix`;";
        assert_eq!(
            specifiers(source),
            vec![("@proj/inner".to_string(), ImportKind::Require)]
        );
    }

    #[test]
    fn test_nested_template_interpolation() {
        let source = "const t = `a ${`b ${require('@proj/deep')}`} c`;";
        assert_eq!(
            specifiers(source),
            vec![("@proj/deep".to_string(), ImportKind::Require)]
        );
    }

    #[test]
    fn test_unterminated_template_is_an_error() {
        let source = "const t = `never closed\nimport {a} from '@proj/one';";
        let err = scan(source, "broken.ts").unwrap_err();
        assert!(matches!(
            err,
            ScanError::UnterminatedTemplate { line: 1, .. }
        ));
    }

    #[test]
    fn test_member_access_require_is_not_an_import() {
        let source = "foo.require('@proj/not-an-import');";
        assert_eq!(specifiers(source), vec![]);
    }

    #[test]
    fn test_regex_literals_do_not_confuse_strings() {
        let source = "const re = /['\"`]/g;\nimport {a} from '@proj/after-regex';";
        assert_eq!(
            specifiers(source),
            vec![("@proj/after-regex".to_string(), ImportKind::Static)]
        );
    }

    #[test]
    fn test_triple_slash_references_and_pragmas() {
        let source = "/// <reference path=\"./ambient.d.ts\" />\n/// <reference types=\"node\" />\n// @ts-nocheck\nexport {};";
        let result = scan(source, "refs.ts").unwrap();
        assert_eq!(result.referenced_files, vec!["./ambient.d.ts"]);
        let directive_texts: Vec<_> = result
            .directives
            .iter()
            .map(|d| d.text.as_str())
            .collect();
        assert!(directive_texts.iter().any(|t| t.contains("types=\"node\"")));
        assert!(directive_texts.iter().any(|t| t.contains("@ts-nocheck")));
    }

    #[test]
    fn test_ambient_module_declarations() {
        let source = "declare module '@proj/ambient' { export const x: number; }";
        let result = scan(source, "ambient.d.ts").unwrap();
        assert_eq!(result.ambient_modules, vec!["@proj/ambient"]);
        assert_eq!(result.imports, vec![]);
    }

    #[test]
    fn test_scan_is_idempotent() {
        let source = r#"
            import {a} from '@proj/one';
            // nx-ignore-next-line
            import {b} from '@proj/two';
            const c = await import('@proj/three');
        "#;
        let first = scan(source, "repeat.ts").unwrap();
        let second = scan(source, "repeat.ts").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_spans_point_at_specifiers() {
        let source = "import {a} from '@proj/one';";
        let result = scan(source, "span.ts").unwrap();
        let import = &result.imports[0];
        assert_eq!(&source[import.span.clone()], "@proj/one");
        assert_eq!(import.line, 1);
    }
}
