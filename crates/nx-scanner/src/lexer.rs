use crate::{Directive, Import, ImportKind, ScanError, SourceScan};

/// Comment marker that drops imports on the following line.
pub const IGNORE_MARKER: &str = "nx-ignore-next-line";

/// What the previous significant token was. Only as much state as the
/// scanner needs: distinguishing member access and deciding whether a `/`
/// starts a regex literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Prev {
    /// Start of file or something value-neutral (operators, punctuation).
    Other,
    /// An expression just ended: identifier, literal, `)`, `]`, string.
    /// A `/` after one of these is division, not a regex.
    ValueLike,
    /// A `.`; the following identifier is a member access.
    Dot,
}

pub(crate) struct Lexer<'a> {
    source: &'a str,
    bytes: &'a [u8],
    file_path: &'a str,
    pos: usize,
    line: usize,
    prev: Prev,
    /// Brace depth per open template interpolation, innermost last.
    interpolations: Vec<u32>,
    /// Start line of the template each open interpolation belongs to.
    template_lines: Vec<usize>,
    /// Lines whose imports are suppressed by an ignore marker.
    ignored_lines: Vec<usize>,
    /// Set when the fast pass saw an ignore marker or `loadChildren`; the
    /// detail filtering below only runs in that case.
    needs_detail_pass: bool,
    result: SourceScan,
}

impl<'a> Lexer<'a> {
    pub(crate) fn new(source: &'a str, file_path: &'a str) -> Self {
        Self {
            source,
            bytes: source.as_bytes(),
            file_path,
            pos: 0,
            line: 1,
            prev: Prev::Other,
            interpolations: Vec::new(),
            template_lines: Vec::new(),
            ignored_lines: Vec::new(),
            needs_detail_pass: false,
            result: SourceScan::default(),
        }
    }

    pub(crate) fn scan(mut self) -> Result<SourceScan, ScanError> {
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                b'\n' => {
                    self.line += 1;
                    self.pos += 1;
                }
                c if c.is_ascii_whitespace() => self.pos += 1,
                b'/' => self.slash()?,
                b'\'' | b'"' => {
                    self.skip_string(self.bytes[self.pos]);
                    self.prev = Prev::ValueLike;
                }
                b'`' => {
                    self.pos += 1;
                    let start_line = self.line;
                    self.scan_template(start_line)?;
                }
                b'{' => {
                    if let Some(depth) = self.interpolations.last_mut() {
                        *depth += 1;
                    }
                    self.pos += 1;
                    self.prev = Prev::Other;
                }
                b'}' => {
                    self.pos += 1;
                    match self.interpolations.last_mut() {
                        Some(0) => {
                            self.interpolations.pop();
                            let start_line = self
                                .template_lines
                                .pop()
                                .expect("template line per interpolation");
                            self.scan_template(start_line)?;
                        }
                        Some(depth) => {
                            *depth -= 1;
                            self.prev = Prev::Other;
                        }
                        None => self.prev = Prev::Other,
                    }
                }
                b'.' => {
                    self.pos += 1;
                    self.prev = Prev::Dot;
                }
                b')' | b']' => {
                    self.pos += 1;
                    self.prev = Prev::ValueLike;
                }
                c if c.is_ascii_digit() => {
                    self.skip_number();
                    self.prev = Prev::ValueLike;
                }
                c if is_ident_start(c) => self.identifier()?,
                _ => {
                    self.pos += 1;
                    self.prev = Prev::Other;
                }
            }
        }

        if !self.interpolations.is_empty() {
            let line = self.template_lines[0];
            return Err(ScanError::UnterminatedTemplate {
                path: self.file_path.to_string(),
                line,
            });
        }

        // Detail pass, opt-in: only sources that contained an ignore marker
        // (or loadChildren routes, which were already resolved inline) pay
        // for the filtering.
        if self.needs_detail_pass && !self.ignored_lines.is_empty() {
            let ignored = std::mem::take(&mut self.ignored_lines);
            self.result
                .imports
                .retain(|import| !ignored.contains(&import.line));
        }

        Ok(self.result)
    }

    fn slash(&mut self) -> Result<(), ScanError> {
        match self.bytes.get(self.pos + 1) {
            Some(b'/') => self.line_comment(),
            Some(b'*') => self.block_comment()?,
            _ if self.prev != Prev::ValueLike => self.skip_regex(),
            _ => {
                self.pos += 1;
                self.prev = Prev::Other;
            }
        }
        Ok(())
    }

    fn line_comment(&mut self) {
        let start = self.pos;
        while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
            self.pos += 1;
        }
        let text = &self.source[start..self.pos];
        self.process_comment(text.trim_start_matches('/').trim(), text.starts_with("///"));
    }

    fn block_comment(&mut self) -> Result<(), ScanError> {
        let start = self.pos;
        self.pos += 2;
        loop {
            if self.pos + 1 >= self.bytes.len() {
                // Unterminated block comment swallows the rest of the file;
                // nothing after it can be an import, so just stop.
                self.pos = self.bytes.len();
                break;
            }
            if self.bytes[self.pos] == b'*' && self.bytes[self.pos + 1] == b'/' {
                self.pos += 2;
                break;
            }
            if self.bytes[self.pos] == b'\n' {
                self.line += 1;
            }
            self.pos += 1;
        }
        let text = &self.source[start..self.pos.min(self.bytes.len())];
        let inner = text
            .trim_start_matches("/*")
            .trim_end_matches("*/")
            .trim_matches(|c: char| c == '*' || c.is_whitespace());
        self.process_comment(inner, false);
        Ok(())
    }

    fn process_comment(&mut self, content: &str, triple_slash: bool) {
        if content.contains(IGNORE_MARKER) {
            self.needs_detail_pass = true;
            self.ignored_lines.push(self.next_content_line());
            return;
        }
        if triple_slash && content.starts_with('<') {
            if let Some(path) = extract_attribute(content, "path") {
                self.result.referenced_files.push(path);
            } else {
                self.result.directives.push(Directive {
                    text: content.to_string(),
                    line: self.line,
                });
            }
            return;
        }
        if content.starts_with('@') {
            self.result.directives.push(Directive {
                text: content.to_string(),
                line: self.line,
            });
        }
    }

    /// The line of the next non-whitespace character after the cursor. This
    /// is the line an ignore marker applies to, which lets the marker sit any
    /// amount of whitespace away from the import it suppresses.
    fn next_content_line(&self) -> usize {
        let mut line = self.line;
        let mut pos = self.pos;
        while pos < self.bytes.len() {
            match self.bytes[pos] {
                b'\n' => {
                    line += 1;
                    pos += 1;
                }
                c if c.is_ascii_whitespace() => pos += 1,
                _ => break,
            }
        }
        line
    }

    fn skip_string(&mut self, quote: u8) {
        self.pos += 1;
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                b'\\' => {
                    if self.bytes.get(self.pos + 1) == Some(&b'\n') {
                        self.line += 1;
                    }
                    self.pos += 2;
                }
                b'\n' => return, // unterminated; leave the newline for the main loop
                c if c == quote => {
                    self.pos += 1;
                    return;
                }
                _ => self.pos += 1,
            }
        }
    }

    fn skip_number(&mut self) {
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                c if c.is_ascii_alphanumeric() => self.pos += 1,
                b'_' | b'.' => self.pos += 1,
                _ => break,
            }
        }
    }

    fn skip_regex(&mut self) {
        self.pos += 1;
        let mut in_class = false;
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                b'\\' => self.pos += 2,
                b'[' => {
                    in_class = true;
                    self.pos += 1;
                }
                b']' => {
                    in_class = false;
                    self.pos += 1;
                }
                b'/' if !in_class => {
                    self.pos += 1;
                    // flags
                    while self.pos < self.bytes.len() && is_ident_part(self.bytes[self.pos]) {
                        self.pos += 1;
                    }
                    self.prev = Prev::ValueLike;
                    return;
                }
                b'\n' => break, // not actually a regex; bail
                _ => self.pos += 1,
            }
        }
        self.prev = Prev::Other;
    }

    /// Consumes template characters until the closing backtick or an `${`
    /// interpolation head, which switches back to code scanning.
    fn scan_template(&mut self, start_line: usize) -> Result<(), ScanError> {
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                b'\\' => {
                    if self.bytes.get(self.pos + 1) == Some(&b'\n') {
                        self.line += 1;
                    }
                    self.pos += 2;
                }
                b'`' => {
                    self.pos += 1;
                    self.prev = Prev::ValueLike;
                    return Ok(());
                }
                b'$' if self.bytes.get(self.pos + 1) == Some(&b'{') => {
                    self.pos += 2;
                    self.interpolations.push(0);
                    self.template_lines.push(start_line);
                    self.prev = Prev::Other;
                    return Ok(());
                }
                b'\n' => {
                    self.line += 1;
                    self.pos += 1;
                }
                _ => self.pos += 1,
            }
        }
        Err(ScanError::UnterminatedTemplate {
            path: self.file_path.to_string(),
            line: start_line,
        })
    }

    fn identifier(&mut self) -> Result<(), ScanError> {
        let start = self.pos;
        while self.pos < self.bytes.len() && is_ident_part(self.bytes[self.pos]) {
            self.pos += 1;
        }
        let ident = &self.source[start..self.pos];
        let was_member_access = self.prev == Prev::Dot;
        let line = self.line;

        if !was_member_access {
            match ident {
                "import" => {
                    self.import_statement(line)?;
                    return Ok(());
                }
                "export" => {
                    self.export_statement(line)?;
                    return Ok(());
                }
                "require" => {
                    self.require_call(line)?;
                    return Ok(());
                }
                "define" => {
                    self.amd_define(line)?;
                    return Ok(());
                }
                "declare" => {
                    self.declare_module()?;
                    return Ok(());
                }
                "loadChildren" => {
                    self.load_children(line)?;
                    return Ok(());
                }
                _ => {}
            }
        }

        self.prev = if REGEX_ALLOWING_KEYWORDS.contains(&ident) {
            Prev::Other
        } else {
            Prev::ValueLike
        };
        Ok(())
    }

    fn import_statement(&mut self, line: usize) -> Result<(), ScanError> {
        self.prev = Prev::Other;
        self.skip_trivia()?;
        match self.peek() {
            // import('M')
            Some(b'(') => {
                self.pos += 1;
                self.skip_trivia()?;
                if let Some((specifier, span)) = self.read_string_literal() {
                    self.push_import(specifier, ImportKind::Dynamic, span, line);
                }
                Ok(())
            }
            // import 'M'
            Some(b'\'') | Some(b'"') => {
                if let Some((specifier, span)) = self.read_string_literal() {
                    self.push_import(specifier, ImportKind::Static, span, line);
                }
                Ok(())
            }
            // import.meta
            Some(b'.') => Ok(()),
            _ => self.import_clause(line),
        }
    }

    /// Scans an import clause (`{a, b as c}`, `* as ns`, default bindings,
    /// optionally `type`-prefixed) up to `from 'M'` or `= require('M')`.
    fn import_clause(&mut self, line: usize) -> Result<(), ScanError> {
        let mut type_only = false;
        let mut depth: u32 = 0;
        let mut first_token = true;

        loop {
            self.skip_trivia()?;
            match self.peek() {
                None | Some(b';') => return Ok(()),
                Some(b'{') => {
                    depth += 1;
                    self.pos += 1;
                }
                Some(b'}') => {
                    if depth == 0 {
                        return Ok(());
                    }
                    depth -= 1;
                    self.pos += 1;
                }
                Some(b'\'') | Some(b'"') => {
                    // string-named binding inside braces; not a specifier
                    let quote = self.bytes[self.pos];
                    self.skip_string(quote);
                }
                Some(b'=') if depth == 0 => {
                    // import x = require('M')
                    self.pos += 1;
                    self.skip_trivia()?;
                    if self.read_ident() == Some("require") {
                        self.skip_trivia()?;
                        if self.peek() == Some(b'(') {
                            self.pos += 1;
                            self.skip_trivia()?;
                            if let Some((specifier, span)) = self.read_string_literal() {
                                self.push_import(specifier, ImportKind::Require, span, line);
                            }
                        }
                    }
                    return Ok(());
                }
                Some(c) if is_ident_start(c) => {
                    let ident_start = self.pos;
                    while self.pos < self.bytes.len() && is_ident_part(self.bytes[self.pos]) {
                        self.pos += 1;
                    }
                    let ident = &self.source[ident_start..self.pos];
                    if ident == "type" && first_token {
                        type_only = true;
                    } else if ident == "from" && depth == 0 {
                        self.skip_trivia()?;
                        if let Some((specifier, span)) = self.read_string_literal() {
                            let kind = if type_only {
                                ImportKind::TypeOnly
                            } else {
                                ImportKind::Static
                            };
                            self.push_import(specifier, kind, span, line);
                        }
                        return Ok(());
                    }
                }
                Some(_) => self.pos += 1,
            }
            first_token = false;
        }
    }

    fn export_statement(&mut self, line: usize) -> Result<(), ScanError> {
        self.prev = Prev::Other;
        self.skip_trivia()?;

        // `export type {..} from 'M'` re-exports types; same shape after the
        // keyword.
        if self.peek().map_or(false, is_ident_start) {
            let checkpoint = self.pos;
            if self.read_ident() == Some("type") {
                self.skip_trivia()?;
            } else {
                self.pos = checkpoint;
            }
        }

        match self.peek() {
            Some(b'*') => {
                self.pos += 1;
                self.skip_trivia()?;
                // optional `as NS`
                if self.peek().map_or(false, is_ident_start) {
                    let checkpoint = self.pos;
                    if self.read_ident() == Some("as") {
                        self.skip_trivia()?;
                        self.read_ident();
                        self.skip_trivia()?;
                    } else {
                        self.pos = checkpoint;
                    }
                }
                if self.read_ident() == Some("from") {
                    self.skip_trivia()?;
                    if let Some((specifier, span)) = self.read_string_literal() {
                        self.push_import(specifier, ImportKind::ReExport, span, line);
                    }
                }
                Ok(())
            }
            Some(b'{') => {
                self.pos += 1;
                let mut depth: u32 = 1;
                while depth > 0 {
                    self.skip_trivia()?;
                    match self.peek() {
                        None => return Ok(()),
                        Some(b'{') => {
                            depth += 1;
                            self.pos += 1;
                        }
                        Some(b'}') => {
                            depth -= 1;
                            self.pos += 1;
                        }
                        Some(b'\'') | Some(b'"') => {
                            let quote = self.bytes[self.pos];
                            self.skip_string(quote);
                        }
                        Some(_) => self.pos += 1,
                    }
                }
                self.skip_trivia()?;
                let checkpoint = self.pos;
                if self.read_ident() == Some("from") {
                    self.skip_trivia()?;
                    if let Some((specifier, span)) = self.read_string_literal() {
                        self.push_import(specifier, ImportKind::ReExport, span, line);
                    }
                } else {
                    self.pos = checkpoint;
                }
                Ok(())
            }
            // `export default …`, `export const …`: no specifier here. The
            // main loop picks the statement back up from the current cursor.
            _ => Ok(()),
        }
    }

    fn require_call(&mut self, line: usize) -> Result<(), ScanError> {
        self.prev = Prev::ValueLike;
        self.skip_trivia()?;
        if self.peek() == Some(b'(') {
            self.pos += 1;
            self.skip_trivia()?;
            if let Some((specifier, span)) = self.read_string_literal() {
                self.push_import(specifier, ImportKind::Require, span, line);
            }
        }
        Ok(())
    }

    fn amd_define(&mut self, line: usize) -> Result<(), ScanError> {
        self.prev = Prev::ValueLike;
        self.skip_trivia()?;
        if self.peek() != Some(b'(') {
            return Ok(());
        }
        self.pos += 1;
        self.skip_trivia()?;
        // optional module name
        if matches!(self.peek(), Some(b'\'') | Some(b'"')) {
            self.read_string_literal();
            self.skip_trivia()?;
            if self.peek() == Some(b',') {
                self.pos += 1;
                self.skip_trivia()?;
            }
        }
        if self.peek() != Some(b'[') {
            return Ok(());
        }
        self.pos += 1;
        loop {
            self.skip_trivia()?;
            match self.peek() {
                Some(b'\'') | Some(b'"') => {
                    if let Some((specifier, span)) = self.read_string_literal() {
                        self.push_import(specifier, ImportKind::Amd, span, line);
                    }
                }
                Some(b',') => self.pos += 1,
                Some(b']') => {
                    self.pos += 1;
                    return Ok(());
                }
                _ => return Ok(()),
            }
        }
    }

    fn declare_module(&mut self) -> Result<(), ScanError> {
        self.prev = Prev::ValueLike;
        self.skip_trivia()?;
        let checkpoint = self.pos;
        if self.read_ident() == Some("module") {
            self.skip_trivia()?;
            if let Some((name, _)) = self.read_string_literal() {
                self.result.ambient_modules.push(name);
            }
        } else {
            self.pos = checkpoint;
        }
        Ok(())
    }

    fn load_children(&mut self, line: usize) -> Result<(), ScanError> {
        self.prev = Prev::ValueLike;
        self.needs_detail_pass = true;
        self.skip_trivia()?;
        if self.peek() != Some(b':') {
            return Ok(());
        }
        self.pos += 1;
        self.skip_trivia()?;
        if let Some((value, span)) = self.read_string_literal() {
            // `module#ExportedRoutes`: the module part is the edge target.
            let specifier = value.split('#').next().unwrap_or(&value).to_string();
            let span = span.start..span.start + specifier.len();
            self.push_import(specifier, ImportKind::LoadChildren, span, line);
        }
        Ok(())
    }

    fn push_import(
        &mut self,
        specifier: String,
        kind: ImportKind,
        span: std::ops::Range<usize>,
        line: usize,
    ) {
        self.result.imports.push(Import {
            specifier,
            kind,
            span,
            line,
        });
    }

    /// Skips whitespace and comments. Comments found here still get marker
    /// and directive processing.
    fn skip_trivia(&mut self) -> Result<(), ScanError> {
        loop {
            match self.peek() {
                Some(b'\n') => {
                    self.line += 1;
                    self.pos += 1;
                }
                Some(c) if c.is_ascii_whitespace() => self.pos += 1,
                Some(b'/') if self.bytes.get(self.pos + 1) == Some(&b'/') => self.line_comment(),
                Some(b'/') if self.bytes.get(self.pos + 1) == Some(&b'*') => self.block_comment()?,
                _ => return Ok(()),
            }
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn read_ident(&mut self) -> Option<&'a str> {
        if !self.peek().map_or(false, is_ident_start) {
            return None;
        }
        let start = self.pos;
        while self.pos < self.bytes.len() && is_ident_part(self.bytes[self.pos]) {
            self.pos += 1;
        }
        Some(&self.source[start..self.pos])
    }

    /// Reads a `'…'` or `"…"` literal, returning its contents and the byte
    /// range of the contents.
    fn read_string_literal(&mut self) -> Option<(String, std::ops::Range<usize>)> {
        let quote = match self.peek() {
            Some(c @ (b'\'' | b'"')) => c,
            _ => return None,
        };
        self.pos += 1;
        let start = self.pos;
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                b'\\' => self.pos += 2,
                b'\n' => break,
                c if c == quote => {
                    let span = start..self.pos;
                    let value = self.source[span.clone()].to_string();
                    self.pos += 1;
                    self.prev = Prev::ValueLike;
                    return Some((value, span));
                }
                _ => self.pos += 1,
            }
        }
        None
    }
}

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_' || c == b'$'
}

fn is_ident_part(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'$'
}

fn extract_attribute(tag: &str, attribute: &str) -> Option<String> {
    let needle = format!("{attribute}=\"");
    let start = tag.find(&needle)? + needle.len();
    let end = tag[start..].find('"')? + start;
    Some(tag[start..end].to_string())
}

const REGEX_ALLOWING_KEYWORDS: &[&str] = &[
    "return",
    "typeof",
    "instanceof",
    "case",
    "in",
    "of",
    "new",
    "delete",
    "void",
    "do",
    "else",
    "yield",
    "await",
    "throw",
];
