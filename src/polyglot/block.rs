//! Polyglot Block Form
//!
//! The syntactic form `<<lang[var1, var2, ...] source >>` captured by the
//! parser. The closing delimiter is only recognized at the start of a line,
//! so foreign source may freely contain `>>`.
//!
//! This module owns the captured representation (language tag, bound
//! variables, indent-stripped source, location) and the source
//! canonicalization shared with the code cache.

use std::fmt;

use crate::ast::types::Span;

/// The foreign languages a polyglot block may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    Cpp,
    Rust,
    CSharp,
    Shell,
}

impl Language {
    /// Parse a language tag as written in block headers and registry records.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "python" | "py" => Some(Language::Python),
            "javascript" | "js" => Some(Language::JavaScript),
            "cpp" | "c++" => Some(Language::Cpp),
            "rust" => Some(Language::Rust),
            "csharp" | "cs" => Some(Language::CSharp),
            "shell" | "sh" => Some(Language::Shell),
            _ => None,
        }
    }

    /// Canonical lowercase tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Cpp => "cpp",
            Language::Rust => "rust",
            Language::CSharp => "csharp",
            Language::Shell => "shell",
        }
    }

    /// True for languages evaluated by an embedded interpreter rather than a
    /// compiled artifact or subprocess.
    pub fn is_interpreted(&self) -> bool {
        matches!(self, Language::Python | Language::JavaScript)
    }

    /// True for languages compiled to a platform dynamic library.
    pub fn is_compiled(&self) -> bool {
        matches!(self, Language::Cpp | Language::Rust | Language::CSharp)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An inline foreign-language fragment embedded in a host program.
#[derive(Debug, Clone, PartialEq)]
pub struct PolyglotBlock {
    /// Language the source is written in.
    pub language: Language,
    /// Host variable names injected into the foreign scope, in header order.
    pub bound_variables: Vec<String>,
    /// Verbatim foreign source with common leading indentation stripped.
    pub source: String,
    /// Location of the block opener, for diagnostics.
    pub span: Span,
    /// Registry block id when the block was loaded through `use`.
    pub registry_id: Option<String>,
}

impl PolyglotBlock {
    pub fn new(language: Language, bound_variables: Vec<String>, source: &str, span: Span) -> Self {
        Self {
            language,
            bound_variables,
            source: strip_common_indent(source),
            span,
            registry_id: None,
        }
    }

    /// A short identifier for traces: `<python block @ line 7>`.
    pub fn describe(&self) -> String {
        match &self.registry_id {
            Some(id) => format!("<{} block '{}'>", self.language, id),
            None => format!("<{} block @ line {}>", self.language, self.span.start.line),
        }
    }
}

// =============================================================================
// SOURCE NORMALIZATION
// =============================================================================

/// Strip the common leading indentation shared by all non-blank lines.
///
/// Tabs and spaces are counted as single columns; mixed indentation is only
/// stripped up to the longest common prefix of whitespace characters.
pub fn strip_common_indent(source: &str) -> String {
    let lines: Vec<&str> = source.lines().collect();
    let mut prefix: Option<&str> = None;

    for line in &lines {
        if line.trim().is_empty() {
            continue;
        }
        let indent_len = line.len() - line.trim_start().len();
        let indent = &line[..indent_len];
        prefix = Some(match prefix {
            None => indent,
            Some(p) => common_prefix(p, indent),
        });
    }

    let prefix = prefix.unwrap_or("");
    let mut out = String::with_capacity(source.len());
    for (i, line) in lines.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        if line.trim().is_empty() {
            // Blank lines keep nothing.
        } else {
            out.push_str(line.strip_prefix(prefix).unwrap_or(line));
        }
    }
    out
}

fn common_prefix<'a>(a: &'a str, b: &str) -> &'a str {
    let mut len = 0;
    for (ca, cb) in a.chars().zip(b.chars()) {
        if ca != cb {
            break;
        }
        len += ca.len_utf8();
    }
    &a[..len]
}

/// Canonicalize foreign source for fingerprinting.
///
/// Strips common leading indentation, removes trailing whitespace per line,
/// and drops trailing blank lines. Two sources that differ only in those ways
/// share one cache key, and the normalization is idempotent.
pub fn canonical_source(source: &str) -> String {
    let stripped = strip_common_indent(source);
    let mut lines: Vec<String> = stripped.lines().map(|l| l.trim_end().to_string()).collect();
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}
