//! Failure Taxonomy
//!
//! The categorized failures surfaced to callers, with stack traces that span
//! language boundaries. Host frames precede foreign frames; polyglot frames
//! additionally carry the language and the bound-variable list at call time.

use std::fmt;

use thiserror::Error;

use crate::polyglot::block::Language;

/// The failure kinds surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    CompileError,
    LinkError,
    RuntimeError,
    Timeout,
    MarshallingError,
    SandboxViolation,
    ResourceLimit,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::CompileError => "CompileError",
            ErrorKind::LinkError => "LinkError",
            ErrorKind::RuntimeError => "RuntimeError",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::MarshallingError => "MarshallingError",
            ErrorKind::SandboxViolation => "SandboxViolation",
            ErrorKind::ResourceLimit => "ResourceLimit",
            ErrorKind::InternalError => "InternalError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One frame of a cross-language trace.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceFrame {
    /// File or block identifier
    pub source: String,
    pub line: usize,
    /// Function name for function frames
    pub name: Option<String>,
    /// Set on polyglot frames
    pub language: Option<Language>,
    /// Bound-variable list at call time, for polyglot frames
    pub bound_variables: Option<Vec<String>>,
}

impl TraceFrame {
    pub fn host(source: &str, line: usize, name: Option<&str>) -> Self {
        Self {
            source: source.to_string(),
            line,
            name: name.map(|n| n.to_string()),
            language: None,
            bound_variables: None,
        }
    }

    pub fn polyglot(source: &str, line: usize, language: Language, bound: &[String]) -> Self {
        Self {
            source: source.to_string(),
            line,
            name: None,
            language: Some(language),
            bound_variables: Some(bound.to_vec()),
        }
    }
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "  at {}:{}", self.source, self.line)?;
        if let Some(name) = &self.name {
            write!(f, " in {}", name)?;
        }
        if let Some(lang) = &self.language {
            write!(f, " [{}]", lang)?;
            if let Some(bound) = &self.bound_variables {
                write!(f, " bound: [{}]", bound.join(", "))?;
            }
        }
        Ok(())
    }
}

/// A categorized runtime failure.
///
/// Most failures are catchable by user-level `try/catch`; internal invariant
/// failures and the host's own resource-cap overruns are fatal and propagate
/// through every handler.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct RuntimeError {
    pub kind: ErrorKind,
    pub message: String,
    /// Host frames first, foreign frames after
    pub trace: Vec<TraceFrame>,
    /// Foreign-runtime trace text, when an executor surfaced one
    pub foreign_trace: Option<String>,
    /// The thrown value for user-level `throw expr`
    pub payload: Option<crate::value::Value>,
    /// Fatal errors are not catchable by user code
    pub fatal: bool,
}

impl RuntimeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            trace: Vec::new(),
            foreign_trace: None,
            payload: None,
            fatal: false,
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RuntimeError, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        let mut e = Self::new(ErrorKind::InternalError, message);
        e.fatal = true;
        e
    }

    pub fn division_by_zero() -> Self {
        Self::runtime("division by zero")
    }

    pub fn arithmetic_overflow(op: &str) -> Self {
        Self::runtime(format!("arithmetic overflow in '{}'", op))
    }

    pub fn undefined_variable(name: &str) -> Self {
        Self::runtime(format!("undefined variable '{}'", name))
    }

    pub fn undefined_key(key: &str) -> Self {
        Self::runtime(format!("dict has no key '{}'", key))
    }

    pub fn not_callable(type_name: &str) -> Self {
        Self::runtime(format!("value of type {} is not callable", type_name))
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::runtime(message)
    }

    /// Host call-depth overflow: a resource limit the host itself hit, fatal.
    pub fn call_depth_exceeded(max: usize) -> Self {
        let mut e = Self::new(ErrorKind::ResourceLimit, format!("call depth exceeds {}", max));
        e.fatal = true;
        e
    }

    pub fn with_frame(mut self, frame: TraceFrame) -> Self {
        self.trace.push(frame);
        self
    }

    /// Whether a user-level `try/catch` may observe this error.
    pub fn is_catchable(&self) -> bool {
        !self.fatal && self.kind != ErrorKind::InternalError
    }

    /// Multi-level trace: host frames, then the foreign trace if present.
    pub fn format_trace(&self) -> String {
        let mut out = format!("{}: {}", self.kind, self.message);
        for frame in &self.trace {
            out.push('\n');
            out.push_str(&frame.to_string());
        }
        if let Some(foreign) = &self.foreign_trace {
            out.push_str("\nforeign trace:\n");
            for line in foreign.lines() {
                out.push_str("  ");
                out.push_str(line);
                out.push('\n');
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(ErrorKind::SandboxViolation.as_str(), "SandboxViolation");
        assert_eq!(ErrorKind::MarshallingError.to_string(), "MarshallingError");
    }

    #[test]
    fn test_catchability() {
        assert!(RuntimeError::division_by_zero().is_catchable());
        assert!(!RuntimeError::internal("bad state").is_catchable());
        assert!(!RuntimeError::call_depth_exceeded(10).is_catchable());
    }

    #[test]
    fn test_format_trace_host_before_foreign() {
        let err = RuntimeError::runtime("boom")
            .with_frame(TraceFrame::host("main", 3, Some("f")))
            .with_frame(TraceFrame::polyglot(
                "<python block @ line 4>",
                4,
                Language::Python,
                &["x".to_string()],
            ));
        let text = err.format_trace();
        let host_pos = text.find("main:3").unwrap();
        let poly_pos = text.find("[python]").unwrap();
        assert!(host_pos < poly_pos);
        assert!(text.contains("bound: [x]"));
    }
}
