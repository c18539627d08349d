//! Interpreter Types
//!
//! Options, execution limits and the host output sink.

use std::collections::HashSet;

use lazy_static::lazy_static;

lazy_static! {
    /// Identifiers reserved by default. The set is configuration, not a
    /// keyword table: callers may replace it through
    /// [`InterpreterOptions::reserved_names`].
    pub static ref DEFAULT_RESERVED_NAMES: HashSet<&'static str> = {
        let mut s = HashSet::new();
        for name in ["let", "fn", "struct", "enum", "use", "if", "else", "while", "for",
                     "match", "try", "catch", "finally", "break", "continue", "return",
                     "throw", "true", "false", "null", "in", "block", "config"] {
            s.insert(name);
        }
        s
    };
}

/// Execution limits for the host interpreter.
#[derive(Debug, Clone)]
pub struct ExecutionLimits {
    /// Maximum host call-stack depth; exceeding it is fatal (not catchable).
    pub max_call_depth: usize,
    /// Maximum loop iterations per loop, guarding runaway host loops.
    pub max_loop_iterations: u64,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_call_depth: 10_000,
            max_loop_iterations: 100_000_000,
        }
    }
}

/// Options for creating an interpreter instance.
#[derive(Debug, Clone)]
pub struct InterpreterOptions {
    pub limits: ExecutionLimits,
    /// Reserved identifier set; declarations using one of these fail.
    pub reserved_names: HashSet<String>,
    /// When false, polyglot groups run sequentially on the host thread.
    pub parallel_polyglot: bool,
    /// Worker cap for the parallel scheduler; the pool uses
    /// `min(hardware_concurrency, max_workers)`.
    pub max_workers: usize,
}

impl Default for InterpreterOptions {
    fn default() -> Self {
        Self {
            limits: ExecutionLimits::default(),
            reserved_names: DEFAULT_RESERVED_NAMES.iter().map(|s| s.to_string()).collect(),
            parallel_polyglot: true,
            max_workers: 8,
        }
    }
}

/// Output sink for host-side natives (the print family).
#[derive(Debug, Default)]
pub struct HostOutput {
    stdout: String,
}

impl HostOutput {
    pub fn write(&mut self, s: &str) {
        self.stdout.push_str(s);
    }

    pub fn write_line(&mut self, s: &str) {
        self.stdout.push_str(s);
        self.stdout.push('\n');
    }

    /// Drain everything written so far.
    pub fn take(&mut self) -> String {
        std::mem::take(&mut self.stdout)
    }

    pub fn as_str(&self) -> &str {
        &self.stdout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_reserved_includes_config() {
        assert!(DEFAULT_RESERVED_NAMES.contains("config"));
        assert!(DEFAULT_RESERVED_NAMES.contains("let"));
    }

    #[test]
    fn test_reserved_names_are_configurable() {
        let mut opts = InterpreterOptions::default();
        opts.reserved_names.remove("config");
        assert!(!opts.reserved_names.contains("config"));
    }

    #[test]
    fn test_host_output_take() {
        let mut out = HostOutput::default();
        out.write_line("a");
        out.write("b");
        assert_eq!(out.take(), "a\nb");
        assert_eq!(out.as_str(), "");
    }
}
