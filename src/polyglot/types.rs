//! Polyglot Substrate Types
//!
//! Error categories shared by all executors, the cancellation token, and the
//! per-execution job context (deadline + sandbox snapshot + cache handle).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::errors::{ErrorKind, RuntimeError};
use crate::sandbox::{SandboxHandle, SandboxViolation};

use super::block::Language;
use super::cache::CodeCache;

/// Which way a value was crossing when marshalling failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarshalDirection {
    HostToForeign,
    ForeignToHost,
}

impl std::fmt::Display for MarshalDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarshalDirection::HostToForeign => f.write_str("host→foreign"),
            MarshalDirection::ForeignToHost => f.write_str("foreign→host"),
        }
    }
}

/// Categorized executor failures.
#[derive(Debug, Clone, Error)]
pub enum ExecError {
    #[error("{language} compile error: {diagnostics}")]
    Compile { language: Language, diagnostics: String },

    #[error("{language} link error, missing symbols: {missing_symbols:?}")]
    Link { language: Language, missing_symbols: Vec<String> },

    #[error("{language} runtime error: {message}")]
    Runtime {
        language: Language,
        message: String,
        foreign_trace: Option<String>,
    },

    #[error("{language} execution exceeded deadline after {elapsed:?}")]
    Timeout { language: Language, elapsed: Duration },

    #[error("cannot marshal {type_description} ({direction})")]
    Marshalling {
        direction: MarshalDirection,
        type_description: String,
    },

    #[error(transparent)]
    Sandbox(#[from] SandboxViolation),

    #[error("resource limit: {message}")]
    Resource { message: String },

    #[error("internal executor error: {message}")]
    Internal { message: String },
}

impl ExecError {
    pub fn unmarshallable(direction: MarshalDirection, description: impl Into<String>) -> Self {
        ExecError::Marshalling {
            direction,
            type_description: description.into(),
        }
    }

    /// Lift into the caller-facing taxonomy, preserving foreign traces.
    pub fn into_runtime_error(self) -> RuntimeError {
        match self {
            ExecError::Compile { language, diagnostics } => RuntimeError::new(
                ErrorKind::CompileError,
                format!("{} block failed to compile: {}", language, diagnostics),
            ),
            ExecError::Link { language, missing_symbols } => RuntimeError::new(
                ErrorKind::LinkError,
                format!("{} block missing symbols: {}", language, missing_symbols.join(", ")),
            ),
            ExecError::Runtime { language, message, foreign_trace } => {
                let mut e = RuntimeError::new(
                    ErrorKind::RuntimeError,
                    format!("{} block raised: {}", language, message),
                );
                e.foreign_trace = foreign_trace;
                e
            }
            ExecError::Timeout { language, elapsed } => RuntimeError::new(
                ErrorKind::Timeout,
                format!("{} block timed out after {:.3}s", language, elapsed.as_secs_f64()),
            ),
            ExecError::Marshalling { direction, type_description } => RuntimeError::new(
                ErrorKind::MarshallingError,
                format!("cannot marshal {} ({})", type_description, direction),
            ),
            ExecError::Sandbox(v) => RuntimeError::new(ErrorKind::SandboxViolation, v.to_string()),
            ExecError::Resource { message } => RuntimeError::new(ErrorKind::ResourceLimit, message),
            ExecError::Internal { message } => RuntimeError::internal(message),
        }
    }
}

/// Cooperative cancellation shared by a dependency group.
///
/// When one block fails, the scheduler cancels the rest: their effective
/// deadline advances to now and they stop at the next interrupt point.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything one `execute` call needs beyond its inputs.
#[derive(Clone)]
pub struct ExecJob {
    pub deadline: Instant,
    pub cancel: CancelToken,
    pub sandbox: SandboxHandle,
    pub cache: Arc<CodeCache>,
}

impl ExecJob {
    /// Time left before the effective deadline; zero once cancelled.
    pub fn remaining(&self) -> Duration {
        if self.cancel.is_cancelled() {
            return Duration::ZERO;
        }
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        self.remaining() == Duration::ZERO
    }

    pub fn timeout_error(&self, language: Language, started: Instant) -> ExecError {
        ExecError::Timeout { language, elapsed: started.elapsed() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_exec_error_kind_mapping() {
        let e = ExecError::Compile {
            language: Language::Cpp,
            diagnostics: "x".to_string(),
        }
        .into_runtime_error();
        assert_eq!(e.kind, ErrorKind::CompileError);

        let e = ExecError::Timeout {
            language: Language::Python,
            elapsed: Duration::from_secs(1),
        }
        .into_runtime_error();
        assert_eq!(e.kind, ErrorKind::Timeout);

        let e = ExecError::Internal { message: "bad".to_string() }.into_runtime_error();
        assert!(!e.is_catchable());
    }
}
