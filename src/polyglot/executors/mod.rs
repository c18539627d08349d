//! Per-Language Executors
//!
//! Every executor implements the same lifecycle:
//! - `prepare(source, bound, job)` — syntactic/semantic preparation without
//!   running user code; may return a cached artifact.
//! - `execute(prepared, inputs, job)` — runs to completion or to the job
//!   deadline.
//! - `shutdown()` — best-effort release of per-executor resources.
//!
//! The executor is a closed, six-variant enum rather than open polymorphism:
//! per-thread pooling stays concrete and match arms stay exhaustive. An
//! executor instance is confined to one thread for the duration of a single
//! `execute` call; the scheduler gives every worker its own instances.

pub mod javascript;
pub mod native;
pub mod process;
pub mod python;
pub mod shell;

use std::sync::atomic::{AtomicU64, Ordering};

use crate::value::Value;

use super::block::Language;
use super::cache::{Artifact, Fingerprint};
use super::types::{ExecError, ExecJob};

use javascript::JsExecutor;
use native::NativeExecutor;
use python::PythonExecutor;
use shell::ShellExecutor;

/// Unique instance ids; foreign handles are confined to the instance that
/// minted them.
static NEXT_EXECUTOR_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_executor_id() -> u64 {
    NEXT_EXECUTOR_ID.fetch_add(1, Ordering::Relaxed)
}

/// The output of `prepare`: everything `execute` needs beyond inputs.
#[derive(Debug, Clone)]
pub enum PreparedCode {
    /// Wrapped Python source; the compiled handle stays inside the executor,
    /// keyed by fingerprint.
    Python { fingerprint: Fingerprint, source: String },
    /// JavaScript source, wrapped for top-level `return`.
    JavaScript { source: String },
    /// A compiled dynamic library from the shared code cache.
    Native { artifact: Artifact },
    /// A shell script on disk.
    Shell { script: std::path::PathBuf },
}

/// The six concrete executors.
pub enum Executor {
    Python(PythonExecutor),
    JavaScript(JsExecutor),
    Cpp(NativeExecutor),
    Rust(NativeExecutor),
    CSharp(NativeExecutor),
    Shell(ShellExecutor),
}

impl Executor {
    pub fn create(language: Language) -> Result<Self, ExecError> {
        Ok(match language {
            Language::Python => Executor::Python(PythonExecutor::new()),
            Language::JavaScript => Executor::JavaScript(JsExecutor::new()?),
            Language::Cpp => Executor::Cpp(NativeExecutor::new(Language::Cpp)?),
            Language::Rust => Executor::Rust(NativeExecutor::new(Language::Rust)?),
            Language::CSharp => Executor::CSharp(NativeExecutor::new(Language::CSharp)?),
            Language::Shell => Executor::Shell(ShellExecutor::new()?),
        })
    }

    pub fn language(&self) -> Language {
        match self {
            Executor::Python(_) => Language::Python,
            Executor::JavaScript(_) => Language::JavaScript,
            Executor::Cpp(_) => Language::Cpp,
            Executor::Rust(_) => Language::Rust,
            Executor::CSharp(_) => Language::CSharp,
            Executor::Shell(_) => Language::Shell,
        }
    }

    /// Prepare `source` for execution without running user code.
    pub fn prepare(
        &mut self,
        source: &str,
        bound: &[String],
        job: &ExecJob,
    ) -> Result<PreparedCode, ExecError> {
        match self {
            Executor::Python(e) => e.prepare(source),
            Executor::JavaScript(e) => e.prepare(source),
            Executor::Cpp(e) | Executor::Rust(e) | Executor::CSharp(e) => {
                e.prepare(source, bound, job)
            }
            Executor::Shell(e) => e.prepare(source),
        }
    }

    /// Run prepared code with `inputs` bound into the foreign scope.
    pub fn execute(
        &mut self,
        prepared: &PreparedCode,
        inputs: &[(String, Value)],
        job: &ExecJob,
    ) -> Result<Value, ExecError> {
        match self {
            Executor::Python(e) => e.execute(prepared, inputs, job),
            Executor::JavaScript(e) => e.execute(prepared, inputs, job),
            Executor::Cpp(e) | Executor::Rust(e) | Executor::CSharp(e) => {
                e.execute(prepared, inputs, job)
            }
            Executor::Shell(e) => e.execute(prepared, inputs, job),
        }
    }

    /// Best-effort resource release.
    pub fn shutdown(&mut self) {
        match self {
            Executor::Python(e) => e.shutdown(),
            Executor::JavaScript(e) => e.shutdown(),
            Executor::Cpp(e) | Executor::Rust(e) | Executor::CSharp(e) => e.shutdown(),
            Executor::Shell(e) => e.shutdown(),
        }
    }
}

/// One executor instance per language, created lazily. Each scheduler worker
/// owns one set; the interpreter owns another for inline execution.
#[derive(Default)]
pub struct ExecutorSet {
    python: Option<Executor>,
    javascript: Option<Executor>,
    cpp: Option<Executor>,
    rust: Option<Executor>,
    csharp: Option<Executor>,
    shell: Option<Executor>,
}

impl ExecutorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, language: Language) -> Result<&mut Executor, ExecError> {
        let slot = match language {
            Language::Python => &mut self.python,
            Language::JavaScript => &mut self.javascript,
            Language::Cpp => &mut self.cpp,
            Language::Rust => &mut self.rust,
            Language::CSharp => &mut self.csharp,
            Language::Shell => &mut self.shell,
        };
        if slot.is_none() {
            *slot = Some(Executor::create(language)?);
        }
        Ok(slot.as_mut().expect("slot just filled"))
    }

    pub fn shutdown_all(&mut self) {
        for slot in [
            &mut self.python,
            &mut self.javascript,
            &mut self.cpp,
            &mut self.rust,
            &mut self.csharp,
            &mut self.shell,
        ] {
            if let Some(executor) = slot {
                executor.shutdown();
            }
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_ids_unique() {
        let a = next_executor_id();
        let b = next_executor_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_set_reuses_instances() {
        let mut set = ExecutorSet::new();
        let first = set.get_or_create(Language::Shell).unwrap().language();
        assert_eq!(first, Language::Shell);
        // Second call must not replace the instance (pointer equality via id).
        let id_a = match set.get_or_create(Language::Shell).unwrap() {
            Executor::Shell(e) => e.id(),
            _ => unreachable!(),
        };
        let id_b = match set.get_or_create(Language::Shell).unwrap() {
            Executor::Shell(e) => e.id(),
            _ => unreachable!(),
        };
        assert_eq!(id_a, id_b);
    }
}
