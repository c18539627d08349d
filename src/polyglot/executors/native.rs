//! Compiled-Language Executor (C++, Rust, C#)
//!
//! A fragment is wrapped by [`crate::polyglot::codegen`], compiled once per
//! fingerprint into a platform dynamic library through the shared code
//! cache, then loaded with libloading and called through the C-ABI entry
//! point. Inputs and the result cross in the marshal wire format.
//!
//! The native call cannot be interrupted safely, so it runs on a watchdog
//! thread: the worker waits with a timeout and abandons the thread on
//! overrun (the library stays alive through its Arc until the stray call
//! finishes).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use libloading::Library;

use crate::value::Value;

use crate::polyglot::block::Language;
use crate::polyglot::cache::{Artifact, Fingerprint};
use crate::polyglot::codegen::{self, ENTRY_SYMBOL, FREE_SYMBOL};
use crate::polyglot::marshal::{check_outbound, decode_value, encode_bindings};
use crate::polyglot::types::{ExecError, ExecJob};

use super::process::{run_with_deadline, CommandSpec};
use super::{next_executor_id, PreparedCode};

type EntryFn = unsafe extern "C" fn(*const u8, usize, *mut *mut u8, *mut usize) -> i32;
type FreeFn = unsafe extern "C" fn(*mut u8);

/// Cap on compiler diagnostics carried into errors.
const MAX_DIAGNOSTICS: usize = 8 * 1024;

/// Reply-wait granularity for the watchdog thread.
const REPLY_POLL: Duration = Duration::from_millis(25);

pub struct NativeExecutor {
    id: u64,
    language: Language,
    libraries: HashMap<PathBuf, Arc<Library>>,
}

impl NativeExecutor {
    pub fn new(language: Language) -> Result<Self, ExecError> {
        if !language.is_compiled() {
            return Err(ExecError::Internal {
                message: format!("{} is not a compiled language", language),
            });
        }
        Ok(Self { id: next_executor_id(), language, libraries: HashMap::new() })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Compile-or-load through the shared cache. The fingerprint covers the
    /// binding header as well as the fragment, since the synthesized wrapper
    /// depends on both.
    pub fn prepare(
        &mut self,
        source: &str,
        bound: &[String],
        job: &ExecJob,
    ) -> Result<PreparedCode, ExecError> {
        let cache_source = decorate_source(source, bound);
        let fingerprint = Fingerprint::compute(self.language, &cache_source);
        let language = self.language;
        let out_path = job.cache.artifact_path(&fingerprint, language);
        let source_owned = source.to_string();
        let bound_owned = bound.to_vec();
        let job_inner = job.clone();

        let artifact = job.cache.get_or_build(
            fingerprint,
            language,
            &cache_source,
            job.deadline,
            move || {
                let started = Instant::now();
                let synth = codegen::synthesize(language, &source_owned, &bound_owned)?;
                let result = match language {
                    Language::Cpp => compile_cpp(&synth.code, &out_path, &job_inner),
                    Language::Rust => compile_rust(&synth.code, &out_path, &job_inner),
                    Language::CSharp => compile_csharp(&synth.code, &out_path, &job_inner),
                    _ => unreachable!("checked in NativeExecutor::new"),
                };
                let _ = job_inner.sandbox.audit().record(
                    "polyglot.compile",
                    serde_json::json!({
                        "language": language.as_str(),
                        "fingerprint": fingerprint.to_hex(),
                        "elapsed_ms": started.elapsed().as_millis() as u64,
                        "ok": result.is_ok(),
                    }),
                );
                result?;
                Ok(Artifact::Library {
                    path: out_path.clone(),
                    symbol: ENTRY_SYMBOL.to_string(),
                })
            },
        )?;
        Ok(PreparedCode::Native { artifact })
    }

    pub fn execute(
        &mut self,
        prepared: &PreparedCode,
        inputs: &[(String, Value)],
        job: &ExecJob,
    ) -> Result<Value, ExecError> {
        let PreparedCode::Native { artifact } = prepared else {
            return Err(ExecError::Internal {
                message: "native executor got foreign prepared code".to_string(),
            });
        };
        let Artifact::Library { path, symbol } = artifact else {
            return Err(ExecError::Internal {
                message: "native executor expects a library artifact".to_string(),
            });
        };
        for (_, value) in inputs {
            check_outbound(value, self.language)?;
        }
        let payload = encode_bindings(inputs)?;

        let language = self.language;
        let library = match self.libraries.get(path) {
            Some(library) => Arc::clone(library),
            None => {
                let library = unsafe { Library::new(path) }.map_err(|e| ExecError::Link {
                    language,
                    missing_symbols: vec![format!("{} ({})", path.display(), e)],
                })?;
                let library = Arc::new(library);
                self.libraries.insert(path.clone(), Arc::clone(&library));
                library
            }
        };

        // Watchdog thread: the only timeout mechanism available to an
        // uninterruptible native call.
        let started = Instant::now();
        let symbol = symbol.clone();
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        std::thread::Builder::new()
            .name(format!("medley-{}-call", language))
            .spawn(move || {
                let result = call_entry(&library, &symbol, &payload, language);
                let _ = reply_tx.send(result);
            })
            .map_err(|e| ExecError::Internal { message: format!("spawn watchdog: {}", e) })?;

        loop {
            match reply_rx.recv_timeout(REPLY_POLL.min(job.remaining().max(Duration::from_millis(1)))) {
                Ok(result) => return result,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if job.expired() {
                        return Err(job.timeout_error(language, started));
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(ExecError::Internal {
                        message: "native call thread terminated without reply".to_string(),
                    });
                }
            }
        }
    }

    pub fn shutdown(&mut self) {
        self.libraries.clear();
    }
}

fn call_entry(
    library: &Library,
    symbol: &str,
    payload: &[u8],
    language: Language,
) -> Result<Value, ExecError> {
    unsafe {
        let entry: libloading::Symbol<EntryFn> =
            library.get(symbol.as_bytes()).map_err(|_| ExecError::Link {
                language,
                missing_symbols: vec![symbol.to_string()],
            })?;
        let free: libloading::Symbol<FreeFn> =
            library.get(FREE_SYMBOL.as_bytes()).map_err(|_| ExecError::Link {
                language,
                missing_symbols: vec![FREE_SYMBOL.to_string()],
            })?;

        let mut out_ptr: *mut u8 = std::ptr::null_mut();
        let mut out_len: usize = 0;
        let status = entry(payload.as_ptr(), payload.len(), &mut out_ptr, &mut out_len);

        let out_bytes = if out_ptr.is_null() {
            Vec::new()
        } else {
            let bytes = std::slice::from_raw_parts(out_ptr, out_len).to_vec();
            free(out_ptr);
            bytes
        };

        match status {
            0 => {
                let (value, _) = decode_value(&out_bytes)?;
                Ok(value)
            }
            _ => Err(ExecError::Runtime {
                language,
                message: String::from_utf8_lossy(&out_bytes).into_owned(),
                foreign_trace: None,
            }),
        }
    }
}

/// The cache key covers the binding header: the synthesized wrapper differs
/// with the bound-variable list even for identical fragments.
fn decorate_source(source: &str, bound: &[String]) -> String {
    format!("[{}]\n{}", bound.join(", "), source)
}

// =============================================================================
// TOOLCHAINS
// =============================================================================

fn compile_cpp(code: &str, out_path: &Path, job: &ExecJob) -> Result<(), ExecError> {
    let dir = scratch_dir()?;
    let src = dir.path().join("block.cpp");
    write_source(&src, code)?;

    let compiler = std::env::var("CXX").unwrap_or_else(|_| "c++".to_string());
    let spec = CommandSpec::new(compiler)
        .arg("-shared")
        .arg("-fPIC")
        .arg("-O1")
        .arg("-std=c++17")
        .arg("-o")
        .arg(out_path.display().to_string())
        .arg(src.display().to_string());
    run_compiler(&spec, job, Language::Cpp)
}

fn compile_rust(code: &str, out_path: &Path, job: &ExecJob) -> Result<(), ExecError> {
    let dir = scratch_dir()?;
    let src = dir.path().join("block.rs");
    write_source(&src, code)?;

    let spec = CommandSpec::new("rustc")
        .arg("--crate-type")
        .arg("cdylib")
        .arg("--edition")
        .arg("2021")
        .arg("-O")
        .arg("-o")
        .arg(out_path.display().to_string())
        .arg(src.display().to_string());
    run_compiler(&spec, job, Language::Rust)
}

fn compile_csharp(code: &str, out_path: &Path, job: &ExecJob) -> Result<(), ExecError> {
    let dir = scratch_dir()?;
    write_source(&dir.path().join("Block.cs"), code)?;
    write_source(&dir.path().join("block.csproj"), codegen::csharp_project_file())?;
    let publish_dir = dir.path().join("publish");

    let spec = CommandSpec::new("dotnet")
        .arg("publish")
        .arg("-c")
        .arg("Release")
        .arg("--nologo")
        .arg("-o")
        .arg(publish_dir.display().to_string())
        .env_var("DOTNET_CLI_TELEMETRY_OPTOUT", "1");
    let mut spec = spec;
    spec.cwd = Some(dir.path().to_path_buf());
    run_compiler(&spec, job, Language::CSharp)?;

    // NativeAOT names the shared library after the assembly; take the one
    // dynamic library the publish directory contains.
    let built = std::fs::read_dir(&publish_dir)
        .ok()
        .and_then(|entries| {
            entries.flatten().map(|e| e.path()).find(|p| {
                p.extension().map(|ext| ext == std::env::consts::DLL_EXTENSION).unwrap_or(false)
            })
        })
        .ok_or_else(|| ExecError::Compile {
            language: Language::CSharp,
            diagnostics: "dotnet publish produced no native library".to_string(),
        })?;
    std::fs::copy(&built, out_path).map_err(|e| ExecError::Internal {
        message: format!("failed to place artifact: {}", e),
    })?;
    Ok(())
}

fn run_compiler(spec: &CommandSpec, job: &ExecJob, language: Language) -> Result<(), ExecError> {
    tracing::debug!(compiler = %spec.program, %language, "compiling polyglot block");
    let output = run_with_deadline(spec, job, language)?;
    if output.exit_code != 0 {
        let mut diagnostics = output.stderr;
        if diagnostics.is_empty() {
            diagnostics = output.stdout;
        }
        diagnostics.truncate(MAX_DIAGNOSTICS);
        return Err(ExecError::Compile { language, diagnostics });
    }
    Ok(())
}

fn scratch_dir() -> Result<tempfile::TempDir, ExecError> {
    tempfile::Builder::new()
        .prefix(&format!("medley-build-{:08x}-", rand::random::<u32>()))
        .tempdir()
        .map_err(|e| ExecError::Internal { message: format!("scratch dir: {}", e) })
}

fn write_source(path: &Path, code: &str) -> Result<(), ExecError> {
    std::fs::write(path, code).map_err(|e| ExecError::Internal {
        message: format!("write {}: {}", path.display(), e),
    })
}
