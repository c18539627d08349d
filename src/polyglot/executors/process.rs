//! Deadline-Bounded Subprocess Execution
//!
//! Shared by the shell executor and the compiled-language toolchains. Every
//! spawned process runs against the job's deadline and cancellation token:
//! on overrun it receives SIGTERM, then SIGKILL after a short grace window.
//! On Unix the sandbox's memory cap is applied with setrlimit before exec.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;

use crate::sandbox::types::MAX_CAPTURED_OUTPUT;

use crate::polyglot::block::Language;
use crate::polyglot::types::{ExecError, ExecJob};

/// Poll interval for deadline/cancellation checks while a child runs.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Grace between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_millis(200);

/// One subprocess invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment entries on top of the inherited environment
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    /// Address-space cap applied with setrlimit on Unix
    pub memory_cap: Option<u64>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into(), ..Default::default() }
    }

    pub fn arg(mut self, a: impl Into<String>) -> Self {
        self.args.push(a.into());
        self
    }

    pub fn env_var(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.env.push((k.into(), v.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Run `spec` to completion or to the job deadline.
///
/// Timeouts and cancellation kill the process group leader and surface as
/// [`ExecError::Timeout`] for `language`.
pub fn run_with_deadline(
    spec: &CommandSpec,
    job: &ExecJob,
    language: Language,
) -> Result<ProcessOutput, ExecError> {
    let started = Instant::now();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| ExecError::Internal { message: format!("tokio runtime: {}", e) })?;
    runtime.block_on(run_async(spec, job, language, started))
}

async fn run_async(
    spec: &CommandSpec,
    job: &ExecJob,
    language: Language,
    started: Instant,
) -> Result<ProcessOutput, ExecError> {
    let mut command = tokio::process::Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (k, v) in &spec.env {
        command.env(k, v);
    }
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }

    #[cfg(unix)]
    if let Some(cap) = spec.memory_cap {
        unsafe {
            command.pre_exec(move || {
                let limit = libc::rlimit {
                    rlim_cur: cap as libc::rlim_t,
                    rlim_max: cap as libc::rlim_t,
                };
                libc::setrlimit(libc::RLIMIT_AS, &limit);
                Ok(())
            });
        }
    }

    let mut child = command.spawn().map_err(|e| ExecError::Runtime {
        language,
        message: format!("failed to spawn {}: {}", spec.program, e),
        foreign_trace: None,
    })?;
    let pid = child.id();

    // Drain pipes concurrently with the wait so a chatty child cannot fill
    // the pipe buffer and deadlock.
    let mut stdout_pipe = child.stdout.take().expect("stdout piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr piped");
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = (&mut stdout_pipe).take(MAX_CAPTURED_OUTPUT as u64).read_to_end(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = (&mut stderr_pipe).take(MAX_CAPTURED_OUTPUT as u64).read_to_end(&mut buf).await;
        buf
    });

    let mut termed_at: Option<Instant> = None;
    let mut timed_out = false;
    let status = loop {
        tokio::select! {
            status = child.wait() => {
                break status.map_err(|e| ExecError::Internal {
                    message: format!("wait failed: {}", e),
                })?;
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {
                if job.expired() {
                    timed_out = true;
                    match termed_at {
                        None => {
                            signal_term(pid);
                            termed_at = Some(Instant::now());
                        }
                        Some(t) if t.elapsed() > TERM_GRACE => {
                            let _ = child.start_kill();
                        }
                        Some(_) => {}
                    }
                }
            }
        }
    };

    let stdout_bytes = stdout_task.await.unwrap_or_default();
    let stderr_bytes = stderr_task.await.unwrap_or_default();

    if timed_out {
        return Err(job.timeout_error(language, started));
    }

    Ok(ProcessOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&stdout_bytes).into_owned(),
        stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
    })
}

#[cfg(unix)]
fn signal_term(pid: Option<u32>) {
    if let Some(pid) = pid {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn signal_term(_pid: Option<u32>) {}
