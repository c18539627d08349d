//! Shell Executor
//!
//! The block source becomes a temp script run by `/bin/sh` under the process
//! sandbox. Bindings are exported as environment variables (scalars as text,
//! containers as JSON); the captured stdout, with its trailing newline
//! trimmed, is the block's string value.

use std::path::PathBuf;

use crate::sandbox::AccessRequest;
use crate::value::Value;

use crate::polyglot::block::Language;
use crate::polyglot::marshal::{as_scalar, check_outbound, value_to_json, Scalar};
use crate::polyglot::types::{ExecError, ExecJob};

use super::process::{run_with_deadline, CommandSpec};
use super::{next_executor_id, PreparedCode};

const SHELL_PROGRAM: &str = "/bin/sh";

pub struct ShellExecutor {
    id: u64,
    scratch: tempfile::TempDir,
}

impl ShellExecutor {
    pub fn new() -> Result<Self, ExecError> {
        let scratch = tempfile::Builder::new()
            .prefix("medley-shell-")
            .tempdir()
            .map_err(|e| ExecError::Internal { message: format!("scratch dir: {}", e) })?;
        Ok(Self { id: next_executor_id(), scratch })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn prepare(&mut self, source: &str) -> Result<PreparedCode, ExecError> {
        let script: PathBuf = self
            .scratch
            .path()
            .join(format!("block-{:08x}.sh", rand::random::<u32>()));
        let contents = format!("#!/bin/sh\n{}\n", source);
        std::fs::write(&script, contents).map_err(|e| ExecError::Internal {
            message: format!("write script: {}", e),
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o700));
        }
        Ok(PreparedCode::Shell { script })
    }

    pub fn execute(
        &mut self,
        prepared: &PreparedCode,
        inputs: &[(String, Value)],
        job: &ExecJob,
    ) -> Result<Value, ExecError> {
        let PreparedCode::Shell { script } = prepared else {
            return Err(ExecError::Internal {
                message: "shell executor got foreign prepared code".to_string(),
            });
        };
        job.sandbox.check(&AccessRequest::SysExec { argv0: SHELL_PROGRAM.to_string() })?;

        let mut spec = CommandSpec::new(SHELL_PROGRAM).arg(script.display().to_string());
        spec.memory_cap = job.sandbox.config().effective_memory();
        for (name, value) in inputs {
            check_outbound(value, Language::Shell)?;
            spec = spec.env_var(name.clone(), binding_text(value)?);
        }

        let output = run_with_deadline(&spec, job, Language::Shell)?;
        if output.exit_code != 0 {
            return Err(ExecError::Runtime {
                language: Language::Shell,
                message: format!("script exited with status {}", output.exit_code),
                foreign_trace: if output.stderr.is_empty() { None } else { Some(output.stderr) },
            });
        }
        let stdout = output.stdout.strip_suffix('\n').unwrap_or(&output.stdout);
        Ok(Value::string(stdout))
    }

    pub fn shutdown(&mut self) {
        // The scratch directory is removed when the executor drops.
    }
}

/// Environment-variable form of a binding: scalars as plain text, containers
/// as JSON.
fn binding_text(value: &Value) -> Result<String, ExecError> {
    if let Some(scalar) = as_scalar(value) {
        return Ok(match scalar {
            Scalar::Null => String::new(),
            Scalar::Bool(b) => b.to_string(),
            Scalar::Int(i) => i.to_string(),
            Scalar::Float(f) => f.to_string(),
            Scalar::Str(s) => s.to_string(),
        });
    }
    let json = value_to_json(value)?;
    serde_json::to_string(&json).map_err(|e| ExecError::Internal {
        message: format!("binding serialization: {}", e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::polyglot::cache::CodeCache;
    use crate::polyglot::types::CancelToken;
    use crate::sandbox::{SandboxConfig, SandboxStack};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn exec_job() -> ExecJob {
        let audit = Arc::new(AuditLog::ephemeral().unwrap());
        let config = SandboxConfig::elevated().with_allowed_command(SHELL_PROGRAM);
        let stack = Arc::new(SandboxStack::new(config, audit));
        ExecJob {
            deadline: Instant::now() + Duration::from_secs(10),
            cancel: CancelToken::new(),
            sandbox: stack.handle(),
            cache: Arc::new(CodeCache::new(8).unwrap()),
        }
    }

    fn run(source: &str, inputs: &[(String, Value)], job: &ExecJob) -> Result<Value, ExecError> {
        let mut executor = ShellExecutor::new().unwrap();
        let prepared = executor.prepare(source).unwrap();
        executor.execute(&prepared, inputs, job)
    }

    #[test]
    fn test_stdout_is_block_value() {
        let result = run("echo hello", &[], &exec_job()).unwrap();
        assert_eq!(result, Value::string("hello"));
    }

    #[test]
    fn test_bindings_exported_as_env() {
        let inputs = vec![
            ("who".to_string(), Value::string("medley")),
            ("n".to_string(), Value::Int(3)),
        ];
        let result = run("printf '%s:%s' \"$who\" \"$n\"", &inputs, &exec_job()).unwrap();
        assert_eq!(result, Value::string("medley:3"));
    }

    #[test]
    fn test_container_bindings_are_json() {
        let inputs = vec![(
            "xs".to_string(),
            Value::array(vec![Value::Int(1), Value::Int(2)]),
        )];
        let result = run("printf '%s' \"$xs\"", &inputs, &exec_job()).unwrap();
        assert_eq!(result, Value::string("[1,2]"));
    }

    #[test]
    fn test_nonzero_exit_is_runtime_error() {
        let err = run("echo oops >&2; exit 9", &[], &exec_job()).unwrap_err();
        match err {
            ExecError::Runtime { message, foreign_trace, .. } => {
                assert!(message.contains("9"));
                assert_eq!(foreign_trace.as_deref(), Some("oops\n"));
            }
            other => panic!("expected runtime error, got {:?}", other),
        }
    }

    #[test]
    fn test_exec_requires_whitelisted_shell() {
        let audit = Arc::new(AuditLog::ephemeral().unwrap());
        let stack = Arc::new(SandboxStack::new(SandboxConfig::standard(), audit));
        let job = ExecJob {
            deadline: Instant::now() + Duration::from_secs(5),
            cancel: CancelToken::new(),
            sandbox: stack.handle(),
            cache: Arc::new(CodeCache::new(8).unwrap()),
        };
        let err = run("echo hi", &[], &job).unwrap_err();
        assert!(matches!(err, ExecError::Sandbox(_)));
    }
}
