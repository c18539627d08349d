//! Medley Runtime
//!
//! Main entry point for embedding the interpreter. Ties together the
//! sandbox stack, the audit log, the code cache, the block registry and the
//! interpreter itself. Nothing here is a process-wide singleton: two
//! runtimes with different sandbox configurations coexist in one process.

use std::path::PathBuf;
use std::sync::Arc;

use crate::ast::types::Program;
use crate::audit::AuditLog;
use crate::errors::RuntimeError;
use crate::interpreter::{Env, Interpreter, InterpreterOptions};
use crate::polyglot::cache::{CodeCache, DEFAULT_CAPACITY};
use crate::registry::{BlockRegistry, EmptyRegistry};
use crate::sandbox::{SandboxConfig, SandboxScope, SandboxStack};
use crate::value::Value;

/// Options for creating a runtime.
pub struct RuntimeOptions {
    /// Base sandbox configuration; defaults to Standard.
    pub sandbox: SandboxConfig,
    /// Audit log path; an ephemeral log when absent.
    pub audit_path: Option<PathBuf>,
    /// HMAC key for keyed audit integrity.
    pub audit_hmac_key: Option<Vec<u8>>,
    /// On-disk code cache directory; memory-only when absent.
    pub cache_dir: Option<PathBuf>,
    /// Block registry; empty when absent.
    pub registry: Option<Arc<dyn BlockRegistry>>,
    pub interpreter: InterpreterOptions,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            sandbox: SandboxConfig::standard(),
            audit_path: None,
            audit_hmac_key: None,
            cache_dir: None,
            registry: None,
            interpreter: InterpreterOptions::default(),
        }
    }
}

/// An embedded Medley interpreter with its polyglot substrate.
pub struct Runtime {
    interpreter: Interpreter,
    sandbox: Arc<SandboxStack>,
    audit: Arc<AuditLog>,
}

impl Runtime {
    pub fn new(options: RuntimeOptions) -> Result<Self, RuntimeError> {
        let audit = match (&options.audit_path, &options.audit_hmac_key) {
            (Some(path), Some(key)) => AuditLog::create_keyed(path, key),
            (Some(path), None) => AuditLog::create(path),
            (None, _) => AuditLog::ephemeral(),
        }
        .map_err(|e| RuntimeError::internal(format!("audit log: {}", e)))?;
        let audit = Arc::new(audit);

        let cache = match &options.cache_dir {
            Some(dir) => CodeCache::with_store(dir, DEFAULT_CAPACITY),
            None => CodeCache::new(DEFAULT_CAPACITY),
        }
        .map_err(|e| RuntimeError::internal(format!("code cache: {}", e)))?;

        let sandbox = Arc::new(SandboxStack::new(options.sandbox, Arc::clone(&audit)));
        let registry: Arc<dyn BlockRegistry> =
            options.registry.unwrap_or_else(|| Arc::new(EmptyRegistry));

        let interpreter = Interpreter::new(
            options.interpreter,
            Arc::clone(&sandbox),
            Arc::clone(&audit),
            Arc::new(cache),
            registry,
        );
        Ok(Self { interpreter, sandbox, audit })
    }

    /// A runtime with every default.
    pub fn standard() -> Result<Self, RuntimeError> {
        Self::new(RuntimeOptions::default())
    }

    /// Evaluate a program. Uncaught errors are recorded in the audit log and
    /// returned with their multi-level trace.
    pub fn eval(&mut self, program: &Program) -> Result<(), RuntimeError> {
        match self.interpreter.exec_program(program) {
            Ok(()) => Ok(()),
            Err(error) => {
                let _ = self.audit.record(
                    "error.uncaught",
                    serde_json::json!({
                        "kind": error.kind.as_str(),
                        "message": error.message,
                    }),
                );
                Err(error)
            }
        }
    }

    /// Everything `print` wrote since the last call.
    pub fn take_output(&mut self) -> String {
        self.interpreter.take_output()
    }

    /// Read a global binding, for embedders inspecting results.
    pub fn global(&self, name: &str) -> Option<Value> {
        self.interpreter.globals.get(name)
    }

    /// The global scope, for pre-binding host values.
    pub fn globals(&self) -> Env {
        self.interpreter.globals.clone()
    }

    /// Activate a sandbox configuration until the guard drops.
    pub fn push_sandbox(&self, config: SandboxConfig) -> SandboxScope {
        self.sandbox.push(config)
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn sandbox(&self) -> &Arc<SandboxStack> {
        &self.sandbox
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::types::{Expr, Span, Stmt};
    use crate::audit::ChainStatus;
    use crate::polyglot::block::{Language, PolyglotBlock};
    use crate::registry::InMemoryRegistry;
    use std::time::{Duration, Instant};

    fn block(language: Language, bound: &[&str], source: &str) -> PolyglotBlock {
        PolyglotBlock::new(
            language,
            bound.iter().map(|s| s.to_string()).collect(),
            source,
            Span::at_line(1),
        )
    }

    fn print_of(e: Expr) -> Stmt {
        Stmt::expr(Expr::call(Expr::ident("print"), vec![e]))
    }

    fn shell_runtime() -> Runtime {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
        let mut options = RuntimeOptions::default();
        options.sandbox = SandboxConfig::elevated().with_allowed_command("/bin/sh");
        Runtime::new(options).unwrap()
    }

    #[test]
    fn test_plain_program_prints() {
        let mut runtime = Runtime::standard().unwrap();
        let program = Program::new(vec![
            Stmt::let_("x", Expr::int(40)),
            print_of(Expr::binary(
                crate::ast::types::BinaryOp::Add,
                Expr::ident("x"),
                Expr::int(2),
            )),
        ]);
        runtime.eval(&program).unwrap();
        assert_eq!(runtime.take_output(), "42\n");
    }

    #[test]
    fn test_println_matches_print() {
        let mut runtime = Runtime::standard().unwrap();
        let program = Program::new(vec![
            Stmt::expr(Expr::call(Expr::ident("println"), vec![Expr::int(1)])),
            print_of(Expr::int(2)),
        ]);
        runtime.eval(&program).unwrap();
        assert_eq!(runtime.take_output(), "1\n2\n");
    }

    #[test]
    fn test_result_identical_with_and_without_scheduler() {
        // Invariant: a program without polyglot blocks evaluates identically
        // whether or not the parallel scheduler is enabled.
        let build = || {
            Program::new(vec![
                Stmt::let_("total", Expr::int(0)),
                Stmt::new(crate::ast::types::StmtKind::For {
                    var: "i".to_string(),
                    start: Expr::int(1),
                    end: Expr::int(5),
                    inclusive: true,
                    body: vec![Stmt::assign(
                        "total",
                        Expr::binary(
                            crate::ast::types::BinaryOp::Add,
                            Expr::ident("total"),
                            Expr::ident("i"),
                        ),
                    )],
                }),
                print_of(Expr::ident("total")),
            ])
        };
        let mut parallel = Runtime::standard().unwrap();
        parallel.eval(&build()).unwrap();

        let mut options = RuntimeOptions::default();
        options.interpreter.parallel_polyglot = false;
        let mut sequential = Runtime::new(options).unwrap();
        sequential.eval(&build()).unwrap();

        assert_eq!(parallel.take_output(), sequential.take_output());
        assert_eq!(parallel.global("total"), Some(Value::Int(15)));
    }

    #[test]
    fn test_independent_blocks_parallel_and_merge_in_order() {
        // Spec scenario: three independent blocks run in one group; output
        // order follows source order, and wall clock beats serial time.
        let mut runtime = shell_runtime();
        let program = Program::new(vec![
            Stmt::let_("a", Expr::polyglot(block(Language::Shell, &[], "sleep 0.3; echo 1"))),
            Stmt::let_("b", Expr::polyglot(block(Language::Shell, &[], "sleep 0.3; echo 2"))),
            Stmt::let_("c", Expr::polyglot(block(Language::Shell, &[], "sleep 0.3; echo 3"))),
            print_of(Expr::ident("a")),
            print_of(Expr::ident("b")),
            print_of(Expr::ident("c")),
        ]);
        let started = Instant::now();
        runtime.eval(&program).unwrap();
        let elapsed = started.elapsed();
        assert_eq!(runtime.take_output(), "1\n2\n3\n");
        // Three 0.3s blocks: parallel execution stays well under the 0.9s
        // serial floor.
        assert!(elapsed < Duration::from_millis(800), "took {:?}", elapsed);
    }

    #[test]
    fn test_raw_dependency_forces_ordering() {
        let mut runtime = shell_runtime();
        let program = Program::new(vec![
            Stmt::let_("data", Expr::polyglot(block(Language::Shell, &[], "echo 10 20 30"))),
            Stmt::let_(
                "s",
                Expr::polyglot(block(
                    Language::Shell,
                    &["data"],
                    "total=0; for n in $data; do total=$((total + n)); done; echo $total",
                )),
            ),
            print_of(Expr::ident("s")),
        ]);
        runtime.eval(&program).unwrap();
        assert_eq!(runtime.take_output(), "60\n");
    }

    #[test]
    fn test_group_failure_discards_results_and_surfaces_error() {
        let mut runtime = shell_runtime();
        let program = Program::new(vec![
            Stmt::let_("ok", Expr::polyglot(block(Language::Shell, &[], "echo fine"))),
            Stmt::let_("bad", Expr::polyglot(block(Language::Shell, &[], "exit 3"))),
        ]);
        let err = runtime.eval(&program).unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::RuntimeError);
        // The group failed before any merge: neither name is bound.
        assert_eq!(runtime.global("ok"), None);
        assert_eq!(runtime.global("bad"), None);
    }

    #[test]
    fn test_sandbox_denial_is_audited_once() {
        // Standard grants no SYS_EXEC, so a shell block is denied and the
        // audit log gains exactly one sandbox.deny record.
        let mut runtime = Runtime::standard().unwrap();
        let before = runtime.audit().record("marker", serde_json::json!({})).unwrap();
        let program = Program::new(vec![Stmt::let_(
            "x",
            Expr::polyglot(block(Language::Shell, &[], "echo hi > /etc/passwd")),
        )]);
        let err = runtime.eval(&program).unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::SandboxViolation);

        // marker, sandbox.deny, error.uncaught, marker.
        let after = runtime.audit().record("marker", serde_json::json!({})).unwrap();
        assert_eq!(after, before + 3);
        assert_eq!(runtime.audit().verify().unwrap(), ChainStatus::Intact);
    }

    #[test]
    fn test_sandbox_violation_is_catchable() {
        let mut runtime = Runtime::standard().unwrap();
        let program = Program::new(vec![Stmt::new(crate::ast::types::StmtKind::Try {
            body: vec![Stmt::let_(
                "x",
                Expr::polyglot(block(Language::Shell, &[], "echo hi")),
            )],
            catch: Some(crate::ast::types::CatchClause {
                name: "e".to_string(),
                body: vec![print_of(Expr::index(Expr::ident("e"), Expr::string("kind")))],
            }),
            finally: None,
        })]);
        runtime.eval(&program).unwrap();
        assert_eq!(runtime.take_output(), "SandboxViolation\n");
    }

    #[test]
    fn test_javascript_block_expression_position() {
        let mut runtime = Runtime::standard().unwrap();
        let program = Program::new(vec![
            Stmt::let_("n", Expr::int(6)),
            Stmt::let_("x", Expr::polyglot(block(Language::JavaScript, &["n"], "n * 7"))),
            print_of(Expr::ident("x")),
        ]);
        runtime.eval(&program).unwrap();
        assert_eq!(runtime.take_output(), "42\n");
    }

    #[test]
    fn test_javascript_copy_boundary() {
        // Mutation inside the foreign language must not leak back.
        let mut runtime = Runtime::standard().unwrap();
        let program = Program::new(vec![
            Stmt::let_("xs", Expr::new(crate::ast::types::ExprKind::Array(vec![Expr::int(1)]))),
            Stmt::let_(
                "ignored",
                Expr::polyglot(block(Language::JavaScript, &["xs"], "xs.push(2); xs.length")),
            ),
            print_of(Expr::call(Expr::ident("len"), vec![Expr::ident("xs")])),
        ]);
        runtime.eval(&program).unwrap();
        assert_eq!(runtime.take_output(), "1\n");
    }

    #[test]
    fn test_registry_block_via_use() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.insert(crate::registry::BlockRecord {
            id: "math/double".to_string(),
            language: Language::JavaScript,
            source: "n * 2".to_string(),
            params: vec!["n".to_string()],
            version_min: None,
            version_max: None,
            metadata: Default::default(),
        });
        let mut options = RuntimeOptions::default();
        options.registry = Some(registry);
        let mut runtime = Runtime::new(options).unwrap();

        let program = Program::new(vec![
            Stmt::new(crate::ast::types::StmtKind::UseBlock {
                alias: "double".to_string(),
                block_id: "math/double".to_string(),
            }),
            print_of(Expr::call(Expr::ident("double"), vec![Expr::int(21)])),
        ]);
        runtime.eval(&program).unwrap();
        assert_eq!(runtime.take_output(), "42\n");
    }

    #[test]
    fn test_unknown_registry_block_is_definite_absence() {
        let mut runtime = Runtime::standard().unwrap();
        let program = Program::new(vec![Stmt::new(crate::ast::types::StmtKind::UseBlock {
            alias: "missing".to_string(),
            block_id: "no/such/block".to_string(),
        })]);
        let err = runtime.eval(&program).unwrap_err();
        assert!(err.message.contains("not found in registry"));
    }

    #[test]
    fn test_uncaught_error_writes_audit_record() {
        let mut runtime = Runtime::standard().unwrap();
        let program = Program::new(vec![Stmt::expr(Expr::binary(
            crate::ast::types::BinaryOp::Div,
            Expr::int(1),
            Expr::int(0),
        ))]);
        runtime.eval(&program).unwrap_err();
        let content = std::fs::read_to_string(runtime.audit().path()).unwrap();
        assert!(content.contains("error.uncaught"));
        assert!(content.contains("division by zero"));
    }

    #[test]
    fn test_scoped_sandbox_override() {
        let runtime = Runtime::standard().unwrap();
        {
            let _scope = runtime.push_sandbox(
                SandboxConfig::elevated().with_allowed_command("/bin/sh"),
            );
            assert!(runtime
                .sandbox()
                .check(&crate::sandbox::AccessRequest::SysExec {
                    argv0: "/bin/sh".to_string()
                })
                .is_ok());
        }
        // Restored to Standard: exec denied again.
        assert!(runtime
            .sandbox()
            .check(&crate::sandbox::AccessRequest::SysExec { argv0: "/bin/sh".to_string() })
            .is_err());
    }

    #[test]
    #[ignore = "slow: embedded Python VM init"]
    fn test_python_blocks_parallel_scenario() {
        let mut runtime = Runtime::standard().unwrap();
        let program = Program::new(vec![
            Stmt::let_("a", Expr::polyglot(block(Language::Python, &[], "return 1"))),
            Stmt::let_("b", Expr::polyglot(block(Language::Python, &[], "return 2"))),
            Stmt::let_("c", Expr::polyglot(block(Language::Python, &[], "return 3"))),
            print_of(Expr::ident("a")),
            print_of(Expr::ident("b")),
            print_of(Expr::ident("c")),
        ]);
        runtime.eval(&program).unwrap();
        assert_eq!(runtime.take_output(), "1\n2\n3\n");
    }

    #[test]
    #[ignore = "slow: embedded Python VM init"]
    fn test_python_raw_dependency_scenario() {
        let mut runtime = Runtime::standard().unwrap();
        let program = Program::new(vec![
            Stmt::let_("data", Expr::polyglot(block(Language::Python, &[], "return [10,20,30]"))),
            Stmt::let_(
                "s",
                Expr::polyglot(block(Language::Python, &["data"], "return sum(data)")),
            ),
            print_of(Expr::ident("s")),
        ]);
        runtime.eval(&program).unwrap();
        assert_eq!(runtime.take_output(), "60\n");
    }

    #[test]
    #[ignore = "requires a C++ toolchain"]
    fn test_cpp_block_cache_hit() {
        let mut runtime = shell_runtime();
        let source = "return a.as_int() + b.as_int();";
        let make = || {
            Program::new(vec![
                Stmt::let_("a", Expr::int(40)),
                Stmt::let_("b", Expr::int(2)),
                Stmt::let_(
                    "x",
                    Expr::polyglot(block(Language::Cpp, &["a", "b"], source)),
                ),
                print_of(Expr::ident("x")),
            ])
        };
        let first = Instant::now();
        runtime.eval(&make()).unwrap();
        let cold = first.elapsed();
        assert_eq!(runtime.take_output(), "42\n");

        let second = Instant::now();
        runtime.eval(&make()).unwrap();
        let warm = second.elapsed();
        assert_eq!(runtime.take_output(), "42\n");
        // Warm path skips the compiler entirely.
        assert!(warm < cold / 2, "cold {:?}, warm {:?}", cold, warm);
    }
}
