//! Interpreter — AST Execution Engine
//!
//! A tree walker over the typed AST. Host evaluation is single-threaded;
//! the only parallelism lives in the polyglot scheduler, which this module
//! drives per statement window. Delegates to specialized modules:
//! - Expression evaluation (expressions.rs)
//! - Control flow (control_flow.rs)
//! - Function calls (functions.rs)

use std::collections::HashMap;
use std::sync::Arc;

use crate::ast::types::{AssignTarget, Program, Span, Stmt, StmtKind};
use crate::audit::AuditLog;
use crate::errors::{ErrorKind, RuntimeError, TraceFrame};
use crate::polyglot::analyzer::{analyze, BlockBinding, DependencyBlock, ScheduleUnit};
use crate::polyglot::block::PolyglotBlock;
use crate::polyglot::cache::CodeCache;
use crate::polyglot::executors::ExecutorSet;
use crate::polyglot::scheduler::{GroupItem, Scheduler};
use crate::polyglot::types::{CancelToken, ExecJob};
use crate::registry::BlockRegistry;
use crate::sandbox::types::MAX_BLOCK_SOURCE;
use crate::sandbox::{AccessRequest, SandboxStack};
use crate::value::{deep_copy, FunctionValue, NativeFunction, StructType, Value};

use super::environment::Env;
use super::errors::{EvalResult, Interrupt};
use super::types::{HostOutput, InterpreterOptions};

/// The tree-walking evaluator.
pub struct Interpreter {
    pub(crate) options: InterpreterOptions,
    pub(crate) sandbox: Arc<SandboxStack>,
    pub(crate) audit: Arc<AuditLog>,
    pub(crate) cache: Arc<CodeCache>,
    pub(crate) registry: Arc<dyn BlockRegistry>,
    pub(crate) scheduler: Scheduler,
    pub(crate) globals: Env,
    pub(crate) output: HostOutput,
    pub(crate) struct_types: HashMap<String, Arc<StructType>>,
    pub(crate) enums: HashMap<String, Vec<String>>,
    /// Executor instances for inline (non-parallel) polyglot execution
    pub(crate) executors: ExecutorSet,
    pub(crate) call_depth: usize,
}

impl Interpreter {
    pub fn new(
        options: InterpreterOptions,
        sandbox: Arc<SandboxStack>,
        audit: Arc<AuditLog>,
        cache: Arc<CodeCache>,
        registry: Arc<dyn BlockRegistry>,
    ) -> Self {
        let scheduler = Scheduler::new(options.max_workers);
        let globals = Env::root();
        register_natives(&globals);
        Self {
            options,
            sandbox,
            audit,
            cache,
            registry,
            scheduler,
            globals,
            output: HostOutput::default(),
            struct_types: HashMap::new(),
            enums: HashMap::new(),
            executors: ExecutorSet::new(),
            call_depth: 0,
        }
    }

    /// Execute a whole program against the global scope.
    pub fn exec_program(&mut self, program: &Program) -> Result<(), RuntimeError> {
        let globals = self.globals.clone();
        self.exec_sequence(&program.statements, &globals)
            .map_err(|interrupt| interrupt.into_error("program"))
    }

    /// Drain everything the program printed.
    pub fn take_output(&mut self) -> String {
        self.output.take()
    }

    // =========================================================================
    // STATEMENT SEQUENCES
    // =========================================================================

    /// Execute a statement window, overlapping independent polyglot
    /// statements when the parallel scheduler is enabled.
    pub(crate) fn exec_sequence(&mut self, stmts: &[Stmt], env: &Env) -> EvalResult<()> {
        let has_polyglot_stmt = stmts.iter().any(is_polyglot_statement);
        if !self.options.parallel_polyglot || !has_polyglot_stmt {
            for stmt in stmts {
                self.exec_stmt(stmt, env)?;
            }
            return Ok(());
        }

        for unit in analyze(stmts) {
            match unit {
                ScheduleUnit::Barrier(index) => self.exec_stmt(&stmts[index], env)?,
                ScheduleUnit::Group(blocks) if blocks.len() == 1 => {
                    // Single-block groups bypass the snapshot/pool path.
                    let block = &blocks[0];
                    let value = self.eval_polyglot(&block.block, env)?;
                    self.merge_block_result(block, value, env)?;
                }
                ScheduleUnit::Group(blocks) => self.exec_group(blocks, env)?,
            }
        }
        Ok(())
    }

    /// Snapshot, dispatch, collect and merge one parallel group.
    fn exec_group(&mut self, blocks: Vec<DependencyBlock>, env: &Env) -> EvalResult<()> {
        let mut items = Vec::with_capacity(blocks.len());
        for block in &blocks {
            self.check_block_caps(&block.block)?;
            let mut inputs = Vec::with_capacity(block.read_set().len());
            for name in block.read_set() {
                let value = env
                    .get(name)
                    .ok_or_else(|| RuntimeError::undefined_variable(name))?;
                let snapshot = deep_copy(&value).map_err(|e| {
                    RuntimeError::new(
                        ErrorKind::MarshallingError,
                        format!("cannot snapshot '{}': {}", name, e),
                    )
                })?;
                inputs.push((name.clone(), snapshot));
            }
            items.push(GroupItem {
                index: block.index,
                language: block.block.language,
                source: block.block.source.clone(),
                bound: block.block.bound_variables.clone(),
                inputs,
            });
        }

        let results =
            self.scheduler
                .execute_group(items, self.sandbox.handle(), Arc::clone(&self.cache));

        // Any failure fails the whole group with the lowest-index error.
        let mut by_index: HashMap<usize, Value> = HashMap::new();
        for (index, result) in results {
            match result {
                Ok(value) => {
                    by_index.insert(index, value);
                }
                Err(e) => {
                    let block = blocks
                        .iter()
                        .find(|b| b.index == index)
                        .expect("result index matches a block");
                    return Err(polyglot_error(e, &block.block));
                }
            }
        }
        for block in &blocks {
            if !by_index.contains_key(&block.index) {
                return Err(Interrupt::Error(RuntimeError::new(
                    ErrorKind::Timeout,
                    format!("{} produced no result before the deadline", block.block.describe()),
                )));
            }
        }

        // Merge successful writes sequentially, in source order. This is the
        // only place a parallel result mutates the host environment.
        for block in &blocks {
            let value = by_index.remove(&block.index).expect("checked above");
            self.merge_block_result(block, value, env)?;
        }
        Ok(())
    }

    fn merge_block_result(
        &mut self,
        block: &DependencyBlock,
        value: Value,
        env: &Env,
    ) -> EvalResult<()> {
        match &block.binding {
            BlockBinding::Declare(name) => {
                self.check_reserved(name)?;
                env.declare(name, value);
            }
            BlockBinding::Assign(name) => {
                if !env.assign(name, value) {
                    return Err(RuntimeError::undefined_variable(name).into());
                }
            }
            BlockBinding::Discard => {}
        }
        Ok(())
    }

    // =========================================================================
    // STATEMENTS
    // =========================================================================

    pub(crate) fn exec_stmt(&mut self, stmt: &Stmt, env: &Env) -> EvalResult<()> {
        match &stmt.kind {
            StmtKind::Let { name, value } => {
                self.check_reserved(name)?;
                let value = self.eval_expr(value, env)?;
                env.declare(name, value);
                Ok(())
            }
            StmtKind::Assign { target, value } => {
                let value = self.eval_expr(value, env)?;
                self.assign_target(target, value, env)
            }
            StmtKind::FunctionDef(decl) => {
                self.check_reserved(&decl.name)?;
                let function = Value::Function(Arc::new(FunctionValue {
                    name: Some(decl.name.clone()),
                    params: decl.params.clone(),
                    body: decl.body.clone(),
                    env: env.clone(),
                    block_id: None,
                }));
                env.declare(&decl.name, function);
                Ok(())
            }
            StmtKind::StructDef { name, fields } => {
                self.check_reserved(name)?;
                let field_refs: Vec<&str> = fields.iter().map(|f| f.as_str()).collect();
                self.struct_types.insert(name.clone(), StructType::new(name, &field_refs));
                Ok(())
            }
            StmtKind::EnumDef { name, variants } => {
                self.check_reserved(name)?;
                self.enums.insert(name.clone(), variants.clone());
                Ok(())
            }
            StmtKind::UseBlock { alias, block_id } => self.exec_use_block(alias, block_id, stmt.span, env),
            StmtKind::If { .. }
            | StmtKind::While { .. }
            | StmtKind::For { .. }
            | StmtKind::Match { .. }
            | StmtKind::Try { .. }
            | StmtKind::Block(_) => self.exec_control_flow(stmt, env),
            StmtKind::Break => Err(Interrupt::Break),
            StmtKind::Continue => Err(Interrupt::Continue),
            StmtKind::Return(expr) => {
                let value = match expr {
                    Some(e) => self.eval_expr(e, env)?,
                    None => Value::Null,
                };
                Err(Interrupt::Return(value))
            }
            StmtKind::Throw(expr) => {
                let payload = self.eval_expr(expr, env)?;
                let mut error = RuntimeError::runtime(payload.to_string());
                error.payload = Some(payload);
                Err(error.into())
            }
            StmtKind::Expr(expr) => {
                self.eval_expr(expr, env)?;
                Ok(())
            }
        }
    }

    fn assign_target(&mut self, target: &AssignTarget, value: Value, env: &Env) -> EvalResult<()> {
        match target {
            AssignTarget::Name(name) => {
                if !env.assign(name, value) {
                    return Err(RuntimeError::undefined_variable(name).into());
                }
                Ok(())
            }
            AssignTarget::Index { target, index } => {
                let container = self.eval_expr(target, env)?;
                let index = self.eval_expr(index, env)?;
                match (&container, &index) {
                    (Value::Array(items), Value::Int(i)) => {
                        let mut items = items.lock().expect("array lock poisoned");
                        let idx = usize::try_from(*i).map_err(|_| {
                            RuntimeError::runtime(format!("negative array index {}", i))
                        })?;
                        if idx >= items.len() {
                            return Err(RuntimeError::runtime(format!(
                                "array index {} out of bounds (len {})",
                                idx,
                                items.len()
                            ))
                            .into());
                        }
                        items[idx] = value;
                        Ok(())
                    }
                    (Value::Dict(entries), Value::String(key)) => {
                        entries
                            .lock()
                            .expect("dict lock poisoned")
                            .insert(key.to_string(), value);
                        Ok(())
                    }
                    _ => Err(RuntimeError::type_error(format!(
                        "cannot index {} with {}",
                        container.type_name(),
                        index.type_name()
                    ))
                    .into()),
                }
            }
            AssignTarget::Field { target, field } => {
                let container = self.eval_expr(target, env)?;
                match &container {
                    Value::Struct(s) => {
                        let mut fields = s.fields.lock().expect("struct lock poisoned");
                        if !fields.contains_key(field) {
                            return Err(RuntimeError::runtime(format!(
                                "struct {} has no field '{}'",
                                s.ty.name, field
                            ))
                            .into());
                        }
                        fields.insert(field.clone(), value);
                        Ok(())
                    }
                    _ => Err(RuntimeError::type_error(format!(
                        "cannot assign field '{}' on {}",
                        field,
                        container.type_name()
                    ))
                    .into()),
                }
            }
        }
    }

    fn exec_use_block(
        &mut self,
        alias: &str,
        block_id: &str,
        span: Span,
        env: &Env,
    ) -> EvalResult<()> {
        self.check_reserved(alias)?;
        self.sandbox
            .check(&AccessRequest::BlockLoad { id: block_id.to_string() })
            .map_err(|v| RuntimeError::new(ErrorKind::SandboxViolation, v.to_string()))?;

        // Missing ids are a definite absence from the registry; at the
        // language level, binding to an absent block is still an error.
        let record = self.registry.lookup(block_id).ok_or_else(|| {
            RuntimeError::runtime(format!("block '{}' not found in registry", block_id))
        })?;
        let host_version = env!("CARGO_PKG_VERSION");
        if !record.supports(host_version) {
            return Err(RuntimeError::runtime(format!(
                "block '{}' requires host version in [{}, {}], this is {}",
                block_id,
                record.version_min.as_deref().unwrap_or("*"),
                record.version_max.as_deref().unwrap_or("*"),
                host_version
            ))
            .into());
        }

        let _ = self.audit.record(
            "block.load",
            serde_json::json!({ "id": record.id.as_str(), "language": record.language.as_str() }),
        );

        let mut block =
            PolyglotBlock::new(record.language, record.params.clone(), &record.source, span);
        block.registry_id = Some(record.id.clone());
        let params = record
            .params
            .iter()
            .map(|p| crate::ast::types::Param::required(p))
            .collect();
        let body = vec![Stmt::new(StmtKind::Return(Some(crate::ast::types::Expr::polyglot(
            block,
        ))))];
        let function = Value::Function(Arc::new(FunctionValue {
            name: Some(alias.to_string()),
            params,
            body,
            env: env.clone(),
            block_id: Some(record.id),
        }));
        env.declare(alias, function);
        Ok(())
    }

    // =========================================================================
    // POLYGLOT (INLINE PATH)
    // =========================================================================

    /// Evaluate one polyglot block on the host thread with the
    /// interpreter's own executor set.
    pub(crate) fn eval_polyglot(
        &mut self,
        block: &PolyglotBlock,
        env: &Env,
    ) -> EvalResult<Value> {
        self.check_block_caps(block)?;
        let mut inputs = Vec::with_capacity(block.bound_variables.len());
        for name in &block.bound_variables {
            let value = env
                .get(name)
                .ok_or_else(|| RuntimeError::undefined_variable(name))?;
            inputs.push((name.clone(), value));
        }

        let sandbox = self.sandbox.handle();
        let job = ExecJob {
            deadline: sandbox.config().deadline_from_now(),
            cancel: CancelToken::new(),
            sandbox,
            cache: Arc::clone(&self.cache),
        };
        let executor = match self.executors.get_or_create(block.language) {
            Ok(executor) => executor,
            Err(e) => return Err(polyglot_error(e, block)),
        };
        let result = executor
            .prepare(&block.source, &block.bound_variables, &job)
            .and_then(|prepared| executor.execute(&prepared, &inputs, &job));
        result.map_err(|e| polyglot_error(e, block))
    }

    fn check_block_caps(&self, block: &PolyglotBlock) -> Result<(), Interrupt> {
        if block.source.len() > MAX_BLOCK_SOURCE {
            return Err(RuntimeError::new(
                ErrorKind::ResourceLimit,
                format!(
                    "polyglot block source exceeds {} bytes",
                    MAX_BLOCK_SOURCE
                ),
            )
            .into());
        }
        Ok(())
    }

    pub(crate) fn check_reserved(&self, name: &str) -> Result<(), Interrupt> {
        if self.options.reserved_names.contains(name) {
            return Err(RuntimeError::runtime(format!("'{}' is a reserved identifier", name)).into());
        }
        Ok(())
    }
}

/// Lift an executor failure into the host taxonomy, tagging the block's
/// trace frame.
fn polyglot_error(e: crate::polyglot::types::ExecError, block: &PolyglotBlock) -> Interrupt {
    let mut error = e.into_runtime_error();
    error.trace.push(TraceFrame::polyglot(
        &block.describe(),
        block.span.start.line,
        block.language,
        &block.bound_variables,
    ));
    Interrupt::Error(error)
}

/// Whether the analyzer would treat this statement as a polyglot unit.
fn is_polyglot_statement(stmt: &Stmt) -> bool {
    use crate::ast::types::ExprKind;
    let expr = match &stmt.kind {
        StmtKind::Let { value, .. } => value,
        StmtKind::Assign { target: AssignTarget::Name(_), value } => value,
        StmtKind::Expr(value) => value,
        _ => return false,
    };
    matches!(expr.kind, ExprKind::Polyglot(_))
}

// =============================================================================
// NATIVES
// =============================================================================

fn register_natives(globals: &Env) {
    for native in [
        NativeFunction { name: "print", func: native_print },
        // println is an alias of print; both terminate the line.
        NativeFunction { name: "println", func: native_print },
        NativeFunction { name: "len", func: native_len },
        NativeFunction { name: "str", func: native_str },
        NativeFunction { name: "type_of", func: native_type_of },
    ] {
        globals.declare(native.name, Value::Native(native));
    }
}

fn native_print(out: &mut HostOutput, args: &[Value]) -> Result<Value, RuntimeError> {
    let line = args.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(" ");
    out.write_line(&line);
    Ok(Value::Null)
}

fn native_len(_out: &mut HostOutput, args: &[Value]) -> Result<Value, RuntimeError> {
    let [value] = args else {
        return Err(RuntimeError::type_error("len takes exactly one argument"));
    };
    let len = match value {
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.lock().expect("array lock poisoned").len(),
        Value::Dict(entries) => entries.lock().expect("dict lock poisoned").len(),
        other => {
            return Err(RuntimeError::type_error(format!(
                "len not defined for {}",
                other.type_name()
            )))
        }
    };
    Ok(Value::Int(len as i64))
}

fn native_str(_out: &mut HostOutput, args: &[Value]) -> Result<Value, RuntimeError> {
    let [value] = args else {
        return Err(RuntimeError::type_error("str takes exactly one argument"));
    };
    Ok(Value::string(&value.to_string()))
}

fn native_type_of(_out: &mut HostOutput, args: &[Value]) -> Result<Value, RuntimeError> {
    let [value] = args else {
        return Err(RuntimeError::type_error("type_of takes exactly one argument"));
    };
    Ok(Value::string(value.type_name()))
}
