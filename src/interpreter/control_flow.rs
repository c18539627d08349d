//! Control Flow Execution
//!
//! if/else chains, while and range-for loops, match, try/catch/finally and
//! compound blocks. Loops observe the break/continue interrupts; `finally`
//! runs on every exit path.

use indexmap::IndexMap;

use crate::ast::types::{Literal, Pattern, Stmt, StmtKind};
use crate::errors::{ErrorKind, RuntimeError};
use crate::value::Value;

use super::environment::Env;
use super::errors::{EvalResult, Interrupt};
use super::interpreter::Interpreter;

impl Interpreter {
    pub(crate) fn exec_control_flow(&mut self, stmt: &Stmt, env: &Env) -> EvalResult<()> {
        match &stmt.kind {
            StmtKind::If { cond, then_body, else_body } => {
                if self.eval_expr(cond, env)?.is_truthy() {
                    self.exec_sequence(then_body, &env.child())
                } else if let Some(else_body) = else_body {
                    self.exec_sequence(else_body, &env.child())
                } else {
                    Ok(())
                }
            }
            StmtKind::While { cond, body } => {
                let mut iterations: u64 = 0;
                while self.eval_expr(cond, env)?.is_truthy() {
                    iterations += 1;
                    if iterations > self.options.limits.max_loop_iterations {
                        return Err(loop_limit(self.options.limits.max_loop_iterations));
                    }
                    match self.exec_sequence(body, &env.child()) {
                        Ok(()) => {}
                        Err(Interrupt::Break) => break,
                        Err(Interrupt::Continue) => continue,
                        Err(other) => return Err(other),
                    }
                }
                Ok(())
            }
            StmtKind::For { var, start, end, inclusive, body } => {
                let start = self.expect_int(start, env, "range start")?;
                let end = self.expect_int(end, env, "range end")?;
                let mut iterations: u64 = 0;
                let mut i = start;
                loop {
                    let in_range = if *inclusive { i <= end } else { i < end };
                    if !in_range {
                        break;
                    }
                    iterations += 1;
                    if iterations > self.options.limits.max_loop_iterations {
                        return Err(loop_limit(self.options.limits.max_loop_iterations));
                    }
                    let scope = env.child();
                    scope.declare(var, Value::Int(i));
                    match self.exec_sequence(body, &scope) {
                        Ok(()) => {}
                        Err(Interrupt::Break) => break,
                        Err(Interrupt::Continue) => {}
                        Err(other) => return Err(other),
                    }
                    match i.checked_add(1) {
                        Some(next) => i = next,
                        None => break,
                    }
                }
                Ok(())
            }
            StmtKind::Match { subject, arms } => {
                let subject = self.eval_expr(subject, env)?;
                for arm in arms {
                    let matched = match &arm.pattern {
                        Pattern::Wildcard => true,
                        Pattern::Literal(literal) => subject == literal_as_value(literal),
                    };
                    if matched {
                        return self.exec_sequence(&arm.body, &env.child());
                    }
                }
                Ok(())
            }
            StmtKind::Try { body, catch, finally } => {
                let result = self.exec_sequence(body, &env.child());
                let result = match result {
                    Err(Interrupt::Error(error)) if error.is_catchable() => {
                        if let Some(clause) = catch {
                            let scope = env.child();
                            scope.declare(&clause.name, error_binding(&error));
                            self.exec_sequence(&clause.body, &scope)
                        } else {
                            Err(Interrupt::Error(error))
                        }
                    }
                    other => other,
                };
                // finally always runs; its own failure wins.
                if let Some(finally_body) = finally {
                    self.exec_sequence(finally_body, &env.child())?;
                }
                result
            }
            StmtKind::Block(stmts) => self.exec_sequence(stmts, &env.child()),
            _ => Err(RuntimeError::internal(format!(
                "exec_control_flow got non-control statement {:?}",
                std::mem::discriminant(&stmt.kind)
            ))
            .into()),
        }
    }

    fn expect_int(
        &mut self,
        expr: &crate::ast::types::Expr,
        env: &Env,
        what: &str,
    ) -> Result<i64, Interrupt> {
        match self.eval_expr(expr, env)? {
            Value::Int(i) => Ok(i),
            other => Err(RuntimeError::type_error(format!(
                "{} must be an int, got {}",
                what,
                other.type_name()
            ))
            .into()),
        }
    }
}

fn loop_limit(max: u64) -> Interrupt {
    RuntimeError::new(ErrorKind::ResourceLimit, format!("loop exceeded {} iterations", max)).into()
}

fn literal_as_value(literal: &Literal) -> Value {
    match literal {
        Literal::Null => Value::Null,
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Int(i) => Value::Int(*i),
        Literal::Float(f) => Value::Float(*f),
        Literal::String(s) => Value::string(s),
    }
}

/// The value a catch clause binds: the thrown payload if there is one, else
/// a dict carrying kind, message and the formatted trace.
fn error_binding(error: &RuntimeError) -> Value {
    if let Some(payload) = &error.payload {
        return payload.clone();
    }
    let mut entries = IndexMap::new();
    entries.insert("kind".to_string(), Value::string(error.kind.as_str()));
    entries.insert("message".to_string(), Value::string(&error.message));
    if !error.trace.is_empty() || error.foreign_trace.is_some() {
        entries.insert("trace".to_string(), Value::string(&error.format_trace()));
    }
    Value::dict(entries)
}
