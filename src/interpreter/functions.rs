//! Function Calls
//!
//! Calls create a fresh child of the callee's *captured* environment
//! (lexical scoping, not dynamic), bind parameters with default-value
//! resolution, run the body, and yield the value of the most recent
//! `return` — or Null when control falls off the end.

use std::sync::Arc;

use crate::errors::{ErrorKind, RuntimeError, TraceFrame};
use crate::sandbox::AccessRequest;
use crate::value::{FunctionValue, Value};

use super::errors::{EvalResult, Interrupt};
use super::interpreter::Interpreter;

impl Interpreter {
    pub(crate) fn call_value(&mut self, callee: Value, args: Vec<Value>) -> EvalResult<Value> {
        match callee {
            Value::Function(function) => self.call_function(function, args),
            Value::Native(native) => {
                (native.func)(&mut self.output, &args).map_err(Interrupt::Error)
            }
            other => Err(RuntimeError::not_callable(other.type_name()).into()),
        }
    }

    fn call_function(
        &mut self,
        function: Arc<FunctionValue>,
        args: Vec<Value>,
    ) -> EvalResult<Value> {
        if self.call_depth + 1 > self.options.limits.max_call_depth {
            return Err(RuntimeError::call_depth_exceeded(self.options.limits.max_call_depth).into());
        }
        // Registry-block wrappers are gated on BLOCK_CALL.
        if let Some(block_id) = &function.block_id {
            self.sandbox
                .check(&AccessRequest::BlockCall { id: block_id.clone() })
                .map_err(|v| RuntimeError::new(ErrorKind::SandboxViolation, v.to_string()))?;
        }
        if args.len() > function.params.len() {
            return Err(RuntimeError::type_error(format!(
                "{} takes {} argument(s), got {}",
                function.name.as_deref().unwrap_or("<fn>"),
                function.params.len(),
                args.len()
            ))
            .into());
        }

        // Fresh child of the captured environment: lexical scoping.
        let scope = function.env.child();
        let mut args = args.into_iter();
        for param in &function.params {
            match args.next() {
                Some(value) => scope.declare(&param.name, value),
                None => match &param.default {
                    Some(default) => {
                        let value = self.eval_expr(default, &scope)?;
                        scope.declare(&param.name, value);
                    }
                    None => {
                        return Err(RuntimeError::type_error(format!(
                            "missing argument '{}' for {}",
                            param.name,
                            function.name.as_deref().unwrap_or("<fn>")
                        ))
                        .into())
                    }
                },
            }
        }

        self.call_depth += 1;
        let result = self.exec_sequence(&function.body, &scope);
        self.call_depth -= 1;

        match result {
            Ok(()) => Ok(Value::Null),
            Err(Interrupt::Return(value)) => Ok(value),
            Err(Interrupt::Error(mut error)) => {
                error.trace.push(TraceFrame::host(
                    "main",
                    0,
                    function.name.as_deref(),
                ));
                Err(Interrupt::Error(error))
            }
            Err(stray) => Err(Interrupt::Error(
                stray.into_error(function.name.as_deref().unwrap_or("<fn>")),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::types::{BinaryOp, Expr, FunctionDecl, Param, Stmt, StmtKind};
    use crate::interpreter::test_support::test_interpreter;

    fn define_and_call(
        decl: FunctionDecl,
        args: Vec<Expr>,
    ) -> Result<Value, RuntimeError> {
        let mut interp = test_interpreter();
        let env = interp.globals.clone();
        interp
            .exec_stmt(&Stmt::new(StmtKind::FunctionDef(decl)), &env)
            .map_err(|i| i.into_error("test"))?;
        let call = Expr::call(Expr::ident("f"), args);
        interp.eval_expr(&call, &env).map_err(|i| i.into_error("test"))
    }

    fn simple_fn(body: Vec<Stmt>) -> FunctionDecl {
        FunctionDecl { name: "f".to_string(), params: vec![Param::required("x")], body }
    }

    #[test]
    fn test_return_value() {
        let decl = simple_fn(vec![Stmt::new(StmtKind::Return(Some(Expr::binary(
            BinaryOp::Mul,
            Expr::ident("x"),
            Expr::int(2),
        ))))]);
        assert_eq!(define_and_call(decl, vec![Expr::int(21)]).unwrap(), Value::Int(42));
    }

    #[test]
    fn test_fall_off_end_yields_null() {
        let decl = simple_fn(vec![Stmt::expr(Expr::ident("x"))]);
        assert_eq!(define_and_call(decl, vec![Expr::int(1)]).unwrap(), Value::Null);
    }

    #[test]
    fn test_default_parameter_resolution() {
        let decl = FunctionDecl {
            name: "f".to_string(),
            params: vec![
                Param::required("a"),
                Param { name: "b".to_string(), default: Some(Expr::int(10)) },
            ],
            body: vec![Stmt::new(StmtKind::Return(Some(Expr::binary(
                BinaryOp::Add,
                Expr::ident("a"),
                Expr::ident("b"),
            ))))],
        };
        assert_eq!(define_and_call(decl, vec![Expr::int(5)]).unwrap(), Value::Int(15));
    }

    #[test]
    fn test_missing_argument_errors() {
        let decl = simple_fn(vec![]);
        let err = define_and_call(decl, vec![]).unwrap_err();
        assert!(err.message.contains("missing argument 'x'"));
    }

    #[test]
    fn test_lexical_not_dynamic_scoping() {
        let mut interp = test_interpreter();
        let env = interp.globals.clone();
        // let n = 1; fn f() { return n; }
        interp.exec_stmt(&Stmt::let_("n", Expr::int(1)), &env).unwrap();
        interp
            .exec_stmt(
                &Stmt::new(StmtKind::FunctionDef(FunctionDecl {
                    name: "f".to_string(),
                    params: vec![],
                    body: vec![Stmt::new(StmtKind::Return(Some(Expr::ident("n"))))],
                })),
                &env,
            )
            .unwrap();
        // A caller-side shadow in a child scope must not affect the callee.
        let caller_scope = env.child();
        caller_scope.declare("n", Value::Int(99));
        let result = interp
            .eval_expr(&Expr::call(Expr::ident("f"), vec![]), &caller_scope)
            .map_err(|i| i.into_error("test"))
            .unwrap();
        assert_eq!(result, Value::Int(1));
    }

    #[test]
    fn test_call_depth_limit_is_fatal() {
        let mut interp = test_interpreter();
        interp.options.limits.max_call_depth = 16;
        let env = interp.globals.clone();
        // fn f(x) { return f(x) }
        interp
            .exec_stmt(
                &Stmt::new(StmtKind::FunctionDef(FunctionDecl {
                    name: "f".to_string(),
                    params: vec![Param::required("x")],
                    body: vec![Stmt::new(StmtKind::Return(Some(Expr::call(
                        Expr::ident("f"),
                        vec![Expr::ident("x")],
                    ))))],
                })),
                &env,
            )
            .unwrap();
        let err = interp
            .eval_expr(&Expr::call(Expr::ident("f"), vec![Expr::int(1)]), &env)
            .map_err(|i| i.into_error("test"))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ResourceLimit);
        assert!(!err.is_catchable());
    }

    #[test]
    fn test_closure_captures_definition_env() {
        let mut interp = test_interpreter();
        let outer = interp.globals.clone().child();
        outer.declare("captured", Value::Int(7));
        interp
            .exec_stmt(
                &Stmt::new(StmtKind::FunctionDef(FunctionDecl {
                    name: "g".to_string(),
                    params: vec![],
                    body: vec![Stmt::new(StmtKind::Return(Some(Expr::ident("captured"))))],
                })),
                &outer,
            )
            .unwrap();
        let g = outer.get("g").unwrap();
        let result = interp.call_value(g, vec![]).map_err(|i| i.into_error("test")).unwrap();
        assert_eq!(result, Value::Int(7));
    }
}
