//! Expression Evaluation
//!
//! Standard left-to-right evaluation; `&&`/`||` short-circuit; integer
//! arithmetic is overflow-checked; division and modulo by zero raise.

use indexmap::IndexMap;

use crate::ast::types::{BinaryOp, Expr, ExprKind, Literal, UnaryOp};
use crate::errors::RuntimeError;
use crate::sandbox::types::MAX_STRING;
use crate::value::Value;

use super::environment::Env;
use super::errors::EvalResult;
use super::interpreter::Interpreter;

impl Interpreter {
    pub(crate) fn eval_expr(&mut self, expr: &Expr, env: &Env) -> EvalResult<Value> {
        match &expr.kind {
            ExprKind::Literal(literal) => Ok(literal_value(literal)),
            ExprKind::Ident(name) => env
                .get(name)
                .ok_or_else(|| RuntimeError::undefined_variable(name).into()),
            ExprKind::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval_expr(item, env)?);
                }
                Ok(Value::array(out))
            }
            ExprKind::Dict(entries) => {
                let mut out = IndexMap::with_capacity(entries.len());
                for (key, value) in entries {
                    out.insert(key.clone(), self.eval_expr(value, env)?);
                }
                Ok(Value::dict(out))
            }
            ExprKind::StructLit { name, fields } => {
                let ty = self
                    .struct_types
                    .get(name)
                    .cloned()
                    .ok_or_else(|| RuntimeError::runtime(format!("unknown struct type '{}'", name)))?;
                let mut out = IndexMap::with_capacity(fields.len());
                for (field, value) in fields {
                    out.insert(field.clone(), self.eval_expr(value, env)?);
                }
                Value::struct_value(ty, out)
                    .map_err(|e| RuntimeError::runtime(e).into())
            }
            ExprKind::Field { target, field } => self.eval_field(target, field, env),
            ExprKind::Index { target, index } => {
                let container = self.eval_expr(target, env)?;
                let index = self.eval_expr(index, env)?;
                eval_index(&container, &index)
            }
            ExprKind::Call { callee, args } => {
                let callee = self.eval_expr(callee, env)?;
                let mut evaluated = Vec::with_capacity(args.len());
                for arg in args {
                    evaluated.push(self.eval_expr(arg, env)?);
                }
                self.call_value(callee, evaluated)
            }
            ExprKind::Unary { op, operand } => {
                let value = self.eval_expr(operand, env)?;
                eval_unary(*op, value)
            }
            ExprKind::Binary { op, lhs, rhs } => self.eval_binary(*op, lhs, rhs, env),
            ExprKind::Pipeline { value, callee } => {
                // `a |> f` is `f(a)`.
                let value = self.eval_expr(value, env)?;
                let callee = self.eval_expr(callee, env)?;
                self.call_value(callee, vec![value])
            }
            ExprKind::Polyglot(block) => self.eval_polyglot(block, env),
        }
    }

    fn eval_field(&mut self, target: &Expr, field: &str, env: &Env) -> EvalResult<Value> {
        // Enum variant access: `Color.Red` where Color is a declared enum and
        // not a bound variable.
        if let ExprKind::Ident(name) = &target.kind {
            if !env.has(name) {
                if let Some(variants) = self.enums.get(name) {
                    return if variants.iter().any(|v| v == field) {
                        Ok(Value::string(field))
                    } else {
                        Err(RuntimeError::runtime(format!(
                            "enum {} has no variant '{}'",
                            name, field
                        ))
                        .into())
                    };
                }
            }
        }
        let target = self.eval_expr(target, env)?;
        match &target {
            Value::Struct(s) => {
                let fields = s.fields.lock().expect("struct lock poisoned");
                fields.get(field).cloned().ok_or_else(|| {
                    RuntimeError::runtime(format!(
                        "struct {} has no field '{}'",
                        s.ty.name, field
                    ))
                    .into()
                })
            }
            // Dict fields are accessed with d["k"], not d.k; the two forms
            // are not interchangeable.
            other => Err(RuntimeError::type_error(format!(
                "cannot access field '{}' on {}",
                field,
                other.type_name()
            ))
            .into()),
        }
    }

    fn eval_binary(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        env: &Env,
    ) -> EvalResult<Value> {
        // Short-circuit forms evaluate the right side lazily.
        match op {
            BinaryOp::And => {
                let left = self.eval_expr(lhs, env)?;
                if !left.is_truthy() {
                    return Ok(Value::Bool(false));
                }
                let right = self.eval_expr(rhs, env)?;
                return Ok(Value::Bool(right.is_truthy()));
            }
            BinaryOp::Or => {
                let left = self.eval_expr(lhs, env)?;
                if left.is_truthy() {
                    return Ok(Value::Bool(true));
                }
                let right = self.eval_expr(rhs, env)?;
                return Ok(Value::Bool(right.is_truthy()));
            }
            _ => {}
        }
        let left = self.eval_expr(lhs, env)?;
        let right = self.eval_expr(rhs, env)?;
        eval_arith_or_compare(op, left, right)
    }
}

fn literal_value(literal: &Literal) -> Value {
    match literal {
        Literal::Null => Value::Null,
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Int(i) => Value::Int(*i),
        Literal::Float(f) => Value::Float(*f),
        Literal::String(s) => Value::string(s),
    }
}

fn eval_index(container: &Value, index: &Value) -> EvalResult<Value> {
    match (container, index) {
        (Value::Array(items), Value::Int(i)) => {
            let items = items.lock().expect("array lock poisoned");
            let idx = usize::try_from(*i)
                .map_err(|_| RuntimeError::runtime(format!("negative array index {}", i)))?;
            items.get(idx).cloned().ok_or_else(|| {
                RuntimeError::runtime(format!(
                    "array index {} out of bounds (len {})",
                    idx,
                    items.len()
                ))
                .into()
            })
        }
        // A missing key is an error, not Null: Null is a present value.
        (Value::Dict(entries), Value::String(key)) => {
            let entries = entries.lock().expect("dict lock poisoned");
            entries
                .get(key.as_ref())
                .cloned()
                .ok_or_else(|| RuntimeError::undefined_key(key).into())
        }
        _ => Err(RuntimeError::type_error(format!(
            "cannot index {} with {}",
            container.type_name(),
            index.type_name()
        ))
        .into()),
    }
}

fn eval_unary(op: UnaryOp, value: Value) -> EvalResult<Value> {
    match (op, &value) {
        (UnaryOp::Neg, Value::Int(i)) => i
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| RuntimeError::arithmetic_overflow("-").into()),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Not, v) => Ok(Value::Bool(!v.is_truthy())),
        (UnaryOp::Neg, other) => {
            Err(RuntimeError::type_error(format!("cannot negate {}", other.type_name())).into())
        }
    }
}

fn eval_arith_or_compare(op: BinaryOp, left: Value, right: Value) -> EvalResult<Value> {
    use BinaryOp::*;
    match op {
        Eq => return Ok(Value::Bool(left == right)),
        Ne => return Ok(Value::Bool(left != right)),
        _ => {}
    }

    // String concatenation and comparison.
    if let (Value::String(a), Value::String(b)) = (&left, &right) {
        return match op {
            Add => {
                if a.len() + b.len() > MAX_STRING {
                    return Err(RuntimeError::new(
                        crate::errors::ErrorKind::ResourceLimit,
                        format!("string exceeds {} bytes", MAX_STRING),
                    )
                    .into());
                }
                Ok(Value::string(&format!("{}{}", a, b)))
            }
            Lt => Ok(Value::Bool(a < b)),
            Le => Ok(Value::Bool(a <= b)),
            Gt => Ok(Value::Bool(a > b)),
            Ge => Ok(Value::Bool(a >= b)),
            _ => Err(type_mismatch(op, &left, &right)),
        };
    }

    // Numeric arithmetic: Int stays Int (checked), any Float promotes.
    match (&left, &right) {
        (Value::Int(a), Value::Int(b)) => {
            let (a, b) = (*a, *b);
            let result = match op {
                Add => a.checked_add(b).ok_or("+"),
                Sub => a.checked_sub(b).ok_or("-"),
                Mul => a.checked_mul(b).ok_or("*"),
                Div => {
                    if b == 0 {
                        return Err(RuntimeError::division_by_zero().into());
                    }
                    a.checked_div(b).ok_or("/")
                }
                Mod => {
                    if b == 0 {
                        return Err(RuntimeError::division_by_zero().into());
                    }
                    a.checked_rem(b).ok_or("%")
                }
                Lt => return Ok(Value::Bool(a < b)),
                Le => return Ok(Value::Bool(a <= b)),
                Gt => return Ok(Value::Bool(a > b)),
                Ge => return Ok(Value::Bool(a >= b)),
                _ => return Err(type_mismatch(op, &left, &right)),
            };
            result
                .map(Value::Int)
                .map_err(|symbol| RuntimeError::arithmetic_overflow(symbol).into())
        }
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            let a = as_f64(&left);
            let b = as_f64(&right);
            Ok(match op {
                Add => Value::Float(a + b),
                Sub => Value::Float(a - b),
                Mul => Value::Float(a * b),
                Div => {
                    if b == 0.0 {
                        return Err(RuntimeError::division_by_zero().into());
                    }
                    Value::Float(a / b)
                }
                Mod => {
                    if b == 0.0 {
                        return Err(RuntimeError::division_by_zero().into());
                    }
                    Value::Float(a % b)
                }
                Lt => Value::Bool(a < b),
                Le => Value::Bool(a <= b),
                Gt => Value::Bool(a > b),
                Ge => Value::Bool(a >= b),
                _ => return Err(type_mismatch(op, &left, &right)),
            })
        }
        _ => Err(type_mismatch(op, &left, &right)),
    }
}

fn as_f64(value: &Value) -> f64 {
    match value {
        Value::Int(i) => *i as f64,
        Value::Float(f) => *f,
        _ => unreachable!("callers check numeric types"),
    }
}

fn type_mismatch(op: BinaryOp, left: &Value, right: &Value) -> super::errors::Interrupt {
    RuntimeError::type_error(format!(
        "operator '{}' not defined for {} and {}",
        op,
        left.type_name(),
        right.type_name()
    ))
    .into()
}
