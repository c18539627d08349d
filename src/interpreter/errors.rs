//! Control Flow Interrupts
//!
//! Non-local control flow inside the tree walker travels as the `Err` arm of
//! evaluation results:
//! - break: exit the innermost loop
//! - continue: next iteration
//! - return: exit the current function with a value
//! - error: a runtime failure propagating toward the nearest catch

use crate::errors::RuntimeError;
use crate::value::Value;

/// Non-local control flow signal.
#[derive(Debug, Clone)]
pub enum Interrupt {
    Break,
    Continue,
    Return(Value),
    Error(RuntimeError),
}

impl Interrupt {
    /// Break/continue escaping their loop are host bugs in the parser's
    /// output; surface them as runtime errors rather than panicking.
    pub fn into_error(self, context: &str) -> RuntimeError {
        match self {
            Interrupt::Error(e) => e,
            Interrupt::Break => RuntimeError::runtime(format!("'break' outside loop in {}", context)),
            Interrupt::Continue => {
                RuntimeError::runtime(format!("'continue' outside loop in {}", context))
            }
            Interrupt::Return(_) => {
                RuntimeError::runtime(format!("'return' outside function in {}", context))
            }
        }
    }
}

impl From<RuntimeError> for Interrupt {
    fn from(e: RuntimeError) -> Self {
        Interrupt::Error(e)
    }
}

/// Evaluation result: a value, or a control-flow interrupt.
pub type EvalResult<T> = Result<T, Interrupt>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_error_passthrough() {
        let e = RuntimeError::division_by_zero();
        let msg = Interrupt::Error(e).into_error("main").message;
        assert_eq!(msg, "division by zero");
    }

    #[test]
    fn test_stray_break_becomes_error() {
        let e = Interrupt::Break.into_error("main");
        assert!(e.message.contains("'break' outside loop"));
    }
}
