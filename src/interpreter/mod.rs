//! The host interpreter: tree walker, environments, control-flow interrupts.

pub mod control_flow;
pub mod environment;
pub mod errors;
pub mod expressions;
pub mod functions;
pub mod interpreter;
pub mod types;

pub use environment::Env;
pub use errors::{EvalResult, Interrupt};
pub use interpreter::Interpreter;
pub use types::{ExecutionLimits, HostOutput, InterpreterOptions};

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use crate::audit::AuditLog;
    use crate::polyglot::cache::CodeCache;
    use crate::registry::EmptyRegistry;
    use crate::sandbox::{SandboxConfig, SandboxStack};

    use super::interpreter::Interpreter;
    use super::types::InterpreterOptions;

    /// An interpreter over an ephemeral audit log, a standard sandbox and an
    /// empty registry.
    pub(crate) fn test_interpreter() -> Interpreter {
        let audit = Arc::new(AuditLog::ephemeral().expect("ephemeral audit log"));
        let sandbox = Arc::new(SandboxStack::new(SandboxConfig::standard(), Arc::clone(&audit)));
        let cache = Arc::new(CodeCache::new(32).expect("code cache"));
        Interpreter::new(
            InterpreterOptions::default(),
            sandbox,
            audit,
            cache,
            Arc::new(EmptyRegistry),
        )
    }
}
