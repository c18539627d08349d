//! medley - a polyglot scripting runtime
//!
//! An interpreter for the Medley scripting language whose polyglot blocks
//! embed Python, JavaScript, C++, Rust, C# and shell fragments as
//! first-class expressions. Independent blocks are scheduled across a
//! worker pool; every side-effecting operation passes a capability sandbox
//! and security events land in a hash-chained audit log.

pub mod ast;
pub mod audit;
pub mod errors;
pub mod interpreter;
pub mod polyglot;
pub mod registry;
pub mod runtime;
pub mod sandbox;
pub mod value;

pub use ast::types::{Expr, Program, Stmt};
pub use errors::{ErrorKind, RuntimeError};
pub use interpreter::{Interpreter, InterpreterOptions};
pub use polyglot::{Language, PolyglotBlock};
pub use registry::{BlockRecord, BlockRegistry, InMemoryRegistry};
pub use runtime::{Runtime, RuntimeOptions};
pub use sandbox::{SandboxConfig, SandboxLevel};
pub use value::Value;
