//! The polyglot execution substrate: blocks, marshalling, executors, the
//! code cache, the dependency analyzer and the parallel scheduler.

pub mod analyzer;
pub mod block;
pub mod cache;
pub mod codegen;
pub mod executors;
pub mod marshal;
pub mod scheduler;
pub mod store;
pub mod types;

pub use block::{Language, PolyglotBlock};
pub use cache::{Artifact, CodeCache, Fingerprint, ABI_VERSION};
pub use types::{CancelToken, ExecError, ExecJob, MarshalDirection};
