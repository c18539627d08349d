//! Capability sandbox: grants, allow lists, resource caps, scoped activation.

pub mod net_rules;
pub mod sandbox;
pub mod types;

pub use net_rules::HostRule;
pub use sandbox::{canonicalize_lenient, SandboxHandle, SandboxScope, SandboxStack};
pub use types::{
    AccessRequest, Capabilities, ResourceCaps, SandboxConfig, SandboxLevel, SandboxViolation,
};
