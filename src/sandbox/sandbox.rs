//! Capability Sandbox
//!
//! Every operation that touches the outside world is first asked: may I?
//! `check` answers, logs denials to the audit log, and never mutates global
//! state: the active configuration lives on a per-runtime stack, and nested
//! scopes restore their predecessor on drop.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::audit::AuditLog;

use super::net_rules::is_endpoint_allowed;
use super::types::{AccessRequest, Capabilities, SandboxConfig, SandboxViolation};

impl SandboxConfig {
    /// Pure policy decision for one request. Does not log.
    pub fn evaluate(&self, req: &AccessRequest) -> Result<(), SandboxViolation> {
        let required = req.required_capability();
        if !self.caps.contains(required) {
            return Err(self.deny(req, format!("capability {:?} not granted", required)));
        }
        // UNSAFE turns every target check off; only capability bits applied.
        if self.caps.contains(Capabilities::UNSAFE) {
            return Ok(());
        }
        match req {
            AccessRequest::FsRead(p)
            | AccessRequest::FsWrite(p)
            | AccessRequest::FsExecute(p)
            | AccessRequest::FsDelete(p)
            | AccessRequest::FsMkdir(p) => self.check_path(req, p),
            AccessRequest::NetConnect { host, port } => {
                if is_endpoint_allowed(&self.allowed_hosts, host, *port) {
                    Ok(())
                } else {
                    Err(self.deny(req, "endpoint not in allow list".to_string()))
                }
            }
            AccessRequest::NetListen { .. } | AccessRequest::NetRaw => Ok(()),
            AccessRequest::SysExec { argv0 } => {
                if self.allowed_commands.iter().any(|c| c == argv0) {
                    Ok(())
                } else {
                    Err(self.deny(req, "command not in allow list".to_string()))
                }
            }
            AccessRequest::SysEnv { .. }
            | AccessRequest::SysTime
            | AccessRequest::BlockLoad { .. }
            | AccessRequest::BlockCall { .. } => Ok(()),
        }
    }

    fn check_path(&self, req: &AccessRequest, target: &Path) -> Result<(), SandboxViolation> {
        let canonical = canonicalize_lenient(target);
        for allowed in &self.allowed_paths {
            let allowed = canonicalize_lenient(allowed);
            if canonical.starts_with(&allowed) {
                return Ok(());
            }
        }
        Err(self.deny(req, "path outside allowed prefixes".to_string()))
    }

    fn deny(&self, req: &AccessRequest, reason: String) -> SandboxViolation {
        SandboxViolation {
            op: req.op().to_string(),
            target: req.target(),
            reason,
        }
    }

    /// The wall-clock budget in effect, honoring RES_UNLIMITED_CPU.
    pub fn effective_wall_clock(&self) -> Option<Duration> {
        if self.caps.contains(Capabilities::RES_UNLIMITED_CPU) {
            None
        } else {
            self.limits.wall_clock
        }
    }

    /// The memory cap in effect, honoring RES_UNLIMITED_MEM.
    pub fn effective_memory(&self) -> Option<u64> {
        if self.caps.contains(Capabilities::RES_UNLIMITED_MEM) {
            None
        } else {
            self.limits.max_memory_bytes
        }
    }

    /// Deadline for a foreign execution starting now.
    pub fn deadline_from_now(&self) -> Instant {
        match self.effective_wall_clock() {
            Some(budget) => Instant::now() + budget,
            // No cap: far enough out to never fire.
            None => Instant::now() + Duration::from_secs(86_400 * 365),
        }
    }
}

/// Canonicalize a path, resolving symlinks. For targets that do not exist
/// yet, the nearest existing ancestor is canonicalized and the remaining
/// components are appended, so `/tmp/new-file` still resolves under `/tmp`.
pub fn canonicalize_lenient(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    let mut tail = Vec::new();
    let mut cursor = path.to_path_buf();
    loop {
        if let Ok(canonical) = cursor.canonicalize() {
            let mut out = canonical;
            for part in tail.iter().rev() {
                out.push(part);
            }
            return out;
        }
        match (cursor.file_name(), cursor.parent()) {
            (Some(name), Some(parent)) => {
                tail.push(name.to_os_string());
                cursor = parent.to_path_buf();
            }
            _ => return path.to_path_buf(),
        }
    }
}

// =============================================================================
// SCOPE STACK
// =============================================================================

/// The per-runtime stack of active sandbox configurations.
///
/// `push` activates a configuration and returns a guard; dropping the guard
/// restores the previous one. Checks consult the top of the stack.
pub struct SandboxStack {
    stack: Mutex<Vec<Arc<SandboxConfig>>>,
    audit: Arc<AuditLog>,
}

impl SandboxStack {
    pub fn new(base: SandboxConfig, audit: Arc<AuditLog>) -> Self {
        Self {
            stack: Mutex::new(vec![Arc::new(base)]),
            audit,
        }
    }

    /// The configuration currently in effect.
    pub fn current(&self) -> Arc<SandboxConfig> {
        self.stack
            .lock()
            .expect("sandbox stack lock poisoned")
            .last()
            .cloned()
            .expect("sandbox stack never empty")
    }

    /// Activate `config` until the returned guard drops.
    pub fn push(self: &Arc<Self>, config: SandboxConfig) -> SandboxScope {
        self.stack
            .lock()
            .expect("sandbox stack lock poisoned")
            .push(Arc::new(config));
        SandboxScope { stack: Arc::clone(self) }
    }

    /// Check one request against the active configuration. A denial writes
    /// exactly one `sandbox.deny` audit record; an allow writes nothing.
    pub fn check(&self, req: &AccessRequest) -> Result<(), SandboxViolation> {
        check_and_log(&self.current(), &self.audit, req)
    }

    /// Snapshot the active configuration for use on another thread.
    pub fn handle(&self) -> SandboxHandle {
        SandboxHandle {
            config: self.current(),
            audit: Arc::clone(&self.audit),
        }
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    fn pop(&self) {
        let mut stack = self.stack.lock().expect("sandbox stack lock poisoned");
        if stack.len() > 1 {
            stack.pop();
        }
    }
}

/// RAII guard restoring the previous sandbox configuration.
pub struct SandboxScope {
    stack: Arc<SandboxStack>,
}

impl Drop for SandboxScope {
    fn drop(&mut self) {
        self.stack.pop();
    }
}

/// A thread-portable snapshot of the active configuration plus the audit
/// sink. Workers use this so checks behave identically off the host thread.
#[derive(Clone)]
pub struct SandboxHandle {
    config: Arc<SandboxConfig>,
    audit: Arc<AuditLog>,
}

impl SandboxHandle {
    pub fn check(&self, req: &AccessRequest) -> Result<(), SandboxViolation> {
        check_and_log(&self.config, &self.audit, req)
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }
}

fn check_and_log(
    config: &SandboxConfig,
    audit: &AuditLog,
    req: &AccessRequest,
) -> Result<(), SandboxViolation> {
    match config.evaluate(req) {
        Ok(()) => Ok(()),
        Err(violation) => {
            tracing::warn!(op = violation.op, target = violation.target, "sandbox denial");
            let _ = audit.record(
                "sandbox.deny",
                serde_json::json!({
                    "op": violation.op,
                    "target": violation.target,
                    "reason": violation.reason,
                }),
            );
            Err(violation)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::ChainStatus;
    use crate::sandbox::types::SandboxLevel;

    fn stack_with(config: SandboxConfig) -> Arc<SandboxStack> {
        let audit = Arc::new(AuditLog::ephemeral().unwrap());
        Arc::new(SandboxStack::new(config, audit))
    }

    #[test]
    fn test_standard_denies_etc_write() {
        let stack = stack_with(SandboxConfig::standard());
        let req = AccessRequest::FsWrite(PathBuf::from("/etc/passwd"));
        let err = stack.check(&req).unwrap_err();
        assert_eq!(err.op, "write");
    }

    #[test]
    fn test_standard_allows_tmp_write() {
        let stack = stack_with(SandboxConfig::standard());
        let req = AccessRequest::FsWrite(PathBuf::from("/tmp/medley-test-output"));
        assert!(stack.check(&req).is_ok());
    }

    #[test]
    fn test_restricted_denies_all_reads_without_paths() {
        let stack = stack_with(SandboxConfig::restricted());
        let req = AccessRequest::FsRead(PathBuf::from("/tmp/anything"));
        assert!(stack.check(&req).is_err());
    }

    #[test]
    fn test_denial_writes_exactly_one_audit_record() {
        let audit = Arc::new(AuditLog::ephemeral().unwrap());
        let stack = Arc::new(SandboxStack::new(SandboxConfig::standard(), Arc::clone(&audit)));

        // Allow: no record.
        let before = audit.record("marker", serde_json::json!({})).unwrap();
        stack
            .check(&AccessRequest::FsWrite(PathBuf::from("/tmp/x")))
            .unwrap();
        let after_allow = audit.record("marker", serde_json::json!({})).unwrap();
        assert_eq!(after_allow, before + 1);

        // Deny: exactly one record between the markers.
        stack
            .check(&AccessRequest::FsWrite(PathBuf::from("/etc/passwd")))
            .unwrap_err();
        let after_deny = audit.record("marker", serde_json::json!({})).unwrap();
        assert_eq!(after_deny, after_allow + 2);
        assert_eq!(audit.verify().unwrap(), ChainStatus::Intact);
    }

    #[test]
    fn test_exec_requires_exact_argv0() {
        let config = SandboxConfig::elevated().with_allowed_command("/bin/echo");
        let stack = stack_with(config);
        assert!(stack
            .check(&AccessRequest::SysExec { argv0: "/bin/echo".to_string() })
            .is_ok());
        assert!(stack
            .check(&AccessRequest::SysExec { argv0: "/bin/sh".to_string() })
            .is_err());
    }

    #[test]
    fn test_net_requires_capability_and_rule() {
        // Standard has no NET_CONNECT at all.
        let stack = stack_with(SandboxConfig::standard());
        let req = AccessRequest::NetConnect { host: "api.test".to_string(), port: 443 };
        assert!(stack.check(&req).is_err());

        // Elevated grants the capability but still wants a rule.
        let stack = stack_with(SandboxConfig::elevated());
        assert!(stack.check(&req).is_err());

        let config = SandboxConfig::elevated()
            .with_allowed_host(crate::sandbox::net_rules::HostRule::parse("api.test:443").unwrap());
        let stack = stack_with(config);
        assert!(stack.check(&req).is_ok());
    }

    #[test]
    fn test_scope_stack_restores_on_drop() {
        let stack = stack_with(SandboxConfig::standard());
        assert_eq!(stack.current().level, SandboxLevel::Standard);
        {
            let _scope = stack.push(SandboxConfig::restricted());
            assert_eq!(stack.current().level, SandboxLevel::Restricted);
            {
                let _inner = stack.push(SandboxConfig::unrestricted());
                assert_eq!(stack.current().level, SandboxLevel::Unrestricted);
            }
            assert_eq!(stack.current().level, SandboxLevel::Restricted);
        }
        assert_eq!(stack.current().level, SandboxLevel::Standard);
    }

    #[test]
    fn test_canonicalize_lenient_missing_tail() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("not/created/yet.txt");
        let canonical = canonicalize_lenient(&missing);
        assert!(canonical.starts_with(dir.path().canonicalize().unwrap()));
        assert!(canonical.ends_with("not/created/yet.txt"));
    }

    #[test]
    fn test_unrestricted_allows_everything() {
        let stack = stack_with(SandboxConfig::unrestricted());
        assert!(stack.check(&AccessRequest::FsWrite(PathBuf::from("/etc/hosts"))).is_ok());
        assert!(stack
            .check(&AccessRequest::NetConnect { host: "anywhere".to_string(), port: 1 })
            .is_ok());
    }
}
