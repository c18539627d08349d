//! Sandbox Types and Constants
//!
//! The capability set, preset levels, resource caps and the declarative
//! configuration value that can be constructed at runtime and activated as a
//! scope.

use std::path::PathBuf;
use std::time::Duration;

use bitflags::bitflags;
use serde::Deserialize;
use thiserror::Error;

use super::net_rules::HostRule;

// Input size caps, always enforced regardless of level.
pub const MAX_SOURCE_FILE: usize = 100 * 1024 * 1024; // 100 MiB
pub const MAX_BLOCK_SOURCE: usize = 1024 * 1024; // 1 MiB
pub const MAX_FILE_READ: usize = 10 * 1024 * 1024; // 10 MiB
pub const MAX_PARSER_DEPTH: usize = 1_000;
pub const MAX_CALL_DEPTH: usize = 10_000;
pub const MAX_STRING: usize = 10 * 1024 * 1024; // 10 MiB
pub const MAX_CAPTURED_OUTPUT: usize = 8 * 1024 * 1024; // 8 MiB

bitflags! {
    /// One bit per class of side-effecting operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        const FS_READ            = 1 << 0;
        const FS_WRITE           = 1 << 1;
        const FS_EXECUTE         = 1 << 2;
        const FS_DELETE          = 1 << 3;
        const FS_MKDIR           = 1 << 4;
        const NET_CONNECT        = 1 << 5;
        const NET_LISTEN         = 1 << 6;
        const NET_RAW            = 1 << 7;
        const SYS_EXEC           = 1 << 8;
        const SYS_ENV            = 1 << 9;
        const SYS_TIME           = 1 << 10;
        const BLOCK_LOAD         = 1 << 11;
        const BLOCK_CALL         = 1 << 12;
        const RES_UNLIMITED_MEM  = 1 << 13;
        const RES_UNLIMITED_CPU  = 1 << 14;
        const UNSAFE             = 1 << 15;
    }
}

/// The four preset levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxLevel {
    Restricted,
    Standard,
    Elevated,
    Unrestricted,
}

impl SandboxLevel {
    pub fn capabilities(&self) -> Capabilities {
        let standard = Capabilities::FS_READ
            | Capabilities::FS_WRITE
            | Capabilities::FS_MKDIR
            | Capabilities::BLOCK_LOAD
            | Capabilities::BLOCK_CALL
            | Capabilities::SYS_ENV
            | Capabilities::SYS_TIME;
        match self {
            SandboxLevel::Restricted => Capabilities::FS_READ,
            SandboxLevel::Standard => standard,
            SandboxLevel::Elevated => {
                standard | Capabilities::NET_CONNECT | Capabilities::SYS_EXEC
            }
            SandboxLevel::Unrestricted => Capabilities::all(),
        }
    }

    pub fn max_memory_bytes(&self) -> Option<u64> {
        match self {
            SandboxLevel::Restricted => Some(128 * 1024 * 1024),
            SandboxLevel::Standard => Some(512 * 1024 * 1024),
            SandboxLevel::Elevated => Some(1024 * 1024 * 1024),
            SandboxLevel::Unrestricted => None,
        }
    }

    pub fn wall_clock(&self) -> Option<Duration> {
        match self {
            SandboxLevel::Restricted => Some(Duration::from_secs(10)),
            SandboxLevel::Standard => Some(Duration::from_secs(30)),
            SandboxLevel::Elevated => Some(Duration::from_secs(60)),
            SandboxLevel::Unrestricted => None,
        }
    }

    fn default_paths(&self) -> Vec<PathBuf> {
        match self {
            SandboxLevel::Restricted => Vec::new(),
            SandboxLevel::Standard | SandboxLevel::Elevated => {
                let mut paths = vec![PathBuf::from("/tmp")];
                if let Ok(home) = std::env::var("HOME") {
                    paths.push(PathBuf::from(home));
                }
                paths
            }
            SandboxLevel::Unrestricted => vec![PathBuf::from("/")],
        }
    }
}

/// Resource caps carried by a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceCaps {
    /// None means unlimited
    pub max_memory_bytes: Option<u64>,
    /// Wall-clock deadline for a single foreign execution; None is unlimited
    pub wall_clock: Option<Duration>,
}

/// A complete sandbox configuration: a value, constructible at runtime,
/// activated as a scope on the sandbox stack.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub level: SandboxLevel,
    pub caps: Capabilities,
    pub allowed_paths: Vec<PathBuf>,
    pub allowed_hosts: Vec<HostRule>,
    /// Full argv[0] values permitted for SYS_EXEC; no shell expansion
    pub allowed_commands: Vec<String>,
    pub limits: ResourceCaps,
}

impl SandboxConfig {
    pub fn from_level(level: SandboxLevel) -> Self {
        Self {
            level,
            caps: level.capabilities(),
            allowed_paths: level.default_paths(),
            allowed_hosts: Vec::new(),
            allowed_commands: Vec::new(),
            limits: ResourceCaps {
                max_memory_bytes: level.max_memory_bytes(),
                wall_clock: level.wall_clock(),
            },
        }
    }

    pub fn restricted() -> Self {
        Self::from_level(SandboxLevel::Restricted)
    }

    pub fn standard() -> Self {
        Self::from_level(SandboxLevel::Standard)
    }

    pub fn elevated() -> Self {
        Self::from_level(SandboxLevel::Elevated)
    }

    pub fn unrestricted() -> Self {
        Self::from_level(SandboxLevel::Unrestricted)
    }

    pub fn with_allowed_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.allowed_paths.push(path.into());
        self
    }

    pub fn with_allowed_command(mut self, argv0: impl Into<String>) -> Self {
        self.allowed_commands.push(argv0.into());
        self
    }

    pub fn with_allowed_host(mut self, rule: HostRule) -> Self {
        self.allowed_hosts.push(rule);
        self
    }

    pub fn with_wall_clock(mut self, d: Duration) -> Self {
        self.limits.wall_clock = Some(d);
        self
    }

    /// Load a declarative configuration from TOML.
    pub fn from_toml(text: &str) -> Result<Self, String> {
        let decl: ConfigDecl = toml::from_str(text).map_err(|e| e.to_string())?;
        decl.build()
    }

    /// Load a declarative configuration from JSON.
    pub fn from_json(text: &str) -> Result<Self, String> {
        let decl: ConfigDecl = serde_json::from_str(text).map_err(|e| e.to_string())?;
        decl.build()
    }
}

/// The serde shape of a declarative configuration: a level plus per-axis
/// overrides.
#[derive(Debug, Deserialize)]
struct ConfigDecl {
    level: SandboxLevel,
    #[serde(default)]
    allowed_paths: Vec<PathBuf>,
    #[serde(default)]
    allowed_hosts: Vec<String>,
    #[serde(default)]
    allowed_commands: Vec<String>,
    max_memory_bytes: Option<u64>,
    wall_clock_ms: Option<u64>,
}

impl ConfigDecl {
    fn build(self) -> Result<SandboxConfig, String> {
        let mut config = SandboxConfig::from_level(self.level);
        if !self.allowed_paths.is_empty() {
            config.allowed_paths = self.allowed_paths;
        }
        for host in &self.allowed_hosts {
            config.allowed_hosts.push(HostRule::parse(host)?);
        }
        config.allowed_commands = self.allowed_commands;
        if let Some(mem) = self.max_memory_bytes {
            config.limits.max_memory_bytes = Some(mem);
        }
        if let Some(ms) = self.wall_clock_ms {
            config.limits.wall_clock = Some(Duration::from_millis(ms));
        }
        Ok(config)
    }
}

/// The operations the sandbox gates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessRequest {
    FsRead(PathBuf),
    FsWrite(PathBuf),
    FsExecute(PathBuf),
    FsDelete(PathBuf),
    FsMkdir(PathBuf),
    NetConnect { host: String, port: u16 },
    NetListen { port: u16 },
    NetRaw,
    SysExec { argv0: String },
    SysEnv { var: String },
    SysTime,
    BlockLoad { id: String },
    BlockCall { id: String },
}

impl AccessRequest {
    /// Short operation name recorded in audit details.
    pub fn op(&self) -> &'static str {
        match self {
            AccessRequest::FsRead(_) => "read",
            AccessRequest::FsWrite(_) => "write",
            AccessRequest::FsExecute(_) => "execute",
            AccessRequest::FsDelete(_) => "delete",
            AccessRequest::FsMkdir(_) => "mkdir",
            AccessRequest::NetConnect { .. } => "net_connect",
            AccessRequest::NetListen { .. } => "net_listen",
            AccessRequest::NetRaw => "net_raw",
            AccessRequest::SysExec { .. } => "exec",
            AccessRequest::SysEnv { .. } => "env",
            AccessRequest::SysTime => "time",
            AccessRequest::BlockLoad { .. } => "block_load",
            AccessRequest::BlockCall { .. } => "block_call",
        }
    }

    /// The target string recorded in audit details.
    pub fn target(&self) -> String {
        match self {
            AccessRequest::FsRead(p)
            | AccessRequest::FsWrite(p)
            | AccessRequest::FsExecute(p)
            | AccessRequest::FsDelete(p)
            | AccessRequest::FsMkdir(p) => p.display().to_string(),
            AccessRequest::NetConnect { host, port } => format!("{}:{}", host, port),
            AccessRequest::NetListen { port } => format!(":{}", port),
            AccessRequest::NetRaw => "raw".to_string(),
            AccessRequest::SysExec { argv0 } => argv0.clone(),
            AccessRequest::SysEnv { var } => var.clone(),
            AccessRequest::SysTime => "clock".to_string(),
            AccessRequest::BlockLoad { id } | AccessRequest::BlockCall { id } => id.clone(),
        }
    }

    pub(crate) fn required_capability(&self) -> Capabilities {
        match self {
            AccessRequest::FsRead(_) => Capabilities::FS_READ,
            AccessRequest::FsWrite(_) => Capabilities::FS_WRITE,
            AccessRequest::FsExecute(_) => Capabilities::FS_EXECUTE,
            AccessRequest::FsDelete(_) => Capabilities::FS_DELETE,
            AccessRequest::FsMkdir(_) => Capabilities::FS_MKDIR,
            AccessRequest::NetConnect { .. } => Capabilities::NET_CONNECT,
            AccessRequest::NetListen { .. } => Capabilities::NET_LISTEN,
            AccessRequest::NetRaw => Capabilities::NET_RAW,
            AccessRequest::SysExec { .. } => Capabilities::SYS_EXEC,
            AccessRequest::SysEnv { .. } => Capabilities::SYS_ENV,
            AccessRequest::SysTime => Capabilities::SYS_TIME,
            AccessRequest::BlockLoad { .. } => Capabilities::BLOCK_LOAD,
            AccessRequest::BlockCall { .. } => Capabilities::BLOCK_CALL,
        }
    }
}

/// A denied operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("sandbox denied {op} of '{target}': {reason}")]
pub struct SandboxViolation {
    pub op: String,
    pub target: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_capability_tables() {
        assert!(SandboxLevel::Restricted.capabilities().contains(Capabilities::FS_READ));
        assert!(!SandboxLevel::Restricted.capabilities().contains(Capabilities::FS_WRITE));
        assert!(SandboxLevel::Standard.capabilities().contains(Capabilities::BLOCK_CALL));
        assert!(!SandboxLevel::Standard.capabilities().contains(Capabilities::NET_CONNECT));
        assert!(SandboxLevel::Elevated.capabilities().contains(Capabilities::SYS_EXEC));
        assert!(SandboxLevel::Unrestricted.capabilities().contains(Capabilities::UNSAFE));
    }

    #[test]
    fn test_preset_caps() {
        assert_eq!(
            SandboxLevel::Restricted.max_memory_bytes(),
            Some(128 * 1024 * 1024)
        );
        assert_eq!(SandboxLevel::Unrestricted.wall_clock(), None);
        assert_eq!(
            SandboxLevel::Standard.wall_clock(),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_config_from_toml() {
        let config = SandboxConfig::from_toml(
            r#"
            level = "elevated"
            allowed_paths = ["/srv/data"]
            allowed_hosts = ["api.example.com:443"]
            allowed_commands = ["/usr/bin/convert"]
            wall_clock_ms = 5000
            "#,
        )
        .unwrap();
        assert_eq!(config.level, SandboxLevel::Elevated);
        assert_eq!(config.allowed_paths, vec![PathBuf::from("/srv/data")]);
        assert_eq!(config.allowed_commands, vec!["/usr/bin/convert".to_string()]);
        assert_eq!(config.limits.wall_clock, Some(Duration::from_millis(5000)));
    }

    #[test]
    fn test_config_from_json_defaults() {
        let config = SandboxConfig::from_json(r#"{"level": "standard"}"#).unwrap();
        assert_eq!(config.level, SandboxLevel::Standard);
        assert!(config.allowed_paths.contains(&PathBuf::from("/tmp")));
    }
}
