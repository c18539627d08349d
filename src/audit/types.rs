//! Audit Log Types
//!
//! Record layout and chain-verification results. A record's canonical form is
//! its JSON serialization with fields in declaration order:
//! `sequence, timestamp_utc, prev_hash, event_kind, details, integrity`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rotate the active file once it grows past this size.
pub const ROTATE_SIZE: u64 = 10 * 1024 * 1024; // 10 MiB

/// Number of rotated files retained (including the active one).
pub const KEEP_FILES: usize = 5;

/// prev_hash of the first record in a chain.
pub const GENESIS_PREV_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// One append-only audit entry.
///
/// Field order is load-bearing: serialization order is the canonical order
/// hashed into the chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    pub sequence: u64,
    pub timestamp_utc: String,
    /// SHA-256 of the previous record's canonical line
    pub prev_hash: String,
    pub event_kind: String,
    pub details: serde_json::Value,
    /// SHA-256 (or HMAC-SHA-256 when keyed) of every prior field
    pub integrity: String,
}

/// The prefix of a record covered by its own integrity value.
#[derive(Serialize)]
pub(crate) struct RecordPrefix<'a> {
    pub sequence: u64,
    pub timestamp_utc: &'a str,
    pub prev_hash: &'a str,
    pub event_kind: &'a str,
    pub details: &'a serde_json::Value,
}

/// Result of replaying a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStatus {
    Intact,
    /// The sequence number of the first record whose integrity or linkage
    /// fails.
    BrokenAt(u64),
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit log io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("audit record is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("audit hmac key rejected")]
    BadKey,
}
