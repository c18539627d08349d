//! Block Registry Types
//!
//! Records yield foreign source text keyed by block id. Storage backends are
//! out of scope; this module defines the record shape and the read-only
//! lookup interface.

use std::collections::HashMap;

use serde::Deserialize;

use crate::polyglot::block::Language;

/// A reusable foreign-source block.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockRecord {
    pub id: String,
    pub language: Language,
    pub source: String,
    /// Host variable names the block expects bound, in order.
    pub params: Vec<String>,
    /// Inclusive host-version bounds; None means unbounded.
    pub version_min: Option<String>,
    pub version_max: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl BlockRecord {
    /// Whether `host_version` falls inside `[version_min, version_max]`.
    /// Versions compare numerically, component by component.
    pub fn supports(&self, host_version: &str) -> bool {
        if let Some(min) = &self.version_min {
            if compare_versions(host_version, min) == std::cmp::Ordering::Less {
                return false;
            }
        }
        if let Some(max) = &self.version_max {
            if compare_versions(host_version, max) == std::cmp::Ordering::Greater {
                return false;
            }
        }
        true
    }
}

fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.').map(|c| c.parse::<u64>().unwrap_or(0)).collect()
    };
    let (a, b) = (parse(a), parse(b));
    for i in 0..a.len().max(b.len()) {
        let (x, y) = (a.get(i).copied().unwrap_or(0), b.get(i).copied().unwrap_or(0));
        match x.cmp(&y) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    std::cmp::Ordering::Equal
}

/// Read-only registry interface. Missing ids are a definite absence.
pub trait BlockRegistry: Send + Sync {
    fn lookup(&self, id: &str) -> Option<BlockRecord>;
}

/// The serde shape of a record as stored: source may be inline text or
/// base64-encoded.
#[derive(Debug, Deserialize)]
pub(crate) struct RecordDecl {
    pub id: String,
    pub language: Language,
    pub source: String,
    #[serde(default)]
    pub encoding: SourceEncoding,
    #[serde(default)]
    pub params: Vec<String>,
    pub version_min: Option<String>,
    pub version_max: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum SourceEncoding {
    #[default]
    Utf8,
    Base64,
}

impl RecordDecl {
    pub fn decode(self) -> Result<BlockRecord, String> {
        let source = match self.encoding {
            SourceEncoding::Utf8 => self.source,
            SourceEncoding::Base64 => {
                use base64::Engine;
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(&self.source)
                    .map_err(|e| format!("base64 decode error for block '{}': {}", self.id, e))?;
                String::from_utf8(bytes)
                    .map_err(|e| format!("utf-8 decode error for block '{}': {}", self.id, e))?
            }
        };
        Ok(BlockRecord {
            id: self.id,
            language: self.language,
            source,
            params: self.params,
            version_min: self.version_min,
            version_max: self.version_max,
            metadata: self.metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(min: Option<&str>, max: Option<&str>) -> BlockRecord {
        BlockRecord {
            id: "r".to_string(),
            language: Language::Python,
            source: "return 1".to_string(),
            params: vec![],
            version_min: min.map(|s| s.to_string()),
            version_max: max.map(|s| s.to_string()),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_version_bounds() {
        assert!(record(Some("0.1.0"), Some("1.0.0")).supports("0.5.2"));
        assert!(!record(Some("0.2.0"), None).supports("0.1.9"));
        assert!(!record(None, Some("0.9.0")).supports("1.0.0"));
        assert!(record(None, None).supports("42.0.0"));
    }

    #[test]
    fn test_version_compare_numeric_not_lexical() {
        assert!(record(Some("0.9.0"), None).supports("0.10.0"));
    }
}
