//! Hash-Chained Audit Log
//!
//! Append-only JSON-lines log of security-relevant events. Each record's
//! `prev_hash` is the SHA-256 of the previous record's serialized line, so
//! mutating any historical record invalidates every later one. Writers are
//! serialized through one mutex; ordering across threads is arrival order at
//! that mutex. There is no API to mutate or delete a record.
//!
//! Rotation starts a new file whose genesis record carries the hash of the
//! final record of the predecessor, so the chain spans files.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use super::types::{
    AuditError, AuditRecord, ChainStatus, RecordPrefix, GENESIS_PREV_HASH, KEEP_FILES, ROTATE_SIZE,
};

type HmacSha256 = Hmac<Sha256>;

struct LogState {
    file: File,
    sequence: u64,
    /// SHA-256 of the last serialized line, feeding the next prev_hash
    last_line_hash: String,
    bytes_written: u64,
}

/// The tamper-evident audit log.
pub struct AuditLog {
    path: PathBuf,
    hmac_key: Option<Vec<u8>>,
    state: Mutex<LogState>,
    /// Keeps an ephemeral log's backing directory alive
    _scratch: Option<tempfile::TempDir>,
}

impl AuditLog {
    /// Create (or truncate) the log at `path` and write its genesis record.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        Self::create_inner(path.as_ref().to_path_buf(), None, None)
    }

    /// Create with HMAC keying: every record carries an HMAC instead of a
    /// plain hash, so verification requires the key.
    pub fn create_keyed(path: impl AsRef<Path>, key: &[u8]) -> Result<Self, AuditError> {
        if key.is_empty() {
            return Err(AuditError::BadKey);
        }
        Self::create_inner(path.as_ref().to_path_buf(), Some(key.to_vec()), None)
    }

    /// A log backed by a temporary directory, for embedders that do not
    /// configure a path. The directory lives as long as the log.
    pub fn ephemeral() -> Result<Self, AuditError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("audit.log");
        Self::create_inner(path, None, Some(dir))
    }

    fn create_inner(
        path: PathBuf,
        hmac_key: Option<Vec<u8>>,
        scratch: Option<tempfile::TempDir>,
    ) -> Result<Self, AuditError> {
        let file = OpenOptions::new().create(true).write(true).truncate(true).open(&path)?;
        let log = Self {
            path,
            hmac_key,
            state: Mutex::new(LogState {
                file,
                sequence: 0,
                last_line_hash: GENESIS_PREV_HASH.to_string(),
                bytes_written: 0,
            }),
            _scratch: scratch,
        };
        log.append_genesis(serde_json::json!({ "previous_file_hash": null }))?;
        Ok(log)
    }

    /// Append an event. Returns the new record's sequence number.
    pub fn record(
        &self,
        event_kind: &str,
        details: serde_json::Value,
    ) -> Result<u64, AuditError> {
        let mut state = self.state.lock().expect("audit lock poisoned");
        if state.bytes_written > ROTATE_SIZE {
            self.rotate_locked(&mut state)?;
        }
        self.append_locked(&mut state, event_kind, details)
    }

    /// Start a new file now, regardless of size.
    pub fn rotate(&self) -> Result<(), AuditError> {
        let mut state = self.state.lock().expect("audit lock poisoned");
        self.rotate_locked(&mut state)
    }

    /// Replay the active file and check every hash link.
    pub fn verify(&self) -> Result<ChainStatus, AuditError> {
        // Holding the lock keeps a concurrent writer from appending a
        // half-flushed line mid-read.
        let mut state = self.state.lock().expect("audit lock poisoned");
        state.file.flush()?;
        verify_file_with_key(&self.path, self.hmac_key.as_deref())
    }

    /// Path of the active file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append_genesis(&self, details: serde_json::Value) -> Result<(), AuditError> {
        let mut state = self.state.lock().expect("audit lock poisoned");
        self.append_locked(&mut state, "audit.genesis", details)?;
        Ok(())
    }

    fn append_locked(
        &self,
        state: &mut LogState,
        event_kind: &str,
        details: serde_json::Value,
    ) -> Result<u64, AuditError> {
        let sequence = state.sequence;
        let timestamp_utc = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
        let prev_hash = state.last_line_hash.clone();

        let prefix = RecordPrefix {
            sequence,
            timestamp_utc: &timestamp_utc,
            prev_hash: &prev_hash,
            event_kind,
            details: &details,
        };
        let prefix_json = serde_json::to_string(&prefix)?;
        let integrity = self.integrity_of(&prefix_json);

        let record = AuditRecord {
            sequence,
            timestamp_utc,
            prev_hash,
            event_kind: event_kind.to_string(),
            details,
            integrity,
        };
        let line = serde_json::to_string(&record)?;
        state.file.write_all(line.as_bytes())?;
        state.file.write_all(b"\n")?;
        state.file.flush()?;

        state.last_line_hash = sha256_hex(line.as_bytes());
        state.bytes_written += line.len() as u64 + 1;
        state.sequence += 1;
        Ok(sequence)
    }

    fn rotate_locked(&self, state: &mut LogState) -> Result<(), AuditError> {
        tracing::debug!(path = %self.path.display(), "rotating audit log");
        state.file.flush()?;
        let final_hash = state.last_line_hash.clone();

        // Shift audit.log.N → audit.log.N+1, dropping the oldest.
        let rotated = |n: usize| PathBuf::from(format!("{}.{}", self.path.display(), n));
        let oldest = rotated(KEEP_FILES - 1);
        if oldest.exists() {
            std::fs::remove_file(&oldest)?;
        }
        for n in (1..KEEP_FILES - 1).rev() {
            let from = rotated(n);
            if from.exists() {
                std::fs::rename(&from, rotated(n + 1))?;
            }
        }
        std::fs::rename(&self.path, rotated(1))?;

        state.file = OpenOptions::new().create(true).write(true).truncate(true).open(&self.path)?;
        state.bytes_written = 0;
        state.last_line_hash = GENESIS_PREV_HASH.to_string();
        self.append_locked(
            state,
            "audit.genesis",
            serde_json::json!({ "previous_file_hash": final_hash }),
        )?;
        Ok(())
    }

    fn integrity_of(&self, canonical_prefix: &str) -> String {
        match &self.hmac_key {
            Some(key) => {
                let mut mac =
                    HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
                mac.update(canonical_prefix.as_bytes());
                hex::encode(mac.finalize().into_bytes())
            }
            None => sha256_hex(canonical_prefix.as_bytes()),
        }
    }
}

/// Replay an audit file, checking integrity and linkage record by record.
pub fn verify_file(path: impl AsRef<Path>) -> Result<ChainStatus, AuditError> {
    verify_file_with_key(path.as_ref(), None)
}

fn verify_file_with_key(path: &Path, key: Option<&[u8]>) -> Result<ChainStatus, AuditError> {
    let reader = BufReader::new(File::open(path)?);
    let mut expected_prev = GENESIS_PREV_HASH.to_string();
    let mut expected_sequence = 0u64;

    for line in reader.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let broken = ChainStatus::BrokenAt(expected_sequence);

        let record: AuditRecord = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(_) => return Ok(broken),
        };
        if record.sequence != expected_sequence || record.prev_hash != expected_prev {
            return Ok(broken);
        }

        let prefix = RecordPrefix {
            sequence: record.sequence,
            timestamp_utc: &record.timestamp_utc,
            prev_hash: &record.prev_hash,
            event_kind: &record.event_kind,
            details: &record.details,
        };
        let prefix_json = serde_json::to_string(&prefix)?;
        let expected_integrity = match key {
            Some(k) => {
                let mut mac = HmacSha256::new_from_slice(k).expect("hmac accepts any key length");
                mac.update(prefix_json.as_bytes());
                hex::encode(mac.finalize().into_bytes())
            }
            None => sha256_hex(prefix_json.as_bytes()),
        };
        if record.integrity != expected_integrity {
            return Ok(broken);
        }

        expected_prev = sha256_hex(line.as_bytes());
        expected_sequence += 1;
    }
    Ok(ChainStatus::Intact)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_log() -> (tempfile::TempDir, AuditLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::create(dir.path().join("audit.log")).unwrap();
        (dir, log)
    }

    #[test]
    fn test_chain_intact_after_records() {
        let (_dir, log) = scratch_log();
        for i in 0..50 {
            log.record("test.event", serde_json::json!({ "i": i })).unwrap();
        }
        assert_eq!(log.verify().unwrap(), ChainStatus::Intact);
    }

    #[test]
    fn test_sequence_numbers_monotonic() {
        let (_dir, log) = scratch_log();
        let a = log.record("a", serde_json::json!({})).unwrap();
        let b = log.record("b", serde_json::json!({})).unwrap();
        assert_eq!(b, a + 1);
    }

    #[test]
    fn test_single_record_mutation_detected() {
        let (_dir, log) = scratch_log();
        for i in 0..1000 {
            log.record("bulk", serde_json::json!({ "i": i })).unwrap();
        }
        assert_eq!(log.verify().unwrap(), ChainStatus::Intact);

        // Truncate the payload of record 500 by one character.
        let path = log.path().to_path_buf();
        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines: Vec<String> = content.lines().map(|l| l.to_string()).collect();
        let target = lines
            .iter()
            .position(|l| l.contains("\"sequence\":500"))
            .expect("record 500 present");
        let mangled = lines[target].replace("\"i\":499", "\"i\":49");
        assert_ne!(mangled, lines[target]);
        lines[target] = mangled;
        std::fs::write(&path, lines.join("\n") + "\n").unwrap();

        assert_eq!(verify_file(&path).unwrap(), ChainStatus::BrokenAt(500));
    }

    #[test]
    fn test_keyed_log_verifies_with_key_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let log = AuditLog::create_keyed(&path, b"secret-key").unwrap();
        log.record("keyed.event", serde_json::json!({})).unwrap();
        assert_eq!(log.verify().unwrap(), ChainStatus::Intact);
        // Keyless verification cannot reproduce the HMACs.
        assert_eq!(verify_file(&path).unwrap(), ChainStatus::BrokenAt(0));
    }

    #[test]
    fn test_rotation_links_files() {
        let (_dir, log) = scratch_log();
        log.record("before", serde_json::json!({})).unwrap();
        log.rotate().unwrap();
        log.record("after", serde_json::json!({})).unwrap();
        assert_eq!(log.verify().unwrap(), ChainStatus::Intact);

        let first = std::fs::read_to_string(format!("{}.1", log.path().display())).unwrap();
        let active = std::fs::read_to_string(log.path()).unwrap();
        let genesis: AuditRecord =
            serde_json::from_str(active.lines().next().unwrap()).unwrap();
        assert_eq!(genesis.event_kind, "audit.genesis");
        let linked = genesis.details["previous_file_hash"].as_str().unwrap();
        let last_line = first.lines().last().unwrap();
        assert_eq!(linked, sha256_hex(last_line.as_bytes()));
    }

    #[test]
    fn test_rotation_retains_keep_files() {
        let (dir, log) = scratch_log();
        for _ in 0..(KEEP_FILES + 2) {
            log.record("r", serde_json::json!({})).unwrap();
            log.rotate().unwrap();
        }
        let mut rotated = 0;
        for entry in std::fs::read_dir(dir.path()).unwrap() {
            let name = entry.unwrap().file_name().to_string_lossy().to_string();
            if name.starts_with("audit.log.") {
                rotated += 1;
            }
        }
        assert_eq!(rotated, KEEP_FILES - 1);
    }
}
