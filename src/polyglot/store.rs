//! On-Disk Code Cache
//!
//! Persists compiled artifacts across process restarts. Per fingerprint the
//! directory holds the artifact file, a manifest
//! (`fingerprint, language, abi_version, created_at, source_size`), the
//! canonicalized source (re-hashed on load to detect tampering), and a lock
//! file serializing concurrent builds of one fingerprint across processes.
//!
//! Manifests carrying an older ABI version are ignored and evicted.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};

use super::block::Language;
use super::cache::{Artifact, Fingerprint, ABI_VERSION};

/// A lock file untouched for this long is presumed orphaned.
const STALE_LOCK_AGE: Duration = Duration::from_secs(600);

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    fingerprint: String,
    language: Language,
    abi_version: u32,
    created_at: String,
    source_size: u64,
}

/// Filesystem layout and persistence for one cache directory.
pub struct DiskStore {
    dir: PathBuf,
}

impl DiskStore {
    pub fn open(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where the artifact for `fp` lives. Compiled languages produce dynamic
    /// libraries; shell produces a script.
    pub fn artifact_path(&self, fp: &Fingerprint, language: Language) -> PathBuf {
        let ext = match language {
            Language::Shell => "sh",
            _ => std::env::consts::DLL_EXTENSION,
        };
        self.dir.join(format!("{}.{}", fp.to_hex(), ext))
    }

    fn manifest_path(&self, fp: &Fingerprint) -> PathBuf {
        self.dir.join(format!("{}.manifest.json", fp.to_hex()))
    }

    fn source_path(&self, fp: &Fingerprint) -> PathBuf {
        self.dir.join(format!("{}.src", fp.to_hex()))
    }

    fn lock_path(&self, fp: &Fingerprint) -> PathBuf {
        self.dir.join(format!("{}.lock", fp.to_hex()))
    }

    /// Try to load a previously persisted artifact. Integrity is checked by
    /// recomputing the fingerprint from the stored source; any mismatch or
    /// ABI skew evicts the entry.
    pub fn load(&self, fp: &Fingerprint, language: Language) -> Option<Artifact> {
        let manifest_text = std::fs::read_to_string(self.manifest_path(fp)).ok()?;
        let manifest: Manifest = match serde_json::from_str(&manifest_text) {
            Ok(m) => m,
            Err(_) => {
                self.evict(fp, language);
                return None;
            }
        };
        if manifest.abi_version != ABI_VERSION || manifest.fingerprint != fp.to_hex() {
            self.evict(fp, language);
            return None;
        }
        let source = std::fs::read_to_string(self.source_path(fp)).ok()?;
        if Fingerprint::compute(language, &source) != *fp {
            tracing::warn!(fingerprint = %fp.to_hex(), "cache source mismatch, evicting");
            self.evict(fp, language);
            return None;
        }
        let artifact_path = self.artifact_path(fp, language);
        if !artifact_path.exists() {
            return None;
        }
        Some(match language {
            Language::Shell => Artifact::Script { path: artifact_path },
            _ => Artifact::Library { path: artifact_path, symbol: crate::polyglot::codegen::ENTRY_SYMBOL.to_string() },
        })
    }

    /// Persist the manifest and source for an artifact already written to
    /// [`DiskStore::artifact_path`].
    pub fn save(
        &self,
        fp: &Fingerprint,
        language: Language,
        canonical_source: &str,
    ) -> std::io::Result<()> {
        std::fs::write(self.source_path(fp), canonical_source)?;
        let manifest = Manifest {
            fingerprint: fp.to_hex(),
            language,
            abi_version: ABI_VERSION,
            created_at: chrono::Utc::now().to_rfc3339(),
            source_size: canonical_source.len() as u64,
        };
        std::fs::write(self.manifest_path(fp), serde_json::to_string_pretty(&manifest)?)?;
        Ok(())
    }

    fn evict(&self, fp: &Fingerprint, language: Language) {
        let _ = std::fs::remove_file(self.manifest_path(fp));
        let _ = std::fs::remove_file(self.source_path(fp));
        let _ = std::fs::remove_file(self.artifact_path(fp, language));
    }

    /// Acquire the cross-process build lock for `fp`, waiting up to
    /// `deadline`. Stale locks are broken by age.
    pub fn acquire_lock(&self, fp: &Fingerprint, deadline: Instant) -> Option<BuildLock> {
        let path = self.lock_path(fp);
        loop {
            match std::fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Some(BuildLock { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path) {
                        let _ = std::fs::remove_file(&path);
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return None;
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(_) => return None,
            }
        }
    }
}

fn lock_is_stale(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    let Ok(modified) = meta.modified() else {
        return false;
    };
    SystemTime::now()
        .duration_since(modified)
        .map(|age| age > STALE_LOCK_AGE)
        .unwrap_or(false)
}

/// Holds the per-fingerprint lock file; removed on drop.
pub struct BuildLock {
    path: PathBuf,
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, DiskStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path().join("cache")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_save_load_round_trip() {
        let (_dir, store) = store();
        let source = "int x = 1;\nreturn x;";
        let fp = Fingerprint::compute(Language::Cpp, source);
        std::fs::write(store.artifact_path(&fp, Language::Cpp), b"fake-dylib").unwrap();
        store.save(&fp, Language::Cpp, source).unwrap();

        match store.load(&fp, Language::Cpp) {
            Some(Artifact::Library { path, symbol }) => {
                assert!(path.exists());
                assert_eq!(symbol, crate::polyglot::codegen::ENTRY_SYMBOL);
            }
            other => panic!("expected library artifact, got {:?}", other),
        }
    }

    #[test]
    fn test_source_tamper_evicts() {
        let (_dir, store) = store();
        let source = "return 1;";
        let fp = Fingerprint::compute(Language::Rust, source);
        std::fs::write(store.artifact_path(&fp, Language::Rust), b"lib").unwrap();
        store.save(&fp, Language::Rust, source).unwrap();

        // Corrupt the stored source.
        std::fs::write(store.dir().join(format!("{}.src", fp.to_hex())), "return 2;").unwrap();
        assert!(store.load(&fp, Language::Rust).is_none());
        // The entry is gone entirely now.
        assert!(!store.dir().join(format!("{}.manifest.json", fp.to_hex())).exists());
    }

    #[test]
    fn test_lock_exclusion_and_release() {
        let (_dir, store) = store();
        let fp = Fingerprint::compute(Language::Cpp, "x");
        let deadline = Instant::now() + Duration::from_millis(200);

        let lock = store.acquire_lock(&fp, deadline).unwrap();
        assert!(store.acquire_lock(&fp, Instant::now() + Duration::from_millis(120)).is_none());
        drop(lock);
        assert!(store.acquire_lock(&fp, deadline).is_some());
    }
}
