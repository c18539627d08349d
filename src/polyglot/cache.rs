//! Code Cache
//!
//! Maps source fingerprints to compiled artifacts. A fingerprint is the
//! SHA-256 of `(language, canonicalized_source, abi_version)`. Hits reuse
//! the artifact without recompiling; concurrent misses on one key serialize
//! through a per-key barrier so at most one build of a fingerprint is ever
//! in flight. Compile failures are cached negatively for this process only.
//!
//! Interpreted-language handles never pass through here: they are confined
//! to the executor instance that produced them and cached inside it.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use lru::LruCache;
use sha2::{Digest, Sha256};

use super::block::{canonical_source, Language};
use super::store::DiskStore;
use super::types::ExecError;

/// Layout version of the compiled-language wrapper ABI. Bumping it
/// invalidates every on-disk entry.
pub const ABI_VERSION: u32 = 1;

/// Default in-memory entry capacity.
pub const DEFAULT_CAPACITY: usize = 256;

/// A 32-byte cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint of canonicalized source under a language tag and the
    /// current ABI version.
    pub fn compute(language: Language, source: &str) -> Self {
        let canonical = canonical_source(source);
        let mut hasher = Sha256::new();
        hasher.update(language.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical.as_bytes());
        hasher.update(ABI_VERSION.to_le_bytes());
        Fingerprint(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// A cached build product.
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    /// A platform dynamic library plus the exported entry symbol.
    Library { path: PathBuf, symbol: String },
    /// A shell script file.
    Script { path: PathBuf },
}

enum BuildState {
    Building,
    Ready(Artifact),
    Failed(String),
    /// The producer gave up for a non-compile reason; waiters retry.
    Abandoned,
}

struct Slot {
    state: Mutex<BuildState>,
    cond: Condvar,
}

/// The shared fingerprint → artifact cache.
pub struct CodeCache {
    slots: Mutex<HashMap<Fingerprint, Arc<Slot>>>,
    recency: Mutex<LruCache<Fingerprint, ()>>,
    store: Option<DiskStore>,
    /// Scratch directory backing artifacts when no persistent store is set
    scratch: DiskStore,
    _scratch_dir: tempfile::TempDir,
    builds_started: AtomicU64,
    builds_in_flight: AtomicUsize,
    max_concurrent_builds: AtomicUsize,
}

impl CodeCache {
    /// Memory-only cache; artifacts live in a scratch directory that dies
    /// with the cache.
    pub fn new(capacity: usize) -> std::io::Result<Self> {
        Self::build(None, capacity)
    }

    /// Cache persisting compiled artifacts under `dir` across restarts.
    pub fn with_store(dir: impl Into<PathBuf>, capacity: usize) -> std::io::Result<Self> {
        Self::build(Some(DiskStore::open(dir)?), capacity)
    }

    fn build(store: Option<DiskStore>, capacity: usize) -> std::io::Result<Self> {
        let scratch_dir = tempfile::tempdir()?;
        let scratch = DiskStore::open(scratch_dir.path().join("artifacts"))?;
        let cap = NonZeroUsize::new(capacity.max(1)).expect("capacity >= 1");
        Ok(Self {
            slots: Mutex::new(HashMap::new()),
            recency: Mutex::new(LruCache::new(cap)),
            store,
            scratch,
            _scratch_dir: scratch_dir,
            builds_started: AtomicU64::new(0),
            builds_in_flight: AtomicUsize::new(0),
            max_concurrent_builds: AtomicUsize::new(0),
        })
    }

    /// The directory a builder should write the artifact for `fp` into.
    pub fn artifact_path(&self, fp: &Fingerprint, language: Language) -> PathBuf {
        self.active_store().artifact_path(fp, language)
    }

    fn active_store(&self) -> &DiskStore {
        self.store.as_ref().unwrap_or(&self.scratch)
    }

    /// Look up `fp`, or build it. Exactly one concurrent caller per key runs
    /// `builder`; the rest block on the barrier and observe the result.
    ///
    /// `builder` writes the artifact to [`CodeCache::artifact_path`] and
    /// returns it. Compile failures are remembered for the process lifetime;
    /// other failures (timeout, sandbox) leave the key retryable.
    pub fn get_or_build<F>(
        &self,
        fp: Fingerprint,
        language: Language,
        source: &str,
        deadline: Instant,
        builder: F,
    ) -> Result<Artifact, ExecError>
    where
        F: FnOnce() -> Result<Artifact, ExecError>,
    {
        // Fast path plus producer election under the slots lock.
        let (slot, is_producer) = {
            let mut slots = self.slots.lock().expect("cache slots lock poisoned");
            match slots.get(&fp) {
                Some(slot) => (Arc::clone(slot), false),
                None => {
                    let slot = Arc::new(Slot {
                        state: Mutex::new(BuildState::Building),
                        cond: Condvar::new(),
                    });
                    slots.insert(fp, Arc::clone(&slot));
                    (slot, true)
                }
            }
        };

        if !is_producer {
            return match self.wait_for(&slot, language) {
                WaitOutcome::Done(result) => {
                    if result.is_ok() {
                        self.touch(fp);
                    }
                    result
                }
                // Producer abandoned; take another run at the key.
                WaitOutcome::Retry => {
                    self.get_or_build(fp, language, source, deadline, builder)
                }
            };
        }

        // Producer path. Disk first: a persisted artifact needs no build.
        if let Some(store) = &self.store {
            if let Some(artifact) = store.load(&fp, language) {
                tracing::debug!(fingerprint = %fp.to_hex(), "code cache disk hit");
                self.finish(&slot, fp, BuildState::Ready(artifact.clone()));
                self.touch(fp);
                return Ok(artifact);
            }
        }

        // Cross-process serialization while compiling into a shared store.
        let _file_lock = match &self.store {
            Some(store) => match store.acquire_lock(&fp, deadline) {
                Some(lock) => Some(lock),
                None => {
                    self.finish(&slot, fp, BuildState::Abandoned);
                    self.remove_slot(&fp);
                    return Err(ExecError::Timeout {
                        language,
                        elapsed: Instant::now().saturating_duration_since(deadline),
                    });
                }
            },
            None => None,
        };

        tracing::debug!(fingerprint = %fp.to_hex(), %language, "code cache miss, building");
        self.builds_started.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.builds_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_builds.fetch_max(in_flight, Ordering::SeqCst);

        let built = builder();

        self.builds_in_flight.fetch_sub(1, Ordering::SeqCst);

        match built {
            Ok(artifact) => {
                if let Some(store) = &self.store {
                    if let Err(e) = store.save(&fp, language, &canonical_source(source)) {
                        tracing::warn!(error = %e, "failed to persist cache manifest");
                    }
                }
                self.finish(&slot, fp, BuildState::Ready(artifact.clone()));
                self.touch(fp);
                Ok(artifact)
            }
            Err(e @ ExecError::Compile { .. }) => {
                // Negative cache, process lifetime only.
                self.finish(&slot, fp, BuildState::Failed(e.to_string()));
                Err(e)
            }
            Err(e) => {
                self.finish(&slot, fp, BuildState::Abandoned);
                self.remove_slot(&fp);
                Err(e)
            }
        }
    }

    /// How many builds ever started; invariant telemetry for tests.
    pub fn builds_started(&self) -> u64 {
        self.builds_started.load(Ordering::SeqCst)
    }

    /// The high-water mark of concurrent builds across all keys.
    pub fn max_concurrent_builds(&self) -> usize {
        self.max_concurrent_builds.load(Ordering::SeqCst)
    }

    fn wait_for(&self, slot: &Slot, language: Language) -> WaitOutcome {
        let mut state = slot.state.lock().expect("cache slot lock poisoned");
        loop {
            match &*state {
                BuildState::Building => {
                    state = slot.cond.wait(state).expect("cache slot lock poisoned");
                }
                BuildState::Ready(artifact) => {
                    return WaitOutcome::Done(Ok(artifact.clone()));
                }
                BuildState::Failed(diagnostics) => {
                    return WaitOutcome::Done(Err(ExecError::Compile {
                        language,
                        diagnostics: diagnostics.clone(),
                    }));
                }
                BuildState::Abandoned => return WaitOutcome::Retry,
            }
        }
    }

    fn finish(&self, slot: &Slot, _fp: Fingerprint, state: BuildState) {
        *slot.state.lock().expect("cache slot lock poisoned") = state;
        slot.cond.notify_all();
    }

    fn remove_slot(&self, fp: &Fingerprint) {
        self.slots.lock().expect("cache slots lock poisoned").remove(fp);
    }

    /// Refresh recency; `push` reports the entry the LRU displaced, which is
    /// then dropped from the slot map (Ready entries only — a Building slot
    /// must survive for its waiters).
    fn touch(&self, fp: Fingerprint) {
        let displaced = self
            .recency
            .lock()
            .expect("cache recency lock poisoned")
            .push(fp, ());
        if let Some((evicted, ())) = displaced {
            if evicted == fp {
                return;
            }
            let mut slots = self.slots.lock().expect("cache slots lock poisoned");
            if let Some(slot) = slots.get(&evicted) {
                let state = slot.state.lock().expect("cache slot lock poisoned");
                if matches!(&*state, BuildState::Ready(_)) {
                    drop(state);
                    slots.remove(&evicted);
                    tracing::debug!(fingerprint = %evicted.to_hex(), "evicted cache entry");
                }
            }
        }
    }
}

enum WaitOutcome {
    Done(Result<Artifact, ExecError>),
    Retry,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[test]
    fn test_fingerprint_stable_under_formatting() {
        let a = Fingerprint::compute(Language::Python, "return 1");
        let b = Fingerprint::compute(Language::Python, "    return 1  \n");
        let c = Fingerprint::compute(Language::Python, "return 2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        // Same source, different language: different key.
        assert_ne!(a, Fingerprint::compute(Language::Rust, "return 1"));
    }

    #[test]
    fn test_hit_skips_builder() {
        let cache = CodeCache::new(8).unwrap();
        let fp = Fingerprint::compute(Language::Cpp, "return 1;");
        let artifact = Artifact::Library { path: PathBuf::from("/x.so"), symbol: "s".into() };

        let a = artifact.clone();
        let built = cache
            .get_or_build(fp, Language::Cpp, "return 1;", far_deadline(), move || Ok(a))
            .unwrap();
        assert_eq!(built, artifact);

        let second = cache
            .get_or_build(fp, Language::Cpp, "return 1;", far_deadline(), || {
                panic!("builder must not run on a hit")
            })
            .unwrap();
        assert_eq!(second, artifact);
        assert_eq!(cache.builds_started(), 1);
    }

    #[test]
    fn test_compile_failure_cached_negatively() {
        let cache = CodeCache::new(8).unwrap();
        let fp = Fingerprint::compute(Language::Cpp, "broken");

        let err = cache
            .get_or_build(fp, Language::Cpp, "broken", far_deadline(), || {
                Err(ExecError::Compile {
                    language: Language::Cpp,
                    diagnostics: "syntax".to_string(),
                })
            })
            .unwrap_err();
        assert!(matches!(err, ExecError::Compile { .. }));

        // Second attempt observes the negative entry without rebuilding.
        let err = cache
            .get_or_build(fp, Language::Cpp, "broken", far_deadline(), || {
                panic!("negative entry must not rebuild")
            })
            .unwrap_err();
        assert!(matches!(err, ExecError::Compile { .. }));
        assert_eq!(cache.builds_started(), 1);
    }

    #[test]
    fn test_non_compile_failure_is_retryable() {
        let cache = CodeCache::new(8).unwrap();
        let fp = Fingerprint::compute(Language::Cpp, "slow");

        let _ = cache
            .get_or_build(fp, Language::Cpp, "slow", far_deadline(), || {
                Err(ExecError::Timeout { language: Language::Cpp, elapsed: Duration::ZERO })
            })
            .unwrap_err();

        let artifact = Artifact::Library { path: PathBuf::from("/y.so"), symbol: "s".into() };
        let a = artifact.clone();
        let built = cache
            .get_or_build(fp, Language::Cpp, "slow", far_deadline(), move || Ok(a))
            .unwrap();
        assert_eq!(built, artifact);
    }

    #[test]
    fn test_concurrent_misses_build_once() {
        let cache = Arc::new(CodeCache::new(8).unwrap());
        let fp = Fingerprint::compute(Language::Cpp, "shared");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                cache.get_or_build(fp, Language::Cpp, "shared", far_deadline(), || {
                    std::thread::sleep(Duration::from_millis(50));
                    Ok(Artifact::Library { path: PathBuf::from("/z.so"), symbol: "s".into() })
                })
            }));
        }
        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }
        assert_eq!(cache.builds_started(), 1);
        assert_eq!(cache.max_concurrent_builds(), 1);
    }

    #[test]
    fn test_persistent_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let source = "return 7;";
        let fp = Fingerprint::compute(Language::Cpp, source);

        {
            let cache = CodeCache::with_store(dir.path(), 8).unwrap();
            let path = cache.artifact_path(&fp, Language::Cpp);
            cache
                .get_or_build(fp, Language::Cpp, source, far_deadline(), move || {
                    std::fs::write(&path, b"dylib-bytes").unwrap();
                    Ok(Artifact::Library {
                        path,
                        symbol: crate::polyglot::codegen::ENTRY_SYMBOL.to_string(),
                    })
                })
                .unwrap();
        }

        let cache = CodeCache::with_store(dir.path(), 8).unwrap();
        let loaded = cache
            .get_or_build(fp, Language::Cpp, source, far_deadline(), || {
                panic!("persisted artifact must not rebuild")
            })
            .unwrap();
        assert!(matches!(loaded, Artifact::Library { .. }));
        assert_eq!(cache.builds_started(), 0);
    }
}
