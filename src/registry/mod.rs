//! Block registry: read-only lookup of reusable foreign-source blocks.

pub mod types;

pub use types::{BlockRecord, BlockRegistry};

use std::collections::HashMap;
use std::sync::Mutex;

use types::RecordDecl;

/// An in-process registry for embedders and tests.
#[derive(Default)]
pub struct InMemoryRegistry {
    records: Mutex<HashMap<String, BlockRecord>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: BlockRecord) {
        self.records
            .lock()
            .expect("registry lock poisoned")
            .insert(record.id.clone(), record);
    }

    /// Load records from a JSON array of record declarations.
    pub fn load_json(&self, text: &str) -> Result<usize, String> {
        let decls: Vec<RecordDecl> = serde_json::from_str(text).map_err(|e| e.to_string())?;
        let mut count = 0;
        for decl in decls {
            self.insert(decl.decode()?);
            count += 1;
        }
        Ok(count)
    }
}

impl BlockRegistry for InMemoryRegistry {
    fn lookup(&self, id: &str) -> Option<BlockRecord> {
        self.records.lock().expect("registry lock poisoned").get(id).cloned()
    }
}

/// A registry with nothing in it; every lookup is a definite absence.
pub struct EmptyRegistry;

impl BlockRegistry for EmptyRegistry {
    fn lookup(&self, _id: &str) -> Option<BlockRecord> {
        None
    }
}
