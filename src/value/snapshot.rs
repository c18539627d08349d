//! Value Snapshots
//!
//! Deep copies of value graphs, used to isolate parallel workers from shared
//! mutation. Compound values are detached (fresh handles); strings, functions
//! and foreign handles are immutable and stay shared.
//!
//! Cyclic graphs are rejected: the walk keeps a pointer-identity stack and
//! refuses to copy a value that is already on it. Callers surface the
//! rejection as a marshalling error.

use indexmap::IndexMap;
use std::sync::{Arc, Mutex};

use super::types::{StructValue, Value};

/// Maximum nesting depth a snapshot will follow.
pub const MAX_SNAPSHOT_DEPTH: usize = 64;

/// Why a snapshot was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("value graph contains a reference cycle")]
    Cycle,
    #[error("value graph exceeds depth {0}")]
    TooDeep(usize),
}

/// Deep-copy `value`, detaching every array/dict/struct reachable from it.
pub fn deep_copy(value: &Value) -> Result<Value, SnapshotError> {
    let mut on_stack = Vec::new();
    copy_inner(value, &mut on_stack, 0)
}

fn copy_inner(
    value: &Value,
    on_stack: &mut Vec<usize>,
    depth: usize,
) -> Result<Value, SnapshotError> {
    if depth > MAX_SNAPSHOT_DEPTH {
        return Err(SnapshotError::TooDeep(MAX_SNAPSHOT_DEPTH));
    }
    if let Some(id) = value.identity() {
        if on_stack.contains(&id) {
            return Err(SnapshotError::Cycle);
        }
        on_stack.push(id);
    }
    let copied = match value {
        Value::Null
        | Value::Bool(_)
        | Value::Int(_)
        | Value::Float(_)
        | Value::String(_)
        | Value::Function(_)
        | Value::Native(_)
        | Value::Foreign(_) => value.clone(),
        Value::Array(items) => {
            let items = items.lock().expect("array lock poisoned");
            let mut out = Vec::with_capacity(items.len());
            for item in items.iter() {
                out.push(copy_inner(item, on_stack, depth + 1)?);
            }
            Value::array(out)
        }
        Value::Dict(entries) => {
            let entries = entries.lock().expect("dict lock poisoned");
            let mut out = IndexMap::with_capacity(entries.len());
            for (k, v) in entries.iter() {
                out.insert(k.clone(), copy_inner(v, on_stack, depth + 1)?);
            }
            Value::dict(out)
        }
        Value::Struct(s) => {
            let fields = s.fields.lock().expect("struct lock poisoned");
            let mut out = IndexMap::with_capacity(fields.len());
            for (k, v) in fields.iter() {
                out.insert(k.clone(), copy_inner(v, on_stack, depth + 1)?);
            }
            Value::Struct(Arc::new(StructValue {
                ty: s.ty.clone(),
                fields: Mutex::new(out),
            }))
        }
    };
    if value.identity().is_some() {
        on_stack.pop();
    }
    Ok(copied)
}
