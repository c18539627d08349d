//! Environments
//!
//! Lexically-scoped name → value bindings with chained parent lookup.
//! Environments are shared handles: closures capture the environment they
//! were defined in, and child scopes keep their parent alive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::value::Value;

struct EnvData {
    vars: HashMap<String, Value>,
    parent: Option<Env>,
}

/// A lexical scope handle.
#[derive(Clone)]
pub struct Env(Arc<Mutex<EnvData>>);

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Env")
    }
}

impl Env {
    /// A fresh root scope.
    pub fn root() -> Self {
        Env(Arc::new(Mutex::new(EnvData { vars: HashMap::new(), parent: None })))
    }

    /// A child scope of `self`.
    pub fn child(&self) -> Self {
        Env(Arc::new(Mutex::new(EnvData {
            vars: HashMap::new(),
            parent: Some(self.clone()),
        })))
    }

    /// Look a name up, walking the parent chain.
    pub fn get(&self, name: &str) -> Option<Value> {
        let data = self.0.lock().expect("env lock poisoned");
        if let Some(v) = data.vars.get(name) {
            return Some(v.clone());
        }
        data.parent.as_ref().and_then(|p| p.get(name))
    }

    /// Declare `name` in this scope, shadowing any outer binding.
    pub fn declare(&self, name: &str, value: Value) {
        self.0
            .lock()
            .expect("env lock poisoned")
            .vars
            .insert(name.to_string(), value);
    }

    /// Assign to the innermost scope that already has `name`.
    /// Returns false when no scope in the chain binds it.
    pub fn assign(&self, name: &str, value: Value) -> bool {
        let mut data = self.0.lock().expect("env lock poisoned");
        if let Some(slot) = data.vars.get_mut(name) {
            *slot = value;
            return true;
        }
        match &data.parent {
            Some(parent) => parent.assign(name, value),
            None => false,
        }
    }

    /// True when any scope in the chain binds `name`.
    pub fn has(&self, name: &str) -> bool {
        let data = self.0.lock().expect("env lock poisoned");
        data.vars.contains_key(name) || data.parent.as_ref().is_some_and(|p| p.has(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_walks_chain() {
        let root = Env::root();
        root.declare("x", Value::Int(1));
        let child = root.child();
        assert_eq!(child.get("x"), Some(Value::Int(1)));
        assert_eq!(child.get("y"), None);
    }

    #[test]
    fn test_declare_shadows() {
        let root = Env::root();
        root.declare("x", Value::Int(1));
        let child = root.child();
        child.declare("x", Value::Int(2));
        assert_eq!(child.get("x"), Some(Value::Int(2)));
        assert_eq!(root.get("x"), Some(Value::Int(1)));
    }

    #[test]
    fn test_assign_binds_innermost_existing() {
        let root = Env::root();
        root.declare("x", Value::Int(1));
        let child = root.child();
        assert!(child.assign("x", Value::Int(5)));
        assert_eq!(root.get("x"), Some(Value::Int(5)));
        assert!(!child.assign("nope", Value::Null));
    }

    #[test]
    fn test_closure_keeps_parent_alive() {
        let captured = {
            let root = Env::root();
            root.declare("x", Value::Int(7));
            root.child()
        };
        assert_eq!(captured.get("x"), Some(Value::Int(7)));
    }
}
