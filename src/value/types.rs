//! Runtime Value Types
//!
//! Tagged-variant values with reference semantics for compound types.
//! Arrays, dicts and structs are shared handles: mutation through any alias
//! is visible to every other alias. Detaching requires the deep-copy
//! snapshot in [`crate::value::snapshot`].
//!
//! All variants are `Send`, so snapshots can cross into scheduler workers.

use std::fmt;
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;

use crate::ast::types::{Param, Stmt};
use crate::errors::RuntimeError;
use crate::interpreter::environment::Env;
use crate::interpreter::types::HostOutput;
use crate::polyglot::block::Language;

/// A Medley runtime value.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// UTF-8, immutable, reference-shared
    String(Arc<str>),
    /// Ordered, mutable, reference-shared
    Array(Arc<Mutex<Vec<Value>>>),
    /// String-keyed, reference-shared, insertion order preserved when displayed
    Dict(Arc<Mutex<IndexMap<String, Value>>>),
    /// Typed record with a fixed field set
    Struct(Arc<StructValue>),
    /// User function with lexical closure
    Function(Arc<FunctionValue>),
    /// Host-implemented callable
    Native(NativeFunction),
    /// Reference to a foreign-language object with no faithful host mapping
    Foreign(Arc<ForeignValue>),
}

/// A struct type: the field set is fixed at definition time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructType {
    pub name: String,
    pub fields: Vec<String>,
}

impl StructType {
    pub fn new(name: &str, fields: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        })
    }
}

/// A struct instance. Field values are interior-mutable; the field *set* is
/// fixed by the type.
#[derive(Debug)]
pub struct StructValue {
    pub ty: Arc<StructType>,
    pub fields: Mutex<IndexMap<String, Value>>,
}

/// A user-defined function value.
#[derive(Debug)]
pub struct FunctionValue {
    pub name: Option<String>,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
    /// Captured definition environment (lexical scoping)
    pub env: Env,
    /// Set when the function wraps a registry block; calling it requires
    /// the BLOCK_CALL capability.
    pub block_id: Option<String>,
}

/// A host-implemented callable.
#[derive(Clone, Copy)]
pub struct NativeFunction {
    pub name: &'static str,
    pub func: fn(&mut HostOutput, &[Value]) -> Result<Value, RuntimeError>,
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeFunction({})", self.name)
    }
}

/// A handle to a value that lives inside one executor instance.
///
/// The handle resolves only in the executor instance that minted it;
/// re-marshalling into any other executor fails.
#[derive(Debug, Clone)]
pub struct ForeignValue {
    pub language: Language,
    /// Instance id of the minting executor
    pub executor_id: u64,
    /// Opaque handle into that executor's object table
    pub handle: u64,
    /// Best-effort display form captured at mint time
    pub repr: String,
}

// =============================================================================
// CONSTRUCTION
// =============================================================================

impl Value {
    pub fn string(s: &str) -> Self {
        Value::String(Arc::from(s))
    }

    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Arc::new(Mutex::new(items)))
    }

    pub fn dict(entries: IndexMap<String, Value>) -> Self {
        Value::Dict(Arc::new(Mutex::new(entries)))
    }

    pub fn empty_dict() -> Self {
        Value::dict(IndexMap::new())
    }

    /// Construct a struct value, checking the field set against the type.
    pub fn struct_value(
        ty: Arc<StructType>,
        fields: IndexMap<String, Value>,
    ) -> Result<Self, String> {
        for name in fields.keys() {
            if !ty.fields.contains(name) {
                return Err(format!("struct {} has no field '{}'", ty.name, name));
            }
        }
        for name in &ty.fields {
            if !fields.contains_key(name) {
                return Err(format!("struct {} literal missing field '{}'", ty.name, name));
            }
        }
        // Store in declared order regardless of literal order.
        let mut ordered = IndexMap::with_capacity(ty.fields.len());
        for name in &ty.fields {
            ordered.insert(name.clone(), fields.get(name).cloned().unwrap_or(Value::Null));
        }
        Ok(Value::Struct(Arc::new(StructValue { ty, fields: Mutex::new(ordered) })))
    }

    /// The type name used in diagnostics and by the `type_of` native.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Dict(_) => "dict",
            Value::Struct(_) => "struct",
            Value::Function(_) => "function",
            Value::Native(_) => "function",
            Value::Foreign(_) => "foreign",
        }
    }

    /// Truthiness used by conditions: null and false are false, zero and the
    /// empty string are false, everything else is true.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    /// Identity pointer for cycle detection over compound values.
    pub(crate) fn identity(&self) -> Option<usize> {
        match self {
            Value::Array(a) => Some(Arc::as_ptr(a) as usize),
            Value::Dict(d) => Some(Arc::as_ptr(d) as usize),
            Value::Struct(s) => Some(Arc::as_ptr(s) as usize),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(Arc::from(s.as_str()))
    }
}

// =============================================================================
// EQUALITY
// =============================================================================

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            // Mixed numerics compare numerically
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (Value::String(a), Value::String(b)) => a == b,
            // Compound values have reference semantics; equality is identity
            (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => Arc::ptr_eq(a, b),
            (Value::Struct(a), Value::Struct(b)) => Arc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => a.func as usize == b.func as usize,
            (Value::Foreign(a), Value::Foreign(b)) => {
                a.language == b.language && a.executor_id == b.executor_id && a.handle == b.handle
            }
            _ => false,
        }
    }
}

// =============================================================================
// DISPLAY
// =============================================================================

// Display needs cycle protection: a dict can (indirectly) contain itself.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut visited = Vec::new();
        fmt_value(f, self, false, &mut visited)
    }
}

fn fmt_value(
    f: &mut fmt::Formatter<'_>,
    value: &Value,
    quote_strings: bool,
    visited: &mut Vec<usize>,
) -> fmt::Result {
    if let Some(id) = value.identity() {
        if visited.contains(&id) {
            return write!(f, "...");
        }
        visited.push(id);
    }
    let result = match value {
        Value::Null => write!(f, "null"),
        Value::Bool(b) => write!(f, "{}", b),
        Value::Int(i) => write!(f, "{}", i),
        Value::Float(x) => {
            if x.is_finite() && x.fract() == 0.0 && x.abs() < 1e15 {
                write!(f, "{:.1}", x)
            } else {
                write!(f, "{}", x)
            }
        }
        Value::String(s) => {
            if quote_strings {
                write!(f, "{:?}", s.as_ref())
            } else {
                write!(f, "{}", s)
            }
        }
        Value::Array(items) => {
            let items = items.lock().expect("array lock poisoned");
            write!(f, "[")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                fmt_value(f, item, true, visited)?;
            }
            write!(f, "]")
        }
        Value::Dict(entries) => {
            let entries = entries.lock().expect("dict lock poisoned");
            write!(f, "{{")?;
            for (i, (k, v)) in entries.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{:?}: ", k)?;
                fmt_value(f, v, true, visited)?;
            }
            write!(f, "}}")
        }
        Value::Struct(s) => {
            let fields = s.fields.lock().expect("struct lock poisoned");
            write!(f, "{} {{", s.ty.name)?;
            for (i, (k, v)) in fields.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, " {}: ", k)?;
                fmt_value(f, v, true, visited)?;
            }
            write!(f, " }}")
        }
        Value::Function(func) => match &func.name {
            Some(name) => write!(f, "<fn {}>", name),
            None => write!(f, "<fn>"),
        },
        Value::Native(n) => write!(f, "<native {}>", n.name),
        Value::Foreign(fv) => write!(f, "<foreign {} {}>", fv.language, fv.repr),
    };
    if value.identity().is_some() {
        visited.pop();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_equality() {
        assert_eq!(Value::Int(3), Value::Int(3));
        assert_eq!(Value::Int(3), Value::Float(3.0));
        assert_ne!(Value::Int(3), Value::Int(4));
        assert_eq!(Value::string("a"), Value::string("a"));
    }

    #[test]
    fn test_compound_equality_is_identity() {
        let a = Value::array(vec![Value::Int(1)]);
        let b = Value::array(vec![Value::Int(1)]);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_shared_mutation_visible_through_alias() {
        let a = Value::array(vec![Value::Int(1)]);
        let alias = a.clone();
        if let Value::Array(items) = &a {
            items.lock().unwrap().push(Value::Int(2));
        }
        if let Value::Array(items) = &alias {
            assert_eq!(items.lock().unwrap().len(), 2);
        }
    }

    #[test]
    fn test_struct_fixed_field_set() {
        let ty = StructType::new("Point", &["x", "y"]);
        let mut fields = IndexMap::new();
        fields.insert("x".to_string(), Value::Int(1));
        fields.insert("y".to_string(), Value::Int(2));
        assert!(Value::struct_value(ty.clone(), fields.clone()).is_ok());

        fields.insert("z".to_string(), Value::Int(3));
        assert!(Value::struct_value(ty.clone(), fields).is_err());

        let mut missing = IndexMap::new();
        missing.insert("x".to_string(), Value::Int(1));
        assert!(Value::struct_value(ty, missing).is_err());
    }

    #[test]
    fn test_display_forms() {
        assert_eq!(Value::Null.to_string(), "null");
        assert_eq!(Value::Float(3.0).to_string(), "3.0");
        assert_eq!(Value::Float(2.5).to_string(), "2.5");
        assert_eq!(Value::string("hi").to_string(), "hi");
        let arr = Value::array(vec![Value::Int(1), Value::string("s")]);
        assert_eq!(arr.to_string(), "[1, \"s\"]");
    }

    #[test]
    fn test_display_dict_insertion_order() {
        let mut m = IndexMap::new();
        m.insert("b".to_string(), Value::Int(2));
        m.insert("a".to_string(), Value::Int(1));
        assert_eq!(Value::dict(m).to_string(), "{\"b\": 2, \"a\": 1}");
    }

    #[test]
    fn test_display_cycle_does_not_hang() {
        let arr = Value::array(vec![]);
        if let Value::Array(items) = &arr {
            items.lock().unwrap().push(arr.clone());
        }
        assert_eq!(arr.to_string(), "[...]");
    }
}
