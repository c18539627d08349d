//! Cross-Language Marshaller
//!
//! Host values cross into foreign scopes on block entry and back on exit.
//! The boundary is a copy boundary: foreign-side mutation never propagates
//! back unless the block returns a rebuilt value in assignment position.
//!
//! Scalars take a dedicated fast path that avoids the generic tagged-variant
//! dispatch; containers recurse with cycle detection. Compiled languages
//! exchange values through the tagged little-endian wire format implemented
//! here and mirrored by the generated wrapper preludes:
//!
//! ```text
//! tag u8: 0 null | 1 bool | 2 int | 3 float | 4 string | 5 array | 6 dict | 7 struct
//! bool: u8            int: i64 LE        float: f64 LE
//! string: u32 LE length + UTF-8 bytes
//! array:  u32 LE count + values
//! dict:   u32 LE count + (string key, value) pairs
//! struct: string type name + u32 LE count + (string field, value) pairs
//! ```

use std::sync::Arc;

use indexmap::IndexMap;

use crate::value::{StructType, Value};

use super::block::Language;
use super::types::{ExecError, MarshalDirection};

/// Nesting depth cap for marshalled values.
pub const MAX_MARSHAL_DEPTH: usize = 64;

// =============================================================================
// FAST PATH
// =============================================================================

/// A primitive scalar, convertible without tagged dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
}

/// The scalar fast path: `Some` for primitives, `None` for anything that
/// needs the generic recursion.
pub fn as_scalar(value: &Value) -> Option<Scalar> {
    match value {
        Value::Null => Some(Scalar::Null),
        Value::Bool(b) => Some(Scalar::Bool(*b)),
        Value::Int(i) => Some(Scalar::Int(*i)),
        Value::Float(f) => Some(Scalar::Float(*f)),
        Value::String(s) => Some(Scalar::Str(s.clone())),
        _ => None,
    }
}

// =============================================================================
// OUTBOUND VALIDATION
// =============================================================================

/// Check that `value` may cross into `target` at all: functions and natives
/// never marshal, and foreign handles only re-enter their own language.
pub fn check_outbound(value: &Value, target: Language) -> Result<(), ExecError> {
    let mut on_stack = Vec::new();
    check_outbound_inner(value, target, &mut on_stack, 0)
}

fn check_outbound_inner(
    value: &Value,
    target: Language,
    on_stack: &mut Vec<usize>,
    depth: usize,
) -> Result<(), ExecError> {
    if depth > MAX_MARSHAL_DEPTH {
        return Err(ExecError::unmarshallable(
            MarshalDirection::HostToForeign,
            format!("value nested deeper than {}", MAX_MARSHAL_DEPTH),
        ));
    }
    if let Some(id) = value.identity() {
        if on_stack.contains(&id) {
            return Err(ExecError::unmarshallable(
                MarshalDirection::HostToForeign,
                "cyclic value graph",
            ));
        }
        on_stack.push(id);
    }
    let result = match value {
        Value::Function(_) | Value::Native(_) => Err(ExecError::unmarshallable(
            MarshalDirection::HostToForeign,
            "function",
        )),
        Value::Foreign(fv) if fv.language != target => Err(ExecError::unmarshallable(
            MarshalDirection::HostToForeign,
            format!("foreign {} value into {}", fv.language, target),
        )),
        Value::Array(items) => {
            let items = items.lock().expect("array lock poisoned");
            items
                .iter()
                .try_for_each(|v| check_outbound_inner(v, target, on_stack, depth + 1))
        }
        Value::Dict(entries) => {
            let entries = entries.lock().expect("dict lock poisoned");
            entries
                .values()
                .try_for_each(|v| check_outbound_inner(v, target, on_stack, depth + 1))
        }
        Value::Struct(s) => {
            let fields = s.fields.lock().expect("struct lock poisoned");
            fields
                .values()
                .try_for_each(|v| check_outbound_inner(v, target, on_stack, depth + 1))
        }
        _ => Ok(()),
    };
    if value.identity().is_some() {
        on_stack.pop();
    }
    result
}

// =============================================================================
// WIRE FORMAT
// =============================================================================

mod tag {
    pub const NULL: u8 = 0;
    pub const BOOL: u8 = 1;
    pub const INT: u8 = 2;
    pub const FLOAT: u8 = 3;
    pub const STRING: u8 = 4;
    pub const ARRAY: u8 = 5;
    pub const DICT: u8 = 6;
    pub const STRUCT: u8 = 7;
}

/// Encode a full binding set: `u32 count` then `(name, value)` pairs.
pub fn encode_bindings(bindings: &[(String, Value)]) -> Result<Vec<u8>, ExecError> {
    let mut out = Vec::new();
    write_u32(&mut out, bindings.len() as u32);
    for (name, value) in bindings {
        write_str(&mut out, name);
        encode_value(value, &mut out)?;
    }
    Ok(out)
}

/// Encode one value into `out`.
pub fn encode_value(value: &Value, out: &mut Vec<u8>) -> Result<(), ExecError> {
    let mut on_stack = Vec::new();
    encode_inner(value, out, &mut on_stack, 0)
}

fn encode_inner(
    value: &Value,
    out: &mut Vec<u8>,
    on_stack: &mut Vec<usize>,
    depth: usize,
) -> Result<(), ExecError> {
    if depth > MAX_MARSHAL_DEPTH {
        return Err(ExecError::unmarshallable(
            MarshalDirection::HostToForeign,
            format!("value nested deeper than {}", MAX_MARSHAL_DEPTH),
        ));
    }
    if let Some(id) = value.identity() {
        if on_stack.contains(&id) {
            return Err(ExecError::unmarshallable(
                MarshalDirection::HostToForeign,
                "cyclic value graph",
            ));
        }
        on_stack.push(id);
    }
    let result = (|| match value {
        Value::Null => {
            out.push(tag::NULL);
            Ok(())
        }
        Value::Bool(b) => {
            out.push(tag::BOOL);
            out.push(u8::from(*b));
            Ok(())
        }
        Value::Int(i) => {
            out.push(tag::INT);
            out.extend_from_slice(&i.to_le_bytes());
            Ok(())
        }
        Value::Float(f) => {
            out.push(tag::FLOAT);
            out.extend_from_slice(&f.to_le_bytes());
            Ok(())
        }
        Value::String(s) => {
            out.push(tag::STRING);
            write_str(out, s);
            Ok(())
        }
        Value::Array(items) => {
            let items = items.lock().expect("array lock poisoned");
            out.push(tag::ARRAY);
            write_u32(out, items.len() as u32);
            for item in items.iter() {
                encode_inner(item, out, on_stack, depth + 1)?;
            }
            Ok(())
        }
        Value::Dict(entries) => {
            let entries = entries.lock().expect("dict lock poisoned");
            out.push(tag::DICT);
            write_u32(out, entries.len() as u32);
            for (k, v) in entries.iter() {
                write_str(out, k);
                encode_inner(v, out, on_stack, depth + 1)?;
            }
            Ok(())
        }
        Value::Struct(s) => {
            let fields = s.fields.lock().expect("struct lock poisoned");
            out.push(tag::STRUCT);
            write_str(out, &s.ty.name);
            write_u32(out, fields.len() as u32);
            for (k, v) in fields.iter() {
                write_str(out, k);
                encode_inner(v, out, on_stack, depth + 1)?;
            }
            Ok(())
        }
        Value::Function(_) | Value::Native(_) => Err(ExecError::unmarshallable(
            MarshalDirection::HostToForeign,
            "function",
        )),
        Value::Foreign(fv) => Err(ExecError::unmarshallable(
            MarshalDirection::HostToForeign,
            format!("foreign {} value over the wire", fv.language),
        )),
    })();
    if value.identity().is_some() {
        on_stack.pop();
    }
    result
}

/// Decode one wire value from the start of `bytes`. Returns the value and
/// the number of bytes consumed.
pub fn decode_value(bytes: &[u8]) -> Result<(Value, usize), ExecError> {
    let mut cursor = Cursor { bytes, pos: 0 };
    let value = decode_inner(&mut cursor, 0)?;
    Ok((value, cursor.pos))
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ExecError> {
        if self.pos + n > self.bytes.len() {
            return Err(truncated());
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ExecError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, ExecError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn str(&mut self) -> Result<String, ExecError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| {
            ExecError::unmarshallable(MarshalDirection::ForeignToHost, "non-UTF-8 string")
        })
    }
}

fn decode_inner(cursor: &mut Cursor<'_>, depth: usize) -> Result<Value, ExecError> {
    if depth > MAX_MARSHAL_DEPTH {
        return Err(ExecError::unmarshallable(
            MarshalDirection::ForeignToHost,
            format!("value nested deeper than {}", MAX_MARSHAL_DEPTH),
        ));
    }
    match cursor.u8()? {
        tag::NULL => Ok(Value::Null),
        tag::BOOL => Ok(Value::Bool(cursor.u8()? != 0)),
        tag::INT => {
            let b = cursor.take(8)?;
            Ok(Value::Int(i64::from_le_bytes(b.try_into().expect("8 bytes"))))
        }
        tag::FLOAT => {
            let b = cursor.take(8)?;
            Ok(Value::Float(f64::from_le_bytes(b.try_into().expect("8 bytes"))))
        }
        tag::STRING => Ok(Value::String(Arc::from(cursor.str()?.as_str()))),
        tag::ARRAY => {
            let count = cursor.u32()? as usize;
            let mut items = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                items.push(decode_inner(cursor, depth + 1)?);
            }
            Ok(Value::array(items))
        }
        tag::DICT => {
            let count = cursor.u32()? as usize;
            let mut entries = IndexMap::with_capacity(count.min(4096));
            for _ in 0..count {
                let key = cursor.str()?;
                entries.insert(key, decode_inner(cursor, depth + 1)?);
            }
            Ok(Value::dict(entries))
        }
        tag::STRUCT => {
            let name = cursor.str()?;
            let count = cursor.u32()? as usize;
            let mut entries = IndexMap::with_capacity(count.min(4096));
            for _ in 0..count {
                let key = cursor.str()?;
                entries.insert(key, decode_inner(cursor, depth + 1)?);
            }
            // The wire carries the full field set, so the reconstructed type
            // pins those fields. Type identity is not preserved across the
            // boundary.
            let field_names: Vec<&str> = entries.keys().map(|k| k.as_str()).collect();
            let ty = StructType::new(&name, &field_names);
            Value::struct_value(ty, entries).map_err(|e| {
                ExecError::unmarshallable(MarshalDirection::ForeignToHost, e)
            })
        }
        other => Err(ExecError::unmarshallable(
            MarshalDirection::ForeignToHost,
            format!("unknown wire tag {}", other),
        )),
    }
}

fn truncated() -> ExecError {
    ExecError::unmarshallable(MarshalDirection::ForeignToHost, "truncated wire value")
}

fn write_u32(out: &mut Vec<u8>, n: u32) {
    out.extend_from_slice(&n.to_le_bytes());
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    write_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

// =============================================================================
// JSON BRIDGE (shell bindings, diagnostics)
// =============================================================================

/// Convert a value to JSON. Used for shell environment bindings and
/// diagnostics; functions and foreigns are unmarshallable here too.
pub fn value_to_json(value: &Value) -> Result<serde_json::Value, ExecError> {
    let mut on_stack = Vec::new();
    json_inner(value, &mut on_stack, 0)
}

fn json_inner(
    value: &Value,
    on_stack: &mut Vec<usize>,
    depth: usize,
) -> Result<serde_json::Value, ExecError> {
    if depth > MAX_MARSHAL_DEPTH {
        return Err(ExecError::unmarshallable(
            MarshalDirection::HostToForeign,
            format!("value nested deeper than {}", MAX_MARSHAL_DEPTH),
        ));
    }
    if let Some(id) = value.identity() {
        if on_stack.contains(&id) {
            return Err(ExecError::unmarshallable(
                MarshalDirection::HostToForeign,
                "cyclic value graph",
            ));
        }
        on_stack.push(id);
    }
    let result = (|| match value {
        Value::Null => Ok(serde_json::Value::Null),
        Value::Bool(b) => Ok(serde_json::Value::Bool(*b)),
        Value::Int(i) => Ok(serde_json::json!(*i)),
        Value::Float(f) => Ok(serde_json::json!(*f)),
        Value::String(s) => Ok(serde_json::Value::String(s.to_string())),
        Value::Array(items) => {
            let items = items.lock().expect("array lock poisoned");
            let mut out = Vec::with_capacity(items.len());
            for item in items.iter() {
                out.push(json_inner(item, on_stack, depth + 1)?);
            }
            Ok(serde_json::Value::Array(out))
        }
        Value::Dict(entries) => {
            let entries = entries.lock().expect("dict lock poisoned");
            let mut out = serde_json::Map::new();
            for (k, v) in entries.iter() {
                out.insert(k.clone(), json_inner(v, on_stack, depth + 1)?);
            }
            Ok(serde_json::Value::Object(out))
        }
        Value::Struct(s) => {
            let fields = s.fields.lock().expect("struct lock poisoned");
            let mut out = serde_json::Map::new();
            for (k, v) in fields.iter() {
                out.insert(k.clone(), json_inner(v, on_stack, depth + 1)?);
            }
            Ok(serde_json::Value::Object(out))
        }
        Value::Function(_) | Value::Native(_) => Err(ExecError::unmarshallable(
            MarshalDirection::HostToForeign,
            "function",
        )),
        Value::Foreign(fv) => Err(ExecError::unmarshallable(
            MarshalDirection::HostToForeign,
            format!("foreign {} value as JSON", fv.language),
        )),
    })();
    if value.identity().is_some() {
        on_stack.pop();
    }
    result
}

/// Convert a JSON value back into a host value.
pub fn json_to_value(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::string(s),
        serde_json::Value::Array(items) => {
            Value::array(items.iter().map(json_to_value).collect())
        }
        serde_json::Value::Object(entries) => {
            let mut out = IndexMap::with_capacity(entries.len());
            for (k, v) in entries {
                out.insert(k.clone(), json_to_value(v));
            }
            Value::dict(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ForeignValue;

    fn round_trip(value: &Value) -> Value {
        let mut bytes = Vec::new();
        encode_value(value, &mut bytes).unwrap();
        let (decoded, consumed) = decode_value(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        decoded
    }

    #[test]
    fn test_scalar_fast_path() {
        assert_eq!(as_scalar(&Value::Int(1)), Some(Scalar::Int(1)));
        assert_eq!(as_scalar(&Value::Null), Some(Scalar::Null));
        assert_eq!(as_scalar(&Value::array(vec![])), None);
    }

    #[test]
    fn test_wire_round_trip_scalars() {
        assert_eq!(round_trip(&Value::Null), Value::Null);
        assert_eq!(round_trip(&Value::Bool(true)), Value::Bool(true));
        assert_eq!(round_trip(&Value::Int(-42)), Value::Int(-42));
        assert_eq!(round_trip(&Value::Float(2.5)), Value::Float(2.5));
        assert_eq!(round_trip(&Value::string("héllo")), Value::string("héllo"));
    }

    #[test]
    fn test_wire_round_trip_containers() {
        let arr = Value::array(vec![Value::Int(1), Value::string("two")]);
        if let (Value::Array(a), Value::Array(b)) = (&arr, &round_trip(&arr)) {
            assert_eq!(*a.lock().unwrap(), *b.lock().unwrap());
        } else {
            panic!("expected arrays");
        }

        let mut entries = IndexMap::new();
        entries.insert("k".to_string(), Value::Int(7));
        let dict = Value::dict(entries);
        if let (Value::Dict(a), Value::Dict(b)) = (&dict, &round_trip(&dict)) {
            assert_eq!(*a.lock().unwrap(), *b.lock().unwrap());
        } else {
            panic!("expected dicts");
        }
    }

    #[test]
    fn test_functions_do_not_marshal() {
        fn noop(
            _out: &mut crate::interpreter::types::HostOutput,
            _args: &[Value],
        ) -> Result<Value, crate::errors::RuntimeError> {
            Ok(Value::Null)
        }
        let native = Value::Native(crate::value::NativeFunction { name: "noop", func: noop });
        assert!(check_outbound(&native, Language::Python).is_err());
        let mut bytes = Vec::new();
        assert!(encode_value(&native, &mut bytes).is_err());
    }

    #[test]
    fn test_foreign_identity_only_same_language() {
        let foreign = Value::Foreign(Arc::new(ForeignValue {
            language: Language::Python,
            executor_id: 1,
            handle: 1,
            repr: "<obj>".to_string(),
        }));
        assert!(check_outbound(&foreign, Language::Python).is_ok());
        assert!(check_outbound(&foreign, Language::JavaScript).is_err());
    }

    #[test]
    fn test_cycle_rejected() {
        let arr = Value::array(vec![]);
        if let Value::Array(items) = &arr {
            items.lock().unwrap().push(arr.clone());
        }
        let mut bytes = Vec::new();
        assert!(encode_value(&arr, &mut bytes).is_err());
        assert!(value_to_json(&arr).is_err());
    }

    #[test]
    fn test_truncated_wire_rejected() {
        let mut bytes = Vec::new();
        encode_value(&Value::Int(5), &mut bytes).unwrap();
        bytes.pop();
        assert!(decode_value(&bytes).is_err());
    }

    #[test]
    fn test_json_round_trip_primitives() {
        for v in [Value::Null, Value::Bool(false), Value::Int(3), Value::string("s")] {
            let json = value_to_json(&v).unwrap();
            assert_eq!(json_to_value(&json), v);
        }
    }
}
