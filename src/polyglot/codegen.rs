//! Compiled-Language Wrapper Synthesis
//!
//! C++, Rust and C# fragments are not complete programs; each one is wrapped
//! in a synthesized entry point that
//! (a) receives marshalled arguments through a generated C ABI,
//! (b) captures the fragment's explicit `return` value, and
//! (c) writes the result back in the wire format of
//!     [`crate::polyglot::marshal`] into a buffer the host frees through the
//!     exported `medley_free`.
//!
//! Fragments see their bound variables as the prelude's dynamic value type.
//! A fragment that already exports `medley_entry` is compiled verbatim.
//! Leading `#include` / `use` / `using` lines are hoisted above the wrapper
//! so the fragment may pull in extra modules; the standard set is injected
//! by the prelude whether or not the fragment mentions it.

use regex_lite::Regex;

use super::block::Language;
use super::types::{ExecError, MarshalDirection};

/// The C-ABI entry point every generated library exports.
///
/// ```c
/// int32_t medley_entry(const uint8_t* in, size_t in_len,
///                      uint8_t** out, size_t* out_len);
/// ```
/// Return 0: `out` holds a wire-encoded value. Return 1: `out` holds a UTF-8
/// error message. The buffer is released with `medley_free`.
pub const ENTRY_SYMBOL: &str = "medley_entry";

/// Releases a buffer returned by `medley_entry`.
pub const FREE_SYMBOL: &str = "medley_free";

/// A synthesized translation unit ready for the toolchain.
#[derive(Debug, Clone)]
pub struct SynthesizedSource {
    pub code: String,
    /// The file name the toolchain expects (extension matters).
    pub file_name: &'static str,
}

/// Wrap `fragment` for `language`, binding `bound` variable names.
pub fn synthesize(
    language: Language,
    fragment: &str,
    bound: &[String],
) -> Result<SynthesizedSource, ExecError> {
    match language {
        Language::Cpp => Ok(synthesize_cpp(fragment, bound)),
        Language::Rust => Ok(synthesize_rust(fragment, bound)),
        Language::CSharp => Ok(synthesize_csharp(fragment, bound)),
        other => Err(ExecError::Internal {
            message: format!("no wrapper synthesis for {}", other),
        }),
    }
}

/// True when the fragment already defines the entry symbol itself.
pub fn has_custom_entry(fragment: &str) -> bool {
    let re = Regex::new(r"\bmedley_entry\b").expect("static regex");
    re.is_match(fragment)
}

/// Split a fragment into hoisted import lines and the remaining body.
fn hoist_imports<'a>(fragment: &'a str, prefixes: &[&str]) -> (Vec<&'a str>, Vec<&'a str>) {
    let mut imports = Vec::new();
    let mut body = Vec::new();
    for line in fragment.lines() {
        let trimmed = line.trim_start();
        if prefixes.iter().any(|p| trimmed.starts_with(p)) {
            imports.push(line);
        } else {
            body.push(line);
        }
    }
    (imports, body)
}

// =============================================================================
// C++
// =============================================================================

const CPP_PRELUDE: &str = r#"
#include <cstdint>
#include <cstdlib>
#include <cstring>
#include <string>
#include <vector>
#include <utility>
#include <stdexcept>

namespace medley {

struct Value {
    enum Kind { NUL, BOOL, INT, FLT, STR, ARR, DICT } kind = NUL;
    bool b = false;
    int64_t i = 0;
    double f = 0.0;
    std::string s;
    std::vector<Value> items;
    std::vector<std::pair<std::string, Value>> entries;

    Value() {}
    Value(bool v) : kind(BOOL), b(v) {}
    Value(int v) : kind(INT), i(v) {}
    Value(int64_t v) : kind(INT), i(v) {}
    Value(double v) : kind(FLT), f(v) {}
    Value(const char* v) : kind(STR), s(v) {}
    Value(const std::string& v) : kind(STR), s(v) {}
    Value(std::vector<Value> v) : kind(ARR), items(std::move(v)) {}

    bool is_null() const { return kind == NUL; }
    bool as_bool() const { return kind == BOOL ? b : i != 0; }
    int64_t as_int() const {
        if (kind == INT) return i;
        if (kind == FLT) return (int64_t)f;
        if (kind == BOOL) return b ? 1 : 0;
        throw std::runtime_error("value is not an int");
    }
    double as_float() const {
        if (kind == FLT) return f;
        if (kind == INT) return (double)i;
        throw std::runtime_error("value is not a float");
    }
    const std::string& as_str() const {
        if (kind != STR) throw std::runtime_error("value is not a string");
        return s;
    }
    size_t size() const {
        if (kind == ARR) return items.size();
        if (kind == DICT) return entries.size();
        throw std::runtime_error("value has no size");
    }
    Value& operator[](size_t idx) {
        if (kind != ARR) throw std::runtime_error("value is not an array");
        return items.at(idx);
    }
    Value& operator[](const std::string& key) {
        if (kind != DICT) throw std::runtime_error("value is not a dict");
        for (auto& e : entries) if (e.first == key) return e.second;
        throw std::runtime_error("dict has no key '" + key + "'");
    }
    void push(Value v) {
        kind = ARR;
        items.push_back(std::move(v));
    }
    void set(const std::string& key, Value v) {
        kind = DICT;
        for (auto& e : entries) {
            if (e.first == key) { e.second = std::move(v); return; }
        }
        entries.emplace_back(key, std::move(v));
    }
};

inline const uint8_t* need(const uint8_t* p, const uint8_t* end, size_t n) {
    if (p + n > end) throw std::runtime_error("truncated wire value");
    return p;
}

inline uint32_t read_u32(const uint8_t*& p, const uint8_t* end) {
    need(p, end, 4);
    uint32_t v;
    std::memcpy(&v, p, 4);
    p += 4;
    return v;
}

inline std::string read_str(const uint8_t*& p, const uint8_t* end) {
    uint32_t len = read_u32(p, end);
    need(p, end, len);
    std::string s((const char*)p, len);
    p += len;
    return s;
}

inline Value decode(const uint8_t*& p, const uint8_t* end) {
    need(p, end, 1);
    uint8_t tag = *p++;
    Value v;
    switch (tag) {
    case 0: return v;
    case 1: need(p, end, 1); v.kind = Value::BOOL; v.b = *p++ != 0; return v;
    case 2: need(p, end, 8); v.kind = Value::INT; std::memcpy(&v.i, p, 8); p += 8; return v;
    case 3: need(p, end, 8); v.kind = Value::FLT; std::memcpy(&v.f, p, 8); p += 8; return v;
    case 4: v.kind = Value::STR; v.s = read_str(p, end); return v;
    case 5: {
        v.kind = Value::ARR;
        uint32_t count = read_u32(p, end);
        for (uint32_t n = 0; n < count; n++) v.items.push_back(decode(p, end));
        return v;
    }
    case 6: case 7: {
        if (tag == 7) read_str(p, end); // struct type name, not kept
        v.kind = Value::DICT;
        uint32_t count = read_u32(p, end);
        for (uint32_t n = 0; n < count; n++) {
            std::string key = read_str(p, end);
            v.entries.emplace_back(key, decode(p, end));
        }
        return v;
    }
    default: throw std::runtime_error("unknown wire tag");
    }
}

inline void write_u32(std::vector<uint8_t>& out, uint32_t v) {
    const uint8_t* p = (const uint8_t*)&v;
    out.insert(out.end(), p, p + 4);
}

inline void write_str(std::vector<uint8_t>& out, const std::string& s) {
    write_u32(out, (uint32_t)s.size());
    out.insert(out.end(), s.begin(), s.end());
}

inline void encode(const Value& v, std::vector<uint8_t>& out) {
    switch (v.kind) {
    case Value::NUL: out.push_back(0); break;
    case Value::BOOL: out.push_back(1); out.push_back(v.b ? 1 : 0); break;
    case Value::INT: {
        out.push_back(2);
        const uint8_t* p = (const uint8_t*)&v.i;
        out.insert(out.end(), p, p + 8);
        break;
    }
    case Value::FLT: {
        out.push_back(3);
        const uint8_t* p = (const uint8_t*)&v.f;
        out.insert(out.end(), p, p + 8);
        break;
    }
    case Value::STR: out.push_back(4); write_str(out, v.s); break;
    case Value::ARR:
        out.push_back(5);
        write_u32(out, (uint32_t)v.items.size());
        for (const auto& item : v.items) encode(item, out);
        break;
    case Value::DICT:
        out.push_back(6);
        write_u32(out, (uint32_t)v.entries.size());
        for (const auto& e : v.entries) { write_str(out, e.first); encode(e.second, out); }
        break;
    }
}

inline uint8_t* to_buffer(const std::vector<uint8_t>& bytes, size_t* out_len) {
    uint8_t* buf = (uint8_t*)std::malloc(bytes.size() ? bytes.size() : 1);
    std::memcpy(buf, bytes.data(), bytes.size());
    *out_len = bytes.size();
    return buf;
}

} // namespace medley

extern "C" void medley_free(uint8_t* p) { std::free(p); }
"#;

fn synthesize_cpp(fragment: &str, bound: &[String]) -> SynthesizedSource {
    if has_custom_entry(fragment) {
        return SynthesizedSource { code: fragment.to_string(), file_name: "block.cpp" };
    }
    let (imports, body) = hoist_imports(fragment, &["#include"]);

    let params: Vec<String> =
        bound.iter().map(|name| format!("medley::Value {}", name)).collect();
    let mut code = String::new();
    code.push_str(CPP_PRELUDE);
    for line in imports {
        code.push_str(line);
        code.push('\n');
    }
    code.push_str(&format!(
        "\nstatic medley::Value medley_user({}) {{\n",
        params.join(", ")
    ));
    for line in body {
        code.push_str("    ");
        code.push_str(line);
        code.push('\n');
    }
    // No explicit return: the block's value is null.
    code.push_str("    return medley::Value();\n}\n");

    code.push_str(
        "\nextern \"C\" int32_t medley_entry(const uint8_t* in, size_t in_len,\n\
         \x20                                uint8_t** out, size_t* out_len) {\n\
         \x20   try {\n\
         \x20       const uint8_t* p = in;\n\
         \x20       const uint8_t* end = in + in_len;\n\
         \x20       uint32_t count = medley::read_u32(p, end);\n",
    );
    for (idx, name) in bound.iter().enumerate() {
        code.push_str(&format!(
            "        if (count <= {idx}) throw std::runtime_error(\"missing binding '{name}'\");\n\
             \x20       medley::read_str(p, end);\n\
             \x20       medley::Value arg_{idx} = medley::decode(p, end);\n"
        ));
    }
    let args: Vec<String> = (0..bound.len()).map(|i| format!("arg_{}", i)).collect();
    code.push_str(&format!(
        "        medley::Value result = medley_user({});\n\
         \x20       std::vector<uint8_t> bytes;\n\
         \x20       medley::encode(result, bytes);\n\
         \x20       *out = medley::to_buffer(bytes, out_len);\n\
         \x20       return 0;\n\
         \x20   }} catch (const std::exception& e) {{\n\
         \x20       std::string msg = e.what();\n\
         \x20       std::vector<uint8_t> bytes(msg.begin(), msg.end());\n\
         \x20       *out = medley::to_buffer(bytes, out_len);\n\
         \x20       return 1;\n\
         \x20   }}\n\
         }}\n",
        args.join(", ")
    ));
    SynthesizedSource { code, file_name: "block.cpp" }
}

// =============================================================================
// RUST
// =============================================================================

const RUST_PRELUDE: &str = r#"
#![allow(dead_code, unused_imports, unused_macros)]

use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub enum MValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<MValue>),
    Dict(Vec<(String, MValue)>),
}

impl MValue {
    pub fn as_int(&self) -> i64 {
        match self {
            MValue::Int(i) => *i,
            MValue::Float(f) => *f as i64,
            MValue::Bool(b) => *b as i64,
            other => panic!("value is not an int: {:?}", other),
        }
    }
    pub fn as_float(&self) -> f64 {
        match self {
            MValue::Float(f) => *f,
            MValue::Int(i) => *i as f64,
            other => panic!("value is not a float: {:?}", other),
        }
    }
    pub fn as_str(&self) -> &str {
        match self {
            MValue::Str(s) => s,
            other => panic!("value is not a string: {:?}", other),
        }
    }
    pub fn as_bool(&self) -> bool {
        match self {
            MValue::Bool(b) => *b,
            MValue::Int(i) => *i != 0,
            other => panic!("value is not a bool: {:?}", other),
        }
    }
    pub fn items(&self) -> &[MValue] {
        match self {
            MValue::Array(v) => v,
            other => panic!("value is not an array: {:?}", other),
        }
    }
    pub fn get(&self, key: &str) -> &MValue {
        match self {
            MValue::Dict(entries) => entries
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v)
                .unwrap_or_else(|| panic!("dict has no key '{}'", key)),
            other => panic!("value is not a dict: {:?}", other),
        }
    }
}

impl From<()> for MValue { fn from(_: ()) -> Self { MValue::Null } }
impl From<bool> for MValue { fn from(v: bool) -> Self { MValue::Bool(v) } }
impl From<i32> for MValue { fn from(v: i32) -> Self { MValue::Int(v as i64) } }
impl From<i64> for MValue { fn from(v: i64) -> Self { MValue::Int(v) } }
impl From<f64> for MValue { fn from(v: f64) -> Self { MValue::Float(v) } }
impl From<&str> for MValue { fn from(v: &str) -> Self { MValue::Str(v.to_string()) } }
impl From<String> for MValue { fn from(v: String) -> Self { MValue::Str(v) } }
impl From<Vec<MValue>> for MValue { fn from(v: Vec<MValue>) -> Self { MValue::Array(v) } }

fn rd_u32(bytes: &[u8], pos: &mut usize) -> u32 {
    let v = u32::from_le_bytes(bytes[*pos..*pos + 4].try_into().unwrap());
    *pos += 4;
    v
}

fn rd_str(bytes: &[u8], pos: &mut usize) -> String {
    let len = rd_u32(bytes, pos) as usize;
    let s = String::from_utf8(bytes[*pos..*pos + len].to_vec()).unwrap();
    *pos += len;
    s
}

fn decode(bytes: &[u8], pos: &mut usize) -> MValue {
    let tag = bytes[*pos];
    *pos += 1;
    match tag {
        0 => MValue::Null,
        1 => {
            let b = bytes[*pos] != 0;
            *pos += 1;
            MValue::Bool(b)
        }
        2 => {
            let v = i64::from_le_bytes(bytes[*pos..*pos + 8].try_into().unwrap());
            *pos += 8;
            MValue::Int(v)
        }
        3 => {
            let v = f64::from_le_bytes(bytes[*pos..*pos + 8].try_into().unwrap());
            *pos += 8;
            MValue::Float(v)
        }
        4 => MValue::Str(rd_str(bytes, pos)),
        5 => {
            let count = rd_u32(bytes, pos);
            MValue::Array((0..count).map(|_| decode(bytes, pos)).collect())
        }
        6 | 7 => {
            if tag == 7 {
                rd_str(bytes, pos); // struct type name, not kept
            }
            let count = rd_u32(bytes, pos);
            MValue::Dict(
                (0..count)
                    .map(|_| {
                        let key = rd_str(bytes, pos);
                        (key, decode(bytes, pos))
                    })
                    .collect(),
            )
        }
        other => panic!("unknown wire tag {}", other),
    }
}

fn wr_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn encode(value: &MValue, out: &mut Vec<u8>) {
    match value {
        MValue::Null => out.push(0),
        MValue::Bool(b) => {
            out.push(1);
            out.push(*b as u8);
        }
        MValue::Int(i) => {
            out.push(2);
            out.extend_from_slice(&i.to_le_bytes());
        }
        MValue::Float(f) => {
            out.push(3);
            out.extend_from_slice(&f.to_le_bytes());
        }
        MValue::Str(s) => {
            out.push(4);
            wr_str(out, s);
        }
        MValue::Array(items) => {
            out.push(5);
            out.extend_from_slice(&(items.len() as u32).to_le_bytes());
            for item in items {
                encode(item, out);
            }
        }
        MValue::Dict(entries) => {
            out.push(6);
            out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
            for (k, v) in entries {
                wr_str(out, k);
                encode(v, out);
            }
        }
    }
}

fn to_buffer(bytes: Vec<u8>, out: *mut *mut u8, out_len: *mut usize) {
    let mut boxed = bytes.into_boxed_slice();
    unsafe {
        *out = boxed.as_mut_ptr();
        *out_len = boxed.len();
    }
    std::mem::forget(boxed);
}

#[no_mangle]
pub extern "C" fn medley_free(p: *mut u8) {
    if !p.is_null() {
        unsafe {
            drop(Box::from_raw(p));
        }
    }
}
"#;

fn synthesize_rust(fragment: &str, bound: &[String]) -> SynthesizedSource {
    if has_custom_entry(fragment) {
        return SynthesizedSource { code: fragment.to_string(), file_name: "block.rs" };
    }
    let (imports, body) = hoist_imports(fragment, &["use "]);

    let params: Vec<String> = bound.iter().map(|name| format!("{}: MValue", name)).collect();
    let mut code = String::new();
    code.push_str(RUST_PRELUDE);
    for line in imports {
        code.push_str(line);
        code.push('\n');
    }
    code.push_str(&format!(
        "\n#[allow(unused_variables)]\nfn medley_user({}) -> MValue {{\n",
        params.join(", ")
    ));
    for line in body {
        code.push_str("    ");
        code.push_str(line);
        code.push('\n');
    }
    // Falling off the end yields null.
    code.push_str("    MValue::Null\n}\n");

    let mut decode_lines = String::new();
    for (idx, _) in bound.iter().enumerate() {
        decode_lines.push_str(&format!(
            "        let _ = rd_str(input, &mut pos);\n\
             \x20       let arg_{idx} = decode(input, &mut pos);\n"
        ));
    }
    let args: Vec<String> = (0..bound.len()).map(|i| format!("arg_{}", i)).collect();
    code.push_str(&format!(
        r#"
#[no_mangle]
pub extern "C" fn medley_entry(
    in_ptr: *const u8,
    in_len: usize,
    out: *mut *mut u8,
    out_len: *mut usize,
) -> i32 {{
    let input = unsafe {{ std::slice::from_raw_parts(in_ptr, in_len) }};
    let run = std::panic::catch_unwind(|| {{
        let mut pos = 0usize;
        let count = rd_u32(input, &mut pos);
        if (count as usize) < {arity} {{
            panic!("expected {arity} bindings, got {{}}", count);
        }}
{decode_lines}        medley_user({args})
    }});
    match run {{
        Ok(value) => {{
            let mut bytes = Vec::new();
            encode(&value, &mut bytes);
            to_buffer(bytes, out, out_len);
            0
        }}
        Err(panic) => {{
            let msg = if let Some(s) = panic.downcast_ref::<String>() {{
                s.clone()
            }} else if let Some(s) = panic.downcast_ref::<&str>() {{
                s.to_string()
            }} else {{
                "fragment panicked".to_string()
            }};
            to_buffer(msg.into_bytes(), out, out_len);
            1
        }}
    }}
}}
"#,
        arity = bound.len(),
        decode_lines = decode_lines,
        args = args.join(", ")
    ));
    SynthesizedSource { code, file_name: "block.rs" }
}

// =============================================================================
// C#
// =============================================================================

const CSHARP_PRELUDE: &str = r#"
using System;
using System.Collections.Generic;
using System.Runtime.InteropServices;
using System.Text;

namespace Medley
{
    public class MValue
    {
        public enum Kind { Null, Bool, Int, Float, Str, Array, Dict }
        public Kind Tag = Kind.Null;
        public bool B;
        public long I;
        public double F;
        public string S = "";
        public List<MValue> Items = new List<MValue>();
        public List<KeyValuePair<string, MValue>> Entries = new List<KeyValuePair<string, MValue>>();

        public static MValue Null() => new MValue();
        public static MValue Of(bool v) => new MValue { Tag = Kind.Bool, B = v };
        public static MValue Of(long v) => new MValue { Tag = Kind.Int, I = v };
        public static MValue Of(double v) => new MValue { Tag = Kind.Float, F = v };
        public static MValue Of(string v) => new MValue { Tag = Kind.Str, S = v };

        public long AsInt() => Tag switch
        {
            Kind.Int => I,
            Kind.Float => (long)F,
            Kind.Bool => B ? 1 : 0,
            _ => throw new Exception("value is not an int"),
        };
        public double AsFloat() => Tag switch
        {
            Kind.Float => F,
            Kind.Int => I,
            _ => throw new Exception("value is not a float"),
        };
        public string AsStr() => Tag == Kind.Str ? S : throw new Exception("value is not a string");
        public bool AsBool() => Tag == Kind.Bool ? B : I != 0;
        public MValue this[int idx] => Tag == Kind.Array
            ? Items[idx]
            : throw new Exception("value is not an array");
        public MValue this[string key]
        {
            get
            {
                if (Tag != Kind.Dict) throw new Exception("value is not a dict");
                foreach (var e in Entries)
                    if (e.Key == key) return e.Value;
                throw new Exception($"dict has no key '{key}'");
            }
        }
        public int Count => Tag == Kind.Array ? Items.Count : Entries.Count;
    }

    public static class Wire
    {
        public static uint ReadU32(byte[] bytes, ref int pos)
        {
            uint v = BitConverter.ToUInt32(bytes, pos);
            pos += 4;
            return v;
        }

        public static string ReadStr(byte[] bytes, ref int pos)
        {
            int len = (int)ReadU32(bytes, ref pos);
            string s = Encoding.UTF8.GetString(bytes, pos, len);
            pos += len;
            return s;
        }

        public static MValue Decode(byte[] bytes, ref int pos)
        {
            byte tag = bytes[pos++];
            switch (tag)
            {
                case 0: return MValue.Null();
                case 1: return MValue.Of(bytes[pos++] != 0);
                case 2:
                {
                    long v = BitConverter.ToInt64(bytes, pos);
                    pos += 8;
                    return MValue.Of(v);
                }
                case 3:
                {
                    double v = BitConverter.ToDouble(bytes, pos);
                    pos += 8;
                    return MValue.Of(v);
                }
                case 4: return MValue.Of(ReadStr(bytes, ref pos));
                case 5:
                {
                    var v = new MValue { Tag = MValue.Kind.Array };
                    uint count = ReadU32(bytes, ref pos);
                    for (uint n = 0; n < count; n++) v.Items.Add(Decode(bytes, ref pos));
                    return v;
                }
                case 6:
                case 7:
                {
                    if (tag == 7) ReadStr(bytes, ref pos); // struct type name, not kept
                    var v = new MValue { Tag = MValue.Kind.Dict };
                    uint count = ReadU32(bytes, ref pos);
                    for (uint n = 0; n < count; n++)
                    {
                        string key = ReadStr(bytes, ref pos);
                        v.Entries.Add(new KeyValuePair<string, MValue>(key, Decode(bytes, ref pos)));
                    }
                    return v;
                }
                default: throw new Exception($"unknown wire tag {tag}");
            }
        }

        public static void WriteStr(List<byte> output, string s)
        {
            byte[] bytes = Encoding.UTF8.GetBytes(s);
            output.AddRange(BitConverter.GetBytes((uint)bytes.Length));
            output.AddRange(bytes);
        }

        public static void Encode(MValue v, List<byte> output)
        {
            switch (v.Tag)
            {
                case MValue.Kind.Null: output.Add(0); break;
                case MValue.Kind.Bool:
                    output.Add(1);
                    output.Add((byte)(v.B ? 1 : 0));
                    break;
                case MValue.Kind.Int:
                    output.Add(2);
                    output.AddRange(BitConverter.GetBytes(v.I));
                    break;
                case MValue.Kind.Float:
                    output.Add(3);
                    output.AddRange(BitConverter.GetBytes(v.F));
                    break;
                case MValue.Kind.Str:
                    output.Add(4);
                    WriteStr(output, v.S);
                    break;
                case MValue.Kind.Array:
                    output.Add(5);
                    output.AddRange(BitConverter.GetBytes((uint)v.Items.Count));
                    foreach (var item in v.Items) Encode(item, output);
                    break;
                case MValue.Kind.Dict:
                    output.Add(6);
                    output.AddRange(BitConverter.GetBytes((uint)v.Entries.Count));
                    foreach (var e in v.Entries)
                    {
                        WriteStr(output, e.Key);
                        Encode(e.Value, output);
                    }
                    break;
            }
        }

        public static unsafe int Emit(List<byte> bytes, byte** output, nuint* outputLen)
        {
            byte[] array = bytes.ToArray();
            IntPtr buf = Marshal.AllocHGlobal(array.Length == 0 ? 1 : array.Length);
            Marshal.Copy(array, 0, buf, array.Length);
            *output = (byte*)buf;
            *outputLen = (nuint)array.Length;
            return 0;
        }
    }
}
"#;

fn synthesize_csharp(fragment: &str, bound: &[String]) -> SynthesizedSource {
    if has_custom_entry(fragment) {
        return SynthesizedSource { code: fragment.to_string(), file_name: "Block.cs" };
    }
    let (imports, body) = hoist_imports(fragment, &["using "]);

    let params: Vec<String> =
        bound.iter().map(|name| format!("Medley.MValue {}", name)).collect();
    let mut code = String::new();
    for line in &imports {
        code.push_str(line);
        code.push('\n');
    }
    code.push_str(CSHARP_PRELUDE);
    code.push_str("\nnamespace Medley\n{\n    public static unsafe class Entry\n    {\n");
    code.push_str(&format!(
        "        static MValue MedleyUser({})\n        {{\n",
        params.join(", ")
    ));
    for line in body {
        code.push_str("            ");
        code.push_str(line);
        code.push('\n');
    }
    code.push_str("            return MValue.Null();\n        }\n\n");

    let mut decode_lines = String::new();
    for idx in 0..bound.len() {
        decode_lines.push_str(&format!(
            "                Wire.ReadStr(input, ref pos);\n\
             \x20               var arg{idx} = Wire.Decode(input, ref pos);\n"
        ));
    }
    let args: Vec<String> = (0..bound.len()).map(|i| format!("arg{}", i)).collect();
    code.push_str(&format!(
        r#"        [UnmanagedCallersOnly(EntryPoint = "medley_entry")]
        public static int MedleyEntry(byte* inPtr, nuint inLen, byte** output, nuint* outputLen)
        {{
            try
            {{
                byte[] input = new byte[(int)inLen];
                Marshal.Copy((IntPtr)inPtr, input, 0, (int)inLen);
                int pos = 0;
                uint count = Wire.ReadU32(input, ref pos);
                if (count < {arity}) throw new Exception("expected {arity} bindings");
{decode_lines}                MValue result = MedleyUser({args});
                var bytes = new List<byte>();
                Wire.Encode(result, bytes);
                return Wire.Emit(bytes, output, outputLen);
            }}
            catch (Exception e)
            {{
                var bytes = new List<byte>(Encoding.UTF8.GetBytes(e.Message));
                Wire.Emit(bytes, output, outputLen);
                return 1;
            }}
        }}

        [UnmanagedCallersOnly(EntryPoint = "medley_free")]
        public static void MedleyFree(byte* p)
        {{
            if (p != null) Marshal.FreeHGlobal((IntPtr)p);
        }}
    }}
}}
"#,
        arity = bound.len(),
        decode_lines = decode_lines,
        args = args.join(", ")
    ));
    SynthesizedSource { code, file_name: "Block.cs" }
}

/// The project file for compiling a C# block as a NativeAOT shared library.
pub fn csharp_project_file() -> &'static str {
    r#"<Project Sdk="Microsoft.NET.Sdk">
  <PropertyGroup>
    <TargetFramework>net8.0</TargetFramework>
    <OutputType>Library</OutputType>
    <PublishAot>true</PublishAot>
    <NativeLib>Shared</NativeLib>
    <AllowUnsafeBlocks>true</AllowUnsafeBlocks>
    <Nullable>disable</Nullable>
    <StripSymbols>true</StripSymbols>
  </PropertyGroup>
</Project>
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpp_wrapper_binds_variables() {
        let src = synthesize(
            Language::Cpp,
            "return a.as_int() + b.as_int();",
            &["a".to_string(), "b".to_string()],
        )
        .unwrap();
        assert!(src.code.contains("medley::Value medley_user(medley::Value a, medley::Value b)"));
        assert!(src.code.contains("medley_entry"));
        assert!(src.code.contains("medley_free"));
        assert!(src.code.contains("medley_user(arg_0, arg_1)"));
    }

    #[test]
    fn test_cpp_includes_hoisted() {
        let src = synthesize(
            Language::Cpp,
            "#include <cmath>\nreturn std::sqrt(x.as_float());",
            &["x".to_string()],
        )
        .unwrap();
        let include_pos = src.code.find("#include <cmath>").unwrap();
        let fn_pos = src.code.find("medley_user").unwrap();
        assert!(include_pos < fn_pos);
    }

    #[test]
    fn test_rust_wrapper_shape() {
        let src = synthesize(
            Language::Rust,
            "return (n.as_int() * 2).into();",
            &["n".to_string()],
        )
        .unwrap();
        assert!(src.code.contains("fn medley_user(n: MValue) -> MValue"));
        assert!(src.code.contains("#[no_mangle]"));
        assert!(src.code.contains("catch_unwind"));
        assert_eq!(src.file_name, "block.rs");
    }

    #[test]
    fn test_custom_entry_passthrough() {
        let fragment = "extern \"C\" int32_t medley_entry(const uint8_t* a, size_t b, uint8_t** c, size_t* d) { return 0; }";
        let src = synthesize(Language::Cpp, fragment, &[]).unwrap();
        assert_eq!(src.code, fragment);
    }

    #[test]
    fn test_csharp_wrapper_shape() {
        let src = synthesize(Language::CSharp, "return MValue.Of(42L);", &[]).unwrap();
        assert!(src.code.contains("UnmanagedCallersOnly(EntryPoint = \"medley_entry\")"));
        assert!(src.code.contains("static MValue MedleyUser()"));
        assert_eq!(src.file_name, "Block.cs");
    }

    #[test]
    fn test_interpreted_language_rejected() {
        assert!(synthesize(Language::Python, "x", &[]).is_err());
    }
}
