//! JSON Canonicalization Scheme (RFC 8785) and payload hashing
//!
//! The same logical payload must always hash to the same value no matter
//! which collaborator serialized it, so hashing goes through a canonical
//! byte form: object members sorted by UTF-16 code units, no insignificant
//! whitespace, minimal string escapes and ECMAScript number formatting.

use crate::errors::{EvidenceError, EvidenceResult};
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};
use std::fmt::Write;

/// `previous_hash` of the first event in every stream.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Canonical string form of a JSON value.
pub fn canonical_json(value: &Value) -> EvidenceResult<String> {
    let mut out = String::new();
    write_value(value, &mut out)?;
    Ok(out)
}

/// Canonical form of any serializable value.
pub fn canonical_json_of<T: serde::Serialize>(value: &T) -> EvidenceResult<String> {
    let value = serde_json::to_value(value)
        .map_err(|e| EvidenceError::serialization("canonicalize", e))?;
    canonical_json(&value)
}

/// Lowercase hex SHA-256 of arbitrary bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// `payload_hash` = SHA-256(canonicalize(payload)).
pub fn payload_hash(payload: &Value) -> EvidenceResult<String> {
    Ok(sha256_hex(canonical_json(payload)?.as_bytes()))
}

/// True for a lowercase, 64 character hex digest.
pub fn is_hash_hex(candidate: &str) -> bool {
    candidate.len() == 64
        && candidate
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn write_value(value: &Value, out: &mut String) -> EvidenceResult<()> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => write_number(n, out)?,
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => write_object(map, out)?,
    }
    Ok(())
}

fn write_object(map: &Map<String, Value>, out: &mut String) -> EvidenceResult<()> {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort_by(|a, b| a.encode_utf16().cmp(b.encode_utf16()));

    out.push('{');
    for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_string(key, out);
        out.push(':');
        write_value(&map[key], out)?;
    }
    out.push('}');
    Ok(())
}

fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0C}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                // Writing to a String cannot fail.
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Numbers are IEEE-754 doubles serialized as ECMAScript `Number#toString`
/// does, so integers beyond 2^53 lose precision exactly as they would in a
/// JCS implementation elsewhere.
fn write_number(n: &Number, out: &mut String) -> EvidenceResult<()> {
    let f = n
        .as_f64()
        .ok_or_else(|| EvidenceError::validation("payload", "unrepresentable number"))?;
    if !f.is_finite() {
        return Err(EvidenceError::validation(
            "payload",
            "non-finite numbers cannot be canonicalized",
        ));
    }
    if f == 0.0 {
        // Covers -0 as well.
        out.push('0');
    } else {
        out.push_str(ryu_js::Buffer::new().format_finite(f));
    }
    Ok(())
}
