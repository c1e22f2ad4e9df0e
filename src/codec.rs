//! Binary codecs for keys and values.
//!
//! Keys encode JSON values into byte strings whose unsigned lexicographic
//! order matches JSON order, which is what makes range scans over an
//! ordered key-value store meaningful. Every encoded value starts with a
//! type tag; numbers are normalized (sign-bit flip for positives, full
//! bit flip for negatives, big-endian) so byte order equals numeric
//! order across signs and magnitudes.
//!
//! Values (row payloads) are stored as plain JSON bytes; they never need
//! to be ordered, only round-tripped.

use byteorder::{BigEndian, ByteOrder};
use serde_json::Value;

use crate::error::{Result, SepalError};

/// Type tags for encoded keys. Tags order the encoded values by type
/// first, then by content within a type.
pub mod tag {
    /// Absent value.
    pub const UNDEFINED: u8 = 0;
    /// JSON `null`.
    pub const NULL: u8 = 1;
    /// JSON `false`.
    pub const FALSE: u8 = 2;
    /// JSON `true`.
    pub const TRUE: u8 = 3;
    /// Negative number, normalized IEEE-754 bytes follow.
    pub const NEG_NUMBER: u8 = 4;
    /// Positive number (or zero), normalized IEEE-754 bytes follow.
    pub const POS_NUMBER: u8 = 5;
    /// Zero-terminated UTF-8 string, embedded NUL escaped as `C0 80`.
    pub const STRINGZ: u8 = 6;
    /// Opaque JSON (objects); self-delimiting serialized form follows.
    pub const JSON: u8 = 8;
    /// Combined with the tag of the first element of an array.
    pub const ARRAY_PREFIX: u8 = 0x10;
    /// Introduces a trailing document id in composite index rows.
    pub const DOC: u8 = 0x40;
}

const F64_SIGN: u64 = 1 << 63;
/// Largest integer a double represents exactly; decoded integral values
/// inside this range come back as JSON integers.
const MAX_SAFE_INT: f64 = 9_007_199_254_740_992.0;

/// Encode `v` as an ordered key and append it to `out`.
///
/// Arrays are encoded as a flat sequence: the first element carries the
/// `ARRAY_PREFIX` bit, the rest follow untagged. Nested arrays therefore
/// flatten; use objects when structure must survive a round trip.
pub fn encode_key(v: &Value, out: &mut Vec<u8>) {
    encode_tagged(v, 0, out);
}

fn encode_tagged(v: &Value, prefix: u8, out: &mut Vec<u8>) {
    match v {
        Value::Null => out.push(prefix | tag::NULL),
        Value::Bool(false) => out.push(prefix | tag::FALSE),
        Value::Bool(true) => out.push(prefix | tag::TRUE),
        Value::Number(n) => {
            let x = n.as_f64().unwrap_or(0.0);
            out.push(prefix | if x < 0.0 { tag::NEG_NUMBER } else { tag::POS_NUMBER });
            encode_f64(x, out);
        }
        Value::String(s) => {
            out.push(prefix | tag::STRINGZ);
            push_stringz(s, out);
        }
        Value::Array(items) => {
            let mut pfx = tag::ARRAY_PREFIX;
            for item in items {
                encode_tagged(item, pfx, out);
                pfx = 0;
            }
        }
        Value::Object(_) => {
            out.push(prefix | tag::JSON);
            // serde_json only fails on non-string map keys, which Value
            // cannot hold.
            let bytes = serde_json::to_vec(v).unwrap_or_default();
            out.extend_from_slice(&bytes);
        }
    }
}

/// Encode `v` for prefix scans: a trailing string terminator is dropped
/// so that string keys (and arrays ending in a string) match their
/// extensions.
pub fn encode_key_prefix(v: &Value, out: &mut Vec<u8>) {
    encode_key(v, out);
    let string_final = match v {
        Value::String(_) => true,
        Value::Array(items) => matches!(items.last(), Some(Value::String(_))),
        _ => false,
    };
    if string_final {
        out.pop();
    }
}

/// Decode one key value from `bytes`, returning the value and the number
/// of bytes consumed. Array decoding stops at end of input or at a
/// `DOC`-tagged byte, so composite rows can be split by the caller.
pub fn decode_key(bytes: &[u8]) -> Result<(Value, usize)> {
    if bytes.is_empty() {
        return Ok((Value::Null, 0));
    }
    let t = bytes[0];
    if t & tag::DOC != 0 {
        // an empty key (empty arrays encode to nothing) directly
        // followed by a doc id
        return Ok((Value::Null, 0));
    }
    if t & tag::ARRAY_PREFIX != 0 {
        let mut items = Vec::new();
        let (first, mut pos) = decode_scalar(t & !tag::ARRAY_PREFIX, &bytes[1..])?;
        pos += 1;
        items.push(first);
        while pos < bytes.len() && bytes[pos] & tag::DOC == 0 {
            let t = bytes[pos];
            let (item, used) = decode_scalar(t, &bytes[pos + 1..])?;
            pos += used + 1;
            items.push(item);
        }
        Ok((Value::Array(items), pos))
    } else {
        let (v, used) = decode_scalar(t, &bytes[1..])?;
        Ok((v, used + 1))
    }
}

fn decode_scalar(t: u8, rest: &[u8]) -> Result<(Value, usize)> {
    match t {
        tag::UNDEFINED | tag::NULL => Ok((Value::Null, 0)),
        tag::FALSE => Ok((Value::Bool(false), 0)),
        tag::TRUE => Ok((Value::Bool(true), 0)),
        tag::NEG_NUMBER | tag::POS_NUMBER => {
            if rest.len() < 8 {
                return Err(SepalError::decode("truncated number key"));
            }
            Ok((number_value(decode_f64(&rest[..8])), 8))
        }
        tag::STRINGZ => {
            let (s, used) = pop_stringz(rest)?;
            Ok((Value::String(s), used))
        }
        tag::JSON => {
            let mut stream = serde_json::Deserializer::from_slice(rest).into_iter::<Value>();
            match stream.next() {
                Some(Ok(v)) => Ok((v, stream.byte_offset())),
                _ => Err(SepalError::decode("malformed embedded json key")),
            }
        }
        other => Err(SepalError::decode(format!("unknown key tag {other:#x}"))),
    }
}

/// Append a document id to an encoded key, introduced by the `DOC` tag.
pub fn append_doc_id(out: &mut Vec<u8>, doc_id: &str) {
    out.push(tag::DOC);
    out.extend_from_slice(doc_id.as_bytes());
}

/// Split the content of a composite view row into `(key, doc_id)`.
pub fn split_doc_key(content: &[u8]) -> Result<(Value, &str)> {
    let (key, used) = decode_key(content)?;
    let rest = &content[used..];
    if rest.first() != Some(&tag::DOC) {
        return Err(SepalError::decode("view row is missing its doc tag"));
    }
    let id = std::str::from_utf8(&rest[1..])
        .map_err(|_| SepalError::decode("view row doc id is not utf-8"))?;
    Ok((key, id))
}

/// Serialize a JSON value for storage as a row payload.
pub fn encode_value(v: &Value, out: &mut Vec<u8>) {
    let bytes = serde_json::to_vec(v).unwrap_or_default();
    out.extend_from_slice(&bytes);
}

/// Deserialize a row payload previously written by [`encode_value`].
pub fn decode_value(bytes: &[u8]) -> Result<Value> {
    serde_json::from_slice(bytes).map_err(|e| SepalError::decode(format!("bad value payload: {e}")))
}

/// Append a big-endian sequence id.
pub fn push_seq(out: &mut Vec<u8>, seq: u64) {
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, seq);
    out.extend_from_slice(&buf);
}

/// Read a big-endian sequence id.
pub fn read_seq(bytes: &[u8]) -> Result<u64> {
    if bytes.len() < 8 {
        return Err(SepalError::decode("truncated sequence id"));
    }
    Ok(BigEndian::read_u64(&bytes[..8]))
}

/// Turn `key` into the smallest key greater than every key it prefixes.
///
/// Returns `false` when no such key exists (the key is empty or all
/// `0xFF`); the caller then iterates to the end of the space.
pub fn upper_bound(key: &mut Vec<u8>) -> bool {
    while let Some(last) = key.last_mut() {
        if *last == 0xFF {
            key.pop();
        } else {
            *last += 1;
            return true;
        }
    }
    false
}

fn encode_f64(x: f64, out: &mut Vec<u8>) {
    let bits = x.to_bits();
    let norm = if bits & F64_SIGN != 0 { !bits } else { bits ^ F64_SIGN };
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, norm);
    out.extend_from_slice(&buf);
}

fn decode_f64(bytes: &[u8]) -> f64 {
    let norm = BigEndian::read_u64(bytes);
    let bits = if norm & F64_SIGN != 0 { norm ^ F64_SIGN } else { !norm };
    f64::from_bits(bits)
}

fn number_value(x: f64) -> Value {
    if x.is_finite() && x.fract() == 0.0 && x.abs() <= MAX_SAFE_INT {
        Value::from(x as i64)
    } else {
        Value::from(x)
    }
}

fn push_stringz(s: &str, out: &mut Vec<u8>) {
    for &b in s.as_bytes() {
        if b == 0 {
            out.extend_from_slice(&[0xC0, 0x80]);
        } else {
            out.push(b);
        }
    }
    out.push(0);
}

fn pop_stringz(bytes: &[u8]) -> Result<(String, usize)> {
    let mut raw = Vec::new();
    let mut i = 0;
    loop {
        match bytes.get(i) {
            None => return Err(SepalError::decode("unterminated string key")),
            Some(0) => break,
            Some(&0xC0) if bytes.get(i + 1) == Some(&0x80) => {
                raw.push(0);
                i += 2;
            }
            Some(&b) => {
                raw.push(b);
                i += 1;
            }
        }
    }
    let s = String::from_utf8(raw).map_err(|_| SepalError::decode("string key is not utf-8"))?;
    Ok((s, i + 1))
}
