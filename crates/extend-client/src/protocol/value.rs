// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Dynamic values carried by requests and responses.
//!
//! # Wire Format
//!
//! ```text
//! +-----+---------------------------------------------+
//! | tag | payload                                     |
//! +-----+---------------------------------------------+
//!   0     Null    (none)
//!   1     Bool    u8
//!   2     Int     i64 BE
//!   3     Text    u32 BE length | UTF-8 bytes
//!   4     Bytes   u32 BE length | bytes
//!   5     Array   u32 BE count  | values...
//! ```

use crate::error::{Error, Result};
use std::fmt;

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_TEXT: u8 = 3;
const TAG_BYTES: u8 = 4;
const TAG_ARRAY: u8 = 5;

/// Nesting limit for arrays (anti stack-overflow on hostile input).
const MAX_DEPTH: usize = 32;

/// A request argument or response result.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Text or a protocol error naming `what`.
    pub fn expect_text(&self, what: &str) -> Result<&str> {
        self.as_str()
            .ok_or_else(|| Error::protocol(format!("{} must be text, got {}", what, self.type_name())))
    }

    /// Integer or a protocol error naming `what`.
    pub fn expect_int(&self, what: &str) -> Result<i64> {
        self.as_int()
            .ok_or_else(|| Error::protocol(format!("{} must be an integer, got {}", what, self.type_name())))
    }

    /// Array or a protocol error naming `what`.
    pub fn expect_array(&self, what: &str) -> Result<&[Value]> {
        self.as_array()
            .ok_or_else(|| Error::protocol(format!("{} must be an array, got {}", what, self.type_name())))
    }

    /// Bytes (a `Null` reads as absent).
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
        }
    }

    // ===== Encoding =====

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Null => buf.push(TAG_NULL),
            Value::Bool(b) => {
                buf.push(TAG_BOOL);
                buf.push(u8::from(*b));
            }
            Value::Int(i) => {
                buf.push(TAG_INT);
                buf.extend_from_slice(&i.to_be_bytes());
            }
            Value::Text(s) => {
                buf.push(TAG_TEXT);
                put_bytes(buf, s.as_bytes());
            }
            Value::Bytes(b) => {
                buf.push(TAG_BYTES);
                put_bytes(buf, b);
            }
            Value::Array(items) => {
                buf.push(TAG_ARRAY);
                put_len(buf, items.len());
                for item in items {
                    item.encode_into(buf);
                }
            }
        }
    }

    /// Decode exactly one value spanning all of `data`.
    pub fn decode(data: &[u8]) -> Result<Value> {
        let mut reader = WireReader::new(data);
        let value = reader.value()?;
        reader.finish()?;
        Ok(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Text(s) => write!(f, "\"{}\"", s),
            Value::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) => write!(f, "b\"{}\"", s),
                Err(_) => write!(f, "<{} bytes>", b.len()),
            },
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
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

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        Value::Int(i64::try_from(i).unwrap_or(i64::MAX))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

// ===== Primitive helpers shared by the codecs =====

pub(crate) fn put_len(buf: &mut Vec<u8>, len: usize) {
    let len = u32::try_from(len).unwrap_or(u32::MAX);
    buf.extend_from_slice(&len.to_be_bytes());
}

pub(crate) fn put_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    put_len(buf, data.len());
    buf.extend_from_slice(data);
}

pub(crate) fn put_str(buf: &mut Vec<u8>, s: &str) {
    put_bytes(buf, s.as_bytes());
}

/// Optional string: presence byte, then the string.
pub(crate) fn put_opt_str(buf: &mut Vec<u8>, s: Option<&str>) {
    match s {
        Some(s) => {
            buf.push(1);
            put_str(buf, s);
        }
        None => buf.push(0),
    }
}

/// Bounds-checked big-endian reader over a byte slice.
pub(crate) struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                Error::protocol(format!(
                    "truncated message: need {} bytes at offset {}, have {}",
                    n,
                    self.pos,
                    self.data.len()
                ))
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    pub(crate) fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.array()?))
    }

    pub(crate) fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    pub(crate) fn string(&mut self) -> Result<String> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| Error::protocol(format!("invalid UTF-8 string: {}", e)))
    }

    pub(crate) fn opt_string(&mut self) -> Result<Option<String>> {
        match self.u8()? {
            0 => Ok(None),
            1 => self.string().map(Some),
            other => Err(Error::protocol(format!("invalid presence byte {}", other))),
        }
    }

    pub(crate) fn value(&mut self) -> Result<Value> {
        self.value_at(0)
    }

    fn value_at(&mut self, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(Error::protocol("value nesting too deep"));
        }
        match self.u8()? {
            TAG_NULL => Ok(Value::Null),
            TAG_BOOL => Ok(Value::Bool(self.u8()? != 0)),
            TAG_INT => Ok(Value::Int(self.i64()?)),
            TAG_TEXT => Ok(Value::Text(self.string()?)),
            TAG_BYTES => Ok(Value::Bytes(self.bytes()?.to_vec())),
            TAG_ARRAY => {
                let count = self.u32()? as usize;
                // each element takes at least one byte
                if count > self.remaining() {
                    return Err(Error::protocol(format!(
                        "array count {} exceeds remaining {} bytes",
                        count,
                        self.remaining()
                    )));
                }
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.value_at(depth + 1)?);
                }
                Ok(Value::Array(items))
            }
            tag => Err(Error::protocol(format!("unknown value tag {}", tag))),
        }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Fail if unread bytes remain.
    pub(crate) fn finish(&self) -> Result<()> {
        if self.remaining() == 0 {
            Ok(())
        } else {
            Err(Error::protocol(format!(
                "{} trailing bytes after message",
                self.remaining()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_value_roundtrip() {
        let value = Value::Array(vec![
            Value::from("channel:7#NamedTopic"),
            Value::Int(42),
            Value::Array(vec![Value::Bytes(vec![0, 1, 2]), Value::Null]),
            Value::Bool(true),
        ]);
        assert_eq!(Value::decode(&value.encode()).unwrap(), value);
    }

    #[test]
    fn test_truncated_input_is_protocol_error() {
        let mut bytes = Value::from("hello").encode();
        bytes.truncate(bytes.len() - 1);
        let err = Value::decode(&bytes).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = Value::Int(1).encode();
        bytes.push(0);
        assert!(Value::decode(&bytes).is_err());
    }

    #[test]
    fn test_hostile_array_count_rejected() {
        let mut bytes = vec![TAG_ARRAY];
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        assert!(Value::decode(&bytes).is_err());
    }

    #[test]
    fn test_expect_helpers_name_the_field() {
        let err = Value::Int(3).expect_text("channel URI").unwrap_err();
        assert!(err.to_string().contains("channel URI"));
        assert_eq!(Value::from(7u32).expect_int("count").unwrap(), 7);
    }
}
