// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fmt;

use bytes::Bytes;

use crate::models::error::ServerError;

/// A decoded protocol value.
///
/// Bulk payloads are `Bytes` slices of the read buffer the frame was
/// decoded from; no character encoding is ever applied to them. Null
/// bulks and null arrays stay distinguishable at the type level because
/// protocol version 2 encodes them differently (`$-1` vs `*-1`) and
/// callers care which one they got.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `+OK\r\n` style status line.
    Simple(String),
    /// `-ERR ...` error line, prefix split off as the error kind.
    Error(ServerError),
    /// `:42\r\n`
    Int(i64),
    /// `$5\r\nhello\r\n`, binary-safe.
    Bulk(Bytes),
    /// `$-1\r\n`
    NullBulk,
    /// `*2\r\n...`
    Array(Vec<Value>),
    /// `*-1\r\n`
    NullArray,
    /// `%2\r\n...` ordered key/value pairs.
    Map(Vec<(Value, Value)>),
    /// `~3\r\n...`
    Set(Vec<Value>),
    /// `,3.14\r\n` including the `inf`/`-inf`/`nan` sentinels.
    Double(f64),
    /// `#t\r\n` / `#f\r\n`
    Bool(bool),
    /// `(3492890328409238509324850943850943825024385\r\n`
    BigNumber(String),
    /// `=15\r\ntxt:Some string\r\n` payload plus a 3-byte format tag.
    Verbatim { format: [u8; 3], payload: Bytes },
    /// `>2\r\n...` out-of-band frame (pub/sub delivery, invalidation).
    Push(Vec<Value>),
    /// `_\r\n`
    Null,
}

impl Value {
    /// Raw bytes of any string-ish value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Simple(s) => Some(s.as_bytes()),
            Value::Bulk(b) => Some(b),
            Value::Verbatim { payload, .. } => Some(payload),
            Value::BigNumber(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Lossy UTF-8 view of a string-ish value.
    pub fn as_text(&self) -> Option<String> {
        self.as_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// The elements of an aggregate reply (`Array` or `Push`).
    pub fn into_elements(self) -> Option<Vec<Value>> {
        match self {
            Value::Array(items) | Value::Push(items) => Some(items),
            _ => None,
        }
    }

    /// Map lookup by key bytes. Works on `Map` replies and on the
    /// flat key-value arrays version-2 servers send in their place.
    pub fn lookup(&self, key: &[u8]) -> Option<&Value> {
        match self {
            Value::Map(pairs) => pairs
                .iter()
                .find(|(k, _)| k.as_bytes() == Some(key))
                .map(|(_, v)| v),
            Value::Array(items) => items
                .chunks_exact(2)
                .find(|kv| kv[0].as_bytes() == Some(key))
                .map(|kv| &kv[1]),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null | Value::NullBulk | Value::NullArray)
    }

    /// True for `+OK` and other expected status lines.
    pub fn is_status(&self, status: &str) -> bool {
        matches!(self, Value::Simple(s) if s == status)
    }

    /// Out-of-band frames are routed to a side queue, never returned
    /// as command replies.
    pub fn is_push(&self) -> bool {
        matches!(self, Value::Push(_))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Simple(s) => write!(f, "+{s}"),
            Value::Error(e) => write!(f, "-{e}"),
            Value::Int(i) => write!(f, ":{i}"),
            Value::Bulk(b) => write!(f, "${}", String::from_utf8_lossy(b)),
            Value::NullBulk => f.write_str("$(nil)"),
            Value::Array(items) => write!(f, "*[{}]", items.len()),
            Value::NullArray => f.write_str("*(nil)"),
            Value::Map(pairs) => write!(f, "%[{}]", pairs.len()),
            Value::Set(items) => write!(f, "~[{}]", items.len()),
            Value::Double(d) => write!(f, ",{d}"),
            Value::Bool(b) => write!(f, "#{}", if *b { 't' } else { 'f' }),
            Value::BigNumber(s) => write!(f, "({s}"),
            Value::Verbatim { format, payload } => write!(
                f,
                "={}:{}",
                String::from_utf8_lossy(format),
                String::from_utf8_lossy(payload)
            ),
            Value::Push(items) => write!(f, ">[{}]", items.len()),
            Value::Null => f.write_str("_"),
        }
    }
}
