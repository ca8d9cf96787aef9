// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::Bytes;

use crate::{
    cfg::enums::ProtocolVersion,
    models::{
        error::{DecodeError, DecodeKind, ServerError},
        value::Value,
    },
};

/// Attempts to decode one frame from the front of `buf`.
///
/// Returns `Ok(Some((value, consumed)))` for a complete frame,
/// `Ok(None)` when more bytes are needed, and `Err` for input no
/// server speaking the negotiated protocol version could have sent.
/// Bulk payloads in the returned value are zero-copy slices of `buf`;
/// the caller owns recycling the buffer once the value is dropped.
///
/// The decoder never backtracks within a frame and holds no state
/// between calls: after `Ok(None)` the next call re-parses from the
/// start of the (now longer) buffer.
pub fn decode(
    buf: &Bytes,
    version: ProtocolVersion,
) -> Result<Option<(Value, usize)>, DecodeError> {
    let mut cursor = Cursor {
        buf,
        pos: 0,
        version,
    };
    match cursor.value()? {
        Some(value) => Ok(Some((value, cursor.pos))),
        None => Ok(None),
    }
}

struct Cursor<'a> {
    buf: &'a Bytes,
    pos: usize,
    version: ProtocolVersion,
}

/// Version-2 grammar is the subset `+ - : $ *`.
fn legal_in_v2(type_byte: u8) -> bool {
    matches!(type_byte, b'+' | b'-' | b':' | b'$' | b'*')
}

impl<'a> Cursor<'a> {
    fn value(&mut self) -> Result<Option<Value>, DecodeError> {
        let Some(&type_byte) = self.buf.get(self.pos) else {
            return Ok(None);
        };
        if self.version == ProtocolVersion::Resp2 && !legal_in_v2(type_byte) {
            return Err(DecodeError {
                kind: DecodeKind::ProtocolMismatch,
                at_offset: self.pos,
            });
        }

        let at = self.pos;
        self.pos += 1;
        match type_byte {
            b'+' => self.simple_string(at),
            b'-' => self.error_line(at),
            b':' => Ok(self.integer_line(at)?.map(Value::Int)),
            b'$' => self.bulk(at),
            b'*' => self.aggregate(at, AggregateKind::Array),
            b'%' => self.map(at),
            b'~' => self.aggregate(at, AggregateKind::Set),
            b'>' => self.aggregate(at, AggregateKind::Push),
            b',' => self.double(at),
            b'#' => self.boolean(at),
            b'(' => self.big_number(at),
            b'_' => self.null(at),
            b'=' => self.verbatim(at),
            _ => Err(DecodeError::malformed("unknown type byte", at)),
        }
    }

    /// Content of the next CRLF-terminated line, or `None` while the
    /// terminator has not arrived yet.
    fn line(&mut self) -> Result<Option<&'a [u8]>, DecodeError> {
        let buf: &'a [u8] = self.buf;
        let rest = &buf[self.pos..];
        let Some(cr) = rest.iter().position(|&b| b == b'\r') else {
            return Ok(None);
        };
        match rest.get(cr + 1) {
            None => Ok(None),
            Some(b'\n') => {
                let start = self.pos;
                self.pos += cr + 2;
                Ok(Some(&buf[start..start + cr]))
            },
            Some(_) => Err(DecodeError::malformed(
                "bare CR inside a line",
                self.pos + cr,
            )),
        }
    }

    fn simple_string(&mut self, at: usize) -> Result<Option<Value>, DecodeError> {
        let Some(line) = self.line()? else {
            return Ok(None);
        };
        let text = std::str::from_utf8(line)
            .map_err(|_| DecodeError::malformed("simple string is not UTF-8", at))?;
        Ok(Some(Value::Simple(text.to_string())))
    }

    fn error_line(&mut self, at: usize) -> Result<Option<Value>, DecodeError> {
        let Some(line) = self.line()? else {
            return Ok(None);
        };
        let text = std::str::from_utf8(line)
            .map_err(|_| DecodeError::malformed("error line is not UTF-8", at))?;
        Ok(Some(Value::Error(ServerError::parse(text))))
    }

    fn integer_line(&mut self, at: usize) -> Result<Option<i64>, DecodeError> {
        let Some(line) = self.line()? else {
            return Ok(None);
        };
        Ok(Some(parse_decimal(line, at)?))
    }

    /// Length headers are stricter than `:` integers: ASCII decimal
    /// with no sign and no leading zero, or exactly `-1` for null.
    fn length_line(&mut self, at: usize) -> Result<Option<i64>, DecodeError> {
        let Some(line) = self.line()? else {
            return Ok(None);
        };
        if line == b"-1" {
            return Ok(Some(-1));
        }
        if line.len() > 1 && line[0] == b'0' {
            return Err(DecodeError::malformed("leading zero in length", at));
        }
        let len = parse_decimal(line, at)?;
        if len < 0 {
            return Err(DecodeError::malformed("negative length", at));
        }
        Ok(Some(len))
    }

    fn bulk(&mut self, at: usize) -> Result<Option<Value>, DecodeError> {
        let Some(len) = self.length_line(at)? else {
            return Ok(None);
        };
        if len == -1 {
            return Ok(Some(Value::NullBulk));
        }
        Ok(self.payload(len as usize, at)?.map(Value::Bulk))
    }

    /// `len` raw bytes plus the trailing CRLF, sliced without copying.
    fn payload(&mut self, len: usize, at: usize) -> Result<Option<Bytes>, DecodeError> {
        let end = match self.pos.checked_add(len) {
            Some(end) => end,
            None => return Err(DecodeError::malformed("length overflow", at)),
        };
        if self.buf.len() < end + 2 {
            return Ok(None);
        }
        if &self.buf[end..end + 2] != b"\r\n" {
            return Err(DecodeError::malformed("missing bulk terminator", end));
        }
        let payload = self.buf.slice(self.pos..end);
        self.pos = end + 2;
        Ok(Some(payload))
    }

    fn aggregate(
        &mut self,
        at: usize,
        kind: AggregateKind,
    ) -> Result<Option<Value>, DecodeError> {
        let Some(count) = self.length_line(at)? else {
            return Ok(None);
        };
        if count == -1 {
            return match kind {
                AggregateKind::Array => Ok(Some(Value::NullArray)),
                _ => Err(DecodeError::malformed("null count on non-array", at)),
            };
        }
        // The count is attacker-controlled until the children actually
        // parse; reserve conservatively.
        let mut items = Vec::with_capacity((count as usize).min(64));
        for _ in 0..count {
            let Some(item) = self.value()? else {
                return Ok(None);
            };
            items.push(item);
        }
        Ok(Some(match kind {
            AggregateKind::Array => Value::Array(items),
            AggregateKind::Set => Value::Set(items),
            AggregateKind::Push => Value::Push(items),
        }))
    }

    fn map(&mut self, at: usize) -> Result<Option<Value>, DecodeError> {
        let Some(pairs) = self.length_line(at)? else {
            return Ok(None);
        };
        if pairs < 0 {
            return Err(DecodeError::malformed("null count on map", at));
        }
        let mut items = Vec::with_capacity((pairs as usize).min(64));
        for _ in 0..pairs {
            let Some(key) = self.value()? else {
                return Ok(None);
            };
            let Some(value) = self.value()? else {
                return Ok(None);
            };
            items.push((key, value));
        }
        Ok(Some(Value::Map(items)))
    }

    fn double(&mut self, at: usize) -> Result<Option<Value>, DecodeError> {
        let Some(line) = self.line()? else {
            return Ok(None);
        };
        let text = std::str::from_utf8(line)
            .map_err(|_| DecodeError::malformed("double is not UTF-8", at))?;
        // f64's FromStr accepts the protocol's `inf`/`-inf`/`nan`
        // sentinels directly.
        let value: f64 = text
            .parse()
            .map_err(|_| DecodeError::malformed("unparseable double", at))?;
        Ok(Some(Value::Double(value)))
    }

    fn boolean(&mut self, at: usize) -> Result<Option<Value>, DecodeError> {
        let Some(line) = self.line()? else {
            return Ok(None);
        };
        match line {
            b"t" => Ok(Some(Value::Bool(true))),
            b"f" => Ok(Some(Value::Bool(false))),
            _ => Err(DecodeError::malformed("boolean must be t or f", at)),
        }
    }

    fn big_number(&mut self, at: usize) -> Result<Option<Value>, DecodeError> {
        let Some(line) = self.line()? else {
            return Ok(None);
        };
        let digits = match line.split_first() {
            Some((b'-', rest)) => rest,
            _ => line,
        };
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return Err(DecodeError::malformed("big number is not decimal", at));
        }
        // Validated ASCII above.
        Ok(Some(Value::BigNumber(
            String::from_utf8_lossy(line).into_owned(),
        )))
    }

    fn null(&mut self, at: usize) -> Result<Option<Value>, DecodeError> {
        let Some(line) = self.line()? else {
            return Ok(None);
        };
        if !line.is_empty() {
            return Err(DecodeError::malformed("null carries no payload", at));
        }
        Ok(Some(Value::Null))
    }

    /// `=<len>\r\n<3-byte tag>:<payload>\r\n`; len covers tag, colon
    /// and payload.
    fn verbatim(&mut self, at: usize) -> Result<Option<Value>, DecodeError> {
        let Some(len) = self.length_line(at)? else {
            return Ok(None);
        };
        if len < 4 {
            return Err(DecodeError::malformed("verbatim shorter than its tag", at));
        }
        let Some(raw) = self.payload(len as usize, at)? else {
            return Ok(None);
        };
        if raw[3] != b':' {
            return Err(DecodeError::malformed("verbatim tag separator", at));
        }
        let format = [raw[0], raw[1], raw[2]];
        Ok(Some(Value::Verbatim {
            format,
            payload: raw.slice(4..),
        }))
    }
}

enum AggregateKind {
    Array,
    Set,
    Push,
}

/// Signed ASCII decimal, nothing else: no `+`, no whitespace, no
/// empty input.
fn parse_decimal(line: &[u8], at: usize) -> Result<i64, DecodeError> {
    let (negative, digits) = match line.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, line),
    };
    if digits.is_empty() {
        return Err(DecodeError::malformed("empty integer", at));
    }
    // Accumulate on the negative side so i64::MIN parses too.
    let mut acc: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(DecodeError::malformed("non-digit in integer", at));
        }
        acc = acc
            .checked_mul(10)
            .and_then(|acc| acc.checked_sub(i64::from(b - b'0')))
            .ok_or_else(|| DecodeError::malformed("integer overflow", at))?;
    }
    if negative {
        Ok(acc)
    } else {
        acc.checked_neg()
            .ok_or_else(|| DecodeError::malformed("integer overflow", at))
    }
}
