// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::{BufMut, Bytes, BytesMut};

use crate::models::command::Command;

const CRLF: &[u8] = b"\r\n";

/// Bytes the encoded frame will occupy, so callers can reserve once.
pub fn encoded_len(cmd: &Command) -> usize {
    let mut itoa_buf = itoa::Buffer::new();
    let mut len = 1 + itoa_buf.format(cmd.len()).len() + 2;
    for arg in cmd.args() {
        len += 1 + itoa_buf.format(arg.len()).len() + 2 + arg.len() + 2;
    }
    len
}

/// Encodes a command as one array frame: `*N\r\n` then N bulk frames
/// (`$len\r\n<bytes>\r\n`). Writes straight into `out`; the only
/// allocation is whatever `out` needs to grow.
pub fn encode_command(cmd: &Command, out: &mut BytesMut) {
    let mut itoa_buf = itoa::Buffer::new();
    out.reserve(encoded_len(cmd));

    out.put_u8(b'*');
    out.put_slice(itoa_buf.format(cmd.len()).as_bytes());
    out.put_slice(CRLF);

    for arg in cmd.args() {
        out.put_u8(b'$');
        out.put_slice(itoa_buf.format(arg.len()).as_bytes());
        out.put_slice(CRLF);
        out.put_slice(arg);
        out.put_slice(CRLF);
    }
}

/// One-shot encoding for prebuilt frames. Commands fixed at build time
/// (PING, ASKING, MULTI...) can be encoded once and the frame reused;
/// the wire contract is identical.
pub fn encode_to_frame(cmd: &Command) -> Bytes {
    let mut out = BytesMut::with_capacity(encoded_len(cmd));
    encode_command(cmd, &mut out);
    out.freeze()
}
