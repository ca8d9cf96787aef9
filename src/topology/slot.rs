// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crc::{CRC_16_XMODEM, Crc};

pub const SLOT_COUNT: u16 = 16384;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// The cluster slot a key maps to: CRC16-XMODEM over the key bytes,
/// modulo 16384. With a non-empty `{...}` hash tag, only the tag is
/// hashed, so cooperating keys can share a slot.
pub fn hash_slot(key: &[u8]) -> u16 {
    let hashed = hash_tag(key).unwrap_or(key);
    CRC16.checksum(hashed) % SLOT_COUNT
}

/// The first balanced, non-empty `{...}` substring. An empty tag
/// (`{}`) is ignored and the whole key hashes.
fn hash_tag(key: &[u8]) -> Option<&[u8]> {
    let open = key.iter().position(|&b| b == b'{')?;
    let close = key[open + 1..].iter().position(|&b| b == b'}')?;
    if close == 0 {
        return None;
    }
    Some(&key[open + 1..open + 1 + close])
}
