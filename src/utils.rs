// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fmt::Write;

use rand::Rng;

/// Generates a 128-bit random token rendered as 32 lowercase hex
/// characters; the per-acquisition identity of a distributed lock.
pub fn generate_token() -> String {
    let mut raw = [0u8; 16];
    rand::rng().fill(&mut raw);

    let mut hex = String::with_capacity(32);
    for byte in &raw {
        write!(&mut hex, "{byte:02x}").expect("Writing to String cannot fail");
    }
    hex
}
