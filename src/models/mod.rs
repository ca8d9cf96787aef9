//! Wire-level data model: values, commands, the codec and the error
//! taxonomy. Nothing here performs I/O.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Outbound command representation and the commands the core issues.
pub mod command;
/// Incremental, non-backtracking frame decoder.
pub mod decode;
/// Command-to-frame encoder.
pub mod encode;
/// Transport, server and middleware error types.
pub mod error;
/// Decoded protocol values.
pub mod value;
