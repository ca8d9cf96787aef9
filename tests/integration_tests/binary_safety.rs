// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use resp_client_rs::models::{command::Command, value::Value};

use crate::integration_tests::common::{Behavior, MiniServer, connect};

#[tokio::test]
async fn all_256_byte_values_round_trip_bit_identically() -> Result<()> {
    let server = MiniServer::spawn(Behavior::default()).await;
    let mut conn = connect(&server).await;

    let payload: Vec<u8> = (0..=255u8).collect();
    conn.call(&Command::set(b"bin", &payload)).await?;

    let reply = conn.call(&Command::get(b"bin")).await?;
    match reply {
        Value::Bulk(b) => assert_eq!(b.as_ref(), payload.as_slice()),
        other => panic!("expected bulk, got {other}"),
    }
    Ok(())
}

#[tokio::test]
async fn zero_length_bulk_is_empty_not_null() -> Result<()> {
    let server = MiniServer::spawn(Behavior::default()).await;
    let mut conn = connect(&server).await;

    conn.call(&Command::set(b"empty", b"")).await?;
    let reply = conn.call(&Command::get(b"empty")).await?;
    assert_eq!(reply, Value::Bulk(bytes::Bytes::new()));

    let missing = conn.call(&Command::get(b"no-such-key")).await?;
    assert_eq!(missing, Value::NullBulk);
    Ok(())
}
