// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use resp_client_rs::{
    cfg::enums::ProtocolVersion,
    models::{command::Command, value::Value},
};

use crate::integration_tests::common::{Behavior, MiniServer, connect};

#[tokio::test]
async fn hello_negotiates_protocol_3_and_ping_pongs() -> Result<()> {
    let server = MiniServer::spawn(Behavior::default()).await;
    let mut conn = connect(&server).await;

    assert_eq!(conn.protocol(), ProtocolVersion::Resp3);
    assert!(conn.is_open());

    let reply = conn.call(&Command::ping()).await?;
    assert_eq!(reply, Value::Simple("PONG".to_string()));
    Ok(())
}

#[tokio::test]
async fn hello_rejection_falls_back_to_protocol_2() -> Result<()> {
    let server = MiniServer::spawn(Behavior {
        hello_unsupported: true,
        ..Behavior::default()
    })
    .await;
    let mut conn = connect(&server).await;

    assert_eq!(conn.protocol(), ProtocolVersion::Resp2);

    // The data path works identically after the fallback.
    conn.call(&Command::set(b"k", b"v")).await?;
    let reply = conn.call(&Command::get(b"k")).await?;
    assert_eq!(reply.as_bytes(), Some(b"v".as_slice()));
    Ok(())
}

#[tokio::test]
async fn ping_reports_latency() -> Result<()> {
    let server = MiniServer::spawn(Behavior::default()).await;
    let mut conn = connect(&server).await;

    let latency = conn.ping().await?;
    assert!(latency.as_millis() < 2_000);
    Ok(())
}
