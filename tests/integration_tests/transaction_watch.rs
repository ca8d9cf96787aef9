// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use bytes::Bytes;
use resp_client_rs::{
    client::transaction::Transaction,
    models::{command::Command, error::ClientError, value::Value},
};

use crate::integration_tests::common::{Behavior, MiniServer, connect};

#[tokio::test]
async fn exec_applies_queued_commands() -> Result<()> {
    let server = MiniServer::spawn(Behavior::default()).await;
    let mut conn = connect(&server).await;

    let mut txn = Transaction::begin(&mut conn, &[]).await?;
    txn.queue(Command::set(b"t", b"1")).await?;
    txn.queue(Command::new("INCR").arg_slice(b"t")).await?;
    assert_eq!(txn.queued(), 2);

    let results = txn.exec().await?;
    assert_eq!(results, vec![
        Value::Simple("OK".to_string()),
        Value::Int(2)
    ]);
    assert_eq!(server.get_raw(b"t"), Some(b"2".to_vec()));
    Ok(())
}

#[tokio::test]
async fn concurrent_write_to_watched_key_aborts_exec() -> Result<()> {
    let server = MiniServer::spawn(Behavior::default()).await;
    let mut conn1 = connect(&server).await;
    let mut conn2 = connect(&server).await;

    let watched = [Bytes::from_static(b"k")];
    let mut txn = Transaction::begin(&mut conn1, &watched).await?;
    txn.queue(Command::set(b"k", b"v1")).await?;

    // Another client races a write in between WATCH and EXEC.
    conn2.call(&Command::set(b"k", b"v2")).await?;

    match txn.exec().await {
        Err(ClientError::TransactionAborted) => {},
        other => panic!("expected TransactionAborted, got {other:?}"),
    }
    assert_eq!(server.get_raw(b"k"), Some(b"v2".to_vec()));
    Ok(())
}

#[tokio::test]
async fn discard_releases_the_transaction() -> Result<()> {
    let server = MiniServer::spawn(Behavior::default()).await;
    let mut conn = connect(&server).await;

    let mut txn = Transaction::begin(&mut conn, &[]).await?;
    txn.queue(Command::set(b"d", b"x")).await?;
    txn.discard().await?;

    assert_eq!(server.get_raw(b"d"), None);
    // The connection is reusable right away.
    let reply = conn.call(&Command::ping()).await?;
    assert!(reply.is_status("PONG"));
    Ok(())
}
