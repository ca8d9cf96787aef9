// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use resp_client_rs::{
    models::{command::Command, error::ClientError},
    resilience::retry::{BackoffStrategy, RetryPolicy},
};

use crate::integration_tests::common::{Behavior, MiniServer, connect};

#[tokio::test]
async fn loading_errors_are_retried_until_the_server_warms_up() -> Result<()> {
    let server = MiniServer::spawn(Behavior {
        loading_failures: 2,
        ..Behavior::default()
    })
    .await;
    let mut conn = connect(&server).await;

    let policy = RetryPolicy::new(3, BackoffStrategy::Constant { delay_ms: 10 });
    let reply = policy
        .run(async |_attempt| conn.call(&Command::set(b"warm", b"up")).await)
        .await;
    drop(reply.expect("third attempt must succeed"));
    assert_eq!(server.get_raw(b"warm"), Some(b"up".to_vec()));
    Ok(())
}

#[tokio::test]
async fn budget_exhaustion_surfaces_retry_exhausted() -> Result<()> {
    let server = MiniServer::spawn(Behavior {
        loading_failures: 10,
        ..Behavior::default()
    })
    .await;
    let mut conn = connect(&server).await;

    let policy = RetryPolicy::new(2, BackoffStrategy::NoBackoff);
    match policy
        .run(async |_| conn.call(&Command::set(b"k", b"v")).await)
        .await
    {
        Err(ClientError::RetryExhausted { attempts: 2, .. }) => {},
        other => panic!("expected RetryExhausted, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn permanent_errors_are_never_retried() -> Result<()> {
    let server = MiniServer::spawn(Behavior::default()).await;
    let mut conn = connect(&server).await;
    conn.call(&Command::new("LPUSH").arg_slice(b"l").arg_slice(b"x"))
        .await?;

    let policy = RetryPolicy::new(3, BackoffStrategy::NoBackoff);
    let mut attempts = 0;
    let result = policy
        .run(async |n| {
            attempts = n;
            conn.call(&Command::get(b"l")).await
        })
        .await;

    match result {
        Err(ClientError::Server(e)) => assert_eq!(e.prefix, "WRONGTYPE"),
        other => panic!("expected WRONGTYPE, got {other:?}"),
    }
    assert_eq!(attempts, 1);
    Ok(())
}
