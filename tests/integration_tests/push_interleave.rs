// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A raw scripted socket, below even the stand-in server: the reply
//! bytes are fixed so a push frame can be planted exactly between two
//! pipelined replies.

use std::time::Duration;

use anyhow::Result;
use resp_client_rs::{
    client::connection::Connection,
    events::EventBus,
    models::{command::Command, value::Value},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};

use crate::integration_tests::common::test_config;

const HELLO_REPLY: &[u8] = b"%1\r\n$5\r\nproto\r\n:3\r\n";
const INTERLEAVED: &[u8] =
    b"+one\r\n>3\r\n$7\r\nmessage\r\n$2\r\nch\r\n$2\r\nhi\r\n+two\r\n";

async fn read_commands(
    socket: &mut tokio::net::TcpStream,
    token: &[u8],
    count: usize,
) -> Result<()> {
    let mut seen = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let occurrences = seen
            .windows(token.len())
            .filter(|w| *w == token)
            .count();
        if occurrences >= count {
            return Ok(());
        }
        let n = socket.read(&mut chunk).await?;
        anyhow::ensure!(n > 0, "client hung up mid-script");
        seen.extend_from_slice(&chunk[..n]);
    }
}

#[tokio::test]
async fn push_between_pipelined_replies_is_routed_aside() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();

    let script = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        read_commands(&mut socket, b"HELLO", 1).await.expect("hello");
        socket.write_all(HELLO_REPLY).await.expect("hello reply");
        read_commands(&mut socket, b"PING", 2).await.expect("pipeline");
        socket.write_all(INTERLEAVED).await.expect("replies");
        socket
    });

    let mut conn =
        Connection::connect(test_config(&addr), EventBus::default()).await?;
    let replies = conn
        .call_pipeline(
            &[Command::ping(), Command::ping()],
            Duration::from_secs(2),
        )
        .await?;

    // Reply order is undisturbed by the interleaved push...
    assert_eq!(replies.len(), 2);
    assert_eq!(
        replies[0].as_ref().expect("first"),
        &Value::Simple("one".to_string())
    );
    assert_eq!(
        replies[1].as_ref().expect("second"),
        &Value::Simple("two".to_string())
    );

    // ...which waits, intact, in the side queue.
    let pushes = conn.take_pending_pushes();
    assert_eq!(pushes.len(), 1);
    assert_eq!(
        pushes[0][0].as_bytes(),
        Some(b"message".as_slice())
    );
    assert_eq!(pushes[0][2].as_bytes(), Some(b"hi".as_slice()));

    drop(script);
    Ok(())
}
