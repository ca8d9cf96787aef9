// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use resp_client_rs::{
    client::pipeline::Pipeline,
    models::{command::Command, value::Value},
};

use crate::integration_tests::common::{Behavior, MiniServer, connect};

#[tokio::test]
async fn error_in_the_middle_leaves_other_replies_aligned() -> Result<()> {
    let server = MiniServer::spawn(Behavior::default()).await;
    let mut conn = connect(&server).await;

    let replies = Pipeline::new()
        .cmd(Command::set(b"a", b"1"))
        .cmd(Command::new("INCR").arg_slice(b"a"))
        .cmd(Command::new("LPUSH").arg_slice(b"a").arg_slice(b"x"))
        .cmd(Command::get(b"a"))
        .execute(&mut conn)
        .await?;

    assert_eq!(replies.len(), 4);
    assert_eq!(
        replies[0].as_ref().expect("SET reply"),
        &Value::Simple("OK".to_string())
    );
    assert_eq!(replies[1].as_ref().expect("INCR reply"), &Value::Int(2));
    let err = replies[2].as_ref().expect_err("LPUSH must fail");
    assert_eq!(err.prefix, "WRONGTYPE");
    assert_eq!(
        replies[3].as_ref().expect("GET reply").as_bytes(),
        Some(b"2".as_slice())
    );

    // The connection is still healthy after a per-command error.
    conn.ping().await?;
    Ok(())
}

#[tokio::test]
async fn empty_pipeline_is_a_no_op() -> Result<()> {
    let server = MiniServer::spawn(Behavior::default()).await;
    let mut conn = connect(&server).await;

    let replies = Pipeline::new().execute(&mut conn).await?;
    assert!(replies.is_empty());
    Ok(())
}
