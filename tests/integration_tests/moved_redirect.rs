// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::HashMap;

use anyhow::Result;
use resp_client_rs::{
    client::pipeline::Pipeline,
    events::EventBus,
    models::{command::Command, error::ErrorKind},
    topology::{cluster::ClusterRouter, slot::hash_slot},
};

use crate::integration_tests::common::{Behavior, MiniServer, connect, test_config};

#[tokio::test]
async fn moved_updates_the_map_and_retries_on_the_new_node() -> Result<()> {
    // Node B owns the key; node A bounces it with MOVED.
    let node_b = MiniServer::spawn(Behavior::default()).await;
    let slot = hash_slot(b"foo");
    let node_a = MiniServer::spawn(Behavior {
        moved: HashMap::from([(b"foo".to_vec(), (slot, node_b.addr.clone()))]),
        ..Behavior::default()
    })
    .await;

    // Seed the key where it actually lives.
    let mut seed = connect(&node_b).await;
    seed.call(&Command::set(b"foo", b"bar")).await?;

    let router = ClusterRouter::new(test_config(&node_a.addr), EventBus::default());
    let reply = router.execute(b"foo", &Command::get(b"foo")).await?;
    assert_eq!(reply.as_bytes(), Some(b"bar".as_slice()));

    // The redirect was recorded: the slot now resolves to node B.
    assert_eq!(
        router.slots().node_for(slot),
        Some(node_b.addr.parse()?)
    );
    router.close().await;
    Ok(())
}

#[tokio::test]
async fn moved_inside_a_pipeline_stays_per_command() -> Result<()> {
    let node_b = MiniServer::spawn(Behavior::default()).await;
    let slot = hash_slot(b"elsewhere");
    let node_a = MiniServer::spawn(Behavior {
        moved: HashMap::from([(b"elsewhere".to_vec(), (slot, node_b.addr.clone()))]),
        ..Behavior::default()
    })
    .await;
    let mut conn = connect(&node_a).await;

    let replies = Pipeline::new()
        .cmd(Command::set(b"local", b"1"))
        .cmd(Command::get(b"elsewhere"))
        .cmd(Command::get(b"local"))
        .execute(&mut conn)
        .await?;

    assert!(replies[0].is_ok());
    let moved = replies[1].as_ref().expect_err("redirect expected");
    assert!(matches!(moved.kind(), ErrorKind::Moved { .. }));
    // The commands around the redirect were not disturbed.
    assert_eq!(
        replies[2].as_ref().expect("GET local").as_bytes(),
        Some(b"1".as_slice())
    );
    Ok(())
}
