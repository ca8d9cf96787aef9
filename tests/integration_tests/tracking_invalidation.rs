// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use resp_client_rs::{
    cache::CachedClient,
    cfg::config::TrackingConfig,
    cfg::enums::TrackingMode,
    client::connection::Connection,
    events::EventBus,
    models::command::Command,
};

use crate::integration_tests::common::{Behavior, MiniServer, test_config};

async fn tracking_client(server: &MiniServer) -> Result<CachedClient> {
    let mut cfg = (*test_config(&server.addr)).clone();
    cfg.tracking = Some(TrackingConfig {
        mode: TrackingMode::Default,
        prefixes: Vec::new(),
        max_entries: 128,
        ttl: None,
    });
    let conn = Connection::connect(Arc::new(cfg), EventBus::default()).await?;
    Ok(CachedClient::new(conn)?)
}

#[tokio::test]
async fn second_read_is_served_from_cache() -> Result<()> {
    let server = MiniServer::spawn(Behavior::default()).await;
    let mut client = tracking_client(&server).await?;

    let mut seed = crate::integration_tests::common::connect(&server).await;
    seed.call(&Command::set(b"cfg", b"v1")).await?;

    assert_eq!(client.get(b"cfg").await?.as_deref(), Some(b"v1".as_slice()));
    assert_eq!(client.get(b"cfg").await?.as_deref(), Some(b"v1".as_slice()));
    assert_eq!(client.cache().hit_count(), 1);
    assert_eq!(client.cache().len(), 1);
    Ok(())
}

#[tokio::test]
async fn invalidation_push_forces_a_refetch() -> Result<()> {
    let server = MiniServer::spawn(Behavior::default()).await;
    let mut client = tracking_client(&server).await?;

    let mut seed = crate::integration_tests::common::connect(&server).await;
    seed.call(&Command::set(b"cfg", b"v1")).await?;
    assert_eq!(client.get(b"cfg").await?.as_deref(), Some(b"v1".as_slice()));

    // The value changes and the server pushes an invalidation while
    // the caching client sits idle. Give the bytes a moment to land in
    // its socket buffer.
    seed.call(&Command::set(b"cfg", b"v2")).await?;
    server.invalidate(&[b"cfg"]);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The next get must read through to the server, not the cache.
    assert_eq!(client.get(b"cfg").await?.as_deref(), Some(b"v2".as_slice()));
    Ok(())
}

#[tokio::test]
async fn poll_invalidations_waits_for_a_push() -> Result<()> {
    let server = MiniServer::spawn(Behavior::default()).await;
    let mut client = tracking_client(&server).await?;

    let mut seed = crate::integration_tests::common::connect(&server).await;
    seed.call(&Command::set(b"cfg", b"v1")).await?;
    assert_eq!(client.get(b"cfg").await?.as_deref(), Some(b"v1".as_slice()));

    server.invalidate(&[b"cfg"]);
    let evicted = client.poll_invalidations(Duration::from_millis(500)).await?;
    assert_eq!(evicted, 1);
    assert!(client.cache().is_empty());

    // Nothing further to deliver: the wait times out quietly.
    let evicted = client.poll_invalidations(Duration::from_millis(50)).await?;
    assert_eq!(evicted, 0);
    Ok(())
}

#[tokio::test]
async fn explicit_invalidate_and_clear() -> Result<()> {
    let server = MiniServer::spawn(Behavior::default()).await;
    let mut client = tracking_client(&server).await?;

    let mut seed = crate::integration_tests::common::connect(&server).await;
    seed.call(&Command::set(b"a", b"1")).await?;
    seed.call(&Command::set(b"b", b"2")).await?;

    client.get(b"a").await?;
    client.get(b"b").await?;
    assert_eq!(client.cache().len(), 2);

    assert!(client.cache().invalidate(b"a"));
    assert_eq!(client.cache().len(), 1);
    client.cache().clear();
    assert!(client.cache().is_empty());
    Ok(())
}
