// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use resp_client_rs::{
    client::pool::{Concurrency, Pool},
    events::{Event, EventBus, EventKind},
    models::error::ClientError,
};

use crate::integration_tests::common::{Behavior, MiniServer, test_config};

#[tokio::test]
async fn checkout_reuses_a_returned_connection() -> Result<()> {
    let server = MiniServer::spawn(Behavior::default()).await;
    let mut cfg = (*test_config(&server.addr)).clone();
    cfg.pool.size = 2;
    let events = EventBus::default();
    let created = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&created);
    events.subscribe(
        EventKind::ConnectionCreated,
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }),
    );

    let pool = Pool::new(Arc::new(cfg), events);
    assert_eq!(pool.concurrency(), Concurrency::CooperativeTasks);

    let mut conn = pool.checkout().await?;
    conn.ping().await?;
    drop(conn);
    assert_eq!(pool.idle_count(), 1);

    let mut again = pool.checkout().await?;
    again.ping().await?;
    drop(again);

    // Both checkouts were served by one dialed connection.
    assert_eq!(created.load(Ordering::Relaxed), 1);
    pool.close().await;
    Ok(())
}

#[tokio::test]
async fn exhausted_pool_reports_after_the_wait_deadline() -> Result<()> {
    let server = MiniServer::spawn(Behavior::default()).await;
    let mut cfg = (*test_config(&server.addr)).clone();
    cfg.pool.size = 1;
    cfg.pool.wait = Duration::from_millis(100);
    let events = EventBus::default();
    let exhausted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&exhausted);
    events.subscribe(
        EventKind::PoolExhausted,
        Arc::new(move |event| {
            if matches!(event, Event::PoolExhausted { size: 1, .. }) {
                counter.fetch_add(1, Ordering::Relaxed);
            }
            Ok(())
        }),
    );

    let pool = Pool::new(Arc::new(cfg), events);
    let held = pool.checkout().await?;

    match pool.checkout().await {
        Err(ClientError::PoolExhausted { size: 1, waited }) => {
            assert!(waited >= Duration::from_millis(100));
        },
        other => panic!("expected PoolExhausted, got {other:?}"),
    }
    assert_eq!(exhausted.load(Ordering::Relaxed), 1);

    // Returning the held connection unblocks the next checkout.
    drop(held);
    let conn = pool.checkout().await?;
    drop(conn);
    pool.close().await;
    Ok(())
}

#[tokio::test]
async fn closed_pool_refuses_checkouts() -> Result<()> {
    let server = MiniServer::spawn(Behavior::default()).await;
    let pool = Pool::new(test_config(&server.addr), EventBus::default());

    let conn = pool.checkout().await?;
    drop(conn);
    pool.close().await;

    match pool.checkout().await {
        Err(ClientError::PoolClosed) => {},
        other => panic!("expected PoolClosed, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn dead_connection_is_not_returned_to_the_pool() -> Result<()> {
    let server = MiniServer::spawn(Behavior::default()).await;
    let mut cfg = (*test_config(&server.addr)).clone();
    cfg.pool.size = 1;
    let pool = Pool::new(Arc::new(cfg), EventBus::default());

    let conn = pool.checkout().await?;
    conn.discard(resp_client_rs::events::DisconnectReason::Error)
        .await;
    assert_eq!(pool.idle_count(), 0);

    // The next checkout dials fresh instead of handing back a corpse.
    let mut fresh = pool.checkout().await?;
    fresh.ping().await?;
    drop(fresh);
    pool.close().await;
    Ok(())
}
