// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use resp_client_rs::{
    cfg::enums::SubscriptionKind,
    client::pubsub::{PushKind, Subscriber},
    models::{command::Command, error::ClientError},
};

use crate::integration_tests::common::{Behavior, MiniServer, connect};

const RECV: Duration = Duration::from_secs(2);

#[tokio::test]
async fn subscribe_receives_published_messages() -> Result<()> {
    let server = MiniServer::spawn(Behavior::default()).await;
    let conn = connect(&server).await;
    let mut subscriber = Subscriber::new(conn);

    let channels = [Bytes::from_static(b"news")];
    subscriber.subscribe(SubscriptionKind::Channel, &channels).await?;

    let confirm = subscriber.next_message(RECV).await?;
    assert_eq!(confirm.kind, PushKind::Subscribe);
    assert_eq!(confirm.channel.as_deref(), Some(b"news".as_slice()));

    assert_eq!(server.publish(b"news", b"breaking"), 1);
    let msg = subscriber.next_message(RECV).await?;
    assert_eq!(msg.kind, PushKind::Message);
    assert_eq!(msg.channel.as_deref(), Some(b"news".as_slice()));
    assert_eq!(msg.payload.as_deref(), Some(b"breaking".as_slice()));
    Ok(())
}

#[tokio::test]
async fn leaving_subscription_mode_requires_draining() -> Result<()> {
    let server = MiniServer::spawn(Behavior::default()).await;
    let conn = connect(&server).await;
    let mut subscriber = Subscriber::new(conn);

    let channels = [Bytes::from_static(b"ch")];
    subscriber.subscribe(SubscriptionKind::Channel, &channels).await?;
    let _ = subscriber.next_message(RECV).await?;

    assert!(!subscriber.is_drained());
    match subscriber.into_connection().await {
        Err(ClientError::SubscribedMode) => {},
        other => panic!("expected SubscribedMode, got {other:?}"),
    }

    // Re-enter, unsubscribe from everything, and get the connection
    // back for normal use.
    let conn = connect(&server).await;
    let mut subscriber = Subscriber::new(conn);
    subscriber.subscribe(SubscriptionKind::Channel, &channels).await?;
    let _ = subscriber.next_message(RECV).await?;
    subscriber.unsubscribe(SubscriptionKind::Channel, &[]).await?;
    let confirm = subscriber.next_message(RECV).await?;
    assert_eq!(confirm.kind, PushKind::Unsubscribe);
    assert!(subscriber.is_drained());

    let mut conn = subscriber.into_connection().await?;
    let reply = conn.call(&Command::ping()).await?;
    assert!(reply.is_status("PONG"));
    Ok(())
}

#[tokio::test]
async fn dispatch_loop_stops_on_cancellation() -> Result<()> {
    let server = MiniServer::spawn(Behavior::default()).await;
    let conn = connect(&server).await;
    let mut subscriber = Subscriber::new(conn);

    let channels = [Bytes::from_static(b"feed")];
    subscriber.subscribe(SubscriptionKind::Channel, &channels).await?;

    let cancel = tokio_util::sync::CancellationToken::new();
    let stop = cancel.clone();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let loop_task = tokio::spawn(async move {
        let result = subscriber
            .run(
                move |msg| {
                    let _ = tx.send(msg);
                },
                cancel,
            )
            .await;
        (subscriber, result)
    });

    // Confirmation plus one delivery reach the handler.
    tokio::time::sleep(Duration::from_millis(200)).await;
    server.publish(b"feed", b"item-1");

    let confirm = rx.recv().await.expect("confirmation frame");
    assert_eq!(confirm.kind, PushKind::Subscribe);
    let msg = rx.recv().await.expect("published frame");
    assert_eq!(msg.payload.as_deref(), Some(b"item-1".as_slice()));

    stop.cancel();
    let (_subscriber, result) = loop_task.await?;
    result?;
    Ok(())
}
