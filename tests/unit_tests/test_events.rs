// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::anyhow;
use resp_client_rs::{
    cfg::{config::EventConfig, enums::ErrorStrategy},
    events::{Event, EventBus, EventKind},
};

fn connected_event() -> Event {
    Event::Connected {
        addr: "localhost:6379".to_string(),
        first_time: true,
    }
}

#[test]
fn handlers_only_see_their_subscribed_kind() {
    let bus = EventBus::default();
    let connected = Arc::new(AtomicUsize::new(0));
    let disconnected = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&connected);
    bus.subscribe(
        EventKind::Connected,
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }),
    );
    let counter = Arc::clone(&disconnected);
    bus.subscribe(
        EventKind::Disconnected,
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }),
    );

    bus.publish(connected_event()).expect("publish");
    bus.publish(connected_event()).expect("publish");
    assert_eq!(connected.load(Ordering::Relaxed), 2);
    assert_eq!(disconnected.load(Ordering::Relaxed), 0);
}

#[test]
fn unsubscribe_stops_delivery() {
    let bus = EventBus::default();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let token = bus.subscribe(
        EventKind::Connected,
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }),
    );

    bus.publish(connected_event()).expect("publish");
    bus.unsubscribe(token);
    bus.publish(connected_event()).expect("publish");
    assert_eq!(seen.load(Ordering::Relaxed), 1);
}

#[test]
fn raise_strategy_propagates_and_log_does_not() {
    let raising = EventBus::new(&EventConfig {
        error_strategy: ErrorStrategy::Raise,
        ..EventConfig::default()
    });
    raising.subscribe(
        EventKind::Connected,
        Arc::new(|_| Err(anyhow!("handler exploded"))),
    );
    assert!(raising.publish(connected_event()).is_err());

    let logging = EventBus::new(&EventConfig {
        error_strategy: ErrorStrategy::Log,
        ..EventConfig::default()
    });
    let after = Arc::new(AtomicUsize::new(0));
    logging.subscribe(
        EventKind::Connected,
        Arc::new(|_| Err(anyhow!("handler exploded"))),
    );
    let counter = Arc::clone(&after);
    logging.subscribe(
        EventKind::Connected,
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }),
    );
    // The failing handler does not stop the next one.
    logging.publish(connected_event()).expect("log strategy");
    assert_eq!(after.load(Ordering::Relaxed), 1);
}

#[test]
fn async_executor_delivers_off_the_publishing_thread() {
    let bus = EventBus::new(&EventConfig {
        executor_pool_size: Some(2),
        queue_size: 64,
        ..EventConfig::default()
    });
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    bus.subscribe(
        EventKind::Connected,
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }),
    );

    for _ in 0..10 {
        bus.publish(connected_event()).expect("enqueue");
    }

    let deadline = Instant::now() + Duration::from_secs(2);
    while seen.load(Ordering::Relaxed) < 10 {
        assert!(Instant::now() < deadline, "worker pool never drained");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn dropping_the_bus_stops_the_workers() {
    let bus = EventBus::new(&EventConfig {
        executor_pool_size: Some(1),
        queue_size: 8,
        ..EventConfig::default()
    });
    bus.publish(connected_event()).expect("enqueue");
    // Drop must join the worker threads without hanging.
    drop(bus);
}
