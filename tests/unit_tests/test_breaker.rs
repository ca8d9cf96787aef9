// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use resp_client_rs::{
    cfg::config::CircuitConfig,
    events::{EventBus, EventKind},
    models::error::ClientError,
    resilience::breaker::{CircuitBreaker, CircuitState},
};

fn tuned() -> CircuitConfig {
    CircuitConfig {
        failure_threshold: 3,
        success_threshold: 2,
        open_for: Duration::from_secs(1),
        half_open_for: Duration::from_secs(10),
    }
}

fn transient() -> ClientError {
    ClientError::ClosedByPeer
}

#[tokio::test(start_paused = true)]
async fn the_documented_transition_timeline() {
    let breaker = CircuitBreaker::new(tuned(), EventBus::default());

    // Three consecutive failures open the circuit.
    for _ in 0..3 {
        let r: Result<(), _> = breaker.call(async || Err(transient())).await;
        assert!(r.is_err());
    }
    assert!(matches!(breaker.state(), CircuitState::Open { .. }));

    // While open, calls are rejected without running the operation.
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ran);
    let rejected = breaker
        .call(async move || {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .await;
    assert!(matches!(rejected, Err(ClientError::CircuitOpen)));
    assert_eq!(ran.load(Ordering::Relaxed), 0);

    // After the open timeout the next call probes in half-open.
    tokio::time::advance(Duration::from_millis(1_100)).await;
    breaker.call(async || Ok(())).await.expect("first probe");
    assert!(matches!(breaker.state(), CircuitState::HalfOpen { .. }));

    // The second consecutive success closes it.
    breaker.call(async || Ok(())).await.expect("second probe");
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn a_half_open_failure_snaps_back_to_open() {
    let breaker = CircuitBreaker::new(tuned(), EventBus::default());
    for _ in 0..3 {
        breaker.record_failure();
    }
    tokio::time::advance(Duration::from_millis(1_100)).await;

    breaker.try_acquire().expect("probe admitted");
    assert!(matches!(breaker.state(), CircuitState::HalfOpen { .. }));
    breaker.record_failure();
    assert!(matches!(breaker.state(), CircuitState::Open { .. }));
}

#[tokio::test(start_paused = true)]
async fn an_interleaved_success_resets_the_failure_count() {
    let breaker = CircuitBreaker::new(tuned(), EventBus::default());
    breaker.record_failure();
    breaker.record_failure();
    breaker.record_success();
    breaker.record_failure();
    breaker.record_failure();
    // Never three in a row, so still closed.
    assert_eq!(breaker.state(), CircuitState::Closed);
    breaker.record_failure();
    assert!(matches!(breaker.state(), CircuitState::Open { .. }));
}

#[tokio::test(start_paused = true)]
async fn half_open_probe_count_is_bounded() {
    let breaker = CircuitBreaker::new(tuned(), EventBus::default());
    for _ in 0..3 {
        breaker.record_failure();
    }
    tokio::time::advance(Duration::from_millis(1_100)).await;

    // success_threshold = 2 concurrent probes; the third is rejected.
    breaker.try_acquire().expect("probe one");
    breaker.try_acquire().expect("probe two");
    assert!(matches!(
        breaker.try_acquire(),
        Err(ClientError::CircuitOpen)
    ));
}

#[tokio::test(start_paused = true)]
async fn lingering_half_open_without_success_reopens() {
    let breaker = CircuitBreaker::new(tuned(), EventBus::default());
    for _ in 0..3 {
        breaker.record_failure();
    }
    tokio::time::advance(Duration::from_millis(1_100)).await;
    breaker.try_acquire().expect("enter half-open");

    tokio::time::advance(Duration::from_secs(11)).await;
    assert!(matches!(
        breaker.try_acquire(),
        Err(ClientError::CircuitOpen)
    ));
    assert!(matches!(breaker.state(), CircuitState::Open { .. }));
}

#[tokio::test(start_paused = true)]
async fn permanent_errors_do_not_trip_the_breaker() {
    let breaker = CircuitBreaker::new(tuned(), EventBus::default());
    for _ in 0..10 {
        let r: Result<(), _> = breaker
            .call(async || {
                Err(ClientError::Server(
                    resp_client_rs::models::error::ServerError::parse("ERR app bug"),
                ))
            })
            .await;
        assert!(r.is_err());
    }
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn transitions_are_published() {
    let events = EventBus::default();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    events.subscribe(
        EventKind::CircuitStateChanged,
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }),
    );
    let breaker = CircuitBreaker::new(tuned(), events);

    for _ in 0..3 {
        breaker.record_failure();
    }
    tokio::time::advance(Duration::from_millis(1_100)).await;
    breaker.try_acquire().expect("half-open probe");
    breaker.record_success();
    breaker.record_success();

    // closed->open, open->half-open, half-open->closed.
    assert_eq!(seen.load(Ordering::Relaxed), 3);
    assert_eq!(breaker.transitions(), 3);
}
