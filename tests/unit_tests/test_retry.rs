// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use resp_client_rs::{
    models::error::{ClientError, ServerError},
    resilience::retry::{BackoffStrategy, RetryPolicy},
};

fn transient() -> ClientError {
    ClientError::Timeout("read fill")
}

fn permanent() -> ClientError {
    ClientError::Server(ServerError::parse("WRONGTYPE bad operation"))
}

#[test]
fn exponential_raw_delays_double_and_clamp() {
    let backoff = BackoffStrategy::Exponential {
        base_ms: 100,
        cap_ms: 450,
    };
    assert_eq!(backoff.delay(1), Duration::from_millis(100));
    assert_eq!(backoff.delay(2), Duration::from_millis(200));
    assert_eq!(backoff.delay(3), Duration::from_millis(400));
    assert_eq!(backoff.delay(4), Duration::from_millis(450));
    // Huge attempt numbers must not overflow, only clamp.
    assert_eq!(backoff.delay(64), Duration::from_millis(450));
}

#[test]
fn jittered_delays_stay_inside_their_bounds() {
    let full = BackoffStrategy::ExponentialFullJitter {
        base_ms: 100,
        cap_ms: 800,
    };
    let equal = BackoffStrategy::ExponentialEqualJitter {
        base_ms: 100,
        cap_ms: 800,
    };
    for retry in 1..=6 {
        let raw = 100u64.saturating_mul(1 << (retry - 1)).min(800);
        for _ in 0..64 {
            let d = full.delay(retry as u32).as_millis() as u64;
            assert!(d <= raw, "full jitter {d} above raw {raw}");
            assert!(d <= full.cap().as_millis() as u64);

            let d = equal.delay(retry as u32).as_millis() as u64;
            assert!(d >= raw / 2, "equal jitter {d} below half of {raw}");
            assert!(d <= raw, "equal jitter {d} above raw {raw}");
        }
    }
}

#[test]
fn first_retry_never_drifts_toward_zero() {
    let backoff = BackoffStrategy::ExponentialEqualJitter {
        base_ms: 100,
        cap_ms: 10_000,
    };
    for _ in 0..64 {
        assert!(backoff.delay(1) >= Duration::from_millis(50));
    }
}

#[tokio::test]
async fn transient_failures_consume_the_attempt_budget() {
    let policy = RetryPolicy::new(3, BackoffStrategy::NoBackoff);
    let mut calls = 0u32;
    let result: Result<(), _> = policy
        .run(async |_| {
            calls += 1;
            Err(transient())
        })
        .await;
    assert_eq!(calls, 3);
    match result {
        Err(ClientError::RetryExhausted { attempts: 3, last }) => {
            assert!(matches!(*last, ClientError::Timeout(_)));
        },
        other => panic!("expected RetryExhausted, got {other:?}"),
    }
}

#[tokio::test]
async fn success_stops_retrying_immediately() {
    let policy = RetryPolicy::new(5, BackoffStrategy::NoBackoff);
    let mut calls = 0u32;
    let result = policy
        .run(async |attempt| {
            calls += 1;
            if attempt < 3 {
                Err(transient())
            } else {
                Ok(attempt)
            }
        })
        .await;
    assert_eq!(result.expect("third attempt succeeds"), 3);
    assert_eq!(calls, 3);
}

#[tokio::test]
async fn permanent_errors_short_circuit() {
    let policy = RetryPolicy::new(5, BackoffStrategy::NoBackoff);
    let mut calls = 0u32;
    let result: Result<(), _> = policy
        .run(async |_| {
            calls += 1;
            Err(permanent())
        })
        .await;
    assert_eq!(calls, 1);
    assert!(matches!(result, Err(ClientError::Server(_))));
}

#[tokio::test]
async fn loading_and_moved_are_transient_but_auth_is_not() {
    assert!(ClientError::Server(ServerError::parse("LOADING loading")).is_transient());
    assert!(ClientError::Server(ServerError::parse("BUSY busy")).is_transient());
    assert!(
        ClientError::Server(ServerError::parse("MOVED 1 h:1")).is_transient()
    );
    assert!(
        ClientError::Server(ServerError::parse("ASK 1 h:1")).is_transient()
    );
    assert!(
        !ClientError::Server(ServerError::parse("NOAUTH Authentication required"))
            .is_transient()
    );
    assert!(!ClientError::Decode(resp_client_rs::models::error::DecodeError {
        kind: resp_client_rs::models::error::DecodeKind::ProtocolMismatch,
        at_offset: 0,
    })
    .is_transient());
}

#[tokio::test]
async fn fallback_substitutes_after_exhaustion() {
    let policy = RetryPolicy::new(2, BackoffStrategy::NoBackoff);
    let result = policy
        .run_with_fallback(async |_| Err::<i32, _>(transient()), |_| Ok(-1))
        .await;
    assert_eq!(result.expect("fallback value"), -1);
}
