// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Mutex;

use tokio::time::Instant;
use tracing::debug;

use crate::{
    cfg::config::CircuitConfig,
    events::{Event, EventBus},
    models::error::ClientError,
};

/// Observable breaker state. Timestamps come from the monotonic
/// clock, never wall time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open { since: Instant },
    HalfOpen { since: Instant },
}

impl CircuitState {
    fn name(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen { .. } => "half-open",
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    transitions: u64,
    half_open_probes: u32,
}

/// Three-state circuit breaker.
///
/// Closed forwards and counts consecutive transient failures; at the
/// threshold it opens. Open rejects without I/O until the open timeout
/// elapses, then admits limited half-open probes. Enough consecutive
/// probe successes close the circuit again; any probe failure snaps it
/// back open, as does lingering in half-open past its own timeout
/// without a single success. All transitions happen under one lock, so
/// no observer ever sees them out of order.
#[derive(Debug)]
pub struct CircuitBreaker {
    cfg: CircuitConfig,
    inner: Mutex<BreakerInner>,
    events: EventBus,
}

impl CircuitBreaker {
    pub fn new(cfg: CircuitConfig, events: EventBus) -> Self {
        Self {
            cfg,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                transitions: 0,
                half_open_probes: 0,
            }),
            events,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner
            .lock()
            .map(|inner| inner.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn transitions(&self) -> u64 {
        self.inner.lock().map(|inner| inner.transitions).unwrap_or(0)
    }

    /// Admission check; called before any I/O. Performs the lazy
    /// Open -> HalfOpen transition when the open timeout has passed.
    pub fn try_acquire(&self) -> Result<(), ClientError> {
        let Ok(mut inner) = self.inner.lock() else {
            return Ok(());
        };
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open { since } => {
                if since.elapsed() >= self.cfg.open_for {
                    let now = Instant::now();
                    self.transition(&mut inner, CircuitState::HalfOpen { since: now });
                    inner.half_open_probes = 1;
                    Ok(())
                } else {
                    Err(ClientError::CircuitOpen)
                }
            },
            CircuitState::HalfOpen { since } => {
                if inner.consecutive_successes == 0
                    && since.elapsed() >= self.cfg.half_open_for
                {
                    let now = Instant::now();
                    self.transition(&mut inner, CircuitState::Open { since: now });
                    return Err(ClientError::CircuitOpen);
                }
                if inner.half_open_probes < self.cfg.success_threshold {
                    inner.half_open_probes += 1;
                    Ok(())
                } else {
                    Err(ClientError::CircuitOpen)
                }
            },
        }
    }

    pub fn record_success(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.consecutive_successes = inner.consecutive_successes.saturating_add(1);
            },
            CircuitState::HalfOpen { .. } => {
                inner.half_open_probes = inner.half_open_probes.saturating_sub(1);
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.cfg.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                    inner.consecutive_failures = 0;
                }
            },
            // A late success from a call admitted before opening.
            CircuitState::Open { .. } => {},
        }
    }

    pub fn record_failure(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_successes = 0;
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.cfg.failure_threshold {
                    let now = Instant::now();
                    self.transition(&mut inner, CircuitState::Open { since: now });
                }
            },
            CircuitState::HalfOpen { .. } => {
                let now = Instant::now();
                self.transition(&mut inner, CircuitState::Open { since: now });
            },
            CircuitState::Open { .. } => {},
        }
    }

    /// Wraps one attempt. Transient failures feed the failure counter;
    /// permanent errors mean the service answered and count as
    /// successes for breaker purposes.
    pub async fn call<T, F>(&self, op: F) -> Result<T, ClientError>
    where
        F: AsyncFnOnce() -> Result<T, ClientError>,
    {
        self.try_acquire()?;
        match op().await {
            Ok(v) => {
                self.record_success();
                Ok(v)
            },
            Err(e) => {
                if e.is_transient() {
                    self.record_failure();
                } else {
                    self.record_success();
                }
                Err(e)
            },
        }
    }

    /// Like [`CircuitBreaker::call`], but an open circuit diverts to
    /// `fallback` instead of erroring.
    pub async fn call_with_fallback<T, F, FB>(
        &self,
        op: F,
        fallback: FB,
    ) -> Result<T, ClientError>
    where
        F: AsyncFnOnce() -> Result<T, ClientError>,
        FB: FnOnce(ClientError) -> Result<T, ClientError>,
    {
        match self.call(op).await {
            Err(e @ ClientError::CircuitOpen) => fallback(e),
            other => other,
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        debug!("circuit {} -> {}", from.name(), to.name());
        inner.state = to;
        inner.transitions += 1;
        inner.consecutive_successes = 0;
        inner.half_open_probes = 0;
        self.events.emit(Event::CircuitStateChanged {
            from: from.name(),
            to: to.name(),
        });
    }
}
