// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::debug;

use crate::{cfg::config::RetryConfig, models::error::ClientError};

/// How long to wait before retry `k` (k >= 1).
///
/// The exponential variants derive the raw delay from
/// `base * 2^(k-1)` clamped to `cap`; at k=1 the raw delay is exactly
/// `base`, never less. Full jitter draws uniformly from `[0, raw]`,
/// equal jitter from `raw/2 + [0, raw/2]`.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "strategy", rename_all = "kebab-case", deny_unknown_fields)]
pub enum BackoffStrategy {
    NoBackoff,
    Constant { delay_ms: u64 },
    Exponential { base_ms: u64, cap_ms: u64 },
    ExponentialFullJitter { base_ms: u64, cap_ms: u64 },
    ExponentialEqualJitter { base_ms: u64, cap_ms: u64 },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::ExponentialFullJitter {
            base_ms: 50,
            cap_ms: 5_000,
        }
    }
}

impl BackoffStrategy {
    pub fn delay(&self, retry: u32) -> Duration {
        let ms = match *self {
            BackoffStrategy::NoBackoff => 0,
            BackoffStrategy::Constant { delay_ms } => delay_ms,
            BackoffStrategy::Exponential { base_ms, cap_ms } => {
                raw_delay(base_ms, cap_ms, retry)
            },
            BackoffStrategy::ExponentialFullJitter { base_ms, cap_ms } => {
                let raw = raw_delay(base_ms, cap_ms, retry);
                rand::rng().random_range(0..=raw)
            },
            BackoffStrategy::ExponentialEqualJitter { base_ms, cap_ms } => {
                let raw = raw_delay(base_ms, cap_ms, retry);
                raw / 2 + rand::rng().random_range(0..=raw.div_ceil(2))
            },
        };
        Duration::from_millis(ms)
    }

    /// The clamp every jittered delay stays under.
    pub fn cap(&self) -> Duration {
        let ms = match *self {
            BackoffStrategy::NoBackoff => 0,
            BackoffStrategy::Constant { delay_ms } => delay_ms,
            BackoffStrategy::Exponential { cap_ms, .. }
            | BackoffStrategy::ExponentialFullJitter { cap_ms, .. }
            | BackoffStrategy::ExponentialEqualJitter { cap_ms, .. } => cap_ms,
        };
        Duration::from_millis(ms)
    }
}

fn raw_delay(base_ms: u64, cap_ms: u64, retry: u32) -> u64 {
    let exp = retry.saturating_sub(1).min(31);
    base_ms.saturating_mul(1u64 << exp).min(cap_ms)
}

/// Bounded retries over the designated transient-error set.
///
/// Permanent errors (protocol, authentication, application-level
/// server errors) surface immediately; transient ones are retried up
/// to `max_attempts` with the configured backoff between attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            backoff: cfg.backoff,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: BackoffStrategy) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Runs `op` until it succeeds, fails permanently, or the attempt
    /// budget is spent. The closure receives the 1-based attempt
    /// number; redirect handling that updates topology first still
    /// consumes its attempt.
    pub async fn run<T, F>(&self, mut op: F) -> Result<T, ClientError>
    where
        F: AsyncFnMut(u32) -> Result<T, ClientError>,
    {
        let mut last: Option<ClientError> = None;
        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                let delay = self.backoff.delay(attempt - 1);
                debug!("retry {attempt}/{} after {delay:?}", self.max_attempts);
                sleep(delay).await;
            }
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() => last = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(ClientError::RetryExhausted {
            attempts: self.max_attempts,
            last: Box::new(last.unwrap_or(ClientError::ConnectionClosed)),
        })
    }

    /// Like [`RetryPolicy::run`], invoking `fallback` once the budget
    /// is spent; the fallback may substitute a value or re-raise.
    pub async fn run_with_fallback<T, F, FB>(
        &self,
        op: F,
        fallback: FB,
    ) -> Result<T, ClientError>
    where
        F: AsyncFnMut(u32) -> Result<T, ClientError>,
        FB: FnOnce(ClientError) -> Result<T, ClientError>,
    {
        match self.run(op).await {
            Err(e @ ClientError::RetryExhausted { .. }) => fallback(e),
            other => other,
        }
    }
}
