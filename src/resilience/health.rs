// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::enums::AggregationPolicy,
    client::pool::Pool,
    events::{Event, EventBus},
    models::{command::Command, value::Value},
};

/// Verdict source for the orchestrator. Probes that talk to the data
/// server borrow a pooled connection; the REST probe goes out-of-band
/// over HTTP.
pub enum HealthProbe {
    /// Round-trip a PING.
    Ping,
    /// Fetch an INFO section and apply a predicate to its text.
    InfoSection {
        section: String,
        predicate: Arc<dyn Fn(&str) -> bool + Send + Sync>,
    },
    /// Expect a 2xx from an HTTP endpoint (a sidecar or proxy
    /// health URL).
    Rest { url: String },
    /// On replicas, bound the time since the last master contact;
    /// masters always pass.
    ReplicaLag { max_lag: Duration },
}

impl fmt::Debug for HealthProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthProbe::Ping => f.write_str("Ping"),
            HealthProbe::InfoSection { section, .. } => {
                f.debug_struct("InfoSection").field("section", section).finish()
            },
            HealthProbe::Rest { url } => {
                f.debug_struct("Rest").field("url", url).finish()
            },
            HealthProbe::ReplicaLag { max_lag } => f
                .debug_struct("ReplicaLag")
                .field("max_lag", max_lag)
                .finish(),
        }
    }
}

impl HealthProbe {
    async fn check(&self, pool: &Pool, http: &reqwest::Client) -> bool {
        match self {
            HealthProbe::Ping => match pool.checkout().await {
                Ok(mut conn) => conn.ping().await.is_ok(),
                Err(e) => {
                    debug!("ping probe could not borrow a connection: {e}");
                    false
                },
            },
            HealthProbe::InfoSection { section, predicate } => {
                match info_text(pool, Some(section)).await {
                    Some(text) => predicate(&text),
                    None => false,
                }
            },
            HealthProbe::Rest { url } => match http.get(url).send().await {
                Ok(resp) => resp.status().is_success(),
                Err(e) => {
                    debug!("rest probe {url} failed: {e}");
                    false
                },
            },
            HealthProbe::ReplicaLag { max_lag } => {
                let Some(text) = info_text(pool, Some("replication")).await else {
                    return false;
                };
                replica_lag_ok(&text, *max_lag)
            },
        }
    }
}

async fn info_text(pool: &Pool, section: Option<&str>) -> Option<String> {
    let mut conn = pool.checkout().await.ok()?;
    let reply = conn.call(&Command::info(section)).await.ok()?;
    match reply {
        Value::Bulk(b) => Some(String::from_utf8_lossy(&b).into_owned()),
        Value::Verbatim { payload, .. } => {
            Some(String::from_utf8_lossy(&payload).into_owned())
        },
        _ => None,
    }
}

/// `role:master` always passes; `role:slave` passes while the last
/// master contact is recent enough.
fn replica_lag_ok(info: &str, max_lag: Duration) -> bool {
    let mut role_master = false;
    let mut last_io: Option<u64> = None;
    for line in info.lines() {
        if let Some(role) = line.strip_prefix("role:") {
            role_master = role.trim() == "master";
        } else if let Some(secs) = line.strip_prefix("master_last_io_seconds_ago:") {
            last_io = secs.trim().parse().ok();
        }
    }
    if role_master {
        return true;
    }
    match last_io {
        Some(secs) => Duration::from_secs(secs) <= max_lag,
        None => false,
    }
}

fn aggregate(policy: AggregationPolicy, results: &[bool]) -> bool {
    let passing = results.iter().filter(|&&ok| ok).count();
    match policy {
        AggregationPolicy::All => passing == results.len(),
        AggregationPolicy::Any => passing > 0,
        AggregationPolicy::Majority => passing * 2 > results.len(),
    }
}

/// Background task evaluating every probe on an interval and folding
/// the verdicts into one Healthy/Unhealthy signal.
#[derive(Debug)]
pub struct HealthMonitor {
    pool: Pool,
    probes: Vec<HealthProbe>,
    policy: AggregationPolicy,
    interval: Duration,
    events: EventBus,
}

impl HealthMonitor {
    pub fn new(
        pool: Pool,
        probes: Vec<HealthProbe>,
        policy: AggregationPolicy,
        interval: Duration,
        events: EventBus,
    ) -> Self {
        Self {
            pool,
            probes,
            policy,
            interval,
            events,
        }
    }

    /// Starts the evaluation loop. The handle exposes the latest
    /// consolidated signal and stops the loop on shutdown.
    pub fn spawn(self) -> HealthHandle {
        let healthy = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();
        let flag = Arc::clone(&healthy);
        let token = cancel.clone();
        let http = reqwest::Client::new();

        let task = tokio::spawn(async move {
            let mut results = Vec::with_capacity(self.probes.len());
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = sleep(self.interval) => {},
                }

                results.clear();
                for probe in &self.probes {
                    results.push(probe.check(&self.pool, &http).await);
                }
                let verdict = aggregate(self.policy, &results);
                let previous = flag.swap(verdict, Ordering::AcqRel);
                if previous != verdict {
                    if !verdict {
                        warn!("health verdict changed to unhealthy: {results:?}");
                    }
                    self.events.emit(Event::HealthChanged { healthy: verdict });
                }
            }
        });

        HealthHandle {
            healthy,
            cancel,
            task,
        }
    }
}

#[derive(Debug)]
pub struct HealthHandle {
    healthy: Arc<AtomicBool>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl HealthHandle {
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}
