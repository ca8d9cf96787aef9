// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    net::SocketAddr,
    sync::atomic::{AtomicUsize, Ordering},
};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use rand::seq::{IndexedRandom, SliceRandom};
use tokio::net::lookup_host;

use crate::{cfg::enums::DnsStrategy, models::error::ClientError};

/// Rotation cursors survive individual lookups so round-robin spreads
/// connects across a host's addresses process-wide.
static CURSORS: Lazy<DashMap<String, AtomicUsize>> = Lazy::new(DashMap::new);

/// Resolves `host` and returns its addresses in dialing order: the
/// caller tries them front to back and thereby "advances on connect
/// failure" for free.
pub async fn resolve(
    host: &str,
    port: u16,
    strategy: DnsStrategy,
) -> Result<Vec<SocketAddr>, ClientError> {
    let mut addrs: Vec<SocketAddr> =
        lookup_host((host, port))
            .await
            .map_err(|e| ClientError::Connect {
                addr: format!("{host}:{port}"),
                reason: format!("dns: {e}"),
            })?
            .collect();
    if addrs.is_empty() {
        return Err(ClientError::Connect {
            addr: format!("{host}:{port}"),
            reason: "dns returned no addresses".into(),
        });
    }

    match strategy {
        DnsStrategy::RoundRobin => {
            let cursor = CURSORS
                .entry(host.to_string())
                .or_insert_with(|| AtomicUsize::new(0))
                .fetch_add(1, Ordering::Relaxed);
            let len = addrs.len();
            addrs.rotate_left(cursor % len);
        },
        DnsStrategy::Random => {
            addrs.shuffle(&mut rand::rng());
        },
    }
    Ok(addrs)
}

/// A cached multi-address view of one host, for callers that want an
/// explicit refresh instead of per-connect resolution.
#[derive(Debug)]
pub struct DnsResolver {
    host: String,
    port: u16,
    strategy: DnsStrategy,
    addrs: Vec<SocketAddr>,
    cursor: usize,
}

impl DnsResolver {
    pub async fn new(
        host: impl Into<String>,
        port: u16,
        strategy: DnsStrategy,
    ) -> Result<Self, ClientError> {
        let host = host.into();
        let addrs = resolve(&host, port, strategy).await?;
        Ok(Self {
            host,
            port,
            strategy,
            addrs,
            cursor: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    /// Next address under the configured strategy. `None` once the
    /// answer set is exhausted; call [`DnsResolver::refresh_dns`].
    pub fn next_addr(&mut self) -> Option<SocketAddr> {
        match self.strategy {
            DnsStrategy::RoundRobin => {
                if self.cursor >= self.addrs.len() {
                    return None;
                }
                let addr = self.addrs[self.cursor];
                self.cursor += 1;
                Some(addr)
            },
            DnsStrategy::Random => {
                if self.cursor >= self.addrs.len() {
                    return None;
                }
                self.cursor += 1;
                self.addrs.choose(&mut rand::rng()).copied()
            },
        }
    }

    /// Re-resolves the host and rewinds the cursor.
    pub async fn refresh_dns(&mut self) -> Result<(), ClientError> {
        self.addrs = resolve(&self.host, self.port, self.strategy).await?;
        self.cursor = 0;
        Ok(())
    }
}
